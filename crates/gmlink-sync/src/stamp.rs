//! `<artifact>.stamp.json` sidecars recording the parameters an artifact was
//! built with.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gmlink_adapters::SourceKind;
use gmlink_core::{MatchParams, WorldOrigin};
use gmlink_storage::{sha256_hex, write_file_atomic, StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::graph::ArtifactId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildStamp {
    pub artifact: ArtifactId,
    pub fingerprint: String,
    pub built_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OsmParams<'a> {
    pub gpkg: &'a Path,
    pub layer: Option<&'a str>,
    pub semantic_columns: &'a [String],
    pub origin: WorldOrigin,
}

#[derive(Debug, Clone, Serialize)]
pub struct GmlParams<'a> {
    pub source: SourceKind,
    pub input: &'a Path,
    pub include_building_parts: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkParams {
    pub matching: MatchParams,
    pub origin: WorldOrigin,
}

pub fn stamp_path(artifact: &Path) -> PathBuf {
    let mut os = artifact.as_os_str().to_os_string();
    os.push(".stamp.json");
    PathBuf::from(os)
}

/// sha256 over the canonical JSON encoding of `params`.
pub fn fingerprint<T: Serialize>(params: &T) -> String {
    // Plain structs of numbers, strings and paths always encode.
    let bytes = serde_json::to_vec(params).unwrap_or_default();
    sha256_hex(&bytes)
}

pub fn read_stamp(artifact: &Path) -> Option<BuildStamp> {
    let path = stamp_path(artifact);
    let bytes = std::fs::read(&path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(stamp) => Some(stamp),
        Err(err) => {
            debug!(stamp = %path.display(), %err, "ignoring unreadable stamp");
            None
        }
    }
}

pub fn read_fingerprint(artifact: &Path) -> Option<String> {
    read_stamp(artifact).map(|s| s.fingerprint)
}

pub async fn write_stamp(artifact: &Path, id: ArtifactId, fingerprint: &str) -> StoreResult<()> {
    let stamp = BuildStamp {
        artifact: id,
        fingerprint: fingerprint.to_string(),
        built_at: Utc::now(),
    };
    let bytes = serde_json::to_vec_pretty(&stamp).map_err(|e| {
        StoreError::io(
            format!("encoding stamp for {}", artifact.display()),
            std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        )
    })?;
    write_file_atomic(&stamp_path(artifact), &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprints_track_every_link_parameter() {
        let base = LinkParams {
            matching: MatchParams::default(),
            origin: WorldOrigin::new(356_000.0, 5_645_000.0),
        };
        let same = fingerprint(&base.clone());
        assert_eq!(fingerprint(&base), same);
        assert_eq!(same.len(), 64);

        let mut radius = base.clone();
        radius.matching.search_radius_m = 30.0;
        let mut origin = base.clone();
        origin.origin.min_e = 0.0;
        assert_ne!(fingerprint(&radius), same);
        assert_ne!(fingerprint(&origin), same);
    }

    #[tokio::test]
    async fn stamp_round_trips_next_to_the_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = dir.path().join("city_links.sqlite");
        assert_eq!(read_fingerprint(&artifact), None);

        write_stamp(&artifact, ArtifactId::LinkDb, "f00d").await.unwrap();
        assert!(dir.path().join("city_links.sqlite.stamp.json").is_file());
        let stamp = read_stamp(&artifact).unwrap();
        assert_eq!(stamp.artifact, ArtifactId::LinkDb);
        assert_eq!(stamp.fingerprint, "f00d");

        std::fs::write(stamp_path(&artifact), b"{not json").unwrap();
        assert_eq!(read_fingerprint(&artifact), None);
    }
}
