//! External extractors feeding the link pipeline: GeoPackage OSM buildings
//! and per-building GML centroids.

use std::path::PathBuf;

use async_trait::async_trait;
use gmlink_core::GmlCentroid;
use gmlink_storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod citygml;
pub mod gpkg;
pub mod scene;

pub use citygml::{FileBasedSource, CITYGML_EXTENSIONS};
pub use gpkg::{GpkgLayer, GpkgOsmExtractor, OsmExtractStats};
pub use scene::{FallbackSource, SceneSnapshot};

pub const CRATE_NAME: &str = "gmlink-adapters";

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("geopackage not found: {}", .0.display())]
    MissingGeoPackage(PathBuf),
    #[error("no OSM building layer with an `osm_way_id` column in {}", .0.display())]
    NoBuildingLayer(PathBuf),
    #[error("layer `{layer}` is not a feature layer of {}", .gpkg.display())]
    UnknownLayer { gpkg: PathBuf, layer: String },
    #[error("spatial index table `{0}` not found")]
    MissingSpatialIndex(String),
    #[error("CityGML directory not found: {}", .0.display())]
    MissingDirectory(PathBuf),
    #[error("no CityGML tiles (.gml, .xml, .citygml) found in {}", .0.display())]
    NoTiles(PathBuf),
    #[error("tiles {} and {} both normalize to `{key}`", .first.display(), .second.display())]
    DuplicateTile {
        key: String,
        first: PathBuf,
        second: PathBuf,
    },
    #[error("no buildings with coordinates found in {}", .0.display())]
    NoBuildings(PathBuf),
    #[error("failed to parse {}: {message}", .path.display())]
    Xml { path: PathBuf, message: String },
    #[error("failed to read scene snapshot {}: {source}", .path.display())]
    Snapshot {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("GML centroid source unavailable: {0}")]
    Unavailable(String),
    #[error("{what} timed out after {secs}s")]
    Timeout { what: String, secs: u64 },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("extractor task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sqlx::Error> for ExtractError {
    fn from(err: sqlx::Error) -> Self {
        ExtractError::Store(StoreError::Sqlx(err))
    }
}

impl ExtractError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Which implementation produced a centroid table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    CityGml,
    SceneFallback,
}

impl SourceKind {
    pub fn is_degraded(self) -> bool {
        matches!(self, SourceKind::SceneFallback)
    }
}

/// Producer of per-building GML centroids in world coordinates.
#[async_trait]
pub trait CentroidSource: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Human-readable origin of the centroids, for logs and reports.
    fn describe(&self) -> String;

    async fn load_centroids(&self) -> Result<Vec<GmlCentroid>, ExtractError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_scene_snapshot_is_degraded() {
        assert!(!SourceKind::CityGml.is_degraded());
        assert!(SourceKind::SceneFallback.is_degraded());
        assert_eq!(
            serde_json::to_string(&SourceKind::SceneFallback).unwrap(),
            "\"scene_fallback\""
        );
    }

    #[test]
    fn extraction_errors_name_the_missing_capability() {
        let err = ExtractError::Unavailable("no CityGML directory configured".into());
        assert_eq!(
            err.to_string(),
            "GML centroid source unavailable: no CityGML directory configured"
        );
    }
}
