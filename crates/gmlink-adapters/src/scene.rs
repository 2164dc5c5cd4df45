//! Degraded centroid source: a JSON snapshot of building geometry that was
//! already loaded elsewhere, in mesh-local coordinates.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gmlink_core::{normalize_source_tile, BBox, GmlCentroid, WorldOrigin};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{CentroidSource, ExtractError, SourceKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSnapshot {
    pub meshes: Vec<SceneMesh>,
}

/// One imported tile mesh. `origin` is the mesh's local → CRS offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneMesh {
    pub tile: String,
    #[serde(default)]
    pub origin: WorldOrigin,
    pub buildings: Vec<SceneBuilding>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneBuilding {
    pub building_idx: i64,
    #[serde(default)]
    pub gml_id: Option<String>,
    pub centroid: [f64; 2],
    /// `[minx, miny, maxx, maxy]` in mesh-local coordinates.
    #[serde(default)]
    pub bbox: Option<[f64; 4]>,
}

impl SceneSnapshot {
    pub fn from_json(bytes: &[u8], path: &Path) -> Result<Self, ExtractError> {
        serde_json::from_slice(bytes).map_err(|source| ExtractError::Snapshot {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Convert every building to CRS coordinates. The first occurrence of a
    /// `(tile, building_idx)` key wins.
    pub fn centroids(&self) -> Vec<GmlCentroid> {
        let mut by_key: BTreeMap<(String, i64), GmlCentroid> = BTreeMap::new();
        for mesh in &self.meshes {
            let tile = normalize_source_tile(Some(&mesh.tile));
            for b in &mesh.buildings {
                let [lx, ly] = b.centroid;
                if !lx.is_finite() || !ly.is_finite() {
                    continue;
                }
                let key = (tile.clone(), b.building_idx);
                if by_key.contains_key(&key) {
                    warn!(tile = %tile, building_idx = b.building_idx, "duplicate scene building ignored");
                    continue;
                }
                let (cx, cy) = mesh.origin.to_world(lx, ly);
                let bbox = b.bbox.map(|[minx, miny, maxx, maxy]| {
                    let (minx, miny) = mesh.origin.to_world(minx, miny);
                    let (maxx, maxy) = mesh.origin.to_world(maxx, maxy);
                    BBox::new(minx, miny, maxx, maxy)
                });
                by_key.insert(
                    key,
                    GmlCentroid {
                        source_tile: tile.clone(),
                        building_idx: b.building_idx,
                        gml_id: b.gml_id.clone(),
                        cx,
                        cy,
                        bbox,
                    },
                );
            }
        }
        by_key.into_values().collect()
    }
}

#[derive(Debug, Clone)]
pub struct FallbackSource {
    snapshot: PathBuf,
}

impl FallbackSource {
    pub fn new(snapshot: impl Into<PathBuf>) -> Self {
        Self {
            snapshot: snapshot.into(),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot
    }
}

#[async_trait]
impl CentroidSource for FallbackSource {
    fn kind(&self) -> SourceKind {
        SourceKind::SceneFallback
    }

    fn describe(&self) -> String {
        format!("scene snapshot {}", self.snapshot.display())
    }

    async fn load_centroids(&self) -> Result<Vec<GmlCentroid>, ExtractError> {
        warn!(
            snapshot = %self.snapshot.display(),
            "building GML centroids from scene snapshot; results are degraded"
        );
        let bytes = tokio::fs::read(&self.snapshot)
            .await
            .map_err(|e| ExtractError::io(format!("reading {}", self.snapshot.display()), e))?;
        let centroids = SceneSnapshot::from_json(&bytes, &self.snapshot)?.centroids();
        if centroids.is_empty() {
            return Err(ExtractError::NoBuildings(self.snapshot.clone()));
        }
        Ok(centroids)
    }
}
