//! Greedy per-building nearest-neighbor matching of GML centroids to OSM
//! candidates under a bounded search radius.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::GridIndex;
use crate::{bbox_iou, GmlCentroid, LinkRow, OsmCandidate};

/// Distances closer than this are treated as equal for tie-breaking.
pub const DIST_TOLERANCE_M: f64 = 1e-9;

/// Upper bound on `search_radius_m / grid_cell_m`, the number of grid rings a
/// single query walks.
pub const MAX_GRID_RINGS: f64 = 64.0;

/// How equidistant candidates are resolved.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Smallest `osm_way_id` wins; independent of candidate order.
    #[default]
    SmallestOsmId,
    /// The first candidate visited wins (ring order, then input order).
    FirstEncountered,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchParams {
    pub search_radius_m: f64,
    pub grid_cell_m: f64,
    /// Matches whose confidence falls below this are reported as unmatched.
    pub min_confidence: f64,
    pub tie_break: TieBreak,
}

impl Default for MatchParams {
    fn default() -> Self {
        Self {
            search_radius_m: 25.0,
            grid_cell_m: 25.0,
            min_confidence: 0.0,
            tie_break: TieBreak::SmallestOsmId,
        }
    }
}

impl MatchParams {
    pub fn with_radius(search_radius_m: f64) -> Self {
        Self {
            search_radius_m,
            grid_cell_m: search_radius_m,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), MatchError> {
        if !self.search_radius_m.is_finite() || self.search_radius_m <= 0.0 {
            return Err(MatchError::InvalidRadius(self.search_radius_m));
        }
        if !self.grid_cell_m.is_finite() || self.grid_cell_m <= 0.0 {
            return Err(MatchError::InvalidCell(self.grid_cell_m));
        }
        if self.search_radius_m / self.grid_cell_m > MAX_GRID_RINGS {
            return Err(MatchError::CellTooSmall {
                radius: self.search_radius_m,
                cell: self.grid_cell_m,
            });
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(MatchError::InvalidMinConfidence(self.min_confidence));
        }
        Ok(())
    }

    /// Linear decay from 1.0 at the centroid to 0.0 at the radius.
    pub fn confidence(&self, dist_m: f64) -> f64 {
        (1.0 - dist_m / self.search_radius_m).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum MatchError {
    #[error("search radius must be a positive finite number of meters, got {0}")]
    InvalidRadius(f64),
    #[error("grid cell size must be a positive finite number of meters, got {0}")]
    InvalidCell(f64),
    #[error("minimum confidence must lie in [0, 1], got {0}")]
    InvalidMinConfidence(f64),
    #[error("grid cell of {cell} m is too small for a {radius} m search radius (at most 64 cells per radius)")]
    CellTooSmall { radius: f64, cell: f64 },
}

struct Best<'a> {
    candidate: &'a OsmCandidate,
    dist: f64,
}

impl TieBreak {
    /// Whether `challenger` at `dist` should replace the current best.
    fn prefers(self, challenger: &OsmCandidate, dist: f64, best: &Best<'_>) -> bool {
        if dist < best.dist - DIST_TOLERANCE_M {
            return true;
        }
        if dist > best.dist + DIST_TOLERANCE_M {
            return false;
        }
        match self {
            TieBreak::FirstEncountered => false,
            TieBreak::SmallestOsmId => {
                let current = best.candidate;
                challenger
                    .osm_way_id
                    .cmp(&current.osm_way_id)
                    .then_with(|| total_cmp_xy(challenger, current))
                    == Ordering::Less
            }
        }
    }
}

fn total_cmp_xy(a: &OsmCandidate, b: &OsmCandidate) -> Ordering {
    a.cx.total_cmp(&b.cx).then_with(|| a.cy.total_cmp(&b.cy))
}

/// Match one tile's GML centroids against a pre-filtered candidate set.
///
/// Produces exactly one [`LinkRow`] per centroid, ordered by ascending
/// `building_idx`. Pure: inputs are not mutated and nothing is read or
/// written outside the arguments.
pub fn match_tile(
    gml_centroids: &[GmlCentroid],
    candidates: &[OsmCandidate],
    params: &MatchParams,
) -> Result<Vec<LinkRow>, MatchError> {
    params.validate()?;

    let index = GridIndex::build(candidates, params.grid_cell_m);
    let radius = params.search_radius_m;

    let mut ordered: Vec<&GmlCentroid> = gml_centroids.iter().collect();
    ordered.sort_by_key(|g| g.building_idx);

    let mut rows = Vec::with_capacity(ordered.len());
    for g in ordered {
        let mut best: Option<Best<'_>> = None;
        for candidate in index.neighbors(g.cx, g.cy, radius) {
            let dist = (candidate.cx - g.cx).hypot(candidate.cy - g.cy);
            if !(dist <= radius) {
                continue;
            }
            let replace = match &best {
                None => true,
                Some(current) => params.tie_break.prefers(candidate, dist, current),
            };
            if replace {
                best = Some(Best { candidate, dist });
            }
        }

        let row = match best {
            None => LinkRow::unmatched(g),
            Some(Best { candidate, dist }) => {
                let confidence = params.confidence(dist);
                if confidence < params.min_confidence {
                    LinkRow::unmatched(g)
                } else {
                    LinkRow {
                        source_tile: g.source_tile.clone(),
                        building_idx: g.building_idx,
                        osm_way_id: Some(candidate.osm_way_id),
                        dist_m: dist,
                        confidence,
                        iou: bbox_iou(g.bbox.as_ref(), candidate.bbox.as_ref()),
                        cx_gml: g.cx,
                        cy_gml: g.cy,
                        cx_osm: Some(candidate.cx),
                        cy_osm: Some(candidate.cy),
                    }
                }
            }
        };
        rows.push(row);
    }
    Ok(rows)
}
