//! Core domain model for linking CityGML buildings to OSM buildings.
//!
//! Everything in this crate is pure: no file or database I/O. The storage
//! and sync crates move these records in and out of SQLite.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod grid;
pub mod matcher;

pub use grid::{GridIndex, Located};
pub use matcher::{match_tile, MatchError, MatchParams, TieBreak, MAX_GRID_RINGS};

pub const CRATE_NAME: &str = "gmlink-core";

/// Normalized tile identity, see [`normalize_source_tile`].
pub type TileKey = String;

/// Return the stable tile key for any representation of a tile name.
///
/// Accepts full paths (either separator), bare file names, names carrying
/// one or more extensions and duplicate-object suffixes such as `.001`.
/// Never fails; `None` and blank input map to the empty string.
///
/// The result is a fixed point: `normalize_source_tile(Some(&k)) == k` for
/// every key `k` this function returns.
pub fn normalize_source_tile(raw: Option<&str>) -> TileKey {
    let Some(raw) = raw else {
        return String::new();
    };
    let replaced = raw.trim().replace('\\', "/");
    let mut key = replaced.rsplit('/').next().unwrap_or_default();

    loop {
        let trimmed = key.trim();
        let stripped = strip_duplicate_suffix(trimmed)
            .or_else(|| strip_file_extension(trimmed))
            .unwrap_or(trimmed);
        if stripped == key {
            break;
        }
        key = stripped;
    }
    key.to_string()
}

/// `.NNN` with exactly three digits.
fn strip_duplicate_suffix(s: &str) -> Option<&str> {
    let (head, tail) = s.rsplit_once('.')?;
    if head.is_empty() || tail.len() != 3 || !tail.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(head)
}

/// A trailing `.ext` made of ASCII alphanumerics with at least one letter.
/// Dot-files (`.gml`) keep their name.
fn strip_file_extension(s: &str) -> Option<&str> {
    let (head, tail) = s.rsplit_once('.')?;
    if head.is_empty() || tail.is_empty() || tail.len() > 16 {
        return None;
    }
    let alnum = tail.bytes().all(|b| b.is_ascii_alphanumeric());
    let has_letter = tail.bytes().any(|b| b.is_ascii_alphabetic());
    (alnum && has_letter).then_some(head)
}

/// Axis-aligned planar bounding box in meters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub minx: f64,
    pub miny: f64,
    pub maxx: f64,
    pub maxy: f64,
}

impl BBox {
    pub fn new(minx: f64, miny: f64, maxx: f64, maxy: f64) -> Self {
        Self {
            minx,
            miny,
            maxx,
            maxy,
        }
    }

    pub fn from_point(x: f64, y: f64) -> Self {
        Self::new(x, y, x, y)
    }

    pub fn extend(&mut self, x: f64, y: f64) {
        self.minx = self.minx.min(x);
        self.miny = self.miny.min(y);
        self.maxx = self.maxx.max(x);
        self.maxy = self.maxy.max(y);
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.minx + self.maxx) / 2.0, (self.miny + self.maxy) / 2.0)
    }

    pub fn expanded(&self, margin: f64) -> Self {
        Self::new(
            self.minx - margin,
            self.miny - margin,
            self.maxx + margin,
            self.maxy + margin,
        )
    }

    pub fn area(&self) -> f64 {
        (self.maxx - self.minx).max(0.0) * (self.maxy - self.miny).max(0.0)
    }

    pub fn intersection_area(&self, other: &BBox) -> f64 {
        let w = self.maxx.min(other.maxx) - self.minx.max(other.minx);
        let h = self.maxy.min(other.maxy) - self.miny.max(other.miny);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    /// Intersection over union; 0.0 for disjoint or degenerate boxes.
    pub fn iou(&self, other: &BBox) -> f64 {
        let inter = self.intersection_area(other);
        let union = self.area() + other.area() - inter;
        if inter <= 0.0 || union <= 0.0 || !union.is_finite() {
            return 0.0;
        }
        (inter / union).clamp(0.0, 1.0)
    }

    /// Bounding box of a point set, `None` when empty.
    pub fn enclosing<I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = (f64, f64)>,
    {
        let mut iter = points.into_iter();
        let (x, y) = iter.next()?;
        let mut bbox = BBox::from_point(x, y);
        for (x, y) in iter {
            bbox.extend(x, y);
        }
        Some(bbox)
    }
}

/// IoU of two optional boxes; a missing box on either side yields 0.0.
pub fn bbox_iou(a: Option<&BBox>, b: Option<&BBox>) -> f64 {
    match (a, b) {
        (Some(a), Some(b)) => a.iou(b),
        _ => 0.0,
    }
}

/// Fixed world offset shared by every local geometry layer.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldOrigin {
    pub min_e: f64,
    pub min_n: f64,
}

impl WorldOrigin {
    pub fn new(min_e: f64, min_n: f64) -> Self {
        Self { min_e, min_n }
    }

    pub fn is_zero(&self) -> bool {
        self.min_e == 0.0 && self.min_n == 0.0
    }

    pub fn to_local(&self, x: f64, y: f64) -> (f64, f64) {
        (x - self.min_e, y - self.min_n)
    }

    pub fn to_world(&self, x: f64, y: f64) -> (f64, f64) {
        (x + self.min_e, y + self.min_n)
    }
}

/// World → local coordinate shift. Implementors return a new value and
/// never touch `self`, so a shift is applied exactly once per copy.
pub trait Shift: Sized {
    fn shifted(&self, origin: &WorldOrigin) -> Self;
}

impl Shift for BBox {
    fn shifted(&self, origin: &WorldOrigin) -> Self {
        let (minx, miny) = origin.to_local(self.minx, self.miny);
        let (maxx, maxy) = origin.to_local(self.maxx, self.maxy);
        BBox::new(minx, miny, maxx, maxy)
    }
}

/// Scalar value carried in an OSM semantic column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SemanticValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

impl SemanticValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SemanticValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Per-building centroid produced by a GML centroid source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GmlCentroid {
    pub source_tile: TileKey,
    pub building_idx: i64,
    pub gml_id: Option<String>,
    pub cx: f64,
    pub cy: f64,
    pub bbox: Option<BBox>,
}

impl GmlCentroid {
    /// Composite identity `(source_tile, building_idx)`.
    pub fn key(&self) -> (&str, i64) {
        (&self.source_tile, self.building_idx)
    }
}

impl Shift for GmlCentroid {
    fn shifted(&self, origin: &WorldOrigin) -> Self {
        let (cx, cy) = origin.to_local(self.cx, self.cy);
        Self {
            cx,
            cy,
            bbox: self.bbox.map(|b| b.shifted(origin)),
            ..self.clone()
        }
    }
}

/// OSM building candidate, usually loaded from the local (shifted) table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OsmCandidate {
    pub osm_way_id: i64,
    pub cx: f64,
    pub cy: f64,
    pub bbox: Option<BBox>,
    #[serde(default)]
    pub semantics: BTreeMap<String, SemanticValue>,
}

impl OsmCandidate {
    pub fn new(osm_way_id: i64, cx: f64, cy: f64) -> Self {
        Self {
            osm_way_id,
            cx,
            cy,
            bbox: None,
            semantics: BTreeMap::new(),
        }
    }

    pub fn with_bbox(mut self, bbox: BBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

impl Shift for OsmCandidate {
    fn shifted(&self, origin: &WorldOrigin) -> Self {
        let (cx, cy) = origin.to_local(self.cx, self.cy);
        Self {
            cx,
            cy,
            bbox: self.bbox.map(|b| b.shifted(origin)),
            ..self.clone()
        }
    }
}

/// Shift a whole candidate table. The input is left untouched.
pub fn shift_candidates(candidates: &[OsmCandidate], origin: &WorldOrigin) -> Vec<OsmCandidate> {
    candidates.iter().map(|c| c.shifted(origin)).collect()
}

/// One link per GML building. `osm_way_id` is `None` when nothing matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRow {
    pub source_tile: TileKey,
    pub building_idx: i64,
    pub osm_way_id: Option<i64>,
    /// `f64::INFINITY` for unmatched rows.
    pub dist_m: f64,
    pub confidence: f64,
    pub iou: f64,
    pub cx_gml: f64,
    pub cy_gml: f64,
    pub cx_osm: Option<f64>,
    pub cy_osm: Option<f64>,
}

impl LinkRow {
    pub fn unmatched(g: &GmlCentroid) -> Self {
        Self {
            source_tile: g.source_tile.clone(),
            building_idx: g.building_idx,
            osm_way_id: None,
            dist_m: f64::INFINITY,
            confidence: 0.0,
            iou: 0.0,
            cx_gml: g.cx,
            cy_gml: g.cy,
            cx_osm: None,
            cy_osm: None,
        }
    }

    pub fn is_matched(&self) -> bool {
        self.osm_way_id.is_some()
    }
}

/// Aggregate match quality for a set of link rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkSummary {
    pub tiles: usize,
    pub gml_buildings: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub suspicious: usize,
}

impl LinkSummary {
    /// Fold one tile's rows in. `suspicious_dist_m` flags matched rows that
    /// are further away than expected.
    pub fn record_tile(&mut self, rows: &[LinkRow], suspicious_dist_m: f64) {
        self.tiles += 1;
        self.gml_buildings += rows.len();
        for row in rows {
            if row.is_matched() {
                self.matched += 1;
                if row.dist_m > suspicious_dist_m {
                    self.suspicious += 1;
                }
            } else {
                self.unmatched += 1;
            }
        }
    }

    pub fn match_rate(&self) -> f64 {
        if self.gml_buildings == 0 {
            0.0
        } else {
            self.matched as f64 / self.gml_buildings as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn norm(s: &str) -> String {
        normalize_source_tile(Some(s))
    }

    #[test]
    fn normalizes_paths_extensions_and_duplicate_suffixes() {
        assert_eq!(norm("tiles/LoD2_356_5645.gml"), "LoD2_356_5645");
        assert_eq!(norm(r"C:\data\tiles\LoD2_356_5645.xml"), "LoD2_356_5645");
        assert_eq!(norm("LoD2_356_5645.001"), "LoD2_356_5645");
        assert_eq!(norm("LoD2_356_5645.gml.002"), "LoD2_356_5645");
        assert_eq!(norm("  tile_07.citygml  "), "tile_07");
        assert_eq!(norm("tile_07"), "tile_07");
    }

    #[test]
    fn empty_and_missing_input_normalize_to_empty() {
        assert_eq!(normalize_source_tile(None), "");
        assert_eq!(norm(""), "");
        assert_eq!(norm("   "), "");
        assert_eq!(norm("some/dir/"), "");
    }

    #[test]
    fn numeric_name_parts_are_not_extensions() {
        assert_eq!(norm("32_356.5645.gml"), "32_356.5645");
        assert_eq!(norm("tile.0001"), "tile.0001");
        assert_eq!(norm(".gml"), ".gml");
    }

    #[test]
    fn normalization_is_idempotent() {
        let samples = [
            "a.b.c",
            "tile.001.gml",
            "x.tar.gz",
            "a.gml .gml",
            r"dir\sub/tile .xml.003",
            "32_356.5645.gml",
            ".hidden.001",
            "plain",
            "",
            "name.",
        ];
        for s in samples {
            let once = norm(s);
            assert_eq!(norm(&once), once, "not idempotent for {s:?}");
        }
    }

    #[test]
    fn iou_handles_overlap_disjoint_and_missing() {
        let a = BBox::new(0.0, 0.0, 2.0, 2.0);
        let b = BBox::new(1.0, 0.0, 3.0, 2.0);
        assert!((a.iou(&b) - 1.0 / 3.0).abs() < 1e-12);
        assert_eq!(a.iou(&BBox::new(5.0, 5.0, 6.0, 6.0)), 0.0);
        assert_eq!(a.iou(&BBox::from_point(1.0, 1.0)), 0.0);
        assert_eq!(bbox_iou(Some(&a), None), 0.0);
        assert_eq!(bbox_iou(Some(&a), Some(&a)), 1.0);
    }

    #[test]
    fn shift_moves_centroid_and_bbox_without_touching_input() {
        let origin = WorldOrigin::new(356_000.0, 5_645_000.0);
        let world = vec![
            OsmCandidate::new(1, 356_100.0, 5_645_200.0)
                .with_bbox(BBox::new(356_090.0, 5_645_190.0, 356_110.0, 5_645_210.0)),
            OsmCandidate::new(2, 356_000.0, 5_645_000.0),
        ];
        let local = shift_candidates(&world, &origin);
        assert_eq!((local[0].cx, local[0].cy), (100.0, 200.0));
        assert_eq!(local[0].bbox, Some(BBox::new(90.0, 190.0, 110.0, 210.0)));
        assert_eq!((local[1].cx, local[1].cy), (0.0, 0.0));
        assert_eq!(world[0].cx, 356_100.0);
        assert_eq!(origin.to_world(100.0, 200.0), (356_100.0, 5_645_200.0));
    }

    #[test]
    fn summary_counts_matched_unmatched_and_suspicious() {
        let g = GmlCentroid {
            source_tile: "t".into(),
            building_idx: 0,
            gml_id: None,
            cx: 0.0,
            cy: 0.0,
            bbox: None,
        };
        let mut far = LinkRow::unmatched(&g);
        far.osm_way_id = Some(1);
        far.dist_m = 12.0;
        let mut near = far.clone();
        near.dist_m = 1.0;
        let mut summary = LinkSummary::default();
        summary.record_tile(&[far, near, LinkRow::unmatched(&g)], 10.0);
        assert_eq!(summary.gml_buildings, 3);
        assert_eq!(summary.matched, 2);
        assert_eq!(summary.unmatched, 1);
        assert_eq!(summary.suspicious, 1);
        assert!((summary.match_rate() - 2.0 / 3.0).abs() < 1e-12);
    }
}
