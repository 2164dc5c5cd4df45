//! Streaming CityGML reader producing one centroid per building.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use gmlink_core::{normalize_source_tile, BBox, GmlCentroid};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::{CentroidSource, ExtractError, SourceKind};

pub const CITYGML_EXTENSIONS: [&str; 3] = ["gml", "xml", "citygml"];

pub fn is_citygml_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            CITYGML_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
        .unwrap_or(false)
}

/// Tile files directly inside `dir`, sorted by path.
pub fn list_tiles(dir: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    if !dir.is_dir() {
        return Err(ExtractError::MissingDirectory(dir.to_path_buf()));
    }
    let mut tiles = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry
            .map_err(|e| ExtractError::io(format!("listing {}", dir.display()), e.into()))?;
        if entry.file_type().is_file() && is_citygml_file(entry.path()) {
            tiles.push(entry.into_path());
        }
    }
    if tiles.is_empty() {
        return Err(ExtractError::NoTiles(dir.to_path_buf()));
    }
    Ok(tiles)
}

/// Reads every tile in a CityGML folder.
#[derive(Debug, Clone)]
pub struct FileBasedSource {
    dir: PathBuf,
    include_building_parts: bool,
}

impl FileBasedSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            include_building_parts: false,
        }
    }

    pub fn with_building_parts(mut self, include: bool) -> Self {
        self.include_building_parts = include;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl CentroidSource for FileBasedSource {
    fn kind(&self) -> SourceKind {
        SourceKind::CityGml
    }

    fn describe(&self) -> String {
        format!("CityGML tiles in {}", self.dir.display())
    }

    async fn load_centroids(&self) -> Result<Vec<GmlCentroid>, ExtractError> {
        let dir = self.dir.clone();
        let include_parts = self.include_building_parts;
        tokio::task::spawn_blocking(move || extract_dir(&dir, include_parts)).await?
    }
}

/// Blocking extraction of a whole folder.
pub fn extract_dir(dir: &Path, include_parts: bool) -> Result<Vec<GmlCentroid>, ExtractError> {
    let tiles = list_tiles(dir)?;
    let mut seen: HashMap<String, PathBuf> = HashMap::new();
    let mut centroids = Vec::new();
    for path in &tiles {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let key = normalize_source_tile(Some(&file_name));
        if let Some(first) = seen.insert(key.clone(), path.clone()) {
            return Err(ExtractError::DuplicateTile {
                key,
                first,
                second: path.clone(),
            });
        }

        let file = File::open(path)
            .map_err(|e| ExtractError::io(format!("opening {}", path.display()), e))?;
        let buildings = parse_tile(BufReader::new(file), &key, include_parts, path)?;
        info!(tile = %key, buildings = buildings.len(), "extracted CityGML tile");
        centroids.extend(buildings);
    }
    if centroids.is_empty() {
        return Err(ExtractError::NoBuildings(dir.to_path_buf()));
    }
    debug!(tiles = tiles.len(), buildings = centroids.len(), "CityGML folder done");
    Ok(centroids)
}

struct UnitFrame {
    depth: usize,
    gml_id: Option<String>,
    bbox: Option<BBox>,
}

fn is_unit(local_name: &[u8], include_parts: bool) -> bool {
    local_name == b"Building" || (include_parts && local_name == b"BuildingPart")
}

fn is_coordinate_list(local_name: &[u8]) -> bool {
    local_name == b"pos" || local_name == b"posList"
}

fn id_attribute(start: &BytesStart<'_>) -> Option<String> {
    start
        .attributes()
        .flatten()
        .find(|attr| attr.key.local_name().as_ref() == b"id")
        .map(|attr| String::from_utf8_lossy(&attr.value).into_owned())
}

/// XY pairs from a `pos`/`posList` body. Counts divisible by three are read
/// as XYZ triples, anything else as XY pairs.
pub fn coordinate_pairs(text: &str) -> Vec<(f64, f64)> {
    let nums = text
        .split(|c: char| c.is_whitespace() || c == ',')
        .filter(|tok| !tok.is_empty())
        .filter_map(|tok| tok.parse::<f64>().ok())
        .collect::<Vec<_>>();
    if nums.len() < 2 {
        return Vec::new();
    }
    let step = if nums.len() % 3 == 0 { 3 } else { 2 };
    nums.chunks(step)
        .filter(|chunk| chunk.len() >= 2)
        .map(|chunk| (chunk[0], chunk[1]))
        .filter(|(x, y)| x.is_finite() && y.is_finite())
        .collect()
}

/// Parse one tile. Units are numbered from 0 in the order they close;
/// units without any coordinate are skipped and do not take an index.
///
/// Coordinates count towards the innermost open unit only, so with
/// `include_parts` a `BuildingPart` claims its own geometry.
pub fn parse_tile<R: BufRead>(
    input: R,
    tile: &str,
    include_parts: bool,
    path: &Path,
) -> Result<Vec<GmlCentroid>, ExtractError> {
    let mut reader = Reader::from_reader(input);
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut units: Vec<UnitFrame> = Vec::new();
    let mut coord_depth: Option<usize> = None;
    let mut text = String::new();
    let mut out = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(start)) => {
                depth += 1;
                let name = start.local_name();
                if is_unit(name.as_ref(), include_parts) {
                    units.push(UnitFrame {
                        depth,
                        gml_id: id_attribute(&start),
                        bbox: None,
                    });
                } else if coord_depth.is_none() && is_coordinate_list(name.as_ref()) {
                    coord_depth = Some(depth);
                    text.clear();
                }
            }
            Ok(Event::Text(body)) if coord_depth.is_some() => {
                text.push_str(&String::from_utf8_lossy(&body));
            }
            Ok(Event::CData(body)) if coord_depth.is_some() => {
                text.push_str(&String::from_utf8_lossy(&body));
            }
            Ok(Event::End(_)) => {
                if coord_depth == Some(depth) {
                    coord_depth = None;
                    if let Some(frame) = units.last_mut() {
                        for (x, y) in coordinate_pairs(&text) {
                            match frame.bbox.as_mut() {
                                Some(bbox) => bbox.extend(x, y),
                                None => frame.bbox = Some(BBox::from_point(x, y)),
                            }
                        }
                    }
                    text.clear();
                } else if units.last().map(|f| f.depth) == Some(depth) {
                    if let Some(UnitFrame {
                        gml_id,
                        bbox: Some(bbox),
                        ..
                    }) = units.pop()
                    {
                        let (cx, cy) = bbox.center();
                        out.push(GmlCentroid {
                            source_tile: tile.to_string(),
                            building_idx: out.len() as i64,
                            gml_id,
                            cx,
                            cy,
                            bbox: Some(bbox),
                        });
                    }
                }
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(err) => {
                return Err(ExtractError::Xml {
                    path: path.to_path_buf(),
                    message: format!("at byte {}: {err}", reader.error_position()),
                })
            }
        }
        buf.clear();
    }
    Ok(out)
}
