use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use gmlink_core::{MatchParams, TieBreak, WorldOrigin};
use gmlink_storage::{LockOptions, ReadOptions};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::BuildError;

pub const DEFAULT_SEMANTIC_COLUMNS: [&str; 13] = [
    "name",
    "type",
    "building",
    "building_levels",
    "height",
    "amenity",
    "shop",
    "office",
    "landuse",
    "leisure",
    "historic",
    "tourism",
    "man_made",
];

/// Everything `ensure_link_dbs` needs to know.
///
/// Layering, lowest first: [`Default`], a YAML file, `GMLINK_*` environment
/// variables, then whatever the caller (usually the CLI) sets last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinkConfig {
    pub gpkg_path: Option<PathBuf>,
    pub gml_dir: Option<PathBuf>,
    pub out_dir: PathBuf,
    pub search_radius_m: f64,
    pub grid_cell_m: f64,
    pub min_confidence: f64,
    pub suspicious_dist_m: f64,
    pub tie_break: TieBreak,
    pub world_origin: WorldOrigin,
    pub osm_layer: Option<String>,
    pub semantic_columns: Vec<String>,
    pub include_building_parts: bool,
    pub allow_scene_fallback: bool,
    pub scene_snapshot: Option<PathBuf>,
    pub extract_timeout_secs: u64,
    pub busy_timeout_ms: u64,
    pub lock_wait_secs: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        let matching = MatchParams::default();
        Self {
            gpkg_path: None,
            gml_dir: None,
            out_dir: PathBuf::from("./gmlink_output"),
            search_radius_m: matching.search_radius_m,
            grid_cell_m: matching.grid_cell_m,
            min_confidence: matching.min_confidence,
            suspicious_dist_m: 10.0,
            tie_break: matching.tie_break,
            world_origin: WorldOrigin::default(),
            osm_layer: None,
            semantic_columns: DEFAULT_SEMANTIC_COLUMNS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            include_building_parts: false,
            allow_scene_fallback: false,
            scene_snapshot: None,
            extract_timeout_secs: 600,
            busy_timeout_ms: 5000,
            lock_wait_secs: 30,
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" | "yes" => Some(true),
        "0" | "false" | "FALSE" | "False" | "no" => Some(false),
        _ => None,
    }
}

fn parse_tie_break(value: &str) -> Option<TieBreak> {
    match value.trim() {
        "smallest_osm_id" => Some(TieBreak::SmallestOsmId),
        "first_encountered" => Some(TieBreak::FirstEncountered),
        _ => None,
    }
}

fn override_parsed<T, F>(lookup: &F, key: &str, slot: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!(key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}

fn override_with<T, F, P>(lookup: &F, key: &str, parse: P, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    P: Fn(&str) -> Option<T>,
{
    if let Some(raw) = lookup(key) {
        match parse(&raw) {
            Some(value) => *slot = value,
            None => warn!(key, value = %raw, "ignoring unparseable environment override"),
        }
    }
}

fn override_path<F>(lookup: &F, key: &str, slot: &mut Option<PathBuf>)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key).filter(|v| !v.trim().is_empty()) {
        *slot = Some(PathBuf::from(raw));
    }
}

impl LinkConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, BuildError> {
        serde_yaml::from_str(yaml).map_err(|e| BuildError::Config(format!("invalid config: {e}")))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, BuildError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BuildError::Config(format!("reading {}: {e}", path.display())))?;
        serde_yaml::from_str(&raw)
            .map_err(|e| BuildError::Config(format!("invalid config {}: {e}", path.display())))
    }

    /// Defaults, then the optional YAML file, then the process environment.
    pub fn load(yaml: Option<&Path>) -> Result<Self, BuildError> {
        let mut config = match yaml {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Apply `GMLINK_*` overrides from `lookup`. Unparseable values are
    /// logged and ignored.
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_path(&lookup, "GMLINK_GPKG_PATH", &mut self.gpkg_path);
        override_path(&lookup, "GMLINK_GML_DIR", &mut self.gml_dir);
        if let Some(out) = lookup("GMLINK_OUT_DIR").filter(|v| !v.trim().is_empty()) {
            self.out_dir = PathBuf::from(out);
        }
        override_parsed(&lookup, "GMLINK_SEARCH_RADIUS_M", &mut self.search_radius_m);
        override_parsed(&lookup, "GMLINK_GRID_CELL_M", &mut self.grid_cell_m);
        override_parsed(&lookup, "GMLINK_MIN_CONFIDENCE", &mut self.min_confidence);
        override_parsed(&lookup, "GMLINK_SUSPICIOUS_DIST_M", &mut self.suspicious_dist_m);
        override_with(&lookup, "GMLINK_TIE_BREAK", parse_tie_break, &mut self.tie_break);
        override_parsed(&lookup, "GMLINK_MIN_E", &mut self.world_origin.min_e);
        override_parsed(&lookup, "GMLINK_MIN_N", &mut self.world_origin.min_n);
        if let Some(layer) = lookup("GMLINK_OSM_LAYER").filter(|v| !v.trim().is_empty()) {
            self.osm_layer = Some(layer);
        }
        override_with(
            &lookup,
            "GMLINK_INCLUDE_BUILDING_PARTS",
            parse_flag,
            &mut self.include_building_parts,
        );
        override_with(
            &lookup,
            "GMLINK_ALLOW_SCENE_FALLBACK",
            parse_flag,
            &mut self.allow_scene_fallback,
        );
        override_path(&lookup, "GMLINK_SCENE_SNAPSHOT", &mut self.scene_snapshot);
        override_parsed(&lookup, "GMLINK_EXTRACT_TIMEOUT_SECS", &mut self.extract_timeout_secs);
        override_parsed(&lookup, "GMLINK_BUSY_TIMEOUT_MS", &mut self.busy_timeout_ms);
        override_parsed(&lookup, "GMLINK_LOCK_WAIT_SECS", &mut self.lock_wait_secs);
    }

    pub fn validate(&self) -> Result<(), BuildError> {
        if self.gpkg_path.is_none() {
            return Err(BuildError::Config("gpkg_path is required for linking".into()));
        }
        self.match_params()
            .validate()
            .map_err(|e| BuildError::Config(e.to_string()))?;
        if !self.suspicious_dist_m.is_finite() || self.suspicious_dist_m < 0.0 {
            return Err(BuildError::Config(format!(
                "suspicious_dist_m must be a non-negative number of meters, got {}",
                self.suspicious_dist_m
            )));
        }
        if !self.world_origin.min_e.is_finite() || !self.world_origin.min_n.is_finite() {
            return Err(BuildError::Config("world_origin must be finite".into()));
        }
        if self.extract_timeout_secs == 0 {
            return Err(BuildError::Config("extract_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn match_params(&self) -> MatchParams {
        MatchParams {
            search_radius_m: self.search_radius_m,
            grid_cell_m: self.grid_cell_m,
            min_confidence: self.min_confidence,
            tie_break: self.tie_break,
        }
    }

    pub fn read_options(&self) -> ReadOptions {
        ReadOptions::with_busy_timeout(Duration::from_millis(self.busy_timeout_ms))
    }

    pub fn lock_options(&self) -> LockOptions {
        LockOptions {
            wait: Duration::from_secs(self.lock_wait_secs),
            ..LockOptions::default()
        }
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::from_secs(self.extract_timeout_secs)
    }
}

/// Resolve a GeoPackage given as a file or as a directory holding one or
/// more `*.gpkg` files.
///
/// Directories prefer a `*_READONLY.gpkg` (case-insensitive), else the
/// single candidate, else the first in sorted order.
pub fn resolve_gpkg_path(raw: &Path) -> Result<PathBuf, BuildError> {
    let is_gpkg = |p: &Path| {
        p.extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("gpkg"))
            .unwrap_or(false)
    };

    if raw.is_file() {
        if is_gpkg(raw) {
            return Ok(raw.to_path_buf());
        }
        return Err(BuildError::Config(format!(
            "gpkg_path is not a .gpkg file: {}",
            raw.display()
        )));
    }
    if raw.is_dir() {
        let mut candidates = std::fs::read_dir(raw)
            .map_err(|e| BuildError::Config(format!("listing {}: {e}", raw.display())))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_gpkg(p))
            .collect::<Vec<_>>();
        candidates.sort();
        let readonly = candidates.iter().find(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().ends_with("_readonly.gpkg"))
                .unwrap_or(false)
        });
        return match (readonly, candidates.first()) {
            (Some(chosen), _) => Ok(chosen.clone()),
            (None, Some(first)) => {
                if candidates.len() > 1 {
                    warn!(dir = %raw.display(), candidates = candidates.len(), chosen = %first.display(), "several GeoPackages; picked the first");
                }
                Ok(first.clone())
            }
            (None, None) => Err(BuildError::Config(format!(
                "gpkg_path is a directory with no *.gpkg: {}",
                raw.display()
            ))),
        };
    }
    Err(BuildError::Config(format!(
        "gpkg file not found: {}",
        raw.display()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_documented_values() {
        let config = LinkConfig::default();
        assert_eq!(config.search_radius_m, 25.0);
        assert_eq!(config.grid_cell_m, 25.0);
        assert_eq!(config.suspicious_dist_m, 10.0);
        assert_eq!(config.tie_break, TieBreak::SmallestOsmId);
        assert_eq!(config.semantic_columns.len(), 13);
        assert!(!config.allow_scene_fallback);
        assert!(matches!(config.validate(), Err(BuildError::Config(_))));
    }

    #[test]
    fn environment_overrides_yaml_and_ignores_garbage() {
        let mut config = LinkConfig::from_yaml_str(
            "gpkg_path: /data/city.gpkg\nsearch_radius_m: 30\nworld_origin:\n  min_e: 356000\n  min_n: 5645000\n",
        )
        .unwrap();
        assert_eq!(config.search_radius_m, 30.0);
        assert_eq!(config.world_origin.min_e, 356_000.0);

        let env = HashMap::from([
            ("GMLINK_SEARCH_RADIUS_M", "12.5"),
            ("GMLINK_GRID_CELL_M", "not-a-number"),
            ("GMLINK_TIE_BREAK", "first_encountered"),
            ("GMLINK_ALLOW_SCENE_FALLBACK", "true"),
            ("GMLINK_GML_DIR", "/data/tiles"),
        ]);
        config.apply_env_with(|key| env.get(key).map(|v| v.to_string()));
        assert_eq!(config.search_radius_m, 12.5);
        assert_eq!(config.grid_cell_m, 25.0);
        assert_eq!(config.tie_break, TieBreak::FirstEncountered);
        assert!(config.allow_scene_fallback);
        assert_eq!(config.gml_dir, Some(PathBuf::from("/data/tiles")));
        assert_eq!(config.world_origin.min_n, 5_645_000.0);
        config.validate().unwrap();
    }

    #[test]
    fn unknown_yaml_keys_are_rejected() {
        let err = LinkConfig::from_yaml_str("gpkg: city.gpkg\n").unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn invalid_tunables_fail_validation() {
        let base = LinkConfig {
            gpkg_path: Some("city.gpkg".into()),
            ..LinkConfig::default()
        };
        base.validate().unwrap();
        for bad in [
            LinkConfig { search_radius_m: 0.0, ..base.clone() },
            LinkConfig { grid_cell_m: -1.0, ..base.clone() },
            LinkConfig { grid_cell_m: 0.01, ..base.clone() },
            LinkConfig { min_confidence: 1.5, ..base.clone() },
            LinkConfig { suspicious_dist_m: f64::NAN, ..base.clone() },
        ] {
            assert!(matches!(bad.validate(), Err(BuildError::Config(_))));
        }
    }

    #[test]
    fn gpkg_directory_prefers_readonly_then_first() {
        let dir = tempfile::tempdir().unwrap();
        let file = |name: &str| {
            let p = dir.path().join(name);
            std::fs::write(&p, b"").unwrap();
            p
        };
        assert!(resolve_gpkg_path(dir.path()).is_err());

        let b = file("b.gpkg");
        assert_eq!(resolve_gpkg_path(dir.path()).unwrap(), b);
        let a = file("a.gpkg");
        assert_eq!(resolve_gpkg_path(dir.path()).unwrap(), a);
        let ro = file("z_READONLY.gpkg");
        assert_eq!(resolve_gpkg_path(dir.path()).unwrap(), ro);
        file("notes.txt");
        assert_eq!(resolve_gpkg_path(&b).unwrap(), b);
        assert!(resolve_gpkg_path(&dir.path().join("notes.txt")).is_err());
        assert!(resolve_gpkg_path(&dir.path().join("missing.gpkg")).is_err());
    }
}
