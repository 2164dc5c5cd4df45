//! GeoPackage → `osm_building_link` extraction.
//!
//! Centroids come from the layer's R*Tree extents, so no geometry blob is
//! ever decoded.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gmlink_core::{BBox, OsmCandidate, SemanticValue};
use gmlink_storage::tables::{
    create_osm_world_table, insert_osm_world, quote_ident, semantic_from_row, table_columns,
    table_exists,
};
use gmlink_storage::{open_read_only, retry_busy, ReadOptions};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqliteRow};
use sqlx::Row;
use tracing::{debug, info, warn};

use crate::ExtractError;

const ID_FIELD: &str = "osm_way_id";
const PAGE_SIZE: i64 = 50_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpkgLayer {
    pub table: String,
    pub geometry_column: String,
}

impl GpkgLayer {
    /// Name of the GeoPackage R*Tree index for this layer.
    pub fn rtree_table(&self) -> String {
        format!("rtree_{}_{}", self.table, self.geometry_column)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OsmExtractStats {
    pub layer: String,
    pub rows: u64,
    pub skipped_ids: u64,
    pub semantic_columns: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct GpkgOsmExtractor {
    gpkg: PathBuf,
    layer: Option<String>,
    semantic_columns: Vec<String>,
    read: ReadOptions,
}

impl GpkgOsmExtractor {
    pub fn new(gpkg: impl Into<PathBuf>, semantic_columns: Vec<String>) -> Self {
        Self {
            gpkg: gpkg.into(),
            layer: None,
            semantic_columns,
            read: ReadOptions::default(),
        }
    }

    pub fn with_layer(mut self, layer: Option<String>) -> Self {
        self.layer = layer;
        self
    }

    pub fn with_read_options(mut self, read: ReadOptions) -> Self {
        self.read = read;
        self
    }

    pub fn gpkg(&self) -> &Path {
        &self.gpkg
    }

    async fn list_layers(&self, pool: &SqlitePool) -> Result<Vec<GpkgLayer>, ExtractError> {
        let backoff = &self.read.backoff;
        if !retry_busy(backoff, "probing gpkg_geometry_columns", || {
            table_exists(pool, "gpkg_geometry_columns")
        })
        .await?
        {
            return Err(ExtractError::NoBuildingLayer(self.gpkg.clone()));
        }
        let rows: Vec<(String, String)> = retry_busy(backoff, "listing gpkg layers", || {
            sqlx::query_as(
                "SELECT table_name, column_name FROM gpkg_geometry_columns ORDER BY table_name",
            )
            .fetch_all(pool)
        })
        .await?;
        Ok(rows
            .into_iter()
            .map(|(table, geometry_column)| GpkgLayer {
                table,
                geometry_column,
            })
            .collect())
    }

    /// The configured layer, else the first layer with an `osm_way_id`
    /// column, preferring `*multipolygons` tables.
    pub async fn discover_layer(&self, pool: &SqlitePool) -> Result<GpkgLayer, ExtractError> {
        let layers = self.list_layers(pool).await?;
        if let Some(wanted) = &self.layer {
            return layers
                .into_iter()
                .find(|l| &l.table == wanted)
                .ok_or_else(|| ExtractError::UnknownLayer {
                    gpkg: self.gpkg.clone(),
                    layer: wanted.clone(),
                });
        }

        let mut with_id = Vec::new();
        for layer in layers {
            let table = layer.table.as_str();
            let columns = retry_busy(&self.read.backoff, "reading layer schema", || {
                table_columns(pool, table)
            })
            .await?;
            if columns.iter().any(|c| c == ID_FIELD) {
                with_id.push(layer);
            }
        }
        let preferred = with_id
            .iter()
            .position(|l| l.table.ends_with("multipolygons"))
            .unwrap_or(0);
        if with_id.is_empty() {
            return Err(ExtractError::NoBuildingLayer(self.gpkg.clone()));
        }
        Ok(with_id.swap_remove(preferred))
    }

    /// Read the GeoPackage and write `osm_building_link` into `conn`.
    ///
    /// Rows whose `osm_way_id` is missing or not an integer are skipped.
    pub async fn extract_into(
        &self,
        conn: &mut SqliteConnection,
    ) -> Result<OsmExtractStats, ExtractError> {
        if !self.gpkg.is_file() {
            return Err(ExtractError::MissingGeoPackage(self.gpkg.clone()));
        }
        let pool = open_read_only(&self.gpkg, &self.read).await?;
        let result = self.extract_with(&pool, conn).await;
        pool.close().await;
        result
    }

    async fn extract_with(
        &self,
        pool: &SqlitePool,
        conn: &mut SqliteConnection,
    ) -> Result<OsmExtractStats, ExtractError> {
        let layer = self.discover_layer(pool).await?;
        let rtree = layer.rtree_table();
        let rtree_name = rtree.as_str();
        if !retry_busy(&self.read.backoff, "probing spatial index", || {
            table_exists(pool, rtree_name)
        })
        .await?
        {
            return Err(ExtractError::MissingSpatialIndex(rtree));
        }

        let table = layer.table.as_str();
        let available = retry_busy(&self.read.backoff, "reading layer schema", || {
            table_columns(pool, table)
        })
        .await?;
        let (present, missing): (Vec<String>, Vec<String>) = self
            .semantic_columns
            .iter()
            .filter(|c| c.as_str() != ID_FIELD)
            .cloned()
            .partition(|c| available.contains(c));
        if !missing.is_empty() {
            warn!(layer = %layer.table, missing = ?missing, "semantic columns not in layer; skipped");
        }
        info!(gpkg = %self.gpkg.display(), layer = %layer.table, semantic = ?present, "extracting OSM buildings");

        let mut select = format!(
            "SELECT b.rowid AS rid, b.{id} AS osm_way_id, \
             (r.minx + r.maxx) / 2.0 AS cx, (r.miny + r.maxy) / 2.0 AS cy, \
             r.minx AS minx, r.miny AS miny, r.maxx AS maxx, r.maxy AS maxy",
            id = quote_ident(ID_FIELD)
        );
        for col in &present {
            select.push_str(&format!(", b.{q} AS {q}", q = quote_ident(col)));
        }
        let sql = format!(
            "{select} FROM {} b JOIN {} r ON b.rowid = r.id \
             WHERE b.{} IS NOT NULL AND b.rowid > ? ORDER BY b.rowid LIMIT ?",
            quote_ident(&layer.table),
            quote_ident(&rtree),
            quote_ident(ID_FIELD)
        );

        create_osm_world_table(&mut *conn, &present).await?;

        let mut rows_written = 0u64;
        let mut skipped = 0u64;
        let mut after: i64 = i64::MIN;
        let sql = sql.as_str();
        loop {
            let page = retry_busy(&self.read.backoff, "reading gpkg page", move || {
                sqlx::query(sql).bind(after).bind(PAGE_SIZE).fetch_all(pool)
            })
            .await?;
            let Some(last) = page.last() else {
                break;
            };
            after = last.try_get("rid")?;

            let mut batch = Vec::with_capacity(page.len());
            for row in &page {
                match candidate_from_row(row, &present)? {
                    Some(candidate) => batch.push(candidate),
                    None => skipped += 1,
                }
            }
            rows_written += insert_osm_world(&mut *conn, &present, &batch).await?;
            debug!(rows_written, "inserted gpkg page");
            if (page.len() as i64) < PAGE_SIZE {
                break;
            }
        }
        if skipped > 0 {
            warn!(skipped, "rows with unparseable osm_way_id skipped");
        }
        info!(rows = rows_written, layer = %layer.table, "OSM buildings extracted");
        Ok(OsmExtractStats {
            layer: layer.table,
            rows: rows_written,
            skipped_ids: skipped,
            semantic_columns: present,
        })
    }
}

/// GeoPackages written by GDAL often store `osm_way_id` as text.
pub fn parse_osm_id(value: &SemanticValue) -> Option<i64> {
    match value {
        SemanticValue::Integer(v) => Some(*v),
        SemanticValue::Real(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
        SemanticValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn candidate_from_row(
    row: &SqliteRow,
    semantic_columns: &[String],
) -> Result<Option<OsmCandidate>, sqlx::Error> {
    let Some(osm_way_id) = parse_osm_id(&semantic_from_row(row, ID_FIELD)?) else {
        return Ok(None);
    };
    let cx: Option<f64> = row.try_get("cx")?;
    let cy: Option<f64> = row.try_get("cy")?;
    let (Some(cx), Some(cy)) = (cx, cy) else {
        return Ok(None);
    };
    let bbox = match (
        row.try_get::<Option<f64>, _>("minx")?,
        row.try_get::<Option<f64>, _>("miny")?,
        row.try_get::<Option<f64>, _>("maxx")?,
        row.try_get::<Option<f64>, _>("maxy")?,
    ) {
        (Some(minx), Some(miny), Some(maxx), Some(maxy)) => Some(BBox::new(minx, miny, maxx, maxy)),
        _ => None,
    };
    let mut semantics = BTreeMap::new();
    for col in semantic_columns {
        semantics.insert(col.clone(), semantic_from_row(row, col)?);
    }
    Ok(Some(OsmCandidate {
        osm_way_id,
        cx,
        cy,
        bbox,
        semantics,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn osm_ids_parse_from_integer_text_and_integral_reals() {
        assert_eq!(parse_osm_id(&SemanticValue::Integer(42)), Some(42));
        assert_eq!(parse_osm_id(&SemanticValue::Text(" 4711 ".into())), Some(4711));
        assert_eq!(parse_osm_id(&SemanticValue::Real(12.0)), Some(12));
        assert_eq!(parse_osm_id(&SemanticValue::Real(12.5)), None);
        assert_eq!(parse_osm_id(&SemanticValue::Text("way/12".into())), None);
        assert_eq!(parse_osm_id(&SemanticValue::Null), None);
    }

    #[test]
    fn rtree_name_follows_geopackage_convention() {
        let layer = GpkgLayer {
            table: "koeln__multipolygons".into(),
            geometry_column: "geom".into(),
        };
        assert_eq!(layer.rtree_table(), "rtree_koeln__multipolygons_geom");
    }
}
