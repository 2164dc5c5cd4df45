//! Schema and read/write access for the three link tables.
//!
//! Writers take a `&mut SqliteConnection` so callers can run them inside one
//! transaction on a [`crate::StagedDb`]. Readers open finished artifacts
//! read-only and retry busy failures.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use gmlink_core::{normalize_source_tile, BBox, GmlCentroid, LinkRow, LinkSummary, OsmCandidate, SemanticValue, TileKey, WorldOrigin};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqliteConnection, SqlitePool, SqliteRow};
use sqlx::{Executor, Row, TypeInfo, ValueRef};
use tracing::{debug, info, warn};

use crate::{open_read_only, retry_busy, BackoffPolicy, ReadOptions, StoreError, StoreResult};

/// OSM buildings in world coordinates, written by the GeoPackage extractor.
pub const OSM_WORLD_TABLE: &str = "osm_building_link";
/// OSM buildings shifted into local coordinates.
pub const OSM_LOCAL_TABLE: &str = "osm_building_link_local";
pub const GML_TABLE: &str = "gml_building_centroids";
pub const LINK_TABLE: &str = "gml_osm_links";

pub const OSM_REQUIRED_COLUMNS: [&str; 3] = ["osm_way_id", "cx", "cy"];
pub const GML_REQUIRED_COLUMNS: [&str; 4] = ["source_tile", "building_idx", "cx", "cy"];
pub const LINK_REQUIRED_COLUMNS: [&str; 10] = [
    "source_tile",
    "building_idx",
    "osm_way_id",
    "dist_m",
    "confidence",
    "iou",
    "cx_gml",
    "cy_gml",
    "cx_osm",
    "cy_osm",
];
pub const BBOX_COLUMNS: [&str; 4] = ["minx", "miny", "maxx", "maxy"];

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn is_fixed_osm_column(name: &str) -> bool {
    OSM_REQUIRED_COLUMNS.contains(&name) || BBOX_COLUMNS.contains(&name)
}

/// Column names of `table` in declaration order; empty when the table does
/// not exist.
pub async fn table_columns<'e, E>(executor: E, table: &str) -> Result<Vec<String>, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let sql = format!("PRAGMA table_info({})", quote_ident(table));
    let rows = sqlx::query(&sql).fetch_all(executor).await?;
    rows.iter()
        .map(|row| row.try_get::<String, _>("name"))
        .collect()
}

pub async fn table_exists<'e, E>(executor: E, table: &str) -> Result<bool, sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    let found: Option<i64> =
        sqlx::query_scalar("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ? LIMIT 1")
            .bind(table)
            .fetch_optional(executor)
            .await?;
    Ok(found.is_some())
}

/// Fail with [`StoreError::MissingTable`] or [`StoreError::MissingColumns`]
/// unless every `required` column is present in `available`.
pub fn require_columns(table: &str, available: &[String], required: &[&str]) -> StoreResult<()> {
    if available.is_empty() {
        return Err(StoreError::MissingTable(table.to_string()));
    }
    let missing = required
        .iter()
        .filter(|col| !available.iter().any(|a| a == *col))
        .map(|col| col.to_string())
        .collect::<Vec<_>>();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(StoreError::MissingColumns {
            table: table.to_string(),
            columns: missing,
        })
    }
}

fn has_bbox(available: &[String]) -> bool {
    BBOX_COLUMNS
        .iter()
        .all(|col| available.iter().any(|a| a == col))
}

fn bbox_from(parts: [Option<f64>; 4]) -> Option<BBox> {
    match parts {
        [Some(minx), Some(miny), Some(maxx), Some(maxy)] => Some(BBox::new(minx, miny, maxx, maxy)),
        _ => None,
    }
}

fn bind_semantic<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    value: Option<&'q SemanticValue>,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        None | Some(SemanticValue::Null) => query.bind(None::<String>),
        Some(SemanticValue::Integer(v)) => query.bind(*v),
        Some(SemanticValue::Real(v)) => query.bind(*v),
        Some(SemanticValue::Text(v)) => query.bind(v.as_str()),
    }
}

pub fn semantic_from_row(row: &SqliteRow, column: &str) -> Result<SemanticValue, sqlx::Error> {
    let raw = row.try_get_raw(column)?;
    if raw.is_null() {
        return Ok(SemanticValue::Null);
    }
    let type_name = raw.type_info().name().to_ascii_uppercase();
    let value = match type_name.as_str() {
        "INTEGER" => SemanticValue::Integer(row.try_get(column)?),
        "REAL" => SemanticValue::Real(row.try_get(column)?),
        "TEXT" => SemanticValue::Text(row.try_get(column)?),
        _ => SemanticValue::Null,
    };
    Ok(value)
}

// ---------------------------------------------------------------------------
// OSM world + local tables

/// Create (or replace) the world-coordinate OSM table. Semantic columns are
/// declared without a type so integers, reals and text keep their storage class.
pub async fn create_osm_world_table(
    conn: &mut SqliteConnection,
    semantic_columns: &[String],
) -> Result<(), sqlx::Error> {
    let mut ddl = format!(
        "CREATE TABLE {OSM_WORLD_TABLE} (\n    osm_way_id INTEGER NOT NULL,\n    cx REAL NOT NULL,\n    cy REAL NOT NULL,\n    minx REAL,\n    miny REAL,\n    maxx REAL,\n    maxy REAL"
    );
    for col in semantic_columns.iter().filter(|c| !is_fixed_osm_column(c)) {
        ddl.push_str(",\n    ");
        ddl.push_str(&quote_ident(col));
    }
    ddl.push_str("\n)");

    sqlx::query(&format!("DROP TABLE IF EXISTS {OSM_WORLD_TABLE}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&ddl).execute(&mut *conn).await?;
    sqlx::query(&format!(
        "CREATE INDEX idx_{OSM_WORLD_TABLE}_id ON {OSM_WORLD_TABLE}(osm_way_id)"
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX idx_{OSM_WORLD_TABLE}_xy ON {OSM_WORLD_TABLE}(cx, cy)"
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn insert_osm_world(
    conn: &mut SqliteConnection,
    semantic_columns: &[String],
    rows: &[OsmCandidate],
) -> Result<u64, sqlx::Error> {
    let semantic = semantic_columns
        .iter()
        .filter(|c| !is_fixed_osm_column(c))
        .collect::<Vec<_>>();
    let mut columns = ["osm_way_id", "cx", "cy", "minx", "miny", "maxx", "maxy"]
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>();
    columns.extend(semantic.iter().map(|c| quote_ident(c)));
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {OSM_WORLD_TABLE} ({}) VALUES ({placeholders})",
        columns.join(", ")
    );

    let mut written = 0;
    for row in rows {
        let mut query = sqlx::query(&sql)
            .bind(row.osm_way_id)
            .bind(row.cx)
            .bind(row.cy)
            .bind(row.bbox.map(|b| b.minx))
            .bind(row.bbox.map(|b| b.miny))
            .bind(row.bbox.map(|b| b.maxx))
            .bind(row.bbox.map(|b| b.maxy));
        for col in &semantic {
            query = bind_semantic(query, row.semantics.get(col.as_str()));
        }
        written += query.execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalTableStats {
    pub rows: i64,
    pub has_bbox: bool,
    pub semantic_columns: Vec<String>,
}

/// Replace the local OSM table with a shifted copy of the world table.
///
/// `cx, cy` and the bbox columns (when the world table has all four) move by
/// `-min_e, -min_n`. Requested semantic columns that the world table lacks
/// are left out.
pub async fn build_osm_local_table(
    conn: &mut SqliteConnection,
    origin: &WorldOrigin,
    semantic_wanted: &[String],
) -> StoreResult<LocalTableStats> {
    let available = table_columns(&mut *conn, OSM_WORLD_TABLE).await?;
    require_columns(OSM_WORLD_TABLE, &available, &OSM_REQUIRED_COLUMNS)?;

    let semantic_columns = semantic_wanted
        .iter()
        .filter(|c| !is_fixed_osm_column(c) && available.contains(*c))
        .cloned()
        .collect::<Vec<_>>();
    let bbox = has_bbox(&available);

    let mut select = String::from("osm_way_id,\n    (cx - ?) AS cx,\n    (cy - ?) AS cy");
    if bbox {
        select.push_str(
            ",\n    (minx - ?) AS minx,\n    (miny - ?) AS miny,\n    (maxx - ?) AS maxx,\n    (maxy - ?) AS maxy",
        );
    }
    for col in &semantic_columns {
        select.push_str(",\n    ");
        select.push_str(&quote_ident(col));
    }
    let sql = format!(
        "CREATE TABLE {OSM_LOCAL_TABLE} AS\nSELECT\n    {select}\nFROM {OSM_WORLD_TABLE}\nWHERE osm_way_id IS NOT NULL"
    );

    sqlx::query(&format!("DROP TABLE IF EXISTS {OSM_LOCAL_TABLE}"))
        .execute(&mut *conn)
        .await?;
    let mut query = sqlx::query(&sql).bind(origin.min_e).bind(origin.min_n);
    if bbox {
        query = query
            .bind(origin.min_e)
            .bind(origin.min_n)
            .bind(origin.min_e)
            .bind(origin.min_n);
    }
    query.execute(&mut *conn).await?;
    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_osm_local_xy ON {OSM_LOCAL_TABLE}(cx, cy)"
    ))
    .execute(&mut *conn)
    .await?;

    let rows: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {OSM_LOCAL_TABLE}"))
        .fetch_one(&mut *conn)
        .await?;
    if !bbox {
        info!("no bbox columns in {OSM_WORLD_TABLE}; iou will be 0.0");
    }
    info!(rows, semantic = ?semantic_columns, min_e = origin.min_e, min_n = origin.min_n, "built {OSM_LOCAL_TABLE}");
    Ok(LocalTableStats {
        rows,
        has_bbox: bbox,
        semantic_columns,
    })
}

// ---------------------------------------------------------------------------
// GML centroids

pub async fn create_gml_table(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {GML_TABLE}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {GML_TABLE} (
    source_tile TEXT NOT NULL,
    building_idx INTEGER NOT NULL,
    gml_id TEXT,
    cx REAL NOT NULL,
    cy REAL NOT NULL,
    minx REAL,
    miny REAL,
    maxx REAL,
    maxy REAL,
    PRIMARY KEY (source_tile, building_idx)
)"
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Insert centroids, storing each under its normalized tile key.
pub async fn insert_gml_centroids(
    conn: &mut SqliteConnection,
    rows: &[GmlCentroid],
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        "INSERT INTO {GML_TABLE} (source_tile, building_idx, gml_id, cx, cy, minx, miny, maxx, maxy) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    let mut written = 0;
    for row in rows {
        let tile = normalize_source_tile(Some(&row.source_tile));
        written += sqlx::query(&sql)
            .bind(tile)
            .bind(row.building_idx)
            .bind(row.gml_id.as_deref())
            .bind(row.cx)
            .bind(row.cy)
            .bind(row.bbox.map(|b| b.minx))
            .bind(row.bbox.map(|b| b.miny))
            .bind(row.bbox.map(|b| b.maxx))
            .bind(row.bbox.map(|b| b.maxy))
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(written)
}

/// Read-only view of a finished GML centroid database.
#[derive(Debug)]
pub struct GmlCentroidDb {
    path: PathBuf,
    pool: SqlitePool,
    backoff: BackoffPolicy,
    has_bbox: bool,
}

impl GmlCentroidDb {
    pub async fn open(path: &Path, opts: &ReadOptions) -> StoreResult<Self> {
        let pool = open_read_only(path, opts).await?;
        let available = retry_busy(&opts.backoff, "reading gml schema", || {
            table_columns(&pool, GML_TABLE)
        })
        .await?;
        require_columns(GML_TABLE, &available, &GML_REQUIRED_COLUMNS)?;
        Ok(Self {
            path: path.to_path_buf(),
            has_bbox: has_bbox(&available),
            pool,
            backoff: opts.backoff,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn count(&self) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {GML_TABLE}");
        let (pool, sql) = (&self.pool, sql.as_str());
        retry_busy(&self.backoff, "counting gml centroids", move || {
            sqlx::query_scalar(sql).fetch_one(pool)
        })
        .await
    }

    /// Stored tile names in ascending order, as written by the extractor.
    pub async fn tiles(&self) -> StoreResult<Vec<String>> {
        let sql = format!("SELECT DISTINCT source_tile FROM {GML_TABLE} ORDER BY source_tile");
        let (pool, sql) = (&self.pool, sql.as_str());
        retry_busy(&self.backoff, "listing gml tiles", move || {
            sqlx::query_scalar(sql).fetch_all(pool)
        })
        .await
    }

    /// Centroids of one stored tile, ordered by `building_idx`. The returned
    /// records carry the normalized tile key.
    pub async fn tile(&self, stored_tile: &str) -> StoreResult<Vec<GmlCentroid>> {
        let bbox_select = if self.has_bbox {
            "CAST(minx AS REAL) AS minx, CAST(miny AS REAL) AS miny, CAST(maxx AS REAL) AS maxx, CAST(maxy AS REAL) AS maxy"
        } else {
            "NULL AS minx, NULL AS miny, NULL AS maxx, NULL AS maxy"
        };
        let sql = format!(
            "SELECT building_idx, gml_id, CAST(cx AS REAL) AS cx, CAST(cy AS REAL) AS cy, {bbox_select} \
             FROM {GML_TABLE} WHERE source_tile = ? AND cx IS NOT NULL AND cy IS NOT NULL ORDER BY building_idx"
        );
        let pool = &self.pool;
        let sql = sql.as_str();
        let rows = retry_busy(&self.backoff, "loading gml tile", move || {
            sqlx::query(sql).bind(stored_tile).fetch_all(pool)
        })
        .await?;

        let key: TileKey = normalize_source_tile(Some(stored_tile));
        let mut centroids = Vec::with_capacity(rows.len());
        for row in &rows {
            centroids.push(GmlCentroid {
                source_tile: key.clone(),
                building_idx: row.try_get("building_idx")?,
                gml_id: row.try_get("gml_id")?,
                cx: row.try_get("cx")?,
                cy: row.try_get("cy")?,
                bbox: bbox_from([
                    row.try_get("minx")?,
                    row.try_get("miny")?,
                    row.try_get("maxx")?,
                    row.try_get("maxy")?,
                ]),
            });
        }
        Ok(centroids)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// OSM candidates

/// Read-only view of the OSM database, bound to the table the linker uses.
#[derive(Debug)]
pub struct OsmCandidateDb {
    path: PathBuf,
    pool: SqlitePool,
    backoff: BackoffPolicy,
    table: &'static str,
    has_bbox: bool,
    semantic_columns: Vec<String>,
}

impl OsmCandidateDb {
    /// Open `path` and pick the local table, falling back to the world table.
    pub async fn open(path: &Path, opts: &ReadOptions, semantic_wanted: &[String]) -> StoreResult<Self> {
        let pool = open_read_only(path, opts).await?;
        let mut chosen = None;
        for table in [OSM_LOCAL_TABLE, OSM_WORLD_TABLE] {
            let exists = retry_busy(&opts.backoff, "probing osm tables", || {
                table_exists(&pool, table)
            })
            .await?;
            if exists {
                chosen = Some(table);
                break;
            }
        }
        let Some(table) = chosen else {
            pool.close().await;
            return Err(StoreError::MissingTable(format!(
                "{OSM_LOCAL_TABLE} or {OSM_WORLD_TABLE}"
            )));
        };
        if table == OSM_WORLD_TABLE {
            warn!(db = %path.display(), "{OSM_LOCAL_TABLE} missing; matching against world coordinates");
        }

        let available = retry_busy(&opts.backoff, "reading osm schema", || {
            table_columns(&pool, table)
        })
        .await?;
        require_columns(table, &available, &OSM_REQUIRED_COLUMNS)?;
        let semantic_columns = semantic_wanted
            .iter()
            .filter(|c| !is_fixed_osm_column(c) && available.contains(*c))
            .cloned()
            .collect::<Vec<_>>();
        debug!(table, semantic = ?semantic_columns, "opened osm candidates");
        Ok(Self {
            path: path.to_path_buf(),
            has_bbox: has_bbox(&available),
            pool,
            backoff: opts.backoff,
            table,
            semantic_columns,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn table(&self) -> &'static str {
        self.table
    }

    /// True when candidates are in local (shifted) coordinates.
    pub fn is_local(&self) -> bool {
        self.table == OSM_LOCAL_TABLE
    }

    pub fn semantic_columns(&self) -> &[String] {
        &self.semantic_columns
    }

    pub async fn count(&self) -> StoreResult<i64> {
        let pool = &self.pool;
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let sql = sql.as_str();
        retry_busy(&self.backoff, "counting osm candidates", move || {
            sqlx::query_scalar(sql).fetch_one(pool)
        })
        .await
    }

    /// Candidates whose centroid falls inside `area` (inclusive).
    pub async fn candidates_in(&self, area: &BBox) -> StoreResult<Vec<OsmCandidate>> {
        let mut select = String::from(
            "CAST(osm_way_id AS INTEGER) AS osm_way_id, CAST(cx AS REAL) AS cx, CAST(cy AS REAL) AS cy",
        );
        if self.has_bbox {
            select.push_str(", CAST(minx AS REAL) AS minx, CAST(miny AS REAL) AS miny, CAST(maxx AS REAL) AS maxx, CAST(maxy AS REAL) AS maxy");
        } else {
            select.push_str(", NULL AS minx, NULL AS miny, NULL AS maxx, NULL AS maxy");
        }
        for col in &self.semantic_columns {
            select.push_str(", ");
            select.push_str(&quote_ident(col));
        }
        let sql = format!(
            "SELECT {select} FROM {} \
             WHERE osm_way_id IS NOT NULL AND cx BETWEEN ? AND ? AND cy BETWEEN ? AND ? \
             ORDER BY osm_way_id",
            self.table
        );
        let pool = &self.pool;
        let sql = sql.as_str();
        let area = *area;
        let rows = retry_busy(&self.backoff, "loading osm candidates", move || {
            sqlx::query(sql)
                .bind(area.minx)
                .bind(area.maxx)
                .bind(area.miny)
                .bind(area.maxy)
                .fetch_all(pool)
        })
        .await?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut semantics = BTreeMap::new();
            for col in &self.semantic_columns {
                semantics.insert(col.clone(), semantic_from_row(row, col)?);
            }
            candidates.push(OsmCandidate {
                osm_way_id: row.try_get("osm_way_id")?,
                cx: row.try_get("cx")?,
                cy: row.try_get("cy")?,
                bbox: bbox_from([
                    row.try_get("minx")?,
                    row.try_get("miny")?,
                    row.try_get("maxx")?,
                    row.try_get("maxy")?,
                ]),
                semantics,
            });
        }
        Ok(candidates)
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// ---------------------------------------------------------------------------
// Links

pub async fn create_link_table(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(&format!("DROP TABLE IF EXISTS {LINK_TABLE}"))
        .execute(&mut *conn)
        .await?;
    sqlx::query(&format!(
        "CREATE TABLE {LINK_TABLE} (
    source_tile TEXT NOT NULL,
    building_idx INTEGER NOT NULL,
    osm_way_id INTEGER,
    dist_m REAL,
    confidence REAL NOT NULL DEFAULT 0.0,
    iou REAL NOT NULL DEFAULT 0.0,
    cx_gml REAL NOT NULL,
    cy_gml REAL NOT NULL,
    cx_osm REAL,
    cy_osm REAL,
    PRIMARY KEY (source_tile, building_idx)
)"
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX idx_{LINK_TABLE}_osm ON {LINK_TABLE}(osm_way_id)"
    ))
    .execute(&mut *conn)
    .await?;
    sqlx::query(&format!(
        "CREATE INDEX idx_{LINK_TABLE}_dist ON {LINK_TABLE}(dist_m)"
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Append link rows. Unmatched rows store `dist_m` as NULL.
pub async fn insert_links(conn: &mut SqliteConnection, rows: &[LinkRow]) -> Result<u64, sqlx::Error> {
    let sql = format!(
        "INSERT INTO {LINK_TABLE} (source_tile, building_idx, osm_way_id, dist_m, confidence, iou, cx_gml, cy_gml, cx_osm, cy_osm) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    );
    let mut written = 0;
    for row in rows {
        let dist = row.dist_m.is_finite().then_some(row.dist_m);
        written += sqlx::query(&sql)
            .bind(row.source_tile.as_str())
            .bind(row.building_idx)
            .bind(row.osm_way_id)
            .bind(dist)
            .bind(row.confidence)
            .bind(row.iou)
            .bind(row.cx_gml)
            .bind(row.cy_gml)
            .bind(row.cx_osm)
            .bind(row.cy_osm)
            .execute(&mut *conn)
            .await?
            .rows_affected();
    }
    Ok(written)
}

const LINK_SELECT: &str = "SELECT source_tile, building_idx, CAST(osm_way_id AS INTEGER) AS osm_way_id, \
     CAST(dist_m AS REAL) AS dist_m, CAST(confidence AS REAL) AS confidence, CAST(iou AS REAL) AS iou, \
     CAST(cx_gml AS REAL) AS cx_gml, CAST(cy_gml AS REAL) AS cy_gml, \
     CAST(cx_osm AS REAL) AS cx_osm, CAST(cy_osm AS REAL) AS cy_osm FROM ";

fn link_from_row(row: &SqliteRow) -> Result<LinkRow, sqlx::Error> {
    let dist: Option<f64> = row.try_get("dist_m")?;
    Ok(LinkRow {
        source_tile: row.try_get("source_tile")?,
        building_idx: row.try_get("building_idx")?,
        osm_way_id: row.try_get("osm_way_id")?,
        dist_m: dist.unwrap_or(f64::INFINITY),
        confidence: row.try_get::<Option<f64>, _>("confidence")?.unwrap_or(0.0),
        iou: row.try_get::<Option<f64>, _>("iou")?.unwrap_or(0.0),
        cx_gml: row.try_get("cx_gml")?,
        cy_gml: row.try_get("cy_gml")?,
        cx_osm: row.try_get("cx_osm")?,
        cy_osm: row.try_get("cy_osm")?,
    })
}

/// Read-only access to a finished link table, keyed by
/// `(source_tile, building_idx)`.
#[derive(Debug)]
pub struct LinkReader {
    path: PathBuf,
    pool: SqlitePool,
    backoff: BackoffPolicy,
}

impl LinkReader {
    pub async fn open(path: &Path, opts: &ReadOptions) -> StoreResult<Self> {
        let pool = open_read_only(path, opts).await?;
        let available = retry_busy(&opts.backoff, "reading link schema", || {
            table_columns(&pool, LINK_TABLE)
        })
        .await?;
        require_columns(LINK_TABLE, &available, &LINK_REQUIRED_COLUMNS)?;
        Ok(Self {
            path: path.to_path_buf(),
            pool,
            backoff: opts.backoff,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Look up one building. Any tile spelling is accepted; it is normalized
    /// before the query.
    pub async fn get(&self, tile: &str, building_idx: i64) -> StoreResult<Option<LinkRow>> {
        let key = normalize_source_tile(Some(tile));
        let sql = format!("{LINK_SELECT}{LINK_TABLE} WHERE source_tile = ? AND building_idx = ?");
        let pool = &self.pool;
        let (sql, key) = (sql.as_str(), key.as_str());
        let row = retry_busy(&self.backoff, "reading link row", move || {
            sqlx::query(sql)
                .bind(key)
                .bind(building_idx)
                .fetch_optional(pool)
        })
        .await?;
        Ok(row.as_ref().map(link_from_row).transpose()?)
    }

    /// Every link row ordered by `(source_tile, building_idx)`.
    pub async fn all(&self) -> StoreResult<Vec<LinkRow>> {
        let sql = format!("{LINK_SELECT}{LINK_TABLE} ORDER BY source_tile, building_idx");
        let pool = &self.pool;
        let sql = sql.as_str();
        let rows = retry_busy(&self.backoff, "scanning links", move || {
            sqlx::query(sql).fetch_all(pool)
        })
        .await?;
        Ok(rows.iter().map(link_from_row).collect::<Result<_, _>>()?)
    }

    /// Links that point at one OSM building.
    pub async fn for_osm_way(&self, osm_way_id: i64) -> StoreResult<Vec<LinkRow>> {
        let sql = format!(
            "{LINK_SELECT}{LINK_TABLE} WHERE osm_way_id = ? ORDER BY source_tile, building_idx"
        );
        let pool = &self.pool;
        let sql = sql.as_str();
        let rows = retry_busy(&self.backoff, "reading links by osm way", move || {
            sqlx::query(sql).bind(osm_way_id).fetch_all(pool)
        })
        .await?;
        Ok(rows.iter().map(link_from_row).collect::<Result<_, _>>()?)
    }

    /// Aggregate counts over the whole table, computed in SQL.
    pub async fn summary(&self, suspicious_dist_m: f64) -> StoreResult<LinkSummary> {
        let sql = format!(
            "SELECT COUNT(DISTINCT source_tile), COUNT(*), \
             COALESCE(SUM(osm_way_id IS NOT NULL), 0), \
             COALESCE(SUM(osm_way_id IS NOT NULL AND dist_m > ?), 0) \
             FROM {LINK_TABLE}"
        );
        let (pool, sql) = (&self.pool, sql.as_str());
        let (tiles, rows, matched, suspicious): (i64, i64, i64, i64) =
            retry_busy(&self.backoff, "summarizing links", move || {
                sqlx::query_as(sql).bind(suspicious_dist_m).fetch_one(pool)
            })
            .await?;
        let count = |n: i64| usize::try_from(n).unwrap_or_default();
        Ok(LinkSummary {
            tiles: count(tiles),
            gml_buildings: count(rows),
            matched: count(matched),
            unmatched: count(rows - matched),
            suspicious: count(suspicious),
        })
    }

    pub async fn count(&self) -> StoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {LINK_TABLE}");
        let (pool, sql) = (&self.pool, sql.as_str());
        retry_busy(&self.backoff, "counting links", move || {
            sqlx::query_scalar(sql).fetch_one(pool)
        })
        .await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StagedDb;
    use sqlx::{ConnectOptions, Connection};
    use tempfile::tempdir;

    fn candidate(id: i64, cx: f64, cy: f64, name: &str) -> OsmCandidate {
        let mut c = OsmCandidate::new(id, cx, cy).with_bbox(BBox::new(cx - 5.0, cy - 5.0, cx + 5.0, cy + 5.0));
        c.semantics.insert("name".into(), SemanticValue::Text(name.into()));
        c.semantics.insert("building_levels".into(), SemanticValue::Integer(3));
        c
    }

    fn semantic() -> Vec<String> {
        vec!["name".into(), "building_levels".into(), "height".into()]
    }

    async fn write_osm_db(path: &Path, origin: WorldOrigin) -> LocalTableStats {
        let mut staged = StagedDb::create(path).await.unwrap();
        let mut tx = staged.conn().begin().await.unwrap();
        create_osm_world_table(&mut tx, &["name".into(), "building_levels".into()])
            .await
            .unwrap();
        insert_osm_world(
            &mut tx,
            &["name".into(), "building_levels".into()],
            &[
                candidate(11, 356_100.0, 5_645_200.0, "Dom"),
                candidate(12, 356_400.0, 5_645_900.0, "Bahnhof"),
            ],
        )
        .await
        .unwrap();
        let stats = build_osm_local_table(&mut tx, &origin, &semantic()).await.unwrap();
        tx.commit().await.unwrap();
        staged.persist().await.unwrap();
        stats
    }

    #[tokio::test]
    async fn local_table_is_shifted_once_and_keeps_present_semantics() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("city_linkdb.sqlite");
        let origin = WorldOrigin::new(356_000.0, 5_645_000.0);
        let stats = write_osm_db(&path, origin).await;
        assert_eq!(stats.rows, 2);
        assert!(stats.has_bbox);
        assert_eq!(stats.semantic_columns, vec!["name".to_string(), "building_levels".to_string()]);

        let db = OsmCandidateDb::open(&path, &ReadOptions::default(), &semantic())
            .await
            .unwrap();
        assert!(db.is_local());
        let found = db
            .candidates_in(&BBox::new(50.0, 150.0, 150.0, 250.0))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].osm_way_id, 11);
        assert_eq!((found[0].cx, found[0].cy), (100.0, 200.0));
        assert_eq!(found[0].bbox, Some(BBox::new(95.0, 195.0, 105.0, 205.0)));
        assert_eq!(found[0].semantics["name"], SemanticValue::Text("Dom".into()));
        assert_eq!(found[0].semantics["building_levels"], SemanticValue::Integer(3));
        assert!(!found[0].semantics.contains_key("height"));
        db.close().await;
    }

    #[tokio::test]
    async fn rebuilding_local_table_does_not_shift_twice() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("osm.sqlite");
        let origin = WorldOrigin::new(356_000.0, 5_645_000.0);
        write_osm_db(&path, origin).await;

        let mut conn = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&path)
            .connect()
            .await
            .unwrap();
        build_osm_local_table(&mut conn, &origin, &semantic()).await.unwrap();
        let cx: f64 = sqlx::query_scalar(&format!(
            "SELECT cx FROM {OSM_LOCAL_TABLE} WHERE osm_way_id = 11"
        ))
        .fetch_one(&mut conn)
        .await
        .unwrap();
        assert_eq!(cx, 100.0);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn missing_required_columns_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.sqlite");
        let mut staged = StagedDb::create(&path).await.unwrap();
        sqlx::query(&format!("CREATE TABLE {OSM_WORLD_TABLE} (osm_way_id INTEGER, cx REAL)"))
            .execute(&mut *staged.conn())
            .await
            .unwrap();
        let err = build_osm_local_table(staged.conn(), &WorldOrigin::default(), &[])
            .await
            .unwrap_err();
        match err {
            StoreError::MissingColumns { table, columns } => {
                assert_eq!(table, OSM_WORLD_TABLE);
                assert_eq!(columns, vec!["cy".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = require_columns(GML_TABLE, &[], &GML_REQUIRED_COLUMNS).unwrap_err();
        assert!(matches!(err, StoreError::MissingTable(_)));
    }

    #[tokio::test]
    async fn gml_rows_are_stored_under_normalized_keys_and_read_in_index_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gml.sqlite");
        let mut staged = StagedDb::create(&path).await.unwrap();
        let mut tx = staged.conn().begin().await.unwrap();
        create_gml_table(&mut tx).await.unwrap();
        let rows = [2_i64, 0, 1].map(|idx| GmlCentroid {
            source_tile: "tiles/LoD2_356_5645.gml".into(),
            building_idx: idx,
            gml_id: Some(format!("BLD_{idx}")),
            cx: idx as f64,
            cy: 0.5,
            bbox: (idx != 1).then(|| BBox::new(0.0, 0.0, 1.0, 1.0)),
        });
        assert_eq!(insert_gml_centroids(&mut tx, &rows).await.unwrap(), 3);
        tx.commit().await.unwrap();
        staged.persist().await.unwrap();

        let db = GmlCentroidDb::open(&path, &ReadOptions::default()).await.unwrap();
        assert_eq!(db.count().await.unwrap(), 3);
        let tiles = db.tiles().await.unwrap();
        assert_eq!(tiles, vec!["LoD2_356_5645".to_string()]);
        let loaded = db.tile(&tiles[0]).await.unwrap();
        assert_eq!(loaded.iter().map(|g| g.building_idx).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert_eq!(loaded[1].bbox, None);
        assert_eq!(loaded[2].gml_id.as_deref(), Some("BLD_2"));
        db.close().await;
    }

    #[tokio::test]
    async fn link_reader_round_trips_matched_and_unmatched_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("links.sqlite");
        let g = GmlCentroid {
            source_tile: "tile_07".into(),
            building_idx: 3,
            gml_id: None,
            cx: 100.0,
            cy: 200.0,
            bbox: None,
        };
        let unmatched = LinkRow {
            building_idx: 4,
            ..LinkRow::unmatched(&g)
        };
        let matched = LinkRow {
            osm_way_id: Some(11),
            dist_m: 0.5,
            confidence: 0.9,
            iou: 0.25,
            cx_osm: Some(100.5),
            cy_osm: Some(200.0),
            ..LinkRow::unmatched(&g)
        };

        let mut staged = StagedDb::create(&path).await.unwrap();
        let mut tx = staged.conn().begin().await.unwrap();
        create_link_table(&mut tx).await.unwrap();
        insert_links(&mut tx, &[matched.clone(), unmatched.clone()]).await.unwrap();
        tx.commit().await.unwrap();
        staged.persist().await.unwrap();

        let reader = LinkReader::open(&path, &ReadOptions::default()).await.unwrap();
        assert_eq!(reader.count().await.unwrap(), 2);
        assert_eq!(reader.get("some/dir/tile_07.gml", 3).await.unwrap(), Some(matched.clone()));
        let back = reader.get("tile_07", 4).await.unwrap().unwrap();
        assert!(back.dist_m.is_infinite());
        assert_eq!(back.osm_way_id, None);
        assert_eq!(back.confidence, 0.0);
        assert_eq!(reader.get("tile_07", 99).await.unwrap(), None);
        assert_eq!(reader.for_osm_way(11).await.unwrap(), vec![matched]);
        let all = reader.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|row| row.source_tile == "tile_07"));
        reader.close().await;
    }

    #[tokio::test]
    async fn link_summary_is_aggregated_in_sql() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("links.sqlite");
        let row = |tile: &str, idx: i64, osm: Option<i64>, dist: f64| {
            let unmatched = LinkRow::unmatched(&GmlCentroid {
                source_tile: tile.into(),
                building_idx: idx,
                gml_id: None,
                cx: 0.0,
                cy: 0.0,
                bbox: None,
            });
            match osm {
                Some(id) => LinkRow {
                    osm_way_id: Some(id),
                    dist_m: dist,
                    confidence: 0.5,
                    cx_osm: Some(dist),
                    cy_osm: Some(0.0),
                    ..unmatched
                },
                None => unmatched,
            }
        };
        let rows = vec![
            row("a", 0, Some(1), 2.0),
            row("a", 1, None, f64::INFINITY),
            row("b", 0, Some(2), 12.0),
        ];

        let mut staged = StagedDb::create(&path).await.unwrap();
        let mut tx = staged.conn().begin().await.unwrap();
        create_link_table(&mut tx).await.unwrap();
        insert_links(&mut tx, &rows).await.unwrap();
        tx.commit().await.unwrap();
        staged.persist().await.unwrap();

        let reader = LinkReader::open(&path, &ReadOptions::default()).await.unwrap();
        let summary = reader.summary(10.0).await.unwrap();
        assert_eq!(
            summary,
            LinkSummary {
                tiles: 2,
                gml_buildings: 3,
                matched: 2,
                unmatched: 1,
                suspicious: 1,
            }
        );
        let mut folded = LinkSummary::default();
        for tile in reader.all().await.unwrap().chunk_by(|a, b| a.source_tile == b.source_tile) {
            folded.record_tile(tile, 10.0);
        }
        assert_eq!(summary, folded);
        reader.close().await;
    }

    #[tokio::test]
    async fn empty_link_table_summarizes_to_zero() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("links.sqlite");
        let mut staged = StagedDb::create(&path).await.unwrap();
        let mut tx = staged.conn().begin().await.unwrap();
        create_link_table(&mut tx).await.unwrap();
        tx.commit().await.unwrap();
        staged.persist().await.unwrap();

        let reader = LinkReader::open(&path, &ReadOptions::default()).await.unwrap();
        assert_eq!(reader.summary(10.0).await.unwrap(), LinkSummary::default());
        reader.close().await;
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
