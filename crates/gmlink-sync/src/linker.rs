//! Per-tile linking stage: GML centroids × OSM candidates → `gml_osm_links`.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use gmlink_core::{
    match_tile, normalize_source_tile, BBox, GmlCentroid, LinkSummary, MatchParams, Shift,
    TileKey, WorldOrigin,
};
use gmlink_storage::tables::{create_link_table, insert_links};
use gmlink_storage::{GmlCentroidDb, OsmCandidateDb, ReadOptions};
use sqlx::sqlite::SqliteConnection;
use tracing::{debug, info, warn};

use crate::BuildError;

/// Tiles logged in full before switching to periodic progress lines.
const DETAILED_TILES: usize = 3;
const PROGRESS_EVERY: usize = 10;

#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub params: MatchParams,
    pub origin: WorldOrigin,
    pub suspicious_dist_m: f64,
    pub read: ReadOptions,
}

/// Stored tile names grouped by normalized key, so spellings such as
/// `LoD2_1.gml` and `LoD2_1` land in one tile.
fn group_tiles(stored: Vec<String>) -> BTreeMap<TileKey, Vec<String>> {
    let mut groups: BTreeMap<TileKey, Vec<String>> = BTreeMap::new();
    for name in stored {
        groups
            .entry(normalize_source_tile(Some(&name)))
            .or_default()
            .push(name);
    }
    groups
}

async fn load_tile(
    gml: &GmlCentroidDb,
    key: &str,
    stored: &[String],
) -> Result<Vec<GmlCentroid>, BuildError> {
    let mut centroids = Vec::new();
    let mut seen = BTreeSet::new();
    for name in stored {
        for centroid in gml.tile(name).await? {
            if seen.insert(centroid.building_idx) {
                centroids.push(centroid);
            } else {
                warn!(tile = key, building_idx = centroid.building_idx, stored = %name, "duplicate building index; keeping the first");
            }
        }
    }
    centroids.sort_by_key(|c| c.building_idx);
    Ok(centroids)
}

/// Match every GML tile and write the rows into `conn`, which the caller
/// wraps in the artifact transaction.
pub async fn link_tiles(
    gml_db: &Path,
    osm_db: &Path,
    conn: &mut SqliteConnection,
    opts: &LinkOptions,
) -> Result<LinkSummary, BuildError> {
    opts.params.validate()?;

    let gml = GmlCentroidDb::open(gml_db, &opts.read).await?;
    let osm = match OsmCandidateDb::open(osm_db, &opts.read, &[]).await {
        Ok(osm) => osm,
        Err(err) => {
            gml.close().await;
            return Err(err.into());
        }
    };
    let result = link_with(&gml, &osm, conn, opts).await;
    gml.close().await;
    osm.close().await;
    result
}

async fn link_with(
    gml: &GmlCentroidDb,
    osm: &OsmCandidateDb,
    conn: &mut SqliteConnection,
    opts: &LinkOptions,
) -> Result<LinkSummary, BuildError> {
    // The local table already carries the origin shift; GML must follow.
    let shift = osm.is_local().then_some(opts.origin);
    info!(
        osm_table = osm.table(),
        osm_rows = osm.count().await?,
        gml_rows = gml.count().await?,
        shifted = shift.is_some(),
        radius_m = opts.params.search_radius_m,
        "linking GML centroids to OSM buildings"
    );

    create_link_table(&mut *conn).await?;

    let tiles = group_tiles(gml.tiles().await?);
    if tiles.is_empty() {
        warn!(gml_db = %gml.path().display(), "GML centroid table is empty; link table has no rows");
    }

    let total = tiles.len();
    let mut summary = LinkSummary::default();
    for (i, (key, stored)) in tiles.iter().enumerate() {
        let mut centroids = load_tile(gml, key, stored).await?;
        if let Some(origin) = &shift {
            centroids = centroids.iter().map(|c| c.shifted(origin)).collect();
        }

        let Some(extent) = BBox::enclosing(centroids.iter().map(|c| (c.cx, c.cy))) else {
            warn!(tile = %key, "tile has no centroids");
            summary.record_tile(&[], opts.suspicious_dist_m);
            continue;
        };
        let candidates = osm
            .candidates_in(&extent.expanded(opts.params.search_radius_m))
            .await?;
        let rows = match_tile(&centroids, &candidates, &opts.params)?;
        insert_links(&mut *conn, &rows).await?;

        let before = summary;
        summary.record_tile(&rows, opts.suspicious_dist_m);
        let matched = summary.matched - before.matched;
        let n = i + 1;
        if i < DETAILED_TILES {
            info!(
                tile = %key,
                gml = centroids.len(),
                candidates = candidates.len(),
                matched,
                unmatched = rows.len() - matched,
                "tile linked"
            );
        } else if n % PROGRESS_EVERY == 0 || n == total {
            info!(done = n, total, matched = summary.matched, "linking progress");
        } else {
            debug!(tile = %key, matched, "tile linked");
        }
    }

    info!(
        tiles = summary.tiles,
        buildings = summary.gml_buildings,
        matched = summary.matched,
        unmatched = summary.unmatched,
        suspicious = summary.suspicious,
        match_rate = summary.match_rate(),
        "linking finished"
    );
    Ok(summary)
}
