use std::path::{Path, PathBuf};

use gmlink_adapters::{
    CentroidSource, ExtractError, FallbackSource, FileBasedSource, GpkgOsmExtractor, SourceKind,
};
use gmlink_core::SemanticValue;
use gmlink_storage::tables::{table_columns, OSM_WORLD_TABLE};
use gmlink_storage::StagedDb;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{ConnectOptions, Connection, Row};

fn fixtures() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

/// Minimal GeoPackage: the metadata table, a building layer with text ids
/// and a plain table standing in for the R*Tree index.
async fn write_gpkg(path: &Path) {
    let mut conn = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .connect()
        .await
        .unwrap();
    for sql in [
        "CREATE TABLE gpkg_geometry_columns (table_name TEXT, column_name TEXT, geometry_type_name TEXT, srs_id INTEGER, z INTEGER, m INTEGER)",
        "INSERT INTO gpkg_geometry_columns VALUES ('city__points', 'geom', 'POINT', 25832, 0, 0)",
        "INSERT INTO gpkg_geometry_columns VALUES ('city__multipolygons', 'geom', 'MULTIPOLYGON', 25832, 0, 0)",
        "CREATE TABLE city__points (fid INTEGER PRIMARY KEY, geom BLOB, name TEXT)",
        "CREATE TABLE city__multipolygons (fid INTEGER PRIMARY KEY, geom BLOB, osm_id TEXT, osm_way_id TEXT, name TEXT, building TEXT, amenity TEXT)",
        "CREATE TABLE rtree_city__multipolygons_geom (id INTEGER PRIMARY KEY, minx REAL, maxx REAL, miny REAL, maxy REAL)",
        "INSERT INTO city__multipolygons VALUES (1, NULL, NULL, '11', 'Dom', 'cathedral', NULL)",
        "INSERT INTO city__multipolygons VALUES (2, NULL, NULL, '12', NULL, 'yes', 'school')",
        "INSERT INTO city__multipolygons VALUES (3, NULL, '99', NULL, 'relation only', 'yes', NULL)",
        "INSERT INTO city__multipolygons VALUES (4, NULL, NULL, 'not-a-number', NULL, 'yes', NULL)",
        "INSERT INTO rtree_city__multipolygons_geom VALUES (1, 356096, 356104, 5645196, 5645204)",
        "INSERT INTO rtree_city__multipolygons_geom VALUES (2, 356500, 356510, 5645500, 5645510)",
        "INSERT INTO rtree_city__multipolygons_geom VALUES (3, 0, 1, 0, 1)",
        "INSERT INTO rtree_city__multipolygons_geom VALUES (4, 0, 1, 0, 1)",
    ] {
        sqlx::query(sql).execute(&mut conn).await.unwrap();
    }
    conn.close().await.unwrap();
}

#[tokio::test]
async fn geopackage_layer_is_extracted_with_rtree_centroids() {
    let dir = tempfile::tempdir().unwrap();
    let gpkg = dir.path().join("city_READONLY.gpkg");
    write_gpkg(&gpkg).await;

    let out = dir.path().join("city_linkdb.sqlite");
    let mut staged = StagedDb::create(&out).await.unwrap();
    let extractor = GpkgOsmExtractor::new(
        &gpkg,
        vec!["name".into(), "building".into(), "height".into()],
    );
    let stats = extractor.extract_into(staged.conn()).await.unwrap();
    assert_eq!(stats.layer, "city__multipolygons");
    assert_eq!(stats.rows, 2);
    assert_eq!(stats.skipped_ids, 1);
    assert_eq!(stats.semantic_columns, vec!["name".to_string(), "building".to_string()]);

    let columns = table_columns(&mut *staged.conn(), OSM_WORLD_TABLE).await.unwrap();
    assert!(columns.contains(&"name".to_string()));
    assert!(!columns.contains(&"height".to_string()));

    let rows = sqlx::query(&format!(
        "SELECT osm_way_id, cx, cy, minx, name FROM {OSM_WORLD_TABLE} ORDER BY osm_way_id"
    ))
    .fetch_all(&mut *staged.conn())
    .await
    .unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get::<i64, _>("osm_way_id"), 11);
    assert_eq!(rows[0].get::<f64, _>("cx"), 356_100.0);
    assert_eq!(rows[0].get::<f64, _>("cy"), 5_645_200.0);
    assert_eq!(rows[0].get::<f64, _>("minx"), 356_096.0);
    assert_eq!(rows[0].get::<Option<String>, _>("name").as_deref(), Some("Dom"));
    assert_eq!(rows[1].get::<Option<String>, _>("name"), None);
}

#[tokio::test]
async fn unknown_layer_and_missing_file_are_reported() {
    let dir = tempfile::tempdir().unwrap();
    let gpkg = dir.path().join("city.gpkg");
    write_gpkg(&gpkg).await;
    let out = dir.path().join("out.sqlite");

    let mut staged = StagedDb::create(&out).await.unwrap();
    let err = GpkgOsmExtractor::new(&gpkg, vec![])
        .with_layer(Some("nope".into()))
        .extract_into(staged.conn())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::UnknownLayer { .. }));

    let err = GpkgOsmExtractor::new(dir.path().join("missing.gpkg"), vec![])
        .extract_into(staged.conn())
        .await
        .unwrap_err();
    assert!(matches!(err, ExtractError::MissingGeoPackage(_)));
}

#[tokio::test]
async fn citygml_folder_yields_keyed_centroids_per_tile() {
    let source = FileBasedSource::new(fixtures().join("citygml"));
    assert_eq!(source.kind(), SourceKind::CityGml);
    let rows = source.load_centroids().await.unwrap();
    assert_eq!(rows.len(), 3);

    let keys = rows
        .iter()
        .map(|r| (r.source_tile.as_str(), r.building_idx))
        .collect::<Vec<_>>();
    assert_eq!(
        keys,
        vec![("LoD2_356_5645", 0), ("LoD2_356_5645", 1), ("LoD2_357_5645", 0)]
    );
    assert_eq!((rows[0].cx, rows[0].cy), (356_100.0, 5_645_200.0));
    assert_eq!(rows[0].gml_id.as_deref(), Some("DENW_356_5645_A"));
    assert_eq!((rows[2].cx, rows[2].cy), (357_205.0, 5_645_305.0));
}

#[tokio::test]
async fn empty_folder_and_colliding_tiles_are_errors() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "not a tile").unwrap();
    let err = FileBasedSource::new(dir.path()).load_centroids().await.unwrap_err();
    assert!(matches!(err, ExtractError::NoTiles(_)));

    let tile = std::fs::read(fixtures().join("citygml/LoD2_357_5645.xml")).unwrap();
    std::fs::write(dir.path().join("LoD2_1.gml"), &tile).unwrap();
    std::fs::write(dir.path().join("LoD2_1.xml"), &tile).unwrap();
    let err = FileBasedSource::new(dir.path()).load_centroids().await.unwrap_err();
    assert!(matches!(err, ExtractError::DuplicateTile { .. }));
}

#[tokio::test]
async fn scene_snapshot_fallback_reports_degraded_kind() {
    let source = FallbackSource::new(fixtures().join("scene/snapshot.json"));
    assert!(source.kind().is_degraded());
    let rows = source.load_centroids().await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].source_tile, "LoD2_356_5645");
    assert_eq!((rows[0].cx, rows[0].cy), (356_100.0, 5_645_200.0));
}

#[test]
fn semantic_values_serialize_as_plain_json_scalars() {
    let value = serde_json::to_string(&[
        SemanticValue::Null,
        SemanticValue::Integer(3),
        SemanticValue::Text("Dom".into()),
    ])
    .unwrap();
    assert_eq!(value, "[null,3,\"Dom\"]");
}
