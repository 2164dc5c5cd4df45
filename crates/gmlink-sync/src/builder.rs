//! `ensure_link_dbs`: bring the OSM, GML and link databases up to date in
//! dependency order.

use std::collections::BTreeSet;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use gmlink_adapters::{
    CentroidSource, ExtractError, FallbackSource, FileBasedSource, GpkgOsmExtractor,
    CITYGML_EXTENSIONS,
};
use gmlink_core::LinkSummary;
use gmlink_storage::tables::{build_osm_local_table, create_gml_table, insert_gml_centroids};
use gmlink_storage::{ArtifactLock, LinkReader, StagedDb};
use serde::Serialize;
use sqlx::Connection;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{resolve_gpkg_path, LinkConfig};
use crate::graph::{
    ArtifactGraph, ArtifactId, ArtifactInput, ArtifactNode, ArtifactProbe, FsProbe, PlanStep,
    StaleReason,
};
use crate::linker::{link_tiles, LinkOptions};
use crate::report::{
    manifest_entry, write_report, BuildReport, RebuiltArtifact, ReportParams,
    REPORT_SCHEMA_VERSION,
};
use crate::stamp::{fingerprint, write_stamp, GmlParams, LinkParams, OsmParams};
use crate::BuildError;

pub const LINKS_SUBDIR: &str = "links";
pub const GML_DB_FILE: &str = "gml_building_centroids.sqlite";

/// Deterministic artifact locations for one GeoPackage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkPaths {
    pub gpkg: PathBuf,
    pub links_dir: PathBuf,
    pub osm_db: PathBuf,
    pub gml_db: PathBuf,
    pub link_db: PathBuf,
    pub report: PathBuf,
}

impl LinkPaths {
    pub fn derive(gpkg: &Path, gml_dir: Option<&Path>, out_dir: &Path) -> Self {
        let links_dir = out_dir.join(LINKS_SUBDIR);
        let stem = gpkg
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "links".to_string());
        let gml_db = match gml_dir {
            Some(dir) => dir.join(GML_DB_FILE),
            None => links_dir.join(GML_DB_FILE),
        };
        Self {
            gpkg: gpkg.to_path_buf(),
            osm_db: links_dir.join(format!("{stem}_linkdb.sqlite")),
            link_db: links_dir.join(format!("{stem}_links.sqlite")),
            report: links_dir.join(format!("{stem}_links.report.json")),
            gml_db,
            links_dir,
        }
    }

    pub fn artifact(&self, id: ArtifactId) -> &Path {
        match id {
            ArtifactId::OsmDb => &self.osm_db,
            ArtifactId::GmlDb => &self.gml_db,
            ArtifactId::LinkDb => &self.link_db,
        }
    }
}

/// Result of a successful `ensure_link_dbs` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkArtifacts {
    pub osm_db: PathBuf,
    pub gml_db: PathBuf,
    pub link_db: PathBuf,
    pub report: PathBuf,
    pub rebuilt: Vec<RebuiltArtifact>,
    pub summary: LinkSummary,
}

impl LinkArtifacts {
    pub fn paths(&self) -> (PathBuf, PathBuf, PathBuf) {
        (self.osm_db.clone(), self.gml_db.clone(), self.link_db.clone())
    }

    pub fn was_rebuilt(&self, id: ArtifactId) -> bool {
        self.rebuilt.iter().any(|r| r.id == id)
    }
}

async fn with_timeout<T, F>(what: &str, limit: Duration, fut: F) -> Result<T, ExtractError>
where
    F: Future<Output = Result<T, ExtractError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExtractError::Timeout {
            what: what.to_string(),
            secs: limit.as_secs(),
        }),
    }
}

pub struct LinkBuilder {
    config: LinkConfig,
    probe: Box<dyn ArtifactProbe>,
    forced: BTreeSet<ArtifactId>,
}

impl LinkBuilder {
    pub fn new(config: LinkConfig) -> Result<Self, BuildError> {
        config.validate()?;
        Ok(Self {
            config,
            probe: Box::new(FsProbe),
            forced: BTreeSet::new(),
        })
    }

    pub fn with_probe(mut self, probe: Box<dyn ArtifactProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Rebuild `id` (and therefore everything downstream) regardless of
    /// mtimes.
    pub fn force(mut self, id: ArtifactId) -> Self {
        self.forced.insert(id);
        self
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn paths(&self) -> Result<LinkPaths, BuildError> {
        let raw = self
            .config
            .gpkg_path
            .as_deref()
            .ok_or_else(|| BuildError::Config("gpkg_path is required for linking".into()))?;
        let gpkg = resolve_gpkg_path(raw)?;
        if gpkg != raw {
            info!(requested = %raw.display(), resolved = %gpkg.display(), "resolved GeoPackage");
        }
        Ok(LinkPaths::derive(
            &gpkg,
            self.config.gml_dir.as_deref(),
            &self.config.out_dir,
        ))
    }

    /// The configured centroid source. The scene snapshot is used only when
    /// no CityGML folder is configured and the fallback is switched on.
    pub fn centroid_source(&self) -> Option<Box<dyn CentroidSource>> {
        if let Some(dir) = &self.config.gml_dir {
            return Some(Box::new(
                FileBasedSource::new(dir).with_building_parts(self.config.include_building_parts),
            ));
        }
        match (&self.config.scene_snapshot, self.config.allow_scene_fallback) {
            (Some(snapshot), true) => Some(Box::new(FallbackSource::new(snapshot))),
            _ => None,
        }
    }

    fn missing_source(&self) -> ExtractError {
        let missing = if self.config.allow_scene_fallback {
            "no CityGML directory configured and scene fallback is enabled but scene_snapshot is not set"
        } else {
            "no CityGML directory configured (set gml_dir, or enable allow_scene_fallback with a scene_snapshot)"
        };
        ExtractError::Unavailable(missing.to_string())
    }

    fn graph(
        &self,
        paths: &LinkPaths,
        source: Option<&dyn CentroidSource>,
    ) -> Result<ArtifactGraph, BuildError> {
        let config = &self.config;
        let mut graph = ArtifactGraph::new();

        graph.add(
            ArtifactNode::new(ArtifactId::OsmDb, &paths.osm_db)
                .input(ArtifactInput::File(paths.gpkg.clone()))
                .fingerprint(Some(fingerprint(&OsmParams {
                    gpkg: &paths.gpkg,
                    layer: config.osm_layer.as_deref(),
                    semantic_columns: &config.semantic_columns,
                    origin: config.world_origin,
                }))),
        )?;

        let mut gml = ArtifactNode::new(ArtifactId::GmlDb, &paths.gml_db);
        if let Some(source) = source {
            let input = match (&config.gml_dir, &config.scene_snapshot) {
                (Some(dir), _) => {
                    gml = gml.input(ArtifactInput::Directory {
                        path: dir.clone(),
                        extensions: CITYGML_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
                    });
                    dir.as_path()
                }
                (None, Some(snapshot)) => {
                    gml = gml.input(ArtifactInput::File(snapshot.clone()));
                    snapshot.as_path()
                }
                (None, None) => Path::new(""),
            };
            gml = gml.fingerprint(Some(fingerprint(&GmlParams {
                source: source.kind(),
                input,
                include_building_parts: config.include_building_parts,
            })));
        }
        graph.add(gml)?;

        graph.add(
            ArtifactNode::new(ArtifactId::LinkDb, &paths.link_db)
                .input(ArtifactInput::Artifact(ArtifactId::OsmDb))
                .input(ArtifactInput::Artifact(ArtifactId::GmlDb))
                .fingerprint(Some(fingerprint(&LinkParams {
                    matching: config.match_params(),
                    origin: config.world_origin,
                }))),
        )?;
        Ok(graph)
    }

    /// What `ensure_link_dbs` would rebuild, and why, without building.
    pub fn plan(&self) -> Result<Vec<PlanStep>, BuildError> {
        let paths = self.paths()?;
        let source = self.centroid_source();
        let graph = self.graph(&paths, source.as_deref())?;
        Ok(graph.plan(self.probe.as_ref(), &self.forced)?)
    }

    pub async fn ensure_link_dbs(&self) -> Result<LinkArtifacts, BuildError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("ensure_link_dbs", %run_id);
        self.run(run_id, started_at).instrument(span).await
    }

    async fn run(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
    ) -> Result<LinkArtifacts, BuildError> {
        let paths = self.paths()?;
        tokio::fs::create_dir_all(&paths.links_dir)
            .await
            .with_context(|| format!("creating {}", paths.links_dir.display()))?;
        info!(links_dir = %paths.links_dir.display(), link_db = %paths.link_db.display(), "link artifacts");

        let source = self.centroid_source();
        let graph = self.graph(&paths, source.as_deref())?;

        let mut rebuilt_ids = BTreeSet::new();
        let mut rebuilt = Vec::new();
        let mut summary = None;
        for id in graph.topo_order()? {
            let span = info_span!("artifact", %id);
            let reason = self
                .ensure_artifact(&graph, id, &paths, source.as_deref(), &rebuilt_ids, &mut summary)
                .instrument(span)
                .await?;
            if let Some(reason) = reason {
                rebuilt_ids.insert(id);
                rebuilt.push(RebuiltArtifact { id, reason });
            }
        }

        let stored_summary = self.verify_link_db(&paths.link_db).await?;
        let summary = summary.unwrap_or(stored_summary);

        if !rebuilt.is_empty() || !paths.report.exists() {
            let report = BuildReport {
                schema_version: REPORT_SCHEMA_VERSION,
                run_id,
                started_at,
                finished_at: Utc::now(),
                gpkg: paths.gpkg.clone(),
                gml_source: source.as_ref().map(|s| s.kind()),
                params: ReportParams {
                    matching: self.config.match_params(),
                    origin: self.config.world_origin,
                    suspicious_dist_m: self.config.suspicious_dist_m,
                },
                rebuilt: rebuilt.clone(),
                summary,
                match_rate: summary.match_rate(),
                artifacts: vec![
                    manifest_entry(ArtifactId::OsmDb, &paths.osm_db).await?,
                    manifest_entry(ArtifactId::GmlDb, &paths.gml_db).await?,
                    manifest_entry(ArtifactId::LinkDb, &paths.link_db).await?,
                ],
            };
            write_report(&paths.report, &report).await?;
        }

        if rebuilt.is_empty() {
            info!("all link artifacts up to date");
        }
        Ok(LinkArtifacts {
            osm_db: paths.osm_db,
            gml_db: paths.gml_db,
            link_db: paths.link_db,
            report: paths.report,
            rebuilt,
            summary,
        })
    }

    async fn ensure_artifact(
        &self,
        graph: &ArtifactGraph,
        id: ArtifactId,
        paths: &LinkPaths,
        source: Option<&dyn CentroidSource>,
        rebuilt: &BTreeSet<ArtifactId>,
        summary: &mut Option<LinkSummary>,
    ) -> Result<Option<StaleReason>, BuildError> {
        let probe = self.probe.as_ref();
        let forced = self.forced.contains(&id);
        let node = graph.node(id)?;
        if graph.stale_reason(id, probe, rebuilt, forced)?.is_none() {
            info!(path = %node.path.display(), "up to date");
            return Ok(None);
        }

        let _lock = ArtifactLock::acquire(&node.path, &self.config.lock_options()).await?;
        // A concurrent run may have finished this artifact while we waited.
        let Some(reason) = graph.stale_reason(id, probe, rebuilt, forced)? else {
            info!(path = %node.path.display(), "built by a concurrent run");
            return Ok(None);
        };
        info!(path = %node.path.display(), %reason, "rebuilding");

        match id {
            ArtifactId::OsmDb => self.build_osm_db(paths).await?,
            ArtifactId::GmlDb => {
                let source = source.ok_or_else(|| self.missing_source())?;
                self.build_gml_db(paths, source).await?;
            }
            ArtifactId::LinkDb => *summary = Some(self.build_link_db(paths).await?),
        }
        if let Some(fingerprint) = &node.fingerprint {
            write_stamp(&node.path, id, fingerprint).await?;
        }
        Ok(Some(reason))
    }

    async fn build_osm_db(&self, paths: &LinkPaths) -> Result<(), BuildError> {
        let config = &self.config;
        let extractor = GpkgOsmExtractor::new(&paths.gpkg, config.semantic_columns.clone())
            .with_layer(config.osm_layer.clone())
            .with_read_options(config.read_options());

        let mut staged = StagedDb::create(&paths.osm_db).await?;
        let mut tx = staged.conn().begin().await?;
        let stats = with_timeout(
            "GeoPackage extraction",
            config.extract_timeout(),
            extractor.extract_into(&mut *tx),
        )
        .await?;
        let local = build_osm_local_table(&mut *tx, &config.world_origin, &stats.semantic_columns).await?;
        tx.commit().await?;
        let path = staged.persist().await?;
        info!(
            path = %path.display(),
            layer = %stats.layer,
            rows = stats.rows,
            skipped_ids = stats.skipped_ids,
            local_rows = local.rows,
            "OSM database built"
        );
        Ok(())
    }

    async fn build_gml_db(
        &self,
        paths: &LinkPaths,
        source: &dyn CentroidSource,
    ) -> Result<(), BuildError> {
        let kind = source.kind();
        if kind.is_degraded() {
            warn!(source = %source.describe(), "GML centroids come from the degraded scene fallback");
        }
        let centroids = with_timeout(
            &source.describe(),
            self.config.extract_timeout(),
            source.load_centroids(),
        )
        .await?;

        let mut staged = StagedDb::create(&paths.gml_db).await?;
        let mut tx = staged.conn().begin().await?;
        create_gml_table(&mut *tx).await?;
        let rows = insert_gml_centroids(&mut *tx, &centroids).await?;
        tx.commit().await?;
        let path = staged.persist().await?;
        info!(
            path = %path.display(),
            source = ?kind,
            rows,
            "GML centroid database built"
        );
        Ok(())
    }

    async fn build_link_db(&self, paths: &LinkPaths) -> Result<LinkSummary, BuildError> {
        let opts = LinkOptions {
            params: self.config.match_params(),
            origin: self.config.world_origin,
            suspicious_dist_m: self.config.suspicious_dist_m,
            read: self.config.read_options(),
        };
        let mut staged = StagedDb::create(&paths.link_db).await?;
        let mut tx = staged.conn().begin().await?;
        let summary = link_tiles(&paths.gml_db, &paths.osm_db, &mut tx, &opts).await?;
        tx.commit().await?;
        let path = staged.persist().await?;
        info!(path = %path.display(), rows = summary.gml_buildings, "link database built");
        Ok(summary)
    }

    /// The link database must exist, be non-empty and carry the link table.
    /// Returns the summary of the stored rows.
    async fn verify_link_db(&self, link_db: &Path) -> Result<LinkSummary, BuildError> {
        let size = match tokio::fs::metadata(link_db).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(BuildError::Verification(format!(
                    "link database was not created at {}",
                    link_db.display()
                )))
            }
        };
        if size == 0 {
            return Err(BuildError::Verification(format!(
                "link database {} is empty",
                link_db.display()
            )));
        }
        let reader = LinkReader::open(link_db, &self.config.read_options())
            .await
            .map_err(|e| BuildError::Verification(format!("{}: {e}", link_db.display())))?;
        let summary = reader.summary(self.config.suspicious_dist_m).await;
        reader.close().await;
        let summary = summary?;
        info!(path = %link_db.display(), bytes = size, rows = summary.gml_buildings, "link database verified");
        Ok(summary)
    }
}

/// Build or refresh the three link databases using configuration from the
/// environment, returning `(osm_db, gml_db, link_db)`.
pub async fn ensure_link_dbs(
    gpkg_path: &Path,
    gml_dir: Option<&Path>,
    out_dir: &Path,
) -> Result<(PathBuf, PathBuf, PathBuf), BuildError> {
    let mut config = LinkConfig::from_env();
    config.gpkg_path = Some(gpkg_path.to_path_buf());
    config.gml_dir = gml_dir.map(Path::to_path_buf);
    config.out_dir = out_dir.to_path_buf();
    let artifacts = LinkBuilder::new(config)?.ensure_link_dbs().await?;
    Ok(artifacts.paths())
}
