//! JSON build report written next to the link database.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use gmlink_adapters::SourceKind;
use gmlink_core::{LinkSummary, MatchParams, WorldOrigin};
use gmlink_storage::{file_sha256, write_file_atomic};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::graph::{ArtifactId, StaleReason};
use crate::BuildError;

pub const REPORT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RebuiltArtifact {
    pub id: ArtifactId,
    pub reason: StaleReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportParams {
    pub matching: MatchParams,
    pub origin: WorldOrigin,
    pub suspicious_dist_m: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: ArtifactId,
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildReport {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub gpkg: PathBuf,
    pub gml_source: Option<SourceKind>,
    pub params: ReportParams,
    pub rebuilt: Vec<RebuiltArtifact>,
    pub summary: LinkSummary,
    pub match_rate: f64,
    pub artifacts: Vec<ManifestEntry>,
}

pub async fn manifest_entry(id: ArtifactId, path: &Path) -> Result<ManifestEntry, BuildError> {
    let sha256 = file_sha256(path).await?;
    let bytes = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("stat {}", path.display()))?
        .len();
    Ok(ManifestEntry {
        id,
        path: path.to_path_buf(),
        sha256,
        bytes,
    })
}

pub async fn write_report(path: &Path, report: &BuildReport) -> Result<(), BuildError> {
    let bytes = serde_json::to_vec_pretty(report).context("serializing build report")?;
    write_file_atomic(path, &bytes).await?;
    Ok(())
}

pub async fn read_report(path: &Path) -> Result<BuildReport, BuildError> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let report = serde_json::from_slice(&bytes)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(report)
}
