//! Build orchestration for the GML ↔ OSM link databases: configuration,
//! the artifact graph, the linking stage and the build report.

use gmlink_adapters::ExtractError;
use gmlink_core::MatchError;
use gmlink_storage::StoreError;
use thiserror::Error;

pub mod builder;
pub mod config;
pub mod graph;
pub mod linker;
pub mod report;
pub mod stamp;

pub use builder::{ensure_link_dbs, LinkArtifacts, LinkBuilder, LinkPaths, GML_DB_FILE};
pub use config::{resolve_gpkg_path, LinkConfig};
pub use graph::{ArtifactGraph, ArtifactId, ArtifactProbe, FsProbe, PlanStep, StaleReason};
pub use report::{BuildReport, RebuiltArtifact};

pub const CRATE_NAME: &str = "gmlink-sync";

#[derive(Debug, Error)]
pub enum BuildError {
    /// Bad or missing settings, or an input table without the required
    /// columns. Raised before any artifact is replaced.
    #[error("configuration error: {0}")]
    Config(String),
    #[error("extraction failed: {0}")]
    Extraction(#[from] ExtractError),
    #[error(transparent)]
    Store(StoreError),
    #[error("matching failed: {0}")]
    Match(#[from] MatchError),
    /// A build reported success but the artifact is missing, empty or
    /// unreadable.
    #[error("artifact verification failed: {0}")]
    Verification(String),
    #[error("artifact graph: {0}")]
    Graph(#[from] graph::GraphError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for BuildError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MissingTable(_) | StoreError::MissingColumns { .. } => {
                BuildError::Config(err.to_string())
            }
            other => BuildError::Store(other),
        }
    }
}

impl From<sqlx::Error> for BuildError {
    fn from(err: sqlx::Error) -> Self {
        BuildError::Store(StoreError::Sqlx(err))
    }
}

impl BuildError {
    /// Busy or locked databases; the same call may succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            BuildError::Store(err) => err.is_retryable(),
            BuildError::Extraction(ExtractError::Store(err)) => err.is_retryable(),
            _ => false,
        }
    }
}
