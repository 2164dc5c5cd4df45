//! Explicit dependency graph of the three link artifacts and the staleness
//! rules that decide what to rebuild.
//!
//! Everything here is pure apart from [`FsProbe`]; tests drive the planner
//! through a fake [`ArtifactProbe`].

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use gmlink_storage::modified_time;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use walkdir::WalkDir;

use crate::stamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactId {
    OsmDb,
    GmlDb,
    LinkDb,
}

impl ArtifactId {
    pub fn as_str(self) -> &'static str {
        match self {
            ArtifactId::OsmDb => "osm_db",
            ArtifactId::GmlDb => "gml_db",
            ArtifactId::LinkDb => "link_db",
        }
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactInput {
    File(PathBuf),
    /// Latest mtime of any file below `path` with one of `extensions`.
    Directory {
        path: PathBuf,
        extensions: Vec<String>,
    },
    Artifact(ArtifactId),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactNode {
    pub id: ArtifactId,
    pub path: PathBuf,
    pub inputs: Vec<ArtifactInput>,
    /// Parameter fingerprint; `None` disables the parameter check.
    pub fingerprint: Option<String>,
}

impl ArtifactNode {
    pub fn new(id: ArtifactId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            inputs: Vec::new(),
            fingerprint: None,
        }
    }

    pub fn input(mut self, input: ArtifactInput) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn fingerprint(mut self, fingerprint: Option<String>) -> Self {
        self.fingerprint = fingerprint;
        self
    }

    pub fn upstream(&self) -> impl Iterator<Item = ArtifactId> + '_ {
        self.inputs.iter().filter_map(|input| match input {
            ArtifactInput::Artifact(id) => Some(*id),
            _ => None,
        })
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("artifact {0} declared twice")]
    Duplicate(ArtifactId),
    #[error("artifact {artifact} depends on undeclared artifact {missing}")]
    UnknownDependency {
        artifact: ArtifactId,
        missing: ArtifactId,
    },
    #[error("dependency cycle between {0:?}")]
    Cycle(Vec<ArtifactId>),
    #[error("artifact {0} is not part of the graph")]
    UnknownArtifact(ArtifactId),
}

/// Why an artifact must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum StaleReason {
    Forced,
    Missing,
    UpstreamRebuilt { upstream: ArtifactId },
    InputNewer { input: PathBuf },
    ParamsChanged,
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::Forced => f.write_str("forced"),
            StaleReason::Missing => f.write_str("missing"),
            StaleReason::UpstreamRebuilt { upstream } => write!(f, "upstream {upstream} rebuilt"),
            StaleReason::InputNewer { input } => write!(f, "input newer: {}", input.display()),
            StaleReason::ParamsChanged => f.write_str("parameters changed"),
        }
    }
}

/// Filesystem facts the planner needs.
pub trait ArtifactProbe: Send + Sync {
    fn modified(&self, path: &Path) -> Option<SystemTime>;

    /// Newest mtime among files directly inside `dir` whose extension is in
    /// `extensions` (case-insensitive). `None` when nothing matches.
    fn latest_modified(&self, dir: &Path, extensions: &[String]) -> Option<SystemTime>;

    /// Fingerprint recorded next to the artifact when it was last built.
    fn stamp(&self, artifact: &Path) -> Option<String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FsProbe;

impl ArtifactProbe for FsProbe {
    fn modified(&self, path: &Path) -> Option<SystemTime> {
        modified_time(path)
    }

    fn latest_modified(&self, dir: &Path, extensions: &[String]) -> Option<SystemTime> {
        WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| extensions.iter().any(|want| want.eq_ignore_ascii_case(e)))
                    .unwrap_or(false)
            })
            .filter_map(|entry| entry.metadata().ok()?.modified().ok())
            .max()
    }

    fn stamp(&self, artifact: &Path) -> Option<String> {
        stamp::read_fingerprint(artifact)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanStep {
    pub id: ArtifactId,
    pub path: PathBuf,
    /// `None` means up to date.
    pub reason: Option<StaleReason>,
}

#[derive(Debug, Clone, Default)]
pub struct ArtifactGraph {
    nodes: BTreeMap<ArtifactId, ArtifactNode>,
}

impl ArtifactGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: ArtifactNode) -> Result<(), GraphError> {
        if self.nodes.contains_key(&node.id) {
            return Err(GraphError::Duplicate(node.id));
        }
        self.nodes.insert(node.id, node);
        Ok(())
    }

    pub fn node(&self, id: ArtifactId) -> Result<&ArtifactNode, GraphError> {
        self.nodes.get(&id).ok_or(GraphError::UnknownArtifact(id))
    }

    /// Dependencies before dependents; ties broken by [`ArtifactId`] order.
    pub fn topo_order(&self) -> Result<Vec<ArtifactId>, GraphError> {
        let mut indegree: BTreeMap<ArtifactId, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<ArtifactId, Vec<ArtifactId>> = BTreeMap::new();
        for node in self.nodes.values() {
            indegree.entry(node.id).or_default();
            for upstream in node.upstream() {
                if !self.nodes.contains_key(&upstream) {
                    return Err(GraphError::UnknownDependency {
                        artifact: node.id,
                        missing: upstream,
                    });
                }
                *indegree.entry(node.id).or_default() += 1;
                dependents.entry(upstream).or_default().push(node.id);
            }
        }

        let mut ready: VecDeque<ArtifactId> = indegree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(id) = ready.pop_front() {
            order.push(id);
            let mut unlocked = Vec::new();
            for dependent in dependents.get(&id).into_iter().flatten() {
                if let Some(n) = indegree.get_mut(dependent) {
                    *n -= 1;
                    if *n == 0 {
                        unlocked.push(*dependent);
                    }
                }
            }
            unlocked.sort();
            ready.extend(unlocked);
        }

        if order.len() != self.nodes.len() {
            let placed: BTreeSet<_> = order.iter().copied().collect();
            let cycle = self
                .nodes
                .keys()
                .filter(|id| !placed.contains(id))
                .copied()
                .collect();
            return Err(GraphError::Cycle(cycle));
        }
        Ok(order)
    }

    /// Staleness of one artifact. Checks run in a fixed order and the first
    /// hit wins. Inputs that do not exist are ignored here; their producer
    /// reports them.
    pub fn stale_reason(
        &self,
        id: ArtifactId,
        probe: &dyn ArtifactProbe,
        rebuilt: &BTreeSet<ArtifactId>,
        forced: bool,
    ) -> Result<Option<StaleReason>, GraphError> {
        let node = self.node(id)?;
        if forced {
            return Ok(Some(StaleReason::Forced));
        }
        let Some(built_at) = probe.modified(&node.path) else {
            return Ok(Some(StaleReason::Missing));
        };
        if let Some(upstream) = node.upstream().find(|u| rebuilt.contains(u)) {
            return Ok(Some(StaleReason::UpstreamRebuilt { upstream }));
        }
        for input in &node.inputs {
            let (path, mtime) = match input {
                ArtifactInput::File(path) => (path.clone(), probe.modified(path)),
                ArtifactInput::Directory { path, extensions } => {
                    (path.clone(), probe.latest_modified(path, extensions))
                }
                ArtifactInput::Artifact(upstream) => {
                    let path = self.node(*upstream)?.path.clone();
                    let mtime = probe.modified(&path);
                    (path, mtime)
                }
            };
            if mtime.is_some_and(|m| m > built_at) {
                return Ok(Some(StaleReason::InputNewer { input: path }));
            }
        }
        if let Some(expected) = &node.fingerprint {
            // Artifacts without a stamp were built elsewhere; mtimes decide.
            if let Some(recorded) = probe.stamp(&node.path) {
                if &recorded != expected {
                    return Ok(Some(StaleReason::ParamsChanged));
                }
            }
        }
        Ok(None)
    }

    /// Walk the graph in build order, assuming every stale artifact will be
    /// rebuilt.
    pub fn plan(
        &self,
        probe: &dyn ArtifactProbe,
        forced: &BTreeSet<ArtifactId>,
    ) -> Result<Vec<PlanStep>, GraphError> {
        let mut rebuilt = BTreeSet::new();
        let mut steps = Vec::with_capacity(self.nodes.len());
        for id in self.topo_order()? {
            let reason = self.stale_reason(id, probe, &rebuilt, forced.contains(&id))?;
            if reason.is_some() {
                rebuilt.insert(id);
            }
            steps.push(PlanStep {
                id,
                path: self.node(id)?.path.clone(),
                reason,
            });
        }
        Ok(steps)
    }
}
