//! Artifact dependency graph.
//!
//! Sidecars declare, per artifact, the command that produces it and the
//! inputs it was produced from. Resolving a set of target sidecars to a
//! fixed point yields a DAG: nodes are artifacts keyed by path, edges run
//! from dependencies to the artifacts computed from them. Dependencies
//! without a sidecar of their own are leaves.

use crate::{
    error::{DvxError, Result},
    hash,
    scm::Scm,
    sidecar::{self, SidecarContent, SidecarInfo},
    utils,
};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

/// A declared input, canonicalized at ingress: a path plus the digest
/// recorded for it, when one is known.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dep {
    pub path: String,
    pub expected_digest: Option<String>,
}

impl Dep {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into(), expected_digest: None }
    }

    pub fn with_digest(path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self { path: path.into(), expected_digest: Some(digest.into()) }
    }
}

/// How an artifact is (or will be) produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Computation {
    /// Opaque shell command.
    pub cmd: String,
    pub deps: Vec<Dep>,
    /// SCM commit the artifact was last computed at.
    pub code_ref: Option<String>,
}

impl Computation {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self { cmd: cmd.into(), deps: Vec::new(), code_ref: None }
    }

    pub fn with_deps(mut self, deps: Vec<Dep>) -> Self {
        self.deps = deps;
        self
    }

    /// Current hashes of all dependencies that exist, keyed by declared path.
    ///
    /// Known digests are reused; everything else is hashed from disk.
    pub fn dep_hashes(&self, base: &Path) -> BTreeMap<String, String> {
        let mut hashes = BTreeMap::new();
        for dep in &self.deps {
            if let Some(digest) = &dep.expected_digest {
                hashes.insert(dep.path.clone(), digest.clone());
                continue;
            }
            let resolved = resolve_in(base, &dep.path);
            if let Ok(out) = hash::hash_path(&resolved) {
                hashes.insert(dep.path.clone(), out.digest);
            }
        }
        hashes
    }
}

/// A node of the graph: a tracked output (or a plain input leaf).
///
/// Identity is the path; two artifacts with equal paths are the same node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artifact {
    pub path: String,
    pub digest: Option<String>,
    pub size: Option<u64>,
    pub is_dir: bool,
    pub computation: Option<Computation>,
}

impl Artifact {
    /// A leaf: existing data with no computation.
    pub fn leaf(path: impl Into<String>) -> Self {
        Self { path: path.into(), digest: None, size: None, is_dir: false, computation: None }
    }

    /// An artifact produced by `computation`.
    pub fn computed(path: impl Into<String>, computation: Computation) -> Self {
        Self {
            path: path.into(),
            digest: None,
            size: None,
            is_dir: false,
            computation: Some(computation),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.computation.is_none()
    }

    /// Loads the artifact from its sidecar; `None` if there is no usable
    /// sidecar for `output`.
    pub fn from_sidecar(output: &Path) -> Result<Option<Self>> {
        let Some(info) = sidecar::read_sidecar(output)? else {
            return Ok(None);
        };
        Ok(Some(Self::from_info(output, &info)))
    }

    /// Builds the node from a parsed sidecar.
    pub fn from_info(output: &Path, info: &SidecarInfo) -> Self {
        let computation = info.has_computation().then(|| Computation {
            cmd: info.cmd.clone().unwrap_or_default(),
            deps: info
                .deps
                .iter()
                .map(|(path, digest)| Dep::with_digest(path.clone(), digest.clone()))
                .collect(),
            code_ref: info.code_ref.clone(),
        });
        Self {
            // keep the caller's path, not the sidecar-relative basename, so
            // cross-directory references stay intact
            path: output.display().to_string(),
            digest: info.digest.clone(),
            size: info.size,
            is_dir: info.is_dir,
            computation,
        }
    }

    /// Writes this artifact's sidecar.
    ///
    /// If the output exists and no digest is known yet, it is hashed; if it
    /// does not exist, a placeholder is written. Dependency hashes and the
    /// current SCM head are recorded alongside the computation.
    pub fn write_sidecar(&self, base: &Path, scm: Option<&dyn Scm>) -> Result<PathBuf> {
        let output = resolve_in(base, &self.path);

        let (digest, size, is_dir, nfiles) = match (&self.digest, output.exists()) {
            (Some(digest), _) => (Some(digest.clone()), self.size, self.is_dir, None),
            (None, true) => {
                let out = hash::hash_path(&output)?;
                (Some(out.digest), Some(out.size), out.is_dir, out.nfiles)
            }
            (None, false) => (None, None, false, None),
        };

        let (cmd, code_ref, deps) = match &self.computation {
            Some(computation) => {
                let code_ref = computation
                    .code_ref
                    .clone()
                    .or_else(|| scm.and_then(Scm::head_sha));
                (Some(computation.cmd.clone()), code_ref, computation.dep_hashes(base))
            }
            None => (None, None, BTreeMap::new()),
        };

        sidecar::write_sidecar(
            &output,
            &SidecarContent {
                digest,
                size,
                is_dir: Some(is_dir || output.is_dir()),
                nfiles,
                cmd,
                code_ref,
                deps,
            },
        )
    }
}

/// The resolved artifact graph.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    nodes: BTreeMap<String, Artifact>,
}

impl Graph {
    /// Resolves the graph reachable from `targets` (output paths or sidecar
    /// paths), following `computation.deps` to a fixed point.
    ///
    /// A target without a sidecar is an error; a *dependency* without a
    /// sidecar becomes a leaf.
    pub fn resolve(targets: &[PathBuf], base: &Path) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        let mut pending: Vec<(PathBuf, bool)> =
            targets.iter().map(|t| (utils::output_path(t), true)).collect();

        while let Some((output, is_target)) = pending.pop() {
            let key = output.display().to_string();
            if nodes.contains_key(&key) {
                continue;
            }

            let resolved = resolve_in(base, &key);
            let artifact = match Artifact::from_sidecar(&resolved)? {
                Some(artifact) => Artifact { path: key.clone(), ..artifact },
                None if is_target => {
                    return Err(DvxError::InvalidSidecar {
                        path: utils::sidecar_path(&resolved),
                        detail: "no .dvc file".into(),
                    });
                }
                None => Artifact::leaf(key.clone()),
            };

            if let Some(computation) = &artifact.computation {
                for dep in &computation.deps {
                    if !nodes.contains_key(&dep.path) {
                        pending.push((PathBuf::from(&dep.path), false));
                    }
                }
            }
            nodes.insert(key, artifact);
        }

        let graph = Self { nodes };
        trace!(nodes = graph.nodes.len(), "artifact graph resolved");
        Ok(graph)
    }

    /// Builds a graph from in-memory artifacts (the prep-phase path), pulling
    /// in the transitive closure of their dependencies as leaves.
    pub fn from_artifacts(artifacts: impl IntoIterator<Item = Artifact>) -> Self {
        let mut nodes: BTreeMap<String, Artifact> = BTreeMap::new();
        for artifact in artifacts {
            nodes.insert(artifact.path.clone(), artifact);
        }
        let dep_paths: Vec<String> = nodes
            .values()
            .filter_map(|a| a.computation.as_ref())
            .flat_map(|c| c.deps.iter().map(|d| d.path.clone()))
            .collect();
        for path in dep_paths {
            nodes.entry(path.clone()).or_insert_with(|| Artifact::leaf(path));
        }
        Self { nodes }
    }

    pub fn node(&self, path: &str) -> Option<&Artifact> {
        self.nodes.get(path)
    }

    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Finds the first dependency cycle, if any, as the list of node paths
    /// forming it.
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = HashSet::new();
        let mut stack = HashSet::new();

        fn visit(
            graph: &Graph,
            node: &str,
            visited: &mut HashSet<String>,
            stack: &mut HashSet<String>,
            path: &mut Vec<String>,
        ) -> Option<Vec<String>> {
            if stack.contains(node) {
                let start = path.iter().position(|p| p == node).unwrap_or_default();
                return Some(path[start..].to_vec());
            }
            if visited.contains(node) {
                return None;
            }
            visited.insert(node.to_string());
            stack.insert(node.to_string());
            path.push(node.to_string());

            if let Some(computation) =
                graph.nodes.get(node).and_then(|a| a.computation.as_ref())
            {
                for dep in &computation.deps {
                    if graph.nodes.contains_key(&dep.path) {
                        if let Some(cycle) = visit(graph, &dep.path, visited, stack, path) {
                            return Some(cycle);
                        }
                    }
                }
            }

            stack.remove(node);
            path.pop();
            None
        }

        for node in self.nodes.keys() {
            if !visited.contains(node.as_str()) {
                let mut path = Vec::new();
                if let Some(cycle) = visit(self, node, &mut visited, &mut stack, &mut path) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    /// Groups computation nodes into execution levels.
    ///
    /// Leaves count as done from the start; every node within one level has
    /// no dependency edge to any other node of that level, so levels are the
    /// unit of concurrency. Fails with `CycleDetected` before any grouping.
    pub fn levels(&self) -> Result<Vec<Vec<&Artifact>>> {
        if let Some(cycle) = self.find_cycle() {
            return Err(DvxError::CycleDetected(cycle));
        }

        let mut done: HashSet<&str> = self
            .nodes
            .values()
            .filter(|a| a.is_leaf())
            .map(|a| a.path.as_str())
            .collect();

        let mut remaining: Vec<&Artifact> =
            self.nodes.values().filter(|a| !a.is_leaf()).collect();
        let mut levels = Vec::new();

        while !remaining.is_empty() {
            let (ready, not_ready): (Vec<&Artifact>, Vec<&Artifact>) =
                remaining.into_iter().partition(|artifact| {
                    artifact
                        .computation
                        .as_ref()
                        .map(|computation| {
                            computation.deps.iter().all(|dep| {
                                done.contains(dep.path.as_str())
                                    || !self.nodes.contains_key(&dep.path)
                            })
                        })
                        .unwrap_or(true)
                });

            // a cycle would have been caught above
            debug_assert!(!ready.is_empty());
            if ready.is_empty() {
                return Err(DvxError::CycleDetected(
                    not_ready.iter().map(|a| a.path.clone()).collect(),
                ));
            }

            for artifact in &ready {
                done.insert(artifact.path.as_str());
            }
            levels.push(ready);
            remaining = not_ready;
        }

        Ok(levels)
    }

    /// The transitive dependency closure of `path`, leaves first, ending with
    /// the node itself.
    pub fn walk_upstream(&self, path: &str) -> Vec<&Artifact> {
        let mut visited = HashSet::new();
        let mut result = Vec::new();
        self.walk(path, &mut visited, &mut result);
        result
    }

    fn walk<'a>(
        &'a self,
        path: &str,
        visited: &mut HashSet<String>,
        result: &mut Vec<&'a Artifact>,
    ) {
        if !visited.insert(path.to_string()) {
            return;
        }
        let Some(artifact) = self.nodes.get(path) else {
            return;
        };
        if let Some(computation) = &artifact.computation {
            for dep in &computation.deps {
                self.walk(&dep.path, visited, result);
            }
        }
        result.push(artifact);
    }

    /// Writes sidecars for every computation node, dependencies first (the
    /// prep phase of the two-phase workflow).
    pub fn write_all_sidecars(&self, base: &Path, scm: Option<&dyn Scm>) -> Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        let mut visited = HashSet::new();
        for target in self.nodes.keys() {
            let mut chain = Vec::new();
            self.walk(target, &mut visited, &mut chain);
            for artifact in chain {
                if artifact.computation.is_some() {
                    written.push(artifact.write_sidecar(base, scm)?);
                }
            }
        }
        Ok(written)
    }
}

fn resolve_in(base: &Path, path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
