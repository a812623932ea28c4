//! A minimal data version-control engine.
//!
//! Large data files are tracked by hash rather than by content: next to each
//! tracked output lives a small YAML sidecar (`<output>.dvc`) holding its
//! digest and, optionally, the command and input hashes that produced it.
//! The engine provides:
//!
//! - a content-addressed [object store](store::ObjectStore) with atomic
//!   ingestion and directory manifests,
//! - an [mtime-indexed hash cache](hash_cache::HashCacheDb) that skips
//!   rehashing unchanged files,
//! - a [freshness engine](freshness::FreshnessCheck) deciding whether an
//!   artifact is up to date with its sidecar, its dependencies, and the SCM
//!   state,
//! - a [parallel executor](executor::Executor) that turns sidecars into a
//!   dependency DAG and (re)runs stale computations level by level,
//!   deduplicating commands shared by several outputs.
//!
//! [`Project`] ties the pieces together for one invocation: it is created
//! per run, owns the store, the hash cache, and an optional SCM handle, and
//! is dropped at the end.

#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{DvxError, DvxIoError, Result};

pub mod config;
pub use config::ProjectPaths;

pub mod utils;

pub mod hash;
pub use hash::OutputHash;

pub mod hash_cache;
pub use hash_cache::{CachedHash, HashCacheDb};

pub mod store;
pub use store::ObjectStore;

pub mod sidecar;
pub use sidecar::{SidecarContent, SidecarInfo};

pub mod scm;
pub use scm::{GitScm, Scm};

pub mod remote;
pub use remote::Remote;

pub mod freshness;
pub use freshness::{Freshness, FreshnessCheck, FreshnessReport};

pub mod graph;
pub use graph::{Artifact, Computation, Dep, Graph};

pub mod executor;
pub use executor::{ExecConfig, ExecResult, ExecStatus, Executor};

pub mod add;
pub use add::{AddOptions, AddOutcome, Adder};

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

/// One invocation's view of a project: paths, object store, hash cache, and
/// an optional SCM handle.
pub struct Project {
    pub paths: ProjectPaths,
    store: ObjectStore,
    hash_cache: HashCacheDb,
    scm: Option<Box<dyn Scm>>,
}

impl std::fmt::Debug for Project {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Project")
            .field("paths", &self.paths)
            .field("scm", &self.scm.is_some())
            .finish()
    }
}

impl Project {
    /// Opens the project whose control directory is at `<root>/.dvc`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let paths = ProjectPaths::at_root(root.as_ref());
        if !paths.control_dir.is_dir() {
            return Err(DvxError::NotFound(paths.control_dir));
        }
        Self::from_paths(paths)
    }

    /// Creates the control directory at `root` and opens the project.
    pub fn init(root: impl AsRef<Path>) -> Result<Self> {
        let paths = ProjectPaths::at_root(root.as_ref());
        paths.ensure_control_dir()?;
        Self::from_paths(paths)
    }

    /// Walks upward from `start` to find the project root.
    pub fn discover_from(start: impl AsRef<Path>) -> Result<Self> {
        Self::from_paths(ProjectPaths::discover(start)?)
    }

    /// Walks upward from the current directory to find the project root.
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir().map_err(|err| DvxError::io(err, "."))?;
        Self::discover_from(cwd)
    }

    /// Builds a project from an explicit path layout.
    pub fn from_paths(paths: ProjectPaths) -> Result<Self> {
        let store = ObjectStore::new(&paths.cache_root);
        let hash_cache = HashCacheDb::open(&paths.db_path)?;
        Ok(Self { paths, store, hash_cache, scm: None })
    }

    /// Attaches an SCM handle, enabling `code_ref` capture and the blob-SHA
    /// dependency fast path.
    pub fn with_scm(mut self, scm: Box<dyn Scm>) -> Self {
        self.scm = Some(scm);
        self
    }

    /// Attaches a [`GitScm`] rooted at the project if a repository is
    /// reachable from there.
    pub fn detect_scm(self) -> Self {
        let git = GitScm::in_dir(&self.paths.root);
        if git.head_sha().is_some() {
            debug!(root = %self.paths.root.display(), "git repository detected");
            self.with_scm(Box::new(git))
        } else {
            self
        }
    }

    pub fn root(&self) -> &Path {
        &self.paths.root
    }

    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    pub fn hash_cache(&self) -> &HashCacheDb {
        &self.hash_cache
    }

    pub fn scm(&self) -> Option<&dyn Scm> {
        self.scm.as_deref()
    }

    /// A freshness checker wired to this project's components.
    pub fn freshness(&self) -> FreshnessCheck<'_> {
        FreshnessCheck::new(&self.store, &self.hash_cache, self.scm(), &self.paths.root)
    }

    /// Hashes an artifact through the mtime cache; `None` if it is missing.
    pub fn hash_artifact(&self, path: impl AsRef<Path>) -> Result<Option<CachedHash>> {
        self.hash_cache.hash_cached(path.as_ref(), hash::hash_path)
    }

    /// Drops the cached hash row for one artifact. Returns whether a row
    /// existed.
    pub fn forget_artifact(&self, path: impl AsRef<Path>) -> Result<bool> {
        self.hash_cache.delete(&utils::absolute_posix(path.as_ref()))
    }

    /// Drops every cached hash row, returning how many were removed.
    pub fn clear_hash_cache(&self) -> Result<usize> {
        self.hash_cache.clear()
    }

    /// Ingests an existing artifact: hash, store, sidecar.
    pub fn add(&self, target: impl AsRef<Path>, opts: &AddOptions) -> Result<AddOutcome> {
        self.adder().add(target.as_ref(), opts)
    }

    /// Ingests several targets; failures are per-target.
    pub fn add_many(
        &self,
        targets: &[PathBuf],
        opts: &AddOptions,
    ) -> Vec<(PathBuf, Result<AddOutcome>)> {
        self.adder().add_many(targets, opts)
    }

    fn adder(&self) -> Adder<'_> {
        Adder::new(&self.store, &self.hash_cache, self.scm(), &self.paths.root)
    }

    /// Resolves the graph reachable from `targets` and executes every stale
    /// computation.
    ///
    /// Relative paths (and commands, unless overridden) resolve against the
    /// project root.
    pub fn run(&self, targets: &[PathBuf], mut config: ExecConfig) -> Result<Vec<ExecResult>> {
        if config.work_dir.is_none() {
            config.work_dir = Some(self.paths.root.clone());
        }
        let base = config.work_dir.clone().unwrap_or_else(|| self.paths.root.clone());
        let graph = Graph::resolve(targets, &base)?;
        Executor::new(&self.store, &self.hash_cache, self.scm(), config).run(&graph)
    }

    /// Freshness verdicts for every artifact reachable from `targets`,
    /// keyed by path. Leaf inputs report fresh.
    pub fn status(&self, targets: &[PathBuf]) -> Result<BTreeMap<String, FreshnessReport>> {
        let graph = Graph::resolve(targets, &self.paths.root)?;
        let check = self.freshness();
        let mut verdicts = BTreeMap::new();
        for artifact in graph.artifacts() {
            let report = if artifact.is_leaf() {
                FreshnessReport {
                    state: Freshness::Fresh,
                    reason: "leaf node (no computation)".into(),
                    expected: None,
                    actual: None,
                    changed_deps: Vec::new(),
                    code_ref: None,
                }
            } else {
                check.check(Path::new(&artifact.path))
            };
            verdicts.insert(artifact.path.clone(), report);
        }
        Ok(verdicts)
    }

    /// Resolves a target to its object-store path.
    ///
    /// Accepts a digest token, a tracked path (or its sidecar), or a file
    /// inside a tracked directory.
    pub fn cache_path_for(&self, target: &str) -> Result<PathBuf> {
        if hash::is_hash_token(target) {
            let (digest, is_dir) = hash::split_digest_token(target);
            return Ok(self.store.path_for(digest, is_dir));
        }

        let output = {
            let p = utils::output_path(Path::new(target));
            if p.is_absolute() {
                p
            } else {
                self.paths.root.join(p)
            }
        };
        if let Some(info) = sidecar::read_sidecar(&output)? {
            if let Some(digest) = &info.digest {
                return Ok(self.store.path_for(digest, info.is_dir));
            }
        }

        // fall back to membership in a tracked directory
        if let Some((_, relpath, dir_info)) = freshness::find_tracked_ancestor(&output)? {
            if let Some(dir_digest) = &dir_info.digest {
                let manifest = self.store.manifest_map(dir_digest)?;
                if let Some(md5) = manifest.get(&relpath) {
                    return Ok(self.store.path_for(md5, false));
                }
            }
        }

        Err(DvxError::NotFound(utils::sidecar_path(&output)))
    }
}
