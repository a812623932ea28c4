//! Ingesting existing artifacts.
//!
//! `add` hashes an output that already exists on disk, inserts it into the
//! object store, and writes its sidecar — no command execution. Declared
//! dependencies with drifted hashes either fail the add (listing each stale
//! dependency) or, in recursive mode, are re-added depth-first before the
//! target.

use crate::{
    error::{DvxError, Result, StaleDep},
    hash,
    hash_cache::HashCacheDb,
    scm::Scm,
    sidecar::{self, SidecarContent, SidecarInfo},
    store::ObjectStore,
};
use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

/// Options for the add pathway.
#[derive(Clone, Debug, Default)]
pub struct AddOptions {
    /// Re-add stale dependencies depth-first instead of failing.
    pub recursive: bool,
    /// Overwrite existing store objects.
    pub force: bool,
}

/// What one successful add produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddOutcome {
    pub path: PathBuf,
    pub digest: String,
    pub size: u64,
    pub is_dir: bool,
    pub sidecar: PathBuf,
}

/// Context shared by one add invocation.
pub struct Adder<'a> {
    store: &'a ObjectStore,
    hash_cache: &'a HashCacheDb,
    scm: Option<&'a dyn Scm>,
    work_dir: PathBuf,
}

impl<'a> Adder<'a> {
    pub fn new(
        store: &'a ObjectStore,
        hash_cache: &'a HashCacheDb,
        scm: Option<&'a dyn Scm>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { store, hash_cache, scm, work_dir: work_dir.into() }
    }

    /// Adds one target. Errors on a missing target, an invalid target, or
    /// stale dependencies without `recursive`.
    pub fn add(&self, target: &Path, opts: &AddOptions) -> Result<AddOutcome> {
        let mut in_flight = HashSet::new();
        self.add_inner(target, opts, &mut in_flight)
    }

    /// Adds several targets; one target failing does not affect its siblings.
    pub fn add_many(
        &self,
        targets: &[PathBuf],
        opts: &AddOptions,
    ) -> Vec<(PathBuf, Result<AddOutcome>)> {
        targets
            .iter()
            .map(|target| (target.clone(), self.add(target, opts)))
            .collect()
    }

    fn add_inner(
        &self,
        target: &Path,
        opts: &AddOptions,
        in_flight: &mut HashSet<PathBuf>,
    ) -> Result<AddOutcome> {
        let output = self.resolve(&crate::utils::output_path(target));
        if !output.exists() {
            return Err(DvxError::NotFound(output));
        }
        // recursion guard: a dependency cycle in sidecars must not loop
        if !in_flight.insert(output.clone()) {
            return Err(DvxError::CycleDetected(vec![output.display().to_string()]));
        }

        let existing = sidecar::read_sidecar(&output)?;
        let deps = match &existing {
            Some(info) if !info.deps.is_empty() => {
                self.settle_deps(&output, info, opts, in_flight)?
            }
            _ => BTreeMap::new(),
        };

        let hashed = if output.is_dir() {
            self.store.put_dir(&output, opts.force)?
        } else {
            let Some(cached) = self.hash_cache.hash_cached(&output, hash::hash_path)? else {
                return Err(DvxError::NotFound(output));
            };
            self.store.put_blob(&output, &cached.digest, opts.force)?;
            hash::OutputHash {
                digest: cached.digest,
                size: cached.size,
                is_dir: false,
                nfiles: None,
            }
        };

        let (cmd, code_ref) = match &existing {
            Some(info) if info.has_computation() => {
                let code_ref = info
                    .code_ref
                    .clone()
                    .or_else(|| self.scm.and_then(Scm::head_sha));
                (info.cmd.clone(), code_ref)
            }
            _ => (None, None),
        };

        let sidecar = sidecar::write_sidecar(
            &output,
            &SidecarContent {
                digest: Some(hashed.digest.clone()),
                size: Some(hashed.size),
                is_dir: Some(hashed.is_dir),
                nfiles: hashed.nfiles,
                cmd,
                code_ref,
                deps,
            },
        )?;

        debug!(path = %output.display(), digest = %hashed.digest, "added");
        in_flight.remove(&output);
        Ok(AddOutcome {
            path: output,
            digest: hashed.digest,
            size: hashed.size,
            is_dir: hashed.is_dir,
            sidecar,
        })
    }

    /// Verifies the recorded dependency hashes, recursing into stale ones
    /// when allowed, and returns the dependency map to record.
    fn settle_deps(
        &self,
        output: &Path,
        info: &SidecarInfo,
        opts: &AddOptions,
        in_flight: &mut HashSet<PathBuf>,
    ) -> Result<BTreeMap<String, String>> {
        let mut stale = Vec::new();
        let mut current = BTreeMap::new();

        for (dep_path, recorded) in &info.deps {
            let resolved = self.resolve(Path::new(dep_path));
            let (recorded_digest, _) = hash::split_digest_token(recorded);
            match self.hash_cache.hash_cached(&resolved, hash::hash_path)? {
                Some(hashed) if hashed.digest == recorded_digest => {
                    current.insert(dep_path.clone(), hashed.digest);
                }
                Some(hashed) => {
                    stale.push((dep_path.clone(), recorded_digest.to_string(), Some(hashed.digest)));
                }
                None => {
                    stale.push((dep_path.clone(), recorded_digest.to_string(), None));
                }
            }
        }

        if stale.is_empty() {
            return Ok(current);
        }

        if !opts.recursive {
            return Err(DvxError::StaleDeps {
                output: output.to_path_buf(),
                deps: stale
                    .into_iter()
                    .map(|(path, recorded, found)| StaleDep {
                        path,
                        recorded: prefix(&recorded).to_string(),
                        current: found.as_deref().map(|d| prefix(d).to_string()),
                    })
                    .collect(),
            });
        }

        for (dep_path, _, found) in stale {
            let resolved = self.resolve(Path::new(&dep_path));
            if found.is_none() {
                // nothing on disk to re-add
                return Err(DvxError::NotFound(resolved));
            }
            if sidecar::read_sidecar(&resolved)?.is_some() {
                // the dependency is itself tracked: re-add it depth-first
                let outcome = self.add_inner(&resolved, opts, in_flight)?;
                current.insert(dep_path, outcome.digest);
            } else if let Some(hashed) = self.hash_cache.hash_cached(&resolved, hash::hash_path)? {
                // untracked input: just record its current hash
                current.insert(dep_path, hashed.digest);
            }
        }
        Ok(current)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

fn prefix(digest: &str) -> &str {
    &digest[..digest.len().min(8)]
}
