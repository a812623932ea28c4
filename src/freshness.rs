//! Freshness engine.
//!
//! Given an artifact with a sidecar, decides whether the on-disk output is
//! up to date with respect to the sidecar digest, the declared dependencies,
//! and the SCM state. Hashing goes through the mtime cache, and dependency
//! checks take a blob-SHA fast path when a `code_ref` was recorded.

use crate::{
    error::Result,
    hash,
    hash_cache::{CachedHash, HashCacheDb},
    scm::Scm,
    sidecar::{self, SidecarInfo},
    store::ObjectStore,
    utils,
};
use std::path::{Path, PathBuf};

/// Verdict for one artifact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Freshness {
    /// Output hash matches and no dependency changed.
    Fresh,
    /// Output or a dependency no longer matches the sidecar.
    Stale,
    /// The output does not exist on disk.
    Missing,
    /// The question cannot be answered (no sidecar, unreadable manifest, ...).
    Error,
}

/// Verdict plus the evidence behind it.
#[derive(Clone, Debug)]
pub struct FreshnessReport {
    pub state: Freshness,
    pub reason: String,
    /// Digest recorded in the sidecar.
    pub expected: Option<String>,
    /// Digest the output currently hashes to.
    pub actual: Option<String>,
    /// Every dependency found changed or missing.
    pub changed_deps: Vec<String>,
    /// The `code_ref` recorded at production time.
    pub code_ref: Option<String>,
}

impl FreshnessReport {
    pub fn is_fresh(&self) -> bool {
        self.state == Freshness::Fresh
    }

    fn new(state: Freshness, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
            expected: None,
            actual: None,
            changed_deps: Vec::new(),
            code_ref: None,
        }
    }
}

/// Freshness checker wired to a store, a hash cache, and (optionally) an SCM.
pub struct FreshnessCheck<'a> {
    store: &'a ObjectStore,
    hash_cache: &'a HashCacheDb,
    scm: Option<&'a dyn Scm>,
    work_dir: PathBuf,
    check_deps: bool,
}

impl<'a> FreshnessCheck<'a> {
    pub fn new(
        store: &'a ObjectStore,
        hash_cache: &'a HashCacheDb,
        scm: Option<&'a dyn Scm>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self { store, hash_cache, scm, work_dir: work_dir.into(), check_deps: true }
    }

    /// Disables dependency verification; only the output hash is compared.
    pub fn without_deps(mut self) -> Self {
        self.check_deps = false;
        self
    }

    /// Checks the artifact at `output`; all failures are folded into an
    /// `Error` verdict so callers can report per-artifact results.
    pub fn check(&self, output: &Path) -> FreshnessReport {
        match self.check_inner(output) {
            Ok(report) => report,
            Err(err) => FreshnessReport::new(Freshness::Error, err.to_string()),
        }
    }

    /// Like [`Self::check`] but reuses an already-parsed sidecar.
    pub fn check_with_info(&self, output: &Path, info: &SidecarInfo) -> FreshnessReport {
        match self.check_output(output, info) {
            Ok(report) => report,
            Err(err) => FreshnessReport::new(Freshness::Error, err.to_string()),
        }
    }

    fn check_inner(&self, output: &Path) -> Result<FreshnessReport> {
        let output = self.resolve(output);
        match sidecar::read_sidecar(&output)? {
            Some(info) => self.check_output(&output, &info),
            // no sidecar on the file itself: it may live inside a tracked directory
            None => self.check_in_tracked_dir(&output),
        }
    }

    fn check_output(&self, output: &Path, info: &SidecarInfo) -> Result<FreshnessReport> {
        let mut report = FreshnessReport::new(Freshness::Fresh, "up-to-date");
        report.expected = info.digest.clone();
        report.code_ref = info.code_ref.clone();

        if !output.exists() {
            report.state = Freshness::Missing;
            report.reason = "output missing".into();
            return Ok(report);
        }

        let Some(current) = self.hash_current(output)? else {
            report.state = Freshness::Missing;
            report.reason = "output missing".into();
            return Ok(report);
        };
        report.actual = Some(current.digest.clone());

        match &info.digest {
            None => {
                // placeholder: the artifact is declared but nothing was recorded
                report.state = Freshness::Stale;
                report.reason = "no recorded output hash".into();
                return Ok(report);
            }
            Some(expected) if *expected != current.digest => {
                report.state = Freshness::Stale;
                report.reason = format!(
                    "output hash mismatch ({}... vs {}...)",
                    prefix(expected),
                    prefix(&current.digest)
                );
                return Ok(report);
            }
            Some(_) => {}
        }

        if self.check_deps && !info.deps.is_empty() {
            let mut first_reason = None;
            for (dep_path, recorded) in &info.deps {
                if let Some(reason) = self.dep_stale_reason(dep_path, recorded, info)? {
                    report.changed_deps.push(dep_path.clone());
                    first_reason.get_or_insert(reason);
                }
            }
            if let Some(reason) = first_reason {
                report.state = Freshness::Stale;
                report.reason = reason;
                return Ok(report);
            }
        }

        Ok(report)
    }

    /// Returns a stale reason for the dependency, or `None` if it is
    /// unchanged.
    fn dep_stale_reason(
        &self,
        dep_path: &str,
        recorded: &str,
        info: &SidecarInfo,
    ) -> Result<Option<String>> {
        // SCM fast path: compare blob SHAs between the recorded code_ref and
        // HEAD; no file content needs reading.
        if let (Some(scm), Some(code_ref)) = (self.scm, info.code_ref.as_deref()) {
            let old = scm.blob_sha(dep_path, code_ref);
            let new = scm.blob_sha(dep_path, "HEAD");
            match (old, new) {
                (Some(old), Some(new)) if old == new => {
                    trace!(dep = dep_path, "dep unchanged per scm blob sha");
                    return Ok(None);
                }
                (Some(_), Some(_)) => {
                    return Ok(Some(format!("dep changed: {dep_path}")));
                }
                // untracked on either side: fall through to hash comparison
                _ => {}
            }
        }

        let dep = self.resolve(Path::new(dep_path));
        let Some(current) = self.hash_current(&dep)? else {
            return Ok(Some(format!("dep missing: {dep_path}")));
        };
        let (recorded_digest, _) = hash::split_digest_token(recorded);
        if current.digest != recorded_digest {
            return Ok(Some(format!("dep changed: {dep_path}")));
        }
        Ok(None)
    }

    /// Answers "is this file fresh?" for a file without its own sidecar by
    /// finding a tracked ancestor directory and consulting its manifest.
    fn check_in_tracked_dir(&self, output: &Path) -> Result<FreshnessReport> {
        let Some((_, relpath, dir_info)) = find_tracked_ancestor(output)? else {
            return Ok(FreshnessReport::new(Freshness::Error, "no .dvc file"));
        };
        let Some(dir_digest) = dir_info.digest else {
            return Ok(FreshnessReport::new(Freshness::Error, "no .dvc file"));
        };

        let manifest = self.store.manifest_map(&dir_digest)?;
        let Some(expected) = manifest.get(&relpath) else {
            return Ok(FreshnessReport::new(Freshness::Error, "not in manifest"));
        };

        let mut report = FreshnessReport::new(Freshness::Fresh, "up-to-date");
        report.expected = Some(expected.clone());

        if !output.exists() {
            report.state = Freshness::Missing;
            report.reason = "output missing".into();
            return Ok(report);
        }
        let Some(current) = self.hash_current(output)? else {
            report.state = Freshness::Missing;
            report.reason = "output missing".into();
            return Ok(report);
        };
        report.actual = Some(current.digest.clone());
        if current.digest != *expected {
            report.state = Freshness::Stale;
            report.reason = format!(
                "output hash mismatch ({}... vs {}...)",
                prefix(expected),
                prefix(&current.digest)
            );
        }
        Ok(report)
    }

    /// Current digest of a path via the mtime cache.
    pub fn hash_current(&self, path: &Path) -> Result<Option<CachedHash>> {
        self.hash_cache.hash_cached(path, hash::hash_path)
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        }
    }
}

/// Walks upward from `path` looking for an ancestor directory tracked by a
/// sidecar with a directory digest.
///
/// Returns the ancestor, the POSIX relpath of `path` within it, and the
/// parsed sidecar.
pub fn find_tracked_ancestor(path: &Path) -> Result<Option<(PathBuf, String, SidecarInfo)>> {
    let abs = if path.is_absolute() {
        path.to_path_buf()
    } else {
        utils::canonicalized(path)
    };
    let Some(name) = abs.file_name() else {
        return Ok(None);
    };

    let mut rel_parts = vec![name.to_string_lossy().into_owned()];
    let mut current = abs.parent();
    while let Some(dir) = current {
        if dir.parent().is_none() {
            break;
        }
        if let Some(info) = sidecar::read_sidecar(dir)? {
            if info.is_dir {
                let mut parts = rel_parts.clone();
                parts.reverse();
                return Ok(Some((dir.to_path_buf(), parts.join("/"), info)));
            }
        }
        if let Some(dir_name) = dir.file_name() {
            rel_parts.push(dir_name.to_string_lossy().into_owned());
        }
        current = dir.parent();
    }
    Ok(None)
}

fn prefix(digest: &str) -> &str {
    &digest[..digest.len().min(8)]
}
