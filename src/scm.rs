//! Source-control boundary.
//!
//! The engine only ever asks three read-only questions of the SCM; everything
//! else about it is opaque. `GitScm` answers them by shelling out to `git`,
//! and any of the calls may come back empty when there is no repository or
//! the ref is unknown.

use std::{
    path::PathBuf,
    process::{Command, Stdio},
};

/// Read-only view of the source-control system.
pub trait Scm: Send + Sync {
    /// The commit SHA of `HEAD`, if there is a repository.
    fn head_sha(&self) -> Option<String>;

    /// The blob SHA of `path` at `reference`, if the file exists there.
    fn blob_sha(&self, path: &str, reference: &str) -> Option<String>;

    /// The contents of `path` at `reference`.
    fn show(&self, path: &str, reference: &str) -> Option<Vec<u8>>;
}

/// `Scm` implementation driving the `git` command-line tool.
#[derive(Clone, Debug, Default)]
pub struct GitScm {
    work_dir: Option<PathBuf>,
}

impl GitScm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs git commands inside `dir` instead of the process working
    /// directory.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self { work_dir: Some(dir.into()) }
    }

    fn git(&self) -> Command {
        let mut cmd = Command::new("git");
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null()).stderr(Stdio::piped()).stdout(Stdio::piped());
        cmd
    }

    fn rev_parse(&self, spec: &str) -> Option<String> {
        let mut cmd = self.git();
        cmd.arg("rev-parse").arg(spec);
        debug!(?cmd, "resolving git object");
        let output = cmd.output().ok()?;
        if !output.status.success() {
            return None;
        }
        let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!sha.is_empty()).then_some(sha)
    }
}

impl Scm for GitScm {
    fn head_sha(&self) -> Option<String> {
        self.rev_parse("HEAD")
    }

    fn blob_sha(&self, path: &str, reference: &str) -> Option<String> {
        self.rev_parse(&format!("{reference}:{path}"))
    }

    fn show(&self, path: &str, reference: &str) -> Option<Vec<u8>> {
        let mut cmd = self.git();
        cmd.arg("show").arg(format!("{reference}:{path}"));
        let output = cmd.output().ok()?;
        output.status.success().then_some(output.stdout)
    }
}

/// In-memory `Scm` with fixed answers, for tests and callers that capture
/// SCM state up front.
#[derive(Clone, Debug, Default)]
pub struct StaticScm {
    pub head: Option<String>,
    /// `(path, reference) -> blob sha`
    pub blobs: std::collections::BTreeMap<(String, String), String>,
}

impl StaticScm {
    pub fn with_head(head: impl Into<String>) -> Self {
        Self { head: Some(head.into()), blobs: Default::default() }
    }

    pub fn insert_blob(
        &mut self,
        path: impl Into<String>,
        reference: impl Into<String>,
        sha: impl Into<String>,
    ) {
        self.blobs.insert((path.into(), reference.into()), sha.into());
    }
}

impl Scm for StaticScm {
    fn head_sha(&self) -> Option<String> {
        self.head.clone()
    }

    fn blob_sha(&self, path: &str, reference: &str) -> Option<String> {
        self.blobs.get(&(path.to_string(), reference.to_string())).cloned()
    }

    fn show(&self, _path: &str, _reference: &str) -> Option<Vec<u8>> {
        None
    }
}
