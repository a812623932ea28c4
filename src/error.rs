//! Error types for the engine.

use itertools::Itertools;
use std::{
    io,
    path::{Path, PathBuf},
};
use thiserror::Error;

pub type Result<T, E = DvxError> = std::result::Result<T, E>;

/// A dependency whose recorded hash no longer matches the file on disk.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaleDep {
    /// Path of the dependency as declared in the sidecar.
    pub path: String,
    /// Prefix of the hash recorded in the sidecar.
    pub recorded: String,
    /// Prefix of the hash the file currently has, if it exists.
    pub current: Option<String>,
}

impl std::fmt::Display for StaleDep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.current {
            Some(current) => {
                write!(f, "{} (recorded {}..., found {}...)", self.path, self.recorded, current)
            }
            None => write!(f, "{} (recorded {}..., missing)", self.path, self.recorded),
        }
    }
}

/// Various error types
#[derive(Debug, Error)]
pub enum DvxError {
    /// An input file or sidecar does not exist.
    #[error("path not found: {}", .0.display())]
    NotFound(PathBuf),
    /// Path exists but is neither a regular file nor a directory.
    #[error("not a file or directory: {}", .0.display())]
    InvalidTarget(PathBuf),
    /// A sidecar file could not be parsed or carries no outputs.
    #[error("invalid sidecar {}: {detail}", .path.display())]
    InvalidSidecar { path: PathBuf, detail: String },
    /// `add` without `recursive` found dependencies whose recorded hashes are
    /// out of date.
    #[error("stale dependencies for {}: {}", .output.display(), .deps.iter().join(", "))]
    StaleDeps { output: PathBuf, deps: Vec<StaleDep> },
    /// The dependency graph contains a cycle.
    #[error("circular dependency detected: {}", .0.iter().join(" -> "))]
    CycleDetected(Vec<String>),
    /// A subprocess exited with a non-zero status.
    #[error("command failed for {}: {stderr}", .artifact.display())]
    CommandFailed { artifact: PathBuf, stderr: String },
    /// A subprocess exited zero but the declared output is absent.
    #[error("output not produced: {}", .0.display())]
    OutputMissing(PathBuf),
    /// Filesystem error with the path it occurred on.
    #[error(transparent)]
    Io(#[from] DvxIoError),
    /// Error from the embedded hash-cache database.
    #[error(transparent)]
    Database(#[from] rusqlite::Error),
    /// YAML (de)serialization error.
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
    /// JSON (de)serialization error.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// General purpose message.
    #[error("{0}")]
    Message(String),
}

impl DvxError {
    pub fn io(err: io::Error, path: impl Into<PathBuf>) -> Self {
        DvxIoError::new(err, path).into()
    }

    pub fn msg(msg: impl Into<String>) -> Self {
        DvxError::Message(msg.into())
    }
}

/// An `io::Error` together with the path it occurred on.
#[derive(Debug, Error)]
#[error("\"{}\": {io}", self.path.display())]
pub struct DvxIoError {
    io: io::Error,
    path: PathBuf,
}

impl DvxIoError {
    pub fn new(io: io::Error, path: impl Into<PathBuf>) -> Self {
        Self { io, path: path.into() }
    }

    /// The path at which the error occurred.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The underlying `io::Error`.
    pub fn io(&self) -> &io::Error {
        &self.io
    }
}

impl From<DvxIoError> for io::Error {
    fn from(err: DvxIoError) -> Self {
        err.io
    }
}
