//! Remote blob-store boundary.
//!
//! Remote backends (object stores, remote filesystems) live outside the
//! engine; they appear here only as a typed handle for push/pull plumbing.
//! No ordering is assumed across remote calls.

use crate::error::Result;
use std::path::Path;

/// A remote blob store addressed by digest.
pub trait Remote: Send + Sync {
    /// Uploads the local file under `digest`.
    fn put(&self, digest: &str, local_path: &Path) -> Result<()>;

    /// Downloads the blob for `digest` into `local_path`.
    fn get(&self, digest: &str, local_path: &Path) -> Result<()>;

    /// Whether the remote holds a blob for `digest`.
    fn contains(&self, digest: &str) -> Result<bool>;

    /// The remote URL a digest maps to.
    fn oid_to_url(&self, digest: &str) -> String;
}
