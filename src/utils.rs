//! Utility functions

use crate::error::{DvxIoError, Result};
use path_slash::PathExt;
use std::{
    ffi::OsString,
    fs,
    io::Write,
    path::{Path, PathBuf},
};

/// Extension of sidecar manifest files.
pub const SIDECAR_EXT: &str = "dvc";

/// Returns the sidecar path for an output, `<output>.dvc`.
pub fn sidecar_path(output: impl AsRef<Path>) -> PathBuf {
    let mut s: OsString = output.as_ref().as_os_str().to_os_string();
    s.push(".");
    s.push(SIDECAR_EXT);
    PathBuf::from(s)
}

/// Returns the output path for a target that may be either the output itself
/// or its sidecar.
pub fn output_path(target: impl AsRef<Path>) -> PathBuf {
    let target = target.as_ref();
    if target.extension().map(|ext| ext == SIDECAR_EXT).unwrap_or_default() {
        target.with_extension("")
    } else {
        target.to_path_buf()
    }
}

/// Canonicalize the path, platform-agnostic.
pub fn canonicalize(path: impl AsRef<Path>) -> Result<PathBuf, DvxIoError> {
    let path = path.as_ref();
    dunce::canonicalize(path).map_err(|err| DvxIoError::new(err, path))
}

/// Canonicalizes the path, returning the input if canonicalization fails
/// (e.g. the path does not exist yet).
pub fn canonicalized(path: impl Into<PathBuf>) -> PathBuf {
    let path = path.into();
    canonicalize(&path).unwrap_or(path)
}

/// The absolute POSIX form of a path, used as the key for hash-cache rows.
///
/// Separators are `/` regardless of host OS.
pub fn absolute_posix(path: impl AsRef<Path>) -> String {
    let path = path.as_ref();
    let abs = if path.is_absolute() {
        canonicalized(path)
    } else {
        let joined = std::env::current_dir().map(|cwd| cwd.join(path)).unwrap_or_else(|_| path.to_path_buf());
        canonicalized(joined)
    };
    abs.to_slash_lossy().into_owned()
}

/// Serializes a path relative to `base` in POSIX form.
pub fn posix_relpath(path: &Path, base: &Path) -> String {
    let rel = path.strip_prefix(base).unwrap_or(path);
    rel.to_slash_lossy().into_owned()
}

/// Creates the parent directory of the `file` and all its ancestors if it does
/// not exist.
///
/// See [`fs::create_dir_all()`].
pub fn create_parent_dir_all(file: &Path) -> Result<(), DvxIoError> {
    if let Some(parent) = file.parent() {
        fs::create_dir_all(parent).map_err(|err| DvxIoError::new(err, parent))?;
    }
    Ok(())
}

/// Writes `contents` to `path` atomically: a temp file is created in the
/// destination directory and renamed over the destination.
pub fn atomic_write(path: &Path, contents: &[u8]) -> Result<(), DvxIoError> {
    create_parent_dir_all(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|err| DvxIoError::new(err, path))?;
    tmp.write_all(contents).map_err(|err| DvxIoError::new(err, path))?;
    tmp.persist(path).map_err(|err| DvxIoError::new(err.error, path))?;
    Ok(())
}

/// Copies `src` to `dest` atomically, preserving permission bits.
///
/// The temp file lives in the destination directory so the final rename stays
/// on one filesystem.
pub fn atomic_copy(src: &Path, dest: &Path) -> Result<(), DvxIoError> {
    create_parent_dir_all(dest)?;
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|err| DvxIoError::new(err, dest))?
        .into_temp_path();
    fs::copy(src, &tmp).map_err(|err| DvxIoError::new(err, src))?;
    tmp.persist(dest).map_err(|err| DvxIoError::new(err.error, dest))?;
    Ok(())
}

/// Returns the seconds-since-epoch mtime of `path` as a float, the granularity
/// the hash cache stores.
pub fn mtime_seconds(path: &Path) -> Result<f64, DvxIoError> {
    let modified = fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|err| DvxIoError::new(err, path))?;
    Ok(modified
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default())
}

/// Seconds since the epoch, for `updated_at` columns.
pub fn now_seconds() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Checks whether `path` matches any of the glob `patterns`.
pub fn matches_any(path: &str, patterns: &[glob::Pattern]) -> bool {
    patterns.iter().any(|pattern| pattern.matches(path))
}

/// Creates a new named tempdir.
#[cfg(test)]
pub(crate) fn tempdir(name: &str) -> Result<tempfile::TempDir, DvxIoError> {
    tempfile::Builder::new().prefix(name).tempdir().map_err(|err| DvxIoError::new(err, name))
}
