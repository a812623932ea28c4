//! Content hashing for tracked files and directories.
//!
//! A file's hash is the MD5 of its bytes, streamed in 64 KiB chunks. A
//! directory's hash is the MD5 of its serialized manifest: a JSON array of
//! `{"md5", "relpath"}` records sorted by `relpath`, POSIX separators
//! throughout. The hasher never looks at mtimes, ownership, or inodes, so
//! equal content always hashes equally.

use crate::{
    error::{DvxError, Result},
    utils,
};
use md5::{Digest, Md5};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// The value of the sidecar `hash` field.
pub const HASH_NAME: &str = "md5";

/// Suffix appended to directory digests in serialized forms.
pub const DIR_SUFFIX: &str = ".dir";

const CHUNK_SIZE: usize = 64 * 1024;

/// A 32-char hex digest, optionally carrying the directory suffix.
static RE_HASH_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-f0-9]{32}(\.dir)?$").unwrap());

/// Whether `value` looks like a digest token (32 lowercase hex chars,
/// optionally with the `.dir` suffix).
pub fn is_hash_token(value: &str) -> bool {
    RE_HASH_TOKEN.is_match(&value.to_lowercase())
}

/// Splits a serialized digest token into the raw digest and a directory flag.
///
/// The suffix is a wire-format artifact only; everything downstream carries
/// the two fields separately.
pub fn split_digest_token(token: &str) -> (&str, bool) {
    match token.strip_suffix(DIR_SUFFIX) {
        Some(digest) => (digest, true),
        None => (token, false),
    }
}

/// Joins a raw digest and a directory flag into the serialized token.
pub fn digest_token(digest: &str, is_dir: bool) -> String {
    if is_dir {
        format!("{digest}{DIR_SUFFIX}")
    } else {
        digest.to_string()
    }
}

/// Result of hashing an output path.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutputHash {
    /// Raw hex digest, never carrying the `.dir` suffix.
    pub digest: String,
    /// File size, or the sum of member file sizes for directories.
    pub size: u64,
    pub is_dir: bool,
    /// Number of member files, directories only.
    pub nfiles: Option<u64>,
}

impl OutputHash {
    /// The serialized digest token (`.dir` suffix for directories).
    pub fn token(&self) -> String {
        digest_token(&self.digest, self.is_dir)
    }
}

/// One record of a directory manifest.
///
/// Field order is part of the wire format: `md5` before `relpath`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub md5: String,
    pub relpath: String,
}

/// Hashes the file or directory at `path`.
pub fn hash_path(path: &Path) -> Result<OutputHash> {
    let meta = fs::metadata(path).map_err(|_| DvxError::NotFound(path.to_path_buf()))?;
    if meta.is_file() {
        let (digest, size) = hash_file(path)?;
        Ok(OutputHash { digest, size, is_dir: false, nfiles: None })
    } else if meta.is_dir() {
        hash_dir(path)
    } else {
        Err(DvxError::InvalidTarget(path.to_path_buf()))
    }
}

/// Streams the file through MD5, returning `(digest, size)`.
pub fn hash_file(path: &Path) -> Result<(String, u64)> {
    let file = fs::File::open(path).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => DvxError::NotFound(path.to_path_buf()),
        _ => DvxError::io(err, path),
    })?;
    let mut reader = io::BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Md5::new();
    let mut buf = [0u8; CHUNK_SIZE];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).map_err(|err| DvxError::io(err, path))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((hex::encode(hasher.finalize()), size))
}

/// Hashes a directory via its canonical manifest.
pub fn hash_dir(dir: &Path) -> Result<OutputHash> {
    let (entries, size) = dir_entries(dir)?;
    let nfiles = entries.len() as u64;
    let manifest = manifest_json(&entries)?;
    let digest = hash_bytes(manifest.as_bytes());
    Ok(OutputHash { digest, size, is_dir: true, nfiles: Some(nfiles) })
}

/// MD5 of an in-memory byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Enumerates all member files of `dir` sorted by POSIX relpath.
///
/// Symlinks to directories are not followed; empty directories contribute
/// nothing.
pub fn walk_dir_files(dir: &Path) -> Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(dir) {
        let entry = entry.map_err(|err| {
            let path = err.path().unwrap_or(dir).to_path_buf();
            match err.into_io_error() {
                Some(io_err) => DvxError::io(io_err, path),
                None => DvxError::msg(format!("walk failed under {}", path.display())),
            }
        })?;
        let file_type = entry.file_type();
        let is_file = file_type.is_file() || (file_type.is_symlink() && entry.path().is_file());
        if is_file {
            let relpath = utils::posix_relpath(entry.path(), dir);
            files.push((entry.path().to_path_buf(), relpath));
        }
    }
    files.sort_by(|(_, a), (_, b)| a.cmp(b));
    Ok(files)
}

/// Builds the sorted manifest for `dir`, hashing every member file.
///
/// Returns the entries and the total size of all member files.
pub fn dir_entries(dir: &Path) -> Result<(Vec<ManifestEntry>, u64)> {
    let mut entries = Vec::new();
    let mut total_size = 0u64;
    for (path, relpath) in walk_dir_files(dir)? {
        let (md5, size) = hash_file(&path)?;
        total_size += size;
        entries.push(ManifestEntry { md5, relpath });
    }
    Ok((entries, total_size))
}

/// Serializes manifest entries with the historical separators (`", "` between
/// items and keys, `": "` before values). The directory digest is the MD5 of
/// exactly this text, so the separators cannot change.
pub fn manifest_json(entries: &[ManifestEntry]) -> Result<String> {
    let mut buf = Vec::with_capacity(entries.len() * 64 + 2);
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, WireFormatter);
    entries.serialize(&mut ser)?;
    // serde_json only emits valid UTF-8
    Ok(String::from_utf8(buf).expect("manifest JSON is UTF-8"))
}

/// JSON formatter matching the manifest wire format.
struct WireFormatter;

impl serde_json::ser::Formatter for WireFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}
