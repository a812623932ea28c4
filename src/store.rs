//! Content-addressed object store.
//!
//! Blobs live at `<cache_root>/files/md5/<h[0:2]>/<h[2:]>`; directory
//! manifests at the same path with a `.dir` suffix. Ingestion is
//! existence-check-then-atomic-rename, which makes concurrent `put`s of the
//! same digest safe without any global lock: losers of the rename race simply
//! replace the destination with identical bytes.

use crate::{
    error::{DvxError, Result},
    hash::{self, ManifestEntry, OutputHash},
    utils,
};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

/// Subdirectories of the cache root that blobs are filed under.
const FILES_SUBDIR: &str = "files";
const HASH_SUBDIR: &str = "md5";

/// Handle to the on-disk object store under a cache root.
#[derive(Clone, Debug)]
pub struct ObjectStore {
    files_root: PathBuf,
}

impl ObjectStore {
    /// Creates a handle rooted at `<cache_root>/files/md5`. Nothing is
    /// created on disk until the first insertion.
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self { files_root: cache_root.into().join(FILES_SUBDIR).join(HASH_SUBDIR) }
    }

    /// The `files/md5` directory all objects live under.
    pub fn files_root(&self) -> &Path {
        &self.files_root
    }

    /// Object path for a digest: `<files_root>/<h[0:2]>/<h[2:]>`, with a
    /// `.dir` suffix for directory manifests.
    pub fn path_for(&self, digest: &str, is_dir: bool) -> PathBuf {
        let (prefix, rest) = digest.split_at(2);
        let mut name = rest.to_string();
        if is_dir {
            name.push_str(hash::DIR_SUFFIX);
        }
        self.files_root.join(prefix).join(name)
    }

    /// Whether the store already holds an object for this digest.
    pub fn contains(&self, digest: &str, is_dir: bool) -> bool {
        self.path_for(digest, is_dir).exists()
    }

    /// Ingests the file at `src` under `digest`.
    ///
    /// Returns `true` if bytes were copied, `false` if the blob was already
    /// present (deduplicated). The copy preserves permission bits and goes
    /// through a temp file in the destination directory followed by an atomic
    /// rename.
    pub fn put_blob(&self, src: &Path, digest: &str, force: bool) -> Result<bool> {
        let dest = self.path_for(digest, false);
        if !force && dest.exists() {
            trace!(digest, "blob already cached");
            return Ok(false);
        }
        utils::atomic_copy(src, &dest)?;
        trace!(digest, src = %src.display(), "blob cached");
        Ok(true)
    }

    /// Ingests a directory: every member file is hashed and stored as a blob,
    /// then the canonical manifest is written under the directory digest.
    pub fn put_dir(&self, dir: &Path, force: bool) -> Result<OutputHash> {
        let mut entries = Vec::new();
        let mut total_size = 0u64;
        for (path, relpath) in hash::walk_dir_files(dir)? {
            let (md5, size) = hash::hash_file(&path)?;
            self.put_blob(&path, &md5, force)?;
            total_size += size;
            entries.push(ManifestEntry { md5, relpath });
        }
        let nfiles = entries.len() as u64;
        let digest = self.put_manifest(&entries, force)?;
        Ok(OutputHash { digest, size: total_size, is_dir: true, nfiles: Some(nfiles) })
    }

    /// Writes a directory manifest, returning the directory digest (the MD5
    /// of the serialized manifest text).
    pub fn put_manifest(&self, entries: &[ManifestEntry], force: bool) -> Result<String> {
        let manifest = hash::manifest_json(entries)?;
        let digest = hash::hash_bytes(manifest.as_bytes());
        let dest = self.path_for(&digest, true);
        if force || !dest.exists() {
            utils::atomic_write(&dest, manifest.as_bytes())?;
            trace!(digest, entries = entries.len(), "directory manifest cached");
        }
        Ok(digest)
    }

    /// Reads a directory manifest back from the store.
    pub fn read_manifest(&self, digest: &str) -> Result<Vec<ManifestEntry>> {
        let path = self.path_for(digest, true);
        let text = fs::read_to_string(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => DvxError::NotFound(path.clone()),
            _ => DvxError::io(err, &path),
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Reads a directory manifest as a `relpath -> md5` map.
    pub fn manifest_map(&self, digest: &str) -> Result<BTreeMap<String, String>> {
        Ok(self
            .read_manifest(digest)?
            .into_iter()
            .map(|entry| (entry.relpath, entry.md5))
            .collect())
    }
}
