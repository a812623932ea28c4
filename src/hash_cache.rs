//! Mtime-indexed hash cache.
//!
//! A single-table SQLite database keyed by the absolute POSIX path of an
//! artifact. Rows record the mtime a hash was computed at; as long as the
//! mtime still matches, consumers may reuse the hash and skip rehashing.
//! Rows are advisory only: a row that disagrees with reality is replaced,
//! never trusted past its mtime.

use crate::{
    error::Result,
    hash::OutputHash,
    utils,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

/// Lock wait for concurrent writers, in milliseconds.
const BUSY_TIMEOUT_MS: u64 = 30_000;

/// A cached `(mtime, hash, size)` row.
#[derive(Clone, Debug, PartialEq)]
pub struct HashCacheRow {
    pub path: String,
    pub mtime: f64,
    pub hash: String,
    pub size: u64,
    pub updated_at: f64,
}

/// Outcome of a cache-assisted hash computation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CachedHash {
    pub digest: String,
    pub size: u64,
    /// Whether the mtime cache answered without rehashing.
    pub cached: bool,
}

/// The on-disk hash cache, living in the project control directory.
///
/// Every operation opens its own connection, so each worker thread gets an
/// independent handle; WAL mode allows one writer alongside many readers.
#[derive(Debug)]
pub struct HashCacheDb {
    db_path: PathBuf,
}

impl HashCacheDb {
    /// Opens (and if necessary bootstraps) the database at `db_path`.
    pub fn open(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db = Self { db_path: db_path.into() };
        let conn = db.conn()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS hash_cache (
                path TEXT PRIMARY KEY,
                mtime REAL NOT NULL,
                hash TEXT NOT NULL,
                size INTEGER NOT NULL,
                updated_at REAL NOT NULL
            );",
        )?;
        Ok(db)
    }

    /// Path of the underlying database file.
    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn conn(&self) -> Result<Connection> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|err| crate::error::DvxError::io(err, parent))?;
        }
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        // WAL keeps readers unblocked while one writer holds the lock. The
        // pragma reports the resulting mode, so it has to be queried.
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        Ok(conn)
    }

    /// Looks up the row for a path key.
    pub fn get(&self, path: &str) -> Result<Option<HashCacheRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT path, mtime, hash, size, updated_at FROM hash_cache WHERE path = ?1",
                params![path],
                |row| {
                    Ok(HashCacheRow {
                        path: row.get(0)?,
                        mtime: row.get(1)?,
                        hash: row.get(2)?,
                        size: row.get::<_, i64>(3)? as u64,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Inserts or replaces the row for a path key.
    pub fn put(&self, path: &str, mtime: f64, hash: &str, size: u64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO hash_cache (path, mtime, hash, size, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![path, mtime, hash, size as i64, utils::now_seconds()],
        )?;
        Ok(())
    }

    /// Removes the row for a path key. Returns whether a row existed.
    pub fn delete(&self, path: &str) -> Result<bool> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM hash_cache WHERE path = ?1", params![path])?;
        Ok(affected > 0)
    }

    /// Drops every row, returning how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let conn = self.conn()?;
        let affected = conn.execute("DELETE FROM hash_cache", [])?;
        Ok(affected)
    }

    /// Hashes `path`, reusing the cached digest when the mtime is unchanged.
    ///
    /// Returns `None` if the path does not exist. `hasher` is only invoked on
    /// a cache miss; its result is recorded against the current mtime.
    pub fn hash_cached<F>(&self, path: &Path, hasher: F) -> Result<Option<CachedHash>>
    where
        F: FnOnce(&Path) -> Result<OutputHash>,
    {
        if !path.exists() {
            return Ok(None);
        }
        let mtime = utils::mtime_seconds(path)?;
        let key = utils::absolute_posix(path);

        if let Some(row) = self.get(&key)? {
            if row.mtime == mtime {
                trace!(path = %path.display(), "hash cache hit");
                return Ok(Some(CachedHash { digest: row.hash, size: row.size, cached: true }));
            }
        }

        let out = hasher(path)?;
        self.put(&key, mtime, &out.digest, out.size)?;
        trace!(path = %path.display(), digest = %out.digest, "hash cache updated");
        Ok(Some(CachedHash { digest: out.digest, size: out.size, cached: false }))
    }
}
