//! Project layout and control-directory discovery.

use crate::{
    error::{DvxError, Result},
    utils,
};
use std::path::{Path, PathBuf};

/// Name of the project control directory.
pub const CONTROL_DIR: &str = ".dvc";

/// Cache directory inside the control directory.
pub const CACHE_DIR: &str = "cache";

/// File name of the mtime hash-cache database inside the control directory.
pub const DB_FILE: &str = "dvc.db";

/// Where things live inside a project.
///
/// The presence of a `.dvc` directory defines the project root; everything
/// else hangs off it. The cache root can be overridden, which is how tests
/// point several projects at a shared object store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectPaths {
    /// Project root directory.
    pub root: PathBuf,
    /// `<root>/.dvc`
    pub control_dir: PathBuf,
    /// Object-store root, `<root>/.dvc/cache` by default.
    pub cache_root: PathBuf,
    /// Hash-cache database file, `<root>/.dvc/dvc.db`.
    pub db_path: PathBuf,
}

impl ProjectPaths {
    /// Creates the layout rooted at `root` without touching the filesystem.
    pub fn at_root(root: impl Into<PathBuf>) -> Self {
        let root = utils::canonicalized(root.into());
        let control_dir = root.join(CONTROL_DIR);
        let cache_root = control_dir.join(CACHE_DIR);
        let db_path = control_dir.join(DB_FILE);
        Self { root, control_dir, cache_root, db_path }
    }

    /// Walks upward from `start` until a directory containing `.dvc/` is
    /// found.
    pub fn discover(start: impl AsRef<Path>) -> Result<Self> {
        let start = utils::canonicalized(start.as_ref());
        let mut current = Some(start.as_path());
        while let Some(dir) = current {
            if dir.join(CONTROL_DIR).is_dir() {
                trace!("found control directory under \"{}\"", dir.display());
                return Ok(Self::at_root(dir));
            }
            current = dir.parent();
        }
        Err(DvxError::NotFound(start.join(CONTROL_DIR)))
    }

    /// Overrides the object-store root.
    pub fn with_cache_root(mut self, cache_root: impl Into<PathBuf>) -> Self {
        self.cache_root = cache_root.into();
        self
    }

    /// Creates the control directory (and so marks `root` as a project root).
    pub fn ensure_control_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.control_dir)
            .map_err(|err| DvxError::io(err, &self.control_dir))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::tempdir;

    #[test]
    fn discovers_root_from_nested_dir() {
        let tmp = tempdir("paths").unwrap();
        let root = tmp.path().join("project");
        std::fs::create_dir_all(root.join(".dvc")).unwrap();
        let nested = root.join("data/raw");
        std::fs::create_dir_all(&nested).unwrap();

        let paths = ProjectPaths::discover(&nested).unwrap();
        assert_eq!(paths.root, utils::canonicalized(&root));
        assert_eq!(paths.cache_root, utils::canonicalized(&root).join(".dvc/cache"));
        assert_eq!(paths.db_path, utils::canonicalized(&root).join(".dvc/dvc.db"));
    }

    #[test]
    fn discovery_fails_without_control_dir() {
        let tmp = tempdir("paths").unwrap();
        assert!(matches!(ProjectPaths::discover(tmp.path()), Err(DvxError::NotFound(_))));
    }
}
