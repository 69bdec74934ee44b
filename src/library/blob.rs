//! Library storage for embedded bytes.

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::naming::resolve_unique_path;

/// Filesystem failure inside the library directory.
#[derive(Debug, Error)]
#[error("library IO error at {path}: {source}")]
pub struct BlobError {
    /// Path being written or removed.
    pub path: PathBuf,
    /// The underlying IO error.
    #[source]
    pub source: io::Error,
}

impl BlobError {
    fn new(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            path: path.into(),
            source,
        }
    }
}

/// Directory holding embedded files, one per record.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Moves `temp` into the library.
    ///
    /// Overwrites `existing` when the record already owns a file under the
    /// root; otherwise picks a fresh name derived from `display_name`.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError`] naming the path that failed.
    pub async fn persist(
        &self,
        temp: &Path,
        display_name: &str,
        existing: Option<&Path>,
    ) -> Result<PathBuf, BlobError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| BlobError::new(&self.root, e))?;

        let target = match existing {
            Some(path) if path.starts_with(&self.root) => path.to_path_buf(),
            _ => resolve_unique_path(&self.root, display_name),
        };

        if tokio::fs::rename(temp, &target).await.is_err() {
            // Cross-device temp dirs cannot be renamed.
            tokio::fs::copy(temp, &target)
                .await
                .map_err(|e| BlobError::new(&target, e))?;
            let _ = tokio::fs::remove_file(temp).await;
        }
        debug!(path = %target.display(), "stored embedded bytes");
        Ok(target)
    }

    /// Deletes a stored file; a missing file is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`BlobError`] for other IO failures.
    pub async fn remove(&self, path: &Path) -> Result<bool, BlobError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(BlobError::new(path, e)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_persist_picks_unique_names() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("lib"));

        let t1 = dir.path().join("t1");
        std::fs::write(&t1, b"one").unwrap();
        let p1 = store.persist(&t1, "a.pdf", None).await.unwrap();
        let t2 = dir.path().join("t2");
        std::fs::write(&t2, b"two").unwrap();
        let p2 = store.persist(&t2, "a.pdf", None).await.unwrap();

        assert_eq!(p1.file_name().unwrap(), "a.pdf");
        assert_eq!(p2.file_name().unwrap(), "a_2.pdf");
        assert!(!t1.exists());
    }

    #[tokio::test]
    async fn test_persist_overwrites_existing_file() {
        let dir = TempDir::new().unwrap();
        let store = BlobStore::new(dir.path().join("lib"));
        let t1 = dir.path().join("t1");
        std::fs::write(&t1, b"old").unwrap();
        let path = store.persist(&t1, "a.pdf", None).await.unwrap();

        let t2 = dir.path().join("t2");
        std::fs::write(&t2, b"new").unwrap();
        let again = store.persist(&t2, "a.pdf", Some(&path)).await.unwrap();
        assert_eq!(again, path);
        assert_eq!(std::fs::read(&path).unwrap(), b"new");

        assert!(store.remove(&path).await.unwrap());
        assert!(!store.remove(&path).await.unwrap());
    }
}
