//! Capture payload storage.
//!
//! [`FileStore`] is the seam the capture ledger writes through;
//! [`LocalFileStore`] keeps payloads as flat files under one directory.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use crate::error::{FileStoreError, FileStoreResult};

/// Byte storage for capture payloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Store bytes and return the new file id.
    async fn save(&self, bytes: &[u8]) -> FileStoreResult<String>;
    /// Remove a stored file. Removing a missing file is not an error.
    async fn delete(&self, file_id: &str) -> FileStoreResult<()>;
    /// Location of a stored file.
    fn path(&self, file_id: &str) -> FileStoreResult<PathBuf>;
}

/// File store rooted at a local directory.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Create a store rooted at `root`. The directory is created on first save.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl FileStore for LocalFileStore {
    async fn save(&self, bytes: &[u8]) -> FileStoreResult<String> {
        let file_id = format!("{}.jpg", Uuid::new_v4());

        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|source| FileStoreError::Io {
                file_id: file_id.clone(),
                source,
            })?;

        let path = self.path(&file_id)?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| FileStoreError::Io {
                file_id: file_id.clone(),
                source,
            })?;

        debug!(file_id = %file_id, size = bytes.len(), "Capture file stored");
        Ok(file_id)
    }

    async fn delete(&self, file_id: &str) -> FileStoreResult<()> {
        let path = self.path(file_id)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(FileStoreError::Io {
                file_id: file_id.to_string(),
                source,
            }),
        }
    }

    fn path(&self, file_id: &str) -> FileStoreResult<PathBuf> {
        // Ids are flat names; anything that could escape the root is rejected.
        let valid = !file_id.is_empty()
            && file_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
            && !file_id.starts_with('.');
        if !valid {
            return Err(FileStoreError::InvalidId {
                file_id: file_id.to_string(),
            });
        }
        Ok(self.root.join(file_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path().join("media"));

        let id = store.save(b"jpeg-bytes").await.unwrap();
        let path = store.path(&id).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"jpeg-bytes");

        store.delete(&id).await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFileStore::new(dir.path());
        assert!(store.delete("does-not-exist.jpg").await.is_ok());
    }

    #[test]
    fn test_path_rejects_traversal() {
        let store = LocalFileStore::new("/tmp/media");
        assert!(store.path("../etc/passwd").is_err());
        assert!(store.path("a/b.jpg").is_err());
        assert!(store.path("..").is_err());
        assert!(store.path("").is_err());
        assert!(store.path("abc-123.jpg").is_ok());
    }
}
