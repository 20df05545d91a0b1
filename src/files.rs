//! Local file storage
//!
//! The storage contract the replication engine relies on: given a storage
//! reference name, answer whether the file exists, where it lives, and
//! persist new bytes under a quota ceiling. Reference names are confined
//! to the store root.

use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum FileStoreError {
    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage quota exceeded: {needed} bytes needed, {available} available")]
    QuotaExceeded { needed: u64, available: u64 },
    #[error("not a usable storage reference: {0}")]
    InvalidRef(String),
}

#[derive(Debug, Clone)]
pub struct StoredFile {
    pub path: PathBuf,
    pub size_bytes: u64,
}

pub struct FileStore {
    root: PathBuf,
    max_bytes: u64,
}

impl FileStore {
    pub fn open(root: impl AsRef<Path>, max_bytes: u64) -> Result<Self, FileStoreError> {
        let root = root.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root, max_bytes })
    }

    /// Resolve a reference name to its path inside the store root.
    /// Names with path separators or traversal components are rejected.
    pub fn path_for(&self, hash_ref: &str) -> Result<PathBuf, FileStoreError> {
        if hash_ref.is_empty()
            || hash_ref == "."
            || hash_ref == ".."
            || hash_ref.contains('/')
            || hash_ref.contains('\\')
        {
            return Err(FileStoreError::InvalidRef(hash_ref.to_string()));
        }
        Ok(self.root.join(hash_ref))
    }

    pub async fn exists(&self, hash_ref: &str) -> Result<bool, FileStoreError> {
        let path = self.path_for(hash_ref)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    pub async fn metadata(&self, hash_ref: &str) -> Result<Option<StoredFile>, FileStoreError> {
        let path = self.path_for(hash_ref)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(Some(StoredFile {
                path,
                size_bytes: meta.len(),
            })),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Bytes currently stored across the whole root.
    pub async fn total_size(&self) -> Result<u64, FileStoreError> {
        let mut total = 0u64;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_file() {
                total += meta.len();
            }
        }
        Ok(total)
    }

    /// Persist bytes under a new reference name. A no-op when the name is
    /// already taken; fails distinctly when the quota ceiling would be
    /// crossed.
    pub async fn save_new(
        &self,
        hash_ref: &str,
        bytes: &[u8],
    ) -> Result<Option<PathBuf>, FileStoreError> {
        let path = self.path_for(hash_ref)?;
        if tokio::fs::metadata(&path).await.is_ok() {
            return Ok(None);
        }

        let used = self.total_size().await?;
        let needed = bytes.len() as u64;
        if used + needed > self.max_bytes {
            return Err(FileStoreError::QuotaExceeded {
                needed,
                available: self.max_bytes.saturating_sub(used),
            });
        }

        tokio::fs::write(&path, bytes).await?;
        restrict_permissions(&path).await?;
        info!("stored {} ({} bytes)", hash_ref, needed);
        Ok(Some(path))
    }
}

#[cfg(unix)]
async fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await
}

#[cfg(not(unix))]
async fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_save_and_metadata() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), 1024).unwrap();

        let path = store.save_new("abc.bin", b"hello").await.unwrap().unwrap();
        assert!(store.exists("abc.bin").await.unwrap());

        let meta = store.metadata("abc.bin").await.unwrap().unwrap();
        assert_eq!(meta.path, path);
        assert_eq!(meta.size_bytes, 5);
    }

    #[tokio::test]
    async fn test_save_new_skips_existing() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), 1024).unwrap();

        store.save_new("abc.bin", b"first").await.unwrap();
        let second = store.save_new("abc.bin", b"second").await.unwrap();
        assert!(second.is_none());

        let meta = store.metadata("abc.bin").await.unwrap().unwrap();
        assert_eq!(meta.size_bytes, 5);
    }

    #[tokio::test]
    async fn test_quota_enforced() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), 10).unwrap();

        store.save_new("a", b"12345").await.unwrap();
        let result = store.save_new("b", b"123456").await;
        assert!(matches!(result, Err(FileStoreError::QuotaExceeded { .. })));
        assert!(!store.exists("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_traversal_refs_rejected() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path(), 1024).unwrap();

        for bad in ["../escape", "a/b", "a\\b", "", ".."] {
            assert!(matches!(
                store.path_for(bad),
                Err(FileStoreError::InvalidRef(_))
            ));
        }
    }
}
