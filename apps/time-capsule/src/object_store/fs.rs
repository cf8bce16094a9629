use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;

use super::{ObjectStore, ObjectStoreError, StoredFile, validate_key, with_timeout};

/// Object store backed by a flat local directory.
pub struct FsObjectStore {
    root: PathBuf,
    timeout_ms: u64,
}

impl FsObjectStore {
    pub async fn open(root: impl AsRef<Path>, timeout_ms: u64) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .with_context(|| format!("create object store dir {}", root.display()))?;
        Ok(Self {
            root,
            timeout_ms: timeout_ms.max(1),
        })
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_key(name)?;
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn upload(&self, file: StoredFile) -> Result<(), ObjectStoreError> {
        let path = self.path_for(&file.name)?;
        with_timeout(self.timeout_ms, async move {
            tokio::fs::write(&path, &file.bytes)
                .await
                .map_err(|error| ObjectStoreError::Backend(error.to_string()))
        })
        .await
    }

    async fn get(&self, name: &str) -> Result<StoredFile, ObjectStoreError> {
        let path = self.path_for(name)?;
        with_timeout(self.timeout_ms, async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(StoredFile::new(name, bytes)),
                Err(error) if error.kind() == ErrorKind::NotFound => {
                    Err(ObjectStoreError::NotFound(name.to_string()))
                }
                Err(error) => Err(ObjectStoreError::Backend(error.to_string())),
            }
        })
        .await
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        let path = self.path_for(name)?;
        with_timeout(self.timeout_ms, async move {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                // Deleting a missing object is not an error, same as S3.
                Err(error) if error.kind() == ErrorKind::NotFound => Ok(()),
                Err(error) => Err(ObjectStoreError::Backend(error.to_string())),
            }
        })
        .await
    }

    fn driver_name(&self) -> &'static str {
        "fs"
    }
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::FsObjectStore;
    use crate::object_store::{ObjectStore, ObjectStoreError, StoredFile};

    #[tokio::test]
    async fn fs_store_writes_reads_and_deletes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsObjectStore::open(dir.path().join("images"), 1_000).await?;

        store
            .upload(StoredFile::new("a.jpg", b"jpeg-bytes".to_vec()))
            .await?;
        let fetched = store.get("a.jpg").await?;
        assert_eq!(fetched.bytes, b"jpeg-bytes".to_vec());

        store.delete("a.jpg").await?;
        store.delete("a.jpg").await?;
        assert!(matches!(
            store.get("a.jpg").await,
            Err(ObjectStoreError::NotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn fs_store_refuses_keys_outside_root() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let store = FsObjectStore::open(dir.path(), 1_000).await?;
        let result = store
            .upload(StoredFile::new("../escape.png", vec![0]))
            .await;
        assert!(matches!(result, Err(ObjectStoreError::InvalidKey(_))));
        Ok(())
    }
}
