use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;

pub mod fs;
pub mod s3;

pub use fs::FsObjectStore;
pub use s3::S3ObjectStore;

pub const DEFAULT_OBJECT_STORE_TIMEOUT_MS: u64 = 5_000;

/// A blob in transit. Only lives for the duration of one upload or download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredFile {
    pub name: String,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub size: u64,
}

impl StoredFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let size = bytes.len() as u64;
        Self {
            name: name.into(),
            bytes,
            size,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("invalid object key: {0}")]
    InvalidKey(String),
    #[error("object store timed out after {0}ms")]
    Timeout(u64),
    #[error("object store error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, file: StoredFile) -> Result<(), ObjectStoreError>;

    async fn get(&self, name: &str) -> Result<StoredFile, ObjectStoreError>;

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError>;

    fn driver_name(&self) -> &'static str;
}

pub fn memory() -> Arc<MemoryObjectStore> {
    Arc::new(MemoryObjectStore::default())
}

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub async fn contains(&self, name: &str) -> bool {
        self.objects.lock().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.objects.lock().await.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, file: StoredFile) -> Result<(), ObjectStoreError> {
        validate_key(&file.name)?;
        self.objects.lock().await.insert(file.name, file.bytes);
        Ok(())
    }

    async fn get(&self, name: &str) -> Result<StoredFile, ObjectStoreError> {
        let objects = self.objects.lock().await;
        objects
            .get(name)
            .map(|bytes| StoredFile::new(name, bytes.clone()))
            .ok_or_else(|| ObjectStoreError::NotFound(name.to_string()))
    }

    async fn delete(&self, name: &str) -> Result<(), ObjectStoreError> {
        self.objects.lock().await.remove(name);
        Ok(())
    }

    fn driver_name(&self) -> &'static str {
        "memory"
    }
}

/// Keys are flat names; path separators and parent references are rejected.
pub fn validate_key(name: &str) -> Result<(), ObjectStoreError> {
    let valid = !name.is_empty()
        && name.len() <= 255
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ObjectStoreError::InvalidKey(name.to_string()))
    }
}

pub(crate) async fn with_timeout<T, F>(timeout_ms: u64, future: F) -> Result<T, ObjectStoreError>
where
    F: Future<Output = Result<T, ObjectStoreError>>,
{
    tokio::time::timeout(Duration::from_millis(timeout_ms), future)
        .await
        .map_err(|_| ObjectStoreError::Timeout(timeout_ms))?
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::{ObjectStore, ObjectStoreError, StoredFile, memory, validate_key};

    #[tokio::test]
    async fn memory_store_round_trips_and_reports_missing_keys() -> Result<()> {
        let store = memory();
        store
            .upload(StoredFile::new("photo.png", vec![1, 2, 3]))
            .await?;

        let fetched = store.get("photo.png").await?;
        assert_eq!(fetched.bytes, vec![1, 2, 3]);
        assert_eq!(fetched.size, 3);

        store.delete("photo.png").await?;
        assert!(matches!(
            store.get("photo.png").await,
            Err(ObjectStoreError::NotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn key_validation_rejects_traversal() {
        assert!(validate_key("0190a1b2-image.jpg").is_ok());
        assert!(validate_key("../etc/passwd").is_err());
        assert!(validate_key("nested/key.png").is_err());
        assert!(validate_key("..").is_err());
        assert!(validate_key("").is_err());
    }
}
