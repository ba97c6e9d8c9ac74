//! In-memory object store (tests and local debugging)

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{ObjectStore, StorageError};

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, (Bytes, Bytes)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    /// Whether an object exists at `path`
    pub async fn contains(&self, path: &str) -> bool {
        self.objects.read().await.contains_key(path)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, path: &str, header: &[u8], payload: Bytes) -> Result<(), StorageError> {
        self.objects
            .write()
            .await
            .insert(path.to_string(), (Bytes::copy_from_slice(header), payload));
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<(Bytes, Bytes), StorageError> {
        self.objects
            .read()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(path.to_string()))
    }
}
