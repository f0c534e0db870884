use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{CairnError, CairnResult};
use crate::repository::{Blob, BlobStore};

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, Blob>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.blobs.read().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs.read().contains_key(key)
    }
}

impl BlobStore for MemoryBlobStore {
    async fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        tags: BTreeMap<String, String>,
    ) -> CairnResult<()> {
        self.blobs
            .write()
            .insert(key.to_string(), Blob { content, tags });
        Ok(())
    }

    async fn get(&self, key: &str) -> CairnResult<Blob> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CairnError::not_found("blob", key))
    }

    async fn delete(&self, key: &str) -> CairnResult<()> {
        self.blobs.write().remove(key);
        Ok(())
    }
}
