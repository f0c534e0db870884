//! Persisting signed certificate chains.

use std::collections::BTreeMap;
use std::sync::Arc;

use cairn_core::repository::BlobStore;
use cairn_core::{CairnError, CairnResult, ResourceLocator};
use tracing::debug;

/// `certs/{nsKind}/{nsId}/{certId}.pem`
pub fn certificate_blob_key(locator: &ResourceLocator) -> String {
    let namespace = locator.namespace();
    format!(
        "certs/{}/{}/{}.pem",
        namespace.kind(),
        namespace.id(),
        locator.resource().id()
    )
}

pub trait StorageProvider: Send + Sync {
    /// Store `chain_pem` for `certificate` and return its blob key.
    fn store(
        &self,
        certificate: &ResourceLocator,
        chain_pem: &str,
        issuer: &ResourceLocator,
        thumbprint: &str,
    ) -> impl Future<Output = CairnResult<String>> + Send;

    fn load_chain(&self, blob_key: &str) -> impl Future<Output = CairnResult<String>> + Send;

    fn remove(&self, blob_key: &str) -> impl Future<Output = CairnResult<()>> + Send;
}

pub struct BlobStorageProvider<B> {
    blobs: Arc<B>,
}

impl<B: BlobStore> BlobStorageProvider<B> {
    pub fn new(blobs: Arc<B>) -> Self {
        Self { blobs }
    }
}

impl<B: BlobStore> StorageProvider for BlobStorageProvider<B> {
    async fn store(
        &self,
        certificate: &ResourceLocator,
        chain_pem: &str,
        issuer: &ResourceLocator,
        thumbprint: &str,
    ) -> CairnResult<String> {
        let key = certificate_blob_key(certificate);
        let tags = BTreeMap::from([
            ("issuer".to_string(), issuer.to_string()),
            ("thumbprint".to_string(), thumbprint.to_string()),
        ]);
        self.blobs
            .put(&key, chain_pem.as_bytes().to_vec(), tags)
            .await?;
        debug!(blob = %key, "Stored certificate chain");
        Ok(key)
    }

    async fn load_chain(&self, blob_key: &str) -> CairnResult<String> {
        let blob = self.blobs.get(blob_key).await?;
        String::from_utf8(blob.content)
            .map_err(|e| CairnError::Internal(format!("chain blob {blob_key} is not UTF-8: {e}")))
    }

    async fn remove(&self, blob_key: &str) -> CairnResult<()> {
        self.blobs.delete(blob_key).await
    }
}

#[cfg(test)]
mod tests {
    use cairn_core::memory::MemoryBlobStore;

    use super::*;

    fn locator() -> ResourceLocator {
        "group:4f7c1b5e-2a0d-4d8e-9a43-5c3b8f1e7d20/cert:0b6f2f3e-8f61-4c41-9d0a-1b2c3d4e5f60"
            .parse()
            .unwrap()
    }

    #[test]
    fn blob_key_is_deterministic() {
        assert_eq!(
            certificate_blob_key(&locator()),
            "certs/group/4f7c1b5e-2a0d-4d8e-9a43-5c3b8f1e7d20/0b6f2f3e-8f61-4c41-9d0a-1b2c3d4e5f60.pem"
        );
    }

    #[tokio::test]
    async fn stores_chain_with_tags() {
        let blobs = Arc::new(MemoryBlobStore::new());
        let storage = BlobStorageProvider::new(Arc::clone(&blobs));
        let issuer: ResourceLocator = "caInt:services/cert:6a1f0c2d-3b4e-4f50-8a61-7b8c9d0e1f23"
            .parse()
            .unwrap();

        let key = storage
            .store(&locator(), "PEM", &issuer, "abcd")
            .await
            .unwrap();
        let blob = blobs.get(&key).await.unwrap();
        assert_eq!(blob.tags["issuer"], issuer.to_string());
        assert_eq!(blob.tags["thumbprint"], "abcd");
        assert_eq!(storage.load_chain(&key).await.unwrap(), "PEM");

        storage.remove(&key).await.unwrap();
        assert!(!blobs.contains(&key));
    }
}
