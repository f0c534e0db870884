//! Issuer signing handles.

use std::sync::Arc;

use cairn_core::models::CertificateDoc;
use cairn_core::repository::DocumentStore;
use cairn_core::vault::KeyVault;
use cairn_core::{CairnError, CairnResult, NamespaceIdentifier};
use chrono::{DateTime, Utc};
use tracing::debug;

use super::remote_key::RemoteSigningKey;
use super::storage::StorageProvider;
use super::x509::{certificate_pem, parse_pem_chain};
use crate::chain::current_issuer_certificate;

/// An issuer certificate together with a way to sign as it.
pub trait SignerProvider<V>: Send + Sync {
    fn certificate(&self) -> &CertificateDoc;

    /// The issuer's own certificate.
    fn certificate_pem(&self) -> &str;

    /// The issuer's full chain, issuer first.
    fn chain_pem(&self) -> &str;

    fn signing_key(&self) -> RemoteSigningKey<V>;
}

/// Signs with the vault key behind a namespace's current issuer.
pub struct VaultSignerProvider<V> {
    certificate: CertificateDoc,
    certificate_pem: String,
    chain_pem: String,
    key: RemoteSigningKey<V>,
}

impl<V: KeyVault + 'static> VaultSignerProvider<V> {
    pub async fn load<S, P>(
        store: &S,
        storage: &P,
        vault: Arc<V>,
        issuer_namespace: &NamespaceIdentifier,
        now: DateTime<Utc>,
    ) -> CairnResult<Self>
    where
        S: DocumentStore,
        P: StorageProvider,
    {
        let certificate = current_issuer_certificate(store, issuer_namespace, now).await?;
        let key_id = certificate.vault_key.clone().ok_or_else(|| {
            CairnError::Internal(format!(
                "issuer certificate {} has no vault key",
                certificate.locator()
            ))
        })?;
        let key = vault.get_key(&key_id).await?;
        if !key.enabled {
            return Err(CairnError::capability(format!(
                "issuer key {key_id} for {issuer_namespace} is disabled"
            )));
        }

        let blob_key = certificate.blob_key.as_deref().ok_or_else(|| {
            CairnError::Internal(format!(
                "issuer certificate {} has no stored chain",
                certificate.locator()
            ))
        })?;
        let chain_pem = storage.load_chain(blob_key).await?;
        let leaf = parse_pem_chain(&chain_pem)?
            .into_iter()
            .next()
            .map(|der| certificate_pem(&der))
            .ok_or_else(|| CairnError::Internal("issuer chain is empty".into()))?;

        debug!(
            issuer = %certificate.locator(),
            key = %key_id,
            "Loaded issuer signer"
        );
        Ok(Self {
            certificate,
            certificate_pem: leaf,
            chain_pem,
            key: RemoteSigningKey::new(vault, &key)?,
        })
    }
}

impl<V: KeyVault + 'static> SignerProvider<V> for VaultSignerProvider<V> {
    fn certificate(&self) -> &CertificateDoc {
        &self.certificate
    }

    fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    fn chain_pem(&self) -> &str {
        &self.chain_pem
    }

    fn signing_key(&self) -> RemoteSigningKey<V> {
        self.key.clone()
    }
}
