//! Certificate request providers.

use std::collections::BTreeMap;
use std::sync::Arc;

use cairn_core::context::RequestContext;
use cairn_core::models::{KeySpec, KeyType};
use cairn_core::vault::{CreateKeyRequest, KeyVault, VaultKeyId};
use cairn_core::{CairnError, CairnResult};
use parking_lot::Mutex;
use rcgen::CertificateParams;
use tracing::{debug, info, warn};

use super::remote_key::{RemoteSigningKey, run_blocking};
use super::x509::csr_params;
pub use super::x509::SubjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupAction {
    /// Disable the key version; keep it for inspection.
    Disable,
    /// Delete the pending certificate object and its key.
    Delete,
}

/// A vault object created by a request that has not been closed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightVaultObject {
    pub key: VaultKeyId,
    pub action: CleanupAction,
}

/// Shared slot for the vault object a request has created and not yet
/// closed. Providers fill it the moment the object exists, so an issuance
/// dropped at any later await can still release it.
#[derive(Debug, Clone, Default)]
pub struct InFlightTracker(Arc<Mutex<Option<InFlightVaultObject>>>);

impl InFlightTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, object: InFlightVaultObject) {
        *self.0.lock() = Some(object);
    }

    pub fn get(&self) -> Option<InFlightVaultObject> {
        self.0.lock().clone()
    }

    pub fn take(&self) -> Option<InFlightVaultObject> {
        self.0.lock().take()
    }

    pub fn clear(&self) {
        self.0.lock().take();
    }

    pub fn is_empty(&self) -> bool {
        self.0.lock().is_none()
    }
}

/// How the subject's key takes part in signing.
pub enum RequestMaterial<V> {
    /// The subject key signs its own certificate.
    SelfSigned(RemoteSigningKey<V>),
    /// A PEM CSR produced by the vault key, to be signed by an issuer.
    Csr(String),
    /// A public key supplied by the caller, to be signed by an issuer.
    PublicKey(SubjectKey),
}

pub struct CertificateRequest<V> {
    pub params: CertificateParams,
    pub material: RequestMaterial<V>,
    pub key_spec: KeySpec,
    /// Vault key version backing the certificate, if any.
    pub vault_key: Option<VaultKeyId>,
}

/// Produces the template and subject key for one certificate, finalizes
/// it once signed, and cleans up after it.
pub trait CertificateRequestProvider<V>: Send {
    fn load(
        &mut self,
        ctx: &RequestContext,
    ) -> impl Future<Output = CairnResult<CertificateRequest<V>>> + Send;

    /// Hand the signed chain back to whatever holds the key.
    fn collect_certificate_chain(
        &mut self,
        chain_pem: &str,
        key_spec: &KeySpec,
    ) -> impl Future<Output = CairnResult<()>> + Send;

    /// Release in-progress vault objects. After a failure nothing the
    /// provider created may stay usable.
    fn close(
        &mut self,
        ctx: &RequestContext,
        outcome: RequestOutcome,
    ) -> impl Future<Output = CairnResult<()>> + Send;

    /// Where the provider records the vault object to clean up if the
    /// request is abandoned before [`close`](Self::close) succeeds.
    fn in_flight(&self) -> InFlightTracker;
}

fn key_tags(ctx: &RequestContext) -> BTreeMap<String, String> {
    BTreeMap::from([("requested-by".to_string(), ctx.caller_id().to_string())])
}

fn take_params(params: &mut Option<CertificateParams>) -> CairnResult<CertificateParams> {
    params
        .take()
        .ok_or_else(|| CairnError::Internal("certificate request loaded twice".into()))
}

// ---------------------------------------------------------------------------
// Self-signed
// ---------------------------------------------------------------------------

/// Creates a vault key that signs its own certificate.
pub struct SelfSignedRequestProvider<V> {
    vault: Arc<V>,
    name: String,
    key_spec: KeySpec,
    params: Option<CertificateParams>,
    created: Option<VaultKeyId>,
    keep_key: bool,
    in_flight: InFlightTracker,
}

impl<V: KeyVault> SelfSignedRequestProvider<V> {
    pub fn new(vault: Arc<V>, name: String, key_spec: KeySpec, params: CertificateParams) -> Self {
        Self {
            vault,
            name,
            key_spec,
            params: Some(params),
            created: None,
            keep_key: false,
            in_flight: InFlightTracker::new(),
        }
    }

    /// Leave the key enabled even if issuance fails.
    pub fn keep_key(mut self) -> Self {
        self.keep_key = true;
        self
    }
}

impl<V: KeyVault + 'static> CertificateRequestProvider<V> for SelfSignedRequestProvider<V> {
    async fn load(&mut self, ctx: &RequestContext) -> CairnResult<CertificateRequest<V>> {
        let params = take_params(&mut self.params)?;
        let key = self
            .vault
            .create_key(CreateKeyRequest {
                name: self.name.clone(),
                key_spec: self.key_spec.clone(),
                tags: key_tags(ctx),
            })
            .await?;
        self.created = Some(key.id.clone());
        if !self.keep_key {
            self.in_flight.record(InFlightVaultObject {
                key: key.id.clone(),
                action: CleanupAction::Disable,
            });
        }
        debug!(key = %key.id, "Created self-signed key");

        Ok(CertificateRequest {
            params,
            material: RequestMaterial::SelfSigned(RemoteSigningKey::new(
                Arc::clone(&self.vault),
                &key,
            )?),
            key_spec: key.key_spec,
            vault_key: Some(key.id),
        })
    }

    async fn collect_certificate_chain(
        &mut self,
        chain_pem: &str,
        _key_spec: &KeySpec,
    ) -> CairnResult<()> {
        let key = self
            .created
            .as_ref()
            .ok_or_else(|| CairnError::Internal("no key to attach the chain to".into()))?;
        self.vault.merge_certificate(key, chain_pem).await?;
        Ok(())
    }

    async fn close(&mut self, _ctx: &RequestContext, outcome: RequestOutcome) -> CairnResult<()> {
        let Some(key) = self.created.take() else {
            return Ok(());
        };
        if outcome == RequestOutcome::Failed && !self.keep_key {
            self.vault.set_key_enabled(&key, false).await?;
            info!(key = %key, "Disabled key of failed self-signed request");
        }
        self.in_flight.clear();
        Ok(())
    }

    fn in_flight(&self) -> InFlightTracker {
        self.in_flight.clone()
    }
}

// ---------------------------------------------------------------------------
// CA-delegated
// ---------------------------------------------------------------------------

/// Creates a vault key and a CSR for an issuer to sign.
pub struct CsrRequestProvider<V> {
    vault: Arc<V>,
    name: String,
    key_spec: KeySpec,
    params: Option<CertificateParams>,
    created: Option<VaultKeyId>,
    in_flight: InFlightTracker,
}

impl<V: KeyVault> CsrRequestProvider<V> {
    pub fn new(vault: Arc<V>, name: String, key_spec: KeySpec, params: CertificateParams) -> Self {
        Self {
            vault,
            name,
            key_spec,
            params: Some(params),
            created: None,
            in_flight: InFlightTracker::new(),
        }
    }
}

impl<V: KeyVault + 'static> CertificateRequestProvider<V> for CsrRequestProvider<V> {
    async fn load(&mut self, ctx: &RequestContext) -> CairnResult<CertificateRequest<V>> {
        let params = take_params(&mut self.params)?;
        let key = self
            .vault
            .create_key(CreateKeyRequest {
                name: self.name.clone(),
                key_spec: self.key_spec.clone(),
                tags: key_tags(ctx),
            })
            .await?;
        self.created = Some(key.id.clone());
        self.in_flight.record(InFlightVaultObject {
            key: key.id.clone(),
            action: CleanupAction::Delete,
        });

        let signer = RemoteSigningKey::new(Arc::clone(&self.vault), &key)?;
        let request_params = csr_params(&params);
        let csr = run_blocking(move || {
            let request = request_params
                .serialize_request(&signer)
                .map_err(|e| signer.explain("certificate signing request", e))?;
            request
                .pem()
                .map_err(|e| CairnError::Internal(format!("CSR PEM: {e}")))
        })
        .await?;
        debug!(key = %key.id, "Created certificate signing request");

        Ok(CertificateRequest {
            params,
            material: RequestMaterial::Csr(csr),
            key_spec: key.key_spec,
            vault_key: Some(key.id),
        })
    }

    async fn collect_certificate_chain(
        &mut self,
        chain_pem: &str,
        _key_spec: &KeySpec,
    ) -> CairnResult<()> {
        let key = self
            .created
            .as_ref()
            .ok_or_else(|| CairnError::Internal("no pending certificate to merge into".into()))?;
        self.vault.merge_certificate(key, chain_pem).await?;
        Ok(())
    }

    async fn close(&mut self, _ctx: &RequestContext, outcome: RequestOutcome) -> CairnResult<()> {
        let Some(key) = self.created.take() else {
            return Ok(());
        };
        if outcome == RequestOutcome::Failed {
            self.vault.delete_certificate(&key).await?;
            self.vault.delete_key(&key).await?;
            info!(key = %key, "Deleted pending certificate of failed request");
        }
        self.in_flight.clear();
        Ok(())
    }

    fn in_flight(&self) -> InFlightTracker {
        self.in_flight.clone()
    }
}

// ---------------------------------------------------------------------------
// External public key
// ---------------------------------------------------------------------------

/// Certifies a caller-supplied public key; creates nothing in the vault.
pub struct ExternalKeyRequestProvider {
    spki_der: Vec<u8>,
    key_spec: KeySpec,
    params: Option<CertificateParams>,
}

impl ExternalKeyRequestProvider {
    pub fn new(spki_der: Vec<u8>, key_spec: KeySpec, params: CertificateParams) -> Self {
        Self {
            spki_der,
            key_spec,
            params: Some(params),
        }
    }
}

impl<V: KeyVault + 'static> CertificateRequestProvider<V> for ExternalKeyRequestProvider {
    async fn load(&mut self, _ctx: &RequestContext) -> CairnResult<CertificateRequest<V>> {
        let params = take_params(&mut self.params)?;
        let key = SubjectKey::from_spki_der(&self.spki_der)?;

        let expected = match self.key_spec.kty {
            KeyType::Ec => self.key_spec.crv.map(|c| match c {
                cairn_core::models::Curve::P256 => 256,
                cairn_core::models::Curve::P384 => 384,
            }),
            KeyType::Rsa => self.key_spec.key_size.map(|s| s as usize),
        };
        if key.key_type() != self.key_spec.kty || expected != Some(key.size()) {
            return Err(CairnError::capability(format!(
                "supplied {} {}-bit key does not match the policy key spec {}",
                key.key_type(),
                key.size(),
                self.key_spec.canonical()
            )));
        }

        Ok(CertificateRequest {
            params,
            material: RequestMaterial::PublicKey(key),
            key_spec: self.key_spec.clone(),
            vault_key: None,
        })
    }

    async fn collect_certificate_chain(
        &mut self,
        _chain_pem: &str,
        _key_spec: &KeySpec,
    ) -> CairnResult<()> {
        Ok(())
    }

    async fn close(&mut self, _ctx: &RequestContext, outcome: RequestOutcome) -> CairnResult<()> {
        if outcome == RequestOutcome::Failed {
            warn!("Issuance for an external public key failed; nothing to clean up");
        }
        Ok(())
    }

    fn in_flight(&self) -> InFlightTracker {
        InFlightTracker::new()
    }
}
