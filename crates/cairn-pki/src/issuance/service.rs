//! Certificate issuance and lifecycle.

use std::sync::Arc;

use cairn_core::clock::Clock;
use cairn_core::context::RequestContext;
use cairn_core::digest::thumbprint;
use cairn_core::models::{
    CertPolicyDoc, CertificateDoc, CertificateStatus, Document, DocumentBase,
};
use cairn_core::repository::{
    BlobStore, DocumentPatch, DocumentQuery, DocumentStore, PaginatedResult, Pagination,
    QueryOrder, WriteCondition,
};
use cairn_core::vault::{KeyVault, vault_object_name};
use cairn_core::{CairnError, CairnResult, ResourceIdentifier, ResourceKind, ResourceLocator};
use chrono::{Duration, Months, SubsecRound};
use rcgen::{CertificateParams, CertificateSigningRequestParams, Issuer};
use serde_json::{Value, json};
use tokio::runtime::Handle;
use tracing::{error, info, instrument, warn};

use super::remote_key::run_blocking;
use super::request::{
    CertificateRequestProvider, CleanupAction, CsrRequestProvider, ExternalKeyRequestProvider,
    InFlightTracker, InFlightVaultObject, RequestMaterial, RequestOutcome,
    SelfSignedRequestProvider,
};
use super::signer::{SignerProvider, VaultSignerProvider};
use super::storage::{BlobStorageProvider, StorageProvider};
use super::x509::{CertificateProfile, certificate_params, certificate_pem, random_serial};
use crate::chain::resolve_certificate;
use crate::config::IssuanceConfig;
use crate::template::{self, TemplateContext};

/// Per-call issuance inputs beyond the policy.
#[derive(Debug, Clone, Default)]
pub struct IssueOptions {
    /// Values for `{{ns.*}}` placeholders. Defaults to the policy
    /// namespace's id and kind.
    pub variables: Option<TemplateContext>,
    /// DER `SubjectPublicKeyInfo` to certify instead of creating a vault
    /// key.
    pub public_key: Option<Vec<u8>>,
}

pub struct CertificateService<S, B, V>
where
    S: DocumentStore + 'static,
    B: BlobStore + 'static,
    V: KeyVault + 'static,
{
    store: Arc<S>,
    storage: Arc<BlobStorageProvider<B>>,
    vault: Arc<V>,
    clock: Arc<dyn Clock>,
    config: IssuanceConfig,
}

impl<S, B, V> CertificateService<S, B, V>
where
    S: DocumentStore + 'static,
    B: BlobStore + 'static,
    V: KeyVault + 'static,
{
    pub fn new(
        store: Arc<S>,
        blobs: Arc<B>,
        vault: Arc<V>,
        clock: Arc<dyn Clock>,
        config: IssuanceConfig,
    ) -> Self {
        Self {
            store,
            storage: Arc::new(BlobStorageProvider::new(blobs)),
            vault,
            clock,
            config,
        }
    }

    pub async fn issue_certificate(
        &self,
        ctx: &RequestContext,
        policy: &CertPolicyDoc,
    ) -> CairnResult<CertificateDoc> {
        self.issue_certificate_with(ctx, policy, IssueOptions::default())
            .await
    }

    /// Issue one certificate from `policy`.
    ///
    /// On error, no vault object created by this call is left enabled and
    /// the certificate document is either absent or in `error` state.
    #[instrument(skip_all, fields(policy = %policy.base.locator()))]
    pub async fn issue_certificate_with(
        &self,
        ctx: &RequestContext,
        policy: &CertPolicyDoc,
        options: IssueOptions,
    ) -> CairnResult<CertificateDoc> {
        let namespace = &policy.base.namespace;

        // 1. Caller checks.
        ctx.authorize(namespace)?;
        ctx.ensure_active("issue certificate")?;
        if policy.base.is_deleted() {
            return Err(CairnError::not_found(
                "certificate policy",
                policy.base.locator(),
            ));
        }

        // 2. Render subject and SANs before any vault call.
        let variables = options
            .variables
            .unwrap_or_else(|| TemplateContext::for_namespace(namespace));
        let subject = policy
            .subject
            .try_map(|value| template::render(value, &variables))?;
        let sans = policy
            .sans
            .try_map(|value| template::render(value, &variables))?;

        // 3. Load the issuer unless the policy signs itself.
        let now = self.clock.now().trunc_subsecs(0);
        let signer = if policy.is_self_signed() {
            None
        } else {
            Some(
                VaultSignerProvider::load(
                    &*self.store,
                    &*self.storage,
                    Arc::clone(&self.vault),
                    &policy.issuer_namespace,
                    now,
                )
                .await?,
            )
        };

        // 4. Build the certificate template. It never outlives its issuer.
        let locator = namespace.locate(ResourceIdentifier::new_cert());
        let not_before = now - Duration::seconds(self.config.backdate_secs as i64);
        let mut not_after = now
            .checked_add_months(Months::new(policy.validity_months))
            .ok_or_else(|| {
                CairnError::Internal(format!(
                    "validity of {} months overflows",
                    policy.validity_months
                ))
            })?;
        if let Some(issuer_end) = signer.as_ref().and_then(|s| s.certificate().not_after) {
            not_after = not_after.min(issuer_end);
        }
        let profile = CertificateProfile {
            subject: subject.clone(),
            sans: sans.clone(),
            usages: policy.usages.clone(),
            key_type: policy.key_spec.kty,
            serial: random_serial(),
            not_before,
            not_after,
        };
        let params = certificate_params(&profile)?;

        let pending = CertificateDoc {
            base: DocumentBase::new(locator.clone()),
            status: CertificateStatus::Pending,
            serial_number: Some(hex::encode(&profile.serial)),
            subject: subject.to_string(),
            sans,
            not_before: Some(not_before),
            not_after: Some(not_after),
            issued_at: None,
            usages: policy.usages.clone(),
            key_spec: policy.key_spec.clone(),
            policy: policy.base.locator(),
            policy_version: policy.version.clone(),
            issuer: signer
                .as_ref()
                .map(|s| s.certificate().locator())
                .unwrap_or_else(|| locator.clone()),
            blob_key: None,
            thumbprint: None,
            vault_key: None,
            alias_to: None,
            error_message: None,
        };

        // 5. Pick the request flow.
        let key_name = vault_object_name(namespace, &policy.base.id);
        let vault = Arc::clone(&self.vault);
        let key_spec = policy.key_spec.clone();
        match (options.public_key, signer) {
            (Some(_), None) => Err(CairnError::capability(
                "a self-signed certificate cannot certify an external public key",
            )),
            (Some(spki), Some(signer)) => {
                let provider = ExternalKeyRequestProvider::new(spki, key_spec, params);
                self.run(ctx, pending, provider, Some(signer)).await
            }
            (None, None) => {
                let provider = SelfSignedRequestProvider::new(vault, key_name, key_spec, params);
                self.run(ctx, pending, provider, None::<VaultSignerProvider<V>>)
                    .await
            }
            (None, Some(signer)) => {
                let provider = CsrRequestProvider::new(vault, key_name, key_spec, params);
                self.run(ctx, pending, provider, Some(signer)).await
            }
        }
    }

    async fn run<P, G>(
        &self,
        ctx: &RequestContext,
        pending: CertificateDoc,
        mut provider: P,
        signer: Option<G>,
    ) -> CairnResult<CertificateDoc>
    where
        P: CertificateRequestProvider<V>,
        G: SignerProvider<V>,
    {
        let locator = pending.locator();
        let pending: CertificateDoc = self
            .store
            .upsert(ctx, pending.into(), WriteCondition::IfNoneMatch)
            .await?
            .into_typed()?;
        info!(certificate = %locator, "Certificate pending");

        let mut guard = InFlightGuard {
            store: Arc::clone(&self.store),
            vault: Arc::clone(&self.vault),
            ctx: ctx.elevate("issuance cleanup"),
            certificate: locator.clone(),
            in_flight: provider.in_flight(),
            document_settled: false,
        };

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancellation().cancelled() => Err(CairnError::Cancelled {
                operation: "issue certificate".into(),
            }),
            result = self.sign_and_store(ctx, &pending, &mut provider, signer.as_ref()) => result,
        };

        match outcome {
            Ok(issued) => {
                if let Err(err) = provider.close(ctx, RequestOutcome::Succeeded).await {
                    warn!(certificate = %locator, error = %err, "Closing certificate request failed");
                }
                guard.in_flight.clear();
                guard.document_settled = true;
                info!(
                    certificate = %locator,
                    thumbprint = issued.thumbprint.as_deref().unwrap_or_default(),
                    "Certificate issued"
                );
                Ok(issued)
            }
            Err(err) => {
                warn!(certificate = %locator, error = %err, "Certificate issuance failed");
                match provider.close(ctx, RequestOutcome::Failed).await {
                    Ok(()) => guard.in_flight.clear(),
                    Err(close_err) => error!(
                        certificate = %locator,
                        error = %close_err,
                        "Releasing in-flight vault object failed"
                    ),
                }
                mark_failed(&*self.store, &guard.ctx, &locator, &err.to_string()).await;
                guard.document_settled = true;
                Err(err)
            }
        }
    }

    async fn sign_and_store<P, G>(
        &self,
        ctx: &RequestContext,
        pending: &CertificateDoc,
        provider: &mut P,
        signer: Option<&G>,
    ) -> CairnResult<CertificateDoc>
    where
        P: CertificateRequestProvider<V>,
        G: SignerProvider<V>,
    {
        let locator = pending.locator();

        // 1. Subject key material; may create vault objects.
        let request = provider.load(ctx).await?;
        ctx.ensure_active("issue certificate")?;

        // 2. Sign.
        let leaf_der = sign(request.params, request.material, signer).await?;
        let mut chain_pem = certificate_pem(&leaf_der);
        if let Some(signer) = signer {
            chain_pem.push_str(signer.chain_pem());
        }
        ctx.ensure_active("issue certificate")?;

        // 3. Hand the chain back to whoever holds the key.
        provider
            .collect_certificate_chain(&chain_pem, &request.key_spec)
            .await?;

        // 4. Persist the chain.
        let thumbprint = thumbprint(&leaf_der);
        let blob_key = self
            .storage
            .store(&locator, &chain_pem, &pending.issuer, &thumbprint)
            .await?;

        // 5. Mark issued.
        let etag = pending
            .base
            .etag
            .clone()
            .ok_or_else(|| CairnError::Internal(format!("{locator} was read without an etag")))?;
        let mut patch = DocumentPatch::new()
            .set("/status", json!(CertificateStatus::Issued.as_str()))
            .set("/iat", to_json(self.clock.now())?)
            .set("/thumbprint", json!(thumbprint))
            .set("/blobKey", json!(blob_key));
        if let Some(key) = &request.vault_key {
            patch = patch.set("/vaultKey", to_json(key)?);
        }
        match self.store.patch(ctx, &locator, &patch, &etag).await {
            Ok(doc) => doc.into_typed(),
            Err(err) => {
                if let Err(remove_err) = self.storage.remove(&blob_key).await {
                    warn!(blob = %blob_key, error = %remove_err, "Removing orphaned chain failed");
                }
                Err(err)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub async fn get_certificate(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
    ) -> CairnResult<CertificateDoc> {
        ctx.authorize(locator.namespace())?;
        let cert: CertificateDoc = self.store.get_typed(locator).await?;
        if cert.base.is_deleted() {
            return Err(CairnError::not_found("certificate", locator));
        }
        Ok(cert)
    }

    /// Certificates issued under `policy`, newest first.
    pub async fn list_certificates(
        &self,
        ctx: &RequestContext,
        policy: &ResourceLocator,
        pagination: Pagination,
    ) -> CairnResult<PaginatedResult<CertificateDoc>> {
        ctx.authorize(policy.namespace())?;
        let query = DocumentQuery::new(policy.namespace().clone(), ResourceKind::Cert)
            .with_policy(policy.clone())
            .order_by(QueryOrder::IssuedAtDesc)
            .offset(pagination.offset)
            .limit(pagination.limit);
        let page = self.store.query(&query).await?;
        let items = page
            .items
            .into_iter()
            .map(Document::into_typed)
            .collect::<CairnResult<Vec<CertificateDoc>>>()?;
        Ok(PaginatedResult {
            items,
            total: page.total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    /// Issued certificates are soft-deleted and their key disabled. A
    /// certificate that never reached `issued` is removed along with its
    /// vault objects.
    pub async fn delete_certificate(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
    ) -> CairnResult<()> {
        ctx.authorize(locator.namespace())?;
        let cert: CertificateDoc = self.store.get_typed(locator).await?;
        if cert.base.is_deleted() {
            return Ok(());
        }

        if cert.is_issued() {
            self.store.soft_delete(ctx, locator).await?;
            if let Some(key) = &cert.vault_key {
                self.vault.set_key_enabled(key, false).await?;
            }
            info!(certificate = %locator, "Certificate deleted");
            return Ok(());
        }

        if let Some(key) = &cert.vault_key {
            release(&*self.vault, &InFlightVaultObject {
                key: key.clone(),
                action: CleanupAction::Delete,
            })
            .await?;
        }
        if let Some(blob_key) = &cert.blob_key {
            self.storage.remove(blob_key).await?;
        }
        self.store.hard_delete(locator).await?;
        info!(
            certificate = %locator,
            status = cert.status.as_str(),
            "Unissued certificate removed"
        );
        Ok(())
    }

    /// PEM chain of an issued certificate, leaf first. Linked
    /// certificates resolve to the chain of the certificate they mirror.
    pub async fn get_certificate_chain_pem(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
    ) -> CairnResult<String> {
        ctx.authorize(locator.namespace())?;
        let cert = resolve_certificate(&*self.store, locator).await?;
        if !cert.is_issued() {
            return Err(CairnError::not_found("issued certificate", locator));
        }
        let blob_key = cert.blob_key.as_deref().ok_or_else(|| {
            CairnError::Internal(format!("issued certificate {} has no chain", cert.locator()))
        })?;
        self.storage.load_chain(blob_key).await
    }
}

// ---------------------------------------------------------------------------
// Signing
// ---------------------------------------------------------------------------

async fn sign<V, G>(
    params: CertificateParams,
    material: RequestMaterial<V>,
    signer: Option<&G>,
) -> CairnResult<Vec<u8>>
where
    V: KeyVault + 'static,
    G: SignerProvider<V>,
{
    let issuer = signer.map(|s| (s.certificate_pem().to_string(), s.signing_key()));
    run_blocking(move || {
        let cert = match (material, issuer) {
            (RequestMaterial::SelfSigned(key), _) => params
                .self_signed(&key)
                .map_err(|e| key.explain("self-signed certificate", e))?,
            (RequestMaterial::Csr(csr_pem), Some((issuer_pem, key))) => {
                let mut csr = CertificateSigningRequestParams::from_pem(&csr_pem)
                    .map_err(|e| CairnError::Internal(format!("vault CSR: {e}")))?;
                csr.params = params;
                let issuer = Issuer::from_ca_cert_pem(&issuer_pem, key.clone())
                    .map_err(|e| CairnError::Internal(format!("issuer certificate: {e}")))?;
                csr.signed_by(&issuer)
                    .map_err(|e| key.explain("certificate signing", e))?
            }
            (RequestMaterial::PublicKey(subject), Some((issuer_pem, key))) => {
                let issuer = Issuer::from_ca_cert_pem(&issuer_pem, key.clone())
                    .map_err(|e| CairnError::Internal(format!("issuer certificate: {e}")))?;
                params
                    .signed_by(&subject, &issuer)
                    .map_err(|e| key.explain("certificate signing", e))?
            }
            (_, None) => {
                return Err(CairnError::Internal(
                    "certificate request needs an issuer".into(),
                ));
            }
        };
        Ok(cert.der().to_vec())
    })
    .await
}

fn to_json<T: serde::Serialize>(value: T) -> CairnResult<Value> {
    serde_json::to_value(value).map_err(|e| CairnError::Internal(format!("serialize: {e}")))
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

async fn release<V: KeyVault>(vault: &V, object: &InFlightVaultObject) -> CairnResult<()> {
    match object.action {
        CleanupAction::Disable => vault.set_key_enabled(&object.key, false).await,
        CleanupAction::Delete => {
            vault.delete_certificate(&object.key).await?;
            vault.delete_key(&object.key).await
        }
    }
}

/// Move a certificate to `error`, or remove it if that write fails.
async fn mark_failed<S: DocumentStore>(
    store: &S,
    ctx: &RequestContext,
    locator: &ResourceLocator,
    message: &str,
) {
    let patch = DocumentPatch::new()
        .set("/status", json!(CertificateStatus::Error.as_str()))
        .set("/errorMessage", json!(message));
    let patched = match store.get(locator).await {
        Ok(doc) => match doc.etag().cloned() {
            Some(etag) => store.patch(ctx, locator, &patch, &etag).await.map(|_| ()),
            None => Err(CairnError::Internal(format!("{locator} has no etag"))),
        },
        Err(err) => Err(err),
    };
    if let Err(err) = patched {
        warn!(certificate = %locator, error = %err, "Marking certificate failed did not stick; removing it");
        if let Err(err) = store.hard_delete(locator).await {
            error!(certificate = %locator, error = %err, "Certificate left pending");
        }
    }
}

/// Finishes compensation on a background task if issuance is dropped
/// before it settles.
struct InFlightGuard<S, V>
where
    S: DocumentStore + 'static,
    V: KeyVault + 'static,
{
    store: Arc<S>,
    vault: Arc<V>,
    ctx: RequestContext,
    certificate: ResourceLocator,
    in_flight: InFlightTracker,
    document_settled: bool,
}

impl<S, V> Drop for InFlightGuard<S, V>
where
    S: DocumentStore + 'static,
    V: KeyVault + 'static,
{
    fn drop(&mut self) {
        if self.in_flight.is_empty() && self.document_settled {
            return;
        }
        let Ok(handle) = Handle::try_current() else {
            error!(certificate = %self.certificate, "No runtime to clean up abandoned issuance");
            return;
        };
        warn!(certificate = %self.certificate, "Issuance abandoned; cleaning up in the background");

        let store = Arc::clone(&self.store);
        let vault = Arc::clone(&self.vault);
        let ctx = self.ctx.clone();
        let locator = self.certificate.clone();
        let object = self.in_flight.take();
        let settle_document = !self.document_settled;
        handle.spawn(async move {
            if let Some(object) = object {
                if let Err(err) = release(&*vault, &object).await {
                    error!(key = %object.key, error = %err, "Releasing abandoned vault object failed");
                }
            }
            if settle_document {
                mark_failed(&*store, &ctx, &locator, "issuance was abandoned").await;
            }
        });
    }
}
