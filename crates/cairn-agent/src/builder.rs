//! Building agent clients from an instance's documents.

use std::future::Future;
use std::sync::Arc;

use cairn_auth::{AuthConfig, BearerToken, VaultTokenSigner};
use cairn_core::clock::Clock;
use cairn_core::context::RequestContext;
use cairn_core::models::{AgentConfigDoc, AgentInstanceDoc, CertificateDoc, CertificateStatus};
use cairn_core::repository::{BlobStore, DocumentStore};
use cairn_core::vault::KeyVault;
use cairn_core::{
    CairnError, CairnResult, NamespaceIdentifier, ResourceIdentifier, ResourceKind,
    ResourceLocator,
};
use cairn_pki::chain::resolve_certificate;
use cairn_pki::issuance::x509::parse_pem_chain;
use cairn_pki::issuance::{BlobStorageProvider, StorageProvider};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::client::AgentClient;
use crate::config::PoolConfig;
use crate::error::AgentError;

/// Name of the agent configuration document within a namespace.
pub const AGENT_CONFIG_NAME: &str = "default";

/// A freshly built client and the instant it stops being usable.
#[derive(Debug)]
pub struct BuiltClient<C> {
    pub client: C,
    pub expires_at: DateTime<Utc>,
}

/// Produces a client for an agent instance. The pool calls this on a miss,
/// outside its lock.
pub trait AgentClientBuilder: Send + Sync {
    type Client: Send + Sync + 'static;

    fn build(
        &self,
        ctx: &RequestContext,
        namespace: &NamespaceIdentifier,
        instance: &ResourceIdentifier,
    ) -> impl Future<Output = CairnResult<BuiltClient<Self::Client>>> + Send;
}

/// Builds [`AgentClient`]s from the document store, the certificate blob
/// store, and the key vault.
pub struct VaultAgentClientBuilder<S, B, V> {
    store: Arc<S>,
    storage: BlobStorageProvider<B>,
    vault: Arc<V>,
    clock: Arc<dyn Clock>,
    auth: AuthConfig,
    config: PoolConfig,
}

impl<S, B, V> VaultAgentClientBuilder<S, B, V>
where
    S: DocumentStore,
    B: BlobStore,
    V: KeyVault,
{
    pub fn new(
        store: Arc<S>,
        blobs: Arc<B>,
        vault: Arc<V>,
        clock: Arc<dyn Clock>,
        auth: AuthConfig,
        config: PoolConfig,
    ) -> Self {
        Self {
            store,
            storage: BlobStorageProvider::new(blobs),
            vault,
            clock,
            auth,
            config,
        }
    }

    /// The root of the chain the agent presents.
    async fn trust_anchor(
        &self,
        tls_certificate: &ResourceLocator,
    ) -> CairnResult<reqwest::Certificate> {
        let cert = issued_certificate(&*self.store, tls_certificate).await?;
        let blob_key = cert.blob_key.as_deref().ok_or_else(|| {
            CairnError::Internal(format!("certificate {} has no stored chain", cert.locator()))
        })?;
        let chain = self.storage.load_chain(blob_key).await?;
        let root = parse_pem_chain(&chain)?.pop().ok_or_else(|| {
            AgentError::TrustAnchor(format!("chain of {tls_certificate} is empty"))
        })?;
        Ok(reqwest::Certificate::from_der(&root)
            .map_err(|e| AgentError::TrustAnchor(e.to_string()))?)
    }

    /// A bearer token signed by the key behind `jwt_key`.
    async fn mint_token(
        &self,
        ctx: &RequestContext,
        jwt_key: &ResourceLocator,
        audience: &str,
    ) -> CairnResult<BearerToken> {
        let cert = issued_certificate(&*self.store, jwt_key).await?;
        let key_id = cert.vault_key.clone().ok_or_else(|| {
            CairnError::Internal(format!("certificate {} has no vault key", cert.locator()))
        })?;
        let key = self.vault.get_key(&key_id).await?;
        if !key.enabled {
            return Err(CairnError::capability(format!(
                "token signing key {key_id} is disabled"
            )));
        }

        let signer = VaultTokenSigner::new(
            Arc::clone(&self.vault),
            key_id,
            key.key_spec.alg,
            self.auth.clone(),
        );
        Ok(signer
            .mint(ctx.caller_id(), audience, self.clock.now())
            .await?)
    }

    /// Warn when the instance runs a configuration other than the current one.
    async fn check_config_version(
        &self,
        namespace: &NamespaceIdentifier,
        instance: &AgentInstanceDoc,
    ) {
        let Ok(resource) = ResourceIdentifier::named(ResourceKind::AgentConfig, AGENT_CONFIG_NAME)
        else {
            return;
        };
        let locator = namespace.locate(resource);
        match self.store.get_typed::<AgentConfigDoc>(&locator).await {
            Ok(config) if config.version != instance.config_version => warn!(
                agent = %instance.base.locator(),
                running = %instance.config_version,
                current = %config.version,
                "Agent is running a stale configuration"
            ),
            Ok(_) => {}
            Err(e) => debug!(config = %locator, error = %e, "No agent configuration to compare"),
        }
    }
}

impl<S, B, V> AgentClientBuilder for VaultAgentClientBuilder<S, B, V>
where
    S: DocumentStore,
    B: BlobStore,
    V: KeyVault,
{
    type Client = AgentClient;

    async fn build(
        &self,
        ctx: &RequestContext,
        namespace: &NamespaceIdentifier,
        instance: &ResourceIdentifier,
    ) -> CairnResult<BuiltClient<AgentClient>> {
        if instance.kind() != ResourceKind::AgentInstance {
            return Err(CairnError::InvalidLocator {
                value: instance.to_string(),
                reason: "not an agentInstance resource".into(),
            });
        }

        // 1. Instance document.
        ctx.ensure_active("build agent client")?;
        let locator = namespace.locate(instance.clone());
        let doc: AgentInstanceDoc = self.store.get_typed(&locator).await?;
        if doc.base.is_deleted() {
            return Err(CairnError::not_found("agent instance", &locator));
        }
        self.check_config_version(namespace, &doc).await;

        // 2. Trust the agent's root and nothing else.
        let root = self.trust_anchor(&doc.tls_certificate).await?;

        // 3. Bearer token for the caller.
        ctx.ensure_active("build agent client")?;
        let token = self.mint_token(ctx, &doc.jwt_verify_key, &doc.endpoint).await?;

        // 4. HTTP client.
        let http = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(root)
            .https_only(true)
            .connect_timeout(self.config.connect_timeout())
            .timeout(self.config.request_timeout())
            .build()
            .map_err(AgentError::from)?;

        let expires_at = token.claims.expires_at();
        debug!(agent = %locator, endpoint = %doc.endpoint, %expires_at, "Built agent client");
        Ok(BuiltClient {
            client: AgentClient::new(locator, doc.endpoint, http, token),
            expires_at,
        })
    }
}

async fn issued_certificate<S: DocumentStore>(
    store: &S,
    locator: &ResourceLocator,
) -> CairnResult<CertificateDoc> {
    let cert = resolve_certificate(store, locator).await?;
    if cert.status != CertificateStatus::Issued || cert.base.is_deleted() {
        return Err(CairnError::not_found("issued certificate", locator));
    }
    Ok(cert)
}
