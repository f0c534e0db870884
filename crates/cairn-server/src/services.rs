//! The engines wired to one set of backends, and authority bootstrap.

use std::sync::Arc;

use cairn_agent::{AgentConnectionPool, VaultAgentClientBuilder};
use cairn_core::clock::Clock;
use cairn_core::context::RequestContext;
use cairn_core::models::{RuleKind, SubjectTemplate};
use cairn_core::repository::{BlobStore, DocumentStore};
use cairn_core::vault::KeyVault;
use cairn_core::{
    CairnResult, NamespaceIdentifier, NamespaceKind, ResourceIdentifier, ResourceKind,
};
use cairn_pki::chain::current_issuer_certificate;
use cairn_pki::{
    CapabilityRegistry, CertPolicyService, CertificateService, RuleEngine, TemplateRequest,
};
use tracing::{info, instrument};

use crate::args::Args;

/// Validity of bootstrapped CA certificates.
const ROOT_VALIDITY_MONTHS: u32 = 120;
const INTERMEDIATE_VALIDITY_MONTHS: u32 = 60;

pub struct Services<S, B, V>
where
    S: DocumentStore + 'static,
    B: BlobStore + 'static,
    V: KeyVault + 'static,
{
    pub store: Arc<S>,
    pub vault: Arc<V>,
    pub clock: Arc<dyn Clock>,
    pub policies: CertPolicyService<S>,
    pub certs: CertificateService<S, B, V>,
    pub rules: RuleEngine<S>,
    pub agents: AgentConnectionPool<VaultAgentClientBuilder<S, B, V>>,
}

impl<S, B, V> Services<S, B, V>
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
        args: &Args,
    ) -> CairnResult<Self> {
        let registry = Arc::new(CapabilityRegistry::builtin()?);
        let pool_config = args.pool_config();
        let builder = VaultAgentClientBuilder::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&vault),
            Arc::clone(&clock),
            args.auth_config(),
            pool_config.clone(),
        );

        Ok(Self {
            policies: CertPolicyService::new(Arc::clone(&store), registry),
            certs: CertificateService::new(
                Arc::clone(&store),
                blobs,
                Arc::clone(&vault),
                Arc::clone(&clock),
                args.issuance_config(),
            ),
            rules: RuleEngine::new(Arc::clone(&store), args.convergence_config()),
            agents: AgentConnectionPool::new(builder, Arc::clone(&clock), &pool_config),
            store,
            vault,
            clock,
        })
    }

    /// Make sure the root CA and each named intermediate has a usable
    /// issuer certificate, issuing one where it does not.
    pub async fn bootstrap(
        &self,
        ctx: &RequestContext,
        intermediates: &[String],
    ) -> CairnResult<()> {
        let root = NamespaceIdentifier::named(NamespaceKind::CaRoot, "default")?;
        self.ensure_authority(ctx, &root, "Cairn Root CA", ROOT_VALIDITY_MONTHS)
            .await?;

        for name in intermediates {
            let namespace = NamespaceIdentifier::named(NamespaceKind::CaInt, name)?;
            self.ensure_authority(
                ctx,
                &namespace,
                &format!("Cairn {name} CA"),
                INTERMEDIATE_VALIDITY_MONTHS,
            )
            .await?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(namespace = %namespace))]
    async fn ensure_authority(
        &self,
        ctx: &RequestContext,
        namespace: &NamespaceIdentifier,
        common_name: &str,
        validity_months: u32,
    ) -> CairnResult<()> {
        ctx.ensure_active("bootstrap")?;
        let locator =
            namespace.locate(ResourceIdentifier::named(ResourceKind::CertPolicy, "default")?);
        let request = TemplateRequest {
            subject: SubjectTemplate::common_name(common_name),
            validity_months: Some(validity_months),
            ..Default::default()
        };
        let policy = self.policies.put_cert_policy(ctx, &locator, &request).await?;

        if self.has_usable_issuer(namespace).await {
            info!("Certificate authority already in place");
            return Ok(());
        }

        let cert = self.certs.issue_certificate(ctx, &policy).await?;
        let rule = self
            .rules
            .put_rule(ctx, RuleKind::Issuer, namespace, policy.base.locator())
            .await?;
        info!(
            certificate = %cert.locator(),
            rule_version = %rule.version(),
            "Issued certificate authority"
        );
        Ok(())
    }

    /// The issuer rule points at a valid CA whose key is still enabled.
    async fn has_usable_issuer(&self, namespace: &NamespaceIdentifier) -> bool {
        let now = self.clock.now();
        let Ok(cert) = current_issuer_certificate(&*self.store, namespace, now).await else {
            return false;
        };
        let Some(key) = cert.vault_key.as_ref() else {
            return false;
        };
        matches!(self.vault.get_key(key).await, Ok(key) if key.enabled)
    }
}

#[cfg(test)]
mod tests {
    use cairn_core::clock::SystemClock;
    use cairn_core::memory::{MemoryBlobStore, MemoryDocumentStore, MemoryKeyVault};
    use clap::Parser;

    use super::*;

    fn services() -> Services<MemoryDocumentStore, MemoryBlobStore, MemoryKeyVault> {
        let args = Args::parse_from(["cairn-server"]);
        Services::new(
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryBlobStore::new()),
            Arc::new(MemoryKeyVault::new()),
            Arc::new(SystemClock),
            &args,
        )
        .unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bootstrap_is_idempotent() {
        let services = services();
        let ctx = RequestContext::system();
        let intermediates = vec!["services".to_string()];

        services.bootstrap(&ctx, &intermediates).await.unwrap();
        let keys = services.vault.key_ids().len();
        assert_eq!(keys, 2);

        services.bootstrap(&ctx, &intermediates).await.unwrap();
        assert_eq!(services.vault.key_ids().len(), keys);

        let services_ns = NamespaceIdentifier::named(NamespaceKind::CaInt, "services").unwrap();
        assert!(services.has_usable_issuer(&services_ns).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_issuer_key_is_replaced() {
        let services = services();
        let ctx = RequestContext::system();
        services.bootstrap(&ctx, &[]).await.unwrap();

        let root = NamespaceIdentifier::named(NamespaceKind::CaRoot, "default").unwrap();
        let key = services.vault.key_ids().remove(0);
        services.vault.set_key_enabled(&key, false).await.unwrap();
        assert!(!services.has_usable_issuer(&root).await);

        services.bootstrap(&ctx, &[]).await.unwrap();
        assert!(services.has_usable_issuer(&root).await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_intermediate_is_rejected() {
        let services = services();
        let err = services
            .bootstrap(&RequestContext::system(), &["payroll".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), cairn_core::ErrorKind::InvalidIdentifier);
    }
}
