//! Rule convergence.
//!
//! A rule names the policy that is authoritative for a purpose in a
//! namespace and caches the locators of the newest certificates that
//! policy produced. Convergence re-derives those locators, links
//! certificates owned by other namespaces into the rule's namespace, and
//! patches the rule only when the derived version moved.

use std::sync::Arc;

use cairn_core::context::RequestContext;
use cairn_core::digest::VersionDigest;
use cairn_core::models::{
    CertPolicyDoc, CertificateDoc, CertificateStatus, Document, DocumentBase, RuleDoc, RuleKind,
};
use cairn_core::repository::{
    DocumentPatch, DocumentQuery, DocumentStore, QueryOrder, WriteCondition,
};
use cairn_core::{CairnError, CairnResult, NamespaceIdentifier, ResourceKind, ResourceLocator};
use serde_json::{Value, json};
use tracing::{debug, info, instrument};

use crate::config::ConvergenceConfig;

/// `MD5(policy ‖ each resolved certificate locator)`.
pub fn rule_version(policy: &ResourceLocator, certificates: &[ResourceLocator]) -> String {
    certificates
        .iter()
        .fold(VersionDigest::new().field(policy.to_string()), |digest, cert| {
            digest.field(cert.to_string())
        })
        .finish()
}

pub struct RuleEngine<S: DocumentStore> {
    store: Arc<S>,
    config: ConvergenceConfig,
}

impl<S: DocumentStore> RuleEngine<S> {
    pub fn new(store: Arc<S>, config: ConvergenceConfig) -> Self {
        Self { store, config }
    }

    /// Create the rule or point it at a new policy, then converge it.
    #[instrument(skip_all, fields(rule = kind.name(), namespace = %namespace, policy = %policy))]
    pub async fn put_rule(
        &self,
        ctx: &RequestContext,
        kind: RuleKind,
        namespace: &NamespaceIdentifier,
        policy: ResourceLocator,
    ) -> CairnResult<RuleDoc> {
        ctx.authorize(namespace)?;
        if policy.resource_kind() != ResourceKind::CertPolicy {
            return Err(CairnError::InvalidLocator {
                value: policy.to_string(),
                reason: "a rule must reference a certPolicy".into(),
            });
        }
        let policy_doc: CertPolicyDoc = self.store.get_typed(&policy).await?;
        if policy_doc.base.is_deleted() {
            return Err(CairnError::not_found("certificate policy", &policy));
        }

        let locator = namespace.locate(kind.resource());
        match self.store.find(&locator).await? {
            None => {
                let rule = RuleDoc::initial(kind, DocumentBase::new(locator.clone()), policy);
                self.store
                    .upsert(ctx, rule.into(), WriteCondition::IfNoneMatch)
                    .await?;
                info!(rule = %locator, "Rule created");
            }
            Some(doc) => {
                let mut rule = into_rule(doc, &locator)?;
                if rule.policy() != &policy || rule.base().is_deleted() {
                    let etag = rule.base().etag.clone().ok_or_else(|| missing_etag(&locator))?;
                    rule.set_policy(policy);
                    rule.base_mut().deleted = None;
                    self.store
                        .upsert(ctx, rule.into(), WriteCondition::IfMatch(etag))
                        .await?;
                    info!(rule = %locator, "Rule policy updated");
                }
            }
        }

        self.converge_rule(ctx, kind, namespace).await
    }

    /// Bring the rule in line with the certificates its policy has issued.
    ///
    /// Runs elevated: linking reads and writes outside the caller's reach.
    /// Concurrent updates are retried up to the configured limit.
    #[instrument(skip_all, fields(rule = kind.name(), namespace = %namespace))]
    pub async fn converge_rule(
        &self,
        ctx: &RequestContext,
        kind: RuleKind,
        namespace: &NamespaceIdentifier,
    ) -> CairnResult<RuleDoc> {
        ctx.authorize(namespace)?;
        let system = ctx.elevate("rule convergence");
        let locator = namespace.locate(kind.resource());

        let mut attempt = 0;
        loop {
            system.ensure_active("converge rule")?;
            match self.converge_once(&system, &locator).await {
                Err(CairnError::Conflict { .. }) if attempt < self.config.max_retries => {
                    attempt += 1;
                    debug!(rule = %locator, attempt, "Rule changed concurrently; retrying");
                }
                result => return result,
            }
        }
    }

    async fn converge_once(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
    ) -> CairnResult<RuleDoc> {
        // 1. Load the rule.
        let rule = into_rule(self.store.get(locator).await?, locator)?;
        if rule.base().is_deleted() {
            return Err(CairnError::not_found("rule", locator));
        }
        let etag = rule.base().etag.clone().ok_or_else(|| missing_etag(locator))?;
        let kind = rule.kind();
        let policy = rule.policy().clone();

        // 2. Newest issued certificates of the policy.
        let query = DocumentQuery::new(policy.namespace().clone(), ResourceKind::Cert)
            .with_status(CertificateStatus::Issued)
            .with_policy(policy.clone())
            .order_by(QueryOrder::IssuedAtDesc)
            .limit(kind.max_certificates() as u64);
        let issued = self
            .store
            .query(&query)
            .await?
            .items
            .into_iter()
            .map(Document::into_typed)
            .collect::<CairnResult<Vec<CertificateDoc>>>()?;

        // 3. Link certificates owned elsewhere.
        let namespace = locator.namespace();
        let mut resolved = Vec::with_capacity(issued.len());
        for cert in issued.iter().filter(|c| !c.is_alias()) {
            if &cert.base.namespace == namespace {
                resolved.push(cert.locator());
            } else {
                resolved.push(self.link(ctx, cert, namespace).await?);
            }
        }

        // 4. Diff.
        let version = rule_version(&policy, &resolved);
        if version == rule.version() && resolved == rule.certificates() {
            debug!(rule = %locator, version = %version, "Rule already converged");
            return Ok(rule);
        }

        // 5. Patch only the derived fields.
        let patch = match kind {
            RuleKind::Issuer => DocumentPatch::new().set(
                "/certificate",
                resolved
                    .first()
                    .map(|l| Value::String(l.to_string()))
                    .unwrap_or(Value::Null),
            ),
            RuleKind::MsEntraClientCredential => DocumentPatch::new().set(
                "/certificates",
                Value::Array(
                    resolved
                        .iter()
                        .map(|l| Value::String(l.to_string()))
                        .collect(),
                ),
            ),
        }
        .set("/version", json!(version));

        let patched = self.store.patch(ctx, locator, &patch, &etag).await?;
        info!(
            rule = %locator,
            certificates = resolved.len(),
            version = %version,
            "Rule converged"
        );
        into_rule(patched, locator)
    }

    /// Mirror `cert` into `namespace` and return the linked locator.
    async fn link(
        &self,
        ctx: &RequestContext,
        cert: &CertificateDoc,
        namespace: &NamespaceIdentifier,
    ) -> CairnResult<ResourceLocator> {
        let linked = cert.linked_copy(namespace);
        let target = linked.locator();

        let condition = match self.store.find(&target).await? {
            None => WriteCondition::IfNoneMatch,
            Some(doc) => {
                let existing: CertificateDoc = doc.into_typed()?;
                if !existing.base.is_deleted()
                    && existing.alias_to == linked.alias_to
                    && existing.status == linked.status
                    && existing.thumbprint == linked.thumbprint
                {
                    return Ok(target);
                }
                existing
                    .base
                    .etag
                    .map(WriteCondition::IfMatch)
                    .ok_or_else(|| missing_etag(&target))?
            }
        };
        self.store.upsert(ctx, linked.into(), condition).await?;
        debug!(linked = %target, original = %cert.locator(), "Linked certificate");
        Ok(target)
    }
}

fn into_rule(doc: Document, locator: &ResourceLocator) -> CairnResult<RuleDoc> {
    let kind = doc.kind();
    RuleDoc::from_document(doc)
        .ok_or_else(|| CairnError::Internal(format!("{locator} holds a {kind}, not a rule")))
}

fn missing_etag(locator: &ResourceLocator) -> CairnError {
    CairnError::Internal(format!("{locator} was read without an etag"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_tracks_policy_and_certificates() {
        let policy: ResourceLocator = "caRoot:default/certPolicy:default".parse().unwrap();
        let cert: ResourceLocator = "caRoot:default/cert:0b6f2f3e-8f61-4c41-9d0a-1b2c3d4e5f60"
            .parse()
            .unwrap();

        let empty = rule_version(&policy, &[]);
        let one = rule_version(&policy, std::slice::from_ref(&cert));
        assert_ne!(empty, one);
        assert_eq!(one, rule_version(&policy, &[cert]));

        let other: ResourceLocator = "caRoot:test/certPolicy:default".parse().unwrap();
        assert_ne!(empty, rule_version(&other, &[]));
    }
}
