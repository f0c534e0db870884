//! Certificate alias and issuer chain resolution.
//!
//! Certificates refer to their issuer and to the certificate they alias
//! by locator value. Both links are followed by store lookups with a hop
//! limit, so a corrupt cycle ends in an error instead of a loop.

use cairn_core::models::{CertRuleIssuerDoc, CertificateDoc, RuleKind};
use cairn_core::repository::DocumentStore;
use cairn_core::{CairnError, CairnResult, NamespaceIdentifier, ResourceLocator};
use chrono::{DateTime, Utc};

/// Leaf, intermediate, root.
pub const MAX_CHAIN_HOPS: usize = 3;

/// Read a certificate and follow `alias_to` links to the owned original.
pub async fn resolve_certificate<S: DocumentStore>(
    store: &S,
    locator: &ResourceLocator,
) -> CairnResult<CertificateDoc> {
    let mut current: CertificateDoc = store.get_typed(locator).await?;
    for _ in 0..MAX_CHAIN_HOPS {
        let Some(target) = current.alias_to.clone() else {
            return Ok(current);
        };
        current = store.get_typed(&target).await?;
    }
    Err(CairnError::Internal(format!(
        "certificate {locator} aliases more than {MAX_CHAIN_HOPS} levels deep"
    )))
}

/// The certificate the namespace's issuer rule currently points at.
///
/// It must be issued, valid at `now`, and a CA.
pub async fn current_issuer_certificate<S: DocumentStore>(
    store: &S,
    namespace: &NamespaceIdentifier,
    now: DateTime<Utc>,
) -> CairnResult<CertificateDoc> {
    let rule_locator = namespace.locate(RuleKind::Issuer.resource());
    let rule: CertRuleIssuerDoc = store.get_typed(&rule_locator).await?;
    let locator = rule.certificate.ok_or_else(|| {
        CairnError::not_found("issuer certificate", format!("{namespace} (rule has none)"))
    })?;

    let cert = resolve_certificate(store, &locator).await?;
    if !cert.is_valid_at(now) {
        return Err(CairnError::capability(format!(
            "issuer certificate {} for {namespace} is not valid",
            cert.locator()
        )));
    }
    if !cert.is_ca() {
        return Err(CairnError::capability(format!(
            "certificate {} is not a CA certificate",
            cert.locator()
        )));
    }
    Ok(cert)
}

/// Walk from `leaf` to its self-signed root: `[leaf, ..., root]`.
pub async fn resolve_chain<S: DocumentStore>(
    store: &S,
    leaf: &CertificateDoc,
) -> CairnResult<Vec<CertificateDoc>> {
    let mut chain = vec![leaf.clone()];
    while chain.len() <= MAX_CHAIN_HOPS {
        let last = &chain[chain.len() - 1];
        if last.is_self_signed() {
            return Ok(chain);
        }
        let issuer = resolve_certificate(store, &last.issuer).await?;
        chain.push(issuer);
    }
    Err(CairnError::Internal(format!(
        "issuer chain of {} exceeds {MAX_CHAIN_HOPS} certificates",
        leaf.locator()
    )))
}
