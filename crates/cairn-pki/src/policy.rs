//! Certificate policy CRUD.

use std::sync::Arc;

use cairn_core::context::RequestContext;
use cairn_core::models::{CertPolicyDoc, DocumentBase};
use cairn_core::repository::{DocumentStore, WriteCondition};
use cairn_core::{CairnError, CairnResult, ResourceLocator};
use tracing::info;

use crate::capabilities::CapabilityRegistry;
use crate::validator::{NormalizedTemplate, TemplateRequest, validate_and_normalize};

/// Stores normalized certificate templates as [`CertPolicyDoc`]s.
pub struct CertPolicyService<S: DocumentStore> {
    store: Arc<S>,
    registry: Arc<CapabilityRegistry>,
}

impl<S: DocumentStore> CertPolicyService<S> {
    pub fn new(store: Arc<S>, registry: Arc<CapabilityRegistry>) -> Self {
        Self { store, registry }
    }

    /// Validate and store a template. Putting a template identical to the
    /// stored one leaves the document untouched.
    pub async fn put_cert_policy(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
        request: &TemplateRequest,
    ) -> CairnResult<CertPolicyDoc> {
        ctx.authorize(locator.namespace())?;
        let normalized = validate_and_normalize(&self.registry, locator, request)?;

        let existing = match self.store.find(locator).await? {
            Some(doc) => Some(doc.into_typed::<CertPolicyDoc>()?),
            None => None,
        };

        let condition = match &existing {
            Some(current) if !current.base.is_deleted() && same_template(current, &normalized) => {
                return Ok(current.clone());
            }
            Some(current) => current
                .base
                .etag
                .clone()
                .map(WriteCondition::IfMatch)
                .unwrap_or(WriteCondition::Any),
            None => WriteCondition::IfNoneMatch,
        };

        let doc = CertPolicyDoc {
            base: DocumentBase::new(locator.clone()),
            display_name: normalized.display_name,
            issuer_namespace: normalized.issuer_namespace,
            key_spec: normalized.key_spec,
            subject: normalized.subject,
            sans: normalized.sans,
            usages: normalized.usages,
            validity_months: normalized.validity_months,
            lifetime_trigger: normalized.lifetime_trigger,
            allow_variables: normalized.allow_variables,
            version: normalized.digest,
        };
        let written = self.store.upsert(ctx, doc.into(), condition).await?;
        info!(
            locator = %locator,
            updated_by = %ctx.updated_by(),
            "Certificate policy stored"
        );
        written.into_typed()
    }

    pub async fn get_cert_policy(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
    ) -> CairnResult<CertPolicyDoc> {
        ctx.authorize(locator.namespace())?;
        let doc: CertPolicyDoc = self.store.get_typed(locator).await?;
        if doc.base.is_deleted() {
            return Err(CairnError::not_found("certificate policy", locator));
        }
        Ok(doc)
    }

    pub async fn delete_cert_policy(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
    ) -> CairnResult<()> {
        ctx.authorize(locator.namespace())?;
        self.store.soft_delete(ctx, locator).await?;
        info!(locator = %locator, "Certificate policy deleted");
        Ok(())
    }
}

fn same_template(doc: &CertPolicyDoc, normalized: &NormalizedTemplate) -> bool {
    doc.version == normalized.digest
        && doc.display_name == normalized.display_name
        && doc.issuer_namespace == normalized.issuer_namespace
        && doc.key_spec == normalized.key_spec
        && doc.subject == normalized.subject
        && doc.sans == normalized.sans
        && doc.usages == normalized.usages
        && doc.validity_months == normalized.validity_months
        && doc.lifetime_trigger == normalized.lifetime_trigger
        && doc.allow_variables == normalized.allow_variables
}
