//! The closed union of persisted documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CairnError, CairnResult};
use crate::identifier::ResourceLocator;
use crate::models::agent::{AgentConfigDoc, AgentInstanceDoc};
use crate::models::base::{DocumentBase, ETag};
use crate::models::cert_policy::CertPolicyDoc;
use crate::models::certificate::{CertificateDoc, CertificateStatus};
use crate::models::rule::{CertRuleIssuerDoc, CertRuleMsEntraClientCredDoc, RuleDoc};

/// Discriminator stored in the `kind` column of every document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentKind {
    CertPolicy,
    Certificate,
    CertRuleIssuer,
    CertRuleMsEntraClientCred,
    AgentInstance,
    AgentConfig,
}

impl DocumentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CertPolicy => "cert-policy",
            Self::Certificate => "certificate",
            Self::CertRuleIssuer => "cert-rule-issuer",
            Self::CertRuleMsEntraClientCred => "cert-rule-ms-entra-client-cred",
            Self::AgentInstance => "agent-instance",
            Self::AgentConfig => "agent-config",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Document {
    CertPolicy(CertPolicyDoc),
    Certificate(CertificateDoc),
    CertRuleIssuer(CertRuleIssuerDoc),
    CertRuleMsEntraClientCred(CertRuleMsEntraClientCredDoc),
    AgentInstance(AgentInstanceDoc),
    AgentConfig(AgentConfigDoc),
}

/// Columns a store indexes besides the address, so list queries can be
/// filtered and ordered server-side.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexFields {
    pub status: Option<CertificateStatus>,
    pub policy: Option<ResourceLocator>,
    pub issued_at: Option<DateTime<Utc>>,
}

impl Document {
    pub fn kind(&self) -> DocumentKind {
        match self {
            Self::CertPolicy(_) => DocumentKind::CertPolicy,
            Self::Certificate(_) => DocumentKind::Certificate,
            Self::CertRuleIssuer(_) => DocumentKind::CertRuleIssuer,
            Self::CertRuleMsEntraClientCred(_) => DocumentKind::CertRuleMsEntraClientCred,
            Self::AgentInstance(_) => DocumentKind::AgentInstance,
            Self::AgentConfig(_) => DocumentKind::AgentConfig,
        }
    }

    pub fn base(&self) -> &DocumentBase {
        match self {
            Self::CertPolicy(doc) => &doc.base,
            Self::Certificate(doc) => &doc.base,
            Self::CertRuleIssuer(doc) => &doc.base,
            Self::CertRuleMsEntraClientCred(doc) => &doc.base,
            Self::AgentInstance(doc) => &doc.base,
            Self::AgentConfig(doc) => &doc.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut DocumentBase {
        match self {
            Self::CertPolicy(doc) => &mut doc.base,
            Self::Certificate(doc) => &mut doc.base,
            Self::CertRuleIssuer(doc) => &mut doc.base,
            Self::CertRuleMsEntraClientCred(doc) => &mut doc.base,
            Self::AgentInstance(doc) => &mut doc.base,
            Self::AgentConfig(doc) => &mut doc.base,
        }
    }

    pub fn locator(&self) -> ResourceLocator {
        self.base().locator()
    }

    pub fn etag(&self) -> Option<&ETag> {
        self.base().etag.as_ref()
    }

    pub fn index_fields(&self) -> IndexFields {
        match self {
            Self::Certificate(cert) => IndexFields {
                status: Some(cert.status),
                policy: Some(cert.policy.clone()),
                issued_at: cert.issued_at,
            },
            Self::CertRuleIssuer(rule) => IndexFields {
                policy: Some(rule.policy.clone()),
                ..Default::default()
            },
            Self::CertRuleMsEntraClientCred(rule) => IndexFields {
                policy: Some(rule.policy.clone()),
                ..Default::default()
            },
            _ => IndexFields::default(),
        }
    }

    /// Body as stored: the serialized document without its etag.
    pub fn to_body(&self) -> CairnResult<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Rebuild a document from a stored body and the etag column.
    pub fn from_body(body: serde_json::Value, etag: ETag) -> CairnResult<Self> {
        let mut doc: Document = serde_json::from_value(body)?;
        doc.base_mut().etag = Some(etag);
        Ok(doc)
    }

    /// Downcast to a concrete document type.
    pub fn into_typed<T: TypedDocument>(self) -> CairnResult<T> {
        let kind = self.kind();
        let locator = self.locator();
        T::from_document(self).ok_or_else(|| {
            CairnError::Internal(format!(
                "document {locator} is a {kind}, expected {}",
                T::KIND
            ))
        })
    }
}

/// A concrete variant of [`Document`].
pub trait TypedDocument: Sized + Into<Document> {
    const KIND: DocumentKind;

    fn from_document(doc: Document) -> Option<Self>;
    fn base(&self) -> &DocumentBase;
    fn base_mut(&mut self) -> &mut DocumentBase;
}

macro_rules! typed_document {
    ($($ty:ty => $variant:ident),* $(,)?) => {$(
        impl From<$ty> for Document {
            fn from(doc: $ty) -> Self {
                Document::$variant(doc)
            }
        }

        impl TypedDocument for $ty {
            const KIND: DocumentKind = DocumentKind::$variant;

            fn from_document(doc: Document) -> Option<Self> {
                match doc {
                    Document::$variant(doc) => Some(doc),
                    _ => None,
                }
            }

            fn base(&self) -> &DocumentBase {
                &self.base
            }

            fn base_mut(&mut self) -> &mut DocumentBase {
                &mut self.base
            }
        }
    )*};
}

typed_document!(
    CertPolicyDoc => CertPolicy,
    CertificateDoc => Certificate,
    CertRuleIssuerDoc => CertRuleIssuer,
    CertRuleMsEntraClientCredDoc => CertRuleMsEntraClientCred,
    AgentInstanceDoc => AgentInstance,
    AgentConfigDoc => AgentConfig,
);

impl From<RuleDoc> for Document {
    fn from(rule: RuleDoc) -> Self {
        match rule {
            RuleDoc::Issuer(doc) => Document::CertRuleIssuer(doc),
            RuleDoc::MsEntraClientCred(doc) => Document::CertRuleMsEntraClientCred(doc),
        }
    }
}

impl RuleDoc {
    pub fn from_document(doc: Document) -> Option<Self> {
        match doc {
            Document::CertRuleIssuer(doc) => Some(Self::Issuer(doc)),
            Document::CertRuleMsEntraClientCred(doc) => Some(Self::MsEntraClientCred(doc)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identifier::{NamespaceIdentifier, NamespaceKind, ResourceIdentifier};
    use crate::models::rule::RuleKind;

    fn rule() -> CertRuleIssuerDoc {
        let ns = NamespaceIdentifier::named(NamespaceKind::CaInt, "default").unwrap();
        CertRuleIssuerDoc {
            base: DocumentBase::new(ns.locate(RuleKind::Issuer.resource())),
            policy: "caInt:default/certPolicy:default".parse().unwrap(),
            certificate: None,
            version: String::new(),
        }
    }

    #[test]
    fn body_carries_kind_tag_and_no_etag() {
        let mut doc: Document = rule().into();
        doc.base_mut().etag = Some(ETag::new("abc"));
        let body = doc.to_body().unwrap();
        assert_eq!(body["kind"], "cert-rule-issuer");
        assert_eq!(body["namespace"], "caInt:default");
        assert_eq!(body["id"], "certRule:issuer");
        assert!(body.get("etag").is_none());

        let back = Document::from_body(body, ETag::new("def")).unwrap();
        assert_eq!(back.kind(), DocumentKind::CertRuleIssuer);
        assert_eq!(back.etag().map(ETag::as_str), Some("def"));
    }

    #[test]
    fn into_typed_rejects_other_kinds() {
        let doc: Document = rule().into();
        assert!(doc.clone().into_typed::<CertRuleIssuerDoc>().is_ok());
        let err = doc.into_typed::<CertificateDoc>().unwrap_err();
        assert!(err.to_string().contains("expected certificate"));
    }

    #[test]
    fn rule_index_exposes_policy() {
        let doc: Document = rule().into();
        let index = doc.index_fields();
        assert_eq!(
            index.policy.map(|p| p.resource().clone()),
            Some(ResourceIdentifier::named(crate::ResourceKind::CertPolicy, "default").unwrap())
        );
        assert!(index.status.is_none());
    }
}
