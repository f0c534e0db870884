//! Convergent rule documents.
//!
//! A rule records which policy is authoritative for a purpose inside a
//! namespace and which currently valid certificate(s) that policy has
//! produced. Rules are re-derived by convergence, never hand-edited.

use serde::{Deserialize, Serialize};

use crate::identifier::{ResourceIdentifier, ResourceKind, ResourceLocator};
use crate::models::base::DocumentBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RuleKind {
    /// The namespace's current issuer certificate.
    Issuer,
    /// The last certificates installed as directory federation
    /// credentials.
    MsEntraClientCredential,
}

impl RuleKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Issuer => "issuer",
            Self::MsEntraClientCredential => "ms-entra-client-credential",
        }
    }

    /// Resource identifier the rule document lives under.
    pub fn resource(self) -> ResourceIdentifier {
        ResourceIdentifier::new_unchecked(ResourceKind::CertRule, self.name())
    }

    /// How many of the latest issued certificates the rule keeps.
    pub fn max_certificates(self) -> usize {
        match self {
            Self::Issuer => 1,
            Self::MsEntraClientCredential => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertRuleIssuerDoc {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub policy: ResourceLocator,
    /// `None` until the policy has an issued certificate.
    #[serde(default)]
    pub certificate: Option<ResourceLocator>,
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertRuleMsEntraClientCredDoc {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub policy: ResourceLocator,
    /// Newest first.
    #[serde(default)]
    pub certificates: Vec<ResourceLocator>,
    #[serde(default)]
    pub version: String,
}

/// Either rule document, as returned by convergence.
#[derive(Debug, Clone)]
pub enum RuleDoc {
    Issuer(CertRuleIssuerDoc),
    MsEntraClientCred(CertRuleMsEntraClientCredDoc),
}

impl RuleDoc {
    pub fn kind(&self) -> RuleKind {
        match self {
            Self::Issuer(_) => RuleKind::Issuer,
            Self::MsEntraClientCred(_) => RuleKind::MsEntraClientCredential,
        }
    }

    pub fn base(&self) -> &DocumentBase {
        match self {
            Self::Issuer(doc) => &doc.base,
            Self::MsEntraClientCred(doc) => &doc.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut DocumentBase {
        match self {
            Self::Issuer(doc) => &mut doc.base,
            Self::MsEntraClientCred(doc) => &mut doc.base,
        }
    }

    pub fn policy(&self) -> &ResourceLocator {
        match self {
            Self::Issuer(doc) => &doc.policy,
            Self::MsEntraClientCred(doc) => &doc.policy,
        }
    }

    pub fn set_policy(&mut self, policy: ResourceLocator) {
        match self {
            Self::Issuer(doc) => doc.policy = policy,
            Self::MsEntraClientCred(doc) => doc.policy = policy,
        }
    }

    /// Currently referenced certificates, newest first.
    pub fn certificates(&self) -> Vec<ResourceLocator> {
        match self {
            Self::Issuer(doc) => doc.certificate.iter().cloned().collect(),
            Self::MsEntraClientCred(doc) => doc.certificates.clone(),
        }
    }

    pub fn version(&self) -> &str {
        match self {
            Self::Issuer(doc) => &doc.version,
            Self::MsEntraClientCred(doc) => &doc.version,
        }
    }

    /// An empty rule of `kind` pointing at `policy`.
    pub fn initial(kind: RuleKind, base: DocumentBase, policy: ResourceLocator) -> Self {
        match kind {
            RuleKind::Issuer => Self::Issuer(CertRuleIssuerDoc {
                base,
                policy,
                certificate: None,
                version: String::new(),
            }),
            RuleKind::MsEntraClientCredential => {
                Self::MsEntraClientCred(CertRuleMsEntraClientCredDoc {
                    base,
                    policy,
                    certificates: Vec::new(),
                    version: String::new(),
                })
            }
        }
    }
}
