//! Issued (or in-flight) certificate documents.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identifier::{NamespaceIdentifier, ResourceLocator};
use crate::models::base::DocumentBase;
use crate::models::cert_policy::SanTemplate;
use crate::models::key_spec::{CertificateUsage, KeySpec};
use crate::vault::VaultKeyId;

/// Lifecycle state of a certificate.
///
/// `Pending` while the key/request exists and signing is in flight,
/// `Issued` once the signed chain is stored, `Error` when any step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Pending,
    Issued,
    Error,
}

impl CertificateStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Issued => "issued",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateDoc {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub status: CertificateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Rendered subject distinguished name.
    pub subject: String,
    #[serde(default)]
    pub sans: SanTemplate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    /// Issuance time; queries order on it.
    #[serde(default, rename = "iat", skip_serializing_if = "Option::is_none")]
    pub issued_at: Option<DateTime<Utc>>,
    pub usages: BTreeSet<CertificateUsage>,
    pub key_spec: KeySpec,
    pub policy: ResourceLocator,
    /// The policy version this certificate was issued against.
    pub policy_version: String,
    /// The issuer's certificate document; this document's own locator
    /// when self-signed.
    pub issuer: ResourceLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob_key: Option<String>,
    /// SHA-256 of the leaf certificate DER, hex encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault_key: Option<VaultKeyId>,
    /// Set on linked certificates: the document this one mirrors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias_to: Option<ResourceLocator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CertificateDoc {
    pub fn locator(&self) -> ResourceLocator {
        self.base.locator()
    }

    pub fn is_issued(&self) -> bool {
        self.status == CertificateStatus::Issued && !self.base.is_deleted()
    }

    pub fn is_alias(&self) -> bool {
        self.alias_to.is_some()
    }

    pub fn is_self_signed(&self) -> bool {
        self.issuer == self.locator()
    }

    pub fn is_ca(&self) -> bool {
        self.usages.contains(&CertificateUsage::Ca)
    }

    /// Issued, not deleted, and inside its validity window at `now`.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.is_issued()
            && self.not_before.is_some_and(|nb| nb <= now)
            && self.not_after.is_some_and(|na| now < na)
    }

    /// A read-only shallow copy living in `namespace` that points back at
    /// this certificate through `alias_to`.
    pub fn linked_copy(&self, namespace: &NamespaceIdentifier) -> CertificateDoc {
        let mut linked = self.clone();
        linked.base = DocumentBase::new(namespace.locate(self.base.id.clone()));
        linked.alias_to = Some(self.alias_to.clone().unwrap_or_else(|| self.locator()));
        linked.vault_key = None;
        linked
    }
}
