//! Certificate policy documents.
//!
//! A policy is the normalized, namespace-scoped description of how
//! certificates of one purpose are shaped. Its `version` is the content
//! digest of the fields that change what gets issued.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::models::base::DocumentBase;
use crate::models::key_spec::{CertificateUsage, KeySpec};
use crate::identifier::NamespaceIdentifier;

/// Subject distinguished name fields. Values may contain `{{var}}`
/// placeholders when the namespace permits variables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectTemplate {
    pub common_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizational_unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

impl SubjectTemplate {
    pub fn common_name(cn: impl Into<String>) -> Self {
        Self {
            common_name: cn.into(),
            ..Default::default()
        }
    }

    /// All field values, for validation passes.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.common_name.as_str()).chain(
            [
                self.organization.as_deref(),
                self.organizational_unit.as_deref(),
                self.country.as_deref(),
            ]
            .into_iter()
            .flatten(),
        )
    }

    /// Apply `f` to every field value, short-circuiting on error.
    pub fn try_map<E>(&self, mut f: impl FnMut(&str) -> Result<String, E>) -> Result<Self, E> {
        Ok(Self {
            common_name: f(&self.common_name)?,
            organization: self.organization.as_deref().map(&mut f).transpose()?,
            organizational_unit: self.organizational_unit.as_deref().map(&mut f).transpose()?,
            country: self.country.as_deref().map(&mut f).transpose()?,
        })
    }
}

impl fmt::Display for SubjectTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CN={}", self.common_name)?;
        if let Some(ou) = &self.organizational_unit {
            write!(f, ", OU={ou}")?;
        }
        if let Some(o) = &self.organization {
            write!(f, ", O={o}")?;
        }
        if let Some(c) = &self.country {
            write!(f, ", C={c}")?;
        }
        Ok(())
    }
}

/// Subject alternative names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SanTemplate {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub emails: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uris: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<String>,
}

impl SanTemplate {
    pub fn is_empty(&self) -> bool {
        self.dns_names.is_empty()
            && self.emails.is_empty()
            && self.uris.is_empty()
            && self.ip_addresses.is_empty()
    }

    pub fn values(&self) -> impl Iterator<Item = &str> {
        self.dns_names
            .iter()
            .chain(&self.emails)
            .chain(&self.uris)
            .chain(&self.ip_addresses)
            .map(String::as_str)
    }

    pub fn try_map<E>(&self, mut f: impl FnMut(&str) -> Result<String, E>) -> Result<Self, E> {
        let mut map_all = |values: &[String]| -> Result<Vec<String>, E> {
            values.iter().map(|v| f(v)).collect()
        };
        Ok(Self {
            dns_names: map_all(&self.dns_names)?,
            emails: map_all(&self.emails)?,
            uris: map_all(&self.uris)?,
            ip_addresses: map_all(&self.ip_addresses)?,
        })
    }
}

/// When a certificate should be renewed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "type", content = "value")]
pub enum LifetimeTrigger {
    /// Renew after this percentage of the validity period has elapsed.
    PercentageOfLifetime(u8),
    DaysBeforeExpiry(u32),
}

impl Default for LifetimeTrigger {
    fn default() -> Self {
        Self::PercentageOfLifetime(80)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertPolicyDoc {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub display_name: String,
    /// Namespace whose current issuer certificate signs certificates of
    /// this policy. Equal to the policy's own namespace when self-signed.
    pub issuer_namespace: NamespaceIdentifier,
    pub key_spec: KeySpec,
    pub subject: SubjectTemplate,
    #[serde(default)]
    pub sans: SanTemplate,
    pub usages: BTreeSet<CertificateUsage>,
    pub validity_months: u32,
    pub lifetime_trigger: LifetimeTrigger,
    #[serde(default)]
    pub allow_variables: bool,
    /// Content digest of issuer, subject, and key spec.
    pub version: String,
}

impl CertPolicyDoc {
    pub fn is_self_signed(&self) -> bool {
        self.issuer_namespace == self.base.namespace
    }

    pub fn is_ca(&self) -> bool {
        self.usages.contains(&CertificateUsage::Ca)
    }
}
