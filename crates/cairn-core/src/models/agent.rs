//! Fleet agent bookkeeping documents.

use serde::{Deserialize, Serialize};

use crate::digest::VersionDigest;
use crate::identifier::ResourceLocator;
use crate::models::base::DocumentBase;

/// A running agent and how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInstanceDoc {
    #[serde(flatten)]
    pub base: DocumentBase,
    /// Base URL of the agent's HTTPS endpoint.
    pub endpoint: String,
    /// Certificate the agent presents for TLS; the root of its chain is
    /// trusted when connecting.
    pub tls_certificate: ResourceLocator,
    /// Certificate whose vault key signs bearer tokens sent to the agent.
    pub jwt_verify_key: ResourceLocator,
    /// Version of the agent configuration the instance is running.
    pub config_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_id: Option<String>,
}

/// Desired configuration pushed to agents of a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfigDoc {
    #[serde(flatten)]
    pub base: DocumentBase,
    pub tls_certificate_policy: ResourceLocator,
    pub jwt_key_policy: ResourceLocator,
    #[serde(default)]
    pub tls_certificate: Option<ResourceLocator>,
    #[serde(default)]
    pub jwt_verify_key: Option<ResourceLocator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(default)]
    pub version: String,
}

impl AgentConfigDoc {
    /// Digest of the fields an agent acts on.
    pub fn compute_version(&self) -> String {
        VersionDigest::new()
            .field(self.tls_certificate_policy.to_string())
            .field(self.jwt_key_policy.to_string())
            .optional(self.tls_certificate.as_ref().map(|l| l.to_string()))
            .optional(self.jwt_verify_key.as_ref().map(|l| l.to_string()))
            .optional(self.container_image.as_deref())
            .finish()
    }
}
