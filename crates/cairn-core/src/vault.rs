//! Contract of the remote, HSM-backed key vault.
//!
//! Private key material never leaves the vault: callers create keys,
//! read public halves, and request signatures over digests they computed
//! themselves.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CairnResult;
use crate::identifier::{NamespaceIdentifier, ResourceIdentifier};
use crate::models::key_spec::{JwsAlgorithm, KeySpec};

/// A specific version of a vault key object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VaultKeyId {
    pub name: String,
    pub version: String,
}

impl fmt::Display for VaultKeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.version)
    }
}

/// Vault object name for keys issued under `policy` in `namespace`:
/// `{nsKind}-{nsId}-{policyId}`.
pub fn vault_object_name(namespace: &NamespaceIdentifier, policy: &ResourceIdentifier) -> String {
    format!("{}-{}-{}", namespace.kind(), namespace.id(), policy.id())
}

#[derive(Debug, Clone)]
pub struct CreateKeyRequest {
    pub name: String,
    pub key_spec: KeySpec,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct VaultKey {
    pub id: VaultKeyId,
    pub key_spec: KeySpec,
    /// Raw public key bits: the uncompressed SEC1 point for EC keys, the
    /// PKCS#1 `RSAPublicKey` for RSA keys.
    pub public_key: Vec<u8>,
    /// DER `SubjectPublicKeyInfo`.
    pub spki_der: Vec<u8>,
    pub enabled: bool,
}

/// A signed chain attached to a key version.
#[derive(Debug, Clone)]
pub struct VaultCertificate {
    pub key: VaultKeyId,
    pub chain_pem: String,
}

pub trait KeyVault: Send + Sync {
    /// Create a new enabled version of the named key object.
    fn create_key(
        &self,
        request: CreateKeyRequest,
    ) -> impl Future<Output = CairnResult<VaultKey>> + Send;

    fn get_key(&self, id: &VaultKeyId) -> impl Future<Output = CairnResult<VaultKey>> + Send;

    /// Sign a pre-hashed `digest`. The signature uses the JWS encoding of
    /// `alg`: raw `r || s` for ECDSA, PKCS#1 v1.5 for RSA.
    fn sign(
        &self,
        id: &VaultKeyId,
        alg: JwsAlgorithm,
        digest: &[u8],
    ) -> impl Future<Output = CairnResult<Vec<u8>>> + Send;

    fn set_key_enabled(
        &self,
        id: &VaultKeyId,
        enabled: bool,
    ) -> impl Future<Output = CairnResult<()>> + Send;

    fn delete_key(&self, id: &VaultKeyId) -> impl Future<Output = CairnResult<()>> + Send;

    /// Attach a signed chain to a key version, completing a pending
    /// certificate object.
    fn merge_certificate(
        &self,
        id: &VaultKeyId,
        chain_pem: &str,
    ) -> impl Future<Output = CairnResult<VaultCertificate>> + Send;

    fn get_certificate(
        &self,
        id: &VaultKeyId,
    ) -> impl Future<Output = CairnResult<VaultCertificate>> + Send;

    fn delete_certificate(&self, id: &VaultKeyId)
    -> impl Future<Output = CairnResult<()>> + Send;
}
