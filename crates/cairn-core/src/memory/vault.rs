use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use p256::ecdsa::signature::hazmat::PrehashSigner;
use p256::pkcs8::EncodePublicKey;
use parking_lot::Mutex;
use rand::Rng;
use tracing::debug;
use uuid::Uuid;

use crate::error::{CairnError, CairnResult};
use crate::models::key_spec::{Curve, JwsAlgorithm, KeySpec, KeyType};
use crate::vault::{CreateKeyRequest, KeyVault, VaultCertificate, VaultKey, VaultKeyId};

/// Vault operations that can be made to fail on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VaultOperation {
    CreateKey,
    GetKey,
    Sign,
    SetKeyEnabled,
    DeleteKey,
    MergeCertificate,
    DeleteCertificate,
}

enum SecretKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
}

impl SecretKey {
    fn generate(curve: Curve) -> CairnResult<Self> {
        // A random scalar is out of range with negligible probability;
        // draw again if that happens.
        for _ in 0..8 {
            let key = match curve {
                Curve::P256 => {
                    let mut bytes = [0u8; 32];
                    rand::rng().fill(&mut bytes);
                    p256::ecdsa::SigningKey::from_slice(&bytes).ok().map(Self::P256)
                }
                Curve::P384 => {
                    let mut bytes = [0u8; 48];
                    rand::rng().fill(&mut bytes);
                    p384::ecdsa::SigningKey::from_slice(&bytes).ok().map(Self::P384)
                }
            };
            if let Some(key) = key {
                return Ok(key);
            }
        }
        Err(CairnError::Internal("failed to generate EC key".into()))
    }

    fn public_key(&self) -> Vec<u8> {
        match self {
            Self::P256(key) => key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
            Self::P384(key) => key.verifying_key().to_encoded_point(false).as_bytes().to_vec(),
        }
    }

    fn spki_der(&self) -> CairnResult<Vec<u8>> {
        let der = match self {
            Self::P256(key) => key.verifying_key().to_public_key_der(),
            Self::P384(key) => key.verifying_key().to_public_key_der(),
        }
        .map_err(|e| CairnError::Internal(format!("public key encoding: {e}")))?;
        Ok(der.as_bytes().to_vec())
    }

    fn sign_prehash(&self, digest: &[u8]) -> CairnResult<Vec<u8>> {
        let signature = match self {
            Self::P256(key) => {
                let sig: p256::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| CairnError::upstream("vault", e))?;
                sig.to_bytes().to_vec()
            }
            Self::P384(key) => {
                let sig: p384::ecdsa::Signature = key
                    .sign_prehash(digest)
                    .map_err(|e| CairnError::upstream("vault", e))?;
                sig.to_bytes().to_vec()
            }
        };
        Ok(signature)
    }
}

struct StoredKey {
    secret: SecretKey,
    info: VaultKey,
    certificate: Option<String>,
}

#[derive(Default)]
struct VaultState {
    keys: HashMap<VaultKeyId, StoredKey>,
    faults: HashSet<VaultOperation>,
    sign_latency: Option<Duration>,
}

/// A key vault holding EC keys in process memory.
///
/// Supports P-256 and P-384; RSA key creation fails as an upstream error.
#[derive(Clone, Default)]
pub struct MemoryKeyVault {
    state: Arc<Mutex<VaultState>>,
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `operation` fail until cleared.
    pub fn fail_on(&self, operation: VaultOperation) {
        self.state.lock().faults.insert(operation);
    }

    pub fn clear_fault(&self, operation: VaultOperation) {
        self.state.lock().faults.remove(&operation);
    }

    /// Hold every `sign` call for `latency` before answering.
    pub fn set_sign_latency(&self, latency: Option<Duration>) {
        self.state.lock().sign_latency = latency;
    }

    /// Every key version, enabled or not.
    pub fn key_ids(&self) -> Vec<VaultKeyId> {
        self.state.lock().keys.keys().cloned().collect()
    }

    pub fn enabled_key_ids(&self) -> Vec<VaultKeyId> {
        self.state
            .lock()
            .keys
            .values()
            .filter(|k| k.info.enabled)
            .map(|k| k.info.id.clone())
            .collect()
    }

    /// `None` when the key version does not exist.
    pub fn is_enabled(&self, id: &VaultKeyId) -> Option<bool> {
        self.state.lock().keys.get(id).map(|k| k.info.enabled)
    }

    pub fn has_certificate(&self, id: &VaultKeyId) -> bool {
        self.state
            .lock()
            .keys
            .get(id)
            .is_some_and(|k| k.certificate.is_some())
    }

    fn check_fault(state: &VaultState, operation: VaultOperation) -> CairnResult<()> {
        if state.faults.contains(&operation) {
            Err(CairnError::upstream(
                "vault",
                format!("injected failure in {operation:?}"),
            ))
        } else {
            Ok(())
        }
    }
}

fn key_not_found(id: &VaultKeyId) -> CairnError {
    CairnError::not_found("vault key", id)
}

impl KeyVault for MemoryKeyVault {
    async fn create_key(&self, request: CreateKeyRequest) -> CairnResult<VaultKey> {
        let mut state = self.state.lock();
        Self::check_fault(&state, VaultOperation::CreateKey)?;
        let curve = match (request.key_spec.kty, request.key_spec.crv) {
            (KeyType::Ec, Some(curve)) => curve,
            _ => {
                return Err(CairnError::upstream(
                    "vault",
                    format!("unsupported key type {}", request.key_spec.kty),
                ));
            }
        };
        let secret = SecretKey::generate(curve)?;
        let id = VaultKeyId {
            name: request.name,
            version: Uuid::new_v4().simple().to_string(),
        };
        let info = VaultKey {
            id: id.clone(),
            key_spec: request.key_spec,
            public_key: secret.public_key(),
            spki_der: secret.spki_der()?,
            enabled: true,
        };
        debug!(key = %id, "Created vault key");
        state.keys.insert(
            id,
            StoredKey {
                secret,
                info: info.clone(),
                certificate: None,
            },
        );
        Ok(info)
    }

    async fn get_key(&self, id: &VaultKeyId) -> CairnResult<VaultKey> {
        let state = self.state.lock();
        Self::check_fault(&state, VaultOperation::GetKey)?;
        state
            .keys
            .get(id)
            .map(|k| k.info.clone())
            .ok_or_else(|| key_not_found(id))
    }

    async fn sign(&self, id: &VaultKeyId, alg: JwsAlgorithm, digest: &[u8]) -> CairnResult<Vec<u8>> {
        let latency = self.state.lock().sign_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let state = self.state.lock();
        Self::check_fault(&state, VaultOperation::Sign)?;
        let key = state.keys.get(id).ok_or_else(|| key_not_found(id))?;
        if !key.info.enabled {
            return Err(CairnError::upstream("vault", format!("key {id} is disabled")));
        }
        if !key_supports(&key.info.key_spec, alg) {
            return Err(CairnError::upstream(
                "vault",
                format!("key {id} cannot sign with {alg}"),
            ));
        }
        if digest.len() != alg.digest_len() {
            return Err(CairnError::upstream(
                "vault",
                format!("{alg} expects a {}-byte digest", alg.digest_len()),
            ));
        }
        key.secret.sign_prehash(digest)
    }

    async fn set_key_enabled(&self, id: &VaultKeyId, enabled: bool) -> CairnResult<()> {
        let mut state = self.state.lock();
        Self::check_fault(&state, VaultOperation::SetKeyEnabled)?;
        let key = state.keys.get_mut(id).ok_or_else(|| key_not_found(id))?;
        key.info.enabled = enabled;
        Ok(())
    }

    async fn delete_key(&self, id: &VaultKeyId) -> CairnResult<()> {
        let mut state = self.state.lock();
        Self::check_fault(&state, VaultOperation::DeleteKey)?;
        state.keys.remove(id);
        Ok(())
    }

    async fn merge_certificate(
        &self,
        id: &VaultKeyId,
        chain_pem: &str,
    ) -> CairnResult<VaultCertificate> {
        let mut state = self.state.lock();
        Self::check_fault(&state, VaultOperation::MergeCertificate)?;
        let key = state.keys.get_mut(id).ok_or_else(|| key_not_found(id))?;
        key.certificate = Some(chain_pem.to_string());
        Ok(VaultCertificate {
            key: id.clone(),
            chain_pem: chain_pem.to_string(),
        })
    }

    async fn get_certificate(&self, id: &VaultKeyId) -> CairnResult<VaultCertificate> {
        let state = self.state.lock();
        let key = state.keys.get(id).ok_or_else(|| key_not_found(id))?;
        let chain_pem = key
            .certificate
            .clone()
            .ok_or_else(|| CairnError::not_found("vault certificate", id))?;
        Ok(VaultCertificate {
            key: id.clone(),
            chain_pem,
        })
    }

    async fn delete_certificate(&self, id: &VaultKeyId) -> CairnResult<()> {
        let mut state = self.state.lock();
        Self::check_fault(&state, VaultOperation::DeleteCertificate)?;
        if let Some(key) = state.keys.get_mut(id) {
            key.certificate = None;
        }
        Ok(())
    }
}

fn key_supports(spec: &KeySpec, alg: JwsAlgorithm) -> bool {
    spec.kty == alg.key_type() && (spec.kty != KeyType::Ec || spec.crv == alg.curve())
}
