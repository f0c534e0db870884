//! An rcgen signing key whose private half lives in the vault.
//!
//! rcgen signs synchronously, so [`RemoteSigningKey::sign`] drives the
//! async vault call with the runtime handle it captured at construction.
//! Certificate building must therefore run on a blocking thread; see
//! [`run_blocking`].

use std::sync::Arc;

use cairn_core::digest::signing_digest;
use cairn_core::models::JwsAlgorithm;
use cairn_core::vault::{KeyVault, VaultKey, VaultKeyId};
use cairn_core::{CairnError, CairnResult};
use parking_lot::Mutex;
use rcgen::{PublicKeyData, SignatureAlgorithm, SigningKey};
use tokio::runtime::Handle;

pub struct RemoteSigningKey<V> {
    vault: Arc<V>,
    key: VaultKeyId,
    alg: JwsAlgorithm,
    public_key: Vec<u8>,
    handle: Handle,
    /// rcgen only sees [`rcgen::Error::RemoteKeyError`]; the vault's own
    /// error is kept here for the caller.
    failure: Arc<Mutex<Option<CairnError>>>,
}

impl<V> Clone for RemoteSigningKey<V> {
    fn clone(&self) -> Self {
        Self {
            vault: Arc::clone(&self.vault),
            key: self.key.clone(),
            alg: self.alg,
            public_key: self.public_key.clone(),
            handle: self.handle.clone(),
            failure: Arc::clone(&self.failure),
        }
    }
}

impl<V: KeyVault> RemoteSigningKey<V> {
    /// Must be called from inside a Tokio runtime.
    pub fn new(vault: Arc<V>, key: &VaultKey) -> CairnResult<Self> {
        let handle = Handle::try_current()
            .map_err(|e| CairnError::Internal(format!("remote signing needs a runtime: {e}")))?;
        Ok(Self {
            vault,
            key: key.id.clone(),
            alg: key.key_spec.alg,
            public_key: key.public_key.clone(),
            handle,
            failure: Arc::new(Mutex::new(None)),
        })
    }

    pub fn key_id(&self) -> &VaultKeyId {
        &self.key
    }

    /// The vault error behind the last failed signature, if any.
    pub fn take_failure(&self) -> Option<CairnError> {
        self.failure.lock().take()
    }

    /// Map an rcgen error, preferring the vault error that caused it.
    pub(crate) fn explain(&self, context: &str, err: rcgen::Error) -> CairnError {
        self.take_failure()
            .unwrap_or_else(|| CairnError::Internal(format!("{context}: {err}")))
    }
}

pub(crate) fn rcgen_algorithm(alg: JwsAlgorithm) -> &'static SignatureAlgorithm {
    match alg {
        JwsAlgorithm::ES256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        JwsAlgorithm::ES384 => &rcgen::PKCS_ECDSA_P384_SHA384,
        JwsAlgorithm::RS256 => &rcgen::PKCS_RSA_SHA256,
        JwsAlgorithm::RS384 => &rcgen::PKCS_RSA_SHA384,
        JwsAlgorithm::RS512 => &rcgen::PKCS_RSA_SHA512,
    }
}

/// X.509 wants DER `Ecdsa-Sig-Value`; the vault returns JWS `r || s`.
fn x509_signature(alg: JwsAlgorithm, raw: Vec<u8>) -> CairnResult<Vec<u8>> {
    let malformed = |e: p256::ecdsa::Error| {
        CairnError::upstream("vault", format!("malformed {alg} signature: {e}"))
    };
    match alg {
        JwsAlgorithm::ES256 => {
            let sig = p256::ecdsa::Signature::from_slice(&raw).map_err(malformed)?;
            Ok(sig.to_der().as_bytes().to_vec())
        }
        JwsAlgorithm::ES384 => {
            let sig = p384::ecdsa::Signature::from_slice(&raw).map_err(malformed)?;
            Ok(sig.to_der().as_bytes().to_vec())
        }
        JwsAlgorithm::RS256 | JwsAlgorithm::RS384 | JwsAlgorithm::RS512 => Ok(raw),
    }
}

impl<V: KeyVault> PublicKeyData for RemoteSigningKey<V> {
    fn der_bytes(&self) -> &[u8] {
        &self.public_key
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        rcgen_algorithm(self.alg)
    }
}

impl<V: KeyVault> SigningKey for RemoteSigningKey<V> {
    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        let digest = signing_digest(self.alg, msg);
        let signed = self
            .handle
            .block_on(self.vault.sign(&self.key, self.alg, &digest))
            .and_then(|raw| x509_signature(self.alg, raw));
        signed.map_err(|err| {
            *self.failure.lock() = Some(err);
            rcgen::Error::RemoteKeyError
        })
    }
}

/// Run certificate construction off the async executor.
pub(crate) async fn run_blocking<T, F>(f: F) -> CairnResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CairnResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| CairnError::Internal(format!("signing task failed: {e}")))?
}
