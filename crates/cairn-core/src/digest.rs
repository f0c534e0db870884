//! Digests: MD5 content versions for change detection, and the SHA-2
//! message digests that remote signing operates on.
//!
//! Versions are MD5 over a length-prefixed field sequence. They detect
//! whether a document's meaningful content changed; they are not a
//! security boundary.

use sha2::{Digest, Sha256, Sha384, Sha512};

use crate::models::key_spec::JwsAlgorithm;

/// Incremental builder for a document `version` digest.
pub struct VersionDigest {
    context: md5::Context,
}

impl Default for VersionDigest {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionDigest {
    pub fn new() -> Self {
        Self {
            context: md5::Context::new(),
        }
    }

    /// Append one field. Fields are length-prefixed so that
    /// `("ab", "c")` and `("a", "bc")` digest differently.
    pub fn field(mut self, value: impl AsRef<[u8]>) -> Self {
        let bytes = value.as_ref();
        self.context.consume((bytes.len() as u64).to_be_bytes());
        self.context.consume(bytes);
        self
    }

    pub fn optional(self, value: Option<impl AsRef<[u8]>>) -> Self {
        match value {
            Some(value) => self.field([1u8]).field(value),
            None => self.field([0u8]),
        }
    }

    /// Lowercase hex digest.
    pub fn finish(self) -> String {
        format!("{:x}", self.context.compute())
    }
}

/// Digest of `message` with the hash `alg` signs over.
pub fn signing_digest(alg: JwsAlgorithm, message: &[u8]) -> Vec<u8> {
    match alg {
        JwsAlgorithm::RS256 | JwsAlgorithm::ES256 => Sha256::digest(message).to_vec(),
        JwsAlgorithm::RS384 | JwsAlgorithm::ES384 => Sha384::digest(message).to_vec(),
        JwsAlgorithm::RS512 => Sha512::digest(message).to_vec(),
    }
}

/// Hex SHA-256 of a DER certificate.
pub fn thumbprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}
