//! Key specifications and certificate usage flags.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, CairnResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "RSA")]
    Rsa,
    #[serde(rename = "EC")]
    Ec,
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Rsa => "RSA",
            Self::Ec => "EC",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Curve {
    #[serde(rename = "P-256")]
    P256,
    #[serde(rename = "P-384")]
    P384,
}

impl fmt::Display for Curve {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::P256 => "P-256",
            Self::P384 => "P-384",
        })
    }
}

/// JWS signature algorithm names, shared by certificate and token signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JwsAlgorithm {
    RS256,
    RS384,
    RS512,
    ES256,
    ES384,
}

impl JwsAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RS256 => "RS256",
            Self::RS384 => "RS384",
            Self::RS512 => "RS512",
            Self::ES256 => "ES256",
            Self::ES384 => "ES384",
        }
    }

    pub fn key_type(self) -> KeyType {
        match self {
            Self::RS256 | Self::RS384 | Self::RS512 => KeyType::Rsa,
            Self::ES256 | Self::ES384 => KeyType::Ec,
        }
    }

    /// The curve an ECDSA algorithm is bound to.
    pub fn curve(self) -> Option<Curve> {
        match self {
            Self::ES256 => Some(Curve::P256),
            Self::ES384 => Some(Curve::P384),
            _ => None,
        }
    }

    /// Length in bytes of the digest this algorithm signs.
    pub fn digest_len(self) -> usize {
        match self {
            Self::RS256 | Self::ES256 => 32,
            Self::RS384 | Self::ES384 => 48,
            Self::RS512 => 64,
        }
    }
}

impl fmt::Display for JwsAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const RSA_KEY_SIZES: &[u32] = &[2048, 3072, 4096];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeySpec {
    pub kty: KeyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crv: Option<Curve>,
    pub alg: JwsAlgorithm,
    #[serde(default)]
    pub exportable: bool,
}

impl KeySpec {
    pub fn rsa(key_size: u32, alg: JwsAlgorithm) -> Self {
        Self {
            kty: KeyType::Rsa,
            key_size: Some(key_size),
            crv: None,
            alg,
            exportable: false,
        }
    }

    pub fn ec(crv: Curve) -> Self {
        let alg = match crv {
            Curve::P256 => JwsAlgorithm::ES256,
            Curve::P384 => JwsAlgorithm::ES384,
        };
        Self {
            kty: KeyType::Ec,
            key_size: None,
            crv: Some(crv),
            alg,
            exportable: false,
        }
    }

    /// Check the fields describe a single coherent key.
    pub fn validate(&self) -> CairnResult<()> {
        if self.alg.key_type() != self.kty {
            return Err(CairnError::capability(format!(
                "algorithm {} cannot be used with {} keys",
                self.alg, self.kty
            )));
        }
        match self.kty {
            KeyType::Rsa => {
                if self.crv.is_some() {
                    return Err(CairnError::capability("RSA keys do not take a curve"));
                }
                match self.key_size {
                    Some(size) if RSA_KEY_SIZES.contains(&size) => Ok(()),
                    other => Err(CairnError::capability(format!(
                        "unsupported RSA key size {other:?}"
                    ))),
                }
            }
            KeyType::Ec => {
                if self.key_size.is_some() {
                    return Err(CairnError::capability("EC keys do not take a key size"));
                }
                if self.crv.is_none() || self.crv != self.alg.curve() {
                    return Err(CairnError::capability(format!(
                        "curve {:?} does not match algorithm {}",
                        self.crv, self.alg
                    )));
                }
                Ok(())
            }
        }
    }

    /// Canonical text used when digesting a template.
    pub fn canonical(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.kty,
            self.key_size.map(|s| s.to_string()).unwrap_or_default(),
            self.crv.map(|c| c.to_string()).unwrap_or_default(),
            self.alg,
            self.exportable
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CertificateUsage {
    Ca,
    CaRoot,
    ClientAuth,
    ServerAuth,
}

impl fmt::Display for CertificateUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ca => "ca",
            Self::CaRoot => "caRoot",
            Self::ClientAuth => "clientAuth",
            Self::ServerAuth => "serverAuth",
        })
    }
}
