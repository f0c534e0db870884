//! JWT bearer tokens signed by a vault key.
//!
//! The signing input is assembled here, hashed with the digest of the
//! key's algorithm, and the digest is sent to the vault. The vault's raw
//! JWS signature is appended as the third token segment.

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use cairn_core::digest::signing_digest;
use cairn_core::models::{JwsAlgorithm, KeyType};
use cairn_core::vault::{KeyVault, VaultKeyId};
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::config::AuthConfig;
use crate::error::AuthError;

/// Claims carried by every bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BearerClaims {
    pub iss: String,
    /// Calling principal.
    pub sub: String,
    /// Agent endpoint the token is meant for.
    pub aud: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
}

impl BearerClaims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[derive(Debug, Serialize)]
struct JwtHeader<'a> {
    alg: &'a str,
    typ: &'a str,
    kid: &'a str,
}

/// A minted token and the claims it carries.
#[derive(Debug, Clone)]
pub struct BearerToken {
    pub value: String,
    pub claims: BearerClaims,
}

fn jwt_algorithm(alg: JwsAlgorithm) -> Algorithm {
    match alg {
        JwsAlgorithm::RS256 => Algorithm::RS256,
        JwsAlgorithm::RS384 => Algorithm::RS384,
        JwsAlgorithm::RS512 => Algorithm::RS512,
        JwsAlgorithm::ES256 => Algorithm::ES256,
        JwsAlgorithm::ES384 => Algorithm::ES384,
    }
}

/// Mints bearer tokens with one vault key version.
pub struct VaultTokenSigner<V> {
    vault: Arc<V>,
    key: VaultKeyId,
    alg: JwsAlgorithm,
    config: AuthConfig,
}

impl<V: KeyVault> VaultTokenSigner<V> {
    pub fn new(vault: Arc<V>, key: VaultKeyId, alg: JwsAlgorithm, config: AuthConfig) -> Self {
        Self {
            vault,
            key,
            alg,
            config,
        }
    }

    pub fn claims(&self, subject: &str, audience: &str, now: DateTime<Utc>) -> BearerClaims {
        let iat = now.timestamp();
        let lifetime = Duration::seconds(self.config.token_lifetime_secs as i64);
        BearerClaims {
            iss: self.config.token_issuer.clone(),
            sub: subject.to_string(),
            aud: audience.to_string(),
            iat,
            nbf: iat,
            exp: (now + lifetime).timestamp(),
            jti: Uuid::new_v4().to_string(),
        }
    }

    /// Mint a token for `subject` addressed to `audience`, valid from `now`
    /// for the configured lifetime.
    pub async fn mint(
        &self,
        subject: &str,
        audience: &str,
        now: DateTime<Utc>,
    ) -> Result<BearerToken, AuthError> {
        let claims = self.claims(subject, audience, now);
        let kid = self.key.to_string();
        let header = JwtHeader {
            alg: self.alg.as_str(),
            typ: "JWT",
            kid: &kid,
        };
        let header = serde_json::to_vec(&header)
            .map_err(|e| AuthError::Crypto(format!("JWT header: {e}")))?;
        let payload = serde_json::to_vec(&claims)
            .map_err(|e| AuthError::Crypto(format!("JWT claims: {e}")))?;
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header),
            URL_SAFE_NO_PAD.encode(payload)
        );

        let digest = signing_digest(self.alg, signing_input.as_bytes());
        let signature = self.vault.sign(&self.key, self.alg, &digest).await?;
        debug!(kid = %kid, aud = %claims.aud, "Minted bearer token");

        Ok(BearerToken {
            value: format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)),
            claims,
        })
    }
}

/// PEM `PUBLIC KEY` block for a DER `SubjectPublicKeyInfo`.
pub fn public_key_pem(spki_der: &[u8]) -> String {
    pem::encode(&pem::Pem::new("PUBLIC KEY", spki_der.to_vec()))
}

/// Verify a bearer token's signature, issuer, audience, and validity
/// window, returning its claims.
pub fn verify_bearer_token(
    token: &str,
    public_key_pem: &str,
    alg: JwsAlgorithm,
    audience: &str,
    config: &AuthConfig,
) -> Result<BearerClaims, AuthError> {
    let key = match alg.key_type() {
        KeyType::Ec => DecodingKey::from_ec_pem(public_key_pem.as_bytes()),
        KeyType::Rsa => DecodingKey::from_rsa_pem(public_key_pem.as_bytes()),
    }
    .map_err(|e| AuthError::Crypto(format!("bad public key: {e}")))?;

    let mut validation = Validation::new(jwt_algorithm(alg));
    validation.set_issuer(&[&config.token_issuer]);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["sub", "exp", "iat", "iss", "aud"]);
    validation.validate_nbf = true;
    validation.leeway = config.leeway_secs;

    jsonwebtoken::decode::<BearerClaims>(token, &key, &validation)
        .map(|data| data.claims)
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
            _ => AuthError::TokenInvalid(e.to_string()),
        })
}
