//! Token error types.

use cairn_core::error::CairnError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token has expired")]
    TokenExpired,

    #[error("invalid token: {0}")]
    TokenInvalid(String),

    #[error("cryptography error: {0}")]
    Crypto(String),

    #[error("signing failed: {0}")]
    Signing(#[from] CairnError),
}

impl From<AuthError> for CairnError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::TokenExpired | AuthError::TokenInvalid(_) => CairnError::Forbidden {
                reason: err.to_string(),
            },
            AuthError::Crypto(msg) => CairnError::Internal(msg),
            AuthError::Signing(inner) => inner,
        }
    }
}
