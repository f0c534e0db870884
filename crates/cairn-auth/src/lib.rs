//! Cairn Auth: bearer tokens for calls to fleet agents.
//!
//! Tokens are JWTs whose signature is produced by the remote key vault;
//! the signing key never enters this process. Verification is the
//! agent-side counterpart and uses the key's public half.

pub mod config;
pub mod error;
pub mod token;

pub use config::AuthConfig;
pub use error::AuthError;
pub use token::{BearerClaims, BearerToken, VaultTokenSigner, public_key_pem, verify_bearer_token};
