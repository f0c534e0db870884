//! Token configuration.

/// Configuration for bearer-token minting and verification.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Token issuer (`iss` claim).
    pub token_issuer: String,
    /// Bearer token lifetime in seconds (default: 3600 = 1 hour).
    pub token_lifetime_secs: u64,
    /// Accepted clock skew when verifying `exp`/`nbf`, in seconds.
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_issuer: "cairn".into(),
            token_lifetime_secs: 3600,
            leeway_secs: 60,
        }
    }
}
