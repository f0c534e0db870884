/// Issuance pipeline settings.
#[derive(Debug, Clone)]
pub struct IssuanceConfig {
    /// How far `not_before` is moved into the past to absorb clock skew
    /// between the service and relying parties.
    pub backdate_secs: u64,
}

impl Default for IssuanceConfig {
    fn default() -> Self {
        Self { backdate_secs: 300 }
    }
}

/// Rule convergence settings.
#[derive(Debug, Clone)]
pub struct ConvergenceConfig {
    /// Conditional-patch conflicts retried before giving up.
    pub max_retries: u32,
}

impl Default for ConvergenceConfig {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}
