//! Pool configuration.

use std::time::Duration;

/// Configuration for the agent connection pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live clients held at once (default: 64).
    pub capacity: usize,
    /// Timeout for a single call to an agent, in seconds (default: 30).
    pub request_timeout_secs: u64,
    /// TCP/TLS connect timeout, in seconds (default: 10).
    pub connect_timeout_secs: u64,
}

impl PoolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}
