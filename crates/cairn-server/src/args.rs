//! Command-line and environment configuration.

use cairn_agent::PoolConfig;
use cairn_auth::AuthConfig;
use cairn_db::DbConfig;
use cairn_pki::{ConvergenceConfig, IssuanceConfig};
use clap::Parser;

/// Cairn certificate service.
#[derive(Parser, Debug)]
#[command(name = "cairn-server", version, about)]
pub struct Args {
    /// SurrealDB WebSocket address.
    #[arg(long, default_value = "127.0.0.1:8000", env = "CAIRN_DB_URL")]
    pub db_url: String,

    /// SurrealDB namespace.
    #[arg(long, default_value = "cairn", env = "CAIRN_DB_NAMESPACE")]
    pub db_namespace: String,

    /// SurrealDB database.
    #[arg(long, default_value = "documents", env = "CAIRN_DB_DATABASE")]
    pub db_database: String,

    #[arg(long, default_value = "root", env = "CAIRN_DB_USER")]
    pub db_user: String,

    #[arg(
        long,
        default_value = "root",
        env = "CAIRN_DB_PASSWORD",
        hide_env_values = true
    )]
    pub db_password: String,

    /// Keep documents in an in-process database instead of connecting.
    #[arg(long, env = "CAIRN_EPHEMERAL")]
    pub ephemeral: bool,

    /// Seconds `not_before` is backdated on issued certificates.
    #[arg(long, default_value_t = 300, env = "CAIRN_BACKDATE_SECS")]
    pub backdate_secs: u64,

    /// Rule convergence retries on concurrent updates.
    #[arg(long, default_value_t = 3, env = "CAIRN_CONVERGENCE_RETRIES")]
    pub convergence_retries: u32,

    /// `iss` claim of agent bearer tokens.
    #[arg(long, default_value = "cairn", env = "CAIRN_TOKEN_ISSUER")]
    pub token_issuer: String,

    /// Agent bearer token lifetime in seconds.
    #[arg(long, default_value_t = 3600, env = "CAIRN_TOKEN_LIFETIME_SECS")]
    pub token_lifetime_secs: u64,

    /// Maximum number of pooled agent clients.
    #[arg(long, default_value_t = 64, env = "CAIRN_POOL_CAPACITY")]
    pub pool_capacity: usize,

    /// Timeout for a single agent call in seconds.
    #[arg(long, default_value_t = 30, env = "CAIRN_AGENT_TIMEOUT_SECS")]
    pub agent_timeout_secs: u64,

    /// Intermediate CAs (`caInt` names) to bootstrap under the root.
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "services,intranet,ms-entra-client-secret",
        env = "CAIRN_INTERMEDIATES"
    )]
    pub intermediates: Vec<String>,
}

impl Args {
    pub fn db_config(&self) -> DbConfig {
        DbConfig {
            url: self.db_url.clone(),
            namespace: self.db_namespace.clone(),
            database: self.db_database.clone(),
            username: self.db_user.clone(),
            password: self.db_password.clone(),
        }
    }

    pub fn issuance_config(&self) -> IssuanceConfig {
        IssuanceConfig {
            backdate_secs: self.backdate_secs,
        }
    }

    pub fn convergence_config(&self) -> ConvergenceConfig {
        ConvergenceConfig {
            max_retries: self.convergence_retries,
        }
    }

    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            token_issuer: self.token_issuer.clone(),
            token_lifetime_secs: self.token_lifetime_secs,
            ..Default::default()
        }
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            capacity: self.pool_capacity,
            request_timeout_secs: self.agent_timeout_secs,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library_defaults() {
        let args = Args::parse_from(["cairn-server"]);
        assert_eq!(
            args.issuance_config().backdate_secs,
            IssuanceConfig::default().backdate_secs
        );
        assert_eq!(
            args.convergence_config().max_retries,
            ConvergenceConfig::default().max_retries
        );
        assert_eq!(args.pool_config().capacity, PoolConfig::default().capacity);
        assert_eq!(
            args.auth_config().token_lifetime_secs,
            AuthConfig::default().token_lifetime_secs
        );
        assert_eq!(args.db_config().namespace, DbConfig::default().namespace);
    }

    #[test]
    fn intermediates_are_comma_separated() {
        let args = Args::parse_from(["cairn-server", "--intermediates", "services,test"]);
        assert_eq!(args.intermediates, vec!["services", "test"]);
    }
}
