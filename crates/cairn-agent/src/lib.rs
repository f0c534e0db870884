//! Cairn Agent: authenticated HTTP clients for fleet agents.
//!
//! Clients are built from an agent instance's documents: the root of the
//! agent's TLS chain becomes the only trust anchor, and each client carries
//! a short-lived bearer token signed in the key vault. The pool caches
//! them until that token expires.

pub mod builder;
pub mod client;
pub mod config;
pub mod error;
pub mod pool;

pub use builder::{AGENT_CONFIG_NAME, AgentClientBuilder, BuiltClient, VaultAgentClientBuilder};
pub use client::AgentClient;
pub use config::PoolConfig;
pub use error::AgentError;
pub use pool::AgentConnectionPool;
