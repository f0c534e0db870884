//! Cairn Database: SurrealDB connection management and the persistent
//! document store.
//!
//! This crate provides:
//! - Opening a migrated database ([`open_remote`], [`open_in_memory`])
//! - Schema initialization and migrations ([`run_migrations`])
//! - Error types ([`DbError`])
//! - [`SurrealDocumentStore`], the `DocumentStore` implementation

mod connection;
mod error;
mod schema;
mod store;

pub use connection::{DbConfig, open_in_memory, open_remote};
pub use error::DbError;
pub use schema::{run_migrations, schema_v1};
pub use store::SurrealDocumentStore;
