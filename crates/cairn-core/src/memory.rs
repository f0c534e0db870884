//! In-process backends for the storage and vault contracts.
//!
//! These back the engine test suites and local development servers. They
//! honour the same concurrency and not-found semantics as the production
//! backends.

pub mod blob;
pub mod store;
pub mod vault;

pub use blob::MemoryBlobStore;
pub use store::MemoryDocumentStore;
pub use vault::{MemoryKeyVault, VaultOperation};
