//! Cairn Core: domain types shared across all Cairn crates.
//!
//! Provides the identifier/locator kernel, the persisted document models,
//! the collaborator traits the engines are written against (document
//! store, blob store, remote key vault), and the request context that
//! carries the calling principal and its cancellation signal.

pub mod clock;
pub mod context;
pub mod digest;
pub mod error;
pub mod identifier;
pub mod memory;
pub mod models;
pub mod repository;
pub mod vault;

pub use error::{CairnError, CairnResult, ErrorKind};
pub use identifier::{
    Identifier, NamespaceIdentifier, NamespaceKind, ResourceIdentifier, ResourceKind,
    ResourceLocator,
};
