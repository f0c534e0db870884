//! Persisted document models.
//!
//! Every document shares a [`base::DocumentBase`] (address, timestamps,
//! updating principal, concurrency token) and is stored as one variant of
//! the closed [`document::Document`] union, discriminated by an explicit
//! `kind` tag. Documents refer to each other only through
//! [`ResourceLocator`](crate::identifier::ResourceLocator) values.

pub mod agent;
pub mod base;
pub mod cert_policy;
pub mod certificate;
pub mod document;
pub mod key_spec;
pub mod rule;

pub use agent::{AgentConfigDoc, AgentInstanceDoc};
pub use base::{DocumentBase, ETag};
pub use cert_policy::{CertPolicyDoc, LifetimeTrigger, SanTemplate, SubjectTemplate};
pub use certificate::{CertificateDoc, CertificateStatus};
pub use document::{Document, DocumentKind, IndexFields, TypedDocument};
pub use key_spec::{CertificateUsage, Curve, JwsAlgorithm, KeySpec, KeyType};
pub use rule::{CertRuleIssuerDoc, CertRuleMsEntraClientCredDoc, RuleDoc, RuleKind};
