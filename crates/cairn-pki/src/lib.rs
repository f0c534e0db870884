//! Cairn PKI: certificate policies, issuance, and rule convergence.
//!
//! The engines are generic over the collaborator traits in `cairn-core`
//! (document store, blob store, key vault), so the same code runs against
//! SurrealDB and a remote vault in production and the in-memory backends
//! in tests.

pub mod capabilities;
pub mod chain;
pub mod config;
pub mod issuance;
pub mod policy;
pub mod rules;
pub mod template;
pub mod validator;

pub use capabilities::{CapabilityRegistry, Exportability, NamespaceCertificateTemplateCapabilities};
pub use config::{ConvergenceConfig, IssuanceConfig};
pub use issuance::{CertificateService, IssueOptions};
pub use policy::CertPolicyService;
pub use rules::RuleEngine;
pub use template::TemplateContext;
pub use validator::{KeySpecRequest, NormalizedTemplate, TemplateRequest, validate_and_normalize};
