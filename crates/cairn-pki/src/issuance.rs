//! Certificate issuance.
//!
//! Issuance separates what is being certified from who signs it:
//!
//! - a [`CertificateRequestProvider`] produces the certificate template
//!   and the subject key (a new vault key, a vault CSR, or a caller's
//!   public key) and cleans up after itself;
//! - a [`SignerProvider`] wraps the issuer certificate and a remote
//!   signing handle;
//! - a [`StorageProvider`] persists the signed chain.
//!
//! [`CertificateService`] drives a certificate document through
//! `pending` to `issued` or `error` using the three.

mod remote_key;
mod request;
mod service;
mod signer;
mod storage;
pub mod x509;

pub use remote_key::RemoteSigningKey;
pub use request::{
    CertificateRequest, CertificateRequestProvider, CleanupAction, CsrRequestProvider,
    ExternalKeyRequestProvider, InFlightTracker, InFlightVaultObject, RequestMaterial, RequestOutcome,
    SelfSignedRequestProvider, SubjectKey,
};
pub use service::{CertificateService, IssueOptions};
pub use signer::{SignerProvider, VaultSignerProvider};
pub use storage::{BlobStorageProvider, StorageProvider, certificate_blob_key};
