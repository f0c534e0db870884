//! End-to-end issuance against the in-memory backends: root, intermediate,
//! and leaf certificates, plus the failure paths that must compensate.

use std::sync::Arc;
use std::time::Duration;

use cairn_core::clock::ManualClock;
use cairn_core::context::{Principal, RequestContext};
use cairn_core::memory::{MemoryBlobStore, MemoryDocumentStore, MemoryKeyVault, VaultOperation};
use cairn_core::models::{
    CertPolicyDoc, CertificateDoc, CertificateStatus, CertificateUsage, Curve, RuleKind,
    SubjectTemplate,
};
use cairn_core::repository::{DocumentStore, Pagination};
use cairn_core::{
    ErrorKind, NamespaceIdentifier, NamespaceKind, ResourceIdentifier, ResourceKind,
    ResourceLocator,
};
use cairn_pki::chain::resolve_chain;
use cairn_pki::issuance::x509::parse_pem_chain;
use cairn_pki::{
    CapabilityRegistry, CertPolicyService, CertificateService, ConvergenceConfig, IssuanceConfig,
    IssueOptions, KeySpecRequest, RuleEngine, TemplateContext, TemplateRequest,
};
use chrono::Utc;
use p256::pkcs8::EncodePublicKey;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    store: Arc<MemoryDocumentStore>,
    blobs: Arc<MemoryBlobStore>,
    vault: Arc<MemoryKeyVault>,
    policies: CertPolicyService<MemoryDocumentStore>,
    certs: CertificateService<MemoryDocumentStore, MemoryBlobStore, MemoryKeyVault>,
    rules: RuleEngine<MemoryDocumentStore>,
}

fn setup() -> Harness {
    let store = Arc::new(MemoryDocumentStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let vault = Arc::new(MemoryKeyVault::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let registry = Arc::new(CapabilityRegistry::builtin().unwrap());
    Harness {
        policies: CertPolicyService::new(Arc::clone(&store), registry),
        certs: CertificateService::new(
            Arc::clone(&store),
            Arc::clone(&blobs),
            Arc::clone(&vault),
            clock,
            IssuanceConfig::default(),
        ),
        rules: RuleEngine::new(Arc::clone(&store), ConvergenceConfig::default()),
        store,
        blobs,
        vault,
    }
}

fn policy_locator(namespace: &NamespaceIdentifier, name: &str) -> ResourceLocator {
    namespace.locate(ResourceIdentifier::named(ResourceKind::CertPolicy, name).unwrap())
}

fn root_ns() -> NamespaceIdentifier {
    NamespaceIdentifier::named(NamespaceKind::CaRoot, "default").unwrap()
}

fn services_ns() -> NamespaceIdentifier {
    NamespaceIdentifier::named(NamespaceKind::CaInt, "services").unwrap()
}

fn service_principal_ns() -> NamespaceIdentifier {
    "servicePrincipal:4f7c1b5e-2a0d-4d8e-9a43-5c3b8f1e7d20"
        .parse()
        .unwrap()
}

async fn ca_policy(h: &Harness, namespace: &NamespaceIdentifier, cn: &str) -> CertPolicyDoc {
    let request = TemplateRequest {
        subject: SubjectTemplate::common_name(cn),
        validity_months: Some(24),
        ..Default::default()
    };
    h.policies
        .put_cert_policy(
            &RequestContext::system(),
            &policy_locator(namespace, "default"),
            &request,
        )
        .await
        .unwrap()
}

/// Root and `caInt:services` intermediate, each published by its issuer
/// rule.
async fn bootstrap(h: &Harness) -> (CertificateDoc, CertificateDoc) {
    let ctx = RequestContext::system();

    let root_policy = ca_policy(h, &root_ns(), "Cairn Root CA").await;
    let root = h.certs.issue_certificate(&ctx, &root_policy).await.unwrap();
    h.rules
        .put_rule(&ctx, RuleKind::Issuer, &root_ns(), root_policy.base.locator())
        .await
        .unwrap();

    let int_policy = ca_policy(h, &services_ns(), "Cairn Services CA").await;
    let intermediate = h.certs.issue_certificate(&ctx, &int_policy).await.unwrap();
    h.rules
        .put_rule(&ctx, RuleKind::Issuer, &services_ns(), int_policy.base.locator())
        .await
        .unwrap();

    (root, intermediate)
}

async fn leaf_policy(h: &Harness, cn: &str) -> CertPolicyDoc {
    let request = TemplateRequest {
        issuer_namespace: Some(services_ns()),
        subject: SubjectTemplate::common_name(cn),
        usages: Some([CertificateUsage::ServerAuth].into()),
        ..Default::default()
    };
    h.policies
        .put_cert_policy(
            &RequestContext::system(),
            &policy_locator(&service_principal_ns(), "web"),
            &request,
        )
        .await
        .unwrap()
}

fn keys_named(vault: &MemoryKeyVault, prefix: &str) -> usize {
    vault
        .key_ids()
        .iter()
        .filter(|id| id.name.starts_with(prefix))
        .count()
}

#[tokio::test(flavor = "multi_thread")]
async fn issues_root_intermediate_and_leaf() {
    let h = setup();
    let ctx = RequestContext::system();
    let (root, intermediate) = bootstrap(&h).await;

    assert_eq!(root.status, CertificateStatus::Issued);
    assert!(root.is_self_signed());
    assert!(root.usages.contains(&CertificateUsage::CaRoot));
    assert_eq!(intermediate.issuer, root.locator());
    assert!(h.vault.has_certificate(root.vault_key.as_ref().unwrap()));

    let policy = leaf_policy(&h, "{{ns.id}}").await;
    let leaf = h.certs.issue_certificate(&ctx, &policy).await.unwrap();
    assert_eq!(leaf.status, CertificateStatus::Issued);
    assert_eq!(leaf.issuer, intermediate.locator());
    assert_eq!(
        leaf.subject,
        format!("CN={}", service_principal_ns().id())
    );
    assert!(h.blobs.contains(leaf.blob_key.as_deref().unwrap()));

    // The stored chain verifies link by link.
    let chain_pem = h
        .certs
        .get_certificate_chain_pem(&ctx, &leaf.locator())
        .await
        .unwrap();
    let ders = parse_pem_chain(&chain_pem).unwrap();
    assert_eq!(ders.len(), 3);
    let parsed: Vec<_> = ders
        .iter()
        .map(|der| x509_parser::parse_x509_certificate(der).unwrap().1)
        .collect();
    assert!(parsed[0].verify_signature(Some(parsed[1].public_key())).is_ok());
    assert!(parsed[1].verify_signature(Some(parsed[2].public_key())).is_ok());
    assert!(parsed[2].verify_signature(None).is_ok());
    assert_eq!(
        cairn_core::digest::thumbprint(&ders[0]),
        leaf.thumbprint.clone().unwrap()
    );

    let docs = resolve_chain(&*h.store, &leaf).await.unwrap();
    assert_eq!(
        docs.iter().map(CertificateDoc::locator).collect::<Vec<_>>(),
        vec![leaf.locator(), intermediate.locator(), root.locator()]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn leaf_without_issuer_rule_is_not_found() {
    let h = setup();
    let policy = leaf_policy(&h, "svc.example").await;

    let err = h
        .certs
        .issue_certificate(&RequestContext::system(), &policy)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(h.vault.key_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_self_signed_issuance_disables_key() {
    let h = setup();
    let ctx = RequestContext::system();
    let policy = ca_policy(&h, &root_ns(), "Cairn Root CA").await;
    h.vault.fail_on(VaultOperation::Sign);

    let err = h.certs.issue_certificate(&ctx, &policy).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);

    assert_eq!(h.vault.key_ids().len(), 1);
    assert!(h.vault.enabled_key_ids().is_empty());

    let listed = h
        .certs
        .list_certificates(&ctx, &policy.base.locator(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(listed.total, 1);
    assert_eq!(listed.items[0].status, CertificateStatus::Error);
    assert!(listed.items[0].error_message.is_some());
    assert!(h.blobs.keys().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_delegated_issuance_deletes_pending_key() {
    let h = setup();
    let ctx = RequestContext::system();
    bootstrap(&h).await;
    let policy = leaf_policy(&h, "svc.example").await;
    let prefix = format!("servicePrincipal-{}", service_principal_ns().id());

    h.vault.fail_on(VaultOperation::MergeCertificate);
    let err = h.certs.issue_certificate(&ctx, &policy).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
    assert_eq!(keys_named(&h.vault, &prefix), 0);

    let listed = h
        .certs
        .list_certificates(&ctx, &policy.base.locator(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(listed.items.len(), 1);
    assert_eq!(listed.items[0].status, CertificateStatus::Error);

    // The failed attempt does not block the next one.
    h.vault.clear_fault(VaultOperation::MergeCertificate);
    let leaf = h.certs.issue_certificate(&ctx, &policy).await.unwrap();
    assert_eq!(leaf.status, CertificateStatus::Issued);
    assert_eq!(keys_named(&h.vault, &prefix), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_variable_fails_before_any_vault_call() {
    let h = setup();
    let policy = leaf_policy(&h, "{{ns.upn}}").await;

    let err = h
        .certs
        .issue_certificate(&RequestContext::system(), &policy)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidTemplateSyntax);
    assert!(h.vault.key_ids().is_empty());

    // Supplying the value makes the same policy renderable.
    bootstrap(&h).await;
    let options = IssueOptions {
        variables: Some(
            TemplateContext::for_namespace(&service_principal_ns()).with("ns.upn", "svc@example.com"),
        ),
        ..Default::default()
    };
    let leaf = h
        .certs
        .issue_certificate_with(&RequestContext::system(), &policy, options)
        .await
        .unwrap();
    assert_eq!(leaf.subject, "CN=svc@example.com");
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelled_request_writes_nothing() {
    let h = setup();
    let policy = ca_policy(&h, &root_ns(), "Cairn Root CA").await;
    let before = h.store.len();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let ctx = RequestContext::system().with_cancellation(cancel);
    let err = h.certs.issue_certificate(&ctx, &policy).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(h.store.len(), before);
    assert!(h.vault.key_ids().is_empty());
}

/// Statuses of every certificate issued under `policy`, once background
/// cleanup has removed the namespace's keys.
async fn settled_statuses(h: &Harness, policy: &CertPolicyDoc, prefix: &str) -> Vec<CertificateStatus> {
    let ctx = RequestContext::system();
    let mut statuses = Vec::new();
    for _ in 0..100 {
        statuses = h
            .certs
            .list_certificates(&ctx, &policy.base.locator(), Pagination::default())
            .await
            .unwrap()
            .items
            .into_iter()
            .map(|c| c.status)
            .collect();
        let settled = statuses.iter().all(|s| *s == CertificateStatus::Error);
        if settled && keys_named(&h.vault, prefix) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    statuses
}

#[tokio::test(flavor = "multi_thread")]
async fn cancelling_during_signing_releases_the_key() {
    let h = setup();
    bootstrap(&h).await;
    let policy = leaf_policy(&h, "svc.example").await;
    let prefix = format!("servicePrincipal-{}", service_principal_ns().id());
    let enabled_before = h.vault.enabled_key_ids().len();
    h.vault.set_sign_latency(Some(Duration::from_millis(500)));

    let cancel = CancellationToken::new();
    let ctx = RequestContext::system().with_cancellation(cancel.clone());
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });
    let err = h.certs.issue_certificate(&ctx, &policy).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);

    assert_eq!(keys_named(&h.vault, &prefix), 0);
    assert_eq!(h.vault.enabled_key_ids().len(), enabled_before);
    let statuses = settled_statuses(&h, &policy, &prefix).await;
    assert_eq!(statuses, vec![CertificateStatus::Error]);
}

#[tokio::test(flavor = "multi_thread")]
async fn dropped_issuance_is_cleaned_up_in_background() {
    let h = setup();
    bootstrap(&h).await;
    let policy = leaf_policy(&h, "svc.example").await;
    let prefix = format!("servicePrincipal-{}", service_principal_ns().id());
    let enabled_before = h.vault.enabled_key_ids().len();
    h.vault.set_sign_latency(Some(Duration::from_millis(500)));

    // The key exists and its CSR is waiting on the vault when the call is
    // abandoned.
    let ctx = RequestContext::system();
    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        h.certs.issue_certificate(&ctx, &policy),
    )
    .await;
    assert!(abandoned.is_err());

    let statuses = settled_statuses(&h, &policy, &prefix).await;
    assert!(statuses.iter().all(|s| *s == CertificateStatus::Error));
    assert_eq!(keys_named(&h.vault, &prefix), 0);
    assert_eq!(h.vault.enabled_key_ids().len(), enabled_before);

    // The next attempt is unaffected.
    h.vault.set_sign_latency(None);
    let leaf = h.certs.issue_certificate(&ctx, &policy).await.unwrap();
    assert_eq!(leaf.status, CertificateStatus::Issued);
}

#[tokio::test(flavor = "multi_thread")]
async fn external_public_key_is_certified_without_vault_key() {
    let h = setup();
    let ctx = RequestContext::system();
    let (_, intermediate) = bootstrap(&h).await;
    let policy = leaf_policy(&h, "device.example").await;
    let keys_before = h.vault.key_ids().len();

    let secret = p256::ecdsa::SigningKey::from_slice(&[9u8; 32]).unwrap();
    let spki = secret.verifying_key().to_public_key_der().unwrap();
    let options = IssueOptions {
        public_key: Some(spki.as_bytes().to_vec()),
        ..Default::default()
    };
    let leaf = h
        .certs
        .issue_certificate_with(&ctx, &policy, options)
        .await
        .unwrap();

    assert_eq!(leaf.issuer, intermediate.locator());
    assert!(leaf.vault_key.is_none());
    assert_eq!(h.vault.key_ids().len(), keys_before);

    let chain = h
        .certs
        .get_certificate_chain_pem(&ctx, &leaf.locator())
        .await
        .unwrap();
    let der = parse_pem_chain(&chain).unwrap().remove(0);
    let (_, cert) = x509_parser::parse_x509_certificate(&der).unwrap();
    assert_eq!(
        cert.public_key().subject_public_key.data.as_ref(),
        secret.verifying_key().to_encoded_point(false).as_bytes()
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn external_key_must_match_policy_curve() {
    let h = setup();
    bootstrap(&h).await;
    let policy = leaf_policy(&h, "device.example").await;
    assert_eq!(policy.key_spec.crv, Some(Curve::P256));

    let secret = p384::ecdsa::SigningKey::from_slice(&[5u8; 48]).unwrap();
    let spki = secret.verifying_key().to_public_key_der().unwrap();
    let options = IssueOptions {
        public_key: Some(spki.as_bytes().to_vec()),
        ..Default::default()
    };
    let err = h
        .certs
        .issue_certificate_with(&RequestContext::system(), &policy, options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapabilityViolation);
}

#[tokio::test(flavor = "multi_thread")]
async fn external_key_cannot_be_self_signed() {
    let h = setup();
    let policy = ca_policy(&h, &root_ns(), "Cairn Root CA").await;
    let options = IssueOptions {
        public_key: Some(vec![0x30, 0x00]),
        ..Default::default()
    };
    let err = h
        .certs
        .issue_certificate_with(&RequestContext::system(), &policy, options)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CapabilityViolation);
    assert!(h.vault.key_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn caller_outside_namespace_is_forbidden() {
    let h = setup();
    let policy = leaf_policy(&h, "svc.example").await;
    let ctx = RequestContext::new(Principal::user(Uuid::new_v4()));

    let err = h.certs.issue_certificate(&ctx, &policy).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Forbidden);
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_issued_certificate_disables_its_key() {
    let h = setup();
    let ctx = RequestContext::system();
    bootstrap(&h).await;
    let policy = leaf_policy(&h, "svc.example").await;
    let leaf = h.certs.issue_certificate(&ctx, &policy).await.unwrap();
    let key = leaf.vault_key.clone().unwrap();

    h.certs.delete_certificate(&ctx, &leaf.locator()).await.unwrap();

    assert_eq!(h.vault.is_enabled(&key), Some(false));
    let err = h
        .certs
        .get_certificate(&ctx, &leaf.locator())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    // Soft-deleted: the document is still there.
    assert!(h.store.find(&leaf.locator()).await.unwrap().is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn deleting_failed_certificate_removes_it() {
    let h = setup();
    let ctx = RequestContext::system();
    let policy = ca_policy(&h, &root_ns(), "Cairn Root CA").await;
    h.vault.fail_on(VaultOperation::Sign);
    h.certs.issue_certificate(&ctx, &policy).await.unwrap_err();
    h.vault.clear_fault(VaultOperation::Sign);

    let failed = h
        .certs
        .list_certificates(&ctx, &policy.base.locator(), Pagination::default())
        .await
        .unwrap()
        .items
        .remove(0);
    h.certs
        .delete_certificate(&ctx, &failed.locator())
        .await
        .unwrap();
    assert!(h.store.find(&failed.locator()).await.unwrap().is_none());
}
