//! Integration tests for the SurrealDB document store using in-memory
//! SurrealDB.

use std::collections::BTreeSet;
use std::sync::Arc;

use cairn_core::clock::ManualClock;
use cairn_core::context::RequestContext;
use cairn_core::models::{
    CertRuleIssuerDoc, CertificateDoc, CertificateStatus, Curve, Document, DocumentBase, ETag,
    KeySpec, RuleKind, SanTemplate,
};
use cairn_core::repository::{DocumentPatch, DocumentQuery, DocumentStore, WriteCondition};
use cairn_core::{ErrorKind, NamespaceIdentifier, NamespaceKind, ResourceIdentifier, ResourceKind};
use cairn_db::{DbConfig, SurrealDocumentStore};
use chrono::{Duration, Utc};
use serde_json::json;
use surrealdb::engine::local::Db;

/// Helper: spin up in-memory DB and run migrations.
async fn setup() -> SurrealDocumentStore<Db> {
    let config = DbConfig {
        namespace: "test".into(),
        database: "test".into(),
        ..Default::default()
    };
    SurrealDocumentStore::new(cairn_db::open_in_memory(&config).await.unwrap())
}

fn namespace() -> NamespaceIdentifier {
    NamespaceIdentifier::named(NamespaceKind::CaInt, "default").unwrap()
}

fn certificate(status: CertificateStatus, age_days: i64) -> CertificateDoc {
    let ns = namespace();
    let locator = ns.locate(ResourceIdentifier::new_cert());
    CertificateDoc {
        base: DocumentBase::new(locator.clone()),
        status,
        serial_number: Some("01".into()),
        subject: "CN=Cairn Intermediate".into(),
        sans: SanTemplate::default(),
        not_before: None,
        not_after: None,
        issued_at: (status == CertificateStatus::Issued)
            .then(|| Utc::now() - Duration::days(age_days)),
        usages: BTreeSet::new(),
        key_spec: KeySpec::ec(Curve::P384),
        policy: ns.locate(ResourceIdentifier::named(ResourceKind::CertPolicy, "default").unwrap()),
        policy_version: "v1".into(),
        issuer: locator,
        blob_key: None,
        thumbprint: None,
        vault_key: None,
        alias_to: None,
        error_message: None,
    }
}

// -----------------------------------------------------------------------
// Reads and writes
// -----------------------------------------------------------------------

#[tokio::test]
async fn create_and_get_document() {
    let store = setup().await;
    let ctx = RequestContext::system();
    let cert = certificate(CertificateStatus::Pending, 0);
    let locator = cert.locator();

    let written = store
        .upsert(&ctx, cert.into(), WriteCondition::IfNoneMatch)
        .await
        .unwrap();

    let fetched = store.get(&locator).await.unwrap();
    assert_eq!(fetched.locator(), locator);
    assert_eq!(fetched.etag(), written.etag());
    let cert: CertificateDoc = fetched.into_typed().unwrap();
    assert_eq!(cert.status, CertificateStatus::Pending);
    assert_eq!(cert.key_spec, KeySpec::ec(Curve::P384));
}

#[tokio::test]
async fn missing_document_is_not_found() {
    let store = setup().await;
    let locator = namespace().locate(ResourceIdentifier::new_cert());
    let err = store.get(&locator).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn create_twice_conflicts() {
    let store = setup().await;
    let ctx = RequestContext::system();
    let doc: Document = certificate(CertificateStatus::Pending, 0).into();
    store
        .upsert(&ctx, doc.clone(), WriteCondition::IfNoneMatch)
        .await
        .unwrap();
    let err = store
        .upsert(&ctx, doc, WriteCondition::IfNoneMatch)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[tokio::test]
async fn if_match_rejects_stale_etag() {
    let store = setup().await;
    let ctx = RequestContext::system();
    let doc: Document = certificate(CertificateStatus::Pending, 0).into();
    let first = store
        .upsert(&ctx, doc.clone(), WriteCondition::Any)
        .await
        .unwrap();

    let err = store
        .upsert(&ctx, doc.clone(), WriteCondition::IfMatch(ETag::new("stale")))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    let etag = first.etag().cloned().unwrap();
    let second = store
        .upsert(&ctx, doc, WriteCondition::IfMatch(etag.clone()))
        .await
        .unwrap();
    assert_ne!(second.etag(), Some(&etag));
}

#[tokio::test]
async fn patch_updates_fields_under_etag() {
    let store = setup().await;
    let ctx = RequestContext::system();
    let ns = namespace();
    let rule = CertRuleIssuerDoc {
        base: DocumentBase::new(ns.locate(RuleKind::Issuer.resource())),
        policy: ns.locate(ResourceIdentifier::named(ResourceKind::CertPolicy, "default").unwrap()),
        certificate: None,
        version: String::new(),
    };
    let written = store
        .upsert(&ctx, rule.into(), WriteCondition::Any)
        .await
        .unwrap();
    let locator = written.locator();
    let etag = written.etag().cloned().unwrap();

    let target = ns.locate(ResourceIdentifier::new_cert());
    let patch = DocumentPatch::new()
        .set("/certificate", json!(target.to_string()))
        .set("/version", json!("abc"));
    let patched = store.patch(&ctx, &locator, &patch, &etag).await.unwrap();
    let rule: CertRuleIssuerDoc = patched.into_typed().unwrap();
    assert_eq!(rule.certificate, Some(target));
    assert_eq!(rule.version, "abc");

    let err = store.patch(&ctx, &locator, &patch, &etag).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

// -----------------------------------------------------------------------
// Queries and deletion
// -----------------------------------------------------------------------

#[tokio::test]
async fn query_returns_latest_issued_first() {
    let store = setup().await;
    let ctx = RequestContext::system();
    let old = certificate(CertificateStatus::Issued, 60);
    let new = certificate(CertificateStatus::Issued, 2);
    let pending = certificate(CertificateStatus::Pending, 0);
    for cert in [&old, &new, &pending] {
        store
            .upsert(&ctx, cert.clone().into(), WriteCondition::Any)
            .await
            .unwrap();
    }

    let query = DocumentQuery::new(namespace(), ResourceKind::Cert)
        .with_status(CertificateStatus::Issued)
        .with_policy(old.policy.clone());
    let page = store.query(&query).await.unwrap();
    assert_eq!(page.total, 2);
    let locators: Vec<_> = page.items.iter().map(Document::locator).collect();
    assert_eq!(locators, vec![new.locator(), old.locator()]);

    let page = store.query(&query.limit(1)).await.unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].locator(), new.locator());
}

#[tokio::test]
async fn soft_deleted_documents_leave_default_queries() {
    let store = setup().await;
    let ctx = RequestContext::system();
    let cert = certificate(CertificateStatus::Issued, 1);
    let locator = cert.locator();
    store
        .upsert(&ctx, cert.into(), WriteCondition::Any)
        .await
        .unwrap();
    store.soft_delete(&ctx, &locator).await.unwrap();

    let query = DocumentQuery::new(namespace(), ResourceKind::Cert);
    assert_eq!(store.query(&query).await.unwrap().total, 0);
    assert_eq!(store.query(&query.including_deleted()).await.unwrap().total, 1);

    let fetched = store.get(&locator).await.unwrap();
    assert!(fetched.base().is_deleted());
}

#[tokio::test]
async fn hard_delete_removes_document() {
    let store = setup().await;
    let ctx = RequestContext::system();
    let cert = certificate(CertificateStatus::Error, 0);
    let locator = cert.locator();
    store
        .upsert(&ctx, cert.into(), WriteCondition::Any)
        .await
        .unwrap();
    store.hard_delete(&locator).await.unwrap();
    assert!(store.find(&locator).await.unwrap().is_none());
}

#[tokio::test]
async fn soft_delete_is_stamped_from_the_store_clock() {
    // Whole seconds, so the stored datetime compares exactly.
    let start = chrono::DateTime::from_timestamp(Utc::now().timestamp() - 86_400, 0).unwrap();
    let clock = Arc::new(ManualClock::new(start));
    let store = setup().await.with_clock(clock.clone());
    let ctx = RequestContext::system();
    let cert = certificate(CertificateStatus::Issued, 0);
    let locator = cert.locator();
    store
        .upsert(&ctx, cert.into(), WriteCondition::IfNoneMatch)
        .await
        .unwrap();

    clock.advance(Duration::minutes(90));
    store.soft_delete(&ctx, &locator).await.unwrap();
    let deleted = store.get(&locator).await.unwrap();
    assert_eq!(deleted.base().deleted, Some(start + Duration::minutes(90)));
}
