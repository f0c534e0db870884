//! Storage contracts the engines are written against.
//!
//! Documents are partitioned by `(namespace, resource kind)` and keyed by
//! resource id within the partition. Writes are optimistic: every write
//! mints a fresh etag and conditional writes fail with
//! [`CairnError::Conflict`] when the stored etag differs.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::context::RequestContext;
use crate::error::{CairnError, CairnResult};
use crate::identifier::{NamespaceIdentifier, ResourceKind, ResourceLocator};
use crate::models::base::ETag;
use crate::models::certificate::CertificateStatus;
use crate::models::document::{Document, TypedDocument};

/// Pagination parameters for list queries.
#[derive(Debug, Clone)]
pub struct Pagination {
    pub offset: u64,
    pub limit: u64,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// A paginated result set.
#[derive(Debug, Clone)]
pub struct PaginatedResult<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u64,
    pub limit: u64,
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteCondition {
    /// Unconditional create-or-replace.
    Any,
    /// Replace only if the stored etag matches.
    IfMatch(ETag),
    /// Create only; fail if a document already exists at the locator.
    IfNoneMatch,
}

/// One field-level change, addressed by JSON pointer into the body.
#[derive(Debug, Clone, PartialEq)]
pub enum PatchOperation {
    Set { path: String, value: Value },
    Remove { path: String },
}

/// Fields that address a document and can never be patched.
const IMMUTABLE_FIELDS: &[&str] = &["/kind", "/namespace", "/id"];

/// A minimal set of field changes applied under an etag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentPatch {
    operations: Vec<PatchOperation>,
}

impl DocumentPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, path: impl Into<String>, value: Value) -> Self {
        self.operations.push(PatchOperation::Set {
            path: path.into(),
            value,
        });
        self
    }

    pub fn remove(mut self, path: impl Into<String>) -> Self {
        self.operations.push(PatchOperation::Remove { path: path.into() });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn operations(&self) -> &[PatchOperation] {
        &self.operations
    }

    /// Apply every operation to a stored body, in order.
    pub fn apply(&self, body: &mut Value) -> CairnResult<()> {
        for op in &self.operations {
            let path = match op {
                PatchOperation::Set { path, .. } | PatchOperation::Remove { path } => path,
            };
            if IMMUTABLE_FIELDS.contains(&path.as_str()) {
                return Err(CairnError::Internal(format!("field {path} cannot be patched")));
            }
            let (parent, key) = split_pointer(path)?;
            let target = body
                .pointer_mut(parent)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| {
                    CairnError::Internal(format!("patch path {path} has no object parent"))
                })?;
            match op {
                PatchOperation::Set { value, .. } => {
                    target.insert(key, value.clone());
                }
                PatchOperation::Remove { .. } => {
                    target.remove(&key);
                }
            }
        }
        Ok(())
    }
}

fn split_pointer(path: &str) -> CairnResult<(&str, String)> {
    match path.rfind('/') {
        Some(idx) if path.starts_with('/') && idx + 1 < path.len() => {
            let key = path[idx + 1..].replace("~1", "/").replace("~0", "~");
            Ok((&path[..idx], key))
        }
        _ => Err(CairnError::Internal(format!(
            "invalid patch path {path:?}"
        ))),
    }
}

/// Stamp a document for writing: update time, updating principal, and a
/// fresh etag.
pub fn stamp_for_write(doc: &mut Document, ctx: &RequestContext, now: DateTime<Utc>) -> ETag {
    let etag = ETag::generate();
    let base = doc.base_mut();
    base.updated = now;
    base.updated_by = ctx.updated_by().to_string();
    base.etag = Some(etag.clone());
    etag
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryOrder {
    /// Most recently issued first; documents without `iat` sort last.
    #[default]
    IssuedAtDesc,
    UpdatedDesc,
}

/// A typed list query within one `(namespace, resource kind)` partition.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    pub namespace: NamespaceIdentifier,
    pub resource_kind: ResourceKind,
    pub status: Option<CertificateStatus>,
    pub policy: Option<ResourceLocator>,
    pub include_deleted: bool,
    pub order: QueryOrder,
    pub pagination: Pagination,
}

impl DocumentQuery {
    pub fn new(namespace: NamespaceIdentifier, resource_kind: ResourceKind) -> Self {
        Self {
            namespace,
            resource_kind,
            status: None,
            policy: None,
            include_deleted: false,
            order: QueryOrder::default(),
            pagination: Pagination::default(),
        }
    }

    pub fn with_status(mut self, status: CertificateStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_policy(mut self, policy: ResourceLocator) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn including_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn order_by(mut self, order: QueryOrder) -> Self {
        self.order = order;
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.pagination.limit = limit;
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.pagination.offset = offset;
        self
    }

    /// Whether `doc` passes the filters (not the partition or paging).
    pub fn matches(&self, doc: &Document) -> bool {
        if !self.include_deleted && doc.base().is_deleted() {
            return false;
        }
        let index = doc.index_fields();
        if self.status.is_some() && index.status != self.status {
            return false;
        }
        if self.policy.is_some() && index.policy != self.policy {
            return false;
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Stores
// ---------------------------------------------------------------------------

pub trait DocumentStore: Send + Sync {
    /// Read a document, soft-deleted or not. Absent documents are
    /// [`CairnError::NotFound`].
    fn get(&self, locator: &ResourceLocator) -> impl Future<Output = CairnResult<Document>> + Send;

    /// Write a whole document under `condition`, returning it with its new
    /// etag.
    fn upsert(
        &self,
        ctx: &RequestContext,
        doc: Document,
        condition: WriteCondition,
    ) -> impl Future<Output = CairnResult<Document>> + Send;

    /// Apply field changes if the stored etag still equals `etag`.
    fn patch(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
        patch: &DocumentPatch,
        etag: &ETag,
    ) -> impl Future<Output = CairnResult<Document>> + Send;

    /// Mark a document deleted without removing it.
    fn soft_delete(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
    ) -> impl Future<Output = CairnResult<()>> + Send;

    fn hard_delete(&self, locator: &ResourceLocator) -> impl Future<Output = CairnResult<()>> + Send;

    fn query(
        &self,
        query: &DocumentQuery,
    ) -> impl Future<Output = CairnResult<PaginatedResult<Document>>> + Send;

    /// Like [`get`](Self::get), mapping NotFound to `None`.
    fn find(
        &self,
        locator: &ResourceLocator,
    ) -> impl Future<Output = CairnResult<Option<Document>>> + Send {
        async move {
            match self.get(locator).await {
                Ok(doc) => Ok(Some(doc)),
                Err(CairnError::NotFound { .. }) => Ok(None),
                Err(err) => Err(err),
            }
        }
    }

    fn get_typed<T: TypedDocument + Send>(
        &self,
        locator: &ResourceLocator,
    ) -> impl Future<Output = CairnResult<T>> + Send {
        async move { self.get(locator).await?.into_typed() }
    }
}

/// Stored blob content with its tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content: Vec<u8>,
    pub tags: BTreeMap<String, String>,
}

pub trait BlobStore: Send + Sync {
    fn put(
        &self,
        key: &str,
        content: Vec<u8>,
        tags: BTreeMap<String, String>,
    ) -> impl Future<Output = CairnResult<()>> + Send;

    fn get(&self, key: &str) -> impl Future<Output = CairnResult<Blob>> + Send;

    fn delete(&self, key: &str) -> impl Future<Output = CairnResult<()>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn patch_sets_and_removes_fields() {
        let mut body = json!({
            "kind": "cert-rule-issuer",
            "certificate": "old",
            "version": "v1",
        });
        let patch = DocumentPatch::new()
            .set("/certificate", json!("new"))
            .set("/version", json!("v2"))
            .remove("/missing");
        patch.apply(&mut body).unwrap();
        assert_eq!(body["certificate"], "new");
        assert_eq!(body["version"], "v2");

        DocumentPatch::new()
            .remove("/certificate")
            .apply(&mut body)
            .unwrap();
        assert!(body.get("certificate").is_none());
    }

    #[test]
    fn patch_cannot_touch_address_fields() {
        let mut body = json!({"kind": "certificate", "id": "cert:x"});
        let err = DocumentPatch::new()
            .set("/id", json!("cert:y"))
            .apply(&mut body)
            .unwrap_err();
        assert!(err.to_string().contains("cannot be patched"));
    }

    #[test]
    fn patch_rejects_bad_pointers() {
        let mut body = json!({});
        assert!(DocumentPatch::new().set("noslash", json!(1)).apply(&mut body).is_err());
        assert!(DocumentPatch::new().set("/a/b", json!(1)).apply(&mut body).is_err());
    }
}
