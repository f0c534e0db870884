//! SurrealDB implementation of [`DocumentStore`].
//!
//! The record key is the locator text. Conditional writes are expressed
//! in the query itself (`WHERE etag = $expected`), so the check and the
//! write are one atomic statement on the server.

use std::sync::Arc;

use cairn_core::clock::{Clock, SystemClock};
use cairn_core::context::RequestContext;
use cairn_core::error::CairnResult;
use cairn_core::models::{Document, ETag};
use cairn_core::repository::{
    DocumentPatch, DocumentQuery, DocumentStore, PaginatedResult, QueryOrder, WriteCondition,
    stamp_for_write,
};
use cairn_core::ResourceLocator;
use chrono::{DateTime, Utc};
use surrealdb::{Connection, Surreal};
use surrealdb_types::SurrealValue;
use tracing::debug;

use crate::error::DbError;

/// One row of the `document` table.
#[derive(Debug, SurrealValue)]
struct DocumentRow {
    ns_kind: String,
    ns_id: String,
    resource_kind: String,
    resource_id: String,
    kind: String,
    etag: String,
    updated: DateTime<Utc>,
    deleted: Option<DateTime<Utc>>,
    updated_by: String,
    status: Option<String>,
    policy: Option<String>,
    iat: Option<DateTime<Utc>>,
    body: serde_json::Value,
}

impl DocumentRow {
    fn from_document(doc: &Document) -> CairnResult<Self> {
        let base = doc.base();
        let index = doc.index_fields();
        let etag = doc
            .etag()
            .map(|e| e.as_str().to_string())
            .unwrap_or_default();
        Ok(Self {
            ns_kind: base.namespace.kind().to_string(),
            ns_id: base.namespace.id().to_string(),
            resource_kind: base.id.kind().to_string(),
            resource_id: base.id.id().to_string(),
            kind: doc.kind().to_string(),
            etag,
            updated: base.updated,
            deleted: base.deleted,
            updated_by: base.updated_by.clone(),
            status: index.status.map(|s| s.as_str().to_string()),
            policy: index.policy.map(|p| p.to_string()),
            iat: index.issued_at,
            body: doc.to_body()?,
        })
    }

    fn into_document(self) -> CairnResult<Document> {
        Document::from_body(self.body, ETag::new(self.etag))
    }
}

/// Row struct for count queries.
#[derive(Debug, SurrealValue)]
struct CountRow {
    total: u64,
}

fn not_found(locator: &ResourceLocator) -> DbError {
    DbError::NotFound {
        entity: "document".into(),
        id: locator.to_string(),
    }
}

fn conflict(locator: &ResourceLocator) -> DbError {
    DbError::Conflict {
        entity: "document".into(),
        id: locator.to_string(),
    }
}

#[derive(Clone)]
pub struct SurrealDocumentStore<C: Connection> {
    db: Surreal<C>,
    clock: Arc<dyn Clock>,
}

impl<C: Connection> SurrealDocumentStore<C> {
    pub fn new(db: Surreal<C>) -> Self {
        Self {
            db,
            clock: Arc::new(SystemClock),
        }
    }

    /// Stamp `updated` and `deleted` from `clock` instead of the system
    /// time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn fetch(&self, locator: &ResourceLocator) -> CairnResult<Option<DocumentRow>> {
        let mut result = self
            .db
            .query("SELECT * FROM type::record('document', $id)")
            .bind(("id", locator.to_string()))
            .await
            .map_err(DbError::from)?;
        let rows: Vec<DocumentRow> = result.take(0).map_err(DbError::from)?;
        Ok(rows.into_iter().next())
    }

    /// Replace the row only while its etag still equals `expected`.
    /// Returns `false` when nothing matched.
    async fn replace_if_match(
        &self,
        locator: &ResourceLocator,
        row: DocumentRow,
        expected: &ETag,
    ) -> CairnResult<bool> {
        let result = self
            .db
            .query(
                "UPDATE type::record('document', $id) CONTENT $doc \
                 WHERE etag = $expected",
            )
            .bind(("id", locator.to_string()))
            .bind(("doc", row))
            .bind(("expected", expected.as_str().to_string()))
            .await
            .map_err(DbError::from)?;
        let mut result = result.check().map_err(|e| DbError::Query(e.to_string()))?;
        let rows: Vec<DocumentRow> = result.take(0).map_err(DbError::from)?;
        Ok(!rows.is_empty())
    }
}

impl<C: Connection> DocumentStore for SurrealDocumentStore<C> {
    async fn get(&self, locator: &ResourceLocator) -> CairnResult<Document> {
        self.fetch(locator)
            .await?
            .ok_or_else(|| not_found(locator))?
            .into_document()
    }

    async fn upsert(
        &self,
        ctx: &RequestContext,
        mut doc: Document,
        condition: WriteCondition,
    ) -> CairnResult<Document> {
        let locator = doc.locator();
        stamp_for_write(&mut doc, ctx, self.clock.now());
        let row = DocumentRow::from_document(&doc)?;

        match condition {
            WriteCondition::Any => {
                self.db
                    .query("UPSERT type::record('document', $id) CONTENT $doc")
                    .bind(("id", locator.to_string()))
                    .bind(("doc", row))
                    .await
                    .map_err(DbError::from)?
                    .check()
                    .map_err(|e| DbError::Query(e.to_string()))?;
            }
            WriteCondition::IfNoneMatch => {
                let result = self
                    .db
                    .query("CREATE type::record('document', $id) CONTENT $doc")
                    .bind(("id", locator.to_string()))
                    .bind(("doc", row))
                    .await
                    .map_err(DbError::from)?;
                if let Err(e) = result.check() {
                    let message = e.to_string();
                    if message.contains("already exists") {
                        return Err(conflict(&locator).into());
                    }
                    return Err(DbError::Query(message).into());
                }
            }
            WriteCondition::IfMatch(expected) => {
                if !self.replace_if_match(&locator, row, &expected).await? {
                    debug!(locator = %locator, "Conditional write lost to a concurrent update");
                    return Err(conflict(&locator).into());
                }
            }
        }
        Ok(doc)
    }

    async fn patch(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
        patch: &DocumentPatch,
        etag: &ETag,
    ) -> CairnResult<Document> {
        let current = self.fetch(locator).await?.ok_or_else(|| not_found(locator))?;
        if current.etag != etag.as_str() {
            return Err(conflict(locator).into());
        }
        let mut body = current.body;
        patch.apply(&mut body)?;
        let mut doc = Document::from_body(body, etag.clone())?;
        stamp_for_write(&mut doc, ctx, self.clock.now());

        let row = DocumentRow::from_document(&doc)?;
        if !self.replace_if_match(locator, row, etag).await? {
            return Err(conflict(locator).into());
        }
        Ok(doc)
    }

    async fn soft_delete(&self, ctx: &RequestContext, locator: &ResourceLocator) -> CairnResult<()> {
        let current = self.fetch(locator).await?.ok_or_else(|| not_found(locator))?;
        let expected = ETag::new(current.etag.clone());
        let mut doc = current.into_document()?;
        if doc.base().is_deleted() {
            return Ok(());
        }
        let now = self.clock.now();
        doc.base_mut().deleted = Some(now);
        stamp_for_write(&mut doc, ctx, now);

        let row = DocumentRow::from_document(&doc)?;
        if !self.replace_if_match(locator, row, &expected).await? {
            return Err(conflict(locator).into());
        }
        Ok(())
    }

    async fn hard_delete(&self, locator: &ResourceLocator) -> CairnResult<()> {
        self.db
            .query("DELETE type::record('document', $id)")
            .bind(("id", locator.to_string()))
            .await
            .map_err(DbError::from)?
            .check()
            .map_err(|e| DbError::Query(e.to_string()))?;
        Ok(())
    }

    async fn query(&self, query: &DocumentQuery) -> CairnResult<PaginatedResult<Document>> {
        let mut filters = vec![
            "ns_kind = $ns_kind",
            "ns_id = $ns_id",
            "resource_kind = $resource_kind",
        ];
        if !query.include_deleted {
            filters.push("deleted = NONE");
        }
        if query.status.is_some() {
            filters.push("status = $status");
        }
        if query.policy.is_some() {
            filters.push("policy = $policy");
        }
        let where_clause = filters.join(" AND ");
        let order = match query.order {
            QueryOrder::IssuedAtDesc => "iat DESC, updated DESC",
            QueryOrder::UpdatedDesc => "updated DESC",
        };

        let sql = format!(
            "SELECT count() AS total FROM document WHERE {where_clause} GROUP ALL; \
             SELECT * FROM document WHERE {where_clause} \
             ORDER BY {order} LIMIT $limit START $offset"
        );

        let mut result = self
            .db
            .query(&sql)
            .bind(("ns_kind", query.namespace.kind().to_string()))
            .bind(("ns_id", query.namespace.id().to_string()))
            .bind(("resource_kind", query.resource_kind.to_string()))
            .bind(("status", query.status.map(|s| s.as_str().to_string())))
            .bind(("policy", query.policy.as_ref().map(|p| p.to_string())))
            .bind(("limit", query.pagination.limit))
            .bind(("offset", query.pagination.offset))
            .await
            .map_err(DbError::from)?;

        let count_rows: Vec<CountRow> = result.take(0).map_err(DbError::from)?;
        let total = count_rows.first().map(|r| r.total).unwrap_or(0);
        let rows: Vec<DocumentRow> = result.take(1).map_err(DbError::from)?;

        let items = rows
            .into_iter()
            .map(DocumentRow::into_document)
            .collect::<CairnResult<Vec<_>>>()?;

        Ok(PaginatedResult {
            items,
            total,
            offset: query.pagination.offset,
            limit: query.pagination.limit,
        })
    }
}
