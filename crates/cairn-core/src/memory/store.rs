use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::context::RequestContext;
use crate::error::{CairnError, CairnResult};
use crate::identifier::ResourceLocator;
use crate::models::base::ETag;
use crate::models::document::Document;
use crate::repository::{
    DocumentPatch, DocumentQuery, DocumentStore, PaginatedResult, QueryOrder, WriteCondition,
    stamp_for_write,
};

#[derive(Clone)]
pub struct MemoryDocumentStore {
    documents: Arc<RwLock<BTreeMap<ResourceLocator, Document>>>,
    forced_conflicts: Arc<AtomicUsize>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self {
            documents: Arc::default(),
            forced_conflicts: Arc::default(),
            clock: Arc::new(SystemClock),
        }
    }
}

impl fmt::Debug for MemoryDocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDocumentStore")
            .field("documents", &self.len())
            .finish_non_exhaustive()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp `updated` and `deleted` from `clock` instead of the system
    /// time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Make the next `count` patches fail with a conflict, as if another
    /// writer got there first.
    pub fn force_patch_conflicts(&self, count: usize) {
        self.forced_conflicts.store(count, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.documents.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.read().is_empty()
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

fn conflict(locator: &ResourceLocator) -> CairnError {
    CairnError::conflict("document", locator)
}

impl DocumentStore for MemoryDocumentStore {
    async fn get(&self, locator: &ResourceLocator) -> CairnResult<Document> {
        self.documents
            .read()
            .get(locator)
            .cloned()
            .ok_or_else(|| CairnError::not_found("document", locator))
    }

    async fn upsert(
        &self,
        ctx: &RequestContext,
        mut doc: Document,
        condition: WriteCondition,
    ) -> CairnResult<Document> {
        let locator = doc.locator();
        let mut documents = self.documents.write();
        let existing = documents.get(&locator);
        match (&condition, existing) {
            (WriteCondition::Any, _) => {}
            (WriteCondition::IfNoneMatch, None) => {}
            (WriteCondition::IfNoneMatch, Some(_)) => return Err(conflict(&locator)),
            (WriteCondition::IfMatch(etag), Some(current)) if current.etag() == Some(etag) => {}
            (WriteCondition::IfMatch(_), _) => return Err(conflict(&locator)),
        }
        stamp_for_write(&mut doc, ctx, self.clock.now());
        documents.insert(locator, doc.clone());
        Ok(doc)
    }

    async fn patch(
        &self,
        ctx: &RequestContext,
        locator: &ResourceLocator,
        patch: &DocumentPatch,
        etag: &ETag,
    ) -> CairnResult<Document> {
        if self.take_forced_conflict() {
            return Err(conflict(locator));
        }
        let mut documents = self.documents.write();
        let current = documents
            .get(locator)
            .ok_or_else(|| CairnError::not_found("document", locator))?;
        if current.etag() != Some(etag) {
            return Err(conflict(locator));
        }
        let mut body = current.to_body()?;
        patch.apply(&mut body)?;
        let mut doc = Document::from_body(body, etag.clone())?;
        stamp_for_write(&mut doc, ctx, self.clock.now());
        documents.insert(locator.clone(), doc.clone());
        Ok(doc)
    }

    async fn soft_delete(&self, ctx: &RequestContext, locator: &ResourceLocator) -> CairnResult<()> {
        let mut documents = self.documents.write();
        let doc = documents
            .get_mut(locator)
            .ok_or_else(|| CairnError::not_found("document", locator))?;
        if doc.base().is_deleted() {
            return Ok(());
        }
        let now = self.clock.now();
        doc.base_mut().deleted = Some(now);
        stamp_for_write(doc, ctx, now);
        Ok(())
    }

    async fn hard_delete(&self, locator: &ResourceLocator) -> CairnResult<()> {
        self.documents.write().remove(locator);
        Ok(())
    }

    async fn query(&self, query: &DocumentQuery) -> CairnResult<PaginatedResult<Document>> {
        let documents = self.documents.read();
        let mut matched: Vec<&Document> = documents
            .iter()
            .filter(|(locator, _)| {
                locator.namespace() == &query.namespace
                    && locator.resource_kind() == query.resource_kind
            })
            .map(|(_, doc)| doc)
            .filter(|doc| query.matches(doc))
            .collect();

        match query.order {
            QueryOrder::IssuedAtDesc => matched.sort_by_key(|doc| {
                let issued_at = doc.index_fields().issued_at;
                (issued_at.is_none(), Reverse(issued_at), Reverse(doc.base().updated))
            }),
            QueryOrder::UpdatedDesc => matched.sort_by_key(|doc| Reverse(doc.base().updated)),
        }

        let total = matched.len() as u64;
        let items = matched
            .into_iter()
            .skip(query.pagination.offset as usize)
            .take(query.pagination.limit as usize)
            .cloned()
            .collect();
        Ok(PaginatedResult {
            items,
            total,
            offset: query.pagination.offset,
            limit: query.pagination.limit,
        })
    }
}
