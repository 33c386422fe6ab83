//! In-memory document store for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docflow_core::{DocumentId, Entity, TenantId};
use docflow_documents::{Document, DocumentStatus, ProcessingCounts};

use super::{DocumentStats, DocumentStore, StoreError, Transition};

#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    documents: RwLock<HashMap<DocumentId, Document>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> StoreError {
        StoreError::Storage("lock poisoned".to_string())
    }
}

fn ensure_tenant<E: Entity>(entity: &E, tenant_id: TenantId) -> Result<(), StoreError> {
    if entity.tenant_id() == tenant_id {
        Ok(())
    } else {
        Err(StoreError::TenantIsolation)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn insert(&self, doc: Document) -> Result<DocumentId, StoreError> {
        let mut docs = self.documents.write().map_err(|_| Self::poisoned())?;
        let id = *doc.id();
        if docs.contains_key(&id) {
            return Err(StoreError::AlreadyExists(id));
        }
        docs.insert(id, doc);
        Ok(id)
    }

    async fn get(&self, tenant_id: TenantId, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let docs = self.documents.read().map_err(|_| Self::poisoned())?;
        match docs.get(&id) {
            Some(doc) => {
                ensure_tenant(doc, tenant_id)?;
                Ok(Some(doc.clone()))
            }
            None => Ok(None),
        }
    }

    async fn record(
        &self,
        tenant_id: TenantId,
        id: DocumentId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError> {
        let mut docs = self.documents.write().map_err(|_| Self::poisoned())?;
        let stored = docs.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        ensure_tenant(stored, tenant_id)?;

        // Apply to a copy so a rejected transition leaves the stored row untouched.
        let mut next = stored.clone();
        transition.apply(&mut next, now)?;
        *stored = next.clone();
        Ok(next)
    }

    async fn processing_counts(&self, tenant_id: TenantId) -> Result<ProcessingCounts, StoreError> {
        let docs = self.documents.read().map_err(|_| Self::poisoned())?;
        let mut counts = ProcessingCounts::default();
        for doc in docs.values().filter(|d| d.status == DocumentStatus::Processing) {
            counts.global += 1;
            if doc.tenant_id == tenant_id {
                counts.tenant += 1;
            }
        }
        Ok(counts)
    }

    async fn due_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Document>, StoreError> {
        let docs = self.documents.read().map_err(|_| Self::poisoned())?;
        let mut due: Vec<_> = docs.values().filter(|d| d.is_due(now)).cloned().collect();

        due.sort_by_key(|d| (d.next_retry_at, d.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn stats(&self, tenant_id: TenantId) -> Result<DocumentStats, StoreError> {
        let docs = self.documents.read().map_err(|_| Self::poisoned())?;
        let mut stats = DocumentStats::default();
        for doc in docs.values().filter(|d| d.tenant_id == tenant_id) {
            stats.add(doc.status, doc.next_retry_at.is_some(), 1);
        }
        Ok(stats)
    }
}
