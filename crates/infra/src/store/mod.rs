//! State recorder: persistence of document processing state.
//!
//! Every mutation goes through [`DocumentStore::record`], which loads the
//! document, applies one [`Transition`] and writes the result back as a
//! single atomic, tenant-scoped write. Transitions are "set to final value"
//! operations, so recording the same transition twice is harmless.
//!
//! In-flight counts are never stored; [`DocumentStore::processing_counts`]
//! derives them from document status on every call.

pub mod in_memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::{DocumentId, DomainError, DomainResult, TenantId};
use docflow_documents::{Document, DocumentStatus, LimitType, ProcessingCounts, Settlement};

pub use in_memory::InMemoryDocumentStore;
pub use postgres::PostgresDocumentStore;

/// A single state change the processor asks the recorder to persist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transition", rename_all = "snake_case")]
pub enum Transition {
    /// Refresh the storage locator from the upload-complete event.
    SetStorageKey { storage_key: String },
    DeferAdmission {
        limit: LimitType,
        retry_at: DateTime<Utc>,
    },
    BeginProcessing,
    RecordAttempt { attempt: u32 },
    Settle(Settlement),
}

impl Transition {
    pub fn apply(&self, doc: &mut Document, now: DateTime<Utc>) -> DomainResult<()> {
        match self {
            Transition::SetStorageKey { storage_key } => {
                if storage_key.trim().is_empty() {
                    return Err(DomainError::validation("storage_key must not be empty"));
                }
                if doc.storage_key != *storage_key {
                    doc.storage_key = storage_key.clone();
                    doc.updated_at = now;
                }
                Ok(())
            }
            Transition::DeferAdmission { limit, retry_at } => {
                doc.defer_admission(*limit, *retry_at, now)
            }
            Transition::BeginProcessing => doc.begin_processing(now),
            Transition::RecordAttempt { attempt } => doc.record_attempt(*attempt, now),
            Transition::Settle(settlement) => settlement.apply(doc, now),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Transition::SetStorageKey { .. } => "set_storage_key",
            Transition::DeferAdmission { .. } => "defer_admission",
            Transition::BeginProcessing => "begin_processing",
            Transition::RecordAttempt { .. } => "record_attempt",
            Transition::Settle(_) => "settle",
        }
    }
}

/// Document store abstraction.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Register a new document (intake).
    async fn insert(&self, doc: Document) -> Result<DocumentId, StoreError>;

    /// Get a document by ID, scoped to its tenant.
    async fn get(&self, tenant_id: TenantId, id: DocumentId) -> Result<Option<Document>, StoreError>;

    /// Apply one transition atomically and return the stored result.
    async fn record(
        &self,
        tenant_id: TenantId,
        id: DocumentId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError>;

    /// Documents in `PROCESSING` for the tenant and system-wide.
    async fn processing_counts(&self, tenant_id: TenantId) -> Result<ProcessingCounts, StoreError>;

    /// `PROCESSING_FAILED` documents whose retry is due, oldest first, across tenants.
    async fn due_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Document>, StoreError>;

    /// Per-status counts for a tenant.
    async fn stats(&self, tenant_id: TenantId) -> Result<DocumentStats, StoreError>;
}

/// Document store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("tenant isolation violation")]
    TenantIsolation,
    #[error("document already exists: {0}")]
    AlreadyExists(DocumentId),
    #[error("transition rejected: {0}")]
    Domain(#[from] DomainError),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Per-status document counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStats {
    pub pending: u64,
    pub processing: u64,
    pub active: u64,
    pub infected: u64,
    /// Failed with a retry scheduled.
    pub retry_scheduled: u64,
    /// Failed terminally.
    pub failed: u64,
}

impl DocumentStats {
    pub fn add(&mut self, status: DocumentStatus, retry_scheduled: bool, n: u64) {
        match status {
            DocumentStatus::Pending => self.pending += n,
            DocumentStatus::Processing => self.processing += n,
            DocumentStatus::Active => self.active += n,
            DocumentStatus::Infected => self.infected += n,
            DocumentStatus::ProcessingFailed if retry_scheduled => self.retry_scheduled += n,
            DocumentStatus::ProcessingFailed => self.failed += n,
        }
    }
}
