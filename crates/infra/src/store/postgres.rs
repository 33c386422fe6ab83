//! Postgres-backed document store.
//!
//! ## Atomicity
//!
//! `record()` runs in one transaction: the document row is locked with
//! `SELECT ... FOR UPDATE`, the transition is applied in memory, and the row
//! plus any new history entries are written before commit. A transition the
//! domain rejects rolls the transaction back.
//!
//! ## Tenant Isolation
//!
//! Every query includes `tenant_id` in the WHERE clause except the
//! cross-tenant poller query (`due_for_retry`) and the global in-flight count.
//!
//! ## Error Mapping
//!
//! | SQLx error | StoreError |
//! |------------|------------|
//! | unique violation (`23505`) on insert | `AlreadyExists` |
//! | anything else | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tracing::instrument;

use docflow_core::{DocumentId, TenantId, UserId};
use docflow_documents::{
    Document, DocumentStatus, ErrorCode, ErrorKind, LastError, ProcessingArtifacts, ProcessingCounts,
    ProcessingEvent,
};
use docflow_events::Event;

use super::{DocumentStats, DocumentStore, StoreError, Transition};

const DOCUMENT_COLUMNS: &str = r#"
    id,
    tenant_id,
    uploaded_by,
    storage_key,
    status,
    processing_attempt_count,
    last_error_type,
    last_error_code,
    last_error_message,
    next_retry_at,
    artifacts,
    created_at,
    updated_at
"#;

#[derive(Debug, Clone)]
pub struct PostgresDocumentStore {
    pool: Arc<PgPool>,
}

impl PostgresDocumentStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Storage(format!("migration failed: {e}")))
    }

    async fn load_history(
        tx: &mut Transaction<'_, Postgres>,
        tenant_id: TenantId,
        id: DocumentId,
    ) -> Result<Vec<ProcessingEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT payload
            FROM document_events
            WHERE tenant_id = $1 AND document_id = $2
            ORDER BY id ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_all(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error("load_history", e))?;

        rows.into_iter()
            .map(|row| {
                let payload: serde_json::Value = row
                    .try_get("payload")
                    .map_err(|e| map_sqlx_error("load_history", e))?;
                serde_json::from_value(payload)
                    .map_err(|e| StoreError::Storage(format!("corrupt history entry: {e}")))
            })
            .collect()
    }

    async fn append_history(
        tx: &mut Transaction<'_, Postgres>,
        doc: &Document,
        events: &[ProcessingEvent],
    ) -> Result<(), StoreError> {
        for event in events {
            let payload = serde_json::to_value(event)
                .map_err(|e| StoreError::Storage(format!("serialize history entry: {e}")))?;
            sqlx::query(
                r#"
                INSERT INTO document_events (tenant_id, document_id, event_type, version, payload, occurred_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(doc.tenant_id.as_uuid())
            .bind(doc.id.as_uuid())
            .bind(event.event_type())
            .bind(i32::try_from(event.version()).unwrap_or(i32::MAX))
            .bind(payload)
            .bind(event.occurred_at())
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("append_history", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PostgresDocumentStore {
    #[instrument(skip(self, doc), fields(tenant_id = %doc.tenant_id, document_id = %doc.id), err)]
    async fn insert(&self, doc: Document) -> Result<DocumentId, StoreError> {
        let artifacts = artifacts_json(&doc)?;
        let (error_type, error_code, error_message) = error_columns(&doc);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query(
            r#"
            INSERT INTO documents (
                id, tenant_id, uploaded_by, storage_key, status, processing_attempt_count,
                last_error_type, last_error_code, last_error_message, next_retry_at,
                artifacts, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(doc.id.as_uuid())
        .bind(doc.tenant_id.as_uuid())
        .bind(doc.uploaded_by.as_uuid())
        .bind(&doc.storage_key)
        .bind(doc.status.as_str())
        .bind(doc.processing_attempt_count as i32)
        .bind(error_type)
        .bind(error_code)
        .bind(error_message)
        .bind(doc.next_retry_at)
        .bind(artifacts)
        .bind(doc.created_at)
        .bind(doc.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::AlreadyExists(doc.id)
            } else {
                map_sqlx_error("insert_document", e)
            }
        })?;

        Self::append_history(&mut tx, &doc, &doc.history).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(doc.id)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %id), err)]
    async fn get(&self, tenant_id: TenantId, id: DocumentId) -> Result<Option<Document>, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("get_document", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut doc = document_from_row(&row)?;
        doc.history = Self::load_history(&mut tx, tenant_id, id).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(doc))
    }

    #[instrument(
        skip(self, transition),
        fields(tenant_id = %tenant_id, document_id = %id, transition = transition.name()),
        err
    )]
    async fn record(
        &self,
        tenant_id: TenantId,
        id: DocumentId,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<Document, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE tenant_id = $1 AND id = $2 FOR UPDATE"
        ))
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_document", e))?
        .ok_or(StoreError::NotFound(id))?;

        let mut doc = document_from_row(&row)?;
        doc.history = Self::load_history(&mut tx, tenant_id, id).await?;
        let known_events = doc.history.len();

        if let Err(e) = transition.apply(&mut doc, now) {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(e.into());
        }

        let artifacts = artifacts_json(&doc)?;
        let (error_type, error_code, error_message) = error_columns(&doc);

        sqlx::query(
            r#"
            UPDATE documents SET
                storage_key = $3,
                status = $4,
                processing_attempt_count = $5,
                last_error_type = $6,
                last_error_code = $7,
                last_error_message = $8,
                next_retry_at = $9,
                artifacts = $10,
                checksum = $11,
                updated_at = $12
            WHERE tenant_id = $1 AND id = $2
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(id.as_uuid())
        .bind(&doc.storage_key)
        .bind(doc.status.as_str())
        .bind(doc.processing_attempt_count as i32)
        .bind(error_type)
        .bind(error_code)
        .bind(error_message)
        .bind(doc.next_retry_at)
        .bind(artifacts)
        .bind(doc.artifacts.as_ref().map(|a| a.checksum.clone()))
        .bind(doc.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_document", e))?;

        Self::append_history(&mut tx, &doc, &doc.history[known_events..]).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(doc)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn processing_counts(&self, tenant_id: TenantId) -> Result<ProcessingCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE tenant_id = $1) AS tenant_count,
                COUNT(*) AS global_count
            FROM documents
            WHERE status = 'PROCESSING'
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("processing_counts", e))?;

        let tenant: i64 = row
            .try_get("tenant_count")
            .map_err(|e| map_sqlx_error("processing_counts", e))?;
        let global: i64 = row
            .try_get("global_count")
            .map_err(|e| map_sqlx_error("processing_counts", e))?;

        Ok(ProcessingCounts {
            tenant: tenant.max(0) as u64,
            global: global.max(0) as u64,
        })
    }

    #[instrument(skip(self), err)]
    async fn due_for_retry(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {DOCUMENT_COLUMNS}
            FROM documents
            WHERE status = 'PROCESSING_FAILED'
              AND next_retry_at IS NOT NULL
              AND next_retry_at <= $1
            ORDER BY next_retry_at ASC, id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("due_for_retry", e))?;

        // History is not needed to start a run; the run reloads the document.
        rows.iter().map(document_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn stats(&self, tenant_id: TenantId) -> Result<DocumentStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, (next_retry_at IS NOT NULL) AS retry_scheduled, COUNT(*) AS n
            FROM documents
            WHERE tenant_id = $1
            GROUP BY status, (next_retry_at IS NOT NULL)
            "#,
        )
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = DocumentStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let retry_scheduled: bool = row
                .try_get("retry_scheduled")
                .map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status = DocumentStatus::parse(&status)
                .ok_or_else(|| StoreError::Storage(format!("unknown status '{status}'")))?;
            stats.add(status, retry_scheduled, n.max(0) as u64);
        }
        Ok(stats)
    }
}

fn artifacts_json(doc: &Document) -> Result<Option<serde_json::Value>, StoreError> {
    doc.artifacts
        .as_ref()
        .map(serde_json::to_value)
        .transpose()
        .map_err(|e| StoreError::Storage(format!("serialize artifacts: {e}")))
}

fn error_columns(doc: &Document) -> (Option<&'static str>, Option<&'static str>, Option<String>) {
    match &doc.last_error {
        Some(e) => (
            Some(e.kind.as_str()),
            Some(e.code.as_str()),
            Some(e.message.clone()),
        ),
        None => (None, None, None),
    }
}

fn document_from_row(row: &PgRow) -> Result<Document, StoreError> {
    let get_err = |e| map_sqlx_error("decode_document", e);

    let status: String = row.try_get("status").map_err(get_err)?;
    let status = DocumentStatus::parse(&status)
        .ok_or_else(|| StoreError::Storage(format!("unknown status '{status}'")))?;

    let error_type: Option<String> = row.try_get("last_error_type").map_err(get_err)?;
    let error_code: Option<String> = row.try_get("last_error_code").map_err(get_err)?;
    let error_message: Option<String> = row.try_get("last_error_message").map_err(get_err)?;
    let last_error = match (error_type, error_code) {
        (Some(kind), Some(code)) => Some(LastError {
            kind: ErrorKind::parse(&kind)
                .ok_or_else(|| StoreError::Storage(format!("unknown error type '{kind}'")))?,
            code: ErrorCode::parse(&code)
                .ok_or_else(|| StoreError::Storage(format!("unknown error code '{code}'")))?,
            message: error_message.unwrap_or_default(),
        }),
        _ => None,
    };

    let artifacts: Option<serde_json::Value> = row.try_get("artifacts").map_err(get_err)?;
    let artifacts: Option<ProcessingArtifacts> = artifacts
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| StoreError::Storage(format!("corrupt artifacts: {e}")))?;

    let attempts: i32 = row.try_get("processing_attempt_count").map_err(get_err)?;

    Ok(Document {
        id: DocumentId::from_uuid(row.try_get("id").map_err(get_err)?),
        tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get_err)?),
        uploaded_by: UserId::from_uuid(row.try_get("uploaded_by").map_err(get_err)?),
        storage_key: row.try_get("storage_key").map_err(get_err)?,
        status,
        processing_attempt_count: attempts.max(0) as u32,
        last_error,
        next_retry_at: row.try_get("next_retry_at").map_err(get_err)?,
        artifacts,
        created_at: row.try_get("created_at").map_err(get_err)?,
        updated_at: row.try_get("updated_at").map_err(get_err)?,
        history: Vec::new(),
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            StoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}
