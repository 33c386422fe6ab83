//! Postgres-backed step log (`processing_steps` table).
//!
//! The primary key `(tenant_id, document_id, run_key, step_name)` makes
//! appends first-writer-wins; a duplicate maps to [`StepLogError::Conflict`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;

use docflow_core::{DocumentId, TenantId};
use docflow_events::{RunKey, StepRecord};

use super::{RUN_COMPLETED, RunRef, StepLog, StepLogError};

#[derive(Debug, Clone)]
pub struct PostgresStepLog {
    pool: Arc<PgPool>,
}

impl PostgresStepLog {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl StepLog for PostgresStepLog {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id, run_key = %run_key), err)]
    async fn load_run(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        run_key: &RunKey,
    ) -> Result<Vec<StepRecord>, StepLogError> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, step_name, output, recorded_at
            FROM processing_steps
            WHERE tenant_id = $1 AND document_id = $2 AND run_key = $3
            ORDER BY sequence ASC
            "#,
        )
        .bind(tenant_id.as_uuid())
        .bind(document_id.as_uuid())
        .bind(run_key.as_str())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_run", e))?;

        rows.iter()
            .map(|row| {
                let sequence: i32 = row.try_get("sequence").map_err(|e| map_sqlx_error("load_run", e))?;
                Ok(StepRecord {
                    tenant_id,
                    document_id,
                    run_key: run_key.clone(),
                    sequence: sequence.max(0) as u32,
                    step_name: row.try_get("step_name").map_err(|e| map_sqlx_error("load_run", e))?,
                    output: row.try_get("output").map_err(|e| map_sqlx_error("load_run", e))?,
                    recorded_at: row
                        .try_get("recorded_at")
                        .map_err(|e| map_sqlx_error("load_run", e))?,
                })
            })
            .collect()
    }

    #[instrument(
        skip(self, record),
        fields(document_id = %record.document_id, run_key = %record.run_key, step = %record.step_name),
        err
    )]
    async fn append(&self, record: StepRecord) -> Result<(), StepLogError> {
        let sequence = i32::try_from(record.sequence)
            .map_err(|_| StepLogError::Storage(format!("sequence {} out of range", record.sequence)))?;

        sqlx::query(
            r#"
            INSERT INTO processing_steps (
                tenant_id, document_id, run_key, sequence, step_name, output, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(record.tenant_id.as_uuid())
        .bind(record.document_id.as_uuid())
        .bind(record.run_key.as_str())
        .bind(sequence)
        .bind(&record.step_name)
        .bind(&record.output)
        .bind(record.recorded_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StepLogError::Conflict {
                    run_key: record.run_key.clone(),
                    step_name: record.step_name.clone(),
                }
            } else {
                map_sqlx_error("append_step", e)
            }
        })?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn incomplete_runs(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RunRef>, StepLogError> {
        let rows = sqlx::query(
            r#"
            SELECT tenant_id, document_id, run_key,
                   MIN(recorded_at) AS started_at,
                   MAX(recorded_at) AS last_step_at
            FROM processing_steps
            GROUP BY tenant_id, document_id, run_key
            HAVING COUNT(*) FILTER (WHERE step_name = $1) = 0
               AND MAX(recorded_at) <= $2
            ORDER BY started_at ASC, document_id ASC
            LIMIT $3
            "#,
        )
        .bind(RUN_COMPLETED)
        .bind(idle_since)
        .bind(limit.min(i64::MAX as usize) as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("incomplete_runs", e))?;

        rows.iter()
            .map(|row| {
                let get_err = |e| map_sqlx_error("incomplete_runs", e);
                let run_key: String = row.try_get("run_key").map_err(get_err)?;
                Ok(RunRef {
                    tenant_id: TenantId::from_uuid(row.try_get("tenant_id").map_err(get_err)?),
                    document_id: DocumentId::from_uuid(row.try_get("document_id").map_err(get_err)?),
                    run_key: RunKey::from_raw(run_key),
                    started_at: row.try_get("started_at").map_err(get_err)?,
                    last_step_at: row.try_get("last_step_at").map_err(get_err)?,
                })
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn prune_completed(&self, completed_before: DateTime<Utc>) -> Result<u64, StepLogError> {
        let result = sqlx::query(
            r#"
            DELETE FROM processing_steps p
            USING processing_steps done
            WHERE done.step_name = $1
              AND done.recorded_at < $2
              AND p.tenant_id = done.tenant_id
              AND p.document_id = done.document_id
              AND p.run_key = done.run_key
            "#,
        )
        .bind(RUN_COMPLETED)
        .bind(completed_before)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("prune_completed", e))?;

        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StepLogError {
    match err {
        sqlx::Error::Database(db_err) => {
            StepLogError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            StepLogError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => StepLogError::Storage(format!("sqlx error in {}: {}", operation, err)),
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
