//! In-memory step log for tests/dev.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docflow_core::{DocumentId, TenantId};
use docflow_events::{RunKey, StepRecord};

use super::{RUN_COMPLETED, RunRef, StepLog, StepLogError};

type RunId = (TenantId, DocumentId, RunKey);

#[derive(Debug, Default)]
pub struct InMemoryStepLog {
    runs: RwLock<HashMap<RunId, Vec<StepRecord>>>,
}

impl InMemoryStepLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of records across all runs.
    pub fn len(&self) -> usize {
        self.runs
            .read()
            .map(|runs| runs.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn poisoned() -> StepLogError {
        StepLogError::Storage("lock poisoned".to_string())
    }
}

#[async_trait]
impl StepLog for InMemoryStepLog {
    async fn load_run(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        run_key: &RunKey,
    ) -> Result<Vec<StepRecord>, StepLogError> {
        let runs = self.runs.read().map_err(|_| Self::poisoned())?;
        Ok(runs
            .get(&(tenant_id, document_id, run_key.clone()))
            .cloned()
            .unwrap_or_default())
    }

    async fn append(&self, record: StepRecord) -> Result<(), StepLogError> {
        let mut runs = self.runs.write().map_err(|_| Self::poisoned())?;
        let steps = runs
            .entry((record.tenant_id, record.document_id, record.run_key.clone()))
            .or_default();

        if steps
            .iter()
            .any(|s| s.step_name == record.step_name || s.sequence == record.sequence)
        {
            return Err(StepLogError::Conflict {
                run_key: record.run_key,
                step_name: record.step_name,
            });
        }

        steps.push(record);
        steps.sort_by_key(|s| s.sequence);
        Ok(())
    }

    async fn incomplete_runs(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RunRef>, StepLogError> {
        let runs = self.runs.read().map_err(|_| Self::poisoned())?;
        let mut open: Vec<RunRef> = runs
            .iter()
            .filter(|(_, steps)| !steps.iter().any(|s| s.step_name == RUN_COMPLETED))
            .filter_map(|((tenant_id, document_id, run_key), steps)| {
                let started_at = steps.iter().map(|s| s.recorded_at).min()?;
                let last_step_at = steps.iter().map(|s| s.recorded_at).max()?;
                Some(RunRef {
                    tenant_id: *tenant_id,
                    document_id: *document_id,
                    run_key: run_key.clone(),
                    started_at,
                    last_step_at,
                })
            })
            .filter(|r| r.last_step_at <= idle_since)
            .collect();

        open.sort_by(|a, b| {
            a.started_at
                .cmp(&b.started_at)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        open.truncate(limit);
        Ok(open)
    }

    async fn prune_completed(&self, completed_before: DateTime<Utc>) -> Result<u64, StepLogError> {
        let mut runs = self.runs.write().map_err(|_| Self::poisoned())?;
        let mut removed = 0;
        runs.retain(|_, steps| {
            let expired = steps
                .iter()
                .any(|s| s.step_name == RUN_COMPLETED && s.recorded_at < completed_before);
            if expired {
                removed += steps.len() as u64;
            }
            !expired
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tenant: TenantId, doc: DocumentId, sequence: u32, name: &str) -> StepRecord {
        StepRecord {
            tenant_id: tenant,
            document_id: doc,
            run_key: RunKey::upload(),
            sequence,
            step_name: name.to_string(),
            output: serde_json::json!(null),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn duplicate_step_name_conflicts() {
        let log = InMemoryStepLog::new();
        let (tenant, doc) = (TenantId::new(), DocumentId::new());

        log.append(record(tenant, doc, 1, "load")).await.unwrap();
        let err = log.append(record(tenant, doc, 2, "load")).await.unwrap_err();
        assert!(matches!(err, StepLogError::Conflict { .. }));
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn runs_are_scoped_by_tenant() {
        let log = InMemoryStepLog::new();
        let doc = DocumentId::new();
        let (tenant1, tenant2) = (TenantId::new(), TenantId::new());

        log.append(record(tenant1, doc, 1, "load")).await.unwrap();

        assert!(log.load_run(tenant2, doc, &RunKey::upload()).await.unwrap().is_empty());
        assert_eq!(log.load_run(tenant1, doc, &RunKey::upload()).await.unwrap().len(), 1);
    }
}
