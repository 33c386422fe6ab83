//! Durable step execution.
//!
//! A run is a sequence of named steps. After a step's closure succeeds its
//! output is appended to the [`StepLog`] before the next step starts. When a
//! run is reopened (after a crash or a re-delivered trigger) every recorded
//! step returns its stored output instead of executing again, so side
//! effects happen at most once per `(document, run_key, step_name)`.
//!
//! Closures must take any timestamps they depend on from recorded outputs
//! rather than the wall clock, so a replayed run reaches the same decisions.

pub mod in_memory;
pub mod postgres;

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use tracing::debug;

use docflow_core::{DocumentId, TenantId};
use docflow_events::{RunKey, StepRecord};

pub use in_memory::InMemoryStepLog;
pub use postgres::PostgresStepLog;

/// Marker step appended when a run has finished all its steps.
pub const RUN_COMPLETED: &str = "run.completed";

/// Identifies a run in the step log.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunRef {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub run_key: RunKey,
    pub started_at: DateTime<Utc>,
    /// When the most recent step of the run was recorded.
    pub last_step_at: DateTime<Utc>,
}

/// Append-only step log.
#[async_trait]
pub trait StepLog: Send + Sync {
    /// All recorded steps of a run, in sequence order.
    async fn load_run(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        run_key: &RunKey,
    ) -> Result<Vec<StepRecord>, StepLogError>;

    /// Append one step record.
    ///
    /// Fails with [`StepLogError::Conflict`] if the run already holds a record
    /// with the same step name or sequence.
    async fn append(&self, record: StepRecord) -> Result<(), StepLogError>;

    /// Runs without a completion marker whose last step was recorded at or
    /// before `idle_since`, oldest first.
    async fn incomplete_runs(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RunRef>, StepLogError>;

    /// Delete every record of runs completed before `completed_before`.
    ///
    /// Returns the number of records removed. Incomplete runs are kept.
    async fn prune_completed(&self, completed_before: DateTime<Utc>) -> Result<u64, StepLogError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum StepLogError {
    #[error("step '{step_name}' already recorded for run {run_key}")]
    Conflict { run_key: RunKey, step_name: String },
    #[error("step output serialization failed: {0}")]
    Serialization(String),
    #[error("step log storage error: {0}")]
    Storage(String),
}

/// A run opened against the step log.
pub struct DurableRun {
    log: Arc<dyn StepLog>,
    tenant_id: TenantId,
    document_id: DocumentId,
    run_key: RunKey,
    recorded: HashMap<String, StepRecord>,
    next_sequence: u32,
}

impl core::fmt::Debug for DurableRun {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DurableRun")
            .field("tenant_id", &self.tenant_id)
            .field("document_id", &self.document_id)
            .field("run_key", &self.run_key)
            .field("recorded", &self.recorded.len())
            .finish()
    }
}

impl DurableRun {
    /// Open (or resume) a run, loading whatever it already recorded.
    pub async fn open(
        log: Arc<dyn StepLog>,
        tenant_id: TenantId,
        document_id: DocumentId,
        run_key: RunKey,
    ) -> Result<Self, StepLogError> {
        let mut run = Self {
            log,
            tenant_id,
            document_id,
            run_key,
            recorded: HashMap::new(),
            next_sequence: 1,
        };
        run.reload().await?;
        Ok(run)
    }

    pub fn run_key(&self) -> &RunKey {
        &self.run_key
    }

    /// True when the completion marker is recorded.
    pub fn is_completed(&self) -> bool {
        self.recorded.contains_key(RUN_COMPLETED)
    }

    /// True when `name` has a recorded output.
    pub fn has_step(&self, name: &str) -> bool {
        self.recorded.contains_key(name)
    }

    /// Run `f` at most once for this run and return its output.
    ///
    /// A recorded step is not executed; its stored output is decoded and
    /// returned. An error from `f` records nothing, so the step executes again
    /// on the next attempt of the run.
    pub async fn step<T, E, F, Fut>(&mut self, name: &str, f: F) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StepLogError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(output) = self.stored_output(name)? {
            debug!(run_key = %self.run_key, step = name, "replaying recorded step");
            return Ok(output);
        }

        let output = f().await?;
        let value = serde_json::to_value(&output)
            .map_err(|e| StepLogError::Serialization(format!("{name}: {e}")))?;

        let record = StepRecord {
            tenant_id: self.tenant_id,
            document_id: self.document_id,
            run_key: self.run_key.clone(),
            sequence: self.next_sequence,
            step_name: name.to_string(),
            output: value,
            recorded_at: Utc::now(),
        };

        match self.log.append(record.clone()).await {
            Ok(()) => {
                self.next_sequence += 1;
                self.recorded.insert(name.to_string(), record);
                Ok(output)
            }
            Err(StepLogError::Conflict { .. }) => {
                // A concurrent execution of the same run got there first; its
                // output wins.
                self.reload().await?;
                match self.stored_output(name)? {
                    Some(stored) => Ok(stored),
                    None => Err(StepLogError::Conflict {
                        run_key: self.run_key.clone(),
                        step_name: name.to_string(),
                    }
                    .into()),
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Append the completion marker. Completing twice is a no-op.
    pub async fn complete(&mut self) -> Result<(), StepLogError> {
        self.step::<(), StepLogError, _, _>(RUN_COMPLETED, || async { Ok(()) })
            .await
    }

    async fn reload(&mut self) -> Result<(), StepLogError> {
        let records = self
            .log
            .load_run(self.tenant_id, self.document_id, &self.run_key)
            .await?;
        self.next_sequence = records.iter().map(|r| r.sequence).max().unwrap_or(0) + 1;
        self.recorded = records
            .into_iter()
            .map(|r| (r.step_name.clone(), r))
            .collect();
        Ok(())
    }

    fn stored_output<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StepLogError> {
        self.recorded
            .get(name)
            .map(|r| {
                serde_json::from_value(r.output.clone())
                    .map_err(|e| StepLogError::Serialization(format!("{name}: {e}")))
            })
            .transpose()
    }
}
