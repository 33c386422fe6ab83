//! Dispatcher: one worker call per attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use docflow_core::RunnerId;
use docflow_documents::{DispatchOutcome, Document};

use crate::store::{DocumentStore, StoreError, Transition};
use crate::worker::ProcessingWorker;

/// What the dispatch step records: the attempt number, the tagged result and
/// the time it came back (settlement is computed from that time on replay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub attempt: u32,
    pub outcome: DispatchOutcome,
    pub completed_at: DateTime<Utc>,
}

/// Claim on the dispatch step of a run, recorded before the worker is
/// called.
///
/// Another runner that replays the run while the lease is live and the
/// dispatch result is not yet recorded must not call the worker. Once the
/// lease expires the dispatch is presumed lost and may be taken over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchLease {
    pub owner: RunnerId,
    pub expires_at: DateTime<Utc>,
}

impl DispatchLease {
    pub fn new(owner: RunnerId, now: DateTime<Utc>, duration: chrono::Duration) -> Self {
        Self {
            owner,
            expires_at: now + duration,
        }
    }

    /// True when someone other than `runner` still holds the lease.
    pub fn held_by_other(&self, runner: RunnerId, now: DateTime<Utc>) -> bool {
        self.owner != runner && now < self.expires_at
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<dyn DocumentStore>,
    worker: Arc<dyn ProcessingWorker>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn DocumentStore>, worker: Arc<dyn ProcessingWorker>) -> Self {
        Self { store, worker }
    }

    /// Count the attempt and call the worker.
    ///
    /// `snapshot` is the document as loaded at the start of the run; the
    /// attempt number is derived from it, so a re-executed dispatch writes
    /// the same absolute count.
    pub async fn dispatch(&self, snapshot: &Document) -> Result<DispatchRecord, StoreError> {
        let attempt = snapshot.processing_attempt_count + 1;
        self.store
            .record(
                snapshot.tenant_id,
                snapshot.id,
                &Transition::RecordAttempt { attempt },
                Utc::now(),
            )
            .await?;

        info!(
            tenant_id = %snapshot.tenant_id,
            document_id = %snapshot.id,
            attempt,
            "dispatching to worker"
        );

        let result = self.worker.process(snapshot.id, &snapshot.storage_key).await;
        let outcome = DispatchOutcome::from_result(result);

        match &outcome {
            DispatchOutcome::Success(report) => info!(
                document_id = %snapshot.id,
                attempt,
                verdict = ?report.status,
                "worker succeeded"
            ),
            DispatchOutcome::TransientFailure { code, message }
            | DispatchOutcome::PermanentFailure { code, message } => warn!(
                document_id = %snapshot.id,
                attempt,
                code = code.as_str(),
                error = %message,
                "worker failed"
            ),
        }

        Ok(DispatchRecord {
            attempt,
            outcome,
            completed_at: Utc::now(),
        })
    }
}
