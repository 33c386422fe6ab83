//! Document processor: the durable run that ties admission, dispatch,
//! settlement and notification together.
//!
//! Steps of a run, each recorded in the step log:
//!
//! ```text
//! load ─► admission ─┬─ denied ──► defer ─────────────────────────────────────► run.completed
//!                    └─ admitted ─► begin ─► lease ─► dispatch ─► settle ─► notify? ─► run.completed
//! ```
//!
//! Timestamps that feed decisions come from recorded outputs (`decided_at`
//! of the admission step, `completed_at` of the dispatch step), so a replay
//! writes exactly the values the first execution wrote.
//!
//! A run executes at most once at a time: within a process through the
//! in-flight set, across processes through the dispatch lease.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use docflow_core::{DocumentId, RunnerId, TenantId};
use docflow_documents::{
    AdmissionDecision, Document, DocumentStatus, LimitType, ProcessingPolicy, Settlement, settle,
};
use docflow_events::{NotificationRequested, RunKey, UploadCompleted};

use crate::admission::{AdmissionCheck, AdmissionController};
use crate::dispatch::{DispatchLease, DispatchRecord, Dispatcher};
use crate::notifier::{NotificationSink, NotifierTrigger, NotifyError};
use crate::steps::{DurableRun, StepLog, StepLogError};
use crate::store::{DocumentStore, StoreError, Transition};
use crate::worker::ProcessingWorker;

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The run had already finished; nothing was executed.
    AlreadyCompleted,
    /// The document was not in a runnable state when the run started.
    Skipped { status: DocumentStatus },
    /// Capacity denial; the poller picks the document up at `retry_at`.
    Deferred {
        limit: LimitType,
        retry_at: DateTime<Utc>,
    },
    /// The worker was called and its result settled the document.
    Settled {
        attempt: u32,
        settlement: Settlement,
        notification: Option<NotificationRequested>,
    },
    /// Another execution of the same run holds it; nothing was done and the
    /// run stays open.
    InFlight,
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    StepLog(#[from] StepLogError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}

/// Default lifetime of a dispatch lease.
pub const DEFAULT_DISPATCH_LEASE_SECS: i64 = 15 * 60;

type RunId = (TenantId, DocumentId, RunKey);

/// Runs executing in this process.
#[derive(Debug, Default)]
struct InFlightRuns(Mutex<HashSet<RunId>>);

impl InFlightRuns {
    fn enter(&self, id: RunId) -> Option<InFlightGuard<'_>> {
        let mut runs = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !runs.insert(id.clone()) {
            return None;
        }
        Some(InFlightGuard { runs: self, id })
    }
}

struct InFlightGuard<'a> {
    runs: &'a InFlightRuns,
    id: RunId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.runs
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

#[derive(Clone)]
pub struct DocumentProcessor {
    store: Arc<dyn DocumentStore>,
    steps: Arc<dyn StepLog>,
    admission: AdmissionController,
    dispatcher: Dispatcher,
    notifier: NotifierTrigger,
    policy: ProcessingPolicy,
    runner_id: RunnerId,
    dispatch_lease: chrono::Duration,
    in_flight: Arc<InFlightRuns>,
}

impl DocumentProcessor {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        steps: Arc<dyn StepLog>,
        worker: Arc<dyn ProcessingWorker>,
        sink: Arc<dyn NotificationSink>,
        policy: ProcessingPolicy,
    ) -> Self {
        Self {
            admission: AdmissionController::new(store.clone(), policy.limits),
            dispatcher: Dispatcher::new(store.clone(), worker),
            notifier: NotifierTrigger::new(sink),
            store,
            steps,
            policy,
            runner_id: RunnerId::new(),
            dispatch_lease: chrono::Duration::seconds(DEFAULT_DISPATCH_LEASE_SECS),
            in_flight: Arc::new(InFlightRuns::default()),
        }
    }

    /// How long a dispatch claimed by this processor blocks other runners.
    ///
    /// Should exceed the longest expected worker call.
    pub fn with_dispatch_lease(mut self, lease: chrono::Duration) -> Self {
        self.dispatch_lease = lease;
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn runner_id(&self) -> RunnerId {
        self.runner_id
    }

    /// Entry point for the upload-complete trigger.
    pub async fn handle_upload(
        &self,
        tenant_id: TenantId,
        event: UploadCompleted,
    ) -> Result<RunOutcome, ProcessError> {
        self.run(
            tenant_id,
            event.job_id,
            RunKey::upload(),
            Some(event.storage_object_key),
        )
        .await
    }

    /// Execute (or resume) one run for a document.
    ///
    /// `storage_key`, when given, replaces the stored locator before the
    /// document is loaded.
    pub async fn run(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        run_key: RunKey,
        storage_key: Option<String>,
    ) -> Result<RunOutcome, ProcessError> {
        let Some(_guard) = self
            .in_flight
            .enter((tenant_id, document_id, run_key.clone()))
        else {
            debug!(
                tenant_id = %tenant_id,
                document_id = %document_id,
                run_key = %run_key,
                "run already executing in this process"
            );
            return Ok(RunOutcome::InFlight);
        };

        let mut run = DurableRun::open(self.steps.clone(), tenant_id, document_id, run_key).await?;
        if run.is_completed() {
            return Ok(RunOutcome::AlreadyCompleted);
        }

        let snapshot: Document = run
            .step("load", || self.load(tenant_id, document_id, storage_key))
            .await?;

        if !snapshot.is_runnable() {
            info!(
                tenant_id = %tenant_id,
                document_id = %document_id,
                run_key = %run.run_key(),
                status = %snapshot.status,
                "document not runnable; skipping"
            );
            run.complete().await?;
            return Ok(RunOutcome::Skipped {
                status: snapshot.status,
            });
        }

        let check: AdmissionCheck = run
            .step("admission", || async {
                Ok::<_, ProcessError>(self.admission.check(tenant_id, Utc::now()).await?)
            })
            .await?;

        let outcome = match (check.decision, check.retry_at()) {
            (AdmissionDecision::Denied { limit }, Some(retry_at)) => {
                self.defer(&mut run, &snapshot, limit, retry_at, check.decided_at)
                    .await?
            }
            _ => self.dispatch_and_settle(&mut run, &snapshot, check.decided_at).await?,
        };
        if outcome == RunOutcome::InFlight {
            return Ok(outcome);
        }

        run.complete().await?;
        Ok(outcome)
    }

    /// Resume runs that never completed and recorded nothing since
    /// `idle_since`.
    ///
    /// Called at startup (with the current time) and by the poller for runs
    /// that stopped on an error. Returns the number of runs that finished;
    /// failures are logged and left for the next sweep.
    pub async fn resume_incomplete(
        &self,
        idle_since: DateTime<Utc>,
        limit: usize,
    ) -> Result<usize, ProcessError> {
        let runs = self.steps.incomplete_runs(idle_since, limit).await?;
        let mut resumed = 0;

        for r in runs {
            match self.run(r.tenant_id, r.document_id, r.run_key.clone(), None).await {
                Ok(RunOutcome::InFlight) => debug!(
                    document_id = %r.document_id,
                    run_key = %r.run_key,
                    "run still held elsewhere"
                ),
                Ok(outcome) => {
                    info!(
                        tenant_id = %r.tenant_id,
                        document_id = %r.document_id,
                        run_key = %r.run_key,
                        outcome = ?outcome,
                        "resumed run"
                    );
                    resumed += 1;
                }
                Err(e) => warn!(
                    tenant_id = %r.tenant_id,
                    document_id = %r.document_id,
                    run_key = %r.run_key,
                    error = %e,
                    "failed to resume run"
                ),
            }
        }

        Ok(resumed)
    }

    /// Drop step records of runs completed before `completed_before`.
    ///
    /// A trigger re-delivered after its run was pruned starts a fresh run,
    /// which skips documents that already settled.
    pub async fn prune_finished_runs(
        &self,
        completed_before: DateTime<Utc>,
    ) -> Result<u64, ProcessError> {
        let removed = self.steps.prune_completed(completed_before).await?;
        if removed > 0 {
            info!(removed, completed_before = %completed_before, "pruned finished runs");
        }
        Ok(removed)
    }

    async fn load(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        storage_key: Option<String>,
    ) -> Result<Document, ProcessError> {
        let doc = match storage_key {
            Some(storage_key) => {
                self.store
                    .record(
                        tenant_id,
                        document_id,
                        &Transition::SetStorageKey { storage_key },
                        Utc::now(),
                    )
                    .await
                    .map_err(|e| match e {
                        StoreError::NotFound(id) => ProcessError::NotFound(id),
                        other => other.into(),
                    })?
            }
            None => self
                .store
                .get(tenant_id, document_id)
                .await?
                .ok_or(ProcessError::NotFound(document_id))?,
        };
        Ok(doc)
    }

    async fn defer(
        &self,
        run: &mut DurableRun,
        snapshot: &Document,
        limit: LimitType,
        retry_at: DateTime<Utc>,
        decided_at: DateTime<Utc>,
    ) -> Result<RunOutcome, ProcessError> {
        run.step("defer", || async {
            self.store
                .record(
                    snapshot.tenant_id,
                    snapshot.id,
                    &Transition::DeferAdmission { limit, retry_at },
                    decided_at,
                )
                .await?;
            Ok::<_, ProcessError>(())
        })
        .await?;

        info!(
            tenant_id = %snapshot.tenant_id,
            document_id = %snapshot.id,
            limit = limit.as_str(),
            retry_at = %retry_at,
            "processing deferred"
        );
        Ok(RunOutcome::Deferred { limit, retry_at })
    }

    async fn dispatch_and_settle(
        &self,
        run: &mut DurableRun,
        snapshot: &Document,
        decided_at: DateTime<Utc>,
    ) -> Result<RunOutcome, ProcessError> {
        run.step("begin", || async {
            self.store
                .record(
                    snapshot.tenant_id,
                    snapshot.id,
                    &Transition::BeginProcessing,
                    decided_at,
                )
                .await?;
            Ok::<_, ProcessError>(())
        })
        .await?;

        let lease: DispatchLease = run
            .step("lease", || async {
                Ok::<_, ProcessError>(DispatchLease::new(
                    self.runner_id,
                    Utc::now(),
                    self.dispatch_lease,
                ))
            })
            .await?;
        if !run.has_step("dispatch") && lease.held_by_other(self.runner_id, Utc::now()) {
            info!(
                tenant_id = %snapshot.tenant_id,
                document_id = %snapshot.id,
                run_key = %run.run_key(),
                owner = %lease.owner,
                expires_at = %lease.expires_at,
                "dispatch leased by another runner"
            );
            return Ok(RunOutcome::InFlight);
        }

        let dispatched: DispatchRecord = run
            .step("dispatch", || async {
                Ok::<_, ProcessError>(self.dispatcher.dispatch(snapshot).await?)
            })
            .await?;

        let settlement = settle(
            &dispatched.outcome,
            dispatched.attempt,
            &self.policy.retry,
            dispatched.completed_at,
        );

        run.step("settle", || async {
            self.store
                .record(
                    snapshot.tenant_id,
                    snapshot.id,
                    &Transition::Settle(settlement.clone()),
                    dispatched.completed_at,
                )
                .await?;
            Ok::<_, ProcessError>(())
        })
        .await?;

        match &settlement {
            Settlement::Completed { report } => info!(
                document_id = %snapshot.id,
                attempt = dispatched.attempt,
                verdict = ?report.status,
                "document settled"
            ),
            Settlement::RetryScheduled {
                classification,
                retry_at,
                ..
            } => info!(
                document_id = %snapshot.id,
                attempt = dispatched.attempt,
                code = classification.code.as_str(),
                retry_at = %retry_at,
                "retry scheduled"
            ),
            Settlement::GaveUp {
                classification,
                attempts,
                ..
            } => warn!(
                document_id = %snapshot.id,
                attempts,
                kind = classification.kind.as_str(),
                code = classification.code.as_str(),
                "processing abandoned"
            ),
        }

        let notification = if settlement.is_terminal() {
            run.step("notify", || async {
                Ok::<_, ProcessError>(self.notifier.fire(snapshot, &settlement)?)
            })
            .await?
        } else {
            None
        };

        Ok(RunOutcome::Settled {
            attempt: dispatched.attempt,
            settlement,
            notification,
        })
    }
}
