//! Retry poller: starts runs for failed documents whose retry is due.
//!
//! The run key of a poller-started run is derived from the document's
//! `next_retry_at`, so picking the same document twice before its run
//! begins resumes one run instead of starting two.
//!
//! Each tick also resumes runs that stopped on an error and have been idle
//! for `stall_after`, and prunes step records of runs finished longer than
//! `retention` ago.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use docflow_events::RunKey;

use crate::processor::{DocumentProcessor, ProcessError, RunOutcome};
use crate::store::DocumentStore;

#[derive(Debug, Clone)]
pub struct RetryPollerConfig {
    /// How often to look for due documents.
    pub poll_interval: Duration,
    /// Maximum documents started per poll, and stalled runs resumed per poll.
    pub batch_size: usize,
    /// Idle time after which an unfinished run is resumed.
    pub stall_after: Duration,
    /// How long step records of finished runs are kept.
    pub retention: Duration,
    /// Name for logging.
    pub name: String,
}

impl Default for RetryPollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 50,
            stall_after: Duration::from_secs(60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            name: "retry-poller".to_string(),
        }
    }
}

impl RetryPollerConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_stall_after(mut self, stall_after: Duration) -> Self {
        self.stall_after = stall_after;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Handle to control a running poller.
#[derive(Debug)]
pub struct RetryPollerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl RetryPollerHandle {
    /// Request graceful shutdown and wait for the loop to exit.
    ///
    /// A batch already in flight finishes first.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.join.await {
            error!(error = %e, "retry poller task failed");
        }
    }
}

#[derive(Clone)]
pub struct RetryPoller {
    processor: Arc<DocumentProcessor>,
    config: RetryPollerConfig,
}

impl RetryPoller {
    pub fn new(processor: Arc<DocumentProcessor>, config: RetryPollerConfig) -> Self {
        Self { processor, config }
    }

    /// Resume stalled runs, then start one run per due document and wait
    /// for them, then prune old finished runs.
    ///
    /// Returns how many runs finished without error.
    pub async fn poll_once(&self, now: DateTime<Utc>) -> Result<usize, ProcessError> {
        let mut finished = 0;
        if let Some(idle_since) = age_cutoff(now, self.config.stall_after) {
            finished += self
                .processor
                .resume_incomplete(idle_since, self.config.batch_size)
                .await?;
        }

        finished += self.start_due(now).await?;

        if let Some(completed_before) = age_cutoff(now, self.config.retention) {
            self.processor.prune_finished_runs(completed_before).await?;
        }
        Ok(finished)
    }

    async fn start_due(&self, now: DateTime<Utc>) -> Result<usize, ProcessError> {
        let due = self
            .processor
            .store()
            .due_for_retry(now, self.config.batch_size)
            .await?;
        if due.is_empty() {
            return Ok(0);
        }
        debug!(poller = %self.config.name, due = due.len(), "documents due for retry");

        let mut runs = JoinSet::new();
        for doc in due {
            let Some(due_at) = doc.next_retry_at else {
                continue;
            };
            let processor = self.processor.clone();
            runs.spawn(async move {
                let result = processor
                    .run(doc.tenant_id, doc.id, RunKey::retry(due_at), None)
                    .await;
                (doc.tenant_id, doc.id, result)
            });
        }

        let mut finished = 0;
        while let Some(joined) = runs.join_next().await {
            match joined {
                Ok((_, _, Ok(RunOutcome::InFlight))) => {}
                Ok((_, _, Ok(_))) => finished += 1,
                Ok((tenant_id, document_id, Err(e))) => warn!(
                    tenant_id = %tenant_id,
                    document_id = %document_id,
                    error = %e,
                    "retry run failed"
                ),
                Err(e) => error!(error = %e, "retry run panicked"),
            }
        }
        Ok(finished)
    }

    /// Spawn the polling loop on the current tokio runtime.
    pub fn spawn(self) -> RetryPollerHandle {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let join = tokio::spawn(poller_loop(self, shutdown_rx));
        RetryPollerHandle {
            shutdown: Some(shutdown_tx),
            join,
        }
    }
}

/// `now - age`, or `None` when it does not fit a timestamp.
fn age_cutoff(now: DateTime<Utc>, age: Duration) -> Option<DateTime<Utc>> {
    let age = chrono::Duration::from_std(age).ok()?;
    now.checked_sub_signed(age)
}

async fn poller_loop(poller: RetryPoller, mut shutdown_rx: oneshot::Receiver<()>) {
    info!(
        poller = %poller.config.name,
        interval_ms = poller.config.poll_interval.as_millis() as u64,
        "retry poller started"
    );
    let mut ticker = tokio::time::interval(poller.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            _ = ticker.tick() => {
                match poller.poll_once(Utc::now()).await {
                    Ok(0) => {}
                    Ok(n) => info!(poller = %poller.config.name, runs = n, "retry runs finished"),
                    Err(e) => error!(poller = %poller.config.name, error = %e, "retry poll failed"),
                }
            }
        }
    }

    info!(poller = %poller.config.name, "retry poller stopped");
}
