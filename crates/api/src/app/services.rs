use std::sync::Arc;
use std::thread;

use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use docflow_documents::ProcessingPolicy;
use docflow_events::{EventBus, InMemoryEventBus, NotificationRequested};
use docflow_infra::{
    BusNotificationSink, DocumentProcessor, DocumentStore, HttpWorker, InMemoryDocumentStore,
    InMemoryStepLog, PostgresDocumentStore, PostgresStepLog, ProcessingWorker, RetryPoller,
    RetryPollerConfig, ServiceConfig, StepLog,
};

/// Bus carrying notification requests to the notification collaborator.
pub type NotificationBus = InMemoryEventBus<NotificationRequested>;

#[derive(Debug, thiserror::Error)]
pub enum ServicesError {
    #[error("failed to connect to Postgres: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migration(String),
    #[error("failed to build worker client: {0}")]
    Worker(#[from] reqwest::Error),
}

/// Everything the HTTP layer and the background tasks share.
#[derive(Clone)]
pub struct AppServices {
    pub store: Arc<dyn DocumentStore>,
    pub processor: Arc<DocumentProcessor>,
    pub notifications: Arc<NotificationBus>,
    pub poller: RetryPollerConfig,
}

impl AppServices {
    /// In-memory stores around the given worker (tests/dev).
    pub fn in_memory(worker: Arc<dyn ProcessingWorker>, policy: ProcessingPolicy) -> Self {
        let store: Arc<dyn DocumentStore> = Arc::new(InMemoryDocumentStore::new());
        let steps: Arc<dyn StepLog> = Arc::new(InMemoryStepLog::new());
        Self::assemble(
            store,
            steps,
            worker,
            policy,
            RetryPollerConfig::default(),
            None,
        )
    }

    /// Build from configuration: Postgres when a database URL is set,
    /// in-memory stores otherwise.
    pub async fn from_config(config: &ServiceConfig) -> Result<Self, ServicesError> {
        let worker: Arc<dyn ProcessingWorker> =
            Arc::new(HttpWorker::new(&config.worker_url, config.worker_timeout)?);

        let (store, steps): (Arc<dyn DocumentStore>, Arc<dyn StepLog>) = match &config.database_url {
            Some(url) => {
                let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
                let store = PostgresDocumentStore::new(pool.clone());
                store
                    .migrate()
                    .await
                    .map_err(|e| ServicesError::Migration(e.to_string()))?;
                info!("using postgres document store");
                (Arc::new(store), Arc::new(PostgresStepLog::new(pool)))
            }
            None => {
                warn!("DOCFLOW_DATABASE_URL not set; state is kept in memory");
                (
                    Arc::new(InMemoryDocumentStore::new()),
                    Arc::new(InMemoryStepLog::new()),
                )
            }
        };

        Ok(Self::assemble(
            store,
            steps,
            worker,
            config.policy.clone(),
            config.retry_poller_config(),
            Some(config.dispatch_lease()),
        ))
    }

    fn assemble(
        store: Arc<dyn DocumentStore>,
        steps: Arc<dyn StepLog>,
        worker: Arc<dyn ProcessingWorker>,
        policy: ProcessingPolicy,
        poller: RetryPollerConfig,
        dispatch_lease: Option<chrono::Duration>,
    ) -> Self {
        let notifications = Arc::new(NotificationBus::new());
        let sink = Arc::new(BusNotificationSink::new(notifications.clone()));
        let mut processor = DocumentProcessor::new(store.clone(), steps, worker, sink, policy);
        if let Some(lease) = dispatch_lease {
            processor = processor.with_dispatch_lease(lease);
        }
        Self {
            store,
            processor: Arc::new(processor),
            notifications,
            poller,
        }
    }

    pub fn retry_poller(&self) -> RetryPoller {
        RetryPoller::new(self.processor.clone(), self.poller.clone())
    }

    /// Forward notification requests to the log until the bus closes.
    ///
    /// Stands in for the delivery collaborator; requests carry a dedup key
    /// so a real consumer can drop repeats.
    pub fn spawn_notification_logger(&self) -> thread::JoinHandle<()> {
        let subscription = self.notifications.subscribe();
        thread::spawn(move || {
            while let Ok(n) = subscription.recv() {
                info!(
                    tenant_id = %n.tenant_id,
                    document_id = %n.job_id,
                    recipient = %n.recipient,
                    outcome = %n.outcome,
                    urgent = n.force_urgent_channel,
                    dedup_key = %n.dedup_key,
                    "notification requested"
                );
            }
        })
    }
}
