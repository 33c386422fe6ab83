//! Infrastructure layer: state recorder and step log adapters (in-memory and
//! Postgres), the worker client, and the services that drive a document
//! through its durable processing run.

pub mod admission;
pub mod config;
pub mod dispatch;
pub mod notifier;
pub mod poller;
pub mod processor;
pub mod steps;
pub mod store;
pub mod worker;

pub use admission::{AdmissionCheck, AdmissionController};
pub use config::{ConfigError, ServiceConfig};
pub use dispatch::{DispatchLease, DispatchRecord, Dispatcher};
pub use notifier::{
    BusNotificationSink, InMemoryNotificationSink, NotificationSink, NotifierTrigger, NotifyError,
};
pub use poller::{RetryPoller, RetryPollerConfig, RetryPollerHandle};
pub use processor::{DocumentProcessor, ProcessError, RunOutcome};
pub use steps::{DurableRun, InMemoryStepLog, PostgresStepLog, RunRef, StepLog, StepLogError};
pub use store::{
    DocumentStats, DocumentStore, InMemoryDocumentStore, PostgresDocumentStore, StoreError, Transition,
};
pub use worker::{HttpWorker, ProcessingWorker};
