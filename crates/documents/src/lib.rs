//! Document processing domain: the job state machine and the pure decision
//! functions the dispatcher is built from (admission, classification,
//! retry scheduling, settlement, notification content).
//!
//! Nothing here performs IO. Infrastructure feeds observations in and
//! persists what comes out.

pub mod admission;
pub mod classify;
pub mod document;
pub mod notification;
pub mod outcome;
pub mod policy;
pub mod retry;
pub mod settlement;

pub use admission::{
    ADMISSION_RETRY_DELAY_SECS, AdmissionDecision, ConcurrencyLimits, LimitType, ProcessingCounts,
    deferred_retry_at,
};
pub use classify::{Classification, ErrorCode, ErrorKind, classify};
pub use document::{Document, DocumentStatus, LastError, ProcessingArtifacts, ProcessingEvent};
pub use notification::notification_for;
pub use outcome::{Derivatives, DispatchOutcome, Verdict, WorkerFailure, WorkerReport};
pub use policy::ProcessingPolicy;
pub use retry::RetryPolicy;
pub use settlement::{Settlement, settle};
