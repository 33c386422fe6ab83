//! Turning a recorded dispatch outcome into the document's next state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::DomainResult;

use crate::classify::Classification;
use crate::document::Document;
use crate::outcome::{DispatchOutcome, Verdict, WorkerReport};
use crate::retry::RetryPolicy;

/// How a dispatch settles the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "settlement", rename_all = "snake_case")]
pub enum Settlement {
    /// Terminal success (`ACTIVE`) or terminal reject (`INFECTED`).
    Completed { report: WorkerReport },
    /// Transient failure with attempts left.
    RetryScheduled {
        classification: Classification,
        message: String,
        retry_at: DateTime<Utc>,
    },
    /// Permanent failure, or transient failure with attempts exhausted.
    GaveUp {
        classification: Classification,
        message: String,
        attempts: u32,
    },
}

impl Settlement {
    /// Terminal settlements are the ones that get a notification.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Settlement::RetryScheduled { .. })
    }

    pub fn verdict(&self) -> Option<Verdict> {
        match self {
            Settlement::Completed { report } => Some(report.status),
            _ => None,
        }
    }

    /// Apply the settlement to a document in `PROCESSING`.
    pub fn apply(&self, doc: &mut Document, now: DateTime<Utc>) -> DomainResult<()> {
        match self {
            Settlement::Completed { report } => doc.complete(report, now),
            Settlement::RetryScheduled {
                classification,
                message,
                retry_at,
            } => doc.fail(*classification, message.clone(), Some(*retry_at), now),
            Settlement::GaveUp {
                classification,
                message,
                ..
            } => doc.fail(*classification, message.clone(), None, now),
        }
    }
}

/// Decide the settlement for dispatch number `attempt` (the count after it).
pub fn settle(
    outcome: &DispatchOutcome,
    attempt: u32,
    policy: &RetryPolicy,
    now: DateTime<Utc>,
) -> Settlement {
    match outcome {
        DispatchOutcome::Success(report) => Settlement::Completed {
            report: report.clone(),
        },
        DispatchOutcome::PermanentFailure { code, message } => Settlement::GaveUp {
            classification: Classification::permanent(*code),
            message: message.clone(),
            attempts: attempt,
        },
        DispatchOutcome::TransientFailure { code, message } => {
            let classification = Classification::transient(*code);
            match policy.next_retry(attempt, now) {
                Some(retry_at) => Settlement::RetryScheduled {
                    classification,
                    message: message.clone(),
                    retry_at,
                },
                None => Settlement::GaveUp {
                    classification,
                    message: message.clone(),
                    attempts: attempt,
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use crate::classify::{ErrorCode, ErrorKind};
    use crate::outcome::Derivatives;

    fn transient() -> DispatchOutcome {
        DispatchOutcome::TransientFailure {
            code: ErrorCode::WorkerError,
            message: "Worker returned status 503".to_string(),
        }
    }

    #[test]
    fn transient_failure_with_attempts_left_schedules_a_retry() {
        let now = Utc::now();
        let s = settle(&transient(), 1, &RetryPolicy::default(), now);

        match s {
            Settlement::RetryScheduled { retry_at, classification, .. } => {
                assert_eq!(retry_at - now, Duration::seconds(600));
                assert_eq!(classification.kind, ErrorKind::Transient);
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn third_transient_failure_gives_up() {
        let s = settle(&transient(), 3, &RetryPolicy::default(), Utc::now());
        assert!(matches!(s, Settlement::GaveUp { attempts: 3, .. }));
        assert!(s.is_terminal());
    }

    #[test]
    fn permanent_failure_gives_up_immediately() {
        let outcome = DispatchOutcome::PermanentFailure {
            code: ErrorCode::UnsupportedFormat,
            message: "Unsupported format: .xyz".to_string(),
        };
        let s = settle(&outcome, 1, &RetryPolicy::default(), Utc::now());
        assert!(matches!(s, Settlement::GaveUp { attempts: 1, .. }));
    }

    #[test]
    fn success_completes_with_the_workers_verdict() {
        let report = WorkerReport {
            status: Verdict::Infected,
            file_name: "x.exe".to_string(),
            file_size: 1,
            mime_type: "application/octet-stream".to_string(),
            checksum: "sha256:1".to_string(),
            derivatives: Derivatives::default(),
            metadata: serde_json::Value::Null,
        };
        let s = settle(&DispatchOutcome::Success(report), 1, &RetryPolicy::default(), Utc::now());
        assert_eq!(s.verdict(), Some(Verdict::Infected));
        assert!(s.is_terminal());
    }
}
