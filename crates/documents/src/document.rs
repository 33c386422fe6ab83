//! The document record and its processing state machine.
//!
//! ```text
//! PENDING ──► PROCESSING ──► ACTIVE | INFECTED | PROCESSING_FAILED
//!    │                                              │
//!    └──(admission deferral)──► PROCESSING_FAILED ◄─┘
//!                                   │ next_retry_at set
//!                                   └──► PROCESSING (retry run)
//! ```
//!
//! Every transition is a "set to final value" write: re-applying a transition
//! that already took effect is a no-op, so a step replayed after a crash
//! cannot double-apply it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use docflow_core::{DocumentId, DomainError, DomainResult, Entity, TenantId, UserId};
use docflow_events::Event;

use crate::admission::LimitType;
use crate::classify::{Classification, ErrorCode, ErrorKind};
use crate::outcome::{Derivatives, Verdict, WorkerReport};

/// Processing status (persisted as SCREAMING_SNAKE_CASE).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Pending,
    Processing,
    /// Clean; terminal success.
    Active,
    /// Malicious content; terminal reject.
    Infected,
    /// Failed; retryable while `next_retry_at` is set.
    ProcessingFailed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "PENDING",
            DocumentStatus::Processing => "PROCESSING",
            DocumentStatus::Active => "ACTIVE",
            DocumentStatus::Infected => "INFECTED",
            DocumentStatus::ProcessingFailed => "PROCESSING_FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let status = match s {
            "PENDING" => DocumentStatus::Pending,
            "PROCESSING" => DocumentStatus::Processing,
            "ACTIVE" => DocumentStatus::Active,
            "INFECTED" => DocumentStatus::Infected,
            "PROCESSING_FAILED" => DocumentStatus::ProcessingFailed,
            _ => return None,
        };
        Some(status)
    }

    pub const ALL: [DocumentStatus; 5] = [
        DocumentStatus::Pending,
        DocumentStatus::Processing,
        DocumentStatus::Active,
        DocumentStatus::Infected,
        DocumentStatus::ProcessingFailed,
    ];
}

impl core::fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Last failure observed for the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastError {
    pub kind: ErrorKind,
    pub code: ErrorCode,
    pub message: String,
}

/// Fields populated only on successful completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingArtifacts {
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub checksum: String,
    pub derivatives: Derivatives,
    pub metadata: JsonValue,
}

impl From<&WorkerReport> for ProcessingArtifacts {
    fn from(report: &WorkerReport) -> Self {
        Self {
            file_name: report.file_name.clone(),
            file_size: report.file_size,
            mime_type: report.mime_type.clone(),
            checksum: report.checksum.clone(),
            derivatives: report.derivatives.clone(),
            metadata: report.metadata.clone(),
        }
    }
}

/// Entry in a document's processing history.
///
/// Capacity deferrals are recorded separately from worker failures: they are
/// not attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessingEvent {
    AdmissionDeferred {
        limit: LimitType,
        retry_at: DateTime<Utc>,
        at: DateTime<Utc>,
    },
    Dispatched {
        attempt: u32,
        at: DateTime<Utc>,
    },
    WorkerFailed {
        attempt: u32,
        kind: ErrorKind,
        code: ErrorCode,
        at: DateTime<Utc>,
    },
    Completed {
        verdict: Verdict,
        at: DateTime<Utc>,
    },
}

impl Event for ProcessingEvent {
    fn event_type(&self) -> &'static str {
        match self {
            ProcessingEvent::AdmissionDeferred { .. } => "document.admission_deferred",
            ProcessingEvent::Dispatched { .. } => "document.dispatched",
            ProcessingEvent::WorkerFailed { .. } => "document.worker_failed",
            ProcessingEvent::Completed { .. } => "document.completed",
        }
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            ProcessingEvent::AdmissionDeferred { at, .. }
            | ProcessingEvent::Dispatched { at, .. }
            | ProcessingEvent::WorkerFailed { at, .. }
            | ProcessingEvent::Completed { at, .. } => *at,
        }
    }
}

/// An uploaded document under processing (the "job").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub uploaded_by: UserId,
    pub storage_key: String,
    pub status: DocumentStatus,
    pub processing_attempt_count: u32,
    pub last_error: Option<LastError>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub artifacts: Option<ProcessingArtifacts>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// One entry per state change, kept for the document's lifetime.
    ///
    /// Dispatch entries are capped by the retry policy's `max_attempts`.
    /// Admission deferrals are not capped; a tenant that stays at capacity
    /// adds one entry per deferral.
    pub history: Vec<ProcessingEvent>,
}

impl Entity for Document {
    type Id = DocumentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}

impl Document {
    /// Register a freshly uploaded document in `PENDING`.
    pub fn new(
        tenant_id: TenantId,
        uploaded_by: UserId,
        storage_key: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        let storage_key = storage_key.into();
        if storage_key.trim().is_empty() {
            return Err(DomainError::validation("storage_key must not be empty"));
        }
        Ok(Self {
            id: DocumentId::new(),
            tenant_id,
            uploaded_by,
            storage_key,
            status: DocumentStatus::Pending,
            processing_attempt_count: 0,
            last_error: None,
            next_retry_at: None,
            artifacts: None,
            created_at: now,
            updated_at: now,
            history: Vec::new(),
        })
    }

    /// No further automatic transition will happen.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            DocumentStatus::Active | DocumentStatus::Infected => true,
            DocumentStatus::ProcessingFailed => self.next_retry_at.is_none(),
            DocumentStatus::Pending | DocumentStatus::Processing => false,
        }
    }

    /// May a run start (admission check) for this document?
    pub fn is_runnable(&self) -> bool {
        match self.status {
            DocumentStatus::Pending => true,
            DocumentStatus::ProcessingFailed => self.next_retry_at.is_some(),
            _ => false,
        }
    }

    /// Due for a poller-driven retry at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DocumentStatus::ProcessingFailed
            && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Capacity denial: park the document until `retry_at` without counting
    /// an attempt.
    pub fn defer_admission(
        &mut self,
        limit: LimitType,
        retry_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if self.status == DocumentStatus::ProcessingFailed && self.next_retry_at == Some(retry_at) {
            return Ok(());
        }
        if !self.is_runnable() {
            return Err(self.illegal("defer admission"));
        }

        self.status = DocumentStatus::ProcessingFailed;
        self.next_retry_at = Some(retry_at);
        self.updated_at = now;
        self.history.push(ProcessingEvent::AdmissionDeferred {
            limit,
            retry_at,
            at: now,
        });
        Ok(())
    }

    /// Admitted: the document is now in flight.
    pub fn begin_processing(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        if self.status == DocumentStatus::Processing {
            return Ok(());
        }
        if !self.is_runnable() {
            return Err(self.illegal("begin processing"));
        }

        self.status = DocumentStatus::Processing;
        self.next_retry_at = None;
        self.updated_at = now;
        Ok(())
    }

    /// Record that dispatch number `attempt` was made.
    ///
    /// `attempt` is the absolute count after this dispatch, so writing it twice
    /// leaves the count unchanged.
    pub fn record_attempt(&mut self, attempt: u32, now: DateTime<Utc>) -> DomainResult<()> {
        if self.processing_attempt_count >= attempt {
            return Ok(());
        }
        if self.status != DocumentStatus::Processing {
            return Err(self.illegal("record attempt"));
        }
        if attempt != self.processing_attempt_count + 1 {
            return Err(DomainError::conflict(format!(
                "attempt {attempt} does not follow recorded count {}",
                self.processing_attempt_count
            )));
        }

        self.processing_attempt_count = attempt;
        self.updated_at = now;
        self.history.push(ProcessingEvent::Dispatched { attempt, at: now });
        Ok(())
    }

    /// Worker succeeded: settle into `ACTIVE` or `INFECTED`.
    pub fn complete(&mut self, report: &WorkerReport, now: DateTime<Utc>) -> DomainResult<()> {
        let target = match report.status {
            Verdict::Clean => DocumentStatus::Active,
            Verdict::Infected => DocumentStatus::Infected,
        };
        if self.status == target {
            return Ok(());
        }
        if self.status != DocumentStatus::Processing {
            return Err(self.illegal("complete"));
        }

        self.status = target;
        self.last_error = None;
        self.next_retry_at = None;
        self.artifacts = Some(ProcessingArtifacts::from(report));
        self.updated_at = now;
        self.history.push(ProcessingEvent::Completed {
            verdict: report.status,
            at: now,
        });
        Ok(())
    }

    /// Worker failed: record the error and the next retry (if any).
    pub fn fail(
        &mut self,
        classification: Classification,
        message: impl Into<String>,
        next_retry_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        let attempt = self.processing_attempt_count;
        let already_recorded = self.status == DocumentStatus::ProcessingFailed
            && self.history.last().is_some_and(|e| {
                matches!(e, ProcessingEvent::WorkerFailed { attempt: a, .. } if *a == attempt)
            });
        if already_recorded {
            return Ok(());
        }
        if self.status != DocumentStatus::Processing {
            return Err(self.illegal("fail"));
        }

        self.status = DocumentStatus::ProcessingFailed;
        self.last_error = Some(LastError {
            kind: classification.kind,
            code: classification.code,
            message: message.into(),
        });
        self.next_retry_at = next_retry_at;
        self.updated_at = now;
        self.history.push(ProcessingEvent::WorkerFailed {
            attempt,
            kind: classification.kind,
            code: classification.code,
            at: now,
        });
        Ok(())
    }

    fn illegal(&self, action: &str) -> DomainError {
        DomainError::invariant(format!(
            "cannot {action} document {} in status {}{}",
            self.id,
            self.status,
            if self.is_terminal() { " (terminal)" } else { "" }
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    use crate::classify::classify;
    use crate::retry::RetryPolicy;

    fn pending() -> Document {
        Document::new(TenantId::new(), UserId::new(), "tenant/a/report.pdf", Utc::now()).unwrap()
    }

    fn report(verdict: Verdict) -> WorkerReport {
        WorkerReport {
            status: verdict,
            file_name: "report.pdf".to_string(),
            file_size: 42,
            mime_type: "application/pdf".to_string(),
            checksum: "sha256:deadbeef".to_string(),
            derivatives: Derivatives::default(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn empty_storage_key_is_rejected() {
        let err = Document::new(TenantId::new(), UserId::new(), "  ", Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn clean_report_settles_active_and_clears_errors() {
        let mut doc = pending();
        let now = Utc::now();
        doc.begin_processing(now).unwrap();
        doc.record_attempt(1, now).unwrap();
        doc.fail(classify("timeout"), "timeout", Some(now), now).unwrap();
        doc.begin_processing(now).unwrap();
        doc.record_attempt(2, now).unwrap();
        doc.complete(&report(Verdict::Clean), now).unwrap();

        assert_eq!(doc.status, DocumentStatus::Active);
        assert!(doc.last_error.is_none());
        assert!(doc.next_retry_at.is_none());
        assert_eq!(doc.artifacts.as_ref().unwrap().checksum, "sha256:deadbeef");
        assert!(doc.is_terminal());
    }

    #[test]
    fn completion_cannot_skip_processing() {
        let mut doc = pending();
        let err = doc.complete(&report(Verdict::Clean), Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::InvariantViolation(_)));
    }

    #[test]
    fn deferral_keeps_attempt_count_and_is_idempotent() {
        let mut doc = pending();
        let now = Utc::now();
        let retry_at = now + Duration::seconds(60);

        doc.defer_admission(LimitType::Tenant, retry_at, now).unwrap();
        doc.defer_admission(LimitType::Tenant, retry_at, now).unwrap();

        assert_eq!(doc.status, DocumentStatus::ProcessingFailed);
        assert_eq!(doc.next_retry_at, Some(retry_at));
        assert_eq!(doc.processing_attempt_count, 0);
        assert_eq!(doc.history.len(), 1);
        assert!(doc.last_error.is_none());
    }

    #[test]
    fn replayed_transitions_do_not_double_apply() {
        let mut doc = pending();
        let now = Utc::now();

        doc.begin_processing(now).unwrap();
        doc.begin_processing(now).unwrap();
        doc.record_attempt(1, now).unwrap();
        doc.record_attempt(1, now).unwrap();
        let c = classify("Worker returned status 503");
        doc.fail(c, "Worker returned status 503", Some(now), now).unwrap();
        doc.fail(c, "Worker returned status 503", Some(now), now).unwrap();

        assert_eq!(doc.processing_attempt_count, 1);
        assert_eq!(doc.history.len(), 2);
    }

    #[test]
    fn attempts_cannot_jump() {
        let mut doc = pending();
        doc.begin_processing(Utc::now()).unwrap();
        let err = doc.record_attempt(3, Utc::now()).unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn terminal_documents_refuse_new_runs() {
        let mut doc = pending();
        let now = Utc::now();
        doc.begin_processing(now).unwrap();
        doc.record_attempt(1, now).unwrap();
        doc.fail(classify("corrupt file"), "corrupt file", None, now).unwrap();

        assert!(doc.is_terminal());
        assert!(!doc.is_runnable());
        assert!(doc.begin_processing(now).is_err());
        assert!(doc.defer_admission(LimitType::Global, now, now).is_err());
    }

    #[test]
    fn due_only_when_retry_time_has_passed() {
        let mut doc = pending();
        let now = Utc::now();
        doc.defer_admission(LimitType::Global, now + Duration::seconds(60), now)
            .unwrap();

        assert!(!doc.is_due(now));
        assert!(doc.is_due(now + Duration::seconds(60)));
    }

    #[test]
    fn status_names_round_trip() {
        for status in DocumentStatus::ALL {
            assert_eq!(DocumentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DocumentStatus::parse("DONE"), None);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 128,
            ..ProptestConfig::default()
        })]

        /// Property: driving a document through any sequence of worker
        /// outcomes keeps `next_retry_at` absent exactly when the document is
        /// settled terminally, and the attempt count never exceeds the policy.
        #[test]
        fn settled_documents_respect_retry_invariant(
            outcomes in prop::collection::vec(0u8..4, 1..8)
        ) {
            let policy = RetryPolicy::default();
            let mut doc = pending();
            let now = Utc::now();

            for o in outcomes {
                if !doc.is_runnable() {
                    break;
                }
                doc.begin_processing(now).unwrap();
                let attempt = doc.processing_attempt_count + 1;
                doc.record_attempt(attempt, now).unwrap();

                match o {
                    0 => doc.complete(&report(Verdict::Clean), now).unwrap(),
                    1 => doc.complete(&report(Verdict::Infected), now).unwrap(),
                    2 => {
                        let c = classify("network unreachable");
                        let next = policy.next_retry(attempt, now);
                        doc.fail(c, "network unreachable", next, now).unwrap();
                    }
                    _ => {
                        let c = classify("unsupported format");
                        doc.fail(c, "unsupported format", None, now).unwrap();
                    }
                }

                let permanent = doc.last_error.as_ref().is_some_and(|e| e.kind == ErrorKind::Permanent);
                let settled_terminal = matches!(doc.status, DocumentStatus::Active | DocumentStatus::Infected)
                    || doc.processing_attempt_count >= policy.max_attempts
                    || (doc.status == DocumentStatus::ProcessingFailed && permanent);
                prop_assert_eq!(doc.next_retry_at.is_none(), settled_terminal);
                prop_assert!(doc.processing_attempt_count <= policy.max_attempts);
            }
        }
    }
}
