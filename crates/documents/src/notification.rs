//! Notification content for terminal settlements.

use docflow_events::{NotificationOutcome, NotificationRequested};

use crate::classify::ErrorKind;
use crate::document::Document;
use crate::outcome::Verdict;
use crate::settlement::Settlement;

/// Build the notification for a terminal settlement; `None` for a scheduled
/// retry (the document is not done yet).
///
/// Malicious content always forces the urgent channel, whatever the tenant's
/// usual delivery preferences are.
pub fn notification_for(doc: &Document, settlement: &Settlement) -> Option<NotificationRequested> {
    let (outcome, message) = match settlement {
        Settlement::RetryScheduled { .. } => return None,
        Settlement::Completed { report } => match report.status {
            Verdict::Clean => (
                NotificationOutcome::Success,
                format!("Your file \"{}\" was processed successfully.", report.file_name),
            ),
            Verdict::Infected => (
                NotificationOutcome::Infected,
                format!(
                    "Your file \"{}\" was rejected because malicious content was detected.",
                    report.file_name
                ),
            ),
        },
        Settlement::GaveUp {
            classification,
            attempts,
            ..
        } => match classification.kind {
            ErrorKind::Permanent => (
                NotificationOutcome::Failed,
                format!(
                    "This file type or content is unsupported ({}). It will not be processed.",
                    classification.code
                ),
            ),
            ErrorKind::Transient => (
                NotificationOutcome::Failed,
                format!(
                    "We could not process your file after {attempts} attempt(s). Please retry the upload."
                ),
            ),
        },
    };

    Some(NotificationRequested {
        job_id: doc.id,
        outcome,
        tenant_id: doc.tenant_id,
        recipient: doc.uploaded_by,
        force_urgent_channel: outcome == NotificationOutcome::Infected,
        dedup_key: NotificationRequested::dedup_key_for(doc.id, outcome),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use docflow_core::{TenantId, UserId};

    use crate::classify::{Classification, ErrorCode};
    use crate::outcome::{Derivatives, WorkerReport};

    fn doc() -> Document {
        Document::new(TenantId::new(), UserId::new(), "k", Utc::now()).unwrap()
    }

    fn completed(verdict: Verdict) -> Settlement {
        Settlement::Completed {
            report: WorkerReport {
                status: verdict,
                file_name: "scan.pdf".to_string(),
                file_size: 9,
                mime_type: "application/pdf".to_string(),
                checksum: "c".to_string(),
                derivatives: Derivatives::default(),
                metadata: serde_json::Value::Null,
            },
        }
    }

    #[test]
    fn infected_forces_urgent_channel() {
        let doc = doc();
        let n = notification_for(&doc, &completed(Verdict::Infected)).unwrap();
        assert_eq!(n.outcome, NotificationOutcome::Infected);
        assert!(n.force_urgent_channel);
        assert_eq!(n.recipient, doc.uploaded_by);
        assert_eq!(n.dedup_key, format!("{}:infected", doc.id));
    }

    #[test]
    fn clean_success_uses_normal_channel() {
        let n = notification_for(&doc(), &completed(Verdict::Clean)).unwrap();
        assert_eq!(n.outcome, NotificationOutcome::Success);
        assert!(!n.force_urgent_channel);
    }

    #[test]
    fn scheduled_retry_is_silent() {
        let s = Settlement::RetryScheduled {
            classification: Classification::transient(ErrorCode::Timeout),
            message: "timeout".to_string(),
            retry_at: Utc::now(),
        };
        assert!(notification_for(&doc(), &s).is_none());
    }

    #[test]
    fn exhaustion_and_permanence_read_differently() {
        let exhausted = Settlement::GaveUp {
            classification: Classification::transient(ErrorCode::WorkerError),
            message: "Worker returned status 503".to_string(),
            attempts: 3,
        };
        let permanent = Settlement::GaveUp {
            classification: Classification::permanent(ErrorCode::UnsupportedFormat),
            message: "Unsupported format: .xyz".to_string(),
            attempts: 1,
        };

        let a = notification_for(&doc(), &exhausted).unwrap();
        let b = notification_for(&doc(), &permanent).unwrap();

        assert_eq!(a.outcome, NotificationOutcome::Failed);
        assert!(a.message.contains("Please retry the upload"));
        assert!(b.message.contains("unsupported"));
        assert!(!b.message.contains("retry"));
    }
}
