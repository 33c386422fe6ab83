//! Worker results and the tagged outcome of a dispatch.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::classify::{Classification, ErrorCode, ErrorKind, classify};

/// Content verdict returned by the worker.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Clean,
    Infected,
}

/// Derived artifacts produced by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Derivatives {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poster: Option<String>,
}

/// Successful worker response (`200` body of `POST /process`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub status: Verdict,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub checksum: String,
    #[serde(default)]
    pub derivatives: Derivatives,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// A failed worker call: non-2xx response or transport fault.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{message}")]
pub struct WorkerFailure {
    pub message: String,
    /// HTTP status when the worker answered at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Set when the caller already knows the class of the fault; the
    /// message is then not run through the keyword classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
}

impl WorkerFailure {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            http_status: None,
            classification: None,
        }
    }

    pub fn status(status: u16, body: impl AsRef<str>) -> Self {
        let body = body.as_ref().trim();
        let message = if body.is_empty() {
            format!("Worker returned status {status}")
        } else {
            format!("Worker returned status {status}: {body}")
        };
        Self {
            message,
            http_status: Some(status),
            classification: None,
        }
    }

    /// The worker answered 2xx but the body could not be decoded.
    ///
    /// A protocol fault between us and the worker, never a verdict on the
    /// file, so it is always transient.
    pub fn undecodable_response(status: u16, detail: impl core::fmt::Display) -> Self {
        Self {
            message: format!("worker response could not be decoded: {detail}"),
            http_status: Some(status),
            classification: Some(Classification::transient(ErrorCode::WorkerError)),
        }
    }

    pub fn classify(&self) -> Classification {
        self.classification.unwrap_or_else(|| classify(&self.message))
    }
}

/// Tagged result of one dispatch, after classification.
///
/// This is what the dispatch step records, so it must stay serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Success(WorkerReport),
    TransientFailure { code: ErrorCode, message: String },
    PermanentFailure { code: ErrorCode, message: String },
}

impl DispatchOutcome {
    pub fn from_result(result: Result<WorkerReport, WorkerFailure>) -> Self {
        match result {
            Ok(report) => DispatchOutcome::Success(report),
            Err(failure) => DispatchOutcome::from_failure(failure),
        }
    }

    pub fn from_failure(failure: WorkerFailure) -> Self {
        let Classification { kind, code } = failure.classify();
        match kind {
            ErrorKind::Transient => DispatchOutcome::TransientFailure {
                code,
                message: failure.message,
            },
            ErrorKind::Permanent => DispatchOutcome::PermanentFailure {
                code,
                message: failure.message,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_response_parses_from_wire_json() {
        let body = serde_json::json!({
            "status": "infected",
            "fileName": "invoice.pdf",
            "fileSize": 1024,
            "mimeType": "application/pdf",
            "checksum": "sha256:abc",
            "derivatives": { "thumbnail": "thumbs/1.png" },
            "metadata": { "pages": 2 }
        });

        let report: WorkerReport = serde_json::from_value(body).unwrap();
        assert_eq!(report.status, Verdict::Infected);
        assert_eq!(report.derivatives.thumbnail.as_deref(), Some("thumbs/1.png"));
        assert_eq!(report.derivatives.poster, None);
        assert_eq!(report.metadata["pages"], 2);
    }

    #[test]
    fn status_failure_message_mentions_the_code() {
        let failure = WorkerFailure::status(503, "");
        assert_eq!(failure.message, "Worker returned status 503");
        assert_eq!(failure.http_status, Some(503));

        let failure = WorkerFailure::status(422, "Unsupported format: .xyz");
        assert_eq!(failure.message, "Worker returned status 422: Unsupported format: .xyz");
    }

    #[test]
    fn failures_are_tagged_by_classification() {
        let outcome = DispatchOutcome::from_failure(WorkerFailure::status(503, ""));
        assert!(matches!(
            outcome,
            DispatchOutcome::TransientFailure {
                code: ErrorCode::WorkerError,
                ..
            }
        ));

        let outcome = DispatchOutcome::from_failure(WorkerFailure::transport("file is corrupt"));
        assert!(matches!(
            outcome,
            DispatchOutcome::PermanentFailure {
                code: ErrorCode::CorruptFile,
                ..
            }
        ));
    }

    #[test]
    fn undecodable_response_is_transient_whatever_the_decoder_says() {
        let failure = WorkerFailure::undecodable_response(200, "invalid type: expected struct WorkerReport");
        assert_eq!(failure.http_status, Some(200));
        assert_eq!(
            failure.to_string(),
            "worker response could not be decoded: invalid type: expected struct WorkerReport"
        );

        let outcome = DispatchOutcome::from_failure(failure);
        assert!(matches!(
            outcome,
            DispatchOutcome::TransientFailure {
                code: ErrorCode::WorkerError,
                ..
            }
        ));
    }

    #[test]
    fn outcome_survives_a_json_round_trip() {
        let outcome = DispatchOutcome::TransientFailure {
            code: ErrorCode::Timeout,
            message: "timed out".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["result"], "transient_failure");
        assert_eq!(json["code"], "TIMEOUT");

        let back: DispatchOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, outcome);
    }
}
