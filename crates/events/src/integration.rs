//! Integration messages exchanged with external collaborators.
//!
//! Field names follow the wire contract (camelCase JSON).

use serde::{Deserialize, Serialize};

use docflow_core::{DocumentId, TenantId, UserId};

/// Inbound trigger: the upload of a document's bytes finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadCompleted {
    pub job_id: DocumentId,
    pub storage_object_key: String,
}

/// Terminal outcome reported to the notification collaborator.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationOutcome {
    Success,
    Infected,
    Failed,
}

impl NotificationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationOutcome::Success => "success",
            NotificationOutcome::Infected => "infected",
            NotificationOutcome::Failed => "failed",
        }
    }
}

impl core::fmt::Display for NotificationOutcome {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound request for the notification collaborator.
///
/// `dedup_key` is `"<jobId>:<outcome>"`; the collaborator may drop repeats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRequested {
    pub job_id: DocumentId,
    pub outcome: NotificationOutcome,
    pub tenant_id: TenantId,
    pub recipient: UserId,
    pub force_urgent_channel: bool,
    pub dedup_key: String,
    pub message: String,
}

impl NotificationRequested {
    pub fn dedup_key_for(job_id: DocumentId, outcome: NotificationOutcome) -> String {
        format!("{job_id}:{outcome}")
    }
}
