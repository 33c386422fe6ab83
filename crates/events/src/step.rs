//! Durable step records (mechanics only, no processing rules).
//!
//! A run is an append-only log of named steps. Each record carries the
//! step's serialized output so a resumed run can skip the step and reuse
//! the output instead of repeating its side effects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use docflow_core::{DocumentId, TenantId};

/// Identifies one run of a document through the processing steps.
///
/// Derived from the trigger so a re-delivered trigger resumes the same run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunKey(String);

impl RunKey {
    /// Run started by the upload-complete event.
    pub fn upload() -> Self {
        Self("upload".to_string())
    }

    /// Run started by the retry poller for a retry due at `due_at`.
    pub fn retry(due_at: DateTime<Utc>) -> Self {
        Self(format!("retry@{}", due_at.timestamp_millis()))
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for RunKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A completed step, as persisted in the step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub tenant_id: TenantId,
    pub document_id: DocumentId,
    pub run_key: RunKey,
    /// Position in the run (1-based, monotonically increasing).
    pub sequence: u32,
    pub step_name: String,
    pub output: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn retry_run_key_is_stable_for_the_same_due_time() {
        let due = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(RunKey::retry(due), RunKey::retry(due));
        assert_ne!(RunKey::retry(due), RunKey::upload());
        assert_eq!(RunKey::retry(due).as_str(), format!("retry@{}", due.timestamp_millis()));
    }
}
