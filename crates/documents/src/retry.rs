//! Retry scheduling for failed processing attempts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::{DomainError, DomainResult};

/// Exponential backoff policy.
///
/// The delay before the retry that follows attempt `n` (0-indexed count of
/// attempts already made) is `initial_interval_secs * backoff_multiplier^n`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of dispatches before the document is given up on.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_interval_secs: u64,
    /// Growth factor applied per attempt.
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval_secs: 300,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Check if more attempts are allowed after `attempt_count` dispatches.
    pub fn should_retry(&self, attempt_count: u32) -> bool {
        attempt_count < self.max_attempts
    }

    /// Backoff delay for the given attempt count, ignoring `max_attempts`.
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt_count as i32);
        let millis = (self.initial_interval_secs as f64) * factor * 1000.0;
        if !millis.is_finite() || millis >= i64::MAX as f64 {
            return Duration::MAX;
        }
        Duration::milliseconds(millis.max(0.0).round() as i64)
    }

    /// Instant of the next retry, or `None` once attempts are exhausted.
    pub fn next_retry(&self, attempt_count: u32, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.should_retry(attempt_count) {
            return None;
        }
        Some(
            now.checked_add_signed(self.delay_for_attempt(attempt_count))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
        )
    }

    pub fn validate(&self) -> DomainResult<()> {
        if self.max_attempts == 0 {
            return Err(DomainError::validation("max_attempts must be >= 1"));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(DomainError::validation(
                "backoff_multiplier must be a finite number >= 1",
            ));
        }
        Ok(())
    }
}
