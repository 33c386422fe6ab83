//! Admission decisions for the shared processing worker.
//!
//! The counts are derived from persisted document state by the caller; this
//! module only decides. The check is a soft limit: two runs reading the same
//! counts concurrently may both be admitted.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Seconds a capacity-denied document waits before the poller retries it.
pub const ADMISSION_RETRY_DELAY_SECS: i64 = 60;

/// Concurrency caps for documents in `PROCESSING`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    pub tenant_limit: u32,
    pub global_limit: u32,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            tenant_limit: 5,
            global_limit: 20,
        }
    }
}

/// Snapshot of in-flight counts at decision time.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingCounts {
    pub tenant: u64,
    pub global: u64,
}

/// Which cap caused a denial.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LimitType {
    Tenant,
    Global,
}

impl LimitType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LimitType::Tenant => "TENANT",
            LimitType::Global => "GLOBAL",
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum AdmissionDecision {
    Admitted,
    Denied { limit: LimitType },
}

impl AdmissionDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, AdmissionDecision::Admitted)
    }
}

impl ConcurrencyLimits {
    /// Decide whether another document may start processing.
    ///
    /// The tenant cap is checked first so a noisy tenant is reported as such
    /// even when the whole system is also full.
    pub fn decide(&self, counts: ProcessingCounts) -> AdmissionDecision {
        if counts.tenant >= u64::from(self.tenant_limit) {
            AdmissionDecision::Denied {
                limit: LimitType::Tenant,
            }
        } else if counts.global >= u64::from(self.global_limit) {
            AdmissionDecision::Denied {
                limit: LimitType::Global,
            }
        } else {
            AdmissionDecision::Admitted
        }
    }
}

/// When a capacity-denied document becomes eligible again.
pub fn deferred_retry_at(now: DateTime<Utc>) -> DateTime<Utc> {
    now + Duration::seconds(ADMISSION_RETRY_DELAY_SECS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_at_limit_is_denied() {
        let limits = ConcurrencyLimits::default();
        let decision = limits.decide(ProcessingCounts { tenant: 5, global: 5 });
        assert_eq!(
            decision,
            AdmissionDecision::Denied {
                limit: LimitType::Tenant
            }
        );
    }

    #[test]
    fn global_at_limit_is_denied() {
        let limits = ConcurrencyLimits::default();
        let decision = limits.decide(ProcessingCounts { tenant: 0, global: 20 });
        assert_eq!(
            decision,
            AdmissionDecision::Denied {
                limit: LimitType::Global
            }
        );
    }

    #[test]
    fn tenant_limit_reported_when_both_are_full() {
        let limits = ConcurrencyLimits::default();
        let decision = limits.decide(ProcessingCounts { tenant: 9, global: 99 });
        assert_eq!(
            decision,
            AdmissionDecision::Denied {
                limit: LimitType::Tenant
            }
        );
    }

    #[test]
    fn below_both_limits_is_admitted() {
        let limits = ConcurrencyLimits::default();
        assert!(limits.decide(ProcessingCounts { tenant: 4, global: 19 }).is_admitted());
        assert!(limits.decide(ProcessingCounts::default()).is_admitted());
    }

    #[test]
    fn deferral_waits_one_minute() {
        let now = Utc::now();
        assert_eq!(deferred_retry_at(now) - now, Duration::seconds(60));
    }
}
