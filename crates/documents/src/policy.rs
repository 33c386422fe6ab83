//! Process-wide processing policy.
//!
//! Built once at startup and passed by reference to every component.

use serde::{Deserialize, Serialize};

use docflow_core::{DomainError, DomainResult};

use crate::admission::ConcurrencyLimits;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessingPolicy {
    pub limits: ConcurrencyLimits,
    pub retry: RetryPolicy,
}

impl ProcessingPolicy {
    pub fn validate(&self) -> DomainResult<()> {
        if self.limits.tenant_limit == 0 {
            return Err(DomainError::validation("tenant_limit must be >= 1"));
        }
        if self.limits.global_limit == 0 {
            return Err(DomainError::validation("global_limit must be >= 1"));
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let p = ProcessingPolicy::default();
        assert_eq!(p.limits.tenant_limit, 5);
        assert_eq!(p.limits.global_limit, 20);
        assert_eq!(p.retry.max_attempts, 3);
        assert_eq!(p.retry.initial_interval_secs, 300);
        assert_eq!(p.retry.backoff_multiplier, 2.0);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn zero_limits_are_invalid() {
        let mut p = ProcessingPolicy::default();
        p.limits.global_limit = 0;
        assert!(p.validate().is_err());
    }
}
