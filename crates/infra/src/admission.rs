//! Admission controller: gate a run on the tenant and global in-flight counts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use docflow_core::TenantId;
use docflow_documents::{AdmissionDecision, ConcurrencyLimits, ProcessingCounts, deferred_retry_at};

use crate::store::{DocumentStore, StoreError};

/// Result of one admission check, as recorded by the admission step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmissionCheck {
    pub decision: AdmissionDecision,
    pub counts: ProcessingCounts,
    pub decided_at: DateTime<Utc>,
}

impl AdmissionCheck {
    /// When a denied document becomes due again; `None` if admitted.
    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        match self.decision {
            AdmissionDecision::Admitted => None,
            AdmissionDecision::Denied { .. } => Some(deferred_retry_at(self.decided_at)),
        }
    }
}

#[derive(Clone)]
pub struct AdmissionController {
    store: Arc<dyn DocumentStore>,
    limits: ConcurrencyLimits,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn DocumentStore>, limits: ConcurrencyLimits) -> Self {
        Self { store, limits }
    }

    /// Read the current counts and decide.
    ///
    /// Counts come from a fresh query every time; concurrent checks may both
    /// pass, which is accepted.
    pub async fn check(&self, tenant_id: TenantId, now: DateTime<Utc>) -> Result<AdmissionCheck, StoreError> {
        let counts = self.store.processing_counts(tenant_id).await?;
        let decision = self.limits.decide(counts);

        match decision {
            AdmissionDecision::Admitted => debug!(
                tenant_id = %tenant_id,
                tenant_count = counts.tenant,
                global_count = counts.global,
                "admission granted"
            ),
            AdmissionDecision::Denied { limit } => info!(
                tenant_id = %tenant_id,
                limit = limit.as_str(),
                tenant_count = counts.tenant,
                global_count = counts.global,
                "admission denied"
            ),
        }

        Ok(AdmissionCheck {
            decision,
            counts,
            decided_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    use docflow_core::UserId;
    use docflow_documents::{Document, LimitType};

    use crate::store::{InMemoryDocumentStore, Transition};

    async fn seed_processing(store: &InMemoryDocumentStore, tenant: TenantId, n: usize) {
        for _ in 0..n {
            let doc = Document::new(tenant, UserId::new(), "k", Utc::now()).unwrap();
            let id = store.insert(doc).await.unwrap();
            store
                .record(tenant, id, &Transition::BeginProcessing, Utc::now())
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn tenant_at_capacity_is_deferred_for_a_minute() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let tenant = TenantId::new();
        seed_processing(&store, tenant, 5).await;

        let controller = AdmissionController::new(store, ConcurrencyLimits::default());
        let now = Utc::now();
        let check = controller.check(tenant, now).await.unwrap();

        assert_eq!(
            check.decision,
            AdmissionDecision::Denied {
                limit: LimitType::Tenant
            }
        );
        assert_eq!(check.retry_at(), Some(now + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn other_tenants_count_only_toward_global() {
        let store = Arc::new(InMemoryDocumentStore::new());
        let busy = TenantId::new();
        seed_processing(&store, busy, 5).await;

        let controller = AdmissionController::new(store, ConcurrencyLimits::default());
        let check = controller.check(TenantId::new(), Utc::now()).await.unwrap();

        assert!(check.decision.is_admitted());
        assert_eq!(check.counts, ProcessingCounts { tenant: 0, global: 5 });
        assert_eq!(check.retry_at(), None);
    }
}
