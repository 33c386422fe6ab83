//! Notifier trigger: hand terminal outcomes to the notification collaborator.

use std::sync::{Arc, Mutex};

use tracing::info;

use docflow_core::TenantId;
use docflow_documents::{Document, Settlement, notification_for};
use docflow_events::{EventBus, NotificationRequested, TenantScoped};

/// Destination for notification requests.
///
/// Kept apart from the document history: a notification is a request to an
/// external collaborator, not a state change.
pub trait NotificationSink: Send + Sync + 'static {
    fn send(&self, notification: NotificationRequested) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum NotifyError {
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

/// In-memory sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryNotificationSink {
    inner: Mutex<Vec<NotificationRequested>>,
    failures: Mutex<u32>,
}

impl InMemoryNotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail.
    pub fn fail_next(&self, n: u32) {
        if let Ok(mut failures) = self.failures.lock() {
            *failures = n;
        }
    }

    pub fn all(&self) -> Vec<NotificationRequested> {
        self.inner.lock().map(|v| v.clone()).unwrap_or_default()
    }

    pub fn for_tenant(&self, tenant_id: TenantId) -> Vec<NotificationRequested> {
        self.all()
            .into_iter()
            .filter(|n| n.tenant_id() == tenant_id)
            .collect()
    }
}

impl NotificationSink for InMemoryNotificationSink {
    fn send(&self, notification: NotificationRequested) -> Result<(), NotifyError> {
        let mut failures = self
            .failures
            .lock()
            .map_err(|_| NotifyError::Delivery("lock poisoned".to_string()))?;
        if *failures > 0 {
            *failures -= 1;
            return Err(NotifyError::Delivery("sink unavailable".to_string()));
        }
        drop(failures);

        self.inner
            .lock()
            .map_err(|_| NotifyError::Delivery("lock poisoned".to_string()))?
            .push(notification);
        Ok(())
    }
}

/// Sink publishing to an [`EventBus`].
#[derive(Debug)]
pub struct BusNotificationSink<B> {
    bus: B,
}

impl<B> BusNotificationSink<B>
where
    B: EventBus<NotificationRequested>,
{
    pub fn new(bus: B) -> Self {
        Self { bus }
    }
}

impl<B> NotificationSink for BusNotificationSink<B>
where
    B: EventBus<NotificationRequested> + 'static,
{
    fn send(&self, notification: NotificationRequested) -> Result<(), NotifyError> {
        self.bus
            .publish(notification)
            .map_err(|e| NotifyError::Delivery(format!("{e:?}")))
    }
}

#[derive(Clone)]
pub struct NotifierTrigger {
    sink: Arc<dyn NotificationSink>,
}

impl NotifierTrigger {
    pub fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    /// Send the notification for a terminal settlement.
    ///
    /// Returns the request that was sent, or `None` for a scheduled retry.
    /// Callers run this inside a durable step so each `(job, outcome)` is
    /// sent at most once per run.
    pub fn fire(
        &self,
        doc: &Document,
        settlement: &Settlement,
    ) -> Result<Option<NotificationRequested>, NotifyError> {
        let Some(notification) = notification_for(doc, settlement) else {
            return Ok(None);
        };

        info!(
            tenant_id = %doc.tenant_id,
            document_id = %doc.id,
            outcome = %notification.outcome,
            urgent = notification.force_urgent_channel,
            "sending notification"
        );
        self.sink.send(notification.clone())?;
        Ok(Some(notification))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use docflow_core::UserId;
    use docflow_documents::{Derivatives, Verdict, WorkerReport};
    use docflow_events::{InMemoryEventBus, NotificationOutcome};

    fn report(verdict: Verdict) -> WorkerReport {
        WorkerReport {
            status: verdict,
            file_name: "scan.pdf".to_string(),
            file_size: 10,
            mime_type: "application/pdf".to_string(),
            checksum: "sha256:00".to_string(),
            derivatives: Derivatives::default(),
            metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn infected_goes_out_on_the_bus_as_urgent() {
        let bus = Arc::new(InMemoryEventBus::<NotificationRequested>::new());
        let sub = bus.subscribe();
        let trigger = NotifierTrigger::new(Arc::new(BusNotificationSink::new(bus.clone())));

        let doc = Document::new(TenantId::new(), UserId::new(), "k", Utc::now()).unwrap();
        let settlement = Settlement::Completed {
            report: report(Verdict::Infected),
        };
        trigger.fire(&doc, &settlement).unwrap();

        let received = sub.drain();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].outcome, NotificationOutcome::Infected);
        assert!(received[0].force_urgent_channel);
        assert_eq!(received[0].recipient, doc.uploaded_by);
    }

    #[test]
    fn sink_failure_is_reported() {
        let sink = Arc::new(InMemoryNotificationSink::new());
        sink.fail_next(1);
        let trigger = NotifierTrigger::new(sink.clone());

        let doc = Document::new(TenantId::new(), UserId::new(), "k", Utc::now()).unwrap();
        let settlement = Settlement::Completed {
            report: report(Verdict::Clean),
        };

        assert!(trigger.fire(&doc, &settlement).is_err());
        assert!(trigger.fire(&doc, &settlement).unwrap().is_some());
        assert_eq!(sink.for_tenant(doc.tenant_id).len(), 1);
        assert!(sink.for_tenant(TenantId::new()).is_empty());
    }
}
