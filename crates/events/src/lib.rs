//! Integration messages, event bus mechanics and durable step records.

pub mod bus;
pub mod event;
pub mod in_memory_bus;
pub mod integration;
pub mod step;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use integration::{NotificationOutcome, NotificationRequested, UploadCompleted};
pub use step::{RunKey, StepRecord};
pub use tenant::TenantScoped;
