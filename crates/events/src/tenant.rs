use docflow_core::TenantId;

use crate::integration::NotificationRequested;

/// Helper trait for tenant-scoped messages.
///
/// Marks types that carry a tenant id, so consumers can scope or filter them
/// without knowing the concrete type.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl TenantScoped for NotificationRequested {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
