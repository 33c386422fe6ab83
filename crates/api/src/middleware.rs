use axum::{
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};

use docflow_core::TenantId;

use crate::app::errors::json_error;
use crate::context::TenantContext;

/// Header carrying the caller's tenant.
pub const TENANT_HEADER: &str = "x-tenant-id";

/// Resolve the tenant from `x-tenant-id` and attach a [`TenantContext`].
pub async fn tenant_middleware(
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, Response> {
    let tenant_id = extract_tenant(req.headers())?;
    req.extensions_mut().insert(TenantContext::new(tenant_id));
    Ok(next.run(req).await)
}

fn extract_tenant(headers: &HeaderMap) -> Result<TenantId, Response> {
    let header = headers.get(TENANT_HEADER).ok_or_else(|| {
        json_error(
            StatusCode::BAD_REQUEST,
            "missing_tenant",
            format!("{TENANT_HEADER} header is required"),
        )
    })?;

    header
        .to_str()
        .ok()
        .map(str::trim)
        .and_then(|v| v.parse::<TenantId>().ok())
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "invalid_tenant",
                format!("{TENANT_HEADER} must be a UUID"),
            )
        })
}
