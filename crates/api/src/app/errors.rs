use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docflow_core::DomainError;
use docflow_infra::StoreError;

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        // Another tenant's document is reported as absent.
        StoreError::NotFound(_) | StoreError::TenantIsolation => {
            json_error(StatusCode::NOT_FOUND, "not_found", "document not found")
        }
        StoreError::AlreadyExists(id) => {
            json_error(StatusCode::CONFLICT, "conflict", format!("document {id} already exists"))
        }
        StoreError::Domain(e) => domain_error_to_response(e),
        StoreError::Storage(msg) => json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", msg),
    }
}

pub fn domain_error_to_response(err: DomainError) -> axum::response::Response {
    match err {
        DomainError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        DomainError::InvariantViolation(msg) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "invariant_violation", msg)
        }
        DomainError::InvalidId(msg) => json_error(StatusCode::BAD_REQUEST, "invalid_id", msg),
        DomainError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
