use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tracing::{info, warn};

use docflow_events::UploadCompleted;

use docflow_infra::DocumentStore;

use crate::app::{dto, errors, services::AppServices};
use crate::context::TenantContext;

/// Upload-complete trigger: start the document's run in the background.
///
/// The document must exist for the calling tenant; the run itself is not
/// awaited.
pub async fn upload_complete(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(event): Json<UploadCompleted>,
) -> axum::response::Response {
    let tenant_id = tenant.tenant_id();

    match services.store.get(tenant_id, event.job_id).await {
        Ok(Some(_)) => {}
        Ok(None) => return errors::json_error(StatusCode::NOT_FOUND, "not_found", "document not found"),
        Err(e) => return errors::store_error_to_response(e),
    }
    if event.storage_object_key.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "storageObjectKey must not be empty",
        );
    }

    let job_id = event.job_id;
    let processor = services.processor.clone();
    tokio::spawn(async move {
        match processor.handle_upload(tenant_id, event).await {
            Ok(outcome) => info!(tenant_id = %tenant_id, document_id = %job_id, outcome = ?outcome, "upload run finished"),
            Err(e) => warn!(tenant_id = %tenant_id, document_id = %job_id, error = %e, "upload run failed"),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(dto::UploadAcceptedResponse {
            job_id,
            status: "accepted",
        }),
    )
        .into_response()
}
