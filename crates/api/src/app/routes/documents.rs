use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use tracing::info;

use docflow_core::DocumentId;
use docflow_documents::Document;

use docflow_infra::DocumentStore;

use crate::app::{dto, errors, services::AppServices};
use crate::context::TenantContext;

/// Intake: register an uploaded document in `PENDING`.
pub async fn create_document(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Json(body): Json<dto::CreateDocumentRequest>,
) -> axum::response::Response {
    let doc = match Document::new(tenant.tenant_id(), body.uploaded_by, body.storage_key, Utc::now()) {
        Ok(d) => d,
        Err(e) => return errors::domain_error_to_response(e),
    };

    if let Err(e) = services.store.insert(doc.clone()).await {
        return errors::store_error_to_response(e);
    }
    info!(tenant_id = %doc.tenant_id, document_id = %doc.id, "document registered");

    (StatusCode::CREATED, Json(dto::DocumentResponse::from(&doc))).into_response()
}

pub async fn get_document(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id: DocumentId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid document id"),
    };

    match services.store.get(tenant.tenant_id(), id).await {
        Ok(Some(doc)) => Json(dto::DocumentResponse::from(&doc)).into_response(),
        Ok(None) => errors::json_error(StatusCode::NOT_FOUND, "not_found", "document not found"),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn get_stats(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(tenant): Extension<TenantContext>,
) -> axum::response::Response {
    match services.store.stats(tenant.tenant_id()).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::store_error_to_response(e),
    }
}
