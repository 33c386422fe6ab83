use axum::{
    routing::{get, post},
    Router,
};

pub mod documents;
pub mod system;
pub mod uploads;

/// Router for all tenant-scoped endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/documents", post(documents::create_document))
        .route("/documents/stats", get(documents::get_stats))
        .route("/documents/:id", get(documents::get_document))
        .route("/uploads/complete", post(uploads::upload_complete))
}
