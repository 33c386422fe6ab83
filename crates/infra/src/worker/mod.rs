//! Processing worker client abstraction.

pub mod http;

use async_trait::async_trait;

use docflow_core::DocumentId;
use docflow_documents::{WorkerFailure, WorkerReport};

pub use http::HttpWorker;

/// The shared processing worker (scan, derivatives, metadata extraction).
///
/// Every non-success answer and every transport fault comes back as a
/// [`WorkerFailure`]; nothing is swallowed.
#[async_trait]
pub trait ProcessingWorker: Send + Sync {
    async fn process(
        &self,
        document_id: DocumentId,
        storage_path: &str,
    ) -> Result<WorkerReport, WorkerFailure>;
}
