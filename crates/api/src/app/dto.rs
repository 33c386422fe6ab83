use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docflow_core::{DocumentId, TenantId, UserId};
use docflow_documents::{Derivatives, Document};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDocumentRequest {
    pub storage_key: String,
    pub uploaded_by: UserId,
}

// -------------------------
// Response DTOs
// -------------------------

/// Persisted state surface of a document.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentResponse {
    pub id: DocumentId,
    pub tenant_id: TenantId,
    pub uploaded_by: UserId,
    pub storage_key: String,
    pub status: &'static str,
    pub processing_attempt_count: u32,
    pub last_error_type: Option<&'static str>,
    pub last_error_code: Option<&'static str>,
    pub last_error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub checksum: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub derivatives: Option<Derivatives>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Document> for DocumentResponse {
    fn from(doc: &Document) -> Self {
        let artifacts = doc.artifacts.as_ref();
        Self {
            id: doc.id,
            tenant_id: doc.tenant_id,
            uploaded_by: doc.uploaded_by,
            storage_key: doc.storage_key.clone(),
            status: doc.status.as_str(),
            processing_attempt_count: doc.processing_attempt_count,
            last_error_type: doc.last_error.as_ref().map(|e| e.kind.as_str()),
            last_error_code: doc.last_error.as_ref().map(|e| e.code.as_str()),
            last_error_message: doc.last_error.as_ref().map(|e| e.message.clone()),
            next_retry_at: doc.next_retry_at,
            checksum: artifacts.map(|a| a.checksum.clone()),
            file_name: artifacts.map(|a| a.file_name.clone()),
            file_size: artifacts.map(|a| a.file_size),
            mime_type: artifacts.map(|a| a.mime_type.clone()),
            derivatives: artifacts.map(|a| a.derivatives.clone()),
            metadata: artifacts.map(|a| a.metadata.clone()),
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadAcceptedResponse {
    pub job_id: DocumentId,
    pub status: &'static str,
}
