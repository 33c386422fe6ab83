//! HTTP client for the processing worker (`POST {base}/process`).

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use docflow_core::DocumentId;
use docflow_documents::{WorkerFailure, WorkerReport};

use super::ProcessingWorker;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProcessRequest<'a> {
    document_id: DocumentId,
    storage_path: &'a str,
}

#[derive(Debug, Clone)]
pub struct HttpWorker {
    client: Client,
    process_url: String,
}

impl HttpWorker {
    /// Build a client for the worker at `base_url`.
    ///
    /// `timeout` bounds the whole request; `None` leaves the call unbounded.
    pub fn new(base_url: &str, timeout: Option<Duration>) -> Result<Self, reqwest::Error> {
        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            client: builder.build()?,
            process_url: format!("{}/process", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl ProcessingWorker for HttpWorker {
    async fn process(
        &self,
        document_id: DocumentId,
        storage_path: &str,
    ) -> Result<WorkerReport, WorkerFailure> {
        let response = self
            .client
            .post(&self.process_url)
            .json(&ProcessRequest {
                document_id,
                storage_path,
            })
            .send()
            .await
            .map_err(|e| {
                warn!(document_id = %document_id, error = %e, "worker unreachable");
                WorkerFailure::transport(transport_message(&e))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WorkerFailure::status(status.as_u16(), body));
        }

        let report = response
            .json::<WorkerReport>()
            .await
            .map_err(|e| {
                warn!(document_id = %document_id, error = %e, "worker response undecodable");
                WorkerFailure::undecodable_response(status.as_u16(), e)
            })?;

        debug!(document_id = %document_id, verdict = ?report.status, "worker responded");
        Ok(report)
    }
}

/// Message for a transport fault, phrased so the classifier recognises it.
fn transport_message(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        format!("worker request timed out: {err}")
    } else if err.is_connect() {
        format!("connection to worker failed: {err}")
    } else {
        format!("network error calling worker: {err}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use docflow_documents::{DispatchOutcome, ErrorCode};

    /// One-shot HTTP server answering every connection with `response`.
    async fn serve_raw(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn truncated_success_body_is_a_transient_failure() {
        let base = serve_raw(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 18\r\nconnection: close\r\n\r\n{\"status\":\"clean\",",
        )
        .await;
        let worker = HttpWorker::new(&base, Some(Duration::from_secs(5))).unwrap();

        let failure = worker
            .process(DocumentId::new(), "tenant/report.pdf")
            .await
            .unwrap_err();
        assert_eq!(failure.http_status, Some(200));
        assert!(failure.message.starts_with("worker response could not be decoded"));

        assert!(matches!(
            DispatchOutcome::from_failure(failure),
            DispatchOutcome::TransientFailure {
                code: ErrorCode::WorkerError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn error_status_carries_the_body() {
        let base = serve_raw(
            "HTTP/1.1 422 Unprocessable Entity\r\ncontent-length: 24\r\nconnection: close\r\n\r\nUnsupported format: .xyz",
        )
        .await;
        let worker = HttpWorker::new(&base, None).unwrap();

        let failure = worker
            .process(DocumentId::new(), "tenant/file.xyz")
            .await
            .unwrap_err();
        assert_eq!(failure.http_status, Some(422));
        assert_eq!(failure.message, "Worker returned status 422: Unsupported format: .xyz");
    }
}
