use std::sync::Arc;
use std::time::Duration;

use axum::{Json, Router, http::StatusCode as AxumStatus, response::IntoResponse, routing::post};
use reqwest::StatusCode;
use serde_json::{Value, json};

use docflow_api::app::{self, AppServices};
use docflow_core::{TenantId, UserId};
use docflow_documents::ProcessingPolicy;
use docflow_events::{EventBus, NotificationRequested, Subscription};
use docflow_infra::HttpWorker;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn serve(router: Router) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Fake processing worker; the storage path selects the answer.
async fn fake_process(Json(body): Json<Value>) -> axum::response::Response {
    let path = body["storagePath"].as_str().unwrap_or_default().to_string();

    if path.contains("broken") {
        return (AxumStatus::UNPROCESSABLE_ENTITY, "Unsupported format: .xyz").into_response();
    }
    if path.contains("flaky") {
        return (AxumStatus::SERVICE_UNAVAILABLE, "try later").into_response();
    }

    let status = if path.contains("infected") { "infected" } else { "clean" };
    Json(json!({
        "status": status,
        "fileName": "report.pdf",
        "fileSize": 4096,
        "mimeType": "application/pdf",
        "checksum": "sha256:c0ffee",
        "derivatives": { "thumbnail": "thumbs/report.png" },
        "metadata": { "pages": 4 }
    }))
    .into_response()
}

struct Env {
    api: TestServer,
    _worker: TestServer,
    services: Arc<AppServices>,
    client: reqwest::Client,
}

async fn spawn_env() -> Env {
    let worker = TestServer::serve(Router::new().route("/process", post(fake_process))).await;
    let client = Arc::new(HttpWorker::new(&worker.base_url, Some(Duration::from_secs(5))).unwrap());

    let services = Arc::new(AppServices::in_memory(client, ProcessingPolicy::default()));
    let api = TestServer::serve(app::build_app(services.clone())).await;

    Env {
        api,
        _worker: worker,
        services,
        client: reqwest::Client::new(),
    }
}

async fn create_document(env: &Env, tenant: TenantId, storage_key: &str) -> String {
    let res = env
        .client
        .post(format!("{}/documents", env.api.base_url))
        .header("x-tenant-id", tenant.to_string())
        .json(&json!({ "storageKey": storage_key, "uploadedBy": UserId::new() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], "PENDING");
    assert_eq!(body["processingAttemptCount"], 0);
    body["id"].as_str().unwrap().to_string()
}

async fn complete_upload(env: &Env, tenant: TenantId, id: &str, key: &str) -> StatusCode {
    env.client
        .post(format!("{}/uploads/complete", env.api.base_url))
        .header("x-tenant-id", tenant.to_string())
        .json(&json!({ "jobId": id, "storageObjectKey": key }))
        .send()
        .await
        .unwrap()
        .status()
}

async fn get_document(env: &Env, tenant: TenantId, id: &str) -> (StatusCode, Value) {
    let res = env
        .client
        .get(format!("{}/documents/{}", env.api.base_url, id))
        .header("x-tenant-id", tenant.to_string())
        .send()
        .await
        .unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

async fn wait_for_status(env: &Env, tenant: TenantId, id: &str, expected: &str) -> Value {
    // The run is spawned in the background; poll until it settles.
    for _ in 0..200 {
        let (status, body) = get_document(env, tenant, id).await;
        assert_eq!(status, StatusCode::OK);
        if body["status"] == expected {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("document {id} did not reach {expected} within timeout");
}

async fn wait_for_notification(sub: &Subscription<NotificationRequested>) -> NotificationRequested {
    for _ in 0..200 {
        if let Ok(n) = sub.try_recv() {
            return n;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no notification within timeout");
}

#[tokio::test]
async fn health_needs_no_tenant() {
    let env = spawn_env().await;
    let res = env
        .client
        .get(format!("{}/health", env.api.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn tenant_header_is_required() {
    let env = spawn_env().await;

    let res = env
        .client
        .get(format!("{}/documents/stats", env.api.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["error"], "missing_tenant");

    let res = env
        .client
        .get(format!("{}/documents/stats", env.api.base_url))
        .header("x-tenant-id", "not-a-uuid")
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn clean_upload_is_processed_and_notified() {
    let env = spawn_env().await;
    let sub = env.services.notifications.subscribe();
    let tenant = TenantId::new();

    let id = create_document(&env, tenant, "uploads/pending.pdf").await;
    assert_eq!(
        complete_upload(&env, tenant, &id, "tenant/report.pdf").await,
        StatusCode::ACCEPTED
    );

    let body = wait_for_status(&env, tenant, &id, "ACTIVE").await;
    assert_eq!(body["processingAttemptCount"], 1);
    assert_eq!(body["storageKey"], "tenant/report.pdf");
    assert_eq!(body["checksum"], "sha256:c0ffee");
    assert_eq!(body["derivatives"]["thumbnail"], "thumbs/report.png");
    assert!(body["nextRetryAt"].is_null());
    assert!(body["lastErrorCode"].is_null());

    let n = wait_for_notification(&sub).await;
    assert_eq!(n.job_id.to_string(), id);
    assert_eq!(n.tenant_id, tenant);
    assert!(!n.force_urgent_channel);
}

#[tokio::test]
async fn infected_upload_forces_urgent_notification() {
    let env = spawn_env().await;
    let sub = env.services.notifications.subscribe();
    let tenant = TenantId::new();

    let id = create_document(&env, tenant, "uploads/pending.exe").await;
    complete_upload(&env, tenant, &id, "tenant/infected.exe").await;

    wait_for_status(&env, tenant, &id, "INFECTED").await;
    let n = wait_for_notification(&sub).await;
    assert!(n.force_urgent_channel);
    assert_eq!(n.dedup_key, format!("{id}:infected"));
}

#[tokio::test]
async fn unsupported_file_fails_permanently() {
    let env = spawn_env().await;
    let tenant = TenantId::new();

    let id = create_document(&env, tenant, "uploads/pending.xyz").await;
    complete_upload(&env, tenant, &id, "tenant/broken.xyz").await;

    let body = wait_for_status(&env, tenant, &id, "PROCESSING_FAILED").await;
    assert_eq!(body["lastErrorType"], "PERMANENT");
    assert_eq!(body["lastErrorCode"], "UNSUPPORTED_FORMAT");
    assert_eq!(
        body["lastErrorMessage"],
        "Worker returned status 422: Unsupported format: .xyz"
    );
    assert!(body["nextRetryAt"].is_null());
}

#[tokio::test]
async fn worker_outage_schedules_a_retry() {
    let env = spawn_env().await;
    let tenant = TenantId::new();

    let id = create_document(&env, tenant, "uploads/pending.pdf").await;
    complete_upload(&env, tenant, &id, "tenant/flaky.pdf").await;

    let body = wait_for_status(&env, tenant, &id, "PROCESSING_FAILED").await;
    assert_eq!(body["lastErrorType"], "TRANSIENT");
    assert_eq!(body["lastErrorCode"], "WORKER_ERROR");
    assert_eq!(body["processingAttemptCount"], 1);
    assert!(body["nextRetryAt"].is_string());

    let stats: Value = env
        .client
        .get(format!("{}/documents/stats", env.api.base_url))
        .header("x-tenant-id", tenant.to_string())
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["retryScheduled"], 1);
    assert_eq!(stats["failed"], 0);
}

#[tokio::test]
async fn documents_are_tenant_scoped() {
    let env = spawn_env().await;
    let owner = TenantId::new();
    let other = TenantId::new();

    let id = create_document(&env, owner, "uploads/private.pdf").await;

    let (status, body) = get_document(&env, other, &id).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not_found");

    assert_eq!(
        complete_upload(&env, other, &id, "tenant/private.pdf").await,
        StatusCode::NOT_FOUND
    );
}

#[tokio::test]
async fn empty_storage_key_is_rejected() {
    let env = spawn_env().await;
    let res = env
        .client
        .post(format!("{}/documents", env.api.base_url))
        .header("x-tenant-id", TenantId::new().to_string())
        .json(&json!({ "storageKey": "  ", "uploadedBy": UserId::new() }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
}
