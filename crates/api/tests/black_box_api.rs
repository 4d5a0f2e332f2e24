use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::json;

use mfgmon_api::app::services::AppServices;
use mfgmon_queues::{InMemoryBackend, PrimaryConfig, QueueConfig, QueueRuntime, RetryPolicy};

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
    operations: Arc<InMemoryBackend>,
    database: Arc<InMemoryBackend>,
    _dir: tempfile::TempDir,
}

impl TestServer {
    async fn spawn() -> Self {
        Self::spawn_with(true).await
    }

    async fn spawn_with(started: bool) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let fast = PrimaryConfig::operations()
            .with_policy(RetryPolicy::fixed(1, Duration::from_millis(5)))
            .with_submit_timeout(Duration::from_millis(500))
            .with_submit_deadline(Duration::from_secs(1));
        let config = QueueConfig::default()
            .with_fallback_path(dir.path().join("fallback-queue.json"))
            .with_operations(fast.clone())
            .with_database(fast);

        let operations = InMemoryBackend::arc();
        let database = InMemoryBackend::arc();
        let runtime = QueueRuntime::builder(config)
            .operations_backend(operations.clone())
            .database_backend(database.clone())
            .build();
        if started {
            runtime.start();
        }

        // Same router as prod, bound to an ephemeral port.
        let app = mfgmon_api::app::build_app(Arc::new(AppServices::new(Arc::new(runtime))));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url,
            handle,
            operations,
            database,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn submit(client: &reqwest::Client, server: &TestServer, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let res = client.post(server.url("/jobs")).json(&body).send().await.unwrap();
    let status = res.status();
    (status, res.json().await.unwrap())
}

#[tokio::test]
async fn health_and_readiness() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/health")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let res = client.get(server.url("/ready")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
}

#[tokio::test]
async fn unwired_server_refuses_jobs() {
    let server = TestServer::spawn_with(false).await;
    let client = reqwest::Client::new();

    let res = client.get(server.url("/ready")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let (status, body) = submit(&client, &server, json!({"name": "createCustomer", "payload": {}})).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"], "not_ready");
}

#[tokio::test]
async fn submitted_job_is_retrievable_from_the_primary() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = submit(
        &client,
        &server,
        json!({"name": "createCustomer", "payload": {"email": "line3@plant.io"}}),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert!(!job_id.starts_with("fallback-"));

    let res = client.get(server.url(&format!("/jobs/{job_id}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["location"], "primary");
    assert_eq!(body["job"]["name"], "createCustomer");
    assert_eq!(body["job"]["payload"]["email"], "line3@plant.io");
}

#[tokio::test]
async fn bad_requests_are_rejected_with_400() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = submit(&client, &server, json!({"name": "   ", "payload": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = submit(&client, &server, json!({"name": " createLot", "payload": {}})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    let (status, body) = submit(&client, &server, json!({"name": "createLot", "queue": "reports"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_queue");

    let res = client.get(server.url("/jobs/fallback-0-missing")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn outage_parks_job_and_manual_drain_recovers_it() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    server.operations.set_reachable(false);
    let (status, body) = submit(&client, &server, json!({"name": "createMachine", "payload": {"serial": "M-4"}})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert!(job_id.starts_with("fallback-"));

    let res = client.get(server.url(&format!("/jobs/{job_id}"))).send().await.unwrap();
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["location"], "fallback");
    assert_eq!(body["job"]["attempts"], 0);

    let status: serde_json::Value = client
        .get(server.url("/queues/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["fallback"]["pending"], 1);
    assert_eq!(status["primary"]["error"], true);

    server.operations.set_reachable(true);
    let res = client.post(server.url("/queues/fallback/process")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let outcome: serde_json::Value = res.json().await.unwrap();
    assert_eq!(outcome["outcome"], "completed");
    assert_eq!(outcome["resubmitted"], 1);

    let status: serde_json::Value = client
        .get(server.url("/queues/status"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["fallback"]["pending"], 0);
    assert_eq!(server.operations.len(), 1);
}

#[tokio::test]
async fn database_queue_outage_is_a_502() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    server.database.set_reachable(false);
    let (status, body) = submit(&client, &server, json!({"name": "createLot", "queue": "database", "payload": {}})).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "rejected");
}

#[tokio::test]
async fn database_job_is_found_while_operations_is_down() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    let (status, body) = submit(&client, &server, json!({"name": "createLot", "queue": "database", "payload": {"lot": 9}})).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = body["job_id"].as_str().unwrap().to_string();

    server.operations.set_reachable(false);
    let res = client.get(server.url(&format!("/jobs/{job_id}"))).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["job"]["queue"], "database");

    let res = client.get(server.url("/jobs/0190c8a2-unknown")).send().await.unwrap();
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "lookup_unavailable");
}

#[tokio::test]
async fn oversized_retry_options_are_clamped_not_hung() {
    let server = TestServer::spawn().await;
    let client = reqwest::Client::new();

    server.operations.set_reachable(false);
    let request = client.post(server.url("/jobs")).json(&json!({
        "name": "createMachine",
        "payload": {},
        "options": {"attempts": 4294967295u64, "backoff": {"type": "fixed", "delay_ms": 3600000}}
    }));
    let res = tokio::time::timeout(Duration::from_secs(10), request.send())
        .await
        .expect("submission must finish")
        .unwrap();
    assert_eq!(res.status(), StatusCode::ACCEPTED);
    let body: serde_json::Value = res.json().await.unwrap();
    assert!(body["job_id"].as_str().unwrap().starts_with("fallback-"));
}
