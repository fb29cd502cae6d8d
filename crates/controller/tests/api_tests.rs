//! HTTP API tests: the real router served on a loopback port, backed by the
//! recording fakes.

mod common;

use std::sync::Arc;

use cloudops_controller::advisory::DisabledAdvisor;
use cloudops_controller::api::{self, AppState};
use common::{harness, Harness};
use reqwest::StatusCode;
use serde_json::{json, Value};

struct TestServer {
    base: String,
    http: reqwest::Client,
    harness: Harness,
}

impl TestServer {
    async fn start() -> Self {
        let harness = harness();
        let app = api::router(AppState {
            engine: harness.engine.clone(),
            credentials: harness.credentials.clone(),
            advisory: Arc::new(DisabledAdvisor),
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            http: reqwest::Client::new(),
            harness,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }
}

fn pipeline(name: &str) -> Value {
    json!({
        "name": name,
        "stack": "node",
        "definition": {
            "mode": "STANDARD",
            "source": {
                "repositoryUrl": "https://git.example.com/team/app.git",
                "branch": "main"
            }
        },
        "runtime": { "replicas": 2 }
    })
}

#[tokio::test]
async fn test_health_endpoints() {
    let server = TestServer::start().await;

    let health: Value = server
        .http
        .get(server.url("/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");

    let ready = server.http.get(server.url("/ready")).send().await.unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_create_get_and_delete_pipeline() {
    let server = TestServer::start().await;

    let response = server
        .http
        .post(server.url("/api/pipelines"))
        .json(&pipeline("web"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let record: Value = response.json().await.unwrap();
    assert_eq!(record["name"], "web");
    assert_eq!(record["phase"], "ready");
    assert_eq!(record["mode"], "STANDARD");

    let status: Value = server
        .http
        .get(server.url("/api/pipelines/web"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["record"]["name"], "web");
    assert_eq!(status["trackingActive"], false);

    let list: Vec<Value> = server
        .http
        .get(server.url("/api/pipelines"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(list.len(), 1);

    let response = server
        .http
        .delete(server.url("/api/pipelines/web"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(server.harness.orchestrator.resource_count(), 0);
}

#[tokio::test]
async fn test_invalid_name_is_classified() {
    let server = TestServer::start().await;

    let response = server
        .http
        .post(server.url("/api/pipelines"))
        .json(&pipeline("MyApp"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "invalid-name");
    assert_eq!(body["reason"], "uppercase-present");
    assert!(server.harness.build_server.calls().is_empty());
}

#[tokio::test]
async fn test_unknown_pipeline_is_not_found() {
    let server = TestServer::start().await;

    let response = server
        .http
        .get(server.url("/api/pipelines/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "job-not-found");
}

#[tokio::test]
async fn test_partial_failure_names_step_and_system() {
    let server = TestServer::start().await;
    server
        .harness
        .orchestrator
        .fail("apply", cloudops_controller::cluster::ResourceKind::Endpoint);

    let response = server
        .http
        .post(server.url("/api/pipelines"))
        .json(&pipeline("web"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "partial-failure");
    assert_eq!(body["kind"], "endpoint");
    assert!(body["step"].is_string());
    assert!(body["system"].is_string());
}

#[tokio::test]
async fn test_credential_secret_is_never_returned() {
    let server = TestServer::start().await;

    let response = server
        .http
        .post(server.url("/api/credentials"))
        .json(&json!({ "name": "git-bot", "username": "bot", "secret": "s3cret" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = response.text().await.unwrap();
    assert!(!created.contains("s3cret"));
    let created: Value = serde_json::from_str(&created).unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let listed = server
        .http
        .get(server.url("/api/credentials"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(listed.contains("git-bot"));
    assert!(!listed.contains("s3cret"));

    let duplicate = server
        .http
        .post(server.url("/api/credentials"))
        .json(&json!({ "name": "git-bot", "username": "other", "secret": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let response = server
        .http
        .delete(server.url(&format!("/api/credentials/{id}")))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_preview_script_is_plain_text() {
    let server = TestServer::start().await;

    let response = server
        .http
        .post(server.url("/api/pipelines/preview/script"))
        .json(&pipeline("web"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers()[reqwest::header::CONTENT_TYPE]
        .to_str()
        .unwrap()
        .starts_with("text/plain"));
    let script = response.text().await.unwrap();
    assert!(script.contains("GIT_REPO_URL = 'https://git.example.com/team/app.git'"));
    assert!(server.harness.build_server.calls().is_empty());
}

#[tokio::test]
async fn test_trigger_build_is_accepted() {
    let server = TestServer::start().await;
    server
        .http
        .post(server.url("/api/pipelines"))
        .json(&pipeline("web"))
        .send()
        .await
        .unwrap();

    let response = server
        .http
        .post(server.url("/api/pipelines/web/builds"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["job"], "web");
    assert_eq!(body["tracking"], true);

    let again = server
        .http
        .post(server.url("/api/pipelines/web/builds"))
        .send()
        .await
        .unwrap();
    assert_eq!(again.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_advisory_is_unavailable_when_disabled() {
    let server = TestServer::start().await;

    let body: Value = server
        .http
        .post(server.url("/api/pipelines/advisory"))
        .json(&pipeline("web"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["state"], "unavailable");
}

#[tokio::test]
async fn test_unknown_cluster_kind_is_bad_request() {
    let server = TestServer::start().await;

    let response = server
        .http
        .get(server.url("/api/cluster/widgets"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = server
        .http
        .get(server.url("/api/cluster/workloads?name=web"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
