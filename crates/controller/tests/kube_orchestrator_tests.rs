//! Kubernetes orchestrator tests against a mock API server.
//!
//! Cover how the controller coexists with objects it did not create:
//! replace only what carries the managed-by label, never delete anything
//! else, and list only managed objects.

use cloudops_controller::cluster::{
    ClusterOrchestrator, EndpointSpec, KubeOrchestrator, ResourceKind, ResourceSpec, WorkloadSpec,
};
use cloudops_controller::error::OrchestratorError;
use kube::Client;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SERVICES: &str = "/api/v1/namespaces/apps/services";
const DEPLOYMENTS: &str = "/apis/apps/v1/namespaces/apps/deployments";

fn orchestrator(server: &MockServer) -> KubeOrchestrator {
    let config = kube::Config::new(server.uri().parse().unwrap());
    KubeOrchestrator::new(Client::try_from(config).unwrap(), "apps")
}

fn endpoint_name() -> String {
    ResourceKind::Endpoint.resource_name("web")
}

fn endpoint_spec() -> ResourceSpec {
    ResourceSpec::Endpoint(EndpointSpec {
        job_name: "web".to_string(),
        name: endpoint_name(),
        port: 80,
        target_port: 3000,
    })
}

fn status(code: u16, reason: &str) -> ResponseTemplate {
    ResponseTemplate::new(code).set_body_json(json!({
        "apiVersion": "v1",
        "kind": "Status",
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code
    }))
}

fn service(labels: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": endpoint_name(),
            "namespace": "apps",
            "resourceVersion": "42",
            "labels": labels
        },
        "spec": {
            "type": "ClusterIP",
            "clusterIP": "10.0.0.7",
            "clusterIPs": ["10.0.0.7"],
            "ports": [{ "port": 80, "protocol": "TCP" }]
        }
    })
}

fn managed_labels() -> Value {
    json!({ "app.kubernetes.io/managed-by": "cloudops", "cloudops.io/job": "web" })
}

#[tokio::test]
async fn test_fresh_endpoint_is_created_without_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SERVICES))
        .and(body_partial_json(json!({
            "metadata": { "labels": { "app.kubernetes.io/managed-by": "cloudops" } }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(service(managed_labels())))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .respond_with(ResponseTemplate::new(200).set_body_json(service(managed_labels())))
        .expect(0)
        .mount(&server)
        .await;

    orchestrator(&server)
        .create_or_update(&endpoint_spec())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_conflict_with_unowned_object_is_refused() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SERVICES))
        .respond_with(status(409, "AlreadyExists"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .respond_with(ResponseTemplate::new(200).set_body_json(service(json!({ "team": "infra" }))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = orchestrator(&server)
        .create_or_update(&endpoint_spec())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        OrchestratorError::NotOwned { kind: ResourceKind::Endpoint, ref name } if *name == endpoint_name()
    ));
}

#[tokio::test]
async fn test_conflict_with_owned_object_replaces_it() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(SERVICES))
        .respond_with(status(409, "AlreadyExists"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .respond_with(ResponseTemplate::new(200).set_body_json(service(managed_labels())))
        .mount(&server)
        .await;
    // The allocated clusterIP and the read version travel with the replace.
    Mock::given(method("PUT"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .and(body_partial_json(json!({
            "metadata": { "resourceVersion": "42" },
            "spec": { "clusterIP": "10.0.0.7", "clusterIPs": ["10.0.0.7"] }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(service(managed_labels())))
        .expect(1)
        .mount(&server)
        .await;

    orchestrator(&server)
        .create_or_update(&endpoint_spec())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_workload_replace_carries_resource_version() {
    let server = MockServer::start().await;
    let existing = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": "web",
            "namespace": "apps",
            "resourceVersion": "17",
            "labels": managed_labels()
        },
        "spec": {
            "selector": { "matchLabels": { "cloudops.io/job": "web" } },
            "template": { "spec": { "containers": [] } }
        }
    });
    Mock::given(method("POST"))
        .and(path(DEPLOYMENTS))
        .respond_with(status(409, "AlreadyExists"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{DEPLOYMENTS}/web")))
        .respond_with(ResponseTemplate::new(200).set_body_json(existing.clone()))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("{DEPLOYMENTS}/web")))
        .and(body_partial_json(json!({
            "metadata": { "resourceVersion": "17" },
            "spec": { "replicas": 3 }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(existing))
        .expect(1)
        .mount(&server)
        .await;

    let spec = ResourceSpec::Workload(WorkloadSpec {
        job_name: "web".to_string(),
        name: "web".to_string(),
        image: "registry.local/cloudops/web:latest".to_string(),
        replicas: 3,
        container_port: 3000,
        image_pull_secret: None,
    });
    orchestrator(&server).create_or_update(&spec).await.unwrap();
}

#[tokio::test]
async fn test_delete_leaves_unowned_object_in_place() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .respond_with(ResponseTemplate::new(200).set_body_json(service(json!({ "team": "infra" }))))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    orchestrator(&server)
        .delete(ResourceKind::Endpoint, "web")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_removes_owned_object() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .respond_with(ResponseTemplate::new(200).set_body_json(service(managed_labels())))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "apiVersion": "v1",
            "kind": "Status",
            "status": "Success",
            "metadata": {}
        })))
        .expect(1)
        .mount(&server)
        .await;

    orchestrator(&server)
        .delete(ResourceKind::Endpoint, "web")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_of_absent_object_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("{SERVICES}/{}", endpoint_name())))
        .respond_with(status(404, "NotFound"))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    orchestrator(&server)
        .delete(ResourceKind::Endpoint, "web")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_instances_are_read_only() {
    let server = MockServer::start().await;

    let err = orchestrator(&server)
        .delete(ResourceKind::Instance, "web")
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::ReadOnly { .. }));
}

#[tokio::test]
async fn test_list_selects_managed_objects_and_filters_names() {
    let server = MockServer::start().await;
    let mut other = service(managed_labels());
    other["metadata"]["name"] = json!("api-svc");
    Mock::given(method("GET"))
        .and(path(SERVICES))
        .and(query_param(
            "labelSelector",
            "app.kubernetes.io/managed-by=cloudops",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "apiVersion": "v1",
            "kind": "ServiceList",
            "metadata": { "resourceVersion": "50" },
            "items": [service(managed_labels()), other]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let orchestrator = orchestrator(&server);
    let all = orchestrator.list(ResourceKind::Endpoint, None).await.unwrap();
    assert_eq!(all.len(), 2);
    assert!(all.iter().all(|summary| summary.managed));
    assert_eq!(all[0].details.get("clusterIP").map(String::as_str), Some("10.0.0.7"));

    let filtered = orchestrator
        .list(ResourceKind::Endpoint, Some("api".to_string()))
        .await
        .unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].name, "api-svc");
}
