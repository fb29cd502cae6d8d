//! HTTP surface of the controller.

pub mod error;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::advisory::{Advisory, AdvisoryService};
use crate::cluster::{ResourceKind, ResourceSummary};
use crate::credentials::{CredentialMetadata, CredentialResolver, CredentialUpdate, NewCredential};
use crate::model::{BuildRecord, JobRecord, PipelineConfig};
use crate::reconcile::{JobStatus, ReconciliationEngine, SyncReport, TriggeredBuild};

pub use error::ApiError;

type ApiResult<T> = Result<T, ApiError>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ReconciliationEngine>,
    pub credentials: Arc<CredentialResolver>,
    pub advisory: Arc<dyn AdvisoryService>,
}

/// Build the router with tracing, CORS and timeout layers.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/pipelines", get(list_pipelines).post(create_pipeline))
        .route("/api/pipelines/preview/script", post(preview_script))
        .route("/api/pipelines/preview/definition", post(preview_definition))
        .route("/api/pipelines/advisory", post(advisory_summary))
        .route("/api/pipelines/sync", post(sync_pipelines))
        .route(
            "/api/pipelines/{name}",
            get(pipeline_status)
                .put(update_pipeline)
                .delete(delete_pipeline),
        )
        .route("/api/pipelines/{name}/retry", post(retry_pipeline))
        .route(
            "/api/pipelines/{name}/builds",
            get(list_builds).post(trigger_build),
        )
        .route("/api/pipelines/{name}/builds/{number}", get(build_info))
        .route("/api/pipelines/{name}/builds/{number}/log", get(build_log))
        .route(
            "/api/pipelines/{name}/tracking",
            post(start_tracking).delete(cancel_tracking),
        )
        .route("/api/pipelines/{name}/definition", get(remote_definition))
        .route(
            "/api/credentials",
            get(list_credentials).post(create_credential),
        )
        .route(
            "/api/credentials/{id}",
            get(get_credential)
                .put(update_credential)
                .delete(delete_credential),
        )
        .route("/api/cluster/{kind}", get(list_cluster_resources))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::INFO))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
        )
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "cloudops-controller",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    // The job store is the one dependency every request needs.
    let jobs = state.engine.list_jobs().await?;
    Ok(Json(json!({
        "status": "ready",
        "service": "cloudops-controller",
        "jobs": jobs.len()
    })))
}

async fn list_pipelines(State(state): State<AppState>) -> ApiResult<Json<Vec<JobRecord>>> {
    Ok(Json(state.engine.list_jobs().await?))
}

async fn create_pipeline(
    State(state): State<AppState>,
    Json(config): Json<PipelineConfig>,
) -> ApiResult<(StatusCode, Json<JobRecord>)> {
    info!("Creating pipeline {}", config.name);
    let record = state.engine.create(config).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

async fn pipeline_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<JobStatus>> {
    Ok(Json(state.engine.status(&name).await?))
}

async fn update_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<PipelineConfig>,
) -> ApiResult<Json<JobRecord>> {
    Ok(Json(state.engine.update(&name, config).await?))
}

async fn delete_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    state.engine.delete(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_pipeline(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(match state.engine.retry(&name).await? {
        Some(record) => (StatusCode::OK, Json(json!(record))),
        None => (
            StatusCode::OK,
            Json(json!({ "name": name, "deleted": true })),
        ),
    })
}

async fn preview_script(
    State(state): State<AppState>,
    Json(config): Json<PipelineConfig>,
) -> ApiResult<impl IntoResponse> {
    let script = state.engine.preview_script(&config).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], script))
}

async fn preview_definition(
    State(state): State<AppState>,
    Json(config): Json<PipelineConfig>,
) -> ApiResult<impl IntoResponse> {
    let document = state.engine.preview_definition(&config).await?;
    Ok(([(header::CONTENT_TYPE, "application/xml")], document))
}

async fn advisory_summary(
    State(state): State<AppState>,
    Json(config): Json<PipelineConfig>,
) -> Json<Advisory> {
    Json(state.advisory.summarize(&config).await)
}

async fn sync_pipelines(State(state): State<AppState>) -> ApiResult<Json<SyncReport>> {
    Ok(Json(state.engine.sync().await?))
}

async fn list_builds(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Vec<BuildRecord>>> {
    Ok(Json(state.engine.list_builds(&name).await?))
}

async fn trigger_build(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<(StatusCode, Json<TriggeredBuild>)> {
    let triggered = state.engine.trigger_build(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(triggered)))
}

async fn build_info(
    State(state): State<AppState>,
    Path((name, number)): Path<(String, u64)>,
) -> ApiResult<Json<BuildRecord>> {
    Ok(Json(state.engine.build_info(&name, number).await?))
}

async fn build_log(
    State(state): State<AppState>,
    Path((name, number)): Path<(String, u64)>,
) -> ApiResult<impl IntoResponse> {
    let log = state.engine.build_log(&name, number).await?;
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], log))
}

async fn start_tracking(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let started = state.engine.start_tracking(&name).await?;
    Ok(Json(json!({ "name": name, "started": started })))
}

async fn cancel_tracking(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<Value>> {
    let cancelled = state.engine.cancel_tracking(&name).await?;
    Ok(Json(json!({ "name": name, "cancelled": cancelled })))
}

async fn remote_definition(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let document = state.engine.remote_definition(&name).await?;
    Ok(([(header::CONTENT_TYPE, "application/xml")], document))
}

async fn list_credentials(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<CredentialMetadata>>> {
    Ok(Json(state.credentials.list().await?))
}

async fn create_credential(
    State(state): State<AppState>,
    Json(credential): Json<NewCredential>,
) -> ApiResult<(StatusCode, Json<CredentialMetadata>)> {
    let created = state.credentials.create(credential).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<CredentialMetadata>> {
    Ok(Json(state.credentials.get(&id).await?))
}

async fn update_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<CredentialUpdate>,
) -> ApiResult<Json<CredentialMetadata>> {
    Ok(Json(state.credentials.update(&id, update).await?))
}

async fn delete_credential(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state.credentials.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ClusterQuery {
    name: Option<String>,
}

async fn list_cluster_resources(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<ClusterQuery>,
) -> ApiResult<Json<Vec<ResourceSummary>>> {
    let kind: ResourceKind = kind.parse()?;
    let name_filter = query.name.filter(|name| !name.is_empty());
    Ok(Json(state.engine.list_resources(kind, name_filter).await?))
}
