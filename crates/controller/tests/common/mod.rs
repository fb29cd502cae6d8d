//! Shared fakes and builders for integration tests.
//!
//! The fakes record every call so tests can assert ordering and call counts,
//! and can be told to fail specific operations.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cloudops_controller::clock::{Clock, FixedClock};
use cloudops_controller::cluster::{
    ClusterOrchestrator, ClusterSettings, ResourceKind, ResourceSpec, ResourceSummary,
};
use cloudops_controller::credentials::{CredentialResolver, InMemoryCredentialStore};
use cloudops_controller::error::{BuildServerError, OrchestratorError};
use cloudops_controller::jenkins::{BuildServer, JobSummary, TriggerOutcome};
use cloudops_controller::model::{
    BuildRecord, BuildSnapshot, BuildStatus, CustomConfig, ImageSettings, JobDefinition,
    PipelineConfig, RuntimeSettings, SourceSettings, StackType, StandardConfig,
};
use cloudops_controller::store::InMemoryJobStore;
use cloudops_controller::templates::{PipelineTemplateGenerator, RenderSettings};
use cloudops_controller::tracker::TrackerSettings;
use cloudops_controller::{EngineContext, EngineSettings, ReconciliationEngine};

pub fn standard_config(name: &str, stack: StackType) -> PipelineConfig {
    PipelineConfig {
        name: name.to_string(),
        stack,
        definition: JobDefinition::Standard(StandardConfig {
            source: SourceSettings {
                repository_url: "https://git.example.com/team/app.git".to_string(),
                branch: "main".to_string(),
                credential_id: None,
            },
            node_options: None,
        }),
        image: ImageSettings::default(),
        runtime: RuntimeSettings::default(),
        description: None,
    }
}

pub fn custom_config(name: &str, document: &str) -> PipelineConfig {
    PipelineConfig {
        definition: JobDefinition::Custom(CustomConfig {
            document: document.to_string(),
        }),
        ..standard_config(name, StackType::Java)
    }
}

fn api_error(operation: &str, job_id: &str) -> BuildServerError {
    BuildServerError::Api {
        resource: format!("job '{job_id}'"),
        status: 500,
        message: format!("injected {operation} failure"),
    }
}

/// In-memory Jenkins stand-in.
#[derive(Default)]
pub struct FakeBuildServer {
    calls: Mutex<Vec<String>>,
    jobs: Mutex<BTreeMap<String, String>>,
    failing: Mutex<HashSet<&'static str>>,
    statuses: Mutex<VecDeque<BuildSnapshot>>,
    last_status: Mutex<Option<BuildSnapshot>>,
    reject_trigger: Mutex<Option<String>>,
}

impl FakeBuildServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the trait methods called so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls().iter().filter(|call| *call == operation).count()
    }

    pub fn mutating_calls(&self) -> usize {
        ["create_job", "update_job", "delete_job", "trigger_build"]
            .iter()
            .map(|operation| self.count(operation))
            .sum()
    }

    pub fn fail(&self, operation: &'static str) {
        self.failing.lock().unwrap().insert(operation);
    }

    pub fn recover(&self, operation: &'static str) {
        self.failing.lock().unwrap().remove(operation);
    }

    pub fn insert_job(&self, job_id: &str, definition: &str) {
        self.jobs
            .lock()
            .unwrap()
            .insert(job_id.to_string(), definition.to_string());
    }

    pub fn remove_job(&self, job_id: &str) {
        self.jobs.lock().unwrap().remove(job_id);
    }

    pub fn definition(&self, job_id: &str) -> Option<String> {
        self.jobs.lock().unwrap().get(job_id).cloned()
    }

    pub fn has_job(&self, job_id: &str) -> bool {
        self.jobs.lock().unwrap().contains_key(job_id)
    }

    /// Statuses returned by successive status polls. The last one repeats.
    pub fn script_statuses(&self, statuses: Vec<BuildSnapshot>) {
        *self.statuses.lock().unwrap() = statuses.into();
    }

    pub fn reject_triggers(&self, reason: &str) {
        *self.reject_trigger.lock().unwrap() = Some(reason.to_string());
    }

    fn record(&self, operation: &'static str) -> Result<(), BuildServerError> {
        self.calls.lock().unwrap().push(operation.to_string());
        if self.failing.lock().unwrap().contains(operation) {
            return Err(api_error(operation, "*"));
        }
        Ok(())
    }

    fn require_job(&self, job_id: &str) -> Result<(), BuildServerError> {
        if self.has_job(job_id) {
            Ok(())
        } else {
            Err(BuildServerError::NotFound {
                resource: format!("job '{job_id}'"),
            })
        }
    }

    fn next_status(&self) -> BuildSnapshot {
        let mut statuses = self.statuses.lock().unwrap();
        let mut last = self.last_status.lock().unwrap();
        if let Some(next) = statuses.pop_front() {
            *last = Some(next);
        }
        last.unwrap_or(BuildSnapshot::new(None, BuildStatus::Unknown))
    }
}

#[async_trait]
impl BuildServer for FakeBuildServer {
    async fn list_jobs(
        &self,
        name_filter: Option<String>,
    ) -> Result<Vec<JobSummary>, BuildServerError> {
        self.record("list_jobs")?;
        let latest = self
            .last_status
            .lock()
            .unwrap()
            .unwrap_or(BuildSnapshot::new(None, BuildStatus::Unknown));
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .keys()
            .filter(|id| name_filter.as_deref().map_or(true, |f| id.contains(f)))
            .map(|id| JobSummary {
                id: id.clone(),
                name: id.clone(),
                url: None,
                description: None,
                latest,
            })
            .collect())
    }

    async fn get_job(&self, job_id: &str) -> Result<JobSummary, BuildServerError> {
        self.record("get_job")?;
        self.require_job(job_id)?;
        Ok(JobSummary {
            id: job_id.to_string(),
            name: job_id.to_string(),
            url: None,
            description: None,
            latest: BuildSnapshot::new(None, BuildStatus::Unknown),
        })
    }

    async fn get_job_definition(&self, job_id: &str) -> Result<String, BuildServerError> {
        self.record("get_job_definition")?;
        self.require_job(job_id)?;
        Ok(self.definition(job_id).unwrap_or_default())
    }

    async fn create_job(&self, name: &str, definition: &str) -> Result<String, BuildServerError> {
        self.record("create_job")?;
        if self.has_job(name) {
            return Err(BuildServerError::AlreadyExists {
                resource: format!("job '{name}'"),
            });
        }
        self.insert_job(name, definition);
        Ok(name.to_string())
    }

    async fn update_job(&self, job_id: &str, definition: &str) -> Result<(), BuildServerError> {
        self.record("update_job")?;
        self.require_job(job_id)?;
        self.insert_job(job_id, definition);
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<(), BuildServerError> {
        self.record("delete_job")?;
        self.jobs.lock().unwrap().remove(job_id);
        Ok(())
    }

    async fn trigger_build(&self, job_id: &str) -> Result<TriggerOutcome, BuildServerError> {
        self.record("trigger_build")?;
        self.require_job(job_id)?;
        if let Some(reason) = self.reject_trigger.lock().unwrap().clone() {
            return Ok(TriggerOutcome::Rejected { reason });
        }
        Ok(TriggerOutcome::Accepted {
            queue_url: Some(format!("http://jenkins.local/queue/item/{}/", self.count("trigger_build"))),
        })
    }

    async fn latest_build_status(&self, job_id: &str) -> Result<BuildSnapshot, BuildServerError> {
        self.record("latest_build_status")?;
        self.require_job(job_id)?;
        Ok(self.next_status())
    }

    async fn list_builds(&self, job_id: &str) -> Result<Vec<BuildRecord>, BuildServerError> {
        self.record("list_builds")?;
        self.require_job(job_id)?;
        Ok(vec![BuildRecord {
            job_id: job_id.to_string(),
            number: 1,
            status: BuildStatus::Success,
            started_at: None,
            duration_ms: 1200,
        }])
    }

    async fn get_build(&self, job_id: &str, number: u64) -> Result<BuildRecord, BuildServerError> {
        self.record("get_build")?;
        self.require_job(job_id)?;
        Ok(BuildRecord {
            job_id: job_id.to_string(),
            number,
            status: BuildStatus::Success,
            started_at: None,
            duration_ms: 1200,
        })
    }

    async fn build_log(&self, job_id: &str, number: u64) -> Result<String, BuildServerError> {
        self.record("build_log")?;
        self.require_job(job_id)?;
        Ok(format!("Started build #{number}\nFinished: SUCCESS\n"))
    }
}

/// In-memory cluster stand-in.
///
/// Rejects a routing rule whose endpoint does not exist yet, the way an
/// admission policy in a real cluster would. With a latency set, applies and
/// deletes take that long and the fake records how many overlapped.
#[derive(Default)]
pub struct FakeOrchestrator {
    calls: Mutex<Vec<(String, ResourceKind)>>,
    resources: Mutex<BTreeMap<(ResourceKind, String), ResourceSpec>>,
    failing: Mutex<HashSet<(&'static str, ResourceKind)>>,
    latency: Mutex<Option<Duration>>,
    in_flight: Mutex<BTreeMap<String, usize>>,
    peak_per_job: Mutex<usize>,
    peak_total: Mutex<usize>,
}

impl FakeOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<(String, ResourceKind)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str, kind: ResourceKind) -> usize {
        self.calls()
            .iter()
            .filter(|(op, k)| op == operation && *k == kind)
            .count()
    }

    pub fn mutating_calls(&self) -> usize {
        self.calls()
            .iter()
            .filter(|(op, _)| op != "get" && op != "list")
            .count()
    }

    pub fn fail(&self, operation: &'static str, kind: ResourceKind) {
        self.failing.lock().unwrap().insert((operation, kind));
    }

    pub fn recover(&self, operation: &'static str, kind: ResourceKind) {
        self.failing.lock().unwrap().remove(&(operation, kind));
    }

    pub fn exists(&self, kind: ResourceKind, job_name: &str) -> bool {
        self.resources
            .lock()
            .unwrap()
            .contains_key(&(kind, job_name.to_string()))
    }

    pub fn resource_count(&self) -> usize {
        self.resources.lock().unwrap().len()
    }

    pub fn spec(&self, kind: ResourceKind, job_name: &str) -> Option<ResourceSpec> {
        self.resources
            .lock()
            .unwrap()
            .get(&(kind, job_name.to_string()))
            .cloned()
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    /// Most mutating calls ever in flight at once for a single job.
    pub fn peak_per_job(&self) -> usize {
        *self.peak_per_job.lock().unwrap()
    }

    /// Most mutating calls ever in flight at once across all jobs.
    pub fn peak_total(&self) -> usize {
        *self.peak_total.lock().unwrap()
    }

    async fn pause(&self, job_name: &str) {
        let latency = *self.latency.lock().unwrap();
        let Some(latency) = latency else {
            return;
        };
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let count = in_flight.entry(job_name.to_string()).or_default();
            *count += 1;
            let count = *count;
            let total: usize = in_flight.values().sum();
            let mut peak = self.peak_per_job.lock().unwrap();
            *peak = (*peak).max(count);
            let mut peak = self.peak_total.lock().unwrap();
            *peak = (*peak).max(total);
        }
        tokio::time::sleep(latency).await;
        if let Some(count) = self.in_flight.lock().unwrap().get_mut(job_name) {
            *count -= 1;
        }
    }

    fn record(&self, operation: &'static str, kind: ResourceKind) -> Result<(), OrchestratorError> {
        self.calls.lock().unwrap().push((operation.to_string(), kind));
        if self.failing.lock().unwrap().contains(&(operation, kind)) {
            return Err(OrchestratorError::Rejected {
                kind,
                name: format!("injected-{operation}"),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }

    fn summary(kind: ResourceKind, spec: &ResourceSpec) -> ResourceSummary {
        ResourceSummary {
            kind,
            name: spec.name().to_string(),
            namespace: "apps".to_string(),
            job: Some(spec.job_name().to_string()),
            managed: true,
            status: "Ready".to_string(),
            created_at: None,
            details: BTreeMap::new(),
        }
    }
}

#[async_trait]
impl ClusterOrchestrator for FakeOrchestrator {
    async fn get(
        &self,
        kind: ResourceKind,
        job_name: &str,
    ) -> Result<Option<ResourceSummary>, OrchestratorError> {
        self.record("get", kind)?;
        Ok(self
            .spec(kind, job_name)
            .map(|spec| Self::summary(kind, &spec)))
    }

    async fn create_or_update(&self, spec: &ResourceSpec) -> Result<(), OrchestratorError> {
        let kind = spec.kind();
        self.record("apply", kind)?;
        self.pause(spec.job_name()).await;
        if kind == ResourceKind::RoutingRule && !self.exists(ResourceKind::Endpoint, spec.job_name())
        {
            return Err(OrchestratorError::Rejected {
                kind,
                name: spec.name().to_string(),
                message: "backend service does not exist".to_string(),
            });
        }
        self.resources
            .lock()
            .unwrap()
            .insert((kind, spec.job_name().to_string()), spec.clone());
        Ok(())
    }

    async fn delete(&self, kind: ResourceKind, job_name: &str) -> Result<(), OrchestratorError> {
        self.record("delete", kind)?;
        self.pause(job_name).await;
        self.resources
            .lock()
            .unwrap()
            .remove(&(kind, job_name.to_string()));
        Ok(())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        name_filter: Option<String>,
    ) -> Result<Vec<ResourceSummary>, OrchestratorError> {
        self.record("list", kind)?;
        Ok(self
            .resources
            .lock()
            .unwrap()
            .iter()
            .filter(|((k, _), spec)| {
                *k == kind && name_filter.as_deref().map_or(true, |f| spec.name().contains(f))
            })
            .map(|((k, _), spec)| Self::summary(*k, spec))
            .collect())
    }
}

pub fn render_settings() -> RenderSettings {
    RenderSettings {
        registry_url: "registry.local".to_string(),
        registry_directory: "cloudops".to_string(),
        registry_credential_id: "registry".to_string(),
        kubeconfig_credential_id: "kubeconfig".to_string(),
        namespace: "apps".to_string(),
    }
}

pub fn cluster_settings() -> ClusterSettings {
    ClusterSettings {
        namespace: "apps".to_string(),
        ingress_domain: "apps.local".to_string(),
        ingress_class: None,
        registry_url: "registry.local".to_string(),
        registry_directory: "cloudops".to_string(),
        image_pull_secret: None,
    }
}

pub fn fixed_clock() -> Arc<dyn Clock> {
    Arc::new(FixedClock(
        Utc.with_ymd_and_hms(2025, 3, 14, 15, 9, 26).unwrap(),
    ))
}

pub struct Harness {
    pub engine: Arc<ReconciliationEngine>,
    pub build_server: Arc<FakeBuildServer>,
    pub orchestrator: Arc<FakeOrchestrator>,
    pub store: Arc<InMemoryJobStore>,
    pub credentials: Arc<CredentialResolver>,
}

pub fn harness() -> Harness {
    harness_with(TrackerSettings {
        poll_interval: Duration::from_millis(1),
        max_polls: 20,
        max_consecutive_failures: 3,
    })
}

pub fn harness_with(tracker: TrackerSettings) -> Harness {
    let build_server = Arc::new(FakeBuildServer::new());
    let orchestrator = Arc::new(FakeOrchestrator::new());
    let store = Arc::new(InMemoryJobStore::new());
    let credentials = Arc::new(CredentialResolver::new(
        Arc::new(InMemoryCredentialStore::new()),
        store.clone(),
    ));
    let clock = fixed_clock();
    let renderer = Arc::new(
        PipelineTemplateGenerator::new(render_settings(), clock.clone())
            .expect("built-in templates register"),
    );

    let engine = Arc::new(ReconciliationEngine::new(
        EngineContext {
            build_server: build_server.clone(),
            orchestrator: orchestrator.clone(),
            store: store.clone(),
            credentials: credentials.clone(),
            renderer,
            clock,
        },
        EngineSettings {
            cluster: cluster_settings(),
            tracker,
            auto_track: true,
        },
    ));

    Harness {
        engine,
        build_server,
        orchestrator,
        store,
        credentials,
    }
}

/// Wait until `check` holds, polling briefly.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
