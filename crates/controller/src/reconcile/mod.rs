//! # Reconciliation Engine
//!
//! Drives a pipeline job through its lifecycle across Jenkins and Kubernetes.
//! The two systems share no transaction boundary, so every multi-step
//! operation runs in a fixed order and records the step it stopped at:
//!
//! - create: Jenkins job, then workload, endpoint and routing rule, then the record
//! - update: Jenkins job definition, then the same resource sequence
//! - delete: routing rule, endpoint, workload, Jenkins job, then the record
//!
//! A job left in `partial-failure` is resumed by [`ReconciliationEngine::retry`]
//! from the recorded step. Operations on one job name never interleave, and
//! each runs on its own task: a caller that stops waiting does not stop it.

pub mod lock;

use dashmap::DashMap;
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn, Instrument};

use crate::clock::Clock;
use crate::cluster::{
    ClusterOrchestrator, ClusterSettings, OrchestrationResourceSet, ResourceKind, ResourceSummary,
};
use crate::config::ControllerConfig;
use crate::credentials::CredentialResolver;
use crate::error::{BuildServerError, CredentialError, Error, Result, ValidationError};
use crate::jenkins::{BuildServer, TriggerOutcome};
use crate::model::{
    BuildRecord, BuildSnapshot, BuildStatus, JobDefinition, JobPhase, JobRecord, Operation,
    PipelineConfig, ReconcileStep, TrackingState,
};
use crate::store::{JobStore, StatusUpdate};
use crate::templates::PipelineTemplateGenerator;
use crate::tracker::{BuildTracker, TrackTarget, TrackerSettings, TrackingHandle};

pub use lock::{JobGuard, JobLocks};

/// Collaborators injected into the engine at process start.
#[derive(Clone)]
pub struct EngineContext {
    pub build_server: Arc<dyn BuildServer>,
    pub orchestrator: Arc<dyn ClusterOrchestrator>,
    pub store: Arc<dyn JobStore>,
    pub credentials: Arc<CredentialResolver>,
    pub renderer: Arc<PipelineTemplateGenerator>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub cluster: ClusterSettings,
    pub tracker: TrackerSettings,
    /// Start a tracker after every accepted trigger
    pub auto_track: bool,
}

impl EngineSettings {
    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            cluster: ClusterSettings::from_config(config),
            tracker: TrackerSettings::from_config(&config.tracker),
            auto_track: config.tracker.auto_track,
        }
    }
}

/// Result of an accepted build trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggeredBuild {
    pub job: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_url: Option<String>,
    /// Latest build number before this trigger
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_build: Option<u64>,
    pub tracking: bool,
}

/// Stored record plus a live look at the latest build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub record: JobRecord,
    pub latest: BuildSnapshot,
    pub tracking_active: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Records whose build status was refreshed
    pub refreshed: Vec<String>,
    /// Records with no matching Jenkins job
    pub missing_remote: Vec<String>,
    /// Jenkins jobs with no record; left untouched
    pub unmanaged: Vec<String>,
}

pub struct ReconciliationEngine {
    ctx: EngineContext,
    settings: EngineSettings,
    locks: JobLocks,
    tracker: BuildTracker,
    trackers: Arc<DashMap<String, TrackingHandle>>,
}

impl ReconciliationEngine {
    #[must_use]
    pub fn new(ctx: EngineContext, settings: EngineSettings) -> Self {
        let tracker = BuildTracker::new(
            ctx.build_server.clone(),
            ctx.store.clone(),
            settings.tracker,
        );
        Self {
            ctx,
            settings,
            locks: JobLocks::new(),
            tracker,
            trackers: Arc::new(DashMap::new()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Create a job and its cluster resources.
    ///
    /// If a previous create of the same config stopped part way, this
    /// resumes it instead of failing.
    #[instrument(skip(self, config), fields(job = %config.name))]
    pub async fn create(self: &Arc<Self>, config: PipelineConfig) -> Result<JobRecord> {
        let engine = Arc::clone(self);
        let name = config.name.clone();
        self.detached(&name, Operation::Create, async move { engine.run_create(config).await })
            .await
    }

    /// Apply a new config to an existing job.
    #[instrument(skip(self, config))]
    pub async fn update(self: &Arc<Self>, name: &str, config: PipelineConfig) -> Result<JobRecord> {
        let engine = Arc::clone(self);
        let job = name.to_string();
        self.detached(name, Operation::Update, async move {
            engine.run_update(&job, config).await
        })
        .await
    }

    /// Tear down a job: cluster resources in reverse order, then the Jenkins
    /// job, then the record.
    #[instrument(skip(self))]
    pub async fn delete(self: &Arc<Self>, name: &str) -> Result<()> {
        let engine = Arc::clone(self);
        let job = name.to_string();
        self.detached(name, Operation::Delete, async move { engine.run_delete(&job).await })
            .await
    }

    /// Resume the operation a job stopped in.
    ///
    /// Returns the record after a resumed create or update, `None` after a
    /// completed delete. Jobs with nothing pending are returned unchanged.
    #[instrument(skip(self))]
    pub async fn retry(self: &Arc<Self>, name: &str) -> Result<Option<JobRecord>> {
        let engine = Arc::clone(self);
        let job = name.to_string();
        self.detached(name, Operation::Update, async move { engine.run_retry(&job).await })
            .await
    }

    /// Start a build. Rejected locally while one is already queued or
    /// running, or while a tracker follows the job.
    #[instrument(skip(self))]
    pub async fn trigger_build(self: &Arc<Self>, name: &str) -> Result<TriggeredBuild> {
        let engine = Arc::clone(self);
        let job = name.to_string();
        self.detached(name, Operation::Build, async move {
            engine.run_trigger_build(&job).await
        })
        .await
    }

    /// Run `work` on its own task so it finishes even if the caller's future
    /// is dropped, e.g. by a request timeout or a client disconnect.
    async fn detached<T, F>(&self, job: &str, operation: Operation, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        match tokio::spawn(work.in_current_span()).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => {
                error!("{} of {} was cancelled: {}", operation, job, e);
                Err(Error::Interrupted {
                    job: job.to_string(),
                    operation,
                })
            }
        }
    }

    async fn run_create(&self, config: PipelineConfig) -> Result<JobRecord> {
        config.validate()?;
        let _guard = self.locks.lock(&config.name).await;

        if let Some(existing) = self.ctx.store.get(&config.name).await? {
            return match existing.pending_operation() {
                Some((Operation::Create, step)) if existing.config == config => {
                    info!("Resuming create of {} from {}", config.name, step);
                    self.resume(existing, Operation::Create, step).await
                }
                _ => Err(Error::JobExists(config.name)),
            };
        }

        let definition = self.render_definition(&config).await?;

        // Jenkins first: a workload without a job is harder to notice than
        // a job without a workload.
        let job_id = match self
            .ctx
            .build_server
            .create_job(&config.name, &definition)
            .await
        {
            Ok(job_id) => job_id,
            Err(BuildServerError::AlreadyExists { .. }) => {
                warn!(
                    "Jenkins job {} already exists without a record, converging it",
                    config.name
                );
                self.ctx
                    .build_server
                    .update_job(&config.name, &definition)
                    .await?;
                config.name.clone()
            }
            Err(e) => {
                error!("Failed to create Jenkins job {}: {}", config.name, e);
                return Err(e.into());
            }
        };
        info!("Created Jenkins job {}", job_id);

        let record = JobRecord::new(config, job_id, definition, self.ctx.clock.now());
        self.converge(record, Operation::Create, ResourceKind::Workload)
            .await
    }

    async fn run_update(&self, name: &str, config: PipelineConfig) -> Result<JobRecord> {
        if config.name != name {
            return Err(ValidationError::ImmutableField {
                field: "name",
                existing: name.to_string(),
                requested: config.name,
            }
            .into());
        }
        config.validate()?;
        let _guard = self.locks.lock(name).await;

        let mut record = self.require(name).await?;
        config.check_immutable(&record.config)?;
        match (record.phase, record.pending_operation()) {
            (JobPhase::Deleting, _) | (_, Some((Operation::Delete, _))) => {
                return Err(Error::InvalidState {
                    job: name.to_string(),
                    operation: Operation::Update,
                    phase: record.phase,
                });
            }
            _ => {}
        }

        let definition = self.render_definition(&config).await?;

        record.mode = config.mode();
        record.config = config;
        record.definition = definition;
        record.phase = JobPhase::Reconciling;
        record.failure = None;
        record.updated_at = self.ctx.clock.now();
        let mut record = self.ctx.store.save_reconciliation(&record).await?;

        if let Err(e) = self.sync_build_job(&mut record).await {
            return Err(self
                .fail(&mut record, Operation::Update, ReconcileStep::BuildJob, e)
                .await);
        }

        self.converge(record, Operation::Update, ResourceKind::Workload)
            .await
    }

    async fn run_delete(&self, name: &str) -> Result<()> {
        let _guard = self.locks.lock(name).await;
        let mut record = self.require(name).await?;

        self.stop_tracker(name).await;

        record.phase = JobPhase::Deleting;
        record.failure = None;
        record.updated_at = self.ctx.clock.now();
        let record = self.ctx.store.save_reconciliation(&record).await?;

        self.teardown(record, ReconcileStep::RoutingRule).await
    }

    async fn run_retry(&self, name: &str) -> Result<Option<JobRecord>> {
        let _guard = self.locks.lock(name).await;
        let record = self.require(name).await?;

        let Some((operation, step)) = record.pending_operation() else {
            debug!("Nothing to retry for {} ({})", name, record.phase);
            return Ok(Some(record));
        };
        info!("Retrying {} of {} from {}", operation, name, step);

        match operation {
            Operation::Delete => {
                self.stop_tracker(name).await;
                self.teardown(record, step).await.map(|()| None)
            }
            Operation::Create | Operation::Update | Operation::Build => {
                self.resume(record, operation, step).await.map(Some)
            }
        }
    }

    async fn run_trigger_build(&self, name: &str) -> Result<TriggeredBuild> {
        let _guard = self.locks.lock(name).await;
        let record = self.require(name).await?;

        if record.phase != JobPhase::Ready {
            return Err(Error::InvalidState {
                job: name.to_string(),
                operation: Operation::Build,
                phase: record.phase,
            });
        }
        if self.is_tracking(name) || record.last_status.is_active() {
            return Err(Error::BuildInProgress {
                job: name.to_string(),
                status: if record.last_status.is_active() {
                    record.last_status
                } else {
                    BuildStatus::InProgress
                },
            });
        }

        // A credential deleted since the last reconcile fails here, not in Jenkins.
        self.resolve_credential(&record.config).await?;

        let job_id = record.build_server_job_id.clone();
        let baseline = self.ctx.build_server.latest_build_status(&job_id).await?;

        let queue_url = match self.ctx.build_server.trigger_build(&job_id).await? {
            TriggerOutcome::Accepted { queue_url } => queue_url,
            TriggerOutcome::Rejected { reason } => {
                warn!("Jenkins rejected build of {}: {}", name, reason);
                return Err(Error::BuildRejected {
                    job: name.to_string(),
                    reason,
                });
            }
        };
        info!("Triggered build of {}", name);

        let auto_track = self.settings.auto_track;
        let mut update = StatusUpdate::status(BuildStatus::Queued, baseline.number);
        if auto_track {
            update = update.with_tracking(TrackingState::Tracking);
        }
        self.ctx.store.update_build_status(name, update).await?;

        if auto_track {
            self.spawn_tracker(TrackTarget {
                job_name: name.to_string(),
                job_id,
                baseline_build: baseline.number,
            });
        }

        Ok(TriggeredBuild {
            job: name.to_string(),
            queue_url,
            previous_build: baseline.number,
            tracking: auto_track,
        })
    }

    /// Follow the latest build of a job, e.g. after an earlier tracker
    /// timed out. Returns false if a tracker is already running.
    #[instrument(skip(self))]
    pub async fn start_tracking(&self, name: &str) -> Result<bool> {
        let record = self.require(name).await?;
        if self.is_tracking(name) {
            return Ok(false);
        }

        self.ctx
            .store
            .update_build_status(
                name,
                StatusUpdate {
                    tracking: Some(TrackingState::Tracking),
                    ..StatusUpdate::default()
                },
            )
            .await?;
        self.spawn_tracker(TrackTarget {
            job_name: name.to_string(),
            job_id: record.build_server_job_id,
            baseline_build: None,
        });
        Ok(true)
    }

    /// Stop tracking a job. Returns false if no tracker was running.
    #[instrument(skip(self))]
    pub async fn cancel_tracking(&self, name: &str) -> Result<bool> {
        self.require(name).await?;
        Ok(self.stop_tracker(name).await)
    }

    #[must_use]
    pub fn is_tracking(&self, name: &str) -> bool {
        let finished = match self.trackers.get(name) {
            Some(handle) if !handle.is_finished() => return true,
            Some(_) => true,
            None => false,
        };
        if finished {
            self.trackers.remove_if(name, |_, handle| handle.is_finished());
        }
        false
    }

    /// Cancel every running tracker.
    pub async fn shutdown(&self) {
        let names: Vec<String> = self.trackers.iter().map(|entry| entry.key().clone()).collect();
        let stopped = join_all(names.iter().map(|name| self.stop_tracker(name))).await;
        info!(
            "Stopped {} build tracker(s)",
            stopped.into_iter().filter(|running| *running).count()
        );
    }

    pub async fn get(&self, name: &str) -> Result<JobRecord> {
        self.require(name).await
    }

    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        Ok(self.ctx.store.list().await?)
    }

    /// Record refreshed from Jenkins' latest build.
    ///
    /// While a tracker runs it owns the status, so the record is only read.
    #[instrument(skip(self))]
    pub async fn status(&self, name: &str) -> Result<JobStatus> {
        let record = self.require(name).await?;
        let latest = self
            .ctx
            .build_server
            .latest_build_status(&record.build_server_job_id)
            .await?;

        let tracking_active = self.is_tracking(name);
        let record = if tracking_active {
            record
        } else {
            self.ctx
                .store
                .update_build_status(name, StatusUpdate::status(latest.status, latest.number))
                .await?
                .unwrap_or(record)
        };

        Ok(JobStatus {
            record,
            latest,
            tracking_active,
        })
    }

    pub async fn list_builds(&self, name: &str) -> Result<Vec<BuildRecord>> {
        let record = self.require(name).await?;
        Ok(self
            .ctx
            .build_server
            .list_builds(&record.build_server_job_id)
            .await?)
    }

    pub async fn build_info(&self, name: &str, number: u64) -> Result<BuildRecord> {
        let record = self.require(name).await?;
        Ok(self
            .ctx
            .build_server
            .get_build(&record.build_server_job_id, number)
            .await?)
    }

    pub async fn build_log(&self, name: &str, number: u64) -> Result<String> {
        let record = self.require(name).await?;
        Ok(self
            .ctx
            .build_server
            .build_log(&record.build_server_job_id, number)
            .await?)
    }

    /// Definition document as currently stored in Jenkins.
    pub async fn remote_definition(&self, name: &str) -> Result<String> {
        let record = self.require(name).await?;
        Ok(self
            .ctx
            .build_server
            .get_job_definition(&record.build_server_job_id)
            .await?)
    }

    /// Refresh build status of every record from Jenkins and report drift.
    #[instrument(skip(self))]
    pub async fn sync(&self) -> Result<SyncReport> {
        let remote = self.ctx.build_server.list_jobs(None).await?;
        let records = self.ctx.store.list().await?;
        let known: BTreeSet<&str> = records
            .iter()
            .map(|record| record.build_server_job_id.as_str())
            .collect();

        let mut report = SyncReport::default();
        for record in &records {
            let Some(job) = remote
                .iter()
                .find(|job| job.id == record.build_server_job_id)
            else {
                warn!("Jenkins job for {} is missing", record.name);
                report.missing_remote.push(record.name.clone());
                continue;
            };
            if self.is_tracking(&record.name) {
                continue;
            }
            self.ctx
                .store
                .update_build_status(
                    &record.name,
                    StatusUpdate::status(job.latest.status, job.latest.number),
                )
                .await?;
            report.refreshed.push(record.name.clone());
        }
        report.unmanaged = remote
            .iter()
            .filter(|job| !known.contains(job.id.as_str()))
            .map(|job| job.id.clone())
            .collect();

        info!(
            refreshed = report.refreshed.len(),
            missing = report.missing_remote.len(),
            unmanaged = report.unmanaged.len(),
            "Synchronized job records with Jenkins"
        );
        Ok(report)
    }

    /// Managed cluster resources of one kind.
    pub async fn list_resources(
        &self,
        kind: ResourceKind,
        name_filter: Option<String>,
    ) -> Result<Vec<ResourceSummary>> {
        Ok(self.ctx.orchestrator.list(kind, name_filter).await?)
    }

    /// Pipeline script a STANDARD config would produce. No side effects.
    pub async fn preview_script(&self, config: &PipelineConfig) -> Result<String> {
        config.validate()?;
        let credential = self.resolve_credential(config).await?;
        self.ctx
            .renderer
            .render_script(config, credential.as_deref())
    }

    /// Job definition document a config would produce. No side effects.
    pub async fn preview_definition(&self, config: &PipelineConfig) -> Result<String> {
        config.validate()?;
        self.render_definition(config).await
    }

    async fn require(&self, name: &str) -> Result<JobRecord> {
        self.ctx
            .store
            .get(name)
            .await?
            .ok_or_else(|| Error::JobNotFound(name.to_string()))
    }

    async fn resolve_credential(&self, config: &PipelineConfig) -> Result<Option<String>> {
        match self
            .ctx
            .credentials
            .resolve_optional(config.credential_id())
            .await
        {
            Err(Error::Credential(CredentialError::NotFound(id))) => {
                Err(ValidationError::InvalidField {
                    field: "source.credentialId",
                    message: format!("credential '{id}' does not exist"),
                }
                .into())
            }
            other => other,
        }
    }

    async fn render_definition(&self, config: &PipelineConfig) -> Result<String> {
        match &config.definition {
            JobDefinition::Custom(custom) => Ok(custom.document.clone()),
            JobDefinition::Standard(_) => {
                let credential = self.resolve_credential(config).await?;
                self.ctx
                    .renderer
                    .render_definition(config, credential.as_deref())
            }
        }
    }

    /// Push the record's definition to Jenkins, recreating a vanished job.
    async fn sync_build_job(&self, record: &mut JobRecord) -> Result<()> {
        match self
            .ctx
            .build_server
            .update_job(&record.build_server_job_id, &record.definition)
            .await
        {
            Ok(()) => {
                debug!("Updated Jenkins job {}", record.build_server_job_id);
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    "Jenkins job {} disappeared, recreating it",
                    record.build_server_job_id
                );
                record.build_server_job_id = self
                    .ctx
                    .build_server
                    .create_job(&record.name, &record.definition)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Continue a create or update from the step it stopped at.
    async fn resume(
        &self,
        mut record: JobRecord,
        operation: Operation,
        step: ReconcileStep,
    ) -> Result<JobRecord> {
        let from = match step {
            ReconcileStep::BuildJob => {
                record.definition = self.render_definition(&record.config).await?;
                if let Err(e) = self.sync_build_job(&mut record).await {
                    return Err(self.fail(&mut record, operation, step, e).await);
                }
                Some(ResourceKind::Workload)
            }
            ReconcileStep::Record => None,
            other => Some(other.resource_kind().unwrap_or(ResourceKind::Workload)),
        };

        match from {
            Some(kind) => self.converge(record, operation, kind).await,
            None => self.finish(record, operation).await,
        }
    }

    /// Apply the job's resources in creation order starting at `from`, then
    /// persist the record as ready.
    async fn converge(
        &self,
        mut record: JobRecord,
        operation: Operation,
        from: ResourceKind,
    ) -> Result<JobRecord> {
        let resources = OrchestrationResourceSet::derive(&record.config, &self.settings.cluster);
        for spec in resources.from_kind(from) {
            debug!("Applying {} {}", spec.kind(), spec.name());
            if let Err(e) = self.ctx.orchestrator.create_or_update(&spec).await {
                let step = ReconcileStep::from(spec.kind());
                return Err(self.fail(&mut record, operation, step, e.into()).await);
            }
        }
        self.finish(record, operation).await
    }

    async fn finish(&self, mut record: JobRecord, operation: Operation) -> Result<JobRecord> {
        record.mark_ready(self.ctx.clock.now());
        match self.ctx.store.save_reconciliation(&record).await {
            Ok(saved) => {
                info!("{} of {} complete", operation, saved.name);
                Ok(saved)
            }
            Err(e) => {
                error!("Failed to persist record for {}: {}", record.name, e);
                Err(Error::partial(
                    &record.name,
                    operation,
                    ReconcileStep::Record,
                    e.into(),
                ))
            }
        }
    }

    /// Remove resources in teardown order starting at `from`.
    async fn teardown(&self, mut record: JobRecord, from: ReconcileStep) -> Result<()> {
        let name = record.name.clone();
        let steps = ReconcileStep::DELETE_ORDER
            .into_iter()
            .skip_while(|step| *step != from);

        for step in steps {
            let result = match step.resource_kind() {
                Some(kind) => self
                    .ctx
                    .orchestrator
                    .delete(kind, &name)
                    .await
                    .map_err(Error::from),
                None => match self
                    .ctx
                    .build_server
                    .delete_job(&record.build_server_job_id)
                    .await
                {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other.map_err(Error::from),
                },
            };
            if let Err(e) = result {
                return Err(self.fail(&mut record, Operation::Delete, step, e).await);
            }
        }

        if let Err(e) = self.ctx.store.delete(&name).await {
            return Err(self
                .fail(&mut record, Operation::Delete, ReconcileStep::Record, e.into())
                .await);
        }
        info!("Deleted pipeline job {}", name);
        Ok(())
    }

    /// Record a partial failure and build the error reported to the caller.
    async fn fail(
        &self,
        record: &mut JobRecord,
        operation: Operation,
        step: ReconcileStep,
        source: Error,
    ) -> Error {
        error!(
            job = %record.name,
            operation = %operation,
            step = %step,
            "Reconciliation stopped: {}", source
        );
        record.mark_partial_failure(operation, step, source.to_string(), self.ctx.clock.now());
        match self.ctx.store.save_reconciliation(record).await {
            Ok(saved) => *record = saved,
            Err(e) => warn!("Failed to record partial failure of {}: {}", record.name, e),
        }
        Error::partial(&record.name, operation, step, source)
    }

    fn spawn_tracker(&self, target: TrackTarget) {
        let name = target.job_name.clone();
        let trackers = self.trackers.clone();
        let finished_name = name.clone();
        let handle = self.tracker.spawn(target, move |id| {
            trackers.remove_if(&finished_name, |_, handle| handle.id() == id);
        });
        debug!("Tracking builds of {} ({})", name, handle.id());
        if let Some(previous) = self.trackers.insert(name, handle) {
            previous.cancellation().cancel();
        }
    }

    async fn stop_tracker(&self, name: &str) -> bool {
        let Some((_, handle)) = self.trackers.remove(name) else {
            return false;
        };
        if handle.is_finished() {
            return false;
        }
        let outcome = handle.stop().await;
        debug!("Stopped tracking {}: {:?}", name, outcome);
        true
    }
}
