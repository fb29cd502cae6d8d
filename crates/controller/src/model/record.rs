//! Persisted per-job state and normalized build information.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cluster::ResourceKind;
use crate::error::ExternalSystem;
use crate::model::{ConfigMode, PipelineConfig};

/// Build status normalized across build-server vocabularies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStatus {
    Queued,
    InProgress,
    Success,
    Failure,
    Aborted,
    #[default]
    Unknown,
}

impl BuildStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BuildStatus::Success | BuildStatus::Failure | BuildStatus::Aborted
        )
    }

    /// Queued and in-progress builds keep a tracker polling.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, BuildStatus::Queued | BuildStatus::InProgress)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            BuildStatus::Queued => "queued",
            BuildStatus::InProgress => "in-progress",
            BuildStatus::Success => "success",
            BuildStatus::Failure => "failure",
            BuildStatus::Aborted => "aborted",
            BuildStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One build of a job. The log is addressed by `(job_id, number)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRecord {
    pub job_id: String,
    pub number: u64,
    pub status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: u64,
}

/// Latest-build view used by status polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSnapshot {
    pub number: Option<u64>,
    pub status: BuildStatus,
}

impl BuildSnapshot {
    #[must_use]
    pub fn new(number: Option<u64>, status: BuildStatus) -> Self {
        Self { number, status }
    }

    /// Status as seen by a tracker started when `baseline` was the latest build.
    ///
    /// A settled or unknown result that belongs to `baseline`, an older build,
    /// or no build at all means the triggered build has not surfaced yet, so
    /// it reads as queued.
    #[must_use]
    pub fn relative_to(self, baseline: Option<u64>) -> BuildStatus {
        if self.status.is_active() {
            return self.status;
        }
        match (self.number, baseline) {
            (Some(current), Some(previous)) if current <= previous => BuildStatus::Queued,
            (None, _) => BuildStatus::Queued,
            _ => self.status,
        }
    }
}

/// Lifecycle phase of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobPhase {
    /// Jenkins job exists, resources not yet converged
    JobCreated,
    Ready,
    Reconciling,
    Deleting,
    PartialFailure,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            JobPhase::JobCreated => "job-created",
            JobPhase::Ready => "ready",
            JobPhase::Reconciling => "reconciling",
            JobPhase::Deleting => "deleting",
            JobPhase::PartialFailure => "partial-failure",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Create,
    Update,
    Delete,
    /// Trigger a build; never recorded as a failure
    Build,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Operation::Create => "create",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Build => "build",
        };
        f.write_str(text)
    }
}

/// A single remote step of a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcileStep {
    BuildJob,
    Workload,
    Endpoint,
    RoutingRule,
    Record,
}

impl ReconcileStep {
    /// Teardown order; the reverse of creation.
    pub const DELETE_ORDER: [ReconcileStep; 4] = [
        ReconcileStep::RoutingRule,
        ReconcileStep::Endpoint,
        ReconcileStep::Workload,
        ReconcileStep::BuildJob,
    ];

    #[must_use]
    pub fn system(self) -> ExternalSystem {
        match self {
            ReconcileStep::BuildJob => ExternalSystem::BuildServer,
            ReconcileStep::Workload | ReconcileStep::Endpoint | ReconcileStep::RoutingRule => {
                ExternalSystem::Orchestrator
            }
            ReconcileStep::Record => ExternalSystem::JobStore,
        }
    }

    #[must_use]
    pub fn resource_kind(self) -> Option<ResourceKind> {
        match self {
            ReconcileStep::Workload => Some(ResourceKind::Workload),
            ReconcileStep::Endpoint => Some(ResourceKind::Endpoint),
            ReconcileStep::RoutingRule => Some(ResourceKind::RoutingRule),
            ReconcileStep::BuildJob | ReconcileStep::Record => None,
        }
    }
}

impl From<ResourceKind> for ReconcileStep {
    fn from(kind: ResourceKind) -> Self {
        match kind {
            ResourceKind::Workload => ReconcileStep::Workload,
            ResourceKind::Endpoint => ReconcileStep::Endpoint,
            // Instances are never reconciled directly; they follow the workload.
            ResourceKind::RoutingRule | ResourceKind::Instance => ReconcileStep::RoutingRule,
        }
    }
}

impl fmt::Display for ReconcileStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReconcileStep::BuildJob => f.write_str("build job"),
            ReconcileStep::Record => f.write_str("job record"),
            other => match other.resource_kind() {
                Some(kind) => write!(f, "{kind}"),
                None => Ok(()),
            },
        }
    }
}

/// Where a multi-step operation stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub operation: Operation,
    pub step: ReconcileStep,
    pub system: ExternalSystem,
    pub message: String,
    pub failed_at: DateTime<Utc>,
}

/// State of background build tracking for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrackingState {
    #[default]
    Idle,
    Tracking,
    Completed,
    TimedOut,
    Unavailable,
    Cancelled,
}

/// Authoritative local record of one managed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub name: String,
    pub build_server_job_id: String,
    pub mode: ConfigMode,
    pub phase: JobPhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureRecord>,
    /// Set once workload, endpoint and routing rule have all been applied
    #[serde(default)]
    pub orchestration_complete: bool,
    #[serde(default)]
    pub last_status: BuildStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_build_number: Option<u64>,
    #[serde(default)]
    pub tracking: TrackingState,
    pub config: PipelineConfig,
    /// Last rendered (or supplied) job definition document
    pub definition: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    #[must_use]
    pub fn new(
        config: PipelineConfig,
        build_server_job_id: String,
        definition: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: config.name.clone(),
            build_server_job_id,
            mode: config.mode(),
            phase: JobPhase::JobCreated,
            failure: None,
            orchestration_complete: false,
            last_status: BuildStatus::Unknown,
            last_build_number: None,
            tracking: TrackingState::Idle,
            config,
            definition,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_ready(&mut self, now: DateTime<Utc>) {
        self.phase = JobPhase::Ready;
        self.failure = None;
        self.orchestration_complete = true;
        self.updated_at = now;
    }

    pub fn mark_partial_failure(
        &mut self,
        operation: Operation,
        step: ReconcileStep,
        message: String,
        now: DateTime<Utc>,
    ) {
        self.phase = JobPhase::PartialFailure;
        if step.resource_kind().is_some() && operation != Operation::Delete {
            self.orchestration_complete = false;
        }
        self.failure = Some(FailureRecord {
            operation,
            step,
            system: step.system(),
            message,
            failed_at: now,
        });
        self.updated_at = now;
    }

    /// Operation awaiting a retry.
    ///
    /// Besides a recorded partial failure, an update or delete that stopped
    /// before recording any outcome (the process exited mid-way) is resumed
    /// from its first step.
    #[must_use]
    pub fn pending_operation(&self) -> Option<(Operation, ReconcileStep)> {
        match (&self.phase, &self.failure) {
            (JobPhase::PartialFailure, Some(failure)) => Some((failure.operation, failure.step)),
            (JobPhase::Reconciling, None) => Some((Operation::Update, ReconcileStep::BuildJob)),
            (JobPhase::Deleting, None) => Some((Operation::Delete, ReconcileStep::RoutingRule)),
            _ => None,
        }
    }

    /// Take the build-status fields from `stored`.
    ///
    /// Trackers own these fields; reconciliation writes must not roll them back.
    pub fn carry_build_status(&mut self, stored: &JobRecord) {
        self.last_status = stored.last_status;
        self.last_build_number = stored.last_build_number;
        self.tracking = stored.tracking;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pipeline::fixtures::standard_config;
    use crate::model::StackType;

    #[test]
    fn terminal_result_of_older_build_reads_as_queued() {
        let snapshot = BuildSnapshot::new(Some(7), BuildStatus::Success);
        assert_eq!(snapshot.relative_to(Some(7)), BuildStatus::Queued);
        assert_eq!(snapshot.relative_to(Some(6)), BuildStatus::Success);
        assert_eq!(snapshot.relative_to(None), BuildStatus::Success);

        let running = BuildSnapshot::new(Some(7), BuildStatus::InProgress);
        assert_eq!(running.relative_to(Some(7)), BuildStatus::InProgress);

        let never_built = BuildSnapshot::new(None, BuildStatus::Unknown);
        assert_eq!(never_built.relative_to(None), BuildStatus::Queued);
        let not_built = BuildSnapshot::new(Some(8), BuildStatus::Unknown);
        assert_eq!(not_built.relative_to(Some(7)), BuildStatus::Unknown);
    }

    #[test]
    fn record_serializes_with_kebab_case_states() {
        let mut record = JobRecord::new(
            standard_config("web", StackType::Node),
            "web".to_string(),
            "<flow-definition/>".to_string(),
            Utc::now(),
        );
        record.mark_partial_failure(
            Operation::Create,
            ReconcileStep::Endpoint,
            "boom".to_string(),
            Utc::now(),
        );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["phase"], "partial-failure");
        assert_eq!(value["failure"]["step"], "endpoint");
        assert_eq!(value["failure"]["system"], "orchestrator");
        assert_eq!(value["lastStatus"], "unknown");

        let restored: JobRecord = serde_json::from_value(value).unwrap();
        assert_eq!(restored, record);
        assert_eq!(
            restored.pending_operation(),
            Some((Operation::Create, ReconcileStep::Endpoint))
        );
    }

    #[test]
    fn interrupted_update_and_delete_are_resumable() {
        let mut record = JobRecord::new(
            standard_config("web", StackType::Node),
            "web".to_string(),
            String::new(),
            Utc::now(),
        );
        assert_eq!(record.pending_operation(), None);

        record.phase = JobPhase::Reconciling;
        assert_eq!(
            record.pending_operation(),
            Some((Operation::Update, ReconcileStep::BuildJob))
        );

        record.phase = JobPhase::Deleting;
        assert_eq!(
            record.pending_operation(),
            Some((Operation::Delete, ReconcileStep::RoutingRule))
        );

        record.phase = JobPhase::Ready;
        assert_eq!(record.pending_operation(), None);
    }

    #[test]
    fn carry_build_status_keeps_everything_else() {
        let mut stored = JobRecord::new(
            standard_config("web", StackType::Node),
            "web".to_string(),
            "<old/>".to_string(),
            Utc::now(),
        );
        stored.last_status = BuildStatus::Success;
        stored.last_build_number = Some(4);
        stored.tracking = TrackingState::Completed;

        let mut fresh = stored.clone();
        fresh.definition = "<new/>".to_string();
        fresh.phase = JobPhase::Ready;
        fresh.last_status = BuildStatus::Queued;
        fresh.last_build_number = Some(3);
        fresh.tracking = TrackingState::Tracking;

        fresh.carry_build_status(&stored);
        assert_eq!(fresh.last_status, BuildStatus::Success);
        assert_eq!(fresh.last_build_number, Some(4));
        assert_eq!(fresh.tracking, TrackingState::Completed);
        assert_eq!(fresh.definition, "<new/>");
        assert_eq!(fresh.phase, JobPhase::Ready);
    }

    #[test]
    fn mark_ready_clears_failure() {
        let mut record = JobRecord::new(
            standard_config("web", StackType::Node),
            "web".to_string(),
            String::new(),
            Utc::now(),
        );
        record.mark_partial_failure(
            Operation::Update,
            ReconcileStep::Workload,
            "boom".to_string(),
            Utc::now(),
        );
        assert!(!record.orchestration_complete);

        record.mark_ready(Utc::now());
        assert_eq!(record.phase, JobPhase::Ready);
        assert!(record.failure.is_none());
        assert!(record.orchestration_complete);
        assert_eq!(record.pending_operation(), None);
    }
}
