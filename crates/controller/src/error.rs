//! Error types for the controller.
//!
//! Each external boundary has its own error enum. [`Error`] composes them and
//! adds the failures produced by reconciliation itself.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cluster::ResourceKind;
use crate::model::{BuildStatus, ConfigMode, JobPhase, Operation, ReconcileStep};
use crate::naming::JobNameError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// External systems the controller talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExternalSystem {
    BuildServer,
    Orchestrator,
    CredentialStore,
    JobStore,
}

impl fmt::Display for ExternalSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExternalSystem::BuildServer => f.write_str("jenkins"),
            ExternalSystem::Orchestrator => f.write_str("kubernetes"),
            ExternalSystem::CredentialStore => f.write_str("credential store"),
            ExternalSystem::JobStore => f.write_str("job store"),
        }
    }
}

/// Input rejected before any remote call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid {field} '{name}': {reason}")]
    Name {
        field: &'static str,
        name: String,
        reason: JobNameError,
    },

    #[error("{mode} configuration is missing {field}")]
    MissingField {
        mode: ConfigMode,
        field: &'static str,
    },

    #[error("invalid {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("{field} cannot change after the job is created (is '{existing}', requested '{requested}')")]
    ImmutableField {
        field: &'static str,
        existing: String,
        requested: String,
    },

    #[error("custom job definition is not well-formed: {0}")]
    MalformedDocument(String),
}

#[derive(Debug, Error)]
pub enum BuildServerError {
    #[error("jenkins request for {resource} failed: {source}")]
    Http {
        resource: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("jenkins rejected the request for {resource} (HTTP {status}): {message}")]
    Api {
        resource: String,
        status: u16,
        message: String,
    },

    #[error("jenkins {resource} not found")]
    NotFound { resource: String },

    #[error("jenkins {resource} already exists")]
    AlreadyExists { resource: String },

    #[error("jenkins returned an unreadable response for {resource}: {message}")]
    Decode { resource: String, message: String },

    #[error("jenkins client configuration error: {0}")]
    Config(String),
}

impl BuildServerError {
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, BuildServerError::NotFound { .. })
    }
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("kubernetes {kind} '{name}': {source}")]
    Kube {
        kind: ResourceKind,
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("kubernetes {kind} '{name}' exists but is not managed by cloudops")]
    NotOwned { kind: ResourceKind, name: String },

    #[error("kubernetes {kind} '{name}' was rejected: {message}")]
    Rejected {
        kind: ResourceKind,
        name: String,
        message: String,
    },

    #[error("kubernetes {kind} resources are read-only")]
    ReadOnly { kind: ResourceKind },

    #[error("failed to build kubernetes {kind} '{name}' manifest: {source}")]
    Manifest {
        kind: ResourceKind,
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl OrchestratorError {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            OrchestratorError::Kube { kind, .. }
            | OrchestratorError::NotOwned { kind, .. }
            | OrchestratorError::Rejected { kind, .. }
            | OrchestratorError::ReadOnly { kind }
            | OrchestratorError::Manifest { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential '{0}' not found")]
    NotFound(String),

    #[error("credential name '{0}' is already in use")]
    NameTaken(String),

    #[error("credential store (kubernetes secret '{name}'): {source}")]
    Kube {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("credential store: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job store (configmap '{name}'): {source}")]
    Kube {
        name: String,
        #[source]
        source: kube::Error,
    },

    #[error("job store record for '{job}' is unreadable: {source}")]
    Corrupt {
        job: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("job store record for '{job}' kept changing; gave up after {attempts} attempts")]
    Conflict { job: String, attempts: usize },
}

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("failed to register template '{name}': {message}")]
    Register { name: &'static str, message: String },

    #[error("failed to render template '{name}': {message}")]
    Render { name: &'static str, message: String },

    #[error("failed to read template override '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("pipeline job '{0}' not found")]
    JobNotFound(String),

    #[error("pipeline job '{0}' already exists")]
    JobExists(String),

    #[error("cannot {operation} pipeline job '{job}' while it is {phase}")]
    InvalidState {
        job: String,
        operation: Operation,
        phase: JobPhase,
    },

    #[error("a build of '{job}' is already {status}")]
    BuildInProgress { job: String, status: BuildStatus },

    #[error("jenkins refused to start a build of '{job}': {reason}")]
    BuildRejected { job: String, reason: String },

    #[error("credential '{id}' is referenced by pipeline job(s): {}", .jobs.join(", "))]
    CredentialInUse { id: String, jobs: Vec<String> },

    #[error(transparent)]
    BuildServer(#[from] BuildServerError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error("{operation} of '{job}' was interrupted before it finished")]
    Interrupted { job: String, operation: Operation },

    #[error("{operation} of '{job}' stopped at {step} ({system}): {source}")]
    PartialFailure {
        job: String,
        operation: Operation,
        step: ReconcileStep,
        system: ExternalSystem,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// The external system the failure came from, if any.
    #[must_use]
    pub fn system(&self) -> Option<ExternalSystem> {
        match self {
            Error::BuildServer(_) | Error::BuildRejected { .. } => Some(ExternalSystem::BuildServer),
            Error::Orchestrator(_) => Some(ExternalSystem::Orchestrator),
            Error::Credential(_) => Some(ExternalSystem::CredentialStore),
            Error::Store(_) => Some(ExternalSystem::JobStore),
            Error::PartialFailure { system, .. } => Some(*system),
            _ => None,
        }
    }

    /// The resource kind involved, for orchestrator failures.
    #[must_use]
    pub fn resource_kind(&self) -> Option<ResourceKind> {
        match self {
            Error::Orchestrator(err) => Some(err.kind()),
            Error::PartialFailure { source, .. } => source.resource_kind(),
            _ => None,
        }
    }

    /// Short machine-readable code used in API responses.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(ValidationError::Name { .. }) => "invalid-name",
            Error::Validation(ValidationError::ImmutableField { .. }) => "immutable-field",
            Error::Validation(_) => "invalid-config",
            Error::JobNotFound(_) => "job-not-found",
            Error::JobExists(_) => "job-exists",
            Error::InvalidState { .. } => "invalid-state",
            Error::BuildInProgress { .. } => "build-in-progress",
            Error::BuildRejected { .. } => "build-rejected",
            Error::CredentialInUse { .. } => "credential-in-use",
            Error::Credential(CredentialError::NotFound(_)) => "credential-not-found",
            Error::Credential(CredentialError::NameTaken(_)) => "credential-exists",
            Error::PartialFailure { .. } => "partial-failure",
            Error::Interrupted { .. } => "interrupted",
            Error::Template(_) => "template-error",
            Error::BuildServer(_)
            | Error::Orchestrator(_)
            | Error::Credential(_)
            | Error::Store(_) => "upstream-error",
        }
    }

    pub(crate) fn partial(
        job: &str,
        operation: Operation,
        step: ReconcileStep,
        source: Error,
    ) -> Self {
        let system = step.system();
        Error::PartialFailure {
            job: job.to_string(),
            operation,
            step,
            system,
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_failure_names_system_and_kind() {
        let err = Error::partial(
            "web",
            Operation::Create,
            ReconcileStep::Endpoint,
            OrchestratorError::Rejected {
                kind: ResourceKind::Endpoint,
                name: "web-svc".to_string(),
                message: "quota exceeded".to_string(),
            }
            .into(),
        );

        let message = err.to_string();
        assert!(message.contains("kubernetes"), "{message}");
        assert!(message.contains("endpoint"), "{message}");
        assert!(message.contains("web-svc"), "{message}");
        assert_eq!(err.system(), Some(ExternalSystem::Orchestrator));
        assert_eq!(err.resource_kind(), Some(ResourceKind::Endpoint));
        assert_eq!(err.code(), "partial-failure");
    }

    #[test]
    fn credential_in_use_lists_jobs() {
        let err = Error::CredentialInUse {
            id: "c-1".to_string(),
            jobs: vec!["api".to_string(), "web".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "credential 'c-1' is referenced by pipeline job(s): api, web"
        );
    }
}
