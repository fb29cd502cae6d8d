//! Build-server boundary.
//!
//! [`BuildServer`] is the narrow surface the reconciliation engine and the
//! build tracker need. [`JenkinsClient`] implements it against the Jenkins
//! REST API.

pub mod client;
pub mod models;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::BuildServerError;
use crate::model::{BuildRecord, BuildSnapshot};

pub use client::{JenkinsClient, RetryPolicy};
pub use models::normalize_status;

/// A job as listed by the build server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSummary {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub latest: BuildSnapshot,
}

/// Result of asking the build server to start a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted { queue_url: Option<String> },
    Rejected { reason: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BuildServer: Send + Sync {
    async fn list_jobs(
        &self,
        name_filter: Option<String>,
    ) -> Result<Vec<JobSummary>, BuildServerError>;

    async fn get_job(&self, job_id: &str) -> Result<JobSummary, BuildServerError>;

    /// Raw job definition document currently stored on the server.
    async fn get_job_definition(&self, job_id: &str) -> Result<String, BuildServerError>;

    /// Create a job; returns its ID.
    async fn create_job(&self, name: &str, definition: &str) -> Result<String, BuildServerError>;

    async fn update_job(&self, job_id: &str, definition: &str) -> Result<(), BuildServerError>;

    /// Delete a job. A job that is already gone counts as deleted.
    async fn delete_job(&self, job_id: &str) -> Result<(), BuildServerError>;

    async fn trigger_build(&self, job_id: &str) -> Result<TriggerOutcome, BuildServerError>;

    async fn latest_build_status(&self, job_id: &str) -> Result<BuildSnapshot, BuildServerError>;

    /// Build history, newest first.
    async fn list_builds(&self, job_id: &str) -> Result<Vec<BuildRecord>, BuildServerError>;

    async fn get_build(&self, job_id: &str, number: u64) -> Result<BuildRecord, BuildServerError>;

    /// Console output of one build.
    async fn build_log(&self, job_id: &str, number: u64) -> Result<String, BuildServerError>;
}
