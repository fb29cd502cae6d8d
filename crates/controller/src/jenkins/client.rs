//! # Jenkins REST client
//!
//! Talks to the Jenkins JSON API using basic auth with a user API token.
//! Idempotent calls (reads, config updates, deletes) are retried with
//! exponential backoff on transport errors, 5xx and 429. Job creation and
//! build triggers are sent exactly once.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{redirect, Client as HttpClient, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use super::models::{
    JenkinsBuild, JenkinsBuildList, JenkinsJob, JenkinsJobList, BUILDS_TREE, JOB_LIST_TREE,
    JOB_TREE,
};
use super::{BuildServer, JobSummary, TriggerOutcome};
use crate::config::{JenkinsConfig, RetryConfig};
use crate::error::BuildServerError;
use crate::model::{BuildRecord, BuildSnapshot};

const USER_AGENT: &str = "cloudops-controller/0.1";
const ERROR_HEADER: &str = "X-Error";
const MAX_ERROR_BODY: usize = 512;

/// Backoff schedule for idempotent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// A single attempt, no retries.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before attempt `attempt + 1` (attempts start at 1).
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// Jenkins API client
#[derive(Clone)]
pub struct JenkinsClient {
    http: HttpClient,
    base_url: Url,
    username: String,
    api_token: Option<String>,
    retry: RetryPolicy,
}

impl JenkinsClient {
    pub fn new(
        base_url: &str,
        username: &str,
        api_token: Option<String>,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Result<Self, BuildServerError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| BuildServerError::Config(format!("invalid jenkins url '{base_url}': {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(BuildServerError::Config(format!(
                "jenkins url '{base_url}' cannot be used as a base"
            )));
        }

        let http = HttpClient::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| BuildServerError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            base_url,
            username: username.to_string(),
            api_token,
            retry,
        })
    }

    /// Build from config, reading the API token from the configured env var.
    pub fn from_config(config: &JenkinsConfig) -> Result<Self, BuildServerError> {
        let api_token = std::env::var(&config.api_token_env).ok();
        if api_token.is_none() {
            warn!(
                "{} is not set; Jenkins requests will be sent without credentials",
                config.api_token_env
            );
        }
        Self::new(
            &config.url,
            &config.username,
            api_token,
            Duration::from_secs(config.request_timeout_secs),
            RetryPolicy::from_config(&config.retry),
        )
    }

    /// URL of `segments` below the base URL; segments are percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, BuildServerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| BuildServerError::Config(format!("bad base url {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// `job/<a>/job/<b>/...` for a (possibly folder-qualified) job ID, then `tail`.
    fn job_endpoint(&self, job_id: &str, tail: &[&str]) -> Result<Url, BuildServerError> {
        let mut segments: Vec<&str> = Vec::new();
        for part in job_id.split('/').filter(|part| !part.is_empty()) {
            segments.push("job");
            segments.push(part);
        }
        segments.extend_from_slice(tail);
        self.endpoint(&segments)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.api_token {
            Some(token) => builder.basic_auth(&self.username, Some(token)),
            None => builder,
        }
    }

    /// Send a request that is safe to repeat.
    async fn send_idempotent<F>(&self, resource: &str, make: F) -> Result<Response, BuildServerError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let retryable = attempt < self.retry.max_attempts;
            match make().send().await {
                Ok(response)
                    if retryable
                        && (response.status().is_server_error()
                            || response.status() == StatusCode::TOO_MANY_REQUESTS) =>
                {
                    warn!(
                        "Jenkins returned {} for {} (attempt {}/{}), retrying",
                        response.status(),
                        resource,
                        attempt,
                        self.retry.max_attempts
                    );
                }
                Ok(response) => return Ok(response),
                Err(e) if retryable && (e.is_connect() || e.is_timeout()) => {
                    warn!(
                        "Jenkins request for {} failed (attempt {}/{}): {}",
                        resource, attempt, self.retry.max_attempts, e
                    );
                }
                Err(source) => {
                    return Err(BuildServerError::Http {
                        resource: resource.to_string(),
                        source,
                    })
                }
            }
            sleep(self.retry.backoff(attempt)).await;
            attempt += 1;
        }
    }

    /// Send a request exactly once.
    async fn send_once(
        &self,
        resource: &str,
        request: RequestBuilder,
    ) -> Result<Response, BuildServerError> {
        request.send().await.map_err(|source| BuildServerError::Http {
            resource: resource.to_string(),
            source,
        })
    }

    /// Map non-success statuses onto errors. Redirects count as success.
    async fn check(resource: &str, response: Response) -> Result<Response, BuildServerError> {
        let status = response.status();
        if status.is_success() || status.is_redirection() {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BuildServerError::NotFound {
                resource: resource.to_string(),
            });
        }
        Err(Self::api_error(resource, response).await)
    }

    async fn api_error(resource: &str, response: Response) -> BuildServerError {
        let status = response.status();
        let header_message = response
            .headers()
            .get(ERROR_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let message = match header_message {
            Some(message) => message,
            None => {
                let body = response.text().await.unwrap_or_default();
                let body = body.trim();
                if body.is_empty() || body.starts_with('<') {
                    status.canonical_reason().unwrap_or("error").to_string()
                } else {
                    body.chars().take(MAX_ERROR_BODY).collect()
                }
            }
        };
        BuildServerError::Api {
            resource: resource.to_string(),
            status: status.as_u16(),
            message,
        }
    }

    async fn read_json<T: DeserializeOwned>(
        resource: &str,
        response: Response,
    ) -> Result<T, BuildServerError> {
        let bytes = response.bytes().await.map_err(|source| BuildServerError::Http {
            resource: resource.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| BuildServerError::Decode {
            resource: resource.to_string(),
            message: e.to_string(),
        })
    }

    async fn read_text(resource: &str, response: Response) -> Result<String, BuildServerError> {
        response.text().await.map_err(|source| BuildServerError::Http {
            resource: resource.to_string(),
            source,
        })
    }

    async fn fetch_job(&self, job_id: &str) -> Result<JenkinsJob, BuildServerError> {
        let resource = format!("job '{job_id}'");
        let url = self.job_endpoint(job_id, &["api", "json"])?;
        let response = self
            .send_idempotent(&resource, || {
                self.request(Method::GET, url.clone())
                    .query(&[("tree", JOB_TREE)])
            })
            .await?;
        let response = Self::check(&resource, response).await?;
        Self::read_json(&resource, response).await
    }

    fn summarize(job: JenkinsJob) -> JobSummary {
        let latest = job.snapshot();
        JobSummary {
            id: job.name.clone(),
            name: job.name,
            url: job.url,
            description: job.description.filter(|d| !d.is_empty()),
            latest,
        }
    }
}

#[async_trait]
impl BuildServer for JenkinsClient {
    #[instrument(skip(self))]
    async fn list_jobs(
        &self,
        name_filter: Option<String>,
    ) -> Result<Vec<JobSummary>, BuildServerError> {
        let resource = "job list";
        let url = self.endpoint(&["api", "json"])?;
        let response = self
            .send_idempotent(resource, || {
                self.request(Method::GET, url.clone())
                    .query(&[("tree", JOB_LIST_TREE)])
            })
            .await?;
        let response = Self::check(resource, response).await?;
        let list: JenkinsJobList = Self::read_json(resource, response).await?;

        let jobs: Vec<JobSummary> = list
            .jobs
            .into_iter()
            .filter(|job| {
                name_filter
                    .as_deref()
                    .map_or(true, |filter| job.name.contains(filter))
            })
            .map(Self::summarize)
            .collect();
        debug!("Listed {} Jenkins jobs", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: &str) -> Result<JobSummary, BuildServerError> {
        self.fetch_job(job_id).await.map(Self::summarize)
    }

    #[instrument(skip(self))]
    async fn get_job_definition(&self, job_id: &str) -> Result<String, BuildServerError> {
        let resource = format!("job '{job_id}' definition");
        let url = self.job_endpoint(job_id, &["config.xml"])?;
        let response = self
            .send_idempotent(&resource, || self.request(Method::GET, url.clone()))
            .await?;
        let response = Self::check(&resource, response).await?;
        Self::read_text(&resource, response).await
    }

    #[instrument(skip(self, definition))]
    async fn create_job(&self, name: &str, definition: &str) -> Result<String, BuildServerError> {
        let resource = format!("job '{name}'");
        let url = self.endpoint(&["createItem"])?;
        let request = self
            .request(Method::POST, url)
            .query(&[("name", name)])
            .header(CONTENT_TYPE, "application/xml")
            .body(definition.to_string());
        let response = self.send_once(&resource, request).await?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            info!("Created Jenkins job {}", name);
            return Ok(name.to_string());
        }

        let already_exists = status == StatusCode::BAD_REQUEST
            && response
                .headers()
                .get(ERROR_HEADER)
                .and_then(|value| value.to_str().ok())
                .is_some_and(|message| message.contains("already exists"));
        if already_exists {
            return Err(BuildServerError::AlreadyExists { resource });
        }
        Err(Self::api_error(&resource, response).await)
    }

    #[instrument(skip(self, definition))]
    async fn update_job(&self, job_id: &str, definition: &str) -> Result<(), BuildServerError> {
        let resource = format!("job '{job_id}'");
        let url = self.job_endpoint(job_id, &["config.xml"])?;
        let response = self
            .send_idempotent(&resource, || {
                self.request(Method::POST, url.clone())
                    .header(CONTENT_TYPE, "application/xml")
                    .body(definition.to_string())
            })
            .await?;
        Self::check(&resource, response).await?;
        info!("Updated Jenkins job {}", job_id);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_job(&self, job_id: &str) -> Result<(), BuildServerError> {
        let resource = format!("job '{job_id}'");
        let url = self.job_endpoint(job_id, &["doDelete"])?;
        let response = self
            .send_idempotent(&resource, || self.request(Method::POST, url.clone()))
            .await?;
        match Self::check(&resource, response).await {
            Ok(_) => {
                info!("Deleted Jenkins job {}", job_id);
                Ok(())
            }
            Err(BuildServerError::NotFound { .. }) => {
                debug!("Jenkins job {} already absent", job_id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self))]
    async fn trigger_build(&self, job_id: &str) -> Result<TriggerOutcome, BuildServerError> {
        let resource = format!("job '{job_id}' build");
        let url = self.job_endpoint(job_id, &["build"])?;
        let response = self
            .send_once(&resource, self.request(Method::POST, url))
            .await?;

        let status = response.status();
        if status.is_success() || status.is_redirection() {
            let queue_url = response
                .headers()
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string);
            info!("Triggered build of Jenkins job {}", job_id);
            return Ok(TriggerOutcome::Accepted { queue_url });
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BuildServerError::NotFound {
                resource: format!("job '{job_id}'"),
            });
        }
        if status == StatusCode::CONFLICT || status == StatusCode::BAD_REQUEST {
            let reason = match Self::api_error(&resource, response).await {
                BuildServerError::Api { message, .. } => message,
                other => other.to_string(),
            };
            warn!("Jenkins refused build of {}: {}", job_id, reason);
            return Ok(TriggerOutcome::Rejected { reason });
        }
        Err(Self::api_error(&resource, response).await)
    }

    #[instrument(skip(self))]
    async fn latest_build_status(&self, job_id: &str) -> Result<BuildSnapshot, BuildServerError> {
        self.fetch_job(job_id).await.map(|job| job.snapshot())
    }

    #[instrument(skip(self))]
    async fn list_builds(&self, job_id: &str) -> Result<Vec<BuildRecord>, BuildServerError> {
        let resource = format!("job '{job_id}' builds");
        let url = self.job_endpoint(job_id, &["api", "json"])?;
        let response = self
            .send_idempotent(&resource, || {
                self.request(Method::GET, url.clone())
                    .query(&[("tree", BUILDS_TREE)])
            })
            .await?;
        let response = Self::check(&resource, response).await?;
        let list: JenkinsBuildList = Self::read_json(&resource, response).await?;
        let mut builds: Vec<BuildRecord> = list
            .builds
            .into_iter()
            .map(|build| build.into_record(job_id))
            .collect();
        builds.sort_by(|a, b| b.number.cmp(&a.number));
        Ok(builds)
    }

    #[instrument(skip(self))]
    async fn get_build(&self, job_id: &str, number: u64) -> Result<BuildRecord, BuildServerError> {
        let resource = format!("build #{number} of job '{job_id}'");
        let number_segment = number.to_string();
        let url = self.job_endpoint(job_id, &[&number_segment, "api", "json"])?;
        let response = self
            .send_idempotent(&resource, || self.request(Method::GET, url.clone()))
            .await?;
        let response = Self::check(&resource, response).await?;
        let build: JenkinsBuild = Self::read_json(&resource, response).await?;
        Ok(build.into_record(job_id))
    }

    #[instrument(skip(self))]
    async fn build_log(&self, job_id: &str, number: u64) -> Result<String, BuildServerError> {
        let resource = format!("log of build #{number} of job '{job_id}'");
        let number_segment = number.to_string();
        let url = self.job_endpoint(job_id, &[&number_segment, "consoleText"])?;
        let response = self
            .send_idempotent(&resource, || self.request(Method::GET, url.clone()))
            .await?;
        let response = Self::check(&resource, response).await?;
        Self::read_text(&resource, response).await
    }
}
