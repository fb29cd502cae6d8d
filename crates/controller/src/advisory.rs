//! Best-effort advisory summaries of pipeline configs.
//!
//! The summary is display text only. Nothing in reconciliation reads it, and
//! every failure collapses into [`Advisory::Unavailable`].

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::config::AdvisoryConfig;
use crate::model::{JobDefinition, PipelineConfig};

const UNAVAILABLE_TEXT: &str = "Advisory summary is currently unavailable.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "text", rename_all = "kebab-case")]
pub enum Advisory {
    Ready(String),
    Unavailable(String),
}

impl Advisory {
    #[must_use]
    pub fn unavailable() -> Self {
        Advisory::Unavailable(UNAVAILABLE_TEXT.to_string())
    }

    #[must_use]
    pub fn text(&self) -> &str {
        match self {
            Advisory::Ready(text) | Advisory::Unavailable(text) => text,
        }
    }
}

#[async_trait]
pub trait AdvisoryService: Send + Sync {
    async fn summarize(&self, config: &PipelineConfig) -> Advisory;
}

/// Used when no advisory endpoint is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledAdvisor;

#[async_trait]
impl AdvisoryService for DisabledAdvisor {
    async fn summarize(&self, _config: &PipelineConfig) -> Advisory {
        Advisory::unavailable()
    }
}

#[derive(Debug, Error)]
enum AdvisoryError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("endpoint returned HTTP {status}: {message}")]
    Api { status: u16, message: String },

    #[error("response contained no summary")]
    Empty,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Advisor backed by an OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionAdvisor {
    client: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl ChatCompletionAdvisor {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(concat!("cloudops-controller/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            model: model.into(),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }

    async fn request(&self, config: &PipelineConfig) -> Result<String, AdvisoryError> {
        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You review CI/CD pipeline settings. Reply with two or three short sentences of practical advice.",
                },
                { "role": "user", "content": prompt(config) },
            ],
            "max_tokens": 200,
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(AdvisoryError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let completion: ChatCompletion = response.json().await?;
        completion
            .choices
            .into_iter()
            .find_map(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(AdvisoryError::Empty)
    }
}

#[async_trait]
impl AdvisoryService for ChatCompletionAdvisor {
    #[instrument(skip(self, config), fields(job = %config.name))]
    async fn summarize(&self, config: &PipelineConfig) -> Advisory {
        match self.request(config).await {
            Ok(text) => {
                debug!("Advisory summary ready ({} chars)", text.len());
                Advisory::Ready(text)
            }
            Err(e) => {
                warn!("Advisory summary failed: {}", e);
                Advisory::unavailable()
            }
        }
    }
}

/// Advisor for the given settings; falls back to [`DisabledAdvisor`].
#[must_use]
pub fn from_config(config: &AdvisoryConfig) -> Arc<dyn AdvisoryService> {
    if !config.enabled {
        return Arc::new(DisabledAdvisor);
    }
    let api_key = std::env::var(&config.api_key_env).ok();
    match ChatCompletionAdvisor::new(
        &config.endpoint,
        &config.model,
        api_key,
        Duration::from_secs(config.timeout_secs),
    ) {
        Ok(advisor) => Arc::new(advisor),
        Err(e) => {
            warn!("Advisory client unavailable, summaries disabled: {}", e);
            Arc::new(DisabledAdvisor)
        }
    }
}

/// Describe a config without credentials or embedded userinfo.
fn prompt(config: &PipelineConfig) -> String {
    let mut lines = vec![
        format!("Job: {}", config.name),
        format!("Stack: {}", config.stack),
        format!("Mode: {}", config.mode()),
        format!("Image: {}", config.image_name()),
        format!("Container port: {}", config.container_port()),
        format!("Replicas: {}", config.runtime.replicas),
    ];
    match &config.definition {
        JobDefinition::Standard(standard) => {
            lines.push(format!(
                "Repository: {}",
                strip_userinfo(&standard.source.repository_url)
            ));
            lines.push(format!("Branch: {}", standard.source.branch));
        }
        JobDefinition::Custom(custom) => {
            lines.push(format!(
                "Custom job definition of {} bytes",
                custom.document.len()
            ));
        }
    }
    lines.join("\n")
}

fn strip_userinfo(url: &str) -> String {
    match url.split_once("://") {
        Some((scheme, rest)) => {
            let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
            let host = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
            if path.is_empty() {
                format!("{scheme}://{host}")
            } else {
                format!("{scheme}://{host}/{path}")
            }
        }
        None => url.to_string(),
    }
}
