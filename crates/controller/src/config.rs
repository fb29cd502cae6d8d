//! Controller configuration
//!
//! Loaded from a YAML file mounted from a `ConfigMap`. Every section has
//! defaults so a partial file (or no file) still yields a usable config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default location of the mounted config file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable overriding [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "CLOUDOPS_CONFIG_PATH";

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Jenkins connection settings
    pub jenkins: JenkinsConfig,

    /// Kubernetes placement settings
    pub kubernetes: KubernetesConfig,

    /// Image registry used by generated pipelines
    pub registry: RegistryConfig,

    /// Background build tracking
    pub tracker: TrackerConfig,

    /// Template override directory
    pub templates: TemplatesConfig,

    /// Job record persistence
    pub store: StoreConfig,

    /// Credential persistence
    pub credentials: CredentialsConfig,

    /// Optional advisory text service
    pub advisory: AdvisoryConfig,

    /// HTTP listener
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct JenkinsConfig {
    /// Base URL, e.g. `https://jenkins.example.com/`
    pub url: String,

    pub username: String,

    /// Environment variable holding the API token
    pub api_token_env: String,

    pub request_timeout_secs: u64,

    pub retry: RetryConfig,
}

impl Default for JenkinsConfig {
    fn default() -> Self {
        Self {
            url: "http://jenkins:8080/".to_string(),
            username: "admin".to_string(),
            api_token_env: "JENKINS_API_TOKEN".to_string(),
            request_timeout_secs: 30,
            retry: RetryConfig::default(),
        }
    }
}

/// Retry policy for idempotent Jenkins calls
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct KubernetesConfig {
    /// Namespace holding workloads, records and credential secrets
    pub namespace: String,

    /// Routing rules use `{job}.{ingressDomain}` as host
    pub ingress_domain: String,

    pub ingress_class_name: Option<String>,

    /// Jenkins file credential holding the kubeconfig used for rollouts
    pub kubeconfig_credential_id: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            ingress_domain: "apps.local".to_string(),
            ingress_class_name: None,
            kubeconfig_credential_id: "kubeconfig".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Registry host, e.g. `registry.example.com`
    pub url: String,

    /// Project/directory inside the registry
    pub directory: String,

    /// Jenkins credential used to push images
    pub credential_id: String,

    /// Image pull secret attached to workloads
    pub pull_secret: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            url: "registry.local".to_string(),
            directory: "cloudops".to_string(),
            credential_id: "registry".to_string(),
            pull_secret: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TrackerConfig {
    pub poll_interval_secs: u64,

    /// Polls before the tracker gives up and reports a timeout
    pub max_polls: u32,

    /// Consecutive failed polls before the status is reported unavailable
    pub max_consecutive_failures: u32,

    /// Start tracking automatically after a triggered build
    pub auto_track: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            max_polls: 60,
            max_consecutive_failures: 3,
            auto_track: true,
        }
    }
}

impl TrackerConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplatesConfig {
    /// Directory whose `.hbs` files replace the built-in templates
    pub directory: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StoreBackend {
    #[default]
    Memory,
    ConfigMap,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    pub backend: StoreBackend,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialBackend {
    #[default]
    Memory,
    Secret,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CredentialsConfig {
    pub backend: CredentialBackend,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdvisoryConfig {
    pub enabled: bool,

    /// OpenAI-compatible chat completions endpoint
    pub endpoint: String,

    pub model: String,

    pub api_key_env: String,

    pub timeout_secs: u64,
}

impl Default for AdvisoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "https://api.openai.com/v1/chat/completions".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key_env: "ADVISORY_API_KEY".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl ControllerConfig {
    /// Load from `CLOUDOPS_CONFIG_PATH` or the default mount path.
    ///
    /// A missing file yields the defaults; an unreadable or invalid one is an error.
    pub fn load() -> Result<Self, anyhow::Error> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        if Path::new(&path).exists() {
            info!("Loading configuration from {}", path);
            Self::from_mounted_file(&path)
        } else {
            warn!("Config file {} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if reqwest::Url::parse(&self.jenkins.url).is_err() {
            return Err(anyhow::anyhow!(
                "jenkins.url '{}' is not a valid URL",
                self.jenkins.url
            ));
        }
        if self.jenkins.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!("jenkins.retry.maxAttempts must be at least 1"));
        }
        if self.kubernetes.namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("kubernetes.namespace must not be empty"));
        }
        if self.kubernetes.ingress_domain.trim().is_empty() {
            return Err(anyhow::anyhow!("kubernetes.ingressDomain must not be empty"));
        }
        if self.registry.url.trim().is_empty() || self.registry.directory.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "registry.url and registry.directory must both be set"
            ));
        }
        if self.tracker.max_polls == 0 || self.tracker.max_consecutive_failures == 0 {
            return Err(anyhow::anyhow!(
                "tracker.maxPolls and tracker.maxConsecutiveFailures must be at least 1"
            ));
        }
        if self.advisory.enabled && self.advisory.endpoint.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "advisory.endpoint must be set when advisory is enabled"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = r"
jenkins:
  url: https://ci.example.com/
  username: deployer
kubernetes:
  namespace: apps
  ingressDomain: apps.example.com
tracker:
  maxPolls: 10
store:
  backend: configMap
";
        let config: ControllerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.jenkins.username, "deployer");
        assert_eq!(config.jenkins.api_token_env, "JENKINS_API_TOKEN");
        assert_eq!(config.jenkins.retry.max_attempts, 3);
        assert_eq!(config.kubernetes.namespace, "apps");
        assert_eq!(config.tracker.max_polls, 10);
        assert_eq!(config.tracker.poll_interval_secs, 5);
        assert!(config.tracker.auto_track);
        assert_eq!(config.store.backend, StoreBackend::ConfigMap);
        assert_eq!(config.credentials.backend, CredentialBackend::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = ControllerConfig::default();
        assert!(config.validate().is_ok());

        config.jenkins.url = "not a url".to_string();
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.tracker.max_polls = 0;
        assert!(config.validate().is_err());

        let mut config = ControllerConfig::default();
        config.advisory.enabled = true;
        config.advisory.endpoint = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn load_reads_path_from_environment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "server:\n  listenAddr: 127.0.0.1:9000").unwrap();

        std::env::set_var(CONFIG_PATH_ENV, &path);
        let config = ControllerConfig::load().unwrap();
        std::env::remove_var(CONFIG_PATH_ENV);

        assert_eq!(config.server.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    #[serial]
    fn load_falls_back_to_defaults_when_missing() {
        std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/cloudops/config.yaml");
        let config = ControllerConfig::load().unwrap();
        std::env::remove_var(CONFIG_PATH_ENV);

        assert_eq!(config.kubernetes.namespace, "default");
    }
}
