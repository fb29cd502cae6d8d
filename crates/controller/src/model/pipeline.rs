//! Pipeline configuration submitted by callers.
//!
//! A [`PipelineConfig`] is the desired state of one pipeline job. Its job
//! definition is either generated from structured fields (`STANDARD`) or
//! supplied verbatim as a Jenkins `config.xml` document (`CUSTOM`).

use crate::error::ValidationError;
use crate::naming::JobNameValidator;
use crate::templates::markup;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

lazy_static! {
    static ref IMAGE_NAME: Regex = Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").unwrap();
    static ref REPOSITORY_URL: Regex =
        Regex::new(r"^(?:(?:https?|ssh|git)://\S+|[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:\S+)$").unwrap();
}

const MAX_REPLICAS: i32 = 50;

/// Language runtime a pipeline builds. Fixed once the job exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StackType {
    Node,
    Java,
    Python,
}

impl StackType {
    pub const ALL: [StackType; 3] = [StackType::Node, StackType::Java, StackType::Python];

    /// Port the container listens on when the caller leaves it unset.
    ///
    /// Node builds ship a static bundle behind nginx, so they listen on 80.
    #[must_use]
    pub fn default_container_port(self) -> u16 {
        match self {
            StackType::Node => 80,
            StackType::Java | StackType::Python => 8080,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StackType::Node => "node",
            StackType::Java => "java",
            StackType::Python => "python",
        }
    }
}

impl fmt::Display for StackType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StackType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "node" | "nodejs" => Ok(StackType::Node),
            "java" => Ok(StackType::Java),
            "python" => Ok(StackType::Python),
            other => Err(ValidationError::InvalidField {
                field: "stack",
                message: format!("unsupported stack '{other}' (expected node, java or python)"),
            }),
        }
    }
}

/// Which input drives the job definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigMode {
    Standard,
    Custom,
}

impl fmt::Display for ConfigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigMode::Standard => f.write_str("STANDARD"),
            ConfigMode::Custom => f.write_str("CUSTOM"),
        }
    }
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_dockerfile_path() -> String {
    "./Dockerfile".to_string()
}

fn default_context_directory() -> String {
    ".".to_string()
}

fn default_replicas() -> i32 {
    1
}

/// Where the source comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceSettings {
    /// Git repository URL (https, ssh or scp-like form)
    #[serde(default)]
    pub repository_url: String,

    /// Branch or ref to build
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Credential ID (from the credential store) used for checkout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_id: Option<String>,
}

/// Image build parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageSettings {
    /// Image name inside the registry directory; defaults to the job name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default = "default_dockerfile_path")]
    pub dockerfile_path: String,

    /// Docker build context directory
    #[serde(default = "default_context_directory")]
    pub context_directory: String,

    /// Subdirectory holding the project in a monorepo
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_directory: Option<String>,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            name: None,
            dockerfile_path: default_dockerfile_path(),
            context_directory: default_context_directory(),
            build_directory: None,
        }
    }
}

/// Runtime parameters of the deployed workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSettings {
    /// Container port; unset means the stack default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u16>,

    #[serde(default = "default_replicas")]
    pub replicas: i32,

    /// Path prefix for the routing rule; unset routes `/`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_prefix: Option<String>,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            container_port: None,
            replicas: default_replicas(),
            path_prefix: None,
        }
    }
}

/// Structured input for template rendering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandardConfig {
    pub source: SourceSettings,

    /// Extra `NODE_OPTIONS` for node builds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_options: Option<String>,
}

/// A caller-supplied job definition document, used verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomConfig {
    pub document: String,
}

/// Job definition input, tagged by configuration mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobDefinition {
    Standard(StandardConfig),
    Custom(CustomConfig),
}

impl JobDefinition {
    #[must_use]
    pub fn mode(&self) -> ConfigMode {
        match self {
            JobDefinition::Standard(_) => ConfigMode::Standard,
            JobDefinition::Custom(_) => ConfigMode::Custom,
        }
    }
}

/// Desired state of one pipeline job and its deployed workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Job identity; shared by the Jenkins job and every cluster resource
    pub name: String,

    pub stack: StackType,

    pub definition: JobDefinition,

    #[serde(default)]
    pub image: ImageSettings,

    #[serde(default)]
    pub runtime: RuntimeSettings,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PipelineConfig {
    #[must_use]
    pub fn mode(&self) -> ConfigMode {
        self.definition.mode()
    }

    /// Image name, falling back to the job name.
    #[must_use]
    pub fn image_name(&self) -> &str {
        self.image
            .name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.name)
    }

    /// Container port with the stack default applied only when unset.
    #[must_use]
    pub fn container_port(&self) -> u16 {
        self.runtime
            .container_port
            .unwrap_or_else(|| self.stack.default_container_port())
    }

    /// Credential referenced for source checkout, if any.
    #[must_use]
    pub fn credential_id(&self) -> Option<&str> {
        match &self.definition {
            JobDefinition::Standard(standard) => standard
                .source
                .credential_id
                .as_deref()
                .filter(|id| !id.trim().is_empty()),
            JobDefinition::Custom(_) => None,
        }
    }

    /// Check the job name and that every field the mode needs is present.
    pub fn validate(&self) -> Result<(), ValidationError> {
        JobNameValidator::check(&self.name)?;

        let image_name = self.image_name();
        if !IMAGE_NAME.is_match(image_name) {
            return Err(ValidationError::InvalidField {
                field: "image.name",
                message: format!(
                    "'{image_name}' is not a valid image name (lowercase letters, digits and . _ - separators)"
                ),
            });
        }

        if self.image.dockerfile_path.trim().is_empty() {
            return Err(ValidationError::MissingField {
                mode: self.mode(),
                field: "image.dockerfilePath",
            });
        }

        if self.runtime.replicas < 0 || self.runtime.replicas > MAX_REPLICAS {
            return Err(ValidationError::InvalidField {
                field: "runtime.replicas",
                message: format!(
                    "replica count must be between 0 and {MAX_REPLICAS} (got {})",
                    self.runtime.replicas
                ),
            });
        }

        if self.runtime.container_port == Some(0) {
            return Err(ValidationError::InvalidField {
                field: "runtime.containerPort",
                message: "port must be between 1 and 65535".to_string(),
            });
        }

        if let Some(prefix) = &self.runtime.path_prefix {
            if !prefix.starts_with('/') || prefix.chars().any(char::is_whitespace) {
                return Err(ValidationError::InvalidField {
                    field: "runtime.pathPrefix",
                    message: format!("'{prefix}' must start with '/' and contain no whitespace"),
                });
            }
        }

        match &self.definition {
            JobDefinition::Standard(standard) => Self::validate_standard(standard),
            JobDefinition::Custom(custom) => {
                if custom.document.trim().is_empty() {
                    return Err(ValidationError::MissingField {
                        mode: ConfigMode::Custom,
                        field: "definition.document",
                    });
                }
                markup::check_well_formed(&custom.document)
                    .map_err(ValidationError::MalformedDocument)
            }
        }
    }

    fn validate_standard(standard: &StandardConfig) -> Result<(), ValidationError> {
        let source = &standard.source;
        if source.repository_url.trim().is_empty() {
            return Err(ValidationError::MissingField {
                mode: ConfigMode::Standard,
                field: "definition.source.repositoryUrl",
            });
        }
        if !REPOSITORY_URL.is_match(source.repository_url.trim()) {
            return Err(ValidationError::InvalidField {
                field: "definition.source.repositoryUrl",
                message: format!("'{}' is not a git repository URL", source.repository_url),
            });
        }
        if source.branch.trim().is_empty() {
            return Err(ValidationError::MissingField {
                mode: ConfigMode::Standard,
                field: "definition.source.branch",
            });
        }
        if source.branch.chars().any(|c| c.is_whitespace() || c == '\'') {
            return Err(ValidationError::InvalidField {
                field: "definition.source.branch",
                message: format!("'{}' is not a valid git ref", source.branch),
            });
        }
        Ok(())
    }

    /// Reject changes to fields that are fixed once the job exists.
    pub fn check_immutable(&self, existing: &PipelineConfig) -> Result<(), ValidationError> {
        if self.name != existing.name {
            return Err(ValidationError::ImmutableField {
                field: "name",
                existing: existing.name.clone(),
                requested: self.name.clone(),
            });
        }
        if self.stack != existing.stack {
            return Err(ValidationError::ImmutableField {
                field: "stack",
                existing: existing.stack.to_string(),
                requested: self.stack.to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

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
}
