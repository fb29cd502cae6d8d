//! Pipeline template generation
//!
//! Renders the Jenkinsfile for STANDARD jobs and wraps it into a Jenkins
//! `config.xml`. CUSTOM jobs skip rendering and use the caller's document.
//! Output depends only on the config, the render settings and the clock,
//! so the same inputs always produce byte-identical documents.

pub mod markup;

use crate::clock::Clock;
use crate::config::ControllerConfig;
use crate::error::{Result, TemplateError, ValidationError};
use crate::model::{JobDefinition, PipelineConfig, StackType, StandardConfig};
use crate::naming::ResourceNaming;
use handlebars::Handlebars;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

const JENKINSFILE_TEMPLATE: &str = include_str!("../../templates/jenkinsfile.groovy.hbs");
const JOB_DEFINITION_TEMPLATE: &str = include_str!("../../templates/config.xml.hbs");

const JENKINSFILE: &str = "jenkinsfile";
const JOB_DEFINITION: &str = "job-definition";

const JENKINSFILE_OVERRIDE: &str = "jenkinsfile.groovy.hbs";
const JOB_DEFINITION_OVERRIDE: &str = "config.xml.hbs";

/// Tooling and build commands for one stack.
struct StackProfile {
    tool: Option<&'static str>,
    install_commands: &'static [&'static str],
}

fn stack_profile(stack: StackType) -> StackProfile {
    match stack {
        StackType::Node => StackProfile {
            tool: Some("nodejs '22.18.0'"),
            install_commands: &["npm ci || npm install", "npm run build"],
        },
        StackType::Java => StackProfile {
            tool: Some("maven '3.9.5'"),
            install_commands: &["mvn -B clean package -DskipTests"],
        },
        StackType::Python => StackProfile {
            tool: None,
            install_commands: &["pip install -r requirements.txt"],
        },
    }
}

/// Escape a value for a single-quoted Groovy string.
fn groovy_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Deployment-wide values baked into every generated pipeline.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub registry_url: String,
    pub registry_directory: String,
    pub registry_credential_id: String,
    pub kubeconfig_credential_id: String,
    pub namespace: String,
}

impl RenderSettings {
    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            registry_url: config.registry.url.trim_end_matches('/').to_string(),
            registry_directory: config.registry.directory.trim_matches('/').to_string(),
            registry_credential_id: config.registry.credential_id.clone(),
            kubeconfig_credential_id: config.kubernetes.kubeconfig_credential_id.clone(),
            namespace: config.kubernetes.namespace.clone(),
        }
    }

    /// `{registry}/{directory}/{image}` without a tag.
    #[must_use]
    pub fn image_repository(&self, image_name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.registry_url, self.registry_directory, image_name
        )
    }
}

pub struct PipelineTemplateGenerator {
    scripts: Handlebars<'static>,
    documents: Handlebars<'static>,
    settings: RenderSettings,
    clock: Arc<dyn Clock>,
}

impl PipelineTemplateGenerator {
    /// Generator using the built-in templates.
    pub fn new(settings: RenderSettings, clock: Arc<dyn Clock>) -> Result<Self, TemplateError> {
        Self::with_sources(
            settings,
            clock,
            JENKINSFILE_TEMPLATE.to_string(),
            JOB_DEFINITION_TEMPLATE.to_string(),
        )
    }

    /// Generator preferring templates found in `directory`.
    pub fn with_override_dir(
        settings: RenderSettings,
        clock: Arc<dyn Clock>,
        directory: Option<&Path>,
    ) -> Result<Self, TemplateError> {
        let Some(directory) = directory else {
            return Self::new(settings, clock);
        };

        let jenkinsfile = Self::load_override(directory, JENKINSFILE_OVERRIDE)?
            .unwrap_or_else(|| JENKINSFILE_TEMPLATE.to_string());
        let job_definition = Self::load_override(directory, JOB_DEFINITION_OVERRIDE)?
            .unwrap_or_else(|| JOB_DEFINITION_TEMPLATE.to_string());

        Self::with_sources(settings, clock, jenkinsfile, job_definition)
    }

    fn load_override(directory: &Path, file: &str) -> Result<Option<String>, TemplateError> {
        let path = directory.join(file);
        if !path.exists() {
            debug!("No template override at {}", path.display());
            return Ok(None);
        }
        info!("Using template override {}", path.display());
        std::fs::read_to_string(&path)
            .map(Some)
            .map_err(|source| TemplateError::Io {
                path: path.display().to_string(),
                source,
            })
    }

    fn with_sources(
        settings: RenderSettings,
        clock: Arc<dyn Clock>,
        jenkinsfile: String,
        job_definition: String,
    ) -> Result<Self, TemplateError> {
        let mut scripts = Handlebars::new();
        scripts.set_strict_mode(false);
        scripts.register_escape_fn(handlebars::no_escape);
        scripts
            .register_template_string(JENKINSFILE, jenkinsfile)
            .map_err(|e| TemplateError::Register {
                name: JENKINSFILE,
                message: e.to_string(),
            })?;

        let mut documents = Handlebars::new();
        documents.set_strict_mode(false);
        documents.register_escape_fn(markup::escape_markup);
        documents
            .register_template_string(JOB_DEFINITION, job_definition)
            .map_err(|e| TemplateError::Register {
                name: JOB_DEFINITION,
                message: e.to_string(),
            })?;

        Ok(Self {
            scripts,
            documents,
            settings,
            clock,
        })
    }

    #[must_use]
    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// Render the pipeline script for a STANDARD job.
    ///
    /// `checkout_credential` is the build-server credential ID resolved from
    /// the config's credential reference.
    pub fn render_script(
        &self,
        config: &PipelineConfig,
        checkout_credential: Option<&str>,
    ) -> Result<String> {
        let JobDefinition::Standard(standard) = &config.definition else {
            return Err(ValidationError::InvalidField {
                field: "definition.mode",
                message: "a pipeline script is only generated for STANDARD jobs".to_string(),
            }
            .into());
        };
        Ok(self.render_standard_script(config, standard, checkout_credential)?)
    }

    /// Produce the complete job definition document.
    pub fn render_definition(
        &self,
        config: &PipelineConfig,
        checkout_credential: Option<&str>,
    ) -> Result<String> {
        match &config.definition {
            JobDefinition::Custom(custom) => Ok(custom.document.clone()),
            JobDefinition::Standard(standard) => {
                let script = self.render_standard_script(config, standard, checkout_credential)?;
                let source = &standard.source;
                let description = config.description.clone().unwrap_or_else(|| {
                    format!(
                        "Managed by CloudOps: {} pipeline for {} ({})",
                        config.stack, source.repository_url, source.branch
                    )
                });
                let context = json!({
                    "description": description,
                    "script": script,
                });
                let document = self
                    .documents
                    .render(JOB_DEFINITION, &context)
                    .map_err(|e| TemplateError::Render {
                        name: JOB_DEFINITION,
                        message: e.to_string(),
                    })?;
                Ok(document)
            }
        }
    }

    fn render_standard_script(
        &self,
        config: &PipelineConfig,
        standard: &StandardConfig,
        checkout_credential: Option<&str>,
    ) -> Result<String, TemplateError> {
        let profile = stack_profile(config.stack);
        let source = &standard.source;
        let node_options = match config.stack {
            StackType::Node => standard.node_options.as_deref().map(groovy_literal),
            StackType::Java | StackType::Python => None,
        };
        let version_prefix = self.clock.now().format("%Y%m%d%H%M%S").to_string();

        let context = json!({
            "tool": profile.tool,
            "install_commands": profile.install_commands,
            "repository_url": groovy_literal(source.repository_url.trim()),
            "branch": groovy_literal(&source.branch),
            "credential_id": checkout_credential.map(groovy_literal),
            "image_repository": groovy_literal(&self.settings.image_repository(config.image_name())),
            "version_prefix": version_prefix,
            "dockerfile_path": groovy_literal(&config.image.dockerfile_path),
            "context_directory": groovy_literal(&config.image.context_directory),
            "build_directory": config.image.build_directory.as_deref().map(groovy_literal),
            "node_options": node_options,
            "registry_url": self.settings.registry_url,
            "registry_credential_id": groovy_literal(&self.settings.registry_credential_id),
            "kubeconfig_credential_id": groovy_literal(&self.settings.kubeconfig_credential_id),
            "namespace": self.settings.namespace,
            "workload_name": ResourceNaming::workload_name(&config.name),
        });

        debug!(job = %config.name, stack = %config.stack, "Rendering pipeline script");
        self.scripts
            .render(JENKINSFILE, &context)
            .map_err(|e| TemplateError::Render {
                name: JENKINSFILE,
                message: e.to_string(),
            })
    }
}
