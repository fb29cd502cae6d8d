//! Cluster orchestrator boundary.
//!
//! Every job owns three managed resources (workload, endpoint, routing rule).
//! Instances are the running replicas of a workload and are read-only.

pub mod kubernetes;
pub mod resources;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::config::ControllerConfig;
use crate::error::{OrchestratorError, ValidationError};
use crate::model::PipelineConfig;
use crate::naming::ResourceNaming;

pub use kubernetes::KubeOrchestrator;
pub use resources::OrchestrationResourceSet;

/// Marks resources created by this controller.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "cloudops";
/// Job that owns a resource.
pub const JOB_LABEL: &str = "cloudops.io/job";

/// Port the endpoint exposes in front of the container port.
pub const ENDPOINT_PORT: u16 = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Workload,
    Endpoint,
    RoutingRule,
    Instance,
}

impl ResourceKind {
    /// Creation order of managed kinds.
    pub const APPLY_ORDER: [ResourceKind; 3] = [
        ResourceKind::Workload,
        ResourceKind::Endpoint,
        ResourceKind::RoutingRule,
    ];

    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Workload,
        ResourceKind::Endpoint,
        ResourceKind::RoutingRule,
        ResourceKind::Instance,
    ];

    #[must_use]
    pub fn is_managed(self) -> bool {
        !matches!(self, ResourceKind::Instance)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Workload => "workload",
            ResourceKind::Endpoint => "endpoint",
            ResourceKind::RoutingRule => "routing-rule",
            ResourceKind::Instance => "instance",
        }
    }

    /// Kubernetes kind backing this resource kind.
    #[must_use]
    pub fn api_kind(self) -> &'static str {
        match self {
            ResourceKind::Workload => "Deployment",
            ResourceKind::Endpoint => "Service",
            ResourceKind::RoutingRule => "Ingress",
            ResourceKind::Instance => "Pod",
        }
    }

    /// Name of this kind's resource for `job_name`.
    #[must_use]
    pub fn resource_name(self, job_name: &str) -> String {
        match self {
            ResourceKind::Workload | ResourceKind::Instance => {
                ResourceNaming::workload_name(job_name)
            }
            ResourceKind::Endpoint => ResourceNaming::endpoint_name(job_name),
            ResourceKind::RoutingRule => ResourceNaming::routing_rule_name(job_name),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.api_kind())
    }
}

impl FromStr for ResourceKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "workload" | "workloads" | "deployment" | "deployments" => Ok(ResourceKind::Workload),
            "endpoint" | "endpoints" | "service" | "services" => Ok(ResourceKind::Endpoint),
            "routing-rule" | "routing-rules" | "ingress" | "ingresses" => {
                Ok(ResourceKind::RoutingRule)
            }
            "instance" | "instances" | "pod" | "pods" => Ok(ResourceKind::Instance),
            other => Err(ValidationError::InvalidField {
                field: "kind",
                message: format!(
                    "unknown resource kind '{other}' (expected workload, endpoint, routing-rule or instance)"
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub job_name: String,
    pub name: String,
    /// Full image reference including tag
    pub image: String,
    pub replicas: i32,
    pub container_port: u16,
    pub image_pull_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub job_name: String,
    pub name: String,
    pub port: u16,
    pub target_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingRuleSpec {
    pub job_name: String,
    pub name: String,
    pub host: String,
    pub path: String,
    pub endpoint_name: String,
    pub endpoint_port: u16,
    pub ingress_class: Option<String>,
}

/// Desired state of one managed resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceSpec {
    Workload(WorkloadSpec),
    Endpoint(EndpointSpec),
    RoutingRule(RoutingRuleSpec),
}

impl ResourceSpec {
    #[must_use]
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceSpec::Workload(_) => ResourceKind::Workload,
            ResourceSpec::Endpoint(_) => ResourceKind::Endpoint,
            ResourceSpec::RoutingRule(_) => ResourceKind::RoutingRule,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            ResourceSpec::Workload(spec) => &spec.name,
            ResourceSpec::Endpoint(spec) => &spec.name,
            ResourceSpec::RoutingRule(spec) => &spec.name,
        }
    }

    #[must_use]
    pub fn job_name(&self) -> &str {
        match self {
            ResourceSpec::Workload(spec) => &spec.job_name,
            ResourceSpec::Endpoint(spec) => &spec.job_name,
            ResourceSpec::RoutingRule(spec) => &spec.job_name,
        }
    }
}

/// Cluster-wide values used to derive resource specs.
#[derive(Debug, Clone)]
pub struct ClusterSettings {
    pub namespace: String,
    pub ingress_domain: String,
    pub ingress_class: Option<String>,
    pub registry_url: String,
    pub registry_directory: String,
    pub image_pull_secret: Option<String>,
}

impl ClusterSettings {
    #[must_use]
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            namespace: config.kubernetes.namespace.clone(),
            ingress_domain: config.kubernetes.ingress_domain.trim_matches('.').to_string(),
            ingress_class: config.kubernetes.ingress_class_name.clone(),
            registry_url: config.registry.url.trim_end_matches('/').to_string(),
            registry_directory: config.registry.directory.trim_matches('/').to_string(),
            image_pull_secret: config.registry.pull_secret.clone(),
        }
    }

    /// Image the workload runs; pipelines push this tag on every build.
    #[must_use]
    pub fn image_for(&self, config: &PipelineConfig) -> String {
        format!(
            "{}/{}/{}:latest",
            self.registry_url,
            self.registry_directory,
            config.image_name()
        )
    }
}

/// Normalized view of a cluster resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSummary {
    pub kind: ResourceKind,
    pub name: String,
    pub namespace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<String>,
    pub managed: bool,
    /// Short condition, e.g. `Ready`, `Pending`, `Running`
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Kind-specific details (replicas, ports, hosts, ...)
    pub details: BTreeMap<String, String>,
}

#[async_trait]
pub trait ClusterOrchestrator: Send + Sync {
    /// Look up the resource of `kind` belonging to `job_name`.
    async fn get(
        &self,
        kind: ResourceKind,
        job_name: &str,
    ) -> Result<Option<ResourceSummary>, OrchestratorError>;

    /// Create the resource, or replace it if it already exists and is ours.
    async fn create_or_update(&self, spec: &ResourceSpec) -> Result<(), OrchestratorError>;

    /// Delete the resource of `kind` for `job_name`. Absence counts as deleted.
    async fn delete(&self, kind: ResourceKind, job_name: &str) -> Result<(), OrchestratorError>;

    /// List managed resources of `kind` whose name contains `name_filter`.
    async fn list(
        &self,
        kind: ResourceKind,
        name_filter: Option<String>,
    ) -> Result<Vec<ResourceSummary>, OrchestratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parses_aliases() {
        assert_eq!("Deployments".parse::<ResourceKind>().unwrap(), ResourceKind::Workload);
        assert!("svc".parse::<ResourceKind>().is_err());
        assert_eq!("ingress".parse::<ResourceKind>().unwrap(), ResourceKind::RoutingRule);
        assert_eq!("pods".parse::<ResourceKind>().unwrap(), ResourceKind::Instance);
    }

    #[test]
    fn only_instances_are_unmanaged() {
        let managed: Vec<_> = ResourceKind::ALL
            .into_iter()
            .filter(|kind| kind.is_managed())
            .collect();
        assert_eq!(managed, ResourceKind::APPLY_ORDER.to_vec());
    }

    #[test]
    fn display_names_system_kind() {
        assert_eq!(ResourceKind::Endpoint.to_string(), "endpoint (Service)");
    }
}
