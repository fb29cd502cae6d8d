//! Desired resource set for a job, Kubernetes manifests and summaries.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::json;
use std::collections::BTreeMap;

use super::{
    ClusterSettings, EndpointSpec, ResourceKind, ResourceSpec, ResourceSummary, RoutingRuleSpec,
    WorkloadSpec, ENDPOINT_PORT, JOB_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};
use crate::error::OrchestratorError;
use crate::model::PipelineConfig;

/// The three managed resources derived from one pipeline config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestrationResourceSet {
    pub workload: WorkloadSpec,
    pub endpoint: EndpointSpec,
    pub routing_rule: RoutingRuleSpec,
}

impl OrchestrationResourceSet {
    #[must_use]
    pub fn derive(config: &PipelineConfig, settings: &ClusterSettings) -> Self {
        let job_name = config.name.clone();
        let endpoint_name = ResourceKind::Endpoint.resource_name(&job_name);

        let workload = WorkloadSpec {
            job_name: job_name.clone(),
            name: ResourceKind::Workload.resource_name(&job_name),
            image: settings.image_for(config),
            replicas: config.runtime.replicas,
            container_port: config.container_port(),
            image_pull_secret: settings.image_pull_secret.clone(),
        };

        let endpoint = EndpointSpec {
            job_name: job_name.clone(),
            name: endpoint_name.clone(),
            port: ENDPOINT_PORT,
            target_port: config.container_port(),
        };

        let routing_rule = RoutingRuleSpec {
            job_name: job_name.clone(),
            name: ResourceKind::RoutingRule.resource_name(&job_name),
            host: format!("{job_name}.{}", settings.ingress_domain),
            path: config
                .runtime
                .path_prefix
                .clone()
                .unwrap_or_else(|| "/".to_string()),
            endpoint_name,
            endpoint_port: ENDPOINT_PORT,
            ingress_class: settings.ingress_class.clone(),
        };

        Self {
            workload,
            endpoint,
            routing_rule,
        }
    }

    #[must_use]
    pub fn spec(&self, kind: ResourceKind) -> Option<ResourceSpec> {
        match kind {
            ResourceKind::Workload => Some(ResourceSpec::Workload(self.workload.clone())),
            ResourceKind::Endpoint => Some(ResourceSpec::Endpoint(self.endpoint.clone())),
            ResourceKind::RoutingRule => {
                Some(ResourceSpec::RoutingRule(self.routing_rule.clone()))
            }
            ResourceKind::Instance => None,
        }
    }

    /// Specs in creation order, starting at `from`.
    #[must_use]
    pub fn from_kind(&self, from: ResourceKind) -> Vec<ResourceSpec> {
        ResourceKind::APPLY_ORDER
            .into_iter()
            .skip_while(|kind| *kind != from)
            .filter_map(|kind| self.spec(kind))
            .collect()
    }
}

/// Labels stamped on every managed resource and pod.
#[must_use]
pub fn managed_labels(job_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (JOB_LABEL.to_string(), job_name.to_string()),
        ("app".to_string(), job_name.to_string()),
    ])
}

/// Selector matching everything this controller manages.
#[must_use]
pub fn managed_selector() -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")
}

/// Whether `meta` carries the managed-by label.
#[must_use]
pub fn is_managed(meta: &ObjectMeta) -> bool {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(MANAGED_BY_LABEL))
        .is_some_and(|value| value == MANAGED_BY_VALUE)
}

pub fn deployment_manifest(spec: &WorkloadSpec) -> Result<Deployment, OrchestratorError> {
    let labels = managed_labels(&spec.job_name);
    let pull_secrets: Vec<serde_json::Value> = spec
        .image_pull_secret
        .iter()
        .map(|name| json!({ "name": name }))
        .collect();

    let manifest = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": spec.name,
            "labels": labels,
        },
        "spec": {
            "replicas": spec.replicas,
            "selector": {
                "matchLabels": {
                    JOB_LABEL: spec.job_name,
                }
            },
            "template": {
                "metadata": {
                    "labels": labels,
                },
                "spec": {
                    "imagePullSecrets": pull_secrets,
                    "containers": [{
                        "name": spec.job_name,
                        "image": spec.image,
                        "imagePullPolicy": "Always",
                        "ports": [{
                            "name": "http",
                            "containerPort": spec.container_port,
                            "protocol": "TCP",
                        }],
                    }],
                }
            }
        }
    });

    serde_json::from_value(manifest).map_err(|source| OrchestratorError::Manifest {
        kind: ResourceKind::Workload,
        name: spec.name.clone(),
        source,
    })
}

pub fn service_manifest(spec: &EndpointSpec) -> Result<Service, OrchestratorError> {
    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": spec.name,
            "labels": managed_labels(&spec.job_name),
        },
        "spec": {
            "type": "ClusterIP",
            "selector": {
                JOB_LABEL: spec.job_name,
            },
            "ports": [{
                "name": "http",
                "port": spec.port,
                "targetPort": spec.target_port,
                "protocol": "TCP",
            }],
        }
    });

    serde_json::from_value(manifest).map_err(|source| OrchestratorError::Manifest {
        kind: ResourceKind::Endpoint,
        name: spec.name.clone(),
        source,
    })
}

pub fn ingress_manifest(spec: &RoutingRuleSpec) -> Result<Ingress, OrchestratorError> {
    let mut ingress_spec = json!({
        "rules": [{
            "host": spec.host,
            "http": {
                "paths": [{
                    "path": spec.path,
                    "pathType": "Prefix",
                    "backend": {
                        "service": {
                            "name": spec.endpoint_name,
                            "port": { "number": spec.endpoint_port },
                        }
                    }
                }]
            }
        }]
    });
    if let Some(class) = &spec.ingress_class {
        ingress_spec["ingressClassName"] = json!(class);
    }

    let manifest = json!({
        "apiVersion": "networking.k8s.io/v1",
        "kind": "Ingress",
        "metadata": {
            "name": spec.name,
            "labels": managed_labels(&spec.job_name),
        },
        "spec": ingress_spec,
    });

    serde_json::from_value(manifest).map_err(|source| OrchestratorError::Manifest {
        kind: ResourceKind::RoutingRule,
        name: spec.name.clone(),
        source,
    })
}

fn base_summary(kind: ResourceKind, meta: &ObjectMeta, namespace: &str) -> ResourceSummary {
    ResourceSummary {
        kind,
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta
            .namespace
            .clone()
            .unwrap_or_else(|| namespace.to_string()),
        job: meta
            .labels
            .as_ref()
            .and_then(|labels| labels.get(JOB_LABEL))
            .cloned(),
        managed: is_managed(meta),
        status: String::new(),
        created_at: meta.creation_timestamp.as_ref().map(|time| time.0),
        details: BTreeMap::new(),
    }
}

#[must_use]
pub fn summarize_deployment(deployment: &Deployment, namespace: &str) -> ResourceSummary {
    let mut summary = base_summary(ResourceKind::Workload, &deployment.metadata, namespace);
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let ready = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);

    summary.status = if ready >= desired { "Ready" } else { "Progressing" }.to_string();
    summary
        .details
        .insert("replicas".to_string(), format!("{ready}/{desired}"));

    let images: Vec<String> = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .map(|pod| {
            pod.containers
                .iter()
                .filter_map(|c| c.image.clone())
                .collect()
        })
        .unwrap_or_default();
    if !images.is_empty() {
        summary.details.insert("image".to_string(), images.join(","));
    }
    summary
}

#[must_use]
pub fn summarize_service(service: &Service, namespace: &str) -> ResourceSummary {
    let mut summary = base_summary(ResourceKind::Endpoint, &service.metadata, namespace);
    summary.status = "Active".to_string();
    if let Some(spec) = &service.spec {
        if let Some(service_type) = &spec.type_ {
            summary
                .details
                .insert("type".to_string(), service_type.clone());
        }
        if let Some(cluster_ip) = &spec.cluster_ip {
            summary
                .details
                .insert("clusterIP".to_string(), cluster_ip.clone());
        }
        let ports: Vec<String> = spec
            .ports
            .iter()
            .flatten()
            .map(|port| {
                format!(
                    "{}/{}",
                    port.port,
                    port.protocol.as_deref().unwrap_or("TCP")
                )
            })
            .collect();
        if !ports.is_empty() {
            summary.details.insert("ports".to_string(), ports.join(","));
        }
    }
    summary
}

#[must_use]
pub fn summarize_ingress(ingress: &Ingress, namespace: &str) -> ResourceSummary {
    let mut summary = base_summary(ResourceKind::RoutingRule, &ingress.metadata, namespace);

    let hosts: Vec<String> = ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.rules.as_ref())
        .map(|rules| rules.iter().filter_map(|rule| rule.host.clone()).collect())
        .unwrap_or_default();
    if !hosts.is_empty() {
        summary.details.insert("hosts".to_string(), hosts.join(","));
    }

    let addresses: Vec<String> = ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_ref())
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.ip.clone().or_else(|| entry.hostname.clone()))
                .collect()
        })
        .unwrap_or_default();
    summary.status = if addresses.is_empty() { "Pending" } else { "Ready" }.to_string();
    if !addresses.is_empty() {
        summary
            .details
            .insert("address".to_string(), addresses.join(","));
    }
    summary
}

#[must_use]
pub fn summarize_pod(pod: &Pod, namespace: &str) -> ResourceSummary {
    let mut summary = base_summary(ResourceKind::Instance, &pod.metadata, namespace);
    let status = pod.status.as_ref();
    summary.status = status
        .and_then(|s| s.phase.clone())
        .unwrap_or_else(|| "Unknown".to_string());

    if let Some(ip) = status.and_then(|s| s.pod_ip.clone()) {
        summary.details.insert("ip".to_string(), ip);
    }
    let restarts: i32 = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| statuses.iter().map(|c| c.restart_count).sum())
        .unwrap_or(0);
    summary
        .details
        .insert("restarts".to_string(), restarts.to_string());
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::pipeline::fixtures::standard_config;
    use crate::model::StackType;
    use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

    fn settings() -> ClusterSettings {
        ClusterSettings {
            namespace: "apps".to_string(),
            ingress_domain: "apps.example.com".to_string(),
            ingress_class: Some("nginx".to_string()),
            registry_url: "registry.example.com".to_string(),
            registry_directory: "team".to_string(),
            image_pull_secret: Some("registry-pull".to_string()),
        }
    }

    #[test]
    fn derives_names_ports_and_host() {
        let mut config = standard_config("mfx-admin", StackType::Node);
        config.runtime.path_prefix = Some("/admin".to_string());
        let set = OrchestrationResourceSet::derive(&config, &settings());

        assert_eq!(set.workload.name, "mfx-admin");
        assert_eq!(set.workload.image, "registry.example.com/team/mfx-admin:latest");
        assert_eq!(set.workload.container_port, 80);
        assert_eq!(set.endpoint.name, "mfx-admin-svc");
        assert_eq!(set.endpoint.target_port, 80);
        assert_eq!(set.routing_rule.name, "mfx-admin-ingress");
        assert_eq!(set.routing_rule.host, "mfx-admin.apps.example.com");
        assert_eq!(set.routing_rule.path, "/admin");
        assert_eq!(set.routing_rule.endpoint_name, "mfx-admin-svc");
    }

    #[test]
    fn from_kind_resumes_in_order() {
        let set = OrchestrationResourceSet::derive(
            &standard_config("web", StackType::Java),
            &settings(),
        );
        let kinds: Vec<ResourceKind> = set
            .from_kind(ResourceKind::Endpoint)
            .iter()
            .map(ResourceSpec::kind)
            .collect();
        assert_eq!(kinds, vec![ResourceKind::Endpoint, ResourceKind::RoutingRule]);
        assert_eq!(set.from_kind(ResourceKind::Workload).len(), 3);
    }

    #[test]
    fn manifests_carry_ownership_labels() {
        let set = OrchestrationResourceSet::derive(
            &standard_config("web", StackType::Python),
            &settings(),
        );

        let deployment = deployment_manifest(&set.workload).unwrap();
        assert!(is_managed(&deployment.metadata));
        let pod_spec = deployment.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod_spec.containers[0].image_pull_policy.as_deref(), Some("Always"));
        assert_eq!(
            pod_spec.containers[0].ports.as_ref().unwrap()[0].container_port,
            8080
        );
        let rendered = serde_json::to_value(&deployment).unwrap();
        assert_eq!(
            rendered["spec"]["template"]["spec"]["imagePullSecrets"][0]["name"],
            "registry-pull"
        );
        assert_eq!(rendered["spec"]["selector"]["matchLabels"][JOB_LABEL], "web");

        let service = service_manifest(&set.endpoint).unwrap();
        assert!(is_managed(&service.metadata));
        let port = &service.spec.as_ref().unwrap().ports.as_ref().unwrap()[0];
        assert_eq!(port.port, 80);
        assert_eq!(port.target_port, Some(IntOrString::Int(8080)));

        let ingress = ingress_manifest(&set.routing_rule).unwrap();
        let spec = ingress.spec.as_ref().unwrap();
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));
        let path = &spec.rules.as_ref().unwrap()[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path.as_deref(), Some("/"));
        assert_eq!(path.path_type, "Prefix");
    }

    #[test]
    fn summaries_report_readiness() {
        let set = OrchestrationResourceSet::derive(
            &standard_config("web", StackType::Node),
            &settings(),
        );
        let deployment = deployment_manifest(&set.workload).unwrap();
        let summary = summarize_deployment(&deployment, "apps");
        assert_eq!(summary.status, "Progressing");
        assert_eq!(summary.details["replicas"], "0/1");
        assert_eq!(summary.job.as_deref(), Some("web"));
        assert!(summary.managed);

        let ingress = ingress_manifest(&set.routing_rule).unwrap();
        let summary = summarize_ingress(&ingress, "apps");
        assert_eq!(summary.status, "Pending");
        assert_eq!(summary.details["hosts"], "web.apps.example.com");
    }
}
