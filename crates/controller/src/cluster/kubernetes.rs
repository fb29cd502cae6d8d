use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info, instrument, warn};

use super::resources::{
    deployment_manifest, ingress_manifest, is_managed, managed_selector, service_manifest,
    summarize_deployment, summarize_ingress, summarize_pod, summarize_service,
};
use super::{ClusterOrchestrator, ResourceKind, ResourceSpec, ResourceSummary, JOB_LABEL};
use crate::error::OrchestratorError;

type Summarize<K> = fn(&K, &str) -> ResourceSummary;

fn kube_error(kind: ResourceKind, name: &str, source: kube::Error) -> OrchestratorError {
    OrchestratorError::Kube {
        kind,
        name: name.to_string(),
        source,
    }
}

fn is_not_found(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == 404)
}

/// Orchestrator backed by the Kubernetes API, scoped to one namespace.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    namespace: String,
}

impl KubeOrchestrator {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Create `object`; on conflict replace it, but only if we own it.
    async fn apply<K>(
        &self,
        kind: ResourceKind,
        object: K,
        carry_over: fn(&K, &mut K),
    ) -> Result<(), OrchestratorError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api();
        let name = object.meta().name.clone().unwrap_or_default();

        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {
                info!("Created {} {}", kind, name);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                let existing = api
                    .get(&name)
                    .await
                    .map_err(|source| kube_error(kind, &name, source))?;
                if !is_managed(existing.meta()) {
                    return Err(OrchestratorError::NotOwned { kind, name });
                }

                let mut desired = object;
                desired.meta_mut().resource_version = existing.meta().resource_version.clone();
                carry_over(&existing, &mut desired);
                api.replace(&name, &PostParams::default(), &desired)
                    .await
                    .map_err(|source| kube_error(kind, &name, source))?;
                info!("Updated {} {}", kind, name);
                Ok(())
            }
            Err(source) => Err(kube_error(kind, &name, source)),
        }
    }

    async fn delete_named<K>(&self, kind: ResourceKind, name: &str) -> Result<(), OrchestratorError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api();
        let Some(existing) = api
            .get_opt(name)
            .await
            .map_err(|source| kube_error(kind, name, source))?
        else {
            debug!("{} {} already absent", kind, name);
            return Ok(());
        };

        if !is_managed(existing.meta()) {
            warn!("Leaving {} {} in place: not managed by cloudops", kind, name);
            return Ok(());
        }

        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!("Deleted {} {}", kind, name);
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(source) => Err(kube_error(kind, name, source)),
        }
    }

    async fn get_named<K>(
        &self,
        kind: ResourceKind,
        name: &str,
        summarize: Summarize<K>,
    ) -> Result<Option<ResourceSummary>, OrchestratorError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api();
        let object = api
            .get_opt(name)
            .await
            .map_err(|source| kube_error(kind, name, source))?;
        Ok(object.map(|object| summarize(&object, &self.namespace)))
    }

    async fn list_selected<K>(
        &self,
        kind: ResourceKind,
        selector: &str,
        name_filter: Option<&str>,
        summarize: Summarize<K>,
    ) -> Result<Vec<ResourceSummary>, OrchestratorError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        let api: Api<K> = self.api();
        let objects = api
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(|source| kube_error(kind, kind.api_kind(), source))?;

        Ok(objects
            .items
            .iter()
            .map(|object| summarize(object, &self.namespace))
            .filter(|summary| name_filter.map_or(true, |filter| summary.name.contains(filter)))
            .collect())
    }
}

#[async_trait]
impl ClusterOrchestrator for KubeOrchestrator {
    #[instrument(skip(self))]
    async fn get(
        &self,
        kind: ResourceKind,
        job_name: &str,
    ) -> Result<Option<ResourceSummary>, OrchestratorError> {
        let name = kind.resource_name(job_name);
        match kind {
            ResourceKind::Workload => {
                self.get_named::<Deployment>(kind, &name, summarize_deployment)
                    .await
            }
            ResourceKind::Endpoint => {
                self.get_named::<Service>(kind, &name, summarize_service)
                    .await
            }
            ResourceKind::RoutingRule => {
                self.get_named::<Ingress>(kind, &name, summarize_ingress)
                    .await
            }
            ResourceKind::Instance => {
                let selector = format!("{},{JOB_LABEL}={job_name}", managed_selector());
                let pods = self
                    .list_selected::<Pod>(kind, &selector, None, summarize_pod)
                    .await?;
                Ok(pods.into_iter().next())
            }
        }
    }

    #[instrument(skip(self, spec), fields(kind = %spec.kind(), name = %spec.name()))]
    async fn create_or_update(&self, spec: &ResourceSpec) -> Result<(), OrchestratorError> {
        match spec {
            ResourceSpec::Workload(workload) => {
                let manifest = deployment_manifest(workload)?;
                self.apply(ResourceKind::Workload, manifest, |_, _| {}).await
            }
            ResourceSpec::Endpoint(endpoint) => {
                let manifest = service_manifest(endpoint)?;
                self.apply(ResourceKind::Endpoint, manifest, |existing, desired| {
                    // clusterIP is immutable once allocated
                    if let (Some(current), Some(spec)) = (&existing.spec, desired.spec.as_mut()) {
                        spec.cluster_ip.clone_from(&current.cluster_ip);
                        spec.cluster_ips.clone_from(&current.cluster_ips);
                    }
                })
                .await
            }
            ResourceSpec::RoutingRule(routing_rule) => {
                let manifest = ingress_manifest(routing_rule)?;
                self.apply(ResourceKind::RoutingRule, manifest, |_, _| {})
                    .await
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, kind: ResourceKind, job_name: &str) -> Result<(), OrchestratorError> {
        let name = kind.resource_name(job_name);
        match kind {
            ResourceKind::Workload => self.delete_named::<Deployment>(kind, &name).await,
            ResourceKind::Endpoint => self.delete_named::<Service>(kind, &name).await,
            ResourceKind::RoutingRule => self.delete_named::<Ingress>(kind, &name).await,
            ResourceKind::Instance => Err(OrchestratorError::ReadOnly { kind }),
        }
    }

    #[instrument(skip(self))]
    async fn list(
        &self,
        kind: ResourceKind,
        name_filter: Option<String>,
    ) -> Result<Vec<ResourceSummary>, OrchestratorError> {
        let selector = managed_selector();
        let filter = name_filter.as_deref();
        match kind {
            ResourceKind::Workload => {
                self.list_selected::<Deployment>(kind, &selector, filter, summarize_deployment)
                    .await
            }
            ResourceKind::Endpoint => {
                self.list_selected::<Service>(kind, &selector, filter, summarize_service)
                    .await
            }
            ResourceKind::RoutingRule => {
                self.list_selected::<Ingress>(kind, &selector, filter, summarize_ingress)
                    .await
            }
            ResourceKind::Instance => {
                self.list_selected::<Pod>(kind, &selector, filter, summarize_pod)
                    .await
            }
        }
    }
}
