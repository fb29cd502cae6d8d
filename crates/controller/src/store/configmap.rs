//! Job records persisted as one ConfigMap per job.
//!
//! Every write is a read-modify-replace carrying the `resourceVersion` it
//! read, so a concurrent writer (another replica, or a tracker in this one)
//! surfaces as a 409 and the write is redone against the fresh object.

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};

use super::{JobStore, StatusUpdate};
use crate::cluster::{JOB_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::error::StoreError;
use crate::model::JobRecord;
use crate::naming::ResourceNaming;
use crate::reconcile::JobLocks;

const RECORD_KEY: &str = "record.json";
const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const COMPONENT_VALUE: &str = "job-record";
const MAX_WRITE_ATTEMPTS: usize = 5;

pub struct ConfigMapJobStore {
    configmaps: Api<ConfigMap>,
    namespace: String,
    /// Serializes writes per job within this process.
    locks: JobLocks,
}

impl ConfigMapJobStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            configmaps: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            locks: JobLocks::new(),
        }
    }

    fn selector() -> String {
        format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{COMPONENT_LABEL}={COMPONENT_VALUE}")
    }

    fn kube_error(name: &str, source: kube::Error) -> StoreError {
        StoreError::Kube {
            name: name.to_string(),
            source,
        }
    }

    fn decode(job: &str, configmap: &ConfigMap) -> Result<Option<JobRecord>, StoreError> {
        let Some(raw) = configmap
            .data
            .as_ref()
            .and_then(|data| data.get(RECORD_KEY))
        else {
            return Ok(None);
        };
        serde_json::from_str(raw)
            .map(Some)
            .map_err(|source| StoreError::Corrupt {
                job: job.to_string(),
                source,
            })
    }

    fn encode(&self, record: &JobRecord) -> Result<ConfigMap, StoreError> {
        let record_json =
            serde_json::to_string_pretty(record).map_err(|source| StoreError::Corrupt {
                job: record.name.clone(),
                source,
            })?;

        Ok(ConfigMap {
            metadata: kube::api::ObjectMeta {
                name: Some(ResourceNaming::record_name(&record.name)),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
                    (COMPONENT_LABEL.to_string(), COMPONENT_VALUE.to_string()),
                    (JOB_LABEL.to_string(), record.name.clone()),
                ])),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (RECORD_KEY.to_string(), record_json),
                ("phase".to_string(), record.phase.to_string()),
                ("status".to_string(), record.last_status.as_str().to_string()),
                ("updated_at".to_string(), record.updated_at.to_rfc3339()),
            ])),
            ..Default::default()
        })
    }

    /// Read the record of `job`, let `change` edit it, and write it back.
    ///
    /// `change` returns false to skip the write. It may run more than once
    /// when the ConfigMap changes underneath us.
    async fn modify<F>(&self, job: &str, mut change: F) -> Result<Option<JobRecord>, StoreError>
    where
        F: FnMut(&mut Option<JobRecord>) -> bool + Send,
    {
        let _guard = self.locks.lock(job).await;
        let cm_name = ResourceNaming::record_name(job);

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let existing = self
                .configmaps
                .get_opt(&cm_name)
                .await
                .map_err(|source| Self::kube_error(&cm_name, source))?;
            let mut record = match &existing {
                Some(configmap) => Self::decode(job, configmap)?,
                None => None,
            };
            if !change(&mut record) {
                return Ok(record);
            }
            let Some(next) = record.as_ref() else {
                return Ok(None);
            };

            let mut desired = self.encode(next)?;
            let written = match existing {
                Some(current) => {
                    desired.metadata.resource_version = current.metadata.resource_version;
                    self.configmaps
                        .replace(&cm_name, &PostParams::default(), &desired)
                        .await
                }
                None => self.configmaps.create(&PostParams::default(), &desired).await,
            };

            match written {
                Ok(_) => {
                    debug!("Saved job record ConfigMap {}", cm_name);
                    return Ok(record);
                }
                Err(kube::Error::Api(err)) if err.code == 409 => {
                    warn!(
                        "Job record ConfigMap {} changed concurrently (attempt {}/{})",
                        cm_name, attempt, MAX_WRITE_ATTEMPTS
                    );
                }
                Err(e) => {
                    error!("Failed to save job record ConfigMap {}: {}", cm_name, e);
                    return Err(Self::kube_error(&cm_name, e));
                }
            }
        }

        Err(StoreError::Conflict {
            job: job.to_string(),
            attempts: MAX_WRITE_ATTEMPTS,
        })
    }
}

#[async_trait]
impl JobStore for ConfigMapJobStore {
    async fn get(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
        let cm_name = ResourceNaming::record_name(name);
        let configmap = self
            .configmaps
            .get_opt(&cm_name)
            .await
            .map_err(|source| Self::kube_error(&cm_name, source))?;
        match configmap {
            Some(configmap) => Self::decode(name, &configmap),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let configmaps = self
            .configmaps
            .list(&ListParams::default().labels(&Self::selector()))
            .await
            .map_err(|source| Self::kube_error("*", source))?;

        let mut records = Vec::with_capacity(configmaps.items.len());
        for configmap in &configmaps.items {
            let job = configmap
                .metadata
                .labels
                .as_ref()
                .and_then(|labels| labels.get(JOB_LABEL))
                .cloned()
                .unwrap_or_default();
            match Self::decode(&job, configmap) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => warn!("Job record ConfigMap for '{}' has no {}", job, RECORD_KEY),
                Err(e) => return Err(e),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.modify(&record.name, |current| {
            *current = Some(record.clone());
            true
        })
        .await
        .map(|_| ())
    }

    async fn save_reconciliation(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let saved = self
            .modify(&record.name, |current| {
                let mut next = record.clone();
                if let Some(stored) = current.as_ref() {
                    next.carry_build_status(stored);
                }
                *current = Some(next);
                true
            })
            .await?;
        Ok(saved.unwrap_or_else(|| record.clone()))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let cm_name = ResourceNaming::record_name(name);
        match self
            .configmaps
            .delete(&cm_name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                debug!("Deleted job record ConfigMap {}", cm_name);
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
            Err(e) => Err(Self::kube_error(&cm_name, e)),
        }
    }

    async fn update_build_status(
        &self,
        name: &str,
        update: StatusUpdate,
    ) -> Result<Option<JobRecord>, StoreError> {
        self.modify(name, |current| {
            let Some(record) = current.as_mut() else {
                return false;
            };
            if !update.apply(record) {
                return false;
            }
            record.updated_at = Utc::now();
            true
        })
        .await
    }
}
