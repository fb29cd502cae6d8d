//! Credentials stored as Kubernetes Secrets.
//!
//! Secrets use the labels and keys read by the Jenkins
//! kubernetes-credentials-provider plugin, so every stored credential shows
//! up in Jenkins under its name without further wiring.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info};
use uuid::Uuid;

use super::{CredentialMetadata, CredentialStore, CredentialUpdate, NewCredential};
use crate::cluster::{MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::error::CredentialError;

const CREDENTIAL_TYPE_LABEL: &str = "jenkins.io/credentials-type";
const CREDENTIAL_TYPE: &str = "usernamePassword";
const CREDENTIAL_ID_LABEL: &str = "cloudops.io/credential-id";
const DESCRIPTION_ANNOTATION: &str = "jenkins.io/credentials-description";
const CREATED_ANNOTATION: &str = "cloudops.io/created-at";
const UPDATED_ANNOTATION: &str = "cloudops.io/updated-at";
const USERNAME_KEY: &str = "username";
const PASSWORD_KEY: &str = "password";

pub struct SecretCredentialStore {
    api: Api<Secret>,
}

impl SecretCredentialStore {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn selector() -> String {
        format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE},{CREDENTIAL_TYPE_LABEL}={CREDENTIAL_TYPE}")
    }

    async fn find(&self, id: &str) -> Result<Option<Secret>, CredentialError> {
        let selector = format!("{},{CREDENTIAL_ID_LABEL}={id}", Self::selector());
        let secrets = self
            .api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|source| CredentialError::Kube {
                name: id.to_string(),
                source,
            })?;
        Ok(secrets.items.into_iter().next())
    }

    async fn find_required(&self, id: &str) -> Result<Secret, CredentialError> {
        self.find(id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))
    }
}

fn parse_time(value: Option<&String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|time| time.with_timezone(&Utc))
}

/// Read metadata from a secret; the password key is never touched.
fn metadata_from(secret: &Secret) -> Result<CredentialMetadata, CredentialError> {
    let meta = &secret.metadata;
    let name = meta.name.clone().unwrap_or_default();
    let id = meta
        .labels
        .as_ref()
        .and_then(|labels| labels.get(CREDENTIAL_ID_LABEL))
        .cloned()
        .ok_or_else(|| {
            CredentialError::Backend(format!("secret '{name}' has no {CREDENTIAL_ID_LABEL} label"))
        })?;
    let username = secret
        .data
        .as_ref()
        .and_then(|data| data.get(USERNAME_KEY))
        .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
        .unwrap_or_default();

    let annotations = meta.annotations.as_ref();
    let created_from_meta = meta.creation_timestamp.as_ref().map(|time| time.0);
    let created_at = parse_time(annotations.and_then(|a| a.get(CREATED_ANNOTATION)))
        .or(created_from_meta)
        .unwrap_or_else(Utc::now);
    let updated_at =
        parse_time(annotations.and_then(|a| a.get(UPDATED_ANNOTATION))).unwrap_or(created_at);

    Ok(CredentialMetadata {
        id,
        name,
        username,
        description: annotations
            .and_then(|a| a.get(DESCRIPTION_ANNOTATION))
            .cloned()
            .filter(|d| !d.is_empty()),
        created_at,
        updated_at,
    })
}

#[async_trait]
impl CredentialStore for SecretCredentialStore {
    async fn create(&self, credential: NewCredential) -> Result<CredentialMetadata, CredentialError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let name = credential.name.clone();

        let mut annotations = BTreeMap::from([
            (CREATED_ANNOTATION.to_string(), now.clone()),
            (UPDATED_ANNOTATION.to_string(), now),
        ]);
        if let Some(description) = &credential.description {
            annotations.insert(DESCRIPTION_ANNOTATION.to_string(), description.clone());
        }

        let secret: Secret = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": name,
                "labels": {
                    MANAGED_BY_LABEL: MANAGED_BY_VALUE,
                    CREDENTIAL_TYPE_LABEL: CREDENTIAL_TYPE,
                    CREDENTIAL_ID_LABEL: id,
                },
                "annotations": annotations,
            },
            "type": "Opaque",
            "stringData": {
                USERNAME_KEY: credential.username,
                PASSWORD_KEY: credential.secret.expose(),
            }
        }))
        .map_err(|e| CredentialError::Backend(format!("failed to build secret '{name}': {e}")))?;

        let created = match self.api.create(&PostParams::default(), &secret).await {
            Ok(created) => created,
            Err(kube::Error::Api(response)) if response.code == 409 => {
                return Err(CredentialError::NameTaken(name));
            }
            Err(source) => return Err(CredentialError::Kube { name, source }),
        };
        info!("Stored credential {} in secret {}", id, credential.name);

        // stringData is write-only; the returned object carries data.
        let mut metadata = metadata_from(&created)?;
        if metadata.username.is_empty() {
            metadata.username = credential.username;
        }
        Ok(metadata)
    }

    async fn update(
        &self,
        id: &str,
        update: CredentialUpdate,
    ) -> Result<CredentialMetadata, CredentialError> {
        let existing = self.find_required(id).await?;
        let name = existing.metadata.name.clone().unwrap_or_default();

        let mut string_data = serde_json::Map::new();
        if let Some(username) = &update.username {
            string_data.insert(USERNAME_KEY.to_string(), json!(username));
        }
        if let Some(secret) = &update.secret {
            string_data.insert(PASSWORD_KEY.to_string(), json!(secret.expose()));
        }
        let mut annotations = serde_json::Map::new();
        annotations.insert(UPDATED_ANNOTATION.to_string(), json!(Utc::now().to_rfc3339()));
        if let Some(description) = &update.description {
            annotations.insert(DESCRIPTION_ANNOTATION.to_string(), json!(description));
        }

        let patch = json!({
            "metadata": { "annotations": annotations },
            "stringData": string_data,
        });
        let patched = self
            .api
            .patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|source| CredentialError::Kube {
                name: name.clone(),
                source,
            })?;
        debug!("Updated credential {} (secret {})", id, name);
        metadata_from(&patched)
    }

    async fn delete(&self, id: &str) -> Result<(), CredentialError> {
        let existing = self.find_required(id).await?;
        let name = existing.metadata.name.unwrap_or_default();
        match self.api.delete(&name, &DeleteParams::default()).await {
            Ok(_) => {
                info!("Deleted credential {} (secret {})", id, name);
                Ok(())
            }
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(source) => Err(CredentialError::Kube { name, source }),
        }
    }

    async fn get(&self, id: &str) -> Result<Option<CredentialMetadata>, CredentialError> {
        self.find(id)
            .await?
            .as_ref()
            .map(metadata_from)
            .transpose()
    }

    async fn list(&self) -> Result<Vec<CredentialMetadata>, CredentialError> {
        let secrets = self
            .api
            .list(&ListParams::default().labels(&Self::selector()))
            .await
            .map_err(|source| CredentialError::Kube {
                name: "*".to_string(),
                source,
            })?;
        let mut credentials = secrets
            .items
            .iter()
            .map(metadata_from)
            .collect::<Result<Vec<_>, _>>()?;
        credentials.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(credentials)
    }
}
