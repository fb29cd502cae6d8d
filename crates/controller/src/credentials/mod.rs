//! Credential storage and resolution.
//!
//! Credentials are username/secret pairs referenced by ID from pipeline
//! configs. Secret values are write-only: nothing in this module returns them.

pub mod memory;
pub mod secret;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument};

use crate::error::{CredentialError, Error, Result, ValidationError};
use crate::naming::JobNameValidator;
use crate::store::JobStore;

pub use memory::InMemoryCredentialStore;
pub use secret::SecretCredentialStore;

/// A secret value. Never printed, never serialized.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString(***)")
    }
}

/// Everything about a credential except its secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialMetadata {
    pub id: String,
    /// Build-server credential ID used in generated pipelines
    pub name: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCredential {
    pub name: String,
    pub username: String,
    pub secret: SecretString,
    #[serde(default)]
    pub description: Option<String>,
}

/// Partial update. Absent fields stay unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialUpdate {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub secret: Option<SecretString>,
    #[serde(default)]
    pub description: Option<String>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn create(&self, credential: NewCredential) -> Result<CredentialMetadata, CredentialError>;

    async fn update(
        &self,
        id: &str,
        update: CredentialUpdate,
    ) -> Result<CredentialMetadata, CredentialError>;

    async fn delete(&self, id: &str) -> Result<(), CredentialError>;

    async fn get(&self, id: &str) -> Result<Option<CredentialMetadata>, CredentialError>;

    async fn list(&self) -> Result<Vec<CredentialMetadata>, CredentialError>;
}

/// Validates credential input and guards references from pipeline jobs.
pub struct CredentialResolver {
    store: Arc<dyn CredentialStore>,
    jobs: Arc<dyn JobStore>,
}

impl CredentialResolver {
    #[must_use]
    pub fn new(store: Arc<dyn CredentialStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self { store, jobs }
    }

    #[instrument(skip(self, credential), fields(name = %credential.name))]
    pub async fn create(&self, credential: NewCredential) -> Result<CredentialMetadata> {
        JobNameValidator::check_field(&credential.name, "credential name")?;
        if credential.username.trim().is_empty() {
            return Err(ValidationError::InvalidField {
                field: "username",
                message: "username must not be empty".to_string(),
            }
            .into());
        }
        if credential.secret.is_empty() {
            return Err(ValidationError::InvalidField {
                field: "secret",
                message: "secret must not be empty".to_string(),
            }
            .into());
        }

        let created = self.store.create(credential).await?;
        info!("Created credential {} ({})", created.name, created.id);
        Ok(created)
    }

    /// Apply a partial update. An explicitly empty secret or username is
    /// rejected rather than stored.
    #[instrument(skip(self, update))]
    pub async fn update(&self, id: &str, update: CredentialUpdate) -> Result<CredentialMetadata> {
        if update.secret.as_ref().is_some_and(SecretString::is_empty) {
            return Err(ValidationError::InvalidField {
                field: "secret",
                message: "secret must not be empty; omit it to keep the current value".to_string(),
            }
            .into());
        }
        if update
            .username
            .as_deref()
            .is_some_and(|username| username.trim().is_empty())
        {
            return Err(ValidationError::InvalidField {
                field: "username",
                message: "username must not be empty; omit it to keep the current value"
                    .to_string(),
            }
            .into());
        }

        Ok(self.store.update(id, update).await?)
    }

    /// Delete a credential that no job references.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.store.get(id).await?.is_none() {
            return Err(CredentialError::NotFound(id.to_string()).into());
        }

        let referencing: Vec<String> = self
            .jobs
            .list()
            .await?
            .into_iter()
            .filter(|record| record.config.credential_id() == Some(id))
            .map(|record| record.name)
            .collect();
        if !referencing.is_empty() {
            return Err(Error::CredentialInUse {
                id: id.to_string(),
                jobs: referencing,
            });
        }

        self.store.delete(id).await?;
        info!("Deleted credential {}", id);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<CredentialMetadata> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| CredentialError::NotFound(id.to_string()).into())
    }

    pub async fn list(&self) -> Result<Vec<CredentialMetadata>> {
        Ok(self.store.list().await?)
    }

    /// Build-server credential ID for `id`; fails if it no longer exists.
    pub async fn resolve(&self, id: &str) -> Result<String> {
        self.get(id).await.map(|credential| credential.name)
    }

    /// Resolve an optional reference.
    pub async fn resolve_optional(&self, id: Option<&str>) -> Result<Option<String>> {
        match id {
            Some(id) => self.resolve(id).await.map(Some),
            None => Ok(None),
        }
    }
}
