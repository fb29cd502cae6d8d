use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{CredentialMetadata, CredentialStore, CredentialUpdate, NewCredential, SecretString};
use crate::error::CredentialError;

struct StoredCredential {
    metadata: CredentialMetadata,
    #[allow(dead_code)] // write-only
    secret: SecretString,
}

/// Process-local credential store.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    credentials: RwLock<BTreeMap<String, StoredCredential>>,
}

impl InMemoryCredentialStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn create(&self, credential: NewCredential) -> Result<CredentialMetadata, CredentialError> {
        let mut credentials = self.credentials.write().await;
        if credentials
            .values()
            .any(|stored| stored.metadata.name == credential.name)
        {
            return Err(CredentialError::NameTaken(credential.name));
        }

        let now = Utc::now();
        let metadata = CredentialMetadata {
            id: Uuid::new_v4().to_string(),
            name: credential.name,
            username: credential.username,
            description: credential.description,
            created_at: now,
            updated_at: now,
        };
        credentials.insert(
            metadata.id.clone(),
            StoredCredential {
                metadata: metadata.clone(),
                secret: credential.secret,
            },
        );
        Ok(metadata)
    }

    async fn update(
        &self,
        id: &str,
        update: CredentialUpdate,
    ) -> Result<CredentialMetadata, CredentialError> {
        let mut credentials = self.credentials.write().await;
        let stored = credentials
            .get_mut(id)
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))?;

        if let Some(username) = update.username {
            stored.metadata.username = username;
        }
        if let Some(secret) = update.secret {
            stored.secret = secret;
        }
        if let Some(description) = update.description {
            stored.metadata.description = Some(description);
        }
        stored.metadata.updated_at = Utc::now();
        Ok(stored.metadata.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), CredentialError> {
        self.credentials
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| CredentialError::NotFound(id.to_string()))
    }

    async fn get(&self, id: &str) -> Result<Option<CredentialMetadata>, CredentialError> {
        Ok(self
            .credentials
            .read()
            .await
            .get(id)
            .map(|stored| stored.metadata.clone()))
    }

    async fn list(&self) -> Result<Vec<CredentialMetadata>, CredentialError> {
        let mut credentials: Vec<CredentialMetadata> = self
            .credentials
            .read()
            .await
            .values()
            .map(|stored| stored.metadata.clone())
            .collect();
        credentials.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn names_are_unique() {
        let store = InMemoryCredentialStore::new();
        let credential = NewCredential {
            name: "git".to_string(),
            username: "bot".to_string(),
            secret: SecretString::new("x"),
            description: None,
        };
        let first = store.create(credential.clone()).await.unwrap();
        assert!(Uuid::parse_str(&first.id).is_ok());
        assert!(matches!(
            store.create(credential).await,
            Err(CredentialError::NameTaken(_))
        ));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
