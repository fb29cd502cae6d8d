use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use super::{JobStore, StatusUpdate};
use crate::error::StoreError;
use crate::model::JobRecord;

/// Process-local job store.
#[derive(Default)]
pub struct InMemoryJobStore {
    records: RwLock<BTreeMap<String, JobRecord>>,
}

impl InMemoryJobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn get(&self, name: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.records.read().await.get(name).cloned())
    }

    async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self.records.read().await.values().cloned().collect())
    }

    async fn put(&self, record: &JobRecord) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn save_reconciliation(&self, record: &JobRecord) -> Result<JobRecord, StoreError> {
        let mut records = self.records.write().await;
        let mut saved = record.clone();
        if let Some(stored) = records.get(&record.name) {
            saved.carry_build_status(stored);
        }
        records.insert(saved.name.clone(), saved.clone());
        Ok(saved)
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        self.records.write().await.remove(name);
        Ok(())
    }

    async fn update_build_status(
        &self,
        name: &str,
        update: StatusUpdate,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut records = self.records.write().await;
        Ok(records.get_mut(name).map(|record| {
            if update.apply(record) {
                record.updated_at = Utc::now();
            }
            record.clone()
        }))
    }
}
