//! Job record persistence.
//!
//! The store holds the authoritative local view of every managed job. Remote
//! systems are reconciled towards it, never the other way round.

pub mod configmap;
pub mod memory;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{BuildStatus, JobRecord, TrackingState};

pub use configmap::ConfigMapJobStore;
pub use memory::InMemoryJobStore;

/// Build-status fields written by triggers and trackers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusUpdate {
    /// New status; `None` leaves the last known status in place
    pub status: Option<BuildStatus>,
    pub build_number: Option<u64>,
    pub tracking: Option<TrackingState>,
}

impl StatusUpdate {
    #[must_use]
    pub fn status(status: BuildStatus, build_number: Option<u64>) -> Self {
        Self {
            status: Some(status),
            build_number,
            tracking: None,
        }
    }

    #[must_use]
    pub fn with_tracking(mut self, tracking: TrackingState) -> Self {
        self.tracking = Some(tracking);
        self
    }

    /// Apply to `record`; returns whether anything changed.
    pub fn apply(&self, record: &mut JobRecord) -> bool {
        let before = (record.last_status, record.last_build_number, record.tracking);
        if let Some(status) = self.status {
            record.last_status = status;
        }
        if self.build_number.is_some() {
            record.last_build_number = self.build_number;
        }
        if let Some(tracking) = self.tracking {
            record.tracking = tracking;
        }
        before != (record.last_status, record.last_build_number, record.tracking)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<JobRecord>, StoreError>;

    /// All records, ordered by name.
    async fn list(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Insert or replace a record.
    async fn put(&self, record: &JobRecord) -> Result<(), StoreError>;

    /// Write a record produced by reconciliation.
    ///
    /// Like [`JobStore::put`], except that the build-status fields of an
    /// existing record win over the ones in `record`, so a status written by
    /// a tracker while the reconciliation ran is not lost. Returns the record
    /// as stored.
    async fn save_reconciliation(&self, record: &JobRecord) -> Result<JobRecord, StoreError>;

    /// Remove a record. Removing an absent record succeeds.
    async fn delete(&self, name: &str) -> Result<(), StoreError>;

    /// Update only the build-status fields of a record.
    ///
    /// Returns the updated record, or `None` if it no longer exists. Other
    /// fields written concurrently by reconciliation are preserved.
    async fn update_build_status(
        &self,
        name: &str,
        update: StatusUpdate,
    ) -> Result<Option<JobRecord>, StoreError>;
}
