//! Per-job mutual exclusion.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per job name. Entries are dropped once nobody holds or
/// waits on them.
#[derive(Default, Clone)]
pub struct JobLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

/// Held for the duration of one reconciliation step sequence.
pub struct JobGuard {
    name: String,
    lock: Arc<Mutex<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl JobLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, name: &str) -> JobGuard {
        let lock = self
            .locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.clone().lock_owned().await;
        JobGuard {
            name: name.to_string(),
            lock,
            locks: self.locks.clone(),
            guard: Some(guard),
        }
    }

    /// Whether someone currently holds the lock for `name`.
    #[must_use]
    pub fn is_locked(&self, name: &str) -> bool {
        self.locks
            .get(name)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        self.guard.take();
        // The map and this guard hold the only references: nobody is waiting.
        self.locks
            .remove_if(&self.name, |_, lock| {
                Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
            });
    }
}
