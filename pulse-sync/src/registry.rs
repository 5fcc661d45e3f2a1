//! Per-`(tenant, provider)` job locks and live progress.

use dashmap::DashMap;
use pulse_core::{Provider, TenantId};
use pulse_integrations::SyncProgress;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

pub type JobKey = (TenantId, Provider);

/// Non-blocking mutual exclusion for sync jobs.
#[derive(Debug, Default)]
pub struct TenantLocks {
    locks: DashMap<JobKey, Arc<Mutex<()>>>,
}

impl TenantLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the job lock, or `None` if a job for `key` is already running.
    pub fn try_acquire(&self, key: JobKey) -> Option<OwnedMutexGuard<()>> {
        let lock = self.locks.entry(key).or_default().clone();
        lock.try_lock_owned().ok()
    }

    pub fn is_running(&self, key: JobKey) -> bool {
        self.locks
            .get(&key)
            .is_some_and(|lock| lock.try_lock().is_err())
    }
}

/// Latest progress of each running or finished job.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    entries: DashMap<JobKey, SyncProgress>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, key: JobKey, progress: &SyncProgress) {
        self.entries.insert(key, progress.clone());
    }

    pub fn get(&self, key: JobKey) -> Option<SyncProgress> {
        self.entries.get(&key).map(|p| p.clone())
    }

    pub fn clear(&self, key: JobKey) {
        self.entries.remove(&key);
    }
}
