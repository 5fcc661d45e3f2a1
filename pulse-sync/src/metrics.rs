//! Sync counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for sync activity since startup.
///
/// The server mirrors these into Prometheus at scrape time.
#[derive(Debug, Default)]
pub struct SyncMetrics {
    /// Jobs that finished successfully
    pub jobs_succeeded: AtomicU64,

    /// Jobs that failed (auth, transient, deadline)
    pub jobs_failed: AtomicU64,

    /// Jobs skipped because the previous run still held the lock
    pub jobs_skipped: AtomicU64,

    /// Connections moved to `disconnected`
    pub connections_disconnected: AtomicU64,

    /// Objects upserted across all pulls
    pub objects_synced: AtomicU64,

    /// Customers absorbed by email dedup
    pub customers_merged: AtomicU64,

    /// Webhook idempotency rows pruned
    pub webhook_events_pruned: AtomicU64,

    /// Scheduler ticks completed
    pub ticks: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        SyncMetricsSnapshot {
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            connections_disconnected: self.connections_disconnected.load(Ordering::Relaxed),
            objects_synced: self.objects_synced.load(Ordering::Relaxed),
            customers_merged: self.customers_merged.load(Ordering::Relaxed),
            webhook_events_pruned: self.webhook_events_pruned.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`SyncMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncMetricsSnapshot {
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub connections_disconnected: u64,
    pub objects_synced: u64,
    pub customers_merged: u64,
    pub webhook_events_pruned: u64,
    pub ticks: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let metrics = SyncMetrics::new();
        SyncMetrics::add(&metrics.jobs_succeeded, 2);
        SyncMetrics::add(&metrics.jobs_skipped, 1);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_succeeded, 2);
        assert_eq!(snapshot.jobs_skipped, 1);
        assert_eq!(snapshot.jobs_failed, 0);
    }
}
