//! Scoring counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for scoring activity since startup.
#[derive(Debug, Default)]
pub struct ScoringMetrics {
    /// Scores written
    pub scores_calculated: AtomicU64,

    /// Customers with no present factor
    pub no_signal: AtomicU64,

    /// Calculations that failed
    pub failures: AtomicU64,

    /// Timeline events appended by the change detector
    pub change_events: AtomicU64,

    /// History snapshots pruned
    pub history_pruned: AtomicU64,

    /// Scheduler ticks completed
    pub ticks: AtomicU64,
}

impl ScoringMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ScoringMetricsSnapshot {
        ScoringMetricsSnapshot {
            scores_calculated: self.scores_calculated.load(Ordering::Relaxed),
            no_signal: self.no_signal.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            change_events: self.change_events.load(Ordering::Relaxed),
            history_pruned: self.history_pruned.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoringMetricsSnapshot {
    pub scores_calculated: u64,
    pub no_signal: u64,
    pub failures: u64,
    pub change_events: u64,
    pub history_pruned: u64,
    pub ticks: u64,
}
