//! Alert counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for alert activity since startup.
#[derive(Debug, Default)]
pub struct AlertMetrics {
    /// Rule evaluations run
    pub rules_evaluated: AtomicU64,

    /// Alerts delivered to every recipient
    pub alerts_sent: AtomicU64,

    /// Alerts whose delivery failed
    pub alerts_failed: AtomicU64,

    /// Matches held back by a rule's cooldown
    pub cooldown_suppressed: AtomicU64,

    /// Matches whose every recipient opted out
    pub preference_suppressed: AtomicU64,

    /// Individual emails accepted by the provider
    pub emails_sent: AtomicU64,

    /// In-app notifications enqueued
    pub notifications_created: AtomicU64,

    /// Delivery events applied to alert history
    pub delivery_events: AtomicU64,

    /// Scheduler ticks completed
    pub ticks: AtomicU64,
}

impl AlertMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AlertMetricsSnapshot {
        AlertMetricsSnapshot {
            rules_evaluated: self.rules_evaluated.load(Ordering::Relaxed),
            alerts_sent: self.alerts_sent.load(Ordering::Relaxed),
            alerts_failed: self.alerts_failed.load(Ordering::Relaxed),
            cooldown_suppressed: self.cooldown_suppressed.load(Ordering::Relaxed),
            preference_suppressed: self.preference_suppressed.load(Ordering::Relaxed),
            emails_sent: self.emails_sent.load(Ordering::Relaxed),
            notifications_created: self.notifications_created.load(Ordering::Relaxed),
            delivery_events: self.delivery_events.load(Ordering::Relaxed),
            ticks: self.ticks.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertMetricsSnapshot {
    pub rules_evaluated: u64,
    pub alerts_sent: u64,
    pub alerts_failed: u64,
    pub cooldown_suppressed: u64,
    pub preference_suppressed: u64,
    pub emails_sent: u64,
    pub notifications_created: u64,
    pub delivery_events: u64,
    pub ticks: u64,
}
