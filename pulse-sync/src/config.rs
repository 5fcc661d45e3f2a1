//! Sync scheduler configuration.

use pulse_core::constants::{
    DEFAULT_SYNC_INTERVAL_MINUTES, DEFAULT_SYNC_TIMEOUT_MINUTES, DEFAULT_SYNC_WINDOW_DAYS,
    DEFAULT_WEBHOOK_RETENTION_DAYS, MAX_CONSECUTIVE_SYNC_FAILURES,
};
use pulse_core::PulseConfig;
use std::time::Duration;

/// Configuration for the sync orchestrator and its ticker.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// How often connections are scanned (default: 15 minutes)
    pub interval: Duration,

    /// Deadline for one `(tenant, provider)` job (default: 10 minutes)
    pub job_timeout: Duration,

    /// Rolling window for payment and conversation pulls (default: 90 days)
    pub window_days: i64,

    /// Consecutive failures before a connection is disconnected (default: 5)
    pub max_consecutive_failures: u32,

    /// Webhook idempotency rows older than this are pruned (default: 30 days)
    pub webhook_retention_days: i64,

    /// Jobs run concurrently within one tick (default: 4)
    pub max_concurrent_jobs: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_MINUTES * 60),
            job_timeout: Duration::from_secs(DEFAULT_SYNC_TIMEOUT_MINUTES * 60),
            window_days: DEFAULT_SYNC_WINDOW_DAYS,
            max_consecutive_failures: MAX_CONSECUTIVE_SYNC_FAILURES,
            webhook_retention_days: DEFAULT_WEBHOOK_RETENTION_DAYS,
            max_concurrent_jobs: 4,
        }
    }
}

impl SyncConfig {
    /// Take the sync-related options from the process configuration.
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            interval: config.sync_interval,
            job_timeout: config.sync_timeout,
            window_days: config.sync_window_days,
            webhook_retention_days: config.webhook_retention_days,
            ..Self::default()
        }
    }

    /// Short intervals for local runs.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(60),
            job_timeout: Duration::from_secs(120),
            ..Self::default()
        }
    }
}
