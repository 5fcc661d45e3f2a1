//! Scoring engine settings.

use pulse_core::constants::{
    DEFAULT_SCORE_HISTORY_RETENTION_DAYS, DEFAULT_SCORING_INTERVAL_MINUTES,
    DEFAULT_SCORING_WORKERS, DEFAULT_SIGNIFICANT_SCORE_DELTA,
};
use pulse_core::PulseConfig;
use std::time::Duration;

/// Process-wide scoring settings. Per-tenant weights and thresholds live in
/// [`pulse_core::ScoringConfig`].
#[derive(Debug, Clone)]
pub struct ScoringSettings {
    /// How often every tenant is rescored (default: 60 minutes)
    pub interval: Duration,

    /// Concurrent customer calculations per tenant (default: 5)
    pub workers: usize,

    /// History snapshots older than this are pruned (default: 365 days)
    pub history_retention_days: i64,

    /// Minimum |Δ| that emits `score.changed` (default: 10)
    pub significant_delta: i32,
}

impl Default for ScoringSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SCORING_INTERVAL_MINUTES * 60),
            workers: DEFAULT_SCORING_WORKERS,
            history_retention_days: DEFAULT_SCORE_HISTORY_RETENTION_DAYS,
            significant_delta: DEFAULT_SIGNIFICANT_SCORE_DELTA,
        }
    }
}

impl ScoringSettings {
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            interval: config.scoring_interval,
            workers: config.scoring_workers.max(1),
            history_retention_days: config.score_history_retention_days,
            significant_delta: config.significant_score_delta,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ScoringSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(3600));
        assert_eq!(settings.workers, 5);
        assert_eq!(settings.history_retention_days, 365);
        assert_eq!(settings.significant_delta, 10);
    }

    #[test]
    fn test_zero_workers_is_clamped() {
        let config = PulseConfig::from_lookup(|key| {
            (key == "PULSE_SCORING_WORKERS").then(|| "0".to_string())
        });
        assert_eq!(ScoringSettings::from_config(&config).workers, 1);
    }
}
