//! Alert engine settings.

use pulse_core::constants::{
    DEFAULT_ALERT_COOLDOWN_HOURS, DEFAULT_ALERT_INTERVAL_MINUTES, EMAIL_RETRY_BASE_DELAY_MS,
    EMAIL_SEND_MAX_ATTEMPTS,
};
use pulse_core::PulseConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AlertSettings {
    /// How often every tenant's active rules are evaluated (default: 5 minutes)
    pub interval: Duration,

    /// Cooldown for rules without `cooldown_hours` (default: 24)
    pub default_cooldown_hours: i64,

    /// Attempts per recipient within one pass (default: 3)
    pub max_send_attempts: u32,

    /// First backoff between attempts; doubles after each (default: 1s)
    pub retry_base_delay: Duration,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_ALERT_INTERVAL_MINUTES * 60),
            default_cooldown_hours: DEFAULT_ALERT_COOLDOWN_HOURS,
            max_send_attempts: EMAIL_SEND_MAX_ATTEMPTS,
            retry_base_delay: Duration::from_millis(EMAIL_RETRY_BASE_DELAY_MS),
        }
    }
}

impl AlertSettings {
    pub fn from_config(config: &PulseConfig) -> Self {
        Self {
            interval: config.alert_interval,
            default_cooldown_hours: config.default_alert_cooldown_hours,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = AlertSettings::default();
        assert_eq!(settings.interval, Duration::from_secs(300));
        assert_eq!(settings.default_cooldown_hours, 24);
        assert_eq!(settings.max_send_attempts, 3);
        assert_eq!(settings.retry_base_delay, Duration::from_secs(1));
    }

    #[test]
    fn test_from_config_overrides_schedule() {
        let config = PulseConfig::from_lookup(|key| match key {
            "PULSE_ALERT_INTERVAL_MINUTES" => Some("2".into()),
            "PULSE_DEFAULT_ALERT_COOLDOWN_HOURS" => Some("6".into()),
            _ => None,
        });
        let settings = AlertSettings::from_config(&config);
        assert_eq!(settings.interval, Duration::from_secs(120));
        assert_eq!(settings.default_cooldown_hours, 6);
    }
}
