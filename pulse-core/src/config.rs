//! Environment configuration
//!
//! All options are read from `PULSE_*` environment variables. Anything with
//! a sensible default falls back to it; required secrets are checked by
//! [`PulseConfig::validate`].

use crate::constants::*;
use crate::enums::Provider;
use crate::error::ConfigError;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// OAuth client + webhook secret for one provider family.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub oauth_redirect_url: String,
    pub webhook_secret: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("oauth_redirect_url", &self.oauth_redirect_url)
            .field("webhook_secret", &"[REDACTED]")
            .finish()
    }
}

/// Outbound email provider settings.
#[derive(Clone, PartialEq, Eq)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_email: String,
    pub api_url: String,
}

impl fmt::Debug for EmailConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmailConfig")
            .field("api_key", &"[REDACTED]")
            .field("from_email", &self.from_email)
            .field("api_url", &self.api_url)
            .finish()
    }
}

/// Process-wide configuration.
#[derive(Clone)]
pub struct PulseConfig {
    pub database_url: String,
    pub db_pool_size: usize,
    /// Hex-encoded 256-bit key for token encryption.
    pub token_encryption_key: String,
    pub stripe: Option<ProviderCredentials>,
    pub hubspot: Option<ProviderCredentials>,
    pub intercom: Option<ProviderCredentials>,
    pub email: EmailConfig,
    pub sync_interval: Duration,
    pub sync_timeout: Duration,
    pub sync_window_days: i64,
    pub scoring_interval: Duration,
    pub scoring_workers: usize,
    pub score_history_retention_days: i64,
    pub alert_interval: Duration,
    pub default_alert_cooldown_hours: i64,
    pub significant_score_delta: i32,
    pub webhook_retention_days: i64,
    pub bind_addr: String,
}

impl fmt::Debug for PulseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PulseConfig")
            .field("database_url", &"[REDACTED]")
            .field("db_pool_size", &self.db_pool_size)
            .field("token_encryption_key", &"[REDACTED]")
            .field("stripe", &self.stripe)
            .field("hubspot", &self.hubspot)
            .field("intercom", &self.intercom)
            .field("email", &self.email)
            .field("sync_interval", &self.sync_interval)
            .field("sync_timeout", &self.sync_timeout)
            .field("scoring_interval", &self.scoring_interval)
            .field("alert_interval", &self.alert_interval)
            .field("bind_addr", &self.bind_addr)
            .finish_non_exhaustive()
    }
}

impl PulseConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    /// - `PULSE_DATABASE_URL`: PostgreSQL connection string (required)
    /// - `PULSE_DB_POOL_SIZE`: Maximum pool size (default: 16)
    /// - `PULSE_TOKEN_ENCRYPTION_KEY`: 64 hex chars (required)
    /// - `PULSE_{STRIPE,HUBSPOT,INTERCOM}_CLIENT_ID` / `_CLIENT_SECRET` /
    ///   `_OAUTH_REDIRECT_URL` / `_WEBHOOK_SECRET`: provider credentials;
    ///   a provider without a client id is not registered
    /// - `PULSE_EMAIL_API_KEY`, `PULSE_EMAIL_FROM`, `PULSE_EMAIL_API_URL`
    /// - `PULSE_SYNC_INTERVAL_MINUTES` (15), `PULSE_SYNC_TIMEOUT_MINUTES` (10),
    ///   `PULSE_SYNC_WINDOW_DAYS` (90)
    /// - `PULSE_SCORING_INTERVAL_MINUTES` (60), `PULSE_SCORING_WORKERS` (5),
    ///   `PULSE_SCORE_HISTORY_RETENTION_DAYS` (365)
    /// - `PULSE_ALERT_INTERVAL_MINUTES` (5), `PULSE_DEFAULT_ALERT_COOLDOWN_HOURS` (24),
    ///   `PULSE_SIGNIFICANT_SCORE_DELTA` (10)
    /// - `PULSE_WEBHOOK_RETENTION_DAYS` (30), `PULSE_BIND` (`0.0.0.0:3000`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let minutes = |key: &str, default: u64| {
            Duration::from_secs(parse_or(&lookup, key, default).saturating_mul(60))
        };

        Self {
            database_url: string("PULSE_DATABASE_URL", ""),
            db_pool_size: parse_or(&lookup, "PULSE_DB_POOL_SIZE", 16),
            token_encryption_key: string("PULSE_TOKEN_ENCRYPTION_KEY", ""),
            stripe: provider_credentials(&lookup, Provider::Stripe),
            hubspot: provider_credentials(&lookup, Provider::Hubspot),
            intercom: provider_credentials(&lookup, Provider::Intercom),
            email: EmailConfig {
                api_key: string("PULSE_EMAIL_API_KEY", ""),
                from_email: string("PULSE_EMAIL_FROM", ""),
                api_url: string("PULSE_EMAIL_API_URL", "https://api.sendgrid.com/v3/mail/send"),
            },
            sync_interval: minutes("PULSE_SYNC_INTERVAL_MINUTES", DEFAULT_SYNC_INTERVAL_MINUTES),
            sync_timeout: minutes("PULSE_SYNC_TIMEOUT_MINUTES", DEFAULT_SYNC_TIMEOUT_MINUTES),
            sync_window_days: parse_or(&lookup, "PULSE_SYNC_WINDOW_DAYS", DEFAULT_SYNC_WINDOW_DAYS),
            scoring_interval: minutes(
                "PULSE_SCORING_INTERVAL_MINUTES",
                DEFAULT_SCORING_INTERVAL_MINUTES,
            ),
            scoring_workers: parse_or(&lookup, "PULSE_SCORING_WORKERS", DEFAULT_SCORING_WORKERS),
            score_history_retention_days: parse_or(
                &lookup,
                "PULSE_SCORE_HISTORY_RETENTION_DAYS",
                DEFAULT_SCORE_HISTORY_RETENTION_DAYS,
            ),
            alert_interval: minutes("PULSE_ALERT_INTERVAL_MINUTES", DEFAULT_ALERT_INTERVAL_MINUTES),
            default_alert_cooldown_hours: parse_or(
                &lookup,
                "PULSE_DEFAULT_ALERT_COOLDOWN_HOURS",
                DEFAULT_ALERT_COOLDOWN_HOURS,
            ),
            significant_score_delta: parse_or(
                &lookup,
                "PULSE_SIGNIFICANT_SCORE_DELTA",
                DEFAULT_SIGNIFICANT_SCORE_DELTA,
            ),
            webhook_retention_days: parse_or(
                &lookup,
                "PULSE_WEBHOOK_RETENTION_DAYS",
                DEFAULT_WEBHOOK_RETENTION_DAYS,
            ),
            bind_addr: string("PULSE_BIND", "0.0.0.0:3000"),
        }
    }

    /// Check required values and ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "PULSE_DATABASE_URL".into(),
            });
        }
        self.token_key()?;
        for (field, value) in [
            ("PULSE_SYNC_INTERVAL_MINUTES", self.sync_interval),
            ("PULSE_SYNC_TIMEOUT_MINUTES", self.sync_timeout),
            ("PULSE_SCORING_INTERVAL_MINUTES", self.scoring_interval),
            ("PULSE_ALERT_INTERVAL_MINUTES", self.alert_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field: field.into(),
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.scoring_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "PULSE_SCORING_WORKERS".into(),
                reason: "must be greater than zero".into(),
            });
        }
        if self.significant_score_delta <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "PULSE_SIGNIFICANT_SCORE_DELTA".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }

    /// Decode the token encryption key.
    pub fn token_key(&self) -> Result<[u8; 32], ConfigError> {
        parse_hex_key(&self.token_encryption_key)
    }

    pub fn provider(&self, provider: Provider) -> Option<&ProviderCredentials> {
        match provider {
            Provider::Stripe => self.stripe.as_ref(),
            Provider::Hubspot => self.hubspot.as_ref(),
            Provider::Intercom => self.intercom.as_ref(),
        }
    }
}

/// Parse a 64-character hex string into a 256-bit key.
pub fn parse_hex_key(hex_key: &str) -> Result<[u8; 32], ConfigError> {
    let field = "PULSE_TOKEN_ENCRYPTION_KEY";
    if hex_key.is_empty() {
        return Err(ConfigError::MissingRequired { field: field.into() });
    }
    let bytes = hex::decode(hex_key.trim()).map_err(|e| ConfigError::InvalidValue {
        field: field.into(),
        reason: format!("not valid hex: {}", e),
    })?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| ConfigError::InvalidValue {
        field: field.into(),
        reason: format!("expected 32 bytes, got {}", bytes.len()),
    })
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn provider_credentials<F>(lookup: &F, provider: Provider) -> Option<ProviderCredentials>
where
    F: Fn(&str) -> Option<String>,
{
    let prefix = format!("PULSE_{}", provider.as_db_str().to_ascii_uppercase());
    let client_id = lookup(&format!("{}_CLIENT_ID", prefix)).filter(|s| !s.is_empty())?;
    let get = |suffix: &str| lookup(&format!("{}_{}", prefix, suffix)).unwrap_or_default();
    Some(ProviderCredentials {
        client_id,
        client_secret: get("CLIENT_SECRET"),
        oauth_redirect_url: get("OAUTH_REDIRECT_URL"),
        webhook_secret: get("WEBHOOK_SECRET"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";

    fn config_from(pairs: &[(&str, &str)]) -> PulseConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PulseConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.sync_interval, Duration::from_secs(15 * 60));
        assert_eq!(config.sync_timeout, Duration::from_secs(10 * 60));
        assert_eq!(config.alert_interval, Duration::from_secs(5 * 60));
        assert_eq!(config.scoring_workers, 5);
        assert_eq!(config.default_alert_cooldown_hours, 24);
        assert_eq!(config.significant_score_delta, 10);
        assert!(config.stripe.is_none());
    }

    #[test]
    fn test_validate_requires_database_and_key() {
        let config = config_from(&[]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));

        let config = config_from(&[
            ("PULSE_DATABASE_URL", "postgres://localhost/pulse"),
            ("PULSE_TOKEN_ENCRYPTION_KEY", KEY),
        ]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_key_must_be_32_bytes_of_hex() {
        assert!(parse_hex_key(KEY).is_ok());
        assert!(matches!(
            parse_hex_key("abcd"),
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(
            parse_hex_key(&"zz".repeat(32)),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_provider_registration_requires_client_id() {
        let config = config_from(&[
            ("PULSE_HUBSPOT_CLIENT_ID", "hub-client"),
            ("PULSE_HUBSPOT_CLIENT_SECRET", "shh"),
            ("PULSE_INTERCOM_CLIENT_SECRET", "orphan"),
        ]);
        let hubspot = config.provider(Provider::Hubspot).unwrap();
        assert_eq!(hubspot.client_id, "hub-client");
        assert!(config.provider(Provider::Intercom).is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = config_from(&[
            ("PULSE_STRIPE_CLIENT_ID", "ca_123"),
            ("PULSE_STRIPE_CLIENT_SECRET", "sk_live_secret"),
            ("PULSE_TOKEN_ENCRYPTION_KEY", KEY),
            ("PULSE_EMAIL_API_KEY", "SG.secret"),
        ]);
        let debug = format!("{:?}", config);
        assert!(!debug.contains("sk_live_secret"));
        assert!(!debug.contains(KEY));
        assert!(!debug.contains("SG.secret"));
        assert!(debug.contains("ca_123"));
    }

    #[test]
    fn test_zero_interval_is_rejected() {
        let config = config_from(&[
            ("PULSE_DATABASE_URL", "postgres://localhost/pulse"),
            ("PULSE_TOKEN_ENCRYPTION_KEY", KEY),
            ("PULSE_ALERT_INTERVAL_MINUTES", "0"),
        ]);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
