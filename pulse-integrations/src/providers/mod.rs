//! Provider adapters: billing (Stripe), CRM (HubSpot), support (Intercom).

pub mod hubspot;
pub mod intercom;
pub mod stripe;

pub use hubspot::HubspotAdapter;
pub use intercom::IntercomAdapter;
pub use stripe::StripeAdapter;

use crate::client::ProviderClient;
use crate::credentials::{CredentialManager, OAuthSettings};
use crate::crypto::TokenCipher;
use crate::transport::HttpTransport;
use crate::webhook::WebhookPipeline;
use chrono::{DateTime, TimeZone, Utc};
use pulse_core::constants::DEFAULT_SYNC_WINDOW_DAYS;
use pulse_core::{
    Customer, CustomerUpsert, JsonMap, Provider, ProviderCredentials, PulseError, PulseResult,
    TenantId, Timestamp,
};
use pulse_storage::{Repository, Store};
use serde_json::Value;
use std::sync::Arc;

/// Collaborators every adapter is built from.
#[derive(Clone)]
pub struct AdapterDeps {
    pub store: Arc<dyn Store>,
    pub transport: Arc<dyn HttpTransport>,
    pub cipher: Arc<TokenCipher>,
    pub pipeline: Arc<WebhookPipeline>,
    /// Rolling window for conversation and payment pulls.
    pub window_days: i64,
}

impl AdapterDeps {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn HttpTransport>,
        cipher: Arc<TokenCipher>,
    ) -> Self {
        let pipeline = Arc::new(WebhookPipeline::new(store.clone()));
        Self {
            store,
            transport,
            cipher,
            pipeline,
            window_days: DEFAULT_SYNC_WINDOW_DAYS,
        }
    }

    pub fn with_window_days(mut self, days: i64) -> Self {
        self.window_days = days;
        self
    }

    /// API client plus credential manager for `provider`.
    fn wire(&self, provider: Provider, api_base: &str, credentials: ProviderCredentials) -> (ProviderClient, CredentialManager) {
        let client = ProviderClient::new(provider, api_base, self.transport.clone());
        let manager = CredentialManager::new(
            OAuthSettings::for_provider(provider, credentials),
            self.store.clone(),
            self.cipher.clone(),
            client.clone(),
        );
        (client, manager)
    }
}

/// Result of applying one provider object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Applied {
    pub customer: Option<pulse_core::CustomerId>,
    pub events: usize,
}

impl Applied {
    pub fn skipped() -> Self {
        Self::default()
    }

    pub fn customer(customer: pulse_core::CustomerId) -> Self {
        Self {
            customer: Some(customer),
            events: 0,
        }
    }

    pub fn count(&mut self, appended: bool) {
        if appended {
            self.events += 1;
        }
    }
}

// ============================================================================
// JSON HELPERS
// ============================================================================

pub(crate) fn str_of(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub(crate) fn require_str(provider: Provider, value: &Value, key: &str) -> PulseResult<String> {
    str_of(value, key).ok_or_else(|| {
        PulseError::validation(format!("{}.{}", provider, key), "missing or not a string")
    })
}

/// Unix seconds, as number or numeric string.
pub(crate) fn unix_secs(value: Option<&Value>) -> Option<Timestamp> {
    let secs = match value? {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    Utc.timestamp_opt(secs, 0).single()
}

/// RFC 3339 string or unix milliseconds.
pub(crate) fn flexible_time(value: Option<&Value>) -> Option<Timestamp> {
    match value? {
        Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
            .map(|t| t.with_timezone(&Utc))
            .ok()
            .or_else(|| s.trim().parse::<i64>().ok().and_then(|ms| Utc.timestamp_millis_opt(ms).single())),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

pub(crate) fn object_map(value: Option<&Value>) -> JsonMap {
    match value {
        Some(Value::Object(map)) => map.clone(),
        _ => JsonMap::new(),
    }
}

/// Decimal amount string (`"1500.50"`) to minor units.
pub(crate) fn decimal_to_cents(value: Option<&Value>) -> Option<i64> {
    let amount = match value? {
        Value::String(s) if !s.trim().is_empty() => s.trim().parse::<f64>().ok()?,
        Value::Number(n) => n.as_f64()?,
        _ => return None,
    };
    amount.is_finite().then(|| (amount * 100.0).round() as i64)
}

// ============================================================================
// CUSTOMER RESOLUTION
// ============================================================================

/// Live customer for `(provider, external_id)`, creating a stub when a
/// webhook or child object arrives before the bulk pull has seen it.
pub(crate) async fn ensure_customer(
    repo: &dyn Repository,
    tenant_id: TenantId,
    provider: Provider,
    external_id: &str,
    seen_at: Timestamp,
) -> PulseResult<Customer> {
    if let Some(existing) = repo
        .find_customer_by_external(tenant_id, provider, external_id)
        .await?
    {
        return Ok(existing);
    }
    tracing::debug!(
        tenant_id = %tenant_id,
        provider = %provider,
        external_id,
        "Creating stub customer"
    );
    repo.upsert_customer_by_external(tenant_id, &CustomerUpsert::new(provider, external_id, seen_at))
        .await
}

/// Soft-delete the customer for `(provider, external_id)` if present.
pub(crate) async fn soft_delete_customer(
    repo: &dyn Repository,
    tenant_id: TenantId,
    provider: Provider,
    external_id: &str,
    at: Timestamp,
) -> PulseResult<Option<pulse_core::CustomerId>> {
    let Some(mut customer) = repo
        .find_customer_by_external(tenant_id, provider, external_id)
        .await?
    else {
        return Ok(None);
    };
    customer.deleted_at = Some(at);
    customer.updated_at = at;
    repo.update_customer(&customer).await?;
    Ok(Some(customer.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_time_parsing() {
        let t = unix_secs(Some(&json!(1_700_000_000))).unwrap();
        assert_eq!(t.timestamp(), 1_700_000_000);
        assert_eq!(unix_secs(Some(&json!("1700000000"))), Some(t));
        assert_eq!(unix_secs(Some(&json!(null))), None);

        let iso = flexible_time(Some(&json!("2024-03-01T12:00:00.000Z"))).unwrap();
        assert_eq!(iso.timestamp(), 1_709_294_400);
        let ms = flexible_time(Some(&json!(1_709_294_400_000i64))).unwrap();
        assert_eq!(ms, iso);
    }

    #[test]
    fn test_decimal_to_cents() {
        assert_eq!(decimal_to_cents(Some(&json!("1500.50"))), Some(150_050));
        assert_eq!(decimal_to_cents(Some(&json!(12))), Some(1200));
        assert_eq!(decimal_to_cents(Some(&json!(""))), None);
        assert_eq!(decimal_to_cents(None), None);
    }

    #[test]
    fn test_str_of_ignores_blank() {
        let v = json!({"a": " x ", "b": "", "c": 3});
        assert_eq!(str_of(&v, "a").as_deref(), Some("x"));
        assert_eq!(str_of(&v, "b"), None);
        assert_eq!(str_of(&v, "c"), None);
    }
}
