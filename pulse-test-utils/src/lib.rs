//! Pulse Test Utilities
//!
//! Shared test infrastructure for the Pulse workspace:
//! - Proptest generators for entities and configuration
//! - A scripted HTTP transport standing in for provider APIs
//! - A recording email sender
//! - Fixtures for tenants, customers, connections and rules
//! - Assertions on the error taxonomy

pub use pulse_storage::MemoryStore;

pub use pulse_core::{
    AlertChannel, AlertConditions, AlertRule, AlertRuleId, BillingInterval, ConnectionId,
    ConnectionMetadata, ConnectionStatus, Customer, CustomerId, CustomerUpsert, ErrorKind,
    IntegrationConnection, Payment, PaymentStatus, Provider, ProviderCredentials, PulseError,
    PulseResult, RiskLevel, ScoringConfig, Subscription, Tenant, TenantId, Timestamp, TriggerType,
    User, UserId,
};

use async_trait::async_trait;
use chrono::Utc;
use pulse_alerts::{EmailMessage, EmailSender};
use pulse_integrations::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, TokenCipher};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

// ============================================================================
// SCRIPTED HTTP TRANSPORT
// ============================================================================

struct Route {
    method: HttpMethod,
    url_fragment: String,
    responses: VecDeque<HttpResponse>,
    repeat: bool,
}

/// [`HttpTransport`] answering from scripted responses.
///
/// Routes match on method and a URL substring, in registration order.
/// One-shot routes are consumed; repeating routes answer forever.
/// Unmatched requests get a 404 so a missing script fails loudly.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next matching request with `response`.
    pub fn on(&self, method: HttpMethod, url_fragment: &str, response: HttpResponse) -> &Self {
        self.push(method, url_fragment, response, false)
    }

    /// Answer every matching request with `response`.
    pub fn always(&self, method: HttpMethod, url_fragment: &str, response: HttpResponse) -> &Self {
        self.push(method, url_fragment, response, true)
    }

    pub fn on_json(&self, method: HttpMethod, url_fragment: &str, status: u16, body: Value) -> &Self {
        self.on(method, url_fragment, HttpResponse::json(status, &body))
    }

    fn push(&self, method: HttpMethod, url_fragment: &str, response: HttpResponse, repeat: bool) -> &Self {
        let mut routes = self.routes.lock().unwrap();
        routes.push(Route {
            method,
            url_fragment: url_fragment.to_string(),
            responses: VecDeque::from([response]),
            repeat,
        });
        drop(routes);
        self
    }

    /// Every request sent so far.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url_fragment: &str) -> Vec<HttpRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.contains(url_fragment))
            .collect()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, _provider: &str, request: HttpRequest) -> PulseResult<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        let matched = routes.iter_mut().find(|route| {
            route.method == request.method
                && request.url.contains(&route.url_fragment)
                && !route.responses.is_empty()
        });
        let response = match matched {
            Some(route) if route.repeat => route.responses.front().cloned(),
            Some(route) => route.responses.pop_front(),
            None => None,
        };
        Ok(response.unwrap_or_else(|| {
            HttpResponse::json(404, &serde_json::json!({"error": format!("unscripted {}", request.url)}))
        }))
    }
}

// ============================================================================
// RECORDING EMAIL SENDER
// ============================================================================

/// [`EmailSender`] that records messages and can be scripted to fail.
#[derive(Default)]
pub struct RecordingEmailSender {
    sent: Mutex<Vec<EmailMessage>>,
    failures: Mutex<VecDeque<PulseError>>,
    attempts: Mutex<usize>,
}

impl RecordingEmailSender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next send with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: PulseError) -> &Self {
        self.failures.lock().unwrap().push_back(error);
        self
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &str) -> Vec<EmailMessage> {
        self.sent()
            .into_iter()
            .filter(|m| m.to == recipient)
            .collect()
    }

    /// Sends attempted, failed ones included.
    pub fn attempts(&self) -> usize {
        *self.attempts.lock().unwrap()
    }
}

#[async_trait]
impl EmailSender for RecordingEmailSender {
    async fn send(&self, message: &EmailMessage) -> PulseResult<String> {
        *self.attempts.lock().unwrap() += 1;
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(message.clone());
        Ok(format!("msg_{}", sent.len()))
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for Pulse types.

    use super::*;
    use pulse_core::constants::DEFAULT_FACTOR_WEIGHTS;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    /// Timestamps between 2020 and 2030.
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64).prop_map(|secs| {
            chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now)
        })
    }

    pub fn arb_provider() -> impl Strategy<Value = Provider> {
        prop_oneof![
            Just(Provider::Stripe),
            Just(Provider::Hubspot),
            Just(Provider::Intercom),
        ]
    }

    pub fn arb_billing_interval() -> impl Strategy<Value = BillingInterval> {
        prop_oneof![
            Just(BillingInterval::Day),
            Just(BillingInterval::Week),
            Just(BillingInterval::Month),
            Just(BillingInterval::Year),
        ]
    }

    pub fn arb_risk_level() -> impl Strategy<Value = RiskLevel> {
        prop_oneof![
            Just(RiskLevel::Green),
            Just(RiskLevel::Yellow),
            Just(RiskLevel::Red),
        ]
    }

    pub fn arb_score() -> impl Strategy<Value = i32> {
        0i32..=100
    }

    /// Printable token strings, including empty.
    pub fn arb_token() -> impl Strategy<Value = String> {
        "[ -~]{0,256}"
    }

    /// Normalized factor values in [0,1].
    pub fn arb_factor_value() -> impl Strategy<Value = f64> {
        (0u32..=1000).prop_map(|n| f64::from(n) / 1000.0)
    }

    /// Weights over the standard factor names, summing to 1.
    pub fn arb_weights() -> impl Strategy<Value = BTreeMap<String, f64>> {
        prop::collection::vec(1u32..100, DEFAULT_FACTOR_WEIGHTS.len()).prop_map(|raw| {
            let total: u32 = raw.iter().sum();
            DEFAULT_FACTOR_WEIGHTS
                .iter()
                .zip(raw)
                .map(|((name, _), w)| (name.to_string(), f64::from(w) / f64::from(total)))
                .collect()
        })
    }

    /// Any subset of factor names present with a value.
    pub fn arb_factor_values() -> impl Strategy<Value = BTreeMap<String, f64>> {
        prop::collection::vec(prop::option::of(arb_factor_value()), DEFAULT_FACTOR_WEIGHTS.len())
            .prop_map(|values| {
                DEFAULT_FACTOR_WEIGHTS
                    .iter()
                    .zip(values)
                    .filter_map(|((name, _), v)| v.map(|v| (name.to_string(), v)))
                    .collect()
            })
    }

    /// `(amount_cents, interval, interval_count)` for a subscription price.
    pub fn arb_price() -> impl Strategy<Value = (i64, BillingInterval, i32)> {
        (0i64..10_000_000, arb_billing_interval(), 1i32..=12)
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built records for common scenarios.

    use super::*;
    use chrono::Duration;
    use pulse_core::JsonMap;
    use pulse_storage::Store;
    use uuid::Uuid;

    pub const TEST_KEY: [u8; 32] = [7u8; 32];

    pub fn cipher() -> TokenCipher {
        TokenCipher::new(&TEST_KEY)
    }

    pub fn credentials(provider: Provider) -> ProviderCredentials {
        ProviderCredentials {
            client_id: format!("{}-client", provider),
            client_secret: format!("{}-secret", provider),
            oauth_redirect_url: format!("https://pulse.test/oauth/{}/callback", provider),
            webhook_secret: format!("whsec_{}", provider),
        }
    }

    pub fn tenant(name: &str) -> Tenant {
        Tenant {
            id: TenantId::now_v7(),
            name: name.to_string(),
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn user(tenant_id: TenantId, email: &str) -> User {
        User {
            id: UserId::now_v7(),
            tenant_id,
            email: email.to_string(),
            name: None,
            created_at: Utc::now(),
        }
    }

    /// Active connection whose access token expires at `expires_at`.
    pub fn connection(
        tenant_id: TenantId,
        provider: Provider,
        account_id: &str,
        expires_at: Option<Timestamp>,
    ) -> IntegrationConnection {
        let cipher = cipher();
        let now = Utc::now();
        IntegrationConnection {
            id: ConnectionId::now_v7(),
            tenant_id,
            provider,
            access_token_ciphertext: cipher.encrypt("access-token").unwrap_or_default(),
            refresh_token_ciphertext: cipher.encrypt("refresh-token").ok(),
            token_expires_at: expires_at,
            external_account_id: Some(account_id.to_string()),
            scopes: Vec::new(),
            status: ConnectionStatus::Active,
            last_sync_at: None,
            last_sync_error: None,
            metadata: ConnectionMetadata::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn subscription(
        customer: &Customer,
        external_id: &str,
        status: &str,
        amount_cents: i64,
        interval: BillingInterval,
    ) -> Subscription {
        Subscription {
            id: Uuid::now_v7(),
            tenant_id: customer.tenant_id,
            provider: Provider::Stripe,
            external_id: external_id.to_string(),
            customer_id: customer.id,
            status: status.to_string(),
            amount_cents,
            currency: Some("USD".into()),
            interval,
            interval_count: 1,
            current_period_end: Some(Utc::now() + Duration::days(30)),
            canceled_at: None,
            metadata: JsonMap::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn payment(customer: &Customer, external_id: &str, status: PaymentStatus, occurred_at: Timestamp) -> Payment {
        Payment {
            id: Uuid::now_v7(),
            tenant_id: customer.tenant_id,
            provider: Provider::Stripe,
            external_id: external_id.to_string(),
            customer_id: customer.id,
            amount_cents: 5_000,
            currency: Some("USD".into()),
            status,
            failure_reason: (status == PaymentStatus::Failed).then(|| "card_declined".to_string()),
            occurred_at,
            metadata: JsonMap::new(),
        }
    }

    pub fn alert_rule(
        tenant_id: TenantId,
        trigger_type: TriggerType,
        conditions: AlertConditions,
        recipients: &[&str],
    ) -> AlertRule {
        let now = Utc::now();
        AlertRule {
            id: AlertRuleId::now_v7(),
            tenant_id,
            name: format!("{} rule", trigger_type),
            description: None,
            trigger_type,
            conditions,
            channel: AlertChannel::Email,
            recipients: recipients.iter().map(|r| r.to_string()).collect(),
            is_active: true,
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Store seeded with one tenant.
    pub async fn seeded_store(name: &str) -> (MemoryStore, Tenant) {
        let store = MemoryStore::new();
        let tenant = tenant(name);
        store
            .repo()
            .create_tenant(&tenant)
            .await
            .expect("seed tenant");
        (store, tenant)
    }

    /// Insert a customer by upsert and return the stored row.
    pub async fn seed_customer(
        store: &MemoryStore,
        tenant_id: TenantId,
        provider: Provider,
        external_id: &str,
        email: Option<&str>,
        seen_at: Timestamp,
    ) -> Customer {
        let upsert = CustomerUpsert::new(provider, external_id, seen_at)
            .with_email(email.map(str::to_string));
        store
            .repo()
            .upsert_customer_by_external(tenant_id, &upsert)
            .await
            .expect("seed customer")
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions on the error taxonomy.

    use super::*;

    /// Assert that `result` failed with the given taxonomy kind.
    #[track_caller]
    pub fn assert_kind<T: std::fmt::Debug>(result: &PulseResult<T>, kind: ErrorKind) {
        match result {
            Err(err) => assert_eq!(err.kind(), kind, "unexpected error kind for {:?}", err),
            Ok(value) => panic!("Expected {:?} error, got Ok({:?})", kind, value),
        }
    }

    #[track_caller]
    pub fn assert_ok<T: std::fmt::Debug>(result: &PulseResult<T>) {
        assert!(result.is_ok(), "Expected Ok, got Err: {:?}", result);
    }
}
