//! Tenant-scoped entity records

use crate::enums::*;
use crate::event::TimelineEvent;
use crate::identity::*;
use crate::metadata::{ConnectionMetadata, CustomerMetadata, JsonMap};
use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// TENANTS AND USERS
// ============================================================================

/// Identity anchor; owns every other entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub created_at: Timestamp,
    /// Tenants are tombstoned, never hard-deleted.
    pub deleted_at: Option<Timestamp>,
}

/// Operator profile. Alert recipients are resolved against these rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub tenant_id: TenantId,
    pub email: String,
    pub name: Option<String>,
    pub created_at: Timestamp,
}

// ============================================================================
// INTEGRATION CONNECTIONS
// ============================================================================

/// Authenticated binding between a tenant and a provider.
///
/// Tokens are held as ciphertext only; plaintext never leaves the
/// credential manager's stack frames.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConnection {
    pub id: ConnectionId,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub access_token_ciphertext: String,
    pub refresh_token_ciphertext: Option<String>,
    pub token_expires_at: Option<Timestamp>,
    pub external_account_id: Option<String>,
    pub scopes: Vec<String>,
    pub status: ConnectionStatus,
    pub last_sync_at: Option<Timestamp>,
    pub last_sync_error: Option<String>,
    pub metadata: ConnectionMetadata,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

// ============================================================================
// CUSTOMERS AND TIMELINE
// ============================================================================

/// Subject of scoring, unique per `(tenant, source, external_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Customer {
    pub id: CustomerId,
    pub tenant_id: TenantId,
    pub source: Provider,
    pub external_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company_name: Option<String>,
    pub currency: Option<String>,
    /// Monthly recurring revenue in minor units.
    pub mrr_cents: i64,
    pub first_seen_at: Timestamp,
    pub last_seen_at: Timestamp,
    pub metadata: CustomerMetadata,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Customer {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Lower-cased email used as the dedup key.
    pub fn email_key(&self) -> Option<String> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_ascii_lowercase)
    }
}

/// Input for `upsert_customer_by_external`.
///
/// `None` leaves the stored value alone on update; `Some` overwrites it.
/// `namespace` replaces `metadata[source]` when present.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomerUpsert {
    pub source: Provider,
    pub external_id: String,
    pub name: Option<String>,
    pub email: Option<String>,
    pub company_name: Option<String>,
    pub currency: Option<String>,
    pub mrr_cents: Option<i64>,
    pub seen_at: Timestamp,
    pub namespace: Option<Value>,
}

impl CustomerUpsert {
    pub fn new(source: Provider, external_id: impl Into<String>, seen_at: Timestamp) -> Self {
        Self {
            source,
            external_id: external_id.into(),
            name: None,
            email: None,
            company_name: None,
            currency: None,
            mrr_cents: None,
            seen_at,
            namespace: None,
        }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    pub fn with_company(mut self, company_name: Option<String>) -> Self {
        self.company_name = company_name;
        self
    }

    pub fn with_currency(mut self, currency: Option<String>) -> Self {
        self.currency = currency;
        self
    }

    pub fn with_namespace(mut self, namespace: Value) -> Self {
        self.namespace = Some(namespace);
        self
    }

    /// Apply this upsert to an existing row (or a fresh one when `None`).
    pub fn apply(&self, tenant_id: TenantId, existing: Option<Customer>) -> Customer {
        let now = self.seen_at;
        let mut customer = existing.unwrap_or_else(|| Customer {
            id: CustomerId::now_v7(),
            tenant_id,
            source: self.source,
            external_id: self.external_id.clone(),
            name: None,
            email: None,
            company_name: None,
            currency: None,
            mrr_cents: 0,
            first_seen_at: now,
            last_seen_at: now,
            metadata: CustomerMetadata::default(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        });
        if let Some(name) = &self.name {
            customer.name = Some(name.clone());
        }
        if let Some(email) = &self.email {
            customer.email = Some(email.clone());
        }
        if let Some(company) = &self.company_name {
            customer.company_name = Some(company.clone());
        }
        if let Some(currency) = &self.currency {
            customer.currency = Some(currency.to_ascii_uppercase());
        }
        if let Some(mrr) = self.mrr_cents {
            customer.mrr_cents = mrr;
        }
        let source = self.source.as_db_str();
        match &self.namespace {
            Some(ns) => customer.metadata.set_namespace(source, ns.clone()),
            None => customer.metadata.add_source(source),
        }
        if now < customer.first_seen_at {
            customer.first_seen_at = now;
        }
        if now > customer.last_seen_at {
            customer.last_seen_at = now;
        }
        customer.deleted_at = None;
        customer.updated_at = now;
        customer
    }
}

/// Append-only timeline entry, idempotent on
/// `(tenant, source, external_event_id)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerEvent {
    pub id: CustomerEventId,
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub source: EventSource,
    pub external_event_id: String,
    pub event_type: String,
    pub occurred_at: Timestamp,
    pub data: Value,
    pub created_at: Timestamp,
}

impl CustomerEvent {
    /// Build a row from a typed payload.
    pub fn new(
        tenant_id: TenantId,
        customer_id: CustomerId,
        source: EventSource,
        external_event_id: impl Into<String>,
        occurred_at: Timestamp,
        event: &TimelineEvent,
    ) -> Self {
        Self {
            id: CustomerEventId::now_v7(),
            tenant_id,
            customer_id,
            source,
            external_event_id: external_event_id.into(),
            event_type: event.event_type().to_string(),
            occurred_at,
            data: event.data(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Typed view of `data`, if the event type is known.
    pub fn payload(&self) -> Option<TimelineEvent> {
        TimelineEvent::from_parts(&self.event_type, &self.data)
    }
}

// ============================================================================
// PROVIDER PROJECTIONS
// ============================================================================

/// Billing subscription projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub external_id: String,
    pub customer_id: CustomerId,
    /// Provider status string (`active`, `trialing`, `past_due`, `canceled`, ...).
    pub status: String,
    /// Price per interval in minor units, quantity included.
    pub amount_cents: i64,
    pub currency: Option<String>,
    pub interval: BillingInterval,
    pub interval_count: i32,
    pub current_period_end: Option<Timestamp>,
    pub canceled_at: Option<Timestamp>,
    pub metadata: JsonMap,
    pub updated_at: Timestamp,
}

impl Subscription {
    pub fn is_active(&self) -> bool {
        self.status == "active"
    }
}

/// Billing payment (charge) projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub external_id: String,
    pub customer_id: CustomerId,
    pub amount_cents: i64,
    pub currency: Option<String>,
    pub status: PaymentStatus,
    pub failure_reason: Option<String>,
    pub occurred_at: Timestamp,
    pub metadata: JsonMap,
}

/// Support conversation (or ticket) projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub external_id: String,
    pub customer_id: CustomerId,
    pub state: ConversationState,
    pub is_ticket: bool,
    pub title: Option<String>,
    pub opened_at: Timestamp,
    pub closed_at: Option<Timestamp>,
    pub metadata: JsonMap,
}

/// CRM deal projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DealSummary {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub external_id: String,
    pub customer_id: Option<CustomerId>,
    pub name: Option<String>,
    pub stage: Option<String>,
    pub amount_cents: Option<i64>,
    pub close_date: Option<Timestamp>,
    pub metadata: JsonMap,
    pub updated_at: Timestamp,
}

/// CRM contact projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactSummary {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub external_id: String,
    pub customer_id: CustomerId,
    pub email: Option<String>,
    pub name: Option<String>,
    pub company_external_id: Option<String>,
    pub metadata: JsonMap,
    pub updated_at: Timestamp,
}

/// CRM company projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanySummary {
    pub id: Uuid,
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub external_id: String,
    pub name: Option<String>,
    pub domain: Option<String>,
    pub metadata: JsonMap,
    pub updated_at: Timestamp,
}

// ============================================================================
// SCORING
// ============================================================================

/// Band cut-offs on the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub green: i32,
    pub yellow: i32,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            green: crate::constants::DEFAULT_GREEN_THRESHOLD,
            yellow: crate::constants::DEFAULT_YELLOW_THRESHOLD,
        }
    }
}

impl RiskThresholds {
    /// `overall ≥ green → green`; `overall ≥ yellow → yellow`; else red.
    pub fn band(&self, overall: i32) -> RiskLevel {
        if overall >= self.green {
            RiskLevel::Green
        } else if overall >= self.yellow {
            RiskLevel::Yellow
        } else {
            RiskLevel::Red
        }
    }
}

/// Per-tenant factor weights and band thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoringConfig {
    pub tenant_id: TenantId,
    pub weights: BTreeMap<String, f64>,
    pub thresholds: RiskThresholds,
    pub updated_at: Timestamp,
}

impl ScoringConfig {
    /// Default weights for the standard factor set.
    pub fn default_weights() -> BTreeMap<String, f64> {
        crate::constants::DEFAULT_FACTOR_WEIGHTS
            .iter()
            .map(|(name, weight)| (name.to_string(), *weight))
            .collect()
    }

    pub fn defaults_for(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            weights: Self::default_weights(),
            thresholds: RiskThresholds::default(),
            updated_at: chrono::Utc::now(),
        }
    }

    /// Weights in [0,1] summing to 1 ± 0.001; `100 ≥ green > yellow > 0`.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.weights.is_empty() {
            return Err(ValidationError::missing("weights"));
        }
        for (name, weight) in &self.weights {
            if !weight.is_finite() || !(0.0..=1.0).contains(weight) {
                return Err(ValidationError::invalid(
                    format!("weights.{}", name),
                    format!("weight {} is outside [0, 1]", weight),
                ));
            }
        }
        let sum: f64 = self.weights.values().sum();
        if (sum - 1.0).abs() > crate::constants::WEIGHT_SUM_TOLERANCE {
            return Err(ValidationError::ConstraintViolation {
                constraint: "weights_sum".into(),
                reason: format!("weights sum to {:.4}, expected 1.0", sum),
            });
        }
        let RiskThresholds { green, yellow } = self.thresholds;
        if !(green <= 100 && green > yellow && yellow > 0) {
            return Err(ValidationError::ConstraintViolation {
                constraint: "thresholds".into(),
                reason: format!(
                    "expected 100 >= green > yellow > 0, got green={} yellow={}",
                    green, yellow
                ),
            });
        }
        Ok(())
    }
}

/// Current health score, one per customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub overall_score: i32,
    pub risk_level: RiskLevel,
    /// Factor name to normalized score in [0,1], present factors only.
    pub factors: BTreeMap<String, f64>,
    pub calculated_at: Timestamp,
}

impl HealthScore {
    /// Present factor with the smallest value.
    pub fn weakest_factor(&self) -> Option<(&str, f64)> {
        self.factors
            .iter()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(name, value)| (name.as_str(), *value))
    }
}

/// Append-only score snapshot keyed by `(tenant, customer, calculated_at)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScoreHistory {
    pub tenant_id: TenantId,
    pub customer_id: CustomerId,
    pub overall_score: i32,
    pub risk_level: RiskLevel,
    pub factors: BTreeMap<String, f64>,
    pub calculated_at: Timestamp,
}

impl From<&HealthScore> for HealthScoreHistory {
    fn from(score: &HealthScore) -> Self {
        Self {
            tenant_id: score.tenant_id,
            customer_id: score.customer_id,
            overall_score: score.overall_score,
            risk_level: score.risk_level,
            factors: score.factors.clone(),
            calculated_at: score.calculated_at,
        }
    }
}

/// Customer row joined with its current score, for list views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerWithScore {
    pub customer: Customer,
    pub score: Option<HealthScore>,
}

/// Everything the customer detail view needs in one read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerDetail {
    pub customer: Customer,
    pub score: Option<HealthScore>,
    pub recent_events: Vec<CustomerEvent>,
    pub subscriptions: Vec<Subscription>,
}

// ============================================================================
// ALERTING
// ============================================================================

/// Typed view of an alert rule's `conditions` bag.
///
/// Which keys are required depends on the trigger type; unknown keys are
/// kept in `other`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertConditions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<RiskLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_hours: Option<i64>,
    #[serde(flatten)]
    pub other: JsonMap,
}

/// Operator-defined alert rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: AlertRuleId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    pub conditions: AlertConditions,
    pub channel: AlertChannel,
    pub recipients: Vec<String>,
    pub is_active: bool,
    pub created_by: Option<UserId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// One emitted alert; serves both audit and cooldown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertHistory {
    pub id: AlertHistoryId,
    pub tenant_id: TenantId,
    pub alert_rule_id: AlertRuleId,
    pub customer_id: Option<CustomerId>,
    pub channel: AlertChannel,
    pub status: AlertStatus,
    pub trigger_data: Value,
    pub provider_message_id: Option<String>,
    pub delivered_at: Option<Timestamp>,
    pub opened_at: Option<Timestamp>,
    pub clicked_at: Option<Timestamp>,
    pub bounced_at: Option<Timestamp>,
    pub error_message: Option<String>,
    pub created_at: Timestamp,
}

impl AlertHistory {
    pub fn pending(
        rule: &AlertRule,
        customer_id: Option<CustomerId>,
        trigger_data: Value,
        now: Timestamp,
    ) -> Self {
        Self {
            id: AlertHistoryId::now_v7(),
            tenant_id: rule.tenant_id,
            alert_rule_id: rule.id,
            customer_id,
            channel: rule.channel,
            status: AlertStatus::Pending,
            trigger_data,
            provider_message_id: None,
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            error_message: None,
            created_at: now,
        }
    }
}

/// Durable webhook idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub tenant_id: Option<TenantId>,
    pub provider: Provider,
    pub external_event_id: String,
    pub event_type: String,
    pub received_at: Timestamp,
}

/// Per-user, per-tenant notification switches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPreference {
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub email_enabled: bool,
    pub in_app_enabled: bool,
    pub digest_enabled: bool,
    pub digest_frequency: DigestFrequency,
    pub muted_rule_ids: Vec<AlertRuleId>,
}

impl NotificationPreference {
    /// Preferences implied by a missing row.
    pub fn defaults(user_id: UserId, tenant_id: TenantId) -> Self {
        Self {
            user_id,
            tenant_id,
            email_enabled: true,
            in_app_enabled: true,
            digest_enabled: false,
            digest_frequency: DigestFrequency::Weekly,
            muted_rule_ids: Vec::new(),
        }
    }

    pub fn allows_email(&self, rule_id: AlertRuleId) -> bool {
        self.email_enabled && !self.muted_rule_ids.contains(&rule_id)
    }

    pub fn allows_in_app(&self, rule_id: AlertRuleId) -> bool {
        self.in_app_enabled && !self.muted_rule_ids.contains(&rule_id)
    }
}

/// In-app notification queue entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    pub user_id: UserId,
    pub tenant_id: TenantId,
    pub notification_type: String,
    pub title: String,
    pub message: String,
    pub data: Value,
    pub read_at: Option<Timestamp>,
    pub created_at: Timestamp,
}
