//! Billing adapter (Stripe Connect).

use super::{ensure_customer, object_map, require_str, soft_delete_customer, str_of, unix_secs, AdapterDeps, Applied};
use crate::adapter::{emit, window_start, IntegrationAdapter, PullRequest, PullSummary, SyncProgress};
use crate::client::ProviderClient;
use crate::credentials::CredentialManager;
use crate::mrr::recompute_customer_mrr;
use crate::signature::verify_stripe;
use crate::webhook::{InboundWebhook, WebhookEffect, WebhookEnvelope, WebhookOutcome, WebhookPipeline};
use async_trait::async_trait;
use chrono::Utc;
use pulse_core::constants::CONSECUTIVE_PAYMENT_FAILURES_ALERT;
use pulse_core::{
    BillingInterval, CustomerChangeHook, CustomerId, CustomerUpsert, IntegrationError, ObjectKind,
    OpContext, Payment, PaymentStatus, Provider, ProviderCredentials, PulseError, PulseResult,
    Subscription, TenantId, TimelineEvent, Timestamp,
};
use pulse_storage::{Repository, Store};
use serde_json::{json, Value};
use std::sync::{Arc, OnceLock};
use uuid::Uuid;

pub const STRIPE_API_BASE: &str = "https://api.stripe.com";

const PAGE_LIMIT: &str = "100";

const OBJECT_KINDS: &[ObjectKind] = &[
    ObjectKind::Customers,
    ObjectKind::Subscriptions,
    ObjectKind::Charges,
];

pub struct StripeAdapter {
    store: Arc<dyn Store>,
    client: ProviderClient,
    credentials: CredentialManager,
    pipeline: Arc<WebhookPipeline>,
    window_days: i64,
    change_hook: OnceLock<Arc<dyn CustomerChangeHook>>,
}

impl StripeAdapter {
    pub fn new(deps: &AdapterDeps, credentials: ProviderCredentials) -> Self {
        let (client, manager) = deps.wire(Provider::Stripe, STRIPE_API_BASE, credentials);
        Self {
            store: deps.store.clone(),
            client,
            credentials: manager,
            pipeline: deps.pipeline.clone(),
            window_days: deps.window_days,
            change_hook: OnceLock::new(),
        }
    }

    /// Register the callback run for customers a webhook changed. Only the
    /// first registration takes effect.
    pub fn set_change_hook(&self, hook: Arc<dyn CustomerChangeHook>) {
        if self.change_hook.set(hook).is_err() {
            tracing::warn!("Billing change hook already registered");
        }
    }

    async fn apply_object(
        &self,
        repo: &dyn Repository,
        tenant_id: TenantId,
        kind: ObjectKind,
        object: &Value,
    ) -> PulseResult<Applied> {
        match kind {
            ObjectKind::Customers => apply_customer(repo, tenant_id, object).await,
            ObjectKind::Subscriptions => apply_subscription(repo, tenant_id, object).await,
            ObjectKind::Charges => apply_charge(repo, tenant_id, object).await,
            other => Err(unsupported(other)),
        }
    }
}

fn unsupported(kind: ObjectKind) -> PulseError {
    PulseError::validation("object_kind", format!("stripe does not sync {}", kind))
}

#[async_trait]
impl IntegrationAdapter for StripeAdapter {
    fn provider(&self) -> Provider {
        Provider::Stripe
    }

    fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    fn object_kinds(&self) -> &'static [ObjectKind] {
        OBJECT_KINDS
    }

    /// Stripe lists can only filter on creation time, so customers and
    /// subscriptions are always pulled in full; charges are bounded by
    /// the rolling window (and `since`, when later).
    async fn pull(&self, ctx: &OpContext, request: &PullRequest, progress: &mut SyncProgress) -> PulseResult<PullSummary> {
        let (path, mut filters): (&str, Vec<(&str, String)>) = match request.kind {
            ObjectKind::Customers => ("/v1/customers", vec![]),
            ObjectKind::Subscriptions => ("/v1/subscriptions", vec![("status", "all".to_string())]),
            ObjectKind::Charges => {
                let from = window_start(request.since, Utc::now(), self.window_days);
                ("/v1/charges", vec![("created[gte]", from.timestamp().to_string())])
            }
            other => return Err(unsupported(other)),
        };
        filters.push(("limit", PAGE_LIMIT.to_string()));

        let token = self.credentials.get_access_token(request.tenant_id).await?;
        let repo = self.store.repo();
        let mut summary = PullSummary::default();
        let mut cursor: Option<String> = None;
        loop {
            ctx.check()?;
            let mut query = filters.clone();
            if let Some(after) = &cursor {
                query.push(("starting_after", after.clone()));
            }
            let page = self.client.get(path, &token, &query).await?;
            let items = page
                .get("data")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            summary.pages += 1;
            progress.page(items.len());

            for item in &items {
                let id = str_of(item, "id").unwrap_or_default();
                match self.apply_object(repo, request.tenant_id, request.kind, item).await {
                    Ok(applied) => {
                        summary.objects += 1;
                        summary.events += applied.events;
                    }
                    Err(err) => {
                        summary.errors += 1;
                        tracing::warn!(
                            tenant_id = %request.tenant_id,
                            kind = %request.kind,
                            object_id = %id,
                            error = %err,
                            "Failed to apply stripe object"
                        );
                        progress.error(&id, &err);
                    }
                }
                progress.advance();
            }

            let has_more = page.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            cursor = items.last().and_then(|item| str_of(item, "id"));
            if !has_more || cursor.is_none() {
                break;
            }
        }
        Ok(summary)
    }

    async fn handle_webhook(&self, webhook: &InboundWebhook) -> PulseResult<WebhookOutcome> {
        let signature = webhook
            .header("Stripe-Signature")
            .ok_or_else(|| IntegrationError::auth(Provider::Stripe, "missing Stripe-Signature header"))?;
        verify_stripe(&webhook.body, signature, self.credentials.webhook_secret(), Utc::now())?;

        let payload = webhook.json()?;
        let event_id = require_str(Provider::Stripe, &payload, "id")?;
        let event_type = require_str(Provider::Stripe, &payload, "type")?;
        if !is_handled(&event_type) {
            tracing::debug!(event_id = %event_id, event_type = %event_type, "Ignoring stripe webhook");
            return Ok(WebhookOutcome::Ignored);
        }
        let Some(account) = str_of(&payload, "account") else {
            tracing::debug!(event_id = %event_id, "Stripe webhook without connected account");
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(connection) = self
            .store
            .repo()
            .find_connection_by_account(Provider::Stripe, &account)
            .await?
        else {
            tracing::warn!(event_id = %event_id, account = %account, "No connection for stripe account");
            return Ok(WebhookOutcome::Ignored);
        };

        let envelope = WebhookEnvelope {
            provider: Provider::Stripe,
            tenant_id: connection.tenant_id,
            event_id,
            event_type,
            payload,
        };
        let outcome = self.pipeline.process(&envelope, self).await?;

        if let (WebhookOutcome::Processed { customers }, Some(hook)) = (&outcome, self.change_hook.get()) {
            for customer_id in customers {
                hook.customer_changed(envelope.tenant_id, *customer_id).await;
            }
        }
        Ok(outcome)
    }
}

const CUSTOMER_EVENTS: &[&str] = &["customer.created", "customer.updated"];

fn is_handled(event_type: &str) -> bool {
    event_type == "customer.deleted"
        || CUSTOMER_EVENTS.contains(&event_type)
        || event_type.starts_with("customer.subscription.")
        || event_type.starts_with("charge.")
}

#[async_trait]
impl WebhookEffect for StripeAdapter {
    async fn apply(&self, repo: &dyn Repository, envelope: &WebhookEnvelope) -> PulseResult<Vec<CustomerId>> {
        let tenant_id = envelope.tenant_id;
        let object = envelope
            .payload
            .pointer("/data/object")
            .ok_or_else(|| PulseError::validation("stripe.data.object", "missing event object"))?;
        let at = unix_secs(envelope.payload.get("created")).unwrap_or_else(Utc::now);

        let applied = match envelope.event_type.as_str() {
            "customer.deleted" => {
                let id = require_str(Provider::Stripe, object, "id")?;
                soft_delete_customer(repo, tenant_id, Provider::Stripe, &id, at)
                    .await?
                    .map(Applied::customer)
                    .unwrap_or_default()
            }
            t if t.starts_with("customer.subscription.") => {
                let applied = apply_subscription(repo, tenant_id, object).await?;
                if let Some(customer_id) = applied.customer {
                    let customer = repo.get_customer(tenant_id, customer_id).await?;
                    recompute_customer_mrr(repo, &customer, at).await?;
                }
                applied
            }
            t if CUSTOMER_EVENTS.contains(&t) => apply_customer(repo, tenant_id, object).await?,
            t if t.starts_with("charge.") => apply_charge(repo, tenant_id, object).await?,
            _ => Applied::skipped(),
        };
        Ok(applied.customer.into_iter().collect())
    }
}

// ============================================================================
// OBJECT MAPPING
// ============================================================================

/// Stripe fields that reference another object are either its id or the
/// expanded object.
fn reference_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Object(_) => value.and_then(|v| str_of(v, "id")),
        _ => None,
    }
}

async fn apply_customer(repo: &dyn Repository, tenant_id: TenantId, object: &Value) -> PulseResult<Applied> {
    let id = require_str(Provider::Stripe, object, "id")?;
    if object.get("deleted").and_then(Value::as_bool).unwrap_or(false) {
        let at = Utc::now();
        return Ok(soft_delete_customer(repo, tenant_id, Provider::Stripe, &id, at)
            .await?
            .map(Applied::customer)
            .unwrap_or_default());
    }
    let created = unix_secs(object.get("created")).unwrap_or_else(Utc::now);
    let upsert = CustomerUpsert::new(Provider::Stripe, &id, created)
        .with_name(str_of(object, "name"))
        .with_email(str_of(object, "email"))
        .with_currency(str_of(object, "currency"))
        .with_namespace(json!({
            "delinquent": object.get("delinquent").cloned().unwrap_or(Value::Null),
            "description": object.get("description").cloned().unwrap_or(Value::Null),
            "metadata": object.get("metadata").cloned().unwrap_or_else(|| json!({})),
        }));
    let customer = repo.upsert_customer_by_external(tenant_id, &upsert).await?;
    Ok(Applied::customer(customer.id))
}

/// Summed per-interval price across subscription items, quantity included.
fn subscription_price(object: &Value) -> (i64, Option<String>, BillingInterval, i32) {
    let items: Vec<&Value> = object
        .pointer("/items/data")
        .and_then(Value::as_array)
        .map(|items| items.iter().collect())
        .unwrap_or_else(|| object.get("plan").into_iter().collect());

    let mut amount = 0i64;
    let mut currency = None;
    let mut interval = BillingInterval::Month;
    let mut interval_count = 1;
    for (idx, item) in items.into_iter().enumerate() {
        let price = item.get("price").or_else(|| item.get("plan")).unwrap_or(item);
        let quantity = item.get("quantity").and_then(Value::as_i64).unwrap_or(1);
        let unit = price
            .get("unit_amount")
            .or_else(|| price.get("amount"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        amount += unit * quantity;
        if idx == 0 {
            currency = str_of(price, "currency");
            let recurring = price.get("recurring").unwrap_or(price);
            interval = str_of(recurring, "interval")
                .and_then(|i| i.parse().ok())
                .unwrap_or_default();
            interval_count = recurring
                .get("interval_count")
                .and_then(Value::as_i64)
                .map(|c| c as i32)
                .unwrap_or(1);
        }
    }
    (amount, currency, interval, interval_count)
}

async fn apply_subscription(repo: &dyn Repository, tenant_id: TenantId, object: &Value) -> PulseResult<Applied> {
    let id = require_str(Provider::Stripe, object, "id")?;
    let customer_ref = reference_id(object.get("customer"))
        .ok_or_else(|| PulseError::validation("stripe.subscription.customer", "missing customer"))?;
    let now = Utc::now();
    let created = unix_secs(object.get("created")).unwrap_or(now);
    let customer = ensure_customer(repo, tenant_id, Provider::Stripe, &customer_ref, created).await?;

    let (amount_cents, currency, interval, interval_count) = subscription_price(object);
    let subscription = Subscription {
        id: Uuid::now_v7(),
        tenant_id,
        provider: Provider::Stripe,
        external_id: id.clone(),
        customer_id: customer.id,
        status: str_of(object, "status").unwrap_or_else(|| "incomplete".into()),
        amount_cents,
        currency: currency.map(|c| c.to_ascii_uppercase()),
        interval,
        interval_count,
        current_period_end: unix_secs(object.get("current_period_end")),
        canceled_at: unix_secs(object.get("canceled_at")),
        metadata: object_map(object.get("metadata")),
        updated_at: now,
    };
    let previous = repo.upsert_subscription(&subscription).await?;

    let mut applied = Applied::customer(customer.id);
    let status = subscription.status.as_str();
    match &previous {
        None => {
            let event = TimelineEvent::SubscriptionCreated {
                subscription_id: id.clone(),
                status: status.to_string(),
                amount_cents,
            };
            let appended = emit(repo, tenant_id, customer.id, Provider::Stripe, format!("{}:created", id), created, &event).await?;
            applied.count(appended);
        }
        Some(prev) if prev.status != subscription.status => {
            let event = TimelineEvent::SubscriptionStatusChanged {
                subscription_id: id.clone(),
                previous_status: prev.status.clone(),
                new_status: status.to_string(),
            };
            let period = subscription
                .current_period_end
                .map(|t| t.timestamp())
                .unwrap_or_default();
            let external_id = format!("{}:{}->{}@{}", id, prev.status, status, period);
            let appended = emit(repo, tenant_id, customer.id, Provider::Stripe, external_id, now, &event).await?;
            applied.count(appended);
        }
        Some(_) => {}
    }

    let newly_canceled = status == "canceled" && previous.as_ref().is_none_or(|p| p.status != "canceled");
    if newly_canceled {
        let at = subscription.canceled_at.unwrap_or(now);
        let event = TimelineEvent::SubscriptionCanceled {
            subscription_id: id.clone(),
        };
        let appended = emit(repo, tenant_id, customer.id, Provider::Stripe, format!("{}:canceled", id), at, &event).await?;
        applied.count(appended);
    }
    Ok(applied)
}

fn payment_status(object: &Value) -> PaymentStatus {
    if object.get("refunded").and_then(Value::as_bool).unwrap_or(false) {
        return PaymentStatus::Refunded;
    }
    match object.get("status").and_then(Value::as_str) {
        Some("succeeded") => PaymentStatus::Succeeded,
        Some("failed") => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    }
}

/// Length of the trailing run of failed payments.
pub(crate) fn trailing_failures(payments: &[Payment]) -> u32 {
    payments
        .iter()
        .rev()
        .take_while(|p| p.status == PaymentStatus::Failed)
        .count() as u32
}

async fn apply_charge(repo: &dyn Repository, tenant_id: TenantId, object: &Value) -> PulseResult<Applied> {
    let id = require_str(Provider::Stripe, object, "id")?;
    let Some(customer_ref) = reference_id(object.get("customer")) else {
        tracing::trace!(charge_id = %id, "Charge has no customer; skipped");
        return Ok(Applied::skipped());
    };
    let occurred_at: Timestamp = unix_secs(object.get("created")).unwrap_or_else(Utc::now);
    let customer = ensure_customer(repo, tenant_id, Provider::Stripe, &customer_ref, occurred_at).await?;

    let payment = Payment {
        id: Uuid::now_v7(),
        tenant_id,
        provider: Provider::Stripe,
        external_id: id.clone(),
        customer_id: customer.id,
        amount_cents: object.get("amount").and_then(Value::as_i64).unwrap_or(0),
        currency: str_of(object, "currency").map(|c| c.to_ascii_uppercase()),
        status: payment_status(object),
        failure_reason: str_of(object, "failure_message").or_else(|| str_of(object, "failure_code")),
        occurred_at,
        metadata: object_map(object.get("metadata")),
    };
    let previous = repo.upsert_payment(&payment).await?;

    let mut applied = Applied::customer(customer.id);
    let newly_failed = payment.status == PaymentStatus::Failed
        && previous.as_ref().is_none_or(|p| p.status != PaymentStatus::Failed);
    if !newly_failed {
        return Ok(applied);
    }

    let event = TimelineEvent::PaymentFailed {
        payment_id: id.clone(),
        amount_cents: payment.amount_cents,
        currency: payment.currency.clone(),
        failure_reason: payment.failure_reason.clone(),
    };
    let appended = emit(repo, tenant_id, customer.id, Provider::Stripe, format!("{}:failed", id), occurred_at, &event).await?;
    applied.count(appended);

    let history = repo.list_payments(tenant_id, customer.id, None).await?;
    let run = trailing_failures(&history);
    let is_latest = history.last().is_some_and(|p| p.external_id == id);
    if run >= CONSECUTIVE_PAYMENT_FAILURES_ALERT && is_latest {
        let event = TimelineEvent::PaymentConsecutiveFailures {
            count: run,
            last_payment_id: id.clone(),
        };
        let appended = emit(repo, tenant_id, customer.id, Provider::Stripe, format!("{}:consecutive", id), occurred_at, &event).await?;
        applied.count(appended);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_subscription_price_sums_items() {
        let object = json!({
            "items": {"data": [
                {"quantity": 3, "price": {"unit_amount": 1000, "currency": "usd",
                    "recurring": {"interval": "year", "interval_count": 1}}},
                {"quantity": 1, "price": {"unit_amount": 500, "currency": "usd",
                    "recurring": {"interval": "year", "interval_count": 1}}}
            ]}
        });
        let (amount, currency, interval, count) = subscription_price(&object);
        assert_eq!(amount, 3500);
        assert_eq!(currency.as_deref(), Some("usd"));
        assert_eq!(interval, BillingInterval::Year);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_subscription_price_legacy_plan() {
        let object = json!({"plan": {"amount": 2000, "currency": "eur", "interval": "week", "interval_count": 2}});
        let (amount, _, interval, count) = subscription_price(&object);
        assert_eq!(amount, 2000);
        assert_eq!(interval, BillingInterval::Week);
        assert_eq!(count, 2);
    }

    #[test]
    fn test_payment_status_mapping() {
        assert_eq!(payment_status(&json!({"status": "failed"})), PaymentStatus::Failed);
        assert_eq!(payment_status(&json!({"status": "succeeded", "refunded": true})), PaymentStatus::Refunded);
        assert_eq!(payment_status(&json!({"status": "weird"})), PaymentStatus::Pending);
    }

    #[test]
    fn test_trailing_failures() {
        let base = Payment {
            id: Uuid::nil(),
            tenant_id: TenantId::nil(),
            provider: Provider::Stripe,
            external_id: String::new(),
            customer_id: CustomerId::nil(),
            amount_cents: 100,
            currency: None,
            status: PaymentStatus::Failed,
            failure_reason: None,
            occurred_at: Utc::now(),
            metadata: Default::default(),
        };
        let mut ok = base.clone();
        ok.status = PaymentStatus::Succeeded;
        ok.occurred_at -= Duration::days(3);
        assert_eq!(trailing_failures(&[ok.clone(), base.clone(), base.clone()]), 2);
        assert_eq!(trailing_failures(&[base.clone(), ok]), 0);
        assert_eq!(trailing_failures(&[]), 0);
    }

    #[test]
    fn test_reference_id_accepts_expanded() {
        assert_eq!(reference_id(Some(&json!("cus_1"))).as_deref(), Some("cus_1"));
        assert_eq!(reference_id(Some(&json!({"id": "cus_2"}))).as_deref(), Some("cus_2"));
        assert_eq!(reference_id(Some(&json!(null))), None);
    }
}
