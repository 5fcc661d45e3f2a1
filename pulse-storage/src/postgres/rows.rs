//! Row to entity mapping.

use pulse_core::{
    AlertConditions, AlertHistory, AlertRule, CompanySummary, ContactSummary,
    ConversationSummary, Customer, CustomerEvent, CustomerId, DealSummary, HealthScore, HealthScoreHistory,
    IntegrationConnection, JsonMap, Notification, NotificationPreference, Payment, PulseResult,
    RiskThresholds, ScoringConfig, StorageError, Subscription, Tenant, TenantId, User,
};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::str::FromStr;
use tokio_postgres::types::FromSql;
use tokio_postgres::Row;
use uuid::Uuid;

fn get<'a, T: FromSql<'a>>(row: &'a Row, column: &str) -> PulseResult<T> {
    row.try_get(column).map_err(|e| {
        StorageError::fault(format!("column {} could not be read: {}", column, e)).into()
    })
}

fn id<T: From<Uuid>>(row: &Row, column: &str) -> PulseResult<T> {
    get::<Uuid>(row, column).map(T::from)
}

fn opt_id<T: From<Uuid>>(row: &Row, column: &str) -> PulseResult<Option<T>> {
    Ok(get::<Option<Uuid>>(row, column)?.map(T::from))
}

fn text_enum<T>(row: &Row, column: &str) -> PulseResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw: String = get(row, column)?;
    raw.parse::<T>()
        .map_err(|e| StorageError::fault(format!("column {}: {}", column, e)).into())
}

fn json<T: DeserializeOwned>(row: &Row, column: &str) -> PulseResult<T> {
    let value: Value = get(row, column)?;
    serde_json::from_value(value)
        .map_err(|e| StorageError::fault(format!("column {} is malformed: {}", column, e)).into())
}

fn json_map(row: &Row, column: &str) -> PulseResult<JsonMap> {
    match get::<Value>(row, column)? {
        Value::Object(map) => Ok(map),
        _ => Ok(JsonMap::new()),
    }
}

pub fn tenant(row: &Row) -> PulseResult<Tenant> {
    Ok(Tenant {
        id: id(row, "id")?,
        name: get(row, "name")?,
        created_at: get(row, "created_at")?,
        deleted_at: get(row, "deleted_at")?,
    })
}

pub fn user(row: &Row) -> PulseResult<User> {
    Ok(User {
        id: id(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        email: get(row, "email")?,
        name: get(row, "name")?,
        created_at: get(row, "created_at")?,
    })
}

pub fn connection(row: &Row) -> PulseResult<IntegrationConnection> {
    Ok(IntegrationConnection {
        id: id(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        provider: text_enum(row, "provider")?,
        access_token_ciphertext: get(row, "access_token_ciphertext")?,
        refresh_token_ciphertext: get(row, "refresh_token_ciphertext")?,
        token_expires_at: get(row, "token_expires_at")?,
        external_account_id: get(row, "external_account_id")?,
        scopes: get(row, "scopes")?,
        status: text_enum(row, "status")?,
        last_sync_at: get(row, "last_sync_at")?,
        last_sync_error: get(row, "last_sync_error")?,
        metadata: json(row, "metadata")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn customer(row: &Row) -> PulseResult<Customer> {
    Ok(Customer {
        id: id(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        source: text_enum(row, "source")?,
        external_id: get(row, "external_id")?,
        name: get(row, "name")?,
        email: get(row, "email")?,
        company_name: get(row, "company_name")?,
        currency: get(row, "currency")?,
        mrr_cents: get(row, "mrr_cents")?,
        first_seen_at: get(row, "first_seen_at")?,
        last_seen_at: get(row, "last_seen_at")?,
        metadata: json(row, "metadata")?,
        deleted_at: get(row, "deleted_at")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn event(row: &Row) -> PulseResult<CustomerEvent> {
    Ok(CustomerEvent {
        id: id(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        customer_id: id(row, "customer_id")?,
        source: text_enum(row, "source")?,
        external_event_id: get(row, "external_event_id")?,
        event_type: get(row, "event_type")?,
        occurred_at: get(row, "occurred_at")?,
        data: get(row, "data")?,
        created_at: get(row, "created_at")?,
    })
}

pub fn subscription(row: &Row) -> PulseResult<Subscription> {
    Ok(Subscription {
        id: get(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        provider: text_enum(row, "provider")?,
        external_id: get(row, "external_id")?,
        customer_id: id(row, "customer_id")?,
        status: get(row, "status")?,
        amount_cents: get(row, "amount_cents")?,
        currency: get(row, "currency")?,
        interval: text_enum(row, "billing_interval")?,
        interval_count: get(row, "interval_count")?,
        current_period_end: get(row, "current_period_end")?,
        canceled_at: get(row, "canceled_at")?,
        metadata: json_map(row, "metadata")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn payment(row: &Row) -> PulseResult<Payment> {
    Ok(Payment {
        id: get(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        provider: text_enum(row, "provider")?,
        external_id: get(row, "external_id")?,
        customer_id: id(row, "customer_id")?,
        amount_cents: get(row, "amount_cents")?,
        currency: get(row, "currency")?,
        status: text_enum(row, "status")?,
        failure_reason: get(row, "failure_reason")?,
        occurred_at: get(row, "occurred_at")?,
        metadata: json_map(row, "metadata")?,
    })
}

pub fn conversation(row: &Row) -> PulseResult<ConversationSummary> {
    Ok(ConversationSummary {
        id: get(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        provider: text_enum(row, "provider")?,
        external_id: get(row, "external_id")?,
        customer_id: id(row, "customer_id")?,
        state: text_enum(row, "state")?,
        is_ticket: get(row, "is_ticket")?,
        title: get(row, "title")?,
        opened_at: get(row, "opened_at")?,
        closed_at: get(row, "closed_at")?,
        metadata: json_map(row, "metadata")?,
    })
}

pub fn deal(row: &Row) -> PulseResult<DealSummary> {
    Ok(DealSummary {
        id: get(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        provider: text_enum(row, "provider")?,
        external_id: get(row, "external_id")?,
        customer_id: opt_id(row, "customer_id")?,
        name: get(row, "name")?,
        stage: get(row, "stage")?,
        amount_cents: get(row, "amount_cents")?,
        close_date: get(row, "close_date")?,
        metadata: json_map(row, "metadata")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn contact(row: &Row) -> PulseResult<ContactSummary> {
    Ok(ContactSummary {
        id: get(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        provider: text_enum(row, "provider")?,
        external_id: get(row, "external_id")?,
        customer_id: id(row, "customer_id")?,
        email: get(row, "email")?,
        name: get(row, "name")?,
        company_external_id: get(row, "company_external_id")?,
        metadata: json_map(row, "metadata")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn company(row: &Row) -> PulseResult<CompanySummary> {
    Ok(CompanySummary {
        id: get(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        provider: text_enum(row, "provider")?,
        external_id: get(row, "external_id")?,
        name: get(row, "name")?,
        domain: get(row, "domain")?,
        metadata: json_map(row, "metadata")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn scoring_config(row: &Row) -> PulseResult<ScoringConfig> {
    let weights: BTreeMap<String, f64> = json(row, "weights")?;
    Ok(ScoringConfig {
        tenant_id: id(row, "tenant_id")?,
        weights,
        thresholds: RiskThresholds {
            green: get(row, "green_threshold")?,
            yellow: get(row, "yellow_threshold")?,
        },
        updated_at: get(row, "updated_at")?,
    })
}

pub fn health_score(row: &Row) -> PulseResult<HealthScore> {
    Ok(HealthScore {
        tenant_id: id(row, "tenant_id")?,
        customer_id: id(row, "customer_id")?,
        overall_score: get(row, "overall_score")?,
        risk_level: text_enum(row, "risk_level")?,
        factors: json(row, "factors")?,
        calculated_at: get(row, "calculated_at")?,
    })
}

pub fn score_history(row: &Row) -> PulseResult<HealthScoreHistory> {
    Ok(HealthScoreHistory {
        tenant_id: id(row, "tenant_id")?,
        customer_id: id(row, "customer_id")?,
        overall_score: get(row, "overall_score")?,
        risk_level: text_enum(row, "risk_level")?,
        factors: json(row, "factors")?,
        calculated_at: get(row, "calculated_at")?,
    })
}

pub fn alert_rule(row: &Row) -> PulseResult<AlertRule> {
    let conditions: AlertConditions = json(row, "conditions")?;
    Ok(AlertRule {
        id: id(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        name: get(row, "name")?,
        description: get(row, "description")?,
        trigger_type: text_enum(row, "trigger_type")?,
        conditions,
        channel: text_enum(row, "channel")?,
        recipients: get(row, "recipients")?,
        is_active: get(row, "is_active")?,
        created_by: opt_id(row, "created_by")?,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
    })
}

pub fn alert_history(row: &Row) -> PulseResult<AlertHistory> {
    Ok(AlertHistory {
        id: id(row, "id")?,
        tenant_id: id(row, "tenant_id")?,
        alert_rule_id: id(row, "alert_rule_id")?,
        customer_id: opt_id(row, "customer_id")?,
        channel: text_enum(row, "channel")?,
        status: text_enum(row, "status")?,
        trigger_data: get(row, "trigger_data")?,
        provider_message_id: get(row, "provider_message_id")?,
        delivered_at: get(row, "delivered_at")?,
        opened_at: get(row, "opened_at")?,
        clicked_at: get(row, "clicked_at")?,
        bounced_at: get(row, "bounced_at")?,
        error_message: get(row, "error_message")?,
        created_at: get(row, "created_at")?,
    })
}

pub fn notification_preference(row: &Row) -> PulseResult<NotificationPreference> {
    let muted: Vec<Uuid> = get(row, "muted_rule_ids")?;
    Ok(NotificationPreference {
        user_id: id(row, "user_id")?,
        tenant_id: id(row, "tenant_id")?,
        email_enabled: get(row, "email_enabled")?,
        in_app_enabled: get(row, "in_app_enabled")?,
        digest_enabled: get(row, "digest_enabled")?,
        digest_frequency: text_enum(row, "digest_frequency")?,
        muted_rule_ids: muted.into_iter().map(Into::into).collect(),
    })
}

pub fn notification(row: &Row) -> PulseResult<Notification> {
    Ok(Notification {
        id: id(row, "id")?,
        user_id: id(row, "user_id")?,
        tenant_id: id(row, "tenant_id")?,
        notification_type: get(row, "notification_type")?,
        title: get(row, "title")?,
        message: get(row, "message")?,
        data: get(row, "data")?,
        read_at: get(row, "read_at")?,
        created_at: get(row, "created_at")?,
    })
}

/// `(customer_id, count)` aggregate rows.
pub fn customer_count(row: &Row) -> PulseResult<(CustomerId, i64)> {
    Ok((id(row, "customer_id")?, get(row, "count")?))
}

pub fn tenant_id(row: &Row) -> PulseResult<TenantId> {
    id(row, "tenant_id")
}

/// Map every row, failing on the first malformed one.
pub fn all<T>(rows: &[Row], f: fn(&Row) -> PulseResult<T>) -> PulseResult<Vec<T>> {
    rows.iter().map(f).collect()
}
