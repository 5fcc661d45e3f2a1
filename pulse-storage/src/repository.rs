//! Repository, store and transaction traits.
//!
//! Every operation carries an explicit tenant id. Natural-key upserts are
//! conditional insert-or-update; append-only logs rely on unique-key
//! conflict-ignore. Nothing here promises cross-row atomicity beyond what a
//! [`Transaction`] groups.

use async_trait::async_trait;
use pulse_core::{
    AlertHistory, AlertRule, AlertRuleId, CompanySummary, ConnectionStatus, ContactSummary,
    ConversationSummary, Customer, CustomerDetail, CustomerEvent, CustomerId, CustomerUpsert,
    CustomerWithScore, DealSummary, HealthScore, HealthScoreHistory, IntegrationConnection,
    Notification, NotificationId, NotificationPreference, Payment, Provider, PulseResult,
    ScoringConfig, Subscription, Tenant, TenantId, Timestamp, User, UserId, WebhookEvent,
};
use std::collections::HashMap;

/// Filter for timeline reads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventQuery {
    pub customer_id: Option<CustomerId>,
    /// Empty means every type.
    pub event_types: Vec<String>,
    pub since: Option<Timestamp>,
    pub until: Option<Timestamp>,
    pub limit: Option<usize>,
    /// Order by `occurred_at` descending instead of ascending.
    pub newest_first: bool,
}

impl EventQuery {
    pub fn for_customer(customer_id: CustomerId) -> Self {
        Self {
            customer_id: Some(customer_id),
            ..Default::default()
        }
    }

    pub fn of_types(mut self, types: &[&str]) -> Self {
        self.event_types = types.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn since(mut self, since: Timestamp) -> Self {
        self.since = Some(since);
        self
    }

    pub fn newest_first(mut self, limit: usize) -> Self {
        self.newest_first = true;
        self.limit = Some(limit);
        self
    }

    /// Whether `event` passes this filter (ignoring ordering and limit).
    pub fn matches(&self, event: &CustomerEvent) -> bool {
        self.customer_id.is_none_or(|c| c == event.customer_id)
            && (self.event_types.is_empty() || self.event_types.contains(&event.event_type))
            && self.since.is_none_or(|s| event.occurred_at >= s)
            && self.until.is_none_or(|u| event.occurred_at <= u)
    }
}

/// Typed, tenant-scoped persistence operations.
#[async_trait]
pub trait Repository: Send + Sync {
    // ========================================================================
    // TENANTS AND USERS
    // ========================================================================

    async fn create_tenant(&self, tenant: &Tenant) -> PulseResult<()>;

    /// Fails with `not_found` for unknown or tombstoned tenants.
    async fn get_tenant(&self, tenant_id: TenantId) -> PulseResult<Tenant>;

    async fn list_active_tenants(&self) -> PulseResult<Vec<Tenant>>;

    async fn soft_delete_tenant(&self, tenant_id: TenantId, at: Timestamp) -> PulseResult<()>;

    async fn upsert_user(&self, user: &User) -> PulseResult<()>;

    /// Case-insensitive lookup of an operator by email.
    async fn find_user_by_email(&self, tenant_id: TenantId, email: &str)
        -> PulseResult<Option<User>>;

    // ========================================================================
    // INTEGRATION CONNECTIONS
    // ========================================================================

    /// Insert or replace the connection for `(tenant, provider)`.
    async fn save_connection(&self, connection: &IntegrationConnection) -> PulseResult<()>;

    async fn get_connection(
        &self,
        tenant_id: TenantId,
        provider: Provider,
    ) -> PulseResult<Option<IntegrationConnection>>;

    /// Route cross-tenant webhooks by provider-assigned account id.
    async fn find_connection_by_account(
        &self,
        provider: Provider,
        external_account_id: &str,
    ) -> PulseResult<Option<IntegrationConnection>>;

    async fn delete_connection(&self, tenant_id: TenantId, provider: Provider) -> PulseResult<bool>;

    /// Connections of live tenants, optionally filtered by provider and state.
    async fn list_connections(
        &self,
        provider: Option<Provider>,
        statuses: &[ConnectionStatus],
    ) -> PulseResult<Vec<IntegrationConnection>>;

    // ========================================================================
    // CUSTOMERS
    // ========================================================================

    /// Create if absent; on conflict update mutable fields and clear
    /// `deleted_at`. Returns the stored row.
    async fn upsert_customer_by_external(
        &self,
        tenant_id: TenantId,
        upsert: &CustomerUpsert,
    ) -> PulseResult<Customer>;

    async fn get_customer(&self, tenant_id: TenantId, customer_id: CustomerId)
        -> PulseResult<Customer>;

    async fn find_customer_by_external(
        &self,
        tenant_id: TenantId,
        source: Provider,
        external_id: &str,
    ) -> PulseResult<Option<Customer>>;

    /// Non-deleted customers, oldest first.
    async fn list_customers(&self, tenant_id: TenantId) -> PulseResult<Vec<Customer>>;

    /// Overwrite every mutable field of an existing row.
    async fn update_customer(&self, customer: &Customer) -> PulseResult<()>;

    /// Groups of two or more non-deleted customers sharing an email
    /// (case-insensitive), each group ordered by `first_seen_at`.
    async fn find_duplicates_by_email(&self, tenant_id: TenantId)
        -> PulseResult<Vec<Vec<Customer>>>;

    /// Persist an email merge: store `primary`, re-point children of the
    /// absorbed rows to it, and soft-delete the absorbed rows.
    async fn merge_customers(
        &self,
        tenant_id: TenantId,
        primary: &Customer,
        absorbed: &[CustomerId],
        at: Timestamp,
    ) -> PulseResult<()>;

    // ========================================================================
    // TIMELINE
    // ========================================================================

    /// Insert-on-conflict-ignore on `(tenant, source, external_event_id)`.
    /// Returns whether a row was created.
    async fn append_event(&self, event: &CustomerEvent) -> PulseResult<bool>;

    async fn list_events(&self, tenant_id: TenantId, query: &EventQuery)
        -> PulseResult<Vec<CustomerEvent>>;

    /// Per-customer counts of the given event types since `since`.
    async fn count_events_by_customer(
        &self,
        tenant_id: TenantId,
        event_types: &[&str],
        since: Timestamp,
    ) -> PulseResult<HashMap<CustomerId, i64>>;

    // ========================================================================
    // PROVIDER PROJECTIONS
    // ========================================================================
    //
    // Upserts key on `(tenant, provider, external_id)` and return the row
    // as it was before the write, so callers can derive change events.

    async fn upsert_subscription(&self, subscription: &Subscription)
        -> PulseResult<Option<Subscription>>;

    async fn list_subscriptions(
        &self,
        tenant_id: TenantId,
        customer_id: Option<CustomerId>,
    ) -> PulseResult<Vec<Subscription>>;

    async fn upsert_payment(&self, payment: &Payment) -> PulseResult<Option<Payment>>;

    /// Payments ordered by `occurred_at` ascending.
    async fn list_payments(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        since: Option<Timestamp>,
    ) -> PulseResult<Vec<Payment>>;

    async fn upsert_conversation(
        &self,
        conversation: &ConversationSummary,
    ) -> PulseResult<Option<ConversationSummary>>;

    async fn list_conversations(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        since: Option<Timestamp>,
    ) -> PulseResult<Vec<ConversationSummary>>;

    /// Per-customer count of conversations opened since `since`.
    async fn count_conversations_by_customer(
        &self,
        tenant_id: TenantId,
        since: Timestamp,
    ) -> PulseResult<HashMap<CustomerId, i64>>;

    /// Upsert on `(tenant, provider, external_id)`, returning the previous row. A deal
    /// without a customer keeps the link already stored.
    async fn upsert_deal(&self, deal: &DealSummary) -> PulseResult<Option<DealSummary>>;

    async fn upsert_contact(&self, contact: &ContactSummary) -> PulseResult<Option<ContactSummary>>;

    async fn list_contacts(&self, tenant_id: TenantId, provider: Provider)
        -> PulseResult<Vec<ContactSummary>>;

    async fn upsert_company(&self, company: &CompanySummary) -> PulseResult<Option<CompanySummary>>;

    async fn get_company(
        &self,
        tenant_id: TenantId,
        provider: Provider,
        external_id: &str,
    ) -> PulseResult<Option<CompanySummary>>;

    // ========================================================================
    // SCORING
    // ========================================================================

    async fn get_scoring_config(&self, tenant_id: TenantId) -> PulseResult<Option<ScoringConfig>>;

    async fn save_scoring_config(&self, config: &ScoringConfig) -> PulseResult<()>;

    async fn get_current_score(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> PulseResult<Option<HealthScore>>;

    /// Insert or replace in place.
    async fn upsert_current_score(&self, score: &HealthScore) -> PulseResult<()>;

    /// Conflict-ignore on `(tenant, customer, calculated_at)`.
    async fn append_score_history(&self, entry: &HealthScoreHistory) -> PulseResult<bool>;

    /// Latest snapshot calculated at or before `at`.
    async fn get_score_at(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        at: Timestamp,
    ) -> PulseResult<Option<HealthScoreHistory>>;

    /// Snapshots since `since`, oldest first.
    async fn list_score_history(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        since: Timestamp,
    ) -> PulseResult<Vec<HealthScoreHistory>>;

    /// Delete snapshots older than `before` across all tenants.
    async fn prune_score_history(&self, before: Timestamp) -> PulseResult<u64>;

    async fn list_customers_with_scores(&self, tenant_id: TenantId)
        -> PulseResult<Vec<CustomerWithScore>>;

    async fn get_customer_detail(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        recent_events: usize,
    ) -> PulseResult<CustomerDetail>;

    // ========================================================================
    // ALERTS
    // ========================================================================

    /// Insert or replace a rule.
    async fn save_alert_rule(&self, rule: &AlertRule) -> PulseResult<()>;

    async fn get_alert_rule(&self, tenant_id: TenantId, rule_id: AlertRuleId)
        -> PulseResult<AlertRule>;

    async fn delete_alert_rule(&self, tenant_id: TenantId, rule_id: AlertRuleId)
        -> PulseResult<bool>;

    async fn list_alert_rules(&self, tenant_id: TenantId, active_only: bool)
        -> PulseResult<Vec<AlertRule>>;

    /// Live tenants with at least one active rule.
    async fn list_tenants_with_active_rules(&self) -> PulseResult<Vec<TenantId>>;

    async fn insert_alert_history(&self, entry: &AlertHistory) -> PulseResult<()>;

    async fn update_alert_history(&self, entry: &AlertHistory) -> PulseResult<()>;

    /// Most recent non-failed alert for `(rule, customer)`.
    async fn get_last_alert(
        &self,
        tenant_id: TenantId,
        rule_id: AlertRuleId,
        customer_id: Option<CustomerId>,
    ) -> PulseResult<Option<AlertHistory>>;

    async fn find_alert_by_message_id(&self, message_id: &str) -> PulseResult<Option<AlertHistory>>;

    /// Newest first.
    async fn list_alert_history(
        &self,
        tenant_id: TenantId,
        rule_id: Option<AlertRuleId>,
    ) -> PulseResult<Vec<AlertHistory>>;

    // ========================================================================
    // NOTIFICATIONS
    // ========================================================================

    async fn get_notification_preference(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> PulseResult<Option<NotificationPreference>>;

    async fn save_notification_preference(&self, pref: &NotificationPreference)
        -> PulseResult<()>;

    async fn insert_notification(&self, notification: &Notification) -> PulseResult<()>;

    /// Newest first.
    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        unread_only: bool,
    ) -> PulseResult<Vec<Notification>>;

    /// Returns false when the notification is unknown or already read.
    async fn mark_notification_read(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        notification_id: NotificationId,
        at: Timestamp,
    ) -> PulseResult<bool>;

    // ========================================================================
    // WEBHOOK IDEMPOTENCY
    // ========================================================================

    /// Insert-on-conflict-ignore on `(provider, external_event_id)`.
    /// Returns whether the row was inserted (first delivery).
    async fn mark_webhook_processed(&self, event: &WebhookEvent) -> PulseResult<bool>;

    async fn prune_webhook_events(&self, before: Timestamp) -> PulseResult<u64>;
}

/// A repository that can open transactions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Non-transactional access; each call is its own round-trip.
    fn repo(&self) -> &dyn Repository;

    /// Open a transaction. Operations through [`Transaction::repo`] are
    /// applied atomically on commit.
    async fn begin(&self) -> PulseResult<Box<dyn Transaction>>;
}

/// An open transaction. Dropping it without committing rolls it back.
#[async_trait]
pub trait Transaction: Send + Sync {
    fn repo(&self) -> &dyn Repository;

    async fn commit(self: Box<Self>) -> PulseResult<()>;

    async fn rollback(self: Box<Self>) -> PulseResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use pulse_core::{CustomerEventId, EventSource};
    use serde_json::json;

    fn event(customer: CustomerId, event_type: &str, age_days: i64) -> CustomerEvent {
        CustomerEvent {
            id: CustomerEventId::now_v7(),
            tenant_id: TenantId::nil(),
            customer_id: customer,
            source: EventSource::Stripe,
            external_event_id: format!("evt_{}", age_days),
            event_type: event_type.into(),
            occurred_at: Utc::now() - Duration::days(age_days),
            data: json!({}),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_event_query_matches() {
        let customer = CustomerId::now_v7();
        let query = EventQuery::for_customer(customer)
            .of_types(&["payment.failed"])
            .since(Utc::now() - Duration::days(7));
        assert!(query.matches(&event(customer, "payment.failed", 1)));
        assert!(!query.matches(&event(customer, "payment.failed", 10)));
        assert!(!query.matches(&event(customer, "login", 1)));
        assert!(!query.matches(&event(CustomerId::now_v7(), "payment.failed", 1)));
    }
}
