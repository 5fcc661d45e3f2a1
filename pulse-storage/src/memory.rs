//! In-memory store
//!
//! Mirrors the PostgreSQL store's semantics (natural-key upserts,
//! conflict-ignore logs, tenant scoping) so every component can be tested
//! without a database. Transactions are serialized against each other and
//! roll back by restoring the snapshot taken at `begin`.

use crate::repository::{EventQuery, Repository, Store, Transaction};
use async_trait::async_trait;
use pulse_core::{
    AlertHistory, AlertRule, AlertRuleId, AlertStatus, CompanySummary, ConnectionStatus,
    ContactSummary, ConversationSummary, Customer, CustomerDetail, CustomerEvent, CustomerId,
    CustomerUpsert, CustomerWithScore, DealSummary, EventSource, HealthScore, HealthScoreHistory,
    IntegrationConnection, Notification, NotificationId, NotificationPreference, Payment,
    Provider, PulseError, PulseResult, ScoringConfig, StorageError, Subscription, Tenant,
    TenantId, Timestamp, User, UserId, WebhookEvent,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;

type ProjectionKey = (TenantId, Provider, String);

#[derive(Debug, Clone, Default)]
struct MemoryState {
    tenants: HashMap<TenantId, Tenant>,
    users: HashMap<UserId, User>,
    connections: HashMap<(TenantId, Provider), IntegrationConnection>,
    customers: HashMap<CustomerId, Customer>,
    events: Vec<CustomerEvent>,
    subscriptions: BTreeMap<ProjectionKey, Subscription>,
    payments: BTreeMap<ProjectionKey, Payment>,
    conversations: BTreeMap<ProjectionKey, ConversationSummary>,
    deals: BTreeMap<ProjectionKey, DealSummary>,
    contacts: BTreeMap<ProjectionKey, ContactSummary>,
    companies: BTreeMap<ProjectionKey, CompanySummary>,
    scoring_configs: HashMap<TenantId, ScoringConfig>,
    scores: HashMap<(TenantId, CustomerId), HealthScore>,
    score_history: Vec<HealthScoreHistory>,
    alert_rules: HashMap<AlertRuleId, AlertRule>,
    alert_history: Vec<AlertHistory>,
    preferences: HashMap<(UserId, TenantId), NotificationPreference>,
    notifications: Vec<Notification>,
    webhook_events: HashMap<(Provider, String), WebhookEvent>,
}

impl MemoryState {
    fn tenant_is_live(&self, tenant_id: TenantId) -> bool {
        // Rows written without a tenant record (common in tests) count as live.
        self.tenants
            .get(&tenant_id)
            .is_none_or(|t| t.deleted_at.is_none())
    }

    fn live_customer(&self, tenant_id: TenantId, customer_id: CustomerId) -> Option<&Customer> {
        self.customers
            .get(&customer_id)
            .filter(|c| c.tenant_id == tenant_id && !c.is_deleted())
    }
}

/// Shared handle to the in-memory state; implements [`Repository`].
#[derive(Debug, Clone, Default)]
pub struct MemoryRepo {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryRepo {
    fn lock(&self) -> PulseResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| PulseError::from(StorageError::fault("memory store lock poisoned")))
    }
}

/// In-memory [`Store`] for tests and local development.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    repo: MemoryRepo,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored timeline events, across tenants.
    pub fn event_count(&self) -> usize {
        self.repo.lock().map(|s| s.events.len()).unwrap_or(0)
    }

    /// Number of durable webhook idempotency rows.
    pub fn webhook_event_count(&self) -> usize {
        self.repo.lock().map(|s| s.webhook_events.len()).unwrap_or(0)
    }

    /// Number of score history rows, across tenants.
    pub fn score_history_count(&self) -> usize {
        self.repo.lock().map(|s| s.score_history.len()).unwrap_or(0)
    }

    /// Number of stored subscriptions, across tenants.
    pub fn subscription_count(&self) -> usize {
        self.repo.lock().map(|s| s.subscriptions.len()).unwrap_or(0)
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn repo(&self) -> &dyn Repository {
        &self.repo
    }

    async fn begin(&self) -> PulseResult<Box<dyn Transaction>> {
        let gate = self.gate.clone().lock_owned().await;
        let snapshot = self.repo.lock()?.clone();
        Ok(Box::new(MemoryTransaction {
            repo: self.repo.clone(),
            snapshot: Some(snapshot),
            _gate: gate,
        }))
    }
}

struct MemoryTransaction {
    repo: MemoryRepo,
    snapshot: Option<MemoryState>,
    _gate: OwnedMutexGuard<()>,
}

impl MemoryTransaction {
    fn restore(&mut self) {
        if let Some(snapshot) = self.snapshot.take() {
            if let Ok(mut state) = self.repo.state.lock() {
                *state = snapshot;
            }
        }
    }
}

#[async_trait]
impl Transaction for MemoryTransaction {
    fn repo(&self) -> &dyn Repository {
        &self.repo
    }

    async fn commit(mut self: Box<Self>) -> PulseResult<()> {
        self.snapshot = None;
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> PulseResult<()> {
        self.restore();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.restore();
    }
}

fn upsert_projection<T: Clone>(
    map: &mut BTreeMap<ProjectionKey, T>,
    key: ProjectionKey,
    value: &T,
) -> Option<T> {
    map.insert(key, value.clone())
}

#[async_trait]
impl Repository for MemoryRepo {
    // === Tenants and users ===

    async fn create_tenant(&self, tenant: &Tenant) -> PulseResult<()> {
        let mut state = self.lock()?;
        if state.tenants.contains_key(&tenant.id) {
            return Err(StorageError::Conflict {
                entity: "tenant",
                reason: format!("tenant {} already exists", tenant.id),
            }
            .into());
        }
        state.tenants.insert(tenant.id, tenant.clone());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: TenantId) -> PulseResult<Tenant> {
        let state = self.lock()?;
        state
            .tenants
            .get(&tenant_id)
            .filter(|t| t.deleted_at.is_none())
            .cloned()
            .ok_or_else(|| PulseError::not_found("tenant", tenant_id))
    }

    async fn list_active_tenants(&self) -> PulseResult<Vec<Tenant>> {
        let state = self.lock()?;
        let mut tenants: Vec<Tenant> = state
            .tenants
            .values()
            .filter(|t| t.deleted_at.is_none())
            .cloned()
            .collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }

    async fn soft_delete_tenant(&self, tenant_id: TenantId, at: Timestamp) -> PulseResult<()> {
        let mut state = self.lock()?;
        let tenant = state
            .tenants
            .get_mut(&tenant_id)
            .ok_or_else(|| PulseError::not_found("tenant", tenant_id))?;
        tenant.deleted_at = Some(at);
        Ok(())
    }

    async fn upsert_user(&self, user: &User) -> PulseResult<()> {
        let mut state = self.lock()?;
        let email = user.email.to_ascii_lowercase();
        let clash = state.users.values().any(|u| {
            u.id != user.id && u.tenant_id == user.tenant_id && u.email.to_ascii_lowercase() == email
        });
        if clash {
            return Err(StorageError::Conflict {
                entity: "user",
                reason: format!("email {} already registered", user.email),
            }
            .into());
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_user_by_email(
        &self,
        tenant_id: TenantId,
        email: &str,
    ) -> PulseResult<Option<User>> {
        let state = self.lock()?;
        Ok(state
            .users
            .values()
            .find(|u| u.tenant_id == tenant_id && u.email.eq_ignore_ascii_case(email.trim()))
            .cloned())
    }

    // === Connections ===

    async fn save_connection(&self, connection: &IntegrationConnection) -> PulseResult<()> {
        let mut state = self.lock()?;
        state
            .connections
            .insert((connection.tenant_id, connection.provider), connection.clone());
        Ok(())
    }

    async fn get_connection(
        &self,
        tenant_id: TenantId,
        provider: Provider,
    ) -> PulseResult<Option<IntegrationConnection>> {
        Ok(self.lock()?.connections.get(&(tenant_id, provider)).cloned())
    }

    async fn find_connection_by_account(
        &self,
        provider: Provider,
        external_account_id: &str,
    ) -> PulseResult<Option<IntegrationConnection>> {
        let state = self.lock()?;
        Ok(state
            .connections
            .values()
            .find(|c| {
                c.provider == provider
                    && c.external_account_id.as_deref() == Some(external_account_id)
                    && state.tenant_is_live(c.tenant_id)
            })
            .cloned())
    }

    async fn delete_connection(&self, tenant_id: TenantId, provider: Provider) -> PulseResult<bool> {
        Ok(self.lock()?.connections.remove(&(tenant_id, provider)).is_some())
    }

    async fn list_connections(
        &self,
        provider: Option<Provider>,
        statuses: &[ConnectionStatus],
    ) -> PulseResult<Vec<IntegrationConnection>> {
        let state = self.lock()?;
        let mut out: Vec<IntegrationConnection> = state
            .connections
            .values()
            .filter(|c| provider.is_none_or(|p| p == c.provider))
            .filter(|c| statuses.is_empty() || statuses.contains(&c.status))
            .filter(|c| state.tenant_is_live(c.tenant_id))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.created_at);
        Ok(out)
    }

    // === Customers ===

    async fn upsert_customer_by_external(
        &self,
        tenant_id: TenantId,
        upsert: &CustomerUpsert,
    ) -> PulseResult<Customer> {
        let mut state = self.lock()?;
        let existing = state
            .customers
            .values()
            .find(|c| {
                c.tenant_id == tenant_id
                    && c.source == upsert.source
                    && c.external_id == upsert.external_id
            })
            .cloned();
        let customer = upsert.apply(tenant_id, existing);
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn get_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> PulseResult<Customer> {
        let state = self.lock()?;
        state
            .customers
            .get(&customer_id)
            .filter(|c| c.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| PulseError::not_found("customer", customer_id))
    }

    async fn find_customer_by_external(
        &self,
        tenant_id: TenantId,
        source: Provider,
        external_id: &str,
    ) -> PulseResult<Option<Customer>> {
        let state = self.lock()?;
        Ok(state
            .customers
            .values()
            .find(|c| {
                c.tenant_id == tenant_id
                    && c.source == source
                    && c.external_id == external_id
                    && !c.is_deleted()
            })
            .cloned())
    }

    async fn list_customers(&self, tenant_id: TenantId) -> PulseResult<Vec<Customer>> {
        let state = self.lock()?;
        let mut out: Vec<Customer> = state
            .customers
            .values()
            .filter(|c| c.tenant_id == tenant_id && !c.is_deleted())
            .cloned()
            .collect();
        out.sort_by_key(|c| (c.first_seen_at, c.id));
        Ok(out)
    }

    async fn update_customer(&self, customer: &Customer) -> PulseResult<()> {
        let mut state = self.lock()?;
        match state.customers.get_mut(&customer.id) {
            Some(existing) if existing.tenant_id == customer.tenant_id => {
                *existing = customer.clone();
                Ok(())
            }
            _ => Err(PulseError::not_found("customer", customer.id)),
        }
    }

    async fn find_duplicates_by_email(
        &self,
        tenant_id: TenantId,
    ) -> PulseResult<Vec<Vec<Customer>>> {
        let state = self.lock()?;
        let mut groups: BTreeMap<String, Vec<Customer>> = BTreeMap::new();
        for customer in state.customers.values() {
            if customer.tenant_id != tenant_id || customer.is_deleted() {
                continue;
            }
            if let Some(key) = customer.email_key() {
                groups.entry(key).or_default().push(customer.clone());
            }
        }
        Ok(groups
            .into_values()
            .filter(|g| g.len() > 1)
            .map(|mut g| {
                g.sort_by_key(|c| (c.first_seen_at, c.id));
                g
            })
            .collect())
    }

    async fn merge_customers(
        &self,
        tenant_id: TenantId,
        primary: &Customer,
        absorbed: &[CustomerId],
        at: Timestamp,
    ) -> PulseResult<()> {
        let mut state = self.lock()?;
        if state.live_customer(tenant_id, primary.id).is_none() {
            return Err(PulseError::not_found("customer", primary.id));
        }
        state.customers.insert(primary.id, primary.clone());
        let target = primary.id;
        let is_absorbed = |id: &CustomerId| absorbed.contains(id);

        for id in absorbed {
            if let Some(c) = state.customers.get_mut(id) {
                if c.tenant_id == tenant_id {
                    c.deleted_at = Some(at);
                    c.updated_at = at;
                }
            }
        }
        for e in state.events.iter_mut().filter(|e| e.tenant_id == tenant_id) {
            if is_absorbed(&e.customer_id) {
                e.customer_id = target;
            }
        }
        for s in state.subscriptions.values_mut().filter(|s| s.tenant_id == tenant_id) {
            if is_absorbed(&s.customer_id) {
                s.customer_id = target;
            }
        }
        for p in state.payments.values_mut().filter(|p| p.tenant_id == tenant_id) {
            if is_absorbed(&p.customer_id) {
                p.customer_id = target;
            }
        }
        for c in state.conversations.values_mut().filter(|c| c.tenant_id == tenant_id) {
            if is_absorbed(&c.customer_id) {
                c.customer_id = target;
            }
        }
        for d in state.deals.values_mut().filter(|d| d.tenant_id == tenant_id) {
            if d.customer_id.as_ref().is_some_and(is_absorbed) {
                d.customer_id = Some(target);
            }
        }
        for c in state.contacts.values_mut().filter(|c| c.tenant_id == tenant_id) {
            if is_absorbed(&c.customer_id) {
                c.customer_id = target;
            }
        }
        for a in state.alert_history.iter_mut().filter(|a| a.tenant_id == tenant_id) {
            if a.customer_id.as_ref().is_some_and(is_absorbed) {
                a.customer_id = Some(target);
            }
        }
        state
            .scores
            .retain(|(t, c), _| !(*t == tenant_id && is_absorbed(c)));
        let primary_stamps: Vec<Timestamp> = state
            .score_history
            .iter()
            .filter(|h| h.tenant_id == tenant_id && h.customer_id == target)
            .map(|h| h.calculated_at)
            .collect();
        state.score_history.retain(|h| {
            !(h.tenant_id == tenant_id
                && is_absorbed(&h.customer_id)
                && primary_stamps.contains(&h.calculated_at))
        });
        for h in state.score_history.iter_mut().filter(|h| h.tenant_id == tenant_id) {
            if is_absorbed(&h.customer_id) {
                h.customer_id = target;
            }
        }
        Ok(())
    }

    // === Timeline ===

    async fn append_event(&self, event: &CustomerEvent) -> PulseResult<bool> {
        let mut state = self.lock()?;
        let exists = state.events.iter().any(|e| {
            e.tenant_id == event.tenant_id
                && e.source == event.source
                && e.external_event_id == event.external_event_id
        });
        if exists {
            return Ok(false);
        }
        state.events.push(event.clone());
        Ok(true)
    }

    async fn list_events(
        &self,
        tenant_id: TenantId,
        query: &EventQuery,
    ) -> PulseResult<Vec<CustomerEvent>> {
        let state = self.lock()?;
        let mut out: Vec<CustomerEvent> = state
            .events
            .iter()
            .filter(|e| e.tenant_id == tenant_id && query.matches(e))
            .cloned()
            .collect();
        // Stable sort keeps insertion order among equal timestamps.
        out.sort_by_key(|e| e.occurred_at);
        if query.newest_first {
            out.reverse();
        }
        if let Some(limit) = query.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn count_events_by_customer(
        &self,
        tenant_id: TenantId,
        event_types: &[&str],
        since: Timestamp,
    ) -> PulseResult<HashMap<CustomerId, i64>> {
        let state = self.lock()?;
        let mut counts = HashMap::new();
        for e in &state.events {
            if e.tenant_id == tenant_id
                && e.occurred_at >= since
                && event_types.contains(&e.event_type.as_str())
                && state.live_customer(tenant_id, e.customer_id).is_some()
            {
                *counts.entry(e.customer_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    // === Provider projections ===

    async fn upsert_subscription(
        &self,
        subscription: &Subscription,
    ) -> PulseResult<Option<Subscription>> {
        let mut state = self.lock()?;
        let key = (
            subscription.tenant_id,
            subscription.provider,
            subscription.external_id.clone(),
        );
        let mut row = subscription.clone();
        if let Some(prev) = state.subscriptions.get(&key) {
            row.id = prev.id;
        }
        Ok(upsert_projection(&mut state.subscriptions, key, &row))
    }

    async fn list_subscriptions(
        &self,
        tenant_id: TenantId,
        customer_id: Option<CustomerId>,
    ) -> PulseResult<Vec<Subscription>> {
        let state = self.lock()?;
        Ok(state
            .subscriptions
            .values()
            .filter(|s| s.tenant_id == tenant_id)
            .filter(|s| customer_id.is_none_or(|c| c == s.customer_id))
            .cloned()
            .collect())
    }

    async fn upsert_payment(&self, payment: &Payment) -> PulseResult<Option<Payment>> {
        let mut state = self.lock()?;
        let key = (payment.tenant_id, payment.provider, payment.external_id.clone());
        let mut row = payment.clone();
        if let Some(prev) = state.payments.get(&key) {
            row.id = prev.id;
        }
        Ok(upsert_projection(&mut state.payments, key, &row))
    }

    async fn list_payments(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        since: Option<Timestamp>,
    ) -> PulseResult<Vec<Payment>> {
        let state = self.lock()?;
        let mut out: Vec<Payment> = state
            .payments
            .values()
            .filter(|p| p.tenant_id == tenant_id && p.customer_id == customer_id)
            .filter(|p| since.is_none_or(|s| p.occurred_at >= s))
            .cloned()
            .collect();
        out.sort_by_key(|p| p.occurred_at);
        Ok(out)
    }

    async fn upsert_conversation(
        &self,
        conversation: &ConversationSummary,
    ) -> PulseResult<Option<ConversationSummary>> {
        let mut state = self.lock()?;
        let key = (
            conversation.tenant_id,
            conversation.provider,
            conversation.external_id.clone(),
        );
        let mut row = conversation.clone();
        if let Some(prev) = state.conversations.get(&key) {
            row.id = prev.id;
        }
        Ok(upsert_projection(&mut state.conversations, key, &row))
    }

    async fn list_conversations(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        since: Option<Timestamp>,
    ) -> PulseResult<Vec<ConversationSummary>> {
        let state = self.lock()?;
        let mut out: Vec<ConversationSummary> = state
            .conversations
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.customer_id == customer_id)
            .filter(|c| since.is_none_or(|s| c.opened_at >= s))
            .cloned()
            .collect();
        out.sort_by_key(|c| c.opened_at);
        Ok(out)
    }

    async fn count_conversations_by_customer(
        &self,
        tenant_id: TenantId,
        since: Timestamp,
    ) -> PulseResult<HashMap<CustomerId, i64>> {
        let state = self.lock()?;
        let mut counts = HashMap::new();
        for c in state.conversations.values() {
            if c.tenant_id == tenant_id
                && c.opened_at >= since
                && state.live_customer(tenant_id, c.customer_id).is_some()
            {
                *counts.entry(c.customer_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    async fn upsert_deal(&self, deal: &DealSummary) -> PulseResult<Option<DealSummary>> {
        let mut state = self.lock()?;
        let key = (deal.tenant_id, deal.provider, deal.external_id.clone());
        let mut row = deal.clone();
        if let Some(prev) = state.deals.get(&key) {
            row.id = prev.id;
            row.customer_id = row.customer_id.or(prev.customer_id);
        }
        Ok(upsert_projection(&mut state.deals, key, &row))
    }

    async fn upsert_contact(&self, contact: &ContactSummary) -> PulseResult<Option<ContactSummary>> {
        let mut state = self.lock()?;
        let key = (contact.tenant_id, contact.provider, contact.external_id.clone());
        let mut row = contact.clone();
        if let Some(prev) = state.contacts.get(&key) {
            row.id = prev.id;
        }
        Ok(upsert_projection(&mut state.contacts, key, &row))
    }

    async fn list_contacts(
        &self,
        tenant_id: TenantId,
        provider: Provider,
    ) -> PulseResult<Vec<ContactSummary>> {
        let state = self.lock()?;
        Ok(state
            .contacts
            .values()
            .filter(|c| c.tenant_id == tenant_id && c.provider == provider)
            .cloned()
            .collect())
    }

    async fn upsert_company(&self, company: &CompanySummary) -> PulseResult<Option<CompanySummary>> {
        let mut state = self.lock()?;
        let key = (company.tenant_id, company.provider, company.external_id.clone());
        let mut row = company.clone();
        if let Some(prev) = state.companies.get(&key) {
            row.id = prev.id;
        }
        Ok(upsert_projection(&mut state.companies, key, &row))
    }

    async fn get_company(
        &self,
        tenant_id: TenantId,
        provider: Provider,
        external_id: &str,
    ) -> PulseResult<Option<CompanySummary>> {
        let state = self.lock()?;
        Ok(state
            .companies
            .get(&(tenant_id, provider, external_id.to_string()))
            .cloned())
    }

    // === Scoring ===

    async fn get_scoring_config(&self, tenant_id: TenantId) -> PulseResult<Option<ScoringConfig>> {
        Ok(self.lock()?.scoring_configs.get(&tenant_id).cloned())
    }

    async fn save_scoring_config(&self, config: &ScoringConfig) -> PulseResult<()> {
        self.lock()?
            .scoring_configs
            .insert(config.tenant_id, config.clone());
        Ok(())
    }

    async fn get_current_score(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> PulseResult<Option<HealthScore>> {
        Ok(self.lock()?.scores.get(&(tenant_id, customer_id)).cloned())
    }

    async fn upsert_current_score(&self, score: &HealthScore) -> PulseResult<()> {
        self.lock()?
            .scores
            .insert((score.tenant_id, score.customer_id), score.clone());
        Ok(())
    }

    async fn append_score_history(&self, entry: &HealthScoreHistory) -> PulseResult<bool> {
        let mut state = self.lock()?;
        let exists = state.score_history.iter().any(|h| {
            h.tenant_id == entry.tenant_id
                && h.customer_id == entry.customer_id
                && h.calculated_at == entry.calculated_at
        });
        if exists {
            return Ok(false);
        }
        state.score_history.push(entry.clone());
        Ok(true)
    }

    async fn get_score_at(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        at: Timestamp,
    ) -> PulseResult<Option<HealthScoreHistory>> {
        let state = self.lock()?;
        Ok(state
            .score_history
            .iter()
            .filter(|h| {
                h.tenant_id == tenant_id && h.customer_id == customer_id && h.calculated_at <= at
            })
            .max_by_key(|h| h.calculated_at)
            .cloned())
    }

    async fn list_score_history(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        since: Timestamp,
    ) -> PulseResult<Vec<HealthScoreHistory>> {
        let state = self.lock()?;
        let mut out: Vec<HealthScoreHistory> = state
            .score_history
            .iter()
            .filter(|h| {
                h.tenant_id == tenant_id && h.customer_id == customer_id && h.calculated_at >= since
            })
            .cloned()
            .collect();
        out.sort_by_key(|h| h.calculated_at);
        Ok(out)
    }

    async fn prune_score_history(&self, before: Timestamp) -> PulseResult<u64> {
        let mut state = self.lock()?;
        let len = state.score_history.len();
        state.score_history.retain(|h| h.calculated_at >= before);
        Ok((len - state.score_history.len()) as u64)
    }

    async fn list_customers_with_scores(
        &self,
        tenant_id: TenantId,
    ) -> PulseResult<Vec<CustomerWithScore>> {
        let customers = self.list_customers(tenant_id).await?;
        let state = self.lock()?;
        Ok(customers
            .into_iter()
            .map(|customer| {
                let score = state.scores.get(&(tenant_id, customer.id)).cloned();
                CustomerWithScore { customer, score }
            })
            .collect())
    }

    async fn get_customer_detail(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
        recent_events: usize,
    ) -> PulseResult<CustomerDetail> {
        let customer = self.get_customer(tenant_id, customer_id).await?;
        let score = self.get_current_score(tenant_id, customer_id).await?;
        let recent_events = self
            .list_events(
                tenant_id,
                &EventQuery::for_customer(customer_id).newest_first(recent_events),
            )
            .await?;
        let subscriptions = self.list_subscriptions(tenant_id, Some(customer_id)).await?;
        Ok(CustomerDetail {
            customer,
            score,
            recent_events,
            subscriptions,
        })
    }

    // === Alerts ===

    async fn save_alert_rule(&self, rule: &AlertRule) -> PulseResult<()> {
        self.lock()?.alert_rules.insert(rule.id, rule.clone());
        Ok(())
    }

    async fn get_alert_rule(
        &self,
        tenant_id: TenantId,
        rule_id: AlertRuleId,
    ) -> PulseResult<AlertRule> {
        let state = self.lock()?;
        state
            .alert_rules
            .get(&rule_id)
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| PulseError::not_found("alert_rule", rule_id))
    }

    async fn delete_alert_rule(
        &self,
        tenant_id: TenantId,
        rule_id: AlertRuleId,
    ) -> PulseResult<bool> {
        let mut state = self.lock()?;
        let owned = state
            .alert_rules
            .get(&rule_id)
            .is_some_and(|r| r.tenant_id == tenant_id);
        if !owned {
            return Ok(false);
        }
        state.alert_rules.remove(&rule_id);
        state.alert_history.retain(|h| h.alert_rule_id != rule_id);
        Ok(true)
    }

    async fn list_alert_rules(
        &self,
        tenant_id: TenantId,
        active_only: bool,
    ) -> PulseResult<Vec<AlertRule>> {
        let state = self.lock()?;
        let mut out: Vec<AlertRule> = state
            .alert_rules
            .values()
            .filter(|r| r.tenant_id == tenant_id && (!active_only || r.is_active))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.created_at);
        Ok(out)
    }

    async fn list_tenants_with_active_rules(&self) -> PulseResult<Vec<TenantId>> {
        let state = self.lock()?;
        let mut tenants: Vec<TenantId> = state
            .alert_rules
            .values()
            .filter(|r| r.is_active && state.tenant_is_live(r.tenant_id))
            .map(|r| r.tenant_id)
            .collect();
        tenants.sort();
        tenants.dedup();
        Ok(tenants)
    }

    async fn insert_alert_history(&self, entry: &AlertHistory) -> PulseResult<()> {
        self.lock()?.alert_history.push(entry.clone());
        Ok(())
    }

    async fn update_alert_history(&self, entry: &AlertHistory) -> PulseResult<()> {
        let mut state = self.lock()?;
        let row = state
            .alert_history
            .iter_mut()
            .find(|h| h.id == entry.id)
            .ok_or_else(|| PulseError::not_found("alert_history", entry.id))?;
        *row = entry.clone();
        Ok(())
    }

    async fn get_last_alert(
        &self,
        tenant_id: TenantId,
        rule_id: AlertRuleId,
        customer_id: Option<CustomerId>,
    ) -> PulseResult<Option<AlertHistory>> {
        let state = self.lock()?;
        Ok(state
            .alert_history
            .iter()
            .filter(|h| {
                h.tenant_id == tenant_id
                    && h.alert_rule_id == rule_id
                    && h.customer_id == customer_id
                    && h.status != AlertStatus::Failed
            })
            .max_by_key(|h| h.created_at)
            .cloned())
    }

    async fn find_alert_by_message_id(&self, message_id: &str) -> PulseResult<Option<AlertHistory>> {
        let state = self.lock()?;
        Ok(state
            .alert_history
            .iter()
            .find(|h| h.provider_message_id.as_deref() == Some(message_id))
            .cloned())
    }

    async fn list_alert_history(
        &self,
        tenant_id: TenantId,
        rule_id: Option<AlertRuleId>,
    ) -> PulseResult<Vec<AlertHistory>> {
        let state = self.lock()?;
        let mut out: Vec<AlertHistory> = state
            .alert_history
            .iter()
            .filter(|h| h.tenant_id == tenant_id && rule_id.is_none_or(|r| r == h.alert_rule_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    // === Notifications ===

    async fn get_notification_preference(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
    ) -> PulseResult<Option<NotificationPreference>> {
        Ok(self.lock()?.preferences.get(&(user_id, tenant_id)).cloned())
    }

    async fn save_notification_preference(
        &self,
        pref: &NotificationPreference,
    ) -> PulseResult<()> {
        self.lock()?
            .preferences
            .insert((pref.user_id, pref.tenant_id), pref.clone());
        Ok(())
    }

    async fn insert_notification(&self, notification: &Notification) -> PulseResult<()> {
        self.lock()?.notifications.push(notification.clone());
        Ok(())
    }

    async fn list_notifications(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        unread_only: bool,
    ) -> PulseResult<Vec<Notification>> {
        let state = self.lock()?;
        let mut out: Vec<Notification> = state
            .notifications
            .iter()
            .filter(|n| n.tenant_id == tenant_id && n.user_id == user_id)
            .filter(|n| !unread_only || n.read_at.is_none())
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn mark_notification_read(
        &self,
        tenant_id: TenantId,
        user_id: UserId,
        notification_id: NotificationId,
        at: Timestamp,
    ) -> PulseResult<bool> {
        let mut state = self.lock()?;
        match state.notifications.iter_mut().find(|n| {
            n.id == notification_id && n.tenant_id == tenant_id && n.user_id == user_id
        }) {
            Some(n) if n.read_at.is_none() => {
                n.read_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    // === Webhook idempotency ===

    async fn mark_webhook_processed(&self, event: &WebhookEvent) -> PulseResult<bool> {
        let mut state = self.lock()?;
        let key = (event.provider, event.external_event_id.clone());
        if state.webhook_events.contains_key(&key) {
            return Ok(false);
        }
        state.webhook_events.insert(key, event.clone());
        Ok(true)
    }

    async fn prune_webhook_events(&self, before: Timestamp) -> PulseResult<u64> {
        let mut state = self.lock()?;
        let len = state.webhook_events.len();
        state.webhook_events.retain(|_, e| e.received_at >= before);
        Ok((len - state.webhook_events.len()) as u64)
    }
}

impl MemoryStore {
    /// Direct access to the shared repository handle.
    pub fn memory_repo(&self) -> &MemoryRepo {
        &self.repo
    }

    /// Events for a customer, any source, in insertion order.
    pub fn events_for(&self, customer_id: CustomerId) -> Vec<CustomerEvent> {
        self.repo
            .lock()
            .map(|s| {
                s.events
                    .iter()
                    .filter(|e| e.customer_id == customer_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Events emitted by the scoring engine for a customer.
    pub fn scoring_events_for(&self, customer_id: CustomerId) -> Vec<CustomerEvent> {
        self.events_for(customer_id)
            .into_iter()
            .filter(|e| e.source == EventSource::HealthScoring)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use pulse_core::TimelineEvent;

    fn tenant() -> TenantId {
        TenantId::now_v7()
    }

    fn payment_failed(tenant_id: TenantId, customer_id: CustomerId, id: &str) -> CustomerEvent {
        CustomerEvent::new(
            tenant_id,
            customer_id,
            EventSource::Stripe,
            id,
            Utc::now(),
            &TimelineEvent::PaymentFailed {
                payment_id: "ch_1".into(),
                amount_cents: 1000,
                currency: Some("usd".into()),
                failure_reason: None,
            },
        )
    }

    #[tokio::test]
    async fn test_upsert_customer_is_idempotent_on_natural_key() {
        let store = MemoryStore::new();
        let t = tenant();
        let upsert = CustomerUpsert::new(Provider::Stripe, "cus_1", Utc::now())
            .with_email(Some("a@x.com".into()));
        let a = store.repo().upsert_customer_by_external(t, &upsert).await.unwrap();
        let b = store.repo().upsert_customer_by_external(t, &upsert).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.repo().list_customers(t).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unlinked_deal_upsert_keeps_customer() {
        let store = MemoryStore::new();
        let t = tenant();
        let customer = CustomerId::now_v7();
        let mut deal = DealSummary {
            id: uuid::Uuid::now_v7(),
            tenant_id: t,
            provider: Provider::Hubspot,
            external_id: "9001".into(),
            customer_id: Some(customer),
            name: None,
            stage: Some("qualified".into()),
            amount_cents: None,
            close_date: None,
            metadata: Default::default(),
            updated_at: Utc::now(),
        };
        assert!(store.repo().upsert_deal(&deal).await.unwrap().is_none());

        deal.customer_id = None;
        deal.stage = Some("closedwon".into());
        let previous = store.repo().upsert_deal(&deal).await.unwrap().unwrap();
        assert_eq!(previous.stage.as_deref(), Some("qualified"));

        let current = store.repo().upsert_deal(&deal).await.unwrap().unwrap();
        assert_eq!(current.customer_id, Some(customer));
        assert_eq!(current.stage.as_deref(), Some("closedwon"));
    }

    #[tokio::test]
    async fn test_upsert_revives_soft_deleted_customer() {
        let store = MemoryStore::new();
        let t = tenant();
        let upsert = CustomerUpsert::new(Provider::Hubspot, "42", Utc::now());
        let mut customer = store.repo().upsert_customer_by_external(t, &upsert).await.unwrap();
        customer.deleted_at = Some(Utc::now());
        store.repo().update_customer(&customer).await.unwrap();
        assert!(store.repo().list_customers(t).await.unwrap().is_empty());

        let revived = store.repo().upsert_customer_by_external(t, &upsert).await.unwrap();
        assert_eq!(revived.id, customer.id);
        assert!(revived.deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_append_event_conflict_ignore() {
        let store = MemoryStore::new();
        let t = tenant();
        let c = CustomerId::now_v7();
        assert!(store.repo().append_event(&payment_failed(t, c, "evt_1")).await.unwrap());
        assert!(!store.repo().append_event(&payment_failed(t, c, "evt_1")).await.unwrap());
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let store = MemoryStore::new();
        let t = tenant();
        let c = CustomerId::now_v7();
        let tx = store.begin().await.unwrap();
        tx.repo().append_event(&payment_failed(t, c, "evt_1")).await.unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.event_count(), 0);

        let tx = store.begin().await.unwrap();
        tx.repo().append_event(&payment_failed(t, c, "evt_2")).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.event_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = MemoryStore::new();
        {
            let tx = store.begin().await.unwrap();
            tx.repo()
                .append_event(&payment_failed(tenant(), CustomerId::now_v7(), "evt_x"))
                .await
                .unwrap();
        }
        assert_eq!(store.event_count(), 0);
    }

    #[tokio::test]
    async fn test_mark_webhook_processed_once() {
        let store = MemoryStore::new();
        let event = WebhookEvent {
            tenant_id: None,
            provider: Provider::Stripe,
            external_event_id: "evt_123".into(),
            event_type: "invoice.payment_failed".into(),
            received_at: Utc::now(),
        };
        assert!(store.repo().mark_webhook_processed(&event).await.unwrap());
        assert!(!store.repo().mark_webhook_processed(&event).await.unwrap());
        assert_eq!(store.webhook_event_count(), 1);
    }

    #[tokio::test]
    async fn test_get_score_at_picks_latest_before() {
        let store = MemoryStore::new();
        let t = tenant();
        let c = CustomerId::now_v7();
        let now = Utc::now();
        for (days_ago, score) in [(10, 90), (7, 85), (1, 70)] {
            store
                .repo()
                .append_score_history(&HealthScoreHistory {
                    tenant_id: t,
                    customer_id: c,
                    overall_score: score,
                    risk_level: pulse_core::RiskLevel::Green,
                    factors: Default::default(),
                    calculated_at: now - Duration::days(days_ago),
                })
                .await
                .unwrap();
        }
        let at = store
            .repo()
            .get_score_at(t, c, now - Duration::days(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(at.overall_score, 85);
        assert!(store
            .repo()
            .get_score_at(t, c, now - Duration::days(30))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicates_grouped_case_insensitively() {
        let store = MemoryStore::new();
        let t = tenant();
        let now = Utc::now();
        store
            .repo()
            .upsert_customer_by_external(
                t,
                &CustomerUpsert::new(Provider::Stripe, "cus_1", now).with_email(Some("A@x.com".into())),
            )
            .await
            .unwrap();
        store
            .repo()
            .upsert_customer_by_external(
                t,
                &CustomerUpsert::new(Provider::Hubspot, "7", now + Duration::days(1))
                    .with_email(Some("a@x.com".into())),
            )
            .await
            .unwrap();
        store
            .repo()
            .upsert_customer_by_external(
                t,
                &CustomerUpsert::new(Provider::Intercom, "u1", now).with_email(Some("b@x.com".into())),
            )
            .await
            .unwrap();
        let groups = store.repo().find_duplicates_by_email(t).await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0][0].source, Provider::Stripe);
    }

    #[tokio::test]
    async fn test_merge_repoints_children() {
        let store = MemoryStore::new();
        let t = tenant();
        let now = Utc::now();
        let primary = store
            .repo()
            .upsert_customer_by_external(t, &CustomerUpsert::new(Provider::Stripe, "cus_1", now))
            .await
            .unwrap();
        let dup = store
            .repo()
            .upsert_customer_by_external(t, &CustomerUpsert::new(Provider::Hubspot, "9", now))
            .await
            .unwrap();
        store
            .repo()
            .append_event(&payment_failed(t, dup.id, "evt_dup"))
            .await
            .unwrap();
        store
            .repo()
            .merge_customers(t, &primary, &[dup.id], now)
            .await
            .unwrap();
        assert_eq!(store.events_for(primary.id).len(), 1);
        let remaining = store.repo().list_customers(t).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, primary.id);
    }

    #[tokio::test]
    async fn test_rolled_back_merge_leaves_rows_untouched() {
        let store = MemoryStore::new();
        let t = tenant();
        let now = Utc::now();
        let mut primary = store
            .repo()
            .upsert_customer_by_external(t, &CustomerUpsert::new(Provider::Stripe, "cus_1", now))
            .await
            .unwrap();
        let dup = store
            .repo()
            .upsert_customer_by_external(t, &CustomerUpsert::new(Provider::Hubspot, "9", now))
            .await
            .unwrap();
        store
            .repo()
            .append_event(&payment_failed(t, dup.id, "evt_dup"))
            .await
            .unwrap();

        primary.company_name = Some("Acme".into());
        let tx = store.begin().await.unwrap();
        tx.repo().merge_customers(t, &primary, &[dup.id], now).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.events_for(dup.id).len(), 1);
        assert!(store.events_for(primary.id).is_empty());
        let live = store.repo().list_customers(t).await.unwrap();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|c| c.company_name.is_none()));
    }

    #[tokio::test]
    async fn test_last_alert_ignores_failed_rows() {
        let store = MemoryStore::new();
        let t = tenant();
        let rule = AlertRule {
            id: AlertRuleId::now_v7(),
            tenant_id: t,
            name: "drop".into(),
            description: None,
            trigger_type: pulse_core::TriggerType::ScoreDrop,
            conditions: Default::default(),
            channel: pulse_core::AlertChannel::Email,
            recipients: vec!["ops@x.com".into()],
            is_active: true,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let c = Some(CustomerId::now_v7());
        let mut failed = AlertHistory::pending(&rule, c, serde_json::json!({}), Utc::now());
        failed.status = AlertStatus::Failed;
        store.repo().insert_alert_history(&failed).await.unwrap();
        assert!(store.repo().get_last_alert(t, rule.id, c).await.unwrap().is_none());

        let mut sent = AlertHistory::pending(&rule, c, serde_json::json!({}), Utc::now());
        sent.status = AlertStatus::Sent;
        store.repo().insert_alert_history(&sent).await.unwrap();
        let last = store.repo().get_last_alert(t, rule.id, c).await.unwrap().unwrap();
        assert_eq!(last.id, sent.id);
    }

    #[tokio::test]
    async fn test_tombstoned_tenant_hidden_from_scans() {
        let store = MemoryStore::new();
        let tenant = Tenant {
            id: TenantId::now_v7(),
            name: "Acme".into(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        store.repo().create_tenant(&tenant).await.unwrap();
        store
            .repo()
            .soft_delete_tenant(tenant.id, Utc::now())
            .await
            .unwrap();
        assert!(store.repo().get_tenant(tenant.id).await.is_err());
        assert!(store.repo().list_active_tenants().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notifications_mark_read_once() {
        let store = MemoryStore::new();
        let t = tenant();
        let user = UserId::now_v7();
        let n = Notification {
            id: NotificationId::now_v7(),
            user_id: user,
            tenant_id: t,
            notification_type: "alert".into(),
            title: "Score dropped".into(),
            message: "Acme dropped 15 points".into(),
            data: serde_json::json!({}),
            read_at: None,
            created_at: Utc::now(),
        };
        store.repo().insert_notification(&n).await.unwrap();
        assert_eq!(store.repo().list_notifications(t, user, true).await.unwrap().len(), 1);
        assert!(store.repo().mark_notification_read(t, user, n.id, Utc::now()).await.unwrap());
        assert!(!store.repo().mark_notification_read(t, user, n.id, Utc::now()).await.unwrap());
        assert!(store.repo().list_notifications(t, user, true).await.unwrap().is_empty());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        proptest! {
            #[test]
            fn prop_one_live_row_per_external_id(ids in prop::collection::vec(0u8..6, 1..20)) {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let store = MemoryStore::new();
                let t = tenant();
                rt.block_on(async {
                    for id in &ids {
                        let upsert = CustomerUpsert::new(Provider::Stripe, format!("cus_{}", id), Utc::now());
                        store.repo().upsert_customer_by_external(t, &upsert).await.unwrap();
                    }
                });
                let distinct: BTreeSet<u8> = ids.iter().copied().collect();
                let live = rt.block_on(store.repo().list_customers(t)).unwrap();
                prop_assert_eq!(live.len(), distinct.len());
            }
        }
    }
}
