//! Support adapter (Intercom).
//!
//! Conversations and tickets share one projection. Tickets delivered by
//! webhook are keyed `ticket:<id>` so they never collide with the
//! conversation that spawned them.

use super::{
    ensure_customer, object_map, require_str, soft_delete_customer, str_of, unix_secs, AdapterDeps, Applied,
};
use crate::adapter::{emit, window_start, IntegrationAdapter, PullRequest, PullSummary, SyncProgress};
use crate::client::ProviderClient;
use crate::credentials::{json_id, CredentialManager};
use crate::signature::verify_intercom;
use crate::webhook::{InboundWebhook, WebhookEffect, WebhookEnvelope, WebhookOutcome, WebhookPipeline};
use async_trait::async_trait;
use chrono::Utc;
use pulse_core::{
    ContactSummary, ConversationState, ConversationSummary, CustomerId, CustomerUpsert, IntegrationError,
    JsonMap, ObjectKind, OpContext, Provider, ProviderCredentials, PulseError, PulseResult, TenantId,
    TimelineEvent, Timestamp,
};
use pulse_storage::{Repository, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const INTERCOM_API_BASE: &str = "https://api.intercom.io";

const PAGE_LIMIT: u32 = 150;

const OBJECT_KINDS: &[ObjectKind] = &[ObjectKind::Contacts, ObjectKind::Conversations];

pub struct IntercomAdapter {
    store: Arc<dyn Store>,
    client: ProviderClient,
    credentials: CredentialManager,
    pipeline: Arc<WebhookPipeline>,
    window_days: i64,
}

impl IntercomAdapter {
    pub fn new(deps: &AdapterDeps, credentials: ProviderCredentials) -> Self {
        let (client, manager) = deps.wire(Provider::Intercom, INTERCOM_API_BASE, credentials);
        Self {
            store: deps.store.clone(),
            client,
            credentials: manager,
            pipeline: deps.pipeline.clone(),
            window_days: deps.window_days,
        }
    }

    async fn fetch_contacts(&self, token: &str, since: Option<Timestamp>, cursor: Option<&str>) -> PulseResult<Value> {
        match since {
            None => {
                let mut query = vec![("per_page", PAGE_LIMIT.to_string())];
                if let Some(cursor) = cursor {
                    query.push(("starting_after", cursor.to_string()));
                }
                self.client.get("/contacts", token, &query).await
            }
            Some(since) => {
                let body = search_body(
                    json!({"field": "updated_at", "operator": ">", "value": since.timestamp()}),
                    cursor,
                );
                self.client.post_json("/contacts/search", token, body).await
            }
        }
    }

    /// Conversations are always searched: created inside the rolling
    /// window, and touched since the last sync when incremental.
    async fn fetch_conversations(&self, token: &str, since: Option<Timestamp>, cursor: Option<&str>) -> PulseResult<Value> {
        let window = window_start(None, Utc::now(), self.window_days);
        let mut filters = vec![json!({"field": "created_at", "operator": ">", "value": window.timestamp()})];
        if let Some(since) = since {
            filters.push(json!({"field": "updated_at", "operator": ">", "value": since.timestamp()}));
        }
        let body = search_body(json!({"operator": "AND", "value": filters}), cursor);
        self.client.post_json("/conversations/search", token, body).await
    }
}

fn search_body(query: Value, cursor: Option<&str>) -> Value {
    let mut pagination = json!({"per_page": PAGE_LIMIT});
    if let Some(cursor) = cursor {
        pagination["starting_after"] = json!(cursor);
    }
    json!({"query": query, "pagination": pagination})
}

/// Page items live under `data` for contacts and `conversations` for
/// conversation search.
fn page_items(page: &Value) -> Vec<Value> {
    ["data", "conversations"]
        .iter()
        .find_map(|key| page.get(*key).and_then(Value::as_array))
        .cloned()
        .unwrap_or_default()
}

#[async_trait]
impl IntegrationAdapter for IntercomAdapter {
    fn provider(&self) -> Provider {
        Provider::Intercom
    }

    fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    fn object_kinds(&self) -> &'static [ObjectKind] {
        OBJECT_KINDS
    }

    async fn pull(&self, ctx: &OpContext, request: &PullRequest, progress: &mut SyncProgress) -> PulseResult<PullSummary> {
        let token = self.credentials.get_access_token(request.tenant_id).await?;
        let repo = self.store.repo();
        let mut summary = PullSummary::default();
        let mut cursor: Option<String> = None;
        loop {
            ctx.check()?;
            let page = match request.kind {
                ObjectKind::Contacts => self.fetch_contacts(&token, request.since, cursor.as_deref()).await?,
                ObjectKind::Conversations => {
                    self.fetch_conversations(&token, request.since, cursor.as_deref()).await?
                }
                other => {
                    return Err(PulseError::validation(
                        "object_kind",
                        format!("intercom does not sync {}", other),
                    ))
                }
            };
            let items = page_items(&page);
            summary.pages += 1;
            progress.page(items.len());

            for item in &items {
                let id = json_id(item.get("id")).unwrap_or_default();
                let result = match request.kind {
                    ObjectKind::Contacts => apply_contact(repo, request.tenant_id, item).await,
                    _ => apply_conversation(repo, request.tenant_id, item).await,
                };
                match result {
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
                            "Failed to apply intercom object"
                        );
                        progress.error(&id, &err);
                    }
                }
                progress.advance();
            }

            cursor = page
                .pointer("/pages/next/starting_after")
                .and_then(|v| json_id(Some(v)));
            if cursor.is_none() || items.is_empty() {
                break;
            }
        }
        Ok(summary)
    }

    async fn handle_webhook(&self, webhook: &InboundWebhook) -> PulseResult<WebhookOutcome> {
        let signature = webhook
            .header("X-Hub-Signature")
            .ok_or_else(|| IntegrationError::auth(Provider::Intercom, "missing X-Hub-Signature header"))?;
        verify_intercom(&webhook.body, signature, self.credentials.webhook_secret())?;

        let payload = webhook.json()?;
        let topic = require_str(Provider::Intercom, &payload, "topic")?;
        if topic_kind(&topic).is_none() {
            tracing::debug!(topic = %topic, "Ignoring intercom webhook");
            return Ok(WebhookOutcome::Ignored);
        }
        let event_id = require_str(Provider::Intercom, &payload, "id")?;
        let Some(app_id) = str_of(&payload, "app_id") else {
            tracing::debug!(event_id = %event_id, "Intercom webhook without app_id");
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(connection) = self
            .store
            .repo()
            .find_connection_by_account(Provider::Intercom, &app_id)
            .await?
        else {
            tracing::warn!(event_id = %event_id, app_id = %app_id, "No connection for intercom app");
            return Ok(WebhookOutcome::Ignored);
        };

        let envelope = WebhookEnvelope {
            provider: Provider::Intercom,
            tenant_id: connection.tenant_id,
            event_id,
            event_type: topic,
            payload,
        };
        self.pipeline.process(&envelope, self).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopicKind {
    Contact,
    Conversation,
    Ticket,
}

fn topic_kind(topic: &str) -> Option<TopicKind> {
    match topic.split('.').next()? {
        "contact" | "user" => Some(TopicKind::Contact),
        "conversation" => Some(TopicKind::Conversation),
        "ticket" => Some(TopicKind::Ticket),
        _ => None,
    }
}

#[async_trait]
impl WebhookEffect for IntercomAdapter {
    async fn apply(&self, repo: &dyn Repository, envelope: &WebhookEnvelope) -> PulseResult<Vec<CustomerId>> {
        let item = envelope
            .payload
            .pointer("/data/item")
            .ok_or_else(|| PulseError::validation("intercom.data.item", "missing event item"))?;
        let tenant_id = envelope.tenant_id;

        let applied = match topic_kind(&envelope.event_type) {
            Some(TopicKind::Contact) if envelope.event_type.ends_with(".deleted") => {
                let id = require_str(Provider::Intercom, item, "id")?;
                let at = unix_secs(envelope.payload.get("created_at")).unwrap_or_else(Utc::now);
                soft_delete_customer(repo, tenant_id, Provider::Intercom, &id, at)
                    .await?
                    .map(Applied::customer)
                    .unwrap_or_default()
            }
            Some(TopicKind::Contact) => apply_contact(repo, tenant_id, item).await?,
            Some(TopicKind::Conversation) => apply_conversation(repo, tenant_id, item).await?,
            Some(TopicKind::Ticket) => apply_ticket(repo, tenant_id, item).await?,
            None => Applied::skipped(),
        };
        Ok(applied.customer.into_iter().collect())
    }
}

// ============================================================================
// OBJECT MAPPING
// ============================================================================

async fn apply_contact(repo: &dyn Repository, tenant_id: TenantId, contact: &Value) -> PulseResult<Applied> {
    let id = require_str(Provider::Intercom, contact, "id")?;
    let now = Utc::now();
    let created = unix_secs(contact.get("created_at")).unwrap_or(now);
    let email = str_of(contact, "email");
    let name = str_of(contact, "name");
    let last_seen = unix_secs(contact.get("last_seen_at"));
    let company_id = contact
        .pointer("/companies/data")
        .and_then(Value::as_array)
        .and_then(|companies| companies.iter().find_map(|c| json_id(c.get("id"))));

    let upsert = CustomerUpsert::new(Provider::Intercom, &id, created)
        .with_name(name.clone())
        .with_email(email.clone())
        .with_namespace(json!({
            "role": str_of(contact, "role"),
            "last_seen_at": last_seen.map(|t| t.to_rfc3339()),
            "custom_attributes": contact.get("custom_attributes").cloned().unwrap_or(Value::Null),
        }));
    let customer = repo.upsert_customer_by_external(tenant_id, &upsert).await?;

    let summary = ContactSummary {
        id: Uuid::now_v7(),
        tenant_id,
        provider: Provider::Intercom,
        external_id: id.clone(),
        customer_id: customer.id,
        email: email.clone(),
        name,
        company_external_id: company_id,
        metadata: object_map(contact.get("custom_attributes")),
        updated_at: unix_secs(contact.get("updated_at")).unwrap_or(now),
    };
    repo.upsert_contact(&summary).await?;

    let mut applied = Applied::customer(customer.id);
    if let Some(seen) = last_seen {
        let event = TimelineEvent::Login { user: email };
        let appended = emit(
            repo,
            tenant_id,
            customer.id,
            Provider::Intercom,
            format!("{}:seen:{}", id, seen.timestamp()),
            seen,
            &event,
        )
        .await?;
        applied.count(appended);
    }
    Ok(applied)
}

/// Provider-neutral view of a conversation or ticket.
#[derive(Debug, Clone, PartialEq)]
struct Thread {
    external_id: String,
    source_id: String,
    contact_id: Option<String>,
    state: ConversationState,
    is_ticket: bool,
    title: Option<String>,
    opened_at: Timestamp,
    closed_at: Option<Timestamp>,
    metadata: JsonMap,
}

fn first_contact(item: &Value) -> Option<String> {
    item.pointer("/contacts/contacts")
        .and_then(Value::as_array)?
        .iter()
        .find_map(|c| json_id(c.get("id")))
}

fn conversation_thread(item: &Value) -> PulseResult<Thread> {
    let id = json_id(item.get("id")).ok_or_else(|| PulseError::validation("intercom.id", "missing conversation id"))?;
    let now = Utc::now();
    let state = str_of(item, "state")
        .and_then(|s| s.parse::<ConversationState>().ok())
        .unwrap_or(ConversationState::Open);
    let closed_at = (state == ConversationState::Closed).then(|| {
        unix_secs(item.pointer("/statistics/last_close_at"))
            .or_else(|| unix_secs(item.get("updated_at")))
            .unwrap_or(now)
    });
    let title = str_of(item, "title").or_else(|| item.get("source").and_then(|s| str_of(s, "subject")));
    let mut metadata = JsonMap::new();
    for key in ["priority", "admin_assignee_id", "team_assignee_id", "read"] {
        if let Some(value) = item.get(key).filter(|v| !v.is_null()) {
            metadata.insert(key.to_string(), value.clone());
        }
    }
    Ok(Thread {
        external_id: id.clone(),
        source_id: id,
        contact_id: first_contact(item),
        state,
        is_ticket: item.get("ticket").is_some_and(|t| !t.is_null()),
        title,
        opened_at: unix_secs(item.get("created_at")).unwrap_or(now),
        closed_at,
        metadata,
    })
}

fn ticket_thread(item: &Value) -> PulseResult<Thread> {
    let id = json_id(item.get("id")).ok_or_else(|| PulseError::validation("intercom.id", "missing ticket id"))?;
    let now = Utc::now();
    let ticket_state = str_of(item, "ticket_state").unwrap_or_default();
    let state = match ticket_state.as_str() {
        "resolved" | "closed" => ConversationState::Closed,
        _ => ConversationState::Open,
    };
    let closed_at = (state == ConversationState::Closed)
        .then(|| unix_secs(item.get("updated_at")).unwrap_or(now));
    let title = item
        .get("ticket_attributes")
        .and_then(|attrs| str_of(attrs, "_default_title_"))
        .or_else(|| str_of(item, "title"));
    let mut metadata = JsonMap::new();
    metadata.insert("ticket_state".to_string(), json!(ticket_state));
    Ok(Thread {
        external_id: format!("ticket:{}", id),
        source_id: id,
        contact_id: first_contact(item),
        state,
        is_ticket: true,
        title,
        opened_at: unix_secs(item.get("created_at")).unwrap_or(now),
        closed_at,
        metadata,
    })
}

async fn apply_conversation(repo: &dyn Repository, tenant_id: TenantId, item: &Value) -> PulseResult<Applied> {
    apply_thread(repo, tenant_id, conversation_thread(item)?).await
}

async fn apply_ticket(repo: &dyn Repository, tenant_id: TenantId, item: &Value) -> PulseResult<Applied> {
    apply_thread(repo, tenant_id, ticket_thread(item)?).await
}

/// Upsert the projection, then emit the open event the first time the
/// thread is seen and the close event when it transitions to closed.
async fn apply_thread(repo: &dyn Repository, tenant_id: TenantId, thread: Thread) -> PulseResult<Applied> {
    let Some(contact_id) = thread.contact_id.as_deref() else {
        tracing::debug!(tenant_id = %tenant_id, thread = %thread.external_id, "Thread without contact");
        return Ok(Applied::skipped());
    };
    let customer = ensure_customer(repo, tenant_id, Provider::Intercom, contact_id, thread.opened_at).await?;

    let summary = ConversationSummary {
        id: Uuid::now_v7(),
        tenant_id,
        provider: Provider::Intercom,
        external_id: thread.external_id.clone(),
        customer_id: customer.id,
        state: thread.state,
        is_ticket: thread.is_ticket,
        title: thread.title.clone(),
        opened_at: thread.opened_at,
        closed_at: thread.closed_at,
        metadata: thread.metadata.clone(),
    };
    let previous = repo.upsert_conversation(&summary).await?;

    let mut applied = Applied::customer(customer.id);
    if previous.is_none() {
        let event = if thread.is_ticket {
            TimelineEvent::TicketOpened {
                ticket_id: thread.source_id.clone(),
                title: thread.title.clone(),
            }
        } else {
            TimelineEvent::ConversationOpen {
                conversation_id: thread.source_id.clone(),
            }
        };
        let appended = emit(
            repo,
            tenant_id,
            customer.id,
            Provider::Intercom,
            format!("{}:open", thread.external_id),
            thread.opened_at,
            &event,
        )
        .await?;
        applied.count(appended);
    }

    let newly_closed = previous
        .as_ref()
        .is_none_or(|prev| prev.state != ConversationState::Closed);
    if let (Some(closed_at), true) = (thread.closed_at, newly_closed) {
        let event = if thread.is_ticket {
            TimelineEvent::TicketResolved {
                ticket_id: thread.source_id.clone(),
            }
        } else {
            TimelineEvent::ConversationClosed {
                conversation_id: thread.source_id.clone(),
            }
        };
        let appended = emit(
            repo,
            tenant_id,
            customer.id,
            Provider::Intercom,
            format!("{}:closed:{}", thread.external_id, closed_at.timestamp()),
            closed_at,
            &event,
        )
        .await?;
        applied.count(appended);
    }
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{event_types, Tenant};
    use pulse_storage::{EventQuery, MemoryStore};

    fn conversation(state: &str, updated_at: i64) -> Value {
        json!({
            "type": "conversation",
            "id": "215",
            "created_at": 1_700_000_000,
            "updated_at": updated_at,
            "state": state,
            "title": null,
            "source": {"subject": "Export broken"},
            "contacts": {"contacts": [{"type": "contact", "id": "c_1"}]},
            "ticket": null,
            "priority": "priority"
        })
    }

    async fn tenant(store: &MemoryStore) -> TenantId {
        let tenant = Tenant {
            id: TenantId::now_v7(),
            name: "Acme".into(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        store.repo().create_tenant(&tenant).await.unwrap();
        tenant.id
    }

    #[test]
    fn test_topic_kind() {
        assert_eq!(topic_kind("conversation.user.created"), Some(TopicKind::Conversation));
        assert_eq!(topic_kind("contact.user.updated"), Some(TopicKind::Contact));
        assert_eq!(topic_kind("ticket.state.updated"), Some(TopicKind::Ticket));
        assert_eq!(topic_kind("ping"), None);
    }

    #[test]
    fn test_conversation_thread_mapping() {
        let thread = conversation_thread(&conversation("closed", 1_700_003_600)).unwrap();
        assert_eq!(thread.external_id, "215");
        assert_eq!(thread.contact_id.as_deref(), Some("c_1"));
        assert_eq!(thread.state, ConversationState::Closed);
        assert_eq!(thread.title.as_deref(), Some("Export broken"));
        assert_eq!(thread.closed_at.map(|t| t.timestamp()), Some(1_700_003_600));
        assert!(!thread.is_ticket);
    }

    #[test]
    fn test_ticket_thread_mapping() {
        let item = json!({
            "type": "ticket",
            "id": "77",
            "ticket_state": "resolved",
            "ticket_attributes": {"_default_title_": "Refund request"},
            "created_at": 1_700_000_000,
            "updated_at": 1_700_010_000,
            "contacts": {"contacts": [{"id": "c_9"}]}
        });
        let thread = ticket_thread(&item).unwrap();
        assert_eq!(thread.external_id, "ticket:77");
        assert_eq!(thread.source_id, "77");
        assert_eq!(thread.state, ConversationState::Closed);
        assert_eq!(thread.title.as_deref(), Some("Refund request"));
        assert!(thread.is_ticket);
    }

    #[tokio::test]
    async fn test_conversation_events_are_emitted_once() {
        let store = MemoryStore::new();
        let tenant_id = tenant(&store).await;
        let repo = store.repo();

        let opened = apply_conversation(repo, tenant_id, &conversation("open", 1_700_000_100)).await.unwrap();
        assert_eq!(opened.events, 1);
        let again = apply_conversation(repo, tenant_id, &conversation("open", 1_700_000_200)).await.unwrap();
        assert_eq!(again.events, 0);

        let closed = apply_conversation(repo, tenant_id, &conversation("closed", 1_700_003_600)).await.unwrap();
        assert_eq!(closed.events, 1);
        let replay = apply_conversation(repo, tenant_id, &conversation("closed", 1_700_003_600)).await.unwrap();
        assert_eq!(replay.events, 0);

        let customer_id = closed.customer.unwrap();
        let events = repo
            .list_events(tenant_id, &EventQuery::for_customer(customer_id))
            .await
            .unwrap();
        let types: Vec<_> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert!(types.contains(&event_types::CONVERSATION_OPEN));
        assert!(types.contains(&event_types::CONVERSATION_CLOSED));
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_thread_without_contact_is_skipped() {
        let store = MemoryStore::new();
        let tenant_id = tenant(&store).await;
        let mut item = conversation("open", 1_700_000_100);
        item["contacts"] = json!({"contacts": []});
        let applied = apply_conversation(store.repo(), tenant_id, &item).await.unwrap();
        assert_eq!(applied, Applied::skipped());
    }

    #[tokio::test]
    async fn test_contact_records_login() {
        let store = MemoryStore::new();
        let tenant_id = tenant(&store).await;
        let contact = json!({
            "type": "contact",
            "id": "c_1",
            "email": "ada@acme.io",
            "name": "Ada",
            "role": "user",
            "created_at": 1_690_000_000,
            "updated_at": 1_700_000_000,
            "last_seen_at": 1_700_000_000
        });
        let first = apply_contact(store.repo(), tenant_id, &contact).await.unwrap();
        assert_eq!(first.events, 1);
        let second = apply_contact(store.repo(), tenant_id, &contact).await.unwrap();
        assert_eq!(second.events, 0);
        assert_eq!(first.customer, second.customer);
    }
}
