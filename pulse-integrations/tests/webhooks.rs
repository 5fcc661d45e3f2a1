//! Signed webhook delivery through the provider adapters.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pulse_core::{
    event_types, ConversationState, CustomerChangeHook, CustomerId, ErrorKind, Provider, TenantId,
};
use pulse_integrations::{
    sign_hubspot_v3, sign_intercom, sign_stripe, AdapterDeps, HttpMethod, HubspotAdapter,
    InboundWebhook, IntegrationAdapter, IntercomAdapter, StripeAdapter, WebhookOutcome,
};
use pulse_storage::{MemoryStore, Store};
use pulse_test_utils::assertions::assert_kind;
use pulse_test_utils::{fixtures, ScriptedTransport};
use serde_json::json;
use std::sync::{Arc, Mutex};

fn deps(store: &MemoryStore, transport: Arc<ScriptedTransport>) -> AdapterDeps {
    AdapterDeps::new(Arc::new(store.clone()), transport, Arc::new(fixtures::cipher()))
}

async fn connected(store: &MemoryStore, provider: Provider, account: &str) -> TenantId {
    let tenant = fixtures::tenant("Acme");
    let repo = store.repo();
    repo.create_tenant(&tenant).await.unwrap();
    let connection = fixtures::connection(tenant.id, provider, account, Some(Utc::now() + Duration::hours(2)));
    repo.save_connection(&connection).await.unwrap();
    tenant.id
}

fn subscription_event(event_id: &str) -> Vec<u8> {
    json!({
        "id": event_id,
        "type": "customer.subscription.created",
        "account": "acct_1",
        "created": 1_700_000_000,
        "data": {"object": {
            "id": "sub_1",
            "object": "subscription",
            "customer": "cus_1",
            "status": "active",
            "created": 1_700_000_000,
            "current_period_end": 1_702_592_000,
            "items": {"data": [{"quantity": 1, "price": {
                "unit_amount": 5000, "currency": "usd",
                "recurring": {"interval": "month", "interval_count": 1}
            }}]}
        }}
    })
    .to_string()
    .into_bytes()
}

fn signed_stripe(body: Vec<u8>) -> InboundWebhook {
    let secret = fixtures::credentials(Provider::Stripe).webhook_secret;
    let header = sign_stripe(&body, &secret, Utc::now().timestamp());
    InboundWebhook::post("/webhooks/stripe", body).with_header("Stripe-Signature", header)
}

#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<(TenantId, CustomerId)>>,
}

#[async_trait]
impl CustomerChangeHook for RecordingHook {
    async fn customer_changed(&self, tenant_id: TenantId, customer_id: CustomerId) {
        self.calls.lock().unwrap().push((tenant_id, customer_id));
    }
}

#[tokio::test]
async fn test_billing_webhook_delivered_twice_is_applied_once() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Stripe, "acct_1").await;
    let adapter = StripeAdapter::new(
        &deps(&store, Arc::new(ScriptedTransport::new())),
        fixtures::credentials(Provider::Stripe),
    );
    let hook = Arc::new(RecordingHook::default());
    adapter.set_change_hook(hook.clone());

    let first = adapter
        .handle_webhook(&signed_stripe(subscription_event("evt_123")))
        .await
        .unwrap();
    let WebhookOutcome::Processed { customers } = &first else {
        panic!("expected processed, got {:?}", first);
    };
    assert_eq!(customers.len(), 1);
    let events_after_first = store.event_count();
    assert_eq!(store.subscription_count(), 1);

    let second = adapter
        .handle_webhook(&signed_stripe(subscription_event("evt_123")))
        .await
        .unwrap();
    assert_eq!(second, WebhookOutcome::Duplicate);
    assert_eq!(store.webhook_event_count(), 1);
    assert_eq!(store.event_count(), events_after_first);
    assert_eq!(store.subscription_count(), 1);
    assert_eq!(hook.calls.lock().unwrap().len(), 1);

    let customer = store
        .repo()
        .find_customer_by_external(tenant_id, Provider::Stripe, "cus_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer.mrr_cents, 5000);
}

#[tokio::test]
async fn test_durable_table_dedups_without_memory_cache() {
    let store = MemoryStore::new();
    connected(&store, Provider::Stripe, "acct_1").await;
    let creds = fixtures::credentials(Provider::Stripe);
    let first = StripeAdapter::new(&deps(&store, Arc::new(ScriptedTransport::new())), creds.clone());
    let restarted = StripeAdapter::new(&deps(&store, Arc::new(ScriptedTransport::new())), creds);

    let outcome = first
        .handle_webhook(&signed_stripe(subscription_event("evt_9")))
        .await
        .unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    let again = restarted
        .handle_webhook(&signed_stripe(subscription_event("evt_9")))
        .await
        .unwrap();
    assert_eq!(again, WebhookOutcome::Duplicate);
    assert_eq!(store.webhook_event_count(), 1);
}

#[tokio::test]
async fn test_bad_signature_is_rejected_before_any_write() {
    let store = MemoryStore::new();
    connected(&store, Provider::Stripe, "acct_1").await;
    let adapter = StripeAdapter::new(
        &deps(&store, Arc::new(ScriptedTransport::new())),
        fixtures::credentials(Provider::Stripe),
    );
    let body = subscription_event("evt_bad");
    let header = sign_stripe(&body, "whsec_wrong", Utc::now().timestamp());
    let webhook = InboundWebhook::post("/webhooks/stripe", body).with_header("Stripe-Signature", header);

    assert_kind(&adapter.handle_webhook(&webhook).await, ErrorKind::Auth);
    assert_eq!(store.webhook_event_count(), 0);

    let stale = {
        let body = subscription_event("evt_old");
        let secret = fixtures::credentials(Provider::Stripe).webhook_secret;
        let header = sign_stripe(&body, &secret, (Utc::now() - Duration::minutes(10)).timestamp());
        InboundWebhook::post("/webhooks/stripe", body).with_header("Stripe-Signature", header)
    };
    assert_kind(&adapter.handle_webhook(&stale).await, ErrorKind::Auth);
}

#[tokio::test]
async fn test_unknown_account_is_ignored() {
    let store = MemoryStore::new();
    connected(&store, Provider::Stripe, "acct_other").await;
    let adapter = StripeAdapter::new(
        &deps(&store, Arc::new(ScriptedTransport::new())),
        fixtures::credentials(Provider::Stripe),
    );
    let outcome = adapter
        .handle_webhook(&signed_stripe(subscription_event("evt_1")))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Ignored);
    assert_eq!(store.webhook_event_count(), 0);
}

#[tokio::test]
async fn test_three_failed_charges_emit_consecutive_failure() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Stripe, "acct_1").await;
    let adapter = StripeAdapter::new(
        &deps(&store, Arc::new(ScriptedTransport::new())),
        fixtures::credentials(Provider::Stripe),
    );
    for n in 0..3 {
        let body = json!({
            "id": format!("evt_ch_{}", n),
            "type": "charge.failed",
            "account": "acct_1",
            "data": {"object": {
                "id": format!("ch_{}", n),
                "customer": "cus_1",
                "amount": 5000,
                "currency": "usd",
                "status": "failed",
                "failure_code": "card_declined",
                "created": 1_700_000_000 + n * 86_400
            }}
        });
        adapter
            .handle_webhook(&signed_stripe(body.to_string().into_bytes()))
            .await
            .unwrap();
    }
    let customer = store
        .repo()
        .find_customer_by_external(tenant_id, Provider::Stripe, "cus_1")
        .await
        .unwrap()
        .unwrap();
    let events = store.events_for(customer.id);
    let failed = events.iter().filter(|e| e.event_type == event_types::PAYMENT_FAILED).count();
    let consecutive: Vec<_> = events
        .iter()
        .filter(|e| e.event_type == event_types::PAYMENT_CONSECUTIVE_FAILURES)
        .collect();
    assert_eq!(failed, 3);
    assert_eq!(consecutive.len(), 1);
    assert_eq!(consecutive[0].data["count"], json!(3));
    assert_eq!(consecutive[0].data["last_payment_id"], json!("ch_2"));
}

#[tokio::test]
async fn test_crm_batch_routes_by_portal_and_fetches_objects() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Hubspot, "62515").await;
    let transport = Arc::new(ScriptedTransport::new());
    transport.on_json(
        HttpMethod::Get,
        "/crm/v3/objects/contacts/501",
        200,
        json!({
            "id": "501",
            "createdAt": "2024-01-10T10:00:00Z",
            "updatedAt": "2024-03-01T10:00:00Z",
            "properties": {
                "email": "ada@acme.io",
                "firstname": "Ada",
                "lastname": "Lovelace",
                "company": "Acme",
                "lifecyclestage": "customer",
                "associatedcompanyid": "9001"
            }
        }),
    );
    let adapter = HubspotAdapter::new(&deps(&store, transport.clone()), fixtures::credentials(Provider::Hubspot));

    let uri = "https://pulse.test/webhooks/hubspot";
    let body = json!([
        {"eventId": 100, "portalId": 62515, "subscriptionType": "contact.creation", "objectId": 501, "occurredAt": 1_709_287_200_000i64},
        {"eventId": 101, "portalId": 99999, "subscriptionType": "contact.creation", "objectId": 777, "occurredAt": 1_709_287_200_000i64},
        {"eventId": 102, "portalId": 62515, "subscriptionType": "ticket.creation", "objectId": 1, "occurredAt": 1_709_287_200_000i64}
    ])
    .to_string()
    .into_bytes();
    let secret = fixtures::credentials(Provider::Hubspot).webhook_secret;
    let ts = Utc::now().timestamp_millis();
    let signature = sign_hubspot_v3("POST", uri, &body, ts, &secret);
    let webhook = InboundWebhook::post(uri, body)
        .with_header("X-HubSpot-Signature-v3", signature)
        .with_header("X-HubSpot-Request-Timestamp", ts.to_string());

    let outcome = adapter.handle_webhook(&webhook).await.unwrap();
    assert!(matches!(outcome, WebhookOutcome::Processed { ref customers } if customers.len() == 1));
    assert_eq!(transport.requests_to("/crm/v3/objects/contacts/").len(), 1);

    let customer = store
        .repo()
        .find_customer_by_external(tenant_id, Provider::Hubspot, "501")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer.name.as_deref(), Some("Ada Lovelace"));
    assert_eq!(customer.company_name.as_deref(), Some("Acme"));
    assert_eq!(
        customer.metadata.namespace("hubspot").and_then(|ns| ns.get("lifecycle_stage")),
        Some(&json!("customer"))
    );
    let contacts = store.repo().list_contacts(tenant_id, Provider::Hubspot).await.unwrap();
    assert_eq!(contacts[0].company_external_id.as_deref(), Some("9001"));

    let replay = adapter.handle_webhook(&webhook).await.unwrap();
    assert_eq!(replay, WebhookOutcome::Duplicate);
}

#[tokio::test]
async fn test_support_ticket_lifecycle() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Intercom, "app_7").await;
    let adapter = IntercomAdapter::new(
        &deps(&store, Arc::new(ScriptedTransport::new())),
        fixtures::credentials(Provider::Intercom),
    );
    let secret = fixtures::credentials(Provider::Intercom).webhook_secret;
    let deliver = |id: &str, topic: &str, state: &str| {
        let body = json!({
            "type": "notification_event",
            "id": id,
            "app_id": "app_7",
            "topic": topic,
            "created_at": 1_700_000_500,
            "data": {"item": {
                "type": "ticket",
                "id": "77",
                "ticket_state": state,
                "ticket_attributes": {"_default_title_": "Refund request"},
                "created_at": 1_700_000_000,
                "updated_at": 1_700_000_400,
                "contacts": {"contacts": [{"id": "c_9"}]}
            }}
        })
        .to_string()
        .into_bytes();
        let signature = sign_intercom(&body, &secret);
        InboundWebhook::post("/webhooks/intercom", body).with_header("X-Hub-Signature", signature)
    };

    adapter
        .handle_webhook(&deliver("notif_1", "ticket.created", "submitted"))
        .await
        .unwrap();
    adapter
        .handle_webhook(&deliver("notif_2", "ticket.state.updated", "resolved"))
        .await
        .unwrap();

    let customer = store
        .repo()
        .find_customer_by_external(tenant_id, Provider::Intercom, "c_9")
        .await
        .unwrap()
        .unwrap();
    let types: Vec<String> = store
        .events_for(customer.id)
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(types.contains(&event_types::TICKET_OPENED.to_string()));
    assert!(types.contains(&event_types::TICKET_RESOLVED.to_string()));

    let threads = store
        .repo()
        .list_conversations(tenant_id, customer.id, None)
        .await
        .unwrap();
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].external_id, "ticket:77");
    assert_eq!(threads[0].state, ConversationState::Closed);
}
