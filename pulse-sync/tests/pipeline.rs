//! Sync jobs end to end over a scripted provider.

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use pulse_core::{
    ConnectionStatus, CustomerEvent, CustomerUpsert, EventSource, OpContext, Provider,
    SyncCompletedHook, TenantId, TimelineEvent,
};
use pulse_integrations::{AdapterDeps, HttpMethod, HttpResponse, HubspotAdapter, StripeAdapter};
use pulse_storage::{EventQuery, MemoryStore, Store};
use pulse_sync::{dedup_tenant, SyncConfig, SyncOrchestrator, SyncOutcome};
use pulse_test_utils::{fixtures, ScriptedTransport};
use serde_json::json;
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct RecordingHook {
    calls: Mutex<Vec<(TenantId, Provider)>>,
}

#[async_trait]
impl SyncCompletedHook for RecordingHook {
    async fn sync_completed(&self, tenant_id: TenantId, provider: Provider) {
        self.calls.lock().unwrap().push((tenant_id, provider));
    }
}

async fn connected(store: &MemoryStore, provider: Provider, expires_in: Duration) -> TenantId {
    let tenant = fixtures::tenant("Acme");
    store.repo().create_tenant(&tenant).await.unwrap();
    let connection = fixtures::connection(tenant.id, provider, "acct", Some(Utc::now() + expires_in));
    store.repo().save_connection(&connection).await.unwrap();
    tenant.id
}

fn deps(store: &MemoryStore, transport: Arc<ScriptedTransport>) -> AdapterDeps {
    AdapterDeps::new(Arc::new(store.clone()), transport, Arc::new(fixtures::cipher()))
}

fn hubspot_orchestrator(store: &MemoryStore, transport: Arc<ScriptedTransport>) -> SyncOrchestrator {
    let adapter = HubspotAdapter::new(&deps(store, transport), fixtures::credentials(Provider::Hubspot));
    SyncOrchestrator::new(Arc::new(store.clone()), SyncConfig::default()).with_adapter(Arc::new(adapter))
}

#[tokio::test]
async fn test_dedup_merges_billing_and_crm_rows() {
    let (store, tenant) = fixtures::seeded_store("Acme").await;
    let repo = store.repo();
    let day = |d: u32| Utc.with_ymd_and_hms(2024, 5, d, 0, 0, 0).unwrap();

    let billing = repo
        .upsert_customer_by_external(
            tenant.id,
            &CustomerUpsert {
                mrr_cents: Some(5000),
                ..CustomerUpsert::new(Provider::Stripe, "cus_1", day(1))
                    .with_email(Some("a@x.com".into()))
                    .with_currency(Some("usd".into()))
            },
        )
        .await
        .unwrap();
    let crm = repo
        .upsert_customer_by_external(
            tenant.id,
            &CustomerUpsert::new(Provider::Hubspot, "501", day(2))
                .with_email(Some("A@X.com".into()))
                .with_company(Some("Acme".into()))
                .with_namespace(json!({"lifecycle_stage": "customer"})),
        )
        .await
        .unwrap();
    let login = CustomerEvent::new(
        tenant.id,
        crm.id,
        EventSource::Hubspot,
        "501:login",
        day(3),
        &TimelineEvent::Login { user: Some("ada".into()) },
    );
    repo.append_event(&login).await.unwrap();

    let merged = dedup_tenant(&store, tenant.id, Utc::now()).await.unwrap();
    assert_eq!(merged, 1);

    let customers = repo.list_customers(tenant.id).await.unwrap();
    assert_eq!(customers.len(), 1);
    let primary = &customers[0];
    assert_eq!(primary.id, billing.id);
    assert_eq!(primary.company_name.as_deref(), Some("Acme"));
    assert_eq!(primary.mrr_cents, 5000);
    assert_eq!(primary.currency.as_deref(), Some("USD"));
    assert_eq!(primary.metadata.sources, vec!["stripe", "hubspot"]);
    assert!(primary.metadata.namespace("hubspot").is_some());

    let events = repo
        .list_events(tenant.id, &EventQuery::for_customer(billing.id))
        .await
        .unwrap();
    assert_eq!(events.len(), 1);

    // A second pass has nothing left to merge.
    assert_eq!(dedup_tenant(&store, tenant.id, Utc::now()).await.unwrap(), 0);
}

#[tokio::test]
async fn test_dedup_merges_inside_a_transaction() {
    let (store, tenant) = fixtures::seeded_store("Acme").await;
    let now = Utc::now();
    for (provider, external_id) in [(Provider::Stripe, "cus_1"), (Provider::Hubspot, "501")] {
        store
            .repo()
            .upsert_customer_by_external(
                tenant.id,
                &CustomerUpsert::new(provider, external_id, now).with_email(Some("a@x.com".into())),
            )
            .await
            .unwrap();
    }

    // An open transaction holds the store; the merge must wait for it.
    let open = store.begin().await.unwrap();
    let merging = {
        let store = store.clone();
        let tenant_id = tenant.id;
        tokio::spawn(async move { dedup_tenant(&store, tenant_id, Utc::now()).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(!merging.is_finished());
    assert_eq!(store.repo().list_customers(tenant.id).await.unwrap().len(), 2);

    open.rollback().await.unwrap();
    assert_eq!(merging.await.unwrap().unwrap(), 1);
    assert_eq!(store.repo().list_customers(tenant.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_crm_sync_enriches_then_dedups() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Hubspot, Duration::hours(2)).await;
    fixtures::seed_customer(
        &store,
        tenant_id,
        Provider::Stripe,
        "cus_1",
        Some("a@x.com"),
        Utc::now() - Duration::days(10),
    )
    .await;

    let transport = Arc::new(ScriptedTransport::new());
    transport
        .on_json(
            HttpMethod::Get,
            "/crm/v3/objects/contacts",
            200,
            json!({"results": [{
                "id": "501",
                "properties": {"email": "a@x.com", "firstname": "Ada", "associatedcompanyid": "9001"}
            }]}),
        )
        .on_json(HttpMethod::Get, "/crm/v3/objects/deals", 200, json!({"results": []}))
        .on_json(
            HttpMethod::Get,
            "/crm/v3/objects/companies",
            200,
            json!({"results": [{"id": "9001", "properties": {"name": "Acme", "domain": "acme.com"}}]}),
        );
    let orchestrator = hubspot_orchestrator(&store, transport.clone());
    let hook = Arc::new(RecordingHook::default());
    orchestrator.set_completed_hook(hook.clone());

    let outcome = orchestrator
        .sync_tenant(&OpContext::background("test"), tenant_id, Provider::Hubspot)
        .await
        .unwrap();
    let SyncOutcome::Completed(report) = outcome else {
        panic!("expected a completed sync");
    };
    assert_eq!(report.enriched, 1);
    assert_eq!(report.merged, 1);

    let customers = store.repo().list_customers(tenant_id).await.unwrap();
    assert_eq!(customers.len(), 1);
    let primary = &customers[0];
    assert_eq!(primary.source, Provider::Stripe);
    assert_eq!(primary.company_name.as_deref(), Some("Acme"));
    let company = primary.metadata.namespace("hubspot").and_then(|ns| ns.get("company")).unwrap();
    assert_eq!(company["domain"], "acme.com");

    let connection = store.repo().get_connection(tenant_id, Provider::Hubspot).await.unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert!(connection.last_sync_at.is_some());
    assert_eq!(connection.metadata.error_count, 0);
    assert_eq!(hook.calls.lock().unwrap().as_slice(), &[(tenant_id, Provider::Hubspot)]);
    assert_eq!(orchestrator.progress(tenant_id, Provider::Hubspot).unwrap().step, "dedup");

    // The next run is incremental and goes through the search endpoints.
    transport
        .on_json(HttpMethod::Post, "/crm/v3/objects/contacts/search", 200, json!({"results": []}))
        .on_json(HttpMethod::Post, "/crm/v3/objects/deals/search", 200, json!({"results": []}))
        .on_json(HttpMethod::Post, "/crm/v3/objects/companies/search", 200, json!({"results": []}));
    let second = orchestrator
        .sync_tenant(&OpContext::background("test"), tenant_id, Provider::Hubspot)
        .await
        .unwrap();
    assert!(matches!(second, SyncOutcome::Completed(ref r) if r.since.is_some()));
    assert_eq!(transport.requests_to("/search").len(), 3);
}

#[tokio::test]
async fn test_failed_refresh_disconnects_after_five_ticks() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Hubspot, Duration::minutes(-5)).await;
    let transport = Arc::new(ScriptedTransport::new());
    transport.always(
        HttpMethod::Post,
        "/oauth/v1/token",
        HttpResponse::json(400, &json!({"status": "BAD_REFRESH_TOKEN"})),
    );
    let orchestrator = hubspot_orchestrator(&store, transport);
    let ctx = OpContext::background("test");

    let first = orchestrator.run_tick(&ctx).await;
    assert_eq!(first.failed, 1);
    let connection = store.repo().get_connection(tenant_id, Provider::Hubspot).await.unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::Error);
    assert_eq!(connection.metadata.error_count, 1);
    assert!(connection.last_sync_error.is_some());
    assert!(connection.last_sync_at.is_none());

    for _ in 0..4 {
        assert_eq!(orchestrator.run_tick(&ctx).await.failed, 1);
    }
    let connection = store.repo().get_connection(tenant_id, Provider::Hubspot).await.unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::Disconnected);
    assert_eq!(connection.metadata.error_count, 5);

    // Disconnected connections are no longer scanned.
    assert!(orchestrator.run_tick(&ctx).await.is_quiet());
    assert_eq!(orchestrator.metrics().snapshot().connections_disconnected, 1);
    assert!(orchestrator
        .sync_tenant(&ctx, tenant_id, Provider::Hubspot)
        .await
        .is_err());
}

#[tokio::test]
async fn test_billing_sync_stamps_connection_and_mrr() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Stripe, Duration::hours(2)).await;
    let transport = Arc::new(ScriptedTransport::new());
    transport
        .on_json(
            HttpMethod::Get,
            "/v1/customers",
            200,
            json!({"has_more": false, "data": [{"id": "cus_1", "email": "a@x.com", "created": 1_700_000_000}]}),
        )
        .on_json(
            HttpMethod::Get,
            "/v1/subscriptions",
            200,
            json!({"has_more": false, "data": [{
                "id": "sub_1",
                "customer": "cus_1",
                "status": "active",
                "created": 1_700_000_000,
                "items": {"data": [{"quantity": 1, "price": {
                    "unit_amount": 12000, "currency": "usd",
                    "recurring": {"interval": "year", "interval_count": 1}
                }}]}
            }]}),
        )
        .on_json(HttpMethod::Get, "/v1/charges", 200, json!({"has_more": false, "data": []}));
    let adapter = StripeAdapter::new(&deps(&store, transport), fixtures::credentials(Provider::Stripe));
    let orchestrator = SyncOrchestrator::new(Arc::new(store.clone()), SyncConfig::default())
        .with_adapter(Arc::new(adapter));

    let summary = orchestrator.run_tick(&OpContext::background("test")).await;
    assert_eq!(summary.completed, 1);

    let customer = store
        .repo()
        .find_customer_by_external(tenant_id, Provider::Stripe, "cus_1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(customer.mrr_cents, 1000);
    let connection = store.repo().get_connection(tenant_id, Provider::Stripe).await.unwrap().unwrap();
    assert_eq!(connection.status, ConnectionStatus::Active);
    assert!(connection.last_sync_at.is_some());
    assert_eq!(orchestrator.metrics().snapshot().jobs_succeeded, 1);
}

#[tokio::test]
async fn test_tombstoned_tenant_is_not_scanned() {
    let store = MemoryStore::new();
    let tenant_id = connected(&store, Provider::Hubspot, Duration::hours(2)).await;
    store.repo().soft_delete_tenant(tenant_id, Utc::now()).await.unwrap();
    let orchestrator = hubspot_orchestrator(&store, Arc::new(ScriptedTransport::new()));
    assert!(orchestrator.run_tick(&OpContext::background("test")).await.is_quiet());
}
