//! Idempotent webhook processing.
//!
//! Verification is provider-specific and happens before anything here.
//! [`WebhookPipeline::process`] then records the idempotency key and
//! applies the event inside one transaction, so a redelivery after a
//! committed success is a no-op and a failure before commit leaves no
//! trace for the retry to trip over.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use pulse_core::constants::WEBHOOK_MEMORY_DEDUP_SECS;
use pulse_core::{CustomerId, Provider, PulseResult, TenantId, WebhookEvent};
use pulse_storage::{Repository, Store};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Entries kept in the advisory cache before expired ones are swept.
const DEDUP_SWEEP_THRESHOLD: usize = 1024;

/// Raw inbound webhook request.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundWebhook {
    pub method: String,
    /// Full request URI as the provider addressed it.
    pub uri: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl InboundWebhook {
    pub fn post(uri: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: "POST".into(),
            uri: uri.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> PulseResult<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// One provider event, after verification and routing.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookEnvelope {
    pub provider: Provider,
    pub tenant_id: TenantId,
    pub event_id: String,
    pub event_type: String,
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Effects applied; these customers changed.
    Processed { customers: Vec<CustomerId> },
    /// Already processed earlier; nothing applied.
    Duplicate,
    /// Accepted without effect (unroutable account, uninteresting type).
    Ignored,
}

impl WebhookOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed { .. } => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
        }
    }

    /// Fold the outcomes of a batched delivery.
    pub fn merge(outcomes: Vec<WebhookOutcome>) -> WebhookOutcome {
        let mut customers = Vec::new();
        let mut any_processed = false;
        let mut any_duplicate = false;
        for outcome in outcomes {
            match outcome {
                WebhookOutcome::Processed { customers: c } => {
                    any_processed = true;
                    for id in c {
                        if !customers.contains(&id) {
                            customers.push(id);
                        }
                    }
                }
                WebhookOutcome::Duplicate => any_duplicate = true,
                WebhookOutcome::Ignored => {}
            }
        }
        if any_processed {
            WebhookOutcome::Processed { customers }
        } else if any_duplicate {
            WebhookOutcome::Duplicate
        } else {
            WebhookOutcome::Ignored
        }
    }
}

/// The effect half of a provider's webhook support.
#[async_trait]
pub trait WebhookEffect: Send + Sync {
    /// Apply `envelope` through `repo`, which is bound to the open
    /// transaction. Returns the customers whose state changed.
    async fn apply(&self, repo: &dyn Repository, envelope: &WebhookEnvelope) -> PulseResult<Vec<CustomerId>>;
}

/// Durable idempotency with an advisory in-memory window in front.
///
/// The cache only ever holds keys whose transaction committed, so a hit
/// can short-circuit safely; a miss always falls through to the table.
pub struct WebhookPipeline {
    store: Arc<dyn Store>,
    recent: DashMap<(Provider, String), Instant>,
    window: Duration,
}

impl WebhookPipeline {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_window(store, Duration::from_secs(WEBHOOK_MEMORY_DEDUP_SECS))
    }

    pub fn with_window(store: Arc<dyn Store>, window: Duration) -> Self {
        Self {
            store,
            recent: DashMap::new(),
            window,
        }
    }

    pub async fn process(&self, envelope: &WebhookEnvelope, effect: &dyn WebhookEffect) -> PulseResult<WebhookOutcome> {
        let key = (envelope.provider, envelope.event_id.clone());
        if self.seen_recently(&key) {
            tracing::debug!(
                provider = %envelope.provider,
                event_id = %envelope.event_id,
                "Webhook already processed (cached)"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        let tx = self.store.begin().await?;
        let marker = WebhookEvent {
            tenant_id: Some(envelope.tenant_id),
            provider: envelope.provider,
            external_event_id: envelope.event_id.clone(),
            event_type: envelope.event_type.clone(),
            received_at: Utc::now(),
        };
        let first = match tx.repo().mark_webhook_processed(&marker).await {
            Ok(first) => first,
            Err(err) => {
                tx.rollback().await?;
                return Err(err);
            }
        };
        if !first {
            tx.commit().await?;
            self.remember(key);
            tracing::debug!(
                provider = %envelope.provider,
                event_id = %envelope.event_id,
                "Webhook already processed"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        match effect.apply(tx.repo(), envelope).await {
            Ok(customers) => {
                tx.commit().await?;
                self.remember(key);
                tracing::info!(
                    tenant_id = %envelope.tenant_id,
                    provider = %envelope.provider,
                    event_id = %envelope.event_id,
                    event_type = %envelope.event_type,
                    customers = customers.len(),
                    "Webhook processed"
                );
                Ok(WebhookOutcome::Processed { customers })
            }
            Err(err) => {
                tracing::warn!(
                    tenant_id = %envelope.tenant_id,
                    provider = %envelope.provider,
                    event_id = %envelope.event_id,
                    error = %err,
                    "Webhook effect failed; rolled back"
                );
                tx.rollback().await?;
                Err(err)
            }
        }
    }

    fn seen_recently(&self, key: &(Provider, String)) -> bool {
        self.recent
            .get(key)
            .is_some_and(|at| at.elapsed() < self.window)
    }

    fn remember(&self, key: (Provider, String)) {
        self.recent.insert(key, Instant::now());
        if self.recent.len() > DEDUP_SWEEP_THRESHOLD {
            let window = self.window;
            self.recent.retain(|_, at| at.elapsed() < window);
        }
    }

    pub fn cached_len(&self) -> usize {
        self.recent.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{PulseError, Tenant};
    use pulse_storage::MemoryStore;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl WebhookEffect for Counting {
        async fn apply(&self, repo: &dyn Repository, envelope: &WebhookEnvelope) -> PulseResult<Vec<CustomerId>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            repo.get_tenant(envelope.tenant_id).await?;
            if self.fail {
                return Err(PulseError::validation("payload", "boom"));
            }
            Ok(vec![])
        }
    }

    async fn setup() -> (Arc<MemoryStore>, TenantId) {
        let store = Arc::new(MemoryStore::new());
        let tenant = Tenant {
            id: TenantId::now_v7(),
            name: "Acme".into(),
            created_at: Utc::now(),
            deleted_at: None,
        };
        store.repo().create_tenant(&tenant).await.unwrap();
        (store, tenant.id)
    }

    fn envelope(tenant_id: TenantId, id: &str) -> WebhookEnvelope {
        WebhookEnvelope {
            provider: Provider::Stripe,
            tenant_id,
            event_id: id.into(),
            event_type: "charge.failed".into(),
            payload: json!({}),
        }
    }

    #[tokio::test]
    async fn test_duplicate_is_noop() {
        let (store, tenant) = setup().await;
        let pipeline = WebhookPipeline::new(store.clone());
        let effect = Counting { calls: AtomicUsize::new(0), fail: false };

        let first = pipeline.process(&envelope(tenant, "evt_1"), &effect).await.unwrap();
        assert!(matches!(first, WebhookOutcome::Processed { .. }));
        let second = pipeline.process(&envelope(tenant, "evt_1"), &effect).await.unwrap();
        assert_eq!(second, WebhookOutcome::Duplicate);
        assert_eq!(effect.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.webhook_event_count(), 1);
    }

    #[tokio::test]
    async fn test_durable_table_is_authoritative() {
        let (store, tenant) = setup().await;
        let effect = Counting { calls: AtomicUsize::new(0), fail: false };

        WebhookPipeline::new(store.clone())
            .process(&envelope(tenant, "evt_2"), &effect)
            .await
            .unwrap();
        // A fresh pipeline has an empty cache but still sees the row.
        let outcome = WebhookPipeline::new(store.clone())
            .process(&envelope(tenant, "evt_2"), &effect)
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Duplicate);
        assert_eq!(effect.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_effect_leaves_no_key() {
        let (store, tenant) = setup().await;
        let pipeline = WebhookPipeline::new(store.clone());
        let failing = Counting { calls: AtomicUsize::new(0), fail: true };

        assert!(pipeline.process(&envelope(tenant, "evt_3"), &failing).await.is_err());
        assert_eq!(store.webhook_event_count(), 0);
        assert_eq!(pipeline.cached_len(), 0);

        let ok = Counting { calls: AtomicUsize::new(0), fail: false };
        let outcome = pipeline.process(&envelope(tenant, "evt_3"), &ok).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Processed { .. }));
    }

    #[test]
    fn test_merge_outcomes() {
        let a = CustomerId::now_v7();
        let merged = WebhookOutcome::merge(vec![
            WebhookOutcome::Duplicate,
            WebhookOutcome::Processed { customers: vec![a] },
            WebhookOutcome::Processed { customers: vec![a] },
        ]);
        assert_eq!(merged, WebhookOutcome::Processed { customers: vec![a] });
        assert_eq!(
            WebhookOutcome::merge(vec![WebhookOutcome::Ignored, WebhookOutcome::Duplicate]),
            WebhookOutcome::Duplicate
        );
        assert_eq!(WebhookOutcome::merge(vec![]), WebhookOutcome::Ignored);
    }
}
