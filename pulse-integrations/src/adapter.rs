//! The provider adapter capability.

use crate::credentials::CredentialManager;
use crate::webhook::{InboundWebhook, WebhookOutcome};
use async_trait::async_trait;
use chrono::Duration;
use pulse_core::{
    CustomerEvent, CustomerId, EventSource, ObjectKind, OpContext, Provider, PulseResult, TenantId,
    TimelineEvent, Timestamp,
};
use pulse_storage::Repository;
use serde::Serialize;

/// One paged pull.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub tenant_id: TenantId,
    pub kind: ObjectKind,
    /// Only objects modified after this instant; `None` pulls everything.
    pub since: Option<Timestamp>,
}

/// Stage progress, as reported by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncProgress {
    pub step: String,
    pub total: usize,
    pub current: usize,
    pub errors: Vec<String>,
}

impl SyncProgress {
    pub fn start(&mut self, step: impl Into<String>) {
        self.step = step.into();
        self.total = 0;
        self.current = 0;
    }

    /// A page arrived with `count` objects.
    pub fn page(&mut self, count: usize) {
        self.total += count;
    }

    pub fn advance(&mut self) {
        self.current += 1;
    }

    pub fn error(&mut self, object_id: &str, err: impl std::fmt::Display) {
        self.errors.push(format!("{} {}: {}", self.step, object_id, err));
    }
}

/// Counters for one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullSummary {
    pub pages: usize,
    pub objects: usize,
    pub events: usize,
    pub errors: usize,
}

/// One provider family's integration: credentials, pulls, webhooks.
#[async_trait]
pub trait IntegrationAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    fn credentials(&self) -> &CredentialManager;

    /// Object kinds in pull order.
    fn object_kinds(&self) -> &'static [ObjectKind];

    /// Page through one object kind, upserting as it goes. Per-object
    /// failures land in `progress.errors`; HTTP failures abort the pull.
    async fn pull(
        &self,
        ctx: &OpContext,
        request: &PullRequest,
        progress: &mut SyncProgress,
    ) -> PulseResult<PullSummary>;

    /// Verify, route, and apply an inbound webhook.
    async fn handle_webhook(&self, webhook: &InboundWebhook) -> PulseResult<WebhookOutcome>;
}

/// Lower bound for window-limited pulls: the later of `since` and the
/// start of the rolling window.
pub fn window_start(since: Option<Timestamp>, now: Timestamp, window_days: i64) -> Timestamp {
    let window = now - Duration::days(window_days);
    match since {
        Some(s) if s > window => s,
        _ => window,
    }
}

/// Append a typed timeline event; returns whether it was new.
pub async fn emit(
    repo: &dyn Repository,
    tenant_id: TenantId,
    customer_id: CustomerId,
    provider: Provider,
    external_event_id: impl Into<String>,
    occurred_at: Timestamp,
    event: &TimelineEvent,
) -> PulseResult<bool> {
    let row = CustomerEvent::new(
        tenant_id,
        customer_id,
        EventSource::from(provider),
        external_event_id,
        occurred_at,
        event,
    );
    repo.append_event(&row).await
}
