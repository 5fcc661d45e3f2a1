//! Seams between components.
//!
//! Each component depends only on the ones below it; upstream reactions
//! (rescoring after a webhook, alerting after a score) are wired in at
//! start-up through these callbacks.

use crate::enums::Provider;
use crate::identity::{CustomerId, TenantId};
use async_trait::async_trait;

/// Invoked when an adapter changes a customer's billing state on the hot
/// path, so the customer can be rescored without waiting for the scheduler.
#[async_trait]
pub trait CustomerChangeHook: Send + Sync {
    async fn customer_changed(&self, tenant_id: TenantId, customer_id: CustomerId);
}

/// Invoked after a tenant's sync for one provider completes successfully.
#[async_trait]
pub trait SyncCompletedHook: Send + Sync {
    async fn sync_completed(&self, tenant_id: TenantId, provider: Provider);
}

/// Invoked after any successful score calculation.
#[async_trait]
pub trait ScoreCalculatedHook: Send + Sync {
    async fn score_calculated(&self, tenant_id: TenantId, customer_id: CustomerId);
}
