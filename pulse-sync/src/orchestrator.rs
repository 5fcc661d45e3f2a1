//! The sync orchestrator.
//!
//! A job is one `(tenant, provider)` pair running its provider's stages in
//! order under a deadline. Jobs for the same pair never overlap: a pair that
//! is still running when the next tick arrives is skipped, not queued.

use crate::config::SyncConfig;
use crate::dedup::dedup_tenant;
use crate::enrich::enrich_companies;
use crate::metrics::SyncMetrics;
use crate::registry::{JobKey, ProgressRegistry, TenantLocks};
use crate::stage::{stages_for, Stage};
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::stream::{self, StreamExt};
use pulse_core::{
    ConfigError, ConnectionStatus, IntegrationConnection, ObjectKind, OpContext, Provider,
    PulseError, PulseResult, SyncCompletedHook, TenantId, Timestamp,
};
use pulse_integrations::{
    recompute_customer_mrr, IntegrationAdapter, PullRequest, PullSummary, SyncProgress,
};
use pulse_storage::{Repository, Store};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

/// Connection states the scheduler still scans.
const SCHEDULABLE: &[ConnectionStatus] = &[
    ConnectionStatus::Active,
    ConnectionStatus::Syncing,
    ConnectionStatus::Error,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No previous sync; pull everything.
    Full,
    /// Pull objects modified since the last successful sync.
    Incremental,
}

/// What one successful job did.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub tenant_id: TenantId,
    pub provider: Provider,
    pub mode: SyncMode,
    pub since: Option<Timestamp>,
    pub pulls: Vec<(ObjectKind, PullSummary)>,
    pub mrr_updates: usize,
    pub enriched: usize,
    pub merged: usize,
    /// Per-object failures that did not abort the job.
    pub errors: Vec<String>,
}

impl SyncReport {
    fn new(tenant_id: TenantId, provider: Provider, since: Option<Timestamp>) -> Self {
        Self {
            tenant_id,
            provider,
            mode: if since.is_some() {
                SyncMode::Incremental
            } else {
                SyncMode::Full
            },
            since,
            pulls: Vec::new(),
            mrr_updates: 0,
            enriched: 0,
            merged: 0,
            errors: Vec::new(),
        }
    }

    pub fn objects(&self) -> usize {
        self.pulls.iter().map(|(_, s)| s.objects).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// The previous job for this pair still holds the lock.
    Skipped,
}

/// Per-tick tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub completed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl TickSummary {
    pub fn is_quiet(&self) -> bool {
        self.completed == 0 && self.skipped == 0 && self.failed == 0
    }
}

/// Runs staged sync jobs over the registered adapters.
pub struct SyncOrchestrator {
    store: Arc<dyn Store>,
    adapters: HashMap<Provider, Arc<dyn IntegrationAdapter>>,
    config: SyncConfig,
    locks: TenantLocks,
    progress: ProgressRegistry,
    metrics: Arc<SyncMetrics>,
    completed_hook: OnceLock<Arc<dyn SyncCompletedHook>>,
}

impl SyncOrchestrator {
    pub fn new(store: Arc<dyn Store>, config: SyncConfig) -> Self {
        Self {
            store,
            adapters: HashMap::new(),
            config,
            locks: TenantLocks::new(),
            progress: ProgressRegistry::new(),
            metrics: Arc::new(SyncMetrics::new()),
            completed_hook: OnceLock::new(),
        }
    }

    /// Register the adapter that syncs its provider's connections.
    pub fn with_adapter(mut self, adapter: Arc<dyn IntegrationAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    /// Register the callback run after each successful job. Only the first
    /// registration takes effect.
    pub fn set_completed_hook(&self, hook: Arc<dyn SyncCompletedHook>) {
        if self.completed_hook.set(hook).is_err() {
            tracing::warn!("Sync completed hook already registered");
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<SyncMetrics> {
        self.metrics.clone()
    }

    /// Latest progress for a pair, while running or after it finished.
    pub fn progress(&self, tenant_id: TenantId, provider: Provider) -> Option<SyncProgress> {
        self.progress.get((tenant_id, provider))
    }

    pub fn is_running(&self, tenant_id: TenantId, provider: Provider) -> bool {
        self.locks.is_running((tenant_id, provider))
    }

    fn adapter(&self, provider: Provider) -> PulseResult<Arc<dyn IntegrationAdapter>> {
        self.adapters.get(&provider).cloned().ok_or_else(|| {
            PulseError::Config(ConfigError::InvalidValue {
                field: "provider".to_string(),
                reason: format!("no adapter registered for {}", provider),
            })
        })
    }

    /// Sync one tenant's connection on demand.
    pub async fn sync_tenant(
        &self,
        ctx: &OpContext,
        tenant_id: TenantId,
        provider: Provider,
    ) -> PulseResult<SyncOutcome> {
        let connection = self
            .store
            .repo()
            .get_connection(tenant_id, provider)
            .await?
            .ok_or_else(|| PulseError::not_found("integration connection", provider))?;
        if !connection.status.is_schedulable() {
            return Err(PulseError::validation(
                "connection.status",
                "connection is disconnected; reconnect to resume syncing",
            ));
        }
        self.sync_connection(ctx, &connection).await
    }

    /// Run one job for `connection`, recording its outcome on the row.
    pub async fn sync_connection(
        &self,
        ctx: &OpContext,
        connection: &IntegrationConnection,
    ) -> PulseResult<SyncOutcome> {
        let key = (connection.tenant_id, connection.provider);
        let adapter = self.adapter(connection.provider)?;
        let Some(_guard) = self.locks.try_acquire(key) else {
            tracing::debug!(
                tenant_id = %key.0,
                provider = %key.1,
                "Sync still running, skipping"
            );
            SyncMetrics::add(&self.metrics.jobs_skipped, 1);
            return Ok(SyncOutcome::Skipped);
        };

        let ctx = ctx.child("sync").with_timeout(self.config.job_timeout);
        let started_at = Utc::now();
        let since = connection.last_sync_at;
        self.mark_syncing(key).await?;
        tracing::info!(
            tenant_id = %key.0,
            provider = %key.1,
            full = since.is_none(),
            "Sync started"
        );

        let mut progress = SyncProgress::default();
        let result = self
            .run_stages(&ctx, adapter.as_ref(), key, since, &mut progress)
            .await;
        self.progress.publish(key, &progress);

        match result {
            Ok(report) => {
                self.record_success(key, started_at).await?;
                SyncMetrics::add(&self.metrics.jobs_succeeded, 1);
                SyncMetrics::add(&self.metrics.objects_synced, report.objects() as u64);
                SyncMetrics::add(&self.metrics.customers_merged, report.merged as u64);
                tracing::info!(
                    tenant_id = %key.0,
                    provider = %key.1,
                    objects = report.objects(),
                    mrr_updates = report.mrr_updates,
                    enriched = report.enriched,
                    merged = report.merged,
                    object_errors = report.errors.len(),
                    "Sync completed"
                );
                if let Some(hook) = self.completed_hook.get() {
                    hook.sync_completed(key.0, key.1).await;
                }
                Ok(SyncOutcome::Completed(report))
            }
            Err(err) => {
                if let Err(record_err) = self.record_failure(key, &err).await {
                    tracing::error!(
                        tenant_id = %key.0,
                        provider = %key.1,
                        error = %record_err,
                        "Failed to record sync failure"
                    );
                }
                Err(err)
            }
        }
    }

    async fn run_stages(
        &self,
        ctx: &OpContext,
        adapter: &dyn IntegrationAdapter,
        key: JobKey,
        since: Option<Timestamp>,
        progress: &mut SyncProgress,
    ) -> PulseResult<SyncReport> {
        let (tenant_id, provider) = key;
        let repo = self.store.repo();
        let mut report = SyncReport::new(tenant_id, provider, since);

        for stage in stages_for(provider) {
            ctx.check()?;
            progress.start(stage.name());
            self.progress.publish(key, progress);

            match *stage {
                Stage::Pull(kind) => {
                    let request = PullRequest {
                        tenant_id,
                        kind,
                        since,
                    };
                    let summary = adapter.pull(ctx, &request, progress).await?;
                    report.pulls.push((kind, summary));
                }
                Stage::RecomputeMrr => {
                    report.mrr_updates = recompute_mrr(ctx, repo, tenant_id, progress).await?;
                }
                Stage::EnrichCompanies => {
                    report.enriched = enrich_companies(repo, tenant_id, Utc::now()).await?;
                }
                Stage::Dedup => {
                    report.merged = dedup_tenant(self.store.as_ref(), tenant_id, Utc::now()).await?;
                }
            }
            self.progress.publish(key, progress);
        }

        report.errors = progress.errors.clone();
        Ok(report)
    }

    async fn load(&self, key: JobKey) -> PulseResult<IntegrationConnection> {
        self.store
            .repo()
            .get_connection(key.0, key.1)
            .await?
            .ok_or_else(|| PulseError::not_found("integration connection", key.1))
    }

    async fn mark_syncing(&self, key: JobKey) -> PulseResult<()> {
        let mut connection = self.load(key).await?;
        connection.status = ConnectionStatus::Syncing;
        connection.updated_at = Utc::now();
        self.store.repo().save_connection(&connection).await
    }

    async fn record_success(&self, key: JobKey, started_at: Timestamp) -> PulseResult<()> {
        // Reload: token refresh during the job may have rewritten the row.
        let mut connection = self.load(key).await?;
        connection.status = ConnectionStatus::Active;
        connection.last_sync_at = Some(started_at);
        connection.last_sync_error = None;
        connection.metadata.record_success();
        connection.updated_at = Utc::now();
        self.store.repo().save_connection(&connection).await
    }

    async fn record_failure(&self, key: JobKey, err: &PulseError) -> PulseResult<()> {
        let mut connection = self.load(key).await?;
        connection.updated_at = Utc::now();

        // Shutdown is not the connection's fault.
        if matches!(err, PulseError::Cancelled) {
            connection.status = if connection.metadata.error_count > 0 {
                ConnectionStatus::Error
            } else {
                ConnectionStatus::Active
            };
            tracing::info!(tenant_id = %key.0, provider = %key.1, "Sync cancelled");
            return self.store.repo().save_connection(&connection).await;
        }

        let message = err.to_string();
        let failures = connection.metadata.record_failure(message.clone());
        connection.last_sync_error = Some(message);
        SyncMetrics::add(&self.metrics.jobs_failed, 1);

        if failures >= self.config.max_consecutive_failures {
            connection.status = ConnectionStatus::Disconnected;
            SyncMetrics::add(&self.metrics.connections_disconnected, 1);
            tracing::error!(
                tenant_id = %key.0,
                provider = %key.1,
                failures,
                error = %err,
                "Sync failed repeatedly, disconnecting"
            );
        } else {
            connection.status = ConnectionStatus::Error;
            tracing::warn!(
                tenant_id = %key.0,
                provider = %key.1,
                failures,
                kind = err.kind().as_str(),
                error = %err,
                "Sync failed"
            );
        }
        self.store.repo().save_connection(&connection).await
    }

    /// Sync every schedulable connection with a registered adapter.
    pub async fn run_tick(&self, ctx: &OpContext) -> TickSummary {
        let mut summary = TickSummary::default();
        let connections = match self
            .store
            .repo()
            .list_connections(None, SCHEDULABLE)
            .await
        {
            Ok(connections) => connections,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list connections");
                return summary;
            }
        };

        let due: Vec<IntegrationConnection> = connections
            .into_iter()
            .filter(|c| self.adapters.contains_key(&c.provider))
            .collect();

        let outcomes: Vec<PulseResult<SyncOutcome>> = stream::iter(due)
            .map(|connection| async move {
                if ctx.is_cancelled() {
                    return Err(PulseError::Cancelled);
                }
                self.sync_connection(ctx, &connection).await
            })
            .buffer_unordered(self.config.max_concurrent_jobs.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            match outcome {
                Ok(SyncOutcome::Completed(_)) => summary.completed += 1,
                Ok(SyncOutcome::Skipped) => summary.skipped += 1,
                Err(PulseError::Cancelled) => {}
                Err(_) => summary.failed += 1,
            }
        }
        SyncMetrics::add(&self.metrics.ticks, 1);
        summary
    }

    /// Delete webhook idempotency rows past the retention window.
    pub async fn prune_webhook_events(&self) -> PulseResult<u64> {
        let before = Utc::now() - ChronoDuration::days(self.config.webhook_retention_days);
        let pruned = self.store.repo().prune_webhook_events(before).await?;
        SyncMetrics::add(&self.metrics.webhook_events_pruned, pruned);
        Ok(pruned)
    }
}

/// Recompute MRR for every customer with stored subscriptions.
async fn recompute_mrr(
    ctx: &OpContext,
    repo: &dyn Repository,
    tenant_id: TenantId,
    progress: &mut SyncProgress,
) -> PulseResult<usize> {
    let customers = repo.list_customers(tenant_id).await?;
    progress.page(customers.len());
    let at = Utc::now();
    let mut updates = 0;
    for customer in &customers {
        ctx.check()?;
        match recompute_customer_mrr(repo, customer, at).await {
            Ok(Some(_)) => updates += 1,
            Ok(None) => {}
            Err(e) => progress.error(&customer.external_id, e),
        }
        progress.advance();
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_mode_follows_since() {
        let tenant = TenantId::now_v7();
        assert_eq!(SyncReport::new(tenant, Provider::Stripe, None).mode, SyncMode::Full);
        assert_eq!(
            SyncReport::new(tenant, Provider::Stripe, Some(Utc::now())).mode,
            SyncMode::Incremental
        );
    }

    #[test]
    fn test_report_counts_objects() {
        let mut report = SyncReport::new(TenantId::now_v7(), Provider::Hubspot, None);
        report.pulls.push((
            ObjectKind::Contacts,
            PullSummary {
                pages: 2,
                objects: 150,
                events: 0,
                errors: 1,
            },
        ));
        report.pulls.push((
            ObjectKind::Deals,
            PullSummary {
                pages: 1,
                objects: 7,
                events: 3,
                errors: 0,
            },
        ));
        assert_eq!(report.objects(), 157);
    }

    #[test]
    fn test_schedulable_excludes_disconnected() {
        assert!(!SCHEDULABLE.contains(&ConnectionStatus::Disconnected));
        assert!(SCHEDULABLE.iter().all(|s| s.is_schedulable()));
    }
}
