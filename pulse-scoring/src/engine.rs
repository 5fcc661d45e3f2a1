//! The scoring engine.
//!
//! Calculation protocol for one customer:
//!
//! 1. Load the tenant's [`ScoringConfig`], creating the defaults if absent.
//! 2. Run every factor and keep the present values.
//! 3. With nothing present, fail with `no_signal` and write nothing.
//! 4. Combine with renormalized weights, round, clamp and band.
//! 5. Upsert the current score and append history in one transaction.
//! 6. Append change events, then notify the alert hook.

use crate::combine::combine;
use crate::detector::{event_key, ChangeDetector};
use crate::factors::{standard_factors, FactorInput, ScoreFactor, TenantSignals};
use crate::metrics::ScoringMetrics;
use crate::settings::ScoringSettings;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use futures_util::stream::{self, StreamExt};
use pulse_core::{
    ConnectionStatus, Customer, CustomerChangeHook, CustomerEvent, CustomerId, ErrorKind,
    EventSource, HealthScore, HealthScoreHistory, OpContext, Provider, PulseError, PulseResult,
    RiskThresholds, ScoreCalculatedHook, ScoringConfig, ScoringError, SyncCompletedHook, TenantId,
};
use pulse_storage::Store;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Connection states whose tenants are rescored.
const CONNECTED: &[ConnectionStatus] = &[
    ConnectionStatus::Active,
    ConnectionStatus::Syncing,
    ConnectionStatus::Error,
];

/// Tallies for one tenant pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TenantRun {
    pub scored: usize,
    pub no_signal: usize,
    pub failed: usize,
}

impl TenantRun {
    fn merge(&mut self, other: TenantRun) {
        self.scored += other.scored;
        self.no_signal += other.no_signal;
        self.failed += other.failed;
    }
}

/// Tallies for one scheduler tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScoringTick {
    pub tenants: usize,
    pub customers: TenantRun,
}

/// Check a tenant's scoring configuration before it is saved.
pub fn validate_scoring_config(config: &ScoringConfig) -> PulseResult<()> {
    config.validate().map_err(PulseError::from)
}

pub struct ScoringEngine {
    store: Arc<dyn Store>,
    factors: Vec<Arc<dyn ScoreFactor>>,
    settings: ScoringSettings,
    detector: ChangeDetector,
    metrics: Arc<ScoringMetrics>,
    alert_hook: OnceLock<Arc<dyn ScoreCalculatedHook>>,
}

impl ScoringEngine {
    /// Engine over the standard factor set.
    pub fn new(store: Arc<dyn Store>, settings: ScoringSettings) -> Self {
        Self {
            store,
            factors: standard_factors(),
            detector: ChangeDetector::new(settings.significant_delta),
            settings,
            metrics: Arc::new(ScoringMetrics::new()),
            alert_hook: OnceLock::new(),
        }
    }

    /// Replace the factor set.
    pub fn with_factors(mut self, factors: Vec<Arc<dyn ScoreFactor>>) -> Self {
        self.factors = factors;
        self
    }

    /// Register the callback run after each successful calculation. Only
    /// the first registration takes effect.
    pub fn set_alert_hook(&self, hook: Arc<dyn ScoreCalculatedHook>) {
        if self.alert_hook.set(hook).is_err() {
            tracing::warn!("Score calculated hook already registered");
        }
    }

    pub fn settings(&self) -> &ScoringSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<ScoringMetrics> {
        self.metrics.clone()
    }

    /// The tenant's config, persisting the defaults on first use.
    pub async fn scoring_config(&self, tenant_id: TenantId) -> PulseResult<ScoringConfig> {
        let repo = self.store.repo();
        if let Some(config) = repo.get_scoring_config(tenant_id).await? {
            return Ok(config);
        }
        let config = ScoringConfig::defaults_for(tenant_id);
        repo.save_scoring_config(&config).await?;
        tracing::debug!(tenant_id = %tenant_id, "Created default scoring config");
        Ok(config)
    }

    /// Validate and store new weights and thresholds.
    pub async fn update_scoring_config(
        &self,
        tenant_id: TenantId,
        weights: BTreeMap<String, f64>,
        thresholds: RiskThresholds,
    ) -> PulseResult<ScoringConfig> {
        let config = ScoringConfig {
            tenant_id,
            weights,
            thresholds,
            updated_at: Utc::now(),
        };
        validate_scoring_config(&config)?;
        self.store.repo().save_scoring_config(&config).await?;
        tracing::info!(tenant_id = %tenant_id, "Scoring config updated");
        Ok(config)
    }

    /// Calculate and persist one customer's score without notifying the
    /// alert hook.
    pub async fn calculate(&self, tenant_id: TenantId, customer_id: CustomerId) -> PulseResult<HealthScore> {
        let repo = self.store.repo();
        let customer = repo.get_customer(tenant_id, customer_id).await?;
        if customer.is_deleted() {
            return Err(PulseError::not_found("customer", customer_id));
        }
        let config = self.scoring_config(tenant_id).await?;
        let signals = TenantSignals::load(repo, tenant_id, Utc::now()).await?;
        self.score_customer(&config, &signals, &customer).await
    }

    /// Hot-path recalculation of one customer, followed by the alert hook.
    pub async fn recalculate_customer(
        &self,
        tenant_id: TenantId,
        customer_id: CustomerId,
    ) -> PulseResult<HealthScore> {
        let score = self.calculate(tenant_id, customer_id).await?;
        self.notify(tenant_id, customer_id).await;
        Ok(score)
    }

    /// Rescore every live customer of a tenant on the bounded worker pool.
    pub async fn recalculate_tenant(&self, ctx: &OpContext, tenant_id: TenantId) -> PulseResult<TenantRun> {
        let repo = self.store.repo();
        let config = self.scoring_config(tenant_id).await?;
        let signals = TenantSignals::load(repo, tenant_id, Utc::now()).await?;
        let customers = repo.list_customers(tenant_id).await?;

        let scored = AtomicUsize::new(0);
        let no_signal = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let (config, signals) = (&config, &signals);
        let (scored_ref, no_signal_ref, failed_ref) = (&scored, &no_signal, &failed);

        stream::iter(customers)
            .for_each_concurrent(self.settings.workers.max(1), |customer| async move {
                if ctx.is_cancelled() {
                    return;
                }
                match self.score_customer(config, signals, &customer).await {
                    Ok(_) => {
                        scored_ref.fetch_add(1, Ordering::Relaxed);
                        self.notify(tenant_id, customer.id).await;
                    }
                    Err(e) if e.kind() == ErrorKind::NoSignal => {
                        no_signal_ref.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        failed_ref.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(
                            tenant_id = %tenant_id,
                            customer_id = %customer.id,
                            error = %e,
                            "Score calculation failed"
                        );
                    }
                }
            })
            .await;

        let run = TenantRun {
            scored: scored.into_inner(),
            no_signal: no_signal.into_inner(),
            failed: failed.into_inner(),
        };
        tracing::debug!(
            tenant_id = %tenant_id,
            scored = run.scored,
            no_signal = run.no_signal,
            failed = run.failed,
            "Tenant rescored"
        );
        Ok(run)
    }

    /// Rescore every tenant with a live connection.
    pub async fn run_tick(&self, ctx: &OpContext) -> ScoringTick {
        let mut tick = ScoringTick::default();
        let tenants: BTreeSet<TenantId> = match self
            .store
            .repo()
            .list_connections(None, CONNECTED)
            .await
        {
            Ok(connections) => connections.iter().map(|c| c.tenant_id).collect(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to list connections for scoring");
                return tick;
            }
        };

        for tenant_id in tenants {
            if ctx.is_cancelled() {
                break;
            }
            match self.recalculate_tenant(ctx, tenant_id).await {
                Ok(run) => {
                    tick.tenants += 1;
                    tick.customers.merge(run);
                }
                Err(e) => {
                    ScoringMetrics::add(&self.metrics.failures, 1);
                    tracing::error!(tenant_id = %tenant_id, error = %e, "Tenant scoring failed");
                }
            }
        }
        ScoringMetrics::add(&self.metrics.ticks, 1);
        tick
    }

    /// Delete history snapshots past the retention window.
    pub async fn prune_history(&self) -> PulseResult<u64> {
        let before = Utc::now() - ChronoDuration::days(self.settings.history_retention_days);
        let pruned = self.store.repo().prune_score_history(before).await?;
        ScoringMetrics::add(&self.metrics.history_pruned, pruned);
        Ok(pruned)
    }

    async fn score_customer(
        &self,
        config: &ScoringConfig,
        signals: &TenantSignals,
        customer: &Customer,
    ) -> PulseResult<HealthScore> {
        let result = self.compute_and_store(config, signals, customer).await;
        match &result {
            Ok(_) => ScoringMetrics::add(&self.metrics.scores_calculated, 1),
            Err(e) if e.kind() == ErrorKind::NoSignal => ScoringMetrics::add(&self.metrics.no_signal, 1),
            Err(_) => ScoringMetrics::add(&self.metrics.failures, 1),
        }
        result
    }

    async fn compute_and_store(
        &self,
        config: &ScoringConfig,
        signals: &TenantSignals,
        customer: &Customer,
    ) -> PulseResult<HealthScore> {
        let repo = self.store.repo();
        let now = Utc::now();
        let input = FactorInput {
            repo,
            customer,
            signals,
            now,
        };

        let mut values = BTreeMap::new();
        for factor in &self.factors {
            let value = factor.calculate(&input).await.map_err(|e| ScoringError::FactorFailed {
                factor: factor.name().to_string(),
                reason: e.to_string(),
            })?;
            if let Some(value) = value {
                values.insert(factor.name().to_string(), value);
            }
        }

        let combined = combine(&values, &config.weights, &config.thresholds)
            .ok_or_else(|| PulseError::no_signal(customer.id))?;
        let score = HealthScore {
            tenant_id: customer.tenant_id,
            customer_id: customer.id,
            overall_score: combined.overall,
            risk_level: combined.risk_level,
            factors: values,
            calculated_at: now,
        };

        let previous = repo.get_current_score(customer.tenant_id, customer.id).await?;
        let tx = self.store.begin().await?;
        tx.repo().upsert_current_score(&score).await?;
        tx.repo()
            .append_score_history(&HealthScoreHistory::from(&score))
            .await?;
        tx.commit().await?;

        for event in self.detector.detect(previous.as_ref(), &score) {
            let row = CustomerEvent::new(
                score.tenant_id,
                score.customer_id,
                EventSource::HealthScoring,
                event_key(&score, &event),
                score.calculated_at,
                &event,
            );
            if repo.append_event(&row).await? {
                ScoringMetrics::add(&self.metrics.change_events, 1);
            }
        }

        tracing::trace!(
            tenant_id = %score.tenant_id,
            customer_id = %score.customer_id,
            overall = score.overall_score,
            risk_level = %score.risk_level,
            "Score calculated"
        );
        Ok(score)
    }

    async fn notify(&self, tenant_id: TenantId, customer_id: CustomerId) {
        if let Some(hook) = self.alert_hook.get() {
            hook.score_calculated(tenant_id, customer_id).await;
        }
    }
}

#[async_trait]
impl CustomerChangeHook for ScoringEngine {
    async fn customer_changed(&self, tenant_id: TenantId, customer_id: CustomerId) {
        match self.recalculate_customer(tenant_id, customer_id).await {
            Ok(score) => tracing::debug!(
                tenant_id = %tenant_id,
                customer_id = %customer_id,
                overall = score.overall_score,
                "Rescored after billing change"
            ),
            Err(e) if e.kind() == ErrorKind::NoSignal => {
                tracing::debug!(tenant_id = %tenant_id, customer_id = %customer_id, "No signal to rescore")
            }
            Err(e) => tracing::warn!(
                tenant_id = %tenant_id,
                customer_id = %customer_id,
                error = %e,
                "Hot-path rescoring failed"
            ),
        }
    }
}

#[async_trait]
impl SyncCompletedHook for ScoringEngine {
    async fn sync_completed(&self, tenant_id: TenantId, provider: Provider) {
        let ctx = OpContext::background("post_sync_scoring");
        match self.recalculate_tenant(&ctx, tenant_id).await {
            Ok(run) => tracing::info!(
                tenant_id = %tenant_id,
                provider = %provider,
                scored = run.scored,
                "Rescored tenant after sync"
            ),
            Err(e) => tracing::warn!(
                tenant_id = %tenant_id,
                provider = %provider,
                error = %e,
                "Post-sync rescoring failed"
            ),
        }
    }
}
