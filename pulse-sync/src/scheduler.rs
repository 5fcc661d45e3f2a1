//! Sync Scheduler Background Task
//!
//! One ticker drives every provider. Each tick scans the connections that
//! are still schedulable, runs a job per `(tenant, provider)` (skipping
//! pairs whose previous job still runs), then prunes old webhook
//! idempotency rows.

use crate::metrics::SyncMetrics;
use crate::orchestrator::SyncOrchestrator;
use pulse_core::OpContext;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Run the sync ticker until shutdown is signalled.
///
/// # Example
///
/// ```ignore
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let handle = tokio::spawn(sync_scheduler_task(orchestrator.clone(), shutdown_rx));
/// // ...
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn sync_scheduler_task(
    orchestrator: Arc<SyncOrchestrator>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SyncMetrics> {
    let config = orchestrator.config().clone();
    let mut ticker = interval(config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        job_timeout_secs = config.job_timeout.as_secs(),
        "Sync scheduler started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Sync scheduler shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let ctx = OpContext::background("sync_tick").with_shutdown(shutdown_rx.clone());
                sync_cycle(&orchestrator, &ctx).await;
            }
        }
    }

    let metrics = orchestrator.metrics();
    let snapshot = metrics.snapshot();
    tracing::info!(
        jobs_succeeded = snapshot.jobs_succeeded,
        jobs_failed = snapshot.jobs_failed,
        jobs_skipped = snapshot.jobs_skipped,
        connections_disconnected = snapshot.connections_disconnected,
        ticks = snapshot.ticks,
        "Sync scheduler completed"
    );
    metrics
}

/// One tick: run due jobs, then the retention sweep.
pub async fn sync_cycle(orchestrator: &SyncOrchestrator, ctx: &OpContext) {
    let summary = orchestrator.run_tick(ctx).await;
    if summary.is_quiet() {
        tracing::trace!("Sync tick found no connections");
    } else {
        tracing::info!(
            completed = summary.completed,
            skipped = summary.skipped,
            failed = summary.failed,
            "Sync tick completed"
        );
    }

    match orchestrator.prune_webhook_events().await {
        Ok(0) => {}
        Ok(pruned) => tracing::info!(pruned, "Pruned webhook idempotency rows"),
        Err(e) => tracing::error!(error = %e, "Failed to prune webhook events"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use pulse_storage::MemoryStore;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_stops_on_shutdown() {
        let store = MemoryStore::new();
        let config = SyncConfig {
            interval: Duration::from_secs(60),
            ..SyncConfig::default()
        };
        let orchestrator = Arc::new(SyncOrchestrator::new(Arc::new(store), config));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(sync_scheduler_task(orchestrator, rx));

        tokio::time::sleep(Duration::from_secs(150)).await;
        tx.send(true).unwrap();
        let metrics = handle.await.unwrap();
        assert!(metrics.snapshot().ticks >= 2);
        assert_eq!(metrics.snapshot().jobs_failed, 0);
    }
}
