//! Scoring Scheduler Background Task
//!
//! Rescores every tenant with a live connection on a fixed interval, then
//! prunes score history past retention.

use crate::engine::ScoringEngine;
use crate::metrics::ScoringMetrics;
use pulse_core::OpContext;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Run the scoring ticker until shutdown is signalled.
pub async fn scoring_scheduler_task(
    engine: Arc<ScoringEngine>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<ScoringMetrics> {
    let settings = engine.settings().clone();
    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = settings.interval.as_secs(),
        workers = settings.workers,
        "Scoring scheduler started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Scoring scheduler shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let ctx = OpContext::background("scoring_tick").with_shutdown(shutdown_rx.clone());
                scoring_cycle(&engine, &ctx).await;
            }
        }
    }

    let metrics = engine.metrics();
    let snapshot = metrics.snapshot();
    tracing::info!(
        scores_calculated = snapshot.scores_calculated,
        no_signal = snapshot.no_signal,
        failures = snapshot.failures,
        ticks = snapshot.ticks,
        "Scoring scheduler completed"
    );
    metrics
}

/// One tick: rescore, then prune history.
pub async fn scoring_cycle(engine: &ScoringEngine, ctx: &OpContext) {
    let tick = engine.run_tick(ctx).await;
    if tick.tenants == 0 {
        tracing::trace!("Scoring tick found no connected tenants");
    } else {
        tracing::info!(
            tenants = tick.tenants,
            scored = tick.customers.scored,
            no_signal = tick.customers.no_signal,
            failed = tick.customers.failed,
            "Scoring tick completed"
        );
    }

    match engine.prune_history().await {
        Ok(0) => {}
        Ok(pruned) => tracing::info!(pruned, "Pruned score history"),
        Err(e) => tracing::error!(error = %e, "Failed to prune score history"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ScoringSettings;
    use pulse_storage::MemoryStore;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_until_shutdown() {
        let settings = ScoringSettings {
            interval: Duration::from_secs(30),
            ..ScoringSettings::default()
        };
        let engine = Arc::new(ScoringEngine::new(Arc::new(MemoryStore::new()), settings));
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(scoring_scheduler_task(engine, rx));

        tokio::time::sleep(Duration::from_secs(100)).await;
        tx.send(true).unwrap();
        let metrics = handle.await.unwrap();
        assert!(metrics.snapshot().ticks >= 3);
        assert_eq!(metrics.snapshot().scores_calculated, 0);
    }
}
