//! Alert Scheduler Background Task

use crate::engine::AlertEngine;
use crate::metrics::AlertMetrics;
use pulse_core::OpContext;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

/// Run the alert ticker until shutdown is signalled.
pub async fn alert_scheduler_task(
    engine: Arc<AlertEngine>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<AlertMetrics> {
    let settings = engine.settings().clone();
    let mut ticker = interval(settings.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = settings.interval.as_secs(),
        default_cooldown_hours = settings.default_cooldown_hours,
        "Alert scheduler started"
    );

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    tracing::info!("Alert scheduler shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                let ctx = OpContext::background("alert_tick").with_shutdown(shutdown_rx.clone());
                let tick = engine.run_tick(&ctx).await;
                if tick.is_quiet() {
                    tracing::trace!(tenants = tick.tenants, "Alert tick matched nothing");
                } else {
                    tracing::info!(
                        tenants = tick.tenants,
                        matched = tick.summary.matched,
                        sent = tick.summary.sent,
                        failed = tick.summary.failed,
                        cooled_down = tick.summary.cooled_down,
                        suppressed = tick.summary.suppressed,
                        "Alert tick completed"
                    );
                }
            }
        }
    }

    let metrics = engine.metrics();
    let snapshot = metrics.snapshot();
    tracing::info!(
        alerts_sent = snapshot.alerts_sent,
        alerts_failed = snapshot.alerts_failed,
        ticks = snapshot.ticks,
        "Alert scheduler completed"
    );
    metrics
}
