//! Pulse server entry point.
//!
//! Loads configuration, migrates the database, spawns the three
//! schedulers and serves HTTP until Ctrl-C.

use std::sync::Arc;
use std::time::Duration;

use pulse_alerts::alert_scheduler_task;
use pulse_core::PulseConfig;
use pulse_integrations::ReqwestTransport;
use pulse_scoring::scoring_scheduler_task;
use pulse_server::telemetry::{init_tracing, TelemetryConfig};
use pulse_server::{build_router, ApiError, ApiResult, AppState};
use pulse_storage::{DbConfig, PgStore};
use pulse_sync::sync_scheduler_task;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Per-request deadline for outbound provider calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> ApiResult<()> {
    init_tracing(&TelemetryConfig::default())?;

    let config = PulseConfig::from_env();
    config.validate().map_err(|e| ApiError::internal(e.to_string()))?;
    tracing::info!(config = ?config, "Configuration loaded");

    let store = PgStore::from_config(&DbConfig::from_config(&config))?;
    let applied = store.migrate().await?;
    tracing::info!(applied = ?applied, pool_size = store.pool_size(), "Database ready");

    let transport = Arc::new(ReqwestTransport::new(HTTP_TIMEOUT)?);
    let state = AppState::assemble(Arc::new(store), transport, &config)?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sync = tokio::spawn(sync_scheduler_task(state.sync.clone(), shutdown_rx.clone()));
    let scoring = tokio::spawn(scoring_scheduler_task(state.scoring.clone(), shutdown_rx.clone()));
    let alerts = tokio::spawn(alert_scheduler_task(state.alerts.clone(), shutdown_rx));

    let app = build_router(state);
    tracing::info!(addr = %config.bind_addr, "Starting Pulse server");
    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|e| ApiError::internal(format!("Failed to bind {}: {}", config.bind_addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    join_scheduler("sync", sync).await;
    join_scheduler("scoring", scoring).await;
    join_scheduler("alerts", alerts).await;

    tracing::info!("Pulse server stopped");
    Ok(())
}

async fn join_scheduler<T>(name: &'static str, handle: JoinHandle<T>) {
    if let Err(e) = handle.await {
        tracing::error!(scheduler = name, error = %e, "Scheduler task panicked");
    }
}
