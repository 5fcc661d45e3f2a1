//! HTTP routes.

pub mod health;
pub mod oauth;
pub mod webhooks;

use axum::{
    error_handling::HandleErrorLayer,
    http::StatusCode,
    middleware,
    routing::{get, post},
    BoxError, Router,
};
use std::time::Duration;
use tower::{limit::ConcurrencyLimitLayer, ServiceBuilder};
use tower_http::trace::TraceLayer;

use crate::error::ApiError;
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};

/// Requests still running after this are answered with 503.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Webhook handlers in flight at once; the rest queue.
const WEBHOOK_CONCURRENCY: usize = 64;

async fn handle_timeout(err: BoxError) -> ApiError {
    if err.is::<tower::timeout::error::Elapsed>() {
        ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "transient", "request timed out")
    } else {
        ApiError::internal(format!("unhandled middleware error: {}", err))
    }
}

pub fn build_router(state: AppState) -> Router {
    let webhooks = Router::new()
        .route("/webhooks/email/events", post(webhooks::email_events))
        .route("/webhooks/:provider", post(webhooks::provider_webhook))
        .layer(ConcurrencyLimitLayer::new(WEBHOOK_CONCURRENCY));

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics_handler))
        .route("/oauth/:provider/connect", get(oauth::connect))
        .route("/oauth/:provider/callback", get(oauth::callback))
        .merge(webhooks)
        .layer(middleware::from_fn(observability_middleware))
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(handle_timeout))
                .timeout(REQUEST_TIMEOUT),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
