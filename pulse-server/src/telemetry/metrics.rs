//! Prometheus metrics
//!
//! HTTP and webhook counters are recorded as requests happen. Sync,
//! scoring and alert activity lives in atomic counters inside each
//! engine; those are copied into gauges when `/metrics` is scraped.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_gauge_vec, CounterVec, Encoder,
    HistogramVec, IntGaugeVec, TextEncoder,
};
use pulse_alerts::AlertMetricsSnapshot;
use pulse_scoring::ScoringMetricsSnapshot;
use pulse_sync::SyncMetricsSnapshot;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// HTTP request latency buckets (seconds)
/// Covers: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<PulseMetrics>> = Lazy::new(PulseMetrics::new);

/// Container for all Pulse metrics.
#[derive(Clone)]
pub struct PulseMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Inbound webhooks - labels: provider, outcome
    pub webhook_deliveries_total: CounterVec,

    /// Sync jobs since start - labels: outcome
    pub sync_jobs: IntGaugeVec,

    /// Score calculations since start - labels: outcome
    pub scores: IntGaugeVec,

    /// Alert outcomes since start - labels: status
    pub alerts: IntGaugeVec,

    /// Outbound email and notification volume - labels: channel
    pub deliveries: IntGaugeVec,
}

fn registration(name: &str, e: prometheus::Error) -> ApiError {
    ApiError::internal(format!("Failed to register {}: {}", name, e))
}

impl PulseMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "pulse_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "pulse_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration("http_request_duration_seconds", e))?,

            webhook_deliveries_total: register_counter_vec!(
                "pulse_webhook_deliveries_total",
                "Inbound webhook deliveries",
                &["provider", "outcome"]
            )
            .map_err(|e| registration("webhook_deliveries_total", e))?,

            sync_jobs: register_int_gauge_vec!(
                "pulse_sync_jobs",
                "Sync jobs since process start",
                &["outcome"]
            )
            .map_err(|e| registration("sync_jobs", e))?,

            scores: register_int_gauge_vec!(
                "pulse_scores",
                "Health score calculations since process start",
                &["outcome"]
            )
            .map_err(|e| registration("scores", e))?,

            alerts: register_int_gauge_vec!(
                "pulse_alerts",
                "Alert outcomes since process start",
                &["status"]
            )
            .map_err(|e| registration("alerts", e))?,

            deliveries: register_int_gauge_vec!(
                "pulse_alert_deliveries",
                "Emails sent and in-app notifications created since process start",
                &["channel"]
            )
            .map_err(|e| registration("alert_deliveries", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Record one inbound webhook and how it ended.
    pub fn record_webhook(&self, provider: &str, outcome: &str) {
        self.webhook_deliveries_total
            .with_label_values(&[provider, outcome])
            .inc();
    }

    pub fn observe_sync(&self, s: &SyncMetricsSnapshot) {
        for (outcome, value) in [
            ("succeeded", s.jobs_succeeded),
            ("failed", s.jobs_failed),
            ("skipped", s.jobs_skipped),
        ] {
            self.sync_jobs.with_label_values(&[outcome]).set(value as i64);
        }
    }

    pub fn observe_scoring(&self, s: &ScoringMetricsSnapshot) {
        for (outcome, value) in [
            ("calculated", s.scores_calculated),
            ("no_signal", s.no_signal),
            ("failed", s.failures),
        ] {
            self.scores.with_label_values(&[outcome]).set(value as i64);
        }
    }

    pub fn observe_alerts(&self, s: &AlertMetricsSnapshot) {
        for (status, value) in [
            ("sent", s.alerts_sent),
            ("failed", s.alerts_failed),
            ("cooled_down", s.cooldown_suppressed),
            ("suppressed", s.preference_suppressed),
        ] {
            self.alerts.with_label_values(&[status]).set(value as i64);
        }
        self.deliveries
            .with_label_values(&["email"])
            .set(s.emails_sent as i64);
        self.deliveries
            .with_label_values(&["in_app"])
            .set(s.notifications_created as i64);
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Ok(metrics) = METRICS.as_ref() {
        metrics.observe_sync(&state.sync.metrics().snapshot());
        metrics.observe_scoring(&state.scoring.metrics().snapshot());
        metrics.observe_alerts(&state.alerts.metrics().snapshot());
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;

    #[test]
    fn test_metrics_creation() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        assert!(!metrics.http_requests_total.desc().is_empty());
        Ok(())
    }

    #[test]
    fn test_snapshots_become_gauges() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        metrics.observe_alerts(&AlertMetricsSnapshot {
            alerts_sent: 4,
            cooldown_suppressed: 2,
            emails_sent: 6,
            ..Default::default()
        });
        assert_eq!(metrics.alerts.with_label_values(&["sent"]).get(), 4);
        assert_eq!(metrics.alerts.with_label_values(&["cooled_down"]).get(), 2);
        assert_eq!(metrics.deliveries.with_label_values(&["email"]).get(), 6);
        Ok(())
    }

    #[test]
    fn test_record_webhook() -> Result<(), String> {
        let metrics = METRICS
            .as_ref()
            .map_err(|e| format!("Metrics init failed: {}", e.message))?;
        let before = metrics
            .webhook_deliveries_total
            .with_label_values(&["stripe", "duplicate"])
            .get();
        metrics.record_webhook("stripe", "duplicate");
        let after = metrics
            .webhook_deliveries_total
            .with_label_values(&["stripe", "duplicate"])
            .get();
        assert_eq!(after - before, 1.0);
        Ok(())
    }
}
