//! Inbound webhooks: provider events and email delivery events.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, Method, Uri},
    Json,
};
use pulse_alerts::DeliveryEvent;
use pulse_core::Provider;
use pulse_integrations::InboundWebhook;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use crate::telemetry::METRICS;

/// Rebuild the URI the provider signed. Behind a proxy the request line
/// carries only the path, so the scheme and host come from headers.
pub(crate) fn public_uri(uri: &Uri, headers: &HeaderMap) -> String {
    if uri.scheme().is_some() {
        return uri.to_string();
    }
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    match header("x-forwarded-host").or_else(|| header("host")) {
        Some(host) => {
            let scheme = header("x-forwarded-proto").unwrap_or("https");
            format!("{}://{}{}", scheme, host, path)
        }
        None => path.to_string(),
    }
}

fn inbound(method: &Method, uri: &Uri, headers: &HeaderMap, body: Bytes) -> InboundWebhook {
    InboundWebhook {
        method: method.as_str().to_string(),
        uri: public_uri(uri, headers),
        headers: headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect(),
        body: body.to_vec(),
    }
}

/// POST /webhooks/:provider
pub async fn provider_webhook(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let provider: Provider = provider
        .parse()
        .map_err(|_| ApiError::not_found(format!("unknown provider: {}", provider)))?;
    let adapter = state
        .adapter(provider)
        .ok_or_else(|| ApiError::not_found(format!("{} is not configured", provider)))?;

    let webhook = inbound(&method, &uri, &headers, body);
    let result = adapter.handle_webhook(&webhook).await;

    let label = match &result {
        Ok(outcome) => outcome.as_str(),
        Err(e) => e.kind().as_str(),
    };
    if let Ok(metrics) = METRICS.as_ref() {
        metrics.record_webhook(provider.as_db_str(), label);
    }

    match result {
        Ok(outcome) => {
            tracing::debug!(provider = %provider, outcome = outcome.as_str(), "Webhook handled");
            Ok(Json(json!({"outcome": outcome.as_str()})))
        }
        Err(e) => {
            tracing::warn!(provider = %provider, error = %e, "Webhook rejected");
            Err(e.into())
        }
    }
}

/// POST /webhooks/email/events
pub async fn email_events(
    State(state): State<AppState>,
    Json(events): Json<Vec<DeliveryEvent>>,
) -> ApiResult<Json<Value>> {
    let summary = state.alerts.ingest_delivery_events(&events).await?;
    if let Ok(metrics) = METRICS.as_ref() {
        metrics.record_webhook("email", "processed");
    }
    Ok(Json(json!({
        "applied": summary.applied,
        "ignored": summary.ignored,
        "unmatched": summary.unmatched,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_public_uri_from_host() {
        let mut headers = HeaderMap::new();
        headers.insert("host", HeaderValue::from_static("hooks.pulse.test"));
        let uri: Uri = "/webhooks/hubspot?x=1".parse().unwrap();
        assert_eq!(public_uri(&uri, &headers), "https://hooks.pulse.test/webhooks/hubspot?x=1");

        headers.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        headers.insert("x-forwarded-host", HeaderValue::from_static("edge.pulse.test"));
        assert_eq!(public_uri(&uri, &headers), "http://edge.pulse.test/webhooks/hubspot?x=1");
    }

    #[test]
    fn test_public_uri_without_host() {
        let uri: Uri = "/webhooks/stripe".parse().unwrap();
        assert_eq!(public_uri(&uri, &HeaderMap::new()), "/webhooks/stripe");
    }
}
