//! Rate-limited provider client.

use crate::transport::{HttpRequest, HttpResponse, HttpTransport};
use governor::{clock::DefaultClock, Quota, RateLimiter};
use pulse_core::{IntegrationError, Provider, PulseError, PulseResult};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;

type DirectRateLimiter =
    RateLimiter<governor::state::NotKeyed, governor::state::InMemoryState, DefaultClock>;

/// Token-bucket limited client for one provider's REST API.
///
/// Every request waits on the limiter, then is classified:
/// 2xx parses, 429 and 5xx are transient, any other status is permanent.
#[derive(Clone)]
pub struct ProviderClient {
    provider: Provider,
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    limiter: Arc<DirectRateLimiter>,
}

impl std::fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderClient")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl ProviderClient {
    /// Client limited to the provider's documented request ceiling.
    pub fn new(
        provider: Provider,
        base_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self::with_rate(provider, base_url, transport, provider.requests_per_second())
    }

    pub fn with_rate(
        provider: Provider,
        base_url: impl Into<String>,
        transport: Arc<dyn HttpTransport>,
        requests_per_second: u32,
    ) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN));
        Self {
            provider,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            transport,
            limiter: Arc::new(RateLimiter::direct(quota)),
        }
    }

    pub fn provider(&self) -> Provider {
        self.provider
    }

    /// Absolute URL for an API path.
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Send a request and return the parsed JSON body of a 2xx response.
    pub async fn execute(&self, request: HttpRequest) -> PulseResult<Value> {
        self.limiter.until_ready().await;
        tracing::trace!(provider = %self.provider, url = %request.url, "Provider request");
        let response = self
            .transport
            .send(self.provider.as_db_str(), request)
            .await?;
        classify(self.provider, response)
    }

    pub async fn get(&self, path: &str, token: &str, query: &[(&str, String)]) -> PulseResult<Value> {
        let request = HttpRequest::get(self.url(path)).bearer(token).query(query);
        self.execute(request).await
    }

    pub async fn post_json(&self, path: &str, token: &str, body: Value) -> PulseResult<Value> {
        let request = HttpRequest::post(self.url(path))
            .bearer(token)
            .header("Content-Type", "application/json")
            .json(body);
        self.execute(request).await
    }

    /// Unauthenticated form post, used against OAuth token endpoints.
    pub async fn post_form(&self, url: &str, fields: Vec<(String, String)>) -> PulseResult<Value> {
        let request = HttpRequest::post(self.url(url))
            .header("Accept", "application/json")
            .form(fields);
        self.execute(request).await
    }
}

/// Map an HTTP response onto the error taxonomy.
pub fn classify(provider: Provider, response: HttpResponse) -> PulseResult<Value> {
    let status = response.status;
    if response.is_success() {
        if response.body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        return serde_json::from_slice(&response.body).map_err(|e| {
            PulseError::from(IntegrationError::invalid_response(
                provider,
                format!("Failed to parse response: {}", e),
            ))
        });
    }

    let message = error_message(&response.body);
    if status == 429 || status >= 500 {
        return Err(IntegrationError::Transient {
            provider: provider.to_string(),
            reason: format!("status {}: {}", status, message),
            retry_after: response.retry_after(),
        }
        .into());
    }
    Err(IntegrationError::permanent(provider, Some(status), message).into())
}

/// Best-effort extraction of a provider error message.
fn error_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body).to_string();
    let Ok(json) = serde_json::from_str::<Value>(&text) else {
        return text;
    };
    json.pointer("/error/message")
        .or_else(|| json.get("message"))
        .or_else(|| json.pointer("/errors/0/message"))
        .or_else(|| json.get("error_description"))
        .or_else(|| json.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::ErrorKind;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_success_parses() {
        let value = classify(Provider::Stripe, HttpResponse::json(200, &json!({"id": "cus_1"}))).unwrap();
        assert_eq!(value["id"], "cus_1");
    }

    #[test]
    fn test_empty_success_is_null() {
        let resp = HttpResponse {
            status: 204,
            headers: vec![],
            body: vec![],
        };
        assert_eq!(classify(Provider::Hubspot, resp).unwrap(), Value::Null);
    }

    #[test]
    fn test_rate_limited_is_transient_with_delay() {
        let mut resp = HttpResponse::json(429, &json!({"message": "slow down"}));
        resp.headers.push(("Retry-After".into(), "10".into()));
        let err = classify(Provider::Hubspot, resp).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_server_error_is_transient() {
        let err = classify(Provider::Intercom, HttpResponse::json(503, &json!({}))).unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_client_error_is_permanent() {
        let body = json!({"error": {"message": "No such customer"}});
        let err = classify(Provider::Stripe, HttpResponse::json(404, &body)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(err.to_string().contains("No such customer"));
    }

    #[test]
    fn test_url_joins_paths() {
        struct Never;
        #[async_trait::async_trait]
        impl HttpTransport for Never {
            async fn send(&self, provider: &str, _: HttpRequest) -> PulseResult<HttpResponse> {
                Err(IntegrationError::transient(provider, "unreachable").into())
            }
        }
        let client = ProviderClient::new(Provider::Stripe, "https://api.stripe.com/", Arc::new(Never));
        assert_eq!(client.url("/v1/customers"), "https://api.stripe.com/v1/customers");
        assert_eq!(client.url("https://connect.stripe.com/oauth/token"), "https://connect.stripe.com/oauth/token");
    }
}
