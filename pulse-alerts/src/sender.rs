//! Outbound email.
//!
//! [`EmailSender`] is the seam the engine sends through. [`HttpEmailSender`]
//! posts to the email provider's JSON API over the shared HTTP transport.

use async_trait::async_trait;
use pulse_core::{EmailConfig, IntegrationError, PulseError, PulseResult};
use pulse_integrations::{HttpRequest, HttpResponse, HttpTransport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

const PROVIDER: &str = "email";

/// One rendered message to one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
    /// Provider-side tags for correlating delivery events.
    pub tags: Vec<(String, String)>,
}

/// Sends one email and returns the provider's message id.
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> PulseResult<String>;
}

/// JSON-over-HTTPS email provider client.
pub struct HttpEmailSender {
    transport: Arc<dyn HttpTransport>,
    config: EmailConfig,
}

impl HttpEmailSender {
    pub fn new(transport: Arc<dyn HttpTransport>, config: EmailConfig) -> Self {
        Self { transport, config }
    }

    fn request(&self, message: &EmailMessage) -> HttpRequest {
        let tags: Vec<Value> = message
            .tags
            .iter()
            .map(|(name, value)| json!({"name": name, "value": value}))
            .collect();
        HttpRequest::post(&self.config.api_url)
            .bearer(&self.config.api_key)
            .json(json!({
                "from": self.config.from_email,
                "to": [message.to],
                "subject": message.subject,
                "html": message.html,
                "text": message.text,
                "tags": tags,
            }))
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: &EmailMessage) -> PulseResult<String> {
        let response = self.transport.send(PROVIDER, self.request(message)).await?;
        message_id(response)
    }
}

/// Classify the provider's answer and pull out the message id.
fn message_id(response: HttpResponse) -> PulseResult<String> {
    let status = response.status;
    if !response.is_success() {
        let reason = String::from_utf8_lossy(&response.body).chars().take(200).collect::<String>();
        let err = match status {
            401 | 403 => IntegrationError::auth(PROVIDER, reason),
            429 | 500..=599 => IntegrationError::Transient {
                provider: PROVIDER.to_string(),
                reason: format!("status {}: {}", status, reason),
                retry_after: response.retry_after(),
            },
            _ => IntegrationError::permanent(PROVIDER, Some(status), reason),
        };
        return Err(err.into());
    }

    if let Some(id) = response.header("x-message-id") {
        return Ok(id.to_string());
    }
    let body: Value = serde_json::from_slice(&response.body).map_err(|e| {
        PulseError::from(IntegrationError::invalid_response(PROVIDER, e.to_string()))
    })?;
    ["message_id", "id"]
        .iter()
        .find_map(|key| body.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .ok_or_else(|| IntegrationError::invalid_response(PROVIDER, "response carried no message id").into())
}

/// Longest wait between attempts, in multiples of the base delay.
const MAX_DELAY_FACTOR: u32 = 4;

/// Send with bounded retries on transient failures. Waits `base_delay`,
/// then twice that, between attempts. A provider `Retry-After` replaces
/// the backoff but never exceeds four base delays.
pub async fn send_with_retry(
    sender: &dyn EmailSender,
    message: &EmailMessage,
    max_attempts: u32,
    base_delay: Duration,
) -> PulseResult<String> {
    let mut attempt = 1;
    loop {
        match sender.send(message).await {
            Ok(id) => return Ok(id),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = e
                    .retry_after()
                    .unwrap_or(base_delay * 2u32.saturating_pow(attempt - 1))
                    .min(base_delay * MAX_DELAY_FACTOR);
                tracing::debug!(
                    recipient = %message.to,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Email send failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
