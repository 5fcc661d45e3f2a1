//! Pulse Integrations - Provider adapters
//!
//! Everything between a provider's HTTP API and the [`pulse_storage`]
//! repository: sealed OAuth tokens, a rate-limited client over a swappable
//! [`HttpTransport`], signature verification, the idempotent webhook
//! pipeline and the three provider adapters.

pub mod adapter;
pub mod client;
pub mod credentials;
pub mod crypto;
pub mod mrr;
pub mod providers;
pub mod signature;
pub mod transport;
pub mod webhook;

pub use adapter::{emit, window_start, IntegrationAdapter, PullRequest, PullSummary, SyncProgress};
pub use client::{classify, ProviderClient};
pub use credentials::{CredentialManager, OAuthSettings};
pub use crypto::TokenCipher;
pub use mrr::{monthly_recurring_revenue, mrr_change, normalize_to_monthly, recompute_customer_mrr, MrrUpdate};
pub use providers::hubspot::HUBSPOT_API_BASE;
pub use providers::intercom::INTERCOM_API_BASE;
pub use providers::stripe::STRIPE_API_BASE;
pub use providers::{AdapterDeps, HubspotAdapter, IntercomAdapter, StripeAdapter};
pub use signature::{sign_hubspot_v3, sign_intercom, sign_stripe, verify_hubspot_v3, verify_intercom, verify_stripe};
pub use transport::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, RequestBody};
pub use webhook::{InboundWebhook, WebhookEffect, WebhookEnvelope, WebhookOutcome, WebhookPipeline};
