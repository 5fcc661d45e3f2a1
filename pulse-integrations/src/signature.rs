//! Webhook signature schemes.
//!
//! All three providers sign with HMAC-SHA256 under the shared webhook
//! secret; they differ in the canonical input and in how the digest and
//! timestamp are carried.

use base64::Engine;
use chrono::{TimeZone, Utc};
use hmac::{Hmac, Mac};
use pulse_core::constants::WEBHOOK_REPLAY_WINDOW_SECS;
use pulse_core::{IntegrationError, Provider, PulseResult, Timestamp};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(secret: &str) -> Option<HmacSha256> {
    HmacSha256::new_from_slice(secret.as_bytes()).ok()
}

fn rejected(provider: Provider, reason: &str) -> IntegrationError {
    IntegrationError::auth(provider, format!("webhook rejected: {}", reason))
}

fn check_fresh(provider: Provider, signed_at: Timestamp, now: Timestamp) -> PulseResult<()> {
    let age = now.signed_duration_since(signed_at).num_seconds();
    if age.abs() > WEBHOOK_REPLAY_WINDOW_SECS {
        return Err(rejected(provider, "timestamp outside replay window").into());
    }
    Ok(())
}

// ============================================================================
// BILLING
// ============================================================================

/// `t=<unix>,v1=<hex>` over `"<t>.<payload>"`.
pub fn verify_stripe(
    payload: &[u8],
    header: &str,
    secret: &str,
    now: Timestamp,
) -> PulseResult<()> {
    let provider = Provider::Stripe;
    let mut timestamp = None;
    let mut candidates = Vec::new();
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", t)) => timestamp = t.parse::<i64>().ok(),
            Some(("v1", sig)) => candidates.push(sig),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or_else(|| rejected(provider, "missing timestamp"))?;
    let signed_at = Utc
        .timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| rejected(provider, "invalid timestamp"))?;
    check_fresh(provider, signed_at, now)?;

    let matched = candidates.iter().any(|candidate| {
        let Ok(expected) = hex::decode(candidate) else {
            return false;
        };
        let Some(mut mac) = mac(secret) else {
            return false;
        };
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        mac.verify_slice(&expected).is_ok()
    });
    if !matched {
        return Err(rejected(provider, "signature mismatch").into());
    }
    Ok(())
}

pub fn sign_stripe(payload: &[u8], secret: &str, timestamp: i64) -> String {
    let digest = mac(secret).map(|mut mac| {
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    });
    format!("t={},v1={}", timestamp, digest.unwrap_or_default())
}

// ============================================================================
// CRM
// ============================================================================

/// Base64 digest over `method + uri + body + timestamp`; the timestamp
/// header is in milliseconds.
pub fn verify_hubspot_v3(
    method: &str,
    uri: &str,
    body: &[u8],
    signature: &str,
    timestamp_ms: &str,
    secret: &str,
    now: Timestamp,
) -> PulseResult<()> {
    let provider = Provider::Hubspot;
    let millis: i64 = timestamp_ms
        .trim()
        .parse()
        .map_err(|_| rejected(provider, "invalid timestamp"))?;
    let signed_at = Utc
        .timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| rejected(provider, "invalid timestamp"))?;
    check_fresh(provider, signed_at, now)?;

    let expected = base64::engine::general_purpose::STANDARD
        .decode(signature.trim())
        .map_err(|_| rejected(provider, "malformed signature"))?;
    let mut mac = mac(secret).ok_or_else(|| rejected(provider, "invalid secret"))?;
    mac.update(method.as_bytes());
    mac.update(uri.as_bytes());
    mac.update(body);
    mac.update(timestamp_ms.trim().as_bytes());
    mac.verify_slice(&expected)
        .map_err(|_| rejected(provider, "signature mismatch").into())
}

pub fn sign_hubspot_v3(method: &str, uri: &str, body: &[u8], timestamp_ms: i64, secret: &str) -> String {
    let digest = mac(secret).map(|mut mac| {
        mac.update(method.as_bytes());
        mac.update(uri.as_bytes());
        mac.update(body);
        mac.update(timestamp_ms.to_string().as_bytes());
        mac.finalize().into_bytes()
    });
    digest
        .map(|d| base64::engine::general_purpose::STANDARD.encode(d))
        .unwrap_or_default()
}

// ============================================================================
// SUPPORT
// ============================================================================

/// `sha256=<hex>` over the raw payload.
pub fn verify_intercom(payload: &[u8], header: &str, secret: &str) -> PulseResult<()> {
    let provider = Provider::Intercom;
    let hex_digest = header.trim().strip_prefix("sha256=").unwrap_or(header.trim());
    let expected = hex::decode(hex_digest).map_err(|_| rejected(provider, "malformed signature"))?;
    let mut mac = mac(secret).ok_or_else(|| rejected(provider, "invalid secret"))?;
    mac.update(payload);
    mac.verify_slice(&expected)
        .map_err(|_| rejected(provider, "signature mismatch").into())
}

pub fn sign_intercom(payload: &[u8], secret: &str) -> String {
    let digest = mac(secret).map(|mut mac| {
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    });
    format!("sha256={}", digest.unwrap_or_default())
}
