//! Email delivery-event ingestion.
//!
//! The email provider posts batches of `{message_id, event, timestamp}`.
//! Events stamp the alert row sent with that message id; unknown event
//! names and unknown message ids are ignored.

use chrono::{DateTime, Utc};
use pulse_core::{AlertHistory, AlertStatus, PulseResult, Timestamp};
use pulse_storage::Repository;
use serde::Deserialize;

/// One entry of the provider's delivery webhook.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeliveryEvent {
    #[serde(alias = "sg_message_id")]
    pub message_id: String,
    pub event: String,
    /// Unix seconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Delivered,
    Open,
    Click,
    Bounce,
    SpamReport,
}

impl DeliveryKind {
    pub fn parse(event: &str) -> Option<Self> {
        match event.trim().to_ascii_lowercase().as_str() {
            "delivered" => Some(Self::Delivered),
            "open" => Some(Self::Open),
            "click" => Some(Self::Click),
            "bounce" => Some(Self::Bounce),
            "spamreport" => Some(Self::SpamReport),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub applied: usize,
    pub ignored: usize,
    pub unmatched: usize,
}

/// Stamp `entry` for one delivery event.
pub fn apply_delivery(entry: &mut AlertHistory, kind: DeliveryKind, at: Timestamp) {
    match kind {
        DeliveryKind::Delivered => entry.delivered_at = Some(at),
        DeliveryKind::Open => entry.opened_at = Some(at),
        DeliveryKind::Click => entry.clicked_at = Some(at),
        DeliveryKind::Bounce => {
            entry.bounced_at = Some(at);
            entry.status = AlertStatus::Failed;
        }
        DeliveryKind::SpamReport => entry.status = AlertStatus::Failed,
    }
}

/// Apply a batch of delivery events.
pub async fn ingest_delivery_events(
    repo: &dyn Repository,
    events: &[DeliveryEvent],
) -> PulseResult<IngestSummary> {
    let mut summary = IngestSummary::default();
    for event in events {
        let Some(kind) = DeliveryKind::parse(&event.event) else {
            summary.ignored += 1;
            continue;
        };
        let Some(mut entry) = find_entry(repo, &event.message_id).await? else {
            tracing::debug!(message_id = %event.message_id, "Delivery event for unknown message");
            summary.unmatched += 1;
            continue;
        };
        let at = event
            .timestamp
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .unwrap_or_else(Utc::now);
        apply_delivery(&mut entry, kind, at);
        repo.update_alert_history(&entry).await?;
        summary.applied += 1;
    }
    Ok(summary)
}

/// Some providers suffix the id they hand back with routing data after a
/// dot; fall back to the prefix.
async fn find_entry(repo: &dyn Repository, message_id: &str) -> PulseResult<Option<AlertHistory>> {
    if let Some(entry) = repo.find_alert_by_message_id(message_id).await? {
        return Ok(Some(entry));
    }
    match message_id.split_once('.') {
        Some((prefix, _)) if !prefix.is_empty() => repo.find_alert_by_message_id(prefix).await,
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::{AlertChannel, AlertHistoryId, AlertRuleId, TenantId};
    use serde_json::json;

    fn entry() -> AlertHistory {
        AlertHistory {
            id: AlertHistoryId::now_v7(),
            tenant_id: TenantId::nil(),
            alert_rule_id: AlertRuleId::nil(),
            customer_id: None,
            channel: AlertChannel::Email,
            status: AlertStatus::Sent,
            trigger_data: json!({}),
            provider_message_id: Some("m1".into()),
            delivered_at: None,
            opened_at: None,
            clicked_at: None,
            bounced_at: None,
            error_message: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_parse_kinds() {
        assert_eq!(DeliveryKind::parse("delivered"), Some(DeliveryKind::Delivered));
        assert_eq!(DeliveryKind::parse("SpamReport"), Some(DeliveryKind::SpamReport));
        assert_eq!(DeliveryKind::parse("processed"), None);
    }

    #[test]
    fn test_bounce_fails_the_row() {
        let mut e = entry();
        let at = Utc::now();
        apply_delivery(&mut e, DeliveryKind::Bounce, at);
        assert_eq!(e.status, AlertStatus::Failed);
        assert_eq!(e.bounced_at, Some(at));
    }

    #[test]
    fn test_open_keeps_status() {
        let mut e = entry();
        apply_delivery(&mut e, DeliveryKind::Open, Utc::now());
        assert_eq!(e.status, AlertStatus::Sent);
        assert!(e.opened_at.is_some());
    }

    #[test]
    fn test_payload_accepts_provider_alias() {
        let events: Vec<DeliveryEvent> = serde_json::from_value(json!([
            {"sg_message_id": "abc.filter01", "event": "open", "timestamp": 1_700_000_000},
            {"message_id": "def", "event": "click"}
        ]))
        .unwrap();
        assert_eq!(events[0].message_id, "abc.filter01");
        assert_eq!(events[1].timestamp, None);
    }
}
