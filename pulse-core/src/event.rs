//! Customer timeline events
//!
//! Producers build a [`TimelineEvent`]; storage persists the tag as
//! `event_type` and the payload as the JSON `data` column. Event types the
//! code doesn't know (older rows, future producers) still load, they just
//! have no typed payload.

use crate::enums::{RiskLevel, ScoreDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type names, as persisted.
pub mod event_types {
    pub const MRR_CHANGED: &str = "mrr.changed";
    pub const PAYMENT_FAILED: &str = "payment.failed";
    pub const PAYMENT_CONSECUTIVE_FAILURES: &str = "payment.consecutive_failures";
    pub const SUBSCRIPTION_CREATED: &str = "subscription.created";
    pub const SUBSCRIPTION_STATUS_CHANGED: &str = "subscription.status_changed";
    pub const SUBSCRIPTION_CANCELED: &str = "subscription.canceled";
    pub const DEAL_CREATED: &str = "deal_created";
    pub const DEAL_STAGE_CHANGE: &str = "deal_stage_change";
    pub const CONVERSATION_OPEN: &str = "conversation_open";
    pub const CONVERSATION_CLOSED: &str = "conversation_closed";
    pub const TICKET_OPENED: &str = "ticket.opened";
    pub const TICKET_RESOLVED: &str = "ticket.resolved";
    pub const LOGIN: &str = "login";
    pub const FEATURE_USE: &str = "feature_use";
    pub const API_CALL: &str = "api_call";
    pub const SCORE_INITIAL: &str = "score.initial";
    pub const SCORE_CHANGED: &str = "score.changed";
    pub const RISK_LEVEL_CHANGED: &str = "risk_level.changed";

    /// Events counted by the engagement factor.
    pub const ENGAGEMENT: &[&str] = &[LOGIN, FEATURE_USE, API_CALL];
}

/// Typed payload of a customer timeline event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "data")]
pub enum TimelineEvent {
    #[serde(rename = "mrr.changed")]
    MrrChanged {
        old_mrr_cents: i64,
        new_mrr_cents: i64,
        change_percent: f64,
    },

    #[serde(rename = "payment.failed")]
    PaymentFailed {
        payment_id: String,
        amount_cents: i64,
        currency: Option<String>,
        failure_reason: Option<String>,
    },

    #[serde(rename = "payment.consecutive_failures")]
    PaymentConsecutiveFailures { count: u32, last_payment_id: String },

    #[serde(rename = "subscription.created")]
    SubscriptionCreated {
        subscription_id: String,
        status: String,
        amount_cents: i64,
    },

    #[serde(rename = "subscription.status_changed")]
    SubscriptionStatusChanged {
        subscription_id: String,
        previous_status: String,
        new_status: String,
    },

    #[serde(rename = "subscription.canceled")]
    SubscriptionCanceled { subscription_id: String },

    #[serde(rename = "deal_created")]
    DealCreated {
        deal_id: String,
        name: Option<String>,
        stage: Option<String>,
        amount_cents: Option<i64>,
    },

    #[serde(rename = "deal_stage_change")]
    DealStageChange {
        deal_id: String,
        previous_stage: Option<String>,
        new_stage: String,
    },

    #[serde(rename = "conversation_open")]
    ConversationOpen { conversation_id: String },

    #[serde(rename = "conversation_closed")]
    ConversationClosed { conversation_id: String },

    #[serde(rename = "ticket.opened")]
    TicketOpened {
        ticket_id: String,
        title: Option<String>,
    },

    #[serde(rename = "ticket.resolved")]
    TicketResolved { ticket_id: String },

    #[serde(rename = "login")]
    Login { user: Option<String> },

    #[serde(rename = "feature_use")]
    FeatureUse { feature: Option<String> },

    #[serde(rename = "api_call")]
    ApiCall { endpoint: Option<String> },

    #[serde(rename = "score.initial")]
    ScoreInitial { score: i32, risk_level: RiskLevel },

    #[serde(rename = "score.changed")]
    ScoreChanged {
        previous_score: i32,
        new_score: i32,
        delta: i32,
        direction: ScoreDirection,
    },

    #[serde(rename = "risk_level.changed")]
    RiskLevelChanged {
        previous: RiskLevel,
        new: RiskLevel,
        score: i32,
    },
}

impl TimelineEvent {
    /// Persisted event type tag.
    pub fn event_type(&self) -> &'static str {
        use event_types::*;
        match self {
            TimelineEvent::MrrChanged { .. } => MRR_CHANGED,
            TimelineEvent::PaymentFailed { .. } => PAYMENT_FAILED,
            TimelineEvent::PaymentConsecutiveFailures { .. } => PAYMENT_CONSECUTIVE_FAILURES,
            TimelineEvent::SubscriptionCreated { .. } => SUBSCRIPTION_CREATED,
            TimelineEvent::SubscriptionStatusChanged { .. } => SUBSCRIPTION_STATUS_CHANGED,
            TimelineEvent::SubscriptionCanceled { .. } => SUBSCRIPTION_CANCELED,
            TimelineEvent::DealCreated { .. } => DEAL_CREATED,
            TimelineEvent::DealStageChange { .. } => DEAL_STAGE_CHANGE,
            TimelineEvent::ConversationOpen { .. } => CONVERSATION_OPEN,
            TimelineEvent::ConversationClosed { .. } => CONVERSATION_CLOSED,
            TimelineEvent::TicketOpened { .. } => TICKET_OPENED,
            TimelineEvent::TicketResolved { .. } => TICKET_RESOLVED,
            TimelineEvent::Login { .. } => LOGIN,
            TimelineEvent::FeatureUse { .. } => FEATURE_USE,
            TimelineEvent::ApiCall { .. } => API_CALL,
            TimelineEvent::ScoreInitial { .. } => SCORE_INITIAL,
            TimelineEvent::ScoreChanged { .. } => SCORE_CHANGED,
            TimelineEvent::RiskLevelChanged { .. } => RISK_LEVEL_CHANGED,
        }
    }

    /// Payload as the JSON `data` column.
    pub fn data(&self) -> Value {
        match serde_json::to_value(self) {
            Ok(Value::Object(mut obj)) => obj.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        }
    }

    /// Rebuild the typed payload from persisted columns.
    pub fn from_parts(event_type: &str, data: &Value) -> Option<Self> {
        let tagged = serde_json::json!({ "event_type": event_type, "data": data });
        serde_json::from_value(tagged).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parts_roundtrip() {
        let event = TimelineEvent::RiskLevelChanged {
            previous: RiskLevel::Green,
            new: RiskLevel::Yellow,
            score: 65,
        };
        assert_eq!(event.event_type(), "risk_level.changed");
        assert_eq!(
            event.data(),
            json!({"previous": "green", "new": "yellow", "score": 65})
        );
        let back = TimelineEvent::from_parts(event.event_type(), &event.data());
        assert_eq!(back, Some(event));
    }

    #[test]
    fn test_unknown_event_type_has_no_payload() {
        assert_eq!(TimelineEvent::from_parts("note.added", &json!({})), None);
    }

    #[test]
    fn test_optional_fields_tolerate_absence() {
        let parsed = TimelineEvent::from_parts("login", &json!({}));
        assert_eq!(parsed, Some(TimelineEvent::Login { user: None }));
    }

    #[test]
    fn test_event_type_matches_serde_tag() {
        let event = TimelineEvent::ScoreChanged {
            previous_score: 80,
            new_score: 65,
            delta: -15,
            direction: ScoreDirection::Declined,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event_type"], json!(event.event_type()));
    }
}
