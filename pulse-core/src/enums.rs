//! Enum types for Pulse entities

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Error when parsing an enum from its database representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

/// Generates `as_db_str`, `from_db_str`, `Display` and `FromStr` for a
/// fieldless enum stored as text.
macro_rules! db_enum {
    ($name:ident, $label:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            /// All variants in declaration order.
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Convert to database string representation.
            pub fn as_db_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Parse from database string representation.
            pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok($name::$variant),)+
                    _ => Err(EnumParseError { kind: $label, value: s.to_string() }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_db_str())
            }
        }

        impl FromStr for $name {
            type Err = EnumParseError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::from_db_str(s)
            }
        }
    };
}

// ============================================================================
// PROVIDERS AND SOURCES
// ============================================================================

/// External provider family an integration connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Billing (Stripe)
    Stripe,
    /// CRM (HubSpot)
    Hubspot,
    /// Support conversations (Intercom)
    Intercom,
}

db_enum!(Provider, "provider", {
    Stripe => "stripe",
    Hubspot => "hubspot",
    Intercom => "intercom",
});

impl Provider {
    /// Documented request ceiling per second, used to size the token bucket.
    pub fn requests_per_second(&self) -> u32 {
        match self {
            Provider::Stripe => 25,
            Provider::Hubspot => 10,
            Provider::Intercom => 15,
        }
    }

    /// Whether issued access tokens expire and must be refreshed.
    pub fn tokens_expire(&self) -> bool {
        !matches!(self, Provider::Intercom)
    }
}

/// Origin of a customer timeline event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Stripe,
    Hubspot,
    Intercom,
    /// Events emitted by the scoring engine's change detector.
    HealthScoring,
}

db_enum!(EventSource, "event source", {
    Stripe => "stripe",
    Hubspot => "hubspot",
    Intercom => "intercom",
    HealthScoring => "health_scoring",
});

impl From<Provider> for EventSource {
    fn from(provider: Provider) -> Self {
        match provider {
            Provider::Stripe => EventSource::Stripe,
            Provider::Hubspot => EventSource::Hubspot,
            Provider::Intercom => EventSource::Intercom,
        }
    }
}

/// Provider object kinds that can be pulled page by page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Customers,
    Subscriptions,
    Charges,
    Contacts,
    Deals,
    Companies,
    Conversations,
}

db_enum!(ObjectKind, "object kind", {
    Customers => "customers",
    Subscriptions => "subscriptions",
    Charges => "charges",
    Contacts => "contacts",
    Deals => "deals",
    Companies => "companies",
    Conversations => "conversations",
});

// ============================================================================
// CONNECTION AND BILLING STATE
// ============================================================================

/// Operational state of an integration connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Active,
    Syncing,
    Error,
    Disconnected,
}

db_enum!(ConnectionStatus, "connection status", {
    Active => "active",
    Syncing => "syncing",
    Error => "error",
    Disconnected => "disconnected",
});

impl ConnectionStatus {
    /// Whether the sync scheduler should still pick this connection up.
    pub fn is_schedulable(&self) -> bool {
        !matches!(self, ConnectionStatus::Disconnected)
    }
}

/// Billing interval of a subscription price.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingInterval {
    Day,
    Week,
    #[default]
    Month,
    Year,
}

db_enum!(BillingInterval, "billing interval", {
    Day => "day",
    Week => "week",
    Month => "month",
    Year => "year",
});

impl BillingInterval {
    /// Approximate length of one interval in days.
    pub fn approx_days(&self) -> f64 {
        match self {
            BillingInterval::Day => 1.0,
            BillingInterval::Week => 7.0,
            BillingInterval::Month => 30.44,
            BillingInterval::Year => 365.25,
        }
    }
}

/// Outcome of a single payment attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Succeeded,
    Failed,
    Pending,
    Refunded,
}

db_enum!(PaymentStatus, "payment status", {
    Succeeded => "succeeded",
    Failed => "failed",
    Pending => "pending",
    Refunded => "refunded",
});

/// Lifecycle state of a support conversation or ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    Open,
    Snoozed,
    Closed,
}

db_enum!(ConversationState, "conversation state", {
    Open => "open",
    Snoozed => "snoozed",
    Closed => "closed",
});

impl ConversationState {
    pub fn is_unresolved(&self) -> bool {
        !matches!(self, ConversationState::Closed)
    }
}

// ============================================================================
// SCORING AND ALERTING
// ============================================================================

/// Tri-level risk band derived from the overall score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Green,
    Yellow,
    Red,
}

db_enum!(RiskLevel, "risk level", {
    Green => "green",
    Yellow => "yellow",
    Red => "red",
});

impl RiskLevel {
    /// Ordinal where larger means healthier.
    pub fn rank(&self) -> u8 {
        match self {
            RiskLevel::Red => 0,
            RiskLevel::Yellow => 1,
            RiskLevel::Green => 2,
        }
    }
}

/// Direction of a significant score change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreDirection {
    Improved,
    Declined,
}

db_enum!(ScoreDirection, "score direction", {
    Improved => "improved",
    Declined => "declined",
});

/// What makes an alert rule fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    ScoreBelow,
    ScoreDrop,
    RiskChange,
    PaymentFailed,
}

db_enum!(TriggerType, "trigger type", {
    ScoreBelow => "score_below",
    ScoreDrop => "score_drop",
    RiskChange => "risk_change",
    PaymentFailed => "payment_failed",
});

/// Delivery channel of an alert rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertChannel {
    #[default]
    Email,
    InApp,
}

db_enum!(AlertChannel, "alert channel", {
    Email => "email",
    InApp => "in_app",
});

/// Delivery status of an alert history row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    #[default]
    Pending,
    Sent,
    Failed,
}

db_enum!(AlertStatus, "alert status", {
    Pending => "pending",
    Sent => "sent",
    Failed => "failed",
});

/// Digest cadence for notification preferences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestFrequency {
    Daily,
    #[default]
    Weekly,
}

db_enum!(DigestFrequency, "digest frequency", {
    Daily => "daily",
    Weekly => "weekly",
});
