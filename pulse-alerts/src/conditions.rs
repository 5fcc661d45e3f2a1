//! Typed view of a rule's trigger and conditions.

use chrono::Duration;
use pulse_core::constants::{
    DEFAULT_SCORE_BELOW_THRESHOLD, DEFAULT_SCORE_DROP_DAYS, DEFAULT_SCORE_DROP_POINTS,
};
use pulse_core::{AlertRule, RiskLevel, TriggerType};

/// A rule's trigger with defaults applied to missing conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    ScoreBelow { threshold: i32 },
    ScoreDrop { points: i32, days: i32 },
    RiskChange { from: Option<RiskLevel>, to: Option<RiskLevel> },
    PaymentFailed,
}

impl Trigger {
    pub fn from_rule(rule: &AlertRule) -> Self {
        let c = &rule.conditions;
        match rule.trigger_type {
            TriggerType::ScoreBelow => Trigger::ScoreBelow {
                threshold: c.threshold.unwrap_or(DEFAULT_SCORE_BELOW_THRESHOLD),
            },
            TriggerType::ScoreDrop => Trigger::ScoreDrop {
                points: c.points.unwrap_or(DEFAULT_SCORE_DROP_POINTS),
                days: c.days.unwrap_or(DEFAULT_SCORE_DROP_DAYS),
            },
            TriggerType::RiskChange => Trigger::RiskChange {
                from: c.from,
                to: c.to,
            },
            TriggerType::PaymentFailed => Trigger::PaymentFailed,
        }
    }

    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::ScoreBelow { .. } => TriggerType::ScoreBelow,
            Trigger::ScoreDrop { .. } => TriggerType::ScoreDrop,
            Trigger::RiskChange { .. } => TriggerType::RiskChange,
            Trigger::PaymentFailed => TriggerType::PaymentFailed,
        }
    }

    /// Whether a band transition satisfies the optional `from`/`to` filter.
    pub fn accepts_transition(&self, previous: RiskLevel, new: RiskLevel) -> bool {
        match self {
            Trigger::RiskChange { from, to } => {
                from.is_none_or(|f| f == previous) && to.is_none_or(|t| t == new)
            }
            _ => false,
        }
    }
}

/// Cooldown of a rule, falling back to `default_hours`.
pub fn cooldown(rule: &AlertRule, default_hours: i64) -> Duration {
    Duration::hours(rule.conditions.cooldown_hours.unwrap_or(default_hours).max(0))
}
