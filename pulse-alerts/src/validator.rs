//! Alert rule validation.
//!
//! Runs before every save so the evaluator can trust stored conditions.

use pulse_core::{AlertError, AlertRule, TriggerType};

fn invalid(reason: impl Into<String>) -> AlertError {
    AlertError::InvalidRule {
        reason: reason.into(),
    }
}

/// Check a rule's name, recipients and trigger-specific conditions.
pub fn validate_rule(rule: &AlertRule) -> Result<(), AlertError> {
    if rule.name.trim().is_empty() {
        return Err(invalid("name must not be empty"));
    }
    validate_recipients(&rule.recipients)?;

    let c = &rule.conditions;
    if let Some(key) = c.other.keys().next() {
        return Err(invalid(format!("unknown condition '{}'", key)));
    }
    if c.cooldown_hours.is_some_and(|h| h < 0) {
        return Err(invalid("cooldown_hours must not be negative"));
    }

    let allowed: &[&str] = match rule.trigger_type {
        TriggerType::ScoreBelow => {
            if let Some(threshold) = c.threshold {
                if !(1..=100).contains(&threshold) {
                    return Err(invalid(format!("threshold {} is outside 1..=100", threshold)));
                }
            }
            &["threshold"]
        }
        TriggerType::ScoreDrop => {
            if let Some(points) = c.points {
                if !(1..=100).contains(&points) {
                    return Err(invalid(format!("points {} is outside 1..=100", points)));
                }
            }
            if let Some(days) = c.days {
                if !(1..=365).contains(&days) {
                    return Err(invalid(format!("days {} is outside 1..=365", days)));
                }
            }
            &["points", "days"]
        }
        TriggerType::RiskChange => {
            if let (Some(from), Some(to)) = (c.from, c.to) {
                if from == to {
                    return Err(invalid(format!("from and to are both '{}'", from)));
                }
            }
            &["from", "to"]
        }
        TriggerType::PaymentFailed => &[],
    };

    let present = [
        ("threshold", c.threshold.is_some()),
        ("points", c.points.is_some()),
        ("days", c.days.is_some()),
        ("from", c.from.is_some()),
        ("to", c.to.is_some()),
    ];
    for (key, set) in present {
        if set && !allowed.contains(&key) {
            return Err(invalid(format!(
                "condition '{}' does not apply to {}",
                key, rule.trigger_type
            )));
        }
    }
    Ok(())
}

fn validate_recipients(recipients: &[String]) -> Result<(), AlertError> {
    if recipients.is_empty() {
        return Err(invalid("at least one recipient is required"));
    }
    for recipient in recipients {
        let valid = recipient
            .split_once('@')
            .is_some_and(|(local, domain)| {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
            });
        if !valid || recipient.chars().any(char::is_whitespace) {
            return Err(invalid(format!("'{}' is not an email address", recipient)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::{AlertChannel, AlertConditions, AlertRuleId, RiskLevel, TenantId};
    use serde_json::json;

    fn rule(trigger_type: TriggerType, conditions: AlertConditions) -> AlertRule {
        AlertRule {
            id: AlertRuleId::now_v7(),
            tenant_id: TenantId::nil(),
            name: "Churn watch".into(),
            description: None,
            trigger_type,
            conditions,
            channel: AlertChannel::Email,
            recipients: vec!["ops@acme.io".into()],
            is_active: true,
            created_by: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_every_trigger_accepts_empty_conditions() {
        for trigger in [
            TriggerType::ScoreBelow,
            TriggerType::ScoreDrop,
            TriggerType::RiskChange,
            TriggerType::PaymentFailed,
        ] {
            assert_eq!(validate_rule(&rule(trigger, AlertConditions::default())), Ok(()));
        }
    }

    #[test]
    fn test_score_drop_ranges() {
        let ok = AlertConditions {
            points: Some(10),
            days: Some(7),
            cooldown_hours: Some(24),
            ..Default::default()
        };
        assert!(validate_rule(&rule(TriggerType::ScoreDrop, ok)).is_ok());

        let zero_days = AlertConditions {
            days: Some(0),
            ..Default::default()
        };
        assert!(validate_rule(&rule(TriggerType::ScoreDrop, zero_days)).is_err());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let c = AlertConditions {
            threshold: Some(120),
            ..Default::default()
        };
        let err = validate_rule(&rule(TriggerType::ScoreBelow, c)).unwrap_err();
        assert!(err.to_string().contains("120"));
    }

    #[test]
    fn test_risk_change_requires_distinct_levels() {
        let c = AlertConditions {
            from: Some(RiskLevel::Red),
            to: Some(RiskLevel::Red),
            ..Default::default()
        };
        assert!(validate_rule(&rule(TriggerType::RiskChange, c)).is_err());
    }

    #[test]
    fn test_mismatched_and_unknown_conditions() {
        let c = AlertConditions {
            threshold: Some(40),
            ..Default::default()
        };
        assert!(validate_rule(&rule(TriggerType::PaymentFailed, c)).is_err());

        let c: AlertConditions = serde_json::from_value(json!({"severity": "high"})).unwrap();
        let err = validate_rule(&rule(TriggerType::PaymentFailed, c)).unwrap_err();
        assert!(err.to_string().contains("severity"));
    }

    #[test]
    fn test_recipients() {
        let mut r = rule(TriggerType::PaymentFailed, AlertConditions::default());
        r.recipients.clear();
        assert!(validate_rule(&r).is_err());
        for bad in ["ops", "ops@", "@acme.io", "ops@acme", "o ps@acme.io"] {
            r.recipients = vec![bad.into()];
            assert!(validate_rule(&r).is_err(), "{} accepted", bad);
        }
    }

    #[test]
    fn test_negative_cooldown() {
        let c = AlertConditions {
            cooldown_hours: Some(-1),
            ..Default::default()
        };
        assert!(validate_rule(&rule(TriggerType::PaymentFailed, c)).is_err());
    }

    #[test]
    fn test_blank_name() {
        let mut r = rule(TriggerType::PaymentFailed, AlertConditions::default());
        r.name = "  ".into();
        assert!(validate_rule(&r).is_err());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_threshold_accepted_iff_in_range(threshold in -50i32..200) {
                let conditions = AlertConditions {
                    threshold: Some(threshold),
                    ..Default::default()
                };
                let result = validate_rule(&rule(TriggerType::ScoreBelow, conditions));
                prop_assert_eq!(result.is_ok(), (1..=100).contains(&threshold));
            }
        }
    }
}
