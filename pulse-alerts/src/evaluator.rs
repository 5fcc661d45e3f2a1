//! Trigger evaluation.
//!
//! Score triggers read the current score (and, for drops, the history
//! snapshot `days` ago). Event triggers look for a matching timeline event
//! inside the rule's cooldown window.

use crate::conditions::Trigger;
use chrono::Duration;
use pulse_core::event_types::{PAYMENT_FAILED, RISK_LEVEL_CHANGED};
use pulse_core::{
    AlertRule, Customer, CustomerId, CustomerWithScore, PulseResult, RiskLevel, TimelineEvent,
    Timestamp,
};
use pulse_storage::{EventQuery, Repository};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What made a rule fire; persisted as the history row's `trigger_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "snake_case")]
pub enum TriggerData {
    ScoreBelow {
        customer_name: String,
        score: i32,
        threshold: i32,
        risk_level: RiskLevel,
    },
    ScoreDrop {
        customer_name: String,
        previous_score: i32,
        current_score: i32,
        drop: i32,
        days: i32,
        /// Factor with the smallest current value.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        weakest_factor: Option<(String, f64)>,
    },
    RiskChange {
        customer_name: String,
        previous: RiskLevel,
        new: RiskLevel,
        score: i32,
    },
    PaymentFailed {
        customer_name: String,
        payment_id: String,
        amount_cents: i64,
        #[serde(default)]
        currency: Option<String>,
        #[serde(default)]
        failure_reason: Option<String>,
    },
}

impl TriggerData {
    pub fn customer_name(&self) -> &str {
        match self {
            TriggerData::ScoreBelow { customer_name, .. }
            | TriggerData::ScoreDrop { customer_name, .. }
            | TriggerData::RiskChange { customer_name, .. }
            | TriggerData::PaymentFailed { customer_name, .. } => customer_name,
        }
    }
}

/// One `(rule, customer)` pair whose condition holds.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertMatch {
    pub customer_id: CustomerId,
    pub data: TriggerData,
}

/// Name shown in alerts: name, then company, then email, then the
/// provider's id.
pub fn display_name(customer: &Customer) -> String {
    customer
        .name
        .as_deref()
        .or(customer.company_name.as_deref())
        .or(customer.email.as_deref())
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(&customer.external_id)
        .to_string()
}

/// Evaluate `rule` over `candidates`. `window` bounds how far back event
/// triggers look.
pub async fn evaluate_rule(
    repo: &dyn Repository,
    rule: &AlertRule,
    candidates: &[CustomerWithScore],
    now: Timestamp,
    window: Duration,
) -> PulseResult<Vec<AlertMatch>> {
    let trigger = Trigger::from_rule(rule);
    let mut matches = Vec::new();
    match trigger {
        Trigger::ScoreBelow { threshold } => {
            for c in candidates {
                let Some(score) = &c.score else { continue };
                if score.overall_score < threshold {
                    matches.push(AlertMatch {
                        customer_id: c.customer.id,
                        data: TriggerData::ScoreBelow {
                            customer_name: display_name(&c.customer),
                            score: score.overall_score,
                            threshold,
                            risk_level: score.risk_level,
                        },
                    });
                }
            }
        }
        Trigger::ScoreDrop { points, days } => {
            for c in candidates {
                let Some(score) = &c.score else { continue };
                let Some(past) = repo
                    .get_score_at(rule.tenant_id, c.customer.id, now - Duration::days(i64::from(days)))
                    .await?
                else {
                    continue;
                };
                let drop = past.overall_score - score.overall_score;
                if drop > 0 && drop >= points {
                    matches.push(AlertMatch {
                        customer_id: c.customer.id,
                        data: TriggerData::ScoreDrop {
                            customer_name: display_name(&c.customer),
                            previous_score: past.overall_score,
                            current_score: score.overall_score,
                            drop,
                            days,
                            weakest_factor: score
                                .weakest_factor()
                                .map(|(name, value)| (name.to_string(), value)),
                        },
                    });
                }
            }
        }
        Trigger::RiskChange { .. } => {
            let events = recent_events(repo, rule, candidates, RISK_LEVEL_CHANGED, now - window).await?;
            for (c, payloads) in events {
                let hit = payloads.into_iter().find_map(|event| match event {
                    TimelineEvent::RiskLevelChanged { previous, new, score }
                        if trigger.accepts_transition(previous, new) =>
                    {
                        Some((previous, new, score))
                    }
                    _ => None,
                });
                if let Some((previous, new, score)) = hit {
                    matches.push(AlertMatch {
                        customer_id: c.id,
                        data: TriggerData::RiskChange {
                            customer_name: display_name(c),
                            previous,
                            new,
                            score,
                        },
                    });
                }
            }
        }
        Trigger::PaymentFailed => {
            let events = recent_events(repo, rule, candidates, PAYMENT_FAILED, now - window).await?;
            for (c, payloads) in events {
                let hit = payloads.into_iter().find_map(|event| match event {
                    TimelineEvent::PaymentFailed {
                        payment_id,
                        amount_cents,
                        currency,
                        failure_reason,
                    } => Some((payment_id, amount_cents, currency, failure_reason)),
                    _ => None,
                });
                if let Some((payment_id, amount_cents, currency, failure_reason)) = hit {
                    matches.push(AlertMatch {
                        customer_id: c.id,
                        data: TriggerData::PaymentFailed {
                            customer_name: display_name(c),
                            payment_id,
                            amount_cents,
                            currency,
                            failure_reason,
                        },
                    });
                }
            }
        }
    }
    Ok(matches)
}

/// Events of `event_type` since `since` for each candidate, newest first,
/// in candidate order.
async fn recent_events<'a>(
    repo: &dyn Repository,
    rule: &AlertRule,
    candidates: &'a [CustomerWithScore],
    event_type: &str,
    since: Timestamp,
) -> PulseResult<Vec<(&'a Customer, Vec<TimelineEvent>)>> {
    let mut query = EventQuery::default().of_types(&[event_type]).since(since);
    query.newest_first = true;
    if let [single] = candidates {
        query.customer_id = Some(single.customer.id);
    }

    let mut by_customer: HashMap<CustomerId, Vec<TimelineEvent>> = HashMap::new();
    for event in repo.list_events(rule.tenant_id, &query).await? {
        if let Some(payload) = event.payload() {
            by_customer.entry(event.customer_id).or_default().push(payload);
        }
    }

    Ok(candidates
        .iter()
        .filter_map(|c| {
            by_customer
                .remove(&c.customer.id)
                .map(|payloads| (&c.customer, payloads))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::{CustomerMetadata, Provider, TenantId};

    fn customer() -> Customer {
        let now = Utc::now();
        Customer {
            id: CustomerId::now_v7(),
            tenant_id: TenantId::nil(),
            source: Provider::Stripe,
            external_id: "cus_9".into(),
            name: None,
            email: None,
            company_name: None,
            currency: None,
            mrr_cents: 0,
            first_seen_at: now,
            last_seen_at: now,
            metadata: CustomerMetadata::default(),
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_display_name_fallbacks() {
        let mut c = customer();
        assert_eq!(display_name(&c), "cus_9");
        c.email = Some("a@x.com".into());
        assert_eq!(display_name(&c), "a@x.com");
        c.company_name = Some("Acme".into());
        assert_eq!(display_name(&c), "Acme");
        c.name = Some("Ada".into());
        assert_eq!(display_name(&c), "Ada");
    }

    #[test]
    fn test_trigger_data_is_tagged() {
        let data = TriggerData::ScoreBelow {
            customer_name: "Acme".into(),
            score: 30,
            threshold: 40,
            risk_level: RiskLevel::Red,
        };
        let value = serde_json::to_value(&data).unwrap();
        assert_eq!(value["trigger"], "score_below");
        assert_eq!(value["risk_level"], "red");
        assert_eq!(serde_json::from_value::<TriggerData>(value).unwrap(), data);
    }
}
