//! Score change detection.

use pulse_core::{HealthScore, ScoreDirection, TimelineEvent};

/// Derives timeline events from consecutive scores of one customer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeDetector {
    significant_delta: i32,
}

impl ChangeDetector {
    pub fn new(significant_delta: i32) -> Self {
        Self {
            significant_delta: significant_delta.max(1),
        }
    }

    pub fn significant_delta(&self) -> i32 {
        self.significant_delta
    }

    /// `score.initial` for the first score; otherwise `score.changed` when
    /// |Δ| reaches the significant delta and `risk_level.changed` when the
    /// band moved.
    pub fn detect(&self, previous: Option<&HealthScore>, current: &HealthScore) -> Vec<TimelineEvent> {
        let Some(previous) = previous else {
            return vec![TimelineEvent::ScoreInitial {
                score: current.overall_score,
                risk_level: current.risk_level,
            }];
        };

        let mut events = Vec::new();
        let delta = current.overall_score - previous.overall_score;
        if delta.abs() >= self.significant_delta {
            events.push(TimelineEvent::ScoreChanged {
                previous_score: previous.overall_score,
                new_score: current.overall_score,
                delta,
                direction: if delta > 0 {
                    ScoreDirection::Improved
                } else {
                    ScoreDirection::Declined
                },
            });
        }
        if previous.risk_level != current.risk_level {
            events.push(TimelineEvent::RiskLevelChanged {
                previous: previous.risk_level,
                new: current.risk_level,
                score: current.overall_score,
            });
        }
        events
    }
}

/// Idempotency key of a scoring event.
pub fn event_key(score: &HealthScore, event: &TimelineEvent) -> String {
    format!(
        "{}:{}:{}",
        score.customer_id,
        score.calculated_at.timestamp_millis(),
        event.event_type()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::{CustomerId, RiskLevel, TenantId};
    use std::collections::BTreeMap;

    fn score(overall: i32, risk_level: RiskLevel) -> HealthScore {
        HealthScore {
            tenant_id: TenantId::nil(),
            customer_id: CustomerId::nil(),
            overall_score: overall,
            risk_level,
            factors: BTreeMap::new(),
            calculated_at: Utc::now(),
        }
    }

    #[test]
    fn test_first_score_is_initial() {
        let events = ChangeDetector::new(10).detect(None, &score(80, RiskLevel::Green));
        assert_eq!(
            events,
            vec![TimelineEvent::ScoreInitial {
                score: 80,
                risk_level: RiskLevel::Green
            }]
        );
    }

    #[test]
    fn test_band_change_below_delta_emits_only_risk_change() {
        let previous = score(72, RiskLevel::Green);
        let current = score(65, RiskLevel::Yellow);
        let events = ChangeDetector::new(10).detect(Some(&previous), &current);
        assert_eq!(
            events,
            vec![TimelineEvent::RiskLevelChanged {
                previous: RiskLevel::Green,
                new: RiskLevel::Yellow,
                score: 65
            }]
        );
    }

    #[test]
    fn test_large_improvement() {
        let previous = score(30, RiskLevel::Red);
        let current = score(45, RiskLevel::Yellow);
        let events = ChangeDetector::new(10).detect(Some(&previous), &current);
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0],
            TimelineEvent::ScoreChanged {
                previous_score: 30,
                new_score: 45,
                delta: 15,
                direction: ScoreDirection::Improved
            }
        );
    }

    #[test]
    fn test_exact_delta_counts() {
        let events = ChangeDetector::new(10).detect(
            Some(&score(90, RiskLevel::Green)),
            &score(80, RiskLevel::Green),
        );
        assert!(matches!(
            events.as_slice(),
            [TimelineEvent::ScoreChanged { delta: -10, direction: ScoreDirection::Declined, .. }]
        ));
    }

    #[test]
    fn test_event_keys_differ_by_type() {
        let s = score(50, RiskLevel::Yellow);
        let a = event_key(&s, &TimelineEvent::ScoreInitial { score: 50, risk_level: RiskLevel::Yellow });
        let b = event_key(
            &s,
            &TimelineEvent::RiskLevelChanged {
                previous: RiskLevel::Green,
                new: RiskLevel::Yellow,
                score: 50,
            },
        );
        assert_ne!(a, b);
    }
}
