use super::{lerp, FactorInput, ScoreFactor};
use async_trait::async_trait;
use chrono::Duration;
use pulse_core::constants::FACTOR_MRR_TREND;
use pulse_core::{event_types, PulseResult, TimelineEvent, Timestamp};
use pulse_storage::EventQuery;

/// Blend of 30/60/90-day MRR movement, reconstructed from `mrr.changed`.
pub struct MrrTrend;

#[async_trait]
impl ScoreFactor for MrrTrend {
    fn name(&self) -> &str {
        FACTOR_MRR_TREND
    }

    async fn calculate(&self, input: &FactorInput<'_>) -> PulseResult<Option<f64>> {
        let customer = input.customer;
        let query = EventQuery::for_customer(customer.id)
            .of_types(&[event_types::MRR_CHANGED])
            .since(input.now - Duration::days(90));
        let changes: Vec<(Timestamp, i64)> = input
            .repo
            .list_events(customer.tenant_id, &query)
            .await?
            .iter()
            .filter_map(|event| match event.payload() {
                Some(TimelineEvent::MrrChanged { old_mrr_cents, .. }) => {
                    Some((event.occurred_at, old_mrr_cents))
                }
                _ => None,
            })
            .collect();

        let current = customer.mrr_cents;
        let past: Vec<i64> = [30, 60, 90]
            .iter()
            .map(|days| mrr_at(&changes, current, input.now - Duration::days(*days)))
            .collect();
        if current <= 0 && past.iter().all(|p| *p <= 0) {
            return Ok(None);
        }

        let blended = blended_trend(
            relative_change(past[0], current),
            relative_change(past[1], current),
            relative_change(past[2], current),
        );
        Ok(Some(trend_score(blended)))
    }
}

/// MRR in effect at `at`: the pre-change value of the first change after
/// `at`, or `current` if nothing changed since.
pub fn mrr_at(changes: &[(Timestamp, i64)], current: i64, at: Timestamp) -> i64 {
    changes
        .iter()
        .filter(|(when, _)| *when > at)
        .min_by_key(|(when, _)| *when)
        .map(|(_, old)| *old)
        .unwrap_or(current)
}

/// Fractional change from `past` to `current`; from zero counts as +100%.
pub fn relative_change(past: i64, current: i64) -> f64 {
    match (past, current) {
        (p, c) if p > 0 => (c - p) as f64 / p as f64,
        (_, c) if c > 0 => 1.0,
        _ => 0.0,
    }
}

pub fn blended_trend(delta_30: f64, delta_60: f64, delta_90: f64) -> f64 {
    0.5 * delta_30 + 0.3 * delta_60 + 0.2 * delta_90
}

/// Growth above +5% → [0.8, 1.0] (saturating at +50%), within ±5% →
/// [0.5, 0.7], decline to −50% → [0.1, 0.4], worse → 0.
pub fn trend_score(blended: f64) -> f64 {
    if blended > 0.05 {
        lerp(0.8, 1.0, (blended - 0.05) / 0.45)
    } else if blended >= -0.05 {
        lerp(0.5, 0.7, (blended + 0.05) / 0.10)
    } else if blended >= -0.5 {
        lerp(0.1, 0.4, (blended + 0.5) / 0.45)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_mrr_at_walks_back_through_changes() {
        let now = Utc::now();
        let changes = vec![
            (now - Duration::days(50), 1000),
            (now - Duration::days(10), 1500),
        ];
        // 1000 → 1500 fifty days ago, 1500 → 2000 ten days ago.
        assert_eq!(mrr_at(&changes, 2000, now - Duration::days(5)), 2000);
        assert_eq!(mrr_at(&changes, 2000, now - Duration::days(30)), 1500);
        assert_eq!(mrr_at(&changes, 2000, now - Duration::days(60)), 1000);
    }

    #[test]
    fn test_relative_change() {
        assert_eq!(relative_change(1000, 1100), 0.1);
        assert_eq!(relative_change(0, 500), 1.0);
        assert_eq!(relative_change(0, 0), 0.0);
        assert_eq!(relative_change(1000, 0), -1.0);
    }

    #[test]
    fn test_trend_bands() {
        assert_eq!(trend_score(0.0), 0.6);
        assert!(trend_score(0.2) >= 0.8 && trend_score(0.2) <= 1.0);
        assert_eq!(trend_score(2.0), 1.0);
        let decline = trend_score(-0.3);
        assert!((0.1..=0.4).contains(&decline));
        assert_eq!(trend_score(-0.8), 0.0);
    }

    #[test]
    fn test_blend_weights() {
        assert!((blended_trend(0.1, 0.2, 0.3) - 0.17).abs() < 1e-9);
    }
}
