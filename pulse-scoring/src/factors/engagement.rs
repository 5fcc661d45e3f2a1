use super::{lerp, FactorInput, ScoreFactor};
use async_trait::async_trait;
use pulse_core::constants::FACTOR_ENGAGEMENT;
use pulse_core::PulseResult;

/// Product usage over 30 days relative to the tenant's median, with a
/// bonus for activity in the last week.
pub struct Engagement;

#[async_trait]
impl ScoreFactor for Engagement {
    fn name(&self) -> &str {
        FACTOR_ENGAGEMENT
    }

    async fn calculate(&self, input: &FactorInput<'_>) -> PulseResult<Option<f64>> {
        let Some(median) = input.signals.engagement_median() else {
            return Ok(None);
        };
        let id = input.customer.id;
        let last_30 = input.signals.engagement_30d.get(&id).copied().unwrap_or(0);
        let last_7 = input.signals.engagement_7d.get(&id).copied().unwrap_or(0);
        Ok(Some(engagement_score(last_30, median, last_7)))
    }
}

/// At the median → 0.6, twice the median or more → 0.9, none → 0; plus up
/// to 0.1 when the last week carried at least its share of the month.
pub fn engagement_score(last_30: i64, median: f64, last_7: i64) -> f64 {
    let ratio = last_30 as f64 / median.max(1.0);
    let base = if ratio >= 1.0 {
        lerp(0.6, 0.9, ratio - 1.0)
    } else {
        lerp(0.0, 0.6, ratio)
    };
    let weekly_share = last_30 as f64 / 4.0;
    let bonus = if last_7 > 0 {
        0.1 * (last_7 as f64 / weekly_share.max(1.0)).min(1.0)
    } else {
        0.0
    };
    (base + bonus).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inactive_customer_scores_zero() {
        assert_eq!(engagement_score(0, 10.0, 0), 0.0);
    }

    #[test]
    fn test_median_usage_with_recent_activity() {
        assert!((engagement_score(10, 10.0, 0) - 0.6).abs() < 1e-9);
        assert!((engagement_score(10, 10.0, 3) - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_heavy_usage_caps() {
        assert!((engagement_score(40, 10.0, 40) - 1.0).abs() < 1e-9);
        assert!(engagement_score(20, 10.0, 0) <= 0.9 + 1e-9);
    }
}
