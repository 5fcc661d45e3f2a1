use super::{lerp, FactorInput, ScoreFactor};
use async_trait::async_trait;
use pulse_core::constants::FACTOR_PAYMENT_RECENCY;
use pulse_core::{BillingInterval, PaymentStatus, PulseResult, Subscription};

/// Days since the last successful payment, relative to the billing interval.
pub struct PaymentRecency;

#[async_trait]
impl ScoreFactor for PaymentRecency {
    fn name(&self) -> &str {
        FACTOR_PAYMENT_RECENCY
    }

    async fn calculate(&self, input: &FactorInput<'_>) -> PulseResult<Option<f64>> {
        let customer = input.customer;
        let payments = input
            .repo
            .list_payments(customer.tenant_id, customer.id, None)
            .await?;
        let Some(last_paid) = payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Succeeded)
            .map(|p| p.occurred_at)
            .max()
        else {
            return Ok(None);
        };

        let subscriptions = input
            .repo
            .list_subscriptions(customer.tenant_id, Some(customer.id))
            .await?;
        let days_since = (input.now - last_paid).num_seconds().max(0) as f64 / 86_400.0;
        Ok(Some(recency_score(days_since, expected_interval_days(&subscriptions))))
    }
}

/// Billing period in days of the customer's live subscription, falling back
/// to any subscription and then to a month.
pub fn expected_interval_days(subscriptions: &[Subscription]) -> f64 {
    let live = subscriptions
        .iter()
        .find(|s| matches!(s.status.as_str(), "active" | "trialing" | "past_due"))
        .or_else(|| subscriptions.first());
    let Some(sub) = live else {
        return 30.0;
    };
    let unit = match sub.interval {
        BillingInterval::Day => 1.0,
        BillingInterval::Week => 7.0,
        BillingInterval::Month => 30.0,
        BillingInterval::Year => 365.0,
    };
    unit * f64::from(sub.interval_count.max(1))
}

/// Piecewise: within one interval → [0.8, 1.0], two → [0.4, 0.8],
/// three → [0, 0.4], beyond → 0.
pub fn recency_score(days_since: f64, expected_days: f64) -> f64 {
    let ratio = days_since / expected_days.max(1.0);
    if ratio <= 1.0 {
        lerp(1.0, 0.8, ratio)
    } else if ratio <= 2.0 {
        lerp(0.8, 0.4, ratio - 1.0)
    } else if ratio <= 3.0 {
        lerp(0.4, 0.0, ratio - 2.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recency_bands() {
        assert_eq!(recency_score(0.0, 30.0), 1.0);
        assert!((recency_score(30.0, 30.0) - 0.8).abs() < 1e-9);
        assert!((recency_score(45.0, 30.0) - 0.6).abs() < 1e-9);
        assert!((recency_score(60.0, 30.0) - 0.4).abs() < 1e-9);
        assert!((recency_score(75.0, 30.0) - 0.2).abs() < 1e-9);
        assert_eq!(recency_score(120.0, 30.0), 0.0);
    }

    #[test]
    fn test_recency_is_monotone() {
        let mut last = f64::MAX;
        for day in 0..120 {
            let score = recency_score(day as f64, 30.0);
            assert!(score <= last);
            last = score;
        }
    }

    #[test]
    fn test_yearly_plan_tolerates_long_gaps() {
        assert!(recency_score(200.0, 365.0) > 0.8);
        assert_eq!(expected_interval_days(&[]), 30.0);
    }
}
