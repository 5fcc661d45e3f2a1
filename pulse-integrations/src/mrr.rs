//! Monthly recurring revenue normalization.

use chrono::Utc;
use pulse_core::constants::MRR_CHANGE_THRESHOLD;
use pulse_core::{
    BillingInterval, Customer, CustomerEvent, EventSource, PulseResult, Subscription, TimelineEvent,
    Timestamp,
};
use pulse_storage::Repository;

/// Monthly value of one subscription price in minor units.
///
/// Non-active subscriptions contribute nothing. Weekly and daily prices
/// scale by 4.33 and 30.44, yearly by 1/12; the result is then spread
/// over `interval_count` periods.
pub fn normalize_to_monthly(amount_cents: i64, interval: BillingInterval, interval_count: i32, status: &str) -> i64 {
    if status != "active" {
        return 0;
    }
    let per_interval = amount_cents as f64;
    let monthly = match interval {
        BillingInterval::Month => per_interval,
        BillingInterval::Week => per_interval * 4.33,
        BillingInterval::Day => per_interval * 30.44,
        BillingInterval::Year => per_interval / 12.0,
    };
    (monthly / f64::from(interval_count.max(1))).round() as i64
}

/// Sum of every subscription's monthly value.
pub fn monthly_recurring_revenue(subscriptions: &[Subscription]) -> i64 {
    subscriptions
        .iter()
        .map(|s| normalize_to_monthly(s.amount_cents, s.interval, s.interval_count, &s.status))
        .sum()
}

/// `mrr.changed` payload when the relative change exceeds 10% of a
/// positive previous value.
pub fn mrr_change(previous: i64, new: i64) -> Option<TimelineEvent> {
    if previous <= 0 {
        return None;
    }
    let ratio = (new - previous).abs() as f64 / previous as f64;
    if ratio <= MRR_CHANGE_THRESHOLD {
        return None;
    }
    let change_percent = ((new - previous) as f64 / previous as f64 * 10_000.0).round() / 100.0;
    Some(TimelineEvent::MrrChanged {
        old_mrr_cents: previous,
        new_mrr_cents: new,
        change_percent,
    })
}

/// Result of recomputing one customer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MrrUpdate {
    pub previous: i64,
    pub current: i64,
    pub event_appended: bool,
}

/// Recompute `customer`'s MRR from its stored subscriptions, persist it if
/// it moved, and append `mrr.changed` when the move is significant.
pub async fn recompute_customer_mrr(
    repo: &dyn Repository,
    customer: &Customer,
    at: Timestamp,
) -> PulseResult<Option<MrrUpdate>> {
    let subscriptions = repo
        .list_subscriptions(customer.tenant_id, Some(customer.id))
        .await?;
    if subscriptions.is_empty() {
        return Ok(None);
    }
    let current = monthly_recurring_revenue(&subscriptions);
    let previous = customer.mrr_cents;
    if current == previous {
        return Ok(None);
    }

    let mut updated = customer.clone();
    updated.mrr_cents = current;
    updated.updated_at = Utc::now();
    repo.update_customer(&updated).await?;

    let mut event_appended = false;
    if let Some(event) = mrr_change(previous, current) {
        let external_id = format!(
            "mrr:{}:{}->{}:{}",
            customer.id,
            previous,
            current,
            at.format("%Y-%m-%d")
        );
        let row = CustomerEvent::new(
            customer.tenant_id,
            customer.id,
            EventSource::from(customer.source),
            external_id,
            at,
            &event,
        );
        event_appended = repo.append_event(&row).await?;
    }
    tracing::debug!(
        tenant_id = %customer.tenant_id,
        customer_id = %customer.id,
        previous,
        current,
        "MRR recomputed"
    );
    Ok(Some(MrrUpdate {
        previous,
        current,
        event_appended,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalization() {
        assert_eq!(normalize_to_monthly(1000, BillingInterval::Month, 1, "active"), 1000);
        assert_eq!(normalize_to_monthly(1000, BillingInterval::Week, 1, "active"), 4330);
        assert_eq!(normalize_to_monthly(100, BillingInterval::Day, 1, "active"), 3044);
        assert_eq!(normalize_to_monthly(12000, BillingInterval::Year, 1, "active"), 1000);
        assert_eq!(normalize_to_monthly(3000, BillingInterval::Month, 3, "active"), 1000);
    }

    #[test]
    fn test_inactive_contributes_nothing() {
        for status in ["canceled", "past_due", "trialing", "unpaid"] {
            assert_eq!(normalize_to_monthly(5000, BillingInterval::Month, 1, status), 0);
        }
    }

    #[test]
    fn test_zero_interval_count_is_treated_as_one() {
        assert_eq!(normalize_to_monthly(5000, BillingInterval::Month, 0, "active"), 5000);
    }

    #[test]
    fn test_change_threshold() {
        assert!(mrr_change(0, 5000).is_none());
        assert!(mrr_change(10_000, 11_000).is_none());
        assert!(mrr_change(10_000, 9_000).is_none());
        match mrr_change(10_000, 11_001) {
            Some(TimelineEvent::MrrChanged { change_percent, .. }) => {
                assert!((change_percent - 10.01).abs() < 1e-9)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(mrr_change(10_000, 0).is_some());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_mrr_changed_iff_over_ten_percent(
                previous in -1_000i64..1_000_000,
                new in 0i64..2_000_000,
            ) {
                let significant = previous > 0 && 10 * (new - previous).abs() > previous;
                prop_assert_eq!(mrr_change(previous, new).is_some(), significant);
            }
        }
    }
}
