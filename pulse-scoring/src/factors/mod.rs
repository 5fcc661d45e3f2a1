//! Score factors.
//!
//! A factor turns one signal about a customer into a value in [0, 1], or
//! reports that it has nothing to say. Tenant-wide aggregates that several
//! customers share (conversation and engagement counts) are loaded once per
//! run into [`TenantSignals`].

mod engagement;
mod failed_payments;
mod mrr_trend;
mod payment_recency;
mod support_tickets;

pub use engagement::{engagement_score, Engagement};
pub use failed_payments::{failure_score, FailedPayments};
pub use mrr_trend::{blended_trend, mrr_at, relative_change, trend_score, MrrTrend};
pub use payment_recency::{expected_interval_days, recency_score, PaymentRecency};
pub use support_tickets::{ticket_score, SupportTickets};

use async_trait::async_trait;
use chrono::Duration;
use pulse_core::{event_types, Customer, CustomerId, PulseResult, TenantId, Timestamp};
use pulse_storage::Repository;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a factor may read for one customer.
pub struct FactorInput<'a> {
    pub repo: &'a dyn Repository,
    pub customer: &'a Customer,
    pub signals: &'a TenantSignals,
    pub now: Timestamp,
}

/// One health signal.
#[async_trait]
pub trait ScoreFactor: Send + Sync {
    /// Key into the tenant's weight map.
    fn name(&self) -> &str;

    /// Value in [0, 1], or `None` when there is not enough data.
    async fn calculate(&self, input: &FactorInput<'_>) -> PulseResult<Option<f64>>;
}

/// The five standard factors.
pub fn standard_factors() -> Vec<Arc<dyn ScoreFactor>> {
    vec![
        Arc::new(PaymentRecency),
        Arc::new(MrrTrend),
        Arc::new(FailedPayments),
        Arc::new(SupportTickets),
        Arc::new(Engagement),
    ]
}

/// Tenant-wide counts the relative factors compare against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TenantSignals {
    /// Conversations opened in the last 90 days, per customer.
    pub conversations_90d: HashMap<CustomerId, i64>,
    /// Engagement events in the last 30 days, per customer.
    pub engagement_30d: HashMap<CustomerId, i64>,
    /// Engagement events in the last 7 days, per customer.
    pub engagement_7d: HashMap<CustomerId, i64>,
}

impl TenantSignals {
    pub async fn load(repo: &dyn Repository, tenant_id: TenantId, now: Timestamp) -> PulseResult<Self> {
        let conversations_90d = repo
            .count_conversations_by_customer(tenant_id, now - Duration::days(90))
            .await?;
        let engagement_30d = repo
            .count_events_by_customer(tenant_id, event_types::ENGAGEMENT, now - Duration::days(30))
            .await?;
        let engagement_7d = repo
            .count_events_by_customer(tenant_id, event_types::ENGAGEMENT, now - Duration::days(7))
            .await?;
        Ok(Self {
            conversations_90d,
            engagement_30d,
            engagement_7d,
        })
    }

    /// Median conversation count among customers that had any.
    pub fn conversation_median(&self) -> Option<f64> {
        median(self.conversations_90d.values().copied())
    }

    /// Median 30-day engagement among customers that had any.
    pub fn engagement_median(&self) -> Option<f64> {
        median(self.engagement_30d.values().copied())
    }
}

/// Median of the positive values, or `None` when there are none.
pub fn median(values: impl Iterator<Item = i64>) -> Option<f64> {
    let mut sorted: Vec<i64> = values.filter(|v| *v > 0).collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_unstable();
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
    } else {
        sorted[mid] as f64
    })
}

/// Linear interpolation of `t ∈ [0, 1]` onto `[lo, hi]`.
pub(crate) fn lerp(lo: f64, hi: f64, t: f64) -> f64 {
    lo + (hi - lo) * t.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_median() {
        assert_eq!(median([3, 1, 2].into_iter()), Some(2.0));
        assert_eq!(median([4, 1, 2, 3].into_iter()), Some(2.5));
        assert_eq!(median([0, 0, 5].into_iter()), Some(5.0));
        assert_eq!(median(std::iter::empty()), None);
    }

    #[test]
    fn test_standard_factor_names_match_default_weights() {
        let names: Vec<String> = standard_factors().iter().map(|f| f.name().to_string()).collect();
        for (name, _) in pulse_core::constants::DEFAULT_FACTOR_WEIGHTS {
            assert!(names.iter().any(|n| n == name), "missing factor {}", name);
        }
        assert_eq!(names.len(), 5);
    }

    #[test]
    fn test_lerp_clamps() {
        assert!((lerp(0.4, 0.8, 0.5) - 0.6).abs() < 1e-12);
        assert_eq!(lerp(0.0, 1.0, 2.0), 1.0);
        assert_eq!(lerp(0.0, 1.0, -1.0), 0.0);
    }
}
