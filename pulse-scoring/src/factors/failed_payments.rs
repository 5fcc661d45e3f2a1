use super::{FactorInput, ScoreFactor};
use async_trait::async_trait;
use chrono::Duration;
use pulse_core::constants::FACTOR_FAILED_PAYMENTS;
use pulse_core::{Payment, PaymentStatus, PulseResult, Timestamp};

/// Recent payment failures and the trailing failure streak.
pub struct FailedPayments;

#[async_trait]
impl ScoreFactor for FailedPayments {
    fn name(&self) -> &str {
        FACTOR_FAILED_PAYMENTS
    }

    async fn calculate(&self, input: &FactorInput<'_>) -> PulseResult<Option<f64>> {
        let customer = input.customer;
        let payments = input
            .repo
            .list_payments(customer.tenant_id, customer.id, None)
            .await?;
        Ok(failure_score(&payments, input.now))
    }
}

/// Score from a customer's payments (any order).
///
/// No failures in 90 days is 1.0 and a single resolved failure is 0.75.
/// Three or more consecutive trailing failures is 0. Each failure in the
/// last 7 days costs 0.1, each other failure in the last 30 days 0.05, and
/// each failure in the last 90 days beyond the first 0.1.
pub fn failure_score(payments: &[Payment], now: Timestamp) -> Option<f64> {
    if payments.is_empty() {
        return None;
    }

    let mut ordered: Vec<&Payment> = payments
        .iter()
        .filter(|p| matches!(p.status, PaymentStatus::Succeeded | PaymentStatus::Failed))
        .collect();
    ordered.sort_by_key(|p| p.occurred_at);
    let trailing = ordered
        .iter()
        .rev()
        .take_while(|p| p.status == PaymentStatus::Failed)
        .count();
    if trailing >= 3 {
        return Some(0.0);
    }

    let failed_since = |days: i64| {
        let cutoff = now - Duration::days(days);
        ordered
            .iter()
            .filter(|p| p.status == PaymentStatus::Failed && p.occurred_at >= cutoff)
            .count() as f64
    };
    let (f7, f30, f90) = (failed_since(7), failed_since(30), failed_since(90));
    if f90 == 0.0 {
        return Some(1.0);
    }

    let base = match trailing {
        0 => 0.75,
        1 => 0.5,
        _ => 0.35,
    };
    let score = base - 0.1 * f7 - 0.05 * (f30 - f7) - 0.1 * (f90 - 1.0);
    Some(score.clamp(0.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pulse_core::{CustomerId, TenantId};
    use pulse_core::{JsonMap, Provider};
    use uuid::Uuid;

    fn payment(status: PaymentStatus, days_ago: i64) -> Payment {
        Payment {
            id: Uuid::now_v7(),
            tenant_id: TenantId::nil(),
            provider: Provider::Stripe,
            external_id: format!("ch_{}", days_ago),
            customer_id: CustomerId::nil(),
            amount_cents: 1000,
            currency: None,
            status,
            failure_reason: None,
            occurred_at: Utc::now() - Duration::days(days_ago),
            metadata: JsonMap::new(),
        }
    }

    #[test]
    fn test_no_payments_is_absent() {
        assert_eq!(failure_score(&[], Utc::now()), None);
    }

    #[test]
    fn test_clean_history_is_perfect() {
        let payments = vec![payment(PaymentStatus::Succeeded, 40), payment(PaymentStatus::Succeeded, 10)];
        assert_eq!(failure_score(&payments, Utc::now()), Some(1.0));
    }

    #[test]
    fn test_single_resolved_failure() {
        let payments = vec![
            payment(PaymentStatus::Failed, 45),
            payment(PaymentStatus::Succeeded, 44),
        ];
        assert_eq!(failure_score(&payments, Utc::now()), Some(0.75));
    }

    #[test]
    fn test_three_consecutive_failures_is_zero() {
        let payments = vec![
            payment(PaymentStatus::Succeeded, 80),
            payment(PaymentStatus::Failed, 20),
            payment(PaymentStatus::Failed, 10),
            payment(PaymentStatus::Failed, 1),
        ];
        assert_eq!(failure_score(&payments, Utc::now()), Some(0.0));
    }

    #[test]
    fn test_recent_failure_is_penalized() {
        let payments = vec![
            payment(PaymentStatus::Succeeded, 30),
            payment(PaymentStatus::Failed, 2),
        ];
        let score = failure_score(&payments, Utc::now()).unwrap();
        assert!((score - 0.4).abs() < 1e-9);
    }
}
