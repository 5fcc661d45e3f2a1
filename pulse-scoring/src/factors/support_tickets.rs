use super::{lerp, FactorInput, ScoreFactor};
use async_trait::async_trait;
use chrono::Duration;
use pulse_core::constants::FACTOR_SUPPORT_TICKETS;
use pulse_core::{ConversationState, PulseResult};

/// Support load over 90 days relative to the tenant's median.
pub struct SupportTickets;

#[async_trait]
impl ScoreFactor for SupportTickets {
    fn name(&self) -> &str {
        FACTOR_SUPPORT_TICKETS
    }

    async fn calculate(&self, input: &FactorInput<'_>) -> PulseResult<Option<f64>> {
        // No conversations anywhere in the tenant means no support integration.
        let Some(median) = input.signals.conversation_median() else {
            return Ok(None);
        };
        let customer = input.customer;
        let count = input
            .signals
            .conversations_90d
            .get(&customer.id)
            .copied()
            .unwrap_or(0);
        let unresolved = if count > 0 {
            input
                .repo
                .list_conversations(customer.tenant_id, customer.id, Some(input.now - Duration::days(90)))
                .await?
                .iter()
                .filter(|c| c.state != ConversationState::Closed)
                .count()
        } else {
            0
        };
        Ok(Some(ticket_score(count, median, unresolved)))
    }
}

/// Below half the median → [0.7, 1.0], around it → [0.4, 0.7], well above
/// → [0, 0.4] (reaching 0 at three times the median); minus 0.1 per
/// unresolved conversation.
pub fn ticket_score(count: i64, median: f64, unresolved: usize) -> f64 {
    let ratio = count as f64 / median.max(1.0);
    let base = if ratio < 0.5 {
        lerp(1.0, 0.7, ratio / 0.5)
    } else if ratio <= 1.5 {
        lerp(0.7, 0.4, ratio - 0.5)
    } else {
        lerp(0.4, 0.0, (ratio - 1.5) / 1.5)
    };
    (base - 0.1 * unresolved as f64).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_customer_scores_high() {
        assert_eq!(ticket_score(0, 4.0, 0), 1.0);
        assert!(ticket_score(1, 4.0, 0) >= 0.7);
    }

    #[test]
    fn test_median_customer_is_middling() {
        let score = ticket_score(4, 4.0, 0);
        assert!((0.4..=0.7).contains(&score));
    }

    #[test]
    fn test_heavy_load_and_open_tickets() {
        assert_eq!(ticket_score(12, 4.0, 0), 0.0);
        let busy = ticket_score(8, 4.0, 0);
        assert!(busy < 0.4);
        assert!((ticket_score(0, 4.0, 2) - 0.8).abs() < 1e-9);
    }
}
