//! The alert engine.
//!
//! Processing one match:
//!
//! 1. Skip it while the rule's cooldown for this customer is running. The
//!    pair stays locked from this check until the row is settled.
//! 2. Resolve recipients against their notification preferences. If no
//!    one can be reached, nothing is written.
//! 3. Insert a pending history row carrying the trigger data.
//! 4. Email every allowed recipient (email channel only). The first
//!    failure marks the row failed and stops.
//! 5. Mark the row sent and enqueue in-app notifications.

use crate::conditions::cooldown;
use crate::delivery::{ingest_delivery_events, DeliveryEvent, IngestSummary};
use crate::evaluator::{evaluate_rule, AlertMatch};
use crate::locks::MatchLocks;
use crate::metrics::AlertMetrics;
use crate::sender::{send_with_retry, EmailMessage, EmailSender};
use crate::settings::AlertSettings;
use crate::templates::render;
use async_trait::async_trait;
use chrono::Utc;
use pulse_core::{
    AlertChannel, AlertError, AlertHistory, AlertRule, AlertStatus, CustomerId, CustomerWithScore,
    Notification, NotificationId, NotificationPreference, OpContext, PulseError, PulseResult,
    ScoreCalculatedHook, TenantId, Timestamp, User,
};
use pulse_storage::{Repository, Store};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;

/// What became of one match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOutcome {
    Sent,
    Failed,
    CooledDown,
    /// Every recipient opted out.
    Suppressed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationSummary {
    pub rules: usize,
    pub matched: usize,
    pub sent: usize,
    pub failed: usize,
    pub cooled_down: usize,
    pub suppressed: usize,
}

impl EvaluationSummary {
    fn record(&mut self, outcome: MatchOutcome) {
        self.matched += 1;
        match outcome {
            MatchOutcome::Sent => self.sent += 1,
            MatchOutcome::Failed => self.failed += 1,
            MatchOutcome::CooledDown => self.cooled_down += 1,
            MatchOutcome::Suppressed => self.suppressed += 1,
        }
    }

    fn merge(&mut self, other: EvaluationSummary) {
        self.rules += other.rules;
        self.matched += other.matched;
        self.sent += other.sent;
        self.failed += other.failed;
        self.cooled_down += other.cooled_down;
        self.suppressed += other.suppressed;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertTick {
    pub tenants: usize,
    pub summary: EvaluationSummary,
}

impl AlertTick {
    pub fn is_quiet(&self) -> bool {
        self.summary.matched == 0
    }
}

#[derive(Debug, Clone)]
struct Recipient {
    email: String,
    user: Option<User>,
    email_allowed: bool,
    in_app_allowed: bool,
}

pub struct AlertEngine {
    store: Arc<dyn Store>,
    sender: Arc<dyn EmailSender>,
    settings: AlertSettings,
    metrics: Arc<AlertMetrics>,
    locks: MatchLocks,
}

impl AlertEngine {
    pub fn new(store: Arc<dyn Store>, sender: Arc<dyn EmailSender>, settings: AlertSettings) -> Self {
        Self {
            store,
            sender,
            settings,
            metrics: Arc::new(AlertMetrics::new()),
            locks: MatchLocks::new(),
        }
    }

    pub fn settings(&self) -> &AlertSettings {
        &self.settings
    }

    pub fn metrics(&self) -> Arc<AlertMetrics> {
        self.metrics.clone()
    }

    /// Evaluate every tenant that has an active rule.
    pub async fn run_tick(&self, ctx: &OpContext) -> AlertTick {
        let mut tick = AlertTick::default();
        let tenants = match self.store.repo().list_tenants_with_active_rules().await {
            Ok(tenants) => tenants,
            Err(e) => {
                tracing::error!(error = %e, "Failed to list tenants with active rules");
                return tick;
            }
        };

        for tenant_id in tenants {
            if ctx.is_cancelled() {
                break;
            }
            match self.evaluate_tenant(tenant_id).await {
                Ok(summary) => {
                    tick.tenants += 1;
                    tick.summary.merge(summary);
                }
                Err(e) => tracing::error!(tenant_id = %tenant_id, error = %e, "Alert evaluation failed"),
            }
        }
        AlertMetrics::add(&self.metrics.ticks, 1);
        tick
    }

    pub async fn evaluate_tenant(&self, tenant_id: TenantId) -> PulseResult<EvaluationSummary> {
        self.evaluate_tenant_at(tenant_id, Utc::now()).await
    }

    /// Evaluate every active rule of a tenant as of `now`.
    pub async fn evaluate_tenant_at(
        &self,
        tenant_id: TenantId,
        now: Timestamp,
    ) -> PulseResult<EvaluationSummary> {
        let repo = self.store.repo();
        let rules = repo.list_alert_rules(tenant_id, true).await?;
        if rules.is_empty() {
            return Ok(EvaluationSummary::default());
        }
        let candidates = repo.list_customers_with_scores(tenant_id).await?;
        Ok(self.evaluate_rules(&rules, &candidates, now).await)
    }

    /// Evaluate every active rule for one customer. Invoked after the
    /// customer is rescored.
    pub async fn evaluate_for_customer(
        &self,
        customer_id: CustomerId,
        tenant_id: TenantId,
    ) -> PulseResult<EvaluationSummary> {
        let repo = self.store.repo();
        let rules = repo.list_alert_rules(tenant_id, true).await?;
        if rules.is_empty() {
            return Ok(EvaluationSummary::default());
        }
        let customer = repo.get_customer(tenant_id, customer_id).await?;
        if customer.is_deleted() {
            return Err(PulseError::not_found("customer", customer_id));
        }
        let score = repo.get_current_score(tenant_id, customer_id).await?;
        let candidates = [CustomerWithScore { customer, score }];
        Ok(self.evaluate_rules(&rules, &candidates, Utc::now()).await)
    }

    /// Apply a batch of email delivery events.
    pub async fn ingest_delivery_events(&self, events: &[DeliveryEvent]) -> PulseResult<IngestSummary> {
        let summary = ingest_delivery_events(self.store.repo(), events).await?;
        AlertMetrics::add(&self.metrics.delivery_events, summary.applied as u64);
        if summary.applied > 0 {
            tracing::debug!(
                applied = summary.applied,
                ignored = summary.ignored,
                unmatched = summary.unmatched,
                "Delivery events ingested"
            );
        }
        Ok(summary)
    }

    async fn evaluate_rules(
        &self,
        rules: &[AlertRule],
        candidates: &[CustomerWithScore],
        now: Timestamp,
    ) -> EvaluationSummary {
        let repo = self.store.repo();
        let mut summary = EvaluationSummary::default();
        for rule in rules {
            summary.rules += 1;
            AlertMetrics::add(&self.metrics.rules_evaluated, 1);
            let window = cooldown(rule, self.settings.default_cooldown_hours);
            let matches = match evaluate_rule(repo, rule, candidates, now, window).await {
                Ok(matches) => matches,
                Err(e) => {
                    tracing::warn!(
                        tenant_id = %rule.tenant_id,
                        rule_id = %rule.id,
                        error = %e,
                        "Rule evaluation failed"
                    );
                    continue;
                }
            };
            for m in &matches {
                let key = (rule.id, m.customer_id);
                let guard = self.locks.acquire(key).await;
                let processed = self.process_match(rule, m, now).await;
                drop(guard);
                self.locks.release(key);
                let outcome = match processed {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        tracing::error!(
                            tenant_id = %rule.tenant_id,
                            rule_id = %rule.id,
                            customer_id = %m.customer_id,
                            error = %e,
                            "Failed to process alert"
                        );
                        MatchOutcome::Failed
                    }
                };
                summary.record(outcome);
            }
        }
        summary
    }

    async fn process_match(&self, rule: &AlertRule, m: &AlertMatch, now: Timestamp) -> PulseResult<MatchOutcome> {
        let repo = self.store.repo();
        let tenant_id = rule.tenant_id;

        let cooldown = cooldown(rule, self.settings.default_cooldown_hours);
        if let Some(last) = repo.get_last_alert(tenant_id, rule.id, Some(m.customer_id)).await? {
            if last.created_at + cooldown > now {
                AlertMetrics::add(&self.metrics.cooldown_suppressed, 1);
                tracing::trace!(rule_id = %rule.id, customer_id = %m.customer_id, "Alert in cooldown");
                return Ok(MatchOutcome::CooledDown);
            }
        }

        let recipients = self.resolve_recipients(repo, rule).await?;
        let reachable = match rule.channel {
            AlertChannel::Email => recipients.iter().any(|r| r.email_allowed),
            AlertChannel::InApp => recipients.iter().any(|r| r.in_app_allowed),
        };
        if !reachable {
            AlertMetrics::add(&self.metrics.preference_suppressed, 1);
            tracing::debug!(
                rule_id = %rule.id,
                customer_id = %m.customer_id,
                "Every recipient opted out of this alert"
            );
            return Ok(MatchOutcome::Suppressed);
        }

        let trigger_data = serde_json::to_value(&m.data)
            .map_err(|e| PulseError::validation("trigger_data", e.to_string()))?;
        let mut entry = AlertHistory::pending(rule, Some(m.customer_id), trigger_data, now);
        repo.insert_alert_history(&entry).await?;
        let email = render(&rule.name, &m.data);

        if rule.channel == AlertChannel::Email {
            for recipient in recipients.iter().filter(|r| r.email_allowed) {
                let message = EmailMessage {
                    to: recipient.email.clone(),
                    subject: email.subject.clone(),
                    html: email.html.clone(),
                    text: email.text.clone(),
                    tags: vec![
                        ("alert_id".into(), entry.id.to_string()),
                        ("rule_id".into(), rule.id.to_string()),
                    ],
                };
                match send_with_retry(
                    self.sender.as_ref(),
                    &message,
                    self.settings.max_send_attempts,
                    self.settings.retry_base_delay,
                )
                .await
                {
                    Ok(message_id) => {
                        AlertMetrics::add(&self.metrics.emails_sent, 1);
                        entry.provider_message_id.get_or_insert(message_id);
                    }
                    Err(e) => {
                        let failure = AlertError::DeliveryFailed {
                            recipient: recipient.email.clone(),
                            reason: e.to_string(),
                        };
                        entry.status = AlertStatus::Failed;
                        entry.error_message = Some(failure.to_string());
                        repo.update_alert_history(&entry).await?;
                        AlertMetrics::add(&self.metrics.alerts_failed, 1);
                        tracing::warn!(
                            tenant_id = %tenant_id,
                            rule_id = %rule.id,
                            customer_id = %m.customer_id,
                            error = %e,
                            "Alert delivery failed"
                        );
                        return Ok(MatchOutcome::Failed);
                    }
                }
            }
        }

        entry.status = AlertStatus::Sent;
        repo.update_alert_history(&entry).await?;

        for recipient in recipients.iter().filter(|r| r.in_app_allowed) {
            let Some(user) = &recipient.user else { continue };
            let notification = Notification {
                id: NotificationId::now_v7(),
                user_id: user.id,
                tenant_id,
                notification_type: format!("alert.{}", rule.trigger_type),
                title: email.subject.clone(),
                message: email.text.lines().next().unwrap_or_default().to_string(),
                data: json!({
                    "alert_id": entry.id,
                    "rule_id": rule.id,
                    "customer_id": m.customer_id,
                    "trigger": entry.trigger_data,
                }),
                read_at: None,
                created_at: now,
            };
            repo.insert_notification(&notification).await?;
            AlertMetrics::add(&self.metrics.notifications_created, 1);
        }

        AlertMetrics::add(&self.metrics.alerts_sent, 1);
        tracing::info!(
            tenant_id = %tenant_id,
            rule_id = %rule.id,
            customer_id = %m.customer_id,
            trigger = %rule.trigger_type,
            "Alert sent"
        );
        Ok(MatchOutcome::Sent)
    }

    async fn resolve_recipients(&self, repo: &dyn Repository, rule: &AlertRule) -> PulseResult<Vec<Recipient>> {
        let mut seen = HashSet::new();
        let mut recipients = Vec::with_capacity(rule.recipients.len());
        for email in &rule.recipients {
            if !seen.insert(email.trim().to_lowercase()) {
                continue;
            }
            let user = repo.find_user_by_email(rule.tenant_id, email).await?;
            let (email_allowed, in_app_allowed) = match &user {
                None => (true, false),
                Some(user) => {
                    let pref = repo
                        .get_notification_preference(rule.tenant_id, user.id)
                        .await?
                        .unwrap_or_else(|| NotificationPreference::defaults(user.id, rule.tenant_id));
                    (pref.allows_email(rule.id), pref.allows_in_app(rule.id))
                }
            };
            recipients.push(Recipient {
                email: email.clone(),
                user,
                email_allowed,
                in_app_allowed,
            });
        }
        Ok(recipients)
    }
}

#[async_trait]
impl ScoreCalculatedHook for AlertEngine {
    async fn score_calculated(&self, tenant_id: TenantId, customer_id: CustomerId) {
        match self.evaluate_for_customer(customer_id, tenant_id).await {
            Ok(summary) if summary.matched > 0 => tracing::debug!(
                tenant_id = %tenant_id,
                customer_id = %customer_id,
                sent = summary.sent,
                cooled_down = summary.cooled_down,
                "Evaluated alerts after rescoring"
            ),
            Ok(_) => {}
            Err(e) => tracing::warn!(
                tenant_id = %tenant_id,
                customer_id = %customer_id,
                error = %e,
                "Post-score alert evaluation failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_records_outcomes() {
        let mut summary = EvaluationSummary::default();
        summary.record(MatchOutcome::Sent);
        summary.record(MatchOutcome::CooledDown);
        summary.record(MatchOutcome::Suppressed);
        assert_eq!(summary.matched, 3);
        assert_eq!(summary.sent, 1);
        assert_eq!(summary.cooled_down, 1);
        assert_eq!(summary.suppressed, 1);

        let mut total = EvaluationSummary { rules: 2, ..Default::default() };
        total.merge(summary);
        assert_eq!(total.rules, 2);
        assert_eq!(total.matched, 3);
    }

    #[test]
    fn test_quiet_tick() {
        assert!(AlertTick::default().is_quiet());
    }
}
