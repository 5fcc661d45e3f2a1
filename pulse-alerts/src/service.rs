//! Alert rule CRUD. Every write runs the validator first.

use crate::validator::validate_rule;
use chrono::Utc;
use pulse_core::{
    AlertChannel, AlertConditions, AlertRule, AlertRuleId, PulseError, PulseResult, TenantId,
    TriggerType, UserId,
};
use pulse_storage::Store;
use serde::Deserialize;
use std::sync::Arc;

/// Fields of a new rule.
#[derive(Debug, Clone, Deserialize)]
pub struct NewAlertRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub trigger_type: TriggerType,
    #[serde(default)]
    pub conditions: AlertConditions,
    #[serde(default)]
    pub channel: AlertChannel,
    pub recipients: Vec<String>,
    #[serde(default)]
    pub created_by: Option<UserId>,
}

/// Partial update; absent fields keep their value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlertRuleUpdate {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub conditions: Option<AlertConditions>,
    pub channel: Option<AlertChannel>,
    pub recipients: Option<Vec<String>>,
    pub is_active: Option<bool>,
}

pub struct AlertRuleService {
    store: Arc<dyn Store>,
}

impl AlertRuleService {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, tenant_id: TenantId, new: NewAlertRule) -> PulseResult<AlertRule> {
        let now = Utc::now();
        let rule = AlertRule {
            id: AlertRuleId::now_v7(),
            tenant_id,
            name: new.name.trim().to_string(),
            description: new.description,
            trigger_type: new.trigger_type,
            conditions: new.conditions,
            channel: new.channel,
            recipients: new.recipients,
            is_active: true,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        };
        validate_rule(&rule)?;
        self.store.repo().save_alert_rule(&rule).await?;
        tracing::info!(
            tenant_id = %tenant_id,
            rule_id = %rule.id,
            trigger = %rule.trigger_type,
            "Alert rule created"
        );
        Ok(rule)
    }

    pub async fn update(
        &self,
        tenant_id: TenantId,
        rule_id: AlertRuleId,
        update: AlertRuleUpdate,
    ) -> PulseResult<AlertRule> {
        let repo = self.store.repo();
        let mut rule = repo.get_alert_rule(tenant_id, rule_id).await?;
        if let Some(name) = update.name {
            rule.name = name.trim().to_string();
        }
        if let Some(description) = update.description {
            rule.description = description;
        }
        if let Some(conditions) = update.conditions {
            rule.conditions = conditions;
        }
        if let Some(channel) = update.channel {
            rule.channel = channel;
        }
        if let Some(recipients) = update.recipients {
            rule.recipients = recipients;
        }
        if let Some(is_active) = update.is_active {
            rule.is_active = is_active;
        }
        rule.updated_at = Utc::now();
        validate_rule(&rule)?;
        repo.save_alert_rule(&rule).await?;
        tracing::info!(tenant_id = %tenant_id, rule_id = %rule_id, "Alert rule updated");
        Ok(rule)
    }

    pub async fn delete(&self, tenant_id: TenantId, rule_id: AlertRuleId) -> PulseResult<()> {
        if !self.store.repo().delete_alert_rule(tenant_id, rule_id).await? {
            return Err(PulseError::not_found("alert rule", rule_id));
        }
        tracing::info!(tenant_id = %tenant_id, rule_id = %rule_id, "Alert rule deleted");
        Ok(())
    }

    pub async fn get(&self, tenant_id: TenantId, rule_id: AlertRuleId) -> PulseResult<AlertRule> {
        self.store.repo().get_alert_rule(tenant_id, rule_id).await
    }

    pub async fn list(&self, tenant_id: TenantId, active_only: bool) -> PulseResult<Vec<AlertRule>> {
        self.store.repo().list_alert_rules(tenant_id, active_only).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::ErrorKind;
    use pulse_storage::MemoryStore;
    use serde_json::json;

    fn new_rule() -> NewAlertRule {
        serde_json::from_value(json!({
            "name": " Big drops ",
            "trigger_type": "score_drop",
            "conditions": {"points": 15, "days": 7},
            "recipients": ["cs@acme.io"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_create_validates_and_persists() {
        let service = AlertRuleService::new(Arc::new(MemoryStore::new()));
        let tenant = TenantId::now_v7();

        let rule = service.create(tenant, new_rule()).await.unwrap();
        assert_eq!(rule.name, "Big drops");
        assert_eq!(rule.channel, AlertChannel::Email);
        assert_eq!(service.get(tenant, rule.id).await.unwrap(), rule);

        let mut bad = new_rule();
        bad.recipients.clear();
        let err = service.create(tenant, bad).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(service.list(tenant, false).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_rejects_invalid_change() {
        let service = AlertRuleService::new(Arc::new(MemoryStore::new()));
        let tenant = TenantId::now_v7();
        let rule = service.create(tenant, new_rule()).await.unwrap();

        let update = AlertRuleUpdate {
            conditions: Some(AlertConditions {
                threshold: Some(50),
                ..Default::default()
            }),
            ..Default::default()
        };
        let err = service.update(tenant, rule.id, update).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        let paused = service
            .update(
                tenant,
                rule.id,
                AlertRuleUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!paused.is_active);
        assert!(service.list(tenant, true).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_rule() {
        let service = AlertRuleService::new(Arc::new(MemoryStore::new()));
        let tenant = TenantId::now_v7();
        let rule = service.create(tenant, new_rule()).await.unwrap();

        service.delete(tenant, rule.id).await.unwrap();
        let err = service.delete(tenant, rule.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
