//! CRM adapter (HubSpot).

use super::{
    decimal_to_cents, ensure_customer, flexible_time, object_map, soft_delete_customer, str_of,
    AdapterDeps, Applied,
};
use crate::adapter::{emit, IntegrationAdapter, PullRequest, PullSummary, SyncProgress};
use crate::client::ProviderClient;
use crate::credentials::{json_id, CredentialManager};
use crate::signature::verify_hubspot_v3;
use crate::webhook::{InboundWebhook, WebhookEffect, WebhookEnvelope, WebhookOutcome, WebhookPipeline};
use async_trait::async_trait;
use chrono::Utc;
use pulse_core::{
    CompanySummary, ContactSummary, CustomerId, CustomerUpsert, DealSummary, IntegrationError,
    ObjectKind, OpContext, Provider, ProviderCredentials, PulseError, PulseResult, TenantId,
    TimelineEvent,
};
use pulse_storage::{Repository, Store};
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

pub const HUBSPOT_API_BASE: &str = "https://api.hubapi.com";

const PAGE_LIMIT: usize = 100;

const OBJECT_KINDS: &[ObjectKind] = &[ObjectKind::Contacts, ObjectKind::Deals, ObjectKind::Companies];

const CONTACT_PROPERTIES: &[&str] = &[
    "email",
    "firstname",
    "lastname",
    "company",
    "lifecyclestage",
    "associatedcompanyid",
    "lastmodifieddate",
];
const DEAL_PROPERTIES: &[&str] = &["dealname", "dealstage", "amount", "closedate", "hs_lastmodifieddate"];
const COMPANY_PROPERTIES: &[&str] = &["name", "domain", "industry", "hs_lastmodifieddate"];

/// Per-kind API shape.
struct ObjectSpec {
    path: &'static str,
    properties: &'static [&'static str],
    modified_property: &'static str,
    associations: Option<&'static str>,
}

fn spec_for(kind: ObjectKind) -> PulseResult<ObjectSpec> {
    match kind {
        ObjectKind::Contacts => Ok(ObjectSpec {
            path: "/crm/v3/objects/contacts",
            properties: CONTACT_PROPERTIES,
            modified_property: "lastmodifieddate",
            associations: None,
        }),
        ObjectKind::Deals => Ok(ObjectSpec {
            path: "/crm/v3/objects/deals",
            properties: DEAL_PROPERTIES,
            modified_property: "hs_lastmodifieddate",
            associations: Some("contacts"),
        }),
        ObjectKind::Companies => Ok(ObjectSpec {
            path: "/crm/v3/objects/companies",
            properties: COMPANY_PROPERTIES,
            modified_property: "hs_lastmodifieddate",
            associations: None,
        }),
        other => Err(PulseError::validation(
            "object_kind",
            format!("hubspot does not sync {}", other),
        )),
    }
}

pub struct HubspotAdapter {
    store: Arc<dyn Store>,
    client: ProviderClient,
    credentials: CredentialManager,
    pipeline: Arc<WebhookPipeline>,
}

impl HubspotAdapter {
    pub fn new(deps: &AdapterDeps, credentials: ProviderCredentials) -> Self {
        let (client, manager) = deps.wire(Provider::Hubspot, HUBSPOT_API_BASE, credentials);
        Self {
            store: deps.store.clone(),
            client,
            credentials: manager,
            pipeline: deps.pipeline.clone(),
        }
    }

    /// One page: the list endpoint for full pulls, search filtered on the
    /// last-modified property for incremental ones.
    async fn fetch_page(
        &self,
        token: &str,
        spec: &ObjectSpec,
        request: &PullRequest,
        after: Option<&str>,
    ) -> PulseResult<Value> {
        match request.since {
            None => {
                let mut query = vec![
                    ("limit", PAGE_LIMIT.to_string()),
                    ("properties", spec.properties.join(",")),
                ];
                if let Some(assoc) = spec.associations {
                    query.push(("associations", assoc.to_string()));
                }
                if let Some(after) = after {
                    query.push(("after", after.to_string()));
                }
                self.client.get(spec.path, token, &query).await
            }
            Some(since) => {
                let mut body = json!({
                    "filterGroups": [{
                        "filters": [{
                            "propertyName": spec.modified_property,
                            "operator": "GTE",
                            "value": since.timestamp_millis().to_string(),
                        }]
                    }],
                    "sorts": [{"propertyName": spec.modified_property, "direction": "ASCENDING"}],
                    "properties": spec.properties,
                    "limit": PAGE_LIMIT,
                });
                if let Some(after) = after {
                    body["after"] = json!(after);
                }
                self.client
                    .post_json(&format!("{}/search", spec.path), token, body)
                    .await
            }
        }
    }

    /// Targeted fetch of one object for a webhook notification.
    async fn fetch_object(&self, tenant_id: TenantId, kind: ObjectKind, object_id: &str) -> PulseResult<Value> {
        let spec = spec_for(kind)?;
        let token = self.credentials.get_access_token(tenant_id).await?;
        let mut query = vec![("properties", spec.properties.join(","))];
        if let Some(assoc) = spec.associations {
            query.push(("associations", assoc.to_string()));
        }
        self.client
            .get(&format!("{}/{}", spec.path, object_id), &token, &query)
            .await
    }
}

#[async_trait]
impl IntegrationAdapter for HubspotAdapter {
    fn provider(&self) -> Provider {
        Provider::Hubspot
    }

    fn credentials(&self) -> &CredentialManager {
        &self.credentials
    }

    fn object_kinds(&self) -> &'static [ObjectKind] {
        OBJECT_KINDS
    }

    async fn pull(&self, ctx: &OpContext, request: &PullRequest, progress: &mut SyncProgress) -> PulseResult<PullSummary> {
        let spec = spec_for(request.kind)?;
        let token = self.credentials.get_access_token(request.tenant_id).await?;
        let repo = self.store.repo();
        let mut summary = PullSummary::default();
        let mut after: Option<String> = None;
        loop {
            ctx.check()?;
            let page = self.fetch_page(&token, &spec, request, after.as_deref()).await?;
            let results = page
                .get("results")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            summary.pages += 1;
            progress.page(results.len());

            for object in &results {
                let id = json_id(object.get("id")).unwrap_or_default();
                match apply_object(repo, request.tenant_id, request.kind, object).await {
                    Ok(applied) => {
                        summary.objects += 1;
                        summary.events += applied.events;
                    }
                    Err(err) => {
                        summary.errors += 1;
                        tracing::warn!(
                            tenant_id = %request.tenant_id,
                            kind = %request.kind,
                            object_id = %id,
                            error = %err,
                            "Failed to apply hubspot object"
                        );
                        progress.error(&id, &err);
                    }
                }
                progress.advance();
            }

            after = page
                .pointer("/paging/next/after")
                .and_then(|v| json_id(Some(v)));
            if after.is_none() {
                break;
            }
        }
        Ok(summary)
    }

    /// HubSpot batches notifications; each carries its own `eventId` and
    /// `portalId` and is processed independently.
    async fn handle_webhook(&self, webhook: &InboundWebhook) -> PulseResult<WebhookOutcome> {
        let signature = webhook
            .header("X-HubSpot-Signature-v3")
            .ok_or_else(|| IntegrationError::auth(Provider::Hubspot, "missing X-HubSpot-Signature-v3 header"))?;
        let timestamp = webhook
            .header("X-HubSpot-Request-Timestamp")
            .ok_or_else(|| IntegrationError::auth(Provider::Hubspot, "missing X-HubSpot-Request-Timestamp header"))?;
        verify_hubspot_v3(
            &webhook.method,
            &webhook.uri,
            &webhook.body,
            signature,
            timestamp,
            self.credentials.webhook_secret(),
            Utc::now(),
        )?;

        let payload = webhook.json()?;
        let notifications = match payload {
            Value::Array(items) => items,
            single @ Value::Object(_) => vec![single],
            _ => return Err(PulseError::validation("hubspot.body", "expected a JSON array")),
        };

        let mut outcomes = Vec::with_capacity(notifications.len());
        for notification in notifications {
            let (Some(event_id), Some(portal_id)) = (
                json_id(notification.get("eventId")),
                json_id(notification.get("portalId")),
            ) else {
                tracing::debug!("HubSpot notification without eventId/portalId");
                outcomes.push(WebhookOutcome::Ignored);
                continue;
            };
            let event_type = str_of(&notification, "subscriptionType").unwrap_or_default();
            if object_kind_of(&event_type).is_none() {
                outcomes.push(WebhookOutcome::Ignored);
                continue;
            }
            let Some(connection) = self
                .store
                .repo()
                .find_connection_by_account(Provider::Hubspot, &portal_id)
                .await?
            else {
                tracing::warn!(portal_id = %portal_id, event_id = %event_id, "No connection for hubspot portal");
                outcomes.push(WebhookOutcome::Ignored);
                continue;
            };
            let envelope = WebhookEnvelope {
                provider: Provider::Hubspot,
                tenant_id: connection.tenant_id,
                event_id,
                event_type,
                payload: notification,
            };
            outcomes.push(self.pipeline.process(&envelope, self).await?);
        }
        Ok(WebhookOutcome::merge(outcomes))
    }
}

/// `contact.propertyChange` → contacts, and so on.
fn object_kind_of(subscription_type: &str) -> Option<ObjectKind> {
    match subscription_type.split('.').next()? {
        "contact" => Some(ObjectKind::Contacts),
        "deal" => Some(ObjectKind::Deals),
        "company" => Some(ObjectKind::Companies),
        _ => None,
    }
}

#[async_trait]
impl WebhookEffect for HubspotAdapter {
    async fn apply(&self, repo: &dyn Repository, envelope: &WebhookEnvelope) -> PulseResult<Vec<CustomerId>> {
        let Some(kind) = object_kind_of(&envelope.event_type) else {
            return Ok(Vec::new());
        };
        let object_id = json_id(envelope.payload.get("objectId"))
            .ok_or_else(|| PulseError::validation("hubspot.objectId", "missing object id"))?;

        if envelope.event_type.ends_with(".deletion") {
            if kind != ObjectKind::Contacts {
                return Ok(Vec::new());
            }
            let at = flexible_time(envelope.payload.get("occurredAt")).unwrap_or_else(Utc::now);
            let deleted =
                soft_delete_customer(repo, envelope.tenant_id, Provider::Hubspot, &object_id, at).await?;
            return Ok(deleted.into_iter().collect());
        }

        let object = self.fetch_object(envelope.tenant_id, kind, &object_id).await?;
        let applied = apply_object(repo, envelope.tenant_id, kind, &object).await?;
        Ok(applied.customer.into_iter().collect())
    }
}

// ============================================================================
// OBJECT MAPPING
// ============================================================================

async fn apply_object(repo: &dyn Repository, tenant_id: TenantId, kind: ObjectKind, object: &Value) -> PulseResult<Applied> {
    match kind {
        ObjectKind::Contacts => apply_contact(repo, tenant_id, object).await,
        ObjectKind::Deals => apply_deal(repo, tenant_id, object).await,
        ObjectKind::Companies => apply_company(repo, tenant_id, object).await,
        other => Err(PulseError::validation("object_kind", format!("hubspot does not sync {}", other))),
    }
}

fn properties(object: &Value) -> &Value {
    static EMPTY: Value = Value::Null;
    object.get("properties").unwrap_or(&EMPTY)
}

fn object_id(object: &Value) -> PulseResult<String> {
    json_id(object.get("id")).ok_or_else(|| PulseError::validation("hubspot.id", "missing object id"))
}

fn full_name(props: &Value) -> Option<String> {
    let name = [str_of(props, "firstname"), str_of(props, "lastname")]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ");
    (!name.is_empty()).then_some(name)
}

async fn apply_contact(repo: &dyn Repository, tenant_id: TenantId, object: &Value) -> PulseResult<Applied> {
    let id = object_id(object)?;
    let props = properties(object);
    let now = Utc::now();
    let created = flexible_time(object.get("createdAt")).unwrap_or(now);
    let company_id = json_id(props.get("associatedcompanyid"));
    let name = full_name(props);
    let email = str_of(props, "email");

    let upsert = CustomerUpsert::new(Provider::Hubspot, &id, created)
        .with_name(name.clone())
        .with_email(email.clone())
        .with_company(str_of(props, "company"))
        .with_namespace(json!({
            "lifecycle_stage": str_of(props, "lifecyclestage"),
            "company_id": company_id,
        }));
    let customer = repo.upsert_customer_by_external(tenant_id, &upsert).await?;

    let contact = ContactSummary {
        id: Uuid::now_v7(),
        tenant_id,
        provider: Provider::Hubspot,
        external_id: id,
        customer_id: customer.id,
        email,
        name,
        company_external_id: company_id,
        metadata: object_map(Some(props)),
        updated_at: flexible_time(object.get("updatedAt")).unwrap_or(now),
    };
    repo.upsert_contact(&contact).await?;
    Ok(Applied::customer(customer.id))
}

/// First associated contact, if the response carried associations.
fn associated_contact(object: &Value) -> Option<String> {
    object
        .pointer("/associations/contacts/results")
        .and_then(Value::as_array)?
        .iter()
        .find_map(|assoc| json_id(assoc.get("id")))
}

async fn apply_deal(repo: &dyn Repository, tenant_id: TenantId, object: &Value) -> PulseResult<Applied> {
    let id = object_id(object)?;
    let props = properties(object);
    let now = Utc::now();
    let updated_at = flexible_time(props.get("hs_lastmodifieddate"))
        .or_else(|| flexible_time(object.get("updatedAt")))
        .unwrap_or(now);

    let customer = match associated_contact(object) {
        Some(contact_id) => Some(ensure_customer(repo, tenant_id, Provider::Hubspot, &contact_id, now).await?),
        None => None,
    };
    let mut deal = DealSummary {
        id: Uuid::now_v7(),
        tenant_id,
        provider: Provider::Hubspot,
        external_id: id.clone(),
        customer_id: customer.as_ref().map(|c| c.id),
        name: str_of(props, "dealname"),
        stage: str_of(props, "dealstage"),
        amount_cents: decimal_to_cents(props.get("amount")),
        close_date: flexible_time(props.get("closedate")),
        metadata: object_map(Some(props)),
        updated_at,
    };
    let previous = repo.upsert_deal(&deal).await?;

    // Search results carry no associations; the store kept the link we already had.
    if deal.customer_id.is_none() {
        deal.customer_id = previous.as_ref().and_then(|p| p.customer_id);
    }

    let Some(customer_id) = deal.customer_id else {
        return Ok(Applied::skipped());
    };
    let mut applied = Applied::customer(customer_id);
    match &previous {
        None => {
            let created = flexible_time(object.get("createdAt")).unwrap_or(updated_at);
            let event = TimelineEvent::DealCreated {
                deal_id: id.clone(),
                name: deal.name.clone(),
                stage: deal.stage.clone(),
                amount_cents: deal.amount_cents,
            };
            let appended = emit(repo, tenant_id, customer_id, Provider::Hubspot, format!("{}:created", id), created, &event).await?;
            applied.count(appended);
        }
        Some(prev) => {
            if let Some(stage) = deal.stage.as_ref().filter(|s| prev.stage.as_ref() != Some(*s)) {
                let event = TimelineEvent::DealStageChange {
                    deal_id: id.clone(),
                    previous_stage: prev.stage.clone(),
                    new_stage: stage.clone(),
                };
                let external_id = format!("{}:stage:{}@{}", id, stage, updated_at.timestamp_millis());
                let appended = emit(repo, tenant_id, customer_id, Provider::Hubspot, external_id, updated_at, &event).await?;
                applied.count(appended);
            }
        }
    }
    Ok(applied)
}

async fn apply_company(repo: &dyn Repository, tenant_id: TenantId, object: &Value) -> PulseResult<Applied> {
    let id = object_id(object)?;
    let props = properties(object);
    let company = CompanySummary {
        id: Uuid::now_v7(),
        tenant_id,
        provider: Provider::Hubspot,
        external_id: id,
        name: str_of(props, "name"),
        domain: str_of(props, "domain"),
        metadata: object_map(Some(props)),
        updated_at: flexible_time(props.get("hs_lastmodifieddate")).unwrap_or_else(Utc::now),
    };
    repo.upsert_company(&company).await?;
    Ok(Applied::skipped())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_kind_of() {
        assert_eq!(object_kind_of("contact.propertyChange"), Some(ObjectKind::Contacts));
        assert_eq!(object_kind_of("deal.creation"), Some(ObjectKind::Deals));
        assert_eq!(object_kind_of("company.deletion"), Some(ObjectKind::Companies));
        assert_eq!(object_kind_of("ticket.creation"), None);
        assert_eq!(object_kind_of(""), None);
    }

    #[test]
    fn test_full_name() {
        assert_eq!(full_name(&json!({"firstname": "Ada", "lastname": "Lovelace"})).as_deref(), Some("Ada Lovelace"));
        assert_eq!(full_name(&json!({"lastname": "Lovelace"})).as_deref(), Some("Lovelace"));
        assert_eq!(full_name(&json!({})), None);
    }

    #[test]
    fn test_associated_contact() {
        let deal = json!({"associations": {"contacts": {"results": [{"id": "501", "type": "deal_to_contact"}]}}});
        assert_eq!(associated_contact(&deal).as_deref(), Some("501"));
        assert_eq!(associated_contact(&json!({})), None);
    }

    #[test]
    fn test_spec_rejects_foreign_kind() {
        assert!(spec_for(ObjectKind::Charges).is_err());
        assert_eq!(spec_for(ObjectKind::Deals).unwrap().associations, Some("contacts"));
    }

    #[tokio::test]
    async fn test_search_result_keeps_link_and_emits_stage_change() {
        use pulse_core::event_types::{DEAL_CREATED, DEAL_STAGE_CHANGE};
        use pulse_storage::{EventQuery, MemoryStore};

        let store = MemoryStore::new();
        let tenant = TenantId::now_v7();
        let listed = json!({
            "id": "9001",
            "properties": {"dealname": "Expansion", "dealstage": "appointmentscheduled", "amount": "1200"},
            "associations": {"contacts": {"results": [{"id": "c1", "type": "deal_to_contact"}]}},
            "updatedAt": "2024-03-01T00:00:00Z"
        });
        let searched = json!({
            "id": "9001",
            "properties": {"dealname": "Expansion", "dealstage": "closedwon", "amount": "1200"},
            "updatedAt": "2024-03-05T00:00:00Z"
        });

        let first = apply_deal(store.repo(), tenant, &listed).await.unwrap();
        let second = apply_deal(store.repo(), tenant, &searched).await.unwrap();
        assert_eq!(second.customer, first.customer);
        assert_eq!(second.events, 1);

        let events = store.repo().list_events(tenant, &EventQuery::default()).await.unwrap();
        let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
        assert_eq!(types, vec![DEAL_CREATED, DEAL_STAGE_CHANGE]);
        assert_eq!(events[1].data["previous_stage"], "appointmentscheduled");
        assert_eq!(events[1].data["new_stage"], "closedwon");
    }
}
