//! CRM company enrichment.

use pulse_core::{CompanySummary, JsonMap, Provider, PulseResult, TenantId, Timestamp};
use pulse_storage::Repository;
use serde_json::{json, Value};
use std::collections::HashMap;

const NAMESPACE: &str = "hubspot";

/// Copy associated company details onto the customers behind CRM contacts.
/// Returns the number of customers that changed.
pub async fn enrich_companies(
    repo: &dyn Repository,
    tenant_id: TenantId,
    at: Timestamp,
) -> PulseResult<usize> {
    let contacts = repo.list_contacts(tenant_id, Provider::Hubspot).await?;
    let mut companies: HashMap<String, Option<CompanySummary>> = HashMap::new();
    let mut enriched = 0;

    for contact in contacts {
        let Some(company_id) = contact.company_external_id.as_deref() else {
            continue;
        };
        if !companies.contains_key(company_id) {
            let company = repo
                .get_company(tenant_id, Provider::Hubspot, company_id)
                .await?;
            companies.insert(company_id.to_string(), company);
        }
        let Some(Some(company)) = companies.get(company_id) else {
            continue;
        };

        let mut customer = repo.get_customer(tenant_id, contact.customer_id).await?;
        if customer.is_deleted() {
            continue;
        }

        let block = company_block(company);
        let already = customer
            .metadata
            .namespace(NAMESPACE)
            .and_then(|ns| ns.get("company"))
            == Some(&block);
        let needs_name = customer.company_name.is_none() && company.name.is_some();
        if already && !needs_name {
            continue;
        }

        if needs_name {
            customer.company_name = company.name.clone();
        }
        let mut patch = JsonMap::new();
        patch.insert("company".into(), block);
        customer.metadata.merge_into_namespace(NAMESPACE, patch);
        customer.updated_at = at;
        repo.update_customer(&customer).await?;
        enriched += 1;
    }

    if enriched > 0 {
        tracing::debug!(tenant_id = %tenant_id, enriched, "Enriched customers with company data");
    }
    Ok(enriched)
}

fn company_block(company: &CompanySummary) -> Value {
    json!({
        "id": company.external_id,
        "name": company.name,
        "domain": company.domain,
    })
}
