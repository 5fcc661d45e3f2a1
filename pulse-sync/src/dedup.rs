//! Email-based customer deduplication.
//!
//! Customers from different providers that share an email are the same
//! account. The oldest row (by `first_seen_at`) stays primary; the others
//! donate whatever the primary lacks and are then soft-deleted, with their
//! timeline and projections re-pointed to the primary.

use pulse_core::{Customer, CustomerId, PulseResult, TenantId, Timestamp};
use pulse_storage::Store;

/// The outcome of merging one email group.
#[derive(Debug, Clone, PartialEq)]
pub struct MergePlan {
    pub primary: Customer,
    pub absorbed: Vec<CustomerId>,
}

/// Plan the merge of one group of customers sharing an email.
///
/// Returns `None` for groups of fewer than two rows.
pub fn plan_merge(group: &[Customer], at: Timestamp) -> Option<MergePlan> {
    let primary_idx = group
        .iter()
        .enumerate()
        .min_by_key(|(_, c)| (c.first_seen_at, c.created_at))
        .map(|(i, _)| i)?;
    if group.len() < 2 {
        return None;
    }

    let mut primary = group[primary_idx].clone();
    let others: Vec<&Customer> = group
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != primary_idx)
        .map(|(_, c)| c)
        .collect();

    for other in &others {
        fill(&mut primary.name, &other.name);
        fill(&mut primary.company_name, &other.company_name);
        fill(&mut primary.currency, &other.currency);
        if other.last_seen_at > primary.last_seen_at {
            primary.last_seen_at = other.last_seen_at;
        }
        primary.metadata.absorb(&other.metadata);
    }

    if primary.mrr_cents <= 0 {
        primary.mrr_cents = others
            .iter()
            .map(|c| c.mrr_cents)
            .max()
            .unwrap_or(0)
            .max(primary.mrr_cents);
    }
    primary.updated_at = at;

    Some(MergePlan {
        primary,
        absorbed: others.iter().map(|c| c.id).collect(),
    })
}

fn fill(target: &mut Option<String>, donor: &Option<String>) {
    let empty = target.as_deref().is_none_or(|s| s.trim().is_empty());
    if empty {
        if let Some(value) = donor.as_deref().filter(|s| !s.trim().is_empty()) {
            *target = Some(value.to_string());
        }
    }
}

/// Merge every email group of `tenant_id`, one transaction per group.
/// Returns the number of rows absorbed into a primary.
pub async fn dedup_tenant(
    store: &dyn Store,
    tenant_id: TenantId,
    at: Timestamp,
) -> PulseResult<usize> {
    let groups = store.repo().find_duplicates_by_email(tenant_id).await?;
    let mut absorbed = 0;
    for group in groups {
        let Some(plan) = plan_merge(&group, at) else {
            continue;
        };
        let tx = store.begin().await?;
        tx.repo()
            .merge_customers(tenant_id, &plan.primary, &plan.absorbed, at)
            .await?;
        tx.commit().await?;
        tracing::debug!(
            tenant_id = %tenant_id,
            primary = %plan.primary.id,
            absorbed = plan.absorbed.len(),
            "Merged duplicate customers"
        );
        absorbed += plan.absorbed.len();
    }
    Ok(absorbed)
}
