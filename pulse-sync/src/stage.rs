//! Per-provider sync pipelines.

use pulse_core::{ObjectKind, Provider};
use std::fmt;

/// One step of a provider pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Page one object kind through the adapter.
    Pull(ObjectKind),
    /// Recompute MRR from stored subscriptions.
    RecomputeMrr,
    /// Copy company details onto CRM contacts' customers.
    EnrichCompanies,
    /// Merge customers sharing an email.
    Dedup,
}

impl Stage {
    /// Step name reported through [`pulse_integrations::SyncProgress`].
    pub fn name(&self) -> &'static str {
        match self {
            Stage::Pull(kind) => kind.as_db_str(),
            Stage::RecomputeMrr => "mrr_recompute",
            Stage::EnrichCompanies => "enrichment",
            Stage::Dedup => "dedup",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

const BILLING: &[Stage] = &[
    Stage::Pull(ObjectKind::Customers),
    Stage::Pull(ObjectKind::Subscriptions),
    Stage::Pull(ObjectKind::Charges),
    Stage::RecomputeMrr,
];

const CRM: &[Stage] = &[
    Stage::Pull(ObjectKind::Contacts),
    Stage::Pull(ObjectKind::Deals),
    Stage::Pull(ObjectKind::Companies),
    Stage::EnrichCompanies,
    Stage::Dedup,
];

const SUPPORT: &[Stage] = &[
    Stage::Pull(ObjectKind::Contacts),
    Stage::Pull(ObjectKind::Conversations),
    Stage::Dedup,
];

/// Stages run, in order, for one provider's sync job.
pub fn stages_for(provider: Provider) -> &'static [Stage] {
    match provider {
        Provider::Stripe => BILLING,
        Provider::Hubspot => CRM,
        Provider::Intercom => SUPPORT,
    }
}
