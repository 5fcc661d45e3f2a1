//! Pulse Sync - Staged provider sync
//!
//! Drives the integration adapters on a schedule: billing pulls customers,
//! subscriptions and charges then recomputes MRR; CRM pulls contacts, deals
//! and companies then enriches and deduplicates; support pulls contacts and
//! conversations then deduplicates.

pub mod config;
pub mod dedup;
pub mod enrich;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod scheduler;
pub mod stage;

pub use config::SyncConfig;
pub use dedup::{dedup_tenant, plan_merge, MergePlan};
pub use enrich::enrich_companies;
pub use metrics::{SyncMetrics, SyncMetricsSnapshot};
pub use orchestrator::{SyncMode, SyncOrchestrator, SyncOutcome, SyncReport, TickSummary};
pub use registry::{ProgressRegistry, TenantLocks};
pub use scheduler::{sync_cycle, sync_scheduler_task};
pub use stage::{stages_for, Stage};
