//! Pulse Scoring - Customer health scores
//!
//! Five factors each map one signal to [0, 1]. Present factors are combined
//! with the tenant's weights renormalized over what is present, rounded to
//! an integer in [0, 100] and banded into a risk level. Every calculation
//! is written as the current score plus a history snapshot, and notable
//! changes land on the customer timeline.

pub mod combine;
pub mod detector;
pub mod engine;
pub mod factors;
pub mod metrics;
pub mod scheduler;
pub mod settings;

pub use combine::{combine, Combined};
pub use detector::{event_key, ChangeDetector};
pub use engine::{validate_scoring_config, ScoringEngine, ScoringTick, TenantRun};
pub use factors::{standard_factors, FactorInput, ScoreFactor, TenantSignals};
pub use metrics::{ScoringMetrics, ScoringMetricsSnapshot};
pub use scheduler::{scoring_cycle, scoring_scheduler_task};
pub use settings::ScoringSettings;
