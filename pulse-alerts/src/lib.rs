//! Pulse Alerts - Rule-driven customer alerts
//!
//! Operators define rules over health scores and timeline events. Matching
//! `(rule, customer)` pairs outside their cooldown are recorded in alert
//! history and delivered by email and in-app notification, subject to each
//! recipient's preferences. Delivery events from the email provider flow
//! back onto the history rows.

pub mod conditions;
pub mod delivery;
pub mod engine;
pub mod evaluator;
pub mod locks;
pub mod metrics;
pub mod scheduler;
pub mod sender;
pub mod service;
pub mod settings;
pub mod templates;
pub mod validator;

pub use conditions::{cooldown, Trigger};
pub use delivery::{apply_delivery, ingest_delivery_events, DeliveryEvent, DeliveryKind, IngestSummary};
pub use engine::{AlertEngine, AlertTick, EvaluationSummary, MatchOutcome};
pub use evaluator::{display_name, evaluate_rule, AlertMatch, TriggerData};
pub use locks::MatchLocks;
pub use metrics::{AlertMetrics, AlertMetricsSnapshot};
pub use scheduler::alert_scheduler_task;
pub use sender::{send_with_retry, EmailMessage, EmailSender, HttpEmailSender};
pub use service::{AlertRuleService, AlertRuleUpdate, NewAlertRule};
pub use settings::AlertSettings;
pub use templates::{render, RenderedEmail};
pub use validator::validate_rule;
