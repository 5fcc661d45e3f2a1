//! Shared defaults.

// ============================================================================
// SYNC
// ============================================================================

/// Default sync scheduler tick (minutes).
pub const DEFAULT_SYNC_INTERVAL_MINUTES: u64 = 15;

/// Deadline for one tenant sync job (minutes).
pub const DEFAULT_SYNC_TIMEOUT_MINUTES: u64 = 10;

/// Rolling window bounding conversation and payment pulls (days).
pub const DEFAULT_SYNC_WINDOW_DAYS: i64 = 90;

/// Consecutive failures after which a connection is disconnected.
pub const MAX_CONSECUTIVE_SYNC_FAILURES: u32 = 5;

/// Access tokens expiring within this many seconds are refreshed first.
pub const TOKEN_REFRESH_LEEWAY_SECS: i64 = 5 * 60;

/// Relative MRR change above which `mrr.changed` is emitted.
pub const MRR_CHANGE_THRESHOLD: f64 = 0.10;

/// Trailing failed payments that emit `payment.consecutive_failures`.
pub const CONSECUTIVE_PAYMENT_FAILURES_ALERT: u32 = 3;

// ============================================================================
// WEBHOOKS
// ============================================================================

/// Signed webhook timestamps older than this are rejected (seconds).
pub const WEBHOOK_REPLAY_WINDOW_SECS: i64 = 5 * 60;

/// Lifetime of the advisory in-memory webhook dedup entries (seconds).
pub const WEBHOOK_MEMORY_DEDUP_SECS: u64 = 10 * 60;

/// Durable webhook idempotency rows older than this are pruned (days).
pub const DEFAULT_WEBHOOK_RETENTION_DAYS: i64 = 30;

// ============================================================================
// SCORING
// ============================================================================

/// Default scoring scheduler tick (minutes).
pub const DEFAULT_SCORING_INTERVAL_MINUTES: u64 = 60;

/// Concurrent calculation workers per tenant.
pub const DEFAULT_SCORING_WORKERS: usize = 5;

/// Score history retention (days).
pub const DEFAULT_SCORE_HISTORY_RETENTION_DAYS: i64 = 365;

/// Minimum |Δ| that emits `score.changed`.
pub const DEFAULT_SIGNIFICANT_SCORE_DELTA: i32 = 10;

pub const DEFAULT_GREEN_THRESHOLD: i32 = 70;
pub const DEFAULT_YELLOW_THRESHOLD: i32 = 40;

/// Allowed deviation of a tenant's weight sum from 1.0.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.001;

pub const FACTOR_PAYMENT_RECENCY: &str = "payment_recency";
pub const FACTOR_MRR_TREND: &str = "mrr_trend";
pub const FACTOR_FAILED_PAYMENTS: &str = "failed_payments";
pub const FACTOR_SUPPORT_TICKETS: &str = "support_tickets";
pub const FACTOR_ENGAGEMENT: &str = "engagement";

/// Weights used when a tenant has no scoring config yet.
pub const DEFAULT_FACTOR_WEIGHTS: &[(&str, f64)] = &[
    (FACTOR_PAYMENT_RECENCY, 0.3),
    (FACTOR_MRR_TREND, 0.2),
    (FACTOR_FAILED_PAYMENTS, 0.2),
    (FACTOR_SUPPORT_TICKETS, 0.15),
    (FACTOR_ENGAGEMENT, 0.15),
];

// ============================================================================
// ALERTS
// ============================================================================

/// Default alert scheduler tick (minutes).
pub const DEFAULT_ALERT_INTERVAL_MINUTES: u64 = 5;

pub const DEFAULT_ALERT_COOLDOWN_HOURS: i64 = 24;
pub const DEFAULT_SCORE_BELOW_THRESHOLD: i32 = 40;
pub const DEFAULT_SCORE_DROP_POINTS: i32 = 10;
pub const DEFAULT_SCORE_DROP_DAYS: i32 = 7;

/// Attempts per recipient before an email send is given up.
pub const EMAIL_SEND_MAX_ATTEMPTS: u32 = 3;

/// Base backoff between email attempts (milliseconds); doubles per attempt.
pub const EMAIL_RETRY_BASE_DELAY_MS: u64 = 1_000;
