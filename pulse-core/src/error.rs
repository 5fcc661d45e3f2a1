//! Error types for Pulse operations
//!
//! Every failure surfaced by the core maps onto exactly one [`ErrorKind`],
//! which the surrounding HTTP layer and the schedulers use to decide between
//! retrying, disabling a connection, or reporting to the caller.

use crate::identity::CustomerId;
use std::time::Duration;
use thiserror::Error;

/// Taxonomy every core error maps onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Auth,
    Permission,
    Transient,
    Permanent,
    NoSignal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Auth => "auth",
            ErrorKind::Permission => "permission",
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::NoSignal => "no_signal",
        }
    }

    /// Only transient failures are worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }
}

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Unique constraint violated on {entity}: {reason}")]
    Conflict { entity: &'static str, reason: String },

    #[error("Storage fault: {reason}")]
    Fault { reason: String },
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn fault(reason: impl Into<String>) -> Self {
        StorageError::Fault {
            reason: reason.into(),
        }
    }
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Constraint violation on {constraint}: {reason}")]
    ConstraintViolation { constraint: String, reason: String },
}

impl ValidationError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn missing(field: impl Into<String>) -> Self {
        ValidationError::RequiredFieldMissing {
            field: field.into(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Errors from external provider calls (OAuth, REST pulls, email delivery).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IntegrationError {
    #[error("Authentication with {provider} failed: {reason}")]
    Auth { provider: String, reason: String },

    #[error("Transient failure from {provider}: {reason}")]
    Transient {
        provider: String,
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("Request to {provider} rejected (status {status:?}): {reason}")]
    Permanent {
        provider: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },
}

impl IntegrationError {
    pub fn auth(provider: impl ToString, reason: impl Into<String>) -> Self {
        IntegrationError::Auth {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }

    pub fn transient(provider: impl ToString, reason: impl Into<String>) -> Self {
        IntegrationError::Transient {
            provider: provider.to_string(),
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(provider: impl ToString, status: Option<u16>, reason: impl Into<String>) -> Self {
        IntegrationError::Permanent {
            provider: provider.to_string(),
            status,
            reason: reason.into(),
        }
    }

    pub fn invalid_response(provider: impl ToString, reason: impl Into<String>) -> Self {
        IntegrationError::InvalidResponse {
            provider: provider.to_string(),
            reason: reason.into(),
        }
    }
}

/// Scoring engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ScoringError {
    #[error("No scoring factor produced a value for customer {customer_id}")]
    NoSignal { customer_id: CustomerId },

    #[error("Factor {factor} failed: {reason}")]
    FactorFailed { factor: String, reason: String },
}

/// Alert engine errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlertError {
    #[error("Invalid alert rule: {reason}")]
    InvalidRule { reason: String },

    #[error("Delivery to {recipient} failed: {reason}")]
    DeliveryFailed { recipient: String, reason: String },
}

/// Master error type for all Pulse errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PulseError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Integration error: {0}")]
    Integration(#[from] IntegrationError),

    #[error("Scoring error: {0}")]
    Scoring(#[from] ScoringError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Permission denied: {action} on {resource}")]
    PermissionDenied { action: String, resource: String },

    #[error("Token decryption failed: {reason}")]
    Decryption { reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded: {operation}")]
    DeadlineExceeded { operation: String },
}

impl PulseError {
    /// Map this error onto the taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PulseError::Storage(StorageError::NotFound { .. }) => ErrorKind::NotFound,
            PulseError::Storage(StorageError::Conflict { .. }) => ErrorKind::Conflict,
            PulseError::Storage(StorageError::Fault { .. }) => ErrorKind::Transient,
            PulseError::Validation(_) => ErrorKind::Validation,
            PulseError::Config(_) => ErrorKind::Permanent,
            PulseError::Integration(IntegrationError::Auth { .. }) => ErrorKind::Auth,
            PulseError::Integration(IntegrationError::Transient { .. }) => ErrorKind::Transient,
            PulseError::Integration(IntegrationError::Permanent { .. }) => ErrorKind::Permanent,
            PulseError::Integration(IntegrationError::InvalidResponse { .. }) => {
                ErrorKind::Permanent
            }
            PulseError::PermissionDenied { .. } => ErrorKind::Permission,
            PulseError::Decryption { .. } => ErrorKind::Permanent,
            PulseError::Scoring(ScoringError::NoSignal { .. }) => ErrorKind::NoSignal,
            PulseError::Scoring(ScoringError::FactorFailed { .. }) => ErrorKind::Transient,
            PulseError::Alert(AlertError::InvalidRule { .. }) => ErrorKind::Validation,
            PulseError::Alert(AlertError::DeliveryFailed { .. }) => ErrorKind::Permanent,
            PulseError::Cancelled | PulseError::DeadlineExceeded { .. } => ErrorKind::Transient,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        PulseError::Validation(ValidationError::invalid(field, reason))
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PulseError::Storage(StorageError::not_found(entity, id))
    }

    pub fn no_signal(customer_id: CustomerId) -> Self {
        PulseError::Scoring(ScoringError::NoSignal { customer_id })
    }

    /// Advisory delay attached to rate-limited responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            PulseError::Integration(IntegrationError::Transient { retry_after, .. }) => *retry_after,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for PulseError {
    fn from(err: serde_json::Error) -> Self {
        PulseError::Validation(ValidationError::invalid("json", err.to_string()))
    }
}

/// Result type alias for Pulse operations.
pub type PulseResult<T> = Result<T, PulseError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kinds() {
        assert_eq!(
            PulseError::from(StorageError::not_found("customer", "c1")).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            PulseError::from(StorageError::Conflict {
                entity: "customer",
                reason: "dup".into()
            })
            .kind(),
            ErrorKind::Conflict
        );
        assert!(PulseError::from(StorageError::fault("pool timeout")).is_retryable());
    }

    #[test]
    fn test_integration_kinds() {
        assert_eq!(
            PulseError::from(IntegrationError::auth("hubspot", "refresh rejected")).kind(),
            ErrorKind::Auth
        );
        assert_eq!(
            PulseError::from(IntegrationError::permanent("stripe", Some(404), "missing")).kind(),
            ErrorKind::Permanent
        );
        let transient = PulseError::from(IntegrationError::Transient {
            provider: "intercom".into(),
            reason: "429".into(),
            retry_after: Some(Duration::from_secs(2)),
        });
        assert!(transient.is_retryable());
        assert_eq!(transient.retry_after(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn test_decryption_and_no_signal_kinds() {
        let err = PulseError::Decryption {
            reason: "tag mismatch".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Permanent);
        assert!(!err.is_retryable());

        let err = PulseError::from(ScoringError::NoSignal {
            customer_id: CustomerId::nil(),
        });
        assert_eq!(err.kind().as_str(), "no_signal");
    }

    #[test]
    fn test_permanent_display_includes_status() {
        let err = IntegrationError::permanent("stripe", Some(400), "bad request");
        let msg = err.to_string();
        assert!(msg.contains("Some(400)"));
        assert!(msg.contains("bad request"));
    }
}
