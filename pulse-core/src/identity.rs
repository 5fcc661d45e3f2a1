//! Identity types for Pulse entities

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Timestamp type using UTC timezone.
pub type Timestamp = DateTime<Utc>;

/// Generate a new UUIDv7 (timestamp-sortable).
pub fn new_entity_id() -> Uuid {
    Uuid::now_v7()
}

/// Declares a strongly-typed UUID newtype so ids of different entities
/// cannot be swapped by accident.
macro_rules! define_entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new timestamp-sortable id.
            pub fn now_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }

            pub fn nil() -> Self {
                Self(Uuid::nil())
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

define_entity_id!(
    /// Tenant identifier. Every row outside the tenant table carries one.
    TenantId
);
define_entity_id!(
    /// Operator (user profile) identifier.
    UserId
);
define_entity_id!(
    /// Integration connection identifier.
    ConnectionId
);
define_entity_id!(
    /// Customer identifier.
    CustomerId
);
define_entity_id!(
    /// Customer timeline event identifier.
    CustomerEventId
);
define_entity_id!(
    /// Alert rule identifier.
    AlertRuleId
);
define_entity_id!(
    /// Alert history row identifier.
    AlertHistoryId
);
define_entity_id!(
    /// In-app notification identifier.
    NotificationId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_parse_and_display() {
        let id = TenantId::now_v7();
        let parsed: TenantId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_time_ordered() {
        let a = CustomerId::now_v7();
        let b = CustomerId::now_v7();
        assert!(a <= b);
    }

    #[test]
    fn test_id_serializes_transparently() {
        let id = AlertRuleId::from_uuid(Uuid::nil());
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"00000000-0000-0000-0000-000000000000\"");
    }
}
