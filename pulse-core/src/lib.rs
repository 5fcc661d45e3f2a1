//! Pulse Core - Entity Types
//!
//! Data structures, error taxonomy and configuration shared by every Pulse
//! crate. No I/O lives here.

pub mod config;
pub mod constants;
pub mod context;
pub mod entities;
pub mod enums;
pub mod error;
pub mod event;
pub mod hooks;
pub mod identity;
pub mod metadata;

pub use config::{parse_hex_key, EmailConfig, ProviderCredentials, PulseConfig};
pub use context::OpContext;
pub use entities::*;
pub use enums::*;
pub use error::{
    AlertError, ConfigError, ErrorKind, IntegrationError, PulseError, PulseResult, ScoringError,
    StorageError, ValidationError,
};
pub use event::{event_types, TimelineEvent};
pub use hooks::{CustomerChangeHook, ScoreCalculatedHook, SyncCompletedHook};
pub use identity::*;
pub use metadata::{ConnectionMetadata, CustomerMetadata, JsonMap};
