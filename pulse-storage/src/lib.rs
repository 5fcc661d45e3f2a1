//! Pulse Storage - Tenant-scoped persistence
//!
//! [`Repository`] is the typed surface every other component talks to.
//! Two backends implement it: [`PgStore`] for production and
//! [`MemoryStore`] for tests and local runs.

pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::{MemoryRepo, MemoryStore};
pub use postgres::{DbConfig, PgRepo, PgStore};
pub use repository::{EventQuery, Repository, Store, Transaction};
