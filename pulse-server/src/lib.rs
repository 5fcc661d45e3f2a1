//! Pulse Server
//!
//! Hosts the Pulse components in one process: wires the engines over a
//! shared store, runs the sync, scoring and alert schedulers, and serves
//! the inbound surface.
//!
//! Routes:
//! - `POST /webhooks/:provider` signed provider events
//! - `POST /webhooks/email/events` email delivery events
//! - `GET /oauth/:provider/connect`, `GET /oauth/:provider/callback`
//! - `GET /health`, `GET /metrics`

pub mod error;
pub mod routes;
pub mod state;
pub mod telemetry;

pub use error::{status_for, ApiError, ApiResult};
pub use routes::build_router;
pub use state::AppState;
