use axum::{extract::State, Json};
use pulse_core::Provider;
use serde_json::{json, Value};

use crate::state::AppState;

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<&str> = state.adapters.keys().map(Provider::as_db_str).collect();
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "providers": providers,
    }))
}
