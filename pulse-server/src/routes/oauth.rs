//! OAuth connect flow. The callback stores the connection; the next sync
//! tick picks it up.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use pulse_core::{Provider, TenantId};
use pulse_integrations::IntegrationAdapter;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn adapter_for(state: &AppState, provider: &str) -> ApiResult<Arc<dyn IntegrationAdapter>> {
    let provider: Provider = provider
        .parse()
        .map_err(|_| ApiError::not_found(format!("unknown provider: {}", provider)))?;
    state
        .adapter(provider)
        .cloned()
        .ok_or_else(|| ApiError::not_found(format!("{} is not configured", provider)))
}

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    pub tenant_id: TenantId,
}

/// GET /oauth/:provider/connect?tenant_id=
pub async fn connect(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<ConnectParams>,
) -> ApiResult<Json<Value>> {
    let adapter = adapter_for(&state, &provider)?;
    state.store.repo().get_tenant(params.tenant_id).await?;
    let url = adapter.credentials().connect_url(params.tenant_id);
    Ok(Json(json!({"url": url})))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// GET /oauth/:provider/callback?code=&state=
pub async fn callback(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    Query(params): Query<CallbackParams>,
) -> ApiResult<Json<Value>> {
    let adapter = adapter_for(&state, &provider)?;
    if let Some(error) = params.error {
        return Err(ApiError::bad_request(format!("authorization declined: {}", error)));
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return Err(ApiError::bad_request("code and state are required"));
    };
    let tenant_id: TenantId = oauth_state
        .split_once(':')
        .and_then(|(tenant, _)| tenant.parse().ok())
        .ok_or_else(|| ApiError::bad_request("invalid OAuth state parameter"))?;

    let connection = adapter
        .credentials()
        .exchange_code(tenant_id, &code, &oauth_state)
        .await?;
    tracing::info!(
        tenant_id = %tenant_id,
        provider = %connection.provider,
        "Integration connected"
    );
    Ok(Json(json!({
        "provider": connection.provider.as_db_str(),
        "status": connection.status.as_db_str(),
        "external_account_id": connection.external_account_id,
    })))
}
