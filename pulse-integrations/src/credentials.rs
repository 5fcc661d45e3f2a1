//! OAuth credential lifecycle.
//!
//! One [`CredentialManager`] per provider. Tokens are encrypted before they
//! reach the store; plaintext only exists inside the calls below.

use crate::client::ProviderClient;
use crate::crypto::TokenCipher;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use pulse_core::constants::TOKEN_REFRESH_LEEWAY_SECS;
use pulse_core::{
    ConnectionId, ConnectionMetadata, ConnectionStatus, ErrorKind, IntegrationConnection,
    IntegrationError, Provider, ProviderCredentials, PulseError, PulseResult, TenantId, Timestamp,
    ValidationError,
};
use pulse_storage::Store;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Provider OAuth endpoints and client registration.
#[derive(Clone)]
pub struct OAuthSettings {
    pub provider: Provider,
    pub authorize_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub credentials: ProviderCredentials,
}

impl std::fmt::Debug for OAuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthSettings")
            .field("provider", &self.provider)
            .field("authorize_url", &self.authorize_url)
            .field("token_url", &self.token_url)
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl OAuthSettings {
    /// Production endpoints for `provider`.
    pub fn for_provider(provider: Provider, credentials: ProviderCredentials) -> Self {
        let (authorize_url, token_url, scopes): (&str, &str, &[&str]) = match provider {
            Provider::Stripe => (
                "https://connect.stripe.com/oauth/authorize",
                "https://connect.stripe.com/oauth/token",
                &["read_only"],
            ),
            Provider::Hubspot => (
                "https://app.hubspot.com/oauth/authorize",
                "https://api.hubapi.com/oauth/v1/token",
                &[
                    "crm.objects.contacts.read",
                    "crm.objects.companies.read",
                    "crm.objects.deals.read",
                ],
            ),
            Provider::Intercom => (
                "https://app.intercom.com/oauth",
                "https://api.intercom.io/auth/eagle/token",
                &[],
            ),
        };
        Self {
            provider,
            authorize_url: authorize_url.to_string(),
            token_url: token_url.to_string(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            credentials,
        }
    }
}

/// Fields pulled out of a token endpoint response.
#[derive(Debug, Clone, PartialEq)]
struct TokenGrant {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<Timestamp>,
    scopes: Vec<String>,
}

impl TokenGrant {
    fn parse(provider: Provider, body: &Value, now: Timestamp) -> PulseResult<Self> {
        let access_token = body
            .get("access_token")
            .or_else(|| body.get("token"))
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| IntegrationError::invalid_response(provider, "token response has no access_token"))?
            .to_string();
        let refresh_token = body
            .get("refresh_token")
            .and_then(Value::as_str)
            .map(str::to_string);
        let expires_at = body
            .get("expires_in")
            .and_then(Value::as_i64)
            .filter(|secs| *secs > 0)
            .map(|secs| now + Duration::seconds(secs));
        let scopes = match body.get("scope").or_else(|| body.get("scopes")) {
            Some(Value::String(s)) => s.split_whitespace().map(str::to_string).collect(),
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            access_token,
            refresh_token,
            expires_at,
            scopes,
        })
    }
}

/// Issues authorization URLs, trades codes for tokens, and hands out
/// fresh access tokens.
pub struct CredentialManager {
    settings: OAuthSettings,
    store: Arc<dyn Store>,
    cipher: Arc<TokenCipher>,
    client: ProviderClient,
    refresh_locks: DashMap<TenantId, Arc<Mutex<()>>>,
}

impl CredentialManager {
    pub fn new(
        settings: OAuthSettings,
        store: Arc<dyn Store>,
        cipher: Arc<TokenCipher>,
        client: ProviderClient,
    ) -> Self {
        Self {
            settings,
            store,
            cipher,
            client,
            refresh_locks: DashMap::new(),
        }
    }

    pub fn provider(&self) -> Provider {
        self.settings.provider
    }

    pub fn webhook_secret(&self) -> &str {
        &self.settings.credentials.webhook_secret
    }

    /// Authorization URL whose `state` binds the tenant and a nonce.
    pub fn connect_url(&self, tenant_id: TenantId) -> String {
        let nonce = format!("{:032x}", rand::random::<u128>());
        let state = format!("{}:{}", tenant_id, nonce);
        let creds = &self.settings.credentials;
        let mut url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&state={}",
            self.settings.authorize_url,
            urlencoding::encode(&creds.client_id),
            urlencoding::encode(&creds.oauth_redirect_url),
            urlencoding::encode(&state),
        );
        if !self.settings.scopes.is_empty() {
            url.push_str("&scope=");
            url.push_str(&urlencoding::encode(&self.settings.scopes.join(" ")));
        }
        url
    }

    /// Verify `state`, trade `code` for tokens, and store the connection.
    ///
    /// The provider account id must be resolvable; webhooks are routed by it.
    pub async fn exchange_code(
        &self,
        tenant_id: TenantId,
        code: &str,
        state: &str,
    ) -> PulseResult<IntegrationConnection> {
        verify_state(tenant_id, state)?;
        if code.trim().is_empty() {
            return Err(ValidationError::missing("code").into());
        }

        let creds = &self.settings.credentials;
        let fields = vec![
            ("grant_type".to_string(), "authorization_code".to_string()),
            ("code".to_string(), code.to_string()),
            ("redirect_uri".to_string(), creds.oauth_redirect_url.clone()),
            ("client_id".to_string(), creds.client_id.clone()),
            ("client_secret".to_string(), creds.client_secret.clone()),
        ];
        let now = Utc::now();
        let body = self
            .client
            .post_form(&self.settings.token_url, fields)
            .await
            .map_err(|e| self.as_auth_failure(e))?;
        let grant = TokenGrant::parse(self.provider(), &body, now)?;

        let account_id = self
            .resolve_account_id(&body, &grant.access_token)
            .await?
            .ok_or_else(|| {
                ValidationError::invalid(
                    "external_account_id",
                    format!("{} did not identify the connected account", self.provider()),
                )
            })?;

        let existing = self.store.repo().get_connection(tenant_id, self.provider()).await?;
        let connection = IntegrationConnection {
            id: existing
                .as_ref()
                .map(|c| c.id)
                .unwrap_or_else(ConnectionId::now_v7),
            tenant_id,
            provider: self.provider(),
            access_token_ciphertext: self.cipher.encrypt(&grant.access_token)?,
            refresh_token_ciphertext: grant
                .refresh_token
                .as_deref()
                .map(|t| self.cipher.encrypt(t))
                .transpose()?,
            token_expires_at: grant.expires_at,
            external_account_id: Some(account_id),
            scopes: grant.scopes,
            status: ConnectionStatus::Active,
            last_sync_at: existing.as_ref().and_then(|c| c.last_sync_at),
            last_sync_error: None,
            metadata: ConnectionMetadata::default(),
            created_at: existing.as_ref().map(|c| c.created_at).unwrap_or(now),
            updated_at: now,
        };
        self.store.repo().save_connection(&connection).await?;

        tracing::info!(
            tenant_id = %tenant_id,
            provider = %self.provider(),
            account_id = connection.external_account_id.as_deref().unwrap_or_default(),
            "Integration connected"
        );
        Ok(connection)
    }

    /// Current plaintext access token, refreshed first when it expires
    /// within five minutes.
    pub async fn get_access_token(&self, tenant_id: TenantId) -> PulseResult<String> {
        let connection = self.load(tenant_id).await?;
        if !self.needs_refresh(&connection, Utc::now()) {
            return self.decrypt_or_disable(connection, |c| Some(&c.access_token_ciphertext)).await;
        }

        let lock = self
            .refresh_locks
            .entry(tenant_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited.
        let connection = self.load(tenant_id).await?;
        if !self.needs_refresh(&connection, Utc::now()) {
            return self.decrypt_or_disable(connection, |c| Some(&c.access_token_ciphertext)).await;
        }
        self.refresh(connection).await
    }

    pub async fn disconnect(&self, tenant_id: TenantId) -> PulseResult<bool> {
        let removed = self.store.repo().delete_connection(tenant_id, self.provider()).await?;
        self.refresh_locks.remove(&tenant_id);
        if removed {
            tracing::info!(tenant_id = %tenant_id, provider = %self.provider(), "Integration disconnected");
        }
        Ok(removed)
    }

    async fn load(&self, tenant_id: TenantId) -> PulseResult<IntegrationConnection> {
        self.store
            .repo()
            .get_connection(tenant_id, self.provider())
            .await?
            .ok_or_else(|| PulseError::not_found("integration connection", format!("{}/{}", tenant_id, self.provider())))
    }

    fn needs_refresh(&self, connection: &IntegrationConnection, now: Timestamp) -> bool {
        self.provider().tokens_expire()
            && connection
                .token_expires_at
                .is_some_and(|exp| exp <= now + Duration::seconds(TOKEN_REFRESH_LEEWAY_SECS))
    }

    async fn refresh(&self, connection: IntegrationConnection) -> PulseResult<String> {
        let tenant_id = connection.tenant_id;
        let refresh_token = self
            .decrypt_or_disable(connection.clone(), |c| c.refresh_token_ciphertext.as_ref())
            .await?;

        let creds = &self.settings.credentials;
        let fields = vec![
            ("grant_type".to_string(), "refresh_token".to_string()),
            ("refresh_token".to_string(), refresh_token),
            ("client_id".to_string(), creds.client_id.clone()),
            ("client_secret".to_string(), creds.client_secret.clone()),
            ("redirect_uri".to_string(), creds.oauth_redirect_url.clone()),
        ];
        let now = Utc::now();
        let body = self
            .client
            .post_form(&self.settings.token_url, fields)
            .await
            .map_err(|e| self.as_auth_failure(e))?;
        let grant = TokenGrant::parse(self.provider(), &body, now)?;

        let mut updated = connection;
        updated.access_token_ciphertext = self.cipher.encrypt(&grant.access_token)?;
        if let Some(refresh) = grant.refresh_token.as_deref() {
            updated.refresh_token_ciphertext = Some(self.cipher.encrypt(refresh)?);
        }
        updated.token_expires_at = grant.expires_at;
        if !grant.scopes.is_empty() {
            updated.scopes = grant.scopes;
        }
        updated.updated_at = now;
        self.store.repo().save_connection(&updated).await?;

        tracing::debug!(tenant_id = %tenant_id, provider = %self.provider(), "Access token refreshed");
        Ok(grant.access_token)
    }

    /// Decrypt one token field. A missing field is an auth failure; an
    /// undecryptable one puts the connection in `error` so nothing calls
    /// the provider until the tenant re-authorizes.
    async fn decrypt_or_disable<F>(&self, connection: IntegrationConnection, field: F) -> PulseResult<String>
    where
        F: Fn(&IntegrationConnection) -> Option<&String>,
    {
        let Some(sealed) = field(&connection) else {
            return Err(IntegrationError::auth(self.provider(), "no refresh token stored").into());
        };
        match self.cipher.decrypt(sealed) {
            Ok(token) => Ok(token),
            Err(err) => {
                tracing::error!(
                    tenant_id = %connection.tenant_id,
                    provider = %self.provider(),
                    "Stored token could not be decrypted; connection disabled"
                );
                let mut disabled = connection;
                disabled.status = ConnectionStatus::Error;
                disabled.last_sync_error = Some("token decryption failed; re-authorization required".into());
                disabled.updated_at = Utc::now();
                self.store.repo().save_connection(&disabled).await?;
                Err(err)
            }
        }
    }

    /// Token endpoint rejections (non-429 4xx) mean the grant is no good.
    fn as_auth_failure(&self, err: PulseError) -> PulseError {
        match err.kind() {
            ErrorKind::Permanent => IntegrationError::auth(self.provider(), err.to_string()).into(),
            _ => err,
        }
    }

    async fn resolve_account_id(&self, token_body: &Value, access_token: &str) -> PulseResult<Option<String>> {
        match self.provider() {
            Provider::Stripe => Ok(token_body
                .get("stripe_user_id")
                .and_then(Value::as_str)
                .map(str::to_string)),
            Provider::Hubspot => {
                let info = self
                    .client
                    .get(&format!("/oauth/v1/access-tokens/{}", access_token), access_token, &[])
                    .await?;
                Ok(json_id(info.get("hub_id")))
            }
            Provider::Intercom => {
                let me = self.client.get("/me", access_token, &[]).await?;
                Ok(json_id(me.pointer("/app/id_code")))
            }
        }
    }
}

/// Provider ids arrive as either strings or numbers.
pub(crate) fn json_id(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// `state` must be `<tenant>:<nonce>` naming this tenant.
fn verify_state(tenant_id: TenantId, state: &str) -> PulseResult<()> {
    let invalid = || PulseError::validation("state", "invalid OAuth state parameter");
    let (tenant, nonce) = state.split_once(':').ok_or_else(invalid)?;
    if nonce.is_empty() {
        return Err(invalid());
    }
    let parsed: TenantId = tenant.parse().map_err(|_| invalid())?;
    if parsed != tenant_id {
        return Err(invalid());
    }
    Ok(())
}
