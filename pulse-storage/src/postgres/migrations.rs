//! Embedded schema migrations.
//!
//! Applied in order inside one transaction per migration; the version
//! ledger lives in `schema_migrations`.

use super::{db_err, pool_err};
use deadpool_postgres::Pool;
use pulse_core::PulseResult;

/// `(version, name, sql)` in application order.
pub const MIGRATIONS: &[(i32, &str, &str)] = &[
    (1, "tenants_and_users", V1_TENANTS),
    (2, "integration_connections", V2_CONNECTIONS),
    (3, "customers_and_timeline", V3_CUSTOMERS),
    (4, "provider_projections", V4_PROJECTIONS),
    (5, "health_scores", V5_SCORES),
    (6, "alerting", V6_ALERTS),
    (7, "webhook_events", V7_WEBHOOKS),
];

const LEDGER: &str = "
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INT PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
);";

const V1_TENANTS: &str = "
CREATE TABLE tenants (
    id UUID PRIMARY KEY,
    name TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    deleted_at TIMESTAMPTZ
);

CREATE TABLE users (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    email TEXT NOT NULL,
    name TEXT,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE UNIQUE INDEX users_tenant_email ON users (tenant_id, lower(email));
";

const V2_CONNECTIONS: &str = "
CREATE TABLE integration_connections (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    access_token_ciphertext TEXT NOT NULL,
    refresh_token_ciphertext TEXT,
    token_expires_at TIMESTAMPTZ,
    external_account_id TEXT,
    scopes TEXT[] NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    last_sync_at TIMESTAMPTZ,
    last_sync_error TEXT,
    metadata JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, provider)
);
CREATE INDEX integration_connections_account
    ON integration_connections (provider, external_account_id);
";

const V3_CUSTOMERS: &str = "
CREATE TABLE customers (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    source TEXT NOT NULL,
    external_id TEXT NOT NULL,
    name TEXT,
    email TEXT,
    company_name TEXT,
    currency TEXT,
    mrr_cents BIGINT NOT NULL DEFAULT 0,
    first_seen_at TIMESTAMPTZ NOT NULL,
    last_seen_at TIMESTAMPTZ NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}',
    deleted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, source, external_id)
);
CREATE INDEX customers_live_email
    ON customers (tenant_id, lower(email)) WHERE deleted_at IS NULL;

CREATE TABLE customer_events (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    customer_id UUID NOT NULL REFERENCES customers(id),
    source TEXT NOT NULL,
    external_event_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    occurred_at TIMESTAMPTZ NOT NULL,
    data JSONB NOT NULL DEFAULT '{}',
    created_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, source, external_event_id)
);
CREATE INDEX customer_events_timeline
    ON customer_events (tenant_id, customer_id, occurred_at DESC);
CREATE INDEX customer_events_type
    ON customer_events (tenant_id, event_type, occurred_at);
";

const V4_PROJECTIONS: &str = "
CREATE TABLE subscriptions (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    customer_id UUID NOT NULL REFERENCES customers(id),
    status TEXT NOT NULL,
    amount_cents BIGINT NOT NULL,
    currency TEXT,
    billing_interval TEXT NOT NULL,
    interval_count INT NOT NULL DEFAULT 1,
    current_period_end TIMESTAMPTZ,
    canceled_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}',
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, provider, external_id)
);
CREATE INDEX subscriptions_customer ON subscriptions (tenant_id, customer_id);

CREATE TABLE payments (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    customer_id UUID NOT NULL REFERENCES customers(id),
    amount_cents BIGINT NOT NULL,
    currency TEXT,
    status TEXT NOT NULL,
    failure_reason TEXT,
    occurred_at TIMESTAMPTZ NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}',
    UNIQUE (tenant_id, provider, external_id)
);
CREATE INDEX payments_customer ON payments (tenant_id, customer_id, occurred_at);

CREATE TABLE conversations (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    customer_id UUID NOT NULL REFERENCES customers(id),
    state TEXT NOT NULL,
    is_ticket BOOLEAN NOT NULL DEFAULT false,
    title TEXT,
    opened_at TIMESTAMPTZ NOT NULL,
    closed_at TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}',
    UNIQUE (tenant_id, provider, external_id)
);
CREATE INDEX conversations_customer ON conversations (tenant_id, customer_id, opened_at);

CREATE TABLE deals (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    customer_id UUID REFERENCES customers(id),
    name TEXT,
    stage TEXT,
    amount_cents BIGINT,
    close_date TIMESTAMPTZ,
    metadata JSONB NOT NULL DEFAULT '{}',
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, provider, external_id)
);

CREATE TABLE contacts (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    customer_id UUID NOT NULL REFERENCES customers(id),
    email TEXT,
    name TEXT,
    company_external_id TEXT,
    metadata JSONB NOT NULL DEFAULT '{}',
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, provider, external_id)
);

CREATE TABLE companies (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    provider TEXT NOT NULL,
    external_id TEXT NOT NULL,
    name TEXT,
    domain TEXT,
    metadata JSONB NOT NULL DEFAULT '{}',
    updated_at TIMESTAMPTZ NOT NULL,
    UNIQUE (tenant_id, provider, external_id)
);
";

const V5_SCORES: &str = "
CREATE TABLE scoring_configs (
    tenant_id UUID PRIMARY KEY REFERENCES tenants(id),
    weights JSONB NOT NULL,
    green_threshold INT NOT NULL,
    yellow_threshold INT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE health_scores (
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    customer_id UUID NOT NULL REFERENCES customers(id),
    overall_score INT NOT NULL,
    risk_level TEXT NOT NULL,
    factors JSONB NOT NULL DEFAULT '{}',
    calculated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tenant_id, customer_id)
);

CREATE TABLE health_score_history (
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    customer_id UUID NOT NULL REFERENCES customers(id),
    overall_score INT NOT NULL,
    risk_level TEXT NOT NULL,
    factors JSONB NOT NULL DEFAULT '{}',
    calculated_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (tenant_id, customer_id, calculated_at)
);
CREATE INDEX health_score_history_age ON health_score_history (calculated_at);
";

const V6_ALERTS: &str = "
CREATE TABLE alert_rules (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    name TEXT NOT NULL,
    description TEXT,
    trigger_type TEXT NOT NULL,
    conditions JSONB NOT NULL DEFAULT '{}',
    channel TEXT NOT NULL,
    recipients TEXT[] NOT NULL DEFAULT '{}',
    is_active BOOLEAN NOT NULL DEFAULT true,
    created_by UUID,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX alert_rules_active ON alert_rules (tenant_id) WHERE is_active;

CREATE TABLE alert_history (
    id UUID PRIMARY KEY,
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    alert_rule_id UUID NOT NULL REFERENCES alert_rules(id) ON DELETE CASCADE,
    customer_id UUID REFERENCES customers(id),
    channel TEXT NOT NULL,
    status TEXT NOT NULL,
    trigger_data JSONB NOT NULL DEFAULT '{}',
    provider_message_id TEXT,
    delivered_at TIMESTAMPTZ,
    opened_at TIMESTAMPTZ,
    clicked_at TIMESTAMPTZ,
    bounced_at TIMESTAMPTZ,
    error_message TEXT,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX alert_history_cooldown
    ON alert_history (tenant_id, alert_rule_id, customer_id, created_at DESC);
CREATE INDEX alert_history_message ON alert_history (provider_message_id)
    WHERE provider_message_id IS NOT NULL;

CREATE TABLE notification_preferences (
    user_id UUID NOT NULL REFERENCES users(id),
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    email_enabled BOOLEAN NOT NULL DEFAULT true,
    in_app_enabled BOOLEAN NOT NULL DEFAULT true,
    digest_enabled BOOLEAN NOT NULL DEFAULT false,
    digest_frequency TEXT NOT NULL DEFAULT 'weekly',
    muted_rule_ids UUID[] NOT NULL DEFAULT '{}',
    PRIMARY KEY (user_id, tenant_id)
);

CREATE TABLE notifications (
    id UUID PRIMARY KEY,
    user_id UUID NOT NULL REFERENCES users(id),
    tenant_id UUID NOT NULL REFERENCES tenants(id),
    notification_type TEXT NOT NULL,
    title TEXT NOT NULL,
    message TEXT NOT NULL,
    data JSONB NOT NULL DEFAULT '{}',
    read_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX notifications_inbox ON notifications (tenant_id, user_id, created_at DESC);
";

const V7_WEBHOOKS: &str = "
CREATE TABLE webhook_events (
    provider TEXT NOT NULL,
    external_event_id TEXT NOT NULL,
    tenant_id UUID,
    event_type TEXT NOT NULL,
    received_at TIMESTAMPTZ NOT NULL,
    PRIMARY KEY (provider, external_event_id)
);
CREATE INDEX webhook_events_age ON webhook_events (received_at);
";

/// Apply every pending migration. Returns the versions applied.
pub async fn run_migrations(pool: &Pool) -> PulseResult<Vec<i32>> {
    let mut client = pool.get().await.map_err(pool_err)?;
    client.batch_execute(LEDGER).await.map_err(db_err)?;

    let applied = client
        .query("SELECT version FROM schema_migrations", &[])
        .await
        .map_err(db_err)?
        .iter()
        .map(|row| row.try_get::<_, i32>("version"))
        .collect::<Result<Vec<i32>, _>>()
        .map_err(db_err)?;

    let mut newly_applied = Vec::new();
    for (version, name, sql) in MIGRATIONS {
        if applied.contains(version) {
            continue;
        }
        let tx = client.transaction().await.map_err(db_err)?;
        tx.batch_execute(sql).await.map_err(db_err)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, name) VALUES ($1, $2)",
            &[version, name],
        )
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        tracing::info!(version = *version, name = *name, "Applied migration");
        newly_applied.push(*version);
    }
    Ok(newly_applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_versions_strictly_increase() {
        let versions: Vec<i32> = MIGRATIONS.iter().map(|(v, _, _)| *v).collect();
        assert!(versions.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(versions.first(), Some(&1));
    }

    #[test]
    fn test_natural_keys_are_unique_constraints() {
        let all: String = MIGRATIONS.iter().map(|(_, _, sql)| *sql).collect();
        assert!(all.contains("UNIQUE (tenant_id, source, external_event_id)"));
        assert!(all.contains("UNIQUE (tenant_id, source, external_id)"));
        assert!(all.contains("PRIMARY KEY (provider, external_event_id)"));
        assert!(all.contains("PRIMARY KEY (tenant_id, customer_id, calculated_at)"));
    }
}
