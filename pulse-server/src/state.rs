//! Component wiring.
//!
//! [`AppState::assemble`] builds every engine over one store and one HTTP
//! transport and connects the cross-component hooks:
//! billing webhooks and finished syncs trigger rescoring, and every
//! calculated score is handed to the alert engine.

use pulse_alerts::{AlertEngine, AlertSettings, EmailSender, HttpEmailSender};
use pulse_core::{Provider, PulseConfig, PulseResult};
use pulse_integrations::{
    AdapterDeps, HttpTransport, HubspotAdapter, IntegrationAdapter, IntercomAdapter, StripeAdapter,
    TokenCipher,
};
use pulse_scoring::{ScoringEngine, ScoringSettings};
use pulse_storage::Store;
use pulse_sync::{SyncConfig, SyncOrchestrator};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    /// Registered adapters; a provider without credentials is absent.
    pub adapters: Arc<BTreeMap<Provider, Arc<dyn IntegrationAdapter>>>,
    pub sync: Arc<SyncOrchestrator>,
    pub scoring: Arc<ScoringEngine>,
    pub alerts: Arc<AlertEngine>,
}

impl AppState {
    /// Wire the engines, sending email through the configured provider.
    pub fn assemble(
        store: Arc<dyn Store>,
        transport: Arc<dyn HttpTransport>,
        config: &PulseConfig,
    ) -> PulseResult<Self> {
        let sender = Arc::new(HttpEmailSender::new(transport.clone(), config.email.clone()));
        Self::assemble_with_sender(store, transport, sender, config)
    }

    pub fn assemble_with_sender(
        store: Arc<dyn Store>,
        transport: Arc<dyn HttpTransport>,
        sender: Arc<dyn EmailSender>,
        config: &PulseConfig,
    ) -> PulseResult<Self> {
        let cipher = Arc::new(TokenCipher::from_config(config)?);
        let deps = AdapterDeps::new(store.clone(), transport, cipher).with_window_days(config.sync_window_days);

        let scoring = Arc::new(ScoringEngine::new(store.clone(), ScoringSettings::from_config(config)));
        let alerts = Arc::new(AlertEngine::new(store.clone(), sender, AlertSettings::from_config(config)));
        scoring.set_alert_hook(alerts.clone());

        let mut adapters: BTreeMap<Provider, Arc<dyn IntegrationAdapter>> = BTreeMap::new();
        if let Some(credentials) = &config.stripe {
            let stripe = Arc::new(StripeAdapter::new(&deps, credentials.clone()));
            stripe.set_change_hook(scoring.clone());
            adapters.insert(Provider::Stripe, stripe);
        }
        if let Some(credentials) = &config.hubspot {
            adapters.insert(Provider::Hubspot, Arc::new(HubspotAdapter::new(&deps, credentials.clone())));
        }
        if let Some(credentials) = &config.intercom {
            adapters.insert(Provider::Intercom, Arc::new(IntercomAdapter::new(&deps, credentials.clone())));
        }

        let mut orchestrator = SyncOrchestrator::new(store.clone(), SyncConfig::from_config(config));
        for adapter in adapters.values() {
            orchestrator = orchestrator.with_adapter(adapter.clone());
        }
        orchestrator.set_completed_hook(scoring.clone());

        tracing::info!(
            providers = ?adapters.keys().map(Provider::as_db_str).collect::<Vec<_>>(),
            "Components wired"
        );

        Ok(Self {
            store,
            adapters: Arc::new(adapters),
            sync: Arc::new(orchestrator),
            scoring,
            alerts,
        })
    }

    pub fn adapter(&self, provider: Provider) -> Option<&Arc<dyn IntegrationAdapter>> {
        self.adapters.get(&provider)
    }
}
