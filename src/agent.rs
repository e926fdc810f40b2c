use crate::config::{AgentConfig, MarketplaceProfile, MarketplaceProfiles};
use crate::defaults::DefaultsStore;
use crate::http::Transport;
use crate::marketplace::{PersistedQueryFlow, TemplateReplayFlow};
use crate::media::NormalizePolicy;
use crate::models::{ListingOutcome, ListingPayload, OutcomeError};
use crate::observer::{CaptureRule, ObserverHub};
use crate::persisted::PersistedQueryClient;
use crate::poll::PollPolicy;
use crate::store::{DiagnosticLog, KeyValueStore};
use std::sync::Arc;
use tracing::{info, warn};

/// Entry point for listing creation. Picks the workflow from the
/// marketplace profile and owns the state shared between calls.
#[derive(Clone)]
pub struct Agent {
    profiles: Arc<MarketplaceProfiles>,
    observer: Arc<ObserverHub>,
    defaults: Arc<DefaultsStore>,
    diagnostics: DiagnosticLog,
    transport: Arc<dyn Transport>,
    normalize: NormalizePolicy,
    suggestion_poll: PollPolicy,
}

impl Agent {
    pub fn new(
        config: &AgentConfig,
        transport: Arc<dyn Transport>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let rules = config
            .profiles
            .capture_rules()
            .into_iter()
            .map(|(domain, path_marker)| CaptureRule {
                domain,
                path_marker,
            })
            .collect();
        Self {
            profiles: Arc::new(config.profiles.clone()),
            observer: Arc::new(ObserverHub::new(rules, config.history_capacity, store.clone())),
            defaults: Arc::new(DefaultsStore::new(store.clone())),
            diagnostics: DiagnosticLog::new(store),
            transport,
            normalize: config.normalize.clone(),
            suggestion_poll: config.suggestion_poll.clone(),
        }
    }

    pub fn knows(&self, marketplace: &str) -> bool {
        self.profiles.get(marketplace).is_some()
    }

    pub fn observer(&self) -> &Arc<ObserverHub> {
        &self.observer
    }

    pub fn defaults(&self) -> &Arc<DefaultsStore> {
        &self.defaults
    }

    pub async fn create_listing(&self, marketplace: &str, payload: &ListingPayload) -> ListingOutcome {
        let Some(profile) = self.profiles.get(marketplace) else {
            warn!(target = "agent.listing", marketplace, "unknown_marketplace");
            return ListingOutcome::failed(
                OutcomeError {
                    kind: "validation".into(),
                    stage: None,
                    message: format!("unknown marketplace `{marketplace}`"),
                    snapshot_key: None,
                },
                Vec::new(),
            );
        };
        info!(target = "agent.listing", marketplace, title = %payload.title, "listing_requested");
        match profile {
            MarketplaceProfile::PersistedQuery(profile) => {
                let client = PersistedQueryClient::new(
                    marketplace,
                    profile.domain.clone(),
                    profile.api_url.clone(),
                    self.transport.clone(),
                    self.observer.clone(),
                    self.diagnostics.clone(),
                );
                PersistedQueryFlow {
                    marketplace: marketplace.to_string(),
                    profile: profile.clone(),
                    client,
                    transport: self.transport.clone(),
                    defaults: self.defaults.clone(),
                    normalize: self.normalize.clone(),
                    suggestion_poll: self.suggestion_poll.clone(),
                }
                .create(payload)
                .await
            }
            MarketplaceProfile::TemplateReplay(profile) => {
                TemplateReplayFlow {
                    marketplace: marketplace.to_string(),
                    profile: profile.clone(),
                    transport: self.transport.clone(),
                    observer: self.observer.clone(),
                    diagnostics: self.diagnostics.clone(),
                    normalize: self.normalize.clone(),
                }
                .create(payload)
                .await
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::http::testing::ScriptedTransport;
    use crate::store::MemoryStore;

    pub fn config() -> AgentConfig {
        AgentConfig {
            port: 0,
            redis_url: None,
            history_capacity: 20,
            normalize: NormalizePolicy::default(),
            suggestion_poll: PollPolicy::once(),
            request_max_bytes: 1024 * 1024,
            idempotency_ttl_secs: 60,
            profiles: MarketplaceProfiles::builtin().unwrap(),
        }
    }

    pub fn agent() -> (Agent, Arc<ScriptedTransport>, Arc<MemoryStore>) {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(MemoryStore::new());
        let agent = Agent::new(&config(), transport.clone(), store.clone());
        (agent, transport, store)
    }
}
