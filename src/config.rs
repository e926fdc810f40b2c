use crate::media::NormalizePolicy;
use crate::poll::PollPolicy;
use serde::Deserialize;
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;

const BUILTIN_PROFILES: &str = include_str!("../config/marketplaces.yaml");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read marketplace profiles at {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid marketplace profiles: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub port: u16,
    pub redis_url: Option<String>,
    pub history_capacity: usize,
    pub normalize: NormalizePolicy,
    pub suggestion_poll: PollPolicy,
    pub request_max_bytes: usize,
    pub idempotency_ttl_secs: u64,
    pub profiles: MarketplaceProfiles,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let profiles = match std::env::var("MARKETPLACE_PROFILES") {
            Ok(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                MarketplaceProfiles::from_yaml(&raw)?
            }
            Err(_) => MarketplaceProfiles::builtin()?,
        };

        let normalize = NormalizePolicy {
            max_bytes: env_parse("IMAGE_MAX_BYTES").unwrap_or(NormalizePolicy::DEFAULT_MAX_BYTES),
            max_dimension: env_parse("IMAGE_MAX_DIMENSION")
                .unwrap_or(NormalizePolicy::DEFAULT_MAX_DIMENSION),
            ..NormalizePolicy::default()
        };

        let suggestion_poll = PollPolicy {
            timeout: Duration::from_millis(env_parse("SUGGESTION_POLL_TIMEOUT_MS").unwrap_or(6_000)),
            ..PollPolicy::default()
        };

        Ok(Self {
            port: env_parse("PORT").unwrap_or(8000),
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.trim().is_empty()),
            history_capacity: env_parse::<usize>("OBSERVER_HISTORY_CAPACITY")
                .filter(|v| *v > 0)
                .unwrap_or(200),
            normalize,
            suggestion_poll,
            request_max_bytes: env_parse::<usize>("REQUEST_MAX_BYTES")
                .filter(|v| *v > 0)
                .unwrap_or(32 * 1024 * 1024),
            idempotency_ttl_secs: env_parse("IDEMPOTENCY_TTL_SECS").unwrap_or(3600),
            profiles,
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketplaceProfiles {
    pub marketplaces: BTreeMap<String, MarketplaceProfile>,
}

impl MarketplaceProfiles {
    pub fn builtin() -> Result<Self, ConfigError> {
        Self::from_yaml(BUILTIN_PROFILES)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn get(&self, marketplace: &str) -> Option<&MarketplaceProfile> {
        self.marketplaces.get(marketplace)
    }

    /// `(domain, internal api path marker)` for every profile.
    pub fn capture_rules(&self) -> Vec<(String, String)> {
        self.marketplaces
            .values()
            .map(|profile| (profile.domain().to_string(), profile.api_path_marker().to_string()))
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MarketplaceProfile {
    PersistedQuery(PersistedProfile),
    TemplateReplay(ReplayProfile),
}

impl MarketplaceProfile {
    pub fn domain(&self) -> &str {
        match self {
            MarketplaceProfile::PersistedQuery(p) => &p.domain,
            MarketplaceProfile::TemplateReplay(p) => &p.domain,
        }
    }

    pub fn api_path_marker(&self) -> &str {
        match self {
            MarketplaceProfile::PersistedQuery(p) => &p.api_path_marker,
            MarketplaceProfile::TemplateReplay(p) => &p.api_path_marker,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistedProfile {
    pub domain: String,
    pub api_url: String,
    pub api_path_marker: String,
    pub item_url: String,
    pub alternate_item_url: String,
    /// Identifier namespace marker selecting `alternate_item_url`.
    pub alternate_id_prefix: String,
    /// Dotted path, relative to `variables`, that the uploaded file fills.
    pub upload_variable_path: String,
    pub suggest_photo_variable: String,
    pub operations: PersistedOperations,
    pub shipping: ShippingFallback,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistedOperations {
    pub upload_photo: PersistedOperation,
    pub suggest: PersistedOperation,
    pub listing_context: PersistedOperation,
    pub create_listing: PersistedOperation,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PersistedOperation {
    pub name: String,
    pub hash: String,
    /// JSON pointer (into `data`) of the identifier this operation returns.
    #[serde(default)]
    pub id_pointer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShippingFallback {
    pub payer_id: i64,
    pub class_ids: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayProfile {
    pub domain: String,
    pub api_path_marker: String,
    pub upload_path_marker: String,
    pub upload_file_field: String,
    pub item_url: String,
    pub listing_terms: Vec<String>,
    pub create_terms: Vec<String>,
    pub identity_fields: Vec<String>,
    pub asset_id_keys: Vec<String>,
    pub listing_id_keys: Vec<String>,
}

pub fn render_url(template: &str, id: &str) -> String {
    template.replace("{id}", id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_profiles_parse() {
        let profiles = MarketplaceProfiles::builtin().expect("builtin yaml");
        let Some(MarketplaceProfile::PersistedQuery(alpha)) = profiles.get("alpha") else {
            panic!("alpha should be a persisted-query profile");
        };
        assert_eq!(alpha.operations.create_listing.name, "createListing");
        assert_eq!(alpha.shipping.class_ids, vec![0]);
        assert!(matches!(
            profiles.get("beta"),
            Some(MarketplaceProfile::TemplateReplay(_))
        ));
        assert_eq!(profiles.capture_rules().len(), 2);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let raw = "marketplaces:\n  x:\n    kind: carrier_pigeon\n    domain: a\n";
        assert!(MarketplaceProfiles::from_yaml(raw).is_err());
    }

    #[test]
    fn url_template_substitutes_id() {
        assert_eq!(
            render_url("https://m.example/item/{id}", "m123"),
            "https://m.example/item/m123"
        );
    }
}
