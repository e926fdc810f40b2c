use crate::scan::numeric_value;
use crate::store::{KeyValueStore, load_json, save_json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, HashMap},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Last-known-good listing parameters for one marketplace.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingDefaults {
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl ListingDefaults {
    pub fn int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(numeric_value)
    }

    pub fn text(&self, key: &str) -> Option<String> {
        match self.values.get(key)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    pub fn int_list(&self, key: &str) -> Option<Vec<i64>> {
        let items = self.values.get(key)?.as_array()?;
        let parsed: Vec<i64> = items.iter().filter_map(numeric_value).collect();
        (!parsed.is_empty() && parsed.len() == items.len()).then_some(parsed)
    }
}

/// Per-marketplace defaults, cached in process and written through to the
/// key-value store.
pub struct DefaultsStore {
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<HashMap<String, ListingDefaults>>,
}

impl DefaultsStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, marketplace: &str) -> ListingDefaults {
        if let Some(cached) = self.cache.lock().await.get(marketplace) {
            return cached.clone();
        }
        let loaded = match load_json::<ListingDefaults>(self.store.as_ref(), &key(marketplace)).await {
            Ok(value) => value.unwrap_or_default(),
            Err(err) => {
                warn!(target = "agent.defaults", marketplace, error = %err, "defaults_load_failed");
                return ListingDefaults::default();
            }
        };
        self.cache
            .lock()
            .await
            .entry(marketplace.to_string())
            .or_insert(loaded)
            .clone()
    }

    /// Shallow last-write-wins merge. Null values never overwrite.
    pub async fn merge(&self, marketplace: &str, updates: BTreeMap<String, Value>) -> ListingDefaults {
        let current = self.get(marketplace).await;
        let merged = {
            let mut guard = self.cache.lock().await;
            let entry = guard.entry(marketplace.to_string()).or_insert(current);
            for (name, value) in updates.into_iter().filter(|(_, v)| !v.is_null()) {
                entry.values.insert(name, value);
            }
            entry.updated_at = Some(Utc::now());
            entry.clone()
        };
        if let Err(err) = save_json(self.store.as_ref(), &key(marketplace), &merged, None).await {
            warn!(target = "agent.defaults", marketplace, error = %err, "defaults_persist_failed");
        } else {
            debug!(target = "agent.defaults", marketplace, keys = merged.values.len(), "defaults_merged");
        }
        merged
    }

    pub async fn reset(&self, marketplace: &str) {
        self.cache.lock().await.remove(marketplace);
        if let Err(err) =
            save_json(self.store.as_ref(), &key(marketplace), &ListingDefaults::default(), None).await
        {
            warn!(target = "agent.defaults", marketplace, error = %err, "defaults_reset_failed");
        }
    }
}

fn key(marketplace: &str) -> String {
    format!("defaults:{marketplace}")
}
