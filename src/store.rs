use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Value, json};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// External key-value collaborator. Get/set only, no transactions.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> AgentResult<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl_secs: Option<u64>) -> AgentResult<()>;
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String, _ttl_secs: Option<u64>) -> AgentResult<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }
}

pub struct RedisStore {
    client: redis::Client,
}

impl RedisStore {
    pub fn open(url: &str) -> AgentResult<Self> {
        Ok(Self {
            client: redis::Client::open(url)?,
        })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> AgentResult<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String, ttl_secs: Option<u64>) -> AgentResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        match ttl_secs {
            Some(ttl) => conn.set_ex::<_, _, ()>(key, value, ttl).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }
}

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> AgentResult<Option<T>> {
    match store.get(key).await? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| AgentError::Store(format!("corrupt value at {key}: {err}"))),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
) -> AgentResult<()> {
    let raw = serde_json::to_string(value).map_err(|err| AgentError::Store(err.to_string()))?;
    store.set(key, raw, ttl_secs).await
}

/// Diagnostic snapshots of raw upstream exchanges, kept for debugging schema
/// drift. Writes are best-effort: a store failure is logged, never raised.
#[derive(Clone)]
pub struct DiagnosticLog {
    store: Arc<dyn KeyValueStore>,
}

impl DiagnosticLog {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Persists `snapshot` and returns its key. Also updates
    /// `diagnostics:{marketplace}:latest` to point at it.
    pub async fn record(&self, marketplace: &str, kind: &str, snapshot: Value) -> Option<String> {
        let recorded_at = Utc::now();
        let key = format!(
            "diagnostics:{marketplace}:{}:{kind}:{}",
            recorded_at.format("%Y%m%dT%H%M%S%3f"),
            Uuid::new_v4().simple()
        );
        let envelope = json!({
            "marketplace": marketplace,
            "kind": kind,
            "recorded_at": recorded_at,
            "snapshot": snapshot,
        });
        if let Err(err) = save_json(self.store.as_ref(), &key, &envelope, None).await {
            warn!(target = "agent.diagnostics", marketplace, kind, error = %err, "diagnostic_persist_failed");
            return None;
        }
        let latest = format!("diagnostics:{marketplace}:latest");
        if let Err(err) = self.store.set(&latest, key.clone(), None).await {
            warn!(target = "agent.diagnostics", marketplace, error = %err, "diagnostic_pointer_failed");
        }
        Some(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trips_json() {
        let store = MemoryStore::new();
        save_json(&store, "k", &json!({"zip": "02134"}), None)
            .await
            .unwrap();
        let value: Option<Value> = load_json(&store, "k").await.unwrap();
        assert_eq!(value, Some(json!({"zip": "02134"})));
        let missing: Option<Value> = load_json(&store, "nope").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn corrupt_value_is_a_store_error() {
        let store = MemoryStore::new();
        store.set("k", "{not json".into(), None).await.unwrap();
        let err = load_json::<Value>(&store, "k").await.unwrap_err();
        assert_eq!(err.kind(), "store");
    }

    #[tokio::test]
    async fn diagnostics_update_latest_pointer() {
        let store = Arc::new(MemoryStore::new());
        let log = DiagnosticLog::new(store.clone());
        let key = log
            .record("alpha", "extraction", json!({"raw": "x"}))
            .await
            .expect("key");
        let latest = store.get("diagnostics:alpha:latest").await.unwrap();
        assert_eq!(latest, Some(key.clone()));
        let saved: Value = load_json(store.as_ref(), &key).await.unwrap().unwrap();
        assert_eq!(saved["kind"], "extraction");
        assert_eq!(saved["snapshot"]["raw"], "x");
    }
}
