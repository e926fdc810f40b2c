//! Per-domain network observation: request recording for template replay
//! and passive capture of the session headers the marketplace clients reuse.

pub mod events;
pub mod recorder;
pub mod redact;
pub mod session;

pub use events::{NetworkEvent, RecordedBody};
pub use recorder::{RecordedRequest, RequestRecorder, host_matches};
pub use session::{AmbientSession, SessionHeaders};

use crate::poll::{PollPolicy, poll_until};
use crate::store::{KeyValueStore, load_json, save_json};
use chrono::Utc;
use serde::Serialize;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, warn};

const CAPTURED_IDS_KEPT: usize = 64;

/// An internal API endpoint whose request headers are worth keeping.
#[derive(Debug, Clone)]
pub struct CaptureRule {
    pub domain: String,
    pub path_marker: String,
}

impl CaptureRule {
    fn matches(&self, url: &str) -> bool {
        host_matches(url, &self.domain) && url.contains(&self.path_marker)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecorderStatus {
    pub domain: String,
    pub recording: bool,
    pub recorded: usize,
    pub pending: usize,
}

#[derive(Debug, Default)]
struct DomainSession {
    public: SessionHeaders,
    ambient: AmbientSession,
    captured_ids: VecDeque<String>,
}

pub struct ObserverHub {
    capacity: usize,
    rules: Vec<CaptureRule>,
    recorders: Mutex<HashMap<String, Arc<Mutex<RequestRecorder>>>>,
    sessions: Mutex<HashMap<String, DomainSession>>,
    store: Arc<dyn KeyValueStore>,
}

impl ObserverHub {
    pub fn new(rules: Vec<CaptureRule>, capacity: usize, store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            capacity,
            rules,
            recorders: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Whether `domain` belongs to a configured marketplace.
    pub fn knows_domain(&self, domain: &str) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.domain.eq_ignore_ascii_case(domain))
    }

    /// The recorder for a configured domain, created on first use.
    async fn recorder(&self, domain: &str) -> Option<Arc<Mutex<RequestRecorder>>> {
        if !self.knows_domain(domain) {
            return None;
        }
        let key = domain.to_ascii_lowercase();
        let mut guard = self.recorders.lock().await;
        let recorder = guard
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RequestRecorder::new(key, self.capacity))))
            .clone();
        Some(recorder)
    }

    pub async fn enable(&self, domain: &str) -> bool {
        let Some(recorder) = self.recorder(domain).await else {
            return false;
        };
        recorder.lock().await.enable();
        debug!(target = "agent.observer", domain, "recording_enabled");
        true
    }

    pub async fn disable(&self, domain: &str) -> bool {
        let Some(recorder) = self.recorder(domain).await else {
            return false;
        };
        recorder.lock().await.disable();
        debug!(target = "agent.observer", domain, "recording_disabled");
        true
    }

    pub async fn status(&self, domain: &str) -> Option<RecorderStatus> {
        let recorder = self.recorder(domain).await?;
        let guard = recorder.lock().await;
        Some(RecorderStatus {
            domain: domain.to_ascii_lowercase(),
            recording: guard.is_enabled(),
            recorded: guard.len(),
            pending: guard.pending_len(),
        })
    }

    pub async fn records(&self, domain: &str) -> Vec<RecordedRequest> {
        match self.recorder(domain).await {
            Some(recorder) => recorder.lock().await.records(),
            None => Vec::new(),
        }
    }

    pub async fn clear(&self, domain: &str) {
        if let Some(recorder) = self.recorder(domain).await {
            recorder.lock().await.clear();
        }
    }

    pub async fn reset(&self, domain: &str) {
        if let Some(recorder) = self.recorder(domain).await {
            recorder.lock().await.reset();
        }
    }

    /// Feeds one lifecycle event to the domain's recorder and to header
    /// capture. Capture runs even while recording is disabled.
    pub async fn ingest(&self, domain: &str, event: &NetworkEvent) {
        self.capture_headers(event).await;
        if let Some(recorder) = self.recorder(domain).await {
            recorder.lock().await.handle(event);
        }
    }

    pub async fn ingest_batch(&self, domain: &str, events: &[NetworkEvent]) -> usize {
        for event in events {
            self.ingest(domain, event).await;
        }
        events.len()
    }

    async fn capture_headers(&self, event: &NetworkEvent) {
        let updated = match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                url,
                headers,
                ..
            } => {
                let Some(rule) = self.rules.iter().find(|rule| rule.matches(url)) else {
                    return;
                };
                let (public, secret) = session::split_headers(headers);
                let mut guard = self.sessions.lock().await;
                let session = guard.entry(rule.domain.clone()).or_default();
                let now = Utc::now();
                if !secret.is_empty() {
                    session.ambient.headers = secret;
                    session.ambient.captured_at = Some(now);
                }
                session.captured_ids.push_back(request_id.clone());
                while session.captured_ids.len() > CAPTURED_IDS_KEPT {
                    session.captured_ids.pop_front();
                }
                if public.is_empty() {
                    None
                } else {
                    session.public.headers = public;
                    session.public.captured_at = Some(now);
                    Some((rule.domain.clone(), session.public.clone()))
                }
            }
            NetworkEvent::RequestHeaders {
                request_id,
                headers,
            } => {
                let (public, secret) = session::split_headers(headers);
                let mut guard = self.sessions.lock().await;
                let Some((domain, session)) = guard
                    .iter_mut()
                    .find(|(_, session)| session.captured_ids.contains(request_id))
                else {
                    return;
                };
                if !secret.is_empty() {
                    session.ambient.headers.extend(secret);
                }
                if public.is_empty() {
                    None
                } else {
                    session.public.headers.extend(public);
                    Some((domain.clone(), session.public.clone()))
                }
            }
            _ => None,
        };

        if let Some((domain, snapshot)) = updated {
            let key = session_key(&domain);
            if let Err(err) = save_json(self.store.as_ref(), &key, &snapshot, None).await {
                warn!(target = "agent.observer", domain = %domain, error = %err, "session_headers_persist_failed");
            }
        }
    }

    /// Non-secret headers for `domain`, reloaded from the store when this
    /// process has not observed any yet.
    pub async fn session_headers(&self, domain: &str) -> SessionHeaders {
        {
            let guard = self.sessions.lock().await;
            if let Some(session) = guard.get(domain).filter(|s| !s.public.is_empty()) {
                return session.public.clone();
            }
        }
        match load_json::<SessionHeaders>(self.store.as_ref(), &session_key(domain)).await {
            Ok(Some(stored)) => {
                let mut guard = self.sessions.lock().await;
                let session = guard.entry(domain.to_string()).or_default();
                if session.public.is_empty() {
                    session.public = stored.clone();
                }
                session.public.clone()
            }
            Ok(None) => SessionHeaders::default(),
            Err(err) => {
                warn!(target = "agent.observer", domain, error = %err, "session_headers_load_failed");
                SessionHeaders::default()
            }
        }
    }

    pub async fn ambient_session(&self, domain: &str) -> AmbientSession {
        self.sessions
            .lock()
            .await
            .get(domain)
            .map(|session| session.ambient.clone())
            .unwrap_or_default()
    }

    /// Headers to attach to a request against `domain`'s internal API.
    pub async fn request_headers_for(&self, domain: &str) -> Vec<(String, String)> {
        let mut headers: Vec<(String, String)> =
            self.session_headers(domain).await.headers.into_iter().collect();
        headers.extend(self.ambient_session(domain).await.headers);
        headers
    }

    pub async fn header_names(&self, domain: &str) -> (Vec<String>, Vec<String>) {
        let public = self.session_headers(domain).await.names();
        let secret = self
            .ambient_session(domain)
            .await
            .headers
            .into_keys()
            .collect();
        (public, secret)
    }

    /// Polls the domain's history for the most recent record matching
    /// `predicate`.
    pub async fn wait_for_record<P>(
        &self,
        domain: &str,
        predicate: P,
        policy: &PollPolicy,
    ) -> Option<RecordedRequest>
    where
        P: Fn(&RecordedRequest) -> bool,
    {
        let recorder = self.recorder(domain).await?;
        poll_until(policy, || {
            let recorder = recorder.clone();
            let predicate = &predicate;
            async move {
                let guard = recorder.lock().await;
                guard.records().into_iter().rev().find(|r| predicate(r))
            }
        })
        .await
    }
}

fn session_key(domain: &str) -> String {
    format!("session_headers:{domain}")
}
