use super::events::{NetworkEvent, RecordedBody};
use super::redact::{MASK, redact_form, redact_json, redact_text, redact_url};
use super::session::{is_recorded_header, is_secret_header};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedRequest {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub request_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initiator_origin: Option<String>,
    pub body: RecordedBody,
    pub headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub served_from_cache: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_error: Option<String>,
}

impl RecordedRequest {
    pub fn is_post(&self) -> bool {
        self.method.eq_ignore_ascii_case("POST")
    }
}

#[derive(Debug)]
struct PendingRequest {
    timestamp: DateTime<Utc>,
    method: String,
    url: String,
    request_type: String,
    initiator_origin: Option<String>,
    post_data: Option<String>,
    headers: BTreeMap<String, String>,
    status_code: Option<u16>,
    served_from_cache: Option<bool>,
}

/// Correlates lifecycle events for one domain into finalized, redacted
/// records. History is a ring buffer; in-flight requests are bounded too.
#[derive(Debug)]
pub struct RequestRecorder {
    domain: String,
    capacity: usize,
    max_pending: usize,
    enabled: bool,
    pending: HashMap<String, PendingRequest>,
    history: VecDeque<RecordedRequest>,
}

impl RequestRecorder {
    pub fn new(domain: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            domain: domain.into(),
            capacity,
            max_pending: capacity * 2,
            enabled: false,
            pending: HashMap::new(),
            history: VecDeque::with_capacity(capacity),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    /// Stops recording. In-flight requests are dropped; history is kept.
    pub fn disable(&mut self) {
        self.enabled = false;
        self.pending.clear();
    }

    pub fn records(&self) -> Vec<RecordedRequest> {
        self.history.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.history.clear();
    }

    pub fn reset(&mut self) {
        self.enabled = false;
        self.pending.clear();
        self.history.clear();
    }

    pub fn matches_domain(&self, url: &str) -> bool {
        host_matches(url, &self.domain)
    }

    pub fn handle(&mut self, event: &NetworkEvent) {
        match event {
            NetworkEvent::RequestWillBeSent {
                request_id,
                url,
                method,
                headers,
                post_data,
                resource_type,
                initiator_origin,
                timestamp,
            } => {
                if !self.enabled || !self.matches_domain(url) {
                    return;
                }
                self.make_room();
                self.pending.insert(
                    request_id.clone(),
                    PendingRequest {
                        timestamp: timestamp.unwrap_or_else(Utc::now),
                        method: method.to_ascii_uppercase(),
                        url: url.clone(),
                        request_type: resource_type.clone().unwrap_or_else(|| "other".into()),
                        initiator_origin: initiator_origin.clone(),
                        post_data: post_data.clone(),
                        headers: lowercase_keys(headers),
                        status_code: None,
                        served_from_cache: None,
                    },
                );
            }
            NetworkEvent::RequestHeaders { request_id, headers } => {
                if let Some(pending) = self.pending.get_mut(request_id) {
                    pending.headers.extend(lowercase_keys(headers));
                }
            }
            NetworkEvent::ResponseReceived {
                request_id,
                status,
                from_cache,
                ..
            } => {
                if let Some(pending) = self.pending.get_mut(request_id) {
                    pending.status_code = Some(*status);
                    pending.served_from_cache = Some(*from_cache);
                }
            }
            NetworkEvent::LoadingFinished { request_id } => self.finalize(request_id, None),
            NetworkEvent::LoadingFailed {
                request_id,
                error_text,
            } => self.finalize(request_id, Some(error_text.clone())),
        }
    }

    fn make_room(&mut self) {
        while self.pending.len() >= self.max_pending {
            let oldest = self
                .pending
                .iter()
                .min_by_key(|(_, pending)| pending.timestamp)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    debug!(target = "agent.observer", domain = %self.domain, request_id = %id, "pending_evicted");
                    self.pending.remove(&id);
                }
                None => break,
            }
        }
    }

    fn finalize(&mut self, request_id: &str, transport_error: Option<String>) {
        let Some(pending) = self.pending.remove(request_id) else {
            return;
        };
        let content_type = pending.headers.get("content-type").cloned();
        let mut body = RecordedBody::decode(pending.post_data.as_deref(), content_type.as_deref());
        redact_body(&mut body);

        let record = RecordedRequest {
            id: request_id.to_string(),
            timestamp: pending.timestamp,
            method: pending.method,
            url: redact_url(&pending.url),
            request_type: pending.request_type,
            initiator_origin: pending.initiator_origin,
            body,
            headers: recorded_headers(&pending.headers),
            status_code: pending.status_code,
            served_from_cache: pending.served_from_cache,
            transport_error,
        };
        self.history.push_back(record);
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }
    }
}

fn redact_body(body: &mut RecordedBody) {
    match body {
        RecordedBody::Json(value) => redact_json(value),
        RecordedBody::Form(pairs) => redact_form(pairs),
        RecordedBody::Text(text) => *text = redact_text(text),
        RecordedBody::Empty => {}
    }
}

fn recorded_headers(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| is_recorded_header(name))
        .map(|(name, value)| {
            let value = if is_secret_header(name) {
                MASK.to_string()
            } else {
                redact_text(value)
            };
            (name.clone(), value)
        })
        .collect()
}

fn lowercase_keys(headers: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect()
}

/// True when `url`'s host is `domain` or one of its subdomains.
pub fn host_matches(url: &str, domain: &str) -> bool {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let domain = domain.trim_start_matches('.').to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    host == domain || host.ends_with(&format!(".{domain}"))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn start(id: &str, url: &str, body: Option<&str>, content_type: &str) -> NetworkEvent {
        NetworkEvent::RequestWillBeSent {
            request_id: id.into(),
            url: url.into(),
            method: "POST".into(),
            headers: BTreeMap::from([
                ("Content-Type".to_string(), content_type.to_string()),
                ("Cookie".to_string(), "c_user=1; xs=secret-cookie".to_string()),
                ("User-Agent".to_string(), "Mozilla/5.0".to_string()),
                ("Sec-Fetch-Site".to_string(), "same-origin".to_string()),
            ]),
            post_data: body.map(str::to_string),
            resource_type: Some("fetch".into()),
            initiator_origin: None,
            timestamp: None,
        }
    }

    pub fn finish(id: &str) -> NetworkEvent {
        NetworkEvent::LoadingFinished {
            request_id: id.into(),
        }
    }
}
