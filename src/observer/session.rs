use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Headers kept on recorded requests. Secret ones are masked there.
const RECORDED_HEADERS: &[&str] = &[
    "content-type",
    "accept",
    "accept-language",
    "origin",
    "referer",
    "user-agent",
    "x-app-version",
    "x-platform",
    "x-client-version",
    "apollo-require-preflight",
    "x-apollo-operation-name",
    "x-fb-friendly-name",
    "x-fb-lsd",
    "x-asbd-id",
    "authorization",
    "cookie",
    "x-csrf-token",
    "x-xsrf-token",
    "dpop",
];

const SECRET_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "x-csrf-token",
    "x-xsrf-token",
    "x-fb-lsd",
    "dpop",
];

/// Non-secret headers reused verbatim when talking to the marketplace.
const SESSION_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "user-agent",
    "x-app-version",
    "x-platform",
    "x-client-version",
    "apollo-require-preflight",
    "x-asbd-id",
];

pub fn is_recorded_header(name: &str) -> bool {
    RECORDED_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

pub fn is_secret_header(name: &str) -> bool {
    SECRET_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

pub fn is_session_header(name: &str) -> bool {
    SESSION_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionHeaders {
    pub headers: BTreeMap<String, String>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl SessionHeaders {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.headers.keys().cloned().collect()
    }
}

/// Authentication headers of the live browser session. Held in memory only.
#[derive(Clone, Default)]
pub struct AmbientSession {
    pub headers: BTreeMap<String, String>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl AmbientSession {
    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

impl fmt::Debug for AmbientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AmbientSession")
            .field("headers", &self.headers.keys().collect::<Vec<_>>())
            .field("captured_at", &self.captured_at)
            .finish()
    }
}

/// Splits observed request headers into the reusable public subset and the
/// secret subset. Names are lowercased.
pub fn split_headers(
    observed: &BTreeMap<String, String>,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let mut public = BTreeMap::new();
    let mut secret = BTreeMap::new();
    for (name, value) in observed {
        let name = name.to_ascii_lowercase();
        if value.trim().is_empty() {
            continue;
        }
        if is_secret_header(&name) {
            secret.insert(name, value.clone());
        } else if is_session_header(&name) {
            public.insert(name, value.clone());
        }
    }
    (public, secret)
}
