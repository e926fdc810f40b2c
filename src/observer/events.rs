use crate::form::{looks_like_form, parse_form};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Network lifecycle events as forwarded by the browser bridge. Arrival
/// order across request ids is not guaranteed.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NetworkEvent {
    #[serde(rename_all = "camelCase")]
    RequestWillBeSent {
        request_id: String,
        url: String,
        method: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        post_data: Option<String>,
        #[serde(default)]
        resource_type: Option<String>,
        #[serde(default)]
        initiator_origin: Option<String>,
        #[serde(default)]
        timestamp: Option<DateTime<Utc>>,
    },
    /// Extra request headers reported after the request started (cookies and
    /// other headers the browser attaches late).
    #[serde(rename_all = "camelCase")]
    RequestHeaders {
        request_id: String,
        headers: BTreeMap<String, String>,
    },
    #[serde(rename_all = "camelCase")]
    ResponseReceived {
        request_id: String,
        status: u16,
        #[serde(default)]
        headers: BTreeMap<String, String>,
        #[serde(default)]
        from_cache: bool,
    },
    #[serde(rename_all = "camelCase")]
    LoadingFinished { request_id: String },
    #[serde(rename_all = "camelCase")]
    LoadingFailed {
        request_id: String,
        #[serde(default)]
        error_text: String,
    },
}

impl NetworkEvent {
    pub fn request_id(&self) -> &str {
        match self {
            NetworkEvent::RequestWillBeSent { request_id, .. }
            | NetworkEvent::RequestHeaders { request_id, .. }
            | NetworkEvent::ResponseReceived { request_id, .. }
            | NetworkEvent::LoadingFinished { request_id }
            | NetworkEvent::LoadingFailed { request_id, .. } => request_id,
        }
    }
}

/// Request body decoded by shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RecordedBody {
    #[default]
    Empty,
    Json(Value),
    Form(Vec<(String, String)>),
    Text(String),
}

impl RecordedBody {
    pub fn decode(raw: Option<&str>, content_type: Option<&str>) -> Self {
        let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
            return RecordedBody::Empty;
        };
        let content_type = content_type.unwrap_or_default().to_ascii_lowercase();
        if content_type.starts_with("multipart/") {
            return RecordedBody::Text(format!("<multipart {} bytes>", raw.len()));
        }
        if content_type.contains("x-www-form-urlencoded") {
            return RecordedBody::Form(parse_form(raw));
        }
        if (content_type.contains("json") || content_type.is_empty())
            && let Ok(value) = serde_json::from_str::<Value>(raw)
        {
            return RecordedBody::Json(value);
        }
        if content_type.is_empty() && looks_like_form(raw) {
            return RecordedBody::Form(parse_form(raw));
        }
        RecordedBody::Text(raw.to_string())
    }

    /// Form pairs when the body is a form, else `None`.
    pub fn form(&self) -> Option<&[(String, String)]> {
        match self {
            RecordedBody::Form(pairs) => Some(pairs),
            _ => None,
        }
    }
}
