use crate::config::PersistedOperation;
use crate::error::{AgentError, AgentResult};
use crate::http::{MultipartField, OutboundBody, OutboundRequest, Transport};
use crate::media::NormalizedImage;
use crate::observer::ObserverHub;
use crate::observer::redact::redact_text;
use crate::scan::{self, identifier_value};
use crate::store::DiagnosticLog;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, warn};

/// Keys that plausibly hold an entity identifier in an unversioned payload.
const ID_KEYS: &[&str] = &[
    "id",
    "itemId",
    "listingId",
    "productId",
    "uploadId",
    "photoId",
];

static ID_SHAPED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{4,64}$").expect("id pattern"));

pub fn looks_like_identifier(candidate: &str) -> bool {
    ID_SHAPED.is_match(candidate) && candidate.chars().any(|c| c.is_ascii_digit())
}

/// A successful response: the unwrapped `data` plus the body as received.
#[derive(Debug, Clone)]
pub struct PersistedResponse {
    pub data: Value,
    pub raw: String,
}

/// Persisted-query client for one marketplace API endpoint. Requests carry
/// the session headers captured by the observer.
#[derive(Clone)]
pub struct PersistedQueryClient {
    marketplace: String,
    domain: String,
    api_url: String,
    transport: Arc<dyn Transport>,
    observer: Arc<ObserverHub>,
    diagnostics: DiagnosticLog,
}

impl PersistedQueryClient {
    pub fn new(
        marketplace: impl Into<String>,
        domain: impl Into<String>,
        api_url: impl Into<String>,
        transport: Arc<dyn Transport>,
        observer: Arc<ObserverHub>,
        diagnostics: DiagnosticLog,
    ) -> Self {
        Self {
            marketplace: marketplace.into(),
            domain: domain.into(),
            api_url: api_url.into(),
            transport,
            observer,
            diagnostics,
        }
    }

    pub async fn call(
        &self,
        operation: &PersistedOperation,
        variables: Value,
    ) -> AgentResult<PersistedResponse> {
        let body = operation_body(operation, variables);
        let request = OutboundRequest::post(&self.api_url, OutboundBody::Json(body))
            .with_headers(self.observer.request_headers_for(&self.domain).await);
        debug!(target = "agent.persisted", marketplace = %self.marketplace, operation = %operation.name, "persisted_call");
        let response = self.transport.send(request).await?;
        let raw = response.text();
        let data = parse_envelope(response.status, response.json(), &raw)?;
        Ok(PersistedResponse { data, raw })
    }

    /// Multipart upload: `operations`, `map` and the file as part `1`. The
    /// variable at `variable_path` is sent as null and bound to the file by
    /// the server.
    pub async fn upload(
        &self,
        operation: &PersistedOperation,
        mut variables: Value,
        variable_path: &str,
        file: &NormalizedImage,
    ) -> AgentResult<PersistedResponse> {
        set_path(&mut variables, variable_path, Value::Null);
        let operations = operation_body(operation, variables);
        let map = json!({ "1": [format!("variables.{variable_path}")] });
        let fields = vec![
            MultipartField::text("operations", operations.to_string()),
            MultipartField::text("map", map.to_string()),
            MultipartField::file(
                "1",
                file.name.clone(),
                NormalizedImage::CONTENT_TYPE,
                file.bytes.clone(),
            ),
        ];
        let mut headers = self.observer.request_headers_for(&self.domain).await;
        headers.retain(|(name, _)| !name.eq_ignore_ascii_case("content-type"));
        let request =
            OutboundRequest::post(&self.api_url, OutboundBody::Multipart(fields)).with_headers(headers);
        debug!(
            target = "agent.persisted",
            marketplace = %self.marketplace,
            operation = %operation.name,
            bytes = file.bytes.len(),
            "persisted_upload"
        );
        let response = self.transport.send(request).await?;
        let raw = response.text();
        let data = parse_envelope(response.status, response.json(), &raw)?;
        Ok(PersistedResponse { data, raw })
    }

    /// Three-tier extraction over `data`; a miss persists the raw response
    /// for inspection and fails with the snapshot key.
    pub async fn extract_identifier(
        &self,
        response: &PersistedResponse,
        pointer: Option<&str>,
        what: &str,
    ) -> AgentResult<String> {
        if let Some(id) = find_identifier(&response.data, pointer) {
            return Ok(id);
        }
        let snapshot_key = self
            .diagnostics
            .record(
                &self.marketplace,
                "extraction_failed",
                json!({ "what": what, "pointer": pointer, "response": redact_text(&response.raw) }),
            )
            .await;
        warn!(
            target = "agent.persisted",
            marketplace = %self.marketplace,
            what,
            snapshot = snapshot_key.as_deref().unwrap_or("-"),
            "identifier_extraction_failed"
        );
        Err(AgentError::Extraction {
            what: what.to_string(),
            snapshot_key,
        })
    }
}

pub fn operation_body(operation: &PersistedOperation, variables: Value) -> Value {
    json!({
        "operationName": operation.name,
        "variables": variables,
        "extensions": {
            "persistedQuery": { "version": 1, "sha256Hash": operation.hash }
        }
    })
}

/// Unwraps a GraphQL-style envelope: errors first, then HTTP status, then
/// `data` (or the whole body when there is no `data` member).
pub fn parse_envelope(status: u16, body: Option<Value>, raw: &str) -> AgentResult<Value> {
    if let Some(errors) = body
        .as_ref()
        .and_then(|b| b.get("errors"))
        .and_then(Value::as_array)
        .filter(|errors| !errors.is_empty())
    {
        let message = errors
            .iter()
            .map(|err| match err.get("message").and_then(Value::as_str) {
                Some(message) => message.to_string(),
                None => err.to_string(),
            })
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(AgentError::UpstreamProtocol {
            message,
            details: errors.clone(),
        });
    }
    if !(200..300).contains(&status) {
        return Err(AgentError::UpstreamHttp {
            status,
            body: truncate(raw, 512),
        });
    }
    match body {
        Some(mut body) => Ok(match body.get_mut("data") {
            Some(data) if !data.is_null() => data.take(),
            _ => body,
        }),
        None => Err(AgentError::UpstreamHttp {
            status,
            body: format!("non-JSON response: {}", truncate(raw, 512)),
        }),
    }
}

/// Direct pointer, then any object carrying an id-like key, then an
/// id-shaped string inside an array.
pub fn find_identifier(data: &Value, pointer: Option<&str>) -> Option<String> {
    if let Some(id) = pointer.and_then(|p| data.pointer(p)).and_then(identifier_value) {
        return Some(id);
    }
    if let Some((_, value)) = scan::find_entry(data, |key, value| {
        ID_KEYS.contains(&key) && identifier_value(value).is_some()
    }) {
        return identifier_value(value);
    }
    scan::find(data, |node| {
        node.as_array().is_some_and(|items| {
            items
                .iter()
                .any(|item| item.as_str().is_some_and(looks_like_identifier))
        })
    })
    .and_then(Value::as_array)
    .and_then(|items| {
        items
            .iter()
            .filter_map(Value::as_str)
            .find(|s| looks_like_identifier(s))
            .map(str::to_string)
    })
}

/// Sets a dotted path inside `root`, creating intermediate objects.
pub fn set_path(root: &mut Value, path: &str, value: Value) {
    let mut node = root;
    let mut segments = path.split('.').filter(|s| !s.is_empty()).peekable();
    while let Some(segment) = segments.next() {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn truncate(raw: &str, max: usize) -> String {
    if raw.len() <= max {
        return raw.to_string();
    }
    let mut end = max;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &raw[..end])
}
