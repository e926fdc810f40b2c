use crate::error::{AgentError, AgentResult};
use async_trait::async_trait;
use reqwest::{Client, Method, multipart};
use serde_json::Value;
use std::{collections::BTreeMap, time::Duration};

pub fn build_client() -> Client {
    let timeout = std::env::var("HTTP_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(30);
    let connect = std::env::var("HTTP_CONNECT_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(5);
    Client::builder()
        .timeout(Duration::from_secs(timeout))
        .connect_timeout(Duration::from_secs(connect))
        .gzip(true)
        .brotli(true)
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[derive(Debug, Clone)]
pub enum OutboundBody {
    Empty,
    Json(Value),
    /// Already url-encoded `k=v&k2=v2`.
    Form(String),
    Multipart(Vec<MultipartField>),
}

impl OutboundBody {
    /// Flattened text view, used for logging and diagnostics.
    pub fn preview(&self) -> String {
        match self {
            OutboundBody::Empty => String::new(),
            OutboundBody::Json(value) => value.to_string(),
            OutboundBody::Form(raw) => raw.clone(),
            OutboundBody::Multipart(fields) => fields
                .iter()
                .map(|field| match &field.value {
                    MultipartValue::Text(text) => format!("{}={}", field.name, text),
                    MultipartValue::File {
                        file_name, bytes, ..
                    } => format!("{}=<{} {} bytes>", field.name, file_name, bytes.len()),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultipartField {
    pub name: String,
    pub value: MultipartValue,
}

#[derive(Debug, Clone)]
pub enum MultipartValue {
    Text(String),
    File {
        file_name: String,
        content_type: String,
        bytes: Vec<u8>,
    },
}

impl MultipartField {
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: MultipartValue::Text(value.into()),
        }
    }

    pub fn file(
        name: impl Into<String>,
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            name: name.into(),
            value: MultipartValue::File {
                file_name: file_name.into(),
                content_type: content_type.into(),
                bytes,
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: OutboundBody,
}

impl OutboundRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: OutboundBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>, body: OutboundBody) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_headers<I>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.headers.extend(headers);
        self
    }
}

#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl InboundResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parses the body as JSON, tolerating anti-hijacking prefixes such as
    /// `for (;;);` or `)]}'` in front of the payload.
    pub fn json(&self) -> Option<Value> {
        let text = self.text();
        let trimmed = text.trim();
        if let Ok(value) = serde_json::from_str(trimmed) {
            return Some(value);
        }
        let start = trimmed.find(['{', '['])?;
        serde_json::from_str(&trimmed[start..]).ok()
    }
}

/// Outbound seam for every marketplace call.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> AgentResult<InboundResponse>;
}

pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: build_client(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: OutboundRequest) -> AgentResult<InboundResponse> {
        let mut builder = self.client.request(request.method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match request.body {
            OutboundBody::Empty => builder,
            OutboundBody::Json(value) => builder.json(&value),
            OutboundBody::Form(raw) => builder
                .header(
                    reqwest::header::CONTENT_TYPE,
                    "application/x-www-form-urlencoded",
                )
                .body(raw),
            OutboundBody::Multipart(fields) => builder.multipart(build_form(fields)?),
        };
        let response = builder
            .send()
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|err| AgentError::Transport(err.to_string()))?
            .to_vec();
        Ok(InboundResponse {
            status,
            headers,
            body,
        })
    }
}

fn build_form(fields: Vec<MultipartField>) -> AgentResult<multipart::Form> {
    let mut form = multipart::Form::new();
    for field in fields {
        form = match field.value {
            MultipartValue::Text(text) => form.text(field.name, text),
            MultipartValue::File {
                file_name,
                content_type,
                bytes,
            } => {
                let part = multipart::Part::bytes(bytes)
                    .file_name(file_name)
                    .mime_str(&content_type)
                    .map_err(|err| AgentError::Transport(err.to_string()))?;
                form.part(field.name, part)
            }
        };
    }
    Ok(form)
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    struct Route {
        url_fragment: String,
        body_marker: Option<String>,
        response: InboundResponse,
        once: bool,
        used: bool,
    }

    /// In-memory transport answering from scripted routes and keeping every
    /// request it was asked to send.
    #[derive(Default)]
    pub struct ScriptedTransport {
        routes: Mutex<Vec<Route>>,
        sent: Mutex<Vec<OutboundRequest>>,
    }

    pub fn json_response(status: u16, body: Value) -> InboundResponse {
        InboundResponse {
            status,
            headers: BTreeMap::from([("content-type".into(), "application/json".into())]),
            body: body.to_string().into_bytes(),
        }
    }

    pub fn text_response(status: u16, body: &str) -> InboundResponse {
        InboundResponse {
            status,
            headers: BTreeMap::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    impl ScriptedTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn route(&self, url_fragment: &str, body_marker: Option<&str>, response: InboundResponse) {
            self.push(url_fragment, body_marker, response, false);
        }

        pub fn route_once(
            &self,
            url_fragment: &str,
            body_marker: Option<&str>,
            response: InboundResponse,
        ) {
            self.push(url_fragment, body_marker, response, true);
        }

        fn push(&self, url_fragment: &str, marker: Option<&str>, response: InboundResponse, once: bool) {
            self.routes.lock().unwrap().push(Route {
                url_fragment: url_fragment.to_string(),
                body_marker: marker.map(str::to_string),
                response,
                once,
                used: false,
            });
        }

        pub fn sent(&self) -> Vec<OutboundRequest> {
            self.sent.lock().unwrap().clone()
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send(&self, request: OutboundRequest) -> AgentResult<InboundResponse> {
            let preview = request.body.preview();
            self.sent.lock().unwrap().push(request.clone());
            let mut routes = self.routes.lock().unwrap();
            let route = routes.iter_mut().find(|route| {
                !(route.once && route.used)
                    && request.url.contains(&route.url_fragment)
                    && route
                        .body_marker
                        .as_ref()
                        .is_none_or(|marker| preview.contains(marker.as_str()))
            });
            match route {
                Some(route) => {
                    route.used = true;
                    Ok(route.response.clone())
                }
                None => Err(AgentError::Transport(format!(
                    "no scripted response for {}",
                    request.url
                ))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_tolerates_hijacking_prefix() {
        let response = InboundResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: br#"for (;;);{"payload":{"id":"42"}}"#.to_vec(),
        };
        assert_eq!(response.json(), Some(json!({"payload": {"id": "42"}})));
    }

    #[test]
    fn multipart_preview_hides_file_bytes() {
        let body = OutboundBody::Multipart(vec![
            MultipartField::text("map", r#"{"1":["variables.file"]}"#),
            MultipartField::file("1", "a.jpg", "image/jpeg", vec![0; 10]),
        ]);
        let preview = body.preview();
        assert!(preview.contains("map="));
        assert!(preview.contains("<a.jpg 10 bytes>"));
    }
}
