//! Listing workflow for marketplaces without known persisted-query ids:
//! the user's own recorded create request is mutated and replayed.

use super::orchestrator::validate_payload;
use super::template::{
    CandidateScore, MutationReport, ScoredTemplate, candidate_scores, mutate_variables,
    select_graphql_template, select_upload_template,
};
use crate::config::{ReplayProfile, render_url};
use crate::error::{AgentError, AgentResult};
use crate::flow::{StageError, StageOutcome, StageTranscript};
use crate::form::{encode_form, parse_form};
use crate::http::{InboundResponse, MultipartField, OutboundBody, OutboundRequest, Transport};
use crate::media::{self, NormalizePolicy, NormalizedImage};
use crate::models::{ListingOutcome, ListingPayload, ReplaySession};
use crate::observer::redact::{MASK, contains_mask, redact_form, redact_text, redact_url};
use crate::observer::session::is_secret_header;
use crate::observer::{AmbientSession, ObserverHub, RecordedRequest};
use crate::persisted::parse_envelope;
use crate::scan::{self, Visit, identifier_value, visit_entries_mut};
use crate::store::DiagnosticLog;
use regex::Regex;
use serde::Serialize;
use serde_json::{Value, json};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, warn};

const STRIPPED_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "content-type",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "proxy-connection",
    "accept-encoding",
];

const EXCERPT_LIMIT: usize = 4_000;

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReplayTrace {
    template_id: Option<String>,
    template_score: Option<i32>,
    candidates: Vec<CandidateScore>,
    upload_template_id: Option<String>,
    asset_id: Option<String>,
    listing_id: Option<String>,
    mutation: Option<MutationReport>,
    request: Option<Value>,
    response: Option<Value>,
}

struct Templates {
    create: ScoredTemplate,
    upload: RecordedRequest,
}

struct PreparedReplay {
    create_url: String,
    create_form: Vec<(String, String)>,
    upload_url: String,
}

pub struct TemplateReplayFlow {
    pub marketplace: String,
    pub profile: ReplayProfile,
    pub transport: Arc<dyn Transport>,
    pub observer: Arc<ObserverHub>,
    pub diagnostics: DiagnosticLog,
    pub normalize: NormalizePolicy,
}

impl TemplateReplayFlow {
    /// Always persists a diagnostic snapshot of the attempt, success or not.
    pub async fn create(&self, payload: &ListingPayload) -> ListingOutcome {
        let mut transcript = StageTranscript::new(&self.marketplace);
        let mut trace = ReplayTrace::default();
        let mut result = self.run(payload, &mut transcript, &mut trace).await;

        let status = match &result {
            Ok(_) => "created".to_string(),
            Err(err) => err.source.kind().to_string(),
        };
        let snapshot = json!({ "status": status, "trace": trace });
        let key = self
            .diagnostics
            .record(&self.marketplace, "template_replay", snapshot)
            .await;
        if let Err(StageError {
            source: AgentError::Extraction { snapshot_key, .. },
            ..
        }) = &mut result
        {
            *snapshot_key = key;
        }
        if let Ok((listing_id, url)) = &result {
            info!(target = "agent.listing", marketplace = %self.marketplace, listing_id = %listing_id, url = %url, "listing_replayed");
        }
        transcript.finish(result)
    }

    async fn run(
        &self,
        payload: &ListingPayload,
        transcript: &mut StageTranscript,
        trace: &mut ReplayTrace,
    ) -> Result<(String, String), StageError> {
        transcript
            .capture("validate_payload", async { validate_payload(payload) })
            .await?;

        let templates = transcript
            .capture("select_template", self.select_templates(trace))
            .await?;
        trace.template_id = Some(templates.create.record.id.clone());
        trace.template_score = Some(templates.create.score);
        trace.upload_template_id = Some(templates.upload.id.clone());

        let session = payload.session.clone().unwrap_or_default();
        let prepared = transcript
            .capture("prepare_session", async {
                let prepared = prepare_replay(&templates, &session, &self.profile.identity_fields)?;
                let output = json!({ "fields": prepared.create_form.len() });
                Ok::<_, AgentError>(StageOutcome::new(prepared, output))
            })
            .await?;

        let headers = self.replay_headers(&templates.create.record).await;
        let upload_headers = self.replay_headers(&templates.upload).await;

        let asset_id = transcript
            .capture(
                "upload_photo",
                self.upload_photo(payload, &prepared.upload_url, upload_headers),
            )
            .await?;
        trace.asset_id = Some(asset_id.clone());

        let (form, mutation) = transcript
            .capture("mutate_template", async {
                let (form, report) = apply_mutation(prepared.create_form.clone(), payload, &asset_id)?;
                let output = serde_json::to_value(&report).unwrap_or(Value::Null);
                Ok::<_, AgentError>(StageOutcome::new((form, report), output))
            })
            .await?;
        if mutation.photo_field.is_none() {
            warn!(target = "agent.replay", marketplace = %self.marketplace, "template_without_photo_field");
        }
        trace.mutation = Some(mutation);

        let listing_id = transcript
            .capture(
                "replay_create",
                self.replay_create(&prepared.create_url, form, headers, trace),
            )
            .await?;
        trace.listing_id = Some(listing_id.clone());

        let url = render_url(&self.profile.item_url, &listing_id);
        Ok((listing_id, url))
    }

    async fn select_templates(&self, trace: &mut ReplayTrace) -> AgentResult<StageOutcome<Templates>> {
        let records = self.observer.records(&self.profile.domain).await;
        trace.candidates = candidate_scores(&records, &self.profile);
        if records.is_empty() {
            return Err(AgentError::TemplateNotFound {
                marketplace: self.marketplace.clone(),
                reason: "no recorded requests".into(),
            });
        }
        let create = select_graphql_template(&records, &self.profile).ok_or_else(|| {
            AgentError::TemplateNotFound {
                marketplace: self.marketplace.clone(),
                reason: "no recorded create request qualifies".into(),
            }
        })?;
        let upload = select_upload_template(&records, &self.profile)
            .cloned()
            .ok_or_else(|| AgentError::TemplateNotFound {
                marketplace: self.marketplace.clone(),
                reason: "no recorded upload request".into(),
            })?;
        let output = json!({
            "candidates": records.len(),
            "template": create.record.id,
            "score": create.score,
            "upload": upload.id,
        });
        Ok(StageOutcome::new(Templates { create, upload }, output))
    }

    /// Recorded headers minus transport-managed and secret ones, plus the
    /// live ambient session.
    async fn replay_headers(&self, record: &RecordedRequest) -> Vec<(String, String)> {
        let ambient = self.observer.ambient_session(&self.profile.domain).await;
        replay_headers(&record.headers, &ambient)
    }

    async fn upload_photo(
        &self,
        payload: &ListingPayload,
        url: &str,
        headers: Vec<(String, String)>,
    ) -> AgentResult<StageOutcome<String>> {
        let source = media::load_first(&payload.images, self.transport.as_ref()).await?;
        let image = media::normalize(&source.bytes, &source.name, &self.normalize)?;
        let fields = vec![MultipartField::file(
            self.profile.upload_file_field.clone(),
            image.name.clone(),
            NormalizedImage::CONTENT_TYPE,
            image.bytes.clone(),
        )];
        let request =
            OutboundRequest::post(url, OutboundBody::Multipart(fields)).with_headers(headers);
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(AgentError::UpstreamHttp {
                status: response.status,
                body: excerpt(&response.text(), 512),
            });
        }
        let asset_id = extract_with_fallback(&response, &self.profile.asset_id_keys).ok_or_else(|| {
            AgentError::Extraction {
                what: "asset id".into(),
                snapshot_key: None,
            }
        })?;
        let output = json!({ "assetId": asset_id, "image": image.name, "bytes": image.bytes.len() });
        Ok(StageOutcome::new(asset_id, output))
    }

    async fn replay_create(
        &self,
        url: &str,
        form: Vec<(String, String)>,
        headers: Vec<(String, String)>,
        trace: &mut ReplayTrace,
    ) -> AgentResult<StageOutcome<String>> {
        let body = encode_form(&form);
        if contains_mask(url) || form.iter().any(|(_, v)| contains_mask(v)) {
            return Err(AgentError::validation("session", "unresolved session placeholder"));
        }
        let mut redacted = form;
        redact_form(&mut redacted);
        trace.request = Some(json!({ "url": redact_url(url), "form": redacted }));

        let request = OutboundRequest::post(url, OutboundBody::Form(body)).with_headers(headers);
        let response = self.transport.send(request).await?;
        trace.response = Some(json!({
            "status": response.status,
            "body": redact_text(&excerpt(&response.text(), EXCERPT_LIMIT)),
        }));

        let data = parse_envelope(response.status, response.json(), &response.text())?;
        let listing_id = scan::find_entry(&data, |key, value| {
            self.profile.listing_id_keys.iter().any(|k| k == key) && identifier_value(value).is_some()
        })
        .and_then(|(_, value)| identifier_value(value))
        .or_else(|| extract_with_fallback(&response, &self.profile.listing_id_keys))
        .ok_or_else(|| AgentError::Extraction {
            what: "listing id".into(),
            snapshot_key: None,
        })?;
        Ok(StageOutcome::new(listing_id.clone(), json!({ "listingId": listing_id })))
    }
}

fn prepare_replay(
    templates: &Templates,
    session: &ReplaySession,
    identity_fields: &[String],
) -> AgentResult<PreparedReplay> {
    let pairs = templates
        .create
        .record
        .body
        .form()
        .map(<[(String, String)]>::to_vec)
        .unwrap_or_default();
    Ok(PreparedReplay {
        create_url: substitute_url(&templates.create.record.url, session, identity_fields)?,
        create_form: substitute_pairs(pairs, session, identity_fields)?,
        upload_url: substitute_url(&templates.upload.url, session, identity_fields)?,
    })
}

fn actor_id(session: &ReplaySession) -> AgentResult<&str> {
    session
        .actor_id
        .as_deref()
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| AgentError::validation("session.actorId", "current session actor is unknown"))
}

fn token<'a>(session: &'a ReplaySession, key: &str) -> AgentResult<&'a str> {
    session
        .tokens
        .get(key)
        .map(String::as_str)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            AgentError::validation(
                format!("session.tokens.{key}"),
                "session token missing for redacted field",
            )
        })
}

/// Identity fields take the current actor; masked fields take the current
/// session tokens. JSON-valued fields are rewritten recursively.
pub fn substitute_pairs(
    pairs: Vec<(String, String)>,
    session: &ReplaySession,
    identity_fields: &[String],
) -> AgentResult<Vec<(String, String)>> {
    pairs
        .into_iter()
        .map(|(key, value)| {
            if identity_fields.iter().any(|f| f == &key) {
                return Ok((key, actor_id(session)?.to_string()));
            }
            if value == MASK {
                let fresh = token(session, &key)?.to_string();
                return Ok((key, fresh));
            }
            let trimmed = value.trim_start();
            if (trimmed.starts_with('{') || trimmed.starts_with('['))
                && let Ok(mut parsed) = serde_json::from_str::<Value>(&value)
            {
                fill_session_json(&mut parsed, session, identity_fields)?;
                return Ok((key, parsed.to_string()));
            }
            if contains_mask(&value) {
                return Err(AgentError::validation(
                    format!("session.tokens.{key}"),
                    "redacted text cannot be restored",
                ));
            }
            Ok((key, value))
        })
        .collect()
}

fn fill_session_json(
    root: &mut Value,
    session: &ReplaySession,
    identity_fields: &[String],
) -> AgentResult<()> {
    let mut failure: Option<AgentError> = None;
    visit_entries_mut(root, |key, value| {
        let outcome = if identity_fields.iter().any(|f| f == key) && !value.is_object() {
            actor_id(session).map(|actor| *value = Value::String(actor.to_string()))
        } else if value.as_str() == Some(MASK) {
            token(session, key).map(|fresh| *value = Value::String(fresh.to_string()))
        } else {
            return Visit::Continue;
        };
        match outcome {
            Ok(()) => Visit::SkipChildren,
            Err(err) => {
                failure = Some(err);
                Visit::Stop
            }
        }
    });
    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

pub fn substitute_url(
    url: &str,
    session: &ReplaySession,
    identity_fields: &[String],
) -> AgentResult<String> {
    let Some((base, query)) = url.split_once('?') else {
        return Ok(url.to_string());
    };
    let pairs = substitute_pairs(parse_form(query), session, identity_fields)?;
    Ok(format!("{base}?{}", encode_form(&pairs)))
}

pub fn replay_headers(
    recorded: &BTreeMap<String, String>,
    ambient: &AmbientSession,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = recorded
        .iter()
        .filter(|(name, value)| {
            let name = name.to_ascii_lowercase();
            !STRIPPED_HEADERS.contains(&name.as_str())
                && !is_secret_header(&name)
                && !contains_mask(value)
        })
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    headers.extend(ambient.headers.clone());
    headers
}

fn apply_mutation(
    mut form: Vec<(String, String)>,
    payload: &ListingPayload,
    asset_id: &str,
) -> AgentResult<(Vec<(String, String)>, MutationReport)> {
    let Some((_, raw)) = form.iter_mut().find(|(key, _)| key == "variables") else {
        return Err(AgentError::Extraction {
            what: "template variables".into(),
            snapshot_key: None,
        });
    };
    let mut variables: Value = serde_json::from_str(raw).map_err(|_| AgentError::Extraction {
        what: "template variables".into(),
        snapshot_key: None,
    })?;
    let report = mutate_variables(
        &mut variables,
        payload.title.trim(),
        &payload.description,
        payload.price,
        asset_id,
    );
    *raw = variables.to_string();
    Ok((form, report))
}

/// Structural scan of the JSON body first, then a key/value regex over the
/// raw text for payloads that do not parse.
pub fn extract_with_fallback(response: &InboundResponse, keys: &[String]) -> Option<String> {
    if let Some(body) = response.json()
        && let Some(id) = scan::find_entry(&body, |key, value| {
            keys.iter().any(|k| k == key) && identifier_value(value).is_some()
        })
        .and_then(|(_, value)| identifier_value(value))
    {
        return Some(id);
    }
    let text = response.text();
    keys.iter().find_map(|key| {
        let pattern = format!(r#""{}"\s*:\s*"?([A-Za-z0-9_-]+)"#, regex::escape(key));
        let re = Regex::new(&pattern).ok()?;
        re.captures(&text)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    })
}

fn excerpt(raw: &str, max: usize) -> String {
    raw.chars().take(max).collect()
}
