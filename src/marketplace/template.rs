//! Pure selection and mutation of recorded requests for template replay.

use crate::config::ReplayProfile;
use crate::form::form_value;
use crate::observer::{RecordedBody, RecordedRequest, host_matches};
use crate::scan::{Visit, visit_entries_mut};
use serde::Serialize;
use serde_json::{Number, Value};

const LISTING_TERMS_WEIGHT: i32 = 10;
const CREATE_TERMS_WEIGHT: i32 = 5;
const DOCUMENT_ID_WEIGHT: i32 = 5;
const VARIABLES_WEIGHT: i32 = 2;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredTemplate {
    pub record: RecordedRequest,
    pub score: i32,
}

fn is_internal_post(record: &RecordedRequest, profile: &ReplayProfile, marker: &str) -> bool {
    record.is_post() && host_matches(&record.url, &profile.domain) && record.url.contains(marker)
}

/// Text the scoring terms are matched against: URL, operation naming and
/// the variables block.
fn haystack(record: &RecordedRequest) -> String {
    let mut parts = vec![record.url.clone()];
    if let Some(name) = record.headers.get("x-fb-friendly-name") {
        parts.push(name.clone());
    }
    match &record.body {
        RecordedBody::Form(pairs) => {
            for key in ["fb_api_req_friendly_name", "operationName", "variables"] {
                if let Some(value) = form_value(pairs, key) {
                    parts.push(value.to_string());
                }
            }
        }
        RecordedBody::Json(body) => parts.push(body.to_string()),
        RecordedBody::Text(text) => parts.push(text.clone()),
        RecordedBody::Empty => {}
    }
    parts.join(" ").to_lowercase()
}

fn has_document_id(body: &RecordedBody) -> bool {
    match body {
        RecordedBody::Form(pairs) => form_value(pairs, "doc_id").is_some_and(|v| !v.is_empty()),
        RecordedBody::Json(value) => value.get("doc_id").is_some() || value.get("documentId").is_some(),
        _ => false,
    }
}

fn has_variables(body: &RecordedBody) -> bool {
    match body {
        RecordedBody::Form(pairs) => form_value(pairs, "variables").is_some(),
        RecordedBody::Json(value) => value.get("variables").is_some_and(Value::is_object),
        _ => false,
    }
}

fn term_score(record: &RecordedRequest, profile: &ReplayProfile) -> i32 {
    let text = haystack(record);
    let mentions = |terms: &[String]| terms.iter().any(|t| text.contains(&t.to_lowercase()));
    let mut score = 0;
    if mentions(&profile.listing_terms) {
        score += LISTING_TERMS_WEIGHT;
    }
    if mentions(&profile.create_terms) {
        score += CREATE_TERMS_WEIGHT;
    }
    score
}

/// `None` for requests that cannot be a template at all.
pub fn score_candidate(record: &RecordedRequest, profile: &ReplayProfile) -> Option<i32> {
    if !is_internal_post(record, profile, &profile.api_path_marker) {
        return None;
    }
    let mut score = term_score(record, profile);
    if has_document_id(&record.body) {
        score += DOCUMENT_ID_WEIGHT;
    }
    if has_variables(&record.body) {
        score += VARIABLES_WEIGHT;
    }
    Some(score)
}

/// Only form-encoded requests that mention a listing or create term can
/// be replayed.
fn qualifies(record: &RecordedRequest, profile: &ReplayProfile) -> bool {
    record.body.form().is_some() && term_score(record, profile) > 0
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateScore {
    pub id: String,
    pub url: String,
    pub score: i32,
    pub qualifies: bool,
}

/// Every scorable record in recording order, including the ones that
/// cannot win.
pub fn candidate_scores(records: &[RecordedRequest], profile: &ReplayProfile) -> Vec<CandidateScore> {
    records
        .iter()
        .filter_map(|record| {
            score_candidate(record, profile).map(|score| CandidateScore {
                id: record.id.clone(),
                url: record.url.clone(),
                score,
                qualifies: qualifies(record, profile),
            })
        })
        .collect()
}

/// Highest score wins; on ties the most recent record.
pub fn select_graphql_template(
    records: &[RecordedRequest],
    profile: &ReplayProfile,
) -> Option<ScoredTemplate> {
    let mut best: Option<ScoredTemplate> = None;
    for record in records {
        let Some(score) = score_candidate(record, profile) else {
            continue;
        };
        if !qualifies(record, profile) {
            continue;
        }
        if best.as_ref().is_none_or(|current| score >= current.score) {
            best = Some(ScoredTemplate {
                record: record.clone(),
                score,
            });
        }
    }
    best
}

pub fn select_upload_template<'a>(
    records: &'a [RecordedRequest],
    profile: &ReplayProfile,
) -> Option<&'a RecordedRequest> {
    records
        .iter()
        .find(|record| is_internal_post(record, profile, &profile.upload_path_marker))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationReport {
    pub title_fields: usize,
    pub description_fields: usize,
    pub price_fields: usize,
    pub photo_field: Option<String>,
}

/// Rewrites title/description/price leaves when the recorded value has a
/// compatible type, and points the first photo/image list at `asset_id`.
pub fn mutate_variables(
    variables: &mut Value,
    title: &str,
    description: &str,
    price: f64,
    asset_id: &str,
) -> MutationReport {
    let mut report = MutationReport::default();
    visit_entries_mut(variables, |key, value| {
        let key_lower = key.to_lowercase();
        if key_lower.contains("title") && replace_text(value, title) {
            report.title_fields += 1;
            return Visit::SkipChildren;
        }
        if key_lower.contains("description") && replace_text(value, description) {
            report.description_fields += 1;
            return Visit::SkipChildren;
        }
        if key_lower.contains("price") && replace_price(value, price) {
            report.price_fields += 1;
            return Visit::SkipChildren;
        }
        if report.photo_field.is_none()
            && (key_lower.contains("photo") || key_lower.contains("image"))
            && value.is_array()
        {
            *value = Value::Array(vec![Value::String(asset_id.to_string())]);
            report.photo_field = Some(key.to_string());
            return Visit::SkipChildren;
        }
        Visit::Continue
    });
    report
}

/// Strings are replaced directly; `{ "text": "..." }` wrappers keep their
/// shape.
fn replace_text(value: &mut Value, text: &str) -> bool {
    match value {
        Value::String(current) => {
            *current = text.to_string();
            true
        }
        Value::Object(map) if map.get("text").is_some_and(Value::is_string) => {
            map.insert("text".into(), Value::String(text.to_string()));
            true
        }
        _ => false,
    }
}

fn replace_price(value: &mut Value, price: f64) -> bool {
    match value {
        Value::Number(current) => {
            let replacement = if current.is_f64() {
                Number::from_f64(price)
            } else {
                Some(Number::from(price.round() as i64))
            };
            match replacement {
                Some(number) => {
                    *current = number;
                    true
                }
                None => false,
            }
        }
        Value::String(current) => {
            *current = format_price(price);
            true
        }
        _ => false,
    }
}

fn format_price(price: f64) -> String {
    if price.fract() == 0.0 {
        format!("{}", price as i64)
    } else {
        format!("{price:.2}")
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::config::{MarketplaceProfile, MarketplaceProfiles};
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap;

    pub fn beta_profile() -> ReplayProfile {
        match MarketplaceProfiles::builtin().unwrap().get("beta") {
            Some(MarketplaceProfile::TemplateReplay(profile)) => profile.clone(),
            _ => panic!("beta profile missing"),
        }
    }

    pub fn record(id: &str, method: &str, url: &str, pairs: &[(&str, &str)]) -> RecordedRequest {
        let body = if pairs.is_empty() {
            RecordedBody::Empty
        } else {
            RecordedBody::Form(
                pairs
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            )
        };
        RecordedRequest {
            id: id.into(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            method: method.into(),
            url: url.into(),
            request_type: "fetch".into(),
            initiator_origin: None,
            body,
            headers: BTreeMap::new(),
            status_code: Some(200),
            served_from_cache: Some(false),
            transport_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::{beta_profile, record};
    use super::*;
    use serde_json::json;

    const API: &str = "https://www.beta-market.example/api/graphql/";

    #[test]
    fn create_mutation_outscores_queries() {
        let profile = beta_profile();
        let create = record(
            "c",
            "POST",
            API,
            &[
                ("fb_api_req_friendly_name", "MarketplaceComposerCreateMutation"),
                ("doc_id", "123"),
                ("variables", r#"{"input":{}}"#),
            ],
        );
        let query = record("q", "POST", API, &[("doc_id", "9"), ("variables", "{}")]);
        assert_eq!(score_candidate(&create, &profile), Some(22));
        assert_eq!(score_candidate(&query, &profile), Some(7));
        let chosen = select_graphql_template(&[create, query], &profile).unwrap();
        assert_eq!(chosen.record.id, "c");
    }

    #[test]
    fn non_candidates_are_excluded() {
        let profile = beta_profile();
        let get = record("g", "GET", API, &[]);
        let foreign = record("f", "POST", "https://cdn.other.example/api/graphql/", &[("doc_id", "1")]);
        assert_eq!(score_candidate(&get, &profile), None);
        assert_eq!(score_candidate(&foreign, &profile), None);
        let plain_query = record("q", "POST", API, &[("doc_id", "9"), ("variables", "{}")]);
        assert!(select_graphql_template(&[get, foreign, plain_query], &profile).is_none());
        assert!(select_graphql_template(&[], &profile).is_none());
    }

    #[test]
    fn every_scorable_candidate_is_reported() {
        let profile = beta_profile();
        let records = vec![
            record("g", "GET", API, &[]),
            record("q", "POST", API, &[("doc_id", "9"), ("variables", "{}")]),
            record(
                "c",
                "POST",
                API,
                &[("fb_api_req_friendly_name", "MarketplaceComposerCreateMutation"), ("doc_id", "1")],
            ),
        ];
        let scores = candidate_scores(&records, &profile);
        let summary: Vec<(&str, i32, bool)> = scores
            .iter()
            .map(|c| (c.id.as_str(), c.score, c.qualifies))
            .collect();
        assert_eq!(summary, vec![("q", 7, false), ("c", 20, true)]);
    }

    #[test]
    fn ties_go_to_the_most_recent() {
        let profile = beta_profile();
        let pairs = [("doc_id", "1"), ("variables", r#"{"marketplace_listing":true}"#)];
        let older = record("old", "POST", API, &pairs);
        let newer = record("new", "POST", API, &pairs);
        let chosen = select_graphql_template(&[older, newer], &profile).unwrap();
        assert_eq!(chosen.record.id, "new");
    }

    #[test]
    fn upload_template_is_first_upload_post() {
        let profile = beta_profile();
        let records = vec![
            record("a", "POST", API, &[("doc_id", "1")]),
            record("u1", "POST", "https://upload.beta-market.example/ajax/upload/photos", &[]),
            record("u2", "POST", "https://upload.beta-market.example/ajax/upload/photos", &[]),
        ];
        assert_eq!(select_upload_template(&records, &profile).unwrap().id, "u1");
    }

    #[test]
    fn mutation_respects_types_and_first_photo_list() {
        let mut vars = json!({
            "input": {
                "data": {
                    "common": {
                        "title": "old",
                        "description": {"text": "old desc"},
                        "item_price": {"price": "10", "currency": "USD"},
                        "photo_ids": ["1", "2"],
                        "photo_meta": [],
                        "title_flags": {"bold": true}
                    }
                },
                "list_price": 3
            }
        });
        let report = mutate_variables(&mut vars, "Lamp", "Brass lamp", 25.5, "555");
        let common = &vars["input"]["data"]["common"];
        assert_eq!(common["title"], "Lamp");
        assert_eq!(common["description"]["text"], "Brass lamp");
        assert_eq!(common["item_price"]["price"], "25.50");
        assert_eq!(common["item_price"]["currency"], "USD");
        assert_eq!(vars["input"]["list_price"], 26);
        assert_eq!(common["title_flags"], json!({"bold": true}));
        assert_eq!(report.title_fields, 1);
        assert_eq!(report.price_fields, 2);
        let photo_lists = [&common["photo_ids"], &common["photo_meta"]];
        assert_eq!(
            photo_lists.iter().filter(|v| **v == &json!(["555"])).count(),
            1
        );
        assert!(report.photo_field.is_some());
    }
}
