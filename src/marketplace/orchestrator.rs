//! Listing workflow for marketplaces that expose persisted-query operations.

use crate::config::{PersistedProfile, render_url};
use crate::defaults::{DefaultsStore, ListingDefaults};
use crate::error::{AgentError, AgentResult};
use crate::flow::{StageError, StageOutcome, StageTranscript};
use crate::http::Transport;
use crate::media::{self, NormalizePolicy};
use crate::models::{ListingInput, ListingOutcome, ListingPayload, Suggestion};
use crate::persisted::PersistedQueryClient;
use crate::poll::{PollPolicy, poll_until};
use crate::scan::{self, numeric_value};
use serde_json::{Value, json};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, info};

/// Provisional: marketplace fee applied when the caller supplies none.
pub const DEFAULT_FEE_RATE: f64 = 0.10;

/// Provisional free-text condition table. More specific phrases come first.
const CONDITION_PHRASES: &[(&str, i64)] = &[
    ("new without tags", 2),
    ("like new", 2),
    ("brand new", 1),
    ("new with tags", 1),
    ("new", 1),
    ("excellent", 2),
    ("very good", 3),
    ("good", 3),
    ("used", 3),
    ("fair", 4),
    ("acceptable", 4),
    ("for parts", 5),
    ("damaged", 5),
    ("poor", 5),
];

const ZIP_KEYS: &[&str] = &["zipCode", "zip_code", "postalCode", "postal_code", "zip"];

pub fn condition_from_text(text: &str) -> Option<i64> {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let padded = format!(" {} ", normalized.split_whitespace().collect::<Vec<_>>().join(" "));
    CONDITION_PHRASES
        .iter()
        .find(|(phrase, _)| padded.contains(&format!(" {phrase} ")))
        .map(|(_, id)| *id)
}

/// Five-digit region code: digits only, truncated or left-padded.
pub fn normalize_region(raw: &str) -> Option<String> {
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    let truncated: String = digits.chars().take(5).collect();
    Some(format!("{truncated:0>5}"))
}

pub fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn default_fee(price_minor: i64) -> i64 {
    (price_minor as f64 * DEFAULT_FEE_RATE).round() as i64
}

/// Pulls classification attributes out of an arbitrary suggestion payload.
pub fn parse_suggestion(data: &Value) -> Suggestion {
    Suggestion {
        category_id: find_number(data, &["categoryId", "category_id"], "category"),
        brand_id: find_number(data, &["brandId", "brand_id"], "brand"),
        condition_id: find_number(data, &["conditionId", "condition_id"], "condition"),
        size_id: find_number(data, &["sizeId", "size_id"], "size"),
        shipping_weight: scan::find_entry(data, |key, value| {
            matches!(key, "shippingWeight" | "packageWeight" | "weight")
                && value.as_f64().is_some_and(|w| w > 0.0)
        })
        .and_then(|(_, value)| value.as_f64()),
    }
}

/// `flat_keys` holding a positive number, or an `object_key` object with a
/// numeric `id`.
fn find_number(data: &Value, flat_keys: &[&str], object_key: &str) -> Option<i64> {
    let positive = |value: &Value| numeric_value(value).filter(|n| *n > 0);
    scan::find_entry(data, |key, value| {
        (flat_keys.contains(&key) && positive(value).is_some())
            || (key == object_key && value.get("id").and_then(positive).is_some())
    })
    .and_then(|(key, value)| {
        if key == object_key {
            value.get("id").and_then(positive)
        } else {
            positive(value)
        }
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAttributes {
    pub category_id: i64,
    pub condition_id: i64,
    pub brand_id: Option<i64>,
    pub size_id: Option<i64>,
}

pub fn resolve_attributes(
    payload: &ListingPayload,
    suggestion: &Suggestion,
    defaults: &ListingDefaults,
) -> AgentResult<ResolvedAttributes> {
    let positive = |v: &Option<i64>| v.filter(|n| *n > 0);
    let category_id = positive(&payload.category_id)
        .or(positive(&suggestion.category_id))
        .ok_or_else(|| AgentError::validation("categoryId", "category could not be resolved"))?;
    let condition_id = positive(&payload.condition_id)
        .or(positive(&suggestion.condition_id))
        .or(defaults.int("conditionId").filter(|n| *n > 0))
        .or_else(|| payload.condition.as_deref().and_then(condition_from_text))
        .ok_or_else(|| AgentError::validation("conditionId", "condition could not be resolved"))?;
    Ok(ResolvedAttributes {
        category_id,
        condition_id,
        brand_id: positive(&payload.brand_id).or(positive(&suggestion.brand_id)),
        size_id: positive(&payload.size_id).or(positive(&suggestion.size_id)),
    })
}

pub fn assemble_input(
    payload: &ListingPayload,
    photo_id: String,
    attributes: &ResolvedAttributes,
    zip_code: String,
    suggestion: &Suggestion,
    defaults: &ListingDefaults,
    profile: &PersistedProfile,
) -> ListingInput {
    let price = to_minor_units(payload.price);
    let sales_fee = payload
        .sales_fee
        .map(to_minor_units)
        .unwrap_or_else(|| default_fee(price));
    ListingInput {
        photo_ids: vec![photo_id],
        name: payload.title.trim().to_string(),
        price,
        description: payload.description.clone(),
        category_id: attributes.category_id,
        condition_id: attributes.condition_id,
        zip_code,
        shipping_payer_id: payload
            .shipping_payer_id
            .or(defaults.int("shippingPayerId"))
            .unwrap_or(profile.shipping.payer_id),
        shipping_class_ids: payload
            .shipping_class_ids
            .clone()
            .filter(|ids| !ids.is_empty())
            .or(defaults.int_list("shippingClassIds"))
            .unwrap_or_else(|| profile.shipping.class_ids.clone()),
        sales_fee,
        brand_id: attributes.brand_id,
        shipping_package_weight: payload
            .weight
            .or(suggestion.shipping_weight)
            .filter(|w| *w > 0.0),
        size_id: attributes.size_id,
        min_price_for_auto_price_drop: payload
            .min_price_for_auto_drop
            .map(to_minor_units)
            .filter(|p| *p > 0),
    }
}

pub struct PersistedQueryFlow {
    pub marketplace: String,
    pub profile: PersistedProfile,
    pub client: PersistedQueryClient,
    pub transport: Arc<dyn Transport>,
    pub defaults: Arc<DefaultsStore>,
    pub normalize: NormalizePolicy,
    pub suggestion_poll: PollPolicy,
}

impl PersistedQueryFlow {
    pub async fn create(&self, payload: &ListingPayload) -> ListingOutcome {
        let mut transcript = StageTranscript::new(&self.marketplace);
        let result = self.run(payload, &mut transcript).await;
        if let Ok((listing_id, url)) = &result {
            info!(target = "agent.listing", marketplace = %self.marketplace, listing_id = %listing_id, url = %url, "listing_created");
        }
        transcript.finish(result)
    }

    async fn run(
        &self,
        payload: &ListingPayload,
        transcript: &mut StageTranscript,
    ) -> Result<(String, String), StageError> {
        transcript
            .capture("validate_payload", async { validate_payload(payload) })
            .await?;
        let defaults = self.defaults.get(&self.marketplace).await;

        let zip_code = transcript
            .capture("resolve_region", self.resolve_region(payload, &defaults))
            .await?;

        let photo_id = transcript
            .capture("upload_photo", self.upload_photo(payload))
            .await?;

        let suggestion = transcript
            .capture("suggest_attributes", self.suggest(&photo_id))
            .await?;

        let attributes = transcript
            .capture("resolve_attributes", async {
                let attributes = resolve_attributes(payload, &suggestion, &defaults)?;
                let output = json!({
                    "categoryId": attributes.category_id,
                    "conditionId": attributes.condition_id,
                    "brandId": attributes.brand_id,
                    "sizeId": attributes.size_id,
                });
                Ok::<_, AgentError>(StageOutcome::new(attributes, output))
            })
            .await?;

        let input = transcript
            .capture("assemble_input", async {
                let input = assemble_input(
                    payload,
                    photo_id.clone(),
                    &attributes,
                    zip_code.clone(),
                    &suggestion,
                    &defaults,
                    &self.profile,
                );
                let output = json!({
                    "price": input.price,
                    "salesFee": input.sales_fee,
                    "shippingPayerId": input.shipping_payer_id,
                    "shippingClassIds": input.shipping_class_ids,
                });
                Ok::<_, AgentError>(StageOutcome::new(input, output))
            })
            .await?;

        let (listing_id, url) = transcript
            .capture("create_listing", self.submit(&input))
            .await?;

        transcript
            .capture("remember_defaults", self.remember(&input))
            .await?;

        Ok((listing_id, url))
    }

    async fn resolve_region(
        &self,
        payload: &ListingPayload,
        defaults: &ListingDefaults,
    ) -> AgentResult<StageOutcome<String>> {
        if let Some(zip) = payload.zip_code.as_deref().and_then(normalize_region) {
            return Ok(StageOutcome::new(zip, json!({"source": "payload"})));
        }
        if let Some(zip) = defaults.text("zipCode").as_deref().and_then(normalize_region) {
            return Ok(StageOutcome::new(zip, json!({"source": "defaults"})));
        }
        let context = self
            .client
            .call(&self.profile.operations.listing_context, json!({}))
            .await;
        let from_context = match context {
            Ok(response) => scan::find_entry(&response.data, |key, value| {
                ZIP_KEYS.contains(&key) && scan::identifier_value(value).is_some()
            })
            .and_then(|(_, value)| scan::identifier_value(value))
            .and_then(|raw| normalize_region(&raw)),
            Err(err) => {
                debug!(target = "agent.listing", marketplace = %self.marketplace, error = %err, "listing_context_unavailable");
                None
            }
        };
        match from_context {
            Some(zip) => Ok(StageOutcome::new(zip, json!({"source": "listing_context"}))),
            None => Err(AgentError::validation(
                "zipCode",
                "region code could not be resolved",
            )),
        }
    }

    async fn upload_photo(&self, payload: &ListingPayload) -> AgentResult<StageOutcome<String>> {
        let source = media::load_first(&payload.images, self.transport.as_ref()).await?;
        let image = media::normalize(&source.bytes, &source.name, &self.normalize)?;
        let operation = &self.profile.operations.upload_photo;
        let response = self
            .client
            .upload(
                operation,
                json!({}),
                &self.profile.upload_variable_path,
                &image,
            )
            .await?;
        let photo_id = self
            .client
            .extract_identifier(&response, operation.id_pointer.as_deref(), "photo id")
            .await?;
        let output = json!({
            "photoId": photo_id,
            "image": image.name,
            "bytes": image.bytes.len(),
            "note": image.note,
        });
        Ok(StageOutcome::new(photo_id, output))
    }

    /// Best effort: any failure or timeout yields an empty suggestion.
    async fn suggest(&self, photo_id: &str) -> AgentResult<StageOutcome<Suggestion>> {
        let operation = &self.profile.operations.suggest;
        let mut variables = serde_json::Map::new();
        variables.insert(
            self.profile.suggest_photo_variable.clone(),
            Value::String(photo_id.to_string()),
        );
        let variables = Value::Object(variables);
        let found = poll_until(&self.suggestion_poll, || {
            let variables = variables.clone();
            async move {
                match self.client.call(operation, variables).await {
                    Ok(response) => Some(parse_suggestion(&response.data)).filter(|s| !s.is_empty()),
                    Err(err) => {
                        debug!(target = "agent.listing", marketplace = %self.marketplace, error = %err, "suggestion_attempt_failed");
                        None
                    }
                }
            }
        })
        .await;
        let suggestion = found.unwrap_or_else(|| {
            debug!(target = "agent.listing", marketplace = %self.marketplace, "suggestion_fallback");
            Suggestion::default()
        });
        let output = serde_json::to_value(&suggestion).unwrap_or(Value::Null);
        Ok(StageOutcome::new(suggestion, output))
    }

    async fn submit(&self, input: &ListingInput) -> AgentResult<StageOutcome<(String, String)>> {
        let operation = &self.profile.operations.create_listing;
        let input_value =
            serde_json::to_value(input).map_err(|err| AgentError::validation("input", err.to_string()))?;
        let response = self
            .client
            .call(operation, json!({ "input": input_value }))
            .await?;
        let listing_id = self
            .client
            .extract_identifier(&response, operation.id_pointer.as_deref(), "listing id")
            .await?;
        let url = self.listing_url(&listing_id);
        let output = json!({ "listingId": listing_id, "url": url });
        Ok(StageOutcome::new((listing_id, url), output))
    }

    /// Identifiers in the alternate namespace live under a different host.
    pub fn listing_url(&self, listing_id: &str) -> String {
        let prefix = self.profile.alternate_id_prefix.as_str();
        if !prefix.is_empty() && listing_id.starts_with(prefix) {
            render_url(&self.profile.alternate_item_url, listing_id)
        } else {
            render_url(&self.profile.item_url, listing_id)
        }
    }

    async fn remember(&self, input: &ListingInput) -> AgentResult<StageOutcome<()>> {
        let mut updates = BTreeMap::from([
            ("zipCode".to_string(), json!(input.zip_code)),
            ("categoryId".to_string(), json!(input.category_id)),
            ("conditionId".to_string(), json!(input.condition_id)),
            ("shippingPayerId".to_string(), json!(input.shipping_payer_id)),
            ("shippingClassIds".to_string(), json!(input.shipping_class_ids)),
        ]);
        if let Some(brand) = input.brand_id {
            updates.insert("brandId".into(), json!(brand));
        }
        if let Some(size) = input.size_id {
            updates.insert("sizeId".into(), json!(size));
        }
        let merged = self.defaults.merge(&self.marketplace, updates).await;
        Ok(StageOutcome::new((), json!({ "keys": merged.values.keys().collect::<Vec<_>>() })))
    }
}

pub(super) fn validate_payload(payload: &ListingPayload) -> AgentResult<StageOutcome<()>> {
    if payload.title.trim().is_empty() {
        return Err(AgentError::validation("title", "title is required"));
    }
    if !payload.price.is_finite() || payload.price <= 0.0 {
        return Err(AgentError::validation("price", "price must be positive"));
    }
    if payload.images.is_empty() {
        return Err(AgentError::validation("images", "at least one image is required"));
    }
    Ok(StageOutcome::new(
        (),
        json!({ "title": payload.title.trim(), "images": payload.images.len() }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MarketplaceProfile, MarketplaceProfiles};
    use crate::http::testing::{ScriptedTransport, json_response};
    use crate::media::normalize::fixtures;
    use crate::models::ImageRef;
    use crate::observer::ObserverHub;
    use crate::store::{DiagnosticLog, MemoryStore};
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

    fn alpha_profile() -> PersistedProfile {
        match MarketplaceProfiles::builtin().unwrap().get("alpha") {
            Some(MarketplaceProfile::PersistedQuery(profile)) => profile.clone(),
            _ => panic!("alpha profile missing"),
        }
    }

    struct Harness {
        transport: Arc<ScriptedTransport>,
        defaults: Arc<DefaultsStore>,
        flow: PersistedQueryFlow,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let transport = Arc::new(ScriptedTransport::new());
        let profile = alpha_profile();
        let observer = Arc::new(ObserverHub::new(vec![], 10, store.clone()));
        let client = PersistedQueryClient::new(
            "alpha",
            profile.domain.clone(),
            profile.api_url.clone(),
            transport.clone(),
            observer,
            DiagnosticLog::new(store.clone()),
        );
        let defaults = Arc::new(DefaultsStore::new(store));
        let flow = PersistedQueryFlow {
            marketplace: "alpha".into(),
            profile,
            client,
            transport: transport.clone(),
            defaults: defaults.clone(),
            normalize: NormalizePolicy::default(),
            suggestion_poll: PollPolicy::once(),
        };
        Harness {
            transport,
            defaults,
            flow,
        }
    }

    fn payload() -> ListingPayload {
        let jpeg = fixtures::jpeg(64, 48, 90);
        ListingPayload {
            title: "Trail shoes".into(),
            description: "Barely worn".into(),
            price: 42.5,
            images: vec![ImageRef::Location(format!(
                "data:image/jpeg;base64,{}",
                BASE64.encode(jpeg)
            ))],
            zip_code: Some("2134".into()),
            condition: Some("Brand New".into()),
            ..ListingPayload::default()
        }
    }

    fn script_upload(transport: &ScriptedTransport) {
        transport.route(
            "/v1/api",
            Some("uploadTempListingPhotos"),
            json_response(200, json!({"data": {"uploadTempListingPhotos": {"uploadIds": ["up_001"]}}})),
        );
    }

    fn sent_operations(transport: &ScriptedTransport) -> Vec<String> {
        transport
            .sent()
            .iter()
            .map(|request| request.body.preview())
            .collect()
    }

    #[test]
    fn brand_new_maps_deterministically() {
        for _ in 0..3 {
            assert_eq!(condition_from_text("Brand New"), Some(1));
        }
        assert_eq!(condition_from_text("like new!"), Some(2));
        assert_eq!(condition_from_text("New without tags"), Some(2));
        assert_eq!(condition_from_text("good"), Some(3));
        assert_eq!(condition_from_text("renewed"), None);
        assert_eq!(condition_from_text(""), None);
    }

    #[test]
    fn region_codes_are_normalized() {
        assert_eq!(normalize_region("2134").as_deref(), Some("02134"));
        assert_eq!(normalize_region("94107-1234").as_deref(), Some("94107"));
        assert_eq!(normalize_region(" 10 001 ").as_deref(), Some("10001"));
        assert_eq!(normalize_region("n/a"), None);
    }

    #[test]
    fn fee_defaults_to_ten_percent_of_minor_units() {
        assert_eq!(to_minor_units(42.5), 4250);
        assert_eq!(default_fee(4250), 425);
        assert_eq!(default_fee(999), 100);
    }

    #[test]
    fn suggestion_shapes() {
        let data = json!({
            "photoPreview": {
                "category": {"id": "1204", "name": "Shoes"},
                "brandId": 77,
                "attributes": [{"conditionId": "3"}],
                "shippingWeight": 1.5
            }
        });
        let suggestion = parse_suggestion(&data);
        assert_eq!(suggestion.category_id, Some(1204));
        assert_eq!(suggestion.brand_id, Some(77));
        assert_eq!(suggestion.condition_id, Some(3));
        assert_eq!(suggestion.shipping_weight, Some(1.5));
        assert!(parse_suggestion(&json!({"photoPreview": null})).is_empty());
    }

    #[test]
    fn payload_wins_over_suggestion_and_defaults() {
        let mut payload = payload();
        payload.category_id = Some(10);
        payload.condition = None;
        let suggestion = Suggestion {
            category_id: Some(20),
            condition_id: Some(4),
            ..Suggestion::default()
        };
        let resolved = resolve_attributes(&payload, &suggestion, &ListingDefaults::default()).unwrap();
        assert_eq!(resolved.category_id, 10);
        assert_eq!(resolved.condition_id, 4);
    }

    #[tokio::test]
    async fn missing_category_never_calls_create() {
        let h = harness();
        script_upload(&h.transport);
        h.transport.route("/v1/api", Some("photoPreview"), json_response(200, json!({"data": {}})));
        h.transport.route(
            "/v1/api",
            Some("createListing"),
            json_response(200, json!({"data": {"createListing": {"id": "m1"}}})),
        );

        let outcome = h.flow.create(&payload()).await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, "validation");
        assert_eq!(error.stage.as_deref(), Some("resolve_attributes"));
        let sent = sent_operations(&h.transport);
        assert!(sent.iter().all(|body| !body.contains("createListing")));
        assert_eq!(
            sent.iter().filter(|body| body.contains("uploadTempListingPhotos")).count(),
            1
        );
    }

    #[tokio::test]
    async fn unresolved_region_fails_before_upload() {
        let h = harness();
        script_upload(&h.transport);
        h.transport.route(
            "/v1/api",
            Some("sellerListingContext"),
            json_response(200, json!({"data": {"seller": {"name": "x"}}})),
        );
        let mut payload = payload();
        payload.zip_code = None;
        let outcome = h.flow.create(&payload).await;
        assert_eq!(outcome.error.unwrap().stage.as_deref(), Some("resolve_region"));
        assert!(sent_operations(&h.transport)
            .iter()
            .all(|body| !body.contains("uploadTempListingPhotos")));
    }

    #[tokio::test]
    async fn region_falls_back_to_listing_context() {
        let h = harness();
        h.transport.route(
            "/v1/api",
            Some("sellerListingContext"),
            json_response(200, json!({"data": {"seller": {"address": {"zipCode": "10001"}}}})),
        );
        let mut payload = payload();
        payload.zip_code = None;
        let defaults = ListingDefaults::default();
        let zip = h.flow.resolve_region(&payload, &defaults).await.unwrap();
        assert_eq!(zip.value, "10001");
    }

    #[tokio::test]
    async fn full_listing_flow() {
        let h = harness();
        script_upload(&h.transport);
        h.transport.route(
            "/v1/api",
            Some("photoPreview"),
            json_response(200, json!({"data": {"photoPreview": {"categoryId": 1204, "brand": {"id": 9}}}})),
        );
        h.transport.route(
            "/v1/api",
            Some("createListing"),
            json_response(200, json!({"data": {"createListing": {"id": "m123"}}})),
        );

        let outcome = h.flow.create(&payload()).await;
        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.listing_id.as_deref(), Some("m123"));
        assert_eq!(
            outcome.url.as_deref(),
            Some("https://www.alpha-market.example/item/m123")
        );

        let create = sent_operations(&h.transport)
            .into_iter()
            .find(|body| body.contains("createListing"))
            .unwrap();
        let body: Value = serde_json::from_str(&create).unwrap();
        let input = &body["variables"]["input"];
        assert_eq!(input["photoIds"], json!(["up_001"]));
        assert_eq!(input["price"], 4250);
        assert_eq!(input["salesFee"], 425);
        assert_eq!(input["categoryId"], 1204);
        assert_eq!(input["conditionId"], 1);
        assert_eq!(input["brandId"], 9);
        assert_eq!(input["zipCode"], "02134");
        assert_eq!(input["shippingClassIds"], json!([0]));
        assert!(input.get("sizeId").is_none());

        let remembered = h.defaults.get("alpha").await;
        assert_eq!(remembered.text("zipCode").as_deref(), Some("02134"));
        assert_eq!(remembered.int("conditionId"), Some(1));

        let stage_names: Vec<&str> = outcome.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            stage_names,
            vec![
                "validate_payload",
                "resolve_region",
                "upload_photo",
                "suggest_attributes",
                "resolve_attributes",
                "assemble_input",
                "create_listing",
                "remember_defaults"
            ]
        );
    }

    #[tokio::test]
    async fn protocol_errors_surface_as_failed_outcome() {
        let h = harness();
        script_upload(&h.transport);
        let mut payload = payload();
        payload.category_id = Some(1204);
        h.transport.route(
            "/v1/api",
            Some("createListing"),
            json_response(200, json!({"errors": [{"message": "Invalid price"}]})),
        );
        let outcome = h.flow.create(&payload).await;
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, "upstream_protocol");
        assert_eq!(error.stage.as_deref(), Some("create_listing"));
        assert!(error.message.contains("Invalid price"));
    }

    #[test]
    fn alternate_namespace_urls() {
        let h = harness();
        assert_eq!(
            h.flow.listing_url("s42"),
            "https://shops.alpha-market.example/products/s42"
        );
        assert_eq!(
            h.flow.listing_url("m42"),
            "https://www.alpha-market.example/item/m42"
        );
    }
}
