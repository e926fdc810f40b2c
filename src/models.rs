use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{DisplayFromStr, PickFirst, serde_as, skip_serializing_none};
use std::{collections::BTreeMap, fmt};

/// Listing request as supplied by the caller.
#[serde_as]
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingPayload {
    #[serde(alias = "name")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde_as(as = "PickFirst<(_, DisplayFromStr)>")]
    pub price: f64,
    #[serde(default)]
    pub images: Vec<ImageRef>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub category_id: Option<i64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub condition_id: Option<i64>,
    /// Free-text condition, e.g. "Brand New".
    #[serde(default)]
    pub condition: Option<String>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub brand_id: Option<i64>,
    #[serde_as(as = "Option<PickFirst<(_, DisplayFromStr)>>")]
    pub size_id: Option<i64>,
    #[serde(default, alias = "postalCode", alias = "region")]
    pub zip_code: Option<String>,
    #[serde(default)]
    pub shipping_payer_id: Option<i64>,
    #[serde(default)]
    pub shipping_class_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub sales_fee: Option<f64>,
    #[serde(default)]
    pub weight: Option<f64>,
    #[serde(default)]
    pub min_price_for_auto_drop: Option<f64>,
    /// Live session values for the replay path; never persisted.
    #[serde(default)]
    pub session: Option<ReplaySession>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ImageRef {
    /// `http(s)://` or `data:` URL.
    Location(String),
    Descriptor(ImageDescriptor),
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct ImageDescriptor {
    #[serde(default)]
    pub url: Option<String>,
    /// Base64 payload, optionally as a data URL.
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Identity and form tokens of the user's current browser session, handed
/// over by the bridge for a single replay.
#[derive(Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplaySession {
    #[serde(default)]
    pub actor_id: Option<String>,
    #[serde(default)]
    pub tokens: BTreeMap<String, String>,
}

impl fmt::Debug for ReplaySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplaySession")
            .field("actor_id", &self.actor_id)
            .field("tokens", &self.tokens.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingOutcome {
    pub success: bool,
    pub listing_id: Option<String>,
    pub url: Option<String>,
    pub error: Option<OutcomeError>,
    #[serde(default)]
    pub stages: Vec<StageReport>,
}

impl ListingOutcome {
    pub fn created(listing_id: String, url: String, stages: Vec<StageReport>) -> Self {
        Self {
            success: true,
            listing_id: Some(listing_id),
            url: Some(url),
            error: None,
            stages,
        }
    }

    pub fn failed(error: OutcomeError, stages: Vec<StageReport>) -> Self {
        Self {
            success: false,
            listing_id: None,
            url: None,
            error: Some(error),
            stages,
        }
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeError {
    pub kind: String,
    pub stage: Option<String>,
    pub message: String,
    /// Diagnostic snapshot to inspect when an identifier could not be found.
    pub snapshot_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

/// Classification attributes the marketplace infers from an uploaded photo.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub category_id: Option<i64>,
    pub brand_id: Option<i64>,
    pub condition_id: Option<i64>,
    pub size_id: Option<i64>,
    pub shipping_weight: Option<f64>,
}

impl Suggestion {
    pub fn is_empty(&self) -> bool {
        *self == Suggestion::default()
    }
}

/// Create-listing mutation input. Money is in minor units.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListingInput {
    pub photo_ids: Vec<String>,
    pub name: String,
    pub price: i64,
    pub description: String,
    pub category_id: i64,
    pub condition_id: i64,
    pub zip_code: String,
    pub shipping_payer_id: i64,
    pub shipping_class_ids: Vec<i64>,
    pub sales_fee: i64,
    pub brand_id: Option<i64>,
    pub shipping_package_weight: Option<f64>,
    pub size_id: Option<i64>,
    pub min_price_for_auto_price_drop: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
