use crate::{
    agent::Agent,
    defaults::ListingDefaults,
    jobs::{CompleteError, JobInfo, JobQueue},
    models::{ApiError, ListingOutcome, ListingPayload},
    observer::{NetworkEvent, RecordedRequest, RecorderStatus},
    poll::PollPolicy,
    store::{KeyValueStore, load_json, save_json},
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub agent: Agent,
    pub queue: JobQueue,
    pub store: Arc<dyn KeyValueStore>,
    pub metrics: Option<PrometheusHandle>,
    pub idempotency_ttl: u64,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .nest(
            "/observer/{domain}",
            Router::new()
                .route("/events", post(ingest_events))
                .route("/enable", post(enable_recording))
                .route("/disable", post(disable_recording))
                .route("/reset", post(reset_recording))
                .route("/status", get(recorder_status))
                .route("/records", get(list_records).delete(clear_records))
                .route("/records/wait", get(wait_for_record))
                .route("/headers", get(header_names)),
        )
        .route(
            "/defaults/{marketplace}",
            get(get_defaults).delete(reset_defaults),
        )
        .route("/listings/{marketplace}", post(create_listing))
        .nest(
            "/jobs",
            Router::new()
                .route("/listings/{marketplace}", post(enqueue_listing_job))
                .route("/external/{marketplace}", post(register_external_job))
                .route("/{id}", get(get_job_status))
                .route("/{id}/complete", post(complete_job)),
        )
        .with_state(state)
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(&'static str, String),
    NotFound(&'static str, String),
    Conflict(&'static str, String),
    Internal(&'static str, String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error, detail) = match self {
            AppError::BadRequest(code, detail) => (StatusCode::BAD_REQUEST, code, detail),
            AppError::NotFound(code, detail) => (StatusCode::NOT_FOUND, code, detail),
            AppError::Conflict(code, detail) => (StatusCode::CONFLICT, code, detail),
            AppError::Internal(code, detail) => (StatusCode::INTERNAL_SERVER_ERROR, code, detail),
        };
        let payload = ApiError {
            error: error.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "listing-agent",
    }))
}

async fn metrics_endpoint(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct EventBatch {
    events: Vec<NetworkEvent>,
}

/// Lifecycle events forwarded by the browser bridge.
///
/// - Method: `POST`
/// - Path: `/observer/{domain}/events`
/// - Body: `{ "events": [NetworkEvent] }`
async fn ingest_events(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Json(batch): Json<EventBatch>,
) -> Result<Json<Value>, AppError> {
    crate::metrics::inc_requests("/observer/events");
    known_domain(&state, &domain)?;
    let accepted = state
        .agent
        .observer()
        .ingest_batch(&domain, &batch.events)
        .await;
    Ok(Json(json!({ "accepted": accepted })))
}

async fn enable_recording(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<RecorderStatus>, AppError> {
    let observer = state.agent.observer();
    observer.enable(&domain).await;
    recorder_status_of(&state, &domain).await
}

async fn disable_recording(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<RecorderStatus>, AppError> {
    let observer = state.agent.observer();
    observer.disable(&domain).await;
    recorder_status_of(&state, &domain).await
}

async fn reset_recording(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<RecorderStatus>, AppError> {
    let observer = state.agent.observer();
    observer.reset(&domain).await;
    recorder_status_of(&state, &domain).await
}

async fn recorder_status(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<RecorderStatus>, AppError> {
    recorder_status_of(&state, &domain).await
}

async fn recorder_status_of(state: &AppState, domain: &str) -> Result<Json<RecorderStatus>, AppError> {
    state
        .agent
        .observer()
        .status(domain)
        .await
        .map(Json)
        .ok_or_else(|| unknown_domain(domain))
}

async fn list_records(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<Vec<RecordedRequest>>, AppError> {
    known_domain(&state, &domain)?;
    Ok(Json(state.agent.observer().records(&domain).await))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitQuery {
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    url_contains: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

const MAX_WAIT_MS: u64 = 30_000;

/// Long-polls the history for the most recent record matching the filters.
async fn wait_for_record(
    State(state): State<AppState>,
    Path(domain): Path<String>,
    Query(query): Query<WaitQuery>,
) -> Result<Json<RecordedRequest>, AppError> {
    let policy = PollPolicy {
        interval: Duration::from_millis(250),
        timeout: Duration::from_millis(query.timeout_ms.unwrap_or(5_000).min(MAX_WAIT_MS)),
        max_attempts: u32::MAX,
    };
    known_domain(&state, &domain)?;
    let method = query.method.as_deref().map(str::to_ascii_uppercase);
    let url_contains = query.url_contains.as_deref();
    state
        .agent
        .observer()
        .wait_for_record(
            &domain,
            |record| {
                method.as_deref().is_none_or(|m| record.method == m)
                    && url_contains.is_none_or(|fragment| record.url.contains(fragment))
            },
            &policy,
        )
        .await
        .map(Json)
        .ok_or(AppError::NotFound(
            "record_not_found",
            format!("no matching request recorded for `{domain}`"),
        ))
}

async fn clear_records(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<StatusCode, AppError> {
    known_domain(&state, &domain)?;
    state.agent.observer().clear(&domain).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Names of the captured session headers. Values never leave the process.
async fn header_names(
    State(state): State<AppState>,
    Path(domain): Path<String>,
) -> Result<Json<Value>, AppError> {
    known_domain(&state, &domain)?;
    let (public, secret) = state.agent.observer().header_names(&domain).await;
    Ok(Json(json!({ "domain": domain, "public": public, "secret": secret })))
}

/// Observer state only exists for the domains of configured marketplaces.
fn known_domain(state: &AppState, domain: &str) -> Result<(), AppError> {
    if state.agent.observer().knows_domain(domain) {
        Ok(())
    } else {
        Err(unknown_domain(domain))
    }
}

fn unknown_domain(domain: &str) -> AppError {
    AppError::NotFound(
        "unknown_domain",
        format!("`{domain}` is not a configured marketplace domain"),
    )
}

fn known_marketplace(state: &AppState, marketplace: &str) -> Result<(), AppError> {
    if state.agent.knows(marketplace) {
        Ok(())
    } else {
        Err(AppError::NotFound(
            "unknown_marketplace",
            format!("no profile for `{marketplace}`"),
        ))
    }
}

async fn get_defaults(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
) -> Result<Json<ListingDefaults>, AppError> {
    known_marketplace(&state, &marketplace)?;
    Ok(Json(state.agent.defaults().get(&marketplace).await))
}

async fn reset_defaults(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
) -> Result<StatusCode, AppError> {
    known_marketplace(&state, &marketplace)?;
    state.agent.defaults().reset(&marketplace).await;
    Ok(StatusCode::NO_CONTENT)
}

/// Create a listing on one marketplace.
///
/// - Method: `POST`
/// - Path: `/listings/{marketplace}`
/// - Body: `ListingPayload`
/// - Response: `ListingOutcome`; `422` when the outcome is a failure
///
/// An `Idempotency-Key` header replays the stored outcome of an earlier
/// call with the same key.
async fn create_listing(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
    headers: HeaderMap,
    Json(payload): Json<ListingPayload>,
) -> Result<Response, AppError> {
    crate::metrics::inc_requests("/listings");
    known_marketplace(&state, &marketplace)?;

    let idempotency_key = headers
        .get("Idempotency-Key")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|key| format!("idempotency:{marketplace}:{key}"));

    if let Some(key) = &idempotency_key {
        match load_json::<ListingOutcome>(state.store.as_ref(), key).await {
            Ok(Some(existing)) => {
                info!(target = "agent.api", marketplace = %marketplace, "idempotent_replay");
                return Ok(outcome_response(existing));
            }
            Ok(None) => {}
            Err(err) => warn!(target = "agent.api", error = %err, "idempotency_lookup_failed"),
        }
    }

    let outcome = state.agent.create_listing(&marketplace, &payload).await;

    if let Some(key) = &idempotency_key
        && let Err(err) =
            save_json(state.store.as_ref(), key, &outcome, Some(state.idempotency_ttl)).await
    {
        warn!(target = "agent.api", error = %err, "idempotency_store_failed");
    }
    Ok(outcome_response(outcome))
}

fn outcome_response(outcome: ListingOutcome) -> Response {
    let status = if outcome.success {
        StatusCode::OK
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    (status, Json(outcome)).into_response()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EnqueueResponse {
    job_id: String,
}

async fn enqueue_listing_job(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
    Json(payload): Json<ListingPayload>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/listings");
    known_marketplace(&state, &marketplace)?;
    let id = state
        .queue
        .enqueue_listing(&marketplace, payload)
        .await
        .map_err(|err| AppError::Internal("enqueue", err.error))?;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

/// Register a job the browser-side worker performs; it reports back through
/// `POST /jobs/{id}/complete`.
async fn register_external_job(
    State(state): State<AppState>,
    Path(marketplace): Path<String>,
) -> Result<Json<EnqueueResponse>, AppError> {
    crate::metrics::inc_requests("/jobs/external");
    known_marketplace(&state, &marketplace)?;
    let id = state.queue.register_external(&marketplace).await;
    Ok(Json(EnqueueResponse {
        job_id: id.to_string(),
    }))
}

fn parse_job_id(id: &str) -> Result<Uuid, AppError> {
    Uuid::parse_str(id).map_err(|_| AppError::BadRequest("invalid_job_id", id.to_string()))
}

async fn get_job_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobInfo>, AppError> {
    let uuid = parse_job_id(&id)?;
    state
        .queue
        .get(uuid)
        .await
        .map(Json)
        .ok_or(AppError::NotFound("job_not_found", id))
}

async fn complete_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(outcome): Json<ListingOutcome>,
) -> Result<Json<JobInfo>, AppError> {
    let uuid = parse_job_id(&id)?;
    match state.queue.complete(uuid, outcome).await {
        Ok(info) => Ok(Json(info)),
        Err(CompleteError::NotFound) => Err(AppError::NotFound("job_not_found", id)),
        Err(CompleteError::NotExternal) => Err(AppError::Conflict(
            "job_not_external",
            "job is run by the agent worker".into(),
        )),
        Err(CompleteError::AlreadyFinished) => Err(AppError::Conflict(
            "job_already_finished",
            "job outcome already recorded".into(),
        )),
    }
}
