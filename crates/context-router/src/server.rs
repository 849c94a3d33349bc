//! JSON HTTP API.
//!
//! Translates HTTP requests into core calls and core results into JSON.
//! Authentication and rate limiting are out of scope.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/query` | Classify, retrieve, and rank |
//! | `POST` | `/feedback` | Record an outcome signal (202) |
//! | `GET`  | `/profiles` | Effective agent profiles |
//! | `PUT`  | `/profiles/{id}` | Replace or add a profile |
//! | `GET`  | `/model` | Active ranking model |
//! | `GET`  | `/metrics` | Counters and timings |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "retrieval_unavailable", "message": "..." } }
//! ```
//!
//! Error codes: `bad_request` (400), `retrieval_unavailable` (503),
//! `internal` (500). An empty result list is `200` with `"results": []`.

use std::path::Path as FsPath;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use uuid::Uuid;

use context_router_core::classifier::Classification;
use context_router_core::metrics::MetricsSnapshot;
use context_router_core::models::{CandidateResult, ChunkStructure, FeedbackEvent, Query, Signal};
use context_router_core::profile::AgentProfile;
use context_router_core::ranker::{feature_activations, FeatureActivation, RankingModelState};
use context_router_core::retrieval::RetrievalMode;
use context_router_core::RetrievalError;

use crate::config::Config;
use crate::ingest::{ingest_path, print_report};
use crate::runtime::Runtime;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    rt: Arc<Runtime>,
}

impl AppState {
    pub fn new(rt: Arc<Runtime>) -> Self {
        Self { rt }
    }
}

pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/query", post(handle_query))
        .route("/feedback", post(handle_feedback))
        .route("/profiles", get(handle_list_profiles))
        .route("/profiles/{id}", put(handle_put_profile))
        .route("/model", get(handle_model))
        .route("/metrics", get(handle_metrics))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server and the adaptation worker. Runs until Ctrl-C.
///
/// When `ingest` is given, that path is indexed before the listener binds,
/// which is how the `memory` store backend gets its content.
pub async fn run_server(config: &Config, ingest: Option<&FsPath>) -> anyhow::Result<()> {
    let mut rt = Runtime::open(config).await?;

    if let Some(path) = ingest {
        let report = ingest_path(&rt, path, false).await?;
        println!("ingest {}", path.display());
        print_report(&report, rt.embedder.is_some());
    }

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let worker = rt.spawn_adaptation(async move {
        let _ = stop_rx.changed().await;
    })?;

    let bind_addr = config.server.bind.clone();
    let rt = Arc::new(rt);
    let router = app(AppState::new(Arc::clone(&rt)));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    println!("ctxr listening on http://{}", bind_addr);
    info!(bind = %bind_addr, "server started");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    let _ = stop_tx.send(true);
    if let Some(handle) = worker {
        if let Err(e) = handle.await {
            warn!(error = %e, "adaptation worker ended abnormally");
        }
    }
    info!("server stopped");
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &str {
        self.code
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::RetrievalUnavailable { .. } => AppError {
                status: StatusCode::SERVICE_UNAVAILABLE,
                code: "retrieval_unavailable",
                message: err.to_string(),
            },
            RetrievalError::MalformedQuery(_) | RetrievalError::InvalidProfile { .. } => {
                bad_request(err.to_string())
            }
            other => internal(other.to_string()),
        }
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ POST /query ============

#[derive(Debug, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub agent: Option<String>,
    /// Include per-feature activations in each result.
    #[serde(default)]
    pub explain: bool,
}

#[derive(Debug, Serialize)]
pub struct ResultItem {
    pub rank: usize,
    pub chunk_id: String,
    pub source: String,
    pub content_type: String,
    pub strategy: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structure: Option<ChunkStructure>,
    pub text: String,
    pub final_score: f64,
    pub merged_score: f64,
    pub vector_score: Option<f64>,
    pub keyword_score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<Vec<FeatureActivation>>,
}

#[derive(Debug, Serialize)]
pub struct QueryResponse {
    pub query_id: Uuid,
    pub profile_id: String,
    pub classification: Classification,
    pub model_version: u64,
    pub mode: RetrievalMode,
    pub candidates_considered: usize,
    pub elapsed_ms: u64,
    pub results: Vec<ResultItem>,
}

fn result_item(c: CandidateResult, features: Option<Vec<FeatureActivation>>) -> ResultItem {
    ResultItem {
        rank: c.rank,
        chunk_id: c.chunk.id.clone(),
        source: c.chunk.source.clone(),
        content_type: c.chunk.content_type.to_string(),
        strategy: c.chunk.strategy.to_string(),
        structure: c.chunk.structure.clone(),
        text: c.chunk.text.clone(),
        final_score: c.final_score,
        merged_score: c.merged_score,
        vector_score: c.vector_score,
        keyword_score: c.keyword_score,
        features,
    }
}

pub async fn handle_query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, AppError> {
    if req.text.trim().is_empty() {
        return Err(bad_request("text must not be empty"));
    }
    let router = &state.rt.router;
    let query = Query::new(req.text, req.agent);
    let keywords = if req.explain { query.keywords() } else { Vec::new() };

    let resp = router.query(query).await?;
    let profile = router.registry().get(&resp.profile_id);

    let results = resp
        .results
        .into_iter()
        .map(|c| {
            let features = req
                .explain
                .then(|| feature_activations(&c.chunk, &keywords, &profile));
            result_item(c, features)
        })
        .collect();

    Ok(Json(QueryResponse {
        query_id: resp.query_id,
        profile_id: resp.profile_id,
        classification: resp.classification,
        model_version: resp.model_version,
        mode: resp.mode,
        candidates_considered: resp.candidates_considered,
        elapsed_ms: resp.elapsed_ms,
        results,
    }))
}

// ============ POST /feedback ============

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub query_id: Uuid,
    #[serde(default)]
    pub selected: Vec<String>,
    #[serde(default)]
    pub rejected: Vec<String>,
    #[serde(default)]
    pub signal: Option<Signal>,
}

#[derive(Debug, Serialize)]
pub struct FeedbackResponse {
    /// `false` when the event was dropped (queue full or feedback disabled).
    pub accepted: bool,
}

pub async fn handle_feedback(
    State(state): State<AppState>,
    Json(req): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackResponse>), AppError> {
    if req.selected.is_empty() && req.rejected.is_empty() {
        return Err(bad_request("feedback must select or reject at least one chunk"));
    }
    let event = FeedbackEvent::new(
        req.query_id,
        req.selected,
        req.rejected,
        req.signal.unwrap_or_default(),
    );
    let accepted = state.rt.router.record_feedback(event);
    Ok((StatusCode::ACCEPTED, Json(FeedbackResponse { accepted })))
}

// ============ Profiles ============

#[derive(Debug, Serialize)]
pub struct ProfilesResponse {
    pub version: u64,
    pub profiles: Vec<AgentProfile>,
}

pub async fn handle_list_profiles(State(state): State<AppState>) -> Json<ProfilesResponse> {
    let snapshot = state.rt.router.registry().snapshot();
    Json(ProfilesResponse {
        version: snapshot.version,
        profiles: snapshot.iter().map(|p| p.as_ref().clone()).collect(),
    })
}

#[derive(Debug, Serialize)]
pub struct PutProfileResponse {
    pub version: u64,
    pub profile: AgentProfile,
}

/// The body is a complete profile; its `id` is taken from the path.
pub async fn handle_put_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut body): Json<serde_json::Value>,
) -> Result<Json<PutProfileResponse>, AppError> {
    if id.trim().is_empty() {
        return Err(bad_request("profile id must not be empty"));
    }
    match body.as_object_mut() {
        Some(obj) => {
            obj.insert("id".to_string(), serde_json::Value::String(id.clone()));
        }
        None => return Err(bad_request("profile body must be a JSON object")),
    }
    let profile: AgentProfile = serde_json::from_value(body)
        .map_err(|e| bad_request(format!("invalid profile: {}", e)))?;
    profile.validate()?;

    let version = state
        .rt
        .upsert_profile(profile.clone())
        .await
        .map_err(|e| internal(format!("{:#}", e)))?;
    info!(profile = %id, version, "profile updated");
    Ok(Json(PutProfileResponse { version, profile }))
}

// ============ Model & metrics ============

pub async fn handle_model(State(state): State<AppState>) -> Json<RankingModelState> {
    Json(state.rt.router.model().current().as_ref().clone())
}

pub async fn handle_metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.rt.metrics.snapshot())
}
