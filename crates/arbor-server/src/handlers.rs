//! REST API handlers for the Arbor server

use std::collections::BTreeMap;
use std::sync::Arc;

use arbor_core::{ArborError, Diff, GraphSnapshot, NodeId, PathResult, Position, Rect};
use arbor_pipeline::{
    AnalyzerInfo, CacheReport, PipelineStats, QueueHealth, RendererMetrics, SchedulerStats, ThrottleState,
    ViewportAnswer, priority_for,
};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ServerState;

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        ApiError {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(serde_json::json!({ "error": self.message }))).into_response()
    }
}

impl From<ArborError> for ApiError {
    fn from(e: ArborError) -> Self {
        let status = match e {
            ArborError::DiffConflict { .. } | ArborError::InvariantViolation(_) => StatusCode::CONFLICT,
            ArborError::Ingestion(_) | ArborError::Config(_) => StatusCode::BAD_REQUEST,
            ArborError::ChannelDisconnect(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError::new(status, e.to_string())
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub snapshot_version: u64,
    pub queue_health: QueueHealth,
}

pub async fn health_check(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        snapshot_version: state.ctx.snapshot().version,
        queue_health: state.ctx.scheduler().health(),
    })
}

/// The committed snapshot.
pub async fn get_graph(State(state): State<Arc<ServerState>>) -> Json<GraphSnapshot> {
    Json(state.ctx.snapshot().as_ref().clone())
}

#[derive(Debug, Deserialize)]
pub struct ViewportParams {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    #[serde(default = "default_zoom")]
    pub zoom: f64,
}

fn default_zoom() -> f64 {
    1.0
}

impl ViewportParams {
    pub fn rect(&self) -> Result<Rect, ApiError> {
        let finite = [self.x, self.y, self.width, self.height, self.zoom]
            .iter()
            .all(|value| value.is_finite());
        if !finite || self.width < 0.0 || self.height < 0.0 || self.zoom <= 0.0 {
            return Err(ApiError::bad_request("viewport needs finite bounds and a positive zoom"));
        }
        Ok(Rect::new(self.x, self.y, self.x + self.width, self.y + self.height))
    }
}

pub async fn get_viewport(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<ViewportParams>,
) -> ApiResult<ViewportAnswer> {
    let rect = params.rect()?;
    Ok(Json(state.ctx.query_viewport(rect, params.zoom)))
}

pub async fn get_metrics(State(state): State<Arc<ServerState>>) -> Json<RendererMetrics> {
    Json(state.ctx.metrics())
}

#[derive(Debug, Deserialize)]
pub struct FramesRequest {
    pub durations_ms: Vec<f64>,
}

/// Frame timings reported by the renderer.
pub async fn post_frames(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<FramesRequest>,
) -> Json<RendererMetrics> {
    for duration in request.durations_ms {
        state.ctx.sample_frame(duration);
    }
    Json(state.ctx.metrics())
}

#[derive(Debug, Deserialize)]
pub struct LayoutRequest {
    pub positions: BTreeMap<NodeId, Position>,
}

pub async fn post_layout(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<LayoutRequest>,
) -> ApiResult<Diff> {
    let diff = state.ctx.apply_layout(&request.positions).await?;
    debug!("Layout committed as version {}", diff.result_version);
    Ok(Json(diff))
}

pub async fn get_stats(State(state): State<Arc<ServerState>>) -> Json<PipelineStats> {
    Json(state.ctx.stats())
}

#[derive(Debug, Serialize)]
pub struct QueueResponse {
    pub queue_size: usize,
    pub health: QueueHealth,
    pub concurrency: usize,
    pub stats: SchedulerStats,
}

pub async fn get_queue(State(state): State<Arc<ServerState>>) -> Json<QueueResponse> {
    let scheduler = state.ctx.scheduler();
    Json(QueueResponse {
        queue_size: scheduler.queue_size(),
        health: scheduler.health(),
        concurrency: scheduler.current_concurrency(),
        stats: scheduler.stats(),
    })
}

pub async fn get_cache(State(state): State<Arc<ServerState>>) -> Json<CacheReport> {
    Json(state.ctx.cache_stats())
}

pub async fn clear_cache(State(state): State<Arc<ServerState>>) -> StatusCode {
    state.ctx.clear_caches();
    StatusCode::NO_CONTENT
}

pub async fn list_analyzers(State(state): State<Arc<ServerState>>) -> Json<Vec<AnalyzerInfo>> {
    Json(state.ctx.analyzers())
}

pub async fn enable_analyzer(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<Vec<AnalyzerInfo>> {
    if !state.ctx.enable_analyzer(&name) {
        return Err(ApiError::not_found(format!("unknown analyzer {}", name)));
    }
    Ok(Json(state.ctx.analyzers()))
}

pub async fn disable_analyzer(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<Vec<AnalyzerInfo>> {
    if !state.ctx.disable_analyzer(&name) {
        return Err(ApiError::not_found(format!("unknown analyzer {}", name)));
    }
    Ok(Json(state.ctx.analyzers()))
}

pub async fn get_throttle(State(state): State<Arc<ServerState>>) -> Json<ThrottleState> {
    Json(state.ctx.throttle())
}

#[derive(Debug, Deserialize)]
pub struct ThrottleRequest {
    pub level: f64,
}

pub async fn set_throttle(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<ThrottleRequest>,
) -> Json<ThrottleState> {
    Json(state.ctx.set_throttle_level(request.level))
}

#[derive(Debug, Deserialize)]
pub struct AdaptiveRequest {
    pub enabled: bool,
}

pub async fn set_adaptive(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<AdaptiveRequest>,
) -> Json<ThrottleState> {
    Json(state.ctx.enable_adaptive_throttling(request.enabled))
}

#[derive(Debug, Deserialize)]
pub struct AnalysisRequest {
    pub diff: Diff,
    /// Defaults to the priority derived from the diff itself.
    #[serde(default)]
    pub priority: Option<u8>,
}

#[derive(Debug, Serialize)]
pub struct AnalysisAccepted {
    pub task_id: u64,
    pub priority: u8,
    pub queue_size: usize,
}

pub async fn trigger_analysis(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<AnalysisRequest>,
) -> (StatusCode, Json<AnalysisAccepted>) {
    let priority = request.priority.unwrap_or_else(|| priority_for(&request.diff));
    let task_id = state.ctx.trigger_analysis(request.diff, priority);
    let accepted = AnalysisAccepted {
        task_id,
        priority,
        queue_size: state.ctx.queue_size(),
    };
    (StatusCode::ACCEPTED, Json(accepted))
}

#[derive(Debug, Deserialize)]
pub struct WatchRequest {
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct WatchResponse {
    pub watched: Vec<String>,
}

pub async fn list_watched(State(state): State<Arc<ServerState>>) -> Json<WatchResponse> {
    Json(WatchResponse {
        watched: state.ctx.watched_paths(),
    })
}

pub async fn watch_path(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<WatchRequest>,
) -> ApiResult<WatchResponse> {
    state.ctx.watch_path(&request.path).await.map_err(|e| {
        warn!("Watch request for {} failed: {:#}", request.path, e);
        ApiError::bad_request(format!("{:#}", e))
    })?;
    Ok(Json(WatchResponse {
        watched: state.ctx.watched_paths(),
    }))
}

pub async fn unwatch_path(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<WatchRequest>,
) -> ApiResult<WatchResponse> {
    state.ctx.unwatch_path(&request.path).await.map_err(|e| {
        warn!("Unwatch request for {} failed: {:#}", request.path, e);
        ApiError::bad_request(format!("{:#}", e))
    })?;
    Ok(Json(WatchResponse {
        watched: state.ctx.watched_paths(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    pub from: String,
    pub to: String,
}

pub async fn query_path(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<PathQuery>,
) -> ApiResult<PathResult> {
    state
        .ctx
        .shortest_path(&NodeId::new(query.from.as_str()), &NodeId::new(query.to.as_str()))
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no path from {} to {}", query.from, query.to)))
}

#[derive(Debug, Serialize)]
pub struct CyclesResponse {
    pub cycles: Vec<Vec<NodeId>>,
}

pub async fn query_cycles(State(state): State<Arc<ServerState>>) -> Json<CyclesResponse> {
    Json(CyclesResponse {
        cycles: state.ctx.cycles(),
    })
}

#[derive(Debug, Serialize)]
pub struct ChainsResponse {
    pub chains: Vec<Vec<NodeId>>,
}

pub async fn query_chains(State(state): State<Arc<ServerState>>) -> Json<ChainsResponse> {
    Json(ChainsResponse {
        chains: state.ctx.chains(),
    })
}
