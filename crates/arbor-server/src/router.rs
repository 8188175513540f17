//! Axum router setup for the Arbor server

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::ServerState;
use crate::handlers::*;
use crate::websocket::ws_handler;

/// Create the axum router with all routes
pub fn create_router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Push channel for diffs, cycle reports and notifications
        .route("/ws", get(ws_handler))
        // Renderer interface
        .route("/api/health", get(health_check))
        .route("/api/graph", get(get_graph))
        .route("/api/viewport", get(get_viewport))
        .route("/api/metrics", get(get_metrics))
        .route("/api/frames", post(post_frames))
        .route("/api/layout", post(post_layout))
        // Control surface
        .route("/api/stats", get(get_stats))
        .route("/api/queue", get(get_queue))
        .route("/api/cache", get(get_cache).delete(clear_cache))
        .route("/api/analyzers", get(list_analyzers))
        .route("/api/analyzers/:name/enable", post(enable_analyzer))
        .route("/api/analyzers/:name/disable", post(disable_analyzer))
        .route("/api/throttle", get(get_throttle).post(set_throttle))
        .route("/api/throttle/adaptive", post(set_adaptive))
        .route("/api/analysis", post(trigger_analysis))
        .route("/api/watch", get(list_watched).post(watch_path).delete(unwatch_path))
        // Graph queries
        .route("/api/query/path", get(query_path))
        .route("/api/query/cycles", get(query_cycles))
        .route("/api/query/chains", get(query_chains))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
