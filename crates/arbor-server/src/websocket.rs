//! WebSocket push channel for pipeline events

use std::sync::Arc;

use arbor_core::{GraphSnapshot, Rect};
use arbor_pipeline::{PipelineEvent, ViewportAnswer};
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::ServerState;

/// Requests a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    RequestSnapshot,
    Viewport {
        x: f64,
        y: f64,
        width: f64,
        height: f64,
        #[serde(default = "default_zoom")]
        zoom: f64,
    },
    Frame {
        duration_ms: f64,
    },
}

fn default_zoom() -> f64 {
    1.0
}

/// Direct replies. Pipeline events are forwarded as their own tagged JSON.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Snapshot { snapshot: GraphSnapshot },
    Viewport { answer: ViewportAnswer },
    Pong,
    Error { message: String },
}

/// Handle WebSocket upgrade requests
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode<T: Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("Failed to serialize WebSocket message: {}", e);
            None
        }
    }
}

fn snapshot_message(state: &ServerState) -> ServerMessage {
    ServerMessage::Snapshot {
        snapshot: state.ctx.snapshot().as_ref().clone(),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    info!("New WebSocket connection established");

    let (mut sender, mut receiver) = socket.split();
    let mut events = state.ctx.subscribe_events();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
    let shutdown = state.ctx.shutdown_token();

    if let Some(json) = encode(&snapshot_message(&state)) {
        if sender.send(Message::Text(json)).await.is_err() {
            warn!("Failed to send initial snapshot to WebSocket client");
            return;
        }
    }

    let recv_state = Arc::clone(&state);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    debug!("Received WebSocket message: {}", text);
                    let reply = match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(message) => handle_client_message(message, &recv_state),
                        Err(e) => {
                            warn!("Failed to parse WebSocket message: {}", e);
                            Some(ServerMessage::Error {
                                message: e.to_string(),
                            })
                        }
                    };
                    if let Some(json) = reply.as_ref().and_then(encode) {
                        if reply_tx.send(json).is_err() {
                            break;
                        }
                    }
                }
                Message::Close(_) => {
                    debug!("WebSocket client disconnected");
                    break;
                }
                _ => {}
            }
        }
    });

    let mut send_task = tokio::spawn(async move {
        loop {
            let json = tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(reply) = reply_rx.recv() => reply,
                event = events.recv() => match event {
                    Ok(event) => match event_json(&event) {
                        Some(json) => json,
                        None => continue,
                    },
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("WebSocket client lagged behind by {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            if sender.send(Message::Text(json)).await.is_err() {
                debug!("Failed to send message to WebSocket client");
                break;
            }
        }
        let _ = sender.close().await;
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    info!("WebSocket connection closed");
}

fn handle_client_message(message: ClientMessage, state: &ServerState) -> Option<ServerMessage> {
    match message {
        ClientMessage::Ping => Some(ServerMessage::Pong),
        ClientMessage::RequestSnapshot => Some(snapshot_message(state)),
        ClientMessage::Viewport {
            x,
            y,
            width,
            height,
            zoom,
        } => {
            let valid = [x, y, width, height, zoom].iter().all(|v| v.is_finite())
                && width >= 0.0
                && height >= 0.0
                && zoom > 0.0;
            if !valid {
                return Some(ServerMessage::Error {
                    message: "viewport needs finite bounds and a positive zoom".to_string(),
                });
            }
            let answer = state.ctx.query_viewport(Rect::new(x, y, x + width, y + height), zoom);
            Some(ServerMessage::Viewport { answer })
        }
        ClientMessage::Frame { duration_ms } => {
            state.ctx.sample_frame(duration_ms);
            None
        }
    }
}

/// Forwarded events keep the pipeline's own `type` tags.
pub fn event_json(event: &PipelineEvent) -> Option<String> {
    encode(event)
}
