//! Remote ingress channel client
//!
//! Subscribes to an external file watcher over WebSocket. On connect it sends
//! `configure` with the watched paths, keeps the link alive with `ping`, and
//! feeds every `change` / `batch` message into the gateway. A dropped link is
//! retried with exponential backoff; the gateway keeps whatever it already
//! holds while the channel is down.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, bail};
use arbor_core::config::IngestConfig;
use arbor_core::{ArborError, RawChange};
use arbor_pipeline::{GatewayHandle, PathWatcher};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const WATCHED_EVENTS: [&str; 3] = ["add", "change", "unlink"];

/// Messages received from the remote watcher.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IngressMessage {
    Change(RawChange),
    Batch {
        #[serde(default)]
        changes: Vec<RawChange>,
    },
    Error {
        #[serde(default, alias = "error")]
        message: String,
    },
    Stats {
        #[serde(default)]
        stats: serde_json::Value,
    },
    Pong,
}

/// Subscription parameters sent with `configure`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchConfiguration {
    pub paths: Vec<String>,
    pub events: Vec<String>,
    pub ignore_patterns: Vec<String>,
}

/// Messages sent to the remote watcher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundMessage {
    Configure { config: WatchConfiguration },
    Ping,
    Watch { path: String },
    Unwatch { path: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngressSettings {
    pub reconnect: Duration,
    pub reconnect_max: Duration,
    pub heartbeat: Duration,
    pub ignore: Vec<String>,
}

impl From<&IngestConfig> for IngressSettings {
    fn from(config: &IngestConfig) -> Self {
        IngressSettings {
            reconnect: Duration::from_millis(config.reconnect_ms),
            reconnect_max: Duration::from_millis(config.reconnect_max_ms.max(config.reconnect_ms)),
            heartbeat: Duration::from_millis(config.heartbeat_ms.max(1)),
            ignore: config.ignore.clone(),
        }
    }
}

/// Delay before reconnect `attempt` (1-based): the base delay doubled per
/// consecutive failure, capped at `max`.
pub fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    let doublings = attempt.saturating_sub(1).min(31);
    base.saturating_mul(1u32 << doublings).min(max)
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct IngressClient {
    url: String,
    settings: IngressSettings,
    gateway: GatewayHandle,
    watched: Mutex<BTreeSet<String>>,
    connected: AtomicBool,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
}

impl std::fmt::Debug for IngressClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngressClient")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .field("watched", &lock(&self.watched).len())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl IngressClient {
    pub fn new(url: impl Into<String>, settings: IngressSettings, gateway: GatewayHandle) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        IngressClient {
            url: url.into(),
            settings,
            gateway,
            watched: Mutex::new(BTreeSet::new()),
            connected: AtomicBool::new(false),
            outbound_tx,
            outbound_rx: tokio::sync::Mutex::new(outbound_rx),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn configuration(&self) -> WatchConfiguration {
        WatchConfiguration {
            paths: lock(&self.watched).iter().cloned().collect(),
            events: WATCHED_EVENTS.iter().map(|event| event.to_string()).collect(),
            ignore_patterns: self.settings.ignore.clone(),
        }
    }

    /// Connect and serve until cancelled, reconnecting whenever the link drops.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match connect_async(self.url.as_str()).await {
                Ok((socket, _)) => {
                    info!("Connected to ingress channel {}", self.url);
                    attempt = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    let outcome = self.serve(socket, &shutdown).await;
                    self.connected.store(false, Ordering::SeqCst);
                    if shutdown.is_cancelled() {
                        break;
                    }
                    if let Err(e) = outcome {
                        warn!("Ingress channel lost: {}", e);
                    }
                }
                Err(e) => warn!("Ingress connection to {} failed: {}", self.url, e),
            }

            attempt = attempt.saturating_add(1);
            let total = self.gateway.metrics().record_reconnect();
            let delay = backoff_delay(self.settings.reconnect, self.settings.reconnect_max, attempt);
            info!(
                "Reconnecting to {} in {:?} (attempt {}, {} total)",
                self.url, delay, attempt, total
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!("Ingress client stopped");
    }

    async fn serve(&self, socket: Socket, shutdown: &CancellationToken) -> Result<(), ArborError> {
        let (mut sink, mut stream) = socket.split();
        let mut outbound = self.outbound_rx.lock().await;
        // Anything queued while disconnected is covered by the fresh configure.
        while outbound.try_recv().is_ok() {}

        send(&mut sink, &OutboundMessage::Configure {
            config: self.configuration(),
        })
        .await?;

        let mut heartbeat = tokio::time::interval(self.settings.heartbeat);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.close().await;
                    return Ok(());
                }
                _ = heartbeat.tick() => send(&mut sink, &OutboundMessage::Ping).await?,
                Some(message) = outbound.recv() => send(&mut sink, &message).await?,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.handle_text(&text),
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ArborError::ChannelDisconnect("closed by remote".to_string()));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(ArborError::ChannelDisconnect(e.to_string())),
                },
            }
        }
    }

    fn handle_text(&self, text: &str) {
        let message = match serde_json::from_str::<IngressMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring ingress message: {}", e);
                return;
            }
        };
        match message {
            IngressMessage::Change(raw) => self.forward(raw),
            IngressMessage::Batch { changes } => {
                debug!("Ingress batch of {} changes", changes.len());
                for raw in changes {
                    self.forward(raw);
                }
            }
            IngressMessage::Error { message } => warn!("Ingress watcher error: {}", message),
            IngressMessage::Stats { stats } => debug!("Ingress watcher stats: {}", stats),
            IngressMessage::Pong => debug!("Ingress pong"),
        }
    }

    fn forward(&self, raw: RawChange) {
        // Malformed changes are logged and counted by the gateway.
        let _ = self.gateway.submit_raw(raw);
    }

    fn send_if_connected(&self, message: OutboundMessage) {
        if self.is_connected() && self.outbound_tx.send(message).is_err() {
            debug!("Ingress outbound queue closed");
        }
    }
}

async fn send<S>(sink: &mut S, message: &OutboundMessage) -> Result<(), ArborError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(message).map_err(|e| ArborError::ChannelDisconnect(e.to_string()))?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| ArborError::ChannelDisconnect(e.to_string()))
}

#[async_trait::async_trait]
impl PathWatcher for IngressClient {
    async fn watch_path(&self, path: &str) -> Result<()> {
        if path.trim().is_empty() {
            bail!("cannot watch an empty path");
        }
        let added = lock(&self.watched).insert(path.to_string());
        if added {
            info!("Watching remote path: {}", path);
            self.send_if_connected(OutboundMessage::Watch { path: path.to_string() });
        }
        Ok(())
    }

    async fn unwatch_path(&self, path: &str) -> Result<()> {
        let removed = lock(&self.watched).remove(path);
        if removed {
            info!("Stopping remote watch for: {}", path);
            self.send_if_connected(OutboundMessage::Unwatch { path: path.to_string() });
        }
        Ok(())
    }

    fn watched(&self) -> Vec<String> {
        lock(&self.watched).iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let base = Duration::from_millis(3000);
        let max = Duration::from_millis(60_000);
        let delays: Vec<u128> = (1..=7).map(|attempt| backoff_delay(base, max, attempt).as_millis()).collect();
        assert_eq!(delays, vec![3000, 6000, 12_000, 24_000, 48_000, 60_000, 60_000]);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[test]
    fn test_parses_incoming_messages() {
        let change: IngressMessage = serde_json::from_str(
            r#"{"type":"change","event":"add","path":"src/a.js","timestamp":1700000000000,"content":"x"}"#,
        )
        .unwrap();
        assert_eq!(
            change,
            IngressMessage::Change(RawChange {
                timestamp: Some(1_700_000_000_000),
                ..RawChange::new("add", "src/a.js", Some("x".to_string()))
            })
        );

        let batch: IngressMessage = serde_json::from_str(
            r#"{"type":"batch","changes":[{"event":"unlink","path":"a.js"},{"event":"change","path":"b.js"}]}"#,
        )
        .unwrap();
        assert!(matches!(batch, IngressMessage::Batch { ref changes } if changes.len() == 2));

        let error: IngressMessage = serde_json::from_str(r#"{"type":"error","error":"EMFILE"}"#).unwrap();
        assert_eq!(
            error,
            IngressMessage::Error {
                message: "EMFILE".to_string()
            }
        );

        assert_eq!(
            serde_json::from_str::<IngressMessage>(r#"{"type":"pong"}"#).unwrap(),
            IngressMessage::Pong
        );
        assert!(serde_json::from_str::<IngressMessage>(r#"{"type":"shrug"}"#).is_err());
    }

    #[test]
    fn test_outbound_wire_format() {
        let configure = OutboundMessage::Configure {
            config: WatchConfiguration {
                paths: vec!["src".to_string()],
                events: vec!["add".to_string()],
                ignore_patterns: vec!["*.log".to_string()],
            },
        };
        assert_eq!(
            serde_json::to_value(&configure).unwrap(),
            serde_json::json!({
                "type": "configure",
                "config": {"paths": ["src"], "events": ["add"], "ignorePatterns": ["*.log"]}
            })
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::Watch { path: "lib".to_string() }).unwrap(),
            serde_json::json!({"type": "watch", "path": "lib"})
        );
        assert_eq!(
            serde_json::to_value(OutboundMessage::Ping).unwrap(),
            serde_json::json!({"type": "ping"})
        );
    }
}
