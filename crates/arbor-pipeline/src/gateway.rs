//! Change ingestion gateway: per-path debounce, then windowed batching
//!
//! The gateway is a single task owning all timer state. Submitting a change
//! for a path that is still debouncing replaces the held event and pushes its
//! deadline out, so a burst on one path collapses into one queued change.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use arbor_core::config::IngestConfig;
use arbor_core::{ArborError, ArborResult, ChangeBatch, ChangeEvent, ChangeKind, RawChange, Rect, normalize};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::throttle::ThrottleReader;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatewayConfig {
    pub debounce: Duration,
    pub batch_delay: Duration,
    pub max_batch_size: usize,
}

impl From<&IngestConfig> for GatewayConfig {
    fn from(config: &IngestConfig) -> Self {
        GatewayConfig {
            debounce: Duration::from_millis(config.debounce_ms),
            batch_delay: Duration::from_millis(config.batch_ms),
            max_batch_size: config.max_batch_size.max(1),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig::from(&IngestConfig::default())
    }
}

/// Ingestion counters shared between the gateway, the commit stage and the ingress client.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    total: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    reconnect_attempts: AtomicU64,
    last_update_ms: AtomicI64,
    queued: AtomicUsize,
    debouncing: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GatewayStats {
    pub total_changes: u64,
    pub processed_changes: u64,
    pub dropped_changes: u64,
    pub batches_sent: u64,
    pub reconnect_attempts: u64,
    pub last_update: Option<DateTime<Utc>>,
    pub queue_size: usize,
    pub debouncing: usize,
}

impl GatewayMetrics {
    pub fn record_submitted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_processed(&self, count: usize) {
        self.processed.fetch_add(count as u64, Ordering::Relaxed);
        self.last_update_ms.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: usize) {
        self.dropped.fetch_add(count as u64, Ordering::Relaxed);
    }

    fn record_batch_sent(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    /// Batches handed to the commit stage so far.
    pub fn batches_sent(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn record_reconnect(&self) -> u64 {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn set_gauges(&self, queued: usize, debouncing: usize) {
        self.queued.store(queued, Ordering::Relaxed);
        self.debouncing.store(debouncing, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> GatewayStats {
        let last = self.last_update_ms.load(Ordering::Relaxed);
        GatewayStats {
            total_changes: self.total.load(Ordering::Relaxed),
            processed_changes: self.processed.load(Ordering::Relaxed),
            dropped_changes: self.dropped.load(Ordering::Relaxed),
            batches_sent: self.batches.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            last_update: (last > 0).then(|| DateTime::<Utc>::from_timestamp_millis(last)).flatten(),
            queue_size: self.queued.load(Ordering::Relaxed),
            debouncing: self.debouncing.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Submit(ChangeEvent),
    Flush(oneshot::Sender<()>),
}

/// Cloneable entry point into a running gateway.
#[derive(Debug, Clone)]
pub struct GatewayHandle {
    tx: mpsc::UnboundedSender<Command>,
    metrics: Arc<GatewayMetrics>,
    world: Rect,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Submit(event) => write!(f, "Submit({})", event.path),
            Command::Flush(_) => f.write_str("Flush"),
        }
    }
}

impl GatewayHandle {
    /// Queue a normalized change for debouncing.
    pub fn submit(&self, event: ChangeEvent) -> ArborResult<()> {
        self.metrics.record_submitted();
        self.tx
            .send(Command::Submit(event))
            .map_err(|_| ArborError::ChannelDisconnect("gateway stopped".to_string()))
    }

    /// Normalize and queue a raw notification. Malformed notifications are
    /// logged, counted as dropped and reported back to the caller.
    pub fn submit_raw(&self, raw: RawChange) -> ArborResult<()> {
        match normalize(raw, self.world) {
            Ok(event) => self.submit(event),
            Err(e) => {
                warn!("Dropping change: {}", e);
                self.metrics.record_submitted();
                self.metrics.record_dropped(1);
                Err(e)
            }
        }
    }

    /// Skip the remaining debounce and batch delays and hand every held change
    /// to the commit stage. Resolves once the batches are sent.
    pub async fn flush(&self) -> ArborResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.tx
            .send(Command::Flush(done_tx))
            .map_err(|_| ArborError::ChannelDisconnect("gateway stopped".to_string()))?;
        done_rx
            .await
            .map_err(|_| ArborError::ChannelDisconnect("gateway stopped during flush".to_string()))
    }

    pub fn metrics(&self) -> &Arc<GatewayMetrics> {
        &self.metrics
    }

    pub fn stats(&self) -> GatewayStats {
        self.metrics.snapshot()
    }
}

struct Debouncing {
    deadline: Instant,
    seq: u64,
    event: ChangeEvent,
}

struct Gateway {
    config: GatewayConfig,
    throttle: ThrottleReader,
    out: mpsc::Sender<ChangeBatch>,
    metrics: Arc<GatewayMetrics>,
    debouncing: HashMap<String, Debouncing>,
    pending: VecDeque<ChangeEvent>,
    batch_deadline: Option<Instant>,
    next_seq: u64,
}

/// Start the gateway task. Batches are delivered to `out` in flush order.
pub fn spawn(
    config: GatewayConfig,
    throttle: ThrottleReader,
    out: mpsc::Sender<ChangeBatch>,
    world: Rect,
    shutdown: CancellationToken,
) -> (GatewayHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let metrics = Arc::new(GatewayMetrics::default());
    let gateway = Gateway {
        config,
        throttle,
        out,
        metrics: Arc::clone(&metrics),
        debouncing: HashMap::new(),
        pending: VecDeque::new(),
        batch_deadline: None,
        next_seq: 0,
    };
    let task = tokio::spawn(gateway.run(rx, shutdown));
    (GatewayHandle { tx, metrics, world }, task)
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl Gateway {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, shutdown: CancellationToken) {
        info!(
            "Gateway started (debounce {:?}, batch {:?}, max batch {})",
            self.config.debounce, self.config.batch_delay, self.config.max_batch_size
        );
        loop {
            let wake = self.next_wake();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush_everything().await;
                    break;
                }
                command = rx.recv() => match command {
                    Some(Command::Submit(event)) => self.debounce(event),
                    Some(Command::Flush(done)) => {
                        self.flush_everything().await;
                        let _ = done.send(());
                    }
                    None => {
                        self.flush_everything().await;
                        break;
                    }
                },
                _ = wait_until(wake) => self.on_timer().await,
            }
            self.metrics.set_gauges(self.pending.len(), self.debouncing.len());
        }
        info!("Gateway stopped");
    }

    fn debounce_delay(&self) -> Duration {
        self.throttle.borrow().scale_delay(self.config.debounce)
    }

    fn batch_delay(&self) -> Duration {
        self.throttle.borrow().scale_delay(self.config.batch_delay)
    }

    fn next_wake(&self) -> Option<Instant> {
        let debounce = self.debouncing.values().map(|d| d.deadline).min();
        match (debounce, self.batch_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn debounce(&mut self, event: ChangeEvent) {
        let deadline = Instant::now() + self.debounce_delay();
        let seq = self.next_seq;
        self.next_seq += 1;
        let path = event.path.clone();
        let event = match self.debouncing.get(&path) {
            Some(held) => coalesce(&held.event, event),
            None => event,
        };
        if self.debouncing.insert(path.clone(), Debouncing { deadline, seq, event }).is_some() {
            debug!("Rescheduled debounce for {}", path);
        }
    }

    /// Move a settled change into the pending queue, replacing a queued change for the same path.
    fn enqueue(&mut self, event: ChangeEvent) {
        match self.pending.iter_mut().find(|queued| queued.path == event.path) {
            Some(queued) => *queued = coalesce(queued, event),
            None => self.pending.push_back(event),
        }
        self.batch_deadline = Some(Instant::now() + self.batch_delay());
    }

    async fn on_timer(&mut self) {
        let now = Instant::now();

        let mut settled: Vec<Debouncing> = Vec::new();
        self.debouncing.retain(|_, d| {
            if d.deadline <= now {
                settled.push(Debouncing {
                    deadline: d.deadline,
                    seq: d.seq,
                    event: d.event.clone(),
                });
                false
            } else {
                true
            }
        });
        settled.sort_by_key(|d| (d.deadline, d.seq));
        for d in settled {
            self.enqueue(d.event);
        }

        if self.batch_deadline.is_some_and(|deadline| deadline <= now) {
            self.batch_deadline = None;
            self.flush_batch().await;
            if !self.pending.is_empty() {
                self.batch_deadline = Some(Instant::now() + self.batch_delay());
            }
        }
    }

    /// Send up to `max_batch_size` pending changes as one batch.
    async fn flush_batch(&mut self) {
        let take = self.pending.len().min(self.config.max_batch_size);
        if take == 0 {
            return;
        }
        let batch: ChangeBatch = self.pending.drain(..take).collect();
        let size = batch.len();
        debug!("Flushing batch of {} change(s), {} still pending", size, self.pending.len());
        match self.out.send(batch).await {
            Ok(()) => self.metrics.record_batch_sent(),
            Err(_) => {
                warn!("Commit stage unavailable, dropping batch of {} change(s)", size);
                self.metrics.record_dropped(size);
            }
        }
    }

    async fn flush_everything(&mut self) {
        let mut held: Vec<Debouncing> = self.debouncing.drain().map(|(_, d)| d).collect();
        held.sort_by_key(|d| (d.deadline, d.seq));
        for d in held {
            self.enqueue(d.event);
        }
        while !self.pending.is_empty() {
            self.flush_batch().await;
        }
        self.batch_deadline = None;
    }
}

/// Fold a newer change for a path into the one already held. The newer payload
/// always wins, but a file created in the same burst stays an addition.
fn coalesce(held: &ChangeEvent, mut latest: ChangeEvent) -> ChangeEvent {
    if held.kind == ChangeKind::Added && latest.kind == ChangeKind::Modified {
        latest.kind = ChangeKind::Added;
    }
    latest
}
