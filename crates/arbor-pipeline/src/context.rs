//! The pipeline context: one owner for every running component
//!
//! Built once at startup by [`PipelineBuilder`]. Collaborators (server, CLI,
//! watchers) hold an `Arc<PipelineContext>` and go through its methods; the
//! component handles themselves are not exposed for mutation.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::Result;
use arbor_ai::EnrichmentBackend;
use arbor_core::{
    ArborConfig, ArborError, ArborResult, ChangeBatch, ChangeEvent, DependencyGraph, Diff, DiffEngine, GraphSnapshot, NodeId,
    PathResult, Position, RawChange, Rect, SnapshotReader,
};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzers::{Analyzer, AnalyzerInfo, AnalyzerRegistry};
use crate::caches::{CacheReport, PipelineCaches};
use crate::controller::{PerformanceController, ResourceProbe, ResourceUsage, SysinfoProbe};
use crate::events::PipelineEvent;
use crate::gateway::{self, GatewayConfig, GatewayHandle, GatewayMetrics, GatewayStats};
use crate::health::significant_changes;
use crate::scheduler::{Scheduler, SchedulerSettings, SchedulerStats, TaskOrigin};
use crate::throttle::ThrottleState;
use crate::viewport::{ViewportAnswer, ViewportService};

const EVENT_CAPACITY: usize = 256;
const COMMIT_QUEUE_CAPACITY: usize = 64;

/// Something that can start and stop watching paths on the pipeline's behalf:
/// the local notify watcher or the remote ingress channel.
#[async_trait::async_trait]
pub trait PathWatcher: Send + Sync {
    async fn watch_path(&self, path: &str) -> Result<()>;

    async fn unwatch_path(&self, path: &str) -> Result<()>;

    fn watched(&self) -> Vec<String>;
}

/// Renderer-facing metrics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RendererMetrics {
    pub fps: Option<f64>,
    pub cpu: f64,
    pub memory: f64,
    pub throttle_level: f64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub version: u64,
    pub node_count: usize,
    pub link_count: usize,
    pub gateway: GatewayStats,
    pub scheduler: SchedulerStats,
    pub caches: CacheReport,
    pub throttle: ThrottleState,
    pub skip_frames: u32,
    pub fps: Option<f64>,
    pub resources: ResourceUsage,
    pub analyzers: Vec<AnalyzerInfo>,
    pub watched: Vec<String>,
}

pub struct PipelineBuilder {
    config: ArborConfig,
    snapshot: Option<GraphSnapshot>,
    enrichment: Option<Arc<dyn EnrichmentBackend>>,
    probe: Option<Arc<dyn ResourceProbe>>,
    analyzers: Vec<Arc<dyn Analyzer>>,
    builtins: bool,
}

impl PipelineBuilder {
    pub fn new(config: ArborConfig) -> Self {
        PipelineBuilder {
            config,
            snapshot: None,
            enrichment: None,
            probe: None,
            analyzers: Vec::new(),
            builtins: true,
        }
    }

    /// Start from an existing snapshot instead of an empty graph.
    pub fn with_snapshot(mut self, snapshot: GraphSnapshot) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    /// Override the backend selected by `[enrichment]`.
    pub fn with_enrichment(mut self, backend: Arc<dyn EnrichmentBackend>) -> Self {
        self.enrichment = Some(backend);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ResourceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn Analyzer>) -> Self {
        self.analyzers.push(analyzer);
        self
    }

    pub fn without_builtins(mut self) -> Self {
        self.builtins = false;
        self
    }

    /// Spawn every component on the current tokio runtime.
    pub fn start(self) -> Result<Arc<PipelineContext>> {
        let config = self.config;
        config.validate()?;

        let world = config.spatial.world_rect();
        let shutdown = CancellationToken::new();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let caches = Arc::new(PipelineCaches::new(&config.cache));

        let registry = Arc::new(if self.builtins {
            AnalyzerRegistry::with_builtins()
        } else {
            AnalyzerRegistry::new()
        });
        for analyzer in self.analyzers {
            registry.register(analyzer);
        }

        let enrichment: Arc<dyn EnrichmentBackend> = match self.enrichment {
            Some(backend) => backend,
            None => Arc::from(arbor_ai::from_config(&config.enrichment)?),
        };
        let probe: Arc<dyn ResourceProbe> = match self.probe {
            Some(probe) => probe,
            None => Arc::new(SysinfoProbe::new()),
        };

        let controller = Arc::new(PerformanceController::new(
            config.throttle.clone(),
            probe,
            Arc::clone(&caches),
            events.clone(),
        ));

        let scheduler = Arc::new(Scheduler::new(
            SchedulerSettings::from(&config.scheduler),
            Arc::clone(&registry),
            Arc::clone(&caches),
            enrichment,
            controller.subscribe(),
            events.clone(),
        ));

        let engine = DiffEngine::with_snapshot(self.snapshot.unwrap_or_default(), world);
        let snapshots = engine.subscribe();
        let engine = Arc::new(RwLock::new(engine));

        let (batch_tx, batch_rx) = mpsc::channel(COMMIT_QUEUE_CAPACITY);
        let (gateway, gateway_task) = gateway::spawn(
            GatewayConfig::from(&config.ingest),
            controller.subscribe(),
            batch_tx,
            world,
            shutdown.clone(),
        );

        let (progress_tx, progress_rx) = watch::channel(0u64);
        let commit_task = tokio::spawn(run_commit_stage(CommitStage {
            batches: batch_rx,
            engine: Arc::clone(&engine),
            scheduler: Arc::clone(&scheduler),
            metrics: Arc::clone(gateway.metrics()),
            events: events.clone(),
            significance_threshold: config.scheduler.significance_threshold,
            progress: progress_tx,
        }));
        let scheduler_task = tokio::spawn(Arc::clone(&scheduler).process_loop(shutdown.clone()));
        let controller_task = tokio::spawn(Arc::clone(&controller).run(shutdown.clone()));

        let viewport = ViewportService::new(
            &config.spatial,
            snapshots.clone(),
            Arc::clone(&caches),
            controller.subscribe(),
        );

        info!(
            "Pipeline started with {} analyzer(s), enrichment: {:?}",
            registry.len(),
            config.enrichment.backend
        );

        Ok(Arc::new(PipelineContext {
            config,
            engine,
            snapshots,
            gateway,
            commit_progress: progress_rx,
            scheduler,
            controller,
            registry,
            caches,
            viewport,
            events,
            watcher: Mutex::new(None),
            shutdown,
            tasks: Mutex::new(vec![gateway_task, commit_task, scheduler_task, controller_task]),
        }))
    }
}

struct CommitStage {
    batches: mpsc::Receiver<ChangeBatch>,
    engine: Arc<RwLock<DiffEngine>>,
    scheduler: Arc<Scheduler>,
    metrics: Arc<GatewayMetrics>,
    events: broadcast::Sender<PipelineEvent>,
    significance_threshold: f64,
    progress: watch::Sender<u64>,
}

/// Turn gateway batches into commits and analysis tasks. Ends when the gateway does.
async fn run_commit_stage(mut stage: CommitStage) {
    while let Some(batch) = stage.batches.recv().await {
        let size = batch.len();
        let committed = {
            let mut engine = stage.engine.write().await;
            engine.compute_and_commit(&batch)
        };

        match committed {
            Ok(diff) => {
                stage.metrics.record_processed(size);
                for change in significant_changes(&batch, stage.significance_threshold) {
                    info!("Significant change: {} ({:?}, score {:.1})", change.path, change.kind, change.score);
                    let _ = stage.events.send(PipelineEvent::SignificantChange { change });
                }
                if diff.is_empty() {
                    debug!("Batch of {} change(s) produced an empty diff", size);
                } else {
                    stage.scheduler.enqueue_diff(Arc::new(diff.clone()));
                }
                let _ = stage.events.send(PipelineEvent::DiffCommitted { diff });
            }
            Err(e) => {
                warn!("Dropping batch of {} change(s): {}", size, e);
                stage.metrics.record_dropped(size);
                let _ = stage.events.send(PipelineEvent::BatchDropped {
                    size,
                    reason: e.to_string(),
                });
            }
        }
        stage.progress.send_modify(|processed| *processed += 1);
    }
    debug!("Commit stage stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct PipelineContext {
    config: ArborConfig,
    engine: Arc<RwLock<DiffEngine>>,
    snapshots: SnapshotReader,
    gateway: GatewayHandle,
    commit_progress: watch::Receiver<u64>,
    scheduler: Arc<Scheduler>,
    controller: Arc<PerformanceController>,
    registry: Arc<AnalyzerRegistry>,
    caches: Arc<PipelineCaches>,
    viewport: ViewportService,
    events: broadcast::Sender<PipelineEvent>,
    watcher: Mutex<Option<Arc<dyn PathWatcher>>>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.snapshot();
        f.debug_struct("PipelineContext")
            .field("version", &snapshot.version)
            .field("node_count", &snapshot.node_count())
            .field("queue_size", &self.scheduler.queue_size())
            .field("throttle", &self.controller.state())
            .finish()
    }
}

impl PipelineContext {
    pub fn config(&self) -> &ArborConfig {
        &self.config
    }

    // Ingestion

    pub fn submit(&self, event: ChangeEvent) -> ArborResult<()> {
        self.gateway.submit(event)
    }

    pub fn submit_raw(&self, raw: RawChange) -> ArborResult<()> {
        self.gateway.submit_raw(raw)
    }

    /// Push every held change through the gateway and wait until the commit
    /// stage has handled the resulting batches.
    pub async fn flush(&self) -> ArborResult<()> {
        self.gateway.flush().await?;
        let target = self.gateway.metrics().batches_sent();
        let mut progress = self.commit_progress.clone();
        progress
            .wait_for(|processed| *processed >= target)
            .await
            .map(|_| ())
            .map_err(|_| ArborError::ChannelDisconnect("commit stage stopped".to_string()))
    }

    pub fn gateway(&self) -> &GatewayHandle {
        &self.gateway
    }

    // Snapshots

    pub fn snapshot(&self) -> Arc<GraphSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe_snapshots(&self) -> SnapshotReader {
        self.snapshots.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    /// Commit settled layout positions. Position-only diffs are not analyzed.
    pub async fn apply_layout(&self, positions: &BTreeMap<NodeId, Position>) -> ArborResult<Diff> {
        let diff = self.engine.write().await.apply_layout(positions)?;
        let _ = self.events.send(PipelineEvent::DiffCommitted { diff: diff.clone() });
        Ok(diff)
    }

    // Control surface

    pub fn attach_watcher(&self, watcher: Arc<dyn PathWatcher>) {
        *lock(&self.watcher) = Some(watcher);
    }

    fn watcher(&self) -> Result<Arc<dyn PathWatcher>> {
        lock(&self.watcher)
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no watcher attached to the pipeline"))
    }

    pub async fn watch_path(&self, path: &str) -> Result<()> {
        self.watcher()?.watch_path(path).await
    }

    pub async fn unwatch_path(&self, path: &str) -> Result<()> {
        self.watcher()?.unwatch_path(path).await
    }

    pub fn watched_paths(&self) -> Vec<String> {
        lock(&self.watcher).as_ref().map(|w| w.watched()).unwrap_or_default()
    }

    pub fn enable_analyzer(&self, name: &str) -> bool {
        self.registry.enable(name)
    }

    pub fn disable_analyzer(&self, name: &str) -> bool {
        self.registry.disable(name)
    }

    pub fn analyzers(&self) -> Vec<AnalyzerInfo> {
        self.registry.list()
    }

    pub fn set_throttle_level(&self, level: f64) -> ThrottleState {
        self.controller.set_level(level)
    }

    pub fn enable_adaptive_throttling(&self, enabled: bool) -> ThrottleState {
        self.controller.set_adaptive(enabled)
    }

    pub fn throttle(&self) -> ThrottleState {
        self.controller.state()
    }

    /// Queue an explicit analysis of `diff`. Returns the task id.
    pub fn trigger_analysis(&self, diff: Diff, priority: u8) -> u64 {
        let task = self.scheduler.new_task(Arc::new(diff), priority, TaskOrigin::Manual);
        self.scheduler.enqueue(task)
    }

    pub fn queue_size(&self) -> usize {
        self.scheduler.queue_size()
    }

    pub fn cache_stats(&self) -> CacheReport {
        self.caches.report()
    }

    pub fn clear_caches(&self) {
        self.caches.clear_all();
        info!("Caches cleared");
        let _ = self.events.send(PipelineEvent::CachesCleared {
            reason: "requested".to_string(),
        });
    }

    // Renderer interface

    pub fn query_viewport(&self, rect: Rect, zoom: f64) -> ViewportAnswer {
        self.viewport.query_viewport(rect, zoom)
    }

    pub fn sample_frame(&self, duration_ms: f64) {
        self.controller.sample_frame(duration_ms);
    }

    pub fn metrics(&self) -> RendererMetrics {
        let resources = self.controller.resources();
        RendererMetrics {
            fps: self.controller.fps(),
            cpu: resources.cpu_percent,
            memory: resources.memory_percent,
            throttle_level: self.controller.state().level,
            cache_hit_rate: self.caches.report().hit_rate,
        }
    }

    pub fn controller(&self) -> &Arc<PerformanceController> {
        &self.controller
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    // Queries over the committed snapshot

    pub fn shortest_path(&self, from: &NodeId, to: &NodeId) -> Option<PathResult> {
        DependencyGraph::from_snapshot(&self.snapshot()).shortest_path(from, to)
    }

    pub fn cycles(&self) -> Vec<Vec<NodeId>> {
        DependencyGraph::from_snapshot(&self.snapshot()).find_cycles()
    }

    pub fn chains(&self) -> Vec<Vec<NodeId>> {
        DependencyGraph::from_snapshot(&self.snapshot()).dependency_chains()
    }

    pub fn stats(&self) -> PipelineStats {
        let snapshot = self.snapshot();
        let throttle = self.controller.state();
        PipelineStats {
            version: snapshot.version,
            node_count: snapshot.node_count(),
            link_count: snapshot.link_count(),
            gateway: self.gateway.stats(),
            scheduler: self.scheduler.stats(),
            caches: self.caches.report(),
            throttle,
            skip_frames: throttle.skip_frames(),
            fps: self.controller.fps(),
            resources: self.controller.resources(),
            analyzers: self.registry.list(),
            watched: self.watched_paths(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop every component. Held changes are flushed and committed first.
    pub async fn shutdown(&self) {
        info!("Shutting down pipeline");
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Pipeline task ended abnormally: {}", e);
            }
        }
    }
}
