//! Priority-ordered analysis scheduling with bounded concurrency
//!
//! One coordinating loop pops up to `max_concurrent` tasks (scaled by the
//! throttle) per cycle, runs them in parallel, and waits for the whole
//! dispatched set before reporting the cycle.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BTreeMap, BinaryHeap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use arbor_ai::{AnalysisSummary, Enrichment, EnrichmentBackend};
use arbor_core::config::SchedulerConfig;
use arbor_core::{ArborError, ChangeKind, Diff};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzers::{Analyzer, AnalyzerRegistry};
use crate::caches::{AnalysisKey, PipelineCaches};
use crate::events::PipelineEvent;
use crate::health::QueueHealth;
use crate::throttle::ThrottleReader;

pub const MAX_PRIORITY: u8 = 10;

/// Priority of the task created for a committed diff.
///
/// Base 5; +3 when anything was removed, else +2 for modifications, else +1
/// for additions; +2 when more than 10 nodes are touched and +3 more above 50.
pub fn priority_for(diff: &Diff) -> u8 {
    let mut priority: u8 = 5;
    priority += match diff.dominant_change() {
        Some(ChangeKind::Removed) => 3,
        Some(ChangeKind::Modified) => 2,
        Some(ChangeKind::Added) => 1,
        None => 0,
    };
    let touched = diff.touched_nodes();
    if touched > 10 {
        priority += 2;
    }
    if touched > 50 {
        priority += 3;
    }
    priority.min(MAX_PRIORITY)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskOrigin {
    /// Created by the commit stage for a committed diff.
    Commit,
    /// Requested through the control surface.
    Manual,
}

/// One unit of analysis work. Immutable once created.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisTask {
    pub id: u64,
    pub priority: u8,
    pub origin: TaskOrigin,
    pub payload: Arc<Diff>,
    pub created_at: DateTime<Utc>,
}

impl AnalysisTask {
    /// Operation label handed to enrichment.
    pub fn operation(&self) -> &'static str {
        match (self.origin, self.payload.dominant_change()) {
            (TaskOrigin::Manual, _) => "manual",
            (_, Some(ChangeKind::Removed)) => "removed",
            (_, Some(ChangeKind::Modified)) => "modified",
            (_, Some(ChangeKind::Added)) => "added",
            (_, None) => "empty",
        }
    }
}

/// Outcome of one analyzer for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalyzerOutcome {
    Completed {
        output: serde_json::Value,
    },
    Failed {
        error: String,
        #[serde(default)]
        timed_out: bool,
    },
}

impl AnalyzerOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, AnalyzerOutcome::Completed { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AnalyzerOutcome::Failed { timed_out: true, .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub task_id: u64,
    pub priority: u8,
    pub per_analyzer: BTreeMap<String, AnalyzerOutcome>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enrichment: Option<Enrichment>,
}

impl AnalysisResult {
    /// At least one analyzer produced an outcome.
    pub fn is_successful(&self) -> bool {
        self.per_analyzer.values().any(AnalyzerOutcome::is_ok)
    }
}

/// A task as it was selected for a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Dispatch {
    pub task_id: u64,
    pub priority: u8,
    pub operation: &'static str,
}

/// Aggregate completion notification for one cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    /// Selection order, highest priority first.
    pub dispatched: Vec<Dispatch>,
    /// One result per dispatched task, in selection order.
    pub results: Vec<AnalysisResult>,
    pub queue_size: usize,
    pub health: QueueHealth,
}

/// What happens to an analyzer call whose deadline passed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Abort the analyzer task at its next await point.
    Cancel,
    /// Discard the result but let the analyzer run to completion in the background.
    Detach,
}

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub max_concurrent: usize,
    pub analyzer_timeout: Duration,
    pub cycle_pause: Duration,
    pub timeout_policy: TimeoutPolicy,
}

impl From<&SchedulerConfig> for SchedulerSettings {
    fn from(config: &SchedulerConfig) -> Self {
        SchedulerSettings {
            max_concurrent: config.max_concurrent.max(1),
            analyzer_timeout: Duration::from_millis(config.analyzer_timeout_ms),
            cycle_pause: Duration::from_millis(config.cycle_pause_ms),
            timeout_policy: if config.cancel_on_timeout {
                TimeoutPolicy::Cancel
            } else {
                TimeoutPolicy::Detach
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Default)]
pub struct SchedulerStats {
    pub total_analyses: u64,
    pub completed_analyses: u64,
    pub failed_analyses: u64,
    pub analyzer_failures: u64,
    pub analyzer_timeouts: u64,
    pub enrichments: u64,
    pub cycles: u64,
    pub average_analysis_ms: f64,
    pub last_analysis_at: Option<DateTime<Utc>>,
    pub queue_size: usize,
}

struct Queued {
    priority: u8,
    seq: u64,
    task: AnalysisTask,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    // Max-heap: highest priority, then earliest enqueued.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, Reverse(self.seq)).cmp(&(other.priority, Reverse(other.seq)))
    }
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    analyzer_failures: AtomicU64,
    analyzer_timeouts: AtomicU64,
    enrichments: AtomicU64,
    cycles: AtomicU64,
}

#[derive(Default)]
struct Timing {
    average_ms: f64,
    samples: u64,
    last_at: Option<DateTime<Utc>>,
}

pub struct Scheduler {
    settings: SchedulerSettings,
    queue: Mutex<BinaryHeap<Queued>>,
    wakeup: Notify,
    next_seq: AtomicU64,
    next_task_id: AtomicU64,
    registry: Arc<AnalyzerRegistry>,
    caches: Arc<PipelineCaches>,
    enrichment: Arc<dyn EnrichmentBackend>,
    throttle: ThrottleReader,
    events: broadcast::Sender<PipelineEvent>,
    counters: Counters,
    timing: Mutex<Timing>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("settings", &self.settings)
            .field("queue_size", &self.queue_size())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Content hash of a diff, ignoring its version numbers.
fn fingerprint(diff: &Diff) -> Option<u64> {
    let content = serde_json::to_vec(&(
        &diff.added_nodes,
        &diff.modified_nodes,
        &diff.removed_node_ids,
        &diff.added_links,
        &diff.modified_links,
        &diff.removed_link_ids,
    ))
    .ok()?;
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    Some(hasher.finish())
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        registry: Arc<AnalyzerRegistry>,
        caches: Arc<PipelineCaches>,
        enrichment: Arc<dyn EnrichmentBackend>,
        throttle: ThrottleReader,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        Scheduler {
            settings,
            queue: Mutex::new(BinaryHeap::new()),
            wakeup: Notify::new(),
            next_seq: AtomicU64::new(0),
            next_task_id: AtomicU64::new(1),
            registry,
            caches,
            enrichment,
            throttle,
            events,
            counters: Counters::default(),
            timing: Mutex::new(Timing::default()),
        }
    }

    /// Build a task for `diff`. Priorities above 10 are capped.
    pub fn new_task(&self, diff: Arc<Diff>, priority: u8, origin: TaskOrigin) -> AnalysisTask {
        AnalysisTask {
            id: self.next_task_id.fetch_add(1, Ordering::Relaxed),
            priority: priority.min(MAX_PRIORITY),
            origin,
            payload: diff,
            created_at: Utc::now(),
        }
    }

    /// Queue a task and wake the processing loop. Returns the task id.
    pub fn enqueue(&self, task: AnalysisTask) -> u64 {
        let id = task.id;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let size = {
            let mut queue = lock(&self.queue);
            queue.push(Queued {
                priority: task.priority,
                seq,
                task,
            });
            queue.len()
        };
        debug!("Enqueued analysis task {} (queue size {})", id, size);
        self.wakeup.notify_one();
        id
    }

    /// Queue a task for a committed diff, prioritised by its shape.
    pub fn enqueue_diff(&self, diff: Arc<Diff>) -> u64 {
        let priority = priority_for(&diff);
        self.enqueue(self.new_task(diff, priority, TaskOrigin::Commit))
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn health(&self) -> QueueHealth {
        QueueHealth::classify(self.queue_size())
    }

    /// Concurrency for the next cycle under the current throttle level.
    pub fn current_concurrency(&self) -> usize {
        self.throttle.borrow().scale_concurrency(self.settings.max_concurrent)
    }

    fn take_batch(&self, limit: usize) -> Vec<AnalysisTask> {
        let mut queue = lock(&self.queue);
        let mut batch = Vec::with_capacity(limit);
        while batch.len() < limit {
            match queue.pop() {
                Some(queued) => batch.push(queued.task),
                None => break,
            }
        }
        batch
    }

    /// Run one cycle: select, execute, join, enrich, report. `None` when the queue was empty.
    pub async fn run_cycle(self: &Arc<Self>) -> Option<CycleReport> {
        let tasks = self.take_batch(self.current_concurrency());
        if tasks.is_empty() {
            return None;
        }

        let cycle = self.counters.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let dispatched: Vec<Dispatch> = tasks
            .iter()
            .map(|t| Dispatch {
                task_id: t.id,
                priority: t.priority,
                operation: t.operation(),
            })
            .collect();
        info!(
            "Analysis cycle {}: dispatching {} task(s), priorities {:?}",
            cycle,
            tasks.len(),
            dispatched.iter().map(|d| d.priority).collect::<Vec<_>>()
        );

        let mut workers = JoinSet::new();
        for (slot, task) in tasks.into_iter().enumerate() {
            let scheduler = Arc::clone(self);
            workers.spawn(async move { (slot, scheduler.process_task(task).await) });
        }

        let mut slots: Vec<Option<AnalysisResult>> = vec![None; dispatched.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((slot, result)) => slots[slot] = Some(result),
                Err(e) => error!("Analysis worker failed: {}", e),
            }
        }
        let mut results: Vec<AnalysisResult> = slots.into_iter().flatten().collect();

        self.enrich(&dispatched, &mut results).await;

        let queue_size = self.queue_size();
        let health = QueueHealth::classify(queue_size);
        let report = CycleReport {
            cycle,
            dispatched,
            results,
            queue_size,
            health,
        };
        let _ = self.events.send(PipelineEvent::CycleCompleted { report: report.clone() });
        let _ = self.events.send(PipelineEvent::QueueHealth { health, queue_size });
        if health != QueueHealth::Healthy {
            warn!("Analysis queue is {:?} ({} pending)", health, queue_size);
        }
        Some(report)
    }

    async fn process_task(&self, task: AnalysisTask) -> AnalysisResult {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);
        debug!("Analyzing task {} (priority {})", task.id, task.priority);

        let fingerprint = fingerprint(&task.payload);
        let analyzers = self.registry.enabled();
        let runs = analyzers
            .into_iter()
            .map(|analyzer| self.run_analyzer(analyzer, Arc::clone(&task.payload), fingerprint));
        let per_analyzer: BTreeMap<String, AnalyzerOutcome> = join_all(runs).await.into_iter().collect();

        let duration_ms = started.elapsed().as_millis() as u64;
        let completed_at = Utc::now();
        let result = AnalysisResult {
            task_id: task.id,
            priority: task.priority,
            per_analyzer,
            duration_ms,
            completed_at,
            enrichment: None,
        };

        if result.is_successful() || result.per_analyzer.is_empty() {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
        }
        {
            let mut timing = lock(&self.timing);
            timing.samples += 1;
            timing.average_ms += (duration_ms as f64 - timing.average_ms) / timing.samples as f64;
            timing.last_at = Some(completed_at);
        }
        debug!("Task {} analyzed in {}ms", task.id, duration_ms);
        result
    }

    async fn run_analyzer(
        &self,
        analyzer: Arc<dyn Analyzer>,
        diff: Arc<Diff>,
        fingerprint: Option<u64>,
    ) -> (String, AnalyzerOutcome) {
        let name = analyzer.name().to_string();
        let key = fingerprint.map(|fingerprint| AnalysisKey {
            analyzer: name.clone(),
            fingerprint,
        });

        if let Some(cached) = key.as_ref().and_then(|k| self.caches.analysis.get(k)) {
            debug!("Analyzer {} served from cache", name);
            return (name, AnalyzerOutcome::Completed { output: cached });
        }

        let mut handle = tokio::spawn(async move { analyzer.analyze(&diff).await });
        let timeout = self.settings.analyzer_timeout;

        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(Ok(value))) => {
                if let Some(key) = key {
                    self.caches.analysis.set(key, value.clone());
                }
                AnalyzerOutcome::Completed { output: value }
            }
            Ok(Ok(Err(e))) => {
                let failure = ArborError::AnalyzerFailure {
                    name: name.clone(),
                    message: format!("{:#}", e),
                };
                warn!("{}", failure);
                self.counters.analyzer_failures.fetch_add(1, Ordering::Relaxed);
                AnalyzerOutcome::Failed {
                    error: failure.to_string(),
                    timed_out: false,
                }
            }
            Ok(Err(join_error)) => {
                let failure = ArborError::AnalyzerFailure {
                    name: name.clone(),
                    message: if join_error.is_panic() {
                        "analyzer panicked".to_string()
                    } else {
                        join_error.to_string()
                    },
                };
                warn!("{}", failure);
                self.counters.analyzer_failures.fetch_add(1, Ordering::Relaxed);
                AnalyzerOutcome::Failed {
                    error: failure.to_string(),
                    timed_out: false,
                }
            }
            Err(_) => {
                let failure = ArborError::AnalyzerTimeout {
                    name: name.clone(),
                    timeout_ms: timeout.as_millis() as u64,
                };
                match self.settings.timeout_policy {
                    TimeoutPolicy::Cancel => handle.abort(),
                    TimeoutPolicy::Detach => debug!("Analyzer {} left running after timeout", name),
                }
                warn!("{}", failure);
                self.counters.analyzer_timeouts.fetch_add(1, Ordering::Relaxed);
                AnalyzerOutcome::Failed {
                    error: failure.to_string(),
                    timed_out: true,
                }
            }
        };
        (name, outcome)
    }

    /// Best-effort enrichment of the cycle's successful results.
    async fn enrich(&self, dispatched: &[Dispatch], results: &mut [AnalysisResult]) {
        if !self.enrichment.is_enabled() {
            return;
        }

        let summaries: Vec<AnalysisSummary> = results
            .iter()
            .filter(|r| r.is_successful())
            .map(|r| AnalysisSummary {
                task_id: r.task_id,
                operation: dispatched
                    .iter()
                    .find(|d| d.task_id == r.task_id)
                    .map(|d| d.operation.to_string())
                    .unwrap_or_default(),
                outcomes: r
                    .per_analyzer
                    .iter()
                    .filter_map(|(name, outcome)| match outcome {
                        AnalyzerOutcome::Completed { output } => Some((name.clone(), output.clone())),
                        AnalyzerOutcome::Failed { .. } => None,
                    })
                    .collect(),
            })
            .collect();
        if summaries.is_empty() {
            return;
        }

        match self.enrichment.enrich(&summaries).await {
            Ok(enrichment) => {
                self.counters.enrichments.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Enrichment via {}: {} insight(s), {} recommendation(s)",
                    enrichment.backend,
                    enrichment.insights.len(),
                    enrichment.recommendations.len()
                );
                for result in results.iter_mut().filter(|r| r.is_successful()) {
                    result.enrichment = Some(enrichment.clone());
                }
            }
            Err(e) => warn!("Enrichment via {} failed: {:#}", self.enrichment.name(), e),
        }
    }

    /// Process cycles until cancelled. Sleeps while the queue is empty.
    pub async fn process_loop(self: Arc<Self>, shutdown: CancellationToken) {
        info!("Analysis scheduler started");
        loop {
            if self.queue_size() == 0 {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = self.wakeup.notified() => {}
                }
            }

            self.run_cycle().await;

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.cycle_pause) => {}
            }
        }
        info!("Analysis scheduler stopped");
    }

    pub fn stats(&self) -> SchedulerStats {
        let timing = lock(&self.timing);
        SchedulerStats {
            total_analyses: self.counters.total.load(Ordering::Relaxed),
            completed_analyses: self.counters.completed.load(Ordering::Relaxed),
            failed_analyses: self.counters.failed.load(Ordering::Relaxed),
            analyzer_failures: self.counters.analyzer_failures.load(Ordering::Relaxed),
            analyzer_timeouts: self.counters.analyzer_timeouts.load(Ordering::Relaxed),
            enrichments: self.counters.enrichments.load(Ordering::Relaxed),
            cycles: self.counters.cycles.load(Ordering::Relaxed),
            average_analysis_ms: timing.average_ms,
            last_analysis_at: timing.last_at,
            queue_size: self.queue_size(),
        }
    }

    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arbor_core::{NodeKind, NodeRecord};

    fn diff_touching(added: usize, modified: usize, removed: usize) -> Diff {
        Diff {
            base_version: 0,
            result_version: 1,
            added_nodes: (0..added).map(|i| NodeRecord::new(format!("a{}", i), NodeKind::Module)).collect(),
            modified_nodes: (0..modified).map(|i| NodeRecord::new(format!("m{}", i), NodeKind::Module)).collect(),
            removed_node_ids: (0..removed).map(|i| format!("r{}", i).as_str().into()).collect(),
            ..Diff::default()
        }
    }

    #[test]
    fn test_priority_formula() {
        assert_eq!(priority_for(&Diff::default()), 5);
        assert_eq!(priority_for(&diff_touching(1, 0, 0)), 6);
        assert_eq!(priority_for(&diff_touching(0, 1, 0)), 7);
        assert_eq!(priority_for(&diff_touching(0, 0, 1)), 8);
        assert_eq!(priority_for(&diff_touching(11, 0, 0)), 8);
        assert_eq!(priority_for(&diff_touching(0, 11, 0)), 9);
        assert_eq!(priority_for(&diff_touching(51, 0, 0)), 10);
        assert_eq!(priority_for(&diff_touching(0, 0, 51)), 10);
        assert_eq!(priority_for(&diff_touching(3, 3, 1)), 8);
    }

    #[test]
    fn test_queue_order_is_priority_then_fifo() {
        let mut heap = BinaryHeap::new();
        let task = |id: u64, priority: u8| AnalysisTask {
            id,
            priority,
            origin: TaskOrigin::Manual,
            payload: Arc::new(Diff::default()),
            created_at: Utc::now(),
        };
        for (seq, (id, priority)) in [(1, 3), (2, 7), (3, 5), (4, 7)].into_iter().enumerate() {
            heap.push(Queued {
                priority,
                seq: seq as u64,
                task: task(id, priority),
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|q| q.task.id)).collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_outcome_serialization() {
        let failed = AnalyzerOutcome::Failed {
            error: "boom".to_string(),
            timed_out: false,
        };
        let json = serde_json::to_value(&failed).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "boom");

        // Analyzer output that carries its own error field stays a completion.
        let completed = AnalyzerOutcome::Completed {
            output: serde_json::json!({"count": 1, "error": "none found"}),
        };
        let json = serde_json::to_value(&completed).unwrap();
        assert_eq!(json["status"], "completed");
        assert_eq!(json["output"]["count"], 1);
        let back: AnalyzerOutcome = serde_json::from_value(json).unwrap();
        assert_eq!(back, completed);
    }

    #[test]
    fn test_fingerprint_ignores_versions() {
        let mut a = diff_touching(2, 0, 0);
        let mut b = a.clone();
        a.base_version = 4;
        b.base_version = 9;
        assert_eq!(fingerprint(&a), fingerprint(&b));
        b.removed_node_ids.push("x".into());
        assert_ne!(fingerprint(&a), fingerprint(&b));
    }
}
