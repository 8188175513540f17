//! Ingestion, analysis scheduling and adaptive throttling for Arbor
//!
//! Data flows one way through typed channels:
//!
//! ```text
//! raw change -> Gateway (debounce, batch) -> commit stage (DiffEngine) -> Scheduler -> analyzers
//!                    ^                                                      ^
//!                    +------------- ThrottleState (watch) -----------------+
//!                                          |
//!                               PerformanceController
//! ```
//!
//! [`PipelineContext`] owns every component; nothing here is global, so
//! several independent pipelines can run in one process.

pub mod analyzers;
pub mod caches;
pub mod context;
pub mod controller;
pub mod events;
pub mod gateway;
pub mod health;
pub mod scheduler;
pub mod throttle;
pub mod viewport;


pub use analyzers::{Analyzer, AnalyzerInfo, AnalyzerRegistry};
pub use caches::{AnalysisKey, CacheReport, PipelineCaches, RenderKey};
pub use context::{PathWatcher, PipelineBuilder, PipelineContext, PipelineStats, RendererMetrics};
pub use controller::{PerformanceController, ResourceProbe, ResourceUsage, SysinfoProbe};
pub use events::PipelineEvent;
pub use gateway::{GatewayConfig, GatewayHandle, GatewayMetrics, GatewayStats};
pub use health::{QueueHealth, SignificantChange};
pub use scheduler::{
    AnalysisResult, AnalysisTask, AnalyzerOutcome, CycleReport, Scheduler, SchedulerSettings, SchedulerStats,
    TaskOrigin, TimeoutPolicy, priority_for,
};
pub use throttle::{ThrottleReader, ThrottleState};
pub use viewport::{ViewportAnswer, ViewportService};
