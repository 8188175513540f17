//! Typed notifications published by the pipeline

use arbor_core::Diff;
use serde::Serialize;

use crate::health::{QueueHealth, SignificantChange};
use crate::scheduler::CycleReport;
use crate::throttle::ThrottleState;

/// Everything a subscriber (server, tests, CLI) can observe, on one broadcast channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    DiffCommitted { diff: Diff },
    BatchDropped { size: usize, reason: String },
    CycleCompleted { report: CycleReport },
    QueueHealth { health: QueueHealth, queue_size: usize },
    SignificantChange { change: SignificantChange },
    ThrottleChanged { state: ThrottleState },
    CachesCleared { reason: String },
}
