//! Queue health classification and significant-change detection

use arbor_core::{ChangeEvent, ChangeKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Depth above which the analysis queue is reported as `warning`.
pub const QUEUE_WARNING_DEPTH: usize = 20;
/// Depth above which the analysis queue is reported as `critical`.
pub const QUEUE_CRITICAL_DEPTH: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueHealth {
    Healthy,
    Warning,
    Critical,
}

impl QueueHealth {
    pub fn classify(queue_size: usize) -> Self {
        if queue_size > QUEUE_CRITICAL_DEPTH {
            QueueHealth::Critical
        } else if queue_size > QUEUE_WARNING_DEPTH {
            QueueHealth::Warning
        } else {
            QueueHealth::Healthy
        }
    }
}

/// A committed change whose significance score reached the configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignificantChange {
    pub path: String,
    pub kind: ChangeKind,
    pub score: f64,
    pub observed_at: DateTime<Utc>,
}

/// Heuristic importance of a single change.
pub fn significance(change: &ChangeEvent) -> f64 {
    let mut score = 0.0;
    match change.kind {
        ChangeKind::Added => score += 0.3,
        ChangeKind::Removed => score += 0.5,
        ChangeKind::Modified => {}
    }
    let path = change.path.to_lowercase();
    if path.contains("critical") {
        score += 0.4;
    }
    if path.contains("security") {
        score += 0.5;
    }
    score
}

/// Changes of a batch scoring at or above `threshold`.
pub fn significant_changes(batch: &[ChangeEvent], threshold: f64) -> Vec<SignificantChange> {
    batch
        .iter()
        .filter_map(|change| {
            let score = significance(change);
            (score >= threshold).then(|| SignificantChange {
                path: change.path.clone(),
                kind: change.kind,
                score,
                observed_at: change.observed_at,
            })
        })
        .collect()
}
