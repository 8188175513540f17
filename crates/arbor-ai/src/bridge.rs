//! Enrichment backend trait and the data passed across it

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// One successful analysis handed to the enrichment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub task_id: u64,
    /// Dominant change of the analyzed diff (`added`, `modified`, `removed`, `manual`).
    pub operation: String,
    /// Outcome per analyzer; failed analyzers are not included.
    pub outcomes: BTreeMap<String, serde_json::Value>,
}

/// What an enrichment backend adds to every result of a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Enrichment {
    pub backend: String,
    pub insights: Vec<String>,
    pub recommendations: Vec<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.insights.is_empty() && self.recommendations.is_empty()
    }
}

/// Strategy used by the scheduler after each cycle. Failures are logged by
/// the caller and never propagated into analysis results.
#[async_trait::async_trait]
pub trait EnrichmentBackend: Send + Sync {
    /// Produce insights for a cycle's successful results.
    async fn enrich(&self, summaries: &[AnalysisSummary]) -> Result<Enrichment>;

    /// Whether the scheduler should call this backend at all.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Get backend name
    fn name(&self) -> &str;
}
