//! Local enrichment backend for offline use

use anyhow::Result;

use super::super::bridge::{AnalysisSummary, Enrichment, EnrichmentBackend};
use super::super::prompt::extract_key_metrics;

/// Rule-based insights derived from the numeric analyzer metrics.
pub struct LocalBackend;

impl LocalBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for LocalBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl EnrichmentBackend for LocalBackend {
    async fn enrich(&self, summaries: &[AnalysisSummary]) -> Result<Enrichment> {
        let mut totals = std::collections::BTreeMap::<String, f64>::new();
        for summary in summaries {
            for (key, value) in extract_key_metrics(&summary.outcomes) {
                *totals.entry(key).or_default() += value;
            }
        }
        let metric = |key: &str| totals.get(key).copied().unwrap_or(0.0);

        let mut insights = Vec::new();
        let mut recommendations = Vec::new();

        let added = metric("dependency_dependencyChanges_added");
        let removed = metric("dependency_dependencyChanges_removed");
        if added > removed {
            insights.push(format!("Detected increase in module coupling (+{} links)", added - removed));
            recommendations.push("Refactor highly coupled modules".to_string());
        }
        if metric("dependency_dependencyChanges_circular") > 0.0 {
            insights.push("New links close a dependency cycle".to_string());
            recommendations.push("Break the cycle by extracting the shared code".to_string());
        }
        if metric("dependency_dependencyChanges_external") > 0.0 {
            insights.push("New external dependencies may impact performance".to_string());
            recommendations.push("Implement lazy loading for heavy dependencies".to_string());
        }
        if metric("security_vulnerabilityCount") > 0.0 || metric("security_sensitiveDataExposure") > 0.0 {
            insights.push("Changes touch unvalidated input or sensitive data".to_string());
            recommendations.push("Review input validation and secret handling".to_string());
        }
        if metric("performance_performanceMetrics_hotspots") > 0.0
            || metric("performance_performanceMetrics_bottlenecks") > 0.0
        {
            insights.push("Complexity hotspots or fan-in bottlenecks changed".to_string());
            recommendations.push("Add performance monitoring".to_string());
        }

        Ok(Enrichment {
            backend: self.name().to_string(),
            insights,
            recommendations,
        })
    }

    fn name(&self) -> &str {
        "local"
    }
}
