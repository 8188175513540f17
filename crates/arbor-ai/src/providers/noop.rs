//! Backend used when enrichment is disabled

use anyhow::Result;

use super::super::bridge::{AnalysisSummary, Enrichment, EnrichmentBackend};

pub struct NoopBackend;

#[async_trait::async_trait]
impl EnrichmentBackend for NoopBackend {
    async fn enrich(&self, _summaries: &[AnalysisSummary]) -> Result<Enrichment> {
        Ok(Enrichment {
            backend: self.name().to_string(),
            ..Enrichment::default()
        })
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "none"
    }
}
