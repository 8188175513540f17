//! The two result-cache pools shared by the scheduler and the viewport service

use std::time::Duration;

use arbor_core::config::CacheConfig;
use arbor_core::{CacheStats, Rect, ResultCache};
use serde::Serialize;

use crate::viewport::ViewportAnswer;

/// Analyzer outcome key: one entry per analyzer and diff content.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AnalysisKey {
    pub analyzer: String,
    pub fingerprint: u64,
}

/// Viewport answer key. Floats are keyed by their exact bit patterns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RenderKey {
    pub version: u64,
    pub rect: [u64; 4],
    pub zoom: u64,
}

impl RenderKey {
    pub fn new(version: u64, rect: Rect, zoom: f64) -> Self {
        RenderKey {
            version,
            rect: [rect.x0.to_bits(), rect.y0.to_bits(), rect.x1.to_bits(), rect.y1.to_bits()],
            zoom: zoom.to_bits(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CacheReport {
    pub analysis: CacheStats,
    pub render: CacheStats,
    /// Hit rate over both pools.
    pub hit_rate: f64,
}

#[derive(Debug)]
pub struct PipelineCaches {
    pub analysis: ResultCache<AnalysisKey, serde_json::Value>,
    pub render: ResultCache<RenderKey, ViewportAnswer>,
}

impl PipelineCaches {
    pub fn new(config: &CacheConfig) -> Self {
        PipelineCaches {
            analysis: ResultCache::new(
                "analysis",
                config.analysis_capacity,
                Duration::from_secs(config.analysis_ttl_secs),
            ),
            render: ResultCache::new("render", config.render_capacity, Duration::from_secs(config.render_ttl_secs)),
        }
    }

    pub fn clear_all(&self) {
        self.analysis.clear();
        self.render.clear();
    }

    pub fn report(&self) -> CacheReport {
        let analysis = self.analysis.stats();
        let render = self.render.stats();
        let hits = analysis.hits + render.hits;
        let total = hits + analysis.misses + render.misses;
        CacheReport {
            analysis,
            render,
            hit_rate: if total == 0 { 0.0 } else { hits as f64 / total as f64 },
        }
    }
}
