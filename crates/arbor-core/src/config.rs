//! Pipeline configuration loaded from `.arbor.toml`

use std::path::Path;
use std::time::Duration;

use kurbo::Rect;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ArborError, ArborResult};

/// Config file name, looked up at the repository root.
pub const CONFIG_FILE: &str = ".arbor.toml";

pub const ENV_ENRICHMENT_ENDPOINT: &str = "ARBOR_ENRICHMENT_ENDPOINT";
pub const ENV_ENRICHMENT_MODEL: &str = "ARBOR_ENRICHMENT_MODEL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ArborConfig {
    pub ingest: IngestConfig,
    pub scheduler: SchedulerConfig,
    pub throttle: ThrottleConfig,
    pub cache: CacheConfig,
    pub spatial: SpatialConfig,
    pub enrichment: EnrichmentConfig,
}

/// Gateway timing and ingress channel settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub debounce_ms: u64,
    pub batch_ms: u64,
    pub max_batch_size: usize,
    pub reconnect_ms: u64,
    pub reconnect_max_ms: u64,
    pub heartbeat_ms: u64,
    pub ignore: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        IngestConfig {
            debounce_ms: 300,
            batch_ms: 100,
            max_batch_size: 50,
            reconnect_ms: 3000,
            reconnect_max_ms: 60_000,
            heartbeat_ms: 30_000,
            ignore: vec![
                "**/node_modules/**".to_string(),
                "**/.git/**".to_string(),
                "**/target/**".to_string(),
                "*.log".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub analyzer_timeout_ms: u64,
    pub cycle_pause_ms: u64,
    /// Abort a timed-out analyzer instead of letting it run to completion detached.
    pub cancel_on_timeout: bool,
    pub significance_threshold: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            max_concurrent: 3,
            analyzer_timeout_ms: 5000,
            cycle_pause_ms: 100,
            cancel_on_timeout: true,
            significance_threshold: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub target_fps: f64,
    pub min_fps: f64,
    pub step: f64,
    pub window: usize,
    pub tick_ms: u64,
    /// Sample CPU/memory every N ticks.
    pub resource_check_every: u32,
    pub adaptive: bool,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        ThrottleConfig {
            target_fps: 30.0,
            min_fps: 15.0,
            step: 0.2,
            window: 60,
            tick_ms: 1000,
            resource_check_every: 10,
            adaptive: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub analysis_capacity: usize,
    pub analysis_ttl_secs: u64,
    pub render_capacity: usize,
    pub render_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            analysis_capacity: 1000,
            analysis_ttl_secs: 60,
            render_capacity: 500,
            render_ttl_secs: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpatialConfig {
    pub padding: f64,
    /// `[x0, y0, x1, y1]` of the layout world.
    pub world: [f64; 4],
    pub bucket_capacity: usize,
    pub max_depth: usize,
}

impl Default for SpatialConfig {
    fn default() -> Self {
        SpatialConfig {
            padding: 100.0,
            world: [0.0, 0.0, 2000.0, 2000.0],
            bucket_capacity: 8,
            max_depth: 16,
        }
    }
}

impl SpatialConfig {
    pub fn world_rect(&self) -> Rect {
        let [x0, y0, x1, y1] = self.world;
        Rect::new(x0, y0, x1, y1).abs()
    }
}

/// Which enrichment backend runs after each analysis cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnrichmentKind {
    #[default]
    None,
    Local,
    Ollama,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub backend: EnrichmentKind,
    pub endpoint: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        EnrichmentConfig {
            backend: EnrichmentKind::None,
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "codellama".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl ArborConfig {
    /// Load `.arbor.toml` from `root` (defaults if absent), then apply `.env`/environment overrides.
    pub fn load(root: &Path) -> ArborResult<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| ArborError::Config(format!("{}: {}", path.display(), e)))?;
            let config = Self::from_toml(&content)?;
            info!("Loaded config from {}", path.display());
            config
        } else {
            debug!("No {} found, using defaults", CONFIG_FILE);
            ArborConfig::default()
        };

        if dotenvy::from_path(root.join(".env")).is_ok() {
            debug!("Loaded .env from {}", root.display());
        }
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> ArborResult<Self> {
        toml::from_str(content).map_err(|e| ArborError::Config(e.to_string()))
    }

    /// Apply overrides from a variable lookup.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(endpoint) = lookup(ENV_ENRICHMENT_ENDPOINT).filter(|v| !v.is_empty()) {
            self.enrichment.endpoint = endpoint;
        }
        if let Some(model) = lookup(ENV_ENRICHMENT_MODEL).filter(|v| !v.is_empty()) {
            self.enrichment.model = model;
        }
    }

    pub fn validate(&self) -> ArborResult<()> {
        if self.ingest.max_batch_size == 0 {
            return Err(ArborError::Config("ingest.max_batch_size must be at least 1".to_string()));
        }
        if self.scheduler.max_concurrent == 0 {
            return Err(ArborError::Config("scheduler.max_concurrent must be at least 1".to_string()));
        }
        if self.throttle.min_fps > self.throttle.target_fps {
            return Err(ArborError::Config("throttle.min_fps exceeds throttle.target_fps".to_string()));
        }
        if self.throttle.window == 0 {
            return Err(ArborError::Config("throttle.window must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn analyzer_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler.analyzer_timeout_ms)
    }
}
