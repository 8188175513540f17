//! Enrichment backend implementations

pub mod local;
pub mod noop;
pub mod ollama;

use std::time::Duration;

use anyhow::Result;
use arbor_core::EnrichmentKind;
use arbor_core::config::EnrichmentConfig;

use super::bridge::EnrichmentBackend;

/// Factory function to create enrichment backends
pub fn create_backend(name: &str, config: &EnrichmentConfig) -> Result<Box<dyn EnrichmentBackend>> {
    match name {
        "none" => Ok(Box::new(noop::NoopBackend)),
        "local" => Ok(Box::new(local::LocalBackend::new())),
        "ollama" => Ok(Box::new(ollama::OllamaBackend::new(
            config.endpoint.clone(),
            config.model.clone(),
            Duration::from_millis(config.timeout_ms),
        )?)),
        _ => anyhow::bail!("Unknown enrichment backend: {}", name),
    }
}

/// Backend selected by the `[enrichment]` config section.
pub fn from_config(config: &EnrichmentConfig) -> Result<Box<dyn EnrichmentBackend>> {
    let name = match config.backend {
        EnrichmentKind::None => "none",
        EnrichmentKind::Local => "local",
        EnrichmentKind::Ollama => "ollama",
    };
    create_backend(name, config)
}
