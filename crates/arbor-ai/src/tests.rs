//! Unit tests for arbor-ai

use std::collections::BTreeMap;

use arbor_core::EnrichmentKind;
use arbor_core::config::EnrichmentConfig;
use serde_json::json;

use crate::providers::{create_backend, from_config};
use crate::{AnalysisSummary, EnrichmentBackend};

fn summary(outcomes: serde_json::Value) -> AnalysisSummary {
    let outcomes: BTreeMap<String, serde_json::Value> = serde_json::from_value(outcomes).unwrap();
    AnalysisSummary {
        task_id: 1,
        operation: "added".to_string(),
        outcomes,
    }
}

#[test]
fn test_backend_creation() {
    let config = EnrichmentConfig::default();
    assert!(create_backend("none", &config).is_ok());
    assert!(create_backend("local", &config).is_ok());
    assert!(create_backend("ollama", &config).is_ok());
    assert!(create_backend("unknown", &config).is_err());
}

#[test]
fn test_from_config_selects_backend() {
    let mut config = EnrichmentConfig::default();
    let backend = from_config(&config).unwrap();
    assert_eq!(backend.name(), "none");
    assert!(!backend.is_enabled());

    config.backend = EnrichmentKind::Local;
    let backend = from_config(&config).unwrap();
    assert_eq!(backend.name(), "local");
    assert!(backend.is_enabled());
}

#[tokio::test]
async fn test_local_backend_insights() {
    let backend = create_backend("local", &EnrichmentConfig::default()).unwrap();
    let enrichment = backend
        .enrich(&[summary(json!({
            "dependency": {"dependencyChanges": {"added": 3, "removed": 1, "circular": 0, "external": 1}},
            "performance": {"performanceMetrics": {"complexity": 4, "hotspots": 0, "bottlenecks": 0}}
        }))])
        .await
        .unwrap();

    assert_eq!(enrichment.backend, "local");
    assert_eq!(enrichment.insights.len(), 2);
    assert!(enrichment.insights[0].contains("coupling"));
    assert_eq!(enrichment.recommendations.len(), 2);
}

#[tokio::test]
async fn test_local_backend_quiet_on_neutral_metrics() {
    let backend = create_backend("local", &EnrichmentConfig::default()).unwrap();
    let enrichment = backend
        .enrich(&[summary(json!({"dependency": {"dependencyChanges": {"added": 0, "removed": 2}}}))])
        .await
        .unwrap();
    assert!(enrichment.is_empty());
}

#[tokio::test]
async fn test_ollama_unreachable_is_error() {
    let config = EnrichmentConfig {
        backend: EnrichmentKind::Ollama,
        endpoint: "http://127.0.0.1:9/api/generate".to_string(),
        timeout_ms: 500,
        ..EnrichmentConfig::default()
    };
    let backend = from_config(&config).unwrap();
    assert!(backend.enrich(&[summary(json!({}))]).await.is_err());
}
