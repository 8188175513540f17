//! Analyzer plugin interface, registry and the built-in analyzers

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use arbor_core::{Diff, LinkKind, NodeKind, NodeRecord};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

/// A pluggable analysis over one committed diff.
///
/// Implementations may fail or hang; the scheduler isolates each call with
/// its own task and deadline.
#[async_trait::async_trait]
pub trait Analyzer: Send + Sync {
    fn name(&self) -> &str;

    /// Higher runs first in listings.
    fn priority(&self) -> u8 {
        5
    }

    async fn analyze(&self, diff: &Diff) -> Result<Value>;
}

struct Entry {
    analyzer: Arc<dyn Analyzer>,
    enabled: AtomicBool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AnalyzerInfo {
    pub name: String,
    pub priority: u8,
    pub enabled: bool,
}

/// Named analyzers with an enabled flag each.
#[derive(Default)]
pub struct AnalyzerRegistry {
    entries: DashMap<String, Entry>,
}

impl std::fmt::Debug for AnalyzerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnalyzerRegistry").field("analyzers", &self.entries.len()).finish()
    }
}

impl AnalyzerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the five built-in analyzers, all enabled.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(StructureAnalyzer));
        registry.register(Arc::new(SemanticAnalyzer));
        registry.register(Arc::new(DependencyAnalyzer));
        registry.register(Arc::new(SecurityAnalyzer));
        registry.register(Arc::new(PerformanceAnalyzer));
        registry
    }

    /// Add or replace an analyzer. New analyzers start enabled.
    pub fn register(&self, analyzer: Arc<dyn Analyzer>) {
        let name = analyzer.name().to_string();
        self.entries.insert(
            name,
            Entry {
                analyzer,
                enabled: AtomicBool::new(true),
            },
        );
    }

    fn set_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.entries.get(name) {
            Some(entry) => {
                entry.enabled.store(enabled, Ordering::Relaxed);
                info!("Analyzer {} {}", name, if enabled { "enabled" } else { "disabled" });
                true
            }
            None => false,
        }
    }

    /// Returns false for unknown names.
    pub fn enable(&self, name: &str) -> bool {
        self.set_enabled(name, true)
    }

    /// Returns false for unknown names.
    pub fn disable(&self, name: &str) -> bool {
        self.set_enabled(name, false)
    }

    /// Enabled analyzers, highest priority first, then by name.
    pub fn enabled(&self) -> Vec<Arc<dyn Analyzer>> {
        let mut enabled: Vec<Arc<dyn Analyzer>> = self
            .entries
            .iter()
            .filter(|e| e.enabled.load(Ordering::Relaxed))
            .map(|e| e.analyzer.clone())
            .collect();
        enabled.sort_by(|a, b| b.priority().cmp(&a.priority()).then_with(|| a.name().cmp(b.name())));
        enabled
    }

    pub fn list(&self) -> Vec<AnalyzerInfo> {
        let mut list: Vec<AnalyzerInfo> = self
            .entries
            .iter()
            .map(|e| AnalyzerInfo {
                name: e.key().clone(),
                priority: e.analyzer.priority(),
                enabled: e.enabled.load(Ordering::Relaxed),
            })
            .collect();
        list.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        list
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Nodes carried by a diff: added plus modified.
fn touched_nodes(diff: &Diff) -> impl Iterator<Item = &NodeRecord> {
    diff.added_nodes.iter().chain(&diff.modified_nodes)
}

fn numeric_attr(node: &NodeRecord, key: &str) -> f64 {
    node.attr(key).and_then(|v| v.as_f64()).unwrap_or(0.0)
}

/// Call-graph and data-flow change counts.
pub struct StructureAnalyzer;

#[async_trait::async_trait]
impl Analyzer for StructureAnalyzer {
    fn name(&self) -> &str {
        "structure"
    }

    fn priority(&self) -> u8 {
        10
    }

    async fn analyze(&self, diff: &Diff) -> Result<Value> {
        let count_nodes = |kind: NodeKind| diff.added_nodes.iter().filter(|n| n.kind == kind).count();
        let count_links = |kind: LinkKind| diff.added_links.iter().filter(|l| l.kind == kind).count();

        Ok(json!({
            "callGraphChanges": {
                "newFunctions": count_nodes(NodeKind::Function),
                "modifiedCalls": count_links(LinkKind::Call),
                "removedLinks": diff.removed_link_ids.len(),
            },
            "dataFlowChanges": {
                "newVariables": count_nodes(NodeKind::Variable),
                "modifiedFlows": count_links(LinkKind::DataFlow),
            },
        }))
    }
}

/// Module categories of the touched nodes.
pub struct SemanticAnalyzer;

#[async_trait::async_trait]
impl Analyzer for SemanticAnalyzer {
    fn name(&self) -> &str {
        "semantic"
    }

    fn priority(&self) -> u8 {
        8
    }

    async fn analyze(&self, diff: &Diff) -> Result<Value> {
        let mut modules: BTreeMap<String, usize> = BTreeMap::new();
        for node in touched_nodes(diff) {
            let module = node.attr("module").and_then(|v| v.as_str()).unwrap_or("default");
            *modules.entry(module.to_string()).or_default() += 1;
        }
        let category = |name: &str| modules.get(name).copied().unwrap_or(0);

        Ok(json!({
            "semanticCategories": {
                "businessLogic": category("business"),
                "dataAccess": category("data"),
                "utilities": category("utils"),
            },
            "moduleCount": modules.len(),
            "modules": modules,
        }))
    }
}

/// Link churn, cycles closed by the added links, external dependencies.
pub struct DependencyAnalyzer;

#[async_trait::async_trait]
impl Analyzer for DependencyAnalyzer {
    fn name(&self) -> &str {
        "dependency"
    }

    fn priority(&self) -> u8 {
        7
    }

    async fn analyze(&self, diff: &Diff) -> Result<Value> {
        let pairs: HashSet<(&str, &str)> = diff
            .added_links
            .iter()
            .map(|l| (l.source.as_str(), l.target.as_str()))
            .collect();
        let circular = pairs
            .iter()
            .filter(|(s, t)| s < t && pairs.contains(&(*t, *s)))
            .count();
        let external = diff.added_links.iter().filter(|l| l.kind == LinkKind::External).count();

        let touched = diff.touched_nodes().max(1) as f64;
        let coupling = diff.added_links.len() as f64 / touched;

        Ok(json!({
            "dependencyChanges": {
                "added": diff.added_links.len(),
                "removed": diff.removed_link_ids.len(),
                "circular": circular,
                "external": external,
            },
            "dependencyMetrics": {
                "coupling": coupling,
            },
        }))
    }
}

/// Unvalidated inputs, sensitive links and authentication points.
pub struct SecurityAnalyzer;

#[async_trait::async_trait]
impl Analyzer for SecurityAnalyzer {
    fn name(&self) -> &str {
        "security"
    }

    fn priority(&self) -> u8 {
        9
    }

    async fn analyze(&self, diff: &Diff) -> Result<Value> {
        let vulnerabilities: Vec<Value> = touched_nodes(diff)
            .filter(|n| n.kind == NodeKind::Input)
            .filter(|n| !n.attr("validated").and_then(|v| v.as_bool()).unwrap_or(false))
            .map(|n| json!({"type": "unvalidated-input", "severity": "medium", "node": n.id}))
            .collect();
        let score = (1.0 - vulnerabilities.len() as f64 * 0.1).max(0.0);

        Ok(json!({
            "vulnerabilityCount": vulnerabilities.len(),
            "vulnerabilities": vulnerabilities,
            "securityScore": score,
            "sensitiveDataExposure": diff.added_links.iter().filter(|l| l.sensitive).count(),
            "authenticationPoints": touched_nodes(diff).filter(|n| n.kind == NodeKind::Auth).count(),
        }))
    }
}

/// Complexity totals, hotspots and fan-in bottlenecks.
pub struct PerformanceAnalyzer;

/// Complexity above which a node counts as a hotspot.
const HOTSPOT_COMPLEXITY: f64 = 10.0;
/// Incoming added links above which a target counts as a bottleneck.
const BOTTLENECK_FAN_IN: usize = 5;

#[async_trait::async_trait]
impl Analyzer for PerformanceAnalyzer {
    fn name(&self) -> &str {
        "performance"
    }

    fn priority(&self) -> u8 {
        6
    }

    async fn analyze(&self, diff: &Diff) -> Result<Value> {
        let complexity: f64 = touched_nodes(diff).map(|n| numeric_attr(n, "complexity")).sum();
        let hotspots = touched_nodes(diff)
            .filter(|n| numeric_attr(n, "complexity") > HOTSPOT_COMPLEXITY)
            .count();

        let mut fan_in: BTreeMap<&str, usize> = BTreeMap::new();
        for link in &diff.added_links {
            *fan_in.entry(link.target.as_str()).or_default() += 1;
        }
        let bottlenecks = fan_in.values().filter(|&&n| n > BOTTLENECK_FAN_IN).count();

        Ok(json!({
            "performanceMetrics": {
                "complexity": complexity,
                "hotspots": hotspots,
                "bottlenecks": bottlenecks,
            },
        }))
    }
}
