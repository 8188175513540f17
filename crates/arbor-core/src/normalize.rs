//! Normalization of raw change notifications into strict graph records
//!
//! Ingress messages arrive loosely shaped (optional timestamps, optional file
//! content, event names as strings). Everything downstream of this module only
//! sees [`ChangeEvent`]s carrying fully built [`NodeRecord`]/[`LinkRecord`]s.

use std::collections::BTreeMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use kurbo::Rect;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ArborError, ArborResult};
use crate::model::*;

/// A change notification as delivered by an external file watcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    /// `add`, `change` or `unlink`.
    pub event: String,
    pub path: String,
    /// Milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub content: Option<String>,
}

impl RawChange {
    pub fn new(event: &str, path: impl Into<String>, content: Option<String>) -> Self {
        RawChange {
            event: event.to_string(),
            path: path.into(),
            timestamp: None,
            content,
        }
    }
}

static JS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)(?:import\s[^'"]*?from\s*|import\s*|require\s*\(\s*)['"]([^'"]+)['"]"#)
        .expect("valid js import pattern")
});
static PY_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?m)^\s*(?:from\s+([\w.]+)\s+import|import\s+([\w.]+))").expect("valid python import pattern")
});
static RUST_USE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:pub\s+)?use\s+([\w]+)").expect("valid rust use pattern"));
static CS_USING: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*using\s+([\w.]+)\s*;").expect("valid c# using pattern"));
static PS_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?mi)^\s*Import-Module\s+([^\s;]+)").expect("valid powershell pattern"));
static SENSITIVE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)secret|credential|password|token").expect("valid sensitivity pattern"));

/// Turn a raw notification into a [`ChangeEvent`] with a normalized payload.
pub fn normalize(raw: RawChange, world: Rect) -> ArborResult<ChangeEvent> {
    let path = raw.path.trim().replace('\\', "/");
    if path.is_empty() {
        return Err(ArborError::Ingestion("change event without a path".to_string()));
    }

    let kind = match raw.event.as_str() {
        "add" => ChangeKind::Added,
        "change" => ChangeKind::Modified,
        "unlink" => ChangeKind::Removed,
        other => {
            return Err(ArborError::Ingestion(format!("unknown event '{}' for {}", other, path)));
        }
    };

    let observed_at = match raw.timestamp {
        Some(ms) => DateTime::<Utc>::from_timestamp_millis(ms)
            .ok_or_else(|| ArborError::Ingestion(format!("timestamp {} out of range", ms)))?,
        None => Utc::now(),
    };

    let payload = match kind {
        ChangeKind::Removed => None,
        ChangeKind::Added | ChangeKind::Modified => {
            let content = raw.content.as_deref();
            let node = node_for_path(&path, content, world);
            let links = links_for(&node.id, content);
            Some(ChangePayload { node, links })
        }
    };

    Ok(ChangeEvent {
        path,
        kind,
        observed_at,
        payload,
    })
}

/// Build the node record describing a file.
pub fn node_for_path(path: &str, content: Option<&str>, world: Rect) -> NodeRecord {
    let mut attributes = BTreeMap::new();
    attributes.insert("module".to_string(), AttrValue::from(module_for(path).as_str()));
    if let Some(content) = content {
        attributes.insert("lines".to_string(), AttrValue::Int(content.lines().count() as i64));
    }

    NodeRecord {
        id: NodeId::new(path),
        kind: NodeKind::from_path(path),
        label: label_for(path),
        attributes,
        position: place(path, world),
        render_size: 5.0,
    }
}

/// Outgoing links for every dependency found in the file content.
pub fn links_for(source: &NodeId, content: Option<&str>) -> Vec<LinkRecord> {
    let Some(content) = content else {
        return Vec::new();
    };

    let mut links: Vec<LinkRecord> = Vec::new();
    for dependency in extract_dependencies(source.as_str(), content) {
        let (target, kind) = resolve_dependency(source.as_str(), &dependency);
        if target == source.0 {
            continue;
        }
        let mut link = LinkRecord::new(source.0.clone(), target, kind, 1.0);
        link.sensitive = SENSITIVE.is_match(&dependency);
        if !links.iter().any(|l| l.id == link.id) {
            links.push(link);
        }
    }
    links
}

/// Raw dependency specifiers in order of appearance.
pub fn extract_dependencies(path: &str, content: &str) -> Vec<String> {
    let pattern: &Regex = match NodeKind::from_path(path) {
        NodeKind::JavaScript | NodeKind::TypeScript => &JS_IMPORT,
        NodeKind::Python => &PY_IMPORT,
        NodeKind::Rust => &RUST_USE,
        NodeKind::CSharp => &CS_USING,
        NodeKind::PowerShell => &PS_IMPORT,
        _ => return Vec::new(),
    };

    let mut deps = Vec::new();
    for caps in pattern.captures_iter(content) {
        let dep = caps.iter().skip(1).flatten().next().map(|m| m.as_str().to_string());
        if let Some(dep) = dep {
            if !deps.contains(&dep) {
                deps.push(dep);
            }
        }
    }
    deps
}

/// Relative specifiers resolve to sibling paths; everything else is an external module.
fn resolve_dependency(source: &str, dependency: &str) -> (String, LinkKind) {
    if !(dependency.starts_with("./") || dependency.starts_with("../")) {
        return (dependency.to_string(), LinkKind::External);
    }

    let mut parts: Vec<&str> = source.split('/').collect();
    parts.pop();
    for segment in dependency.split('/') {
        match segment {
            "." | "" => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }

    let mut resolved = parts.join("/");
    let last = resolved.rsplit('/').next().unwrap_or_default();
    if !last.contains('.') {
        if let Some((_, ext)) = source.rsplit_once('.') {
            resolved.push('.');
            resolved.push_str(ext);
        }
    }
    (resolved, LinkKind::Import)
}

/// File stem without directories or extensions.
pub fn label_for(path: &str) -> String {
    let file = path.rsplit(['/', '\\']).next().unwrap_or(path);
    file.split('.').next().unwrap_or(file).to_string()
}

/// The path segment following a `modules`, `src` or `lib` directory.
pub fn module_for(path: &str) -> String {
    let parts: Vec<&str> = path.split(['/', '\\']).collect();
    for i in (0..parts.len()).rev() {
        if matches!(parts[i], "modules" | "src" | "lib") {
            return parts.get(i + 1).map(|s| s.to_string()).unwrap_or_else(|| "default".to_string());
        }
    }
    "default".to_string()
}

/// Deterministic initial placement inside the world bounds.
pub fn place(id: &str, world: Rect) -> Position {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    let h = hasher.finish();
    let fx = (h & 0xffff) as f64 / 65535.0;
    let fy = ((h >> 16) & 0xffff) as f64 / 65535.0;
    Position::new(
        world.x0 + fx * world.width(),
        world.y0 + fy * world.height(),
    )
}
