//! Core data structures for the dependency graph pipeline

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique, stable identifier for a node. For file-backed nodes this is the path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        NodeId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

/// Link identifier, derived from its endpoints: `source->target`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct LinkId(pub String);

impl LinkId {
    pub fn between(source: &NodeId, target: &NodeId) -> Self {
        LinkId(format!("{}->{}", source.0, target.0))
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What kind of entity a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    // ── Source files ────────────────────────────────────────
    JavaScript,
    TypeScript,
    Python,
    Rust,
    CSharp,
    PowerShell,

    // ── Non-code files ──────────────────────────────────────
    Data,
    Documentation,

    // ── Code entities ───────────────────────────────────────
    Module,
    Function,
    Variable,
    Input,
    Auth,

    // ── Fallback ────────────────────────────────────────────
    Unknown,
}

impl NodeKind {
    /// Detect node kind from a file path's extension.
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext).unwrap_or_default();
        match ext {
            "js" | "jsx" | "mjs" | "cjs" => NodeKind::JavaScript,
            "ts" | "tsx" => NodeKind::TypeScript,
            "py" | "pyi" => NodeKind::Python,
            "rs" => NodeKind::Rust,
            "cs" => NodeKind::CSharp,
            "ps1" | "psm1" => NodeKind::PowerShell,
            "json" | "xml" | "yaml" | "yml" | "toml" => NodeKind::Data,
            "md" | "mdx" | "rst" => NodeKind::Documentation,
            _ => NodeKind::Unknown,
        }
    }
}

/// What kind of relationship a link represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Import,
    Call,
    DataFlow,
    External,
    Reference,
}

/// A scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttrValue::Int(v) => Some(*v as f64),
            AttrValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::Float(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// A 2D layout position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Position { x, y }
    }
}

/// A single node in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NodeId,
    pub kind: NodeKind,
    pub label: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    #[serde(default)]
    pub position: Position,
    #[serde(default = "default_render_size")]
    pub render_size: f64,
}

fn default_render_size() -> f64 {
    5.0
}

impl NodeRecord {
    pub fn new(id: impl Into<String>, kind: NodeKind) -> Self {
        let id = id.into();
        NodeRecord {
            label: id.clone(),
            id: NodeId(id),
            kind,
            attributes: BTreeMap::new(),
            position: Position::default(),
            render_size: default_render_size(),
        }
    }

    pub fn attr(&self, key: &str) -> Option<&AttrValue> {
        self.attributes.get(key)
    }
}

/// A directed link in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRecord {
    pub id: LinkId,
    pub source: NodeId,
    pub target: NodeId,
    pub kind: LinkKind,
    /// Relationship strength. Query algorithms use `1 / weight` as the distance.
    pub weight: f64,
    #[serde(default)]
    pub sensitive: bool,
}

impl LinkRecord {
    pub fn new(source: impl Into<String>, target: impl Into<String>, kind: LinkKind, weight: f64) -> Self {
        let source = NodeId(source.into());
        let target = NodeId(target.into());
        LinkRecord {
            id: LinkId::between(&source, &target),
            source,
            target,
            kind,
            weight,
            sensitive: false,
        }
    }

    pub fn touches(&self, node: &NodeId) -> bool {
        &self.source == node || &self.target == node
    }
}

/// Filesystem change classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// Node and outgoing links carried by an add/modify change, already normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangePayload {
    pub node: NodeRecord,
    pub links: Vec<LinkRecord>,
}

/// A normalized change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub path: String,
    pub kind: ChangeKind,
    pub observed_at: DateTime<Utc>,
    pub payload: Option<ChangePayload>,
}

impl ChangeEvent {
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        ChangeEvent {
            path: path.into(),
            kind,
            observed_at: Utc::now(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: ChangePayload) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// An ordered batch of changes flushed by the gateway as one unit.
pub type ChangeBatch = Vec<ChangeEvent>;
