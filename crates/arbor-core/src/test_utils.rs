//! Test utilities for arbor-core

use kurbo::Rect;

use crate::model::*;
use crate::normalize::{RawChange, normalize};
use crate::snapshot::GraphSnapshot;

pub fn world() -> Rect {
    Rect::new(0.0, 0.0, 1000.0, 1000.0)
}

pub fn node(id: &str) -> NodeRecord {
    NodeRecord::new(id, NodeKind::Module)
}

pub fn link(source: &str, target: &str, weight: f64) -> LinkRecord {
    LinkRecord::new(source, target, LinkKind::Import, weight)
}

/// Snapshot with the given nodes and weighted links.
pub fn snapshot_of(nodes: &[&str], links: &[(&str, &str, f64)]) -> GraphSnapshot {
    GraphSnapshot::from_records(
        nodes.iter().map(|id| node(id)),
        links.iter().map(|(s, t, w)| link(s, t, *w)),
    )
}

fn change(event: &str, path: &str, content: Option<&str>) -> ChangeEvent {
    normalize(RawChange::new(event, path, content.map(str::to_string)), world()).unwrap()
}

pub fn added(path: &str, content: &str) -> ChangeEvent {
    change("add", path, Some(content))
}

pub fn modified(path: &str, content: &str) -> ChangeEvent {
    change("change", path, Some(content))
}

pub fn removed(path: &str) -> ChangeEvent {
    change("unlink", path, None)
}
