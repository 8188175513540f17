//! Immutable graph snapshots

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::diff::Diff;
use crate::error::{ArborError, ArborResult};
use crate::model::*;

/// One committed state of the graph. Never mutated once published; the diff
/// engine builds a fresh candidate and swaps the shared reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GraphSnapshot {
    pub version: u64,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    pub links: BTreeMap<LinkId, LinkRecord>,
}

impl GraphSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an unversioned snapshot from records, mainly for tests and seeding.
    pub fn from_records(
        nodes: impl IntoIterator<Item = NodeRecord>,
        links: impl IntoIterator<Item = LinkRecord>,
    ) -> Self {
        GraphSnapshot {
            version: 0,
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
            links: links.into_iter().map(|l| (l.id.clone(), l)).collect(),
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeRecord> {
        self.nodes.get(id)
    }

    pub fn link(&self, id: &LinkId) -> Option<&LinkRecord> {
        self.links.get(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn all_nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.nodes.values()
    }

    pub fn all_links(&self) -> impl Iterator<Item = &LinkRecord> {
        self.links.values()
    }

    /// Outgoing links of a node.
    pub fn links_from<'a>(&'a self, source: &'a NodeId) -> impl Iterator<Item = &'a LinkRecord> + 'a {
        self.links.values().filter(move |l| &l.source == source)
    }

    /// Incoming links of a node.
    pub fn links_to<'a>(&'a self, target: &'a NodeId) -> impl Iterator<Item = &'a LinkRecord> + 'a {
        self.links.values().filter(move |l| &l.target == target)
    }

    /// Links whose endpoints are both present in the snapshot.
    pub fn resolved_links(&self) -> impl Iterator<Item = &LinkRecord> {
        self.links
            .values()
            .filter(|l| self.nodes.contains_key(&l.source) && self.nodes.contains_key(&l.target))
    }

    /// Same graph content, ignoring the version counter.
    pub fn same_content(&self, other: &GraphSnapshot) -> bool {
        self.nodes == other.nodes && self.links == other.links
    }

    /// Reproduce the snapshot a diff was computed towards.
    pub fn apply(&self, diff: &Diff) -> ArborResult<GraphSnapshot> {
        if diff.base_version != self.version {
            return Err(ArborError::InvariantViolation(format!(
                "diff base version {} does not match snapshot version {}",
                diff.base_version, self.version
            )));
        }

        let mut next = self.clone();
        for id in &diff.removed_link_ids {
            next.links.remove(id);
        }
        for id in &diff.removed_node_ids {
            next.nodes.remove(id);
        }
        for node in diff.added_nodes.iter().chain(&diff.modified_nodes) {
            next.nodes.insert(node.id.clone(), node.clone());
        }
        for link in diff.added_links.iter().chain(&diff.modified_links) {
            next.links.insert(link.id.clone(), link.clone());
        }
        next.version = diff.result_version;
        Ok(next)
    }

    /// Every link must originate from a node present in the snapshot.
    pub(crate) fn check_integrity(&self) -> ArborResult<()> {
        if let Some(orphan) = self.links.values().find(|l| !self.nodes.contains_key(&l.source)) {
            return Err(ArborError::InvariantViolation(format!(
                "link {} has no source node",
                orphan.id
            )));
        }
        Ok(())
    }
}
