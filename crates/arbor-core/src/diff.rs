//! Graph diff computation and snapshot commits

use std::collections::BTreeMap;
use std::sync::Arc;

use kurbo::Rect;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ArborError, ArborResult};
use crate::model::*;
use crate::normalize;
use crate::snapshot::GraphSnapshot;

/// Structural difference between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Diff {
    pub base_version: u64,
    pub result_version: u64,
    #[serde(default)]
    pub added_nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub modified_nodes: Vec<NodeRecord>,
    #[serde(default)]
    pub removed_node_ids: Vec<NodeId>,
    #[serde(default)]
    pub added_links: Vec<LinkRecord>,
    #[serde(default)]
    pub modified_links: Vec<LinkRecord>,
    #[serde(default)]
    pub removed_link_ids: Vec<LinkId>,
}

impl Diff {
    /// Compare two snapshot states. `result_version` is always `old.version + 1`.
    pub fn compute(old: &GraphSnapshot, new: &GraphSnapshot) -> ArborResult<Diff> {
        let result_version = old.version.checked_add(1).ok_or_else(|| {
            ArborError::InvariantViolation(format!("snapshot version {} cannot advance", old.version))
        })?;

        let mut diff = Diff {
            base_version: old.version,
            result_version,
            ..Diff::default()
        };

        for (id, node) in &new.nodes {
            match old.nodes.get(id) {
                None => diff.added_nodes.push(node.clone()),
                Some(prev) if prev != node => {
                    diff.modified_nodes.push(node.clone())
                }
                Some(_) => {}
            }
        }
        diff.removed_node_ids = old
            .nodes
            .keys()
            .filter(|id| !new.nodes.contains_key(*id))
            .cloned()
            .collect();

        for (id, link) in &new.links {
            match old.links.get(id) {
                None => diff.added_links.push(link.clone()),
                Some(prev) if prev != link => {
                    diff.modified_links.push(link.clone())
                }
                Some(_) => {}
            }
        }
        diff.removed_link_ids = old
            .links
            .keys()
            .filter(|id| !new.links.contains_key(*id))
            .cloned()
            .collect();

        Ok(diff)
    }

    /// Check if this diff is empty (no changes).
    pub fn is_empty(&self) -> bool {
        self.added_nodes.is_empty()
            && self.modified_nodes.is_empty()
            && self.removed_node_ids.is_empty()
            && self.added_links.is_empty()
            && self.modified_links.is_empty()
            && self.removed_link_ids.is_empty()
    }

    /// Number of nodes this diff touches.
    pub fn touched_nodes(&self) -> usize {
        self.added_nodes.len() + self.modified_nodes.len() + self.removed_node_ids.len()
    }

    /// The most severe kind of change present: removals, then modifications, then additions.
    pub fn dominant_change(&self) -> Option<ChangeKind> {
        if !self.removed_node_ids.is_empty() || !self.removed_link_ids.is_empty() {
            Some(ChangeKind::Removed)
        } else if !self.modified_nodes.is_empty() || !self.modified_links.is_empty() {
            Some(ChangeKind::Modified)
        } else if !self.added_nodes.is_empty() || !self.added_links.is_empty() {
            Some(ChangeKind::Added)
        } else {
            None
        }
    }
}

/// Receiving side of the committed snapshot. Cheap to clone; reads never block the writer.
pub type SnapshotReader = watch::Receiver<Arc<GraphSnapshot>>;

/// Sole owner and writer of the committed snapshot.
pub struct DiffEngine {
    committed: watch::Sender<Arc<GraphSnapshot>>,
    world: Rect,
}

impl std::fmt::Debug for DiffEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let snapshot = self.committed.borrow();
        f.debug_struct("DiffEngine")
            .field("version", &snapshot.version)
            .field("node_count", &snapshot.node_count())
            .field("link_count", &snapshot.link_count())
            .finish()
    }
}

impl DiffEngine {
    pub fn new(world: Rect) -> Self {
        Self::with_snapshot(GraphSnapshot::new(), world)
    }

    pub fn with_snapshot(initial: GraphSnapshot, world: Rect) -> Self {
        let (committed, _) = watch::channel(Arc::new(initial));
        DiffEngine { committed, world }
    }

    /// Subscribe to snapshot commits.
    pub fn subscribe(&self) -> SnapshotReader {
        self.committed.subscribe()
    }

    /// The currently committed snapshot.
    pub fn committed(&self) -> Arc<GraphSnapshot> {
        self.committed.borrow().clone()
    }

    /// Get current snapshot version.
    pub fn version(&self) -> u64 {
        self.committed.borrow().version
    }

    /// Apply a batch of changes to the committed snapshot and publish the result.
    ///
    /// The candidate is built off to the side; on any error the committed
    /// snapshot is left untouched.
    pub fn compute_and_commit(&mut self, batch: &[ChangeEvent]) -> ArborResult<Diff> {
        let current = self.committed();
        let mut candidate = (*current).clone();

        for change in batch {
            self.apply_change(&mut candidate, change)?;
        }

        self.commit(&current, candidate)
    }

    /// Commit a position-only update, e.g. once a layout simulation settles.
    pub fn apply_layout(&mut self, positions: &BTreeMap<NodeId, Position>) -> ArborResult<Diff> {
        let current = self.committed();
        let mut candidate = (*current).clone();

        for (id, position) in positions {
            match candidate.nodes.get_mut(id) {
                Some(node) => node.position = *position,
                None => debug!("Ignoring layout position for unknown node {}", id),
            }
        }

        self.commit(&current, candidate)
    }

    fn commit(&mut self, current: &GraphSnapshot, mut candidate: GraphSnapshot) -> ArborResult<Diff> {
        let diff = Diff::compute(current, &candidate)?;
        if diff.result_version != diff.base_version + 1 {
            return Err(ArborError::InvariantViolation(format!(
                "diff versions {} -> {} are not consecutive",
                diff.base_version, diff.result_version
            )));
        }
        candidate.version = diff.result_version;
        candidate.check_integrity()?;

        info!(
            "Committed snapshot v{}: +{} ~{} -{} nodes, +{} ~{} -{} links",
            candidate.version,
            diff.added_nodes.len(),
            diff.modified_nodes.len(),
            diff.removed_node_ids.len(),
            diff.added_links.len(),
            diff.modified_links.len(),
            diff.removed_link_ids.len()
        );
        self.committed.send_replace(Arc::new(candidate));
        Ok(diff)
    }

    fn apply_change(&self, candidate: &mut GraphSnapshot, change: &ChangeEvent) -> ArborResult<()> {
        let id = NodeId::new(change.path.clone());
        match change.kind {
            ChangeKind::Added => {
                let payload = change.payload.clone().unwrap_or_else(|| ChangePayload {
                    node: normalize::node_for_path(&change.path, None, self.world),
                    links: Vec::new(),
                });
                let mut node = payload.node;
                if let Some(existing) = candidate.nodes.get(&id) {
                    node.position = existing.position;
                }
                node.id = id.clone();
                candidate.nodes.insert(id.clone(), node);
                replace_outgoing(candidate, &id, payload.links);
            }
            ChangeKind::Modified => {
                let Some(existing) = candidate.nodes.get_mut(&id) else {
                    warn!("Modify for unknown node {}", id);
                    return Err(ArborError::DiffConflict {
                        path: change.path.clone(),
                        reason: "modified node does not exist".to_string(),
                    });
                };
                if let Some(payload) = change.payload.clone() {
                    existing.attributes = payload.node.attributes;
                    existing.label = payload.node.label;
                    existing.kind = payload.node.kind;
                    replace_outgoing(candidate, &id, payload.links);
                }
            }
            ChangeKind::Removed => {
                if candidate.nodes.remove(&id).is_none() {
                    debug!("Remove for unknown node {}", id);
                }
                // Wildcard removal: every link touching the node goes.
                candidate.links.retain(|_, link| !link.touches(&id));
            }
        }
        Ok(())
    }
}

fn replace_outgoing(candidate: &mut GraphSnapshot, source: &NodeId, links: Vec<LinkRecord>) {
    candidate.links.retain(|_, link| &link.source != source);
    for mut link in links {
        link.source = source.clone();
        link.id = LinkId::between(source, &link.target);
        candidate.links.insert(link.id.clone(), link);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;

    #[test]
    fn test_compute_diff_sets() {
        let old = GraphSnapshot::from_records(
            vec![node("a"), node("b"), node("c")],
            vec![link("a", "b", 1.0), link("b", "c", 1.0)],
        );
        let mut moved = node("b");
        moved.position = Position::new(10.0, 10.0);
        let new = GraphSnapshot::from_records(
            vec![node("a"), moved, node("d")],
            vec![link("a", "b", 2.0), link("a", "d", 1.0)],
        );

        let diff = Diff::compute(&old, &new).unwrap();
        assert_eq!(diff.base_version, 0);
        assert_eq!(diff.result_version, 1);
        assert_eq!(diff.added_nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["d"]);
        assert_eq!(diff.modified_nodes.iter().map(|n| n.id.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(diff.removed_node_ids, vec![NodeId::from("c")]);
        assert_eq!(diff.added_links.len(), 1);
        assert_eq!(diff.modified_links.len(), 1);
        assert_eq!(diff.removed_link_ids, vec![LinkId::between(&"b".into(), &"c".into())]);
    }

    #[test]
    fn test_apply_round_trip() {
        let old = GraphSnapshot::from_records(
            vec![node("a"), node("b"), node("c")],
            vec![link("a", "b", 1.0), link("c", "a", 3.0)],
        );
        let mut relabeled = node("a");
        relabeled.label = "renamed".to_string();
        let new = GraphSnapshot::from_records(
            vec![relabeled, node("c"), node("e")],
            vec![link("c", "a", 0.5), link("e", "c", 1.0)],
        );

        let diff = Diff::compute(&old, &new).unwrap();
        let applied = old.apply(&diff).unwrap();
        assert!(applied.same_content(&new));
        assert_eq!(applied.version, 1);

        let added: Vec<_> = diff.added_nodes.iter().map(|n| n.id.clone()).collect();
        assert!(diff.removed_node_ids.iter().all(|id| !added.contains(id)));
        let added_links: Vec<_> = diff.added_links.iter().map(|l| l.id.clone()).collect();
        assert!(diff.removed_link_ids.iter().all(|id| !added_links.contains(id)));
    }

    #[test]
    fn test_apply_rejects_stale_base() {
        let mut snapshot = GraphSnapshot::new();
        snapshot.version = 4;
        let diff = Diff { base_version: 3, result_version: 4, ..Diff::default() };
        assert!(snapshot.apply(&diff).is_err());
    }

    #[test]
    fn test_commit_publishes_new_version() {
        let mut engine = DiffEngine::new(world());
        let reader = engine.subscribe();

        let diff = engine
            .compute_and_commit(&[added("src/a.js", "import b from './b';")])
            .unwrap();
        assert_eq!((diff.base_version, diff.result_version), (0, 1));
        assert_eq!(reader.borrow().version, 1);
        assert_eq!(reader.borrow().node_count(), 1);
        assert_eq!(reader.borrow().link_count(), 1);
    }

    #[test]
    fn test_modify_preserves_position_and_replaces_links() {
        let mut engine = DiffEngine::new(world());
        engine
            .compute_and_commit(&[added("src/a.js", "import b from './b';"), added("src/b.js", "")])
            .unwrap();
        let before = engine.committed().node(&"src/a.js".into()).unwrap().position;

        let mut moved = BTreeMap::new();
        moved.insert(NodeId::from("src/a.js"), Position::new(1.0, 2.0));
        engine.apply_layout(&moved).unwrap();
        assert_ne!(before, Position::new(1.0, 2.0));

        let diff = engine
            .compute_and_commit(&[modified("src/a.js", "import c from './c';")])
            .unwrap();
        let snapshot = engine.committed();
        let a = snapshot.node(&"src/a.js".into()).unwrap();
        assert_eq!(a.position, Position::new(1.0, 2.0));
        assert_eq!(diff.added_links.len(), 1);
        assert_eq!(diff.removed_link_ids.len(), 1);
        assert!(snapshot.links_from(&a.id).all(|l| l.target.as_str() == "src/c.js"));
    }

    #[test]
    fn test_remove_drops_incident_links() {
        let mut engine = DiffEngine::new(world());
        engine
            .compute_and_commit(&[
                added("src/a.js", "import b from './b';"),
                added("src/b.js", "import c from './c';"),
                added("src/c.js", ""),
            ])
            .unwrap();

        let diff = engine.compute_and_commit(&[removed("src/b.js")]).unwrap();
        assert_eq!(diff.removed_node_ids, vec![NodeId::from("src/b.js")]);
        assert_eq!(diff.removed_link_ids.len(), 2);
        assert_eq!(engine.committed().link_count(), 0);
    }

    #[test]
    fn test_conflict_keeps_committed_snapshot() {
        let mut engine = DiffEngine::new(world());
        engine.compute_and_commit(&[added("src/a.js", "")]).unwrap();

        let result = engine.compute_and_commit(&[added("src/b.js", ""), modified("src/missing.js", "")]);
        assert!(matches!(result, Err(ArborError::DiffConflict { .. })));
        assert_eq!(engine.version(), 1);
        assert!(engine.committed().node(&"src/b.js".into()).is_none());
    }

    #[test]
    fn test_last_write_wins_within_batch() {
        let mut engine = DiffEngine::new(world());
        engine
            .compute_and_commit(&[
                added("src/a.js", "import x from './x';"),
                added("src/a.js", "import y from './y';"),
            ])
            .unwrap();
        let snapshot = engine.committed();
        let targets: Vec<_> = snapshot.all_links().map(|l| l.target.as_str().to_string()).collect();
        assert_eq!(targets, vec!["src/y.js".to_string()]);
    }

    #[test]
    fn test_split_batches_match_single_batch() {
        let changes = vec![
            added("src/a.js", "import b from './b';"),
            added("src/b.js", "import c from './c';"),
            added("src/c.js", ""),
            modified("src/a.js", "import c from './c';"),
            removed("src/b.js"),
            added("src/d.js", "import a from './a';"),
        ];

        let mut whole = DiffEngine::new(world());
        whole.compute_and_commit(&changes).unwrap();

        let mut split = DiffEngine::new(world());
        for chunk in changes.chunks(2) {
            split.compute_and_commit(chunk).unwrap();
        }

        assert!(whole.committed().same_content(&split.committed()));
        assert_eq!(split.version(), 3);
    }

    #[test]
    fn test_unknown_removal_is_noop() {
        let mut engine = DiffEngine::new(world());
        let diff = engine.compute_and_commit(&[removed("nothing.js")]).unwrap();
        assert!(diff.is_empty());
    }

    #[test]
    fn test_dominant_change() {
        let mut diff = Diff::default();
        assert_eq!(diff.dominant_change(), None);
        diff.added_nodes.push(node("a"));
        assert_eq!(diff.dominant_change(), Some(ChangeKind::Added));
        diff.modified_links.push(link("a", "b", 1.0));
        assert_eq!(diff.dominant_change(), Some(ChangeKind::Modified));
        diff.removed_node_ids.push("c".into());
        assert_eq!(diff.dominant_change(), Some(ChangeKind::Removed));
        assert_eq!(diff.touched_nodes(), 2);
    }
}
