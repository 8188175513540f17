//! Cross-module tests for arbor-core

use std::time::Duration;

use crate::test_utils::*;
use crate::*;

#[test]
fn test_committed_snapshot_feeds_queries() {
    let mut engine = DiffEngine::new(world());
    engine
        .compute_and_commit(&[
            added("src/a.js", "import b from './b';"),
            added("src/b.js", "import c from './c';"),
            added("src/c.js", "import a from './a';"),
            added("src/d.js", "import a from './a';\nimport fs from 'fs';"),
        ])
        .unwrap();

    let snapshot = engine.committed();
    let graph = DependencyGraph::from_snapshot(&snapshot);

    // The `fs` link is unresolved and not part of the adjacency.
    assert_eq!(snapshot.link_count(), 5);
    assert_eq!(graph.edge_count(), 4);

    let cycles = graph.find_cycles();
    assert_eq!(cycles.len(), 1);
    assert_eq!(cycles[0].first(), cycles[0].last());

    let path = graph.shortest_path(&"src/d.js".into(), &"src/c.js".into()).unwrap();
    assert_eq!(path.nodes.len(), 4);
    assert!((path.distance - 3.0).abs() < 1e-9);
}

#[test]
fn test_reader_keeps_old_snapshot_after_commit() {
    let mut engine = DiffEngine::new(world());
    engine.compute_and_commit(&[added("src/a.js", "")]).unwrap();
    let held = engine.committed();

    engine.compute_and_commit(&[removed("src/a.js")]).unwrap();
    assert_eq!(held.version, 1);
    assert_eq!(held.node_count(), 1);
    assert_eq!(engine.committed().node_count(), 0);
}

#[test]
fn test_spatial_index_over_committed_positions() {
    let mut engine = DiffEngine::new(world());
    engine
        .compute_and_commit(&[added("src/a.js", ""), added("src/b.js", ""), added("src/c.js", "")])
        .unwrap();

    let mut positions = std::collections::BTreeMap::new();
    positions.insert(NodeId::from("src/a.js"), Position::new(10.0, 10.0));
    positions.insert(NodeId::from("src/b.js"), Position::new(500.0, 500.0));
    positions.insert(NodeId::from("src/c.js"), Position::new(900.0, 900.0));
    let diff = engine.apply_layout(&positions).unwrap();
    assert_eq!(diff.modified_nodes.len(), 3);

    let snapshot = engine.committed();
    let mut index = SpatialIndex::new(100.0, 8, 16);
    index.rebuild(snapshot.all_nodes(), world());

    let result = index.query_viewport(Rect::new(0.0, 0.0, 300.0, 300.0));
    assert_eq!(result.visible, vec![NodeId::from("src/a.js")]);
    assert_eq!(result.culled.len(), 2);
}

#[test]
fn test_diff_serializes_for_transport() {
    let mut engine = DiffEngine::new(world());
    let diff = engine.compute_and_commit(&[added("src/a.py", "import os\n")]).unwrap();

    let json = serde_json::to_value(&diff).unwrap();
    assert_eq!(json["base_version"], 0);
    assert_eq!(json["result_version"], 1);
    assert_eq!(json["added_nodes"][0]["kind"], "python");
    assert_eq!(json["added_links"][0]["kind"], "external");

    let back: Diff = serde_json::from_value(json).unwrap();
    assert_eq!(back, diff);
}

#[test]
fn test_cache_bound_holds_under_inserts() {
    let cache = ResultCache::new("bound", 5, Duration::from_secs(60));
    for i in 0..5 {
        cache.set(i, i * 10);
    }
    for i in 1..5 {
        cache.get(&i);
    }

    cache.set(5, 50);
    assert_eq!(cache.len(), 5);
    assert!(!cache.contains(&0));

    for i in 6..50 {
        cache.set(i, i);
        assert!(cache.len() <= 5);
    }
}
