//! Renderer-facing viewport queries over the committed snapshot

use std::sync::{Arc, RwLock};

use arbor_core::config::SpatialConfig;
use arbor_core::{LodLevel, LodManager, NodeId, Rect, RenderMode, SnapshotReader, SpatialIndex};
use serde::Serialize;
use tracing::debug;

use crate::caches::{PipelineCaches, RenderKey};
use crate::throttle::ThrottleReader;

/// What the renderer should draw for one viewport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ViewportAnswer {
    pub version: u64,
    pub visible_node_ids: Vec<NodeId>,
    pub culled_count: usize,
    pub lod_level: LodLevel,
    pub show_labels: bool,
    pub render_mode: RenderMode,
    /// Frames the renderer may skip under the current throttle level.
    pub skip_frames: u32,
}

struct Indexed {
    version: Option<u64>,
    index: SpatialIndex,
}

/// Spatial index kept in step with the committed snapshot, plus LOD selection.
pub struct ViewportService {
    snapshots: SnapshotReader,
    indexed: RwLock<Indexed>,
    lod: LodManager,
    world: Rect,
    caches: Arc<PipelineCaches>,
    throttle: ThrottleReader,
}

impl std::fmt::Debug for ViewportService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let indexed = self.indexed.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        f.debug_struct("ViewportService")
            .field("version", &indexed.version)
            .field("indexed_nodes", &indexed.index.len())
            .finish()
    }
}

impl ViewportService {
    pub fn new(
        config: &SpatialConfig,
        snapshots: SnapshotReader,
        caches: Arc<PipelineCaches>,
        throttle: ThrottleReader,
    ) -> Self {
        ViewportService {
            snapshots,
            indexed: RwLock::new(Indexed {
                version: None,
                index: SpatialIndex::new(config.padding, config.bucket_capacity, config.max_depth),
            }),
            lod: LodManager::default(),
            world: config.world_rect(),
            caches,
            throttle,
        }
    }

    /// Visible nodes and detail level for `rect` at `zoom`.
    pub fn query_viewport(&self, rect: Rect, zoom: f64) -> ViewportAnswer {
        let snapshot = self.snapshots.borrow().clone();
        let skip_frames = self.throttle.borrow().skip_frames();
        let key = RenderKey::new(snapshot.version, rect, zoom);

        if let Some(cached) = self.caches.render.get(&key) {
            return ViewportAnswer { skip_frames, ..cached };
        }

        let result = {
            let stale = self.read_indexed().version != Some(snapshot.version);
            if stale {
                let mut indexed = self.indexed.write().unwrap_or_else(|poisoned| poisoned.into_inner());
                if indexed.version != Some(snapshot.version) {
                    indexed.index.rebuild(snapshot.all_nodes(), self.world);
                    indexed.version = Some(snapshot.version);
                    debug!("Viewport index rebuilt for version {}", snapshot.version);
                }
            }
            self.read_indexed().index.query_viewport(rect)
        };

        let lod_level = self.lod.level_for_zoom(zoom);
        let answer = ViewportAnswer {
            version: snapshot.version,
            culled_count: result.culled.len(),
            visible_node_ids: result.visible,
            lod_level,
            show_labels: lod_level.shows_labels(),
            render_mode: RenderMode::for_node_count(snapshot.node_count()),
            skip_frames,
        };
        self.caches.render.set(key, answer.clone());
        answer
    }

    pub fn level_for_zoom(&self, zoom: f64) -> LodLevel {
        self.lod.level_for_zoom(zoom)
    }

    fn read_indexed(&self) -> std::sync::RwLockReadGuard<'_, Indexed> {
        self.indexed.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::ThrottleState;
    use arbor_core::config::CacheConfig;
    use arbor_core::{GraphSnapshot, NodeKind, NodeRecord, Position};
    use tokio::sync::watch;

    fn at(id: &str, x: f64, y: f64) -> NodeRecord {
        let mut node = NodeRecord::new(id, NodeKind::Module);
        node.position = Position::new(x, y);
        node
    }

    fn service(
        nodes: Vec<NodeRecord>,
    ) -> (ViewportService, watch::Sender<Arc<GraphSnapshot>>, watch::Sender<ThrottleState>, Arc<PipelineCaches>) {
        let snapshot = GraphSnapshot {
            version: 1,
            ..GraphSnapshot::from_records(nodes, Vec::new())
        };
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(snapshot));
        let (throttle_tx, throttle_rx) = watch::channel(ThrottleState::default());
        let caches = Arc::new(PipelineCaches::new(&CacheConfig::default()));
        let config = SpatialConfig {
            world: [0.0, 0.0, 1000.0, 1000.0],
            ..SpatialConfig::default()
        };
        let service = ViewportService::new(&config, snapshot_rx, Arc::clone(&caches), throttle_rx);
        (service, snapshot_tx, throttle_tx, caches)
    }

    #[test]
    fn test_viewport_culls_and_picks_lod() {
        let (service, _snapshots, _throttle, _) = service(vec![at("a", 50.0, 50.0), at("b", 900.0, 900.0)]);

        let answer = service.query_viewport(Rect::new(0.0, 0.0, 200.0, 200.0), 1.0);
        assert_eq!(answer.visible_node_ids, vec![NodeId::from("a")]);
        assert_eq!(answer.culled_count, 1);
        assert_eq!(answer.lod_level, LodLevel::Labels);
        assert!(answer.show_labels);
        assert_eq!(answer.render_mode, RenderMode::Svg);
    }

    #[test]
    fn test_repeat_query_hits_render_cache() {
        let (service, _snapshots, throttle, caches) = service(vec![at("a", 50.0, 50.0)]);
        let rect = Rect::new(0.0, 0.0, 200.0, 200.0);

        service.query_viewport(rect, 2.0);
        throttle.send_replace(ThrottleState {
            level: 2.4,
            adaptive_enabled: true,
        });
        let again = service.query_viewport(rect, 2.0);

        assert_eq!(caches.render.stats().hits, 1);
        assert_eq!(again.skip_frames, 2);
        assert_eq!(again.lod_level, LodLevel::Full);
    }

    #[test]
    fn test_nearby_viewports_are_answered_separately() {
        let (service, _snapshots, _throttle, caches) = service(vec![at("edge", 600.0, 50.0)]);

        // Padding is 100, so the node sits just inside the first rect and just outside the second.
        let wide = service.query_viewport(Rect::new(0.0, 0.0, 500.4, 200.0), 1.0);
        let narrow = service.query_viewport(Rect::new(0.0, 0.0, 499.6, 200.0), 1.0);
        assert_eq!(wide.visible_node_ids, vec![NodeId::from("edge")]);
        assert!(narrow.visible_node_ids.is_empty());

        let rect = Rect::new(0.0, 0.0, 200.0, 200.0);
        assert_eq!(service.query_viewport(rect, 1.5).lod_level, LodLevel::Full);
        assert_eq!(service.query_viewport(rect, 1.4996).lod_level, LodLevel::Labels);
        assert_eq!(caches.render.stats().hits, 0);
    }

    #[test]
    fn test_new_version_rebuilds_index() {
        let (service, snapshots, _throttle, _) = service(vec![at("a", 50.0, 50.0)]);
        let rect = Rect::new(0.0, 0.0, 200.0, 200.0);
        assert_eq!(service.query_viewport(rect, 1.0).visible_node_ids.len(), 1);

        let next = GraphSnapshot {
            version: 2,
            ..GraphSnapshot::from_records(vec![at("a", 50.0, 50.0), at("b", 120.0, 120.0)], Vec::new())
        };
        snapshots.send_replace(Arc::new(next));

        let answer = service.query_viewport(rect, 1.0);
        assert_eq!(answer.version, 2);
        assert_eq!(answer.visible_node_ids, vec![NodeId::from("a"), NodeId::from("b")]);
    }
}
