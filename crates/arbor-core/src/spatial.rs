//! Quadtree viewport culling and level-of-detail selection

use std::collections::BTreeSet;

use kurbo::{Point, Rect};
use serde::{Deserialize, Serialize};

use crate::model::{NodeId, NodeRecord};

/// Closed-interval containment. `kurbo::Rect::contains` excludes the far edges.
fn contains_inclusive(rect: &Rect, point: Point) -> bool {
    point.x >= rect.x0 && point.x <= rect.x1 && point.y >= rect.y0 && point.y <= rect.y1
}

fn overlaps_inclusive(a: &Rect, b: &Rect) -> bool {
    a.x0 <= b.x1 && b.x0 <= a.x1 && a.y0 <= b.y1 && b.y0 <= a.y1
}

/// One quadtree bucket.
#[derive(Debug, Clone)]
pub struct QuadNode {
    pub bounds: Rect,
    pub points: Vec<(NodeId, Point)>,
    children: Option<Box<[QuadNode; 4]>>,
    depth: usize,
}

impl QuadNode {
    fn new(bounds: Rect, depth: usize) -> Self {
        QuadNode {
            bounds,
            points: Vec::new(),
            children: None,
            depth,
        }
    }

    fn insert(&mut self, id: NodeId, point: Point, capacity: usize, max_depth: usize) -> bool {
        if !contains_inclusive(&self.bounds, point) {
            return false;
        }

        if let Some(children) = self.children.as_mut() {
            for child in children.iter_mut() {
                if contains_inclusive(&child.bounds, point) {
                    return child.insert(id, point, capacity, max_depth);
                }
            }
            // Unreachable for finite points: the four children tile the bounds.
            self.points.push((id, point));
            return true;
        }

        self.points.push((id, point));
        if self.points.len() > capacity && self.depth < max_depth {
            self.subdivide(capacity, max_depth);
        }
        true
    }

    fn subdivide(&mut self, capacity: usize, max_depth: usize) {
        let Rect { x0, y0, x1, y1 } = self.bounds;
        let mid = self.bounds.center();
        let depth = self.depth + 1;
        let mut children = Box::new([
            QuadNode::new(Rect::new(x0, y0, mid.x, mid.y), depth),
            QuadNode::new(Rect::new(mid.x, y0, x1, mid.y), depth),
            QuadNode::new(Rect::new(x0, mid.y, mid.x, y1), depth),
            QuadNode::new(Rect::new(mid.x, mid.y, x1, y1), depth),
        ]);

        let points = std::mem::take(&mut self.points);
        for (id, point) in points {
            let placed = children
                .iter_mut()
                .any(|child| contains_inclusive(&child.bounds, point) && child.insert(id.clone(), point, capacity, max_depth));
            if !placed {
                self.points.push((id, point));
            }
        }
        self.children = Some(children);
    }

    fn query(&self, range: &Rect, out: &mut Vec<NodeId>) {
        if !overlaps_inclusive(&self.bounds, range) {
            return;
        }
        out.extend(
            self.points
                .iter()
                .filter(|(_, p)| contains_inclusive(range, *p))
                .map(|(id, _)| id.clone()),
        );
        if let Some(children) = &self.children {
            for child in children.iter() {
                child.query(range, out);
            }
        }
    }

    fn depth_reached(&self) -> usize {
        match &self.children {
            Some(children) => children.iter().map(|c| c.depth_reached()).max().unwrap_or(self.depth),
            None => self.depth,
        }
    }
}

/// Point quadtree keyed by node position.
#[derive(Debug, Clone)]
pub struct QuadTree {
    root: QuadNode,
    /// Points outside the root bounds; always tested linearly.
    outliers: Vec<(NodeId, Point)>,
    capacity: usize,
    max_depth: usize,
    len: usize,
}

impl QuadTree {
    pub fn new(bounds: Rect, capacity: usize, max_depth: usize) -> Self {
        QuadTree {
            root: QuadNode::new(bounds.abs(), 0),
            outliers: Vec::new(),
            capacity: capacity.max(1),
            max_depth,
            len: 0,
        }
    }

    pub fn insert(&mut self, id: NodeId, point: Point) {
        if !self.root.insert(id.clone(), point, self.capacity, self.max_depth) {
            self.outliers.push((id, point));
        }
        self.len += 1;
    }

    /// All points inside `range`, edges included.
    pub fn query(&self, range: &Rect) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.root.query(range, &mut out);
        out.extend(
            self.outliers
                .iter()
                .filter(|(_, p)| contains_inclusive(range, *p))
                .map(|(id, _)| id.clone()),
        );
        out
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn depth(&self) -> usize {
        self.root.depth_reached()
    }
}

/// Result of a viewport query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ViewportResult {
    pub visible: Vec<NodeId>,
    pub culled: Vec<NodeId>,
}

/// Quadtree over the committed node positions plus the viewport padding rule.
#[derive(Debug, Clone)]
pub struct SpatialIndex {
    tree: QuadTree,
    all: BTreeSet<NodeId>,
    padding: f64,
    capacity: usize,
    max_depth: usize,
}

impl SpatialIndex {
    pub fn new(padding: f64, capacity: usize, max_depth: usize) -> Self {
        SpatialIndex {
            tree: QuadTree::new(Rect::ZERO, capacity, max_depth),
            all: BTreeSet::new(),
            padding,
            capacity,
            max_depth,
        }
    }

    /// Replace the index contents.
    pub fn rebuild<'a>(&mut self, nodes: impl IntoIterator<Item = &'a NodeRecord>, bounds: Rect) {
        let mut tree = QuadTree::new(bounds, self.capacity, self.max_depth);
        let mut all = BTreeSet::new();
        for node in nodes {
            tree.insert(node.id.clone(), Point::new(node.position.x, node.position.y));
            all.insert(node.id.clone());
        }
        tracing::debug!("Spatial index rebuilt: {} nodes, depth {}", tree.len(), tree.depth());
        self.tree = tree;
        self.all = all;
    }

    /// Nodes inside the viewport expanded by the padding, and everything else.
    pub fn query_viewport(&self, viewport: Rect) -> ViewportResult {
        let range = viewport.abs().inflate(self.padding, self.padding);
        let visible: BTreeSet<NodeId> = self.tree.query(&range).into_iter().collect();
        let culled = self.all.iter().filter(|id| !visible.contains(*id)).cloned().collect();
        ViewportResult {
            visible: visible.into_iter().collect(),
            culled,
        }
    }

    pub fn len(&self) -> usize {
        self.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }

    pub fn padding(&self) -> f64 {
        self.padding
    }
}

/// How much detail the renderer should draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LodLevel {
    /// Full detail and labels.
    Full,
    /// Labels only.
    Labels,
    /// Shapes only.
    Shapes,
    Minimal,
}

impl LodLevel {
    pub fn shows_labels(self) -> bool {
        matches!(self, LodLevel::Full | LodLevel::Labels)
    }

    pub fn shows_details(self) -> bool {
        self == LodLevel::Full
    }
}

/// Zoom-threshold table, highest matching lower bound wins.
#[derive(Debug, Clone)]
pub struct LodManager {
    thresholds: Vec<(f64, LodLevel)>,
}

impl Default for LodManager {
    fn default() -> Self {
        LodManager::new(vec![
            (1.5, LodLevel::Full),
            (0.8, LodLevel::Labels),
            (0.3, LodLevel::Shapes),
            (0.0, LodLevel::Minimal),
        ])
    }
}

impl LodManager {
    pub fn new(mut thresholds: Vec<(f64, LodLevel)>) -> Self {
        thresholds.sort_by(|a, b| b.0.total_cmp(&a.0));
        LodManager { thresholds }
    }

    pub fn level_for_zoom(&self, zoom: f64) -> LodLevel {
        self.thresholds
            .iter()
            .find(|(bound, _)| zoom >= *bound)
            .map(|(_, level)| *level)
            .unwrap_or(LodLevel::Minimal)
    }
}

/// Rendering backend hint by graph size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderMode {
    Svg,
    Canvas,
    Webgl,
}

impl RenderMode {
    pub fn for_node_count(count: usize) -> Self {
        match count {
            0..=100 => RenderMode::Svg,
            101..=500 => RenderMode::Canvas,
            _ => RenderMode::Webgl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeKind, Position};

    fn at(id: &str, x: f64, y: f64) -> NodeRecord {
        let mut node = NodeRecord::new(id, NodeKind::Module);
        node.position = Position::new(x, y);
        node
    }

    #[test]
    fn test_padded_boundary_is_inclusive() {
        let nodes = vec![at("edge", 600.0, 300.0), at("beyond", 601.0, 300.0), at("inside", 250.0, 250.0)];
        let mut index = SpatialIndex::new(100.0, 8, 16);
        index.rebuild(&nodes, Rect::new(0.0, 0.0, 1000.0, 1000.0));

        let result = index.query_viewport(Rect::new(0.0, 0.0, 500.0, 500.0));
        assert_eq!(result.visible, vec![NodeId::from("edge"), NodeId::from("inside")]);
        assert_eq!(result.culled, vec![NodeId::from("beyond")]);
    }

    #[test]
    fn test_query_after_subdivision() {
        let nodes: Vec<_> = (0..200)
            .map(|i| at(&format!("n{}", i), (i % 20) as f64 * 50.0, (i / 20) as f64 * 50.0))
            .collect();
        let mut index = SpatialIndex::new(0.0, 4, 8);
        index.rebuild(&nodes, Rect::new(0.0, 0.0, 1000.0, 1000.0));
        assert!(index.tree.depth() > 0);

        let result = index.query_viewport(Rect::new(0.0, 0.0, 100.0, 100.0));
        // 3 columns x 3 rows, boundaries included
        assert_eq!(result.visible.len(), 9);
        assert_eq!(result.visible.len() + result.culled.len(), 200);
    }

    #[test]
    fn test_points_outside_world_are_still_found() {
        let nodes = vec![at("far", -5000.0, -5000.0)];
        let mut index = SpatialIndex::new(100.0, 8, 16);
        index.rebuild(&nodes, Rect::new(0.0, 0.0, 100.0, 100.0));
        let result = index.query_viewport(Rect::new(-5050.0, -5050.0, -4950.0, -4950.0));
        assert_eq!(result.visible.len(), 1);
    }

    #[test]
    fn test_max_depth_bounds_subdivision() {
        let mut tree = QuadTree::new(Rect::new(0.0, 0.0, 10.0, 10.0), 1, 3);
        for i in 0..50 {
            tree.insert(NodeId::new(format!("p{}", i)), Point::new(1.0, 1.0));
        }
        assert_eq!(tree.len(), 50);
        assert!(tree.depth() <= 3);
        assert_eq!(tree.query(&Rect::new(0.0, 0.0, 1.0, 1.0)).len(), 50);
    }

    #[test]
    fn test_lod_thresholds() {
        let lod = LodManager::default();
        assert_eq!(lod.level_for_zoom(2.0), LodLevel::Full);
        assert_eq!(lod.level_for_zoom(1.5), LodLevel::Full);
        assert_eq!(lod.level_for_zoom(1.49), LodLevel::Labels);
        assert_eq!(lod.level_for_zoom(0.8), LodLevel::Labels);
        assert_eq!(lod.level_for_zoom(0.5), LodLevel::Shapes);
        assert_eq!(lod.level_for_zoom(0.1), LodLevel::Minimal);
        assert_eq!(lod.level_for_zoom(-1.0), LodLevel::Minimal);
        assert!(LodLevel::Labels.shows_labels() && !LodLevel::Labels.shows_details());
    }

    #[test]
    fn test_render_mode() {
        assert_eq!(RenderMode::for_node_count(100), RenderMode::Svg);
        assert_eq!(RenderMode::for_node_count(101), RenderMode::Canvas);
        assert_eq!(RenderMode::for_node_count(501), RenderMode::Webgl);
    }
}
