//! Arbor Core — graph data model, committed snapshots, diff engine, caches and spatial queries

pub mod cache;
pub mod config;
pub mod diff;
pub mod error;
pub mod model;
pub mod normalize;
pub mod query;
pub mod snapshot;
pub mod spatial;

#[cfg(test)]
pub mod tests;

#[cfg(test)]
pub mod test_utils;

pub use cache::{CacheEntry, CacheStats, ResultCache};
pub use config::{ArborConfig, EnrichmentKind};
pub use diff::{Diff, DiffEngine, SnapshotReader};
pub use error::{ArborError, ArborResult};
pub use model::{
    AttrValue, ChangeBatch, ChangeEvent, ChangeKind, ChangePayload, LinkId, LinkKind, LinkRecord, NodeId,
    NodeKind, NodeRecord, Position,
};
pub use normalize::{RawChange, normalize};
pub use query::{DependencyGraph, PathResult};
pub use snapshot::GraphSnapshot;
pub use spatial::{LodLevel, LodManager, QuadTree, RenderMode, SpatialIndex, ViewportResult};

/// Re-exported so downstream crates share one geometry type.
pub use kurbo::Rect;
