use crate::{Lod, NodeId, Payload, VoxelKey};

use parking_lot::RwLock;
use pointstream_core::geometry::Aabb;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// One cell of the voxel octree.
///
/// Structure (key, bounds, child links) is immutable once a child link is published. The payload slot is only written by the
/// [`EvictionCache`](crate::EvictionCache), so that every resident payload is also counted in the cache's byte total.
pub struct VoxelNode {
    key: VoxelKey,
    bounds: Aabb,
    parent: Option<NodeId>,
    /// Raw [`NodeId`]s, `0` when the child does not exist yet.
    children: [AtomicU32; 8],
    payload: RwLock<Option<Arc<Payload>>>,
    last_touched: AtomicU64,
}

impl VoxelNode {
    pub(crate) fn new(key: VoxelKey, bounds: Aabb, parent: Option<NodeId>) -> Self {
        Self {
            key,
            bounds,
            parent,
            children: Default::default(),
            payload: RwLock::new(None),
            last_touched: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> VoxelKey {
        self.key
    }

    pub fn bounds(&self) -> &Aabb {
        &self.bounds
    }

    pub fn depth(&self) -> u8 {
        self.key.depth
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn child(&self, octant: u8) -> Option<NodeId> {
        NodeId::from_raw(self.children[octant as usize].load(Ordering::Acquire))
    }

    pub fn children(&self) -> impl Iterator<Item = (u8, NodeId)> + '_ {
        (0..8).filter_map(|octant| self.child(octant).map(|id| (octant, id)))
    }

    pub fn has_children(&self) -> bool {
        self.children().next().is_some()
    }

    pub(crate) fn link_child(&self, octant: u8, child: NodeId) {
        self.children[octant as usize].store(child.to_raw(), Ordering::Release);
    }

    pub fn payload(&self) -> Option<Arc<Payload>> {
        self.payload.read().clone()
    }

    pub fn resident_lod(&self) -> Option<Lod> {
        self.payload.read().as_ref().map(|p| p.lod())
    }

    /// Replaces the resident payload, returning the previous one.
    pub(crate) fn set_payload(&self, payload: Arc<Payload>) -> Option<Arc<Payload>> {
        self.payload.write().replace(payload)
    }

    pub(crate) fn clear_payload(&self) -> Option<Arc<Payload>> {
        self.payload.write().take()
    }

    /// The cache iteration in which this node was last accessed.
    pub fn last_touched(&self) -> u64 {
        self.last_touched.load(Ordering::Relaxed)
    }

    pub(crate) fn touch(&self, iteration: u64) {
        self.last_touched.fetch_max(iteration, Ordering::Relaxed);
    }
}
