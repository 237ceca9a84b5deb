//! The voxel octree.
//!
//! Nodes live in an arena and are addressed by [`NodeId`], so the query-state registry, the cache and the scheduler can refer
//! to a node without borrowing the tree. Nodes are never removed while the tree is alive; only their payloads are reclaimed.

mod node;

pub use node::VoxelNode;

use crate::{NodeId, VoxelKey};

use parking_lot::RwLock;
use pointstream_core::arena::Arena32;
use pointstream_core::geometry::Aabb;
use std::sync::Arc;

/// What a traversal should do after visiting a node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum VisitCommand {
    Continue,
    SkipDescendants,
    Stop,
}

pub struct VoxelTree {
    root: NodeId,
    root_bounds: Aabb,
    nodes: RwLock<Arena32<Arc<VoxelNode>>>,
}

impl VoxelTree {
    /// Creates a tree with only a root node. Non-cubic bounds are grown into a cube.
    pub fn new(bounds: Aabb) -> Self {
        let root_bounds = bounds.cubed();
        let mut nodes = Arena32::default();
        let root = nodes.insert(Arc::new(VoxelNode::new(VoxelKey::ROOT, root_bounds, None)));
        Self {
            root,
            root_bounds,
            nodes: RwLock::new(nodes),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn root_bounds(&self) -> &Aabb {
        &self.root_bounds
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<VoxelNode>> {
        self.nodes.read().get(id).cloned()
    }

    /// Returns the child in `octant`, creating it if absent.
    ///
    /// Only creation takes the tree's write lock; existing children are found through the parent's atomic links.
    pub fn get_or_create_child(&self, parent: NodeId, octant: u8) -> Option<NodeId> {
        if octant >= 8 {
            return None;
        }
        let parent_node = self.node(parent)?;
        if let Some(child) = parent_node.child(octant) {
            return Some(child);
        }
        if parent_node.depth() >= VoxelKey::MAX_DEPTH {
            return None;
        }

        let mut nodes = self.nodes.write();
        // Another thread may have won the race for the write lock.
        if let Some(child) = parent_node.child(octant) {
            return Some(child);
        }
        let child_key = parent_node.key().child(octant);
        let child_node = VoxelNode::new(child_key, parent_node.bounds().octant(octant), Some(parent));
        let child = nodes.insert(Arc::new(child_node));
        parent_node.link_child(octant, child);
        Some(child)
    }

    /// Follows existing child links from the root down to `key`.
    pub fn find(&self, key: VoxelKey) -> Option<NodeId> {
        let mut id = self.root;
        for level in (0..key.depth).rev() {
            let shift = level as u32;
            let octant = ((key.x >> shift) & 1) as u8
                | (((key.y >> shift) & 1) as u8) << 1
                | (((key.z >> shift) & 1) as u8) << 2;
            id = self.node(id)?.child(octant)?;
        }
        Some(id)
    }

    /// Visits `start` and its existing descendants in depth-first pre-order, children in octant order.
    ///
    /// Returns `true` if the traversal ran to completion and `false` if the visitor stopped it.
    pub fn visit_depth_first(
        &self,
        start: NodeId,
        mut visitor: impl FnMut(NodeId, &VoxelNode) -> VisitCommand,
    ) -> bool {
        let mut stack = vec![start];
        while let Some(id) = stack.pop() {
            let node = match self.node(id) {
                Some(node) => node,
                None => continue,
            };
            match visitor(id, &node) {
                VisitCommand::Continue => {
                    for octant in (0..8).rev() {
                        if let Some(child) = node.child(octant) {
                            stack.push(child);
                        }
                    }
                }
                VisitCommand::SkipDescendants => (),
                VisitCommand::Stop => return false,
            }
        }
        true
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
