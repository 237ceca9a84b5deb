use crate::{Lod, NodeId, VisitCommand, VoxelTree};

use dashmap::DashMap;
use pointstream_core::SmallKeyHashSet;
use smallvec::SmallVec;
use std::fmt;

/// Opaque identity of one independent query context, such as a viewport.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct ClientId(pub u32);

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client{}", self.0)
    }
}

/// What one client currently needs from one voxel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ClientQueryState {
    pub lod: Lod,
    /// Only visible states pin a payload in the cache.
    pub visible: bool,
    /// The query area covers only part of the voxel.
    pub partially_selected: bool,
}

impl ClientQueryState {
    pub fn visible(lod: Lod) -> Self {
        Self {
            lod,
            visible: true,
            partially_selected: false,
        }
    }
}

type NodeStates = SmallVec<[(ClientId, ClientQueryState); 2]>;

/// Per-(voxel, client) query state, indexed both ways so a client can be removed without walking the tree.
///
/// Entries are inserted into the per-node map before the per-client index, and removed from the per-client index first, so a
/// concurrent `remove_all_for_client` can never leave a per-node entry that the client index has forgotten.
#[derive(Default)]
pub struct QueryStateRegistry {
    by_node: DashMap<NodeId, NodeStates>,
    by_client: DashMap<ClientId, SmallKeyHashSet<NodeId>>,
}

impl QueryStateRegistry {
    /// Records `state`, returning the state it replaced.
    pub fn set_query_state(
        &self,
        client: ClientId,
        node: NodeId,
        state: ClientQueryState,
    ) -> Option<ClientQueryState> {
        let previous = {
            let mut states = self.by_node.entry(node).or_default();
            match states.iter_mut().find(|(c, _)| *c == client) {
                Some((_, existing)) => Some(std::mem::replace(existing, state)),
                None => {
                    states.push((client, state));
                    None
                }
            }
        };
        if previous.is_none() {
            self.by_client.entry(client).or_default().insert(node);
        }
        previous
    }

    pub fn get(&self, client: ClientId, node: NodeId) -> Option<ClientQueryState> {
        let states = self.by_node.get(&node)?;
        states.iter().find(|(c, _)| *c == client).map(|(_, s)| *s)
    }

    pub fn remove_query_state(&self, client: ClientId, node: NodeId) -> Option<ClientQueryState> {
        if let Some(mut nodes) = self.by_client.get_mut(&client) {
            nodes.remove(&node);
        }
        self.by_client.remove_if(&client, |_, nodes| nodes.is_empty());
        self.remove_from_node(client, node)
    }

    fn remove_from_node(&self, client: ClientId, node: NodeId) -> Option<ClientQueryState> {
        let removed = {
            let mut states = self.by_node.get_mut(&node)?;
            let index = states.iter().position(|(c, _)| *c == client)?;
            states.swap_remove(index).1
        };
        self.by_node.remove_if(&node, |_, states| states.is_empty());
        Some(removed)
    }

    /// Removes every state `client` holds. Returns how many were removed.
    pub fn remove_all_for_client(&self, client: ClientId) -> usize {
        let nodes = match self.by_client.remove(&client) {
            Some((_, nodes)) => nodes,
            None => return 0,
        };
        nodes
            .into_iter()
            .filter(|&node| self.remove_from_node(client, node).is_some())
            .count()
    }

    /// Clears `client`'s state from `root` and every existing descendant.
    pub fn remove_subtree_for_client(&self, tree: &VoxelTree, client: ClientId, root: NodeId) -> usize {
        let mut removed = 0;
        tree.visit_depth_first(root, |id, _| {
            if self.remove_query_state(client, id).is_some() {
                removed += 1;
            }
            if self.by_client.contains_key(&client) {
                VisitCommand::Continue
            } else {
                VisitCommand::Stop
            }
        });
        removed
    }

    /// True if some client holds a visible state on `node`. A node for which this is false may be evicted.
    pub fn any_client_needs(&self, node: NodeId) -> bool {
        self.by_node
            .get(&node)
            .map_or(false, |states| states.iter().any(|(_, s)| s.visible))
    }

    /// The finest LOD any client wants for `node`.
    pub fn max_requested_lod(&self, node: NodeId) -> Option<Lod> {
        let states = self.by_node.get(&node)?;
        states.iter().filter(|(_, s)| s.visible).map(|(_, s)| s.lod).max()
    }

    /// The coarsest LOD any client wants for `node`.
    pub fn min_requested_lod(&self, node: NodeId) -> Option<Lod> {
        let states = self.by_node.get(&node)?;
        states.iter().filter(|(_, s)| s.visible).map(|(_, s)| s.lod).min()
    }

    pub fn clients_of(&self, node: NodeId) -> SmallVec<[ClientId; 4]> {
        self.by_node
            .get(&node)
            .map(|states| states.iter().map(|(c, _)| *c).collect())
            .unwrap_or_default()
    }

    pub fn nodes_of(&self, client: ClientId) -> Vec<NodeId> {
        self.by_client
            .get(&client)
            .map(|nodes| nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// The number of (node, client) states.
    pub fn len(&self) -> usize {
        self.by_node.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
