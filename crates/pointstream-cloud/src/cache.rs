use crate::config::CacheConfig;
use crate::{Lod, NodeId, Payload, QueryStateRegistry, VoxelTree};

use parking_lot::Mutex;
use pointstream_core::SmallKeyHashMap;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Bounds the memory held by resident payloads.
///
/// The cache is the only writer of [`VoxelNode`](crate::VoxelNode) payload slots. Swapping a payload and updating the byte
/// total happen under one lock, so the total always matches what the tree holds.
///
/// Recency is a global iteration counter: [`advance_iteration`](Self::advance_iteration) is called once per query pass, and
/// every access stamps the node with the current iteration. Reclamation evicts the oldest unpinned payloads first, larger
/// payloads first within one iteration. A payload is pinned while any client holds a visible query state on its node, and
/// pinned payloads are never evicted, even when that leaves the cache over its ceiling.
pub struct EvictionCache {
    config: CacheConfig,
    tree: Arc<VoxelTree>,
    registry: Arc<QueryStateRegistry>,
    iteration: AtomicU64,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    entries: SmallKeyHashMap<NodeId, CacheEntry>,
    total_bytes: u64,
    stats: CacheStats,
}

#[derive(Clone, Copy)]
struct CacheEntry {
    lod: Lod,
    bytes: u64,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub resident_payloads: usize,
    pub resident_bytes: u64,
    pub inserts: u64,
    pub superseded: u64,
    /// Payloads truncated to a coarser LOD once no client wanted their finer one.
    pub coarsened: u64,
    pub evictions: u64,
    pub evicted_bytes: u64,
    pub over_ceiling_events: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    Replaced { previous: Lod },
    /// The node already holds this LOD or a finer one; the new payload was dropped.
    Superseded { resident: Lod },
    UnknownNode,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReclaimOutcome {
    UnderCeiling {
        evicted: usize,
        freed_bytes: u64,
    },
    /// Every remaining payload is pinned by some client and the total is still above the ceiling.
    OverCeiling {
        evicted: usize,
        freed_bytes: u64,
        pinned_bytes: u64,
    },
}

impl ReclaimOutcome {
    pub fn evicted(&self) -> usize {
        match *self {
            Self::UnderCeiling { evicted, .. } | Self::OverCeiling { evicted, .. } => evicted,
        }
    }

    pub fn is_over_ceiling(&self) -> bool {
        matches!(self, Self::OverCeiling { .. })
    }
}

impl EvictionCache {
    pub fn new(config: CacheConfig, tree: Arc<VoxelTree>, registry: Arc<QueryStateRegistry>) -> Self {
        Self {
            config,
            tree,
            registry,
            iteration: AtomicU64::new(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Acquire)
    }

    /// Starts a new recency epoch. Returns the new iteration.
    pub fn advance_iteration(&self) -> u64 {
        self.iteration.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Marks `node` as used in the current iteration.
    pub fn touch(&self, node: NodeId) {
        if let Some(n) = self.tree.node(node) {
            n.touch(self.iteration());
        }
    }

    /// Makes `payload` resident on `node`, then reclaims memory if the ceiling was crossed.
    pub fn insert(&self, node: NodeId, payload: Arc<Payload>) -> (InsertOutcome, ReclaimOutcome) {
        let mut state = self.state.lock();
        let outcome = self.insert_locked(&mut state, node, payload);
        let reclaim = self.reclaim_locked(&mut state);
        (outcome, reclaim)
    }

    fn insert_locked(&self, state: &mut CacheState, id: NodeId, payload: Arc<Payload>) -> InsertOutcome {
        let node = match self.tree.node(id) {
            Some(node) => node,
            None => return InsertOutcome::UnknownNode,
        };
        let lod = payload.lod();
        if let Some(resident) = node.resident_lod() {
            if resident >= lod {
                state.stats.superseded += 1;
                return InsertOutcome::Superseded { resident };
            }
        }

        let bytes = payload.byte_size();
        node.set_payload(payload);
        node.touch(self.iteration());
        state.total_bytes += bytes;
        state.stats.inserts += 1;
        match state.entries.insert(id, CacheEntry { lod, bytes }) {
            Some(previous) => {
                state.total_bytes -= previous.bytes;
                InsertOutcome::Replaced {
                    previous: previous.lod,
                }
            }
            None => InsertOutcome::Inserted,
        }
    }

    /// Truncates the payload on `node` to the finest LOD any client still requests. Returns the new LOD and the bytes
    /// freed, or `None` if nothing changed.
    ///
    /// Nodes no client needs keep their payload; those are eviction candidates instead.
    pub fn coarsen_to_requests(&self, node: NodeId) -> Option<(Lod, u64)> {
        let mut state = self.state.lock();
        self.coarsen_locked(&mut state, node)
    }

    fn coarsen_locked(&self, state: &mut CacheState, id: NodeId) -> Option<(Lod, u64)> {
        let wanted = self.registry.max_requested_lod(id)?;
        let entry = *state.entries.get(&id)?;
        if wanted >= entry.lod {
            return None;
        }
        let node = self.tree.node(id)?;
        let coarser = node.payload()?.coarsened(wanted)?;
        let bytes = coarser.byte_size();
        node.set_payload(Arc::new(coarser));
        state.entries.insert(id, CacheEntry { lod: wanted, bytes });
        state.total_bytes = state.total_bytes - entry.bytes + bytes;
        state.stats.coarsened += 1;
        log::trace!("Coarsened {:?} from {:?} to {:?}", id, entry.lod, wanted);
        Some((wanted, entry.bytes.saturating_sub(bytes)))
    }

    /// Evicts unpinned payloads, oldest first, until resident bytes are back under the configured low-water mark.
    pub fn reclaim_until_under_ceiling(&self) -> ReclaimOutcome {
        let mut state = self.state.lock();
        self.reclaim_locked(&mut state)
    }

    fn reclaim_locked(&self, state: &mut CacheState) -> ReclaimOutcome {
        let mut evicted = 0;
        let mut evicted_bytes = 0;
        let mut freed_bytes = 0;
        if state.total_bytes <= self.config.ceiling_bytes {
            return ReclaimOutcome::UnderCeiling {
                evicted,
                freed_bytes,
            };
        }

        // Pinned payloads finer than any client asks for shrink before anything is evicted.
        let resident: Vec<NodeId> = state.entries.keys().copied().collect();
        for id in resident {
            if let Some((_, freed)) = self.coarsen_locked(state, id) {
                freed_bytes += freed;
            }
        }

        let target = self.config.low_water_bytes();
        let mut candidates: BinaryHeap<_> = state
            .entries
            .iter()
            .filter(|&(&id, _)| !self.registry.any_client_needs(id))
            .filter_map(|(&id, entry)| {
                let last_touched = self.tree.node(id)?.last_touched();
                Some((Reverse(last_touched), entry.bytes, Reverse(id)))
            })
            .collect();

        while state.total_bytes > target {
            let (_, _, Reverse(id)) = match candidates.pop() {
                Some(c) => c,
                None => break,
            };
            if let Some(entry) = state.entries.remove(&id) {
                if let Some(node) = self.tree.node(id) {
                    node.clear_payload();
                }
                state.total_bytes -= entry.bytes;
                evicted += 1;
                evicted_bytes += entry.bytes;
            }
        }
        state.stats.evictions += evicted as u64;
        state.stats.evicted_bytes += evicted_bytes;
        freed_bytes += evicted_bytes;

        if state.total_bytes > self.config.ceiling_bytes {
            state.stats.over_ceiling_events += 1;
            log::warn!(
                "Cache over ceiling: {} bytes pinned by active queries (ceiling {})",
                state.total_bytes,
                self.config.ceiling_bytes
            );
            ReclaimOutcome::OverCeiling {
                evicted,
                freed_bytes,
                pinned_bytes: state.total_bytes,
            }
        } else {
            log::debug!("Reclaimed {} bytes from {} payloads", freed_bytes, evicted);
            ReclaimOutcome::UnderCeiling {
                evicted,
                freed_bytes,
            }
        }
    }

    /// Drops the payload on `node` regardless of pins.
    pub fn remove(&self, node: NodeId) -> Option<Arc<Payload>> {
        let mut state = self.state.lock();
        let entry = state.entries.remove(&node)?;
        state.total_bytes -= entry.bytes;
        self.tree.node(node)?.clear_payload()
    }

    /// Drops every payload.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for (id, _) in state.entries.drain() {
            if let Some(node) = self.tree.node(id) {
                node.clear_payload();
            }
        }
        state.total_bytes = 0;
    }

    pub fn resident_lod(&self, node: NodeId) -> Option<Lod> {
        self.state.lock().entries.get(&node).map(|e| e.lod)
    }

    pub fn resident_bytes(&self) -> u64 {
        self.state.lock().total_bytes
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            resident_payloads: state.entries.len(),
            resident_bytes: state.total_bytes,
            ..state.stats
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    use crate::codec::{PointBlock, Quantizer};
    use crate::{ClientId, ClientQueryState};

    use pointstream_core::geometry::Aabb;
    use pointstream_core::glam::DVec3;

    struct Fixture {
        tree: Arc<VoxelTree>,
        registry: Arc<QueryStateRegistry>,
        nodes: Vec<NodeId>,
    }

    impl Fixture {
        fn new() -> Self {
            let tree = Arc::new(VoxelTree::new(Aabb::from_min_and_size(
                DVec3::ZERO,
                DVec3::splat(16.0),
            )));
            let nodes = (0..8)
                .map(|o| tree.get_or_create_child(tree.root(), o).unwrap())
                .collect();
            Self {
                tree,
                registry: Arc::new(QueryStateRegistry::default()),
                nodes,
            }
        }

        fn cache(&self, ceiling_bytes: u64) -> EvictionCache {
            let config = CacheConfig {
                ceiling_bytes,
                low_water_ratio: 1.0,
            };
            EvictionCache::new(config, self.tree.clone(), self.registry.clone())
        }

        fn payload(&self, lod: u8, points: usize) -> Arc<Payload> {
            let bounds = Aabb::from_min_and_size(DVec3::ZERO, DVec3::ONE);
            Arc::new(Payload::new(
                Lod(lod),
                Quantizer::new(&bounds, 16),
                PointBlock::new(16, vec![[1, 2, 3]; points]),
            ))
        }

        fn resident(&self, i: usize) -> bool {
            self.tree.node(self.nodes[i]).unwrap().payload().is_some()
        }
    }

    #[test]
    fn insert_replace_and_supersede() {
        let f = Fixture::new();
        let cache = f.cache(u64::MAX);
        let v = f.nodes[0];

        let coarse = f.payload(0, 10);
        let fine = f.payload(2, 40);
        assert_eq!(cache.insert(v, coarse.clone()).0, InsertOutcome::Inserted);
        assert_eq!(cache.resident_bytes(), coarse.byte_size());
        assert_eq!(
            cache.insert(v, fine.clone()).0,
            InsertOutcome::Replaced { previous: Lod(0) }
        );
        assert_eq!(cache.resident_bytes(), fine.byte_size());
        assert_eq!(
            cache.insert(v, f.payload(1, 20)).0,
            InsertOutcome::Superseded { resident: Lod(2) }
        );
        assert_eq!(f.tree.node(v).unwrap().resident_lod(), Some(Lod(2)));
        assert_eq!(cache.resident_lod(v), Some(Lod(2)));

        let stats = cache.stats();
        assert_eq!(stats.inserts, 2);
        assert_eq!(stats.superseded, 1);
        assert_eq!(stats.resident_payloads, 1);

        assert!(cache.remove(v).is_some());
        assert_eq!(cache.resident_bytes(), 0);
        assert!(!f.resident(0));
    }

    #[test]
    fn converges_to_ceiling_when_nothing_is_pinned() {
        let f = Fixture::new();
        let unit = f.payload(0, 100).byte_size();
        let cache = f.cache(3 * unit + unit / 2);

        for (i, &node) in f.nodes.iter().enumerate() {
            cache.advance_iteration();
            cache.insert(node, f.payload(0, 100));
            assert!(cache.resident_bytes() <= 3 * unit + unit / 2, "after insert {}", i);
        }
        // The three most recent survive.
        assert_eq!(cache.stats().resident_payloads, 3);
        assert!((5..8).all(|i| f.resident(i)));
        assert!((0..5).all(|i| !f.resident(i)));
    }

    #[test]
    fn touch_protects_recently_used_payloads() {
        let f = Fixture::new();
        let unit = f.payload(0, 100).byte_size();
        let cache = f.cache(2 * unit);

        cache.insert(f.nodes[0], f.payload(0, 100));
        cache.advance_iteration();
        cache.insert(f.nodes[1], f.payload(0, 100));
        cache.advance_iteration();
        cache.touch(f.nodes[0]);
        cache.insert(f.nodes[2], f.payload(0, 100));

        assert!(f.resident(0));
        assert!(!f.resident(1));
        assert!(f.resident(2));
    }

    #[test]
    fn larger_payload_goes_first_within_an_iteration() {
        let f = Fixture::new();
        let small = f.payload(0, 10).byte_size();
        let large = f.payload(0, 200).byte_size();
        let cache = f.cache(large + small);

        cache.insert(f.nodes[0], f.payload(0, 10));
        cache.insert(f.nodes[1], f.payload(0, 200));
        cache.insert(f.nodes[2], f.payload(0, 10));

        assert!(f.resident(0));
        assert!(!f.resident(1));
        assert!(f.resident(2));
    }

    #[test]
    fn pinned_payloads_are_never_evicted() {
        let f = Fixture::new();
        let unit = f.payload(0, 100).byte_size();
        let cache = f.cache(unit);
        let client = ClientId(7);

        f.registry
            .set_query_state(client, f.nodes[0], ClientQueryState::visible(Lod(0)));
        cache.insert(f.nodes[0], f.payload(0, 100));
        for &node in &f.nodes[1..] {
            cache.advance_iteration();
            cache.insert(node, f.payload(0, 100));
            assert!(f.resident(0));
        }

        f.registry
            .set_query_state(client, f.nodes[1], ClientQueryState::visible(Lod(0)));
        cache.insert(f.nodes[1], f.payload(0, 100));
        let outcome = cache.reclaim_until_under_ceiling();
        assert_eq!(
            outcome,
            ReclaimOutcome::OverCeiling {
                evicted: 0,
                freed_bytes: 0,
                pinned_bytes: 2 * unit
            }
        );
        assert!(f.resident(0) && f.resident(1));
        assert!(cache.stats().over_ceiling_events >= 1);

        f.registry.remove_all_for_client(client);
        assert!(!cache.reclaim_until_under_ceiling().is_over_ceiling());
        assert_eq!(cache.resident_bytes(), unit);
    }

    #[test]
    fn shared_voxel_stays_until_last_client_leaves() {
        let f = Fixture::new();
        let unit = f.payload(0, 100).byte_size();
        let cache = f.cache(unit);
        let (a, b) = (ClientId(1), ClientId(2));
        let v = f.nodes[3];

        f.registry.set_query_state(a, v, ClientQueryState::visible(Lod(0)));
        f.registry.set_query_state(b, v, ClientQueryState::visible(Lod(0)));
        cache.insert(v, f.payload(0, 100));

        f.registry.remove_all_for_client(a);
        cache.advance_iteration();
        cache.insert(f.nodes[4], f.payload(0, 100));
        assert!(f.resident(3));

        f.registry.remove_all_for_client(b);
        cache.advance_iteration();
        cache.insert(f.nodes[5], f.payload(0, 100));
        assert!(!f.resident(3));
    }

    #[test]
    fn low_water_ratio_reclaims_below_ceiling() {
        let f = Fixture::new();
        let unit = f.payload(0, 100).byte_size();
        let cache = EvictionCache::new(
            CacheConfig {
                ceiling_bytes: 4 * unit,
                low_water_ratio: 0.5,
            },
            f.tree.clone(),
            f.registry.clone(),
        );
        for &node in &f.nodes[..5] {
            cache.advance_iteration();
            cache.insert(node, f.payload(0, 100));
        }
        assert_eq!(cache.resident_bytes(), 2 * unit);
    }

    #[test]
    fn finer_payload_shrinks_once_no_client_wants_it() {
        let f = Fixture::new();
        let cache = f.cache(u64::MAX);
        let (a, b) = (ClientId(1), ClientId(2));
        let v = f.nodes[0];

        f.registry.set_query_state(a, v, ClientQueryState::visible(Lod(2)));
        f.registry.set_query_state(b, v, ClientQueryState::visible(Lod(0)));
        cache.insert(v, f.payload(2, 400));
        let full_bytes = cache.resident_bytes();

        // One client still wants the finest level.
        assert_eq!(cache.coarsen_to_requests(v), None);

        f.registry.set_query_state(a, v, ClientQueryState::visible(Lod(1)));
        let (lod, freed) = cache.coarsen_to_requests(v).unwrap();
        assert_eq!(lod, Lod(1));
        assert_eq!(cache.resident_lod(v), Some(Lod(1)));
        assert_eq!(f.tree.node(v).unwrap().payload().unwrap().len(), 200);
        assert_eq!(cache.resident_bytes(), full_bytes - freed);
        assert_eq!(
            cache.resident_bytes(),
            f.tree.node(v).unwrap().payload().unwrap().byte_size()
        );
        assert_eq!(cache.stats().coarsened, 1);

        // Without any client the payload is left for eviction.
        f.registry.remove_all_for_client(a);
        f.registry.remove_all_for_client(b);
        assert_eq!(cache.coarsen_to_requests(v), None);
        assert_eq!(cache.resident_lod(v), Some(Lod(1)));
    }

    #[test]
    fn reclaim_coarsens_pinned_payloads_before_giving_up() {
        let f = Fixture::new();
        let fine = f.payload(2, 400).byte_size();
        let coarse = f.payload(0, 100).byte_size();
        let cache = f.cache(fine);
        let client = ClientId(3);

        f.registry
            .set_query_state(client, f.nodes[0], ClientQueryState::visible(Lod(2)));
        f.registry
            .set_query_state(client, f.nodes[1], ClientQueryState::visible(Lod(0)));
        cache.insert(f.nodes[0], f.payload(2, 400));
        f.registry
            .set_query_state(client, f.nodes[0], ClientQueryState::visible(Lod(0)));

        let (_, reclaim) = cache.insert(f.nodes[1], f.payload(0, 100));
        assert!(!reclaim.is_over_ceiling());
        assert_eq!(reclaim.evicted(), 0);
        assert!(f.resident(0) && f.resident(1));
        assert_eq!(cache.resident_lod(f.nodes[0]), Some(Lod(0)));
        assert_eq!(cache.resident_bytes(), 2 * coarse);
    }
}
