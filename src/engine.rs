use crate::Config;

use pointstream_cloud::core::geometry::Aabb;
use pointstream_cloud::core::SmallKeyHashMap;
use pointstream_cloud::source::{OpenMode, SourceRegistry};
use pointstream_cloud::{
    CacheStats, ClientId, ClientQueryState, Container, DensityPolicy, EvictionCache, FetchHandle, FetchOutcome, Lod,
    NodeId, Payload, QueryStateRegistry, QueryView, ReclaimOutcome, RequestOutcome, SchedulerStats, SourcePool, Status,
    StreamScheduler, VisitCommand, VoxelKey, VoxelTree, VoxelView,
};

use float_ord::FloatOrd;
use itertools::Itertools;
use parking_lot::{Mutex, RwLock};
use std::cmp::Reverse;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

type SharedPolicy = Arc<Mutex<Box<dyn DensityPolicy>>>;

/// What one [`Engine::query`] did.
#[derive(Clone, Default)]
pub struct QueryReport {
    /// Leaf voxels intersecting the query area.
    pub visited: usize,
    /// Voxels already holding the desired level.
    pub resident: usize,
    /// Resident voxels truncated to a coarser level because no client wanted the finer one any more.
    pub coarsened: usize,
    pub queued: usize,
    pub coalesced: usize,
    pub unavailable: usize,
    /// Query states this client dropped, either outside the area or no longer needed.
    pub released: usize,
    pub dispatched: usize,
    /// One handle per queued or coalesced fetch.
    pub fetches: Vec<FetchHandle>,
}

impl QueryReport {
    /// Blocks until every fetch of this query finished, or `timeout` passes. Returns the outcomes in `fetches` order, or
    /// `None` on timeout.
    pub fn wait_all(&self, timeout: Duration) -> Option<Vec<FetchOutcome>> {
        let deadline = Instant::now() + timeout;
        self.fetches
            .iter()
            .map(|h| h.wait_timeout(deadline.saturating_duration_since(Instant::now())))
            .collect()
    }
}

/// What one [`Engine::pump`] did.
#[derive(Clone, Copy, Debug)]
pub struct PumpReport {
    pub iteration: u64,
    /// Failed fetches reported to client policies.
    pub failures: usize,
    pub cancelled: usize,
    pub dispatched: usize,
    pub reclaim: ReclaimOutcome,
    pub cache: CacheStats,
    pub scheduler: SchedulerStats,
}

/// The context every streaming operation goes through. Open one per container.
pub struct Engine {
    config: Config,
    url: String,
    container: Arc<Container>,
    tree: Arc<VoxelTree>,
    registry: Arc<QueryStateRegistry>,
    cache: Arc<EvictionCache>,
    scheduler: StreamScheduler,
    clients: RwLock<SmallKeyHashMap<ClientId, SharedPolicy>>,
    next_client: AtomicU32,
}

impl Engine {
    /// Opens the container at `url` with the backend `sources` registers for its scheme.
    pub fn open(config: Config, sources: &SourceRegistry, url: &str) -> Result<Self, Status> {
        config.cache.validate()?;
        config.scheduler.validate()?;

        let opener = sources.opener(url, OpenMode::Read)?;
        let mut source = opener.open()?;
        let container = Arc::new(Container::read(&mut *source)?);
        let tree = Arc::new(VoxelTree::new(*container.bounds()));
        let registry = Arc::new(QueryStateRegistry::default());
        let cache = Arc::new(EvictionCache::new(config.cache, tree.clone(), registry.clone()));
        let scheduler = StreamScheduler::new(
            config.scheduler,
            container.clone(),
            SourcePool::new(opener, config.scheduler.worker_threads).with_source(source),
            tree.clone(),
            registry.clone(),
            cache.clone(),
        )?;

        log::info!(
            "Opened {}: {} points in {} voxels, {} LODs",
            url,
            container.total_points(),
            container.index().voxels.len(),
            container.num_lods()
        );

        Ok(Self {
            config,
            url: url.to_owned(),
            container,
            tree,
            registry,
            cache,
            scheduler,
            clients: RwLock::new(SmallKeyHashMap::default()),
            next_client: AtomicU32::new(1),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn tree(&self) -> &VoxelTree {
        &self.tree
    }

    pub fn registry(&self) -> &QueryStateRegistry {
        &self.registry
    }

    pub fn cache(&self) -> &EvictionCache {
        &self.cache
    }

    pub fn scheduler(&self) -> &StreamScheduler {
        &self.scheduler
    }

    pub fn connect(&self, policy: impl DensityPolicy + 'static) -> ClientId {
        let client = ClientId(self.next_client.fetch_add(1, Ordering::Relaxed));
        self.clients
            .write()
            .insert(client, Arc::new(Mutex::new(Box::new(policy))));
        log::debug!("Connected {:?}", client);
        client
    }

    /// Replaces the policy of `client`. Takes effect on its next query.
    pub fn set_policy(&self, client: ClientId, policy: impl DensityPolicy + 'static) -> Result<(), Status> {
        let shared = self.policy_of(client)?;
        *shared.lock() = Box::new(policy);
        Ok(())
    }

    /// Drops `client` and everything it needed. Its in-flight fetches still complete, but the voxels become eviction
    /// candidates as soon as no other client needs them.
    pub fn disconnect(&self, client: ClientId) -> usize {
        self.clients.write().remove(&client);
        let removed = self.registry.remove_all_for_client(client);
        log::debug!("Disconnected {:?}, released {} query states", client, removed);
        removed
    }

    pub fn is_connected(&self, client: ClientId) -> bool {
        self.clients.read().contains_key(&client)
    }

    fn policy_of(&self, client: ClientId) -> Result<SharedPolicy, Status> {
        self.clients
            .read()
            .get(&client)
            .cloned()
            .ok_or(Status::Unsupported("unknown client"))
    }

    /// Resolves the level of detail `client` needs for every leaf voxel in `area`, records it, and requests whatever is not
    /// resident yet. State the client held outside `area` is released. Never waits for I/O.
    pub fn query(&self, client: ClientId, area: &Aabb) -> Result<QueryReport, Status> {
        let shared = self.policy_of(client)?;
        let mut policy = shared.lock();
        let iteration = self.cache.iteration();
        let num_lods = self.container.num_lods();
        let mut report = QueryReport::default();

        let mut leaves = Vec::new();
        self.tree.visit_depth_first(self.tree.root(), |id, node| {
            if !node.bounds().intersects(area) {
                report.released += self.registry.remove_subtree_for_client(&self.tree, client, id);
                return VisitCommand::SkipDescendants;
            }
            let record = match self.container.record(node.key()) {
                Some(record) => record,
                None => return VisitCommand::SkipDescendants,
            };
            if record.is_leaf() {
                leaves.push((id, record.point_count));
                return VisitCommand::SkipDescendants;
            }
            for octant in (0..8).filter(|&o| record.has_child(o)) {
                self.tree.get_or_create_child(id, octant);
            }
            VisitCommand::Continue
        });

        let query = QueryView {
            client,
            area: *area,
            iteration,
            candidate_points: leaves.iter().map(|&(_, points)| points).sum(),
            num_lods,
        };
        policy.begin_query(&query);

        let mut wanted = Vec::new();
        for (id, full_point_count) in leaves {
            let node = match self.tree.node(id) {
                Some(node) => node,
                None => continue,
            };
            let view = VoxelView {
                node: id,
                key: node.key(),
                bounds: *node.bounds(),
                full_point_count,
                num_lods,
                resident_lod: node.resident_lod(),
                last_touched: node.last_touched(),
                iteration,
            };
            policy.pre_query(&view);
            let amount = policy.lod_amount(&view);
            policy.post_query(&view, amount);
            report.visited += 1;

            let lod = match Lod::from_amount(amount, num_lods) {
                Some(lod) => lod,
                None => {
                    if self.registry.remove_query_state(client, id).is_some() {
                        report.released += 1;
                    }
                    continue;
                }
            };
            self.registry
                .set_query_state(client, id, ClientQueryState::visible(lod));
            if view.resident_lod.is_some() {
                self.cache.touch(id);
            }
            if view.resident_lod.map_or(false, |resident| resident >= lod) {
                report.resident += 1;
                if view.resident_lod != Some(lod) && self.cache.coarsen_to_requests(id).is_some() {
                    report.coarsened += 1;
                }
            } else {
                wanted.push((amount, id, view.key, lod));
            }
        }

        // Densest first.
        for (_, id, key, lod) in wanted
            .into_iter()
            .sorted_by_key(|&(amount, ..)| Reverse(FloatOrd(amount)))
        {
            match self.scheduler.request(client, id, lod) {
                RequestOutcome::AlreadyResident(_) => report.resident += 1,
                RequestOutcome::Coalesced(handle) => {
                    report.coalesced += 1;
                    report.fetches.push(handle);
                }
                RequestOutcome::Queued(handle) => {
                    report.queued += 1;
                    report.fetches.push(handle);
                }
                RequestOutcome::Unavailable(status) => {
                    log::debug!("{:?} at {:?} is unavailable: {}", key, lod, status);
                    report.unavailable += 1;
                    policy.lod_unavailable(key, lod);
                }
            }
        }
        policy.end_query(&query);
        drop(policy);

        report.dispatched = self.scheduler.dispatch();
        Ok(report)
    }

    /// Releases the state `client` holds for voxels overlapping `area`. Returns how many states were removed.
    pub fn remove_query_region(&self, client: ClientId, area: &Aabb) -> usize {
        let mut removed = 0;
        self.tree.visit_depth_first(self.tree.root(), |id, node| {
            if !node.bounds().intersects(area) {
                return VisitCommand::SkipDescendants;
            }
            if area.contains(node.bounds()) || !node.has_children() {
                removed += self.registry.remove_subtree_for_client(&self.tree, client, id);
                return VisitCommand::SkipDescendants;
            }
            VisitCommand::Continue
        });
        removed
    }

    /// Advances the engine by one iteration: reports failed fetches to the policies that asked for them, drops queued
    /// fetches nobody wants, starts queued ones and reclaims memory.
    pub fn pump(&self) -> PumpReport {
        let iteration = self.cache.advance_iteration();

        let failures = self.scheduler.take_failures();
        for failure in &failures {
            for &client in &failure.requesters {
                if let Ok(shared) = self.policy_of(client) {
                    shared.lock().lod_unavailable(failure.key, failure.lod);
                }
            }
        }

        let cancelled = self.scheduler.cancel_unwanted();
        let dispatched = self.scheduler.dispatch();
        let reclaim = self.cache.reclaim_until_under_ceiling();

        PumpReport {
            iteration,
            failures: failures.len(),
            cancelled,
            dispatched,
            reclaim,
            cache: self.cache.stats(),
            scheduler: self.scheduler.stats(),
        }
    }

    /// The resident payload of `node`, if any. Counts as an access for eviction purposes.
    pub fn payload(&self, node: NodeId) -> Option<Arc<Payload>> {
        let payload = self.tree.node(node)?.payload()?;
        self.cache.touch(node);
        Some(payload)
    }

    pub fn find(&self, key: VoxelKey) -> Option<NodeId> {
        self.tree.find(key)
    }

    /// Blocks until no fetch is pending, or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    /// Cancels queued fetches, waits for in-flight ones, and releases every resident payload.
    pub fn teardown(mut self) -> CacheStats {
        self.scheduler.shutdown();
        let clients: Vec<ClientId> = self.clients.write().drain().map(|(client, _)| client).collect();
        for client in clients {
            self.registry.remove_all_for_client(client);
        }
        let stats = self.cache.stats();
        self.cache.clear();
        log::info!(
            "Closed {}: {} inserts, {} evictions",
            self.url,
            stats.inserts,
            stats.evictions
        );
        stats
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
