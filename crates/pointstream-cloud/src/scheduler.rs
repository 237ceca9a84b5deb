//! Asynchronous voxel fetches.
//!
//! Each `(node, LOD)` moves through `Idle -> Requested -> InFlight -> Completed | Failed -> Idle`. Requests only touch the
//! fetch table and return at once; reads and decodes run on a fixed-size worker pool, and a worker that finishes a fetch
//! dispatches the next queued ones itself.

mod handle;

pub use handle::{FetchHandle, FetchKey, FetchOutcome};

use handle::Completion;

use crate::config::SchedulerConfig;
use crate::{
    ClientId, Container, EvictionCache, InsertOutcome, Lod, NodeId, Payload,
    QueryStateRegistry, SourcePool, Status, VoxelKey, VoxelTree,
};

use bevy_tasks::{TaskPool, TaskPoolBuilder};
use parking_lot::{Condvar, Mutex};
use pointstream_core::work_timer::WorkTimer;
use pointstream_core::{SmallKeyHashMap, SmallKeyHashSet};
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// The result of [`StreamScheduler::request`].
pub enum RequestOutcome {
    /// The node already holds this LOD or a finer one.
    AlreadyResident(Lod),
    /// A fetch for the same `(node, LOD)` was already pending; the requester shares its completion.
    Coalesced(FetchHandle),
    Queued(FetchHandle),
    /// The LOD cannot be fetched: the container has no such blob, the blob is known to be corrupt, or the scheduler is
    /// shutting down.
    Unavailable(Status),
}

impl RequestOutcome {
    pub fn handle(&self) -> Option<&FetchHandle> {
        match self {
            Self::Coalesced(h) | Self::Queued(h) => Some(h),
            _ => None,
        }
    }
}

/// A fetch that failed for good. Delivered to the density policies of its requesters.
#[derive(Clone, Debug)]
pub struct FetchFailure {
    pub node: NodeId,
    pub key: VoxelKey,
    pub lod: Lod,
    pub status: Status,
    pub requesters: SmallVec<[ClientId; 2]>,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SchedulerStats {
    pub requested: u64,
    pub coalesced: u64,
    pub dispatched: u64,
    pub completed: u64,
    pub superseded: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub failed: u64,
    pub corrupt_blobs: u64,
    pub pending: usize,
    pub in_flight: usize,
    pub average_fetch_us: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum FetchState {
    Requested,
    InFlight,
}

struct PendingFetch {
    key: VoxelKey,
    state: FetchState,
    attempts: u32,
    requesters: SmallVec<[ClientId; 2]>,
    completion: Arc<Completion>,
}

#[derive(Default)]
struct FetchTable {
    pending: SmallKeyHashMap<FetchKey, PendingFetch>,
    queue: VecDeque<FetchKey>,
    in_flight: usize,
    /// Spawned tasks that have not finished, including their follow-up dispatch.
    active_tasks: usize,
    corrupt: SmallKeyHashSet<FetchKey>,
    failures: Vec<FetchFailure>,
    stopped: bool,
    stats: SchedulerStats,
}

struct SchedulerShared {
    config: SchedulerConfig,
    container: Arc<Container>,
    /// One source per concurrent read; a single cursor would serialize every worker behind it.
    sources: SourcePool,
    tree: Arc<VoxelTree>,
    registry: Arc<QueryStateRegistry>,
    cache: Arc<EvictionCache>,
    /// Workers must never own the pool, or the last worker to finish could end up joining itself.
    pool: Weak<TaskPool>,
    table: Mutex<FetchTable>,
    drained: Condvar,
    timer: WorkTimer,
}

enum Resolution {
    Retry,
    Finish(FetchOutcome),
}

pub struct StreamScheduler {
    shared: Arc<SchedulerShared>,
    pool: Option<Arc<TaskPool>>,
}

impl StreamScheduler {
    pub fn new(
        config: SchedulerConfig,
        container: Arc<Container>,
        sources: SourcePool,
        tree: Arc<VoxelTree>,
        registry: Arc<QueryStateRegistry>,
        cache: Arc<EvictionCache>,
    ) -> Result<Self, Status> {
        config.validate()?;
        let pool = Arc::new(
            TaskPoolBuilder::new()
                .num_threads(config.worker_threads)
                .thread_name("pointstream-fetch".to_string())
                .build(),
        );
        let shared = Arc::new(SchedulerShared {
            config,
            container,
            sources,
            tree,
            registry,
            cache,
            pool: Arc::downgrade(&pool),
            table: Mutex::new(FetchTable::default()),
            drained: Condvar::new(),
            timer: WorkTimer::default(),
        });
        Ok(Self {
            shared,
            pool: Some(pool),
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Asks for `node` to become resident at `lod` on behalf of `client`.
    ///
    /// Never blocks on I/O. The request is only queued; it starts on the next [`dispatch`](Self::dispatch).
    pub fn request(&self, client: ClientId, node: NodeId, lod: Lod) -> RequestOutcome {
        let shared = &self.shared;
        let voxel = match shared.tree.node(node) {
            Some(n) => {
                if let Some(resident) = n.resident_lod().filter(|&r| r >= lod) {
                    return RequestOutcome::AlreadyResident(resident);
                }
                n.key()
            }
            None => return RequestOutcome::Unavailable(Status::Unsupported("unknown voxel node")),
        };
        if let Err(e) = shared.container.blob_range(voxel, lod) {
            return RequestOutcome::Unavailable(e);
        }

        let key = FetchKey { node, lod };
        let mut guard = shared.table.lock();
        let table = &mut *guard;
        if table.stopped {
            return RequestOutcome::Unavailable(Status::NotOpen);
        }
        if table.corrupt.contains(&key) {
            return RequestOutcome::Unavailable(Status::corrupt(format!(
                "blob for {:?} at {:?} failed to decode earlier",
                voxel, lod
            )));
        }
        table.stats.requested += 1;

        if let Some(pending) = table.pending.get_mut(&key) {
            if !pending.requesters.contains(&client) {
                pending.requesters.push(client);
            }
            table.stats.coalesced += 1;
            log::trace!(
                "Coalesced {:?} request for {:?} at {:?} ({:?})",
                client,
                voxel,
                lod,
                pending.state
            );
            return RequestOutcome::Coalesced(FetchHandle::new(key, pending.completion.clone()));
        }

        let completion = Arc::new(Completion::default());
        let mut requesters = SmallVec::new();
        requesters.push(client);
        table.pending.insert(
            key,
            PendingFetch {
                key: voxel,
                state: FetchState::Requested,
                attempts: 0,
                requesters,
                completion: completion.clone(),
            },
        );
        table.queue.push_back(key);
        RequestOutcome::Queued(FetchHandle::new(key, completion))
    }

    /// Starts queued fetches up to the in-flight limit, cancelling any that no client wants any more. Returns how many
    /// started.
    pub fn dispatch(&self) -> usize {
        match self.shared.pool.upgrade() {
            Some(pool) => self.shared.dispatch(&pool),
            None => 0,
        }
    }

    /// Drops queued fetches that no client wants, without waiting for their turn. Returns how many were cancelled.
    pub fn cancel_unwanted(&self) -> usize {
        let shared = &self.shared;
        let mut cancelled = Vec::new();
        {
            let mut guard = shared.table.lock();
            let table = &mut *guard;
            let unwanted: Vec<FetchKey> = table
                .pending
                .iter()
                .filter(|(key, p)| p.state == FetchState::Requested && !shared.is_wanted(**key))
                .map(|(key, _)| *key)
                .collect();
            for key in unwanted {
                if let Some(p) = table.pending.remove(&key) {
                    cancelled.push(p.completion);
                }
            }
            let pending = &table.pending;
            table.queue.retain(|key| pending.contains_key(key));
            table.stats.cancelled += cancelled.len() as u64;
        }
        for completion in &cancelled {
            completion.complete(FetchOutcome::Cancelled);
        }
        cancelled.len()
    }

    /// Failures recorded since the last call.
    pub fn take_failures(&self) -> Vec<FetchFailure> {
        std::mem::take(&mut self.shared.table.lock().failures)
    }

    pub fn is_pending(&self, node: NodeId, lod: Lod) -> bool {
        self.shared
            .table
            .lock()
            .pending
            .contains_key(&FetchKey { node, lod })
    }

    pub fn stats(&self) -> SchedulerStats {
        let table = self.shared.table.lock();
        SchedulerStats {
            pending: table.pending.len(),
            in_flight: table.in_flight,
            average_fetch_us: self.shared.timer.average_time_us(),
            ..table.stats
        }
    }

    /// Blocks until no fetch is pending or in flight, or `timeout` passes. Returns `true` if everything settled.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut table = self.shared.table.lock();
        while !(table.pending.is_empty() && table.active_tasks == 0) {
            if self.shared.drained.wait_until(&mut table, deadline).timed_out() {
                return table.pending.is_empty() && table.active_tasks == 0;
            }
        }
        true
    }

    /// Cancels queued fetches, waits for in-flight ones to finish, and stops the worker pool.
    pub fn shutdown(&mut self) {
        let pool = match self.pool.take() {
            Some(pool) => pool,
            None => return,
        };
        let cancelled: Vec<_> = {
            let mut guard = self.shared.table.lock();
            let table = &mut *guard;
            table.stopped = true;
            table.queue.clear();
            let queued: Vec<FetchKey> = table
                .pending
                .iter()
                .filter(|(_, p)| p.state == FetchState::Requested)
                .map(|(key, _)| *key)
                .collect();
            queued
                .into_iter()
                .filter_map(|key| table.pending.remove(&key))
                .map(|p| p.completion)
                .collect()
        };
        for completion in cancelled {
            completion.complete(FetchOutcome::Cancelled);
        }

        let mut table = self.shared.table.lock();
        while table.active_tasks > 0 {
            self.shared.drained.wait(&mut table);
        }
        drop(table);
        drop(pool);
        log::debug!("Stream scheduler stopped");
    }
}

impl Drop for StreamScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl SchedulerShared {
    /// A fetch is wanted while some client asks for at least its LOD and the node does not already hold it.
    fn is_wanted(&self, key: FetchKey) -> bool {
        let requested = self
            .registry
            .max_requested_lod(key.node)
            .map_or(false, |max| max >= key.lod);
        let resident = self
            .tree
            .node(key.node)
            .and_then(|n| n.resident_lod())
            .map_or(false, |r| r >= key.lod);
        requested && !resident
    }

    fn dispatch(self: &Arc<Self>, pool: &TaskPool) -> usize {
        let mut started = Vec::new();
        let mut cancelled = Vec::new();
        {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            while !table.stopped && table.in_flight < self.config.max_in_flight {
                let key = match table.queue.pop_front() {
                    Some(key) => key,
                    None => break,
                };
                if !self.is_wanted(key) {
                    if let Some(p) = table.pending.remove(&key) {
                        log::debug!("Cancelled fetch of {:?} at {:?}: no longer wanted", p.key, key.lod);
                        table.stats.cancelled += 1;
                        cancelled.push(p.completion);
                    }
                    continue;
                }
                let pending = match table.pending.get_mut(&key) {
                    Some(p) => p,
                    None => continue,
                };
                pending.state = FetchState::InFlight;
                pending.attempts += 1;
                table.in_flight += 1;
                table.active_tasks += 1;
                table.stats.dispatched += 1;
                started.push((key, pending.key, pending.attempts));
            }
        }
        for completion in cancelled {
            completion.complete(FetchOutcome::Cancelled);
        }

        let count = started.len();
        for (key, voxel, attempt) in started {
            log::debug!("Dispatching fetch of {:?} at {:?} (attempt {})", voxel, key.lod, attempt);
            let shared = self.clone();
            pool.spawn(async move { shared.run_fetch(key, voxel, attempt) })
                .detach();
        }
        count
    }

    fn fetch(&self, voxel: VoxelKey, lod: Lod) -> Result<Payload, Status> {
        let mut source = self.sources.checkout()?;
        let bytes = match self.container.read_blob(&mut *source, voxel, lod) {
            Ok(bytes) => bytes,
            Err(e) => {
                // A source that merely has no data yet is still good.
                if !matches!(e, Status::Io { kind: io::ErrorKind::WouldBlock, .. }) {
                    source.discard();
                }
                return Err(e);
            }
        };
        drop(source);
        self.container.decode_payload(voxel, lod, &bytes)
    }

    fn run_fetch(self: Arc<Self>, key: FetchKey, voxel: VoxelKey, attempt: u32) {
        let start = Instant::now();
        let result = self.fetch(voxel, key.lod);
        self.timer.complete_item(start.elapsed());

        let resolution = match result {
            Ok(payload) => match self.cache.insert(key.node, Arc::new(payload)).0 {
                InsertOutcome::Inserted | InsertOutcome::Replaced { .. } => {
                    Resolution::Finish(FetchOutcome::Completed { lod: key.lod })
                }
                InsertOutcome::Superseded { resident } => {
                    Resolution::Finish(FetchOutcome::Superseded { resident })
                }
                InsertOutcome::UnknownNode => Resolution::Finish(FetchOutcome::Failed(
                    Status::Unsupported("unknown voxel node"),
                )),
            },
            Err(e) if e.is_retryable() && attempt < self.config.max_fetch_attempts => {
                log::warn!(
                    "Fetch of {:?} at {:?} failed (attempt {} of {}), retrying: {}",
                    voxel,
                    key.lod,
                    attempt,
                    self.config.max_fetch_attempts,
                    e
                );
                Resolution::Retry
            }
            Err(e) => {
                if let Status::CorruptPayload(_) = e {
                    log::error!("Corrupt blob for {:?} at {:?}: {}", voxel, key.lod, e);
                } else {
                    log::warn!(
                        "Giving up on {:?} at {:?} after {} attempts: {}",
                        voxel,
                        key.lod,
                        attempt,
                        e
                    );
                }
                Resolution::Finish(FetchOutcome::Failed(e))
            }
        };

        let completion = {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            table.in_flight -= 1;
            match resolution {
                Resolution::Retry => {
                    if let Some(p) = table.pending.get_mut(&key) {
                        p.state = FetchState::Requested;
                        table.queue.push_back(key);
                        table.stats.retried += 1;
                    }
                    None
                }
                Resolution::Finish(outcome) => {
                    let pending = table.pending.remove(&key);
                    match &outcome {
                        FetchOutcome::Completed { .. } => table.stats.completed += 1,
                        FetchOutcome::Superseded { .. } => table.stats.superseded += 1,
                        FetchOutcome::Failed(status) => {
                            table.stats.failed += 1;
                            if let Status::CorruptPayload(_) = status {
                                table.corrupt.insert(key);
                                table.stats.corrupt_blobs += 1;
                            }
                            if let Some(p) = &pending {
                                table.failures.push(FetchFailure {
                                    node: key.node,
                                    key: voxel,
                                    lod: key.lod,
                                    status: status.clone(),
                                    requesters: p.requesters.clone(),
                                });
                            }
                        }
                        FetchOutcome::Cancelled => table.stats.cancelled += 1,
                    }
                    pending.map(|p| (p.completion, outcome))
                }
            }
        };
        if let Some((completion, outcome)) = completion {
            completion.complete(outcome);
        }

        if let Some(pool) = self.pool.upgrade() {
            self.dispatch(&pool);
        }

        let mut table = self.table.lock();
        table.active_tasks -= 1;
        self.drained.notify_all();
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

    use crate::config::{BuildConfig, CacheConfig};
    use crate::source::{DataSource, OpenMode, SourceForm, SourceOpener};
    use crate::{ClientQueryState, ContainerBuilder, PointSet};

    use pointstream_core::glam::DVec3;
    use std::io;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(10);
    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    /// Serves container bytes from memory, counting blob reads and failing on demand.
    struct MockSource {
        bytes: Arc<Vec<u8>>,
        position: u64,
        reads: Arc<AtomicUsize>,
        failures_left: Arc<AtomicU32>,
        corrupt: bool,
        delay: Duration,
    }

    impl DataSource for MockSource {
        fn open(&mut self, _url: &str, _mode: OpenMode) -> Result<(), Status> {
            Ok(())
        }
        fn close(&mut self) {}
        fn is_open(&self) -> bool {
            true
        }
        fn form(&self) -> SourceForm {
            SourceForm::Remote
        }
        fn read(&mut self, buf: &mut [u8]) -> Result<usize, Status> {
            let start = (self.position as usize).min(self.bytes.len());
            let n = buf.len().min(self.bytes.len() - start);
            buf[..n].copy_from_slice(&self.bytes[start..start + n]);
            self.position += n as u64;
            Ok(n)
        }
        fn write(&mut self, _buf: &[u8]) -> Result<usize, Status> {
            Err(Status::Unsupported("read-only mock"))
        }
        fn move_to(&mut self, position: u64) -> Result<(), Status> {
            self.position = position;
            Ok(())
        }
        fn size(&self) -> Result<u64, Status> {
            Ok(self.bytes.len() as u64)
        }
        fn read_exact_at(&mut self, position: u64, buf: &mut [u8]) -> Result<(), Status> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err(Status::io(io::ErrorKind::TimedOut, "mock timeout"));
            }
            self.move_to(position)?;
            let n = self.read(buf)?;
            if self.corrupt {
                buf.iter_mut().for_each(|b| *b = !*b);
            }
            assert_eq!(n, buf.len());
            Ok(())
        }
    }

    struct Fixture {
        container: Arc<Container>,
        tree: Arc<VoxelTree>,
        registry: Arc<QueryStateRegistry>,
        cache: Arc<EvictionCache>,
        reads: Arc<AtomicUsize>,
        failures_left: Arc<AtomicU32>,
        opened: Arc<AtomicUsize>,
        scheduler: StreamScheduler,
        root: NodeId,
    }

    impl Fixture {
        fn new(delay: Duration, corrupt: bool) -> Self {
            Self::with_workers(delay, corrupt, 2)
        }

        fn with_workers(delay: Duration, corrupt: bool, workers: usize) -> Self {
            let positions = (0..300)
                .map(|i| DVec3::new((i % 7) as f64, (i % 11) as f64, (i % 13) as f64))
                .collect();
            let config = BuildConfig {
                num_lods: 3,
                leaf_capacity: 1000,
                ..Default::default()
            };
            let (bytes, _) = ContainerBuilder::new(config)
                .build(&PointSet::new(positions))
                .unwrap();
            let bytes = Arc::new(bytes);

            let reads = Arc::new(AtomicUsize::new(0));
            let failures_left = Arc::new(AtomicU32::new(0));
            let opened = Arc::new(AtomicUsize::new(0));
            let mock = {
                let (bytes, reads, failures_left) = (bytes.clone(), reads.clone(), failures_left.clone());
                move |corrupt, delay| MockSource {
                    bytes: bytes.clone(),
                    position: 0,
                    reads: reads.clone(),
                    failures_left: failures_left.clone(),
                    corrupt,
                    delay,
                }
            };
            let container = Arc::new(Container::read(&mut mock(false, Duration::ZERO)).unwrap());
            reads.store(0, Ordering::SeqCst);
            let o = opened.clone();
            let opener = SourceOpener::from_fn("mem://scan", OpenMode::Read, move || {
                o.fetch_add(1, Ordering::SeqCst);
                Box::new(mock(corrupt, delay))
            });

            let tree = Arc::new(VoxelTree::new(*container.bounds()));
            let registry = Arc::new(QueryStateRegistry::default());
            let cache = Arc::new(EvictionCache::new(
                CacheConfig::default(),
                tree.clone(),
                registry.clone(),
            ));
            let scheduler = StreamScheduler::new(
                SchedulerConfig {
                    worker_threads: workers,
                    ..Default::default()
                },
                container.clone(),
                SourcePool::new(opener, workers),
                tree.clone(),
                registry.clone(),
                cache.clone(),
            )
            .unwrap();
            let root = tree.root();
            Self {
                container,
                tree,
                registry,
                cache,
                reads,
                failures_left,
                opened,
                scheduler,
                root,
            }
        }

        fn want(&self, client: ClientId, lod: Lod) {
            self.registry
                .set_query_state(client, self.root, ClientQueryState::visible(lod));
        }

        fn fetch(&self, client: ClientId, lod: Lod) -> FetchOutcome {
            self.want(client, lod);
            let outcome = self.scheduler.request(client, self.root, lod);
            let handle = outcome.handle().cloned().unwrap();
            self.scheduler.dispatch();
            handle.wait_timeout(WAIT).unwrap()
        }

        fn resident_lod(&self) -> Option<Lod> {
            self.tree.node(self.root).unwrap().resident_lod()
        }
    }

    #[test]
    fn request_moves_through_to_completed() {
        let f = Fixture::new(Duration::ZERO, false);
        assert_eq!(f.fetch(A, Lod(0)), FetchOutcome::Completed { lod: Lod(0) });
        assert_eq!(f.resident_lod(), Some(Lod(0)));

        assert_eq!(f.fetch(A, Lod(2)), FetchOutcome::Completed { lod: Lod(2) });
        let payload = f.tree.node(f.root).unwrap().payload().unwrap();
        assert_eq!(payload.lod(), Lod(2));
        assert_eq!(payload.len(), 300);
        assert_eq!(f.cache.resident_lod(f.root), Some(Lod(2)));

        assert!(matches!(
            f.scheduler.request(A, f.root, Lod(1)),
            RequestOutcome::AlreadyResident(Lod(2))
        ));
        assert!(matches!(
            f.scheduler.request(A, f.root, Lod(3)),
            RequestOutcome::Unavailable(Status::MissingBlob { .. })
        ));
        assert!(f.scheduler.wait_idle(WAIT));
        let stats = f.scheduler.stats();
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.pending, 0);
        assert_eq!(f.reads.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn duplicate_requests_read_once() {
        let f = Fixture::new(Duration::from_millis(50), false);
        f.want(A, Lod(1));
        f.want(B, Lod(1));

        let first = f.scheduler.request(A, f.root, Lod(1));
        assert!(matches!(first, RequestOutcome::Queued(_)));
        assert!(matches!(
            f.scheduler.request(B, f.root, Lod(1)),
            RequestOutcome::Coalesced(_)
        ));
        f.scheduler.dispatch();

        // More requests race with the in-flight read.
        let handles: Vec<FetchHandle> = crossbeam::scope(|s| {
            let workers: Vec<_> = (0..4)
                .map(|i| {
                    let scheduler = &f.scheduler;
                    let root = f.root;
                    s.spawn(move |_| {
                        let client = if i % 2 == 0 { A } else { B };
                        match scheduler.request(client, root, Lod(1)) {
                            RequestOutcome::Coalesced(h) => Some(h),
                            _ => None,
                        }
                    })
                })
                .collect();
            workers.into_iter().filter_map(|w| w.join().unwrap()).collect()
        })
        .unwrap();

        let expected = FetchOutcome::Completed { lod: Lod(1) };
        assert_eq!(first.handle().unwrap().wait_timeout(WAIT), Some(expected.clone()));
        for h in handles {
            assert_eq!(h.wait_timeout(WAIT), Some(expected.clone()));
        }
        assert!(f.scheduler.wait_idle(WAIT));
        assert_eq!(f.reads.load(Ordering::SeqCst), 1);
        assert!(f.scheduler.stats().coalesced >= 1);
    }

    #[test]
    fn workers_read_in_parallel_through_separate_sources() {
        let delay = Duration::from_millis(300);
        let f = Fixture::with_workers(delay, false, 3);
        f.want(A, Lod(2));

        let start = Instant::now();
        let handles: Vec<FetchHandle> = (0..3)
            .map(|lod| f.scheduler.request(A, f.root, Lod(lod)).handle().cloned().unwrap())
            .collect();
        assert_eq!(f.scheduler.dispatch(), 3);
        for h in &handles {
            let outcome = h.wait_timeout(WAIT).unwrap();
            assert!(
                matches!(outcome, FetchOutcome::Completed { .. } | FetchOutcome::Superseded { .. }),
                "{:?}",
                outcome
            );
        }
        let elapsed = start.elapsed();

        // One shared cursor would have taken at least three delays.
        assert!(elapsed < 2 * delay, "took {:?}", elapsed);
        assert_eq!(f.reads.load(Ordering::SeqCst), 3);
        assert!(f.opened.load(Ordering::SeqCst) >= 2);
        assert_eq!(f.resident_lod(), Some(Lod(2)));
    }

    #[test]
    fn exhausted_retries_keep_the_previous_payload() {
        let f = Fixture::new(Duration::ZERO, false);
        assert_eq!(f.fetch(A, Lod(0)), FetchOutcome::Completed { lod: Lod(0) });

        f.failures_left.store(3, Ordering::SeqCst);
        let outcome = f.fetch(A, Lod(2));
        assert!(matches!(outcome, FetchOutcome::Failed(Status::Io { .. })));
        assert_eq!(f.resident_lod(), Some(Lod(0)));
        assert!(f.scheduler.wait_idle(WAIT));
        assert_eq!(f.reads.load(Ordering::SeqCst), 1 + 3);

        let failures = f.scheduler.take_failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].lod, Lod(2));
        assert_eq!(failures[0].requesters.as_slice(), &[A]);
        assert!(f.scheduler.take_failures().is_empty());
        assert_eq!(f.scheduler.stats().retried, 2);

        // A later request starts over with fresh attempts.
        f.failures_left.store(2, Ordering::SeqCst);
        assert_eq!(f.fetch(A, Lod(2)), FetchOutcome::Completed { lod: Lod(2) });
    }

    #[test]
    fn corrupt_blobs_fail_once_and_are_remembered() {
        let f = Fixture::new(Duration::ZERO, true);
        let outcome = f.fetch(A, Lod(1));
        assert!(matches!(outcome, FetchOutcome::Failed(Status::CorruptPayload(_))));
        assert!(f.scheduler.wait_idle(WAIT));
        assert_eq!(f.reads.load(Ordering::SeqCst), 1);
        assert_eq!(f.resident_lod(), None);

        assert!(matches!(
            f.scheduler.request(A, f.root, Lod(1)),
            RequestOutcome::Unavailable(Status::CorruptPayload(_))
        ));
        assert_eq!(f.scheduler.stats().corrupt_blobs, 1);
    }

    #[test]
    fn unwanted_requests_are_cancelled_without_io() {
        let f = Fixture::new(Duration::ZERO, false);
        f.want(A, Lod(2));
        let handle = f.scheduler.request(A, f.root, Lod(2)).handle().cloned().unwrap();
        f.registry.remove_all_for_client(A);

        assert_eq!(f.scheduler.dispatch(), 0);
        assert_eq!(handle.try_outcome(), Some(FetchOutcome::Cancelled));
        assert_eq!(f.reads.load(Ordering::SeqCst), 0);
        assert!(!f.scheduler.is_pending(f.root, Lod(2)));

        f.want(B, Lod(0));
        let handle = f.scheduler.request(B, f.root, Lod(1)).handle().cloned().unwrap();
        assert_eq!(f.scheduler.cancel_unwanted(), 1);
        assert_eq!(handle.try_outcome(), Some(FetchOutcome::Cancelled));
    }

    #[test]
    fn shutdown_cancels_queued_work() {
        let mut f = Fixture::new(Duration::ZERO, false);
        f.want(A, Lod(2));
        let handle = f.scheduler.request(A, f.root, Lod(2)).handle().cloned().unwrap();
        f.scheduler.shutdown();
        assert_eq!(handle.try_outcome(), Some(FetchOutcome::Cancelled));
        assert!(matches!(
            f.scheduler.request(A, f.root, Lod(2)),
            RequestOutcome::Unavailable(Status::NotOpen)
        ));
        assert_eq!(f.scheduler.dispatch(), 0);
        assert_eq!(f.reads.load(Ordering::SeqCst), 0);
        assert!(f.container.blob_range(VoxelKey::ROOT, Lod(2)).is_ok());
    }
}
