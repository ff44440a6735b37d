//! Background tile generation.
//!
//! A fixed pool of worker threads pulls jobs from one shared priority queue. Every job names an agent & a tile, the
//! worker figures out what the tile currently looks like, builds it (or finds it in a cache) and publishes it into
//! the agent's [`NavMeshCacheItem`](crate::tiles::NavMeshCacheItem).
//!
//! Nothing is ever cancelled. Jobs that went stale are recognized by comparing revisions, both when they are taken
//! from the queue and right before publishing.
//!
//! Empty tiles have no revision of their own. They are published with the global revisions, which are never below the
//! revision the tile was emptied at & always below the revision it gets once something enters it again.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

#[cfg(feature = "trace")]
use bevy::prelude::info_span;
use bevy::prelude::{debug, error, warn};

use crate::{
    build_tile_sync, get_tile_distance,
    nav_mesh_db::{compute_input_hash, DbWorker, NavMeshDb, NavMeshDbKey, NavMeshDbStats},
    nav_mesh_tiles_cache::{NavMeshTilesCache, NavMeshTilesCacheStats, TileCacheKey},
    off_mesh_connections::OffMeshConnectionsManager,
    recast_mesh_manager::{ChangeType, TileCachedRecastMeshManager},
    tiles::{PreparedNavMeshData, SharedNavMeshCacheItem, TileRevision, UpdateNavMeshStatus},
    AgentBounds, NavigatorError, NavigatorSettings, TileBuildError, TileBuildParameters,
    TilePosition, TilesPositionsRange,
};

/// How often a waiting thread polls the loading listener.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What [`AsyncNavMeshUpdater::wait`] waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitConditionType {
    /// Every tile within [`NavigatorSettings::wait_until_min_distance_to_player`] of the player tile is built.
    RequiredTilesPresent,
    /// Nothing is queued or being built.
    AllJobsDone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    Done,
    /// The listener asked to stop waiting. Jobs carry on in the background.
    Aborted,
}

/// Receives progress while waiting, eg. to drive a loading bar.
pub trait LoadingListener {
    fn set_progress_range(&self, range: usize);

    fn set_progress(&self, value: usize);

    /// Polled while waiting. Returning true makes the wait return [`WaitStatus::Aborted`].
    fn should_abort(&self) -> bool {
        false
    }
}

/// Revisions of what is in a tile. ``None`` where there is nothing of that kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TileState {
    geometry: Option<u64>,
    connections: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct JobKey {
    agent_bounds: AgentBounds,
    tile: TilePosition,
}

struct Job {
    item: SharedNavMeshCacheItem,
    tile: TilePosition,
    worldspace: Arc<str>,
    worldspace_generation: u64,
    state: TileState,
    /// Revision published once built.
    revision: TileRevision,
    change_type: ChangeType,
    new_agent: bool,
    seq: u64,
}

impl Job {
    fn key(&self) -> JobKey {
        JobKey {
            agent_bounds: self.item.agent_bounds(),
            tile: self.tile,
        }
    }
}

/// Smaller is more urgent. Fields are compared in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Urgency {
    out_of_range: bool,
    distance: i32,
    existing_agent: bool,
    /// Insertion order, the final tie-break.
    seq: u64,
}

#[derive(PartialEq, Eq)]
struct QueueEntry {
    urgency: Urgency,
    key: JobKey,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap pops the greatest entry, so the most urgent one must compare greatest.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.urgency.cmp(&self.urgency)
    }
}

enum PushResult {
    Queued,
    Coalesced,
    Parked,
}

struct JobQueue {
    jobs: HashMap<JobKey, Job>,
    /// May contain outdated entries, those are skipped when popping.
    heap: BinaryHeap<QueueEntry>,
    /// Jobs for keys a worker is currently busy with.
    parked: HashMap<JobKey, Job>,
    processing: HashSet<JobKey>,
    player_tile: TilePosition,
    range: Option<TilesPositionsRange>,
    worldspace: Arc<str>,
    next_seq: u64,
    shutdown: bool,
}

impl JobQueue {
    fn new() -> Self {
        Self {
            jobs: HashMap::new(),
            heap: BinaryHeap::new(),
            parked: HashMap::new(),
            processing: HashSet::new(),
            player_tile: TilePosition::ZERO,
            range: None,
            worldspace: Arc::from(""),
            next_seq: 0,
            shutdown: false,
        }
    }

    fn urgency(&self, job: &Job) -> Urgency {
        Urgency {
            out_of_range: !self.range.is_none_or(|range| range.contains(job.tile)),
            distance: get_tile_distance(job.tile, self.player_tile),
            existing_agent: !job.new_agent,
            seq: job.seq,
        }
    }

    fn push(&mut self, mut job: Job) -> PushResult {
        let key = job.key();
        let processing = self.processing.contains(&key);

        let existing = if processing {
            self.parked.get_mut(&key)
        } else {
            self.jobs.get_mut(&key)
        };
        if let Some(existing) = existing {
            // Tile & insertion order stay the same, only becoming a new agent's job raises the urgency.
            let raised = job.new_agent && !existing.new_agent;
            job.seq = existing.seq;
            job.change_type = existing.change_type.merge(job.change_type);
            job.new_agent |= existing.new_agent;
            *existing = job;

            if raised && !processing {
                // The previous heap entry becomes outdated.
                if let Some(job) = self.jobs.get(&key) {
                    let urgency = self.urgency(job);
                    self.heap.push(QueueEntry { urgency, key });
                }
            }

            return PushResult::Coalesced;
        }

        job.seq = self.next_seq;
        self.next_seq += 1;

        if processing {
            self.parked.insert(key, job);
            return PushResult::Parked;
        }

        self.heap.push(QueueEntry {
            urgency: self.urgency(&job),
            key,
        });
        self.jobs.insert(key, job);

        PushResult::Queued
    }

    fn pop(&mut self) -> Option<Job> {
        while let Some(entry) = self.heap.pop() {
            let current = self
                .jobs
                .get(&entry.key)
                .is_some_and(|job| self.urgency(job) == entry.urgency);
            if !current {
                continue;
            }

            let job = self.jobs.remove(&entry.key)?;
            self.processing.insert(entry.key);

            return Some(job);
        }

        None
    }

    fn finish(&mut self, key: JobKey) {
        self.processing.remove(&key);

        if let Some(job) = self.parked.remove(&key) {
            self.heap.push(QueueEntry {
                urgency: self.urgency(&job),
                key,
            });
            self.jobs.insert(key, job);
        }
    }

    fn reprioritize(&mut self) {
        let heap: BinaryHeap<QueueEntry> = self
            .jobs
            .iter()
            .map(|(key, job)| QueueEntry {
                urgency: self.urgency(job),
                key: *key,
            })
            .collect();
        self.heap = heap;
    }

    /// Drops everything that hasn't been picked up yet. Returns the amount of dropped jobs.
    fn clear(&mut self) -> usize {
        let count = self.jobs.len() + self.parked.len();
        self.jobs.clear();
        self.parked.clear();
        self.heap.clear();

        count
    }

    fn remaining(&self, condition: WaitConditionType, min_distance: i32) -> usize {
        match condition {
            WaitConditionType::AllJobsDone => {
                self.jobs.len() + self.parked.len() + self.processing.len()
            }
            WaitConditionType::RequiredTilesPresent => {
                let required =
                    |key: &JobKey| get_tile_distance(key.tile, self.player_tile) <= min_distance;

                self.jobs.keys().filter(|key| required(key)).count()
                    + self.parked.keys().filter(|key| required(key)).count()
                    + self.processing.iter().filter(|key| required(key)).count()
            }
        }
    }
}

#[derive(Default)]
struct UpdaterCounters {
    pushed: AtomicU64,
    coalesced: AtomicU64,
    dropped: AtomicU64,
    built: AtomicU64,
    cache_hits: AtomicU64,
    db_hits: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AsyncNavMeshUpdaterStats {
    /// Jobs waiting for a worker.
    pub jobs: usize,
    /// Jobs waiting for a worker to finish the same agent & tile.
    pub parked: usize,
    pub processing: usize,
    pub pushed: u64,
    /// Pushes merged into an already queued job.
    pub coalesced: u64,
    /// Jobs discarded because they went stale.
    pub dropped: u64,
    /// Tiles generated from geometry.
    pub built: u64,
    pub cache_hits: u64,
    pub db_hits: u64,
    pub failed: u64,
    /// Bumped for every published tile.
    pub generation: u64,
    pub tiles_cache: NavMeshTilesCacheStats,
    pub db: Option<NavMeshDbStats>,
}

enum JobOutcome {
    Published(UpdateNavMeshStatus),
    Dropped,
    Failed,
}

struct TileData {
    data: Option<Arc<PreparedNavMeshData>>,
    /// Set when the data was freshly built & should be written to the database.
    persist: Option<NavMeshDbKey>,
}

struct Shared {
    settings: NavigatorSettings,
    recast_mesh_manager: Arc<TileCachedRecastMeshManager>,
    off_mesh_connections: Arc<OffMeshConnectionsManager>,
    tiles_cache: NavMeshTilesCache,
    db: Option<DbWorker>,
    queue: Mutex<JobQueue>,
    has_job: Condvar,
    job_done: Condvar,
    counters: UpdaterCounters,
    generation: AtomicU64,
}

impl Shared {
    fn lock_queue(&self) -> MutexGuard<'_, JobQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tile_state(&self, tile: TilePosition) -> TileState {
        TileState {
            geometry: self.recast_mesh_manager.tile_revision(tile),
            connections: self.off_mesh_connections.tile_revision(tile),
        }
    }

    /// Must be called after reading ``state``, so a global revision is never below the one that emptied the tile.
    fn publish_revision(&self, state: TileState) -> TileRevision {
        TileRevision {
            geometry: state
                .geometry
                .unwrap_or_else(|| self.recast_mesh_manager.revision()),
            connections: state
                .connections
                .unwrap_or_else(|| self.off_mesh_connections.revision()),
        }
    }

    /// An empty tile staying empty is not a change, whatever happened elsewhere.
    fn is_stale(&self, job: &Job) -> bool {
        job.worldspace_generation != self.recast_mesh_manager.worldspace_generation()
            || job.item.is_detached()
            || self.tile_state(job.tile) != job.state
    }

    /// Blocks until there is a job or the updater shuts down.
    fn next_job(&self) -> Option<Job> {
        let mut queue = self.lock_queue();
        loop {
            if queue.shutdown {
                return None;
            }
            if let Some(job) = queue.pop() {
                return Some(job);
            }
            queue = self
                .has_job
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn finish_job(&self, key: JobKey) {
        let unparked = {
            let mut queue = self.lock_queue();
            let parked = queue.parked.contains_key(&key);
            queue.finish(key);

            parked
        };

        if unparked {
            self.has_job.notify_one();
        }
        self.job_done.notify_all();
    }

    fn process_job(&self, job: &Job) -> JobOutcome {
        #[cfg(feature = "trace")]
        let _span = info_span!("Process nav-mesh job").entered();

        if self.is_stale(job) {
            return JobOutcome::Dropped;
        }
        if job
            .item
            .tile_revision(job.tile)
            .is_some_and(|published| published >= job.revision)
        {
            return JobOutcome::Dropped;
        }

        let tile_data = match self.get_tile_data(job) {
            Ok(tile_data) => tile_data,
            Err(error) => {
                warn!(
                    "Failed to build nav-mesh tile {} for agent {:?}: {}",
                    job.tile,
                    job.item.agent_bounds(),
                    error
                );
                return JobOutcome::Failed;
            }
        };

        // Geometry might have changed while building, a newer job takes care of that.
        if self.is_stale(job) {
            return JobOutcome::Dropped;
        }

        let status = job
            .item
            .update_tile(job.tile, job.revision, tile_data.data.clone());
        if status == UpdateNavMeshStatus::Ignored {
            return JobOutcome::Dropped;
        }

        if let (Some(db), Some(key), Some(data)) = (&self.db, tile_data.persist, tile_data.data) {
            db.put(key, data);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);

        JobOutcome::Published(status)
    }

    fn get_tile_data(&self, job: &Job) -> Result<TileData, TileBuildError> {
        let agent_bounds = job.item.agent_bounds();

        let Some(recast_mesh) = self.recast_mesh_manager.recast_mesh(job.tile) else {
            return Ok(TileData {
                data: None,
                persist: None,
            });
        };
        let off_mesh_connections = self.off_mesh_connections.get(job.tile);
        let parameters = TileBuildParameters::new(&agent_bounds, &self.settings);

        let input_hash = match compute_input_hash(&recast_mesh, &off_mesh_connections, &parameters)
        {
            Ok(input_hash) => Some(input_hash),
            Err(error) => {
                warn!("Failed to hash inputs of nav-mesh tile {}: {}", job.tile, error);
                None
            }
        };

        if let Some(input_hash) = input_hash {
            let cache_key = TileCacheKey {
                agent_bounds,
                tile: job.tile,
                input_hash,
            };
            if let Some(data) = self.tiles_cache.get(&cache_key) {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(TileData {
                    data: Some(data),
                    persist: None,
                });
            }

            if let Some(db) = &self.db {
                let db_key = NavMeshDbKey::new(&job.worldspace, agent_bounds, job.tile, input_hash);
                if let Some(data) = db.get(&db_key) {
                    let data = Arc::new(data);
                    self.tiles_cache.set(cache_key, data.clone());
                    self.counters.db_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(TileData {
                        data: Some(data),
                        persist: None,
                    });
                }
            }
        }

        let data = build_tile_sync(job.tile, &recast_mesh, &off_mesh_connections, &parameters)?
            .map(Arc::new);
        self.counters.built.fetch_add(1, Ordering::Relaxed);

        let persist = match (input_hash, &data) {
            (Some(input_hash), Some(data)) => {
                self.tiles_cache.set(
                    TileCacheKey {
                        agent_bounds,
                        tile: job.tile,
                        input_hash,
                    },
                    data.clone(),
                );

                Some(NavMeshDbKey::new(
                    &job.worldspace,
                    agent_bounds,
                    job.tile,
                    input_hash,
                ))
            }
            _ => None,
        };

        Ok(TileData { data, persist })
    }
}

fn run_worker(shared: Arc<Shared>) {
    while let Some(job) = shared.next_job() {
        let key = job.key();

        match panic::catch_unwind(AssertUnwindSafe(|| shared.process_job(&job))) {
            Ok(JobOutcome::Published(status)) => {
                debug!(
                    "Published nav-mesh tile {} for agent {:?}: {:?}",
                    job.tile,
                    key.agent_bounds,
                    status
                );
            }
            Ok(JobOutcome::Dropped) => {
                shared.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Ok(JobOutcome::Failed) => {
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                error!("Nav-mesh worker panicked while building tile {}.", job.tile);
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
        }

        shared.finish_job(key);
    }
}

/// Pool of threads generating nav-mesh tiles.
pub struct AsyncNavMeshUpdater {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl AsyncNavMeshUpdater {
    pub fn new(
        settings: NavigatorSettings,
        recast_mesh_manager: Arc<TileCachedRecastMeshManager>,
        off_mesh_connections: Arc<OffMeshConnectionsManager>,
        db: Option<Arc<dyn NavMeshDb>>,
    ) -> Result<Self, NavigatorError> {
        let db = match db {
            Some(db) if settings.enable_nav_mesh_disk_cache || settings.write_to_nav_mesh_db => {
                Some(
                    DbWorker::new(
                        db,
                        settings.enable_nav_mesh_disk_cache,
                        settings.write_to_nav_mesh_db,
                        settings.max_db_file_size,
                    )
                    .map_err(NavigatorError::SpawnThread)?,
                )
            }
            _ => None,
        };

        let shared = Arc::new(Shared {
            tiles_cache: NavMeshTilesCache::new(settings.max_nav_mesh_tiles_cache_size),
            settings: settings.clone(),
            recast_mesh_manager,
            off_mesh_connections,
            db,
            queue: Mutex::new(JobQueue::new()),
            has_job: Condvar::new(),
            job_done: Condvar::new(),
            counters: UpdaterCounters::default(),
            generation: AtomicU64::new(0),
        });

        let mut updater = Self {
            shared,
            workers: Vec::new(),
        };
        for index in 0..settings.async_nav_mesh_updater_threads.get() {
            let shared = updater.shared.clone();
            // On failure dropping the updater shuts down the workers spawned so far.
            let worker = std::thread::Builder::new()
                .name(format!("nav-mesh-updater-{index}"))
                .spawn(move || run_worker(shared))
                .map_err(NavigatorError::SpawnThread)?;
            updater.workers.push(worker);
        }

        Ok(updater)
    }

    /// Queues a rebuild of ``tiles`` for the agent of ``item``.
    ///
    /// Tiles already published at their current revision are skipped. ``new_agent`` gives the jobs priority over
    /// routine rebuilds at the same distance.
    pub fn post(
        &self,
        item: &SharedNavMeshCacheItem,
        tiles: impl IntoIterator<Item = (TilePosition, ChangeType)>,
        new_agent: bool,
    ) {
        if item.is_detached() {
            return;
        }
        let worldspace_generation = self.shared.recast_mesh_manager.worldspace_generation();
        let nav_mesh = item.nav_mesh();

        let mut queued = 0;
        {
            let mut queue = self.shared.lock_queue();
            let worldspace = queue.worldspace.clone();

            for (tile, change_type) in tiles {
                let state = self.shared.tile_state(tile);
                let revision = self.shared.publish_revision(state);
                if nav_mesh
                    .tile_revision(tile)
                    .is_some_and(|published| published >= revision)
                {
                    continue;
                }

                let result = queue.push(Job {
                    item: item.clone(),
                    tile,
                    worldspace: worldspace.clone(),
                    worldspace_generation,
                    state,
                    revision,
                    change_type,
                    new_agent,
                    seq: 0,
                });

                self.shared.counters.pushed.fetch_add(1, Ordering::Relaxed);
                match result {
                    PushResult::Queued => queued += 1,
                    PushResult::Coalesced => {
                        self.shared.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    }
                    PushResult::Parked => {}
                }
            }
        }

        match queued {
            0 => {}
            1 => self.shared.has_job.notify_one(),
            _ => self.shared.has_job.notify_all(),
        }
    }

    /// Moves the center of the priority function. Nothing is cancelled, tiles leaving the range just lose urgency.
    pub fn update_player_tile(&self, player_tile: TilePosition, range: TilesPositionsRange) {
        let mut queue = self.shared.lock_queue();
        if queue.player_tile == player_tile && queue.range == Some(range) {
            return;
        }

        queue.player_tile = player_tile;
        queue.range = Some(range);
        queue.reprioritize();
    }

    /// Tags future jobs with ``worldspace`` & drops every queued job of the previous one.
    pub fn set_worldspace(&self, worldspace: &str) {
        let dropped = {
            let mut queue = self.shared.lock_queue();
            queue.worldspace = Arc::from(worldspace);

            queue.clear()
        };

        self.shared
            .counters
            .dropped
            .fetch_add(dropped as u64, Ordering::Relaxed);
        self.shared.job_done.notify_all();
    }

    /// Blocks until ``condition`` holds. Returns immediately if it already does.
    ///
    /// May be abandoned through ``listener``, the updater keeps working normally afterwards.
    pub fn wait(
        &self,
        condition: WaitConditionType,
        listener: Option<&dyn LoadingListener>,
    ) -> WaitStatus {
        let min_distance = self.shared.settings.wait_until_min_distance_to_player;
        let mut total = 0;

        let mut queue = self.shared.lock_queue();
        loop {
            let remaining = queue.remaining(condition, min_distance);

            if let Some(listener) = listener {
                // Don't call out while holding the queue.
                drop(queue);

                if remaining > total {
                    total = remaining;
                    listener.set_progress_range(total);
                }
                listener.set_progress(total - remaining);
                if remaining > 0 && listener.should_abort() {
                    return WaitStatus::Aborted;
                }

                queue = self.shared.lock_queue();
            }

            if remaining == 0 {
                return WaitStatus::Done;
            }

            queue = self
                .shared
                .job_done
                .wait_timeout(queue, WAIT_POLL_INTERVAL)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Bumped every time a tile is published.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> AsyncNavMeshUpdaterStats {
        let (jobs, parked, processing) = {
            let queue = self.shared.lock_queue();
            (queue.jobs.len(), queue.parked.len(), queue.processing.len())
        };
        let counters = &self.shared.counters;

        AsyncNavMeshUpdaterStats {
            jobs,
            parked,
            processing,
            pushed: counters.pushed.load(Ordering::Relaxed),
            coalesced: counters.coalesced.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            built: counters.built.load(Ordering::Relaxed),
            cache_hits: counters.cache_hits.load(Ordering::Relaxed),
            db_hits: counters.db_hits.load(Ordering::Relaxed),
            failed: counters.failed.load(Ordering::Relaxed),
            generation: self.generation(),
            tiles_cache: self.shared.tiles_cache.stats(),
            db: self.shared.db.as_ref().map(DbWorker::stats),
        }
    }
}

impl Drop for AsyncNavMeshUpdater {
    fn drop(&mut self) {
        self.shared.lock_queue().shutdown = true;
        self.shared.has_job.notify_all();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("Nav-mesh updater thread panicked.");
            }
        }
    }
}
