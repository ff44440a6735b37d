use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bevy::prelude::{debug, info, warn, IVec2, Transform, Vec2, Vec3};

use crate::{
    async_updater::{AsyncNavMeshUpdater, LoadingListener, WaitConditionType, WaitStatus},
    conversion::CollisionShape,
    nav_mesh_db::NavMeshDb,
    off_mesh_connections::{OffMeshConnection, OffMeshConnectionsManager},
    recast_mesh::HeightfieldShape,
    recast_mesh_manager::{self, ChangeType, RecastMeshTiles, TileCachedRecastMeshManager},
    stats::Stats,
    tiles::{NavMesh, NavMeshCacheItem, SharedNavMeshCacheItem},
    AgentBounds, AreaType, NavigatorError, NavigatorSettings, ObjectId, TilePosition,
};

/// Batches edits made through the [`NavMeshManager`].
///
/// Every tile touched while the guard is alive gets a single new revision once the guard is committed or dropped.
/// Other threads editing the world block until then, tile generation does not.
pub struct UpdateGuard<'a> {
    guard: recast_mesh_manager::UpdateGuard<'a>,
}

impl UpdateGuard<'_> {
    pub fn commit(&mut self) {
        self.guard.commit();
    }
}

fn inner<'b, 'a>(
    guard: Option<&'b mut UpdateGuard<'a>>,
) -> Option<&'b mut recast_mesh_manager::UpdateGuard<'a>> {
    guard.map(|guard| &mut guard.guard)
}

struct ManagerState {
    worldspace: String,
    cache: BTreeMap<AgentBounds, SharedNavMeshCacheItem>,
    player_tile: Option<TilePosition>,
    last_recast_mesh_manager_revision: u64,
    next_item_generation: u64,
}

/// Keeps the nav-meshes of every agent size in sync with the world.
///
/// All methods take ``&self`` & can be called from any thread. Edits are cheap, the expensive work happens on the
/// updater threads after [`NavMeshManager::update`].
pub struct NavMeshManager {
    settings: NavigatorSettings,
    recast_mesh_manager: Arc<TileCachedRecastMeshManager>,
    off_mesh_connections: Arc<OffMeshConnectionsManager>,
    updater: AsyncNavMeshUpdater,
    state: Mutex<ManagerState>,
}

impl NavMeshManager {
    pub fn new(
        settings: NavigatorSettings,
        db: Option<Box<dyn NavMeshDb>>,
    ) -> Result<Self, NavigatorError> {
        settings.validate()?;

        let recast_mesh_manager = Arc::new(TileCachedRecastMeshManager::new(settings.clone()));
        let off_mesh_connections = Arc::new(OffMeshConnectionsManager::new(settings.clone()));
        let db: Option<Arc<dyn NavMeshDb>> = db.map(Arc::from);
        let updater = AsyncNavMeshUpdater::new(
            settings.clone(),
            recast_mesh_manager.clone(),
            off_mesh_connections.clone(),
            db,
        )?;

        info!(
            "Created nav-mesh manager with {} updater thread(s), tiles are {} world units wide.",
            settings.async_nav_mesh_updater_threads,
            settings.get_tile_size()
        );

        Ok(Self {
            settings,
            recast_mesh_manager,
            off_mesh_connections,
            updater,
            state: Mutex::new(ManagerState {
                worldspace: String::new(),
                cache: BTreeMap::new(),
                player_tile: None,
                last_recast_mesh_manager_revision: 0,
                next_item_generation: 0,
            }),
        })
    }

    pub fn settings(&self) -> &NavigatorSettings {
        &self.settings
    }

    /// Locks every geometry edit until the guard is dropped.
    ///
    /// The thread holding the guard must pass it to every edit, [`NavMeshManager::update`] & [`NavMeshManager::update_bounds`].
    /// Calls without it from that thread are refused & logged, calls from other threads block. Beginning a second
    /// update on the same thread deadlocks.
    pub fn begin_update(&self) -> UpdateGuard<'_> {
        UpdateGuard {
            guard: self.recast_mesh_manager.begin_update(),
        }
    }

    pub fn worldspace(&self) -> String {
        self.lock_state().worldspace.clone()
    }

    /// Moves to another worldspace. Every registered shape is dropped & every agent starts with an empty nav-mesh.
    pub fn set_worldspace(&self, worldspace: &str, guard: &mut UpdateGuard<'_>) {
        let mut state = self.lock_state();
        if state.worldspace == worldspace {
            return;
        }

        self.recast_mesh_manager
            .set_worldspace(worldspace, &mut guard.guard);
        self.off_mesh_connections.clear();
        self.updater.set_worldspace(worldspace);

        state.worldspace = worldspace.to_owned();
        let agents: Vec<AgentBounds> = state.cache.keys().copied().collect();
        for agent_bounds in agents {
            let item = self.create_cache_item(&mut state, agent_bounds);
            if let Some(previous) = state.cache.insert(agent_bounds, item) {
                previous.detach();
            }
        }

        info!("Switched nav-mesh worldspace to \"{}\".", worldspace);
    }

    /// Recomputes the player tile. When it changed, the tiles around the player get priority & populated tiles that
    /// entered the range are queued for every agent.
    pub fn update_bounds(&self, player_position: Vec3, guard: Option<&mut UpdateGuard<'_>>) {
        let player_tile = self
            .settings
            .get_tile_containing_position(Vec2::new(player_position.x, player_position.z));

        let items: Vec<SharedNavMeshCacheItem> = {
            let mut state = self.lock_state();
            if state.player_tile == Some(player_tile) {
                return;
            }
            state.player_tile = Some(player_tile);

            state.cache.values().cloned().collect()
        };

        let range = self.settings.get_tiles_range(player_tile);
        self.updater.update_player_tile(player_tile, range);

        let entered = self.recast_mesh_manager.set_range(range, inner(guard));
        if entered.is_empty() {
            return;
        }
        for item in &items {
            self.updater.post(
                item,
                entered.iter().map(|(tile, _)| (*tile, ChangeType::Add)),
                false,
            );
        }
    }

    pub fn add_object(
        &self,
        id: ObjectId,
        shape: &CollisionShape,
        transform: Transform,
        area: AreaType,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.recast_mesh_manager
            .add_object(id, shape, transform, area, inner(guard))
    }

    pub fn update_object(
        &self,
        id: ObjectId,
        transform: Transform,
        area: AreaType,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.recast_mesh_manager
            .update_object(id, transform, area, inner(guard))
    }

    pub fn remove_object(&self, id: ObjectId, guard: Option<&mut UpdateGuard<'_>>) -> bool {
        self.recast_mesh_manager.remove_object(id, inner(guard))
    }

    pub fn add_water(
        &self,
        cell_position: IVec2,
        cell_size: i32,
        level: f32,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.recast_mesh_manager
            .add_water(cell_position, cell_size, level, inner(guard))
    }

    pub fn remove_water(&self, cell_position: IVec2, guard: Option<&mut UpdateGuard<'_>>) -> bool {
        self.recast_mesh_manager
            .remove_water(cell_position, inner(guard))
    }

    pub fn add_heightfield(
        &self,
        cell_position: IVec2,
        cell_size: i32,
        shape: HeightfieldShape,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.recast_mesh_manager
            .add_heightfield(cell_position, cell_size, shape, inner(guard))
    }

    pub fn remove_heightfield(
        &self,
        cell_position: IVec2,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.recast_mesh_manager
            .remove_heightfield(cell_position, inner(guard))
    }

    /// Registers an agent size. Populated tiles around the player are queued ahead of routine rebuilds. Before the
    /// first [`NavMeshManager::update`] there is no player yet, the first update queues them instead.
    ///
    /// Returns false if the agent is already known, its bounds are invalid or its radius is wider than the tile border
    /// (see [`NavigatorSettings::fits_agent`]).
    pub fn add_agent(&self, agent_bounds: AgentBounds) -> bool {
        if !agent_bounds.is_valid() {
            return false;
        }
        if !self.settings.fits_agent(&agent_bounds) {
            warn!(
                "Refusing nav-mesh agent {:?}, it needs a border of {} world units but tiles have {}.",
                agent_bounds,
                agent_bounds.radius,
                self.settings.get_border_size()
            );
            return false;
        }

        let (item, player_tile) = {
            let mut state = self.lock_state();
            if state.cache.contains_key(&agent_bounds) {
                return false;
            }
            let item = self.create_cache_item(&mut state, agent_bounds);
            state.cache.insert(agent_bounds, item.clone());

            (item, state.player_tile)
        };

        info!("Added nav-mesh agent {:?}.", agent_bounds);
        if let Some(player_tile) = player_tile {
            self.post_tiles_in_range(&item, player_tile);
        }

        true
    }

    /// Throws away the nav-mesh of an agent & rebuilds it from scratch. Like [`NavMeshManager::add_agent`] nothing is
    /// queued before the first update.
    ///
    /// Returns false, without doing anything, if the agent was never added.
    pub fn reset(&self, agent_bounds: AgentBounds) -> bool {
        let (item, player_tile) = {
            let mut state = self.lock_state();
            if !state.cache.contains_key(&agent_bounds) {
                return false;
            }
            let item = self.create_cache_item(&mut state, agent_bounds);
            if let Some(previous) = state.cache.insert(agent_bounds, item.clone()) {
                previous.detach();
            }

            (item, state.player_tile)
        };

        debug!("Reset nav-mesh of agent {:?}.", agent_bounds);
        if let Some(player_tile) = player_tile {
            self.post_tiles_in_range(&item, player_tile);
        }

        true
    }

    /// Adds a two-way link between ``start`` & ``end`` owned by ``id`` and queues the tiles of both ends.
    pub fn add_off_mesh_connection(&self, id: ObjectId, start: Vec3, end: Vec3, area: AreaType) {
        let tiles = self
            .off_mesh_connections
            .add(id, OffMeshConnection::new(start, end, area));
        self.post_to_all_agents(&tiles);
    }

    /// Removes every off-mesh connection owned by ``id`` and queues the affected tiles.
    pub fn remove_off_mesh_connections(&self, id: ObjectId) {
        let tiles = self.off_mesh_connections.remove(id);
        self.post_to_all_agents(&tiles);
    }

    /// Per tick driver. Updates the player tile and queues every tile changed since the last call for every agent.
    pub fn update(&self, player_position: Vec3, guard: Option<&mut UpdateGuard<'_>>) {
        let mut guard = guard;
        self.update_bounds(player_position, guard.as_deref_mut());

        let changed = self
            .recast_mesh_manager
            .take_changed_tiles(inner(guard));
        let revision = self.recast_mesh_manager.revision();

        let items: Vec<SharedNavMeshCacheItem> = {
            let mut state = self.lock_state();
            if changed.is_empty() && state.last_recast_mesh_manager_revision == revision {
                return;
            }
            state.last_recast_mesh_manager_revision = revision;

            state.cache.values().cloned().collect()
        };

        let mut changed: Vec<(TilePosition, ChangeType)> = changed.into_iter().collect();
        changed.sort_unstable_by_key(|(tile, _)| (tile.x, tile.y));
        debug!(
            "Recast mesh revision {}: {} changed tile(s) for {} agent(s).",
            revision,
            changed.len(),
            items.len()
        );

        for item in &items {
            self.updater.post(item, changed.iter().copied(), false);
        }
    }

    /// Blocks until ``condition`` holds, see [`AsyncNavMeshUpdater::wait`].
    pub fn wait(
        &self,
        condition: WaitConditionType,
        listener: Option<&dyn LoadingListener>,
    ) -> WaitStatus {
        self.updater.wait(condition, listener)
    }

    pub fn get_nav_mesh(&self, agent_bounds: AgentBounds) -> Option<SharedNavMeshCacheItem> {
        self.lock_state().cache.get(&agent_bounds).cloned()
    }

    pub fn get_nav_meshes(&self) -> BTreeMap<AgentBounds, SharedNavMeshCacheItem> {
        self.lock_state().cache.clone()
    }

    pub fn get_stats(&self) -> Stats {
        let (worldspace, player_tile, items) = {
            let state = self.lock_state();
            (
                state.worldspace.clone(),
                state.player_tile,
                state.cache.values().cloned().collect::<Vec<_>>(),
            )
        };

        let (nav_mesh_tiles, nav_mesh_polygons) = items
            .iter()
            .map(|item| item.nav_mesh())
            .fold((0, 0), |(tiles, polygons), nav_mesh| {
                (
                    tiles + nav_mesh.tiles().len(),
                    polygons + nav_mesh.polygon_count(),
                )
            });

        Stats {
            worldspace,
            player_tile,
            agents: items.len(),
            recast_mesh_revision: self.recast_mesh_manager.revision(),
            recast_tiles: self.recast_mesh_manager.tile_count(),
            nav_mesh_tiles,
            nav_mesh_polygons,
            updater: self.updater.stats(),
        }
    }

    /// Merged geometry of every populated tile.
    pub fn get_recast_mesh_tiles(&self) -> RecastMeshTiles {
        self.recast_mesh_manager.recast_mesh_tiles()
    }

    fn lock_state(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn create_cache_item(
        &self,
        state: &mut ManagerState,
        agent_bounds: AgentBounds,
    ) -> SharedNavMeshCacheItem {
        let generation = state.next_item_generation;
        state.next_item_generation += 1;

        Arc::new(NavMeshCacheItem::new(
            agent_bounds,
            generation,
            NavMesh::new(self.settings.get_tile_size(), self.settings.max_climb),
        ))
    }

    fn post_tiles_in_range(&self, item: &SharedNavMeshCacheItem, player_tile: TilePosition) {
        let range = self.settings.get_tiles_range(player_tile);
        let tiles = self.recast_mesh_manager.tiles_in_range(range);

        self.updater.post(
            item,
            tiles.into_iter().map(|(tile, _)| (tile, ChangeType::Add)),
            true,
        );
    }

    fn post_to_all_agents(&self, tiles: &[TilePosition]) {
        if tiles.is_empty() {
            return;
        }

        let items: Vec<SharedNavMeshCacheItem> = self.lock_state().cache.values().cloned().collect();
        for item in &items {
            self.updater.post(
                item,
                tiles.iter().map(|tile| (*tile, ChangeType::Update)),
                false,
            );
        }
    }
}
