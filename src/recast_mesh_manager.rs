//! Tracks which shapes, heightfields & water planes overlap which tile and revisions every tile whenever that changes.
//!
//! Mutations go through the registry lock. Workers only ever read per-tile [`TileSnapshot`]s from a separate map, so a
//! long batch of edits held in an [`UpdateGuard`] never blocks tile generation.
//!
//! Only populated tiles keep a snapshot. A tile that was emptied is forgotten once the commit emptying it is done, its
//! revision falls back to the global one which never goes below the revision it was emptied at.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use bevy::prelude::{error, IVec2, Transform, Vec2, Vec3};
use smallvec::SmallVec;

use crate::{
    conversion::{convert_shape, CollisionShape, ShapeTriangles},
    recast_mesh::{Heightfield, HeightfieldShape, RecastMesh, Water},
    AreaType, NavigatorSettings, ObjectId, TilePosition, TilesPositionsRange,
};

/// How a tile changed since it was last handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    /// Something left the tile.
    Remove,
    /// Several kinds of changes were combined.
    Mixed,
    /// Something entered the tile.
    Add,
    /// Something within the tile changed.
    Update,
}

impl ChangeType {
    #[inline]
    pub fn merge(self, other: ChangeType) -> ChangeType {
        if self == other {
            self
        } else {
            ChangeType::Mixed
        }
    }
}

/// Changed tiles & how they changed.
pub type ChangedTiles = HashMap<TilePosition, ChangeType>;

/// Merged recast meshes of every populated tile. Used for debug overlays.
pub type RecastMeshTiles = HashMap<TilePosition, Arc<RecastMesh>>;

type TileList = SmallVec<[TilePosition; 4]>;

struct ObjectData {
    shape: Arc<CollisionShape>,
    transform: Transform,
    area: AreaType,
    triangles: Arc<ShapeTriangles>,
    tiles: TileList,
}

struct WaterData {
    water: Water,
    tiles: TileList,
}

struct HeightfieldData {
    heightfield: Arc<Heightfield>,
    tiles: TileList,
}

#[derive(Default)]
struct Registry {
    worldspace: String,
    objects: HashMap<ObjectId, ObjectData>,
    water: HashMap<IVec2, WaterData>,
    heightfields: HashMap<IVec2, HeightfieldData>,
    tile_objects: HashMap<TilePosition, HashSet<ObjectId>>,
    tile_water: HashMap<TilePosition, HashSet<IVec2>>,
    tile_heightfields: HashMap<TilePosition, HashSet<IVec2>>,
    /// Tiles touched since the last commit.
    pending: ChangedTiles,
    /// Tiles committed since the last [`TileCachedRecastMeshManager::take_changed_tiles`].
    changed: ChangedTiles,
    range: Option<TilesPositionsRange>,
    revision: u64,
}

/// Geometry of a tile at one revision.
///
/// The merged [`RecastMesh`] is only built when first requested.
pub struct TileSnapshot {
    position: TilePosition,
    revision: u64,
    min: Vec2,
    max: Vec2,
    objects: Vec<(AreaType, Arc<ShapeTriangles>)>,
    water: Vec<Water>,
    heightfields: Vec<Arc<Heightfield>>,
    recast_mesh: OnceLock<Option<Arc<RecastMesh>>>,
}

impl TileSnapshot {
    pub fn position(&self) -> TilePosition {
        self.position
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Returns true if nothing overlaps the tile anymore.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.water.is_empty() && self.heightfields.is_empty()
    }

    /// Returns the merged geometry of the tile, ``None`` if nothing overlaps it.
    pub fn recast_mesh(&self) -> Option<Arc<RecastMesh>> {
        self.recast_mesh
            .get_or_init(|| {
                let mut mesh = RecastMesh::default();
                for (area, triangles) in &self.objects {
                    mesh.push_triangles(
                        &triangles.vertices,
                        &triangles.indices,
                        *area,
                        self.min,
                        self.max,
                    );
                }
                for heightfield in &self.heightfields {
                    heightfield.append_to(&mut mesh, self.min, self.max);
                }
                for water in &self.water {
                    water.append_to(&mut mesh, self.min, self.max);
                }

                (!mesh.is_empty()).then(|| Arc::new(mesh))
            })
            .clone()
    }
}

/// Tile-indexed registry of all navigation-relevant geometry.
pub struct TileCachedRecastMeshManager {
    settings: NavigatorSettings,
    registry: Mutex<Registry>,
    tiles: RwLock<HashMap<TilePosition, Arc<TileSnapshot>>>,
    revision: AtomicU64,
    worldspace_generation: AtomicU64,
    /// Thread holding an [`UpdateGuard`], if any.
    guard_owner: Mutex<Option<ThreadId>>,
}

/// Batches edits. While alive the registry is locked for the owner & every touched tile is only revised once, when
/// the guard is committed or dropped.
pub struct UpdateGuard<'a> {
    manager: &'a TileCachedRecastMeshManager,
    registry: MutexGuard<'a, Registry>,
}

impl UpdateGuard<'_> {
    /// Revises every tile touched so far.
    pub fn commit(&mut self) {
        self.manager.commit(&mut self.registry);
    }
}

impl Drop for UpdateGuard<'_> {
    fn drop(&mut self) {
        self.manager.commit(&mut self.registry);
        *self.manager.lock_guard_owner() = None;
    }
}

impl TileCachedRecastMeshManager {
    pub fn new(settings: NavigatorSettings) -> Self {
        Self {
            settings,
            registry: Mutex::default(),
            tiles: RwLock::default(),
            revision: AtomicU64::new(0),
            worldspace_generation: AtomicU64::new(0),
            guard_owner: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &NavigatorSettings {
        &self.settings
    }

    /// Locks the registry until the returned guard is dropped.
    ///
    /// While the guard is alive every edit made from the same thread must be passed the guard. Unguarded edits from
    /// that thread are refused & logged, from other threads they block until the guard is dropped.
    pub fn begin_update(&self) -> UpdateGuard<'_> {
        let registry = self.lock_registry();
        *self.lock_guard_owner() = Some(thread::current().id());

        UpdateGuard {
            manager: self,
            registry,
        }
    }

    /// Global revision, bumped once per commit that touched at least one tile.
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Bumped every time the worldspace changes.
    pub fn worldspace_generation(&self) -> u64 {
        self.worldspace_generation.load(Ordering::Acquire)
    }

    /// Clears everything and moves to ``worldspace``. Every previously populated tile is marked as changed.
    pub fn set_worldspace(&self, worldspace: &str, guard: &mut UpdateGuard<'_>) {
        let registry = &mut *guard.registry;
        if registry.worldspace == worldspace {
            return;
        }
        registry.worldspace = worldspace.to_owned();

        let populated: Vec<TilePosition> = registry
            .tile_objects
            .keys()
            .chain(registry.tile_water.keys())
            .chain(registry.tile_heightfields.keys())
            .copied()
            .collect();
        for tile in populated {
            mark_changed(&mut registry.pending, tile, ChangeType::Remove);
        }

        registry.objects.clear();
        registry.water.clear();
        registry.heightfields.clear();
        registry.tile_objects.clear();
        registry.tile_water.clear();
        registry.tile_heightfields.clear();

        self.worldspace_generation.fetch_add(1, Ordering::AcqRel);
    }

    /// Registers an object, or replaces it if ``id`` is already known.
    ///
    /// Returns false if nothing changed, the shape has no usable triangles or is fully outside of the world.
    pub fn add_object(
        &self,
        id: ObjectId,
        shape: &CollisionShape,
        transform: Transform,
        area: AreaType,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.with_registry(guard, |registry, settings| {
            if let Some(existing) = registry.objects.get(&id) {
                if existing.transform == transform
                    && existing.area == area
                    && *existing.shape == *shape
                {
                    return false;
                }
            }

            let Some(triangles) = convert_shape(shape, &transform) else {
                return false;
            };
            if !settings.overlaps_world(triangles.min, triangles.max) {
                return false;
            }

            let tiles = get_tiles_for_bounds(settings, triangles.min, triangles.max);
            let old_tiles = registry
                .objects
                .get(&id)
                .map(|existing| existing.tiles.clone())
                .unwrap_or_default();
            retile(
                &mut registry.tile_objects,
                &mut registry.pending,
                id,
                &old_tiles,
                &tiles,
            );

            registry.objects.insert(
                id,
                ObjectData {
                    shape: Arc::new(shape.clone()),
                    transform,
                    area,
                    triangles: Arc::new(triangles),
                    tiles,
                },
            );

            true
        })
    }

    /// Moves an object or changes its area type. Returns false if ``id`` is unknown or nothing changed.
    pub fn update_object(
        &self,
        id: ObjectId,
        transform: Transform,
        area: AreaType,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.with_registry(guard, |registry, settings| {
            let Some(existing) = registry.objects.get(&id) else {
                return false;
            };
            if existing.transform == transform && existing.area == area {
                return false;
            }

            let Some(triangles) = convert_shape(&existing.shape, &transform) else {
                return false;
            };
            let tiles = if settings.overlaps_world(triangles.min, triangles.max) {
                get_tiles_for_bounds(settings, triangles.min, triangles.max)
            } else {
                TileList::new()
            };
            let old_tiles = existing.tiles.clone();

            retile(
                &mut registry.tile_objects,
                &mut registry.pending,
                id,
                &old_tiles,
                &tiles,
            );

            if let Some(object) = registry.objects.get_mut(&id) {
                object.transform = transform;
                object.area = area;
                object.triangles = Arc::new(triangles);
                object.tiles = tiles;
            }

            true
        })
    }

    /// Returns false if ``id`` is unknown.
    pub fn remove_object(&self, id: ObjectId, guard: Option<&mut UpdateGuard<'_>>) -> bool {
        self.with_registry(guard, |registry, _| {
            let Some(object) = registry.objects.remove(&id) else {
                return false;
            };

            retile(
                &mut registry.tile_objects,
                &mut registry.pending,
                id,
                &object.tiles,
                &[],
            );

            true
        })
    }

    /// Adds a water plane covering the cell at ``cell_position``, replacing any previous one.
    pub fn add_water(
        &self,
        cell_position: IVec2,
        cell_size: i32,
        level: f32,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        let water = Water {
            cell_position,
            cell_size,
            level,
        };
        if !water.is_valid() {
            return false;
        }

        self.with_registry(guard, |registry, settings| {
            if registry
                .water
                .get(&cell_position)
                .is_some_and(|existing| existing.water == water)
            {
                return false;
            }

            let (min, max) = water.bounds();
            if !settings.overlaps_world(min, max) {
                return false;
            }

            let tiles = get_tiles_for_bounds(settings, min, max);
            let old_tiles = registry
                .water
                .get(&cell_position)
                .map(|existing| existing.tiles.clone())
                .unwrap_or_default();
            retile(
                &mut registry.tile_water,
                &mut registry.pending,
                cell_position,
                &old_tiles,
                &tiles,
            );
            registry
                .water
                .insert(cell_position, WaterData { water, tiles });

            true
        })
    }

    pub fn remove_water(&self, cell_position: IVec2, guard: Option<&mut UpdateGuard<'_>>) -> bool {
        self.with_registry(guard, |registry, _| {
            let Some(data) = registry.water.remove(&cell_position) else {
                return false;
            };

            retile(
                &mut registry.tile_water,
                &mut registry.pending,
                cell_position,
                &data.tiles,
                &[],
            );

            true
        })
    }

    /// Adds terrain for the cell at ``cell_position``, replacing any previous one.
    pub fn add_heightfield(
        &self,
        cell_position: IVec2,
        cell_size: i32,
        shape: HeightfieldShape,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        let heightfield = Heightfield {
            cell_position,
            cell_size,
            shape,
        };
        if !heightfield.is_valid() {
            return false;
        }

        self.with_registry(guard, |registry, settings| {
            if registry
                .heightfields
                .get(&cell_position)
                .is_some_and(|existing| *existing.heightfield == heightfield)
            {
                return false;
            }

            let (min, max) = heightfield.bounds();
            if !settings.overlaps_world(min, max) {
                return false;
            }

            let tiles = get_tiles_for_bounds(settings, min, max);
            let old_tiles = registry
                .heightfields
                .get(&cell_position)
                .map(|existing| existing.tiles.clone())
                .unwrap_or_default();
            retile(
                &mut registry.tile_heightfields,
                &mut registry.pending,
                cell_position,
                &old_tiles,
                &tiles,
            );
            registry.heightfields.insert(
                cell_position,
                HeightfieldData {
                    heightfield: Arc::new(heightfield),
                    tiles,
                },
            );

            true
        })
    }

    pub fn remove_heightfield(
        &self,
        cell_position: IVec2,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> bool {
        self.with_registry(guard, |registry, _| {
            let Some(data) = registry.heightfields.remove(&cell_position) else {
                return false;
            };

            retile(
                &mut registry.tile_heightfields,
                &mut registry.pending,
                cell_position,
                &data.tiles,
                &[],
            );

            true
        })
    }

    /// Stores the active range. Returns the populated tiles that just entered it, with their revision.
    pub fn set_range(
        &self,
        range: TilesPositionsRange,
        guard: Option<&mut UpdateGuard<'_>>,
    ) -> Vec<(TilePosition, u64)> {
        self.with_registry(guard, |registry, _| {
            let previous = registry.range.replace(range);
            if previous == Some(range) {
                return Vec::new();
            }

            self.tiles_in_range(range)
                .into_iter()
                .filter(|(tile, _)| !previous.is_some_and(|previous| previous.contains(*tile)))
                .collect()
        })
    }

    /// Returns every populated tile in ``range`` with its revision.
    pub fn tiles_in_range(&self, range: TilesPositionsRange) -> Vec<(TilePosition, u64)> {
        let Ok(tiles) = self.tiles.read() else {
            error!("Recast tile lock has been poisoned.");
            return Vec::new();
        };

        let range_size = (range.end - range.begin).max(IVec2::ZERO);
        if tiles.len() < (range_size.x * range_size.y) as usize {
            tiles
                .iter()
                .filter(|(tile, _)| range.contains(**tile))
                .map(|(tile, snapshot)| (*tile, snapshot.revision))
                .collect()
        } else {
            range
                .iter()
                .filter_map(|tile| tiles.get(&tile).map(|snapshot| (tile, snapshot.revision)))
                .collect()
        }
    }

    /// Commits pending edits and returns every tile changed since the last call.
    pub fn take_changed_tiles(&self, guard: Option<&mut UpdateGuard<'_>>) -> ChangedTiles {
        match guard {
            Some(guard) => {
                guard.commit();
                std::mem::take(&mut guard.registry.changed)
            }
            None => {
                if self.is_guarded_by_current_thread() {
                    return ChangedTiles::default();
                }

                let mut registry = self.lock_registry();
                self.commit(&mut registry);
                std::mem::take(&mut registry.changed)
            }
        }
    }

    /// Latest committed revision of ``tile``, ``None`` if nothing overlaps it.
    pub fn tile_revision(&self, tile: TilePosition) -> Option<u64> {
        self.tile_snapshot(tile).map(|snapshot| snapshot.revision)
    }

    /// Latest committed geometry of ``tile``, ``None`` if nothing overlaps it.
    pub fn tile_snapshot(&self, tile: TilePosition) -> Option<Arc<TileSnapshot>> {
        let Ok(tiles) = self.tiles.read() else {
            error!("Recast tile lock has been poisoned.");
            return None;
        };

        tiles.get(&tile).cloned()
    }

    /// Amount of populated tiles.
    pub fn tile_count(&self) -> usize {
        self.tiles.read().map(|tiles| tiles.len()).unwrap_or(0)
    }

    pub fn recast_mesh(&self, tile: TilePosition) -> Option<Arc<RecastMesh>> {
        self.tile_snapshot(tile)?.recast_mesh()
    }

    pub fn recast_mesh_tiles(&self) -> RecastMeshTiles {
        let snapshots: Vec<Arc<TileSnapshot>> = {
            let Ok(tiles) = self.tiles.read() else {
                error!("Recast tile lock has been poisoned.");
                return RecastMeshTiles::default();
            };
            tiles.values().cloned().collect()
        };

        snapshots
            .into_iter()
            .filter_map(|snapshot| Some((snapshot.position, snapshot.recast_mesh()?)))
            .collect()
    }

    fn lock_registry(&self) -> MutexGuard<'_, Registry> {
        // Every mutation leaves the registry consistent before anything that can panic.
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_guard_owner(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.guard_owner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn is_guarded_by_current_thread(&self) -> bool {
        let guarded = *self.lock_guard_owner() == Some(thread::current().id());
        if guarded {
            error!("Recast mesh accessed without the update guard this thread holds, ignoring the call.");
        }

        guarded
    }

    /// Runs ``f`` on the registry. Without a guard the edit is committed right away.
    ///
    /// Changes nothing and returns the default if this thread holds a guard it didn't pass, locking would never return.
    fn with_registry<R: Default>(
        &self,
        guard: Option<&mut UpdateGuard<'_>>,
        f: impl FnOnce(&mut Registry, &NavigatorSettings) -> R,
    ) -> R {
        match guard {
            Some(guard) => {
                debug_assert!(std::ptr::eq(guard.manager, self));
                f(&mut *guard.registry, &self.settings)
            }
            None => {
                if self.is_guarded_by_current_thread() {
                    return R::default();
                }

                let mut registry = self.lock_registry();
                let result = f(&mut *registry, &self.settings);
                self.commit(&mut registry);
                result
            }
        }
    }

    fn commit(&self, registry: &mut Registry) {
        if registry.pending.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut registry.pending);
        registry.revision += 1;
        let revision = registry.revision;

        let snapshots: Vec<Arc<TileSnapshot>> = pending
            .keys()
            .map(|tile| Arc::new(self.create_snapshot(registry, *tile, revision)))
            .collect();

        {
            let Ok(mut tiles) = self.tiles.write() else {
                error!("Recast tile lock has been poisoned. Tiles can no longer be revised.");
                return;
            };
            for snapshot in snapshots {
                if snapshot.is_empty() {
                    tiles.remove(&snapshot.position);
                } else {
                    tiles.insert(snapshot.position, snapshot);
                }
            }
        }

        for (tile, change_type) in pending {
            mark_changed(&mut registry.changed, tile, change_type);
        }
        self.revision.store(revision, Ordering::Release);
    }

    fn create_snapshot(&self, registry: &Registry, tile: TilePosition, revision: u64) -> TileSnapshot {
        let (min, max) = self.settings.get_tile_bounds_with_border(tile);

        let mut object_ids: Vec<ObjectId> = registry
            .tile_objects
            .get(&tile)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default();
        object_ids.sort_unstable();
        let objects = object_ids
            .iter()
            .filter_map(|id| registry.objects.get(id))
            .map(|object| (object.area, object.triangles.clone()))
            .collect();

        let water = sorted_cells(registry.tile_water.get(&tile))
            .iter()
            .filter_map(|cell| registry.water.get(cell))
            .map(|data| data.water)
            .collect();

        let heightfields = sorted_cells(registry.tile_heightfields.get(&tile))
            .iter()
            .filter_map(|cell| registry.heightfields.get(cell))
            .map(|data| data.heightfield.clone())
            .collect();

        TileSnapshot {
            position: tile,
            revision,
            min,
            max,
            objects,
            water,
            heightfields,
            recast_mesh: OnceLock::new(),
        }
    }
}

fn sorted_cells(cells: Option<&HashSet<IVec2>>) -> Vec<IVec2> {
    let mut cells: Vec<IVec2> = cells
        .map(|cells| cells.iter().copied().collect())
        .unwrap_or_default();
    cells.sort_unstable_by_key(|cell| (cell.x, cell.y));

    cells
}

fn mark_changed(changed: &mut ChangedTiles, tile: TilePosition, change_type: ChangeType) {
    changed
        .entry(tile)
        .and_modify(|existing| *existing = existing.merge(change_type))
        .or_insert(change_type);
}

/// Moves ``key`` from ``old_tiles`` to ``new_tiles`` in ``index``, marking every affected tile.
fn retile<K: Copy + Eq + Hash>(
    index: &mut HashMap<TilePosition, HashSet<K>>,
    pending: &mut ChangedTiles,
    key: K,
    old_tiles: &[TilePosition],
    new_tiles: &[TilePosition],
) {
    for old_tile in old_tiles {
        if new_tiles.contains(old_tile) {
            mark_changed(pending, *old_tile, ChangeType::Update);
            continue;
        }

        if let Some(keys) = index.get_mut(old_tile) {
            keys.remove(&key);
            if keys.is_empty() {
                index.remove(old_tile);
            }
        }
        mark_changed(pending, *old_tile, ChangeType::Remove);
    }

    for new_tile in new_tiles {
        if old_tiles.contains(new_tile) {
            continue;
        }

        index.entry(*new_tile).or_default().insert(key);
        mark_changed(pending, *new_tile, ChangeType::Add);
    }
}

/// Tiles overlapping the bounds, expanded by the tile border.
fn get_tiles_for_bounds(settings: &NavigatorSettings, min: Vec3, max: Vec3) -> TileList {
    let border = settings.get_border_size();
    let half_extents = settings.world_half_extents;

    let min_tile = settings.get_tile_containing_position(
        (Vec2::new(min.x, min.z) - border).max(Vec2::splat(-half_extents)),
    );
    let max_tile = settings.get_tile_containing_position(
        (Vec2::new(max.x, max.z) + border).min(Vec2::splat(half_extents)),
    );

    let mut tiles = TileList::new();
    for y in min_tile.y..=max_tile.y {
        for x in min_tile.x..=max_tile.x {
            tiles.push(TilePosition::new(x, y));
        }
    }

    tiles
}
