//! Tiled **incremental** nav-mesh generation for 3D worlds with several agent sizes.
//!
//! Takes in collision shapes, terrain heightfields, water planes and off-mesh connections registered with a
//! [`NavMeshManager`] and **asynchronously** generates tiles of navigation meshes for every registered
//! [`AgentBounds`], based on [`NavigatorSettings`]. Generated tiles are cached in memory and optionally persisted to a
//! [`nav_mesh_db::NavMeshDb`] so they don't have to be rebuilt on the next run. Nav-meshes can then be queried using
//! [`query::find_path`].
//!
//! ## Quick-start:
//! **Nav-mesh generation:**
//! 1. Create a [`NavMeshManager`] with your [`NavigatorSettings`] and optionally a database (eg. [`nav_mesh_db::FileNavMeshDb`]).
//! 2. Call [`NavMeshManager::set_worldspace`] and [`NavMeshManager::add_agent`] for every agent size you need.
//! 3. Register geometry with [`NavMeshManager::add_object`], [`NavMeshManager::add_heightfield`] and [`NavMeshManager::add_water`].
//!    Batch many edits with [`NavMeshManager::begin_update`] so every touched tile is only revised once.
//! 4. Call [`NavMeshManager::update`] with the player position whenever the world changed, this enqueues the rebuilds.
//!
//! *At this point tiles will be generated in the background closest to the player first. Use [`NavMeshManager::wait`] to block until the tiles around the player are present (eg. during a loading screen).*
//!
//! **Querying the nav-mesh / Pathfinding:**
//! 1. Get the cache item for your agent with [`NavMeshManager::get_nav_mesh`].
//! 2. Take a snapshot with [`tiles::NavMeshCacheItem::nav_mesh`]. *Snapshots are immutable, holding one never blocks generation.*
//! 3. Call [`query::find_path`] or [`query::raycast`] with the snapshot.

use std::num::NonZeroU16;

use bevy::prelude::{IVec2, Vec2, Vec3};
#[cfg(feature = "trace")]
use bevy::prelude::info_span;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use heightfields::{
    build_heightfield_tile, build_open_heightfield_tile, erode_walkable_area,
    filter_small_islands,
};
use mesher::build_poly_mesh;
use off_mesh_connections::OffMeshConnection;
use recast_mesh::RecastMesh;
use tiles::{create_prepared_nav_mesh_data, PreparedNavMeshData};

pub mod agent_bounds;
pub mod async_updater;
pub mod conversion;
mod heightfields;
pub mod manager;
mod mesher;
pub mod nav_mesh_db;
pub mod nav_mesh_tiles_cache;
pub mod off_mesh_connections;
pub mod query;
pub mod recast_mesh;
pub mod recast_mesh_manager;
pub mod stats;
pub mod tiles;

pub use agent_bounds::{AgentBounds, TileBuildParameters};
pub use manager::{NavMeshManager, UpdateGuard};

/// Version of the generated tile data.
///
/// Part of every database key and record. Bump it whenever tile generation produces different output for the same input.
pub const NAV_MESH_FORMAT_VERSION: u32 = 1;

/// Coordinate of a tile on the XZ-plane. `x` is world X, `y` is world Z.
pub type TilePosition = IVec2;

/// Identifier of an object supplied by the caller. Must be stable for as long as the object is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

/// Area type of walkable surfaces. Overlapping surfaces prefer the higher area type.
#[derive(
    Default, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[repr(u8)]
pub enum AreaType {
    /// Not walkable.
    #[default]
    Null = 0,
    Water = 1,
    Door = 2,
    Pathgrid = 3,
    Ground = 63,
}

impl AreaType {
    #[inline]
    pub fn is_walkable(self) -> bool {
        self != AreaType::Null
    }
}

/// Errors when creating a [`NavMeshManager`].
#[derive(Debug, Error)]
pub enum NavigatorError {
    #[error("Invalid navigator settings: {0}")]
    InvalidSettings(&'static str),
    #[error("Failed to spawn nav-mesh updater thread")]
    SpawnThread(#[source] std::io::Error),
}

/// Errors when building a single tile.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TileBuildError {
    #[error("Recast mesh references vertex {index} but only has {count} vertices")]
    InvalidIndex { index: u32, count: usize },
    #[error("Tile produced {0} polygons, more than a tile can address")]
    TooManyPolygons(usize),
}

/*
*   Neighbours:
*   0: (-1, 0),
*   1: (0, 1),
*   2: (1, 0),
*   3: (0, -1)
*/

/// Settings for nav-mesh generation & the update pipeline.
#[derive(Clone, Debug)]
pub struct NavigatorSettings {
    /// The horizontal resolution of the voxelized tile. Shared by all agents.
    ///
    /// **Suggested value**: 1/2 of the smallest agent radius.
    pub cell_size: f32,
    /// The vertical resolution of the voxelized tile.
    ///
    /// **Suggested value**: 1/2 of cell_size.
    pub cell_height: f32,

    /// Length of a tile's side in cells. Resulting size in world units is ``tile_size * cell_size``.
    ///
    /// Higher means more to update each time something within the tile changes, smaller means you will have more overhead from connecting the edges to other tiles & generating the tile itself.
    pub tile_size: u16,
    /// Padding in cells around each tile that is voxelized along with it, so erosion near tile edges matches the neighbouring tile.
    ///
    /// **Suggested value**: ``ceil(largest_agent_radius / cell_size) + 3``. Agents needing more cells than this are refused, see [`NavigatorSettings::fits_agent`].
    pub border_size: u16,

    /// Extents of the world as measured from the world origin (0.0, 0.0) on the XZ-plane.
    ///
    /// Anything fully outside of it is ignored.
    pub world_half_extents: f32,
    /// Bottom extents of the world on the Y-axis. The top extents is capped by ``world_bottom_bound + cell_height * u16::MAX``.
    pub world_bottom_bound: f32,

    /// Maximum incline/slope traversable when navigating in radians.
    pub max_traversable_slope_radians: f32,
    /// Maximum height difference in world units that is still considered traversable. This smooths out stair steps and small ledges.
    pub max_climb: f32,
    /// Minimum size of an island in cells, anything smaller than this will be removed. This is used to filter out smaller disconnected islands that may appear on surfaces like tables.
    pub min_region_area: u32,

    /// Maximum amount of tiles around the player that are considered in range. Tiles outside of the range are still built, just after everything in range.
    pub max_tiles_number: u32,
    /// Distance in tiles around the player tile that [`async_updater::WaitConditionType::RequiredTilesPresent`] waits for.
    pub wait_until_min_distance_to_player: i32,
    /// Amount of threads generating tiles.
    pub async_nav_mesh_updater_threads: NonZeroU16,
    /// Approximate maximum size in bytes of the in-memory cache of generated tiles. ``0`` disables the cache.
    pub max_nav_mesh_tiles_cache_size: usize,
    /// Read generated tiles from the database if one is supplied.
    pub enable_nav_mesh_disk_cache: bool,
    /// Write generated tiles to the database if one is supplied.
    pub write_to_nav_mesh_db: bool,
    /// Writes to the database stop once it has grown past this many bytes.
    pub max_db_file_size: u64,
}

impl Default for NavigatorSettings {
    fn default() -> Self {
        Self {
            cell_size: 0.25,
            cell_height: 0.1,
            tile_size: 64,
            border_size: 12,
            world_half_extents: 16384.0,
            world_bottom_bound: -1000.0,
            max_traversable_slope_radians: 49.0_f32.to_radians(),
            max_climb: 0.5,
            min_region_area: 16,
            max_tiles_number: 512,
            wait_until_min_distance_to_player: 5,
            async_nav_mesh_updater_threads: NonZeroU16::MIN,
            max_nav_mesh_tiles_cache_size: 256 * 1024 * 1024,
            enable_nav_mesh_disk_cache: true,
            write_to_nav_mesh_db: true,
            max_db_file_size: 500 * 1024 * 1024,
        }
    }
}

impl NavigatorSettings {
    /// Helper function for creating settings with reasonable defaults from the bounds of your world.
    #[inline]
    pub fn from_world_bounds(world_half_extents: f32, world_bottom_bound: f32) -> Self {
        Self {
            world_half_extents: world_half_extents.abs(),
            world_bottom_bound,
            ..Default::default()
        }
    }
    /// Setter for [`NavigatorSettings::cell_size`] & [`NavigatorSettings::cell_height`]
    pub fn with_cell_size(mut self, cell_size: f32, cell_height: f32) -> Self {
        self.cell_size = cell_size;
        self.cell_height = cell_height;

        self
    }
    /// Setter for [`NavigatorSettings::tile_size`]
    pub fn with_tile_size(mut self, tile_size: u16) -> Self {
        self.tile_size = tile_size;

        self
    }
    /// Setter for [`NavigatorSettings::border_size`]
    pub fn with_border_size(mut self, border_size: u16) -> Self {
        self.border_size = border_size;

        self
    }
    /// Setter for [`NavigatorSettings::max_traversable_slope_radians`]
    pub fn with_traversible_slope(mut self, traversible_slope: f32) -> Self {
        self.max_traversable_slope_radians = traversible_slope;

        self
    }
    /// Setter for [`NavigatorSettings::max_climb`]
    pub fn with_max_climb(mut self, max_climb: f32) -> Self {
        self.max_climb = max_climb;

        self
    }
    /// Setter for [`NavigatorSettings::min_region_area`]
    pub fn with_min_region_area(mut self, min_region_area: u32) -> Self {
        self.min_region_area = min_region_area;

        self
    }
    /// Setter for [`NavigatorSettings::max_tiles_number`]
    pub fn with_max_tiles_number(mut self, max_tiles_number: u32) -> Self {
        self.max_tiles_number = max_tiles_number;

        self
    }
    /// Setter for [`NavigatorSettings::wait_until_min_distance_to_player`]
    pub fn with_wait_until_min_distance_to_player(mut self, distance: i32) -> Self {
        self.wait_until_min_distance_to_player = distance;

        self
    }
    /// Setter for [`NavigatorSettings::async_nav_mesh_updater_threads`]
    pub fn with_async_nav_mesh_updater_threads(mut self, threads: NonZeroU16) -> Self {
        self.async_nav_mesh_updater_threads = threads;

        self
    }
    /// Setter for [`NavigatorSettings::max_nav_mesh_tiles_cache_size`]
    pub fn with_max_nav_mesh_tiles_cache_size(mut self, size: usize) -> Self {
        self.max_nav_mesh_tiles_cache_size = size;

        self
    }
    /// Setter for [`NavigatorSettings::enable_nav_mesh_disk_cache`] & [`NavigatorSettings::write_to_nav_mesh_db`]
    pub fn with_nav_mesh_disk_cache(mut self, enable: bool, write: bool) -> Self {
        self.enable_nav_mesh_disk_cache = enable;
        self.write_to_nav_mesh_db = write;

        self
    }
    /// Setter for [`NavigatorSettings::max_db_file_size`]
    pub fn with_max_db_file_size(mut self, max_db_file_size: u64) -> Self {
        self.max_db_file_size = max_db_file_size;

        self
    }

    pub fn validate(&self) -> Result<(), NavigatorError> {
        if !(self.cell_size.is_finite() && self.cell_size > 0.0) {
            return Err(NavigatorError::InvalidSettings("cell_size must be positive"));
        }
        if !(self.cell_height.is_finite() && self.cell_height > 0.0) {
            return Err(NavigatorError::InvalidSettings("cell_height must be positive"));
        }
        if self.tile_size == 0 {
            return Err(NavigatorError::InvalidSettings("tile_size must be positive"));
        }
        if !(self.world_half_extents.is_finite() && self.world_half_extents > 0.0) {
            return Err(NavigatorError::InvalidSettings(
                "world_half_extents must be positive",
            ));
        }
        if !self.world_bottom_bound.is_finite() {
            return Err(NavigatorError::InvalidSettings(
                "world_bottom_bound must be finite",
            ));
        }
        if self.max_tiles_number == 0 {
            return Err(NavigatorError::InvalidSettings(
                "max_tiles_number must be positive",
            ));
        }

        Ok(())
    }

    /// Returns true if tiles can be eroded by the radius of ``agent_bounds`` without running out of border cells.
    pub fn fits_agent(&self, agent_bounds: &AgentBounds) -> bool {
        agent_bounds.is_valid()
            && (agent_bounds.radius / self.cell_size).ceil() <= f32::from(self.border_size)
            && (agent_bounds.half_height * 2.0 / self.cell_height).ceil() <= f32::from(u16::MAX)
    }

    /// Returns the length of a tile's side in world units.
    #[inline]
    pub fn get_tile_size(&self) -> f32 {
        self.cell_size * f32::from(self.tile_size)
    }
    /// Returns the width of the tile border in world units.
    #[inline]
    pub fn get_border_size(&self) -> f32 {
        f32::from(self.border_size) * self.cell_size
    }

    /// Returns the tile coordinate that contains the supplied ``world_position``.
    #[inline]
    pub fn get_tile_containing_position(&self, world_position: Vec2) -> TilePosition {
        (world_position / self.get_tile_size()).floor().as_ivec2()
    }

    /// Returns the minimum bound of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_origin(&self, tile: TilePosition) -> Vec2 {
        tile.as_vec2() * self.get_tile_size()
    }

    /// Returns the origin of a tile on the XZ-plane including the border area.
    #[inline]
    pub fn get_tile_origin_with_border(&self, tile: TilePosition) -> Vec2 {
        self.get_tile_origin(tile) - self.get_border_size()
    }

    #[inline]
    pub fn get_tile_side_with_border(&self) -> usize {
        usize::from(self.tile_size) + usize::from(self.border_size) * 2
    }

    /// Returns the minimum & maximum bound of a tile on the XZ-plane.
    #[inline]
    pub fn get_tile_bounds(&self, tile: TilePosition) -> (Vec2, Vec2) {
        let min_bound = self.get_tile_origin(tile);
        let max_bound = min_bound + self.get_tile_size();

        (min_bound, max_bound)
    }

    /// Returns the minimum & maximum bound of a tile on the XZ-plane including the border area.
    #[inline]
    pub fn get_tile_bounds_with_border(&self, tile: TilePosition) -> (Vec2, Vec2) {
        let (min_bound, max_bound) = self.get_tile_bounds(tile);
        let border = self.get_border_size();

        (min_bound - border, max_bound + border)
    }

    /// Returns true if the box overlaps the world on the XZ-plane.
    #[inline]
    pub fn overlaps_world(&self, min: Vec3, max: Vec3) -> bool {
        let half_extents = self.world_half_extents;

        min.x <= half_extents && min.z <= half_extents && max.x >= -half_extents && max.z >= -half_extents
    }

    /// Returns the range of tiles considered in range around ``player_tile``.
    pub fn get_tiles_range(&self, player_tile: TilePosition) -> TilesPositionsRange {
        // Largest odd square side fitting inside max_tiles_number.
        let side = (self.max_tiles_number as f64).sqrt().floor() as i32;
        let half = ((side - 1) / 2).max(0);

        TilesPositionsRange {
            begin: player_tile - IVec2::splat(half),
            end: player_tile + IVec2::splat(half + 1),
        }
    }
}

/// Rectangle of tile positions. ``end`` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilesPositionsRange {
    pub begin: TilePosition,
    pub end: TilePosition,
}

impl TilesPositionsRange {
    #[inline]
    pub fn contains(&self, tile: TilePosition) -> bool {
        tile.x >= self.begin.x && tile.y >= self.begin.y && tile.x < self.end.x && tile.y < self.end.y
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.begin.x >= self.end.x || self.begin.y >= self.end.y
    }

    pub fn iter(&self) -> impl Iterator<Item = TilePosition> + '_ {
        (self.begin.y..self.end.y)
            .flat_map(move |y| (self.begin.x..self.end.x).map(move |x| TilePosition::new(x, y)))
    }
}

/// Manhattan distance in tiles.
#[inline]
pub fn get_tile_distance(a: TilePosition, b: TilePosition) -> i32 {
    let delta = (a - b).abs();

    delta.x + delta.y
}

/// Builds the nav-mesh data of a single tile for one agent.
///
/// Returns ``None`` if nothing walkable is left in the tile.
pub fn build_tile_sync(
    tile: TilePosition,
    recast_mesh: &RecastMesh,
    off_mesh_connections: &[OffMeshConnection],
    parameters: &TileBuildParameters,
) -> Result<Option<PreparedNavMeshData>, TileBuildError> {
    let voxelized_tile = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build Heightfield Tile").entered();
        build_heightfield_tile(tile, recast_mesh, parameters)?
    };

    let mut open_tile = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build Open Heightfield Tile").entered();
        build_open_heightfield_tile(&voxelized_tile, parameters)
    };

    // Remove areas that are too close to a wall.
    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Erode walkable area").entered();
        erode_walkable_area(&mut open_tile, parameters);
    }

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Filter small islands").entered();
        filter_small_islands(&mut open_tile, parameters);
    }

    let poly_mesh = {
        #[cfg(feature = "trace")]
        let _span = info_span!("Build poly mesh").entered();
        build_poly_mesh(&open_tile, parameters)
    };

    {
        #[cfg(feature = "trace")]
        let _span = info_span!("Create prepared nav-mesh data").entered();
        create_prepared_nav_mesh_data(&poly_mesh, tile, off_mesh_connections, parameters)
    }
}

fn get_neighbour_index(side: usize, index: usize, dir: usize) -> usize {
    match dir {
        0 => index - 1,
        1 => index + side,
        2 => index + 1,
        3 => index - side,
        _ => panic!("Not a valid direction"),
    }
}
