use std::fmt;

use crate::{async_updater::AsyncNavMeshUpdaterStats, TilePosition};

/// Snapshot of the state of the whole pipeline, for debug overlays & telemetry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub worldspace: String,
    pub player_tile: Option<TilePosition>,
    pub agents: usize,
    pub recast_mesh_revision: u64,
    /// Populated tiles of the recast mesh manager.
    pub recast_tiles: usize,
    /// Published tiles summed over all agents.
    pub nav_mesh_tiles: usize,
    pub nav_mesh_polygons: usize,
    pub updater: AsyncNavMeshUpdaterStats,
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let updater = &self.updater;

        writeln!(f, "Worldspace: {}", self.worldspace)?;
        match self.player_tile {
            Some(tile) => writeln!(f, "Player tile: {} {}", tile.x, tile.y)?,
            None => writeln!(f, "Player tile: -")?,
        }
        writeln!(f, "Agents: {}", self.agents)?;
        writeln!(f, "Recast mesh revision: {}", self.recast_mesh_revision)?;
        writeln!(f, "Recast tiles: {}", self.recast_tiles)?;
        writeln!(f, "NavMesh tiles: {}", self.nav_mesh_tiles)?;
        writeln!(f, "NavMesh polygons: {}", self.nav_mesh_polygons)?;

        writeln!(f, "NavMesh jobs: {}", updater.jobs)?;
        writeln!(f, "NavMesh parked jobs: {}", updater.parked)?;
        writeln!(f, "NavMesh processing: {}", updater.processing)?;
        writeln!(f, "NavMesh pushed: {}", updater.pushed)?;
        writeln!(f, "NavMesh coalesced: {}", updater.coalesced)?;
        writeln!(f, "NavMesh dropped: {}", updater.dropped)?;
        writeln!(f, "NavMesh built: {}", updater.built)?;
        writeln!(f, "NavMesh failed: {}", updater.failed)?;
        writeln!(f, "NavMesh generation: {}", updater.generation)?;

        let cache = &updater.tiles_cache;
        writeln!(
            f,
            "NavMesh cache: {} tile(s), {}/{} bytes, {} hit(s), {} miss(es)",
            cache.tiles, cache.size, cache.max_size, cache.hits, cache.misses
        )?;

        if let Some(db) = &updater.db {
            writeln!(
                f,
                "NavMesh db: {} byte(s), {} read(s), {} hit(s), {} read failure(s), {} write(s), {} write failure(s){}",
                db.size,
                db.reads,
                db.hits,
                db.read_failures,
                db.writes,
                db.write_failures,
                if db.writes_enabled { "" } else { ", writes disabled" }
            )?;
        }

        Ok(())
    }
}
