use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use bevy::prelude::{Vec2, Vec3};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{AreaType, NavigatorSettings, ObjectId, TilePosition};

/// Manually placed link between two points, eg. a door teleporting to another place.
///
/// Traversable both ways.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OffMeshConnection {
    pub start: [f32; 3],
    pub end: [f32; 3],
    pub area: AreaType,
}

impl OffMeshConnection {
    pub fn new(start: Vec3, end: Vec3, area: AreaType) -> Self {
        Self {
            start: start.to_array(),
            end: end.to_array(),
            area,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.start.iter().chain(self.end.iter()).all(|value| value.is_finite())
    }
}

#[derive(Default)]
struct Connections {
    by_id: BTreeMap<ObjectId, Vec<(OffMeshConnection, SmallVec<[TilePosition; 2]>)>>,
    by_tile: HashMap<TilePosition, BTreeSet<ObjectId>>,
    /// Only tiles that still have connections.
    revisions: HashMap<TilePosition, u64>,
    revision: u64,
}

impl Connections {
    fn touch(&mut self, tiles: &[TilePosition]) {
        self.revision += 1;
        for tile in tiles {
            if self.by_tile.contains_key(tile) {
                self.revisions.insert(*tile, self.revision);
            } else {
                self.revisions.remove(tile);
            }
        }
    }
}

/// Off-mesh connections indexed by owner & by the tiles their end points are in.
///
/// These don't take part in the recast mesh revisions, every change bumps a separate per tile revision instead. Tiles
/// left without connections fall back to the global [`OffMeshConnectionsManager::revision`].
pub struct OffMeshConnectionsManager {
    settings: NavigatorSettings,
    connections: Mutex<Connections>,
}

impl OffMeshConnectionsManager {
    pub fn new(settings: NavigatorSettings) -> Self {
        Self {
            settings,
            connections: Mutex::default(),
        }
    }

    /// Adds a connection owned by ``id``. Returns the tiles that need to be rebuilt.
    pub fn add(&self, id: ObjectId, connection: OffMeshConnection) -> Vec<TilePosition> {
        if !connection.is_valid() {
            return Vec::new();
        }

        let mut tiles: SmallVec<[TilePosition; 2]> = SmallVec::new();
        for point in [connection.start, connection.end] {
            let tile = self
                .settings
                .get_tile_containing_position(Vec2::new(point[0], point[2]));
            if !tiles.contains(&tile) {
                tiles.push(tile);
            }
        }

        let mut connections = self.lock();
        let owned = connections.by_id.entry(id).or_default();
        if owned.iter().any(|(existing, _)| *existing == connection) {
            return Vec::new();
        }
        owned.push((connection, tiles.clone()));

        for tile in &tiles {
            connections.by_tile.entry(*tile).or_default().insert(id);
        }
        connections.touch(&tiles);

        tiles.into_vec()
    }

    /// Removes every connection owned by ``id``. Returns the tiles that need to be rebuilt.
    pub fn remove(&self, id: ObjectId) -> Vec<TilePosition> {
        let mut connections = self.lock();
        let Some(owned) = connections.by_id.remove(&id) else {
            return Vec::new();
        };

        let mut tiles: Vec<TilePosition> = owned
            .iter()
            .flat_map(|(_, tiles)| tiles.iter().copied())
            .collect();
        tiles.sort_unstable_by_key(|tile| (tile.x, tile.y));
        tiles.dedup();

        for tile in &tiles {
            if let Some(ids) = connections.by_tile.get_mut(tile) {
                ids.remove(&id);
                if ids.is_empty() {
                    connections.by_tile.remove(tile);
                }
            }
        }
        connections.touch(&tiles);

        tiles
    }

    /// Connections with at least one end point in ``tile``, ordered by owner.
    pub fn get(&self, tile: TilePosition) -> Vec<OffMeshConnection> {
        let connections = self.lock();
        let Some(ids) = connections.by_tile.get(&tile) else {
            return Vec::new();
        };

        ids.iter()
            .filter_map(|id| connections.by_id.get(id))
            .flatten()
            .filter(|(_, tiles)| tiles.contains(&tile))
            .map(|(connection, _)| *connection)
            .collect()
    }

    /// Revision of the last change touching ``tile``, ``None`` if it has no connections.
    pub fn tile_revision(&self, tile: TilePosition) -> Option<u64> {
        self.lock().revisions.get(&tile).copied()
    }

    /// Bumped by every change.
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Drops every connection. Returns the tiles that need to be rebuilt.
    pub fn clear(&self) -> Vec<TilePosition> {
        let mut connections = self.lock();
        let tiles: Vec<TilePosition> = connections.by_tile.keys().copied().collect();
        connections.by_id.clear();
        connections.by_tile.clear();
        connections.touch(&tiles);

        tiles
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connections> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
