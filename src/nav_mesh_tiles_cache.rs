use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use crate::{tiles::PreparedNavMeshData, AgentBounds, TilePosition};

/// Identifies generated tile data by everything that went into building it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileCacheKey {
    pub agent_bounds: AgentBounds,
    pub tile: TilePosition,
    /// Hash of the recast mesh, off-mesh connections & build parameters.
    pub input_hash: [u8; 32],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NavMeshTilesCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub tiles: usize,
    pub size: usize,
    pub max_size: usize,
}

struct CacheEntry {
    data: Arc<PreparedNavMeshData>,
    size: usize,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<TileCacheKey, CacheEntry>,
    /// Least recently used first.
    usage: BTreeMap<u64, TileCacheKey>,
    clock: u64,
    size: usize,
    hits: u64,
    misses: u64,
}

impl CacheState {
    fn touch(&mut self, key: &TileCacheKey) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(entry) = self.entries.get_mut(key) {
            self.usage.remove(&entry.last_used);
            entry.last_used = clock;
            self.usage.insert(clock, *key);
        }
    }

    fn remove(&mut self, key: &TileCacheKey) {
        if let Some(entry) = self.entries.remove(key) {
            self.usage.remove(&entry.last_used);
            self.size -= entry.size;
        }
    }
}

/// In-memory cache of generated tile data, bounded by approximate size in bytes.
///
/// Avoids rebuilding tiles that go back to a previous state, eg. a door opening & closing.
pub struct NavMeshTilesCache {
    max_size: usize,
    state: Mutex<CacheState>,
}

impl NavMeshTilesCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            state: Mutex::default(),
        }
    }

    pub fn get(&self, key: &TileCacheKey) -> Option<Arc<PreparedNavMeshData>> {
        let mut state = self.lock();

        let Some(data) = state.entries.get(key).map(|entry| entry.data.clone()) else {
            state.misses += 1;
            return None;
        };
        state.hits += 1;
        state.touch(key);

        Some(data)
    }

    /// Inserts tile data, evicting the least recently used entries until it fits.
    ///
    /// Data larger than the whole cache is not stored.
    pub fn set(&self, key: TileCacheKey, data: Arc<PreparedNavMeshData>) {
        let size = data.approximate_size();
        if size > self.max_size {
            return;
        }

        let mut state = self.lock();
        state.remove(&key);

        while state.size + size > self.max_size {
            let Some((_, oldest)) = state.usage.pop_first() else {
                break;
            };
            if let Some(entry) = state.entries.remove(&oldest) {
                state.size -= entry.size;
            }
        }

        state.clock += 1;
        let clock = state.clock;
        state.usage.insert(clock, key);
        state.entries.insert(
            key,
            CacheEntry {
                data,
                size,
                last_used: clock,
            },
        );
        state.size += size;
    }

    pub fn stats(&self) -> NavMeshTilesCacheStats {
        let state = self.lock();

        NavMeshTilesCacheStats {
            hits: state.hits,
            misses: state.misses,
            tiles: state.entries.len(),
            size: state.size,
            max_size: self.max_size,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: i32) -> TileCacheKey {
        TileCacheKey {
            agent_bounds: AgentBounds::new(0.3, 0.9),
            tile: TilePosition::new(x, 0),
            input_hash: [x as u8; 32],
        }
    }

    fn data(x: i32) -> Arc<PreparedNavMeshData> {
        Arc::new(PreparedNavMeshData {
            tile: [x, 0],
            polygons: Vec::new(),
            off_mesh_links: Vec::new(),
        })
    }

    #[test]
    fn least_recently_used_is_evicted() {
        let entry_size = data(0).approximate_size();
        let cache = NavMeshTilesCache::new(entry_size * 2);

        cache.set(key(1), data(1));
        cache.set(key(2), data(2));
        // Tile 1 is now more recent than tile 2.
        assert!(cache.get(&key(1)).is_some());

        cache.set(key(3), data(3));
        assert!(cache.get(&key(2)).is_none());
        assert_eq!(cache.get(&key(1)).map(|data| data.tile), Some([1, 0]));
        assert!(cache.get(&key(3)).is_some());

        let stats = cache.stats();
        assert_eq!(stats.tiles, 2);
        assert_eq!(stats.size, entry_size * 2);
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn zero_sized_cache_stores_nothing() {
        let cache = NavMeshTilesCache::new(0);
        cache.set(key(1), data(1));

        assert!(cache.get(&key(1)).is_none());
        assert_eq!(cache.stats().tiles, 0);
    }
}
