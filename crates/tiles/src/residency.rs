use std::collections::{HashMap, HashSet};

use model::{GridSpec, TileCoord, TileData, TileKey};

use crate::lifecycle::{EvictionBlocker, eviction_blocker};
use crate::lru::LruIndex;

/// Tiles with Chebyshev distance `<= radius` from `center`, row by row.
pub fn square_window(center: TileCoord, radius: u32) -> Vec<TileCoord> {
    let radius = radius as i32;
    let mut coords = Vec::with_capacity(((2 * radius + 1) * (2 * radius + 1)) as usize);
    for dy in -radius..=radius {
        for dx in -radius..=radius {
            coords.push(center.offset(dx, dy));
        }
    }
    coords
}

/// Tiles at Chebyshev distance exactly `radius` from `center`.
pub fn ring(center: TileCoord, radius: u32) -> Vec<TileCoord> {
    square_window(center, radius)
        .into_iter()
        .filter(|coord| coord.ring_distance(center) == radius)
        .collect()
}

/// Resident tiles plus the hot/visible membership that keeps them resident.
#[derive(Debug)]
pub struct TileResidency {
    grid: GridSpec,
    tiles: HashMap<TileKey, TileData>,
    hot: HashSet<TileKey>,
    visible: HashSet<TileKey>,
    pending_store_load: HashSet<TileKey>,
    lru: LruIndex<TileKey>,
}

impl TileResidency {
    pub fn new(grid: GridSpec, lru_capacity: usize) -> Self {
        Self {
            grid,
            tiles: HashMap::new(),
            hot: HashSet::new(),
            visible: HashSet::new(),
            pending_store_load: HashSet::new(),
            lru: LruIndex::new(lru_capacity),
        }
    }

    pub fn grid(&self) -> GridSpec {
        self.grid
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn contains(&self, key: TileKey) -> bool {
        self.tiles.contains_key(&key)
    }

    pub fn tile(&self, key: TileKey) -> Option<&TileData> {
        self.tiles.get(&key)
    }

    pub fn tile_mut(&mut self, key: TileKey) -> Option<&mut TileData> {
        self.tiles.get_mut(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TileKey, &TileData)> {
        self.tiles.iter().map(|(key, tile)| (*key, tile))
    }

    pub fn keys(&self) -> Vec<TileKey> {
        self.tiles.keys().copied().collect()
    }

    pub fn touch(&mut self, key: TileKey) {
        if self.tiles.contains_key(&key) {
            self.lru.touch(key);
        }
    }

    /// Paint target lookup: only hot tiles are writable.
    pub fn paintable_mut(&mut self, key: TileKey) -> Option<&mut TileData> {
        if !self.hot.contains(&key) {
            return None;
        }
        let tile = self.tiles.get_mut(&key)?;
        self.lru.touch(key);
        Some(tile)
    }

    pub fn is_hot(&self, key: TileKey) -> bool {
        self.hot.contains(&key)
    }

    pub fn is_visible(&self, key: TileKey) -> bool {
        self.visible.contains(&key)
    }

    pub fn hot_keys(&self) -> &HashSet<TileKey> {
        &self.hot
    }

    pub fn visible_keys(&self) -> &HashSet<TileKey> {
        &self.visible
    }

    pub fn is_pending_load(&self, key: TileKey) -> bool {
        self.pending_store_load.contains(&key)
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending_store_load.len()
    }

    /// Absent tiles and tiles whose last lookup missed both need the store.
    pub fn needs_store_lookup(&self, key: TileKey) -> bool {
        !self.tiles.contains_key(&key) || self.pending_store_load.contains(&key)
    }

    pub fn insert(&mut self, key: TileKey, tile: TileData) -> Option<TileData> {
        self.lru.touch(key);
        self.tiles.insert(key, tile)
    }

    /// Allocates an empty tile if none is resident. Returns true if allocated.
    pub fn allocate_missing(&mut self, key: TileKey) -> bool {
        self.lru.touch(key);
        if self.tiles.contains_key(&key) {
            return false;
        }
        self.tiles.insert(key, TileData::new(self.grid.tile_size()));
        true
    }

    pub fn mark_pending_load(&mut self, key: TileKey) {
        self.pending_store_load.insert(key);
    }

    pub fn clear_pending_load(&mut self, key: TileKey) -> bool {
        self.pending_store_load.remove(&key)
    }

    /// Swaps in a new hot set, returning the keys that left it.
    pub fn replace_hot(&mut self, hot: HashSet<TileKey>) -> Vec<TileKey> {
        let departed = self.hot.difference(&hot).copied().collect();
        self.hot = hot;
        departed
    }

    /// Swaps in a new visible set, returning the keys that left it.
    pub fn replace_visible(&mut self, visible: HashSet<TileKey>) -> Vec<TileKey> {
        let departed = self.visible.difference(&visible).copied().collect();
        self.visible = visible;
        departed
    }

    pub fn eviction_blocker(&self, key: TileKey, flush_pending: bool) -> Option<EvictionBlocker> {
        let tile = self.tiles.get(&key)?;
        eviction_blocker(
            tile,
            self.hot.contains(&key),
            self.visible.contains(&key),
            flush_pending,
        )
    }

    /// Unconditionally drops a tile and its bookkeeping.
    ///
    /// Callers must consult [`Self::eviction_blocker`] first.
    pub fn evict(&mut self, key: TileKey) -> Option<TileData> {
        self.lru.remove(key);
        self.pending_store_load.remove(&key);
        self.tiles.remove(&key)
    }

    /// Least recently used keys beyond the LRU capacity, oldest first.
    pub fn lru_overflow(&self) -> Vec<TileKey> {
        let excess = self.lru.len().saturating_sub(self.lru.capacity());
        self.lru
            .oldest_first()
            .filter(|key| !self.hot.contains(key) && !self.visible.contains(key))
            .take(excess)
            .collect()
    }

    pub fn lru_len(&self) -> usize {
        self.lru.len()
    }

    pub fn approx_bytes(&self) -> usize {
        self.tiles.values().map(TileData::approx_bytes).sum()
    }

    pub fn clear(&mut self) {
        self.tiles.clear();
        self.hot.clear();
        self.visible.clear();
        self.pending_store_load.clear();
        self.lru.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::PixelWrite;

    fn residency() -> TileResidency {
        TileResidency::new(GridSpec::new(0.1, 16).expect("grid"), 4)
    }

    #[test]
    fn window_and_ring_sizes() {
        let center = TileCoord::new(-2, 5);
        assert_eq!(square_window(center, 0), vec![center]);
        assert_eq!(square_window(center, 2).len(), 25);
        let outer = ring(center, 3);
        assert_eq!(outer.len(), 7 * 7 - 5 * 5);
        assert!(outer.iter().all(|coord| coord.ring_distance(center) == 3));
    }

    #[test]
    fn only_hot_tiles_are_paintable() {
        let mut residency = residency();
        let key = TileKey::pack(0, 0);
        residency.allocate_missing(key);
        assert!(residency.paintable_mut(key).is_none());
        residency.replace_hot(HashSet::from([key]));
        assert!(residency.paintable_mut(key).is_some());
    }

    #[test]
    fn replace_hot_reports_departures() {
        let mut residency = residency();
        let a = TileKey::pack(0, 0);
        let b = TileKey::pack(1, 0);
        residency.replace_hot(HashSet::from([a, b]));
        let departed = residency.replace_hot(HashSet::from([b]));
        assert_eq!(departed, vec![a]);
    }

    #[test]
    fn pending_load_marks_need_for_lookup() {
        let mut residency = residency();
        let key = TileKey::pack(3, 3);
        assert!(residency.needs_store_lookup(key));
        residency.allocate_missing(key);
        assert!(!residency.needs_store_lookup(key));
        residency.mark_pending_load(key);
        assert!(residency.needs_store_lookup(key));
        residency.evict(key);
        assert!(!residency.is_pending_load(key));
    }

    #[test]
    fn dirty_tile_is_blocked_from_eviction() {
        let mut residency = residency();
        let key = TileKey::pack(0, 0);
        residency.allocate_missing(key);
        if let Some(tile) = residency.tile_mut(key) {
            tile.write_pixel(
                0,
                &PixelWrite {
                    stroke_id: 1,
                    sections: 0,
                    rate: None,
                    speed: None,
                    front_max_age: 16,
                },
            );
        }
        assert_eq!(
            residency.eviction_blocker(key, false),
            Some(EvictionBlocker::Dirty)
        );
    }

    #[test]
    fn lru_overflow_skips_members() {
        let mut residency = residency();
        for tx in 0..6 {
            residency.allocate_missing(TileKey::pack(tx, 0));
        }
        residency.replace_visible(HashSet::from([TileKey::pack(0, 0)]));
        assert_eq!(residency.lru_overflow(), vec![TileKey::pack(1, 0), TileKey::pack(2, 0)]);
    }
}
