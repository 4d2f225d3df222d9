use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use model::{PayloadError, TileCoord, TileKey, TilePayload};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("stored tile {key} failed to decode: {source}")]
    Decode {
        key: TileKey,
        #[source]
        source: PayloadError,
    },
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
}

/// Backing storage for coverage tiles, implemented by the host.
///
/// `load_tile` is a blocking point lookup and is only called from hot/viewport
/// recomputation. `save_dirty_tiles_and_clear` runs on flush workers and must
/// apply a batch atomically: on `Err` the whole batch is retried.
pub trait TileStore: Send + Sync {
    fn load_tile(&self, coord: TileCoord) -> Result<Option<TilePayload>, StoreError>;

    fn save_dirty_tiles_and_clear(
        &self,
        batch: &[(TileKey, TilePayload)],
    ) -> Result<(), StoreError>;

    /// Fire-and-forget hint that these tiles will be requested soon.
    fn prefetch_tiles(&self, keys: &HashSet<TileKey>) {
        let _ = keys;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct StoredTile {
    bytes: Vec<u8>,
    save_count: u32,
}

/// In-process store keeping every tile in its encoded binary form.
#[derive(Debug, Default)]
pub struct MemoryTileStore {
    tiles: Mutex<HashMap<TileKey, StoredTile>>,
    loads: AtomicU64,
    save_batches: AtomicU64,
    saved_tiles: AtomicU64,
    prefetch_hints: AtomicU64,
}

impl MemoryTileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the store directly, bypassing the save counters.
    pub fn insert_payload(&self, payload: &TilePayload) {
        lock(&self.tiles).insert(
            payload.coord.key(),
            StoredTile {
                bytes: payload.encode(),
                save_count: 0,
            },
        );
    }

    /// Replaces a stored tile with raw bytes, e.g. to simulate corruption.
    pub fn insert_raw(&self, key: TileKey, bytes: Vec<u8>) {
        lock(&self.tiles).insert(
            key,
            StoredTile {
                bytes,
                save_count: 0,
            },
        );
    }

    pub fn len(&self) -> usize {
        lock(&self.tiles).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tiles).is_empty()
    }

    pub fn contains(&self, key: TileKey) -> bool {
        lock(&self.tiles).contains_key(&key)
    }

    pub fn payload(&self, key: TileKey) -> Option<TilePayload> {
        let tiles = lock(&self.tiles);
        TilePayload::decode(&tiles.get(&key)?.bytes).ok()
    }

    pub fn saved_revision(&self, key: TileKey) -> Option<u64> {
        self.payload(key).map(|payload| payload.rev)
    }

    pub fn save_count_for(&self, key: TileKey) -> u32 {
        lock(&self.tiles)
            .get(&key)
            .map_or(0, |stored| stored.save_count)
    }

    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn save_batch_count(&self) -> u64 {
        self.save_batches.load(Ordering::Relaxed)
    }

    pub fn saved_tile_count(&self) -> u64 {
        self.saved_tiles.load(Ordering::Relaxed)
    }

    pub fn prefetch_hint_count(&self) -> u64 {
        self.prefetch_hints.load(Ordering::Relaxed)
    }
}

impl TileStore for MemoryTileStore {
    fn load_tile(&self, coord: TileCoord) -> Result<Option<TilePayload>, StoreError> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let key = coord.key();
        let tiles = lock(&self.tiles);
        let Some(stored) = tiles.get(&key) else {
            return Ok(None);
        };
        TilePayload::decode(&stored.bytes)
            .map(Some)
            .map_err(|source| StoreError::Decode { key, source })
    }

    fn save_dirty_tiles_and_clear(
        &self,
        batch: &[(TileKey, TilePayload)],
    ) -> Result<(), StoreError> {
        let encoded: Vec<(TileKey, Vec<u8>)> = batch
            .iter()
            .map(|(key, payload)| (*key, payload.encode()))
            .collect();
        let mut tiles = lock(&self.tiles);
        for (key, bytes) in encoded {
            let stored = tiles.entry(key).or_default();
            stored.bytes = bytes;
            stored.save_count += 1;
        }
        self.save_batches.fetch_add(1, Ordering::Relaxed);
        self.saved_tiles
            .fetch_add(batch.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn prefetch_tiles(&self, keys: &HashSet<TileKey>) {
        self.prefetch_hints
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
    }
}
