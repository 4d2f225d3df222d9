//! Tile residency, LRU bookkeeping and the backing store contract.

mod lifecycle;
mod lru;
mod residency;
mod store;

pub use lifecycle::{EvictionBlocker, eviction_blocker};
pub use lru::{LruCache, LruIndex};
pub use residency::{TileResidency, ring, square_window};
pub use store::{MemoryTileStore, StoreError, TileStore};
