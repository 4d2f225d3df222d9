use model::{GridError, PayloadError, TileKey};
use thiserror::Error;
use tiles::StoreError;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum CoverageError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Grid(#[from] GridError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("tile {key} payload rejected: {source}")]
    Payload {
        key: TileKey,
        #[source]
        source: PayloadError,
    },
    #[error("no coverage job is running")]
    NoSession,
    #[error("a coverage job is already running")]
    AlreadyRunning,
    #[error("coordinates are not finite")]
    NonFiniteCoordinate,
    #[error("viewport bounds are empty or not finite")]
    InvalidBounds,
    #[error("viewport spans {tiles} tiles, limit is {limit}")]
    ViewportTooLarge { tiles: u64, limit: u64 },
    #[error("bitmap stride {stride} must be positive and divide tile size {tile_size}")]
    InvalidStride { stride: u32, tile_size: u32 },
    #[error("snapshot grid does not match the running job")]
    SnapshotGridMismatch,
}
