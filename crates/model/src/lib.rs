//! Coverage raster data model: tile keys, the pixel grid, per-tile layers,
//! running totals and the persisted tile format.

mod grid;
mod key;
mod payload;
mod projection;
mod snapshot;
mod tile;
mod totals;

pub use grid::{GridError, GridSpec, MAX_TILE_SIZE, MIN_TILE_SIZE, TileRect};
pub use key::{TileCoord, TileKey};
pub use payload::{PAYLOAD_MAGIC, PAYLOAD_VERSION, PayloadError, TilePayload};
pub use projection::{EARTH_RADIUS_M, GeoBounds, GeoPoint, LocalPoint, LocalProjection};
pub use snapshot::RasterSnapshot;
pub use tile::{
    LayerMask, NO_STROKE, PixelChange, PixelState, PixelWrite, TileData, TileLayers, WriteOutcome,
};
pub use totals::{CoverageAreas, CoverageDelta, CoverageTotals, MAX_SECTIONS, RateStats};

pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_RESOLUTION_M: f64 = 0.10;
