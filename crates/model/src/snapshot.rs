use serde::{Deserialize, Serialize};

use crate::{GeoPoint, TilePayload};

/// Whole-session export: grid parameters plus every resident tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterSnapshot {
    pub origin_lat: f64,
    pub origin_lon: f64,
    pub resolution_m: f64,
    pub tile_size: u32,
    pub tiles: Vec<TilePayload>,
}

impl RasterSnapshot {
    pub fn origin(&self) -> GeoPoint {
        GeoPoint::new(self.origin_lat, self.origin_lon)
    }

    /// True when both snapshots describe the same pixel grid.
    pub fn same_grid(&self, origin: GeoPoint, resolution_m: f64, tile_size: u32) -> bool {
        self.origin_lat == origin.lat
            && self.origin_lon == origin.lon
            && self.resolution_m == resolution_m
            && self.tile_size == tile_size
    }
}
