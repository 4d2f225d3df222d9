use thiserror::Error;

use crate::{LocalPoint, TileCoord};

pub const MIN_TILE_SIZE: u32 = 16;
pub const MAX_TILE_SIZE: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum GridError {
    #[error("resolution must be finite and positive, got {0}")]
    InvalidResolution(f64),
    #[error("tile size {0} outside {MIN_TILE_SIZE}..={MAX_TILE_SIZE}")]
    InvalidTileSize(u32),
}

/// Pixel grid shared by every tile of one coverage session.
///
/// Pixel `(px, py)` covers `[px * res, (px + 1) * res)` east and
/// `[py * res, (py + 1) * res)` north of the projection origin.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GridSpec {
    resolution_m: f64,
    tile_size: u32,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TileRect {
    pub min: TileCoord,
    pub max: TileCoord,
}

impl TileRect {
    pub fn iter(self) -> impl Iterator<Item = TileCoord> {
        (self.min.ty..=self.max.ty)
            .flat_map(move |ty| (self.min.tx..=self.max.tx).map(move |tx| TileCoord::new(tx, ty)))
    }

    pub fn tile_count(self) -> u64 {
        let width = (self.max.tx as i64 - self.min.tx as i64 + 1).max(0) as u64;
        let height = (self.max.ty as i64 - self.min.ty as i64 + 1).max(0) as u64;
        width * height
    }
}

impl GridSpec {
    pub fn new(resolution_m: f64, tile_size: u32) -> Result<Self, GridError> {
        if !resolution_m.is_finite() || resolution_m <= 0.0 {
            return Err(GridError::InvalidResolution(resolution_m));
        }
        if !(MIN_TILE_SIZE..=MAX_TILE_SIZE).contains(&tile_size) {
            return Err(GridError::InvalidTileSize(tile_size));
        }
        Ok(Self {
            resolution_m,
            tile_size,
        })
    }

    pub fn resolution_m(&self) -> f64 {
        self.resolution_m
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn pixels_per_tile(&self) -> usize {
        self.tile_size as usize * self.tile_size as usize
    }

    pub fn tile_extent_m(&self) -> f64 {
        self.resolution_m * self.tile_size as f64
    }

    pub fn pixel_area_m2(&self) -> f64 {
        self.resolution_m * self.resolution_m
    }

    pub fn pixel_of(&self, meters: f64) -> i64 {
        (meters / self.resolution_m).floor() as i64
    }

    pub fn pixel_center(&self, pixel: i64) -> f64 {
        (pixel as f64 + 0.5) * self.resolution_m
    }

    pub fn tile_of_pixel(&self, px: i64, py: i64) -> TileCoord {
        let size = self.tile_size as i64;
        TileCoord::new(px.div_euclid(size) as i32, py.div_euclid(size) as i32)
    }

    pub fn tile_of_point(&self, point: LocalPoint) -> TileCoord {
        self.tile_of_pixel(self.pixel_of(point.x), self.pixel_of(point.y))
    }

    /// First pixel (south-west corner) of a tile.
    pub fn tile_origin_pixel(&self, coord: TileCoord) -> (i64, i64) {
        let size = self.tile_size as i64;
        (coord.tx as i64 * size, coord.ty as i64 * size)
    }

    /// Row-major index inside the owning tile; row 0 is the southern edge.
    pub fn local_index(&self, px: i64, py: i64) -> usize {
        let size = self.tile_size as i64;
        (py.rem_euclid(size) * size + px.rem_euclid(size)) as usize
    }

    pub fn tile_rect(&self, min: LocalPoint, max: LocalPoint) -> TileRect {
        TileRect {
            min: self.tile_of_point(min),
            max: self.tile_of_point(max),
        }
    }
}
