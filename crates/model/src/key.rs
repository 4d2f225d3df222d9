//! Tile coordinate packing.
//!
//! TileKey:
//! | tx (32, two's complement) | ty (32, two's complement) |
//! 63                        32 31                         0

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileCoord {
    pub tx: i32,
    pub ty: i32,
}

impl TileCoord {
    pub const fn new(tx: i32, ty: i32) -> Self {
        Self { tx, ty }
    }

    pub const fn key(self) -> TileKey {
        TileKey::pack(self.tx, self.ty)
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self {
            tx: self.tx.wrapping_add(dx),
            ty: self.ty.wrapping_add(dy),
        }
    }

    /// Chebyshev distance in tiles.
    pub fn ring_distance(self, other: TileCoord) -> u32 {
        let dx = (self.tx as i64 - other.tx as i64).unsigned_abs();
        let dy = (self.ty as i64 - other.ty as i64).unsigned_abs();
        dx.max(dy) as u32
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey(u64);

const TX_SHIFT: u64 = 32;
const TY_MASK: u64 = (1 << 32) - 1;

impl TileKey {
    pub const fn pack(tx: i32, ty: i32) -> Self {
        TileKey(((tx as u32 as u64) << TX_SHIFT) | (ty as u32 as u64))
    }

    pub const fn unpack(self) -> TileCoord {
        TileCoord {
            tx: (self.0 >> TX_SHIFT) as u32 as i32,
            ty: (self.0 & TY_MASK) as u32 as i32,
        }
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl From<TileCoord> for TileKey {
    fn from(coord: TileCoord) -> Self {
        coord.key()
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let coord = self.unpack();
        write!(formatter, "({}, {})", coord.tx, coord.ty)
    }
}
