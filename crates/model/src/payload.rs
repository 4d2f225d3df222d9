//! Persisted tile payload.
//!
//! Layout, all little-endian:
//! | magic "CVTL" | version u16 | tile_size u32 | tx i32 | ty i32 | rev u64 | flags u8 |
//! | count: len u32 + u8[] | last_stroke_id: len u32 + u16[] |
//! | sections? len u32 + u32[] | rate? len u32 + f32[] | speed? len u32 + f32[] |
//! | front_stamp? len u32 + u16[] |
//!
//! Optional arrays appear only when their flag bit is set, always in this order.

use std::io::{self, Cursor, Read};

use byteorder::{LittleEndian as LE, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{LayerMask, TileCoord, TileData, TileLayers};

pub const PAYLOAD_MAGIC: [u8; 4] = *b"CVTL";
pub const PAYLOAD_VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("bad payload magic {0:02x?}")]
    BadMagic([u8; 4]),
    #[error("unsupported payload version {0}")]
    UnsupportedVersion(u16),
    #[error("payload truncated: {0}")]
    Truncated(#[from] io::Error),
    #[error("{layer} holds {actual} entries, tile needs {expected}")]
    LengthMismatch {
        layer: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("tile size {actual} does not match session tile size {expected}")]
    TileSizeMismatch { expected: u32, actual: u32 },
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),
}

/// One tile in persisted / snapshot form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TilePayload {
    pub coord: TileCoord,
    pub tile_size: u32,
    pub rev: u64,
    pub layer_mask: u8,
    pub count: Vec<u8>,
    pub last_stroke_id: Vec<u16>,
    pub sections: Option<Vec<u32>>,
    #[serde(default, with = "nan_as_null")]
    pub rate: Option<Vec<f32>>,
    #[serde(default, with = "nan_as_null")]
    pub speed: Option<Vec<f32>>,
    pub front_stamp: Option<Vec<u16>>,
}

/// Unset rate/speed pixels are `NaN`, which text formats cannot carry.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        layer: &Option<Vec<f32>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        layer
            .as_ref()
            .map(|values| {
                values
                    .iter()
                    .map(|value| (!value.is_nan()).then_some(*value))
                    .collect::<Vec<_>>()
            })
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<f32>>, D::Error> {
        let layer = Option::<Vec<Option<f32>>>::deserialize(deserializer)?;
        Ok(layer.map(|values| {
            values
                .into_iter()
                .map(|value| value.unwrap_or(f32::NAN))
                .collect()
        }))
    }
}

fn check_len(layer: &'static str, expected: usize, actual: usize) -> Result<(), PayloadError> {
    if expected != actual {
        return Err(PayloadError::LengthMismatch {
            layer,
            expected,
            actual,
        });
    }
    Ok(())
}

fn read_len(reader: &mut impl Read) -> Result<usize, PayloadError> {
    Ok(reader.read_u32::<LE>()? as usize)
}

impl TilePayload {
    pub fn from_tile(coord: TileCoord, tile: &TileData) -> Self {
        let layers = tile.layers();
        Self {
            coord,
            tile_size: tile.size(),
            rev: tile.rev(),
            layer_mask: tile.layer_mask().bits(),
            count: layers.count,
            last_stroke_id: layers.last_stroke_id,
            sections: layers.sections,
            rate: layers.rate,
            speed: layers.speed,
            front_stamp: layers.front_stamp,
        }
    }

    /// Presence flags for the arrays actually carried.
    pub fn present_layers(&self) -> LayerMask {
        let mut flags = LayerMask::empty();
        flags.set(LayerMask::SECTIONS, self.sections.is_some());
        flags.set(LayerMask::RATE, self.rate.is_some());
        flags.set(LayerMask::SPEED, self.speed.is_some());
        flags.set(LayerMask::FRONT_STAMP, self.front_stamp.is_some());
        flags
    }

    pub fn validate(&self) -> Result<(), PayloadError> {
        let pixels = self.tile_size as usize * self.tile_size as usize;
        check_len("count", pixels, self.count.len())?;
        check_len("last_stroke_id", pixels, self.last_stroke_id.len())?;
        if let Some(layer) = &self.sections {
            check_len("sections", pixels, layer.len())?;
        }
        if let Some(layer) = &self.rate {
            check_len("rate", pixels, layer.len())?;
        }
        if let Some(layer) = &self.speed {
            check_len("speed", pixels, layer.len())?;
        }
        if let Some(layer) = &self.front_stamp {
            check_len("front_stamp", pixels, layer.len())?;
        }
        Ok(())
    }

    /// Rebuilds a clean tile, checking it against the session tile size.
    pub fn to_tile(&self, expected_tile_size: u32) -> Result<TileData, PayloadError> {
        if self.tile_size != expected_tile_size {
            return Err(PayloadError::TileSizeMismatch {
                expected: expected_tile_size,
                actual: self.tile_size,
            });
        }
        self.validate()?;
        Ok(TileData::from_layers(
            self.tile_size,
            self.rev,
            LayerMask::from_bits_truncate(self.layer_mask),
            TileLayers {
                count: self.count.clone(),
                last_stroke_id: self.last_stroke_id.clone(),
                sections: self.sections.clone(),
                rate: self.rate.clone(),
                speed: self.speed.clone(),
                front_stamp: self.front_stamp.clone(),
            },
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let pixels = self.count.len();
        let mut out = Vec::with_capacity(32 + pixels * 3);
        out.extend_from_slice(&PAYLOAD_MAGIC);
        // Writes into a Vec cannot fail.
        let _ = self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) -> io::Result<()> {
        out.write_u16::<LE>(PAYLOAD_VERSION)?;
        out.write_u32::<LE>(self.tile_size)?;
        out.write_i32::<LE>(self.coord.tx)?;
        out.write_i32::<LE>(self.coord.ty)?;
        out.write_u64::<LE>(self.rev)?;
        out.write_u8(self.present_layers().bits() | (self.layer_mask << 4))?;

        out.write_u32::<LE>(self.count.len() as u32)?;
        out.extend_from_slice(&self.count);
        out.write_u32::<LE>(self.last_stroke_id.len() as u32)?;
        for &value in &self.last_stroke_id {
            out.write_u16::<LE>(value)?;
        }
        if let Some(layer) = &self.sections {
            out.write_u32::<LE>(layer.len() as u32)?;
            for &value in layer {
                out.write_u32::<LE>(value)?;
            }
        }
        for layer in [&self.rate, &self.speed].into_iter().flatten() {
            out.write_u32::<LE>(layer.len() as u32)?;
            for &value in layer {
                out.write_f32::<LE>(value)?;
            }
        }
        if let Some(layer) = &self.front_stamp {
            out.write_u32::<LE>(layer.len() as u32)?;
            for &value in layer {
                out.write_u16::<LE>(value)?;
            }
        }
        Ok(())
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, PayloadError> {
        let mut reader = Cursor::new(bytes);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != PAYLOAD_MAGIC {
            return Err(PayloadError::BadMagic(magic));
        }
        let version = reader.read_u16::<LE>()?;
        if version != PAYLOAD_VERSION {
            return Err(PayloadError::UnsupportedVersion(version));
        }
        let tile_size = reader.read_u32::<LE>()?;
        let tx = reader.read_i32::<LE>()?;
        let ty = reader.read_i32::<LE>()?;
        let rev = reader.read_u64::<LE>()?;
        let flag_byte = reader.read_u8()?;
        let present = LayerMask::from_bits_truncate(flag_byte & 0x0f);
        let layer_mask = flag_byte >> 4;
        let pixels = tile_size as usize * tile_size as usize;

        let len = read_len(&mut reader)?;
        check_len("count", pixels, len)?;
        let mut count = vec![0u8; len];
        reader.read_exact(&mut count)?;

        let len = read_len(&mut reader)?;
        check_len("last_stroke_id", pixels, len)?;
        let mut last_stroke_id = vec![0u16; len];
        reader.read_u16_into::<LE>(&mut last_stroke_id)?;

        let sections = if present.contains(LayerMask::SECTIONS) {
            let len = read_len(&mut reader)?;
            check_len("sections", pixels, len)?;
            let mut layer = vec![0u32; len];
            reader.read_u32_into::<LE>(&mut layer)?;
            Some(layer)
        } else {
            None
        };
        let mut read_f32_layer = |flag: LayerMask,
                                  name: &'static str|
         -> Result<Option<Vec<f32>>, PayloadError> {
            if !present.contains(flag) {
                return Ok(None);
            }
            let len = read_len(&mut reader)?;
            check_len(name, pixels, len)?;
            let mut layer = vec![0f32; len];
            reader.read_f32_into::<LE>(&mut layer)?;
            Ok(Some(layer))
        };
        let rate = read_f32_layer(LayerMask::RATE, "rate")?;
        let speed = read_f32_layer(LayerMask::SPEED, "speed")?;
        let front_stamp = if present.contains(LayerMask::FRONT_STAMP) {
            let len = read_len(&mut reader)?;
            check_len("front_stamp", pixels, len)?;
            let mut layer = vec![0u16; len];
            reader.read_u16_into::<LE>(&mut layer)?;
            Some(layer)
        } else {
            None
        };

        let trailing = bytes.len() - reader.position() as usize;
        if trailing != 0 {
            return Err(PayloadError::TrailingBytes(trailing));
        }

        Ok(Self {
            coord: TileCoord::new(tx, ty),
            tile_size,
            rev,
            layer_mask,
            count,
            last_stroke_id,
            sections,
            rate,
            speed,
            front_stamp,
        })
    }
}
