//! Per-tile color buffers for the live map overlay.

use std::sync::Arc;

use model::{TileData, TileKey};
use serde::{Deserialize, Serialize};
use tiles::LruCache;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VisualizationMode {
    #[default]
    Coverage,
    Overlap,
    Rate,
    Speed,
    Sections,
}

/// Value range mapped onto a color ramp; values outside are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RampRange {
    pub min: f32,
    pub max: f32,
}

impl RampRange {
    pub const fn new(min: f32, max: f32) -> Self {
        Self { min, max }
    }

    fn position(&self, value: f32) -> f32 {
        let span = self.max - self.min;
        if !span.is_finite() || span <= 0.0 {
            return 0.0;
        }
        ((value - self.min) / span).clamp(0.0, 1.0)
    }
}

pub const DEFAULT_RATE_RANGE: RampRange = RampRange::new(0.0, 100.0);
pub const DEFAULT_SPEED_RANGE: RampRange = RampRange::new(0.0, 15.0);

pub type Rgba = [u8; 4];

pub const TRANSPARENT: Rgba = [0, 0, 0, 0];
/// Indexed by the block's highest pass count, capped at the last entry.
pub const COVERAGE_COLORS: [Rgba; 4] = [
    [46, 160, 67, 150],
    [230, 200, 40, 170],
    [240, 130, 30, 190],
    [210, 40, 40, 210],
];
pub const SINGLE_PASS_COLOR: Rgba = [46, 160, 67, 110];
pub const OVERLAP_COLOR: Rgba = [220, 40, 40, 200];
pub const SECTION_PALETTE: [Rgba; 8] = [
    [31, 119, 180, 170],
    [255, 127, 14, 170],
    [44, 160, 44, 170],
    [214, 39, 40, 170],
    [148, 103, 189, 170],
    [140, 86, 75, 170],
    [227, 119, 194, 170],
    [23, 190, 207, 170],
];
const RAMP_LOW: Rgba = [40, 80, 220, 180];
const RAMP_HIGH: Rgba = [220, 50, 40, 180];

/// Rendering parameters that change what a bitmap looks like.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderStyle {
    pub mode: VisualizationMode,
    pub rate_range: RampRange,
    pub speed_range: RampRange,
}

impl Default for RenderStyle {
    fn default() -> Self {
        Self {
            mode: VisualizationMode::Coverage,
            rate_range: DEFAULT_RATE_RANGE,
            speed_range: DEFAULT_SPEED_RANGE,
        }
    }
}

/// Downsampled RGBA image of one tile, rows south to north.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileBitmap {
    pub key: TileKey,
    pub stride: u32,
    pub rev: u64,
    pub mode: VisualizationMode,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<Rgba>,
}

impl TileBitmap {
    pub fn pixel(&self, x: u32, y: u32) -> Rgba {
        self.pixels[(y * self.width + x) as usize]
    }
}

#[derive(Debug, Default)]
struct BlockStats {
    max_count: u8,
    sections: u32,
    rate_sum: f64,
    rate_samples: u32,
    speed_sum: f64,
    speed_samples: u32,
}

impl BlockStats {
    fn add(&mut self, tile: &TileData, index: usize) {
        let count = tile.counts()[index];
        if count == 0 {
            return;
        }
        self.max_count = self.max_count.max(count);
        if let Some(sections) = tile.sections() {
            self.sections |= sections[index];
        }
        if let Some(rate) = tile.rates().map(|rates| rates[index]).filter(|r| !r.is_nan()) {
            self.rate_sum += rate as f64;
            self.rate_samples += 1;
        }
        if let Some(speed) = tile.speeds().map(|speeds| speeds[index]).filter(|s| !s.is_nan()) {
            self.speed_sum += speed as f64;
            self.speed_samples += 1;
        }
    }

    fn color(&self, style: &RenderStyle) -> Rgba {
        if self.max_count == 0 {
            return TRANSPARENT;
        }
        match style.mode {
            VisualizationMode::Coverage => {
                let index = (self.max_count as usize - 1).min(COVERAGE_COLORS.len() - 1);
                COVERAGE_COLORS[index]
            }
            VisualizationMode::Overlap => {
                if self.max_count > 1 {
                    OVERLAP_COLOR
                } else {
                    SINGLE_PASS_COLOR
                }
            }
            VisualizationMode::Rate => mean(self.rate_sum, self.rate_samples)
                .map_or(TRANSPARENT, |rate| ramp(style.rate_range.position(rate))),
            VisualizationMode::Speed => mean(self.speed_sum, self.speed_samples)
                .map_or(TRANSPARENT, |speed| ramp(style.speed_range.position(speed))),
            VisualizationMode::Sections => {
                if self.sections == 0 {
                    TRANSPARENT
                } else {
                    let lowest = self.sections.trailing_zeros() as usize;
                    SECTION_PALETTE[lowest % SECTION_PALETTE.len()]
                }
            }
        }
    }
}

fn mean(sum: f64, samples: u32) -> Option<f32> {
    (samples > 0).then(|| (sum / samples as f64) as f32)
}

fn ramp(position: f32) -> Rgba {
    let mut color = [0; 4];
    for channel in 0..4 {
        let low = RAMP_LOW[channel] as f32;
        let high = RAMP_HIGH[channel] as f32;
        color[channel] = (low + (high - low) * position).round() as u8;
    }
    color
}

/// Renders `tile` with `stride × stride` pixel blocks. `stride` must divide
/// the tile size.
pub fn render_tile(key: TileKey, tile: &TileData, stride: u32, style: &RenderStyle) -> TileBitmap {
    let size = tile.size();
    let side = size / stride;
    let mut pixels = Vec::with_capacity((side * side) as usize);
    for block_y in 0..side {
        for block_x in 0..side {
            let mut stats = BlockStats::default();
            for y in block_y * stride..(block_y + 1) * stride {
                let row = (y * size) as usize;
                for x in block_x * stride..(block_x + 1) * stride {
                    stats.add(tile, row + x as usize);
                }
            }
            pixels.push(stats.color(style));
        }
    }
    TileBitmap {
        key,
        stride,
        rev: tile.rev(),
        mode: style.mode,
        width: side,
        height: side,
        pixels,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct BitmapKey {
    tile: TileKey,
    stride: u32,
    rev: u64,
}

/// Rendered bitmaps keyed by tile, stride and tile revision.
#[derive(Debug)]
pub struct BitmapCache {
    entries: LruCache<BitmapKey, Arc<TileBitmap>>,
    hits: u64,
    misses: u64,
}

impl BitmapCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::new(capacity),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn get_or_render(
        &mut self,
        key: TileKey,
        tile: &TileData,
        stride: u32,
        style: &RenderStyle,
    ) -> Arc<TileBitmap> {
        let cache_key = BitmapKey {
            tile: key,
            stride,
            rev: tile.rev(),
        };
        if let Some(bitmap) = self.entries.get(&cache_key) {
            self.hits += 1;
            return Arc::clone(bitmap);
        }
        self.misses += 1;
        let bitmap = Arc::new(render_tile(key, tile, stride, style));
        self.entries.insert(cache_key, Arc::clone(&bitmap));
        bitmap
    }

    /// Drops every cached bitmap of `key`, at any stride or revision.
    pub fn invalidate_tile(&mut self, key: TileKey) {
        self.entries.retain(|cached, _| cached.tile != key);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
