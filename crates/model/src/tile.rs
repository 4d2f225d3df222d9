use bitflags::bitflags;

use crate::CoverageTotals;

bitflags! {
    /// Optional per-pixel layers that have been allocated at least once.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct LayerMask: u8 {
        const SECTIONS = 1 << 0;
        const RATE = 1 << 1;
        const SPEED = 1 << 2;
        const FRONT_STAMP = 1 << 3;
    }
}

/// Stroke id 0 is never issued; a zero in `last_stroke_id` or `front_stamp`
/// means "never written".
pub const NO_STROKE: u16 = 0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelWrite {
    pub stroke_id: u16,
    pub sections: u32,
    pub rate: Option<f32>,
    pub speed: Option<f32>,
    /// Front stamps older than this many strokes no longer promote.
    pub front_max_age: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Same stroke already wrote this pixel.
    Skipped,
    FirstTouch,
    Promoted,
    /// A live front stamp was consumed but the count is already 255.
    Saturated,
    /// Count unchanged, optional layers refreshed.
    Refreshed,
}

/// Semantic value of one pixel. Unset rate/speed are `NaN`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelState {
    pub count: u8,
    pub sections: u32,
    pub rate: f32,
}

impl PixelState {
    pub const EMPTY: Self = Self {
        count: 0,
        sections: 0,
        rate: f32::NAN,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelChange {
    pub outcome: WriteOutcome,
    pub before: PixelState,
    pub after: PixelState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileData {
    size: u32,
    count: Box<[u8]>,
    last_stroke_id: Box<[u16]>,
    sections: Option<Box<[u32]>>,
    rate: Option<Box<[f32]>>,
    speed: Option<Box<[f32]>>,
    front_stamp: Option<Box<[u16]>>,
    rev: u64,
    dirty: bool,
    layer_mask: LayerMask,
}

/// All arrays of a tile, used to rebuild one from persisted form.
#[derive(Debug, Clone, PartialEq)]
pub struct TileLayers {
    pub count: Vec<u8>,
    pub last_stroke_id: Vec<u16>,
    pub sections: Option<Vec<u32>>,
    pub rate: Option<Vec<f32>>,
    pub speed: Option<Vec<f32>>,
    pub front_stamp: Option<Vec<u16>>,
}

fn front_stamp_is_live(stamp: u16, write: &PixelWrite) -> bool {
    stamp != NO_STROKE
        && stamp != write.stroke_id
        && write.stroke_id.wrapping_sub(stamp) <= write.front_max_age
}

impl TileData {
    pub fn new(size: u32) -> Self {
        let pixels = size as usize * size as usize;
        Self {
            size,
            count: vec![0; pixels].into_boxed_slice(),
            last_stroke_id: vec![NO_STROKE; pixels].into_boxed_slice(),
            sections: None,
            rate: None,
            speed: None,
            front_stamp: None,
            rev: 0,
            dirty: false,
            layer_mask: LayerMask::empty(),
        }
    }

    /// Caller guarantees every present array holds `size * size` entries.
    pub(crate) fn from_layers(size: u32, rev: u64, layer_mask: LayerMask, layers: TileLayers) -> Self {
        let mut mask = layer_mask;
        mask.set(LayerMask::SECTIONS, layers.sections.is_some() || mask.contains(LayerMask::SECTIONS));
        mask.set(LayerMask::RATE, layers.rate.is_some() || mask.contains(LayerMask::RATE));
        mask.set(LayerMask::SPEED, layers.speed.is_some() || mask.contains(LayerMask::SPEED));
        mask.set(
            LayerMask::FRONT_STAMP,
            layers.front_stamp.is_some() || mask.contains(LayerMask::FRONT_STAMP),
        );
        Self {
            size,
            count: layers.count.into_boxed_slice(),
            last_stroke_id: layers.last_stroke_id.into_boxed_slice(),
            sections: layers.sections.map(Vec::into_boxed_slice),
            rate: layers.rate.map(Vec::into_boxed_slice),
            speed: layers.speed.map(Vec::into_boxed_slice),
            front_stamp: layers.front_stamp.map(Vec::into_boxed_slice),
            rev,
            dirty: false,
            layer_mask: mask,
        }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn pixel_count(&self) -> usize {
        self.count.len()
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Flags content that is not yet in the store without changing `rev`.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    pub fn layer_mask(&self) -> LayerMask {
        self.layer_mask
    }

    pub fn counts(&self) -> &[u8] {
        &self.count
    }

    pub fn last_stroke_ids(&self) -> &[u16] {
        &self.last_stroke_id
    }

    pub fn sections(&self) -> Option<&[u32]> {
        self.sections.as_deref()
    }

    pub fn rates(&self) -> Option<&[f32]> {
        self.rate.as_deref()
    }

    pub fn speeds(&self) -> Option<&[f32]> {
        self.speed.as_deref()
    }

    pub fn front_stamps(&self) -> Option<&[u16]> {
        self.front_stamp.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.count.iter().all(|&count| count == 0)
    }

    pub fn pixel_state(&self, index: usize) -> PixelState {
        let count = self.count[index];
        if count == 0 {
            return PixelState::EMPTY;
        }
        PixelState {
            count,
            sections: self.sections.as_ref().map_or(0, |layer| layer[index]),
            rate: self.rate.as_ref().map_or(f32::NAN, |layer| layer[index]),
        }
    }

    /// Applies one stroke's write to a pixel.
    ///
    /// The count is set on first touch and only promoted when an older
    /// stroke's live front stamp sits on the pixel; layers always take the
    /// newest values.
    pub fn write_pixel(&mut self, index: usize, write: &PixelWrite) -> PixelChange {
        let before = self.pixel_state(index);
        if self.last_stroke_id[index] == write.stroke_id {
            return PixelChange {
                outcome: WriteOutcome::Skipped,
                before,
                after: before,
            };
        }
        self.last_stroke_id[index] = write.stroke_id;

        let count = self.count[index];
        let outcome = if count == 0 {
            self.count[index] = 1;
            self.reset_layers_at(index);
            WriteOutcome::FirstTouch
        } else if self
            .front_stamp
            .as_ref()
            .is_some_and(|stamps| front_stamp_is_live(stamps[index], write))
        {
            if let Some(stamps) = self.front_stamp.as_mut() {
                stamps[index] = NO_STROKE;
            }
            if count == u8::MAX {
                WriteOutcome::Saturated
            } else {
                self.count[index] = count + 1;
                WriteOutcome::Promoted
            }
        } else {
            WriteOutcome::Refreshed
        };

        if write.sections != 0 {
            self.sections_layer()[index] |= write.sections;
        }
        if let Some(rate) = write.rate {
            self.rate_layer()[index] = rate;
        }
        if let Some(speed) = write.speed {
            self.speed_layer()[index] = speed;
        }
        self.bump();

        PixelChange {
            outcome,
            before,
            after: self.pixel_state(index),
        }
    }

    /// Marks a singly-covered pixel as lying ahead of `stroke_id`'s front.
    pub fn stamp_front(&mut self, index: usize, stroke_id: u16) -> bool {
        if self.count[index] != 1 {
            return false;
        }
        let stamps = self.front_stamp_layer();
        if stamps[index] == stroke_id {
            return false;
        }
        stamps[index] = stroke_id;
        self.bump();
        true
    }

    /// Drops in-memory arrays for the given optional layers.
    ///
    /// Only call for layers whose content is persisted or transient; the
    /// `layer_mask` keeps recording that the layer existed.
    pub fn release_layers(&mut self, layers: LayerMask) -> usize {
        let mut freed = 0;
        if layers.contains(LayerMask::SECTIONS) && self.sections.take().is_some() {
            freed += self.pixel_count() * 4;
        }
        if layers.contains(LayerMask::RATE) && self.rate.take().is_some() {
            freed += self.pixel_count() * 4;
        }
        if layers.contains(LayerMask::SPEED) && self.speed.take().is_some() {
            freed += self.pixel_count() * 4;
        }
        if layers.contains(LayerMask::FRONT_STAMP) && self.front_stamp.take().is_some() {
            freed += self.pixel_count() * 2;
        }
        freed
    }

    pub fn approx_bytes(&self) -> usize {
        let pixels = self.pixel_count();
        let mut bytes = pixels * 3;
        bytes += self.sections.as_ref().map_or(0, |_| pixels * 4);
        bytes += self.rate.as_ref().map_or(0, |_| pixels * 4);
        bytes += self.speed.as_ref().map_or(0, |_| pixels * 4);
        bytes += self.front_stamp.as_ref().map_or(0, |_| pixels * 2);
        bytes
    }

    /// This tile's share of the session totals.
    pub fn contribution(&self) -> CoverageTotals {
        let mut totals = CoverageTotals::default();
        for index in 0..self.pixel_count() {
            if self.count[index] > 0 {
                totals.add_pixel(&self.pixel_state(index));
            }
        }
        totals
    }

    /// Folds persisted pixels into a tile that was painted before its stored
    /// data arrived. Uncovered pixels take the stored values; pixels covered
    /// in both sum their counts.
    pub fn merge_stored(&mut self, stored: &TileData) {
        assert_eq!(self.size, stored.size, "merging tiles of different size");
        for index in 0..self.pixel_count() {
            let stored_count = stored.count[index];
            if stored_count == 0 {
                continue;
            }
            let count = self.count[index];
            if count == 0 {
                self.count[index] = stored_count;
                self.last_stroke_id[index] = stored.last_stroke_id[index];
                self.reset_layers_at(index);
                if let Some(sections) = stored.sections.as_ref() {
                    self.sections_layer()[index] = sections[index];
                }
                if let Some(rate) = stored.rate.as_ref() {
                    self.rate_layer()[index] = rate[index];
                }
                if let Some(speed) = stored.speed.as_ref() {
                    self.speed_layer()[index] = speed[index];
                }
            } else {
                self.count[index] = count.saturating_add(stored_count);
                if let Some(sections) = stored.sections.as_ref() {
                    self.sections_layer()[index] |= sections[index];
                }
            }
        }
        self.rev = self.rev.max(stored.rev) + 1;
        self.dirty = true;
    }

    /// Overwrites this tile with `incoming`, keeping the revision moving
    /// forward so saves and completions of the old content never match the
    /// new one.
    pub fn replace_with(&mut self, incoming: TileData) {
        let rev = self.rev.max(incoming.rev) + 1;
        *self = incoming;
        self.rev = rev;
    }

    pub fn layers(&self) -> TileLayers {
        TileLayers {
            count: self.count.to_vec(),
            last_stroke_id: self.last_stroke_id.to_vec(),
            sections: self.sections.as_ref().map(|layer| layer.to_vec()),
            rate: self.rate.as_ref().map(|layer| layer.to_vec()),
            speed: self.speed.as_ref().map(|layer| layer.to_vec()),
            front_stamp: self.front_stamp.as_ref().map(|layer| layer.to_vec()),
        }
    }

    fn bump(&mut self) {
        self.rev += 1;
        self.dirty = true;
    }

    fn reset_layers_at(&mut self, index: usize) {
        if let Some(sections) = self.sections.as_mut() {
            sections[index] = 0;
        }
        if let Some(rate) = self.rate.as_mut() {
            rate[index] = f32::NAN;
        }
        if let Some(speed) = self.speed.as_mut() {
            speed[index] = f32::NAN;
        }
        if let Some(stamps) = self.front_stamp.as_mut() {
            stamps[index] = NO_STROKE;
        }
    }

    fn sections_layer(&mut self) -> &mut [u32] {
        let pixels = self.pixel_count();
        self.layer_mask |= LayerMask::SECTIONS;
        self.sections
            .get_or_insert_with(|| vec![0; pixels].into_boxed_slice())
    }

    fn rate_layer(&mut self) -> &mut [f32] {
        let pixels = self.pixel_count();
        self.layer_mask |= LayerMask::RATE;
        self.rate
            .get_or_insert_with(|| vec![f32::NAN; pixels].into_boxed_slice())
    }

    fn speed_layer(&mut self) -> &mut [f32] {
        let pixels = self.pixel_count();
        self.layer_mask |= LayerMask::SPEED;
        self.speed
            .get_or_insert_with(|| vec![f32::NAN; pixels].into_boxed_slice())
    }

    fn front_stamp_layer(&mut self) -> &mut [u16] {
        let pixels = self.pixel_count();
        self.layer_mask |= LayerMask::FRONT_STAMP;
        self.front_stamp
            .get_or_insert_with(|| vec![NO_STROKE; pixels].into_boxed_slice())
    }
}
