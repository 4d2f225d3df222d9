//! Swept-rectangle rasterizer for implement strokes.
//!
//! A stroke is the straight segment the implement travelled since the
//! previous fix. It is split into sub-steps, each painted as an oriented
//! rectangle, then closed with a short tail behind the current position.
//! Pixels just ahead of the implement are stamped so the next stroke of the
//! same pass can tell real re-coverage apart from its own leading edge.

mod geometry;

use std::collections::HashSet;

use model::{
    CoverageDelta, GridSpec, LocalPoint, NO_STROKE, PixelWrite, TileCoord, TileData, TileKey,
    WriteOutcome,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tiles::TileResidency;
use tracing::trace;

use crate::geometry::{Strip, offset, wrap_angle};

#[derive(Debug, Clone, Copy, PartialEq, Error)]
pub enum PainterConfigError {
    #[error("painter setting `{0}` must be finite and non-negative")]
    InvalidLength(&'static str),
    #[error("turn threshold must be finite and positive")]
    TurnThresholdInvalid,
    #[error("max turn substeps must be at least 1")]
    MaxTurnSubstepsZero,
    #[error("inner edge factor must lie in 0..=1")]
    InnerEdgeFactorInvalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PainterConfig {
    /// Longitudinal tolerance closing seams between sub-steps.
    pub eps_u_m: f64,
    /// Lateral tolerance on both implement edges.
    pub eps_v_m: f64,
    pub turn_threshold_deg: f64,
    /// Extra lateral tolerance on the outer edge of a turn.
    pub turn_eps_extra_m: f64,
    /// Scales `eps_v_m` on the inner edge of a turn.
    pub inner_edge_factor: f64,
    /// Upper bound on the sub-step multiplier applied in sharp turns.
    pub max_turn_substeps: u32,
    pub tail_length_cells: f64,
    pub tail_width_factor: f64,
    pub front_gap_width_factor: f64,
    pub front_depth_width_factor: f64,
    pub front_min_depth_cells: f64,
    /// Strokes after which a front stamp stops promoting.
    pub front_stamp_max_age: u16,
    pub min_width_m: f64,
    pub min_travel_m: f64,
}

impl Default for PainterConfig {
    fn default() -> Self {
        Self {
            eps_u_m: 0.02,
            eps_v_m: 0.02,
            turn_threshold_deg: 8.0,
            turn_eps_extra_m: 0.05,
            inner_edge_factor: 0.25,
            max_turn_substeps: 8,
            tail_length_cells: 2.0,
            tail_width_factor: 1.0,
            front_gap_width_factor: 0.05,
            front_depth_width_factor: 0.5,
            front_min_depth_cells: 4.0,
            front_stamp_max_age: 64,
            min_width_m: 0.01,
            min_travel_m: 0.001,
        }
    }
}

impl PainterConfig {
    pub fn validate(&self) -> Result<(), PainterConfigError> {
        let lengths = [
            ("eps_u_m", self.eps_u_m),
            ("eps_v_m", self.eps_v_m),
            ("turn_eps_extra_m", self.turn_eps_extra_m),
            ("tail_length_cells", self.tail_length_cells),
            ("tail_width_factor", self.tail_width_factor),
            ("front_gap_width_factor", self.front_gap_width_factor),
            ("front_depth_width_factor", self.front_depth_width_factor),
            ("front_min_depth_cells", self.front_min_depth_cells),
            ("min_width_m", self.min_width_m),
            ("min_travel_m", self.min_travel_m),
        ];
        for (name, value) in lengths {
            if !value.is_finite() || value < 0.0 {
                return Err(PainterConfigError::InvalidLength(name));
            }
        }
        if !self.turn_threshold_deg.is_finite() || self.turn_threshold_deg <= 0.0 {
            return Err(PainterConfigError::TurnThresholdInvalid);
        }
        if self.max_turn_substeps == 0 {
            return Err(PainterConfigError::MaxTurnSubstepsZero);
        }
        if !(0.0..=1.0).contains(&self.inner_edge_factor) {
            return Err(PainterConfigError::InnerEdgeFactorInvalid);
        }
        Ok(())
    }
}

/// Grid the painter writes into. Tiles it may not write return `None`.
pub trait PaintTarget {
    fn grid(&self) -> GridSpec;
    fn paintable_tile_mut(&mut self, coord: TileCoord) -> Option<&mut TileData>;
}

impl PaintTarget for TileResidency {
    fn grid(&self) -> GridSpec {
        TileResidency::grid(self)
    }

    fn paintable_tile_mut(&mut self, coord: TileCoord) -> Option<&mut TileData> {
        self.paintable_mut(coord.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeInput {
    pub from: Option<LocalPoint>,
    pub to: LocalPoint,
    pub width_m: f64,
    /// Bit i set when section i was switched on.
    pub sections: u32,
    pub rate: Option<f32>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No job is running; reported by the owning engine.
    NotRunning,
    NoPreviousPoint,
    NonFinite,
    WidthTooSmall,
    TravelTooShort,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteCounts {
    pub first_touch: u64,
    pub promoted: u64,
    pub saturated: u64,
    pub refreshed: u64,
    pub skipped: u64,
}

impl WriteCounts {
    fn record(&mut self, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::FirstTouch => self.first_touch += 1,
            WriteOutcome::Promoted => self.promoted += 1,
            WriteOutcome::Saturated => self.saturated += 1,
            WriteOutcome::Refreshed => self.refreshed += 1,
            WriteOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn written(&self) -> u64 {
        self.first_touch + self.promoted + self.saturated + self.refreshed
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StrokeReport {
    pub stroke_id: Option<u16>,
    pub skipped: Option<SkipReason>,
    pub substeps: u32,
    pub writes: WriteCounts,
    pub front_stamped: u64,
    /// Change to the session totals caused by this stroke.
    pub totals_delta: CoverageDelta,
    /// Tiles whose revision moved.
    pub touched: Vec<TileKey>,
}

impl StrokeReport {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            stroke_id: None,
            skipped: Some(reason),
            substeps: 0,
            writes: WriteCounts::default(),
            front_stamped: 0,
            totals_delta: CoverageDelta::default(),
            touched: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Painter {
    config: PainterConfig,
    next_stroke_id: u16,
    last_heading: Option<f64>,
}

impl Painter {
    pub fn new(config: PainterConfig) -> Result<Self, PainterConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            next_stroke_id: 1,
            last_heading: None,
        })
    }

    pub fn config(&self) -> &PainterConfig {
        &self.config
    }

    /// Id the next accepted stroke will carry.
    pub fn peek_stroke_id(&self) -> u16 {
        self.next_stroke_id
    }

    /// Forgets heading history, e.g. when a job restarts.
    pub fn reset(&mut self) {
        self.last_heading = None;
    }

    pub fn paint<T: PaintTarget>(&mut self, target: &mut T, input: &StrokeInput) -> StrokeReport {
        let from = match self.accept(input) {
            Ok(from) => from,
            Err(reason) => {
                trace!(?reason, "stroke skipped");
                return StrokeReport::skipped(reason);
            }
        };
        let grid = target.grid();
        let resolution = grid.resolution_m();
        let config = self.config;

        let dx = input.to.x - from.x;
        let dy = input.to.y - from.y;
        let distance = dx.hypot(dy);
        let dir = (dx / distance, dy / distance);
        let heading = dy.atan2(dx);
        let turn = self
            .last_heading
            .map_or(0.0, |previous| wrap_angle(heading - previous));
        self.last_heading = Some(heading);

        let threshold = config.turn_threshold_deg.to_radians();
        let mut substeps = (distance / resolution).ceil().max(1.0) as u32;
        let turn_sign = if turn.abs() > threshold {
            let multiplier = (1 + (turn.abs() / threshold) as u32).min(config.max_turn_substeps);
            substeps = substeps.saturating_mul(multiplier.max(1));
            turn.signum()
        } else {
            0.0
        };
        // Turning left swings the right edge outward.
        let (eps_left, eps_right) = if turn_sign > 0.0 {
            (
                config.eps_v_m * config.inner_edge_factor,
                config.eps_v_m + config.turn_eps_extra_m,
            )
        } else if turn_sign < 0.0 {
            (
                config.eps_v_m + config.turn_eps_extra_m,
                config.eps_v_m * config.inner_edge_factor,
            )
        } else {
            (config.eps_v_m, config.eps_v_m)
        };

        let stroke_id = self.issue_stroke_id();
        let mut pass = StrokePass::new(PixelWrite {
            stroke_id,
            sections: input.sections,
            rate: input.rate,
            speed: input.speed,
            front_max_age: config.front_stamp_max_age,
        });
        let half_width = input.width_m * 0.5;
        let step_length = distance / substeps as f64;
        for step in 0..substeps {
            pass.paint(
                target,
                &Strip {
                    origin: offset(from, dir, step as f64 * step_length),
                    dir,
                    length: step_length,
                    half_width,
                    eps_u: config.eps_u_m,
                    eps_left,
                    eps_right,
                },
            );
        }

        let tail_length = (config.tail_length_cells * resolution).min(distance);
        if tail_length > 0.0 {
            pass.paint(
                target,
                &Strip {
                    origin: offset(input.to, dir, -tail_length),
                    dir,
                    length: tail_length,
                    half_width: half_width * config.tail_width_factor,
                    eps_u: config.eps_u_m,
                    eps_left: config.eps_v_m,
                    eps_right: config.eps_v_m,
                },
            );
        }

        // The gap keeps the stroke's own tolerance band out of the mask.
        let gap = (input.width_m * config.front_gap_width_factor)
            .max(config.eps_u_m + 0.5 * resolution);
        let depth = (input.width_m * config.front_depth_width_factor)
            .max(config.front_min_depth_cells * resolution);
        pass.stamp_front(
            target,
            &Strip {
                origin: offset(input.to, dir, gap),
                dir,
                length: depth,
                half_width,
                eps_u: 0.0,
                eps_left: 0.0,
                eps_right: 0.0,
            },
        );

        let report = pass.finish(stroke_id, substeps);
        trace!(
            stroke_id,
            substeps,
            first_touch = report.writes.first_touch,
            promoted = report.writes.promoted,
            tiles = report.touched.len(),
            "stroke painted"
        );
        report
    }

    fn accept(&self, input: &StrokeInput) -> Result<LocalPoint, SkipReason> {
        let from = input.from.ok_or(SkipReason::NoPreviousPoint)?;
        let finite = [from.x, from.y, input.to.x, input.to.y, input.width_m]
            .iter()
            .all(|value| value.is_finite());
        if !finite {
            return Err(SkipReason::NonFinite);
        }
        if input.width_m <= 0.0 || input.width_m < self.config.min_width_m {
            return Err(SkipReason::WidthTooSmall);
        }
        let travel = from.distance_to(input.to);
        if travel <= 0.0 || travel < self.config.min_travel_m {
            return Err(SkipReason::TravelTooShort);
        }
        Ok(from)
    }

    fn issue_stroke_id(&mut self) -> u16 {
        let id = self.next_stroke_id;
        self.next_stroke_id = match id.wrapping_add(1) {
            NO_STROKE => 1,
            next => next,
        };
        id
    }
}

/// Accumulates the effects of one stroke across its strips.
struct StrokePass {
    write: PixelWrite,
    writes: WriteCounts,
    front_stamped: u64,
    totals_delta: CoverageDelta,
    touched: HashSet<TileKey>,
}

impl StrokePass {
    fn new(write: PixelWrite) -> Self {
        Self {
            write,
            writes: WriteCounts::default(),
            front_stamped: 0,
            totals_delta: CoverageDelta::default(),
            touched: HashSet::new(),
        }
    }

    fn paint<T: PaintTarget>(&mut self, target: &mut T, strip: &Strip) {
        let write = self.write;
        let mut writes = self.writes;
        let mut delta = std::mem::take(&mut self.totals_delta);
        let touched = &mut self.touched;
        for_each_pixel(target, strip, |coord, tile, index| {
            let change = tile.write_pixel(index, &write);
            writes.record(change.outcome);
            if change.outcome != WriteOutcome::Skipped {
                delta.record(&change);
                touched.insert(coord.key());
            }
        });
        self.writes = writes;
        self.totals_delta = delta;
    }

    fn stamp_front<T: PaintTarget>(&mut self, target: &mut T, strip: &Strip) {
        let stroke_id = self.write.stroke_id;
        let mut stamped = 0;
        let touched = &mut self.touched;
        for_each_pixel(target, strip, |coord, tile, index| {
            if tile.stamp_front(index, stroke_id) {
                stamped += 1;
                touched.insert(coord.key());
            }
        });
        self.front_stamped += stamped;
    }

    fn finish(self, stroke_id: u16, substeps: u32) -> StrokeReport {
        let mut touched: Vec<TileKey> = self.touched.into_iter().collect();
        touched.sort_unstable();
        StrokeReport {
            stroke_id: Some(stroke_id),
            skipped: None,
            substeps,
            writes: self.writes,
            front_stamped: self.front_stamped,
            totals_delta: self.totals_delta,
            touched,
        }
    }
}

/// Visits every paintable pixel whose center falls inside `strip`.
fn for_each_pixel<T, F>(target: &mut T, strip: &Strip, mut visit: F)
where
    T: PaintTarget,
    F: FnMut(TileCoord, &mut TileData, usize),
{
    let grid = target.grid();
    let (min, max) = strip.bounds();
    let (px_min, py_min) = (grid.pixel_of(min.x), grid.pixel_of(min.y));
    let (px_max, py_max) = (grid.pixel_of(max.x), grid.pixel_of(max.y));
    let rect = grid.tile_rect(min, max);
    let size = grid.tile_size() as i64;

    for coord in rect.iter() {
        let Some(tile) = target.paintable_tile_mut(coord) else {
            continue;
        };
        let (origin_x, origin_y) = grid.tile_origin_pixel(coord);
        let x_range = px_min.max(origin_x)..=px_max.min(origin_x + size - 1);
        for py in py_min.max(origin_y)..=py_max.min(origin_y + size - 1) {
            let center_y = grid.pixel_center(py);
            for px in x_range.clone() {
                if strip.contains(grid.pixel_center(px), center_y) {
                    visit(coord, &mut *tile, grid.local_index(px, py));
                }
            }
        }
    }
}
