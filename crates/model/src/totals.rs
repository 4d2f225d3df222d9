use std::ops::{AddAssign, SubAssign};

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::{PixelChange, PixelState};

/// Width of the section bitmask carried per pixel.
pub const MAX_SECTIONS: usize = 32;
const_assert!(MAX_SECTIONS <= u32::BITS as usize);

/// Running coverage counters in pixels.
///
/// `once_px` counts covered pixels, `overlap_px` the extra passes beyond the
/// first; rate sums hold the current rate of every covered pixel that has one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageTotals {
    pub once_px: u64,
    pub overlap_px: u64,
    pub section_px: [u64; MAX_SECTIONS],
    pub section_rate_sum: [f64; MAX_SECTIONS],
    pub section_rate_count: [u64; MAX_SECTIONS],
    pub area_rate_sum: f64,
    pub area_rate_count: u64,
}

impl Default for CoverageTotals {
    fn default() -> Self {
        Self {
            once_px: 0,
            overlap_px: 0,
            section_px: [0; MAX_SECTIONS],
            section_rate_sum: [0.0; MAX_SECTIONS],
            section_rate_count: [0; MAX_SECTIONS],
            area_rate_sum: 0.0,
            area_rate_count: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageAreas {
    pub once_m2: f64,
    pub overlap_m2: f64,
    pub total_m2: f64,
    pub section_m2: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateStats {
    pub area_mean: Option<f64>,
    pub area_samples: u64,
    pub section_mean: Vec<Option<f64>>,
}

fn set_bits(mask: u32) -> impl Iterator<Item = usize> {
    (0..MAX_SECTIONS).filter(move |bit| mask & (1 << bit) != 0)
}

impl CoverageTotals {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn add_pixel(&mut self, state: &PixelState) {
        if state.count == 0 {
            return;
        }
        self.once_px += 1;
        self.overlap_px += state.count as u64 - 1;
        let has_rate = !state.rate.is_nan();
        if has_rate {
            self.area_rate_sum += state.rate as f64;
            self.area_rate_count += 1;
        }
        for bit in set_bits(state.sections) {
            self.section_px[bit] += 1;
            if has_rate {
                self.section_rate_sum[bit] += state.rate as f64;
                self.section_rate_count[bit] += 1;
            }
        }
    }

    pub fn sub_pixel(&mut self, state: &PixelState) {
        if state.count == 0 {
            return;
        }
        self.once_px = self.once_px.saturating_sub(1);
        self.overlap_px = self.overlap_px.saturating_sub(state.count as u64 - 1);
        let has_rate = !state.rate.is_nan();
        if has_rate {
            self.area_rate_sum -= state.rate as f64;
            self.area_rate_count = self.area_rate_count.saturating_sub(1);
        }
        for bit in set_bits(state.sections) {
            self.section_px[bit] = self.section_px[bit].saturating_sub(1);
            if has_rate {
                self.section_rate_sum[bit] -= state.rate as f64;
                self.section_rate_count[bit] = self.section_rate_count[bit].saturating_sub(1);
            }
        }
    }

    pub fn apply(&mut self, change: &PixelChange) {
        if change.before == change.after {
            return;
        }
        self.sub_pixel(&change.before);
        self.add_pixel(&change.after);
    }

    pub fn areas(&self, pixel_area_m2: f64) -> CoverageAreas {
        CoverageAreas {
            once_m2: self.once_px as f64 * pixel_area_m2,
            overlap_m2: self.overlap_px as f64 * pixel_area_m2,
            total_m2: (self.once_px + self.overlap_px) as f64 * pixel_area_m2,
            section_m2: self
                .section_px
                .iter()
                .map(|&pixels| pixels as f64 * pixel_area_m2)
                .collect(),
        }
    }

    pub fn rate_stats(&self) -> RateStats {
        let mean = |sum: f64, count: u64| (count > 0).then(|| sum / count as f64);
        RateStats {
            area_mean: mean(self.area_rate_sum, self.area_rate_count),
            area_samples: self.area_rate_count,
            section_mean: self
                .section_rate_sum
                .iter()
                .zip(self.section_rate_count.iter())
                .map(|(&sum, &count)| mean(sum, count))
                .collect(),
        }
    }

    /// Equality that tolerates float summation order in rate sums.
    pub fn approx_eq(&self, other: &CoverageTotals, tolerance: f64) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= tolerance * (1.0 + a.abs().max(b.abs()));
        self.once_px == other.once_px
            && self.overlap_px == other.overlap_px
            && self.section_px == other.section_px
            && self.section_rate_count == other.section_rate_count
            && self.area_rate_count == other.area_rate_count
            && close(self.area_rate_sum, other.area_rate_sum)
            && self
                .section_rate_sum
                .iter()
                .zip(other.section_rate_sum.iter())
                .all(|(&a, &b)| close(a, b))
    }
}

impl AddAssign<&CoverageTotals> for CoverageTotals {
    fn add_assign(&mut self, other: &CoverageTotals) {
        self.once_px += other.once_px;
        self.overlap_px += other.overlap_px;
        self.area_rate_sum += other.area_rate_sum;
        self.area_rate_count += other.area_rate_count;
        for bit in 0..MAX_SECTIONS {
            self.section_px[bit] += other.section_px[bit];
            self.section_rate_sum[bit] += other.section_rate_sum[bit];
            self.section_rate_count[bit] += other.section_rate_count[bit];
        }
    }
}

impl SubAssign<&CoverageTotals> for CoverageTotals {
    fn sub_assign(&mut self, other: &CoverageTotals) {
        self.once_px = self.once_px.saturating_sub(other.once_px);
        self.overlap_px = self.overlap_px.saturating_sub(other.overlap_px);
        self.area_rate_sum -= other.area_rate_sum;
        self.area_rate_count = self.area_rate_count.saturating_sub(other.area_rate_count);
        for bit in 0..MAX_SECTIONS {
            self.section_px[bit] = self.section_px[bit].saturating_sub(other.section_px[bit]);
            self.section_rate_sum[bit] -= other.section_rate_sum[bit];
            self.section_rate_count[bit] =
                self.section_rate_count[bit].saturating_sub(other.section_rate_count[bit]);
        }
    }
}

/// Signed change to [`CoverageTotals`], accumulated away from the shared
/// totals and folded in with one update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoverageDelta {
    pub once_px: i64,
    pub overlap_px: i64,
    pub section_px: [i64; MAX_SECTIONS],
    pub section_rate_sum: [f64; MAX_SECTIONS],
    pub section_rate_count: [i64; MAX_SECTIONS],
    pub area_rate_sum: f64,
    pub area_rate_count: i64,
}

impl CoverageDelta {
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }

    pub fn record(&mut self, change: &PixelChange) {
        if change.before == change.after {
            return;
        }
        self.pixel(&change.before, -1);
        self.pixel(&change.after, 1);
    }

    fn pixel(&mut self, state: &PixelState, sign: i64) {
        if state.count == 0 {
            return;
        }
        self.once_px += sign;
        self.overlap_px += sign * (state.count as i64 - 1);
        let rate = (!state.rate.is_nan()).then_some(state.rate as f64);
        if let Some(rate) = rate {
            self.area_rate_sum += sign as f64 * rate;
            self.area_rate_count += sign;
        }
        for bit in set_bits(state.sections) {
            self.section_px[bit] += sign;
            if let Some(rate) = rate {
                self.section_rate_sum[bit] += sign as f64 * rate;
                self.section_rate_count[bit] += sign;
            }
        }
    }
}

impl From<&CoverageTotals> for CoverageDelta {
    fn from(totals: &CoverageTotals) -> Self {
        let mut delta = Self {
            once_px: totals.once_px as i64,
            overlap_px: totals.overlap_px as i64,
            area_rate_sum: totals.area_rate_sum,
            area_rate_count: totals.area_rate_count as i64,
            ..Self::default()
        };
        for bit in 0..MAX_SECTIONS {
            delta.section_px[bit] = totals.section_px[bit] as i64;
            delta.section_rate_sum[bit] = totals.section_rate_sum[bit];
            delta.section_rate_count[bit] = totals.section_rate_count[bit] as i64;
        }
        delta
    }
}

impl AddAssign<&CoverageDelta> for CoverageTotals {
    fn add_assign(&mut self, delta: &CoverageDelta) {
        self.once_px = self.once_px.saturating_add_signed(delta.once_px);
        self.overlap_px = self.overlap_px.saturating_add_signed(delta.overlap_px);
        self.area_rate_sum += delta.area_rate_sum;
        self.area_rate_count = self.area_rate_count.saturating_add_signed(delta.area_rate_count);
        for bit in 0..MAX_SECTIONS {
            self.section_px[bit] = self.section_px[bit].saturating_add_signed(delta.section_px[bit]);
            self.section_rate_sum[bit] += delta.section_rate_sum[bit];
            self.section_rate_count[bit] =
                self.section_rate_count[bit].saturating_add_signed(delta.section_rate_count[bit]);
        }
    }
}
