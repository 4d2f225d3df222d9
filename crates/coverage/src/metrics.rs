use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use model::{CoverageAreas, CoverageDelta, CoverageTotals, RateStats, TileData, TileKey};

/// Session totals plus the set of tiles whose contribution is already in
/// them.
///
/// The totals sit behind one mutex so hosts can read areas through a
/// [`TotalsReader`] while the engine is busy elsewhere.
#[derive(Debug, Default)]
pub struct MetricsLedger {
    totals: Arc<Mutex<CoverageTotals>>,
    accrued: HashSet<TileKey>,
}

/// Cloneable read handle on the live totals.
#[derive(Debug, Clone)]
pub struct TotalsReader {
    totals: Arc<Mutex<CoverageTotals>>,
}

fn lock(totals: &Mutex<CoverageTotals>) -> MutexGuard<'_, CoverageTotals> {
    totals.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TotalsReader {
    pub fn totals(&self) -> CoverageTotals {
        lock(&self.totals).clone()
    }

    pub fn areas(&self, pixel_area_m2: f64) -> CoverageAreas {
        lock(&self.totals).areas(pixel_area_m2)
    }
}

impl MetricsLedger {
    pub fn reader(&self) -> TotalsReader {
        TotalsReader {
            totals: Arc::clone(&self.totals),
        }
    }

    pub fn totals(&self) -> CoverageTotals {
        lock(&self.totals).clone()
    }

    pub fn areas(&self, pixel_area_m2: f64) -> CoverageAreas {
        lock(&self.totals).areas(pixel_area_m2)
    }

    pub fn rate_stats(&self) -> RateStats {
        lock(&self.totals).rate_stats()
    }

    pub fn accrued_len(&self) -> usize {
        self.accrued.len()
    }

    pub fn is_accrued(&self, key: TileKey) -> bool {
        self.accrued.contains(&key)
    }

    /// Folds in the change caused by one stroke.
    pub fn apply(&self, delta: &CoverageDelta) {
        if delta.is_empty() {
            return;
        }
        *lock(&self.totals) += delta;
    }

    /// Counts a tile that just became resident from persisted data.
    ///
    /// Returns false when the tile was already counted and `force` is off.
    pub fn accrue(&mut self, key: TileKey, tile: &TileData, force: bool) -> bool {
        if !self.accrued.insert(key) && !force {
            return false;
        }
        *lock(&self.totals) += &tile.contribution();
        true
    }

    /// Swaps a resident tile's counted contribution for its new content.
    pub fn replace(&mut self, key: TileKey, old: &CoverageTotals, new: &CoverageTotals) {
        self.accrued.insert(key);
        let mut totals = lock(&self.totals);
        *totals -= old;
        *totals += new;
    }

    /// Keeps an evicted tile's contribution; its data lives on in the store.
    pub fn retain_evicted(&mut self, key: TileKey) {
        self.accrued.insert(key);
    }

    /// Forgets an evicted tile whose data did not survive eviction.
    pub fn discard_evicted(&mut self, key: TileKey, tile: &TileData) {
        self.accrued.remove(&key);
        *lock(&self.totals) -= &tile.contribution();
    }

    /// Rebuilds the totals from `tiles`, which become the counted set.
    pub fn recompute<'a>(&mut self, tiles: impl Iterator<Item = (TileKey, &'a TileData)>) {
        let mut totals = CoverageTotals::default();
        self.accrued.clear();
        for (key, tile) in tiles {
            totals += &tile.contribution();
            self.accrued.insert(key);
        }
        *lock(&self.totals) = totals;
    }

    pub fn reset(&mut self) {
        self.accrued.clear();
        *lock(&self.totals) = CoverageTotals::default();
    }
}
