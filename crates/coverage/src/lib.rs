//! Coverage engine: the owning context for one coverage job.
//!
//! `CoverageEngine` holds every resident tile, the hot and visible sets, the
//! stroke painter, running totals and the bitmap cache. All tile mutation
//! happens on the caller's thread through `&mut self`; the only background
//! work is the flush pipeline, which receives payload copies and reports
//! saved revisions back as messages that the engine applies on its next
//! call.

mod bitmap;
mod config;
mod error;
mod metrics;
mod scheduler;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use flush::{FlushJob, FlushPipeline, FlushStats};
use model::{
    CoverageAreas, CoverageTotals, GeoBounds, GeoPoint, GridSpec, LayerMask, LocalProjection,
    RasterSnapshot, RateStats, TileCoord, TileData, TileKey, TilePayload,
};
use painter::{Painter, SkipReason, StrokeInput, StrokeReport};
use serde::{Deserialize, Serialize};
use tiles::{TileResidency, TileStore, ring, square_window};
use tracing::{debug, trace, warn};

pub use bitmap::{
    BitmapCache, COVERAGE_COLORS, DEFAULT_RATE_RANGE, DEFAULT_SPEED_RANGE, OVERLAP_COLOR,
    RampRange, RenderStyle, Rgba, SECTION_PALETTE, SINGLE_PASS_COLOR, TRANSPARENT, TileBitmap,
    VisualizationMode, render_tile,
};
pub use config::{ConfigError, CoverageConfig};
pub use error::CoverageError;
pub use metrics::{MetricsLedger, TotalsReader};
pub use scheduler::{CancelToken, UpdateKind, UpdateResult, UpdateScheduler};

/// Fixed grid parameters of a job.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub origin: GeoPoint,
    pub resolution_m: f64,
    pub tile_size: u32,
}

/// One GNSS fix worth of implement travel, in geographic coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StrokeSample {
    pub last: Option<GeoPoint>,
    pub current: GeoPoint,
    pub width_m: f64,
    pub sections: u32,
    pub rate: Option<f32>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Tiles in the new hot or visible set.
    pub tiles: usize,
    /// Store hits for tiles that were not resident.
    pub loaded: usize,
    /// Store hits replacing or merging into resident tiles.
    pub reconciled: usize,
    pub allocated: usize,
    pub departed: usize,
    pub evicted: usize,
    pub prefetched: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Applied(UpdateSummary),
    /// Nothing changed; the previous set is still in place.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported: usize,
    pub replaced: usize,
    pub accrued: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StopReport {
    pub areas: CoverageAreas,
    pub flushed: usize,
    pub saved_tiles: u64,
    /// Tiles whose saves had not finished when the drain timeout passed.
    pub abandoned: usize,
    pub discarded_tiles: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugStats {
    pub running: bool,
    pub store_attached: bool,
    pub resident_tiles: usize,
    pub hot_tiles: usize,
    pub visible_tiles: usize,
    pub pending_loads: usize,
    pub scheduled_flushes: usize,
    pub tile_lru_len: usize,
    pub tile_lru_capacity: usize,
    pub bitmap_cache_len: usize,
    pub bitmap_cache_capacity: usize,
    pub bitmap_hits: u64,
    pub bitmap_misses: u64,
    pub accrued_tiles: usize,
    pub discarded_tiles: u64,
    pub next_stroke_id: u16,
    pub approx_tile_bytes: usize,
    pub flush: FlushStats,
}

struct Session {
    params: JobParams,
    projection: LocalProjection,
    grid: GridSpec,
    residency: TileResidency,
    hot_center: Option<TileCoord>,
}

struct StagedTile {
    key: TileKey,
    stored: Option<TileData>,
}

pub(crate) struct FetchedTile {
    key: TileKey,
    stored: Option<TileData>,
}

#[derive(Debug, Clone, Copy)]
enum UpdateTarget {
    Hot { center: TileCoord, radius: u32 },
    Viewport,
}

/// A hot or viewport update whose store lookups have not run yet. Its
/// candidates stay pinned in memory until the engine finishes the plan.
pub(crate) struct UpdatePlan {
    session_id: u64,
    target: UpdateTarget,
    candidates: Vec<TileCoord>,
    lookups: Vec<TileCoord>,
    store: Option<Arc<dyn TileStore>>,
    tile_size: u32,
}

impl UpdatePlan {
    /// Reads every planned lookup from the store. Touches no engine state,
    /// so it runs without the engine lock. `None` means cancelled.
    pub(crate) fn fetch(
        &self,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<FetchedTile>>, CoverageError> {
        let mut fetched = Vec::with_capacity(self.lookups.len());
        if let Some(store) = &self.store {
            for &coord in &self.lookups {
                if cancel.is_cancelled() {
                    return Ok(None);
                }
                let key = coord.key();
                let stored = store
                    .load_tile(coord)?
                    .map(|payload| payload.to_tile(self.tile_size))
                    .transpose()
                    .map_err(|source| CoverageError::Payload { key, source })?;
                fetched.push(FetchedTile { key, stored });
            }
        }
        if cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(fetched))
    }
}

enum Membership {
    Hot,
    Visible,
}

pub struct CoverageEngine {
    config: CoverageConfig,
    painter: Painter,
    session: Option<Session>,
    store: Option<Arc<dyn TileStore>>,
    flush: Option<FlushPipeline>,
    /// Newest revision handed to the flush pipeline per tile.
    scheduled: HashMap<TileKey, u64>,
    /// Candidates of updates whose store lookups are still running.
    reserved: HashMap<TileKey, usize>,
    /// Changes whenever the session, its tiles or the store are replaced.
    session_id: u64,
    metrics: MetricsLedger,
    bitmaps: BitmapCache,
    style: RenderStyle,
    discarded_tiles: u64,
}

impl CoverageEngine {
    pub fn new(config: CoverageConfig) -> Result<Self, CoverageError> {
        config.validate()?;
        let painter = Painter::new(config.painter).map_err(ConfigError::from)?;
        Ok(Self {
            painter,
            session: None,
            store: None,
            flush: None,
            scheduled: HashMap::new(),
            reserved: HashMap::new(),
            session_id: 0,
            metrics: MetricsLedger::default(),
            bitmaps: BitmapCache::new(config.bitmap_lru_capacity),
            style: RenderStyle::default(),
            discarded_tiles: 0,
            config,
        })
    }

    pub fn config(&self) -> &CoverageConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn job_params(&self) -> Option<JobParams> {
        self.session.as_ref().map(|session| session.params)
    }

    pub fn grid(&self) -> Option<GridSpec> {
        self.session.as_ref().map(|session| session.grid)
    }

    pub fn projection(&self) -> Option<&LocalProjection> {
        self.session.as_ref().map(|session| &session.projection)
    }

    pub fn hot_center(&self) -> Option<TileCoord> {
        self.session.as_ref().and_then(|session| session.hot_center)
    }

    pub fn tile(&self, coord: TileCoord) -> Option<&TileData> {
        self.session.as_ref()?.residency.tile(coord.key())
    }

    pub fn is_hot(&self, coord: TileCoord) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.residency.is_hot(coord.key()))
    }

    pub fn is_visible(&self, coord: TileCoord) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| session.residency.is_visible(coord.key()))
    }

    pub fn start_job(&mut self, params: JobParams) -> Result<(), CoverageError> {
        if self.session.is_some() {
            return Err(CoverageError::AlreadyRunning);
        }
        if !params.origin.is_finite() {
            return Err(CoverageError::NonFiniteCoordinate);
        }
        let grid = GridSpec::new(params.resolution_m, params.tile_size)?;

        self.painter.reset();
        self.metrics.reset();
        self.bitmaps.clear();
        self.scheduled.clear();
        self.new_session_id();
        self.discarded_tiles = 0;
        if let Some(store) = &self.store {
            self.flush = Some(FlushPipeline::start(
                Arc::clone(store),
                self.config.flush_config(),
            ));
        }
        self.session = Some(Session {
            params,
            projection: LocalProjection::new(params.origin),
            grid,
            residency: TileResidency::new(grid, self.config.tile_lru_capacity),
            hot_center: None,
        });
        debug!(
            origin_lat = params.origin.lat,
            origin_lon = params.origin.lon,
            resolution_m = params.resolution_m,
            tile_size = params.tile_size,
            store_attached = self.store.is_some(),
            "coverage job started"
        );
        Ok(())
    }

    /// Flushes every dirty tile, waits a bounded time for the saves and
    /// tears the session down.
    pub fn stop_job(&mut self) -> Result<StopReport, CoverageError> {
        let session = self.session.as_ref().ok_or(CoverageError::NoSession)?;
        let areas = self.metrics.areas(session.grid.pixel_area_m2());
        let dirty: Vec<TileKey> = session
            .residency
            .iter()
            .filter(|(_, tile)| tile.is_dirty())
            .map(|(key, _)| key)
            .collect();
        let mut flushed = 0;
        for key in dirty {
            if self.schedule_flush(key) {
                flushed += 1;
            }
        }

        let drain_timeout = self.config.stop_drain_timeout();
        let shutdown = self
            .flush
            .as_mut()
            .map(|pipeline| pipeline.shutdown(drain_timeout));
        self.pump_flush_completions();
        let saved_tiles = self
            .flush
            .as_ref()
            .map_or(0, |pipeline| pipeline.stats().saved_tiles);
        self.flush = None;

        let report = StopReport {
            areas,
            flushed,
            saved_tiles,
            abandoned: shutdown.map_or(0, |report| report.abandoned),
            discarded_tiles: self.discarded_tiles,
        };
        self.session = None;
        self.scheduled.clear();
        self.new_session_id();
        self.metrics.reset();
        self.bitmaps.clear();
        debug!(
            flushed = report.flushed,
            saved_tiles = report.saved_tiles,
            abandoned = report.abandoned,
            discarded_tiles = report.discarded_tiles,
            "coverage job stopped"
        );
        Ok(report)
    }

    /// Swaps the backing store. Outstanding saves to the old store are
    /// drained first; dirty tiles are handed to the new one.
    pub fn attach_store(&mut self, store: Option<Arc<dyn TileStore>>) {
        if let Some(pipeline) = self.flush.as_mut() {
            pipeline.shutdown(self.config.stop_drain_timeout());
            self.pump_flush_completions();
            self.flush = None;
        }
        self.scheduled.clear();
        self.new_session_id();
        self.store = store;
        debug!(
            store_attached = self.store.is_some(),
            running = self.session.is_some(),
            "tile store attached"
        );

        let (Some(store), Some(session)) = (&self.store, &self.session) else {
            return;
        };
        self.flush = Some(FlushPipeline::start(
            Arc::clone(store),
            self.config.flush_config(),
        ));
        let dirty_outside_hot: Vec<TileKey> = session
            .residency
            .iter()
            .filter(|(key, tile)| tile.is_dirty() && !session.residency.is_hot(*key))
            .map(|(key, _)| key)
            .collect();
        for key in dirty_outside_hot {
            self.schedule_flush(key);
        }
    }

    pub fn paint_stroke(&mut self, sample: &StrokeSample) -> StrokeReport {
        self.pump_flush_completions();
        let Some(session) = self.session.as_mut() else {
            return StrokeReport::skipped(SkipReason::NotRunning);
        };
        let input = StrokeInput {
            from: sample.last.map(|point| session.projection.project(point)),
            to: session.projection.project(sample.current),
            width_m: sample.width_m,
            sections: sample.sections,
            rate: sample.rate,
            speed: sample.speed,
        };
        let report = self.painter.paint(&mut session.residency, &input);
        self.metrics.apply(&report.totals_delta);
        for key in &report.touched {
            self.bitmaps.invalidate_tile(*key);
        }
        if self
            .flush
            .as_ref()
            .is_some_and(FlushPipeline::over_soft_limit)
        {
            std::thread::yield_now();
        }
        report
    }

    /// Moves the hot window to the tile under `point`.
    ///
    /// Store lookups happen before anything is modified, so a cancellation
    /// or a store error leaves the previous hot set untouched.
    pub fn update_tractor_hot_center(
        &mut self,
        point: GeoPoint,
        cancel: &CancelToken,
    ) -> Result<UpdateOutcome, CoverageError> {
        let plan = self.plan_hot_center(point)?;
        let fetched = plan.fetch(cancel);
        self.finish_update(plan, fetched, cancel)
    }

    pub fn update_viewport(
        &mut self,
        bounds: GeoBounds,
        cancel: &CancelToken,
    ) -> Result<UpdateOutcome, CoverageError> {
        let plan = self.plan_viewport(bounds)?;
        let fetched = plan.fetch(cancel);
        self.finish_update(plan, fetched, cancel)
    }

    pub(crate) fn plan_hot_center(&mut self, point: GeoPoint) -> Result<UpdatePlan, CoverageError> {
        if !point.is_finite() {
            return Err(CoverageError::NonFiniteCoordinate);
        }
        self.pump_flush_completions();
        let session = self.session.as_ref().ok_or(CoverageError::NoSession)?;
        let center = session.grid.tile_of_point(session.projection.project(point));
        let radius = self.config.hot_radius_tiles;
        Ok(self.reserve(
            UpdateTarget::Hot { center, radius },
            square_window(center, radius),
        ))
    }

    pub(crate) fn plan_viewport(&mut self, bounds: GeoBounds) -> Result<UpdatePlan, CoverageError> {
        if !bounds.is_valid() {
            return Err(CoverageError::InvalidBounds);
        }
        self.pump_flush_completions();
        let session = self.session.as_ref().ok_or(CoverageError::NoSession)?;
        let (min, max) = session.projection.project_bounds(bounds);
        let rect = session.grid.tile_rect(min, max);
        let tiles = rect.tile_count();
        if tiles > self.config.max_viewport_tiles {
            return Err(CoverageError::ViewportTooLarge {
                tiles,
                limit: self.config.max_viewport_tiles,
            });
        }
        Ok(self.reserve(UpdateTarget::Viewport, rect.iter().collect()))
    }

    /// Picks the candidates that need a store lookup and pins every
    /// candidate in memory until the plan is finished.
    fn reserve(&mut self, target: UpdateTarget, candidates: Vec<TileCoord>) -> UpdatePlan {
        let (lookups, tile_size) = match &self.session {
            Some(session) => {
                let lookups: Vec<TileCoord> = match &self.store {
                    Some(_) => candidates
                        .iter()
                        .copied()
                        .filter(|coord| self.needs_lookup(session, coord.key()))
                        .collect(),
                    None => Vec::new(),
                };
                (lookups, session.grid.tile_size())
            }
            None => (Vec::new(), 0),
        };
        for coord in &candidates {
            *self.reserved.entry(coord.key()).or_default() += 1;
        }
        UpdatePlan {
            session_id: self.session_id,
            target,
            candidates,
            lookups,
            store: self.store.clone(),
            tile_size,
        }
    }

    fn release(&mut self, plan: &UpdatePlan) {
        if plan.session_id != self.session_id {
            return;
        }
        for coord in &plan.candidates {
            if let Entry::Occupied(mut entry) = self.reserved.entry(coord.key()) {
                *entry.get_mut() -= 1;
                if *entry.get() == 0 {
                    entry.remove();
                }
            }
        }
    }

    /// A tile with a save in flight would read back its own data.
    fn needs_lookup(&self, session: &Session, key: TileKey) -> bool {
        session.residency.needs_store_lookup(key) && !self.scheduled.contains_key(&key)
    }

    /// Applies the store results of `plan`. Lookups made stale while the
    /// engine was unlocked are dropped before anything is committed.
    pub(crate) fn finish_update(
        &mut self,
        plan: UpdatePlan,
        fetched: Result<Option<Vec<FetchedTile>>, CoverageError>,
        cancel: &CancelToken,
    ) -> Result<UpdateOutcome, CoverageError> {
        if plan.session_id != self.session_id {
            return match self.session {
                Some(_) => Ok(UpdateOutcome::Cancelled),
                None => Err(CoverageError::NoSession),
            };
        }
        let fetched = match fetched {
            Ok(Some(fetched)) if !cancel.is_cancelled() => fetched,
            Ok(_) => {
                self.release(&plan);
                return Ok(UpdateOutcome::Cancelled);
            }
            Err(error) => {
                self.release(&plan);
                return Err(error);
            }
        };
        self.pump_flush_completions();
        let staged = self.revalidate(&plan, fetched);
        self.release(&plan);

        let mut summary = self.commit(staged);
        summary.tiles = plan.candidates.len();
        match plan.target {
            UpdateTarget::Hot { center, radius } => {
                let (departed, evicted) = self.replace_members(Membership::Hot, &plan.candidates);
                summary.departed = departed;
                summary.evicted = evicted;
                summary.prefetched = self.prefetch_ring(center, radius + 1);
                summary.evicted += self.enforce_capacity();
                if let Some(session) = self.session.as_mut() {
                    session.hot_center = Some(center);
                }
                trace!(tx = center.tx, ty = center.ty, ?summary, "hot set updated");
            }
            UpdateTarget::Viewport => {
                let (departed, evicted) =
                    self.replace_members(Membership::Visible, &plan.candidates);
                summary.departed = departed;
                summary.evicted = evicted + self.enforce_capacity();
                trace!(?summary, "visible set updated");
            }
        }
        Ok(UpdateOutcome::Applied(summary))
    }

    fn revalidate(&self, plan: &UpdatePlan, fetched: Vec<FetchedTile>) -> Vec<StagedTile> {
        let Some(session) = self.session.as_ref() else {
            return Vec::new();
        };
        let mut hits: HashMap<TileKey, TileData> = fetched
            .into_iter()
            .filter_map(|FetchedTile { key, stored }| stored.map(|tile| (key, tile)))
            .filter(|(key, _)| {
                let still_needed = self.needs_lookup(session, *key);
                if !still_needed {
                    trace!(%key, "stale store lookup dropped");
                }
                still_needed
            })
            .collect();
        plan.candidates
            .iter()
            .map(|coord| {
                let key = coord.key();
                StagedTile {
                    key,
                    stored: hits.remove(&key),
                }
            })
            .collect()
    }

    fn commit(&mut self, staged: Vec<StagedTile>) -> UpdateSummary {
        let mut summary = UpdateSummary::default();
        let store_attached = self.store.is_some();
        let Some(session) = self.session.as_mut() else {
            return summary;
        };
        let residency = &mut session.residency;
        for StagedTile { key, stored } in staged {
            match (stored, residency.tile_mut(key)) {
                (Some(stored), None) => {
                    self.metrics.accrue(key, &stored, false);
                    residency.insert(key, stored);
                    summary.loaded += 1;
                }
                (Some(stored), Some(resident)) => {
                    let old = resident.contribution();
                    if resident.is_dirty() {
                        resident.merge_stored(&stored);
                    } else {
                        resident.replace_with(stored);
                    }
                    self.metrics.replace(key, &old, &resident.contribution());
                    residency.clear_pending_load(key);
                    residency.touch(key);
                    self.bitmaps.invalidate_tile(key);
                    summary.reconciled += 1;
                }
                (None, _) => {
                    if residency.allocate_missing(key) {
                        summary.allocated += 1;
                        if store_attached {
                            residency.mark_pending_load(key);
                        }
                    }
                }
            }
        }
        summary
    }

    /// Installs a new hot or visible set and releases the tiles that left
    /// it. Returns the number of departed and evicted tiles.
    fn replace_members(&mut self, membership: Membership, members: &[TileCoord]) -> (usize, usize) {
        let Some(session) = self.session.as_mut() else {
            return (0, 0);
        };
        let keys: HashSet<TileKey> = members.iter().map(|coord| coord.key()).collect();
        let departed = match membership {
            Membership::Hot => session.residency.replace_hot(keys),
            Membership::Visible => session.residency.replace_visible(keys),
        };
        let departed_count = departed.len();
        let mut evicted = 0;
        for key in departed {
            if self
                .session
                .as_ref()
                .is_some_and(|session| session.residency.is_hot(key))
            {
                continue;
            }
            self.schedule_flush(key);
            if self.try_evict(key) {
                evicted += 1;
            }
        }
        (departed_count, evicted)
    }

    fn prefetch_ring(&self, center: TileCoord, radius: u32) -> usize {
        let (Some(store), Some(session)) = (&self.store, &self.session) else {
            return 0;
        };
        let keys: HashSet<TileKey> = ring(center, radius)
            .into_iter()
            .map(TileCoord::key)
            .filter(|key| session.residency.needs_store_lookup(*key))
            .collect();
        if keys.is_empty() {
            return 0;
        }
        store.prefetch_tiles(&keys);
        keys.len()
    }

    /// Hands a dirty tile to the flush pipeline. Without a store the dirty
    /// flag is dropped instead and the change lives in memory only.
    ///
    /// Returns true if a save was enqueued.
    pub fn schedule_flush(&mut self, key: TileKey) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let Some(tile) = session.residency.tile_mut(key) else {
            return false;
        };
        if !tile.is_dirty() {
            return false;
        }
        match &self.flush {
            Some(pipeline) => {
                let rev = tile.rev();
                if self.scheduled.get(&key) == Some(&rev) {
                    return false;
                }
                pipeline.enqueue(FlushJob {
                    key,
                    rev,
                    payload: TilePayload::from_tile(key.unpack(), tile),
                });
                self.scheduled.insert(key, rev);
                true
            }
            None => {
                let rev = tile.rev();
                tile.mark_clean();
                self.discarded_tiles += 1;
                warn!(%key, rev, "no tile store attached, unsaved tile changes kept in memory only");
                false
            }
        }
    }

    /// Applies saved revisions reported by the flush workers. Returns the
    /// number of tiles marked clean.
    pub fn pump_flush_completions(&mut self) -> usize {
        let Some(pipeline) = &self.flush else {
            return 0;
        };
        let completions = pipeline.drain_completions();
        if completions.is_empty() {
            return 0;
        }
        let Some(session) = self.session.as_mut() else {
            return 0;
        };
        let mut cleaned = 0;
        let mut released = Vec::new();
        for completion in completions {
            let key = completion.key;
            if self
                .scheduled
                .get(&key)
                .is_some_and(|rev| *rev <= completion.rev)
            {
                self.scheduled.remove(&key);
            }
            let hot = session.residency.is_hot(key);
            let visible = session.residency.is_visible(key);
            let Some(tile) = session.residency.tile_mut(key) else {
                continue;
            };
            // Repainted while saving: the newer revision still needs a save.
            if tile.rev() != completion.rev {
                continue;
            }
            tile.mark_clean();
            if !hot {
                tile.release_layers(LayerMask::FRONT_STAMP);
            }
            // The store now holds this tile, so a later lookup would read
            // our own pixels back.
            session.residency.clear_pending_load(key);
            cleaned += 1;
            if !hot && !visible {
                released.push(key);
            }
        }
        for key in released {
            self.try_evict(key);
        }
        cleaned
    }

    /// Drops `key` from memory unless something still needs it.
    fn try_evict(&mut self, key: TileKey) -> bool {
        if self.reserved.contains_key(&key) {
            trace!(%key, "tile kept resident for a running update");
            return false;
        }
        let flush_pending = self.scheduled.contains_key(&key);
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if let Some(blocker) = session.residency.eviction_blocker(key, flush_pending) {
            trace!(%key, ?blocker, "tile kept resident");
            return false;
        }
        let never_stored = session.residency.is_pending_load(key);
        let Some(tile) = session.residency.evict(key) else {
            return false;
        };
        self.bitmaps.invalidate_tile(key);
        if self.store.is_some() && !never_stored {
            self.metrics.retain_evicted(key);
        } else {
            self.metrics.discard_evicted(key, &tile);
        }
        trace!(%key, "tile evicted");
        true
    }

    /// Evicts least recently used tiles beyond the LRU capacity. Without a
    /// store eviction would discard coverage, so nothing is swept.
    fn enforce_capacity(&mut self) -> usize {
        if self.store.is_none() {
            return 0;
        }
        let Some(session) = self.session.as_ref() else {
            return 0;
        };
        let mut evicted = 0;
        for key in session.residency.lru_overflow() {
            if self.try_evict(key) {
                evicted += 1;
            }
        }
        evicted
    }

    /// Blocks until every scheduled save has finished or `timeout` passes,
    /// then applies the completions.
    pub fn wait_for_flush_idle(&mut self, timeout: Duration) -> bool {
        let idle = self
            .flush
            .as_ref()
            .is_none_or(|pipeline| pipeline.wait_idle(timeout));
        self.pump_flush_completions();
        idle
    }

    pub fn mode(&self) -> VisualizationMode {
        self.style.mode
    }

    pub fn set_mode(&mut self, mode: VisualizationMode) {
        if self.style.mode != mode {
            self.style.mode = mode;
            self.bitmaps.clear();
        }
    }

    pub fn set_rate_range(&mut self, range: RampRange) {
        if self.style.rate_range != range {
            self.style.rate_range = range;
            self.bitmaps.clear();
        }
    }

    pub fn set_speed_range(&mut self, range: RampRange) {
        if self.style.speed_range != range {
            self.style.speed_range = range;
            self.bitmaps.clear();
        }
    }

    /// Rendered bitmap of a resident tile, or `None` if the tile is not in
    /// memory.
    pub fn build_or_get_bitmap_for(
        &mut self,
        tx: i32,
        ty: i32,
        stride: u32,
    ) -> Result<Option<Arc<TileBitmap>>, CoverageError> {
        let session = self.session.as_ref().ok_or(CoverageError::NoSession)?;
        let tile_size = session.grid.tile_size();
        if stride == 0 || tile_size % stride != 0 {
            return Err(CoverageError::InvalidStride { stride, tile_size });
        }
        let key = TileKey::pack(tx, ty);
        let Some(tile) = session.residency.tile(key) else {
            return Ok(None);
        };
        Ok(Some(
            self.bitmaps.get_or_render(key, tile, stride, &self.style),
        ))
    }

    pub fn export_snapshot(&self) -> Result<RasterSnapshot, CoverageError> {
        let session = self.session.as_ref().ok_or(CoverageError::NoSession)?;
        let mut tiles: Vec<TilePayload> = session
            .residency
            .iter()
            .map(|(key, tile)| TilePayload::from_tile(key.unpack(), tile))
            .collect();
        tiles.sort_unstable_by_key(|payload| payload.coord.key());
        debug!(tiles = tiles.len(), "coverage snapshot exported");
        Ok(RasterSnapshot {
            origin_lat: session.params.origin.lat,
            origin_lon: session.params.origin.lon,
            resolution_m: session.params.resolution_m,
            tile_size: session.params.tile_size,
            tiles,
        })
    }

    /// Loads every tile of `snapshot` into memory.
    ///
    /// Resident tiles are overwritten and their totals swapped. New tiles
    /// are counted once per job unless `force` is set. With a store
    /// attached the imported tiles are marked dirty so they get persisted.
    pub fn import_snapshot(
        &mut self,
        snapshot: &RasterSnapshot,
        force: bool,
    ) -> Result<ImportSummary, CoverageError> {
        let session = self.session.as_mut().ok_or(CoverageError::NoSession)?;
        let params = session.params;
        if !snapshot.same_grid(params.origin, params.resolution_m, params.tile_size) {
            return Err(CoverageError::SnapshotGridMismatch);
        }
        let decoded = snapshot
            .tiles
            .iter()
            .map(|payload| {
                let key = payload.coord.key();
                payload
                    .to_tile(params.tile_size)
                    .map(|tile| (key, tile))
                    .map_err(|source| CoverageError::Payload { key, source })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let persist = self.store.is_some();
        let mut summary = ImportSummary::default();
        let mut to_flush = Vec::new();
        for (key, mut tile) in decoded {
            if persist {
                tile.mark_dirty();
            }
            match session.residency.tile_mut(key) {
                Some(resident) => {
                    let old = resident.contribution();
                    resident.replace_with(tile);
                    self.metrics.replace(key, &old, &resident.contribution());
                    session.residency.touch(key);
                    summary.replaced += 1;
                }
                None => {
                    if self.metrics.accrue(key, &tile, force) {
                        summary.accrued += 1;
                    }
                    session.residency.insert(key, tile);
                }
            }
            session.residency.clear_pending_load(key);
            self.bitmaps.invalidate_tile(key);
            if persist && !session.residency.is_hot(key) {
                to_flush.push(key);
            }
            summary.imported += 1;
        }
        for key in to_flush {
            self.schedule_flush(key);
        }
        debug!(
            imported = summary.imported,
            replaced = summary.replaced,
            accrued = summary.accrued,
            force,
            "coverage snapshot imported"
        );
        Ok(summary)
    }

    pub fn get_areas(&self) -> Result<CoverageAreas, CoverageError> {
        let session = self.session.as_ref().ok_or(CoverageError::NoSession)?;
        Ok(self.metrics.areas(session.grid.pixel_area_m2()))
    }

    pub fn get_rate_stats(&self) -> RateStats {
        self.metrics.rate_stats()
    }

    pub fn totals(&self) -> CoverageTotals {
        self.metrics.totals()
    }

    /// Read handle that stays valid across jobs.
    pub fn totals_reader(&self) -> TotalsReader {
        self.metrics.reader()
    }

    /// Rebuilds the totals from the resident tiles.
    pub fn recompute_totals(&mut self) -> Result<CoverageTotals, CoverageError> {
        let session = self.session.as_ref().ok_or(CoverageError::NoSession)?;
        self.metrics.recompute(session.residency.iter());
        Ok(self.metrics.totals())
    }

    /// Forgets all in-memory coverage while keeping the job grid. Saves
    /// already queued get the drain timeout to reach the store; cleared
    /// tiles start over at revision zero, so none may be left behind.
    pub fn clear_coverage(&mut self) -> Result<(), CoverageError> {
        if self.session.is_none() {
            return Err(CoverageError::NoSession);
        }
        if let Some(mut pipeline) = self.flush.take() {
            pipeline.shutdown(self.config.stop_drain_timeout());
            self.flush = Some(pipeline);
            self.pump_flush_completions();
        }
        if let Some(store) = &self.store {
            self.flush = Some(FlushPipeline::start(
                Arc::clone(store),
                self.config.flush_config(),
            ));
        }
        if let Some(session) = self.session.as_mut() {
            session.residency.clear();
            session.hot_center = None;
        }
        self.scheduled.clear();
        self.new_session_id();
        self.metrics.reset();
        self.bitmaps.clear();
        self.painter.reset();
        debug!("coverage cleared");
        Ok(())
    }

    /// Invalidates running update plans and their reservations.
    fn new_session_id(&mut self) {
        self.session_id = self.session_id.wrapping_add(1);
        self.reserved.clear();
    }

    pub fn debug_stats(&self) -> DebugStats {
        let mut stats = DebugStats {
            running: self.session.is_some(),
            store_attached: self.store.is_some(),
            scheduled_flushes: self.scheduled.len(),
            tile_lru_capacity: self.config.tile_lru_capacity,
            bitmap_cache_len: self.bitmaps.len(),
            bitmap_cache_capacity: self.bitmaps.capacity(),
            bitmap_hits: self.bitmaps.hits(),
            bitmap_misses: self.bitmaps.misses(),
            accrued_tiles: self.metrics.accrued_len(),
            discarded_tiles: self.discarded_tiles,
            next_stroke_id: self.painter.peek_stroke_id(),
            flush: self
                .flush
                .as_ref()
                .map(FlushPipeline::stats)
                .unwrap_or_default(),
            ..DebugStats::default()
        };
        if let Some(session) = &self.session {
            let residency = &session.residency;
            stats.resident_tiles = residency.len();
            stats.hot_tiles = residency.hot_keys().len();
            stats.visible_tiles = residency.visible_keys().len();
            stats.pending_loads = residency.pending_load_count();
            stats.tile_lru_len = residency.lru_len();
            stats.approx_tile_bytes = residency.approx_bytes();
        }
        stats
    }
}

#[cfg(test)]
mod tests;
