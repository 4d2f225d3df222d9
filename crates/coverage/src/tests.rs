use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use model::{
    GeoBounds, GeoPoint, LocalPoint, PixelWrite, RasterSnapshot, TileCoord, TileData, TileKey,
    TilePayload,
};
use painter::SkipReason;
use tiles::{MemoryTileStore, StoreError, TileStore};

use super::*;

const ORIGIN: GeoPoint = GeoPoint::new(52.0, 13.0);
const FLUSH_WAIT: Duration = Duration::from_secs(5);

fn config() -> CoverageConfig {
    CoverageConfig {
        hot_radius_tiles: 1,
        flush_backoff_base_ms: 5,
        flush_backoff_max_ms: 20,
        flush_idle_poll_ms: 2,
        watchdog_interval_ms: 10,
        stop_drain_timeout_ms: 5_000,
        ..CoverageConfig::default()
    }
}

fn params() -> JobParams {
    JobParams {
        origin: ORIGIN,
        resolution_m: 0.1,
        tile_size: 16,
    }
}

fn running_engine() -> CoverageEngine {
    let mut engine = CoverageEngine::new(config()).expect("test config is valid");
    engine.start_job(params()).expect("job starts");
    engine
}

fn running_engine_with_store(store: Arc<dyn TileStore>) -> CoverageEngine {
    let mut engine = CoverageEngine::new(config()).expect("test config is valid");
    engine.attach_store(Some(store));
    engine.start_job(params()).expect("job starts");
    engine
}

fn geo(engine: &CoverageEngine, x: f64, y: f64) -> GeoPoint {
    engine
        .projection()
        .expect("job running")
        .unproject(LocalPoint::new(x, y))
}

fn bounds(engine: &CoverageEngine, min: (f64, f64), max: (f64, f64)) -> GeoBounds {
    let south_west = geo(engine, min.0, min.1);
    let north_east = geo(engine, max.0, max.1);
    GeoBounds {
        south: south_west.lat,
        west: south_west.lon,
        north: north_east.lat,
        east: north_east.lon,
    }
}

fn applied(outcome: Result<UpdateOutcome, CoverageError>) -> UpdateSummary {
    match outcome.expect("update succeeds") {
        UpdateOutcome::Applied(summary) => summary,
        UpdateOutcome::Cancelled => panic!("update was cancelled"),
    }
}

fn center_on(engine: &mut CoverageEngine, x: f64, y: f64) -> UpdateSummary {
    let point = geo(engine, x, y);
    applied(engine.update_tractor_hot_center(point, &CancelToken::new()))
}

fn show(engine: &mut CoverageEngine, min: (f64, f64), max: (f64, f64)) -> UpdateSummary {
    let bounds = bounds(engine, min, max);
    applied(engine.update_viewport(bounds, &CancelToken::new()))
}

/// Drives from `from` to `to` in short strokes, one per simulated fix.
fn drive(engine: &mut CoverageEngine, from: (f64, f64), to: (f64, f64), step: f64) {
    let length = (to.0 - from.0).hypot(to.1 - from.1);
    let steps = (length / step).ceil() as usize;
    let mut last = geo(engine, from.0, from.1);
    for index in 1..=steps {
        let t = index as f64 / steps as f64;
        let current = geo(
            engine,
            from.0 + (to.0 - from.0) * t,
            from.1 + (to.1 - from.1) * t,
        );
        let report = engine.paint_stroke(&StrokeSample {
            last: Some(last),
            current,
            width_m: 0.4,
            sections: 0b1,
            rate: Some(40.0),
            speed: Some(2.0),
        });
        assert!(report.skipped.is_none(), "stroke skipped: {:?}", report.skipped);
        last = current;
    }
}

fn origin_tile() -> TileCoord {
    TileCoord::new(0, 0)
}

fn stored_tile_with_pixel(index: usize) -> TilePayload {
    let mut tile = TileData::new(16);
    tile.write_pixel(
        index,
        &PixelWrite {
            stroke_id: 1,
            sections: 0b10,
            rate: Some(10.0),
            speed: None,
            front_max_age: 8,
        },
    );
    TilePayload::from_tile(origin_tile(), &tile)
}

/// Store that rejects its first `failures` batches.
struct FlakyStore {
    inner: MemoryTileStore,
    failures_left: AtomicU32,
}

impl TileStore for FlakyStore {
    fn load_tile(&self, coord: TileCoord) -> Result<Option<TilePayload>, StoreError> {
        self.inner.load_tile(coord)
    }

    fn save_dirty_tiles_and_clear(
        &self,
        batch: &[(TileKey, TilePayload)],
    ) -> Result<(), StoreError> {
        let consumed = self
            .failures_left
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |left| left.checked_sub(1))
            .is_ok();
        if consumed {
            return Err(StoreError::Backend("injected failure".to_owned()));
        }
        self.inner.save_dirty_tiles_and_clear(batch)
    }
}

/// Store whose saves wait until the test opens the gate.
#[derive(Default)]
struct GatedStore {
    inner: MemoryTileStore,
    open: AtomicBool,
}

impl TileStore for GatedStore {
    fn load_tile(&self, coord: TileCoord) -> Result<Option<TilePayload>, StoreError> {
        self.inner.load_tile(coord)
    }

    fn save_dirty_tiles_and_clear(
        &self,
        batch: &[(TileKey, TilePayload)],
    ) -> Result<(), StoreError> {
        while !self.open.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        self.inner.save_dirty_tiles_and_clear(batch)
    }
}

/// Store with slow point lookups.
struct SlowStore {
    inner: MemoryTileStore,
    delay: Duration,
}

impl TileStore for SlowStore {
    fn load_tile(&self, coord: TileCoord) -> Result<Option<TilePayload>, StoreError> {
        std::thread::sleep(self.delay);
        self.inner.load_tile(coord)
    }

    fn save_dirty_tiles_and_clear(
        &self,
        batch: &[(TileKey, TilePayload)],
    ) -> Result<(), StoreError> {
        self.inner.save_dirty_tiles_and_clear(batch)
    }
}

/// Store whose first save waits until the test opens the gate; later saves
/// go straight through.
#[derive(Default)]
struct FirstSaveGate {
    inner: MemoryTileStore,
    saves: AtomicU32,
    open: AtomicBool,
}

impl FirstSaveGate {
    fn first_save_started(&self) -> bool {
        self.saves.load(Ordering::Acquire) > 0
    }
}

impl TileStore for FirstSaveGate {
    fn load_tile(&self, coord: TileCoord) -> Result<Option<TilePayload>, StoreError> {
        self.inner.load_tile(coord)
    }

    fn save_dirty_tiles_and_clear(
        &self,
        batch: &[(TileKey, TilePayload)],
    ) -> Result<(), StoreError> {
        if self.saves.fetch_add(1, Ordering::AcqRel) == 0 {
            while !self.open.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        self.inner.save_dirty_tiles_and_clear(batch)
    }
}

/// Store whose lookups wait while `blocked` is set.
#[derive(Default)]
struct BlockingLoadStore {
    inner: MemoryTileStore,
    blocked: AtomicBool,
    waiting: AtomicU32,
}

impl TileStore for BlockingLoadStore {
    fn load_tile(&self, coord: TileCoord) -> Result<Option<TilePayload>, StoreError> {
        if self.blocked.load(Ordering::Acquire) {
            self.waiting.fetch_add(1, Ordering::AcqRel);
            while self.blocked.load(Ordering::Acquire) {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        self.inner.load_tile(coord)
    }

    fn save_dirty_tiles_and_clear(
        &self,
        batch: &[(TileKey, TilePayload)],
    ) -> Result<(), StoreError> {
        self.inner.save_dirty_tiles_and_clear(batch)
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + FLUSH_WAIT;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
fn job_lifecycle_errors() {
    let mut engine = CoverageEngine::new(config()).expect("test config is valid");
    let report = engine.paint_stroke(&StrokeSample {
        last: Some(ORIGIN),
        current: GeoPoint::new(52.0001, 13.0),
        width_m: 3.0,
        sections: 0,
        rate: None,
        speed: None,
    });
    assert_eq!(report.skipped, Some(SkipReason::NotRunning));
    assert!(matches!(engine.stop_job(), Err(CoverageError::NoSession)));

    let bad_grid = JobParams {
        tile_size: 0,
        ..params()
    };
    assert!(matches!(engine.start_job(bad_grid), Err(CoverageError::Grid(_))));
    let bad_origin = JobParams {
        origin: GeoPoint::new(f64::NAN, 13.0),
        ..params()
    };
    assert!(matches!(
        engine.start_job(bad_origin),
        Err(CoverageError::NonFiniteCoordinate)
    ));

    engine.start_job(params()).expect("job starts");
    assert!(matches!(
        engine.start_job(params()),
        Err(CoverageError::AlreadyRunning)
    ));

    let mut invalid = config();
    invalid.tile_lru_capacity = 0;
    assert!(matches!(
        CoverageEngine::new(invalid),
        Err(CoverageError::Config(ConfigError::Zero("tile_lru_capacity")))
    ));
}

#[test]
fn hot_window_allocates_and_reports_stats() {
    let mut engine = running_engine();
    let summary = center_on(&mut engine, 0.8, 0.8);
    assert_eq!(summary.tiles, 9);
    assert_eq!(summary.allocated, 9);
    assert_eq!(summary.prefetched, 0);
    assert_eq!(engine.hot_center(), Some(origin_tile()));
    assert!(engine.is_hot(TileCoord::new(-1, 1)));
    assert!(!engine.is_hot(TileCoord::new(2, 0)));

    let stats = engine.debug_stats();
    assert!(stats.running);
    assert!(!stats.store_attached);
    assert_eq!(stats.resident_tiles, 9);
    assert_eq!(stats.hot_tiles, 9);
    assert_eq!(stats.pending_loads, 0);
    assert_eq!(stats.next_stroke_id, 1);
}

#[test]
fn painting_updates_totals_and_reader() {
    let mut engine = running_engine();
    let reader = engine.totals_reader();
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);

    let tile = engine.tile(origin_tile()).expect("hot tile resident");
    assert!(tile.is_dirty());
    let totals = engine.totals();
    assert!(totals.once_px > 0);
    assert_eq!(totals, reader.totals());
    assert_eq!(totals.section_px[0], totals.once_px);

    let areas = engine.get_areas().expect("job running");
    assert!((areas.once_m2 - totals.once_px as f64 * 0.01).abs() < 1e-9);
    let rates = engine.get_rate_stats();
    let mean = rates.area_mean.expect("rates were recorded");
    assert!((mean - 40.0).abs() < 1e-6);
}

#[test]
fn without_store_departed_tiles_are_discarded() {
    let mut engine = running_engine();
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    assert!(engine.totals().once_px > 0);

    let summary = center_on(&mut engine, 100.0, 100.0);
    assert_eq!(summary.departed, 9);
    assert_eq!(summary.evicted, 9);
    assert!(engine.tile(origin_tile()).is_none());
    assert!(engine.totals().is_empty());
    assert_eq!(engine.debug_stats().discarded_tiles, 1);

    center_on(&mut engine, 0.8, 0.8);
    let tile = engine.tile(origin_tile()).expect("allocated again");
    assert!(tile.is_empty());
}

#[test]
fn dirty_tiles_are_saved_once_after_a_failed_batch() {
    let store = Arc::new(FlakyStore {
        inner: MemoryTileStore::new(),
        failures_left: AtomicU32::new(1),
    });
    let mut engine = running_engine_with_store(store.clone());
    center_on(&mut engine, 0.8, 0.8);
    show(&mut engine, (0.1, 0.1), (3.0, 1.5));
    drive(&mut engine, (0.4, 0.8), (2.8, 0.8), 0.2);

    let painted = [origin_tile(), TileCoord::new(1, 0)];
    for coord in painted {
        assert!(engine.tile(coord).expect("resident").is_dirty());
    }

    // Both tiles leave the hot set but stay visible.
    center_on(&mut engine, 100.0, 100.0);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));

    for coord in painted {
        let tile = engine.tile(coord).expect("visible tiles stay resident");
        assert!(!tile.is_dirty());
        assert_eq!(store.inner.save_count_for(coord.key()), 1);
        assert_eq!(store.inner.saved_revision(coord.key()), Some(tile.rev()));
    }
    let stats = engine.debug_stats();
    assert_eq!(stats.flush.failed_batches, 1);
    assert_eq!(stats.flush.saved_tiles, 2);
    assert_eq!(stats.scheduled_flushes, 0);
}

#[test]
fn dirty_or_pending_tiles_stay_resident() {
    let store = Arc::new(GatedStore::default());
    let mut engine = running_engine_with_store(store.clone());
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    let contribution = engine.totals();

    center_on(&mut engine, 100.0, 100.0);
    center_on(&mut engine, 200.0, 200.0);
    show(&mut engine, (300.0, 300.0), (301.0, 301.0));
    engine.pump_flush_completions();
    let tile = engine.tile(origin_tile()).expect("save still in flight");
    assert!(tile.is_dirty());
    assert_eq!(engine.debug_stats().scheduled_flushes, 1);

    store.open.store(true, Ordering::Release);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));
    assert!(engine.tile(origin_tile()).is_none());
    assert!(store.inner.contains(origin_tile().key()));
    // Persisted coverage still counts after eviction.
    assert_eq!(engine.totals(), contribution);
}

#[test]
fn reloading_an_evicted_tile_does_not_count_twice() {
    let store = Arc::new(MemoryTileStore::new());
    let mut engine = running_engine_with_store(store.clone());
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    center_on(&mut engine, 100.0, 100.0);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));
    assert!(engine.tile(origin_tile()).is_none());
    let before = engine.totals();

    let summary = center_on(&mut engine, 0.8, 0.8);
    assert_eq!(summary.loaded, 1);
    assert_eq!(engine.totals(), before);
    let recomputed = engine.recompute_totals().expect("job running");
    assert!(recomputed.approx_eq(&before, 1e-9));
}

#[test]
fn stored_data_merges_into_a_painted_pending_tile() {
    let store = Arc::new(MemoryTileStore::new());
    let mut engine = running_engine_with_store(store.clone());
    center_on(&mut engine, 0.8, 0.8);
    assert_eq!(engine.debug_stats().pending_loads, 9);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    let painted = engine.totals().once_px;

    store.insert_payload(&stored_tile_with_pixel(0));
    let summary = center_on(&mut engine, 0.8, 0.8);
    assert_eq!(summary.reconciled, 1);

    let tile = engine.tile(origin_tile()).expect("hot tile resident");
    assert_eq!(tile.counts()[0], 1);
    assert!(tile.is_dirty());
    let totals = engine.totals();
    assert_eq!(totals.once_px, painted + 1);
    assert_eq!(totals.section_px[1], 1);
    assert_eq!(engine.debug_stats().pending_loads, 8);
    assert!(engine.recompute_totals().expect("job running").approx_eq(&totals, 1e-9));
}

#[test]
fn prefetch_hints_cover_the_next_ring() {
    let store = Arc::new(MemoryTileStore::new());
    let mut engine = running_engine_with_store(store.clone());
    let summary = center_on(&mut engine, 0.8, 0.8);
    assert_eq!(summary.prefetched, 16);
    assert_eq!(store.prefetch_hint_count(), 16);
    assert_eq!(store.load_count(), 9);
}

#[test]
fn snapshot_import_accrues_each_tile_once() {
    let mut source = running_engine();
    center_on(&mut source, 0.8, 0.8);
    drive(&mut source, (0.2, 0.8), (1.4, 0.8), 0.2);
    drive(&mut source, (0.2, 0.8), (1.4, 0.8), 0.2);
    let snapshot = source.export_snapshot().expect("job running");
    let expected = source.totals();
    assert_eq!(snapshot.tiles.len(), 9);

    let json = serde_json::to_string(&snapshot).expect("snapshot serializes");
    let restored: RasterSnapshot = serde_json::from_str(&json).expect("snapshot parses");

    let mut target = running_engine();
    let first = target.import_snapshot(&restored, false).expect("import");
    assert_eq!(first.imported, 9);
    assert_eq!(first.accrued, 9);
    let second = target.import_snapshot(&restored, false).expect("import");
    assert_eq!(second.replaced, 9);
    assert_eq!(second.accrued, 0);
    assert!(target.totals().approx_eq(&expected, 1e-9));

    let mut other_grid = restored.clone();
    other_grid.tile_size = 32;
    assert!(matches!(
        target.import_snapshot(&other_grid, false),
        Err(CoverageError::SnapshotGridMismatch)
    ));
}

#[test]
fn recompute_matches_incremental_totals() {
    let mut engine = running_engine();
    center_on(&mut engine, 0.8, 0.8);
    for _ in 0..3 {
        drive(&mut engine, (-1.0, 0.8), (2.6, 0.8), 0.2);
    }
    drive(&mut engine, (0.8, -1.0), (0.8, 2.6), 0.2);
    let incremental = engine.totals();
    assert!(incremental.overlap_px > 0);

    let mut covered = 0;
    let mut passes = 0;
    for coord in tiles::square_window(origin_tile(), 1) {
        let tile = engine.tile(coord).expect("hot tile resident");
        for &count in tile.counts() {
            covered += u64::from(count > 0);
            passes += u64::from(count);
        }
    }
    assert_eq!(incremental.once_px, covered);
    assert_eq!(incremental.once_px + incremental.overlap_px, passes);

    let recomputed = engine.recompute_totals().expect("job running");
    assert!(recomputed.approx_eq(&incremental, 1e-9));
}

#[test]
fn bitmap_cache_follows_tile_revisions() {
    let mut engine = running_engine();
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);

    let first = engine
        .build_or_get_bitmap_for(0, 0, 4)
        .expect("valid stride")
        .expect("tile resident");
    let again = engine
        .build_or_get_bitmap_for(0, 0, 4)
        .expect("valid stride")
        .expect("tile resident");
    assert!(Arc::ptr_eq(&first, &again));
    assert_eq!(engine.debug_stats().bitmap_hits, 1);

    drive(&mut engine, (0.8, 0.2), (0.8, 1.4), 0.2);
    let fresh = engine
        .build_or_get_bitmap_for(0, 0, 4)
        .expect("valid stride")
        .expect("tile resident");
    assert_ne!(fresh.rev, first.rev);
    assert_ne!(fresh.pixels, first.pixels);

    engine.set_mode(VisualizationMode::Overlap);
    assert_eq!(engine.debug_stats().bitmap_cache_len, 0);
    assert_eq!(engine.mode(), VisualizationMode::Overlap);

    assert!(matches!(
        engine.build_or_get_bitmap_for(0, 0, 3),
        Err(CoverageError::InvalidStride { stride: 3, tile_size: 16 })
    ));
    assert!(matches!(
        engine.build_or_get_bitmap_for(0, 0, 0),
        Err(CoverageError::InvalidStride { .. })
    ));
    assert!(engine.build_or_get_bitmap_for(40, 40, 4).expect("valid").is_none());
}

#[test]
fn cancelled_updates_keep_previous_sets() {
    let mut engine = running_engine();
    center_on(&mut engine, 0.8, 0.8);
    show(&mut engine, (0.1, 0.1), (1.5, 1.5));
    let token = CancelToken::new();
    token.cancel();

    let far = geo(&engine, 100.0, 100.0);
    let outcome = engine.update_tractor_hot_center(far, &token).expect("no error");
    assert_eq!(outcome, UpdateOutcome::Cancelled);
    assert_eq!(engine.hot_center(), Some(origin_tile()));
    assert!(engine.is_hot(origin_tile()));
    assert!(engine.tile(TileCoord::new(62, 62)).is_none());

    let far_view = bounds(&engine, (100.0, 100.0), (101.0, 101.0));
    let outcome = engine.update_viewport(far_view, &token).expect("no error");
    assert_eq!(outcome, UpdateOutcome::Cancelled);
    assert!(engine.is_visible(origin_tile()));
    assert_eq!(engine.debug_stats().visible_tiles, 1);
}

#[test]
fn viewport_input_is_validated() {
    let mut config = config();
    config.max_viewport_tiles = 4;
    let mut engine = CoverageEngine::new(config).expect("valid config");
    engine.start_job(params()).expect("job starts");

    let wide = bounds(&engine, (0.1, 0.1), (4.0, 4.0));
    assert!(matches!(
        engine.update_viewport(wide, &CancelToken::new()),
        Err(CoverageError::ViewportTooLarge { tiles: 9, limit: 4 })
    ));
    let broken = GeoBounds {
        south: f64::NAN,
        west: 13.0,
        north: 52.0,
        east: 13.1,
    };
    assert!(matches!(
        engine.update_viewport(broken, &CancelToken::new()),
        Err(CoverageError::InvalidBounds)
    ));
    assert!(matches!(
        engine.update_tractor_hot_center(GeoPoint::new(52.0, f64::INFINITY), &CancelToken::new()),
        Err(CoverageError::NonFiniteCoordinate)
    ));
}

#[test]
fn stop_job_flushes_dirty_tiles() {
    let store = Arc::new(MemoryTileStore::new());
    let mut engine = running_engine_with_store(store.clone());
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);

    let report = engine.stop_job().expect("job running");
    assert_eq!(report.flushed, 1);
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.saved_tiles, 1);
    assert!(report.areas.once_m2 > 0.0);
    assert!(store.contains(origin_tile().key()));
    assert!(!engine.is_running());
    assert!(engine.totals().is_empty());
}

#[test]
fn attaching_a_store_mid_job_persists_later_departures() {
    let mut engine = running_engine();
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);

    let store = Arc::new(MemoryTileStore::new());
    engine.attach_store(Some(store.clone()));
    assert!(engine.has_store());
    center_on(&mut engine, 100.0, 100.0);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));

    assert!(store.contains(origin_tile().key()));
    assert_eq!(engine.debug_stats().discarded_tiles, 0);
}

#[test]
fn clear_coverage_keeps_the_job() {
    let mut engine = running_engine();
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);

    engine.clear_coverage().expect("job running");
    assert!(engine.is_running());
    assert!(engine.totals().is_empty());
    assert_eq!(engine.debug_stats().resident_tiles, 0);
    assert_eq!(engine.hot_center(), None);

    center_on(&mut engine, 0.8, 0.8);
    assert!(engine.tile(origin_tile()).expect("allocated").is_empty());
}

#[test]
fn scheduler_cancels_the_superseded_update() {
    let store = Arc::new(SlowStore {
        inner: MemoryTileStore::new(),
        delay: Duration::from_millis(20),
    });
    let engine = running_engine_with_store(store);
    let near = geo(&engine, 0.8, 0.8);
    let far = geo(&engine, 100.0, 100.0);
    let engine = Arc::new(Mutex::new(engine));
    let mut scheduler = UpdateScheduler::new(Arc::clone(&engine));

    assert!(scheduler.submit_hot_center(near).is_none());
    let superseded = scheduler.submit_hot_center(far);
    assert!(matches!(superseded, Some(Ok(UpdateOutcome::Cancelled))));
    let finished = scheduler.wait(UpdateKind::HotCenter);
    assert!(matches!(finished, Some(Ok(UpdateOutcome::Applied(_)))));
    assert!(scheduler.wait(UpdateKind::HotCenter).is_none());

    let engine = crate::scheduler::lock_engine(&engine);
    assert_eq!(engine.hot_center(), Some(TileCoord::new(62, 62)));
    let hot: HashSet<TileCoord> = tiles::square_window(TileCoord::new(62, 62), 1)
        .into_iter()
        .collect();
    assert!(hot.iter().all(|coord| engine.is_hot(*coord)));
}

#[test]
fn older_save_never_lands_after_a_newer_one() {
    let store = Arc::new(FirstSaveGate::default());
    let mut engine = running_engine_with_store(store.clone());
    let key = origin_tile().key();
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    center_on(&mut engine, 100.0, 100.0);
    assert!(wait_until(|| store.first_save_started()));

    // Back over the tile while its first save is still being written.
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.8, 0.2), (0.8, 1.4), 0.2);
    let newer = engine.tile(origin_tile()).expect("pinned by its save").rev();
    let painted = engine.totals();
    center_on(&mut engine, 100.0, 100.0);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(store.inner.saved_revision(key), None);

    store.open.store(true, Ordering::Release);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));
    assert_eq!(store.inner.saved_revision(key), Some(newer));
    assert!(engine.tile(origin_tile()).is_none());
    assert_eq!(engine.totals(), painted);

    let summary = center_on(&mut engine, 0.8, 0.8);
    assert_eq!(summary.loaded, 1);
    assert_eq!(engine.tile(origin_tile()).expect("reloaded").rev(), newer);
    let recomputed = engine.recompute_totals().expect("job running");
    assert!(recomputed.approx_eq(&painted, 1e-9));
}

#[test]
fn painting_proceeds_while_store_lookups_run() {
    let store = Arc::new(BlockingLoadStore::default());
    let mut engine = running_engine_with_store(store.clone());
    center_on(&mut engine, 0.8, 0.8);
    let far = geo(&engine, 100.0, 100.0);
    let start = geo(&engine, 0.2, 0.8);
    let end = geo(&engine, 1.4, 0.8);
    let engine = Arc::new(Mutex::new(engine));
    let mut scheduler = UpdateScheduler::new(Arc::clone(&engine));

    store.blocked.store(true, Ordering::Release);
    assert!(scheduler.submit_hot_center(far).is_none());
    assert!(wait_until(|| store.waiting.load(Ordering::Acquire) > 0));

    let mut guard = None;
    assert!(wait_until(|| {
        guard = engine.try_lock().ok();
        guard.is_some()
    }));
    let mut locked = guard.expect("engine lock is free during lookups");
    let report = locked.paint_stroke(&StrokeSample {
        last: Some(start),
        current: end,
        width_m: 0.4,
        sections: 0b1,
        rate: None,
        speed: None,
    });
    assert!(report.skipped.is_none());
    assert!(locked.totals().once_px > 0);
    drop(locked);

    store.blocked.store(false, Ordering::Release);
    let finished = scheduler.wait(UpdateKind::HotCenter);
    assert!(matches!(finished, Some(Ok(UpdateOutcome::Applied(_)))));
    let mut engine = crate::scheduler::lock_engine(&engine);
    assert_eq!(engine.hot_center(), Some(TileCoord::new(62, 62)));
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));
    assert!(store.inner.contains(origin_tile().key()));
}

#[test]
fn lookups_made_stale_while_unlocked_are_dropped() {
    let store = Arc::new(MemoryTileStore::new());
    let mut engine = running_engine_with_store(store.clone());
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    let painted = engine.totals();

    let view = bounds(&engine, (0.1, 0.1), (1.5, 1.5));
    let plan = engine.plan_viewport(view).expect("valid viewport");
    store.insert_payload(&stored_tile_with_pixel(0));
    let token = CancelToken::new();
    let fetched = plan.fetch(&token);

    // The tile is saved and released before the lookup result is applied.
    center_on(&mut engine, 100.0, 100.0);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));
    let tile = engine.tile(origin_tile()).expect("pinned by the running update");
    assert!(!tile.is_dirty());

    let summary = applied(engine.finish_update(plan, fetched, &token));
    assert_eq!(summary.loaded + summary.reconciled, 0);
    let tile = engine.tile(origin_tile()).expect("visible");
    assert_eq!(tile.counts()[0], 0);
    assert_eq!(engine.totals(), painted);

    let summary = show(&mut engine, (300.0, 300.0), (301.0, 301.0));
    assert!(summary.evicted >= 1);
    assert!(engine.tile(origin_tile()).is_none());
}

#[test]
fn import_over_a_tile_being_saved_persists_the_import() {
    let store = Arc::new(FirstSaveGate::default());
    let mut engine = running_engine_with_store(store.clone());
    let key = origin_tile().key();
    center_on(&mut engine, 0.8, 0.8);
    for _ in 0..3 {
        drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    }
    center_on(&mut engine, 100.0, 100.0);
    assert!(wait_until(|| store.first_save_started()));
    let saving = engine.tile(origin_tile()).expect("pinned by its save").rev();

    let imported = stored_tile_with_pixel(0);
    assert!(imported.rev < saving);
    let snapshot = RasterSnapshot {
        origin_lat: ORIGIN.lat,
        origin_lon: ORIGIN.lon,
        resolution_m: 0.1,
        tile_size: 16,
        tiles: vec![imported.clone()],
    };
    let summary = engine.import_snapshot(&snapshot, false).expect("same grid");
    assert_eq!(summary.replaced, 1);
    assert!(engine.tile(origin_tile()).expect("resident").rev() > saving);

    store.open.store(true, Ordering::Release);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));
    let persisted = store.inner.payload(key).expect("tile saved");
    assert_eq!(persisted.count, imported.count);
    assert!(persisted.rev > saving);
    assert!(engine.tile(origin_tile()).is_none());
    assert_eq!(engine.totals().once_px, 1);
}

#[test]
fn clear_coverage_drains_queued_saves() {
    let store = Arc::new(MemoryTileStore::new());
    let mut engine = running_engine_with_store(store.clone());
    let key = origin_tile().key();
    center_on(&mut engine, 0.8, 0.8);
    drive(&mut engine, (0.2, 0.8), (1.4, 0.8), 0.2);
    center_on(&mut engine, 100.0, 100.0);

    engine.clear_coverage().expect("job running");
    assert!(store.contains(key));
    assert_eq!(engine.debug_stats().scheduled_flushes, 0);

    let summary = center_on(&mut engine, 0.8, 0.8);
    assert_eq!(summary.loaded, 1);
    drive(&mut engine, (0.8, 0.2), (0.8, 1.4), 0.2);
    let rev = engine.tile(origin_tile()).expect("hot").rev();
    center_on(&mut engine, 100.0, 100.0);
    assert!(engine.wait_for_flush_idle(FLUSH_WAIT));
    assert_eq!(store.saved_revision(key), Some(rev));
}
