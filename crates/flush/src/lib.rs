//! Background persistence of dirty tiles.
//!
//! The owner of the tile map enqueues immutable payload snapshots; worker
//! threads batch them into `TileStore::save_dirty_tiles_and_clear` calls and
//! report each saved revision back over a channel. Workers never see live
//! tiles, so a tile repainted while its snapshot is saving simply stays
//! dirty. At most one revision of a tile is being written at any time.

mod pending;
mod queue;
mod watchdog;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use model::{TileKey, TilePayload};
use tiles::TileStore;
use tracing::{debug, trace, warn};

pub use pending::PendingAges;

use crate::pending::{Claim, PendingFlushes};
use crate::queue::FlushQueue;

#[derive(Debug, Clone, PartialEq)]
pub struct FlushJob {
    pub key: TileKey,
    pub rev: u64,
    pub payload: TilePayload,
}

/// A revision of `key` is now durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushCompletion {
    pub key: TileKey,
    pub rev: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlushConfig {
    pub workers: usize,
    pub batch_cap: usize,
    /// Queue depth above which producers should yield.
    pub soft_limit: usize,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub idle_poll: Duration,
    pub watchdog_interval: Duration,
    pub stuck_threshold: Duration,
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            batch_cap: 512,
            soft_limit: 2048,
            backoff_base: Duration::from_millis(100),
            backoff_max: Duration::from_millis(5000),
            idle_poll: Duration::from_millis(20),
            watchdog_interval: Duration::from_millis(5000),
            stuck_threshold: Duration::from_millis(30_000),
        }
    }
}

impl FlushConfig {
    /// Delay before retrying after `consecutive_failures` failed batches.
    pub fn backoff(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(31);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    pub queued: usize,
    pub pending: usize,
    pub enqueued_total: u64,
    pub saved_tiles: u64,
    pub saved_batches: u64,
    pub failed_batches: u64,
    pub stuck_reports: u64,
    pub oldest_pending: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownReport {
    pub drained: bool,
    /// Tiles still unsaved when the workers stopped.
    pub abandoned: usize,
}

pub(crate) struct Shared {
    queue: FlushQueue,
    pending: PendingFlushes,
    saved_tiles: AtomicU64,
    saved_batches: AtomicU64,
    failed_batches: AtomicU64,
    stuck_reports: AtomicU64,
}

pub struct FlushPipeline {
    config: FlushConfig,
    shared: Arc<Shared>,
    stop_requested: Arc<AtomicBool>,
    completions: Receiver<FlushCompletion>,
    workers: Vec<JoinHandle<()>>,
    watchdog: Option<(Sender<()>, JoinHandle<()>)>,
}

impl FlushPipeline {
    pub fn start(store: Arc<dyn TileStore>, config: FlushConfig) -> Self {
        assert!(config.workers > 0, "flush worker count must be greater than zero");
        assert!(config.batch_cap > 0, "flush batch cap must be greater than zero");

        let shared = Arc::new(Shared {
            queue: FlushQueue::new(),
            pending: PendingFlushes::default(),
            saved_tiles: AtomicU64::new(0),
            saved_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
            stuck_reports: AtomicU64::new(0),
        });
        let stop_requested = Arc::new(AtomicBool::new(false));
        let (completion_sender, completions) = unbounded();

        let workers = (0..config.workers)
            .map(|index| {
                let worker = Worker {
                    store: Arc::clone(&store),
                    shared: Arc::clone(&shared),
                    stop_requested: Arc::clone(&stop_requested),
                    completions: completion_sender.clone(),
                    config,
                };
                std::thread::Builder::new()
                    .name(format!("tile_flush_{index}"))
                    .spawn(move || worker.run())
                    .expect("spawn tile flush worker")
            })
            .collect();

        let (watchdog_shutdown, watchdog_receiver) = crossbeam_channel::bounded(1);
        let watchdog_shared = Arc::clone(&shared);
        let watchdog_handle = std::thread::Builder::new()
            .name("tile_flush_watchdog".to_owned())
            .spawn(move || {
                watchdog::watchdog_loop(
                    watchdog_shared,
                    watchdog_receiver,
                    config.watchdog_interval,
                    config.stuck_threshold,
                )
            })
            .expect("spawn tile flush watchdog");

        debug!(workers = config.workers, batch_cap = config.batch_cap, "flush pipeline started");
        Self {
            config,
            shared,
            stop_requested,
            completions,
            workers,
            watchdog: Some((watchdog_shutdown, watchdog_handle)),
        }
    }

    pub fn config(&self) -> &FlushConfig {
        &self.config
    }

    pub fn enqueue(&self, job: FlushJob) {
        self.shared.pending.mark(job.key, job.rev, Instant::now());
        self.shared.queue.push(job);
    }

    pub fn is_pending(&self, key: TileKey) -> bool {
        self.shared.pending.contains(key)
    }

    pub fn queue_len(&self) -> usize {
        self.shared.queue.len()
    }

    pub fn over_soft_limit(&self) -> bool {
        self.queue_len() > self.config.soft_limit
    }

    pub fn is_idle(&self) -> bool {
        self.shared.queue.is_empty() && self.shared.pending.is_empty()
    }

    /// Completions reported since the last call, oldest first.
    pub fn drain_completions(&self) -> Vec<FlushCompletion> {
        self.completions.try_iter().collect()
    }

    /// Blocks until every queued job is saved or `timeout` passes.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        const POLL_INTERVAL: Duration = Duration::from_millis(2);
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_idle() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    /// Runs one watchdog inspection immediately.
    pub fn inspect_now(&self) -> PendingAges {
        let now = Instant::now();
        watchdog::inspect(&self.shared, now, self.config.stuck_threshold);
        self.shared.pending.ages(now, self.config.stuck_threshold)
    }

    pub fn stats(&self) -> FlushStats {
        let ages = self
            .shared
            .pending
            .ages(Instant::now(), self.config.stuck_threshold);
        FlushStats {
            queued: self.shared.queue.len(),
            pending: ages.pending,
            enqueued_total: self.shared.queue.pushed(),
            saved_tiles: self.shared.saved_tiles.load(Ordering::Relaxed),
            saved_batches: self.shared.saved_batches.load(Ordering::Relaxed),
            failed_batches: self.shared.failed_batches.load(Ordering::Relaxed),
            stuck_reports: self.shared.stuck_reports.load(Ordering::Relaxed),
            oldest_pending: ages.oldest,
        }
    }

    /// Waits up to `drain_timeout` for outstanding saves, then stops every
    /// thread. Completions remain readable until the pipeline is dropped.
    pub fn shutdown(&mut self, drain_timeout: Duration) -> ShutdownReport {
        let drained = self.wait_idle(drain_timeout);
        self.stop_threads();
        let abandoned = self.shared.pending.len();
        if drained {
            debug!("flush pipeline drained and stopped");
        } else {
            warn!(abandoned, "flush pipeline stopped before draining");
        }
        ShutdownReport { drained, abandoned }
    }

    fn stop_threads(&mut self) {
        self.stop_requested.store(true, Ordering::Release);
        for handle in self.workers.drain(..) {
            handle.join().expect("join tile flush worker");
        }
        if let Some((shutdown, handle)) = self.watchdog.take() {
            drop(shutdown);
            handle.join().expect("join tile flush watchdog");
        }
    }
}

impl Drop for FlushPipeline {
    fn drop(&mut self) {
        self.stop_threads();
    }
}

struct Worker {
    store: Arc<dyn TileStore>,
    shared: Arc<Shared>,
    stop_requested: Arc<AtomicBool>,
    completions: Sender<FlushCompletion>,
    config: FlushConfig,
}

impl Worker {
    fn run(self) {
        let mut drained = Vec::with_capacity(self.config.batch_cap);
        let mut consecutive_failures = 0u32;
        while !self.stop_requested.load(Ordering::Acquire) {
            drained.clear();
            self.shared.queue.drain_batch_with_wait(
                &mut drained,
                self.config.batch_cap,
                self.config.idle_poll,
            );
            if drained.is_empty() {
                continue;
            }

            let batch = self.claim_batch(&mut drained);
            if batch.is_empty() {
                // Only tiles another worker is still writing.
                self.sleep_unless_stopped(self.config.idle_poll);
                continue;
            }
            let items: Vec<(TileKey, TilePayload)> = batch
                .iter()
                .map(|job| (job.key, job.payload.clone()))
                .collect();
            match self.store.save_dirty_tiles_and_clear(&items) {
                Ok(()) => {
                    consecutive_failures = 0;
                    self.shared
                        .saved_tiles
                        .fetch_add(batch.len() as u64, Ordering::Relaxed);
                    self.shared.saved_batches.fetch_add(1, Ordering::Relaxed);
                    for job in &batch {
                        // Sent before the pending entry clears so an idle
                        // pipeline has no completion left in flight. The
                        // owner may already be gone during teardown.
                        let _ = self.completions.send(FlushCompletion {
                            key: job.key,
                            rev: job.rev,
                        });
                        self.shared.pending.complete(job.key, job.rev);
                    }
                }
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.shared.failed_batches.fetch_add(1, Ordering::Relaxed);
                    let backoff = self.config.backoff(consecutive_failures);
                    warn!(
                        %error,
                        tiles = batch.len(),
                        consecutive_failures,
                        backoff_ms = backoff.as_millis() as u64,
                        "tile batch save failed, retrying"
                    );
                    for job in batch {
                        self.shared.pending.release(job.key);
                        self.shared.queue.requeue(job);
                    }
                    self.sleep_unless_stopped(backoff);
                }
            }
        }
    }

    /// Keeps the jobs this worker may write. Tiles being written elsewhere
    /// go back on the queue and superseded revisions are dropped.
    fn claim_batch(&self, drained: &mut Vec<FlushJob>) -> Vec<FlushJob> {
        let mut claimed = Vec::new();
        for job in newest_per_tile(drained) {
            match self.shared.pending.claim(job.key, job.rev) {
                Claim::Save => claimed.push(job),
                Claim::Busy => self.shared.queue.requeue(job),
                Claim::Superseded => {
                    trace!(key = %job.key, rev = job.rev, "superseded tile save dropped");
                }
            }
        }
        claimed
    }

    fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.stop_requested.load(Ordering::Acquire) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            std::thread::sleep(remaining.min(self.config.idle_poll));
        }
    }
}

/// Collapses a drained batch to the newest revision of each tile.
fn newest_per_tile(drained: &mut Vec<FlushJob>) -> Vec<FlushJob> {
    let mut newest: HashMap<TileKey, FlushJob> = HashMap::with_capacity(drained.len());
    for job in drained.drain(..) {
        match newest.get(&job.key) {
            Some(existing) if existing.rev >= job.rev => {}
            _ => {
                newest.insert(job.key, job);
            }
        }
    }
    let mut batch: Vec<FlushJob> = newest.into_values().collect();
    batch.sort_unstable_by_key(|job| job.key);
    batch
}
