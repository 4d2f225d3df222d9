use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, warn};

use crate::Shared;

/// Periodically inspects the pending set. Runs until `shutdown` disconnects.
pub(crate) fn watchdog_loop(
    shared: Arc<Shared>,
    shutdown: Receiver<()>,
    interval: Duration,
    stuck_threshold: Duration,
) {
    loop {
        match shutdown.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        inspect(&shared, Instant::now(), stuck_threshold);
    }
}

pub(crate) fn inspect(shared: &Shared, now: Instant, stuck_threshold: Duration) {
    let ages = shared.pending.ages(now, stuck_threshold);
    let queued = shared.queue.len();
    if ages.stuck > 0 {
        shared.stuck_reports.fetch_add(1, Ordering::Relaxed);
        warn!(
            stuck = ages.stuck,
            pending = ages.pending,
            oldest_ms = ages.oldest.map_or(0, |oldest| oldest.as_millis() as u64),
            queued,
            "flush entries stuck"
        );
    }
    debug!(
        pending = ages.pending,
        queued,
        saved_tiles = load(&shared.saved_tiles),
        saved_batches = load(&shared.saved_batches),
        failed_batches = load(&shared.failed_batches),
        "flush telemetry"
    );
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
