use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use model::TileKey;

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    since: Instant,
    rev: u64,
    /// Revision a worker is writing right now.
    saving: Option<u64>,
}

/// What a worker may do with a drained job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Claim {
    Save,
    /// Another worker is writing this tile; retry later.
    Busy,
    /// A newer revision is queued or already saved.
    Superseded,
}

/// Tiles handed to the pipeline whose newest revision is not yet saved.
#[derive(Debug, Default)]
pub(crate) struct PendingFlushes {
    entries: Mutex<HashMap<TileKey, PendingEntry>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingAges {
    pub pending: usize,
    pub stuck: usize,
    pub oldest: Option<Duration>,
}

impl PendingFlushes {
    fn lock(&self) -> MutexGuard<'_, HashMap<TileKey, PendingEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `rev` as the newest revision queued for `key`. The pending
    /// age keeps counting from the first unsaved enqueue.
    pub fn mark(&self, key: TileKey, rev: u64, now: Instant) {
        self.lock()
            .entry(key)
            .and_modify(|entry| entry.rev = entry.rev.max(rev))
            .or_insert(PendingEntry {
                since: now,
                rev,
                saving: None,
            });
    }

    /// Reserves `key` for one writer. At most one revision of a tile is
    /// in flight, so an older save can never land after a newer one.
    pub fn claim(&self, key: TileKey, rev: u64) -> Claim {
        let mut entries = self.lock();
        match entries.get_mut(&key) {
            Some(entry) if entry.rev > rev => Claim::Superseded,
            Some(entry) if entry.saving.is_some() => Claim::Busy,
            Some(entry) => {
                entry.saving = Some(rev);
                Claim::Save
            }
            None => Claim::Superseded,
        }
    }

    /// Gives up a claim after a failed write.
    pub fn release(&self, key: TileKey) {
        if let Some(entry) = self.lock().get_mut(&key) {
            entry.saving = None;
        }
    }

    /// Ends the claim on `key` and clears it once a revision at least as new
    /// as the last queued one is saved.
    pub fn complete(&self, key: TileKey, rev: u64) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&key) {
            Some(entry) if entry.rev <= rev => {
                entries.remove(&key);
                true
            }
            Some(entry) => {
                entry.saving = None;
                false
            }
            None => false,
        }
    }

    pub fn contains(&self, key: TileKey) -> bool {
        self.lock().contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn ages(&self, now: Instant, stuck_threshold: Duration) -> PendingAges {
        let entries = self.lock();
        let mut ages = PendingAges {
            pending: entries.len(),
            ..PendingAges::default()
        };
        for entry in entries.values() {
            let age = now.saturating_duration_since(entry.since);
            if age >= stuck_threshold {
                ages.stuck += 1;
            }
            ages.oldest = Some(ages.oldest.map_or(age, |oldest| oldest.max(age)));
        }
        ages
    }
}
