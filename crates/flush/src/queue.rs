use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use crossbeam_queue::SegQueue;

use crate::FlushJob;

/// Unbounded multi-producer, multi-consumer job queue with a wake-up channel
/// so idle workers block instead of spinning.
pub(crate) struct FlushQueue {
    jobs: SegQueue<FlushJob>,
    notify_sender: Sender<()>,
    notify_receiver: Receiver<()>,
    pushed: AtomicU64,
}

impl FlushQueue {
    pub fn new() -> Self {
        let (notify_sender, notify_receiver) = bounded(1);
        Self {
            jobs: SegQueue::new(),
            notify_sender,
            notify_receiver,
            pushed: AtomicU64::new(0),
        }
    }

    pub fn push(&self, job: FlushJob) {
        self.pushed.fetch_add(1, Ordering::Relaxed);
        self.requeue(job);
    }

    /// Puts a job back without counting it as a new enqueue.
    pub fn requeue(&self, job: FlushJob) {
        self.jobs.push(job);
        match self.notify_sender.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            // Both ends live in `self`.
            Err(TrySendError::Disconnected(())) => unreachable!("flush notify channel closed"),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Appends up to `max_items` jobs to `output`, waiting at most
    /// `wait_timeout` for the first one.
    pub fn drain_batch_with_wait(
        &self,
        output: &mut Vec<FlushJob>,
        max_items: usize,
        wait_timeout: Duration,
    ) {
        if max_items == 0 {
            return;
        }
        if self.drain_available(output, max_items) > 0 || wait_timeout.is_zero() {
            return;
        }

        let wait_deadline = Instant::now() + wait_timeout;
        loop {
            let remaining = wait_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return;
            }
            match self.notify_receiver.recv_timeout(remaining) {
                Ok(()) => {
                    if self.drain_available(output, max_items) > 0 {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => return,
                Err(RecvTimeoutError::Disconnected) => {
                    unreachable!("flush notify channel closed")
                }
            }
        }
    }

    fn drain_available(&self, output: &mut Vec<FlushJob>, max_items: usize) -> usize {
        let mut drained = 0;
        while drained < max_items {
            match self.jobs.pop() {
                Some(job) => {
                    output.push(job);
                    drained += 1;
                }
                None => break,
            }
        }
        // Another worker may still find work behind this batch.
        if drained == max_items && !self.jobs.is_empty() {
            let _ = self.notify_sender.try_send(());
        }
        drained
    }
}
