//! Off-thread hot/viewport recomputation with cancel-and-join semantics.
//!
//! The engine lock is held only to plan an update and to apply it. Store
//! lookups in between run unlocked so painting never waits on the store.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use model::{GeoBounds, GeoPoint};
use tracing::debug;

use crate::{CoverageEngine, CoverageError, UpdateOutcome, UpdatePlan};

/// Cooperative cancellation flag shared between a requester and a running
/// recomputation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub type UpdateResult = Result<UpdateOutcome, CoverageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateKind {
    HotCenter,
    Viewport,
}

struct InFlight {
    token: CancelToken,
    handle: JoinHandle<UpdateResult>,
}

impl InFlight {
    fn cancel_and_join(self) -> UpdateResult {
        self.token.cancel();
        self.join()
    }

    fn join(self) -> UpdateResult {
        match self.handle.join() {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

/// Runs at most one hot-center and one viewport update at a time against a
/// shared engine. Submitting a new update of a kind cancels the previous one
/// of that kind and waits for it before starting.
pub struct UpdateScheduler {
    engine: Arc<Mutex<CoverageEngine>>,
    hot: Option<InFlight>,
    viewport: Option<InFlight>,
}

pub(crate) fn lock_engine(engine: &Mutex<CoverageEngine>) -> MutexGuard<'_, CoverageEngine> {
    engine.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UpdateScheduler {
    pub fn new(engine: Arc<Mutex<CoverageEngine>>) -> Self {
        Self {
            engine,
            hot: None,
            viewport: None,
        }
    }

    pub fn engine(&self) -> &Arc<Mutex<CoverageEngine>> {
        &self.engine
    }

    /// Returns the outcome of the update this one superseded, if any.
    pub fn submit_hot_center(&mut self, point: GeoPoint) -> Option<UpdateResult> {
        let previous = self.hot.take().map(InFlight::cancel_and_join);
        self.hot = Some(self.spawn(UpdateKind::HotCenter, move |engine| {
            engine.plan_hot_center(point)
        }));
        previous
    }

    pub fn submit_viewport(&mut self, bounds: GeoBounds) -> Option<UpdateResult> {
        let previous = self.viewport.take().map(InFlight::cancel_and_join);
        self.viewport = Some(self.spawn(UpdateKind::Viewport, move |engine| {
            engine.plan_viewport(bounds)
        }));
        previous
    }

    /// Waits for the in-flight update of `kind` to finish.
    pub fn wait(&mut self, kind: UpdateKind) -> Option<UpdateResult> {
        self.slot(kind).take().map(InFlight::join)
    }

    pub fn cancel(&mut self, kind: UpdateKind) -> Option<UpdateResult> {
        self.slot(kind).take().map(InFlight::cancel_and_join)
    }

    fn slot(&mut self, kind: UpdateKind) -> &mut Option<InFlight> {
        match kind {
            UpdateKind::HotCenter => &mut self.hot,
            UpdateKind::Viewport => &mut self.viewport,
        }
    }

    fn spawn<F>(&self, kind: UpdateKind, make_plan: F) -> InFlight
    where
        F: FnOnce(&mut CoverageEngine) -> Result<UpdatePlan, CoverageError> + Send + 'static,
    {
        let token = CancelToken::new();
        let worker_token = token.clone();
        let engine = Arc::clone(&self.engine);
        let name = match kind {
            UpdateKind::HotCenter => "coverage_hot_update",
            UpdateKind::Viewport => "coverage_viewport_update",
        };
        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                if worker_token.is_cancelled() {
                    return Ok(UpdateOutcome::Cancelled);
                }
                let plan = make_plan(&mut *lock_engine(&engine))?;
                let fetched = plan.fetch(&worker_token);
                let result = lock_engine(&engine).finish_update(plan, fetched, &worker_token);
                if matches!(result, Ok(UpdateOutcome::Cancelled)) {
                    debug!(?kind, "tile set update cancelled");
                }
                result
            })
            .expect("spawn coverage update thread");
        InFlight { token, handle }
    }
}

impl Drop for UpdateScheduler {
    fn drop(&mut self) {
        for in_flight in [self.hot.take(), self.viewport.take()].into_iter().flatten() {
            let _ = in_flight.cancel_and_join();
        }
    }
}
