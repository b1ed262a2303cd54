//! The thread-safety boundary around the stabilization engine.
//!
//! [`Stabilizer`] is an exclusive-lock wrapper over the adaptive engine. One
//! video thread drives `process_frame` while a UI thread issues parameter
//! updates, resets and metric queries; every entry point takes the same
//! mutex, so an update issued before frame `N` is observed no later than
//! frame `N + 1`. There is no reader/writer split on purpose: every frame is
//! a write, reads are rare, and a single lock keeps the reasoning trivial.
//!
//! This is also the end-of-the-world fault boundary: panics from the layers
//! below are caught here, recorded, and turned into a passthrough frame.

use crate::adaptive::{AdaptiveConfig, AdaptiveStabilizer};
use crate::engine::FrameResult;
use crate::frame::FrameViewMut;
use crate::metrics::PerformanceMetrics;
use crate::params::StabilizerParams;
use log::error;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard};

/// Thread-safe handle to a stabilization engine.
pub struct Stabilizer {
    inner: Mutex<AdaptiveStabilizer>,
}

impl Default for Stabilizer {
    fn default() -> Self {
        Stabilizer::new()
    }
}

impl Stabilizer {
    /// Creates a stabilizer with default adaptive configuration and the
    /// portable pipeline backends.
    pub fn new() -> Self {
        Stabilizer::with_engine(AdaptiveStabilizer::default())
    }

    /// Wraps a caller-assembled engine.
    pub fn with_engine(engine: AdaptiveStabilizer) -> Self {
        Stabilizer {
            inner: Mutex::new(engine),
        }
    }

    /// Creates a stabilizer with a custom regime target table.
    pub fn with_config(config: AdaptiveConfig) -> Self {
        Stabilizer::with_engine(AdaptiveStabilizer::new(config))
    }

    // A panicking frame must not wedge the engine forever; recover the
    // guard and keep serving. The engine is left in Failed status by the
    // panic handler in process_frame.
    fn lock(&self) -> MutexGuard<'_, AdaptiveStabilizer> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Prepares the engine for a stream. Returns `false` on invalid
    /// dimensions; inspect [`last_error`](Stabilizer::last_error) for the
    /// reason.
    pub fn initialize(&self, width: usize, height: usize, params: StabilizerParams) -> bool {
        self.lock().initialize(width, height, params)
    }

    /// Stabilizes one frame in place.
    ///
    /// Holds the lock for the full call; parameter updates from other
    /// threads are therefore bounded by one frame's processing time. Never
    /// panics: internal faults surface as a passthrough result plus
    /// [`last_error`](Stabilizer::last_error).
    pub fn process_frame(&self, frame: &mut FrameViewMut<'_>) -> FrameResult {
        let mut guard = self.lock();
        if !guard.is_ready() {
            return FrameResult::Passthrough;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| guard.process_frame(frame)));
        match outcome {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!("panic absorbed at stabilizer boundary: {}", reason);
                guard.record_panic(format!("internal panic: {}", reason));
                FrameResult::Passthrough
            }
        }
    }

    /// Replaces the tuning parameters; out-of-range fields are clamped
    /// silently. Observed by the next processed frame.
    pub fn update_parameters(&self, params: StabilizerParams) {
        self.lock().update_parameters(params);
    }

    /// Clears per-stream state; the engine re-enters the initializing state.
    pub fn reset(&self) {
        self.lock().reset();
    }

    /// Snapshot of the engine metrics.
    pub fn metrics(&self) -> PerformanceMetrics {
        self.lock().metrics()
    }

    /// Copy of the active (clamped) parameter set.
    pub fn current_params(&self) -> StabilizerParams {
        self.lock().current_params()
    }

    /// The most recent fault description; empty when nothing has failed.
    pub fn last_error(&self) -> String {
        self.lock().last_error().to_string()
    }

    /// Whether `initialize` has succeeded.
    pub fn is_ready(&self) -> bool {
        self.lock().is_ready()
    }

    /// Runs `f` with exclusive access to the engine, for host integrations
    /// that need the richer adaptive API (sensitivity, regime inspection).
    pub fn with_engine_mut<R>(&self, f: impl FnOnce(&mut AdaptiveStabilizer) -> R) -> R {
        f(&mut self.lock())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
