//! Bridge tracing infrastructure.
//!
//! The [`BridgeTracer`] trait defines hook points at the events that matter for
//! lifetime bugs: epochs starting and ending, refcount units taken and given back,
//! releases that were skipped or deferred, and native calls and faults. Every hook
//! has a no-op default.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | No-op (default) |
//! | [`StderrTracer`] | Human-readable log to stderr |
//! | [`RecordingTracer`] | Event recording for tests and post-mortem analysis |
//!
//! Hooks run while the session's native lock is held. A hook that drops a handle
//! has its release deferred to the next lock acquisition; a hook that calls back
//! into the bridge gets `InvalidState(Reentrant)`.

use std::sync::{Arc, Mutex, PoisonError};

use crate::{
    error::NativeError,
    ids::{EpochId, NativeId},
};

/// Trace event recorded by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    SessionStart(EpochId),
    SessionTeardown(EpochId),
    RefIncr { epoch: EpochId, id: NativeId },
    RefDecr { epoch: EpochId, id: NativeId },
    /// A release whose epoch was dead; no native decrement was performed.
    ReleaseSkipped { epoch: EpochId, id: NativeId },
    /// A release queued because the finalizing thread already held the lock.
    ReleaseDeferred { epoch: EpochId, id: NativeId },
    Call {
        epoch: EpochId,
        target: NativeId,
        wrapped: bool,
        arg_count: usize,
    },
    NativeFault(NativeError),
}

/// Trait for bridge tracing. All methods default to no-ops.
pub trait BridgeTracer: std::fmt::Debug + Send {
    /// Called after a new epoch went live.
    #[inline(always)]
    fn on_session_start(&mut self, _epoch: EpochId) {}

    /// Called before the interpreter of `epoch` is shut down.
    #[inline(always)]
    fn on_session_teardown(&mut self, _epoch: EpochId) {}

    /// Called after a refcount unit was taken on `id`.
    #[inline(always)]
    fn on_ref_incr(&mut self, _epoch: EpochId, _id: NativeId) {}

    /// Called after a refcount unit on `id` was given back.
    #[inline(always)]
    fn on_ref_decr(&mut self, _epoch: EpochId, _id: NativeId) {}

    /// Called when a release found its epoch dead and skipped the decrement.
    #[inline(always)]
    fn on_release_skipped(&mut self, _epoch: EpochId, _id: NativeId) {}

    /// Called when a release was queued for the next lock acquisition.
    #[inline(always)]
    fn on_release_deferred(&mut self, _epoch: EpochId, _id: NativeId) {}

    /// Called just before the native call entry point runs.
    #[inline(always)]
    fn on_call(&mut self, _epoch: EpochId, _target: NativeId, _wrapped: bool, _arg_count: usize) {}

    /// Called when a native call raised or crashed.
    #[inline(always)]
    fn on_native_fault(&mut self, _error: &NativeError) {}
}

// ============================================================================
// NoopTracer
// ============================================================================

/// A tracer that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl BridgeTracer for NoopTracer {}

// ============================================================================
// StderrTracer: human-readable log
// ============================================================================

/// Tracer that prints a human-readable log to stderr.
///
/// Output format:
/// ```text
/// === START epoch 1
///   +ref #12 epoch 1
///   >>> CALL #3 epoch 1  wrapped=true  args=2
///   -ref #12 epoch 1
///   ~ref #12 epoch 1 (skipped, epoch dead)
/// === TEARDOWN epoch 1
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Maximum number of lines to print before going quiet. None = unlimited.
    limit: Option<usize>,
    count: usize,
}

impl StderrTracer {
    /// Creates a new stderr tracer with no line limit.
    #[must_use]
    pub fn new() -> Self {
        Self { limit: None, count: 0 }
    }

    /// Creates a new stderr tracer that stops after `limit` lines.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            count: 0,
        }
    }

    fn emit(&mut self, line: std::fmt::Arguments<'_>) {
        if let Some(limit) = self.limit {
            if self.count > limit {
                return;
            }
            if self.count == limit {
                eprintln!("--- trace limit reached ({limit} lines) ---");
                self.count += 1;
                return;
            }
        }
        eprintln!("{line}");
        self.count += 1;
    }
}

impl BridgeTracer for StderrTracer {
    fn on_session_start(&mut self, epoch: EpochId) {
        self.emit(format_args!("=== START {epoch}"));
    }

    fn on_session_teardown(&mut self, epoch: EpochId) {
        self.emit(format_args!("=== TEARDOWN {epoch}"));
    }

    fn on_ref_incr(&mut self, epoch: EpochId, id: NativeId) {
        self.emit(format_args!("  +ref {id} {epoch}"));
    }

    fn on_ref_decr(&mut self, epoch: EpochId, id: NativeId) {
        self.emit(format_args!("  -ref {id} {epoch}"));
    }

    fn on_release_skipped(&mut self, epoch: EpochId, id: NativeId) {
        self.emit(format_args!("  ~ref {id} {epoch} (skipped, epoch dead)"));
    }

    fn on_release_deferred(&mut self, epoch: EpochId, id: NativeId) {
        self.emit(format_args!("  ~ref {id} {epoch} (deferred)"));
    }

    fn on_call(&mut self, epoch: EpochId, target: NativeId, wrapped: bool, arg_count: usize) {
        self.emit(format_args!(
            "  >>> CALL {target} {epoch}  wrapped={wrapped}  args={arg_count}"
        ));
    }

    fn on_native_fault(&mut self, error: &NativeError) {
        self.emit(format_args!("  !!! FAULT {error}"));
    }
}

// ============================================================================
// RecordingTracer: event recording
// ============================================================================

/// Tracer that records every event.
///
/// Clones share one event buffer, so a test can keep a clone while the session
/// owns the boxed tracer.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    events: Arc<Mutex<Vec<TraceEvent>>>,
    limit: Option<usize>,
}

impl RecordingTracer {
    /// Creates a new recording tracer with no event limit.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new recording tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::with_capacity(limit.min(1024)))),
            limit: Some(limit),
        }
    }

    /// Returns a copy of the events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<TraceEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Returns the number of events recorded.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn record(&self, event: TraceEvent) {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if self.limit.is_some_and(|limit| events.len() >= limit) {
            return;
        }
        events.push(event);
    }
}

impl BridgeTracer for RecordingTracer {
    fn on_session_start(&mut self, epoch: EpochId) {
        self.record(TraceEvent::SessionStart(epoch));
    }

    fn on_session_teardown(&mut self, epoch: EpochId) {
        self.record(TraceEvent::SessionTeardown(epoch));
    }

    fn on_ref_incr(&mut self, epoch: EpochId, id: NativeId) {
        self.record(TraceEvent::RefIncr { epoch, id });
    }

    fn on_ref_decr(&mut self, epoch: EpochId, id: NativeId) {
        self.record(TraceEvent::RefDecr { epoch, id });
    }

    fn on_release_skipped(&mut self, epoch: EpochId, id: NativeId) {
        self.record(TraceEvent::ReleaseSkipped { epoch, id });
    }

    fn on_release_deferred(&mut self, epoch: EpochId, id: NativeId) {
        self.record(TraceEvent::ReleaseDeferred { epoch, id });
    }

    fn on_call(&mut self, epoch: EpochId, target: NativeId, wrapped: bool, arg_count: usize) {
        self.record(TraceEvent::Call {
            epoch,
            target,
            wrapped,
            arg_count,
        });
    }

    fn on_native_fault(&mut self, error: &NativeError) {
        self.record(TraceEvent::NativeFault(error.clone()));
    }
}
