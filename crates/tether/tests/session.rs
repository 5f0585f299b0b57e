//! Tests for session lifecycle, tracing and configuration.

use pretty_assertions::assert_eq;
use tether::{
    BridgeConfig, BridgeStats, RecordingTracer, Session, StderrTracer, TraceEvent,
    local::LocalInterpreter,
};

fn traced() -> (Session, RecordingTracer) {
    let tracer = RecordingTracer::new();
    let session = Session::builder(LocalInterpreter::new())
        .tracer(tracer.clone())
        .start()
        .unwrap();
    (session, tracer)
}

fn count(events: &[TraceEvent], pred: impl Fn(&TraceEvent) -> bool) -> usize {
    events.iter().filter(|event| pred(event)).count()
}

// =============================================================================
// 1. Lifecycle events
// =============================================================================

/// Start takes one unit per table entry; teardown returns them before shutdown.
#[test]
fn start_and_teardown_are_traced_in_order() {
    let (session, tracer) = traced();
    let epoch = session.current_epoch().unwrap();
    let table_units = session.builtin_names().unwrap().len() + session.helper_names().unwrap().len();

    session.teardown().unwrap();
    let events = tracer.events();
    assert_eq!(events.first(), Some(&TraceEvent::SessionStart(epoch)));
    assert_eq!(events.last(), Some(&TraceEvent::SessionTeardown(epoch)));
    assert_eq!(count(&events, |e| matches!(e, TraceEvent::RefIncr { .. })), table_units);
    assert_eq!(count(&events, |e| matches!(e, TraceEvent::RefDecr { .. })), table_units);
}

/// Restart ends the old epoch before the new one starts.
#[test]
fn restart_emits_teardown_then_start() {
    let (session, tracer) = traced();
    let first = session.current_epoch().unwrap();
    let second = session.restart().unwrap();
    let events = tracer.events();
    let teardown = events
        .iter()
        .position(|e| *e == TraceEvent::SessionTeardown(first))
        .unwrap();
    let start = events
        .iter()
        .position(|e| *e == TraceEvent::SessionStart(second))
        .unwrap();
    assert!(teardown < start);
    assert_eq!(session.current_epoch().unwrap(), second);
}

/// A stale handle's finalizer is traced as skipped.
#[test]
fn stale_release_is_traced_as_skipped() {
    let (session, tracer) = traced();
    let object = session.builtin("object").unwrap().call(&[]).unwrap().unwrap();
    let epoch = object.epoch();
    let id = object.native_id();
    session.restart().unwrap();
    drop(object);
    assert_eq!(
        tracer.events().last(),
        Some(&TraceEvent::ReleaseSkipped { epoch, id })
    );
    assert_eq!(session.stats().unwrap().skipped_releases, 1);
}

/// Dropping the last session clone shuts the interpreter down.
#[test]
fn dropping_the_session_tears_down() {
    let native = LocalInterpreter::new();
    let probe = native.probe();
    let session = Session::start(native).unwrap();
    let clone = session.clone();
    assert!(clone.same_session(&session));
    drop(session);
    assert!(probe.epoch().is_some());
    drop(clone);
    assert_eq!(probe.epoch(), None);
    assert_eq!(probe.increments(), probe.decrements());
}

// =============================================================================
// 2. Stats and configuration
// =============================================================================

/// Stats count calls and refcount traffic.
#[test]
fn stats_track_calls() {
    let (session, _tracer) = traced();
    let before = session.stats().unwrap();
    let object = session.builtin("object").unwrap().call(&[]).unwrap().unwrap();
    drop(object);
    let delta = session.stats().unwrap().since(&before);
    assert_eq!(
        delta,
        BridgeStats {
            increments: 2,
            decrements: 2,
            calls: 1,
            ..BridgeStats::default()
        }
    );
}

/// Config loaded from JSON reaches the session.
#[test]
fn config_from_json() {
    let config = BridgeConfig::from_json(r#"{"max_call_args": 4}"#).unwrap();
    let session = Session::builder(LocalInterpreter::new())
        .config(config.clone())
        .start()
        .unwrap();
    assert_eq!(session.config(), &config);
    assert!(session.config().catch_native_panics);
}

/// The stderr tracer can drive a full session without interfering.
#[test]
fn stderr_tracer_smoke() {
    let session = Session::builder(LocalInterpreter::new())
        .tracer(StderrTracer::with_limit(5))
        .start()
        .unwrap();
    let object = session.builtin("object").unwrap().call(&[]).unwrap().unwrap();
    object.setattr("x", 1).unwrap();
    assert!(object.hasattr("x").unwrap());
}
