//! Tests for handle refcount bridging and epoch validity.
//!
//! Each test drives a `Session` over the reference interpreter and checks the
//! native side through a `LocalProbe`: every unit taken must be given back exactly
//! once, and nothing may be decremented in an interpreter that did not issue it.

use std::{
    sync::{Arc, Mutex, OnceLock},
    thread,
};

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tether::{
    BridgeError, BridgeTracer, EpochId, Handle, InvalidState, NativeError, NativeId, Session,
    local::{LocalInterpreter, LocalProbe},
};

/// Builtins plus helpers registered by the reference interpreter.
const TABLE_UNITS: u64 = 11;

fn start() -> (Session, LocalProbe) {
    let native = LocalInterpreter::new();
    let probe = native.probe();
    (Session::start(native).unwrap(), probe)
}

fn make_object(session: &Session) -> Handle {
    session.builtin("object").unwrap().call(&[]).unwrap().unwrap()
}

/// Runs a native call so results borrowed by earlier calls are dropped.
fn settle(session: &Session) {
    session.builtin("repr").unwrap().invoke(&[1.into()]).unwrap();
}

// =============================================================================
// 1. Unit ownership
// =============================================================================

/// A handle holds exactly one native reference, given back on release.
#[test]
fn handle_owns_one_unit_until_released() {
    let (session, probe) = start();
    let object = make_object(&session);
    let id = object.native_id();
    settle(&session);
    assert_eq!(probe.refcount(id), 1);

    let second = session.handle(id).unwrap();
    assert_eq!(probe.refcount(id), 2);
    drop(second);
    assert_eq!(probe.refcount(id), 1);

    object.release();
    assert!(!probe.is_live(id));
    assert!(object.is_released());
    assert!(!object.is_valid());
}

/// Releasing twice, then dropping, performs a single native decrement.
#[test]
fn release_is_idempotent() {
    let (session, probe) = start();
    let object = make_object(&session);
    let before = probe.decrements();
    object.release();
    object.release();
    drop(object);
    assert_eq!(probe.decrements() - before, 1);
    assert_eq!(probe.stray_decrements(), 0);
}

/// Clones share one unit: only the last clone's drop gives it back.
#[test]
fn clones_share_one_unit() {
    let (session, probe) = start();
    let object = make_object(&session);
    let id = object.native_id();
    let clone = object.clone();
    settle(&session);
    assert_eq!(probe.refcount(id), 1);
    drop(object);
    assert!(probe.is_live(id));
    assert!(clone.is_valid());
    drop(clone);
    assert!(!probe.is_live(id));
}

/// A released handle is released for every clone.
#[test]
fn release_through_a_clone_invalidates_all() {
    let (session, _probe) = start();
    let object = make_object(&session);
    let clone = object.clone();
    clone.release();
    let err = object.invoke(&[]).unwrap_err();
    assert_eq!(err, BridgeError::InvalidState(InvalidState::Released));
}

/// `duplicate` takes an independent unit on the same object.
#[test]
fn duplicate_is_independent() {
    let (session, probe) = start();
    let object = make_object(&session);
    let id = object.native_id();
    let duplicate = object.duplicate().unwrap();
    assert_eq!(duplicate, object);
    object.release();
    assert!(duplicate.is_valid());
    settle(&session);
    assert_eq!(probe.refcount(id), 1);
}

/// `Handle::new` on something that is not a live object fails without a unit.
#[test]
fn wrapping_a_dead_id_is_not_an_object() {
    let (session, _probe) = start();
    let before = session.stats().unwrap();
    let err = session.handle(NativeId::new(99_999)).unwrap_err();
    assert!(matches!(err, BridgeError::NotAnObject(_)));
    assert_eq!(session.stats().unwrap().since(&before).increments, 0);
}

// =============================================================================
// 2. Epoch validity
// =============================================================================

/// After a restart the old handle is invalid and every use is a state error.
#[test]
fn restart_invalidates_old_handles() {
    let (session, _probe) = start();
    let object = make_object(&session);
    let old_epoch = object.epoch();
    let new_epoch = session.restart().unwrap();
    assert_ne!(old_epoch, new_epoch);
    assert!(!object.is_valid());
    assert!(!session.is_epoch_live(old_epoch));
    assert_eq!(
        object.invoke(&[]).unwrap_err(),
        BridgeError::InvalidState(InvalidState::DeadEpoch(old_epoch))
    );
    assert!(object.duplicate().unwrap_err().is_invalid_state());
    assert!(object.getattr("x").unwrap_err().is_invalid_state());
}

/// Finalizing a stale handle never decrements the object that now owns its ID.
#[test]
fn stale_finalizer_spares_recycled_id() {
    let (session, probe) = start();
    let stale = make_object(&session);
    let old_epoch = stale.epoch();

    session.restart().unwrap();
    let fresh = make_object(&session);
    assert_eq!(fresh.native_id(), stale.native_id(), "arena IDs repeat across epochs");
    settle(&session);
    let refcount = probe.refcount(fresh.native_id());
    let old_decrements = probe.decrements_in(old_epoch);

    let before = session.stats().unwrap();
    drop(stale);
    let delta = session.stats().unwrap().since(&before);
    assert_eq!(delta.decrements, 0);
    assert_eq!(delta.skipped_releases, 1);
    assert_eq!(probe.refcount(fresh.native_id()), refcount);
    assert_eq!(probe.decrements_in(old_epoch), old_decrements);
    assert!(fresh.is_valid());
}

/// Teardown returns the table units, is idempotent and leaves no live epoch.
#[test]
fn teardown_is_idempotent() {
    let (session, probe) = start();
    session.teardown().unwrap();
    session.teardown().unwrap();
    assert!(!session.is_active());
    assert_eq!(
        session.current_epoch().unwrap_err(),
        BridgeError::InvalidState(InvalidState::NoActiveSession)
    );
    let stats = session.stats().unwrap();
    assert_eq!(stats.increments, TABLE_UNITS);
    assert_eq!(stats.outstanding(), 0);
    assert_eq!(probe.increments(), probe.decrements());
    assert_eq!(probe.epoch(), None);
}

/// Creating or duplicating a handle without a live epoch touches no refcount.
#[test]
fn dead_epoch_construction_takes_no_unit() {
    let (session, probe) = start();
    let object = make_object(&session);
    let id = object.native_id();
    let epoch = object.epoch();
    session.teardown().unwrap();
    let increments = probe.increments();

    assert_eq!(
        session.handle(id).unwrap_err(),
        BridgeError::InvalidState(InvalidState::NoActiveSession)
    );
    assert_eq!(
        object.duplicate().unwrap_err(),
        BridgeError::InvalidState(InvalidState::DeadEpoch(epoch))
    );
    assert_eq!(probe.increments(), increments);
}

/// A session built without starting has no epoch until `restart`.
#[test]
fn unstarted_session_has_no_epoch() {
    let session = Session::builder(LocalInterpreter::new()).build();
    assert_eq!(
        session.builtin("object").unwrap_err(),
        BridgeError::InvalidState(InvalidState::NoActiveSession)
    );
    session.restart().unwrap();
    assert!(make_object(&session).is_valid());
}

/// Handles outliving their session are inert.
#[test]
fn handle_outlives_session() {
    let (session, _probe) = start();
    let object = make_object(&session);
    drop(session);
    assert!(object.session().is_none());
    assert!(!object.is_valid());
    assert_eq!(
        object.invoke(&[]).unwrap_err(),
        BridgeError::InvalidState(InvalidState::SessionDropped)
    );
    drop(object);
}

/// A handle of one session cannot be passed into another.
#[test]
fn cross_session_argument_is_state_mismatch() {
    let (first, _) = start();
    let (second, _) = start();
    let object = make_object(&first);
    let repr = second.builtin("repr").unwrap();
    let err = repr.invoke(&[object.into()]).unwrap_err();
    assert!(matches!(err, BridgeError::StateMismatch(_)), "got {err:?}");
}

// =============================================================================
// 3. Threads and re-entrancy
// =============================================================================

/// Dropping a handle on another thread performs the release there.
#[test]
fn drop_on_another_thread_releases() {
    let (session, probe) = start();
    let object = make_object(&session);
    let id = object.native_id();
    settle(&session);
    thread::spawn(move || drop(object)).join().unwrap();
    assert!(!probe.is_live(id));
}

/// Handles can be used from several threads; calls are serialized.
#[test]
fn concurrent_calls_are_serialized() {
    let (session, probe) = start();
    let object = make_object(&session);
    let workers: Vec<_> = (0..4)
        .map(|n| {
            let object = object.clone();
            thread::spawn(move || {
                for i in 0..25 {
                    object.setattr(&format!("a{n}_{i}"), i).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    assert!(object.hasattr("a3_24").unwrap());
    drop(object);
    session.teardown().unwrap();
    assert_eq!(probe.stray_decrements(), 0);
    assert_eq!(session.stats().unwrap().outstanding(), 0);
}

#[derive(Debug, Default)]
struct DropInHook {
    victim: Arc<Mutex<Option<Handle>>>,
}

impl BridgeTracer for DropInHook {
    fn on_call(&mut self, _epoch: EpochId, _target: NativeId, _wrapped: bool, _arg_count: usize) {
        drop(self.victim.lock().unwrap().take());
    }
}

/// A handle finalized while its thread holds the native lock is released later.
#[test]
fn finalizer_under_lock_is_deferred() {
    let hook = DropInHook::default();
    let victim = Arc::clone(&hook.victim);
    let native = LocalInterpreter::new();
    let probe = native.probe();
    let session = Session::builder(native).tracer(hook).start().unwrap();

    let object = make_object(&session);
    let id = object.native_id();
    settle(&session);
    *victim.lock().unwrap() = Some(object);

    let repr = session.builtin("repr").unwrap();
    repr.invoke(&[1.into()]).unwrap();
    assert!(probe.is_live(id), "release must wait for the next lock acquisition");
    assert_eq!(session.stats().unwrap().deferred_releases, 1);
    assert!(!probe.is_live(id));
}

/// Calling back into the bridge from native code fails instead of deadlocking.
#[test]
fn reentrant_call_is_rejected() {
    let slot: Arc<OnceLock<Session>> = Arc::new(OnceLock::new());
    let seen: Arc<Mutex<Option<BridgeError>>> = Arc::default();
    let native = {
        let slot = Arc::clone(&slot);
        let seen = Arc::clone(&seen);
        LocalInterpreter::new().with_function("reenter", move |heap, _args| {
            if let Some(session) = slot.get() {
                *seen.lock().unwrap() = session.builtin("object").err();
            }
            Ok(heap.none())
        })
    };
    let session = Session::start(native).unwrap();
    let _ = slot.set(session.clone());

    let reenter = session.import("__main__").unwrap().get("reenter").unwrap();
    reenter.invoke(&[]).unwrap();
    assert_eq!(
        seen.lock().unwrap().take(),
        Some(BridgeError::InvalidState(InvalidState::Reentrant))
    );
}

/// A panic inside native code surfaces as a fault and leaves the session usable.
#[test]
fn native_panic_is_contained() {
    let native = LocalInterpreter::new().with_function("explode", |_heap, _args| -> Result<NativeId, NativeError> {
        panic!("boom")
    });
    let session = Session::start(native).unwrap();
    let explode = session.import("__main__").unwrap().get("explode").unwrap();
    let err = explode.invoke(&[]).unwrap_err();
    assert_eq!(err, BridgeError::NativeFault(NativeError::new(tether::NATIVE_PANIC, "boom")));
    assert!(make_object(&session).is_valid());
    assert_eq!(session.stats().unwrap().native_faults, 1);
}

// =============================================================================
// 4. Refcount balance under arbitrary operation sequences
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Create,
    Clone(usize),
    Duplicate(usize),
    Release(usize),
    Drop(usize),
    Restart,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::Create),
        2 => any::<usize>().prop_map(Op::Clone),
        2 => any::<usize>().prop_map(Op::Duplicate),
        2 => any::<usize>().prop_map(Op::Release),
        3 => any::<usize>().prop_map(Op::Drop),
        1 => Just(Op::Restart),
    ]
}

/// One refcount unit as tracked by the model.
struct Unit {
    clones: usize,
    released: bool,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Every unit is given back at most once, and never to the wrong interpreter.
    #[test]
    fn units_balance(ops in prop::collection::vec(op(), 1..40)) {
        let (session, probe) = start();
        let mut handles: Vec<(Handle, usize)> = Vec::new();
        let mut units: Vec<Unit> = Vec::new();

        for op in ops {
            match op {
                Op::Create => {
                    handles.push((make_object(&session), units.len()));
                    units.push(Unit { clones: 1, released: false });
                }
                Op::Clone(i) if !handles.is_empty() => {
                    let (handle, unit) = &handles[i % handles.len()];
                    let entry = (handle.clone(), *unit);
                    units[entry.1].clones += 1;
                    handles.push(entry);
                }
                Op::Duplicate(i) if !handles.is_empty() => {
                    let (handle, _) = &handles[i % handles.len()];
                    let valid = handle.is_valid();
                    match handle.duplicate() {
                        Ok(duplicate) => {
                            prop_assert!(valid);
                            handles.push((duplicate, units.len()));
                            units.push(Unit { clones: 1, released: false });
                        }
                        Err(err) => prop_assert!(!valid && err.is_invalid_state()),
                    }
                }
                Op::Release(i) if !handles.is_empty() => {
                    let (handle, unit) = &handles[i % handles.len()];
                    handle.release();
                    units[*unit].released = true;
                }
                Op::Drop(i) if !handles.is_empty() => {
                    let index = i % handles.len();
                    let (handle, unit) = handles.swap_remove(index);
                    drop(handle);
                    units[unit].clones -= 1;
                    if units[unit].clones == 0 {
                        units[unit].released = true;
                    }
                }
                Op::Restart => {
                    session.restart().unwrap();
                }
                _ => {}
            }

            let held = units.iter().filter(|unit| !unit.released).count() as u64;
            prop_assert_eq!(session.stats().unwrap().outstanding(), held + TABLE_UNITS);
            prop_assert_eq!(probe.stray_decrements(), 0);
        }

        drop(handles);
        session.teardown().unwrap();
        let stats = session.stats().unwrap();
        prop_assert_eq!(stats.outstanding(), 0);
        prop_assert_eq!(stats.increments, stats.decrements + stats.skipped_releases);
        prop_assert_eq!(probe.stray_decrements(), 0);
    }
}
