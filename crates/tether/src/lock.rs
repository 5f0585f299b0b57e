//! The per-session native lock.
//!
//! The interpreter is not re-entrant, so every native operation runs under one
//! mutex per session. The guard also records, per thread, which sessions the thread
//! is inside of: a second acquisition on the same thread would deadlock, so it is
//! reported instead ([`InvalidState::Reentrant`]) and finalizers use it to defer.

use std::{
    cell::RefCell,
    ops::{Deref, DerefMut},
    sync::{Mutex, MutexGuard, PoisonError},
};

use smallvec::SmallVec;

use crate::{error::InvalidState, ids::SessionId};

thread_local! {
    static HELD_SESSIONS: RefCell<SmallVec<[SessionId; 2]>> = RefCell::new(SmallVec::new());
}

/// Returns true if the current thread holds the native lock of `owner`.
///
/// During thread-local teardown the answer is `false`; nothing can be held then.
pub(crate) fn held_by_current_thread(owner: SessionId) -> bool {
    HELD_SESSIONS
        .try_with(|held| held.borrow().contains(&owner))
        .unwrap_or(false)
}

/// Guard over a session's native state.
pub(crate) struct NativeLock<'a, T> {
    guard: MutexGuard<'a, T>,
    owner: SessionId,
}

impl<'a, T> NativeLock<'a, T> {
    /// Blocks until the lock is free, failing fast if this thread already holds it.
    ///
    /// A poisoned mutex is recovered: native panics are caught at the call boundary,
    /// so poisoning only means a host-side hook panicked mid-operation.
    pub(crate) fn acquire(mutex: &'a Mutex<T>, owner: SessionId) -> Result<Self, InvalidState> {
        if held_by_current_thread(owner) {
            return Err(InvalidState::Reentrant);
        }
        let guard = mutex.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = HELD_SESSIONS.try_with(|held| held.borrow_mut().push(owner));
        Ok(Self { guard, owner })
    }
}

impl<T> Drop for NativeLock<'_, T> {
    fn drop(&mut self) {
        let owner = self.owner;
        let _ = HELD_SESSIONS.try_with(|held| {
            let mut held = held.borrow_mut();
            if let Some(pos) = held.iter().rposition(|id| *id == owner) {
                held.remove(pos);
            }
        });
    }
}

impl<T> Deref for NativeLock<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for NativeLock<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
