//! Host-side handles to interpreter objects.
//!
//! A [`Handle`] owns exactly one native refcount unit on the object it names.
//! Cloning a handle shares that unit (it is a host reference copy, not a new native
//! reference); [`Handle::duplicate`] takes a second unit. The unit is given back
//! either by an explicit [`Handle::release`] or when the last clone is dropped,
//! whichever comes first, and at most once.
//!
//! Handles never trust themselves: every use checks that the epoch they were minted
//! under is still the live epoch of their session. A handle that outlives its epoch
//! becomes inert, and its finalizer skips the decrement because the native ID may
//! already name an object of a newer interpreter.

use std::{
    fmt,
    hash::{Hash, Hasher},
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use crate::{
    error::{BridgeError, BridgeResult, InvalidState},
    ids::{EpochId, NativeId, SessionId},
    session::{Session, SessionInner, SessionState},
};

/// A reference to an object living inside the embedded interpreter.
#[derive(Clone)]
pub struct Handle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    session: Weak<SessionInner>,
    session_id: SessionId,
    epoch: EpochId,
    id: NativeId,
    released: AtomicBool,
}

impl Handle {
    /// Wraps an existing interpreter object, taking one refcount unit on it.
    ///
    /// Fails with `InvalidState` when the session has no live epoch, and with
    /// `NotAnObject` when the interpreter refuses the reference.
    pub fn new(session: &Session, id: NativeId) -> BridgeResult<Self> {
        let mut state = session.inner.lock()?;
        let epoch = state.current_epoch()?;
        Self::new_locked(&session.inner, &mut state, epoch, id)
    }

    /// Builds a handle while the caller already holds the native lock.
    pub(crate) fn new_locked(
        session: &Arc<SessionInner>,
        state: &mut SessionState,
        epoch: EpochId,
        id: NativeId,
    ) -> BridgeResult<Self> {
        state.take_unit(epoch, id)?;
        Ok(Self {
            inner: Arc::new(HandleInner {
                session: Arc::downgrade(session),
                session_id: session.id,
                epoch,
                id,
                released: AtomicBool::new(false),
            }),
        })
    }

    /// The epoch this handle was minted under.
    #[must_use]
    pub fn epoch(&self) -> EpochId {
        self.inner.epoch
    }

    /// The interpreter-side ID. Only meaningful while [`Handle::is_valid`] holds.
    #[must_use]
    pub fn native_id(&self) -> NativeId {
        self.inner.id
    }

    /// The owning session, if it still exists.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.inner.session.upgrade().map(Session::from_inner)
    }

    #[must_use]
    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Whether the handle can be used right now: not released, and its epoch is
    /// still live. Asks the session every time.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.is_released() && self.session().is_some_and(|session| session.is_epoch_live(self.epoch()))
    }

    /// Gives back the handle's refcount unit now instead of at drop.
    ///
    /// Idempotent, and shared by all clones: after this every clone is released.
    pub fn release(&self) {
        self.inner.release();
    }

    /// Takes a second refcount unit on the same object.
    ///
    /// The new handle is independent: releasing one does not affect the other.
    pub fn duplicate(&self) -> BridgeResult<Self> {
        let session = self.owner()?;
        let mut state = session.lock()?;
        self.check_usable(&state, session.id)?;
        Self::new_locked(&session, &mut state, self.epoch(), self.native_id())
    }

    /// Upgrades the weak session reference.
    pub(crate) fn owner(&self) -> BridgeResult<Arc<SessionInner>> {
        self.inner
            .session
            .upgrade()
            .ok_or_else(|| InvalidState::SessionDropped.into())
    }

    /// Checks, under the native lock of `session_id`, that this handle may be used.
    pub(crate) fn check_usable(&self, state: &SessionState, session_id: SessionId) -> BridgeResult<()> {
        if self.inner.session_id != session_id {
            return Err(BridgeError::StateMismatch(format!(
                "handle {} belongs to {}, not {session_id}",
                self.native_id(),
                self.inner.session_id
            )));
        }
        if self.is_released() {
            return Err(InvalidState::Released.into());
        }
        if !state.is_epoch_live(self.epoch()) {
            return Err(InvalidState::DeadEpoch(self.epoch()).into());
        }
        Ok(())
    }
}

impl HandleInner {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match session.lock() {
            Ok(mut state) => state.release_unit(self.epoch, self.id),
            // this thread is inside a native operation of the same session
            Err(_) => session.defer_release(self.epoch, self.id),
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        self.release();
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.session_id == other.inner.session_id
            && self.inner.epoch == other.inner.epoch
            && self.inner.id == other.inner.id
    }
}

impl Eq for Handle {}

impl Hash for Handle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.session_id.hash(state);
        self.inner.epoch.hash(state);
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.inner.id)
            .field("epoch", &self.inner.epoch)
            .field("released", &self.is_released())
            .finish()
    }
}
