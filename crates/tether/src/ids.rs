use std::{
    fmt,
    sync::atomic::{AtomicU64, Ordering},
};

/// Identity of one live interpreter instance.
///
/// Minted by the native collaborator every time the interpreter starts. Epochs are
/// never reused, so comparing a handle's epoch with the live one is enough to tell
/// whether the object it names still belongs to the running interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct EpochId(u64);

impl EpochId {
    /// Creates an epoch ID from a raw integer.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer identifier.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EpochId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}

/// Opaque identifier of an interpreter-side object (a raw address or arena index).
///
/// Native IDs are recycled by the interpreter: once an object is freed its ID can
/// name a different object, including one created under a later epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NativeId(u64);

impl NativeId {
    /// Creates a native ID from a raw integer.
    #[must_use]
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw integer identifier.
    #[must_use]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for NativeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Process-unique identity of a [`Session`](crate::Session) object.
///
/// Distinguishes sessions even if two native interpreters happen to mint the same
/// epoch number; used for the `StateMismatch` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct SessionId(u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}", self.0)
    }
}
