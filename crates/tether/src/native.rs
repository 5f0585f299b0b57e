//! Contract of the native interpreter collaborator.
//!
//! The bridge never executes interpreter code itself. Everything it needs from the
//! embedded interpreter goes through [`NativeInterpreter`]: lifecycle and epoch
//! queries, refcount adjustments, and a single call entry point with a `wrapped`
//! flag. The session owns the implementation and only touches it while holding its
//! native lock, so implementations do not need to be re-entrant or thread-safe
//! beyond being `Send`.

use std::fmt;

use crate::{
    error::NativeError,
    ids::{EpochId, NativeId},
};

/// An argument after host-to-native marshaling.
///
/// This is the closed set of shapes the boundary accepts: scalars pass by value,
/// objects pass by their native ID.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeArg {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// An existing interpreter object, kept alive by the caller's handle.
    Object(NativeId),
}

/// A value produced by the interpreter.
///
/// With `wrapped = true` the interpreter converts scalar results into their
/// host-friendly variants and reports everything else as [`NativeValue::Object`].
/// With `wrapped = false` every result is reported as an object. Composite
/// variants are only produced by conversion helpers such as `unbox`.
///
/// Object IDs are borrowed: they stay valid until the next native operation, and
/// the bridge takes its own refcount unit for each one before releasing the lock.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum NativeValue {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Self>),
    Tuple(Vec<Self>),
    Object(NativeId),
}

/// Entry points the bridge requires from the embedded interpreter.
///
/// # Epochs
///
/// Each successful [`start`](Self::start) mints a new [`EpochId`] that is never
/// reused. After [`shutdown`](Self::shutdown), [`session_is_live`](Self::session_is_live)
/// must return `false` for every epoch minted so far.
///
/// # Refcounts
///
/// [`ref_incr`](Self::ref_incr) and [`ref_decr`](Self::ref_decr) adjust the
/// interpreter-side count of one object by exactly one. The bridge only calls
/// `ref_decr` for IDs it incremented under the same, still-live epoch.
pub trait NativeInterpreter: fmt::Debug + Send {
    /// Starts (or restarts) the interpreter and returns the new epoch.
    fn start(&mut self) -> Result<EpochId, NativeError>;

    /// Destroys the running interpreter. Must be idempotent.
    fn shutdown(&mut self);

    /// The epoch of the running interpreter, if any.
    fn session_id(&self) -> Option<EpochId>;

    /// Whether `epoch` is the running interpreter's epoch.
    fn session_is_live(&self, epoch: EpochId) -> bool;

    /// Adds one reference to a live object.
    ///
    /// Fails if `id` does not name a live object.
    fn ref_incr(&mut self, id: NativeId) -> Result<(), NativeError>;

    /// Removes one reference, freeing the object when the count reaches zero.
    fn ref_decr(&mut self, id: NativeId);

    /// Calls `target` with `args`.
    ///
    /// `wrapped` selects whether scalar results are converted to host-friendly
    /// variants (`true`) or every result is returned as an object (`false`).
    fn call(&mut self, wrapped: bool, target: NativeId, args: &[NativeArg]) -> Result<NativeValue, NativeError>;

    /// The builtins table of the running interpreter: `(name, object)` pairs.
    fn builtins(&mut self) -> Vec<(String, NativeId)>;

    /// The conversion helpers table (`unbox`, item access) of the running interpreter.
    fn helpers(&mut self) -> Vec<(String, NativeId)>;
}
