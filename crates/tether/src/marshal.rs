//! The call marshaler: host arguments in, native call, host values out.
//!
//! Every call runs in one hold of the native lock: the target and every object
//! argument are checked against the live epoch, the arguments are coerced, the
//! interpreter is called, and any objects in the result are boxed into handles
//! before the lock is released. A native panic is caught at this boundary and
//! surfaced as a [`BridgeError::NativeFault`].

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use crate::{
    error::{BridgeError, BridgeResult, NativeError},
    handle::Handle,
    ids::{EpochId, SessionId},
    native::{NativeArg, NativeValue},
    session::{SessionInner, SessionState},
    value::HostValue,
};

/// Exception type reported for a panic caught at the native boundary.
pub const NATIVE_PANIC: &str = "NativePanic";

impl Handle {
    /// Calls the object with `wrapped = true` and returns the converted result.
    ///
    /// Scalar results come back as their host variants; anything else comes back as
    /// [`HostValue::Object`].
    pub fn invoke(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.native_call(true, args)
    }

    /// Calls the object with `wrapped = false`; every result is an object.
    pub fn raw_invoke(&self, args: &[HostValue]) -> BridgeResult<HostValue> {
        self.native_call(false, args)
    }

    /// Like [`Handle::invoke`], but the result must be an interpreter object.
    ///
    /// A `None` result is `Ok(None)`; any other scalar is `NotAnObject`.
    pub fn call(&self, args: &[HostValue]) -> BridgeResult<Option<Self>> {
        match self.native_call(true, args)? {
            HostValue::None => Ok(None),
            other => expect_object(other).map(Some),
        }
    }

    /// Like [`Handle::raw_invoke`], returning the result's handle.
    ///
    /// Raw results are always objects, so there is no empty case.
    pub fn raw_call(&self, args: &[HostValue]) -> BridgeResult<Self> {
        expect_object(self.native_call(false, args)?)
    }

    fn native_call(&self, wrapped: bool, args: &[HostValue]) -> BridgeResult<HostValue> {
        let session = self.owner()?;
        if let Some(limit) = session.config.max_call_args
            && args.len() > limit
        {
            return Err(BridgeError::UnsupportedArgumentType(format!(
                "{} arguments exceed the limit of {limit}",
                args.len()
            )));
        }

        let mut state = session.lock()?;
        self.check_usable(&state, session.id)?;
        let native_args = args
            .iter()
            .map(|arg| coerce_arg(arg, &state, session.id))
            .collect::<BridgeResult<Vec<_>>>()?;

        let epoch = self.epoch();
        let target = self.native_id();
        state.stats.calls += 1;
        state.tracer.on_call(epoch, target, wrapped, native_args.len());

        let outcome = if session.config.catch_native_panics {
            panic::catch_unwind(AssertUnwindSafe(|| state.native.call(wrapped, target, &native_args)))
                .unwrap_or_else(|payload| Err(NativeError::new(NATIVE_PANIC, panic_message(payload.as_ref()))))
        } else {
            state.native.call(wrapped, target, &native_args)
        };
        let value = match outcome {
            Ok(value) => value,
            Err(error) => {
                state.stats.native_faults += 1;
                state.tracer.on_native_fault(&error);
                return Err(BridgeError::NativeFault(error));
            }
        };
        box_result(&session, &mut state, epoch, value, session.config.max_result_depth)
    }
}

fn expect_object(value: HostValue) -> BridgeResult<Handle> {
    match value {
        HostValue::Object(handle) => Ok(handle),
        other => Err(BridgeError::NotAnObject(format!(
            "call returned {} instead of an object",
            other.type_name()
        ))),
    }
}

/// Coerces one host argument into its native form.
///
/// Object arguments must belong to the calling session and be valid in its live
/// epoch; the composite shapes have no native argument form.
fn coerce_arg(arg: &HostValue, state: &SessionState, session_id: SessionId) -> BridgeResult<NativeArg> {
    match arg {
        HostValue::None => Ok(NativeArg::None),
        HostValue::Bool(b) => Ok(NativeArg::Bool(*b)),
        HostValue::Int(i) => Ok(NativeArg::Int(*i)),
        HostValue::Float(v) => Ok(NativeArg::Float(*v)),
        HostValue::Str(s) => Ok(NativeArg::Str(s.clone())),
        HostValue::Object(handle) => {
            handle.check_usable(state, session_id)?;
            Ok(NativeArg::Object(handle.native_id()))
        }
        HostValue::Bytes(_) | HostValue::List(_) | HostValue::Tuple(_) => Err(BridgeError::UnsupportedArgumentType(
            format!("{} cannot be passed to the interpreter", arg.type_name()),
        )),
    }
}

/// Converts a native result, taking a refcount unit for every object in it.
///
/// Runs under the same lock hold as the call, while the borrowed IDs are still
/// valid. If conversion fails part way, handles already built are dropped here and
/// their releases are deferred to the next lock acquisition.
fn box_result(
    session: &Arc<SessionInner>,
    state: &mut SessionState,
    epoch: EpochId,
    value: NativeValue,
    depth: usize,
) -> BridgeResult<HostValue> {
    Ok(match value {
        NativeValue::None => HostValue::None,
        NativeValue::Bool(b) => HostValue::Bool(b),
        NativeValue::Int(i) => HostValue::Int(i),
        NativeValue::Float(v) => HostValue::Float(v),
        NativeValue::Str(s) => HostValue::Str(s),
        NativeValue::Bytes(bytes) => HostValue::Bytes(bytes),
        NativeValue::List(items) => HostValue::List(box_items(session, state, epoch, items, depth)?),
        NativeValue::Tuple(items) => HostValue::Tuple(box_items(session, state, epoch, items, depth)?),
        NativeValue::Object(id) => HostValue::Object(Handle::new_locked(session, state, epoch, id)?),
    })
}

fn box_items(
    session: &Arc<SessionInner>,
    state: &mut SessionState,
    epoch: EpochId,
    items: Vec<NativeValue>,
    depth: usize,
) -> BridgeResult<Vec<HostValue>> {
    let Some(depth) = depth.checked_sub(1) else {
        return Err(BridgeError::NotAnObject(
            "result nesting exceeds the configured depth".to_owned(),
        ));
    };
    items
        .into_iter()
        .map(|item| box_result(session, state, epoch, item, depth))
        .collect()
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "native code panicked".to_owned()
    }
}
