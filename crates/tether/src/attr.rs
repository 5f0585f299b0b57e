//! Attribute, item and conversion operations on handles.
//!
//! None of these touch the interpreter directly. Each one looks up an
//! interpreter-resident function in the session's builtins or helpers table and
//! performs an ordinary call through the marshaler, so every validity check of
//! [`Handle::invoke`] applies here too.

use std::fmt;

use crate::{
    error::{BridgeError, BridgeResult},
    handle::Handle,
    registry::{BuiltinName, HelperName},
    session::Session,
    value::HostValue,
};

impl Handle {
    fn live_session(&self) -> BridgeResult<Session> {
        self.owner().map(Session::from_inner)
    }

    fn builtin_fn(&self, name: BuiltinName) -> BridgeResult<Self> {
        self.live_session()?.builtin(name.into())
    }

    fn helper_fn(&self, name: HelperName) -> BridgeResult<Self> {
        self.live_session()?.helper(name.into())
    }

    /// Reads attribute `name`.
    pub fn getattr(&self, name: &str) -> BridgeResult<Self> {
        self.builtin_fn(BuiltinName::Getattr)?
            .raw_call(&[self.into(), name.into()])
    }

    /// Reads attribute `name`, or returns `default` when it is missing.
    pub fn getattr_or(&self, name: &str, default: impl Into<HostValue>) -> BridgeResult<Self> {
        self.builtin_fn(BuiltinName::Getattr)?
            .raw_call(&[self.into(), name.into(), default.into()])
    }

    /// Sets attribute `name` to `value`.
    pub fn setattr(&self, name: &str, value: impl Into<HostValue>) -> BridgeResult<()> {
        self.builtin_fn(BuiltinName::Setattr)?
            .raw_call(&[self.into(), name.into(), value.into()])
            .map(drop)
    }

    pub fn hasattr(&self, name: &str) -> BridgeResult<bool> {
        let result = self
            .builtin_fn(BuiltinName::Hasattr)?
            .raw_call(&[self.into(), name.into()])?;
        expect_bool(BuiltinName::Hasattr, &result.unbox()?)
    }

    pub fn delattr(&self, name: &str) -> BridgeResult<()> {
        self.builtin_fn(BuiltinName::Delattr)?
            .raw_call(&[self.into(), name.into()])
            .map(drop)
    }

    /// Alias of [`Handle::getattr`].
    pub fn attr(&self, name: &str) -> BridgeResult<Self> {
        self.getattr(name)
    }

    /// Alias of [`Handle::setattr`].
    pub fn set_attr(&self, name: &str, value: impl Into<HostValue>) -> BridgeResult<()> {
        self.setattr(name, value)
    }

    /// Reads `self[key]` through the `getitem` helper.
    pub fn getitem(&self, key: impl Into<HostValue>) -> BridgeResult<Self> {
        self.helper_fn(HelperName::Getitem)?
            .raw_call(&[self.into(), key.into()])
    }

    /// Performs `self[key] = value` through the `setitem` helper.
    pub fn setitem(&self, key: impl Into<HostValue>, value: impl Into<HostValue>) -> BridgeResult<()> {
        self.helper_fn(HelperName::Setitem)?
            .raw_call(&[self.into(), key.into(), value.into()])
            .map(drop)
    }

    /// Deep-converts the object into a host value via the `unbox` helper.
    ///
    /// Scalars and containers become their host variants; anything without a host
    /// form comes back as [`HostValue::Object`].
    pub fn unbox(&self) -> BridgeResult<HostValue> {
        self.helper_fn(HelperName::Unbox)?.invoke(&[self.into()])
    }

    pub fn is_callable(&self) -> BridgeResult<bool> {
        let result = self.builtin_fn(BuiltinName::Callable)?.invoke(&[self.into()])?;
        expect_bool(BuiltinName::Callable, &result)
    }

    /// The interpreter's `repr` of the object.
    pub fn repr(&self) -> BridgeResult<String> {
        match self.builtin_fn(BuiltinName::Repr)?.invoke(&[self.into()])? {
            HostValue::Str(text) => Ok(text),
            other => Err(BridgeError::NotAnObject(format!(
                "repr returned {} instead of str",
                other.type_name()
            ))),
        }
    }
}

fn expect_bool(builtin: BuiltinName, value: &HostValue) -> BridgeResult<bool> {
    value.as_bool().ok_or_else(|| {
        BridgeError::NotAnObject(format!("{builtin} returned {} instead of bool", value.type_name()))
    })
}

/// `Handle[<repr>]`, or a placeholder naming the ID when the object cannot be
/// rendered (dead epoch, released handle, or a re-entrant call).
impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.repr() {
            Ok(repr) => write!(f, "Handle[{repr}]"),
            Err(_) => write!(f, "<foreign object {} @{}>", self.native_id(), self.epoch()),
        }
    }
}
