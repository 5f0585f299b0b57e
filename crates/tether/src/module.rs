use std::{fmt, ops::Deref};

use crate::{error::BridgeResult, handle::Handle, value::HostValue};

/// A handle known to refer to an interpreter module.
///
/// Dereferences to [`Handle`], so every handle operation is available; `get` and
/// `set` read and write module globals.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Module {
    handle: Handle,
}

impl Module {
    /// Wraps `handle` as a module, taking a new refcount unit in the same session.
    pub fn adopt(handle: &Handle) -> BridgeResult<Self> {
        Ok(Self {
            handle: handle.duplicate()?,
        })
    }

    /// Reads the module global `name`.
    pub fn get(&self, name: &str) -> BridgeResult<Handle> {
        self.handle.getattr(name)
    }

    /// Sets the module global `name`.
    pub fn set(&self, name: &str, value: impl Into<HostValue>) -> BridgeResult<()> {
        self.handle.setattr(name, value)
    }

    #[must_use]
    pub fn into_handle(self) -> Handle {
        self.handle
    }
}

impl From<Handle> for Module {
    fn from(handle: Handle) -> Self {
        Self { handle }
    }
}

impl Deref for Module {
    type Target = Handle;

    fn deref(&self) -> &Handle {
        &self.handle
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.handle, f)
    }
}
