//! Name-to-object lookup tables for the builtins and conversion helpers.
//!
//! The native boundary only knows how to call a callable, so attribute access,
//! item access and unboxing are all implemented by calling an interpreter-resident
//! function looked up here by exact name. Tables are read from the interpreter once
//! per epoch; each entry owns one refcount unit for as long as the epoch lives.

use indexmap::IndexMap;
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

use crate::{
    error::{BridgeResult, InvalidState},
    ids::NativeId,
};

/// Builtin functions the attribute layer relies on.
///
/// Uses strum derives for `Display`, `FromStr` and `IntoStaticStr`; variants
/// serialize to the interpreter's lowercase names (e.g. `Getattr` -> "getattr").
#[derive(Debug, Clone, Copy, Display, EnumString, EnumIter, IntoStaticStr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum BuiltinName {
    Getattr,
    Setattr,
    Hasattr,
    Delattr,
    Repr,
    Callable,
    Object,
    #[strum(serialize = "__import__")]
    Import,
}

/// Conversion and item-access helpers that are not interpreter builtins.
#[derive(Debug, Clone, Copy, Display, EnumString, EnumIter, IntoStaticStr, PartialEq, Eq, Hash)]
#[strum(serialize_all = "lowercase")]
pub enum HelperName {
    Unbox,
    Getitem,
    Setitem,
}

/// One lookup table (builtins or helpers) for the current epoch.
#[derive(Debug)]
pub(crate) struct HelperRegistry {
    table: &'static str,
    entries: IndexMap<String, NativeId>,
}

impl HelperRegistry {
    pub(crate) fn new(table: &'static str) -> Self {
        Self {
            table,
            entries: IndexMap::new(),
        }
    }

    /// Looks up `name`; a missing entry is a state error, not a native fault.
    pub(crate) fn get(&self, name: &str) -> BridgeResult<NativeId> {
        self.entries.get(name).copied().ok_or_else(|| {
            InvalidState::MissingHelper {
                table: self.table,
                name: name.to_owned(),
            }
            .into()
        })
    }

    /// Inserts an entry, returning the ID it displaced (whose unit must be released).
    pub(crate) fn insert(&mut self, name: String, id: NativeId) -> Option<NativeId> {
        self.entries.insert(name, id)
    }

    /// Removes every entry, returning the IDs whose units must be released.
    pub(crate) fn drain(&mut self) -> Vec<NativeId> {
        self.entries.drain(..).map(|(_, id)| id).collect()
    }

    pub(crate) fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}
