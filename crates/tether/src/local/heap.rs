//! Refcounted object arena of the reference interpreter.

use std::{fmt, sync::Arc};

use indexmap::IndexMap;

use crate::{
    error::NativeError,
    ids::NativeId,
    native::NativeValue,
    registry::{BuiltinName, HelperName},
};

/// A host-registered function callable from the interpreter.
///
/// Receives the heap and borrowed argument IDs, and returns an owned result ID
/// (one reference the interpreter takes over).
pub type NativeFn = Arc<dyn Fn(&mut LocalHeap, &[NativeId]) -> Result<NativeId, NativeError> + Send + Sync>;

/// Data stored in a heap slot.
#[derive(Clone)]
pub enum LocalObject {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Owns one reference to each item.
    List(Vec<NativeId>),
    Tuple(Vec<NativeId>),
    /// A plain object with an attribute dictionary (owns its values).
    Instance(IndexMap<String, NativeId>),
    Module {
        name: String,
        attrs: IndexMap<String, NativeId>,
    },
    Builtin(BuiltinName),
    Helper(HelperName),
    Function {
        name: String,
        func: NativeFn,
    },
}

impl LocalObject {
    /// Interpreter type name, as used in exception messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "NoneType",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Instance(_) => "object",
            Self::Module { .. } => "module",
            Self::Builtin(_) | Self::Helper(_) => "builtin_function_or_method",
            Self::Function { .. } => "function",
        }
    }

    /// The attribute dictionary, for objects that have one.
    pub(crate) fn attrs(&self) -> Option<&IndexMap<String, NativeId>> {
        match self {
            Self::Instance(attrs) | Self::Module { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    pub(crate) fn attrs_mut(&mut self) -> Option<&mut IndexMap<String, NativeId>> {
        match self {
            Self::Instance(attrs) | Self::Module { attrs, .. } => Some(attrs),
            _ => None,
        }
    }

    pub(crate) fn is_callable(&self) -> bool {
        matches!(self, Self::Builtin(_) | Self::Helper(_) | Self::Function { .. })
    }

    fn child_ids(&self) -> Vec<NativeId> {
        match self {
            Self::List(items) | Self::Tuple(items) => items.clone(),
            Self::Instance(attrs) | Self::Module { attrs, .. } => attrs.values().copied().collect(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bool(b) => f.debug_tuple("Bool").field(b).finish(),
            Self::Int(i) => f.debug_tuple("Int").field(i).finish(),
            Self::Float(v) => f.debug_tuple("Float").field(v).finish(),
            Self::Str(s) => f.debug_tuple("Str").field(s).finish(),
            Self::Bytes(b) => f.debug_tuple("Bytes").field(b).finish(),
            Self::List(items) => f.debug_tuple("List").field(items).finish(),
            Self::Tuple(items) => f.debug_tuple("Tuple").field(items).finish(),
            Self::Instance(attrs) => f.debug_tuple("Instance").field(attrs).finish(),
            Self::Module { name, attrs } => f
                .debug_struct("Module")
                .field("name", name)
                .field("attrs", attrs)
                .finish(),
            Self::Builtin(name) => f.debug_tuple("Builtin").field(name).finish(),
            Self::Helper(name) => f.debug_tuple("Helper").field(name).finish(),
            Self::Function { name, .. } => f.debug_struct("Function").field("name", name).finish_non_exhaustive(),
        }
    }
}

#[derive(Debug)]
struct Entry {
    refcount: usize,
    data: LocalObject,
}

/// The object arena.
///
/// Freed slots go on a free list and are handed out again by the next
/// allocation, so a [`NativeId`] is only meaningful while its object is alive.
#[derive(Debug, Default)]
pub struct LocalHeap {
    entries: Vec<Option<Entry>>,
    free_list: Vec<NativeId>,
    /// Importable modules by name (one reference each).
    pub(crate) modules: IndexMap<String, NativeId>,
    /// Results handed out by the last call, kept alive until the next one.
    scratch: Vec<NativeId>,
}

fn index(id: NativeId) -> usize {
    usize::try_from(id.raw()).unwrap_or(usize::MAX)
}

impl LocalHeap {
    /// Allocates a new object with a refcount of one.
    pub fn allocate(&mut self, data: LocalObject) -> NativeId {
        let entry = Entry { refcount: 1, data };
        if let Some(id) = self.free_list.pop() {
            self.entries[index(id)] = Some(entry);
            id
        } else {
            let id = NativeId::new(self.entries.len() as u64);
            self.entries.push(Some(entry));
            id
        }
    }

    pub fn none(&mut self) -> NativeId {
        self.allocate(LocalObject::None)
    }

    pub fn new_bool(&mut self, value: bool) -> NativeId {
        self.allocate(LocalObject::Bool(value))
    }

    pub fn new_int(&mut self, value: i64) -> NativeId {
        self.allocate(LocalObject::Int(value))
    }

    pub fn new_str(&mut self, value: impl Into<String>) -> NativeId {
        self.allocate(LocalObject::Str(value.into()))
    }

    /// Allocates a list that takes over the caller's reference to each item.
    pub fn new_list(&mut self, items: Vec<NativeId>) -> NativeId {
        self.allocate(LocalObject::List(items))
    }

    /// Allocates a tuple that takes over the caller's reference to each item.
    pub fn new_tuple(&mut self, items: Vec<NativeId>) -> NativeId {
        self.allocate(LocalObject::Tuple(items))
    }

    pub fn new_instance(&mut self) -> NativeId {
        self.allocate(LocalObject::Instance(IndexMap::new()))
    }

    /// Stores `value` as attribute `name` of `obj`, taking over the caller's
    /// reference to `value`.
    pub fn set_attr(&mut self, obj: NativeId, name: &str, value: NativeId) -> Result<(), NativeError> {
        let type_name = self.get(obj)?.type_name();
        let Some(attrs) = self.get_mut(obj)?.attrs_mut() else {
            self.dec_ref(value);
            return Err(NativeError::new(
                "AttributeError",
                format!("'{type_name}' object has no attribute '{name}'"),
            ));
        };
        if let Some(old) = attrs.insert(name.to_owned(), value) {
            self.dec_ref(old);
        }
        Ok(())
    }

    fn entry(&self, id: NativeId) -> Result<&Entry, NativeError> {
        self.entries
            .get(index(id))
            .and_then(Option::as_ref)
            .ok_or_else(|| NativeError::new("ReferenceError", format!("{id} is not a live object")))
    }

    fn entry_mut(&mut self, id: NativeId) -> Result<&mut Entry, NativeError> {
        self.entries
            .get_mut(index(id))
            .and_then(Option::as_mut)
            .ok_or_else(|| NativeError::new("ReferenceError", format!("{id} is not a live object")))
    }

    pub fn get(&self, id: NativeId) -> Result<&LocalObject, NativeError> {
        self.entry(id).map(|entry| &entry.data)
    }

    pub fn get_mut(&mut self, id: NativeId) -> Result<&mut LocalObject, NativeError> {
        self.entry_mut(id).map(|entry| &mut entry.data)
    }

    #[must_use]
    pub fn is_live(&self, id: NativeId) -> bool {
        self.entry(id).is_ok()
    }

    /// Current refcount, or 0 for a free slot.
    #[must_use]
    pub fn refcount(&self, id: NativeId) -> usize {
        self.entry(id).map_or(0, |entry| entry.refcount)
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        self.entries.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn inc_ref(&mut self, id: NativeId) -> Result<(), NativeError> {
        self.entry_mut(id)?.refcount += 1;
        Ok(())
    }

    /// Decrements the refcount and frees the object (plus children) at zero.
    ///
    /// Children are released through a worklist, so arbitrarily deep chains of
    /// containers are freed without recursion. Returns false if `id` was not a
    /// live object.
    pub fn dec_ref(&mut self, id: NativeId) -> bool {
        if !self.is_live(id) {
            return false;
        }
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            let Some(slot) = self.entries.get_mut(index(id)) else {
                continue;
            };
            let Some(entry) = slot.as_mut() else {
                continue;
            };
            if entry.refcount > 1 {
                entry.refcount -= 1;
                continue;
            }
            if let Some(entry) = slot.take() {
                self.free_list.push(id);
                pending.extend(entry.data.child_ids());
            }
        }
        true
    }

    /// Reads an `int` argument.
    pub fn int(&self, id: NativeId) -> Result<i64, NativeError> {
        match self.get(id)? {
            LocalObject::Int(i) => Ok(*i),
            LocalObject::Bool(b) => Ok(i64::from(*b)),
            other => Err(type_error(format!(
                "'{}' object cannot be interpreted as an integer",
                other.type_name()
            ))),
        }
    }

    /// Reads a `str` argument.
    pub fn str(&self, id: NativeId) -> Result<&str, NativeError> {
        match self.get(id)? {
            LocalObject::Str(s) => Ok(s),
            other => Err(type_error(format!("expected str, got '{}'", other.type_name()))),
        }
    }

    /// Converts an object for a call result.
    ///
    /// Scalars convert by value when `wrapped`; everything else is reported as the
    /// object itself.
    pub(crate) fn wrap(&self, id: NativeId, wrapped: bool) -> Result<NativeValue, NativeError> {
        if !wrapped {
            return Ok(NativeValue::Object(id));
        }
        Ok(match self.get(id)? {
            LocalObject::None => NativeValue::None,
            LocalObject::Bool(b) => NativeValue::Bool(*b),
            LocalObject::Int(i) => NativeValue::Int(*i),
            LocalObject::Float(v) => NativeValue::Float(*v),
            LocalObject::Str(s) => NativeValue::Str(s.clone()),
            _ => NativeValue::Object(id),
        })
    }

    /// Deep conversion used by the `unbox` helper.
    ///
    /// A container that contains itself reports the repeated container as an object.
    pub(crate) fn unbox(&self, id: NativeId) -> Result<NativeValue, NativeError> {
        let mut visiting = Vec::new();
        self.unbox_inner(id, &mut visiting)
    }

    fn unbox_inner(&self, id: NativeId, visiting: &mut Vec<NativeId>) -> Result<NativeValue, NativeError> {
        let value = match self.get(id)? {
            LocalObject::Bytes(bytes) => NativeValue::Bytes(bytes.clone()),
            LocalObject::List(items) | LocalObject::Tuple(items) if !visiting.contains(&id) => {
                check_nesting(visiting, "while converting an object")?;
                visiting.push(id);
                let converted = items
                    .iter()
                    .map(|item| self.unbox_inner(*item, visiting))
                    .collect::<Result<Vec<_>, _>>()?;
                visiting.pop();
                if matches!(self.get(id)?, LocalObject::List(_)) {
                    NativeValue::List(converted)
                } else {
                    NativeValue::Tuple(converted)
                }
            }
            _ => self.wrap(id, true)?,
        };
        Ok(value)
    }

    /// Interpreter `repr` of an object.
    pub(crate) fn repr(&self, id: NativeId) -> Result<String, NativeError> {
        let mut visiting = Vec::new();
        self.repr_inner(id, &mut visiting)
    }

    fn repr_inner(&self, id: NativeId, visiting: &mut Vec<NativeId>) -> Result<String, NativeError> {
        Ok(match self.get(id)? {
            LocalObject::None => "None".to_owned(),
            LocalObject::Bool(true) => "True".to_owned(),
            LocalObject::Bool(false) => "False".to_owned(),
            LocalObject::Int(i) => i.to_string(),
            LocalObject::Float(v) => format!("{v:?}"),
            LocalObject::Str(s) => str_repr(s),
            LocalObject::Bytes(bytes) => format!("b'{}'", bytes.escape_ascii()),
            LocalObject::List(_) if visiting.contains(&id) => "[...]".to_owned(),
            LocalObject::Tuple(_) if visiting.contains(&id) => "(...)".to_owned(),
            LocalObject::List(items) => {
                check_nesting(visiting, REPR_CONTEXT)?;
                visiting.push(id);
                let parts = self.repr_items(items, visiting)?;
                visiting.pop();
                format!("[{}]", parts.join(", "))
            }
            LocalObject::Tuple(items) => {
                check_nesting(visiting, REPR_CONTEXT)?;
                visiting.push(id);
                let parts = self.repr_items(items, visiting)?;
                visiting.pop();
                if parts.len() == 1 {
                    format!("({},)", parts[0])
                } else {
                    format!("({})", parts.join(", "))
                }
            }
            LocalObject::Instance(_) => format!("<object at {id}>"),
            LocalObject::Module { name, .. } => format!("<module '{name}'>"),
            LocalObject::Builtin(name) => format!("<built-in function {name}>"),
            LocalObject::Helper(name) => format!("<built-in helper {name}>"),
            LocalObject::Function { name, .. } => format!("<function {name}>"),
        })
    }

    fn repr_items(&self, items: &[NativeId], visiting: &mut Vec<NativeId>) -> Result<Vec<String>, NativeError> {
        items.iter().map(|item| self.repr_inner(*item, visiting)).collect()
    }

    /// Keeps `id` alive (taking over one reference) until [`Self::clear_scratch`].
    pub(crate) fn hold_scratch(&mut self, id: NativeId) {
        self.scratch.push(id);
    }

    pub(crate) fn clear_scratch(&mut self) {
        for id in std::mem::take(&mut self.scratch) {
            self.dec_ref(id);
        }
    }
}

/// Containers nested deeper than this fail `repr` and `unbox` with `RecursionError`.
const MAX_NESTING: usize = 256;

const REPR_CONTEXT: &str = "while getting the repr of an object";

fn check_nesting(visiting: &[NativeId], context: &str) -> Result<(), NativeError> {
    if visiting.len() >= MAX_NESTING {
        return Err(NativeError::new(
            "RecursionError",
            format!("maximum recursion depth exceeded {context}"),
        ));
    }
    Ok(())
}

/// Quotes a string the way Python's `repr` does: single quotes unless the text
/// contains a single quote and no double quote.
fn str_repr(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') { '"' } else { '\'' };
    let mut out = String::with_capacity(text.len() + 2);
    out.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out.push(quote);
    out
}

pub(crate) fn type_error(message: impl Into<String>) -> NativeError {
    NativeError::new("TypeError", message)
}
