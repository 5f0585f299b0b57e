//! Builtins and helpers of the reference interpreter.

use crate::{
    error::NativeError,
    ids::NativeId,
    native::NativeValue,
    registry::{BuiltinName, HelperName},
};

use super::heap::{LocalHeap, LocalObject, NativeFn, type_error};

/// What a call produced.
pub(crate) enum Outcome {
    /// An owned reference to a result object.
    Owned(NativeId),
    /// A value already converted for the host (from `unbox`).
    Value(NativeValue),
}

enum Callee {
    Builtin(BuiltinName),
    Helper(HelperName),
    Function(NativeFn),
}

/// Calls `target` with borrowed `args`.
pub(crate) fn dispatch(
    heap: &mut LocalHeap,
    target: NativeId,
    args: &[NativeId],
    wrapped: bool,
) -> Result<Outcome, NativeError> {
    let callee = match heap.get(target)? {
        LocalObject::Builtin(name) => Callee::Builtin(*name),
        LocalObject::Helper(name) => Callee::Helper(*name),
        LocalObject::Function { func, .. } => Callee::Function(func.clone()),
        other => {
            return Err(type_error(format!("'{}' object is not callable", other.type_name())));
        }
    };
    match callee {
        Callee::Builtin(name) => call_builtin(heap, name, args).map(Outcome::Owned),
        Callee::Helper(HelperName::Unbox) => {
            check_arity("unbox", args, 1, 1)?;
            if wrapped {
                heap.unbox(args[0]).map(Outcome::Value)
            } else {
                heap.inc_ref(args[0])?;
                Ok(Outcome::Owned(args[0]))
            }
        }
        Callee::Helper(HelperName::Getitem) => getitem(heap, args).map(Outcome::Owned),
        Callee::Helper(HelperName::Setitem) => setitem(heap, args).map(Outcome::Owned),
        Callee::Function(func) => func(heap, args).map(Outcome::Owned),
    }
}

fn check_arity(name: &str, args: &[NativeId], min: usize, max: usize) -> Result<(), NativeError> {
    if (min..=max).contains(&args.len()) {
        return Ok(());
    }
    let expected = if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    };
    Err(type_error(format!(
        "{name}() takes {expected} arguments ({} given)",
        args.len()
    )))
}

fn no_attribute(heap: &LocalHeap, obj: NativeId, name: &str) -> Result<NativeError, NativeError> {
    let type_name = heap.get(obj)?.type_name();
    Ok(NativeError::new(
        "AttributeError",
        format!("'{type_name}' object has no attribute '{name}'"),
    ))
}

fn call_builtin(heap: &mut LocalHeap, name: BuiltinName, args: &[NativeId]) -> Result<NativeId, NativeError> {
    match name {
        BuiltinName::Getattr => {
            check_arity("getattr", args, 2, 3)?;
            let attr = heap.str(args[1])?.to_owned();
            let found = heap.get(args[0])?.attrs().and_then(|attrs| attrs.get(&attr).copied());
            let result = match (found, args.get(2)) {
                (Some(id), _) | (None, Some(&id)) => id,
                (None, None) => return Err(no_attribute(heap, args[0], &attr)?),
            };
            heap.inc_ref(result)?;
            Ok(result)
        }
        BuiltinName::Setattr => {
            check_arity("setattr", args, 3, 3)?;
            let attr = heap.str(args[1])?.to_owned();
            heap.inc_ref(args[2])?;
            heap.set_attr(args[0], &attr, args[2])?;
            Ok(heap.none())
        }
        BuiltinName::Hasattr => {
            check_arity("hasattr", args, 2, 2)?;
            let attr = heap.str(args[1])?;
            let found = heap.get(args[0])?.attrs().is_some_and(|attrs| attrs.contains_key(attr));
            Ok(heap.new_bool(found))
        }
        BuiltinName::Delattr => {
            check_arity("delattr", args, 2, 2)?;
            let attr = heap.str(args[1])?.to_owned();
            let removed = heap
                .get_mut(args[0])?
                .attrs_mut()
                .and_then(|attrs| attrs.shift_remove(&attr));
            match removed {
                Some(old) => {
                    heap.dec_ref(old);
                    Ok(heap.none())
                }
                None => Err(no_attribute(heap, args[0], &attr)?),
            }
        }
        BuiltinName::Repr => {
            check_arity("repr", args, 1, 1)?;
            let text = heap.repr(args[0])?;
            Ok(heap.new_str(text))
        }
        BuiltinName::Callable => {
            check_arity("callable", args, 1, 1)?;
            let callable = heap.get(args[0])?.is_callable();
            Ok(heap.new_bool(callable))
        }
        BuiltinName::Object => {
            check_arity("object", args, 0, 0)?;
            Ok(heap.new_instance())
        }
        BuiltinName::Import => {
            check_arity("__import__", args, 1, 1)?;
            let name = heap.str(args[0])?;
            let Some(&module) = heap.modules.get(name) else {
                return Err(NativeError::new(
                    "ModuleNotFoundError",
                    format!("No module named '{name}'"),
                ));
            };
            heap.inc_ref(module)?;
            Ok(module)
        }
    }
}

/// Resolves a possibly negative index against `len`.
fn normalize_index(index: i64, len: usize) -> Option<usize> {
    let len = i64::try_from(len).ok()?;
    let resolved = if index < 0 { index + len } else { index };
    if (0..len).contains(&resolved) {
        usize::try_from(resolved).ok()
    } else {
        None
    }
}

fn getitem(heap: &mut LocalHeap, args: &[NativeId]) -> Result<NativeId, NativeError> {
    check_arity("getitem", args, 2, 2)?;
    let item = match heap.get(args[0])? {
        LocalObject::List(items) | LocalObject::Tuple(items) => {
            let kind = heap.get(args[0])?.type_name();
            let index = heap.int(args[1])?;
            normalize_index(index, items.len())
                .map(|i| items[i])
                .ok_or_else(|| NativeError::new("IndexError", format!("{kind} index out of range")))?
        }
        LocalObject::Instance(attrs) | LocalObject::Module { attrs, .. } => {
            let key = heap.str(args[1])?;
            attrs
                .get(key)
                .copied()
                .ok_or_else(|| NativeError::new("KeyError", format!("'{key}'")))?
        }
        other => {
            return Err(type_error(format!("'{}' object is not subscriptable", other.type_name())));
        }
    };
    heap.inc_ref(item)?;
    Ok(item)
}

fn setitem(heap: &mut LocalHeap, args: &[NativeId]) -> Result<NativeId, NativeError> {
    check_arity("setitem", args, 3, 3)?;
    let value = args[2];
    heap.get(value)?;
    let displaced = match heap.get(args[0])? {
        LocalObject::List(items) => {
            let len = items.len();
            let index = heap.int(args[1])?;
            let Some(slot) = normalize_index(index, len) else {
                return Err(NativeError::new("IndexError", "list assignment index out of range"));
            };
            let LocalObject::List(items) = heap.get_mut(args[0])? else {
                return Err(type_error("list changed during assignment"));
            };
            std::mem::replace(&mut items[slot], value)
        }
        LocalObject::Instance(_) | LocalObject::Module { .. } => {
            let key = heap.str(args[1])?.to_owned();
            let attrs = heap.get_mut(args[0])?.attrs_mut();
            match attrs.and_then(|attrs| attrs.insert(key, value)) {
                Some(old) => old,
                None => {
                    heap.inc_ref(value)?;
                    return Ok(heap.none());
                }
            }
        }
        other => {
            return Err(type_error(format!(
                "'{}' object does not support item assignment",
                other.type_name()
            )));
        }
    };
    heap.inc_ref(value)?;
    heap.dec_ref(displaced);
    Ok(heap.none())
}
