//! An in-process reference interpreter.
//!
//! [`LocalInterpreter`] implements [`NativeInterpreter`] over a small refcounted
//! arena. It behaves like a real embedded interpreter in the ways that matter to
//! the bridge: object IDs are recycled as soon as an object is freed, every restart
//! builds a fresh arena (so IDs from a dead epoch name unrelated objects in the new
//! one), and result IDs are borrowed until the next call.
//!
//! Host code can install native functions into `__main__`:
//!
//! ```
//! use tether::{HostValue, Session, local::LocalInterpreter};
//!
//! let native = LocalInterpreter::new().with_function("double", |heap, args| {
//!     let n = heap.int(args[0])?;
//!     Ok(heap.new_int(n * 2))
//! });
//! let session = Session::start(native).unwrap();
//! let double = session.import("__main__").unwrap().get("double").unwrap();
//! assert_eq!(double.invoke(&[HostValue::Int(21)]).unwrap(), HostValue::Int(42));
//! ```
//!
//! A [`LocalProbe`] observes the native side while the session owns the interpreter.

mod builtins;
mod heap;

use std::{
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
};

use ahash::AHashMap;
use indexmap::IndexMap;
use strum::IntoEnumIterator;

pub use self::heap::{LocalHeap, LocalObject, NativeFn};
use self::builtins::{Outcome, dispatch};
use crate::{
    error::NativeError,
    ids::{EpochId, NativeId},
    native::{NativeArg, NativeInterpreter, NativeValue},
    registry::{BuiltinName, HelperName},
};

/// Epochs are unique across every local interpreter in the process.
static NEXT_EPOCH: AtomicU64 = AtomicU64::new(1);

/// One running instance: the arena plus the tables handed to the bridge.
#[derive(Debug)]
struct Runtime {
    epoch: EpochId,
    heap: LocalHeap,
    builtins: Vec<(String, NativeId)>,
    helpers: Vec<(String, NativeId)>,
}

impl Runtime {
    fn boot(epoch: EpochId, functions: &IndexMap<String, NativeFn>) -> Self {
        let mut heap = LocalHeap::default();

        let mut builtins = Vec::new();
        let mut builtin_attrs = IndexMap::new();
        for name in BuiltinName::iter() {
            let id = heap.allocate(LocalObject::Builtin(name));
            builtins.push((name.to_string(), id));
            builtin_attrs.insert(name.to_string(), id);
        }
        let builtins_module = heap.allocate(LocalObject::Module {
            name: "builtins".to_owned(),
            attrs: builtin_attrs,
        });

        // helpers are owned by the runtime itself and never freed before shutdown
        let helpers = HelperName::iter()
            .map(|name| (name.to_string(), heap.allocate(LocalObject::Helper(name))))
            .collect();

        let main_attrs = functions
            .iter()
            .map(|(name, func)| {
                let id = heap.allocate(LocalObject::Function {
                    name: name.clone(),
                    func: func.clone(),
                });
                (name.clone(), id)
            })
            .collect();
        let main_module = heap.allocate(LocalObject::Module {
            name: "__main__".to_owned(),
            attrs: main_attrs,
        });

        heap.modules.insert("builtins".to_owned(), builtins_module);
        heap.modules.insert("__main__".to_owned(), main_module);

        Self {
            epoch,
            heap,
            builtins,
            helpers,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    starts: AtomicU64,
    calls: AtomicU64,
    increments: AtomicU64,
    decrements: AtomicU64,
    stray_decrements: AtomicU64,
    decrements_by_epoch: Mutex<AHashMap<EpochId, u64>>,
}

type SharedRuntime = Arc<Mutex<Option<Runtime>>>;

fn lock_runtime(runtime: &SharedRuntime) -> MutexGuard<'_, Option<Runtime>> {
    runtime.lock().unwrap_or_else(PoisonError::into_inner)
}

fn not_running() -> NativeError {
    NativeError::new("RuntimeError", "interpreter is not running")
}

/// Reference implementation of [`NativeInterpreter`].
#[derive(Default)]
pub struct LocalInterpreter {
    runtime: SharedRuntime,
    functions: IndexMap<String, NativeFn>,
    counters: Arc<Counters>,
}

impl LocalInterpreter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a native function as a global of `__main__`.
    ///
    /// Functions are installed when an epoch starts, so they are present in every
    /// epoch of the session.
    #[must_use]
    pub fn with_function(
        mut self,
        name: impl Into<String>,
        func: impl Fn(&mut LocalHeap, &[NativeId]) -> Result<NativeId, NativeError> + Send + Sync + 'static,
    ) -> Self {
        self.functions.insert(name.into(), Arc::new(func));
        self
    }

    /// A probe sharing this interpreter's state.
    #[must_use]
    pub fn probe(&self) -> LocalProbe {
        LocalProbe {
            runtime: Arc::clone(&self.runtime),
            counters: Arc::clone(&self.counters),
        }
    }

    fn runtime(&self) -> MutexGuard<'_, Option<Runtime>> {
        lock_runtime(&self.runtime)
    }
}

impl fmt::Debug for LocalInterpreter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalInterpreter")
            .field("epoch", &self.session_id())
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Creates an owned object for one call argument.
fn materialize(heap: &mut LocalHeap, arg: &NativeArg) -> Result<NativeId, NativeError> {
    Ok(match arg {
        NativeArg::None => heap.none(),
        NativeArg::Bool(b) => heap.new_bool(*b),
        NativeArg::Int(i) => heap.new_int(*i),
        NativeArg::Float(v) => heap.allocate(LocalObject::Float(*v)),
        NativeArg::Str(s) => heap.new_str(s.as_str()),
        NativeArg::Object(id) => {
            heap.inc_ref(*id)?;
            *id
        }
    })
}

impl NativeInterpreter for LocalInterpreter {
    fn start(&mut self) -> Result<EpochId, NativeError> {
        let epoch = EpochId::new(NEXT_EPOCH.fetch_add(1, Ordering::Relaxed));
        let runtime = Runtime::boot(epoch, &self.functions);
        *self.runtime() = Some(runtime);
        self.counters.starts.fetch_add(1, Ordering::Relaxed);
        Ok(epoch)
    }

    fn shutdown(&mut self) {
        *self.runtime() = None;
    }

    fn session_id(&self) -> Option<EpochId> {
        self.runtime().as_ref().map(|runtime| runtime.epoch)
    }

    fn session_is_live(&self, epoch: EpochId) -> bool {
        self.session_id() == Some(epoch)
    }

    fn ref_incr(&mut self, id: NativeId) -> Result<(), NativeError> {
        let mut guard = self.runtime();
        let runtime = guard.as_mut().ok_or_else(not_running)?;
        runtime.heap.inc_ref(id)?;
        self.counters.increments.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn ref_decr(&mut self, id: NativeId) {
        let mut guard = self.runtime();
        let hit = guard
            .as_mut()
            .and_then(|runtime| runtime.heap.dec_ref(id).then_some(runtime.epoch));
        if let Some(epoch) = hit {
            self.counters.decrements.fetch_add(1, Ordering::Relaxed);
            *self
                .counters
                .decrements_by_epoch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(epoch)
                .or_default() += 1;
        } else {
            self.counters.stray_decrements.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn call(&mut self, wrapped: bool, target: NativeId, args: &[NativeArg]) -> Result<NativeValue, NativeError> {
        let mut guard = self.runtime();
        let runtime = guard.as_mut().ok_or_else(not_running)?;
        self.counters.calls.fetch_add(1, Ordering::Relaxed);
        let heap = &mut runtime.heap;
        heap.clear_scratch();

        let mut owned = Vec::with_capacity(args.len());
        for arg in args {
            match materialize(heap, arg) {
                Ok(id) => owned.push(id),
                Err(error) => {
                    for id in owned {
                        heap.dec_ref(id);
                    }
                    return Err(error);
                }
            }
        }
        let outcome = dispatch(heap, target, &owned, wrapped);
        for id in owned {
            heap.dec_ref(id);
        }

        match outcome? {
            Outcome::Value(value) => Ok(value),
            Outcome::Owned(id) => {
                let value = heap.wrap(id, wrapped);
                heap.hold_scratch(id);
                value
            }
        }
    }

    fn builtins(&mut self) -> Vec<(String, NativeId)> {
        self.runtime()
            .as_ref()
            .map(|runtime| runtime.builtins.clone())
            .unwrap_or_default()
    }

    fn helpers(&mut self) -> Vec<(String, NativeId)> {
        self.runtime()
            .as_ref()
            .map(|runtime| runtime.helpers.clone())
            .unwrap_or_default()
    }
}

/// Read-only view of a [`LocalInterpreter`]'s native side.
///
/// Counters cover the bridge's traffic (`ref_incr`, `ref_decr`, `call`), not the
/// interpreter's internal reference juggling. Do not use a probe from inside a
/// native function: the runtime lock is held there.
#[derive(Debug, Clone)]
pub struct LocalProbe {
    runtime: SharedRuntime,
    counters: Arc<Counters>,
}

impl LocalProbe {
    /// Number of epochs started.
    #[must_use]
    pub fn starts(&self) -> u64 {
        self.counters.starts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn calls(&self) -> u64 {
        self.counters.calls.load(Ordering::Relaxed)
    }

    /// Successful `ref_incr` calls.
    #[must_use]
    pub fn increments(&self) -> u64 {
        self.counters.increments.load(Ordering::Relaxed)
    }

    /// `ref_decr` calls that hit a live object.
    #[must_use]
    pub fn decrements(&self) -> u64 {
        self.counters.decrements.load(Ordering::Relaxed)
    }

    /// `ref_decr` calls on a free slot or a stopped interpreter.
    #[must_use]
    pub fn stray_decrements(&self) -> u64 {
        self.counters.stray_decrements.load(Ordering::Relaxed)
    }

    /// `ref_decr` calls that hit a live object during `epoch`.
    #[must_use]
    pub fn decrements_in(&self, epoch: EpochId) -> u64 {
        self.counters
            .decrements_by_epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&epoch)
            .copied()
            .unwrap_or(0)
    }

    /// The running epoch, if any.
    #[must_use]
    pub fn epoch(&self) -> Option<EpochId> {
        lock_runtime(&self.runtime).as_ref().map(|runtime| runtime.epoch)
    }

    /// Refcount of `id` in the running interpreter (0 if free or stopped).
    #[must_use]
    pub fn refcount(&self, id: NativeId) -> usize {
        lock_runtime(&self.runtime)
            .as_ref()
            .map_or(0, |runtime| runtime.heap.refcount(id))
    }

    #[must_use]
    pub fn is_live(&self, id: NativeId) -> bool {
        self.refcount(id) > 0
    }

    #[must_use]
    pub fn live_objects(&self) -> usize {
        lock_runtime(&self.runtime)
            .as_ref()
            .map_or(0, |runtime| runtime.heap.live_objects())
    }
}
