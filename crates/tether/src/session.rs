//! Session: the epoch authority for one embedded interpreter.
//!
//! A [`Session`] owns the native interpreter, the per-epoch builtins/helpers
//! tables and the native lock. Every handle keeps only a weak reference to its
//! session plus the epoch it was minted under, and proves its own validity on each
//! use by asking the session whether that epoch is still the live one.

use std::sync::{
    Arc, Mutex, PoisonError,
    atomic::{AtomicU64, Ordering},
};

use crate::{
    config::BridgeConfig,
    error::{BridgeError, BridgeResult, InvalidState},
    handle::Handle,
    ids::{EpochId, NativeId, SessionId},
    lock::NativeLock,
    module::Module,
    native::NativeInterpreter,
    registry::{BuiltinName, HelperRegistry},
    stats::BridgeStats,
    tracer::{BridgeTracer, NoopTracer},
    value::HostValue,
};

/// Raw value of `live_mirror` when no epoch is live.
const NO_EPOCH: u64 = u64::MAX;

/// Shared core of a session; handles point at it weakly.
#[derive(Debug)]
pub(crate) struct SessionInner {
    pub(crate) id: SessionId,
    pub(crate) config: BridgeConfig,
    state: Mutex<SessionState>,
    /// Releases queued by finalizers that ran on a thread holding `state`.
    deferred: Mutex<Vec<(EpochId, NativeId)>>,
    /// Copy of the live epoch for queries made while `state` is held by this thread.
    live_mirror: AtomicU64,
}

/// Everything guarded by the native lock.
#[derive(Debug)]
pub(crate) struct SessionState {
    pub(crate) native: Box<dyn NativeInterpreter>,
    pub(crate) tracer: Box<dyn BridgeTracer>,
    pub(crate) stats: BridgeStats,
    live: Option<EpochId>,
    builtins: HelperRegistry,
    helpers: HelperRegistry,
}

impl SessionState {
    /// Whether `epoch` is live both for this session and for the native side.
    ///
    /// Always consults the interpreter; epoch validity is never cached.
    pub(crate) fn is_epoch_live(&self, epoch: EpochId) -> bool {
        self.live == Some(epoch) && self.native.session_is_live(epoch)
    }

    pub(crate) fn current_epoch(&self) -> BridgeResult<EpochId> {
        match self.live {
            Some(epoch) if self.native.session_is_live(epoch) => Ok(epoch),
            _ => Err(InvalidState::NoActiveSession.into()),
        }
    }

    /// Takes one native refcount unit on `id` under `epoch`.
    pub(crate) fn take_unit(&mut self, epoch: EpochId, id: NativeId) -> BridgeResult<()> {
        if !self.is_epoch_live(epoch) {
            return Err(self.dead_epoch_error(epoch));
        }
        self.native
            .ref_incr(id)
            .map_err(|error| BridgeError::NotAnObject(format!("{id} cannot be referenced: {error}")))?;
        self.stats.increments += 1;
        self.tracer.on_ref_incr(epoch, id);
        Ok(())
    }

    /// Gives back one refcount unit taken under `epoch`.
    ///
    /// If `epoch` is no longer live the native object died with its interpreter and
    /// `id` may already name something else, so the decrement is skipped.
    pub(crate) fn release_unit(&mut self, epoch: EpochId, id: NativeId) {
        if self.is_epoch_live(epoch) {
            self.native.ref_decr(id);
            self.stats.decrements += 1;
            self.tracer.on_ref_decr(epoch, id);
        } else {
            self.stats.skipped_releases += 1;
            self.tracer.on_release_skipped(epoch, id);
        }
    }

    fn dead_epoch_error(&self, epoch: EpochId) -> BridgeError {
        if self.live.is_none() {
            InvalidState::NoActiveSession.into()
        } else {
            InvalidState::DeadEpoch(epoch).into()
        }
    }

    fn lookup(&self, table: Table, name: &str) -> BridgeResult<NativeId> {
        match table {
            Table::Builtins => self.builtins.get(name),
            Table::Helpers => self.helpers.get(name),
        }
    }

    /// Starts a new epoch and loads its lookup tables.
    fn start(&mut self) -> BridgeResult<EpochId> {
        let epoch = self.native.start()?;
        self.live = Some(epoch);
        self.tracer.on_session_start(epoch);
        if let Err(error) = self.load_tables(epoch) {
            self.teardown();
            return Err(error);
        }
        Ok(epoch)
    }

    fn load_tables(&mut self, epoch: EpochId) -> BridgeResult<()> {
        for table in [Table::Builtins, Table::Helpers] {
            let entries = match table {
                Table::Builtins => self.native.builtins(),
                Table::Helpers => self.native.helpers(),
            };
            for (name, id) in entries {
                self.take_unit(epoch, id)?;
                let displaced = match table {
                    Table::Builtins => self.builtins.insert(name, id),
                    Table::Helpers => self.helpers.insert(name, id),
                };
                if let Some(old) = displaced {
                    self.release_unit(epoch, old);
                }
            }
        }
        Ok(())
    }

    /// Ends the live epoch. Table units are returned while the epoch is still live,
    /// then the interpreter is shut down. Idempotent.
    fn teardown(&mut self) {
        let Some(epoch) = self.live else {
            return;
        };
        let ids: Vec<NativeId> = self.builtins.drain().into_iter().chain(self.helpers.drain()).collect();
        for id in ids {
            self.release_unit(epoch, id);
        }
        self.tracer.on_session_teardown(epoch);
        self.native.shutdown();
        self.live = None;
    }
}

/// Which lookup table to consult.
#[derive(Debug, Clone, Copy)]
enum Table {
    Builtins,
    Helpers,
}

impl SessionInner {
    /// Acquires the native lock and runs any releases deferred since the last hold.
    pub(crate) fn lock(&self) -> BridgeResult<NativeLock<'_, SessionState>> {
        let mut state = NativeLock::acquire(&self.state, self.id)?;
        self.drain_deferred(&mut state);
        Ok(state)
    }

    /// Queues a release for the next time the lock is acquired.
    pub(crate) fn defer_release(&self, epoch: EpochId, id: NativeId) {
        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((epoch, id));
    }

    fn drain_deferred(&self, state: &mut SessionState) {
        let pending = std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        for (epoch, id) in pending {
            state.stats.deferred_releases += 1;
            state.tracer.on_release_deferred(epoch, id);
            state.release_unit(epoch, id);
        }
    }

    fn publish_live(&self, live: Option<EpochId>) {
        self.live_mirror
            .store(live.map_or(NO_EPOCH, EpochId::raw), Ordering::Release);
    }
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let pending = std::mem::take(self.deferred.get_mut().unwrap_or_else(PoisonError::into_inner));
        for (epoch, id) in pending {
            state.stats.deferred_releases += 1;
            state.release_unit(epoch, id);
        }
        state.teardown();
    }
}

/// Configures and starts a [`Session`].
#[derive(Debug)]
pub struct SessionBuilder {
    native: Box<dyn NativeInterpreter>,
    config: BridgeConfig,
    tracer: Box<dyn BridgeTracer>,
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn tracer(mut self, tracer: impl BridgeTracer + 'static) -> Self {
        self.tracer = Box::new(tracer);
        self
    }

    /// Creates the session without starting the interpreter.
    ///
    /// Every operation fails with `NoActiveSession` until [`Session::restart`] is called.
    #[must_use]
    pub fn build(self) -> Session {
        let inner = SessionInner {
            id: SessionId::next(),
            config: self.config,
            state: Mutex::new(SessionState {
                native: self.native,
                tracer: self.tracer,
                stats: BridgeStats::default(),
                live: None,
                builtins: HelperRegistry::new("builtins"),
                helpers: HelperRegistry::new("helpers"),
            }),
            deferred: Mutex::new(Vec::new()),
            live_mirror: AtomicU64::new(NO_EPOCH),
        };
        Session { inner: Arc::new(inner) }
    }

    /// Creates the session and starts its first epoch.
    pub fn start(self) -> BridgeResult<Session> {
        let session = self.build();
        session.restart()?;
        Ok(session)
    }
}

/// Owner of one embedded interpreter and issuer of its epochs.
///
/// Cloning is cheap and yields another reference to the same session. The
/// interpreter is shut down when the last clone is dropped; handles do not keep the
/// session alive.
#[derive(Debug, Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Starts an interpreter with default config and no tracing.
    pub fn start(native: impl NativeInterpreter + 'static) -> BridgeResult<Self> {
        Self::builder(native).start()
    }

    pub fn builder(native: impl NativeInterpreter + 'static) -> SessionBuilder {
        SessionBuilder {
            native: Box::new(native),
            config: BridgeConfig::default(),
            tracer: Box::new(NoopTracer),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Self { inner }
    }

    /// The live epoch; fails with `NoActiveSession` when the interpreter is down.
    pub fn current_epoch(&self) -> BridgeResult<EpochId> {
        self.inner.lock()?.current_epoch()
    }

    /// Whether `epoch` is the live epoch of this session. Never fails.
    ///
    /// On a thread that is already inside a native operation of this session (a
    /// tracer hook) the answer comes from the session's last published epoch.
    pub fn is_epoch_live(&self, epoch: EpochId) -> bool {
        match self.inner.lock() {
            Ok(state) => state.is_epoch_live(epoch),
            Err(_) => self.inner.live_mirror.load(Ordering::Acquire) == epoch.raw(),
        }
    }

    /// Whether any epoch is live.
    pub fn is_active(&self) -> bool {
        self.current_epoch().is_ok()
    }

    /// Ends the live epoch. Idempotent.
    ///
    /// Outstanding handles are not touched; they observe the dead epoch the next
    /// time they are used or finalized.
    pub fn teardown(&self) -> BridgeResult<()> {
        let mut state = self.inner.lock()?;
        state.teardown();
        self.inner.publish_live(None);
        Ok(())
    }

    /// Tears down the live epoch (if any) and starts a new one.
    pub fn restart(&self) -> BridgeResult<EpochId> {
        let mut state = self.inner.lock()?;
        state.teardown();
        self.inner.publish_live(None);
        let epoch = state.start()?;
        self.inner.publish_live(Some(epoch));
        Ok(epoch)
    }

    /// Mints a handle for an existing interpreter object.
    pub fn handle(&self, id: NativeId) -> BridgeResult<Handle> {
        Handle::new(self, id)
    }

    /// A fresh handle to the builtin registered under `name`.
    pub fn builtin(&self, name: &str) -> BridgeResult<Handle> {
        self.table_handle(Table::Builtins, name)
    }

    /// A fresh handle to the conversion helper registered under `name`.
    pub fn helper(&self, name: &str) -> BridgeResult<Handle> {
        self.table_handle(Table::Helpers, name)
    }

    fn table_handle(&self, table: Table, name: &str) -> BridgeResult<Handle> {
        let mut state = self.inner.lock()?;
        let epoch = state.current_epoch()?;
        let id = state.lookup(table, name)?;
        Handle::new_locked(&self.inner, &mut state, epoch, id)
    }

    /// Imports a module by name through the `__import__` builtin.
    pub fn import(&self, name: &str) -> BridgeResult<Module> {
        let import = self.builtin(BuiltinName::Import.into())?;
        let module = import.raw_call(&[HostValue::from(name)])?;
        Ok(Module::from(module))
    }

    /// Names currently registered in the builtins table.
    pub fn builtin_names(&self) -> BridgeResult<Vec<String>> {
        Ok(self.inner.lock()?.builtins.names())
    }

    /// Names currently registered in the helpers table.
    pub fn helper_names(&self) -> BridgeResult<Vec<String>> {
        Ok(self.inner.lock()?.helpers.names())
    }

    /// A snapshot of the session's boundary counters.
    pub fn stats(&self) -> BridgeResult<BridgeStats> {
        Ok(self.inner.lock()?.stats)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Whether both values refer to the same session.
    pub fn same_session(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
