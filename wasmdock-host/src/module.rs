//! Module lifecycle: load → init → serve → drain → close.
//!
//! One `Module` owns one compiled and instantiated guest. Guest calls are
//! serialized per module behind a mutex (a wasmtime store is single
//! threaded); the hot-swap path keeps displaced instances alive until their
//! in-flight callers finish, because `Module` is a shared handle.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use wasmtime::{Config, Engine, Linker, Memory, Store, TypedFunc};
use wasmtime_wasi::preview1::WasiP1Ctx;
use wasmtime_wasi::WasiCtxBuilder;

use crate::bridge::HostBridge;
use wasmdock_abi as abi;
use wasmdock_bus::Subscription;

/// Errors from loading and driving a guest module.
#[derive(Debug, Error)]
pub enum ModuleError {
    #[error("engine creation failed: {0}")]
    Engine(#[source] anyhow::Error),

    #[error("module compilation failed: {0}")]
    Compile(#[source] anyhow::Error),

    #[error("instantiation failed: {0}")]
    Instantiate(#[source] anyhow::Error),

    #[error("init failed: {0}")]
    Init(#[source] anyhow::Error),

    #[error("guest call failed: {function} - {source}")]
    Call {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("guest memory error: {0}")]
    Memory(String),

    #[error("module is closed")]
    Closed,
}

/// Data attached to every module's store.
///
/// The `module` backref is installed right after instantiation, before any
/// guest code runs, so host functions can reach the owning module's cleanup
/// list from a `Caller`.
pub struct StoreData {
    pub(crate) wasi: WasiP1Ctx,
    pub(crate) module: Weak<ModuleInner>,
}

/// Compiles and instantiates modules on a shared engine.
pub struct ModuleLoader {
    engine: Engine,
    fuel_limit: Option<u64>,
}

impl ModuleLoader {
    pub fn new(max_wasm_stack: usize, fuel_limit: Option<u64>) -> Result<Self, ModuleError> {
        let mut config = Config::new();
        config.max_wasm_stack(max_wasm_stack);
        config.wasm_memory64(false);
        if fuel_limit.is_some() {
            config.consume_fuel(true);
        }
        let engine = Engine::new(&config).map_err(ModuleError::Engine)?;
        Ok(Self { engine, fuel_limit })
    }

    /// Loads a guest from bytes (binary wasm or WAT text), instantiating it
    /// with WASI preview 1 and the bridge's `env` imports, and resolving the
    /// optional well-known exports.
    ///
    /// On failure the partial store is destroyed; nothing becomes visible.
    pub fn load(
        &self,
        name: &str,
        bytes: &[u8],
        bridge: &HostBridge,
    ) -> Result<Module, ModuleError> {
        let compiled = wasmtime::Module::new(&self.engine, bytes).map_err(ModuleError::Compile)?;

        let wasi = WasiCtxBuilder::new().build_p1();
        let mut store = Store::new(
            &self.engine,
            StoreData {
                wasi,
                module: Weak::new(),
            },
        );
        if let Some(fuel) = self.fuel_limit {
            store.set_fuel(fuel).map_err(ModuleError::Engine)?;
        }

        let mut linker: Linker<StoreData> = Linker::new(&self.engine);
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |data| &mut data.wasi)
            .map_err(ModuleError::Instantiate)?;
        bridge.register(&mut linker)?;

        let instance = linker
            .instantiate(&mut store, &compiled)
            .map_err(ModuleError::Instantiate)?;

        let memory = instance.get_memory(&mut store, abi::EXPORT_MEMORY);
        let init_fn = instance
            .get_typed_func::<(), ()>(&mut store, abi::EXPORT_INIT)
            .ok();
        let drain_fn = instance
            .get_typed_func::<(), u32>(&mut store, abi::EXPORT_DRAIN)
            .ok();
        let handle_fn = instance
            .get_typed_func::<(u32, u32), u32>(&mut store, abi::EXPORT_HANDLE)
            .ok();
        let on_message_fn = instance
            .get_typed_func::<(u32, u32), ()>(&mut store, abi::EXPORT_ON_MESSAGE)
            .ok();
        let malloc_fn = instance
            .get_typed_func::<u32, u32>(&mut store, abi::EXPORT_MALLOC)
            .ok();

        let inner = Arc::new(ModuleInner {
            name: name.to_string(),
            guest: Mutex::new(GuestState {
                store,
                memory,
                init_fn,
                drain_fn,
                handle_fn,
                on_message_fn,
                malloc_fn,
            }),
            cleanups: Mutex::new(Vec::new()),
            active: AtomicI32::new(0),
            closed: AtomicBool::new(false),
            fuel_limit: self.fuel_limit,
        });
        inner.guest.lock().store.data_mut().module = Arc::downgrade(&inner);

        tracing::debug!(module = %name, "module instantiated");
        Ok(Module { inner })
    }
}

struct GuestState {
    store: Store<StoreData>,
    memory: Option<Memory>,
    init_fn: Option<TypedFunc<(), ()>>,
    drain_fn: Option<TypedFunc<(), u32>>,
    handle_fn: Option<TypedFunc<(u32, u32), u32>>,
    on_message_fn: Option<TypedFunc<(u32, u32), ()>>,
    malloc_fn: Option<TypedFunc<u32, u32>>,
}

impl GuestState {
    fn refuel(&mut self, limit: Option<u64>) {
        if let Some(fuel) = limit {
            let _ = self.store.set_fuel(fuel);
        }
    }
}

pub(crate) struct ModuleInner {
    name: String,
    guest: Mutex<GuestState>,
    cleanups: Mutex<Vec<Subscription>>,
    active: AtomicI32,
    closed: AtomicBool,
    fuel_limit: Option<u64>,
}

impl ModuleInner {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Appends a subscription canceller to run at close.
    pub(crate) fn push_cleanup(&self, sub: Subscription) {
        self.cleanups.lock().push(sub);
    }

    /// Copies a bus payload into guest memory via the guest's `malloc` and
    /// invokes `on_message`.
    ///
    /// Deliveries to a closed module, or to a guest missing `malloc`,
    /// `on_message` or `memory`, are silently dropped. A failed delivery
    /// drops this one message only; the subscription stays active. The guest
    /// owns the buffer afterwards.
    pub(crate) fn deliver(&self, payload: &[u8]) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let mut guest = self.guest.lock();
        // Re-check: close may have won the lock while we waited.
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (Some(malloc), Some(on_message), Some(memory)) =
            (guest.malloc_fn.clone(), guest.on_message_fn.clone(), guest.memory)
        else {
            return;
        };

        let len = payload.len() as u32;
        guest.refuel(self.fuel_limit);
        let ptr = match malloc.call(&mut guest.store, len) {
            Ok(0) => {
                tracing::warn!(module = %self.name, "guest malloc returned null, dropping message");
                return;
            }
            Ok(ptr) => ptr,
            Err(e) => {
                tracing::warn!(module = %self.name, error = %e, "guest malloc failed, dropping message");
                return;
            }
        };
        if let Err(e) = memory.write(&mut guest.store, ptr as usize, payload) {
            tracing::warn!(module = %self.name, error = %e, "guest memory write failed, dropping message");
            return;
        }

        self.active.fetch_add(1, Ordering::AcqRel);
        let result = on_message.call(&mut guest.store, (ptr, len));
        self.active.fetch_sub(1, Ordering::AcqRel);
        if let Err(e) = result {
            tracing::warn!(module = %self.name, error = %e, "on_message failed");
        }
    }
}

/// A loaded guest instance. Cheap to clone; the underlying store is released
/// when the last handle drops, never before the cleanups have run.
#[derive(Clone)]
pub struct Module {
    pub(crate) inner: Arc<ModuleInner>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("name", &self.inner.name).finish()
    }
}

impl Module {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// In-flight host-initiated calls into this guest.
    pub fn active(&self) -> i32 {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Runs the guest's `init` export once, if present.
    pub fn init(&self) -> Result<(), ModuleError> {
        let mut guest = self.inner.guest.lock();
        let Some(init) = guest.init_fn.clone() else {
            return Ok(());
        };
        guest.refuel(self.inner.fuel_limit);
        init.call(&mut guest.store, ()).map_err(ModuleError::Init)
    }

    /// Dispatches a request to the guest's `handle` export.
    ///
    /// The request blob is copied into guest memory through the guest's
    /// `malloc`; without an allocator the guest is invoked with `ptr = 0`
    /// and only the length. Returns `None` when the guest has no `handle`
    /// export or returns `0` (pass-through), otherwise the NUL-terminated
    /// response capped at 64 KiB and the end of linear memory.
    pub fn handle(&self, request: &[u8]) -> Result<Option<Vec<u8>>, ModuleError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(ModuleError::Closed);
        }
        let mut guest = self.inner.guest.lock();
        let Some(handle) = guest.handle_fn.clone() else {
            return Ok(None);
        };

        let len = request.len() as u32;
        let ptr = match (guest.malloc_fn.clone(), guest.memory) {
            (Some(malloc), Some(memory)) => {
                guest.refuel(self.inner.fuel_limit);
                let ptr = malloc
                    .call(&mut guest.store, len)
                    .map_err(|source| ModuleError::Call {
                        function: "malloc",
                        source,
                    })?;
                if ptr == 0 {
                    return Err(ModuleError::Memory(format!("malloc({len}) returned null")));
                }
                memory
                    .write(&mut guest.store, ptr as usize, request)
                    .map_err(|e| ModuleError::Memory(e.to_string()))?;
                ptr
            }
            // No allocator: the guest treats ptr = 0 as "no request payload".
            _ => 0,
        };

        guest.refuel(self.inner.fuel_limit);
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let result = handle.call(&mut guest.store, (ptr, len));
        self.inner.active.fetch_sub(1, Ordering::AcqRel);
        let reply_ptr = result.map_err(|source| ModuleError::Call {
            function: "handle",
            source,
        })?;

        if reply_ptr == 0 {
            return Ok(None);
        }
        let Some(memory) = guest.memory else {
            return Ok(None);
        };
        Ok(Some(read_reply(&guest.store, memory, reply_ptr)))
    }

    /// Drives the guest's `drain` export until it reports 0, sleeping each
    /// returned hint. Exceeding `budget` logs a warning and returns; the
    /// module is then closed regardless. Without a `drain` export this is an
    /// immediate no-op.
    pub fn drain(&self, budget: Duration) {
        if self.inner.closed.load(Ordering::Acquire) {
            return;
        }
        {
            if self.inner.guest.lock().drain_fn.is_none() {
                return;
            }
        }
        let start = Instant::now();
        loop {
            // Lock per call so bus deliveries can interleave with draining.
            let hint = {
                let mut guest = self.inner.guest.lock();
                let Some(drain) = guest.drain_fn.clone() else { return };
                guest.refuel(self.inner.fuel_limit);
                match drain.call(&mut guest.store, ()) {
                    Ok(ms) => ms,
                    Err(e) => {
                        tracing::warn!(module = %self.inner.name, error = %e, "drain call failed");
                        return;
                    }
                }
            };
            if hint == 0 {
                return;
            }
            if start.elapsed() >= budget {
                tracing::warn!(
                    module = %self.inner.name,
                    budget_ms = budget.as_millis() as u64,
                    "drain budget exceeded, closing anyway"
                );
                return;
            }
            std::thread::sleep(Duration::from_millis(u64::from(hint)));
        }
    }

    /// Cancels every subscription registered on behalf of this module, in
    /// reverse registration order, and marks the module closed. Idempotent.
    /// Late bus callbacks are dropped from here on; store resources are
    /// released once the last handle drops.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut cleanups = self.inner.cleanups.lock();
        for sub in cleanups.drain(..).rev() {
            sub.cancel();
        }
        tracing::debug!(module = %self.inner.name, "module closed");
    }
}

/// Reads a NUL-terminated reply from guest memory, stopping at the first NUL
/// byte, at [`abi::MAX_RESPONSE_BYTES`], or at the end of linear memory.
fn read_reply(store: &Store<StoreData>, memory: Memory, ptr: u32) -> Vec<u8> {
    let data = memory.data(store);
    let start = ptr as usize;
    if start >= data.len() {
        return Vec::new();
    }
    let end = data.len().min(start + abi::MAX_RESPONSE_BYTES);
    let window = &data[start..end];
    let len = window.iter().position(|&b| b == 0).unwrap_or(window.len());
    window[..len].to_vec()
}
