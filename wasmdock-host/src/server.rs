//! Top-level coordinator.
//!
//! Owns the module tables, sequences hot swaps, dispatches `/m/{name}`
//! requests through the middleware pipeline to the endpoint module, and
//! consumes artifact events from the internal watcher or an external
//! notifier.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::{Path as RoutePath, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::bridge::{BroadcastSink, HostBridge, LogSink};
use crate::builder::GuestBuilder;
use crate::config::HostConfig;
use crate::middleware::{self, apply_pipeline, MiddlewareModule};
use crate::module::{Module, ModuleError, ModuleLoader};
use crate::relay::WsRelay;
use crate::watcher::ArtifactWatcher;
use wasmdock_abi as abi;
use wasmdock_bus::Bus;

/// Server-level failures. Module-level errors never stop the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Module(#[from] ModuleError),
}

type RouteHook = Box<dyn FnOnce(Router) -> Router + Send>;

struct ServerShared {
    config: HostConfig,
    loader: ModuleLoader,
    bridge: HostBridge,
    bus: Bus,
    relay: WsRelay,
    builder: GuestBuilder,
    endpoints: RwLock<HashMap<String, Module>>,
    middlewares: RwLock<Vec<MiddlewareModule>>,
    route_hooks: Mutex<Vec<RouteHook>>,
    watcher: Mutex<Option<ArtifactWatcher>>,
    watcher_disabled: AtomicBool,
    shutdown: Notify,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

/// Configures a [`HostServer`] before it is built.
pub struct HostServerBuilder {
    config: HostConfig,
    bus: Option<Bus>,
    logger: Option<LogSink>,
    ws_broadcast: Option<BroadcastSink>,
    route_hooks: Vec<RouteHook>,
}

impl HostServerBuilder {
    /// Overrides the bus shared with guest modules.
    pub fn bus(mut self, bus: Bus) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Overrides the sink receiving guest `log` calls.
    pub fn logger(mut self, sink: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.logger = Some(Arc::new(sink));
        self
    }

    /// Overrides the sink receiving guest `ws_broadcast` calls. The default
    /// forwards into the host's own WebSocket relay.
    pub fn ws_broadcast(mut self, sink: impl Fn(&str, &[u8]) + Send + Sync + 'static) -> Self {
        self.ws_broadcast = Some(Arc::new(sink));
        self
    }

    /// Registers additional HTTP routes, applied to the router at start.
    pub fn routes(mut self, hook: impl FnOnce(Router) -> Router + Send + 'static) -> Self {
        self.route_hooks.push(Box::new(hook));
        self
    }

    pub fn build(self) -> Result<HostServer, ServerError> {
        let loader = ModuleLoader::new(self.config.max_wasm_stack, self.config.fuel_limit)?;
        let relay = WsRelay::new(self.config.ws_queue_capacity, self.config.ws_write_timeout);
        let bus = self.bus.unwrap_or_default();
        let logger: LogSink = self
            .logger
            .unwrap_or_else(|| Arc::new(|line| tracing::info!(target: "guest", "{line}")));
        let ws_broadcast: BroadcastSink = self.ws_broadcast.unwrap_or_else(|| {
            let relay = relay.clone();
            Arc::new(move |topic, payload| relay.broadcast(topic, payload))
        });
        let bridge = HostBridge::new(bus.clone(), ws_broadcast, logger);
        let builder = GuestBuilder::new(self.config.builder.clone());

        Ok(HostServer {
            shared: Arc::new(ServerShared {
                config: self.config,
                loader,
                bridge,
                bus,
                relay,
                builder,
                endpoints: RwLock::new(HashMap::new()),
                middlewares: RwLock::new(Vec::new()),
                route_hooks: Mutex::new(self.route_hooks),
                watcher: Mutex::new(None),
                watcher_disabled: AtomicBool::new(false),
                shutdown: Notify::new(),
                serve_task: Mutex::new(None),
            }),
        })
    }
}

/// The module host. Cheap to clone.
#[derive(Clone)]
pub struct HostServer {
    shared: Arc<ServerShared>,
}

impl HostServer {
    /// A host with default collaborators.
    pub fn new(config: HostConfig) -> Result<Self, ServerError> {
        Self::builder(config).build()
    }

    pub fn builder(config: HostConfig) -> HostServerBuilder {
        HostServerBuilder {
            config,
            bus: None,
            logger: None,
            ws_broadcast: None,
            route_hooks: Vec::new(),
        }
    }

    /// The bus shared with guest modules.
    pub fn bus(&self) -> Bus {
        self.shared.bus.clone()
    }

    pub fn endpoint_names(&self) -> Vec<String> {
        self.shared.endpoints.read().keys().cloned().collect()
    }

    pub fn middleware_names(&self) -> Vec<String> {
        self.shared
            .middlewares
            .read()
            .iter()
            .map(|mw| mw.module.name().to_string())
            .collect()
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.shared.endpoints.read().contains_key(name)
            || self
                .shared
                .middlewares
                .read()
                .iter()
                .any(|mw| mw.module.name() == name)
    }

    /// Builds the router, loads artifacts, optionally starts the internal
    /// watcher, binds and begins serving in the background. Returns the
    /// bound address.
    pub async fn start(&self) -> Result<SocketAddr, ServerError> {
        let shared = &self.shared;

        let core = Router::new()
            .route("/m/", get(dispatch_bare).post(dispatch_bare))
            .route("/m/{name}", get(dispatch_named).post(dispatch_named))
            .route("/m/{name}/{*rest}", get(dispatch_nested).post(dispatch_nested))
            .with_state(shared.clone());
        let mut app = core.merge(shared.relay.router());
        for hook in shared.route_hooks.lock().drain(..) {
            app = hook(app);
        }

        let modules_root = shared.config.modules_root();
        let output_root = shared.config.output_root();
        let _ = std::fs::create_dir_all(&output_root);

        // Auto-build any module with guest sources but no artifact.
        if let Ok(entries) = std::fs::read_dir(&modules_root) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_dir() {
                    continue;
                }
                let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from)
                else {
                    continue;
                };
                let artifact = output_root.join(format!("{name}.wasm"));
                if artifact.exists() || !shared.builder.has_guest_source(&path) {
                    continue;
                }
                tracing::info!(module = %name, "auto-building missing artifact");
                if let Err(e) = shared.builder.build(&name, &path, &output_root).await {
                    tracing::error!(module = %name, error = %e, "auto-build failed");
                }
            }
        }

        self.load_artifacts().await?;

        if !shared.config.external_watcher && !shared.watcher_disabled.load(Ordering::Acquire) {
            let weak = Arc::downgrade(shared);
            match ArtifactWatcher::spawn(
                &output_root,
                shared.config.watch_debounce,
                Arc::new(move |path: PathBuf| {
                    if let Some(shared) = weak.upgrade() {
                        shared.swap_from_path(&path);
                    }
                }),
            ) {
                Ok(watcher) => *shared.watcher.lock() = Some(watcher),
                Err(e) => tracing::error!(error = %e, "failed to start artifact watcher"),
            }
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], shared.config.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local = listener.local_addr()?;

        let signal = shared.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app)
                .with_graceful_shutdown(async move { signal.shutdown.notified().await });
            if let Err(e) = serve.await {
                tracing::error!(error = %e, "http server error");
            }
        });
        *shared.serve_task.lock() = Some(task);

        tracing::info!(addr = %local, "wasmdock host serving");
        Ok(local)
    }

    /// Starts the host and serves until ctrl-c, then shuts down.
    pub async fn run(&self) -> Result<(), ServerError> {
        self.start().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }

    /// Drains and closes every module, stops the watcher and shuts down the
    /// HTTP server gracefully.
    pub async fn stop(&self) {
        let watcher = self.shared.watcher.lock().take();
        if let Some(watcher) = watcher {
            watcher.shutdown().await;
        }

        let mut modules: Vec<Module> = self.shared.endpoints.read().values().cloned().collect();
        modules.extend(
            self.shared
                .middlewares
                .read()
                .iter()
                .map(|mw| mw.module.clone()),
        );
        let budget = self.shared.config.drain_timeout;
        let _ = tokio::task::spawn_blocking(move || {
            for module in modules {
                module.drain(budget);
                module.close();
            }
        })
        .await;

        self.shared.shutdown.notify_one();
        let task = self.shared.serve_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!("wasmdock host stopped");
    }

    /// Re-swaps every artifact currently present in the output directory.
    /// HTTP keeps serving throughout.
    pub async fn restart(&self) -> Result<(), ServerError> {
        self.load_artifacts().await?;
        Ok(())
    }

    /// Loads a module from bytes and publishes it under `name`, replacing
    /// and gracefully retiring any previous instance.
    pub async fn swap(&self, name: &str, bytes: Vec<u8>) -> Result<(), ModuleError> {
        let shared = self.shared.clone();
        let name = name.to_string();
        match tokio::task::spawn_blocking(move || shared.swap_blocking(&name, &bytes)).await {
            Ok(result) => result,
            Err(join_err) => Err(ModuleError::Call {
                function: "swap",
                source: anyhow::anyhow!(join_err),
            }),
        }
    }

    /// External file-event entry point.
    ///
    /// The first call hands control to the external notifier: the internal
    /// watcher (if running) is shut down and stays off. Only `write` and
    /// `create` events are acted on: `.wasm` artifacts are hot swapped, and
    /// guest source changes under `<modulesDir>/<name>/wasm/` trigger the
    /// external builder.
    pub async fn on_file_event(&self, file_name: &str, extension: &str, path: &Path, kind: &str) {
        if !self.shared.watcher_disabled.swap(true, Ordering::AcqRel) {
            let watcher = self.shared.watcher.lock().take();
            if let Some(watcher) = watcher {
                tracing::info!("external file events received, disabling internal artifact watcher");
                watcher.shutdown().await;
            }
        }

        if kind != "write" && kind != "create" {
            return;
        }

        if extension == ".wasm" {
            let name = file_name.strip_suffix(".wasm").unwrap_or(file_name);
            match tokio::fs::read(path).await {
                Ok(bytes) => {
                    tracing::info!(module = %name, "hot-reloading module");
                    if let Err(e) = self.swap(name, bytes).await {
                        tracing::error!(module = %name, error = %e, "hot swap failed");
                    }
                }
                Err(e) => {
                    tracing::error!(path = %path.display(), error = %e, "failed to read artifact")
                }
            }
        } else if self.shared.builder.is_source_ext(extension) {
            let Some(name) = self.shared.derive_module_name(path) else {
                return;
            };
            let module_dir = self.shared.config.modules_root().join(&name);
            tracing::info!(module = %name, "guest source changed, rebuilding");
            if let Err(e) = self
                .shared
                .builder
                .build(&name, &module_dir, &self.shared.config.output_root())
                .await
            {
                tracing::error!(module = %name, error = %e, "guest build failed");
            }
        }
    }

    async fn load_artifacts(&self) -> Result<(), std::io::Error> {
        let shared = self.shared.clone();
        tokio::task::spawn_blocking(move || -> Result<(), std::io::Error> {
            let entries = std::fs::read_dir(shared.config.output_root())?;
            let mut paths: Vec<PathBuf> = entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().map(|ext| ext == "wasm").unwrap_or(false))
                .collect();
            paths.sort();
            // Per-module failures are logged inside; one bad artifact must
            // not block the rest.
            for path in paths {
                shared.swap_from_path(&path);
            }
            Ok(())
        })
        .await
        .unwrap_or(Ok(()))
    }
}

impl ServerShared {
    /// The swap protocol: load and init outside any lock, classify by rule
    /// file, publish atomically, then retire the displaced instance.
    fn swap_blocking(&self, name: &str, bytes: &[u8]) -> Result<(), ModuleError> {
        // 1. Load outside any lock: on failure the old module keeps serving.
        let module = self.loader.load(name, bytes, &self.bridge)?;

        // 2. Init outside any lock: a failed module never reaches the table.
        if let Err(e) = module.init() {
            module.close();
            return Err(e);
        }

        // 3. Classify: a rule file alongside the source makes it middleware.
        let rule = middleware::load_rule(&self.config.modules_root(), name);
        let role = if rule.is_some() { "middleware" } else { "endpoint" };

        // 4. Publish atomically. A name never lives in both tables, so the
        // stale entry in the other table is evicted as well.
        let mut displaced: Vec<Module> = Vec::new();
        match rule {
            Some(rule) => {
                if let Some(old) = self.endpoints.write().remove(name) {
                    displaced.push(old);
                }
                let mut mws = self.middlewares.write();
                match mws.iter_mut().find(|mw| mw.module.name() == name) {
                    Some(slot) => {
                        let entry = MiddlewareModule {
                            module: module.clone(),
                            rule,
                        };
                        displaced.push(std::mem::replace(slot, entry).module);
                    }
                    None => mws.push(MiddlewareModule {
                        module: module.clone(),
                        rule,
                    }),
                }
            }
            None => {
                {
                    let mut mws = self.middlewares.write();
                    if let Some(pos) = mws.iter().position(|mw| mw.module.name() == name) {
                        displaced.push(mws.remove(pos).module);
                    }
                }
                if let Some(old) = self.endpoints.write().insert(name.to_string(), module) {
                    displaced.push(old);
                }
            }
        }
        tracing::info!(module = %name, role = %role, "module swapped");

        // 5. Drain then close the displaced instance outside the lock.
        // In-flight calls that captured it complete against it first.
        for old in displaced {
            old.drain(self.config.drain_timeout);
            old.close();
        }
        Ok(())
    }

    fn swap_from_path(&self, path: &Path) {
        let Some(name) = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .map(String::from)
        else {
            return;
        };
        match std::fs::read(path) {
            Ok(bytes) => match self.swap_blocking(&name, &bytes) {
                Ok(()) => tracing::info!(module = %name, "module loaded"),
                Err(e) => tracing::error!(module = %name, error = %e, "module load failed"),
            },
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "failed to read artifact")
            }
        }
    }

    /// Derives a module name from a guest source path shaped like
    /// `<modulesDir>/<name>/wasm/**`.
    fn derive_module_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(self.config.modules_root()).ok()?;
        let mut parts = rel.components();
        let name = parts.next()?.as_os_str().to_str()?.to_string();
        match parts.next() {
            Some(component) if component.as_os_str() == "wasm" => Some(name),
            _ => None,
        }
    }
}

enum DispatchError {
    UnknownModule,
    Module(ModuleError),
}

async fn dispatch_bare() -> Response {
    (StatusCode::BAD_REQUEST, "module name required").into_response()
}

async fn dispatch_named(
    State(shared): State<Arc<ServerShared>>,
    RoutePath(name): RoutePath<String>,
    method: Method,
    uri: Uri,
) -> Response {
    dispatch(shared, name, method, uri).await
}

async fn dispatch_nested(
    State(shared): State<Arc<ServerShared>>,
    RoutePath((name, _rest)): RoutePath<(String, String)>,
    method: Method,
    uri: Uri,
) -> Response {
    dispatch(shared, name, method, uri).await
}

async fn dispatch(shared: Arc<ServerShared>, name: String, method: Method, uri: Uri) -> Response {
    if name.is_empty() {
        return (StatusCode::BAD_REQUEST, "module name required").into_response();
    }
    let request = abi::encode_request(method.as_str(), uri.path());

    let result =
        tokio::task::spawn_blocking(move || dispatch_blocking(&shared, &name, &request)).await;

    match result {
        Ok(Ok(Some(body))) => (StatusCode::OK, body).into_response(),
        Ok(Ok(None)) => StatusCode::NO_CONTENT.into_response(),
        Ok(Err(DispatchError::UnknownModule)) => StatusCode::NOT_FOUND.into_response(),
        Ok(Err(DispatchError::Module(e))) => {
            tracing::error!(error = %e, "endpoint handler failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
        Err(join_err) => {
            tracing::error!(error = %join_err, "dispatch task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Runs the middleware pipeline, then the endpoint. Guest calls happen
/// without any table lock held; the snapshots keep displaced modules alive
/// until this request finishes with them.
fn dispatch_blocking(
    shared: &ServerShared,
    name: &str,
    request: &[u8],
) -> Result<Option<Vec<u8>>, DispatchError> {
    let pipeline = {
        let mws = shared.middlewares.read();
        apply_pipeline(name, &mws)
    };
    for mw in &pipeline {
        match mw.module.handle(request) {
            // Non-zero reply short-circuits the pipeline.
            Ok(Some(body)) => return Ok(Some(body)),
            Ok(None) => {}
            // A failing middleware is treated as pass-through.
            Err(e) => {
                tracing::warn!(middleware = %mw.module.name(), error = %e, "middleware failed, continuing")
            }
        }
    }

    let endpoint = shared.endpoints.read().get(name).cloned();
    let Some(endpoint) = endpoint else {
        return Err(DispatchError::UnknownModule);
    };
    match endpoint.handle(request) {
        // The endpoint was swapped out and closed between lookup and call;
        // its replacement serves this request.
        Err(ModuleError::Closed) => {
            let retry = shared.endpoints.read().get(name).cloned();
            let Some(retry) = retry else {
                return Err(DispatchError::UnknownModule);
            };
            retry.handle(request).map_err(DispatchError::Module)
        }
        other => other.map_err(DispatchError::Module),
    }
}
