//! wasmdock-host: a dynamic WebAssembly module host.
//!
//! A long-running process that loads, hot-swaps and drains sandboxed WASM
//! modules while keeping external traffic flowing: HTTP dispatch, pub/sub
//! messaging and WebSocket fan-out all survive a reload.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  HostServer                                                 │
//! │  ├─ module tables (endpoints + middlewares)                 │
//! │  ├─ swap protocol: load → init → publish → drain old        │
//! │  └─ /m/{name} dispatch through the middleware pipeline      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  WsRelay                  │  ArtifactWatcher                │
//! │  └─ /ws?topic=<t> fan-out │  └─ hot reload on .wasm writes  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  HostBridge (env: publish, subscribe, ws_broadcast, log)    │
//! │  └─ wasmdock-bus fan-out, guest malloc delivery discipline  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Module / ModuleLoader                                      │
//! │  └─ wasmtime + WASI p1, per-module store, drain/close       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick start
//!
//! ```rust,ignore
//! use wasmdock_host::{HostConfig, HostServer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = HostServer::new(HostConfig::default())?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! Modules land in the host by dropping `<name>.wasm` into the artifact
//! directory (or by calling [`HostServer::swap`] directly). A module whose
//! source directory carries a `rule.txt` becomes a middleware and runs ahead
//! of matching endpoints; everything else serves `GET|POST /m/<name>`.

pub mod bridge;
pub mod builder;
pub mod config;
pub mod middleware;
pub mod module;
pub mod relay;
pub mod server;
pub mod watcher;

pub use bridge::{BroadcastSink, HostBridge, LogSink};
pub use builder::{BuildError, BuilderConfig, GuestBuilder};
pub use config::HostConfig;
pub use middleware::{apply_pipeline, parse_rule, MiddlewareModule, Rule};
pub use module::{Module, ModuleError, ModuleLoader};
pub use relay::WsRelay;
pub use server::{HostServer, HostServerBuilder, ServerError};
pub use watcher::{ArtifactWatcher, WatcherError};

pub use wasmdock_abi as abi;
pub use wasmdock_abi::MAX_RESPONSE_BYTES;
pub use wasmdock_bus::{Bus, Message, Subscription};
