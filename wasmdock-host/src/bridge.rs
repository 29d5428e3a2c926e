//! Host functions exported to guests under the `env` namespace.
//!
//! The bridge owns the process-wide sinks (bus, WebSocket broadcast, log)
//! and registers thin marshalling shims into a wasmtime linker. All
//! arguments are offsets into the calling guest's linear memory; reads that
//! fall out of bounds drop the operation rather than trap the guest.

use std::sync::Arc;

use wasmtime::{Caller, Extern, Linker};

use crate::module::{ModuleError, StoreData};
use wasmdock_abi as abi;
use wasmdock_bus::{Bus, Message};

/// Process-wide sink for guest `log` calls. Must be thread-safe.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Process-wide sink for guest `ws_broadcast` calls. Must be thread-safe.
pub type BroadcastSink = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

/// Registers the fixed set of host-callable functions into guest instances.
#[derive(Clone)]
pub struct HostBridge {
    bus: Bus,
    ws_broadcast: BroadcastSink,
    logger: LogSink,
}

impl HostBridge {
    pub fn new(bus: Bus, ws_broadcast: BroadcastSink, logger: LogSink) -> Self {
        Self {
            bus,
            ws_broadcast,
            logger,
        }
    }

    /// Adds `publish`, `subscribe`, `ws_broadcast` and `log` to `linker`.
    pub fn register(&self, linker: &mut Linker<StoreData>) -> Result<(), ModuleError> {
        let bus = self.bus.clone();
        linker
            .func_wrap(
                abi::ENV_MODULE,
                abi::FN_PUBLISH,
                move |mut caller: Caller<'_, StoreData>,
                      topic_ptr: u32,
                      topic_len: u32,
                      payload_ptr: u32,
                      payload_len: u32| {
                    let Some(topic) = read_string(&mut caller, topic_ptr, topic_len) else {
                        return;
                    };
                    let Some(payload) = read_bytes(&mut caller, payload_ptr, payload_len) else {
                        return;
                    };
                    bus.publish(&topic, Message::new(payload));
                },
            )
            .map_err(ModuleError::Instantiate)?;

        let bus = self.bus.clone();
        linker
            .func_wrap(
                abi::ENV_MODULE,
                abi::FN_SUBSCRIBE,
                // handler_idx is reserved; dispatch targets the fixed
                // on_message export.
                move |mut caller: Caller<'_, StoreData>,
                      topic_ptr: u32,
                      topic_len: u32,
                      _handler_idx: u32| {
                    let Some(topic) = read_string(&mut caller, topic_ptr, topic_len) else {
                        return;
                    };
                    let Some(owner) = caller.data().module.upgrade() else {
                        tracing::error!("subscribe called without an owning module context");
                        return;
                    };
                    let weak = Arc::downgrade(&owner);
                    let sub = bus.subscribe(&topic, move |msg: Message| {
                        // The module may have been swapped out meanwhile;
                        // deliveries to a closed instance are dropped there.
                        if let Some(module) = weak.upgrade() {
                            module.deliver(&msg.payload);
                        }
                    });
                    tracing::debug!(module = %owner.name(), topic = %topic, "guest subscribed");
                    owner.push_cleanup(sub);
                },
            )
            .map_err(ModuleError::Instantiate)?;

        let ws_broadcast = self.ws_broadcast.clone();
        linker
            .func_wrap(
                abi::ENV_MODULE,
                abi::FN_WS_BROADCAST,
                move |mut caller: Caller<'_, StoreData>,
                      topic_ptr: u32,
                      topic_len: u32,
                      payload_ptr: u32,
                      payload_len: u32| {
                    let Some(topic) = read_string(&mut caller, topic_ptr, topic_len) else {
                        return;
                    };
                    let Some(payload) = read_bytes(&mut caller, payload_ptr, payload_len) else {
                        return;
                    };
                    ws_broadcast(&topic, &payload);
                },
            )
            .map_err(ModuleError::Instantiate)?;

        let logger = self.logger.clone();
        linker
            .func_wrap(
                abi::ENV_MODULE,
                abi::FN_LOG,
                move |mut caller: Caller<'_, StoreData>, msg_ptr: u32, msg_len: u32| {
                    let Some(msg) = read_string(&mut caller, msg_ptr, msg_len) else {
                        return;
                    };
                    logger(&format!("[guest] {msg}"));
                },
            )
            .map_err(ModuleError::Instantiate)?;

        Ok(())
    }
}

/// Copies `len` bytes at `ptr` out of the calling guest's memory. Returns
/// `None` when the guest exports no memory or the range is out of bounds.
fn read_bytes(caller: &mut Caller<'_, StoreData>, ptr: u32, len: u32) -> Option<Vec<u8>> {
    if len == 0 {
        return Some(Vec::new());
    }
    let Some(Extern::Memory(memory)) = caller.get_export(abi::EXPORT_MEMORY) else {
        return None;
    };
    let data = memory.data(&*caller);
    let start = ptr as usize;
    let end = start.checked_add(len as usize)?;
    if end > data.len() {
        return None;
    }
    Some(data[start..end].to_vec())
}

fn read_string(caller: &mut Caller<'_, StoreData>, ptr: u32, len: u32) -> Option<String> {
    String::from_utf8(read_bytes(caller, ptr, len)?).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleLoader;
    use std::sync::mpsc;
    use std::time::Duration;

    fn loader() -> ModuleLoader {
        ModuleLoader::new(1024 * 1024, None).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_publish_reaches_bus() {
        let bus = Bus::new();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let _sub = bus.subscribe("events", move |msg| {
            let _ = tx.send(msg.payload);
        });

        let bridge = HostBridge::new(bus, Arc::new(|_, _| {}), Arc::new(|_| {}));
        let module = loader()
            .load(
                "sender",
                br#"(module
                      (import "env" "publish" (func $publish (param i32 i32 i32 i32)))
                      (memory (export "memory") 1)
                      (data (i32.const 0) "events")
                      (data (i32.const 16) "payload")
                      (func (export "init")
                        (call $publish (i32.const 0) (i32.const 6) (i32.const 16) (i32.const 7))))"#,
                &bridge,
            )
            .unwrap();
        module.init().unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), b"payload");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_ws_broadcast_hits_sink() {
        let (tx, rx) = mpsc::channel::<(String, Vec<u8>)>();
        let ws: BroadcastSink = Arc::new(move |topic, payload| {
            let _ = tx.send((topic.to_string(), payload.to_vec()));
        });
        let bridge = HostBridge::new(Bus::new(), ws, Arc::new(|_| {}));
        let module = loader()
            .load(
                "caster",
                br#"(module
                      (import "env" "ws_broadcast" (func $ws_broadcast (param i32 i32 i32 i32)))
                      (memory (export "memory") 1)
                      (data (i32.const 0) "ws-topic")
                      (data (i32.const 16) "ws-payload")
                      (func (export "init")
                        (call $ws_broadcast (i32.const 0) (i32.const 8) (i32.const 16) (i32.const 10))))"#,
                &bridge,
            )
            .unwrap();
        module.init().unwrap();

        let (topic, payload) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(topic, "ws-topic");
        assert_eq!(payload, b"ws-payload");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_guest_log_is_prefixed() {
        let (tx, rx) = mpsc::channel::<String>();
        let logger: LogSink = Arc::new(move |line| {
            let _ = tx.send(line.to_string());
        });
        let bridge = HostBridge::new(Bus::new(), Arc::new(|_, _| {}), logger);
        let module = loader()
            .load(
                "chatty",
                br#"(module
                      (import "env" "log" (func $log (param i32 i32)))
                      (memory (export "memory") 1)
                      (data (i32.const 0) "log-msg")
                      (func (export "init") (call $log (i32.const 0) (i32.const 7))))"#,
                &bridge,
            )
            .unwrap();
        module.init().unwrap();

        assert_eq!(
            rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            "[guest] log-msg"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_out_of_bounds_read_drops_operation() {
        let bus = Bus::new();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let _sub = bus.subscribe("events", move |msg| {
            let _ = tx.send(msg.payload);
        });

        let bridge = HostBridge::new(bus, Arc::new(|_, _| {}), Arc::new(|_| {}));
        // topic_ptr points far beyond the single memory page.
        let module = loader()
            .load(
                "wild",
                br#"(module
                      (import "env" "publish" (func $publish (param i32 i32 i32 i32)))
                      (memory (export "memory") 1)
                      (func (export "init")
                        (call $publish (i32.const 1000000) (i32.const 6) (i32.const 0) (i32.const 4))))"#,
                &bridge,
            )
            .unwrap();
        // The publish is dropped; init itself succeeds.
        module.init().unwrap();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
    }
}
