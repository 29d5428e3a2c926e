//! wasmdock-guest-sdk: SDK for writing wasmdock guest modules.
//!
//! Provides safe wrappers over the host's `env` imports and a macro that
//! generates the well-known exports from a plain type.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use wasmdock_guest_sdk::prelude::*;
//!
//! struct Users;
//!
//! impl GuestModule for Users {
//!     fn init() {
//!         host::subscribe("user-events");
//!         host::log("users module ready");
//!     }
//!
//!     fn handle(req: Request) -> u32 {
//!         memory::reply(format!("users: {} {}", req.method, req.path).as_bytes())
//!     }
//!
//!     fn on_message(payload: &[u8]) {
//!         host::ws_broadcast("user-events", payload);
//!     }
//! }
//!
//! export_module!(Users);
//! ```
//!
//! Build with:
//!
//! ```bash
//! cargo build --release --target wasm32-unknown-unknown
//! ```
//!
//! and drop the artifact into the host's output directory.

pub use wasmdock_abi as abi;
pub use wasmdock_abi::Request;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::{export_module, host, memory, GuestModule, Request};
}

/// Trait guest modules implement. Every method is optional; the macro wires
/// the defaults into no-op exports the host treats as "not capable of that
/// role".
pub trait GuestModule {
    /// Called once after the module is instantiated.
    fn init() {}

    /// Graceful quiescence: return a sleep hint in milliseconds, or 0 once
    /// drained.
    fn drain() -> u32 {
        0
    }

    /// Request dispatch. Return [`memory::reply`] with a body, or
    /// [`memory::PASS_THROUGH`] to defer to the next stage.
    fn handle(_req: Request<'_>) -> u32 {
        memory::PASS_THROUGH
    }

    /// Bus message delivery.
    fn on_message(_payload: &[u8]) {}
}

/// Safe wrappers over the host's `env` imports.
pub mod host {
    #[cfg(target_arch = "wasm32")]
    mod sys {
        extern "C" {
            pub fn publish(topic_ptr: u32, topic_len: u32, payload_ptr: u32, payload_len: u32);
            pub fn subscribe(topic_ptr: u32, topic_len: u32, handler_idx: u32);
            pub fn ws_broadcast(topic_ptr: u32, topic_len: u32, payload_ptr: u32, payload_len: u32);
            pub fn log(msg_ptr: u32, msg_len: u32);
        }
    }

    // Native stubs so the crate and downstream tests build on the host
    // target; the real imports only exist inside the sandbox.
    #[cfg(not(target_arch = "wasm32"))]
    mod sys {
        pub unsafe fn publish(_: u32, _: u32, _: u32, _: u32) {}
        pub unsafe fn subscribe(_: u32, _: u32, _: u32) {}
        pub unsafe fn ws_broadcast(_: u32, _: u32, _: u32, _: u32) {}
        pub unsafe fn log(_: u32, _: u32) {}
    }

    /// Publishes `payload` on the host bus.
    pub fn publish(topic: &str, payload: &[u8]) {
        unsafe {
            sys::publish(
                topic.as_ptr() as u32,
                topic.len() as u32,
                payload.as_ptr() as u32,
                payload.len() as u32,
            )
        }
    }

    /// Subscribes this module to `topic`; messages arrive via the exported
    /// `on_message`.
    pub fn subscribe(topic: &str) {
        unsafe { sys::subscribe(topic.as_ptr() as u32, topic.len() as u32, 0) }
    }

    /// Fans `payload` out to WebSocket clients attached to `topic`.
    pub fn ws_broadcast(topic: &str, payload: &[u8]) {
        unsafe {
            sys::ws_broadcast(
                topic.as_ptr() as u32,
                topic.len() as u32,
                payload.as_ptr() as u32,
                payload.len() as u32,
            )
        }
    }

    /// Sends a line to the host's log sink.
    pub fn log(msg: &str) {
        unsafe { sys::log(msg.as_ptr() as u32, msg.len() as u32) }
    }
}

/// Memory helpers for the host/guest exchange discipline.
pub mod memory {
    use std::alloc::{alloc, Layout};

    /// Return value of `handle` meaning "defer to the next stage".
    pub const PASS_THROUGH: u32 = 0;

    /// Backs the `malloc` export: allocates `size` writable bytes in linear
    /// memory for the host to fill. Returns 0 for a zero-size request.
    pub fn guest_alloc(size: u32) -> u32 {
        if size == 0 {
            return 0;
        }
        let Ok(layout) = Layout::from_size_align(size as usize, 1) else {
            return 0;
        };
        unsafe { alloc(layout) as u32 }
    }

    /// Builds a NUL-terminated reply and hands it to the host reader. The
    /// buffer is intentionally leaked: the host reads it after `handle`
    /// returns and never reclaims guest memory.
    pub fn reply(body: &[u8]) -> u32 {
        let mut buf = Vec::with_capacity(body.len() + 1);
        buf.extend_from_slice(body);
        buf.push(0);
        let ptr = buf.as_ptr() as u32;
        std::mem::forget(buf);
        ptr
    }

    /// Reclaims a host-delivered buffer (request blob or bus payload).
    ///
    /// # Safety
    ///
    /// `ptr`/`len` must come from the host delivery path, i.e. a buffer the
    /// host obtained from this module's `malloc`, and must not be taken
    /// twice.
    pub unsafe fn take_buffer(ptr: u32, len: u32) -> Vec<u8> {
        if ptr == 0 || len == 0 {
            return Vec::new();
        }
        Vec::from_raw_parts(ptr as *mut u8, len as usize, len as usize)
    }
}

/// Generates the well-known exports (`init`, `drain`, `handle`,
/// `on_message`, `malloc`) from a [`GuestModule`] implementation.
#[macro_export]
macro_rules! export_module {
    ($module:ty) => {
        #[no_mangle]
        pub extern "C" fn init() {
            <$module as $crate::GuestModule>::init();
        }

        #[no_mangle]
        pub extern "C" fn drain() -> u32 {
            <$module as $crate::GuestModule>::drain()
        }

        #[no_mangle]
        pub extern "C" fn handle(ptr: u32, len: u32) -> u32 {
            let blob = unsafe { $crate::memory::take_buffer(ptr, len) };
            let req = $crate::Request::parse(&blob).unwrap_or_default();
            <$module as $crate::GuestModule>::handle(req)
        }

        #[no_mangle]
        pub extern "C" fn on_message(ptr: u32, len: u32) {
            let payload = unsafe { $crate::memory::take_buffer(ptr, len) };
            <$module as $crate::GuestModule>::on_message(&payload);
        }

        #[no_mangle]
        pub extern "C" fn malloc(size: u32) -> u32 {
            $crate::memory::guest_alloc(size)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guest_alloc_zero_returns_null() {
        assert_eq!(memory::guest_alloc(0), 0);
    }

    #[test]
    fn test_take_buffer_null_is_empty() {
        assert_eq!(unsafe { memory::take_buffer(0, 16) }, Vec::<u8>::new());
    }

    // Note: the pointer round trips (reply, take_buffer on a live buffer)
    // only make sense inside 32-bit linear memory; they are exercised by the
    // host crate's integration tests against real wasm guests.

    #[test]
    fn test_default_module_passes_through() {
        struct Quiet;
        impl GuestModule for Quiet {}

        assert_eq!(Quiet::drain(), 0);
        assert_eq!(Quiet::handle(Request::default()), memory::PASS_THROUGH);
    }
}
