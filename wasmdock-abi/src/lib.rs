//! wasmdock-abi: The contract between the wasmdock host and guest modules.
//!
//! This crate defines the names and wire conventions shared by the host
//! runtime and the guest SDK. It carries no behavior beyond encoding and
//! decoding the dispatch request blob.
//!
//! # Imports (provided by the host under the `env` namespace)
//!
//! | Name | Signature (all `u32`, offsets into guest linear memory) |
//! |------|---------------------------------------------------------|
//! | `publish` | `(topic_ptr, topic_len, payload_ptr, payload_len)` |
//! | `subscribe` | `(topic_ptr, topic_len, handler_idx)` |
//! | `ws_broadcast` | `(topic_ptr, topic_len, payload_ptr, payload_len)` |
//! | `log` | `(msg_ptr, msg_len)` |
//!
//! The `handler_idx` argument of `subscribe` is accepted but reserved;
//! message dispatch always targets the fixed `on_message` export.
//!
//! # Exports (resolved by the host, all optional)
//!
//! - `init() -> ()`: called once after instantiation.
//! - `drain() -> u32`: graceful quiescence; returns a sleep hint in
//!   milliseconds, `0` means drained.
//! - `handle(ptr: u32, len: u32) -> u32`: request dispatch; returns a
//!   pointer to a NUL-terminated response in guest memory, `0` means
//!   pass-through.
//! - `on_message(ptr: u32, len: u32) -> ()`: bus message delivery.
//! - `malloc(size: u32) -> u32`: guest allocator, required for any module
//!   that receives host-allocated buffers (subscribers and dispatch targets).
//! - `memory`: the linear memory itself.
//!
//! # Wire conventions
//!
//! Requests are plain bytes `"<METHOD>\n<PATH>\n"` with no framing. Responses
//! are NUL-terminated byte sequences in guest memory, read by the host up to
//! [`MAX_RESPONSE_BYTES`] or the end of linear memory, whichever comes first.
//! Buffers written through a guest's `malloc` are owned by the guest after
//! the call returns; the host never reclaims them.

/// Namespace the host functions are linked under.
pub const ENV_MODULE: &str = "env";

pub const FN_PUBLISH: &str = "publish";
pub const FN_SUBSCRIBE: &str = "subscribe";
pub const FN_WS_BROADCAST: &str = "ws_broadcast";
pub const FN_LOG: &str = "log";

pub const EXPORT_MEMORY: &str = "memory";
pub const EXPORT_INIT: &str = "init";
pub const EXPORT_DRAIN: &str = "drain";
pub const EXPORT_HANDLE: &str = "handle";
pub const EXPORT_ON_MESSAGE: &str = "on_message";
pub const EXPORT_MALLOC: &str = "malloc";

/// Upper bound on a dispatch response read from guest memory.
pub const MAX_RESPONSE_BYTES: usize = 64 * 1024;

/// Encodes a dispatch request as the `"<METHOD>\n<PATH>\n"` blob.
pub fn encode_request(method: &str, path: &str) -> Vec<u8> {
    let mut blob = Vec::with_capacity(method.len() + path.len() + 2);
    blob.extend_from_slice(method.as_bytes());
    blob.push(b'\n');
    blob.extend_from_slice(path.as_bytes());
    blob.push(b'\n');
    blob
}

/// A decoded dispatch request, borrowing from the request blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Request<'a> {
    pub method: &'a str,
    pub path: &'a str,
}

impl<'a> Request<'a> {
    /// Decodes a request blob. Returns `None` if either line is missing or
    /// not UTF-8. An empty blob (a host without the request payload passes
    /// `ptr = 0`) decodes to `None` as well.
    pub fn parse(blob: &'a [u8]) -> Option<Self> {
        let text = std::str::from_utf8(blob).ok()?;
        let mut lines = text.split('\n');
        let method = lines.next()?;
        let path = lines.next()?;
        if method.is_empty() || path.is_empty() {
            return None;
        }
        Some(Self { method, path })
    }
}
