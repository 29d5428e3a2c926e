//! Bridges the `events` bus topic to WebSocket clients.

use wasmdock_guest_sdk::prelude::*;

struct Receiver;

impl GuestModule for Receiver {
    fn init() {
        host::subscribe("events");
        host::log("receiver subscribed to events");
    }

    fn on_message(payload: &[u8]) {
        host::ws_broadcast("events", payload);
    }
}

export_module!(Receiver);
