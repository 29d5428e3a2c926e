//! Publishes a greeting on the `events` topic every time it is (re)loaded.

use wasmdock_guest_sdk::prelude::*;

struct Sender;

impl GuestModule for Sender {
    fn init() {
        host::publish("events", b"hello from sender");
        host::log("sender initialized");
    }
}

export_module!(Sender);
