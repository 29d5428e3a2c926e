//! Endpoint serving `GET|POST /m/users`.

use wasmdock_guest_sdk::prelude::*;

struct Users;

impl GuestModule for Users {
    fn handle(req: Request<'_>) -> u32 {
        memory::reply(format!("users: {} {}", req.method, req.path).as_bytes())
    }
}

export_module!(Users);
