//! Middleware that blocks admin paths and passes everything else through.
//!
//! Classify it with a `rule.txt` (for example `users,accounts`) in its
//! module source directory.

use wasmdock_guest_sdk::prelude::*;

struct AuthGuard;

impl GuestModule for AuthGuard {
    fn handle(req: Request<'_>) -> u32 {
        if req.path.contains("/admin") {
            host::log("auth-guard: rejected admin path");
            return memory::reply(b"forbidden");
        }
        memory::PASS_THROUGH
    }
}

export_module!(AuthGuard);
