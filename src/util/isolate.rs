use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::warn;

pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "panic with non-string payload".to_string()
}

/// Runs `f`, converting a panic into an `Err` with the panic message.
///
/// Callers must not hold any `RefCell` borrows of protocol state across this call: the code
///  inside `f` is foreign (application callbacks, continuations) and a panic must leave the
///  state consistent.
pub fn catch_panic<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f))
        .map_err(|payload| panic_message(payload.as_ref()))
}

/// Invokes an application callback, logging and swallowing any panic it raises.
pub fn isolated(what: &str, f: impl FnOnce()) {
    if let Err(msg) = catch_panic(f) {
        warn!("{} panicked: {} - ignoring", what, msg);
    }
}
