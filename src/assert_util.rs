//! Status/assertion surface with three tiers:
//! - compile-time assertions: plain `const { assert!(...) }` in `config.rs`.
//! - debug assertions (`debug_verify!`): invoke a user-installable handler,
//!   then behave like `debug_assert!` (compiled out in release).
//! - always-on verify assertions (`verify!`): never compiled out.

use core::sync::atomic::{AtomicPtr, Ordering};

/// Signature of a user-installable debug-assertion handler.
pub type AssertHandler = fn(message: &str, file: &str, line: u32);

static HANDLER: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

/// Install a handler invoked by `debug_verify!` before the default halt
/// behavior runs. Passing `None` removes it.
pub fn set_assert_handler(handler: Option<AssertHandler>) {
    let ptr = match handler {
        Some(f) => f as *mut (),
        None => core::ptr::null_mut(),
    };
    HANDLER.store(ptr, Ordering::SeqCst);
}

#[doc(hidden)]
pub fn dispatch_assert_failure(message: &str, file: &str, line: u32) {
    let ptr = HANDLER.load(Ordering::SeqCst);
    if !ptr.is_null() {
        let handler: AssertHandler = unsafe { core::mem::transmute(ptr) };
        handler(message, file, line);
    }
}

/// Always-on assertion that can never be compiled out, for invariants whose
/// violation must never ship silently (e.g. free-mask/used-count
/// consistency).
#[macro_export]
macro_rules! verify {
    ($cond:expr $(, $msg:expr)?) => {
        if !($cond) {
            $crate::assert_util::dispatch_assert_failure(
                concat!("verify failed: ", stringify!($cond) $(, ": ", $msg)?),
                file!(),
                line!(),
            );
            panic!(concat!("verify failed: ", stringify!($cond)));
        }
    };
}

/// Debug-only assertion that first notifies the installed handler, then
/// defers to `debug_assert!`. Compiled out entirely in release builds.
#[macro_export]
macro_rules! debug_verify {
    ($cond:expr $(, $msg:expr)?) => {
        if cfg!(debug_assertions) && !($cond) {
            $crate::assert_util::dispatch_assert_failure(
                concat!("debug_verify failed: ", stringify!($cond) $(, ": ", $msg)?),
                file!(),
                line!(),
            );
        }
        debug_assert!($cond $(, $msg)?);
    };
}
