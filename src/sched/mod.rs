//! Scheduler adapter.
//!
//! The three subsystems (memory pool, thread pool, event bus) are written
//! entirely against this module's uniform wrapping of mutexes, queues, tasks
//! and sleep — never against `std` directly — so that a bare-metal target
//! could drop in a different adapter backed by an RTOS without touching the
//! subsystems. `cframework-core` ships exactly one adapter, [`std_backend`],
//! built on `std::sync` and `std::thread`.
//!
//! Timeout convention: [`WAIT_FOREVER`] blocks indefinitely, [`NO_WAIT`]
//! never blocks.

pub mod std_backend;

pub use std_backend::{Mutex, MutexGuard, Queue, Task};

/// Block indefinitely.
pub const WAIT_FOREVER: u32 = u32::MAX;
/// Never block; fail immediately if the operation cannot complete.
pub const NO_WAIT: u32 = 0;
