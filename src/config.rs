//! Compile-time configuration surface.
//!
//! Every bound in this module is a `const`; there is no runtime
//! configuration file and no CLI. A user building against this crate for a
//! different footprint overrides these by forking the constants (a real
//! microcontroller target would instead gate them behind Cargo features),
//! not by passing values at runtime.

/// Subscriber table capacity. Bound 4-64, default 32.
pub const MAX_SUBSCRIBERS: usize = 32;

/// Worker thread bound for the thread pool. Bound 1-16.
pub const THREADPOOL_MAX_THREADS: usize = 16;

/// Default worker count used by `ThreadPoolConfig::default()`.
pub const THREADPOOL_DEFAULT_THREAD_COUNT: usize = 4;

/// Default per-queue capacity (the `Normal` queue doubles this).
pub const THREADPOOL_DEFAULT_QUEUE_SIZE: usize = 32;

/// Default worker stack size hint (informational on the std backend).
pub const THREADPOOL_DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Maximum number of live memory pools.
pub const MEMPOOL_MAX_POOLS: usize = 8;

/// Maximum block size a pool (or `alloc`) may be created/requested for.
pub const MEMPOOL_MAX_SIZE: usize = 2048;

/// Maximum blocks a single pool may hold; bounds the two 32-bit free masks.
pub const MEMPOOL_MAX_BLOCK_COUNT: usize = 64;

/// In-memory ring capacity for any diagnostic log buffer a caller wires up.
pub const LOG_BUFFER_SIZE: usize = 256;

const _: () = assert!(MAX_SUBSCRIBERS >= 4 && MAX_SUBSCRIBERS <= 64);
const _: () = assert!(THREADPOOL_MAX_THREADS >= 1 && THREADPOOL_MAX_THREADS <= 16);
const _: () = assert!(
    THREADPOOL_DEFAULT_THREAD_COUNT >= 1 && THREADPOOL_DEFAULT_THREAD_COUNT <= THREADPOOL_MAX_THREADS
);
const _: () = assert!(THREADPOOL_DEFAULT_QUEUE_SIZE > 0);
const _: () = assert!(MEMPOOL_MAX_POOLS > 0);
const _: () = assert!(MEMPOOL_MAX_SIZE > 0);
const _: () = assert!(MEMPOOL_MAX_BLOCK_COUNT > 0 && MEMPOOL_MAX_BLOCK_COUNT <= 64);
