//! Embedded middleware providing three concurrency primitives for a
//! cooperative-multitasking runtime: a priority thread pool, a publish/
//! subscribe event bus, and a best-fit memory-pool allocator with heap
//! fallback.
//!
//! All three are built against the [`sched`] adapter rather than directly
//! against `std`, so a target with its own mutex/queue/task primitives can
//! drop in a different backend without touching the subsystems above it.

pub mod assert_util;
pub mod config;
pub mod error;
pub mod event_id;
pub mod eventbus;
pub mod mempool;
pub mod sched;
pub mod threadpool;

pub use error::{Status, StatusResult};
pub use eventbus::{Callback, DeliveryMode, EventBus, SubscriberHandle};
pub use mempool::{GlobalStats, Health, MemPoolManager, PoolHandle, PoolInfo, PoolStats};
pub use threadpool::{PoolState, Priority, ThreadPool, ThreadPoolConfig};
