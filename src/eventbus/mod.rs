//! Event Bus: publish/subscribe over a flat subscriber table, delivered
//! synchronously in-place or asynchronously via the [`crate::threadpool`],
//! using the [`crate::mempool`] to avoid general-purpose allocation on the
//! publish path when a pool is configured.

use crate::config::MAX_SUBSCRIBERS;
use crate::error::Status;
use crate::mempool::MemPoolManager;
use crate::sched;
use crate::threadpool::{Priority, ThreadPool};
use log::{trace, warn};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Sync: callback runs on the publisher's thread, inside the bus lock.
/// Async: callback runs on a thread-pool worker after the publish call
/// returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMode {
    Sync,
    Async,
}

pub type Callback = Arc<dyn Fn(u32, Option<&[u8]>) + Send + Sync + 'static>;

/// Opaque, stable identifier for a subscription, modeled as a validated
/// index into the fixed subscriber table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberHandle(usize);

struct SubscriberSlot {
    event_id: u32,
    mode: DeliveryMode,
    callback: Callback,
}

thread_local! {
    static PUBLISHING: Cell<bool> = Cell::new(false);
}

struct ReentrancyGuard;
impl Drop for ReentrancyGuard {
    fn drop(&mut self) {
        PUBLISHING.with(|p| p.set(false));
    }
}

/// Payload copy handed to an async dispatch closure. Prefers a
/// memory-pool-backed block, falls back to a plain heap `Vec`.
enum PayloadCopy {
    None,
    Pooled {
        mgr: Arc<MemPoolManager>,
        ptr: *mut u8,
        len: usize,
    },
    Heap(Vec<u8>),
}

// Safety: the buffer behind `Pooled`/`Heap` is exclusively owned by this
// value, exactly like a `Box<[u8]>`.
unsafe impl Send for PayloadCopy {}

impl PayloadCopy {
    /// Copies `data` preferring a memory-pool block; always succeeds (the
    /// host-heap fallback only aborts the process on exhaustion, same as
    /// everywhere else in this crate).
    fn new(mempool: Option<&Arc<MemPoolManager>>, data: Option<&[u8]>) -> Self {
        let data = match data {
            None => return PayloadCopy::None,
            Some(d) if d.is_empty() => return PayloadCopy::Heap(Vec::new()),
            Some(d) => d,
        };

        if let Some(mgr) = mempool {
            if let Some(ptr) = mgr.alloc(data.len()) {
                unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len()) };
                return PayloadCopy::Pooled {
                    mgr: mgr.clone(),
                    ptr,
                    len: data.len(),
                };
            }
        }

        PayloadCopy::Heap(data.to_vec())
    }

    fn as_slice(&self) -> Option<&[u8]> {
        match self {
            PayloadCopy::None => None,
            PayloadCopy::Heap(v) => Some(v.as_slice()),
            PayloadCopy::Pooled { ptr, len, .. } => {
                Some(unsafe { core::slice::from_raw_parts(*ptr, *len) })
            }
        }
    }
}

impl Drop for PayloadCopy {
    fn drop(&mut self) {
        if let PayloadCopy::Pooled { mgr, ptr, .. } = self {
            mgr.free(*ptr);
        }
    }
}

struct BusTable {
    slots: [Option<SubscriberSlot>; MAX_SUBSCRIBERS],
    active_count: usize,
}

impl BusTable {
    fn new() -> Self {
        Self {
            slots: Default::default(),
            active_count: 0,
        }
    }
}

/// Publish/subscribe bus, constructed as an owner-root instance rather
/// than a literal global so it can be shared via `Arc` alongside the
/// thread pool it dispatches onto.
pub struct EventBus {
    initialized: AtomicBool,
    table: sched::Mutex<BusTable>,
    total_published: AtomicU64,
    dropped_deliveries: AtomicU64,
    thread_pool: Arc<ThreadPool>,
    mempool: Option<Arc<MemPoolManager>>,
}

impl EventBus {
    /// `mempool` is consulted first for async payload copies when
    /// present; the host heap is always the fallback.
    pub fn new(thread_pool: Arc<ThreadPool>, mempool: Option<Arc<MemPoolManager>>) -> Self {
        Self {
            initialized: AtomicBool::new(false),
            table: sched::Mutex::new(BusTable::new()),
            total_published: AtomicU64::new(0),
            dropped_deliveries: AtomicU64::new(0),
            thread_pool,
            mempool,
        }
    }

    pub fn init(&self) -> Status {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Status::AlreadyInitialized;
        }
        if let Ok(mut t) = self.table.lock(sched::WAIT_FOREVER) {
            *t = BusTable::new();
        }
        Status::Ok
    }

    pub fn deinit(&self) {
        self.initialized.store(false, Ordering::Release);
        if let Ok(mut t) = self.table.lock(sched::WAIT_FOREVER) {
            *t = BusTable::new();
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Subscribe to `event_id` (0 subscribes to every event: the
    /// wildcard).
    pub fn subscribe<F>(
        &self,
        event_id: u32,
        mode: DeliveryMode,
        callback: F,
    ) -> Result<SubscriberHandle, Status>
    where
        F: Fn(u32, Option<&[u8]>) + Send + Sync + 'static,
    {
        if !self.is_initialized() {
            return Err(Status::NotInitialized);
        }
        let mut table = self.table.lock(sched::WAIT_FOREVER).map_err(|_| Status::MutexError)?;
        let slot_idx = table.slots.iter().position(|s| s.is_none());
        match slot_idx {
            Some(idx) => {
                table.slots[idx] = Some(SubscriberSlot {
                    event_id,
                    mode,
                    callback: Arc::new(callback),
                });
                table.active_count += 1;
                Ok(SubscriberHandle(idx))
            }
            None => Err(Status::NoMemory),
        }
    }

    pub fn unsubscribe(&self, handle: SubscriberHandle) -> Status {
        if handle.0 >= MAX_SUBSCRIBERS {
            return Status::InvalidParam;
        }
        let mut table = match self.table.lock(sched::WAIT_FOREVER) {
            Ok(t) => t,
            Err(_) => return Status::MutexError,
        };
        match table.slots[handle.0].take() {
            Some(_) => {
                table.active_count -= 1;
                Status::Ok
            }
            None => Status::InvalidState,
        }
    }

    /// Deactivate every subscriber whose event id matches `event_id`
    /// exactly (wildcard slots are only affected when `event_id == 0`).
    /// Returns the number deactivated.
    pub fn unsubscribe_all(&self, event_id: u32) -> u32 {
        let mut table = match self.table.lock(sched::WAIT_FOREVER) {
            Ok(t) => t,
            Err(_) => return 0,
        };
        let mut count = 0u32;
        for slot in table.slots.iter_mut() {
            if matches!(slot, Some(s) if s.event_id == event_id) {
                *slot = None;
                count += 1;
            }
        }
        table.active_count -= count as usize;
        count
    }

    pub fn subscriber_count(&self) -> u32 {
        self.table
            .lock(sched::WAIT_FOREVER)
            .map(|t| t.active_count as u32)
            .unwrap_or(0)
    }

    pub fn event_subscriber_count(&self, event_id: u32) -> u32 {
        self.table
            .lock(sched::WAIT_FOREVER)
            .map(|t| {
                t.slots
                    .iter()
                    .flatten()
                    .filter(|s| s.event_id == event_id || s.event_id == 0)
                    .count() as u32
            })
            .unwrap_or(0)
    }

    pub fn total_published(&self) -> u64 {
        self.total_published.load(Ordering::Relaxed)
    }

    /// Deliveries silently dropped because a dispatch-record allocation or
    /// thread-pool enqueue failed, surfaced as a monotonic counter.
    pub fn dropped_deliveries(&self) -> u64 {
        self.dropped_deliveries.load(Ordering::Relaxed)
    }

    pub fn publish(&self, event_id: u32) -> Status {
        self.publish_internal(event_id, None)
    }

    pub fn publish_data(&self, event_id: u32, data: &[u8]) -> Status {
        self.publish_internal(event_id, Some(data))
    }

    /// Raw-pointer entry point that can represent `data == null, size > 0`
    /// as a `NullPointer` error, a case the safe slice-based API can't
    /// express; prefer [`Self::publish`]/[`Self::publish_data`] otherwise.
    ///
    /// # Safety
    /// `data` must be valid for `size` bytes when non-null.
    pub unsafe fn publish_data_raw(&self, event_id: u32, data: *const u8, size: usize) -> Status {
        if size > 0 && data.is_null() {
            return Status::NullPointer;
        }
        let slice = if size == 0 {
            &[][..]
        } else {
            core::slice::from_raw_parts(data, size)
        };
        self.publish_internal(event_id, Some(slice))
    }

    fn publish_internal(&self, event_id: u32, payload: Option<&[u8]>) -> Status {
        if !self.is_initialized() {
            return Status::NotInitialized;
        }
        if PUBLISHING.with(|p| p.get()) {
            // The bus mutex is not reentrant; a sync callback that
            // publishes again fails fast instead of deadlocking.
            return Status::Busy;
        }
        PUBLISHING.with(|p| p.set(true));
        let _guard = ReentrancyGuard;
        self.publish_locked(event_id, payload)
    }

    fn publish_locked(&self, event_id: u32, payload: Option<&[u8]>) -> Status {
        let table = match self.table.lock(sched::WAIT_FOREVER) {
            Ok(t) => t,
            Err(_) => return Status::MutexError,
        };
        self.total_published.fetch_add(1, Ordering::Relaxed);

        for slot in table.slots.iter().flatten() {
            if slot.event_id != event_id && slot.event_id != 0 {
                continue;
            }
            match slot.mode {
                DeliveryMode::Sync => {
                    (slot.callback)(event_id, payload);
                }
                DeliveryMode::Async => {
                    self.dispatch_async(event_id, payload, slot.callback.clone());
                }
            }
        }
        Status::Ok
    }

    fn dispatch_async(&self, event_id: u32, payload: Option<&[u8]>, callback: Callback) {
        let copy = PayloadCopy::new(self.mempool.as_ref(), payload);

        let status = self.thread_pool.submit(
            move || {
                let data = copy.as_slice();
                callback(event_id, data);
            },
            Priority::Normal,
            100,
        );

        if status != Status::Ok {
            warn!("eventbus: dropped async delivery of {event_id:#x}, submit failed: {status}");
            self.dropped_deliveries.fetch_add(1, Ordering::Relaxed);
        } else {
            trace!("eventbus: dispatched async delivery of {event_id:#x}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::threadpool::ThreadPoolConfig;
    use std::sync::mpsc;
    use std::time::Duration;

    fn bus() -> EventBus {
        let pool = Arc::new(ThreadPool::new().unwrap());
        let bus = EventBus::new(pool, None);
        assert_eq!(bus.init(), Status::Ok);
        bus
    }

    #[test]
    fn wildcard_subscriber_sees_every_event_in_order() {
        let bus = bus();
        let (tx, rx) = mpsc::channel();
        bus.subscribe(0, DeliveryMode::Sync, move |id, _| tx.send(id).unwrap())
            .unwrap();

        assert_eq!(bus.publish(0xAAAA_0001), Status::Ok);
        assert_eq!(bus.publish(0xBBBB_0002), Status::Ok);

        assert_eq!(rx.recv().unwrap(), 0xAAAA_0001);
        assert_eq!(rx.recv().unwrap(), 0xBBBB_0002);
    }

    #[test]
    fn async_roundtrip_delivers_every_payload() {
        let pool = Arc::new(
            ThreadPool::with_config(ThreadPoolConfig {
                thread_count: 4,
                ..Default::default()
            })
            .unwrap(),
        );
        let bus = EventBus::new(pool.clone(), None);
        bus.init();

        let (tx, rx) = mpsc::channel();
        bus.subscribe(0x1000_0001, DeliveryMode::Async, move |_, data| {
            tx.send(data.unwrap()[0]).unwrap()
        })
        .unwrap();

        for i in 1u8..=8 {
            assert_eq!(bus.publish_data(0x1000_0001, &[i]), Status::Ok);
        }
        assert_eq!(pool.wait_idle(500), Status::Ok);

        let mut got: Vec<u8> = (0..8).map(|_| rx.recv_timeout(Duration::from_secs(1)).unwrap()).collect();
        got.sort_unstable();
        assert_eq!(got, (1u8..=8).collect::<Vec<_>>());
    }

    #[test]
    fn publish_data_raw_rejects_null_with_nonzero_size() {
        let bus = bus();
        let status = unsafe { bus.publish_data_raw(1, core::ptr::null(), 4) };
        assert_eq!(status, Status::NullPointer);
    }

    #[test]
    fn publish_data_raw_allows_zero_length_payload() {
        let bus = bus();
        let (tx, rx) = mpsc::channel();
        bus.subscribe(7, DeliveryMode::Sync, move |_, data| {
            tx.send(data.map(|d| d.len())).unwrap()
        })
        .unwrap();
        let status = unsafe { bus.publish_data_raw(7, core::ptr::null(), 0) };
        assert_eq!(status, Status::Ok);
        assert_eq!(rx.recv().unwrap(), Some(0));
    }

    #[test]
    fn subscriber_count_tracks_active_slots() {
        let bus = bus();
        assert_eq!(bus.subscriber_count(), 0);
        let h1 = bus.subscribe(1, DeliveryMode::Sync, |_, _| {}).unwrap();
        let _h2 = bus.subscribe(2, DeliveryMode::Sync, |_, _| {}).unwrap();
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.unsubscribe(h1), Status::Ok);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn max_subscribers_plus_one_fails() {
        let bus = bus();
        for _ in 0..MAX_SUBSCRIBERS {
            bus.subscribe(1, DeliveryMode::Sync, |_, _| {}).unwrap();
        }
        assert_eq!(
            bus.subscribe(1, DeliveryMode::Sync, |_, _| {}).unwrap_err(),
            Status::NoMemory
        );
    }

    #[test]
    fn reentrant_sync_publish_fails_fast() {
        let pool = Arc::new(ThreadPool::new().unwrap());
        let bus = Arc::new(EventBus::new(pool, None));
        bus.init();
        let inner = bus.clone();
        bus.subscribe(1, DeliveryMode::Sync, move |_, _| {
            let status = inner.publish(2);
            assert_eq!(status, Status::Busy);
        })
        .unwrap();
        assert_eq!(bus.publish(1), Status::Ok);
    }

    #[test]
    fn unsubscribe_all_matches_exact_event_id_only() {
        let bus = bus();
        bus.subscribe(5, DeliveryMode::Sync, |_, _| {}).unwrap();
        bus.subscribe(5, DeliveryMode::Sync, |_, _| {}).unwrap();
        bus.subscribe(0, DeliveryMode::Sync, |_, _| {}).unwrap();
        assert_eq!(bus.unsubscribe_all(5), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }
}
