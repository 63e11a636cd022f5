//! End-to-end scenarios spanning more than one subsystem, plus the
//! boundary cases not already covered by a unit test.

use cframework_core::eventbus::{DeliveryMode, EventBus};
use cframework_core::mempool::MemPoolManager;
use cframework_core::threadpool::{ThreadPool, ThreadPoolConfig};
use cframework_core::Status;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

#[test]
fn max_size_allocation_succeeds_iff_a_pool_covers_it() {
    let m = MemPoolManager::new();
    m.init();
    assert!(m.alloc(cframework_core::config::MEMPOOL_MAX_SIZE).is_none());

    m.create_pool(cframework_core::config::MEMPOOL_MAX_SIZE, 2, "max")
        .unwrap();
    assert!(m.alloc(cframework_core::config::MEMPOOL_MAX_SIZE).is_some());
    assert!(m
        .alloc(cframework_core::config::MEMPOOL_MAX_SIZE + 1)
        .is_none());
}

#[test]
fn free_rejects_misaligned_pointer() {
    let m = MemPoolManager::new();
    m.init();
    let h = m.create_pool(64, 4, "align").unwrap();
    let p = m.alloc_from_pool(&h).unwrap();
    let misaligned = unsafe { p.add(1) };
    assert_eq!(m.free(misaligned), Status::InvalidParam);
    // The original block is still allocated, untouched by the bad free.
    assert_eq!(m.free(p), Status::Ok);
}

#[test]
fn alloc_free_roundtrip_preserves_pool_state_except_lifetime_counters() {
    let m = MemPoolManager::new();
    m.init();
    let h = m.create_pool(64, 8, "rt").unwrap();
    let before = m.get_stats(&h).unwrap();

    let p = m.alloc_from_pool(&h).unwrap();
    assert_eq!(m.free(p), Status::Ok);

    // Every field is restored except total_allocations, total_deallocations
    // and peak_used, which only ever accumulate and are never restored by a
    // free.
    let after = m.get_stats(&h).unwrap();
    assert_eq!(before.current_used, after.current_used);
    assert_eq!(before.allocation_failures, after.allocation_failures);
    assert_eq!(before.fragmentation_count, after.fragmentation_count);
    assert_eq!(after.total_allocations, 1);
    assert_eq!(after.total_deallocations, 1);
    assert_eq!(after.peak_used, 1);
}

#[test]
fn mempool_and_eventbus_cooperate_on_the_async_path() {
    // Mirrors the data/control flow in the overview: a publisher hands
    // the bus a payload, the bus copies it out of the memory pool (not
    // the heap) and a thread-pool worker delivers it.
    let pool = Arc::new(ThreadPool::new().unwrap());
    let mempool = Arc::new(MemPoolManager::new());
    mempool.init();
    mempool.create_pool(64, 16, "eventbus-payloads").unwrap();

    let bus = EventBus::new(pool.clone(), Some(mempool.clone()));
    bus.init();

    let (tx, rx) = mpsc::channel();
    bus.subscribe(0x0100_0042, DeliveryMode::Async, move |id, data| {
        tx.send((id, data.unwrap().to_vec())).unwrap();
    })
    .unwrap();

    assert_eq!(bus.publish_data(0x0100_0042, b"hello"), Status::Ok);
    assert_eq!(pool.wait_idle(500), Status::Ok);

    let (id, data) = rx.recv_timeout(Duration::from_secs(1)).unwrap();
    assert_eq!(id, 0x0100_0042);
    assert_eq!(data, b"hello");
    // The payload was copied via the pool, not the general heap.
    assert!(mempool.get_global_stats().allocations >= 1);
}

#[test]
fn dropped_async_deliveries_are_counted_when_the_pool_is_stopped() {
    let pool = Arc::new(ThreadPool::new().unwrap());
    let bus = EventBus::new(pool.clone(), None);
    bus.init();
    bus.subscribe(1, DeliveryMode::Async, |_, _| {}).unwrap();

    pool.deinit(true);

    assert_eq!(bus.publish(1), Status::Ok);
    assert_eq!(bus.dropped_deliveries(), 1);
}

#[test]
fn sync_subscriber_sees_publishes_in_order_within_one_publisher() {
    let pool = Arc::new(ThreadPool::new().unwrap());
    let bus = EventBus::new(pool, None);
    bus.init();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let seen2 = seen.clone();
    bus.subscribe(9, DeliveryMode::Sync, move |_, data| {
        seen2.lock().unwrap().push(data.map(|d| d[0]));
    })
    .unwrap();

    for i in 0u8..5 {
        bus.publish_data(9, &[i]);
    }

    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some(0), Some(1), Some(2), Some(3), Some(4)]
    );
}

#[test]
fn subscriber_added_after_publish_does_not_observe_it() {
    let pool = Arc::new(ThreadPool::new().unwrap());
    let bus = EventBus::new(pool, None);
    bus.init();

    assert_eq!(bus.publish(1), Status::Ok);

    let calls = Arc::new(AtomicUsize::new(0));
    let calls2 = calls.clone();
    bus.subscribe(1, DeliveryMode::Sync, move |_, _| {
        calls2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn event_with_id_zero_only_matches_wildcard_subscribers() {
    let pool = Arc::new(ThreadPool::new().unwrap());
    let bus = EventBus::new(pool, None);
    bus.init();

    let specific_hits = Arc::new(AtomicUsize::new(0));
    let wildcard_hits = Arc::new(AtomicUsize::new(0));
    let s2 = specific_hits.clone();
    let w2 = wildcard_hits.clone();
    bus.subscribe(0x0100_0001, DeliveryMode::Sync, move |_, _| {
        s2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    bus.subscribe(0, DeliveryMode::Sync, move |_, _| {
        w2.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();

    assert_eq!(bus.publish(0), Status::Ok);
    assert_eq!(specific_hits.load(Ordering::SeqCst), 0);
    assert_eq!(wildcard_hits.load(Ordering::SeqCst), 1);
}

#[test]
fn threadpool_wait_idle_implies_zero_active_and_pending() {
    let pool = ThreadPool::with_config(ThreadPoolConfig {
        thread_count: 2,
        ..Default::default()
    })
    .unwrap();

    for _ in 0..10 {
        pool.submit(
            || std::thread::sleep(Duration::from_millis(10)),
            cframework_core::threadpool::Priority::Normal,
            1000,
        );
    }

    assert_eq!(pool.wait_idle(2000), Status::Ok);
    assert_eq!(pool.active_count(), 0);
    assert_eq!(pool.pending_count(), 0);
    pool.deinit(true);
}

#[test]
fn event_id_macro_round_trips() {
    let id = cframework_core::event_id!(0x0100, 0x0042);
    assert_eq!(cframework_core::event_id::event_domain(id), 0x0100);
    assert_eq!(cframework_core::event_id::event_number(id), 0x0042);
}
