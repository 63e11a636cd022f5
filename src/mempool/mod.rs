//! Memory Pool Manager: fixed-size block pools with a global best-fit
//! size-to-pool router and O(1)-average alloc/free.

use crate::config::{MEMPOOL_MAX_BLOCK_COUNT, MEMPOOL_MAX_POOLS, MEMPOOL_MAX_SIZE};
use crate::error::Status;
use crate::sched;
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

const NO_POOL: u8 = 0xFF;
/// 10 ms ceiling on `alloc_from_pool`'s try-lock.
const ALLOC_LOCK_CEILING_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Health {
    Good,
    Warning,
    Critical,
    /// Reserved for an invalid/unknown handle.
    Emergency,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub total_allocations: u64,
    pub total_deallocations: u64,
    pub current_used: usize,
    pub peak_used: usize,
    pub allocation_failures: u64,
    pub fragmentation_count: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStats {
    pub allocations: u64,
    pub failures: u64,
    pub fragmentation: u64,
}

#[derive(Debug, Clone)]
pub struct PoolInfo {
    pub name: String,
    pub block_size: usize,
    pub block_count: usize,
    pub active: bool,
    pub stats: PoolStats,
}

struct PoolState {
    free_mask: [u32; 2],
    next_hint: usize,
    stats: PoolStats,
}

impl PoolState {
    fn new(block_count: usize) -> Self {
        let mut free_mask = [0u32; 2];
        for i in 0..block_count {
            free_mask[i / 32] |= 1 << (i % 32);
        }
        Self {
            free_mask,
            next_hint: 0,
            stats: PoolStats::default(),
        }
    }

    fn bit(&self, i: usize) -> bool {
        (self.free_mask[i / 32] >> (i % 32)) & 1 != 0
    }

    fn set_bit(&mut self, i: usize, free: bool) {
        let mask = 1u32 << (i % 32);
        if free {
            self.free_mask[i / 32] |= mask;
        } else {
            self.free_mask[i / 32] &= !mask;
        }
    }
}

struct Pool {
    name: String,
    block_size: usize,
    block_count: usize,
    // Backing memory; never resized after creation. Kept alive solely to
    // anchor `base_addr` — individual bytes are never read or written by
    // the allocator itself, only handed out as opaque block addresses.
    _buffer: Vec<u8>,
    base_addr: usize,
    state: sched::Mutex<PoolState>,
    active: AtomicBool,
}

impl Pool {
    fn new(block_size: usize, block_count: usize, name: &str) -> Self {
        let mut buffer = vec![0u8; block_size * block_count];
        let base_addr = buffer.as_mut_ptr() as usize;
        Self {
            name: name.to_string(),
            block_size,
            block_count,
            _buffer: buffer,
            base_addr,
            state: sched::Mutex::new(PoolState::new(block_count)),
            active: AtomicBool::new(true),
        }
    }

    fn contains(&self, addr: usize) -> bool {
        self.active.load(Ordering::Acquire)
            && addr >= self.base_addr
            && addr < self.base_addr + self.block_count * self.block_size
    }
}

/// Opaque handle to a live pool inside the manager's fixed array.
#[derive(Clone)]
pub struct PoolHandle(Arc<Pool>);

impl PoolHandle {
    fn ptr_eq(&self, other: &Arc<Pool>) -> bool {
        Arc::ptr_eq(&self.0, other)
    }
}

struct ManagerInner {
    pools: [Option<Arc<Pool>>; MEMPOOL_MAX_POOLS],
    pool_count: usize,
    // size -> pool slot index (NO_POOL if no active pool covers it).
    size_map: Vec<u8>,
}

impl ManagerInner {
    fn new() -> Self {
        Self {
            pools: Default::default(),
            pool_count: 0,
            size_map: vec![NO_POOL; MEMPOOL_MAX_SIZE + 1],
        }
    }

    fn rebuild_size_map(&mut self) {
        for entry in self.size_map.iter_mut() {
            *entry = NO_POOL;
        }
        for size in 0..=MEMPOOL_MAX_SIZE {
            let mut best: Option<(usize, usize)> = None; // (slot, block_size)
            for (slot, pool) in self.pools.iter().enumerate() {
                if let Some(p) = pool {
                    if p.active.load(Ordering::Acquire) && p.block_size >= size {
                        match best {
                            Some((_, bs)) if bs <= p.block_size => {}
                            _ => best = Some((slot, p.block_size)),
                        }
                    }
                }
            }
            self.size_map[size] = best.map(|(slot, _)| slot as u8).unwrap_or(NO_POOL);
        }
    }
}

/// Fixed array of up to `MEMPOOL_MAX_POOLS` pools plus the size-routing
/// layer that picks which pool serves a given allocation size.
pub struct MemPoolManager {
    initialized: AtomicBool,
    global: sched::Mutex<ManagerInner>,
    global_allocations: AtomicU64,
    global_failures: AtomicU64,
    global_fragmentation: AtomicU64,
}

impl Default for MemPoolManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MemPoolManager {
    pub fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
            global: sched::Mutex::new(ManagerInner::new()),
            global_allocations: AtomicU64::new(0),
            global_failures: AtomicU64::new(0),
            global_fragmentation: AtomicU64::new(0),
        }
    }

    pub fn init(&self) -> Status {
        if self.initialized.swap(true, Ordering::AcqRel) {
            return Status::AlreadyInitialized;
        }
        let mut guard = match self.global.lock(sched::WAIT_FOREVER) {
            Ok(g) => g,
            Err(_) => return Status::MutexError,
        };
        *guard = ManagerInner::new();
        debug!("mempool: manager initialized");
        Status::Ok
    }

    pub fn deinit(&self) -> Status {
        if !self.initialized.swap(false, Ordering::AcqRel) {
            return Status::NotInitialized;
        }
        let mut guard = match self.global.lock(sched::WAIT_FOREVER) {
            Ok(g) => g,
            Err(_) => return Status::MutexError,
        };
        *guard = ManagerInner::new();
        debug!("mempool: manager deinitialized");
        Status::Ok
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn create_pool(
        &self,
        block_size: usize,
        block_count: usize,
        name: &str,
    ) -> Result<PoolHandle, Status> {
        if !self.is_initialized() {
            return Err(Status::NotInitialized);
        }
        if block_size == 0 || block_size > MEMPOOL_MAX_SIZE {
            return Err(Status::InvalidParam);
        }
        if block_count == 0 || block_count > MEMPOOL_MAX_BLOCK_COUNT {
            return Err(Status::InvalidParam);
        }

        let mut guard = match self.global.lock(sched::WAIT_FOREVER) {
            Ok(g) => g,
            Err(_) => return Err(Status::MutexError),
        };
        if guard.pool_count >= MEMPOOL_MAX_POOLS {
            return Err(Status::NoResource);
        }
        let slot = guard
            .pools
            .iter()
            .position(|p| p.is_none())
            .ok_or(Status::NoResource)?;

        let pool = Arc::new(Pool::new(block_size, block_count, name));
        guard.pools[slot] = Some(pool.clone());
        guard.pool_count += 1;
        guard.rebuild_size_map();
        debug!(
            "mempool: created pool '{name}' ({block_count}x{block_size}B) in slot {slot}"
        );
        Ok(PoolHandle(pool))
    }

    pub fn destroy_pool(&self, handle: &PoolHandle) -> Status {
        let mut guard = match self.global.lock(sched::WAIT_FOREVER) {
            Ok(g) => g,
            Err(_) => return Status::MutexError,
        };
        let slot = guard
            .pools
            .iter()
            .position(|p| matches!(p, Some(p) if handle.ptr_eq(p)));
        match slot {
            Some(slot) => {
                // Take the pool's own lock before dropping, so no
                // in-flight alloc/free races the teardown.
                if let Some(p) = &guard.pools[slot] {
                    let _state_guard = p.state.lock(sched::WAIT_FOREVER);
                    p.active.store(false, Ordering::Release);
                }
                guard.pools[slot] = None;
                guard.pool_count = guard.pool_count.saturating_sub(1);
                guard.rebuild_size_map();
                debug!("mempool: destroyed pool in slot {slot}");
                Status::Ok
            }
            None => Status::NotFound,
        }
    }

    /// Allocate a block from a specific pool. O(block_count) worst case,
    /// bounded by a 10 ms try-lock ceiling so this never blocks indefinitely.
    pub fn alloc_from_pool(&self, handle: &PoolHandle) -> Option<*mut u8> {
        let pool = &handle.0;
        let mut state = match pool.state.lock(ALLOC_LOCK_CEILING_MS) {
            Ok(g) => g,
            Err(_) => {
                self.global_failures.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        let hint = state.next_hint;
        let mut found = None;
        for offset in 0..pool.block_count {
            let i = (hint + offset) % pool.block_count;
            if state.bit(i) {
                found = Some(i);
                break;
            }
        }

        match found {
            Some(i) => {
                state.set_bit(i, false);
                state.stats.total_allocations += 1;
                state.stats.current_used += 1;
                state.stats.peak_used = state.stats.peak_used.max(state.stats.current_used);
                state.next_hint = (i + 1) % pool.block_count;
                self.global_allocations.fetch_add(1, Ordering::Relaxed);
                Some((pool.base_addr + i * pool.block_size) as *mut u8)
            }
            None => {
                state.stats.allocation_failures += 1;
                self.global_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Allocate `size` bytes by routing through the smallest active pool
    /// that covers it, sweeping the rest on failure.
    pub fn alloc(&self, size: usize) -> Option<*mut u8> {
        if size == 0 || size > MEMPOOL_MAX_SIZE {
            return None;
        }

        let candidates: Vec<(Arc<Pool>, bool)> = {
            let guard = self.global.lock(sched::WAIT_FOREVER).ok()?;
            let primary = guard.size_map[size];
            let mut list = Vec::new();
            if primary != NO_POOL {
                if let Some(p) = &guard.pools[primary as usize] {
                    list.push((p.clone(), true));
                }
            }
            for (slot, pool) in guard.pools.iter().enumerate() {
                if slot as u8 == primary {
                    continue;
                }
                if let Some(p) = pool {
                    if p.active.load(Ordering::Acquire) && p.block_size >= size {
                        list.push((p.clone(), false));
                    }
                }
            }
            list
        };

        for (pool, _) in &candidates {
            let handle = PoolHandle(pool.clone());
            if let Some(ptr) = self.alloc_from_pool(&handle) {
                if pool.block_size > size {
                    self.global_fragmentation.fetch_add(1, Ordering::Relaxed);
                    if let Ok(mut state) = pool.state.lock(sched::WAIT_FOREVER) {
                        state.stats.fragmentation_count += 1;
                    }
                }
                return Some(ptr);
            }
        }

        self.global_failures.fetch_add(1, Ordering::Relaxed);
        warn!("mempool: alloc({size}) failed, no pool could satisfy it");
        None
    }

    /// Free a pointer previously returned by [`alloc`]/[`alloc_from_pool`].
    /// A null pointer is a no-op.
    pub fn free(&self, ptr: *mut u8) -> Status {
        if ptr.is_null() {
            return Status::Ok;
        }
        let addr = ptr as usize;

        let owner = {
            let guard = match self.global.lock(sched::WAIT_FOREVER) {
                Ok(g) => g,
                Err(_) => return Status::MutexError,
            };
            guard
                .pools
                .iter()
                .flatten()
                .find(|p| p.contains(addr))
                .cloned()
        };

        let pool = match owner {
            Some(p) => p,
            None => return Status::InvalidParam,
        };

        let offset = addr - pool.base_addr;
        if offset % pool.block_size != 0 {
            return Status::InvalidParam;
        }
        let index = offset / pool.block_size;

        let mut state = match pool.state.lock(sched::WAIT_FOREVER) {
            Ok(g) => g,
            Err(_) => return Status::MutexError,
        };

        if state.bit(index) {
            // Already free: double free.
            return Status::InvalidState;
        }

        state.set_bit(index, true);
        state.stats.current_used = state.stats.current_used.saturating_sub(1);
        state.stats.total_deallocations += 1;
        Status::Ok
    }

    pub fn is_pool_pointer(&self, ptr: *mut u8) -> bool {
        if ptr.is_null() {
            return false;
        }
        let addr = ptr as usize;
        match self.global.lock(sched::WAIT_FOREVER) {
            Ok(guard) => guard.pools.iter().flatten().any(|p| p.contains(addr)),
            Err(_) => false,
        }
    }

    pub fn get_stats(&self, handle: &PoolHandle) -> Option<PoolStats> {
        handle.0.state.lock(sched::WAIT_FOREVER).ok().map(|s| s.stats)
    }

    pub fn get_global_stats(&self) -> GlobalStats {
        GlobalStats {
            allocations: self.global_allocations.load(Ordering::Relaxed),
            failures: self.global_failures.load(Ordering::Relaxed),
            fragmentation: self.global_fragmentation.load(Ordering::Relaxed),
        }
    }

    pub fn get_info(&self, handle: &PoolHandle) -> PoolInfo {
        let pool = &handle.0;
        let stats = pool
            .state
            .lock(sched::WAIT_FOREVER)
            .map(|s| s.stats)
            .unwrap_or_default();
        PoolInfo {
            name: pool.name.clone(),
            block_size: pool.block_size,
            block_count: pool.block_count,
            active: pool.active.load(Ordering::Acquire),
            stats,
        }
    }

    /// Health derived from `current_used / block_count`: >=95% Critical,
    /// >=80% Warning, else Good.
    pub fn check_health(&self, handle: &PoolHandle) -> Health {
        let pool = &handle.0;
        if !pool.active.load(Ordering::Acquire) {
            return Health::Emergency;
        }
        let used = match pool.state.lock(sched::WAIT_FOREVER) {
            Ok(s) => s.stats.current_used,
            Err(_) => return Health::Emergency,
        };
        let pct = used * 100 / pool.block_count;
        if pct >= 95 {
            Health::Critical
        } else if pct >= 80 {
            Health::Warning
        } else {
            Health::Good
        }
    }

    /// Reset statistics for one pool, or every pool when `handle` is `None`.
    pub fn reset_stats(&self, handle: Option<&PoolHandle>) -> Status {
        match handle {
            Some(h) => {
                if let Ok(mut s) = h.0.state.lock(sched::WAIT_FOREVER) {
                    s.stats = PoolStats::default();
                    Status::Ok
                } else {
                    Status::MutexError
                }
            }
            None => {
                let guard = match self.global.lock(sched::WAIT_FOREVER) {
                    Ok(g) => g,
                    Err(_) => return Status::MutexError,
                };
                for pool in guard.pools.iter().flatten() {
                    if let Ok(mut s) = pool.state.lock(sched::WAIT_FOREVER) {
                        s.stats = PoolStats::default();
                    }
                }
                Status::Ok
            }
        }
    }
}
