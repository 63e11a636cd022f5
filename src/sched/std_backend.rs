//! Concrete scheduler adapter backed by `std::sync` and `std::thread`.

use crate::error::Status;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex as StdMutex};
use std::time::{Duration, Instant};

use super::{NO_WAIT, WAIT_FOREVER};

fn timeout_duration(timeout_ms: u32) -> Option<Duration> {
    if timeout_ms == WAIT_FOREVER {
        None
    } else {
        Some(Duration::from_millis(timeout_ms as u64))
    }
}

/// Mutex with a millisecond-timeout `lock`.
pub struct Mutex<T> {
    inner: StdMutex<T>,
}

unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: StdMutex::new(value),
        }
    }

    /// Lock with a timeout. `NO_WAIT` tries once; `WAIT_FOREVER` blocks
    /// until acquired (short of an actual poisoned mutex, which this crate
    /// treats as a `MutexError`, never panicking the caller).
    pub fn lock(&self, timeout_ms: u32) -> Result<MutexGuard<'_, T>, Status> {
        if timeout_ms == NO_WAIT {
            return self
                .inner
                .try_lock()
                .map(MutexGuard)
                .map_err(|_| Status::Timeout);
        }

        if timeout_ms == WAIT_FOREVER {
            return self
                .inner
                .lock()
                .map(MutexGuard)
                .map_err(|_| Status::MutexError);
        }

        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            match self.inner.try_lock() {
                Ok(guard) => return Ok(MutexGuard(guard)),
                Err(std::sync::TryLockError::Poisoned(_)) => return Err(Status::MutexError),
                Err(std::sync::TryLockError::WouldBlock) => {
                    if Instant::now() >= deadline {
                        return Err(Status::Timeout);
                    }
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Try-lock with no wait at all; used on paths that must never block
    /// (e.g. memory-pool allocation under its try-lock ceiling).
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, Status> {
        self.lock(NO_WAIT)
    }
}

pub struct MutexGuard<'a, T>(std::sync::MutexGuard<'a, T>);

impl<'a, T> core::ops::Deref for MutexGuard<'a, T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

impl<'a, T> core::ops::DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

/// Fixed-capacity, FIFO, multi-producer multi-consumer queue with
/// millisecond-timeout send/receive.
pub struct Queue<T> {
    state: StdMutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> Queue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: StdMutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    /// Blocking send bounded by `timeout_ms`. Returns `Status::QueueFull`
    /// once the deadline passes with the queue still saturated.
    pub fn send(&self, item: T, timeout_ms: u32) -> Status {
        let mut guard = match self.state.lock() {
            Ok(g) => g,
            Err(_) => return Status::MutexError,
        };

        if timeout_ms == NO_WAIT {
            if guard.len() >= self.capacity {
                return Status::QueueFull;
            }
            guard.push_back(item);
            drop(guard);
            self.not_empty.notify_one();
            return Status::Ok;
        }

        let deadline = timeout_duration(timeout_ms).map(|d| Instant::now() + d);
        while guard.len() >= self.capacity {
            let wait = match deadline {
                None => Duration::from_millis(50),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return Status::QueueFull;
                    }
                    dl - now
                }
            };
            let (g, timed_out) = match self.not_full.wait_timeout(guard, wait) {
                Ok(pair) => pair,
                Err(_) => return Status::MutexError,
            };
            guard = g;
            if timed_out.timed_out() && deadline.is_some() && guard.len() >= self.capacity {
                return Status::QueueFull;
            }
        }

        guard.push_back(item);
        drop(guard);
        self.not_empty.notify_one();
        Status::Ok
    }

    /// Non-blocking send usable from an ISR-equivalent context: never
    /// blocks, never touches a condvar beyond a notify.
    pub fn send_from_isr(&self, item: T) -> Status {
        match self.state.try_lock() {
            Ok(mut guard) => {
                if guard.len() >= self.capacity {
                    return Status::QueueFull;
                }
                guard.push_back(item);
                drop(guard);
                self.not_empty.notify_one();
                Status::Ok
            }
            Err(_) => Status::Busy,
        }
    }

    /// Blocking receive bounded by `timeout_ms`. `None` on timeout/empty.
    pub fn receive(&self, timeout_ms: u32) -> Option<T> {
        let mut guard = self.state.lock().ok()?;

        if timeout_ms == NO_WAIT {
            let item = guard.pop_front();
            if item.is_some() {
                drop(guard);
                self.not_full.notify_one();
            }
            return item;
        }

        let deadline = timeout_duration(timeout_ms).map(|d| Instant::now() + d);
        while guard.is_empty() {
            let wait = match deadline {
                None => Duration::from_millis(50),
                Some(dl) => {
                    let now = Instant::now();
                    if now >= dl {
                        return None;
                    }
                    dl - now
                }
            };
            let (g, timed_out) = self.not_empty.wait_timeout(guard, wait).ok()?;
            guard = g;
            if timed_out.timed_out() && deadline.is_some() && guard.is_empty() {
                return None;
            }
        }

        let item = guard.pop_front();
        drop(guard);
        self.not_full.notify_one();
        item
    }

    pub fn count(&self) -> usize {
        self.state.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.count())
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.state.lock() {
            guard.clear();
        }
        self.not_full.notify_all();
    }
}

/// A spawned worker of the thread pool (or any other scheduler task),
/// wrapping `std::thread`'s join handle behind the scheduler adapter's
/// `Task` vocabulary.
pub struct Task {
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Task {
    /// Spawn a named task with the given stack size hint.
    pub fn create<F>(name: &str, stack_size: usize, entry: F) -> Result<Self, Status>
    where
        F: FnOnce() + Send + 'static,
    {
        std::thread::Builder::new()
            .name(name.to_string())
            .stack_size(stack_size)
            .spawn(entry)
            .map(|handle| Task {
                handle: Some(handle),
            })
            .map_err(|_| Status::NoResource)
    }

    /// Block until the task's entry point returns.
    pub fn join(mut self) -> Result<(), Status> {
        match self.handle.take() {
            Some(h) => h.join().map_err(|_| Status::Hardware),
            None => Ok(()),
        }
    }

    pub fn delay_ms(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
