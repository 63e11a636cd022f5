//! Thread Pool: four priority-class FIFO queues drained by a fixed set of
//! worker threads with strict priority and no aging.

use crate::config::{
    THREADPOOL_DEFAULT_QUEUE_SIZE, THREADPOOL_DEFAULT_STACK_SIZE, THREADPOOL_DEFAULT_THREAD_COUNT,
    THREADPOOL_MAX_THREADS,
};
use crate::error::Status;
use crate::sched;
use log::{debug, info, warn};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

/// Priority class a task is submitted at. No aging: `Normal`'s 100 ms
/// blocking-receive timeout is a shutdown liveness guard only, not
/// fairness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Stopped = 0,
    Running = 1,
    ShuttingDown = 2,
}

impl PoolState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => PoolState::Running,
            2 => PoolState::ShuttingDown,
            _ => PoolState::Stopped,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ThreadPoolConfig {
    pub thread_count: usize,
    pub queue_size: usize,
    pub stack_size: usize,
    /// Base OS priority workers are spawned at; informational on the std
    /// backend (no real-time scheduling class is requested).
    pub worker_priority: u8,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            thread_count: THREADPOOL_DEFAULT_THREAD_COUNT,
            queue_size: THREADPOOL_DEFAULT_QUEUE_SIZE,
            stack_size: THREADPOOL_DEFAULT_STACK_SIZE,
            worker_priority: 5,
        }
    }
}

type BoxedTask = Box<dyn FnOnce() + Send + 'static>;

struct Shared {
    critical: sched::Queue<BoxedTask>,
    high: sched::Queue<BoxedTask>,
    normal: sched::Queue<BoxedTask>,
    low: sched::Queue<BoxedTask>,
    state: AtomicU8,
    active_tasks: AtomicUsize,
    total_submitted: AtomicU64,
    total_completed: AtomicU64,
    // Held twice per task: once to record the start, once to record
    // completion, so a task's bookkeeping is never interleaved with
    // another worker's.
    counters: sched::Mutex<()>,
}

impl Shared {
    fn queue(&self, priority: Priority) -> &sched::Queue<BoxedTask> {
        match priority {
            Priority::Critical => &self.critical,
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
            Priority::Low => &self.low,
        }
    }

    fn pending_count(&self) -> usize {
        self.critical.count() + self.high.count() + self.normal.count() + self.low.count()
    }
}

/// Fixed set of priority worker threads draining the four queues.
pub struct ThreadPool {
    shared: Arc<Shared>,
    workers: sched::Mutex<Vec<sched::Task>>,
    config: ThreadPoolConfig,
}

impl ThreadPool {
    pub fn new() -> Result<Self, Status> {
        Self::with_config(ThreadPoolConfig::default())
    }

    pub fn with_config(config: ThreadPoolConfig) -> Result<Self, Status> {
        if config.thread_count == 0 || config.thread_count > THREADPOOL_MAX_THREADS {
            return Err(Status::InvalidParam);
        }
        if config.queue_size == 0 || config.stack_size == 0 {
            return Err(Status::InvalidParam);
        }

        let shared = Arc::new(Shared {
            critical: sched::Queue::new(config.queue_size),
            high: sched::Queue::new(config.queue_size),
            normal: sched::Queue::new(config.queue_size * 2),
            low: sched::Queue::new(config.queue_size),
            state: AtomicU8::new(PoolState::Running as u8),
            active_tasks: AtomicUsize::new(0),
            total_submitted: AtomicU64::new(0),
            total_completed: AtomicU64::new(0),
            counters: sched::Mutex::new(()),
        });

        let mut workers = Vec::with_capacity(config.thread_count);
        for i in 0..config.thread_count {
            let worker_shared = shared.clone();
            let name = format!("Worker{i}");
            match sched::Task::create(&name, config.stack_size, move || worker_loop(worker_shared)) {
                Ok(task) => workers.push(task),
                Err(e) => {
                    // Unwind: signal shutdown so already-spawned workers
                    // exit quickly, then join them before reporting the
                    // failure — the pool is left uninitialized.
                    warn!("threadpool: failed to spawn {name}, unwinding {} workers", workers.len());
                    shared.state.store(PoolState::ShuttingDown as u8, Ordering::Release);
                    for w in workers {
                        let _ = w.join();
                    }
                    return Err(e);
                }
            }
        }

        info!(
            "threadpool: started with {} workers, queue_size={}",
            config.thread_count, config.queue_size
        );

        Ok(Self {
            shared,
            workers: sched::Mutex::new(workers),
            config,
        })
    }

    /// Submit a task at the given priority with a millisecond enqueue
    /// timeout.
    pub fn submit<F>(&self, task: F, priority: Priority, timeout_ms: u32) -> Status
    where
        F: FnOnce() + Send + 'static,
    {
        if PoolState::from_u8(self.shared.state.load(Ordering::Acquire)) != PoolState::Running {
            return Status::InvalidState;
        }

        let status = self
            .shared
            .queue(priority)
            .send(Box::new(task), timeout_ms);
        if status == Status::Ok {
            match self.shared.counters.lock(sched::WAIT_FOREVER) {
                Ok(_guard) => self.shared.total_submitted.fetch_add(1, Ordering::Relaxed),
                Err(_) => {
                    warn!("threadpool: counters mutex unavailable, total_submitted not updated");
                    return Status::MutexError;
                }
            };
        }
        status
    }

    /// ISR-safe submit: non-blocking, never touches the counters mutex
    /// (interrupt context forbids it), rejects any non-zero timeout.
    pub fn submit_from_isr<F>(&self, task: F, priority: Priority, timeout_ms: u32) -> Status
    where
        F: FnOnce() + Send + 'static,
    {
        if timeout_ms != sched::NO_WAIT {
            return Status::InvalidParam;
        }
        if PoolState::from_u8(self.shared.state.load(Ordering::Acquire)) != PoolState::Running {
            return Status::InvalidState;
        }
        self.shared.queue(priority).send_from_isr(Box::new(task))
    }

    pub fn active_count(&self) -> usize {
        self.shared.active_tasks.load(Ordering::Acquire)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending_count()
    }

    pub fn is_idle(&self) -> bool {
        self.active_count() == 0 && self.pending_count() == 0
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn total_submitted(&self) -> u64 {
        self.shared.total_submitted.load(Ordering::Relaxed)
    }

    pub fn total_completed(&self) -> u64 {
        self.shared.total_completed.load(Ordering::Relaxed)
    }

    /// Poll at 10 ms intervals until idle or `timeout_ms` elapses.
    pub fn wait_idle(&self, timeout_ms: u32) -> Status {
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(timeout_ms as u64);
        loop {
            if self.is_idle() {
                return Status::Ok;
            }
            if std::time::Instant::now() >= deadline {
                return Status::Timeout;
            }
            sched::Task::delay_ms(10);
        }
    }

    /// Shut the pool down. Optionally waits (up to 5 s) for in-flight and
    /// queued tasks to drain first.
    pub fn deinit(&self, wait_for_tasks: bool) -> Status {
        if wait_for_tasks {
            let _ = self.wait_idle(5000);
        }
        self.shared
            .state
            .store(PoolState::ShuttingDown as u8, Ordering::Release);
        // Give workers a moment to notice the state flip between tasks.
        sched::Task::delay_ms(100);

        let mut guard = match self.workers.lock(sched::WAIT_FOREVER) {
            Ok(g) => g,
            Err(_) => return Status::MutexError,
        };
        for worker in guard.drain(..) {
            let _ = worker.join();
        }
        self.shared.critical.reset();
        self.shared.high.reset();
        self.shared.normal.reset();
        self.shared.low.reset();
        self.shared
            .state
            .store(PoolState::Stopped as u8, Ordering::Release);
        info!("threadpool: stopped");
        Status::Ok
    }

    pub fn config(&self) -> ThreadPoolConfig {
        self.config
    }
}

fn worker_loop(shared: Arc<Shared>) {
    while PoolState::from_u8(shared.state.load(Ordering::Acquire)) == PoolState::Running {
        let task = shared
            .critical
            .receive(sched::NO_WAIT)
            .or_else(|| shared.high.receive(sched::NO_WAIT))
            .or_else(|| shared.normal.receive(100))
            .or_else(|| shared.low.receive(sched::NO_WAIT));

        let Some(task) = task else {
            continue;
        };

        match shared.counters.lock(sched::WAIT_FOREVER) {
            Ok(_guard) => {
                shared.active_tasks.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => warn!("threadpool: counters mutex unavailable, active_tasks not updated"),
        }

        // A panicking task must never corrupt the pool's counters: always
        // run the decrement/completion bookkeeping regardless of outcome.
        let result = catch_unwind(AssertUnwindSafe(task));
        if let Err(e) = result {
            warn!("threadpool: task panicked: {e:?}");
            drop(e);
        }

        match shared.counters.lock(sched::WAIT_FOREVER) {
            Ok(_guard) => {
                shared.active_tasks.fetch_sub(1, Ordering::AcqRel);
                shared.total_completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => warn!("threadpool: counters mutex unavailable, task completion not recorded"),
        }
    }
    debug!("threadpool: worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn priority_ordering_single_worker() {
        let pool = ThreadPool::with_config(ThreadPoolConfig {
            thread_count: 1,
            ..Default::default()
        })
        .unwrap();

        let (tx, rx) = mpsc::channel();
        let (start_tx, start_rx) = mpsc::channel::<()>();

        let tx_a = tx.clone();
        pool.submit(
            move || {
                start_tx.send(()).unwrap();
                std::thread::sleep(Duration::from_millis(80));
                tx_a.send('A').unwrap();
            },
            Priority::Low,
            1000,
        );
        start_rx.recv_timeout(Duration::from_secs(1)).unwrap();

        let tx_b = tx.clone();
        pool.submit(move || tx_b.send('B').unwrap(), Priority::High, 1000);
        let tx_c = tx.clone();
        pool.submit(move || tx_c.send('C').unwrap(), Priority::Critical, 1000);

        let order: Vec<char> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).unwrap())
            .collect();
        assert_eq!(order, vec!['A', 'C', 'B']);
        pool.deinit(true);
    }

    #[test]
    fn submit_rejected_once_stopped() {
        let pool = ThreadPool::new().unwrap();
        pool.deinit(true);
        assert_eq!(
            pool.submit(|| {}, Priority::Normal, 0),
            Status::InvalidState
        );
    }

    #[test]
    fn isr_submit_rejects_nonzero_timeout() {
        let pool = ThreadPool::new().unwrap();
        assert_eq!(
            pool.submit_from_isr(|| {}, Priority::Normal, 5),
            Status::InvalidParam
        );
        pool.deinit(true);
    }

    #[test]
    fn panicking_task_does_not_corrupt_counters() {
        let pool = ThreadPool::with_config(ThreadPoolConfig {
            thread_count: 1,
            ..Default::default()
        })
        .unwrap();
        pool.submit(|| panic!("boom"), Priority::Normal, 1000);
        assert_eq!(pool.wait_idle(2000), Status::Ok);
        assert_eq!(pool.total_completed(), 1);
        assert_eq!(pool.active_count(), 0);
        pool.deinit(true);
    }

    #[test]
    fn shutdown_drains_everything() {
        let pool = ThreadPool::with_config(ThreadPoolConfig {
            thread_count: 4,
            ..Default::default()
        })
        .unwrap();
        for _ in 0..50 {
            pool.submit(
                || std::thread::sleep(Duration::from_millis(20)),
                Priority::Normal,
                1000,
            );
        }
        let start = std::time::Instant::now();
        assert_eq!(pool.deinit(true), Status::Ok);
        assert!(start.elapsed() < Duration::from_secs(6));
        assert_eq!(pool.total_completed(), pool.total_submitted());
    }
}
