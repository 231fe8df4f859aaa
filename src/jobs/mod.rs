//! Fixed-size worker pool with cooperative job gating.
//!
//! Jobs are queued FIFO; a worker scans from the front and takes the first
//! job whose [`Job::check`] passes, so a job waiting on a contended resource
//! never starves the jobs behind it. Resources are claimed through
//! [`LockBits`], an atomic bitmask keyed by small integer ids: `check` must
//! set the bit it claims before returning true, and `run` must clear it.
//!
//! Waiters park on condvars at a cadence of 1 ms (fast) or 1 s
//! ([`WorkerPool::slow`], for pools expected to be idle).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// Poll interval while the pool is busy.
pub const FAST_POLL: Duration = Duration::from_millis(1);
/// Poll interval while the pool is expected to be idle.
pub const SLOW_POLL: Duration = Duration::from_secs(1);

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ── Lock bits ────────────────────────────────────────────────────────────

/// Atomic bitmask arbitrating worker-indexed resources across jobs.
#[derive(Default)]
pub struct LockBits(AtomicU64);

impl LockBits {
    /// Atomically claim `bit`. Returns false if it was already set.
    pub fn try_set(&self, bit: u32) -> bool {
        let mask = 1u64 << bit;
        self.0.fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Release `bit`.
    pub fn clear(&self, bit: u32) {
        self.0.fetch_and(!(1u64 << bit), Ordering::AcqRel);
    }

    /// Set every bit in `mask`.
    pub fn set_mask(&self, mask: u64) {
        self.0.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clear every bit in `mask`.
    pub fn clear_mask(&self, mask: u64) {
        self.0.fetch_and(!mask, Ordering::AcqRel);
    }

    /// True if any bit in `mask` is currently set.
    pub fn any_set(&self, mask: u64) -> bool {
        self.0.load(Ordering::Acquire) & mask != 0
    }
}

// ── Waitables ────────────────────────────────────────────────────────────

/// Completion hook the pool invokes after a job's `run` returns.
pub trait Complete: Send + Sync + 'static {
    /// Mark the handle complete and wake waiters.
    fn complete(&self);
}

/// Plain completion handle: a done flag plus a condvar.
#[derive(Default)]
pub struct Waitable {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Waitable {
    /// Create a pending waitable.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True once the job has finished.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        *self.done.lock()
    }

    /// Block until the job finishes.
    pub fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }

    /// Block until the job finishes or `timeout` elapses.
    ///
    /// Returns true if the job finished.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut done = self.done.lock();
        while !*done {
            if self.cond.wait_until(&mut done, deadline).timed_out() {
                return *done;
            }
        }
        true
    }
}

impl Complete for Waitable {
    fn complete(&self) {
        *self.done.lock() = true;
        self.cond.notify_all();
    }
}

// ── Jobs ─────────────────────────────────────────────────────────────────

/// A unit of work the pool can run.
///
/// `make_waitable` allocates the handle the submitter receives
/// synchronously; the pool calls [`Complete::complete`] on it after `run`
/// returns.
pub trait Job: Send + 'static {
    /// Completion handle type handed back at submission time.
    type Waitable: Complete;

    /// Allocate the completion handle for this job.
    fn make_waitable(&self) -> Arc<Self::Waitable>;

    /// Cooperative gate. A worker refuses the job (leaving it queued)
    /// unless this returns true. An implementation claiming a lock bit must
    /// set it here, before returning true.
    fn check(&mut self, bits: &LockBits) -> bool {
        let _ = bits;
        true
    }

    /// Perform the work. Any lock bit set by `check` must be cleared before
    /// returning.
    fn run(&mut self, waitable: &Self::Waitable, worker: &JobWorker);
}

struct FuncJob<F: FnOnce(&JobWorker) + Send + 'static> {
    func: Option<F>,
}

impl<F: FnOnce(&JobWorker) + Send + 'static> Job for FuncJob<F> {
    type Waitable = Waitable;

    fn make_waitable(&self) -> Arc<Waitable> {
        Arc::new(Waitable::new())
    }

    fn run(&mut self, _waitable: &Waitable, worker: &JobWorker) {
        if let Some(func) = self.func.take() {
            func(worker);
        }
    }
}

/// Type-erased queue slot.
trait QueuedJob: Send {
    fn check(&mut self, bits: &LockBits) -> bool;
    fn run(self: Box<Self>, worker: &JobWorker);
}

struct Queued<J: Job> {
    job: J,
    waitable: Arc<J::Waitable>,
}

impl<J: Job> QueuedJob for Queued<J> {
    fn check(&mut self, bits: &LockBits) -> bool {
        self.job.check(bits)
    }

    fn run(mut self: Box<Self>, worker: &JobWorker) {
        self.job.run(&self.waitable, worker);
        self.waitable.complete();
    }
}

// ── Pool ─────────────────────────────────────────────────────────────────

struct PoolShared {
    queue: Mutex<VecDeque<Box<dyn QueuedJob>>>,
    /// Wakes workers on submit, stop, and after any job finishes (a finish
    /// may release a lock bit a queued job is gated on).
    work_cond: Condvar,
    /// Wakes `wait_idle` when a worker finishes a job.
    idle_cond: Condvar,
    running: AtomicBool,
    slow: AtomicBool,
    busy: AtomicUsize,
    lock_bits: LockBits,
}

impl PoolShared {
    fn cadence(&self) -> Duration {
        if self.slow.load(Ordering::Relaxed) {
            SLOW_POLL
        } else {
            FAST_POLL
        }
    }
}

/// Handle a running job receives: the worker's id plus access to the pool's
/// shared lock state.
pub struct JobWorker {
    id: usize,
    shared: Arc<PoolShared>,
}

impl JobWorker {
    /// Index of the worker running the job (0-based, stable for the pool's
    /// lifetime).
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Shared lock-bit set of the owning pool.
    #[must_use]
    pub fn lock_bits(&self) -> &LockBits {
        &self.shared.lock_bits
    }

    /// Run `f` under the pool's queue mutex from inside a job; no worker
    /// can take a new job for the duration.
    pub fn sync<R>(&self, f: impl FnOnce() -> R) -> R {
        let _queue = self.shared.queue.lock();
        f()
    }
}

/// Fixed-size pool of worker threads servicing a FIFO job queue.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
}

impl WorkerPool {
    /// Create a pool with `workers` threads; 0 selects the detected
    /// logical-processor count. Threads are not spawned until
    /// [`start`](Self::start).
    #[must_use]
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 {
            default_workers()
        } else {
            workers
        };
        WorkerPool {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(VecDeque::new()),
                work_cond: Condvar::new(),
                idle_cond: Condvar::new(),
                running: AtomicBool::new(false),
                slow: AtomicBool::new(false),
                busy: AtomicUsize::new(0),
                lock_bits: LockBits::default(),
            }),
            threads: Mutex::new(Vec::new()),
            workers,
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers
    }

    /// Spawn the worker threads. Idempotent.
    pub fn start(&self) {
        if self.shared.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut threads = self.threads.lock();
        for id in 0..self.workers {
            let shared = Arc::clone(&self.shared);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("spak-worker-{id}"))
                    .spawn(move || worker_loop(&shared, id))
                    .expect("spawn worker thread"),
            );
        }
    }

    /// Stop and join every worker. In-flight jobs run to completion; queued
    /// jobs stay queued (see [`clear`](Self::clear)).
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.shared.work_cond.notify_all();
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }

    /// True between `start` and `stop`.
    #[must_use]
    pub fn is_working(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Switch between the fast (1 ms) and slow (1 s) poll cadence.
    pub fn slow(&self, state: bool) {
        self.shared.slow.store(state, Ordering::Relaxed);
        self.shared.work_cond.notify_all();
    }

    /// Drop every queued job that has not been taken yet.
    pub fn clear(&self) {
        self.shared.queue.lock().clear();
    }

    /// Block until the queue is empty and no worker is mid-job.
    ///
    /// Returns false if `timeout` elapses first.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.shared.queue.lock();
        loop {
            if queue.is_empty() && self.shared.busy.load(Ordering::Acquire) == 0 {
                return true;
            }
            let mut wait = self.shared.cadence();
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                wait = wait.min(deadline - now);
            }
            self.shared.idle_cond.wait_for(&mut queue, wait);
        }
    }

    /// Queue a job, returning its completion handle immediately.
    ///
    /// Jobs queued while the pool is stopped run after the next `start`.
    pub fn submit<J: Job>(&self, job: J) -> Arc<J::Waitable> {
        let waitable = job.make_waitable();
        let queued = Box::new(Queued {
            job,
            waitable: Arc::clone(&waitable),
        });
        self.shared.queue.lock().push_back(queued);
        self.shared.work_cond.notify_one();
        waitable
    }

    /// Queue a closure as a job.
    pub fn submit_fn<F>(&self, func: F) -> Arc<Waitable>
    where
        F: FnOnce(&JobWorker) + Send + 'static,
    {
        self.submit(FuncJob { func: Some(func) })
    }

    /// Run `f` under the queue mutex; no worker can take a job meanwhile.
    ///
    /// Must not be called from inside a running job; use
    /// [`JobWorker::sync`] there.
    pub fn sync<R>(&self, f: impl FnOnce() -> R) -> R {
        let _queue = self.shared.queue.lock();
        f()
    }

    /// Shared lock-bit set used by [`Job::check`].
    #[must_use]
    pub fn lock_bits(&self) -> &LockBits {
        &self.shared.lock_bits
    }

    /// Run `f(index, count)` on `count` transient threads outside the pool;
    /// 0 selects the detected logical-processor count. Blocks until every
    /// thread returns.
    pub fn multithread<F>(f: F, workers: usize)
    where
        F: Fn(usize, usize) + Sync,
    {
        let n = if workers == 0 {
            default_workers()
        } else {
            workers
        };
        std::thread::scope(|scope| {
            for i in 0..n {
                let f = &f;
                scope.spawn(move || f(i, n));
            }
        });
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Arc<PoolShared>, id: usize) {
    let worker = JobWorker {
        id,
        shared: Arc::clone(shared),
    };
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            let job = loop {
                if !shared.running.load(Ordering::Acquire) {
                    return;
                }
                let mut taken = None;
                for i in 0..queue.len() {
                    if queue[i].check(&shared.lock_bits) {
                        taken = Some(i);
                        break;
                    }
                }
                if let Some(i) = taken {
                    break queue.remove(i).expect("scanned index is in range");
                }
                let cadence = shared.cadence();
                shared.work_cond.wait_for(&mut queue, cadence);
            };
            // Become busy before the queue unlocks so `wait_idle` never
            // observes an empty queue with the job unaccounted for.
            shared.busy.fetch_add(1, Ordering::AcqRel);
            job
        };
        job.run(&worker);
        shared.busy.fetch_sub(1, Ordering::AcqRel);
        // Finishing a job can release a lock bit a queued job is gated on,
        // and can complete the idle condition.
        shared.work_cond.notify_all();
        shared.idle_cond.notify_all();
    }
}
