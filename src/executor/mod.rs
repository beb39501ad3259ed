//! The event-loop primitive: a task queue with blocking and polling entry
//! points, plus the work-guard handle that keeps it alive.
//!
//! An [`Executor`] is a cheap-to-clone handle over a shared task queue. Tasks
//! are posted as boxed closures and run by whichever thread drives one of the
//! entry points:
//!
//! - `poll_one` / `poll`: run ready tasks without blocking.
//! - `run_one` / `run` / `run_one_for`: block while the executor still has
//!   work (queued tasks or live [`WorkGuard`]s).
//!
//! When the queue drains and the last work guard is gone, the blocking entry
//! points mark the executor *stopped* and return. A stopped executor keeps
//! accepting posts but executes nothing until [`Executor::restart`] is
//! called. [`Executor::stop`] forces the stopped state and wakes every
//! blocked driver.

mod strand;

pub use strand::Strand;

use crossbeam_queue::SegQueue;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

struct ExecutorInner {
    /// Posted tasks, FIFO.
    queue: SegQueue<Task>,
    /// Live work guards.
    guards: AtomicUsize,
    /// Set when the executor ran out of work or was stopped explicitly.
    stopped: AtomicBool,
    /// Mutex for the condition variable.
    mutex: Mutex<()>,
    /// Wakes blocked `run*` callers on post, stop, and guard release.
    condvar: Condvar,
    /// Concurrency hint recorded at construction.
    concurrency_hint: Option<usize>,
}

/// A handle to an event loop executing posted task closures.
///
/// Clones share the same queue; a context's executor handle stays valid for
/// the lifetime of the core that owns it.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<ExecutorInner>,
}

impl Executor {
    /// Creates a new executor with no queued work and no work guards.
    #[must_use]
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates a new executor with a concurrency hint.
    ///
    /// The hint is advisory: it records how many threads the caller expects
    /// to drive this executor concurrently.
    #[must_use]
    pub fn with_hint(concurrency_hint: usize) -> Self {
        Self::build(Some(concurrency_hint))
    }

    fn build(concurrency_hint: Option<usize>) -> Self {
        Self {
            inner: Arc::new(ExecutorInner {
                queue: SegQueue::new(),
                guards: AtomicUsize::new(0),
                stopped: AtomicBool::new(false),
                mutex: Mutex::new(()),
                condvar: Condvar::new(),
                concurrency_hint,
            }),
        }
    }

    /// Posts a task for later execution.
    ///
    /// Posting is allowed in every state; tasks posted to a stopped executor
    /// stay queued until [`Executor::restart`].
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.inner.queue.push(Box::new(task));
        self.notify_one();
    }

    /// Runs at most one ready task and returns the number executed.
    ///
    /// Never blocks. Returns 0 immediately when stopped.
    pub fn poll_one(&self) -> usize {
        if self.inner.stopped.load(Ordering::Acquire) {
            return 0;
        }
        match self.inner.queue.pop() {
            Some(task) => {
                task();
                1
            }
            None => 0,
        }
    }

    /// Runs all currently-ready tasks and returns the number executed.
    ///
    /// Never blocks. Keeps draining while new tasks become ready; returns as
    /// soon as the queue is empty or the executor is stopped.
    pub fn poll(&self) -> usize {
        let mut executed = 0;
        while !self.inner.stopped.load(Ordering::Acquire) {
            match self.inner.queue.pop() {
                Some(task) => {
                    task();
                    executed += 1;
                }
                None => break,
            }
        }
        executed
    }

    /// Blocks until one task has been executed, then returns 1.
    ///
    /// Returns 0 when the executor is stopped or runs out of work while
    /// waiting.
    pub fn run_one(&self) -> usize {
        match self.next_task(None) {
            Some(task) => {
                task();
                1
            }
            None => 0,
        }
    }

    /// Blocks and executes tasks until the executor is stopped or runs out
    /// of work. Returns the number of tasks executed.
    pub fn run(&self) -> usize {
        let mut executed = 0;
        while let Some(task) = self.next_task(None) {
            task();
            executed += 1;
        }
        executed
    }

    /// Like [`Executor::run_one`], but gives up after `timeout`.
    ///
    /// Returns 0 on timeout without disturbing queued work.
    pub fn run_one_for(&self, timeout: Duration) -> usize {
        match self.next_task(Some(Instant::now() + timeout)) {
            Some(task) => {
                task();
                1
            }
            None => 0,
        }
    }

    /// Stops the executor and wakes every blocked driver.
    ///
    /// All entry points return 0 until [`Executor::restart`].
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
        self.notify_all();
    }

    /// Clears the stopped state so the executor can be driven again.
    pub fn restart(&self) {
        self.inner.stopped.store(false, Ordering::Release);
    }

    /// Returns true if the executor is stopped.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Returns the number of live work guards.
    #[must_use]
    pub fn outstanding_work(&self) -> usize {
        self.inner.guards.load(Ordering::Acquire)
    }

    /// Returns the concurrency hint given at construction, if any.
    #[must_use]
    pub fn concurrency_hint(&self) -> Option<usize> {
        self.inner.concurrency_hint
    }

    /// Installs a work guard keeping the blocking entry points from
    /// returning while the queue is empty.
    #[must_use]
    pub fn work_guard(&self) -> WorkGuard {
        self.inner.guards.fetch_add(1, Ordering::AcqRel);
        WorkGuard {
            executor: self.clone(),
        }
    }

    /// Returns true if `other` is a handle to the same executor.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Pops the next task, blocking while the executor still has work.
    ///
    /// Returns `None` when stopped, out of work (marking the executor
    /// stopped), or past the deadline.
    fn next_task(&self, deadline: Option<Instant>) -> Option<Task> {
        loop {
            if self.inner.stopped.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = self.inner.queue.pop() {
                return Some(task);
            }
            if self.inner.guards.load(Ordering::Acquire) == 0 && self.inner.queue.is_empty() {
                // Out of work: io_context semantics, the executor becomes
                // stopped until restarted.
                self.inner.stopped.store(true, Ordering::Release);
                self.notify_all();
                return None;
            }

            let guard = self.inner.mutex.lock().expect("executor mutex poisoned");
            // Re-check under the lock so a concurrent post, stop, or guard
            // release cannot slip between the empty check and the wait.
            if self.inner.stopped.load(Ordering::Acquire)
                || !self.inner.queue.is_empty()
                || self.inner.guards.load(Ordering::Acquire) == 0
            {
                continue;
            }
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    let (_guard, _result) = self
                        .inner
                        .condvar
                        .wait_timeout(guard, deadline - now)
                        .expect("executor mutex poisoned");
                }
                None => {
                    let _guard = self
                        .inner
                        .condvar
                        .wait(guard)
                        .expect("executor mutex poisoned");
                }
            }
        }
    }

    fn notify_one(&self) {
        let _guard = self.inner.mutex.lock().expect("executor mutex poisoned");
        self.inner.condvar.notify_one();
    }

    fn notify_all(&self) {
        let _guard = self.inner.mutex.lock().expect("executor mutex poisoned");
        self.inner.condvar.notify_all();
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

impl PartialEq for Executor {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl Eq for Executor {}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("queued", &self.inner.queue.len())
            .field("guards", &self.inner.guards.load(Ordering::Relaxed))
            .field("stopped", &self.inner.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Keeps an executor's blocking entry points from returning while held.
///
/// Mirrors the executor work-guard idiom: a pending external completion
/// counts as outstanding work even though no task is queued yet.
#[derive(Debug)]
pub struct WorkGuard {
    executor: Executor,
}

impl WorkGuard {
    /// Returns the executor this guard keeps alive.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.executor
    }
}

impl Drop for WorkGuard {
    fn drop(&mut self) {
        if self.executor.inner.guards.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Last guard gone: let blocked drivers observe the drained state.
            self.executor.notify_all();
        }
    }
}
