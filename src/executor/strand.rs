//! Serialization domain over an executor.
//!
//! A [`Strand`] guarantees that closures posted to it never run concurrently
//! with one another, and that posts from a single thread run in post order.
//! At most one drain task is in flight on the hosting executor at any time;
//! each drain runs exactly one strand task so sibling work on the executor
//! is not starved.

use crate::executor::{Executor, Task};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

struct StrandQueue {
    items: VecDeque<Task>,
    /// True while a drain task is queued or running on the executor.
    running: bool,
}

struct StrandInner {
    executor: Executor,
    queue: Mutex<StrandQueue>,
}

/// An ordered, non-concurrent execution domain on top of an [`Executor`].
#[derive(Clone)]
pub struct Strand {
    inner: Arc<StrandInner>,
}

impl Strand {
    /// Creates a new strand on the given executor.
    #[must_use]
    pub fn new(executor: &Executor) -> Self {
        Self {
            inner: Arc::new(StrandInner {
                executor: executor.clone(),
                queue: Mutex::new(StrandQueue {
                    items: VecDeque::new(),
                    running: false,
                }),
            }),
        }
    }

    /// Returns the executor hosting this strand.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        &self.inner.executor
    }

    /// Posts a task to the strand.
    ///
    /// The task runs on the hosting executor, serialized against every other
    /// task posted to this strand.
    pub fn post<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let schedule = {
            let mut queue = self.inner.queue.lock().expect("strand queue poisoned");
            queue.items.push_back(Box::new(task));
            if queue.running {
                false
            } else {
                queue.running = true;
                true
            }
        };
        if schedule {
            Self::schedule(Arc::clone(&self.inner));
        }
    }

    /// Returns true if `other` is a handle to the same strand.
    #[must_use]
    pub fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn schedule(inner: Arc<StrandInner>) {
        let executor = inner.executor.clone();
        executor.post(move || Self::drain(&inner));
    }

    fn drain(inner: &Arc<StrandInner>) {
        let task = {
            let mut queue = inner.queue.lock().expect("strand queue poisoned");
            queue.items.pop_front()
        };
        // Reschedules on drop, so a panicking task cannot stall the strand.
        let _continuation = DrainContinuation(Arc::clone(inner));
        if let Some(task) = task {
            task();
        }
    }
}

struct DrainContinuation(Arc<StrandInner>);

impl Drop for DrainContinuation {
    fn drop(&mut self) {
        let reschedule = {
            let mut queue = self.0.queue.lock().expect("strand queue poisoned");
            if queue.items.is_empty() {
                queue.running = false;
                false
            } else {
                true
            }
        };
        if reschedule {
            Strand::schedule(Arc::clone(&self.0));
        }
    }
}

impl fmt::Debug for Strand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.inner.queue.lock().expect("strand queue poisoned");
        f.debug_struct("Strand")
            .field("pending", &queue.items.len())
            .field("running", &queue.running)
            .finish()
    }
}
