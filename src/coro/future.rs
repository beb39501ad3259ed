//! Thread-safe future/promise bridging coroutine results to the outside.
//!
//! A [`CoroutinePromise`] is bound to an [`Executor`]; satisfying it wakes
//! blocking waiters through a condition variable and posts every pending
//! [`CoroutineFuture::async_wait`] handler onto that executor. Handlers are
//! never run inline from `set_value`. Satisfaction is at-most-once.
//!
//! [`spawn_with_future`] ties the two layers together: it spawns a coroutine
//! whose return value (or captured panic) lands in a promise, and
//! [`run_until_complete`] drives an executor until the matching future is
//! ready: the bridge from blocking synchronous code into coroutine-driven
//! computation.

use crate::coro::{spawn, CoroutineContext, IntoStrand, StackUnwind};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{Executor, Task};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

/// Outcome of a timed wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The future was satisfied before the deadline.
    Ready,
    /// The deadline passed; the computation is undisturbed.
    Timeout,
}

struct FutureInner<T> {
    value: Option<T>,
    panic: Option<Box<dyn Any + Send>>,
    handlers: Vec<Task>,
}

struct FutureState<T> {
    executor: Executor,
    ready: AtomicBool,
    inner: Mutex<FutureInner<T>>,
    condvar: Condvar,
}

impl<T> FutureState<T> {
    fn satisfy(
        &self,
        value: Option<T>,
        panic: Option<Box<dyn Any + Send>>,
    ) -> std::result::Result<(), Error> {
        let handlers = {
            let mut inner = self.inner.lock().expect("future state poisoned");
            if self.ready.load(Ordering::Acquire) {
                return Err(Error::new(ErrorKind::PromiseAlreadySatisfied));
            }
            inner.value = value;
            inner.panic = panic;
            self.ready.store(true, Ordering::Release);
            std::mem::take(&mut inner.handlers)
        };

        self.condvar.notify_all();
        for handler in handlers {
            self.executor.post(handler);
        }
        Ok(())
    }
}

/// The producing half: satisfied at most once with a value or a panic.
pub struct CoroutinePromise<T> {
    state: Arc<FutureState<T>>,
}

impl<T> CoroutinePromise<T> {
    /// Creates a promise bound to `executor`. Async-wait handlers of the
    /// matching future are posted there.
    #[must_use]
    pub fn new(executor: &Executor) -> Self {
        Self {
            state: Arc::new(FutureState {
                executor: executor.clone(),
                ready: AtomicBool::new(false),
                inner: Mutex::new(FutureInner {
                    value: None,
                    panic: None,
                    handlers: Vec::new(),
                }),
                condvar: Condvar::new(),
            }),
        }
    }

    /// Returns a future sharing this promise's state.
    #[must_use]
    pub fn get_future(&self) -> CoroutineFuture<T> {
        CoroutineFuture {
            state: Arc::clone(&self.state),
        }
    }

    /// Satisfies the promise with a value.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PromiseAlreadySatisfied`] on a second
    /// satisfaction.
    pub fn set_value(&self, value: T) -> Result<()> {
        self.state.satisfy(Some(value), None)
    }

    /// Satisfies the promise with a captured panic, re-raised by
    /// [`CoroutineFuture::get`].
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::PromiseAlreadySatisfied`] on a second
    /// satisfaction.
    pub fn set_panic(&self, payload: Box<dyn Any + Send>) -> Result<()> {
        self.state.satisfy(None, Some(payload))
    }
}

impl<T> Clone for CoroutinePromise<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for CoroutinePromise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutinePromise")
            .field("ready", &self.state.ready.load(Ordering::Relaxed))
            .finish()
    }
}

/// The consuming half: blocking, timed, and asynchronous waits.
pub struct CoroutineFuture<T> {
    state: Arc<FutureState<T>>,
}

impl<T> CoroutineFuture<T> {
    /// Returns true once the promise has been satisfied.
    #[must_use]
    pub fn ready(&self) -> bool {
        self.state.ready.load(Ordering::Acquire)
    }

    /// Blocks until the promise is satisfied.
    pub fn wait(&self) {
        let mut inner = self.state.inner.lock().expect("future state poisoned");
        while !self.state.ready.load(Ordering::Acquire) {
            inner = self
                .state
                .condvar
                .wait(inner)
                .expect("future state poisoned");
        }
    }

    /// Blocks until the promise is satisfied or `timeout` elapses.
    #[must_use]
    pub fn wait_for(&self, timeout: Duration) -> WaitStatus {
        self.wait_until(Instant::now() + timeout)
    }

    /// Blocks until the promise is satisfied or `deadline` passes.
    #[must_use]
    pub fn wait_until(&self, deadline: Instant) -> WaitStatus {
        let mut inner = self.state.inner.lock().expect("future state poisoned");
        while !self.state.ready.load(Ordering::Acquire) {
            let now = Instant::now();
            if now >= deadline {
                return WaitStatus::Timeout;
            }
            let (guard, _result) = self
                .state
                .condvar
                .wait_timeout(inner, deadline - now)
                .expect("future state poisoned");
            inner = guard;
        }
        WaitStatus::Ready
    }

    /// Blocks for the result.
    ///
    /// A value satisfied via [`CoroutinePromise::set_panic`] is re-raised
    /// here, on the waiting thread.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoFutureState`] if another handle already took
    /// the result.
    pub fn get(self) -> Result<T> {
        self.wait();
        let mut inner = self.state.inner.lock().expect("future state poisoned");
        if let Some(payload) = inner.panic.take() {
            drop(inner);
            resume_unwind(payload);
        }
        inner.value.take().ok_or_else(|| {
            Error::new(ErrorKind::NoFutureState).with_context("result already taken")
        })
    }

    /// Registers a completion handler.
    ///
    /// If the future is already ready the handler is posted to the bound
    /// executor immediately; otherwise it is queued and posted on
    /// satisfaction. Handlers never run inline.
    pub fn async_wait<F>(&self, handler: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut inner = self.state.inner.lock().expect("future state poisoned");
        if self.state.ready.load(Ordering::Acquire) {
            drop(inner);
            self.state.executor.post(handler);
        } else {
            inner.handlers.push(Box::new(handler));
        }
    }
}

impl<T: Send + 'static> CoroutineFuture<T> {
    /// Converts into a standard blocking receiver.
    ///
    /// Installs an async-wait that transfers the result, `Ok(value)` or
    /// `Err(panic payload)`, into the returned channel once the promise is
    /// satisfied. The transfer runs on the bound executor.
    #[must_use]
    pub fn into_receiver(self) -> Receiver<thread::Result<T>> {
        let (sender, receiver) = channel();
        let state = Arc::clone(&self.state);
        self.async_wait(move || {
            let mut inner = state.inner.lock().expect("future state poisoned");
            let outcome = if let Some(payload) = inner.panic.take() {
                Err(payload)
            } else {
                match inner.value.take() {
                    Some(value) => Ok(value),
                    None => Err(Box::new("result already taken".to_string())
                        as Box<dyn Any + Send>),
                }
            };
            drop(inner);
            let _ = sender.send(outcome);
        });
        receiver
    }
}

impl<T> Clone for CoroutineFuture<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for CoroutineFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineFuture")
            .field("ready", &self.ready())
            .finish()
    }
}

/// Spawns a coroutine and returns a future for its result.
///
/// The promise is bound to the target strand's executor. A panic in the
/// body is routed into the promise and re-raised by
/// [`CoroutineFuture::get`].
///
/// # Errors
///
/// Returns [`ErrorKind::Internal`] if the coroutine stack thread cannot be
/// spawned.
pub fn spawn_with_future<S, F, T>(target: S, f: F) -> Result<CoroutineFuture<T>>
where
    S: IntoStrand,
    F: FnOnce(CoroutineContext) -> T + Send + 'static,
    T: Send + 'static,
{
    let strand = target.into_strand();
    let promise = CoroutinePromise::new(strand.executor());
    let future = promise.get_future();

    spawn(strand, move |context| {
        let outcome = match catch_unwind(AssertUnwindSafe(move || f(context))) {
            Ok(value) => promise.set_value(value),
            Err(payload) => {
                if payload.downcast_ref::<StackUnwind>().is_some() {
                    resume_unwind(payload);
                }
                promise.set_panic(payload)
            }
        };
        if let Err(err) = outcome {
            debug!(%err, "coroutine result discarded");
        }
    })?;

    Ok(future)
}

/// Drives `executor` until `future` is ready, one task slice at a time.
///
/// Each slice blocks for at most one second; see
/// [`run_until_complete_for`] for an explicit slice. A future that is never
/// satisfied keeps this loop running forever; there is no overall
/// deadline.
pub fn run_until_complete<T>(executor: &Executor, future: CoroutineFuture<T>) -> CoroutineFuture<T> {
    run_until_complete_for(executor, future, Duration::from_secs(1))
}

/// Drives `executor` until `future` is ready, blocking at most `slice` per
/// `run_one_for` call.
///
/// Note that a stopped executor makes `run_one_for` return immediately,
/// turning this loop into a busy spin until the future is satisfied from
/// elsewhere.
pub fn run_until_complete_for<T>(
    executor: &Executor,
    future: CoroutineFuture<T>,
    slice: Duration,
) -> CoroutineFuture<T> {
    while !future.ready() {
        executor.run_one_for(slice);
    }
    future
}
