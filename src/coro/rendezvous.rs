//! Single-slot rendezvous between a coroutine and an external completion.
//!
//! The slot is a single-assignment cell arbitrated by an arrival counter:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                      RENDEZVOUS ARBITRATION                      │
//! │                                                                  │
//! │   consumer (coroutine)                producer (caller)          │
//! │     │                                     │                      │
//! │     │── get(): arrivals 0→1 ── yield      │                      │
//! │     │                                     │── complete(v):       │
//! │     │                                     │   store v,           │
//! │     │◄──────── resume ────────────────────│   arrivals 1→2       │
//! │     │   read v                            │                      │
//! │                                                                  │
//! │   producer first: store v, arrivals 0→1; get() sees 1→2 and     │
//! │   reads v without yielding. A second complete() never re-stores  │
//! │   and never re-resumes.                                          │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Whoever arrives second completes the exchange: if the consumer already
//! yielded, the producer resumes it (posted onto the strand, or inline for
//! the explicitly-unsafe-to-misuse [`InlineCaller`]).

use crate::coro::{CoroData, CoroutineContext};
use crate::error::{Error, Result};
use crate::executor::{Strand, WorkGuard};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

struct Cell<T> {
    value: Option<T>,
    /// Set by the first `complete`; later completions are ignored.
    produced: bool,
    error: Option<Error>,
}

pub(crate) struct SlotState<T> {
    arrivals: AtomicU32,
    cell: Mutex<Cell<T>>,
}

impl<T> SlotState<T> {
    fn new() -> Self {
        Self {
            arrivals: AtomicU32::new(0),
            cell: Mutex::new(Cell {
                value: None,
                produced: false,
                error: None,
            }),
        }
    }

    /// Stores the producer's arms and returns true if the consumer already
    /// yielded and must be resumed now.
    fn produce(&self, error: Option<Error>, value: T) -> bool {
        {
            let mut cell = self.cell.lock().expect("rendezvous cell poisoned");
            if cell.produced {
                return false;
            }
            cell.value = Some(value);
            cell.error = error;
            cell.produced = true;
        }
        self.arrivals.fetch_add(1, Ordering::AcqRel) == 1
    }

    /// Consumer arrival: returns true if the value is already there.
    fn arrive(&self) -> bool {
        self.arrivals.fetch_add(1, Ordering::AcqRel) != 0
    }

    fn take(&self) -> (Option<Error>, T) {
        let mut cell = self.cell.lock().expect("rendezvous cell poisoned");
        let value = cell.value.take().expect("rendezvous value missing");
        (cell.error.take(), value)
    }
}

/// A single-use slot a coroutine waits on for a plain value.
///
/// Created by [`CoroutineContext::slot`]; filled by the matching
/// [`Caller`] or [`InlineCaller`].
pub struct Rendezvous<T> {
    context: CoroutineContext,
    state: Arc<SlotState<T>>,
}

impl<T> Rendezvous<T> {
    pub(crate) fn new(context: CoroutineContext) -> Self {
        Self {
            context,
            state: Arc::new(SlotState::new()),
        }
    }

    pub(crate) fn state(&self) -> Arc<SlotState<T>> {
        Arc::clone(&self.state)
    }

    /// Waits for the value, yielding the coroutine if the completion has
    /// not arrived yet.
    ///
    /// Must be called from inside the owning coroutine.
    pub fn get(self) -> T {
        if !self.state.arrive() {
            self.context.yield_now();
        }
        self.state.take().1
    }
}

impl<T> fmt::Debug for Rendezvous<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rendezvous")
            .field("arrivals", &self.state.arrivals.load(Ordering::Relaxed))
            .finish()
    }
}

/// A single-use slot whose completion carries an error arm.
///
/// Created by [`CoroutineContext::fallible_slot`]; filled by the matching
/// [`FallibleCaller`].
pub struct FallibleRendezvous<T> {
    context: CoroutineContext,
    state: Arc<SlotState<T>>,
}

impl<T> FallibleRendezvous<T> {
    pub(crate) fn new(context: CoroutineContext) -> Self {
        Self {
            context,
            state: Arc::new(SlotState::new()),
        }
    }

    pub(crate) fn state(&self) -> Arc<SlotState<T>> {
        Arc::clone(&self.state)
    }

    /// Waits for the completion and surfaces its error arm.
    ///
    /// Without an attached [`ErrorSlot`](crate::ErrorSlot), a completion
    /// error is returned as `Err`. With one (see
    /// [`CoroutineContext::with_error_slot`]), the error is written to the
    /// slot and the value is returned normally.
    ///
    /// # Errors
    ///
    /// The completion's error, unless redirected.
    pub fn get(self) -> Result<T> {
        if !self.state.arrive() {
            self.context.yield_now();
        }
        let (error, value) = self.state.take();
        match error {
            Some(error) => match self.context.error_slot() {
                Some(slot) => {
                    slot.set(error);
                    Ok(value)
                }
                None => Err(error),
            },
            None => Ok(value),
        }
    }
}

impl<T> fmt::Debug for FallibleRendezvous<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallibleRendezvous")
            .field("arrivals", &self.state.arrivals.load(Ordering::Relaxed))
            .finish()
    }
}

/// Completion callback that resumes the coroutine by posting onto its
/// strand. Safe to invoke from any thread; holds the coroutine (and a work
/// guard on its executor) alive until dropped.
pub struct Caller<T> {
    coro: Arc<CoroData>,
    state: Arc<SlotState<T>>,
    work: Arc<WorkGuard>,
}

impl<T> Caller<T> {
    pub(crate) fn new(coro: Arc<CoroData>, slot: &Rendezvous<T>) -> Self {
        let work = Arc::new(coro.strand().executor().work_guard());
        Self {
            coro,
            state: slot.state(),
            work,
        }
    }

    /// Returns the strand of the coroutine this caller completes.
    #[must_use]
    pub fn strand(&self) -> &Strand {
        self.coro.strand()
    }

    /// Delivers the value. If the coroutine is already waiting, a resume is
    /// posted onto its strand. A second delivery on the same slot is
    /// ignored.
    pub fn complete(&self, value: T) {
        if self.state.produce(None, value) {
            self.coro.post_resume();
        }
    }
}

impl<T> Clone for Caller<T> {
    fn clone(&self) -> Self {
        Self {
            coro: Arc::clone(&self.coro),
            state: Arc::clone(&self.state),
            work: Arc::clone(&self.work),
        }
    }
}

impl<T> fmt::Debug for Caller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Caller")
            .field("executor", self.work.executor())
            .finish()
    }
}

/// Completion callback that resumes the coroutine inline on the invoking
/// thread.
///
/// This is the fast path for completions that already run on the
/// coroutine's strand; invoking it anywhere else bypasses the strand's
/// serialization. Kept as a distinct type so the hazard is visible at the
/// call site.
pub struct InlineCaller<T> {
    coro: Arc<CoroData>,
    state: Arc<SlotState<T>>,
    work: Arc<WorkGuard>,
}

impl<T> InlineCaller<T> {
    pub(crate) fn new(coro: Arc<CoroData>, slot: &Rendezvous<T>) -> Self {
        let work = Arc::new(coro.strand().executor().work_guard());
        Self {
            coro,
            state: slot.state(),
            work,
        }
    }

    /// Delivers the value and, if the coroutine is waiting, resumes it on
    /// the current thread before returning.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::CoroutineExpired`](crate::ErrorKind) if the
    /// coroutine is gone, or
    /// [`ErrorKind::InvalidArgument`](crate::ErrorKind) when invoked while
    /// the coroutine is running (an off-strand invocation).
    pub fn complete(&self, value: T) -> Result<()> {
        if self.state.produce(None, value) {
            self.coro.resume()?;
        }
        Ok(())
    }
}

impl<T> Clone for InlineCaller<T> {
    fn clone(&self) -> Self {
        Self {
            coro: Arc::clone(&self.coro),
            state: Arc::clone(&self.state),
            work: Arc::clone(&self.work),
        }
    }
}

impl<T> fmt::Debug for InlineCaller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InlineCaller")
            .field("executor", self.work.executor())
            .finish()
    }
}

/// Completion callback for a [`FallibleRendezvous`]. Safe to invoke from any
/// thread.
pub struct FallibleCaller<T> {
    coro: Arc<CoroData>,
    state: Arc<SlotState<T>>,
    work: Arc<WorkGuard>,
}

impl<T> FallibleCaller<T> {
    pub(crate) fn new(coro: Arc<CoroData>, slot: &FallibleRendezvous<T>) -> Self {
        let work = Arc::new(coro.strand().executor().work_guard());
        Self {
            coro,
            state: slot.state(),
            work,
        }
    }

    /// Delivers the completion: an optional error arm plus the value, like
    /// an `(error_code, result)` handler pair. A second delivery on the
    /// same slot is ignored.
    pub fn complete(&self, error: Option<Error>, value: T) {
        if self.state.produce(error, value) {
            self.coro.post_resume();
        }
    }

    /// Delivers a successful completion.
    pub fn ok(&self, value: T) {
        self.complete(None, value);
    }
}

impl<T: Default> FallibleCaller<T> {
    /// Delivers a failed completion with a default value arm.
    pub fn fail(&self, error: Error) {
        self.complete(Some(error), T::default());
    }
}

impl<T> Clone for FallibleCaller<T> {
    fn clone(&self) -> Self {
        Self {
            coro: Arc::clone(&self.coro),
            state: Arc::clone(&self.state),
            work: Arc::clone(&self.work),
        }
    }
}

impl<T> fmt::Debug for FallibleCaller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallibleCaller")
            .field("executor", self.work.executor())
            .finish()
    }
}
