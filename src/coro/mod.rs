//! Stackful coroutines bound to a strand.
//!
//! A coroutine is a callable running on its own dedicated stack (an OS
//! thread used purely as a stack), serialized through a [`Strand`]. The
//! coroutine can synchronously wait for a single rendezvous value filled in
//! by an external completion callback; see [`Rendezvous`] and
//! [`CoroutineContext::caller`].
//!
//! # Handoff discipline
//!
//! Exactly one side is runnable at any time. Resuming blocks the resumer
//! (a strand task) until the coroutine yields or finishes, so the coroutine
//! body always executes *on the strand* in the logical sense: no other
//! strand task runs concurrently with it. A panic in the body is captured
//! and re-raised on the side that performed the resume.
//!
//! # Lifetime
//!
//! The body holds only a weak reference to its own control block. Strong
//! ownership lives in posted resume closures and outstanding caller handles;
//! when the last of those is dropped the parked coroutine is woken and its
//! stack unwinds without running further body code.

mod rendezvous;

pub mod future;

pub use rendezvous::{Caller, FallibleCaller, FallibleRendezvous, InlineCaller, Rendezvous};

use crate::error::{Error, ErrorKind, Result};
use crate::executor::{Executor, Strand};
use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, panic_any, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::thread::{self, ThreadId};
use tracing::trace;

/// Payload used to unwind an abandoned coroutine's stack. Never stored as a
/// user panic.
pub(crate) struct StackUnwind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandoffState {
    /// Coroutine thread is parked, waiting for a resume.
    Parked,
    /// Coroutine body is executing; the resumer is blocked.
    Running,
    /// Body returned (or unwound); the coroutine cannot be resumed again.
    Finished,
    /// All strong references vanished while parked; the thread must unwind.
    Abandoned,
}

struct Handoff {
    state: Mutex<HandoffState>,
    condvar: Condvar,
}

pub(crate) struct CoroShared {
    handoff: Handoff,
    /// Captured panic from the body, re-raised by the next resume.
    panic_slot: Mutex<Option<Box<dyn Any + Send>>>,
    /// Thread id of the coroutine stack, set once the thread starts.
    thread_id: OnceLock<ThreadId>,
}

impl CoroShared {
    fn new() -> Self {
        Self {
            handoff: Handoff {
                state: Mutex::new(HandoffState::Parked),
                condvar: Condvar::new(),
            },
            panic_slot: Mutex::new(None),
            thread_id: OnceLock::new(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, HandoffState> {
        self.handoff.state.lock().expect("coroutine handoff poisoned")
    }
}

/// Control block for one live coroutine. Strong references keep the
/// coroutine resumable; dropping the last one abandons it.
pub(crate) struct CoroData {
    shared: Arc<CoroShared>,
    strand: Strand,
}

impl CoroData {
    pub(crate) fn strand(&self) -> &Strand {
        &self.strand
    }

    /// Resumes the coroutine and blocks until it yields or finishes.
    ///
    /// Re-raises a panic captured from the body. Must run serialized with
    /// respect to the coroutine (on its strand, or via an inline caller that
    /// is already on it).
    pub(crate) fn resume(&self) -> Result<()> {
        let mut state = self.shared.lock_state();
        match *state {
            HandoffState::Parked => {
                *state = HandoffState::Running;
                self.shared.handoff.condvar.notify_all();
                while *state == HandoffState::Running {
                    state = self
                        .shared
                        .handoff
                        .condvar
                        .wait(state)
                        .expect("coroutine handoff poisoned");
                }
                let finished = *state == HandoffState::Finished;
                drop(state);
                if finished {
                    let payload = self
                        .shared
                        .panic_slot
                        .lock()
                        .expect("coroutine panic slot poisoned")
                        .take();
                    if let Some(payload) = payload {
                        resume_unwind(payload);
                    }
                }
                Ok(())
            }
            HandoffState::Running => Err(Error::new(ErrorKind::InvalidArgument)
                .with_context("coroutine resumed while it is running")),
            HandoffState::Finished | HandoffState::Abandoned => {
                Err(Error::new(ErrorKind::CoroutineExpired))
            }
        }
    }

    /// Posts a resume onto the coroutine's strand.
    ///
    /// A resume that finds the coroutine already gone is dropped; the
    /// completion it carried has no one left to deliver to.
    pub(crate) fn post_resume(self: &Arc<Self>) {
        let coro = Arc::clone(self);
        self.strand.post(move || {
            if let Err(err) = coro.resume() {
                trace!(%err, "posted resume skipped");
            }
        });
    }
}

impl Drop for CoroData {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        if *state == HandoffState::Parked {
            *state = HandoffState::Abandoned;
            self.shared.handoff.condvar.notify_all();
        }
    }
}

/// Writable slot for routing completion errors around the raising path.
///
/// Attach one with [`CoroutineContext::with_error_slot`]: fallible
/// rendezvous reads on the resulting context write the completion error here
/// and return the value normally instead of failing.
#[derive(Clone, Debug, Default)]
pub struct ErrorSlot {
    inner: Arc<Mutex<Option<Error>>>,
}

impl ErrorSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an error, replacing any previous one.
    pub fn set(&self, error: Error) {
        *self.inner.lock().expect("error slot poisoned") = Some(error);
    }

    /// Takes the stored error, leaving the slot empty.
    #[must_use]
    pub fn take(&self) -> Option<Error> {
        self.inner.lock().expect("error slot poisoned").take()
    }

    /// Returns true if an error is stored.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.lock().expect("error slot poisoned").is_some()
    }
}

/// The handle a coroutine body receives.
///
/// Exposes the bound strand, rendezvous slot constructors, and completion
/// callbacks tied to those slots. Cloneable; clones share the same
/// coroutine.
#[derive(Clone)]
pub struct CoroutineContext {
    coro: Weak<CoroData>,
    shared: Arc<CoroShared>,
    strand: Strand,
    error_slot: Option<ErrorSlot>,
}

impl CoroutineContext {
    /// Returns the strand this coroutine is serialized on.
    #[must_use]
    pub fn strand(&self) -> &Strand {
        &self.strand
    }

    /// Returns the executor hosting the coroutine's strand.
    #[must_use]
    pub fn executor(&self) -> &Executor {
        self.strand.executor()
    }

    /// Creates a rendezvous slot for a single value of type `T`.
    #[must_use]
    pub fn slot<T>(&self) -> Rendezvous<T> {
        Rendezvous::new(self.clone())
    }

    /// Creates a rendezvous slot whose completion carries an error arm.
    #[must_use]
    pub fn fallible_slot<T>(&self) -> FallibleRendezvous<T> {
        FallibleRendezvous::new(self.clone())
    }

    /// Produces a completion callback for `slot` that resumes the coroutine
    /// by posting onto its strand. Safe to invoke from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::CoroutineExpired`] if the coroutine is gone.
    pub fn caller<T>(&self, slot: &Rendezvous<T>) -> Result<Caller<T>> {
        Ok(Caller::new(self.upgrade()?, slot))
    }

    /// Produces a completion callback that resumes the coroutine inline,
    /// on the invoking thread.
    ///
    /// Only correct when the invoker already runs on the coroutine's strand;
    /// anything else loses the strand's serialization. The posted
    /// [`CoroutineContext::caller`] is the safe default.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::CoroutineExpired`] if the coroutine is gone.
    pub fn inline_caller<T>(&self, slot: &Rendezvous<T>) -> Result<InlineCaller<T>> {
        Ok(InlineCaller::new(self.upgrade()?, slot))
    }

    /// Produces a completion callback for a fallible slot. Safe to invoke
    /// from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::CoroutineExpired`] if the coroutine is gone.
    pub fn fallible_caller<T>(&self, slot: &FallibleRendezvous<T>) -> Result<FallibleCaller<T>> {
        Ok(FallibleCaller::new(self.upgrade()?, slot))
    }

    /// Returns a sibling context that routes completion errors through
    /// `slot` instead of returning them from `get`.
    #[must_use]
    pub fn with_error_slot(&self, slot: &ErrorSlot) -> Self {
        let mut sibling = self.clone();
        sibling.error_slot = Some(slot.clone());
        sibling
    }

    pub(crate) fn error_slot(&self) -> Option<&ErrorSlot> {
        self.error_slot.as_ref()
    }

    /// Parks the coroutine until the next resume.
    ///
    /// # Panics
    ///
    /// Panics when called from outside the coroutine's own stack; yielding
    /// someone else's thread would corrupt the handoff.
    pub(crate) fn yield_now(&self) {
        assert_eq!(
            self.shared.thread_id.get().copied(),
            Some(thread::current().id()),
            "rendezvous wait outside its coroutine"
        );
        let mut state = self.shared.lock_state();
        debug_assert_eq!(*state, HandoffState::Running);
        *state = HandoffState::Parked;
        self.shared.handoff.condvar.notify_all();
        while *state == HandoffState::Parked {
            state = self
                .shared
                .handoff
                .condvar
                .wait(state)
                .expect("coroutine handoff poisoned");
        }
        if *state == HandoffState::Abandoned {
            drop(state);
            panic_any(StackUnwind);
        }
    }

    fn upgrade(&self) -> Result<Arc<CoroData>> {
        self.coro
            .upgrade()
            .ok_or_else(|| Error::new(ErrorKind::CoroutineExpired))
    }
}

impl fmt::Debug for CoroutineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineContext")
            .field("alive", &(self.coro.strong_count() > 0))
            .field("error_slot", &self.error_slot.is_some())
            .finish()
    }
}

/// Where a spawned coroutine is serialized.
///
/// Implemented for [`Strand`] (attach to it), [`&Executor`](Executor) (a
/// fresh strand is created), and [`&CoroutineContext`](CoroutineContext) (a
/// fresh strand on the sibling's executor).
pub trait IntoStrand {
    /// Resolves the spawn target to a strand.
    fn into_strand(self) -> Strand;
}

impl IntoStrand for Strand {
    fn into_strand(self) -> Strand {
        self
    }
}

impl IntoStrand for &Strand {
    fn into_strand(self) -> Strand {
        self.clone()
    }
}

impl IntoStrand for &Executor {
    fn into_strand(self) -> Strand {
        Strand::new(self)
    }
}

impl IntoStrand for &CoroutineContext {
    fn into_strand(self) -> Strand {
        Strand::new(self.strand().executor())
    }
}

/// Options for the coroutine's stack thread.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Stack size in bytes; the platform default when `None`.
    pub stack_size: Option<usize>,
    /// Thread name; `"conifer-coro"` when `None`.
    pub name: Option<String>,
}

/// Spawns a coroutine on the given target with default stack options.
///
/// The callable runs inside the coroutine once the first resume is executed
/// on the strand. Arguments are captured by the closure; wrap shared state
/// in `Arc`/`Mutex` as usual.
///
/// # Errors
///
/// Returns [`ErrorKind::Internal`] if the OS refuses to spawn the stack
/// thread.
pub fn spawn<S, F>(target: S, f: F) -> Result<()>
where
    S: IntoStrand,
    F: FnOnce(CoroutineContext) + Send + 'static,
{
    spawn_with_options(target, SpawnOptions::default(), f)
}

/// Spawns a coroutine with explicit stack options.
///
/// # Errors
///
/// Returns [`ErrorKind::Internal`] if the OS refuses to spawn the stack
/// thread.
pub fn spawn_with_options<S, F>(target: S, options: SpawnOptions, f: F) -> Result<()>
where
    S: IntoStrand,
    F: FnOnce(CoroutineContext) + Send + 'static,
{
    let strand = target.into_strand();
    let shared = Arc::new(CoroShared::new());
    let coro = Arc::new(CoroData {
        shared: Arc::clone(&shared),
        strand: strand.clone(),
    });
    let context = CoroutineContext {
        coro: Arc::downgrade(&coro),
        shared: Arc::clone(&shared),
        strand,
        error_slot: None,
    };

    let mut builder =
        thread::Builder::new().name(options.name.unwrap_or_else(|| "conifer-coro".to_string()));
    if let Some(stack_size) = options.stack_size {
        builder = builder.stack_size(stack_size);
    }
    builder
        .spawn(move || coroutine_main(&shared, context, f))
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_context("failed to spawn coroutine stack thread")
                .with_source(err)
        })?;

    coro.post_resume();
    Ok(())
}

/// Body of the coroutine stack thread: settle, wait for the first resume,
/// run, publish the outcome.
fn coroutine_main<F>(shared: &Arc<CoroShared>, context: CoroutineContext, f: F)
where
    F: FnOnce(CoroutineContext),
{
    shared
        .thread_id
        .set(thread::current().id())
        .expect("coroutine thread id set twice");

    let run = {
        let mut state = shared.lock_state();
        while *state == HandoffState::Parked {
            state = shared
                .handoff
                .condvar
                .wait(state)
                .expect("coroutine handoff poisoned");
        }
        *state == HandoffState::Running
    };

    if run {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || f(context))) {
            if payload.downcast_ref::<StackUnwind>().is_none() {
                *shared
                    .panic_slot
                    .lock()
                    .expect("coroutine panic slot poisoned") = Some(payload);
            }
        }
    }

    let mut state = shared.lock_state();
    *state = HandoffState::Finished;
    shared.handoff.condvar.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn drive_until<F: Fn() -> bool>(executor: &Executor, ready: F) {
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !ready() {
            executor.run_one_for(Duration::from_millis(50));
            assert!(std::time::Instant::now() < deadline, "test timed out");
        }
    }

    #[test]
    fn body_runs_on_the_strand() {
        let executor = Executor::new();
        let ran = Arc::new(AtomicBool::new(false));

        let seen = Arc::clone(&ran);
        spawn(&executor, move |_context| {
            seen.store(true, Ordering::SeqCst);
        })
        .expect("spawn");

        drive_until(&executor, || ran.load(Ordering::SeqCst));
    }

    #[test]
    fn spawn_from_context_shares_the_executor() {
        let executor = Executor::new();
        let inner_ran = Arc::new(AtomicBool::new(false));

        let seen = Arc::clone(&inner_ran);
        let outer = executor.clone();
        spawn(&executor, move |context| {
            assert!(context.executor().same(&outer));
            let seen = Arc::clone(&seen);
            spawn(&context, move |_inner| {
                seen.store(true, Ordering::SeqCst);
            })
            .expect("nested spawn");
        })
        .expect("spawn");

        drive_until(&executor, || inner_ran.load(Ordering::SeqCst));
    }

    #[test]
    fn body_panic_reaches_the_resumer() {
        let executor = Executor::new();
        spawn(&executor, |_context| panic!("boom")).expect("spawn");

        let result = catch_unwind(AssertUnwindSafe(|| {
            while executor.run_one_for(Duration::from_millis(100)) > 0 {}
        }));
        let payload = result.expect_err("panic should cross the resume boundary");
        assert_eq!(crate::PanicPayload::from_any(payload.as_ref()).message(), "boom");
    }

    #[test]
    fn abandoned_coroutine_unwinds_its_stack() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let executor = Executor::new();
        let unwound = Arc::new(AtomicBool::new(false));
        let parked = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&unwound);
        let entered = Arc::clone(&parked);
        spawn(&executor, move |context| {
            let _guard = SetOnDrop(flag);
            let slot = context.slot::<()>();
            // No caller is ever created: once the initial resume closure is
            // consumed, nothing holds the coroutine alive.
            entered.store(true, Ordering::SeqCst);
            slot.get();
            unreachable!("abandoned coroutine must not resume");
        })
        .expect("spawn");

        drive_until(&executor, || parked.load(Ordering::SeqCst));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !unwound.load(Ordering::SeqCst) {
            assert!(std::time::Instant::now() < deadline, "stack never unwound");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn caller_on_finished_coroutine_is_expired() {
        let executor = Executor::new();
        let escaped: Arc<Mutex<Option<CoroutineContext>>> = Arc::new(Mutex::new(None));

        let stash = Arc::clone(&escaped);
        spawn(&executor, move |context| {
            *stash.lock().unwrap() = Some(context);
        })
        .expect("spawn");

        drive_until(&executor, || escaped.lock().unwrap().is_some());

        let context = escaped.lock().unwrap().take().expect("context");
        let slot = context.slot::<u32>();
        let err = context.caller(&slot).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CoroutineExpired);
    }
}
