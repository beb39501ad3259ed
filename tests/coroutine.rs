//! End-to-end coroutine scenarios: timer-style awaits, exception
//! propagation, the error-slot override, and the blocking bridge.

mod common;
use common::*;

use conifer::{
    run_until_complete, run_until_complete_for, spawn, spawn_with_future, ContextTree, Core,
    Error, ErrorKind, ErrorSlot, Executor,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A coroutine awaits a 1-second timer, then returns 1 + 2 + 3.
#[test]
fn coroutine_sum_after_timer() {
    init_test_logging();

    let executor = Executor::new();
    let future = spawn_with_future(&executor, |context| {
        let slot = context.slot::<()>();
        let timer = context.caller(&slot).expect("caller");
        fire_after(Duration::from_secs(1), timer, ());
        slot.get();
        1 + 2 + 3
    })
    .expect("spawn");

    let started = Instant::now();
    let future = run_until_complete(&executor, future);
    assert_eq!(future.get().expect("sum"), 6);
    assert!(started.elapsed() < Duration::from_secs(2));
}

/// A panic in the coroutine body surfaces from the future's `get`.
#[test]
fn coroutine_panic_reaches_the_future() {
    init_test_logging();

    let executor = Executor::new();
    let future = spawn_with_future(&executor, |_context| -> i32 { panic!("boom") })
        .expect("spawn");

    let future = run_until_complete(&executor, future);
    let payload = catch_unwind(AssertUnwindSafe(|| future.get()))
        .expect_err("get must re-raise the coroutine panic");
    assert_eq!(
        conifer::PanicPayload::from_any(payload.as_ref()).message(),
        "boom"
    );
}

/// With an error slot attached, a failed completion does not raise; the
/// caller inspects the slot instead.
#[test]
fn error_slot_redirects_completion_errors() {
    init_test_logging();

    let executor = Executor::new();
    let future = spawn_with_future(&executor, |context| {
        let report = ErrorSlot::new();
        let context = context.with_error_slot(&report);
        let slot = context.fallible_slot::<()>();
        let timer = context.fallible_caller(&slot).expect("caller");
        fail_after(
            Duration::from_millis(50),
            timer,
            Error::new(ErrorKind::Internal).with_context("timer cancelled"),
            (),
        );

        slot.get().expect("redirected error must not raise");
        report.take().expect("error recorded").to_string()
    })
    .expect("spawn");

    let message = run_until_complete(&executor, future).get().expect("value");
    assert_eq!(message, "internal error: timer cancelled");
}

/// Without the override the same completion raises from `get`.
#[test]
fn completion_error_raises_without_override() {
    init_test_logging();

    let executor = Executor::new();
    let future = spawn_with_future(&executor, |context| {
        let slot = context.fallible_slot::<()>();
        let timer = context.fallible_caller(&slot).expect("caller");
        fail_after(
            Duration::from_millis(50),
            timer,
            Error::new(ErrorKind::Internal).with_context("timer cancelled"),
            (),
        );
        slot.get().unwrap_err().kind()
    })
    .expect("spawn");

    let kind = run_until_complete(&executor, future).get().expect("value");
    assert_eq!(kind, ErrorKind::Internal);
}

/// Chained awaits on one coroutine resume in post order on its strand.
#[test]
fn sequential_awaits_keep_strand_order() {
    init_test_logging();

    let executor = Executor::new();
    let future = spawn_with_future(&executor, |context| {
        let mut collected = Vec::new();
        for round in 0..3_u32 {
            let slot = context.slot::<u32>();
            let timer = context.caller(&slot).expect("caller");
            fire_after(Duration::from_millis(20), timer, round);
            collected.push(slot.get());
        }
        collected
    })
    .expect("spawn");

    let collected = run_until_complete_for(&executor, future, Duration::from_millis(100))
        .get()
        .expect("values");
    assert_eq!(collected, vec![0, 1, 2]);
}

/// Coroutines integrate with core-managed executors: spawn onto a context,
/// let its worker drive the coroutine, and read the result elsewhere.
#[test]
fn coroutine_runs_on_a_core_worker() {
    init_test_logging();

    let mut tree = ContextTree::new();
    tree.add_context(0, 1, true).expect("root");
    let core = Core::new(&tree).expect("core");
    let executor = core.executor(0).expect("executor");

    let future = spawn_with_future(&executor, |context| {
        let slot = context.slot::<u32>();
        let timer = context.caller(&slot).expect("caller");
        fire_after(Duration::from_millis(50), timer, 40);
        slot.get() + 2
    })
    .expect("spawn");

    // The core's worker drives the executor; a plain blocking wait is
    // enough on this side.
    let value = future.get().expect("value");
    assert_eq!(value, 42);
    core.stop();
}

/// Spawning from a coroutine context lands on the same executor.
#[test]
fn nested_spawn_shares_the_executor() {
    init_test_logging();

    let executor = Executor::new();
    let hits = Arc::new(AtomicUsize::new(0));

    let outer_hits = Arc::clone(&hits);
    let future = spawn_with_future(&executor, move |context| {
        let inner_hits = Arc::clone(&outer_hits);
        spawn(&context, move |_inner| {
            inner_hits.fetch_add(1, Ordering::SeqCst);
        })
        .expect("nested spawn");
        outer_hits.fetch_add(1, Ordering::SeqCst);
    })
    .expect("spawn");

    let _ = run_until_complete_for(&executor, future, Duration::from_millis(100));
    // Drain the inner coroutine too.
    while executor.run_one_for(Duration::from_millis(100)) > 0 {}
    assert_eq!(hits.load(Ordering::SeqCst), 2);
}
