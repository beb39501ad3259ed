//! Future/promise bridge scenarios across threads and executors.

mod common;
use common::*;

use conifer::{
    spawn_with_future, ContextGroup, ContextTree, Core, CoroutinePromise, Executor, WaitStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Async-wait handlers run on the promise's bound executor, which here is
/// drained by a known, named worker thread.
#[test]
fn async_wait_handlers_run_on_the_bound_executor() {
    init_test_logging();

    let mut tree = ContextTree::new();
    tree.add_context(0, 1, true).expect("root");
    let core = Core::new(&tree).expect("core");
    let executor = core.executor(0).expect("executor");

    let promise = CoroutinePromise::new(&executor);
    let future = promise.get_future();

    let handler_thread = Arc::new(Mutex::new(None::<String>));
    {
        let handler_thread = Arc::clone(&handler_thread);
        future.async_wait(move || {
            *handler_thread.lock().unwrap() = thread::current().name().map(String::from);
        });
    }

    // Satisfy from the main thread; the handler must not run inline here.
    promise.set_value(1).expect("set");
    assert!(wait_until(Duration::from_secs(2), || {
        handler_thread.lock().unwrap().is_some()
    }));

    let name = handler_thread.lock().unwrap().clone().expect("name");
    assert!(
        name.starts_with("conifer-ctx0-w0"),
        "handler ran on {name}, expected the context worker"
    );
    core.stop();
}

/// Timed waits report timeouts without disturbing the computation.
#[test]
fn timed_wait_then_completion() {
    init_test_logging();

    let executor = Executor::new();
    let future = spawn_with_future(&executor, |context| {
        let slot = context.slot::<()>();
        let timer = context.caller(&slot).expect("caller");
        fire_after(Duration::from_millis(150), timer, ());
        slot.get();
        "done"
    })
    .expect("spawn");

    // Drive from a helper thread so the main thread can block on the future.
    let driver = {
        let executor = executor.clone();
        let future = future.clone();
        thread::spawn(move || {
            while !future.ready() {
                executor.run_one_for(Duration::from_millis(50));
            }
        })
    };

    assert_eq!(
        future.wait_for(Duration::from_millis(20)),
        WaitStatus::Timeout
    );
    assert_eq!(future.wait_for(Duration::from_secs(2)), WaitStatus::Ready);
    assert_eq!(future.get().expect("value"), "done");
    driver.join().expect("driver panicked");
}

/// The standard-receiver conversion delivers coroutine results to plain
/// blocking code.
#[test]
fn receiver_bridge_from_a_core_worker() {
    init_test_logging();

    let mut tree = ContextTree::new();
    tree.add_context(0, 1, true).expect("root");
    let core = Core::new(&tree).expect("core");
    let executor = core.executor(0).expect("executor");

    let future = spawn_with_future(&executor, |context| {
        let slot = context.slot::<u32>();
        let timer = context.caller(&slot).expect("caller");
        fire_after(Duration::from_millis(30), timer, 5);
        slot.get() * 3
    })
    .expect("spawn");

    let receiver = future.into_receiver();
    let value = receiver
        .recv_timeout(Duration::from_secs(2))
        .expect("result in time")
        .expect("value, not panic");
    assert_eq!(value, 15);
    core.stop();
}

/// Round-robin distribution of coroutines over a group of context
/// executors.
#[test]
fn group_distributes_coroutines_round_robin() {
    init_test_logging();

    let mut tree = ContextTree::new();
    let root = tree.add_context(0, 0, true).expect("root");
    let a = tree.add_context(root, 1, true).expect("a");
    let b = tree.add_context(root, 1, true).expect("b");
    let c = tree.add_context(root, 1, true).expect("c");

    let core = Core::new(&tree).expect("core");
    let group = ContextGroup::new([
        core.executor(a).expect("a"),
        core.executor(b).expect("b"),
        core.executor(c).expect("c"),
    ]);
    assert_eq!(group.size(), 3);

    let hits = Arc::new(AtomicUsize::new(0));
    let mut futures = Vec::new();
    for _ in 0..6 {
        let executor = group.next().expect("next");
        let hits = Arc::clone(&hits);
        futures.push(
            spawn_with_future(&executor, move |_context| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .expect("spawn"),
        );
    }

    for future in futures {
        future.get().expect("coroutine finished");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 6);

    // Rotation continues where it left off: six next() calls later we are
    // back at executor `a`.
    assert!(group.next().expect("next").same(&core.executor(a).expect("a")));
    core.stop();
}
