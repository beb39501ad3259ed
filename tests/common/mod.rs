#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use conifer::{Caller, FallibleCaller};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

static INIT_LOGGING: Once = Once::new();

/// Initializes tracing output for tests. Safe to call from every test.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Emulates a timer completion: fires `caller` with `value` after `delay`.
///
/// The caller's work guard keeps the executor alive while the timer is
/// pending, like a real pending async operation would.
pub fn fire_after<T: Send + 'static>(delay: Duration, caller: Caller<T>, value: T) {
    thread::spawn(move || {
        thread::sleep(delay);
        caller.complete(value);
    });
}

/// Emulates a failing timer: fires the fallible `caller` after `delay`.
pub fn fail_after<T: Send + 'static>(
    delay: Duration,
    caller: FallibleCaller<T>,
    error: conifer::Error,
    value: T,
) {
    thread::spawn(move || {
        thread::sleep(delay);
        caller.complete(Some(error), value);
    });
}

/// Polls `ready` until it returns true or `timeout` elapses.
pub fn wait_until<F: Fn() -> bool>(timeout: Duration, ready: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if ready() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    ready()
}
