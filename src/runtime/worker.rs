//! The worker loop: policy-driven polling of a context and its descendants.

use super::{CoreInner, State};
use crate::error::PanicPayload;
use crate::executor::Executor;
use crate::tree::{DelayPolicy, PollPolicy, WorkerParameters};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread;
use tracing::{trace, warn};

/// Body of one worker thread, bound to `(context, worker slot)`.
pub(super) fn worker_run(core: &CoreInner, node_id: usize, slot: usize) {
    let node = &core.nodes[node_id];
    let params = &node.params[slot];

    let self_target = if params.self_poll != PollPolicy::Disabled && node.enabled {
        Some(node.executor.clone())
    } else {
        None
    };
    let children_targets = if params.children_poll != PollPolicy::Disabled {
        collect_descendants(core, node_id)
    } else {
        Vec::new()
    };

    trace!(
        context = node_id,
        slot,
        descendants = children_targets.len(),
        "worker online"
    );

    if children_targets.is_empty() && self_target.is_some() {
        run_single(core, params, &self_target.expect("self target present"));
    } else if children_targets.len() == 1 && self_target.is_none() {
        run_single(core, params, &children_targets[0]);
    } else if !children_targets.is_empty() || self_target.is_some() {
        run_multi(core, params, self_target.as_ref(), &children_targets);
    }

    trace!(context = node_id, slot, "worker offline");
}

/// Flattens the enabled descendants of `node_id` in breadth-first order.
///
/// A disabled node is skipped but still traversed: its enabled descendants
/// remain reachable.
fn collect_descendants(core: &CoreInner, node_id: usize) -> Vec<Executor> {
    let mut targets = Vec::new();
    let mut queue: VecDeque<usize> = core.nodes[node_id].children.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        let node = &core.nodes[id];
        if node.enabled {
            targets.push(node.executor.clone());
        }
        queue.extend(node.children.iter().copied());
    }
    targets
}

/// Single-target fast path: nothing to multiplex, so block inside `run`.
///
/// The delay only fires when the executor is stopped (by `stop` or by
/// running out of work) and `run` starts returning without doing anything.
fn run_single(core: &CoreInner, params: &WorkerParameters, executor: &Executor) {
    let mut wait_rounds = 0;
    while core.state() != State::Stopping {
        if wait_rounds >= params.delay_rounds {
            wait_rounds = 0;
            apply_delay(params);
        }
        let _ = guarded_poll(core, || executor.run());
        if executor.stopped() {
            wait_rounds += 1;
        }
    }
}

/// Multi-target loop: poll self first, then every descendant in stable BFS
/// order. An idle pass bumps the wait counter toward the delay policy.
fn run_multi(
    core: &CoreInner,
    params: &WorkerParameters,
    self_target: Option<&Executor>,
    children_targets: &[Executor],
) {
    let mut wait_rounds = 0;
    while core.state() != State::Stopping {
        if wait_rounds >= params.delay_rounds {
            wait_rounds = 0;
            apply_delay(params);
        }

        let mut executed = 0;
        if let Some(executor) = self_target {
            executed += guarded_poll(core, || poll_with(executor, params.self_poll));
        }
        for executor in children_targets {
            executed += guarded_poll(core, || poll_with(executor, params.children_poll));
        }

        if executed == 0 {
            wait_rounds += 1;
        }
    }
}

/// Maps a poll policy to the executor entry point it names.
fn poll_with(executor: &Executor, policy: PollPolicy) -> usize {
    match policy {
        PollPolicy::Disabled => 0,
        PollPolicy::PollOne => executor.poll_one(),
        PollPolicy::PollAll => executor.poll(),
        PollPolicy::RunOne => executor.run_one(),
    }
}

/// Runs one poll call, routing a task panic to the core's panic handler.
///
/// A panicking task counts as zero executed and never takes the worker
/// down; without a handler the panic is logged and swallowed.
fn guarded_poll<F>(core: &CoreInner, poll: F) -> usize
where
    F: FnOnce() -> usize,
{
    match catch_unwind(AssertUnwindSafe(poll)) {
        Ok(executed) => executed,
        Err(payload) => {
            let payload = PanicPayload::from_any(payload.as_ref());
            match &core.panic_handler {
                Some(handler) => handler(&payload),
                None => warn!(%payload, "task panicked; no handler installed"),
            }
            0
        }
    }
}

fn apply_delay(params: &WorkerParameters) {
    match params.delay_policy {
        DelayPolicy::NoDelay => {}
        DelayPolicy::Yield => thread::yield_now(),
        DelayPolicy::Sleep => thread::sleep(params.delay_value),
    }
}
