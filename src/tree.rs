//! Builder-time context tree: the plan a [`Core`](crate::Core) is built from.
//!
//! A [`ContextTree`] is a flat list of context configurations with
//! parent-child relationships. Ids are assigned densely in creation order;
//! the first context added is the root (id 0) and every later context must
//! name an already-created parent. The tree is a plain value: build it on one
//! thread, then hand it to the core, which copies what it needs.

use crate::error::{Error, ErrorKind, Result};
use std::time::Duration;

/// Identifies a context within a tree and the core built from it.
pub type ContextId = usize;

/// Identifies a worker slot within one context.
pub type WorkerId = usize;

/// How a worker drives an executor on each pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollPolicy {
    /// Ignore this executor (or group of executors) entirely.
    Disabled,
    /// Run at most one ready task per pass. Guarantees round-robin across
    /// multiple targets.
    PollOne,
    /// Run all currently-ready tasks per pass. Speeds up a loaded target at
    /// the cost of slowing the round-robin.
    PollAll,
    /// Block until one task completes. Use only if you know why a blocking
    /// wait cannot freeze this worker.
    RunOne,
}

/// What a worker does after `delay_rounds` passes without executing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayPolicy {
    /// Keep spinning. Fastest reaction, eats a CPU.
    NoDelay,
    /// Yield the thread to the OS scheduler.
    Yield,
    /// Sleep for the configured delay value.
    Sleep,
}

/// Default sleep duration for [`DelayPolicy::Sleep`].
pub const DEFAULT_DELAY: Duration = Duration::from_millis(500);

/// Policy for one worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerParameters {
    /// How to poll the worker's own context.
    pub self_poll: PollPolicy,
    /// How to poll the flattened list of descendant contexts.
    pub children_poll: PollPolicy,
    /// Number of idle passes before the delay policy fires. Normalized to a
    /// minimum of 1.
    pub delay_rounds: usize,
    /// What to do when the idle threshold is reached.
    pub delay_policy: DelayPolicy,
    /// Sleep duration for [`DelayPolicy::Sleep`].
    pub delay_value: Duration,
}

impl WorkerParameters {
    /// Normalizes values to safe defaults.
    ///
    /// Applied whenever parameters are committed to a tree. `delay_rounds`
    /// of 0 becomes 1; everything else passes through.
    pub fn normalize(&mut self) {
        if self.delay_rounds == 0 {
            self.delay_rounds = 1;
        }
    }
}

impl Default for WorkerParameters {
    fn default() -> Self {
        Self {
            self_poll: PollPolicy::PollAll,
            children_poll: PollPolicy::PollOne,
            delay_rounds: 1,
            delay_policy: DelayPolicy::Yield,
            delay_value: DEFAULT_DELAY,
        }
    }
}

/// One planned context node.
#[derive(Debug, Clone)]
pub(crate) struct ContextConfig {
    pub(crate) parent: ContextId,
    pub(crate) children: usize,
    pub(crate) workers: Vec<WorkerParameters>,
    pub(crate) concurrency_hint: Option<usize>,
    pub(crate) enabled: bool,
}

/// The builder: a plan describing contexts, their hierarchy, and workers.
#[derive(Debug, Clone, Default)]
pub struct ContextTree {
    nodes: Vec<ContextConfig>,
}

impl ContextTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a context with `workers` default-parameter worker slots.
    ///
    /// The first context added becomes the root; its parent is recorded as 0
    /// regardless of the argument. Later contexts must name an existing
    /// parent.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::OutOfRange`] if `parent` has not been created
    /// yet.
    pub fn add_context(
        &mut self,
        parent: ContextId,
        workers: usize,
        enabled: bool,
    ) -> Result<ContextId> {
        self.add_context_inner(parent, workers, enabled, None)
    }

    /// Like [`ContextTree::add_context`], with a concurrency hint forwarded
    /// to the context's executor.
    pub fn add_context_with_hint(
        &mut self,
        parent: ContextId,
        workers: usize,
        enabled: bool,
        concurrency_hint: usize,
    ) -> Result<ContextId> {
        self.add_context_inner(parent, workers, enabled, Some(concurrency_hint))
    }

    fn add_context_inner(
        &mut self,
        parent: ContextId,
        workers: usize,
        enabled: bool,
        concurrency_hint: Option<usize>,
    ) -> Result<ContextId> {
        let new_id = self.nodes.len();
        let parent = if new_id == 0 { 0 } else { parent };
        if parent >= new_id && new_id != 0 {
            return Err(Error::new(ErrorKind::OutOfRange)
                .with_context(format!("parent context {parent} does not exist")));
        }

        self.nodes.push(ContextConfig {
            parent,
            children: 0,
            workers: vec![WorkerParameters::default(); workers],
            concurrency_hint,
            enabled,
        });
        if new_id != 0 {
            self.nodes[parent].children += 1;
        }
        Ok(new_id)
    }

    /// Replaces the parameters of an existing worker slot.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::OutOfRange`] for an unknown context or slot.
    pub fn set_worker_parameters(
        &mut self,
        context: ContextId,
        worker: WorkerId,
        parameters: WorkerParameters,
    ) -> Result<()> {
        let node = self.node_mut(context)?;
        let slot = node.workers.get_mut(worker).ok_or_else(|| {
            Error::new(ErrorKind::OutOfRange)
                .with_context(format!("context {context} has no worker slot {worker}"))
        })?;
        *slot = parameters;
        slot.normalize();
        Ok(())
    }

    /// Adds a worker slot with default parameters, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::OutOfRange`] for an unknown context.
    pub fn add_worker(&mut self, context: ContextId) -> Result<WorkerId> {
        self.add_worker_with(context, WorkerParameters::default())
    }

    /// Adds a worker slot with the given parameters, returning its id.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::OutOfRange`] for an unknown context.
    pub fn add_worker_with(
        &mut self,
        context: ContextId,
        mut parameters: WorkerParameters,
    ) -> Result<WorkerId> {
        parameters.normalize();
        let node = self.node_mut(context)?;
        let worker_id = node.workers.len();
        node.workers.push(parameters);
        Ok(worker_id)
    }

    /// Returns the number of contexts in the plan.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if no contexts have been added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn nodes(&self) -> &[ContextConfig] {
        &self.nodes
    }

    fn node_mut(&mut self, context: ContextId) -> Result<&mut ContextConfig> {
        self.nodes.get_mut(context).ok_or_else(|| {
            Error::new(ErrorKind::OutOfRange).with_context(format!("unknown context id {context}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_context_is_root_with_self_parent() {
        let mut tree = ContextTree::new();
        // Any parent argument is accepted for the root and recorded as 0.
        let root = tree.add_context(42, 1, true).expect("root");
        assert_eq!(root, 0);
        assert_eq!(tree.nodes()[0].parent, 0);
        assert_eq!(tree.nodes()[0].workers.len(), 1);
    }

    #[test]
    fn dense_ids_and_parent_before_child() {
        let mut tree = ContextTree::new();
        let root = tree.add_context(0, 0, true).expect("root");
        let a = tree.add_context(root, 0, true).expect("a");
        let b = tree.add_context(a, 0, true).expect("b");
        assert_eq!((root, a, b), (0, 1, 2));
        for (id, node) in tree.nodes().iter().enumerate().skip(1) {
            assert!(node.parent < id);
        }
        assert_eq!(tree.nodes()[0].children, 1);
        assert_eq!(tree.nodes()[1].children, 1);
    }

    #[test]
    fn forward_parent_reference_is_rejected() {
        let mut tree = ContextTree::new();
        tree.add_context(0, 0, true).expect("root");
        let err = tree.add_context(5, 0, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(tree.context_count(), 1);
    }

    #[test]
    fn worker_parameters_are_normalized_on_commit() {
        let mut tree = ContextTree::new();
        let root = tree.add_context(0, 1, true).expect("root");

        let params = WorkerParameters {
            delay_rounds: 0,
            ..WorkerParameters::default()
        };
        tree.set_worker_parameters(root, 0, params.clone())
            .expect("set");
        assert_eq!(tree.nodes()[0].workers[0].delay_rounds, 1);

        let slot = tree.add_worker_with(root, params).expect("add");
        assert_eq!(slot, 1);
        assert_eq!(tree.nodes()[0].workers[1].delay_rounds, 1);
    }

    #[test]
    fn unknown_context_or_slot_is_rejected() {
        let mut tree = ContextTree::new();
        let root = tree.add_context(0, 0, true).expect("root");

        assert_eq!(
            tree.add_worker(7).unwrap_err().kind(),
            ErrorKind::OutOfRange
        );
        assert_eq!(
            tree.set_worker_parameters(root, 3, WorkerParameters::default())
                .unwrap_err()
                .kind(),
            ErrorKind::OutOfRange
        );
    }

    #[test]
    fn concurrency_hint_is_kept() {
        let mut tree = ContextTree::new();
        tree.add_context_with_hint(0, 0, true, 2).expect("root");
        assert_eq!(tree.nodes()[0].concurrency_hint, Some(2));
    }
}
