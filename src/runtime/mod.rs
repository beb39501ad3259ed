//! The context forest scheduler.
//!
//! A [`Core`] is built from a [`ContextTree`] plan: one executor per context,
//! arranged as a rooted tree, with a configured set of worker threads per
//! context. Workers poll their own context and/or the flattened list of
//! descendant contexts according to per-worker [`WorkerParameters`]; a pool
//! of generalist workers near the root absorbs spill-over from loaded
//! children in both directions.
//!
//! # Lifecycle
//!
//! ```text
//! idle ──start()──► starting ──► running ──stop()──► stopping ──► idle
//! ```
//!
//! `start` launches workers in reverse breadth-first order so descendants
//! are armed with their work guards before any parent worker begins polling
//! them. `stop` drops every work guard, stops every executor, and joins the
//! workers. Transitions are serialized by a stop mutex; `join` lets another
//! thread park until a concurrent `stop` completes.

mod worker;

use crate::error::{Error, ErrorKind, PanicHandler, Result};
use crate::executor::{Executor, WorkGuard};
use crate::tree::{ContextId, ContextTree, WorkerParameters};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::debug;

/// Lifecycle state of a [`Core`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// No workers exist; the core can be started.
    Idle = 0,
    /// `start` is launching workers.
    Starting = 1,
    /// Workers are polling.
    Running = 2,
    /// `stop` is tearing workers down.
    Stopping = 3,
}

impl State {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::Stopping,
        }
    }
}

/// Construction options for a [`Core`].
#[derive(Clone)]
pub struct CoreOptions {
    /// Handler invoked on the polling worker thread when a task panics.
    /// Without one, task panics are logged and swallowed.
    pub panic_handler: Option<PanicHandler>,
    /// Start the core inside the constructor. Defaults to true.
    pub start_immediately: bool,
    /// Worker thread name prefix.
    pub thread_name_prefix: String,
}

impl Default for CoreOptions {
    fn default() -> Self {
        Self {
            panic_handler: None,
            start_immediately: true,
            thread_name_prefix: "conifer".to_string(),
        }
    }
}

impl fmt::Debug for CoreOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreOptions")
            .field("panic_handler", &self.panic_handler.is_some())
            .field("start_immediately", &self.start_immediately)
            .field("thread_name_prefix", &self.thread_name_prefix)
            .finish()
    }
}

/// One runtime context: an executor plus its workers and child links.
struct Node {
    executor: Executor,
    /// Child ids, in creation order. Immutable after construction.
    children: Vec<ContextId>,
    params: Vec<WorkerParameters>,
    enabled: bool,
    /// Present while the core is running.
    guard: Mutex<Option<WorkGuard>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

struct CoreInner {
    nodes: Vec<Node>,
    state: AtomicU8,
    stop_mutex: Mutex<()>,
    join_mutex: Mutex<()>,
    joined: AtomicBool,
    panic_handler: Option<PanicHandler>,
    thread_name_prefix: String,
}

impl CoreInner {
    fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Breadth-first order of context ids from the root.
    fn bfs_order(&self) -> Vec<ContextId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        order.push(0);
        let mut next = 0;
        while next < order.len() {
            let id = order[next];
            order.extend(self.nodes[id].children.iter().copied());
            next += 1;
        }
        order
    }

    /// Arms work guards and spawns workers, deepest ranks first, root last.
    ///
    /// By the time a parent worker starts polling descendants, those
    /// descendants already hold their own guards, so tasks posted to them
    /// cannot be dropped during startup.
    fn start_workers(self: &Arc<Self>) -> Result<()> {
        let order = self.bfs_order();
        for &id in order.iter().rev() {
            let node = &self.nodes[id];
            {
                let mut guard = node.guard.lock().expect("work guard slot poisoned");
                if guard.is_none() {
                    node.executor.restart();
                    *guard = Some(node.executor.work_guard());
                }
            }
            for slot in 0..node.params.len() {
                let name = format!("{}-ctx{id}-w{slot}", self.thread_name_prefix);
                let inner = Arc::clone(self);
                let handle = thread::Builder::new()
                    .name(name)
                    .spawn(move || worker::worker_run(&inner, id, slot))
                    .map_err(|err| {
                        Error::new(ErrorKind::Internal)
                            .with_context(format!("failed to spawn worker {slot} of context {id}"))
                            .with_source(err)
                    })?;
                node.workers
                    .lock()
                    .expect("worker list poisoned")
                    .push(handle);
            }
        }
        Ok(())
    }

    /// Releases every work guard, then stops every executor.
    ///
    /// The guard drop happens-before the stop, so a blocked `run` observes
    /// a drained executor rather than re-arming.
    fn stop_workers(&self) {
        for node in &self.nodes {
            node.guard.lock().expect("work guard slot poisoned").take();
        }
        for node in &self.nodes {
            node.executor.stop();
        }
    }

    /// Joins every worker thread. Returns false if another joiner won the
    /// latch.
    fn join_workers(&self) -> bool {
        if self.joined.swap(true, Ordering::AcqRel) {
            return false;
        }
        {
            let _serial = self.join_mutex.lock().expect("join mutex poisoned");
            for node in &self.nodes {
                let handles: Vec<_> = node
                    .workers
                    .lock()
                    .expect("worker list poisoned")
                    .drain(..)
                    .collect();
                for handle in handles {
                    let _ = handle.join();
                }
            }
        }
        self.joined.store(false, Ordering::Release);
        self.set_state(State::Idle);
        true
    }
}

/// The context forest scheduler: owns the contexts, their executors, and the
/// worker threads that drain them.
pub struct Core {
    inner: Arc<CoreInner>,
}

impl Core {
    /// Builds a core from a plan and starts it.
    ///
    /// # Errors
    ///
    /// Propagates worker launch failures; the core is left idle and
    /// destructible.
    pub fn new(tree: &ContextTree) -> Result<Self> {
        Self::with_options(tree, CoreOptions::default())
    }

    /// Builds a core from a plan with explicit options.
    ///
    /// # Errors
    ///
    /// Propagates worker launch failures when `start_immediately` is set;
    /// the core is left idle and destructible.
    pub fn with_options(tree: &ContextTree, options: CoreOptions) -> Result<Self> {
        let mut children: Vec<Vec<ContextId>> = vec![Vec::new(); tree.context_count()];
        for (id, config) in tree.nodes().iter().enumerate().skip(1) {
            children[config.parent].push(id);
        }

        let nodes = tree
            .nodes()
            .iter()
            .zip(children)
            .map(|(config, children)| Node {
                executor: match config.concurrency_hint {
                    Some(hint) => Executor::with_hint(hint),
                    None => Executor::new(),
                },
                children,
                params: config.workers.clone(),
                enabled: config.enabled,
                guard: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
            })
            .collect();

        let core = Self {
            inner: Arc::new(CoreInner {
                nodes,
                state: AtomicU8::new(State::Idle as u8),
                stop_mutex: Mutex::new(()),
                join_mutex: Mutex::new(()),
                joined: AtomicBool::new(false),
                panic_handler: options.panic_handler,
                thread_name_prefix: options.thread_name_prefix,
            }),
        };
        if options.start_immediately {
            core.start()?;
        }
        Ok(core)
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> State {
        self.inner.state()
    }

    /// Returns true if a `join` would currently be accepted.
    #[must_use]
    pub fn joinable(&self) -> bool {
        self.inner.state() == State::Running && !self.inner.joined.load(Ordering::Acquire)
    }

    /// Returns the number of contexts in the core.
    #[must_use]
    pub fn context_count(&self) -> usize {
        self.inner.nodes.len()
    }

    /// Returns the executor of context `context`.
    ///
    /// The handle stays valid for the core's whole lifetime; tasks may be
    /// posted in any state, but only run while the core is running (or when
    /// user code drives the executor directly).
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::OutOfRange`] for an unknown id.
    pub fn executor(&self, context: ContextId) -> Result<Executor> {
        self.inner
            .nodes
            .get(context)
            .map(|node| node.executor.clone())
            .ok_or_else(|| {
                Error::new(ErrorKind::OutOfRange)
                    .with_context(format!("unknown context id {context}"))
            })
    }

    /// Launches workers and moves the core to running.
    ///
    /// A no-op when the core is not idle. If a launch step fails, the
    /// already-launched workers are torn down again and the state returns
    /// to idle.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::Internal`] when a worker thread cannot be
    /// spawned.
    pub fn start(&self) -> Result<()> {
        if self.inner.nodes.is_empty() {
            return Ok(());
        }
        let _serial = self.inner.stop_mutex.lock().expect("stop mutex poisoned");
        if self.inner.state() != State::Idle {
            return Ok(());
        }

        self.inner.set_state(State::Starting);
        debug!(contexts = self.inner.nodes.len(), "starting core");
        if let Err(err) = self.inner.start_workers() {
            self.inner.set_state(State::Stopping);
            self.inner.stop_workers();
            self.inner.join_workers();
            return Err(err);
        }
        self.inner.set_state(State::Running);
        Ok(())
    }

    /// Stops the core: drops work guards, stops executors, joins workers.
    ///
    /// Safe to call in any state and from any thread; concurrent calls are
    /// serialized. Returns once workers are joined (or immediately if a
    /// concurrent `join` is doing the joining).
    pub fn stop(&self) {
        if self.inner.nodes.is_empty() {
            return;
        }
        let _serial = self.inner.stop_mutex.lock().expect("stop mutex poisoned");
        self.inner.set_state(State::Stopping);
        debug!("stopping core");
        self.inner.stop_workers();
        self.inner.join_workers();
    }

    /// Parks the calling thread until another thread's `stop` completes.
    ///
    /// Only one joiner per running session wins; the core must be running.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::InvalidArgument`] if the core is not joinable.
    pub fn join(&self) -> Result<()> {
        if self.inner.state() != State::Running || !self.inner.join_workers() {
            return Err(
                Error::new(ErrorKind::InvalidArgument).with_context("core is not joinable")
            );
        }
        Ok(())
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Core")
            .field("contexts", &self.inner.nodes.len())
            .field("state", &self.inner.state())
            .finish()
    }
}
