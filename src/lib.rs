//! Conifer: a tree-structured multithreaded asynchronous core.
//!
//! # Overview
//!
//! Conifer owns a forest of event-loop contexts organized as a tree, assigns
//! a user-specified set of worker threads to each context, and lets those
//! workers opportunistically process tasks from their own context plus any
//! descendant context. The shape is for applications that want to segregate
//! latency-sensitive work from blocking work while a pool of generalist
//! workers absorbs spill-over in both directions:
//!
//! - one context plus workers for lightweight tasks only;
//! - one context plus workers for heavyweight tasks only;
//! - a parent context whose workers run tasks of both kinds.
//!
//! On top of the scheduler sits a stackful-coroutine runtime: coroutines
//! bound to a strand, a single-slot rendezvous primitive for awaiting
//! external completions, and a future/promise layer with a blocking
//! `run_until_complete` bridge.
//!
//! # Quick start
//!
//! ```no_run
//! use conifer::{ContextTree, Core};
//!
//! let mut tree = ContextTree::new();
//! let root = tree.add_context(0, 2, true)?;
//! let heavy = tree.add_context(root, 1, true)?;
//!
//! let core = Core::new(&tree)?; // auto-started
//! core.executor(heavy)?.post(|| {
//!     // runs on the heavy context's worker, or on a root generalist
//! });
//! core.stop();
//! # Ok::<(), conifer::Error>(())
//! ```
//!
//! # Module structure
//!
//! - [`tree`]: builder plan (contexts, hierarchy, worker parameters)
//! - [`runtime`]: the scheduler (lifecycle, worker loops)
//! - [`executor`]: the event-loop primitive and its strand
//! - [`group`]: round-robin executor handle
//! - [`coro`]: coroutines, rendezvous slots, coroutine futures
//! - [`error`]: error types and the panic-capture helpers

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::module_name_repetitions)]

pub mod coro;
pub mod runtime;
pub mod error;
pub mod executor;
pub mod group;
pub mod tree;

pub use coro::future::{
    run_until_complete, run_until_complete_for, spawn_with_future, CoroutineFuture,
    CoroutinePromise, WaitStatus,
};
pub use coro::{
    spawn, spawn_with_options, Caller, CoroutineContext, ErrorSlot, FallibleCaller,
    FallibleRendezvous, InlineCaller, IntoStrand, Rendezvous, SpawnOptions,
};
pub use runtime::{Core, CoreOptions, State};
pub use error::{Error, ErrorKind, PanicHandler, PanicPayload, Result};
pub use executor::{Executor, Strand, WorkGuard};
pub use group::ContextGroup;
pub use tree::{
    ContextId, ContextTree, DelayPolicy, PollPolicy, WorkerId, WorkerParameters, DEFAULT_DELAY,
};
