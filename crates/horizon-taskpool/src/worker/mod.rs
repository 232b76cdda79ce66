//! Worker lifecycle: the execution units owned by a pool.
//!
//! A worker is one execution unit — an OS thread (`ThreadWorker`) or a
//! child process plus its parent-side I/O threads (`ProcessWorker`) — that
//! dequeues tasks and runs them. Workers are spawned lazily by their pool,
//! shrink after an idle timeout, retire after an optional per-worker task
//! budget, and notify the pool when they exit cleanly or crash.

pub(crate) mod process;
pub(crate) mod thread;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::PoolError;
use crate::future::{TaskFuture, TaskId};

/// Identifier of a worker, unique within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl WorkerId {
    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of execution unit a pool runs its tasks on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    /// In-process workers: one OS thread each, preemptive concurrency.
    Thread,
    /// Out-of-process workers: one child process each, true parallelism.
    Process,
}

/// A hook run at the start (initializer) or end (finalizer) of each
/// worker's lifetime. A panicking hook marks the pool broken.
pub type WorkerHook = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle contract shared by the two worker variants.
pub(crate) trait PoolWorker: Send + Sync + 'static {
    fn id(&self) -> WorkerId;

    /// Start the execution unit. Idempotent: returns `true` only on the
    /// first call.
    fn start(&self) -> bool;

    fn is_alive(&self) -> bool;

    /// Whether the worker is actively executing a task body.
    fn is_busy(&self) -> bool;

    /// Wait for the worker to finish. Returns whether it is down.
    fn join(&self, timeout: Option<Duration>) -> bool;
}

/// Type-erased view of a future kept alongside a queued task so queues can
/// be drained (cancelling unexecuted tasks) without knowing the result
/// type.
pub(crate) trait TaskSlot: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn cancel_requested(&self) -> bool;
    fn mark_cancelled(&self);
}

impl<T: Send + 'static> TaskSlot for TaskFuture<T> {
    fn task_id(&self) -> TaskId {
        TaskFuture::task_id(self)
    }

    fn cancel_requested(&self) -> bool {
        TaskFuture::cancel_requested(self)
    }

    fn mark_cancelled(&self) {
        let _ = self.set_status(crate::future::Status::Cancelled, Instant::now());
    }
}

/// A task queued for an in-process worker: the erased future handle plus
/// the run protocol captured at submission.
pub(crate) struct QueuedTask {
    pub(crate) slot: Box<dyn TaskSlot>,
    pub(crate) run: Box<dyn FnOnce() + Send>,
}

/// Message on an in-process task queue. `Exit` stops exactly one worker.
pub(crate) enum WorkerOrder {
    Task(QueuedTask),
    Exit,
}

/// Outcome callback a worker invokes exactly once when its run loop ends:
/// `None` for a clean shutdown, `Some(error)` for a crash.
pub(crate) type WorkerExitHandler = Box<dyn FnOnce(WorkerId, Option<PoolError>) + Send>;
