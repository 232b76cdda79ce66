//! Task futures: per-task lifecycle, results, callbacks, and waiting.
//!
//! Submitting work to a pool returns a [`TaskFuture`] that tracks the task
//! through the `Pending → Running → {Completed | Failed}` or `Cancelled`
//! lifecycle. The handle supports blocking result collection with a
//! timeout, advisory cancellation, and completion callbacks.
//!
//! # Example
//!
//! ```no_run
//! use horizon_taskpool::{ThreadPool, PoolConfig};
//!
//! let pool = ThreadPool::new(PoolConfig::default()).unwrap();
//! let future = pool.submit(|| 1 + 2).unwrap();
//! assert_eq!(future.collect(None).unwrap(), 3);
//! ```
//!
//! The free functions [`wait`], [`collect`], and [`as_done`] operate on
//! groups of futures under a single [`Countdown`](crate::Countdown) budget.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::countdown::Countdown;
use crate::error::{ErrorReport, InvalidStateError, TaskError};
use crate::filter::FutureFilter;

/// Identifier of a submitted task, unique and strictly increasing within
/// its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub(crate) u64);

impl TaskId {
    /// The raw numeric id.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Queued, not yet picked up by a worker.
    Pending,
    /// Currently executing on a worker.
    Running,
    /// Finished and produced a result.
    Completed,
    /// Finished by raising a failure.
    Failed,
    /// Cancelled before a worker executed it.
    Cancelled,
}

impl Status {
    /// Whether this state is terminal (`Completed`, `Failed`, `Cancelled`).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Identifier of a registered completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(u64);

type Callback<T> = Box<dyn FnOnce(&TaskFuture<T>) + Send>;

struct FutureState<T> {
    status: Status,
    cancel_flag: bool,
    value: Option<T>,
    error: Option<ErrorReport>,
    callbacks: Vec<(CallbackId, Callback<T>)>,
    next_callback: u64,
    pending_at: Instant,
    running_at: Option<Instant>,
    done_at: Option<Instant>,
}

struct Shared<T> {
    task_id: TaskId,
    pool_name: Arc<str>,
    state: Mutex<FutureState<T>>,
    done_cv: Condvar,
}

/// Handle to a submitted task.
///
/// Handles are cheap to clone; every clone observes the same task. The
/// payload stays in place after the terminal transition, so status,
/// result, error, and durations are stable once the future is done.
pub struct TaskFuture<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> fmt::Debug for TaskFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFuture")
            .field("task_id", &self.task_id())
            .field("pool", &self.pool_name())
            .field("status", &self.status())
            .finish()
    }
}

impl<T: Send + 'static> TaskFuture<T> {
    pub(crate) fn new(task_id: TaskId, pool_name: Arc<str>) -> Self {
        Self {
            shared: Arc::new(Shared {
                task_id,
                pool_name,
                state: Mutex::new(FutureState {
                    status: Status::Pending,
                    cancel_flag: false,
                    value: None,
                    error: None,
                    callbacks: Vec::new(),
                    next_callback: 0,
                    pending_at: Instant::now(),
                    running_at: None,
                    done_at: None,
                }),
                done_cv: Condvar::new(),
            }),
        }
    }

    /// The task id assigned at submission.
    pub fn task_id(&self) -> TaskId {
        self.shared.task_id
    }

    /// The name of the pool the task was submitted to.
    pub fn pool_name(&self) -> &str {
        &self.shared.pool_name
    }

    /// The current lifecycle state.
    pub fn status(&self) -> Status {
        self.shared.state.lock().status
    }

    /// Whether the task is queued and not yet running.
    pub fn is_pending(&self) -> bool {
        self.status() == Status::Pending
    }

    /// Whether the task is currently executing.
    pub fn is_running(&self) -> bool {
        self.status() == Status::Running
    }

    /// Whether the task completed with a result.
    pub fn is_completed(&self) -> bool {
        self.status() == Status::Completed
    }

    /// Whether the task failed.
    pub fn is_failed(&self) -> bool {
        self.status() == Status::Failed
    }

    /// Whether the task was cancelled before execution.
    pub fn is_cancelled(&self) -> bool {
        self.status() == Status::Cancelled
    }

    /// Whether the task reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.status().is_terminal()
    }

    /// Request cancellation.
    ///
    /// This only sets an advisory flag: a task still sitting in a queue
    /// will be cancelled at the next scheduling point (worker pickup or
    /// dispatcher handoff), but a task that already started runs to
    /// completion. Calling this repeatedly has the effect of the first
    /// call.
    pub fn cancel(&self) {
        self.shared.state.lock().cancel_flag = true;
    }

    /// Whether [`cancel`](Self::cancel) has been called. Independent of the
    /// task's state until a scheduling point observes the flag.
    pub fn cancel_requested(&self) -> bool {
        self.shared.state.lock().cancel_flag
    }

    /// The stored failure report, if the task failed.
    pub fn error(&self) -> Option<ErrorReport> {
        self.shared.state.lock().error.clone()
    }

    /// Pending and execution durations, both zero until the relevant
    /// instants exist.
    ///
    /// The pending duration spans submission to the terminal transition.
    /// The execution duration spans the running transition to completion
    /// or failure, and stays zero for cancelled tasks.
    pub fn duration(&self) -> (Duration, Duration) {
        let state = self.shared.state.lock();
        let Some(done_at) = state.done_at else {
            return (Duration::ZERO, Duration::ZERO);
        };
        let pending = done_at.saturating_duration_since(state.pending_at);
        let task = match (state.status, state.running_at) {
            (Status::Completed | Status::Failed, Some(running_at)) => {
                done_at.saturating_duration_since(running_at)
            }
            _ => Duration::ZERO,
        };
        (pending, task)
    }

    /// Block until the task is done or `timeout` elapses. `None` waits
    /// indefinitely. Returns whether the task reached a terminal state.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let countdown = Countdown::new(timeout);
        let mut state = self.shared.state.lock();
        loop {
            if state.status.is_terminal() {
                return true;
            }
            match countdown.remaining() {
                None => {
                    self.shared.done_cv.wait(&mut state);
                }
                Some(remaining) => {
                    if remaining.is_zero() {
                        return false;
                    }
                    self.shared.done_cv.wait_for(&mut state, remaining);
                }
            }
        }
    }

    /// Register a completion callback.
    ///
    /// The callback runs exactly once with the future as its argument, on
    /// the thread performing the terminal transition. If the future is
    /// already done it runs immediately on the calling thread. Panics
    /// inside callbacks are logged and swallowed.
    pub fn add_callback(&self, callback: impl FnOnce(&TaskFuture<T>) + Send + 'static) -> CallbackId {
        let callback: Callback<T> = Box::new(callback);
        let mut state = self.shared.state.lock();
        let id = CallbackId(state.next_callback);
        state.next_callback += 1;
        if state.status.is_terminal() {
            drop(state);
            self.run_callbacks(vec![(id, callback)]);
        } else {
            state.callbacks.push((id, callback));
        }
        id
    }

    /// Register several completion callbacks at once.
    pub fn add_callbacks<I>(&self, callbacks: I) -> Vec<CallbackId>
    where
        I: IntoIterator<Item = Box<dyn FnOnce(&TaskFuture<T>) + Send>>,
    {
        callbacks
            .into_iter()
            .map(|callback| self.add_callback(callback))
            .collect()
    }

    /// Remove a registered callback. Returns whether it was still pending.
    pub fn remove_callback(&self, id: CallbackId) -> bool {
        let mut state = self.shared.state.lock();
        let before = state.callbacks.len();
        state.callbacks.retain(|(callback_id, _)| *callback_id != id);
        state.callbacks.len() != before
    }

    /// Remove several registered callbacks.
    pub fn remove_callbacks(&self, ids: &[CallbackId]) {
        let mut state = self.shared.state.lock();
        state.callbacks.retain(|(callback_id, _)| !ids.contains(callback_id));
    }

    pub(crate) fn set_status(&self, status: Status, instant: Instant) -> Result<(), InvalidStateError> {
        let mut state = self.shared.state.lock();
        if state.status.is_terminal() {
            return Err(InvalidStateError);
        }
        match status {
            Status::Pending => {
                state.status = status;
                state.pending_at = instant;
            }
            Status::Running => {
                state.status = status;
                state.running_at = Some(instant);
            }
            terminal => {
                let callbacks = Self::finish(&mut state, terminal, instant);
                self.shared.done_cv.notify_all();
                drop(state);
                self.run_callbacks(callbacks);
            }
        }
        Ok(())
    }

    pub(crate) fn set_result(&self, value: T, instant: Instant) -> Result<(), InvalidStateError> {
        let mut state = self.shared.state.lock();
        if state.status.is_terminal() {
            return Err(InvalidStateError);
        }
        state.value = Some(value);
        let callbacks = Self::finish(&mut state, Status::Completed, instant);
        self.shared.done_cv.notify_all();
        drop(state);
        self.run_callbacks(callbacks);
        Ok(())
    }

    pub(crate) fn set_failure(&self, report: ErrorReport, instant: Instant) -> Result<(), InvalidStateError> {
        let mut state = self.shared.state.lock();
        if state.status.is_terminal() {
            return Err(InvalidStateError);
        }
        state.error = Some(report);
        let callbacks = Self::finish(&mut state, Status::Failed, instant);
        self.shared.done_cv.notify_all();
        drop(state);
        self.run_callbacks(callbacks);
        Ok(())
    }

    fn finish(
        state: &mut FutureState<T>,
        status: Status,
        instant: Instant,
    ) -> Vec<(CallbackId, Callback<T>)> {
        state.status = status;
        state.done_at = Some(instant);
        mem::take(&mut state.callbacks)
    }

    /// Invoke callbacks outside the state lock; a panicking callback must
    /// not affect the future or the remaining callbacks.
    fn run_callbacks(&self, callbacks: Vec<(CallbackId, Callback<T>)>) {
        for (id, callback) in callbacks {
            if panic::catch_unwind(AssertUnwindSafe(|| callback(self))).is_err() {
                warn!(
                    task_id = self.shared.task_id.0,
                    callback = id.0,
                    "future callback panicked"
                );
            }
        }
    }
}

impl<T: Clone + Send + 'static> TaskFuture<T> {
    /// A clone of the result, if the task completed.
    pub fn result(&self) -> Option<T> {
        self.shared.state.lock().value.clone()
    }

    /// Block until the task is done, then return its outcome.
    ///
    /// On completion the result is cloned out, so repeated calls keep
    /// working; wrap large payloads in `Arc` if cloning is a concern. On
    /// failure the stored report is surfaced as [`TaskError::Failed`]; a
    /// cancelled task surfaces [`TaskError::Cancelled`], and an expired
    /// timeout surfaces [`TaskError::Timeout`] without cancelling the
    /// underlying work.
    pub fn collect(&self, timeout: Option<Duration>) -> Result<T, TaskError> {
        if !self.wait(timeout) {
            return Err(TaskError::Timeout);
        }
        let state = self.shared.state.lock();
        if let Some(report) = &state.error {
            Err(TaskError::Failed(report.clone()))
        } else if let Some(value) = &state.value {
            Ok(value.clone())
        } else {
            Err(TaskError::Cancelled)
        }
    }
}

/// Wait for every future to reach a terminal state.
///
/// Returns `true` iff all futures were done within the shared budget.
pub fn wait<T: Send + 'static>(futures: &[TaskFuture<T>], timeout: Option<Duration>) -> bool {
    let countdown = Countdown::new(timeout);
    futures.iter().all(|future| future.wait(countdown.remaining()))
}

/// Collect the results of all futures, in input order.
///
/// The first failure, cancellation, or timeout encountered is returned as
/// the error; one budget covers the whole call.
pub fn collect<T: Clone + Send + 'static>(
    futures: &[TaskFuture<T>],
    timeout: Option<Duration>,
) -> Result<Vec<T>, TaskError> {
    let countdown = Countdown::new(timeout);
    futures
        .iter()
        .map(|future| future.collect(countdown.remaining()))
        .collect()
}

/// Yield futures as they become done.
///
/// With `keep_order` the input order is preserved (each future is awaited
/// in turn); otherwise futures are yielded in completion order. A timeout
/// expiry yields one `Err(TaskError::Timeout)` and then ends the sequence.
pub fn as_done<T, I>(futures: I, keep_order: bool, timeout: Option<Duration>) -> AsDone<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = TaskFuture<T>>,
{
    let countdown = Countdown::new(timeout);
    let inner = if keep_order {
        AsDoneInner::Ordered {
            futures: futures.into_iter().collect::<Vec<_>>().into_iter(),
        }
    } else {
        let filter = FutureFilter::with_futures(futures);
        AsDoneInner::Unordered { filter }
    };
    AsDone {
        inner,
        countdown,
        fused: false,
    }
}

/// Iterator returned by [`as_done`].
pub struct AsDone<T> {
    inner: AsDoneInner<T>,
    countdown: Countdown,
    fused: bool,
}

enum AsDoneInner<T> {
    Ordered {
        futures: std::vec::IntoIter<TaskFuture<T>>,
    },
    Unordered {
        filter: FutureFilter<T>,
    },
}

impl<T: Send + 'static> Iterator for AsDone<T> {
    type Item = Result<TaskFuture<T>, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match &mut self.inner {
            AsDoneInner::Ordered { futures } => {
                let future = futures.next()?;
                if future.wait(self.countdown.remaining()) {
                    Some(Ok(future))
                } else {
                    self.fused = true;
                    Some(Err(TaskError::Timeout))
                }
            }
            AsDoneInner::Unordered { filter } => match filter.get(self.countdown.remaining()) {
                Ok(Some(future)) => Some(Ok(future)),
                Ok(None) => None,
                Err(err) => {
                    self.fused = true;
                    Some(Err(err))
                }
            },
        }
    }
}
