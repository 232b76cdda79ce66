//! In-process pools: preemptive concurrency on OS threads.
//!
//! A [`ThreadPool`] accepts closures through [`submit`](ThreadPool::submit)
//! and the map/starmap families, spawning up to `max_workers` worker
//! threads lazily as load demands and shrinking them back after the idle
//! timeout.
//!
//! # Example
//!
//! ```no_run
//! use horizon_taskpool::{MapOptions, PoolConfig, ThreadPool};
//!
//! let pool = ThreadPool::new(PoolConfig::default()).unwrap();
//!
//! let future = pool.submit(|| 1 + 2).unwrap();
//! assert_eq!(future.collect(None).unwrap(), 3);
//!
//! let squares: Vec<_> = pool
//!     .map(|x: i64| x * x, 0..10, MapOptions::default())
//!     .unwrap()
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(squares, (0..10).map(|x| x * x).collect::<Vec<_>>());
//! ```

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use tracing::debug;

use crate::call::StarCall;
use crate::chunk::{split_map_task, split_starmap_task};
use crate::error::{ErrorReport, PoolError, TaskError};
use crate::future::{TaskFuture, TaskId};
use crate::map::{Map, MapOptions, eager, flatten_chunks, lazy_ordered, lazy_unordered};
use crate::pool::{PoolConfig, PoolCore};
use crate::supervisor::{self, HandlerId};
use crate::worker::thread::{ThreadWorker, ThreadWorkerContext, run_task};
use crate::worker::{QueuedTask, WorkerHook, WorkerId, WorkerKind, WorkerOrder};

/// A pool of in-process workers.
///
/// Dropping the pool shuts it down; an explicit
/// [`shutdown`](ThreadPool::shutdown) does the same eagerly and reports
/// whether it was the call that closed the pool.
pub struct ThreadPool {
    inner: Arc<Inner>,
}

/// Builder for a [`ThreadPool`] with worker hooks.
///
/// The plain [`ThreadPool::new`] covers configurations without hooks; the
/// builder adds the per-worker initializer and finalizer closures.
pub struct ThreadPoolBuilder {
    config: PoolConfig,
    initializer: Option<WorkerHook>,
    finalizer: Option<WorkerHook>,
}

impl ThreadPoolBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
            initializer: None,
            finalizer: None,
        }
    }

    /// Set the maximum number of workers.
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.config.max_workers = Some(max_workers);
        self
    }

    /// Set the pool name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = Some(name.into());
        self
    }

    /// Set or disable the idle shrink timeout.
    pub fn idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.config.idle_timeout = idle_timeout;
        self
    }

    /// Retire each worker after it has executed this many tasks.
    pub fn max_tasks_per_worker(mut self, max_tasks: NonZeroUsize) -> Self {
        self.config.max_tasks_per_worker = Some(max_tasks);
        self
    }

    /// Run `hook` at the start of every worker thread. A panicking
    /// initializer marks the pool broken.
    pub fn initializer(mut self, hook: WorkerHook) -> Self {
        self.initializer = Some(hook);
        self
    }

    /// Run `hook` when a worker thread is about to exit cleanly.
    pub fn finalizer(mut self, hook: WorkerHook) -> Self {
        self.finalizer = Some(hook);
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<ThreadPool, PoolError> {
        ThreadPool::with_hooks(self.config, self.initializer, self.finalizer)
    }
}

impl Default for ThreadPoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct Inner {
    core: PoolCore<ThreadWorker>,
    task_tx: Sender<WorkerOrder>,
    task_rx: Receiver<WorkerOrder>,
    initializer: Option<WorkerHook>,
    finalizer: Option<WorkerHook>,
    max_tasks_per_worker: Option<NonZeroUsize>,
    supervisor_handle: Mutex<Option<HandlerId>>,
}

impl ThreadPool {
    /// Create a pool from `config`.
    ///
    /// `max_workers` defaults to the available parallelism plus five; an
    /// explicit zero is a configuration error.
    pub fn new(config: PoolConfig) -> Result<Self, PoolError> {
        Self::with_hooks(config, None, None)
    }

    /// Start building a pool with worker hooks.
    pub fn builder() -> ThreadPoolBuilder {
        ThreadPoolBuilder::new()
    }

    fn with_hooks(
        config: PoolConfig,
        initializer: Option<WorkerHook>,
        finalizer: Option<WorkerHook>,
    ) -> Result<Self, PoolError> {
        let max_workers = match config.max_workers {
            Some(0) => {
                return Err(PoolError::Config("max_workers must be at least 1".to_string()));
            }
            Some(n) => n,
            None => default_max_workers(),
        };
        let name = config.name.unwrap_or_else(|| "threadpool".to_string());
        let (task_tx, task_rx) = unbounded();
        let inner = Arc::new(Inner {
            core: PoolCore::new(
                Arc::from(name.as_str()),
                WorkerKind::Thread,
                max_workers,
                config.idle_timeout,
            ),
            task_tx,
            task_rx,
            initializer,
            finalizer,
            max_tasks_per_worker: config.max_tasks_per_worker,
            supervisor_handle: Mutex::new(None),
        });
        let handle = supervisor::global().register({
            let weak = Arc::downgrade(&inner);
            Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    Inner::shutdown(&inner);
                }
            })
        });
        *inner.supervisor_handle.lock() = Some(handle);
        Ok(Self { inner })
    }

    /// The pool name.
    pub fn name(&self) -> &str {
        self.inner.core.name()
    }

    /// Always [`WorkerKind::Thread`].
    pub fn worker_kind(&self) -> WorkerKind {
        self.inner.core.kind()
    }

    /// The maximum number of workers.
    pub fn max_workers(&self) -> usize {
        self.inner.core.max_workers()
    }

    /// The current idle shrink timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.core.idle_timeout()
    }

    /// Change the idle shrink timeout; workers spawned from now on use the
    /// new value.
    pub fn set_idle_timeout(&self, idle_timeout: Option<Duration>) {
        self.inner.core.set_idle_timeout(idle_timeout);
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.core.is_closed()
    }

    /// Whether the pool is broken (a worker lifecycle failure occurred).
    pub fn is_broken(&self) -> bool {
        self.inner.core.is_broken()
    }

    /// Whether a shutdown has completed.
    pub fn is_terminated(&self) -> bool {
        self.inner.core.is_terminated()
    }

    /// Ids of tasks that were enqueued but never executed, populated by
    /// shutdown and broken-pool cancellation.
    pub fn cancelled_tasks(&self) -> Vec<TaskId> {
        self.inner.core.cancelled_tasks()
    }

    /// Fail fast if the pool is closed or broken.
    pub fn check(&self) -> Result<(), PoolError> {
        self.inner.core.check_open()
    }

    /// Submit a task and return its future.
    pub fn submit<F, T>(&self, task: F) -> Result<TaskFuture<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        self.inner.submit_task(task)
    }

    /// Submit a task and block for its outcome.
    pub fn run<F, T>(&self, task: F) -> Result<T, TaskError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Clone + Send + 'static,
    {
        let future = self.submit(task)?;
        future.collect(None)
    }

    /// Lazy map preserving input order.
    pub fn map<F, I, U>(&self, target: F, inputs: I, options: MapOptions) -> Result<Map<U>, PoolError>
    where
        F: Fn(I::Item) -> U + Send + Sync + 'static,
        I: IntoIterator + 'static,
        I::Item: Send + 'static,
        I::IntoIter: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.map_with_order(target, inputs, options, true)
    }

    /// Lazy map yielding results in completion order.
    pub fn map_unordered<F, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
    ) -> Result<Map<U>, PoolError>
    where
        F: Fn(I::Item) -> U + Send + Sync + 'static,
        I: IntoIterator + 'static,
        I::Item: Send + 'static,
        I::IntoIter: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.map_with_order(target, inputs, options, false)
    }

    /// Eager map preserving input order: every input is submitted before
    /// the first result is consumed. `buffer_size` is ignored.
    pub fn map_all<F, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
    ) -> Result<Map<U>, PoolError>
    where
        F: Fn(I::Item) -> U + Send + Sync + 'static,
        I: IntoIterator + 'static,
        I::Item: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.map_all_with_order(target, inputs, options, true)
    }

    /// Eager map yielding results in completion order.
    pub fn map_all_unordered<F, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
    ) -> Result<Map<U>, PoolError>
    where
        F: Fn(I::Item) -> U + Send + Sync + 'static,
        I: IntoIterator + 'static,
        I::Item: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.map_all_with_order(target, inputs, options, false)
    }

    /// Lazy starmap preserving input order: each element of `inputs` is a
    /// tuple of arguments for `target`.
    pub fn starmap<F, A, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
    ) -> Result<Map<U>, PoolError>
    where
        F: StarCall<A, U> + Send + Sync + 'static,
        A: Send + 'static,
        I: IntoIterator<Item = A> + 'static,
        I::IntoIter: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.starmap_with_order(target, inputs, options, true)
    }

    /// Lazy starmap yielding results in completion order.
    pub fn starmap_unordered<F, A, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
    ) -> Result<Map<U>, PoolError>
    where
        F: StarCall<A, U> + Send + Sync + 'static,
        A: Send + 'static,
        I: IntoIterator<Item = A> + 'static,
        I::IntoIter: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.starmap_with_order(target, inputs, options, false)
    }

    /// Eager starmap preserving input order.
    pub fn starmap_all<F, A, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
    ) -> Result<Map<U>, PoolError>
    where
        F: StarCall<A, U> + Send + Sync + 'static,
        A: Send + 'static,
        I: IntoIterator<Item = A> + 'static,
        U: Clone + Send + 'static,
    {
        self.starmap_all_with_order(target, inputs, options, true)
    }

    /// Eager starmap yielding results in completion order.
    pub fn starmap_all_unordered<F, A, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
    ) -> Result<Map<U>, PoolError>
    where
        F: StarCall<A, U> + Send + Sync + 'static,
        A: Send + 'static,
        I: IntoIterator<Item = A> + 'static,
        U: Clone + Send + 'static,
    {
        self.starmap_all_with_order(target, inputs, options, false)
    }

    /// Probe the pool by building a one-worker sibling with the same
    /// configuration and running submit, map, and starmap sanity checks
    /// through it.
    pub fn test(&self) -> Result<(), TaskError> {
        self.check()?;
        let config = PoolConfig {
            max_workers: Some(1),
            name: Some(format!("{}-test", self.name())),
            idle_timeout: self.idle_timeout(),
            max_tasks_per_worker: self.inner.max_tasks_per_worker,
        };
        let pool = ThreadPool::with_hooks(
            config,
            self.inner.initializer.clone(),
            self.inner.finalizer.clone(),
        )?;
        if pool.run(|| 1 + 2)? != 3 {
            return Err(TaskError::Failed(ErrorReport::new(
                "probe submit returned a wrong result",
            )));
        }
        let doubled: Vec<i64> = pool
            .map(|x: i64| x * 2, 0..10, MapOptions::default().chunk_size(2))?
            .collect::<Result<_, _>>()?;
        if doubled != (0..10).map(|x| x * 2).collect::<Vec<_>>() {
            return Err(TaskError::Failed(ErrorReport::new(
                "probe map returned a wrong sequence",
            )));
        }
        let sums: Vec<i64> = pool
            .starmap(
                |a: i64, b: i64| a + b,
                (0..10).map(|x| (x, x)),
                MapOptions::default().chunk_size(2),
            )?
            .collect::<Result<_, _>>()?;
        if sums != (0..10).map(|x| x + x).collect::<Vec<_>>() {
            return Err(TaskError::Failed(ErrorReport::new(
                "probe starmap returned a wrong sequence",
            )));
        }
        pool.check().map_err(TaskError::from)?;
        pool.shutdown();
        Ok(())
    }

    /// Start `count` workers immediately (clamped to the remaining
    /// capacity). Returns how many were started.
    pub fn spawn_workers(&self, count: usize) -> Result<usize, PoolError> {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        let inner = Arc::clone(&self.inner);
        Ok(self
            .inner
            .core
            .spawn_workers(Some(count), 0, move |id| inner.make_worker(id)))
    }

    /// Start workers up to `max_workers`.
    pub fn spawn_max_workers(&self) -> Result<usize, PoolError> {
        self.spawn_workers(self.max_workers())
    }

    /// Number of live workers; zero once the pool is closed.
    pub fn count_workers(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.core.count_workers()
    }

    /// Number of workers currently executing a task body.
    pub fn count_busy_workers(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.core.count_busy_workers()
    }

    /// Number of live workers waiting for work.
    pub fn count_free_workers(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.core.count_free_workers()
    }

    /// Number of tasks queued but not yet picked up.
    pub fn count_pending_tasks(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.task_rx.len()
    }

    /// Drain in-flight work, then reopen the pool.
    ///
    /// The pool is closed for the duration of the call; workers are asked
    /// to finish and are joined under the shared `timeout` budget. Returns
    /// whether every worker went down in time. The pool accepts new work
    /// again afterwards either way.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        if self.inner.core.is_closed() {
            return false;
        }
        self.inner.core.set_closed(true);
        let joined = {
            let _gate = self.inner.core.gate();
            self.inner.notify_workers_to_shutdown();
            self.inner.core.join_workers(timeout)
        };
        self.inner.core.set_closed(false);
        joined
    }

    /// Close the pool: cancel queued tasks, stop and join every worker.
    ///
    /// Idempotent; returns `false` if the pool was already closed.
    /// Cancelled work is available through
    /// [`cancelled_tasks`](Self::cancelled_tasks).
    pub fn shutdown(&self) -> bool {
        Inner::shutdown(&self.inner)
    }

    fn map_with_order<F, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
        keep_order: bool,
    ) -> Result<Map<U>, PoolError>
    where
        F: Fn(I::Item) -> U + Send + Sync + 'static,
        I: IntoIterator + 'static,
        I::Item: Send + 'static,
        I::IntoIter: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        Ok(if options.chunk_size <= 1 {
            let target = Arc::new(target);
            let units = inputs.into_iter().map(move |item| {
                let target = Arc::clone(&target);
                move || (*target)(item)
            });
            self.inner
                .lazy_stream(units, options.buffer_size, options.timeout, keep_order)
        } else {
            let units = split_map_task(target, inputs, options.chunk_size);
            flatten_chunks(self.inner.lazy_stream(
                units,
                options.buffer_size,
                options.timeout,
                keep_order,
            ))
        })
    }

    fn map_all_with_order<F, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
        keep_order: bool,
    ) -> Result<Map<U>, PoolError>
    where
        F: Fn(I::Item) -> U + Send + Sync + 'static,
        I: IntoIterator + 'static,
        I::Item: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        if options.chunk_size <= 1 {
            let target = Arc::new(target);
            let units = inputs.into_iter().map(move |item| {
                let target = Arc::clone(&target);
                move || (*target)(item)
            });
            self.inner.eager_stream(units, keep_order, options.timeout)
        } else {
            let units = split_map_task(target, inputs, options.chunk_size);
            Ok(flatten_chunks(self.inner.eager_stream(
                units,
                keep_order,
                options.timeout,
            )?))
        }
    }

    fn starmap_with_order<F, A, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
        keep_order: bool,
    ) -> Result<Map<U>, PoolError>
    where
        F: StarCall<A, U> + Send + Sync + 'static,
        A: Send + 'static,
        I: IntoIterator<Item = A> + 'static,
        I::IntoIter: Send + 'static,
        U: Clone + Send + 'static,
    {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        Ok(if options.chunk_size <= 1 {
            let target = Arc::new(target);
            let units = inputs.into_iter().map(move |args| {
                let target = Arc::clone(&target);
                move || target.call_star(args)
            });
            self.inner
                .lazy_stream(units, options.buffer_size, options.timeout, keep_order)
        } else {
            let units = split_starmap_task(target, inputs, options.chunk_size);
            flatten_chunks(self.inner.lazy_stream(
                units,
                options.buffer_size,
                options.timeout,
                keep_order,
            ))
        })
    }

    fn starmap_all_with_order<F, A, I, U>(
        &self,
        target: F,
        inputs: I,
        options: MapOptions,
        keep_order: bool,
    ) -> Result<Map<U>, PoolError>
    where
        F: StarCall<A, U> + Send + Sync + 'static,
        A: Send + 'static,
        I: IntoIterator<Item = A> + 'static,
        U: Clone + Send + 'static,
    {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        if options.chunk_size <= 1 {
            let target = Arc::new(target);
            let units = inputs.into_iter().map(move |args| {
                let target = Arc::clone(&target);
                move || target.call_star(args)
            });
            self.inner.eager_stream(units, keep_order, options.timeout)
        } else {
            let units = split_starmap_task(target, inputs, options.chunk_size);
            Ok(flatten_chunks(self.inner.eager_stream(
                units,
                keep_order,
                options.timeout,
            )?))
        }
    }
}

impl fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name())
            .field("max_workers", &self.max_workers())
            .field("workers", &self.inner.core.count_workers())
            .field("is_closed", &self.is_closed())
            .field("is_broken", &self.is_broken())
            .finish()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        Inner::shutdown(&self.inner);
    }
}

impl Inner {
    fn submit_task<F, T>(self: &Arc<Self>, task: F) -> Result<TaskFuture<T>, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        self.core.join_inactive_workers();
        let task_id = self.core.next_task_id();
        let future = TaskFuture::new(task_id, Arc::clone(self.core.name()));
        let queued = QueuedTask {
            slot: Box::new(future.clone()),
            run: {
                let future = future.clone();
                Box::new(move || run_task(future, task))
            },
        };
        if self.task_tx.send(WorkerOrder::Task(queued)).is_err() {
            return Err(PoolError::Closed);
        }
        self.spawn_needed();
        Ok(future)
    }

    /// Lazy-spawn workers to match the queued load.
    fn spawn_needed(self: &Arc<Self>) {
        let pending = self.task_rx.len();
        let inner = Arc::clone(self);
        self.core
            .spawn_workers(None, pending, move |id| inner.make_worker(id));
    }

    fn make_worker(self: &Arc<Self>, id: WorkerId) -> ThreadWorker {
        let name = format!("{}-thread-worker-{}", self.core.name(), id);
        let weak = Arc::downgrade(self);
        let on_exit = Box::new(move |worker_id: WorkerId, crash: Option<PoolError>| {
            if let Some(inner) = weak.upgrade() {
                Inner::on_worker_exit(&inner, worker_id, crash);
            }
        });
        ThreadWorker::new(
            id,
            name,
            ThreadWorkerContext {
                receiver: self.task_rx.clone(),
                idle_timeout: self.core.idle_timeout(),
                max_tasks: self.max_tasks_per_worker,
                initializer: self.initializer.clone(),
                finalizer: self.finalizer.clone(),
                on_exit,
            },
        )
    }

    fn on_worker_exit(self: &Arc<Self>, id: WorkerId, crash: Option<PoolError>) {
        self.core.retire_worker(id);
        match crash {
            None => {
                debug!(worker = id.get(), "worker retired");
                if !self.core.is_closed() {
                    self.spawn_needed();
                }
            }
            Some(error) => {
                // The first failure cancels queued work and stops the
                // remaining workers; later failures only replace the
                // stored reason.
                if self.core.mark_broken(error) {
                    self.cancel_tasks();
                    self.notify_workers_to_shutdown();
                }
            }
        }
    }

    /// Drain the queue, cancelling every task that never reached a worker.
    fn cancel_tasks(&self) {
        let mut cancelled = Vec::new();
        while let Ok(order) = self.task_rx.try_recv() {
            if let WorkerOrder::Task(task) = order {
                task.slot.mark_cancelled();
                cancelled.push(task.slot.task_id());
            }
        }
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "cancelled queued tasks");
        }
        self.core.record_cancelled(cancelled);
    }

    fn notify_workers_to_shutdown(&self) {
        for _ in 0..self.core.count_workers() {
            let _ = self.task_tx.send(WorkerOrder::Exit);
        }
    }

    fn drain_task_queue(&self) {
        while self.task_rx.try_recv().is_ok() {}
    }

    fn shutdown(self: &Arc<Self>) -> bool {
        if self.core.is_closed() {
            return false;
        }
        let _gate = self.core.gate();
        if self.core.is_closed() {
            return false;
        }
        self.core.set_closed(true);
        self.cancel_tasks();
        self.notify_workers_to_shutdown();
        self.core.join_workers(None);
        self.drain_task_queue();
        self.core.clear_workers();
        self.core.clear_stored_error();
        self.core.set_terminated();
        if let Some(handle) = self.supervisor_handle.lock().take() {
            supervisor::global().deregister(handle);
        }
        true
    }

    fn lazy_stream<It, U>(
        self: &Arc<Self>,
        units: It,
        buffer_size: usize,
        timeout: Option<Duration>,
        keep_order: bool,
    ) -> Map<U>
    where
        It: Iterator + Send + 'static,
        It::Item: FnOnce() -> U + Send + 'static,
        U: Clone + Send + 'static,
    {
        let inner = Arc::clone(self);
        let submit = move |unit: It::Item| inner.submit_task(unit);
        if keep_order {
            lazy_ordered(units, submit, buffer_size, timeout)
        } else {
            lazy_unordered(units, submit, buffer_size, timeout)
        }
    }

    fn eager_stream<It, U>(
        self: &Arc<Self>,
        units: It,
        keep_order: bool,
        timeout: Option<Duration>,
    ) -> Result<Map<U>, PoolError>
    where
        It: Iterator,
        It::Item: FnOnce() -> U + Send + 'static,
        U: Clone + Send + 'static,
    {
        let futures = units
            .map(|unit| self.submit_task(unit))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(eager(futures, keep_order, timeout))
    }
}

fn default_max_workers() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
        + 5
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::Status;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pool(max_workers: usize) -> ThreadPool {
        ThreadPool::new(PoolConfig {
            max_workers: Some(max_workers),
            name: Some("test".to_string()),
            ..PoolConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn basic_submit_and_collect() {
        let pool = pool(1);
        let future = pool.submit(|| 1 + 2).unwrap();
        assert_eq!(future.collect(None).unwrap(), 3);
        assert!(future.is_completed());
    }

    #[test]
    fn run_returns_the_result_directly() {
        let pool = pool(2);
        assert_eq!(pool.run(|| "ok".to_string()).unwrap(), "ok");
    }

    #[test]
    fn zero_max_workers_is_a_config_error() {
        let err = ThreadPool::new(PoolConfig {
            max_workers: Some(0),
            ..PoolConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn task_ids_increase_in_submission_order() {
        let pool = pool(2);
        let ids: Vec<_> = (0..5)
            .map(|_| pool.submit(|| ()).unwrap().task_id())
            .collect();
        for pair in ids.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn ordered_map_yields_input_order() {
        let pool = pool(4);
        let squares: Vec<_> = pool
            .map(|x: i64| x * x, 0..10, MapOptions::default().buffer_size(4))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(squares, vec![0, 1, 4, 9, 16, 25, 36, 49, 64, 81]);
    }

    #[test]
    fn unordered_map_yields_completion_order() {
        let pool = pool(4);
        let sleeps = [500u64, 200, 0];
        let results: Vec<_> = pool
            .map_unordered(
                move |x: usize| {
                    thread::sleep(Duration::from_millis(sleeps[x]));
                    x * x
                },
                0..3,
                MapOptions::default().buffer_size(3),
            )
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(results, vec![4, 1, 0]);
    }

    #[test]
    fn map_timeout_surfaces_as_error() {
        let pool = pool(2);
        let outcome: Result<Vec<_>, _> = pool
            .map(
                |_x: usize| {
                    thread::sleep(Duration::from_millis(100));
                    0usize
                },
                0..5,
                MapOptions::default().timeout(Duration::from_millis(10)),
            )
            .unwrap()
            .collect();
        assert!(matches!(outcome, Err(TaskError::Timeout)));
    }

    #[test]
    fn chunked_map_matches_unchunked() {
        let pool = pool(4);
        let plain: Vec<_> = pool
            .map(|x: i64| x + 1, 0..20, MapOptions::default())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let chunked: Vec<_> = pool
            .map(|x: i64| x + 1, 0..20, MapOptions::default().chunk_size(3).buffer_size(2))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(plain, chunked);
    }

    #[test]
    fn unordered_chunked_map_is_a_permutation() {
        let pool = pool(4);
        let mut results: Vec<_> = pool
            .map_unordered(|x: i64| x * 3, 0..20, MapOptions::default().chunk_size(4).buffer_size(3))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        results.sort_unstable();
        assert_eq!(results, (0..20).map(|x| x * 3).collect::<Vec<_>>());
    }

    #[test]
    fn eager_map_submits_everything_up_front() {
        let pool = pool(4);
        let submitted_before = pool
            .map_all(|x: i64| x * x, 0..8, MapOptions::default())
            .unwrap();
        // All eight task ids were handed out before the first result is
        // consumed.
        let probe = pool.submit(|| ()).unwrap();
        assert!(probe.task_id().get() > 8);
        let results: Vec<_> = submitted_before.collect::<Result<_, _>>().unwrap();
        assert_eq!(results, (0..8).map(|x| x * x).collect::<Vec<_>>());
    }

    #[test]
    fn starmap_unpacks_argument_tuples() {
        let pool = pool(4);
        let sums: Vec<_> = pool
            .starmap(
                |a: i64, b: i64| a + b,
                (0..10).map(|x| (x, x)),
                MapOptions::default().chunk_size(2),
            )
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(sums, (0..10).map(|x| x + x).collect::<Vec<_>>());
    }

    #[test]
    fn starmap_all_unordered_is_a_permutation() {
        let pool = pool(4);
        let mut products: Vec<_> = pool
            .starmap_all_unordered(
                |a: i64, b: i64| a * b,
                (1..6).map(|x| (x, x)),
                MapOptions::default(),
            )
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        products.sort_unstable();
        assert_eq!(products, vec![1, 4, 9, 16, 25]);
    }

    #[test]
    fn task_panic_is_isolated_to_its_future() {
        let pool = pool(1);
        let bad = pool.submit(|| -> i32 { panic!("division by zero") }).unwrap();
        let good = pool.submit(|| 7).unwrap();
        match bad.collect(None) {
            Err(TaskError::Failed(report)) => assert_eq!(report.message(), "division by zero"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(good.collect(None).unwrap(), 7);
        assert!(!pool.is_broken());
    }

    #[test]
    fn broken_by_initializer() {
        let pool = ThreadPool::builder()
            .max_workers(1)
            .name("broken")
            .initializer(Arc::new(|| panic!("init exploded")))
            .build()
            .unwrap();
        let future = pool.submit(|| 1 + 2).unwrap();
        assert!(matches!(future.collect(None), Err(TaskError::Cancelled)));
        match pool.check() {
            Err(PoolError::Initializer(report)) => {
                assert_eq!(report.message(), "init exploded");
            }
            other => panic!("unexpected check outcome: {other:?}"),
        }
        assert!(pool.is_broken());
        // Submissions are refused while broken.
        assert!(pool.submit(|| 0).is_err());
        pool.shutdown();
        assert!(matches!(pool.check(), Err(PoolError::Closed)));
    }

    #[test]
    fn cancel_semantics_skip_queued_tasks_only() {
        let pool = pool(1);
        let running = pool
            .submit(|| {
                thread::sleep(Duration::from_millis(100));
                1
            })
            .unwrap();
        let queued = pool.submit(|| 2).unwrap();
        // Give the worker time to pick the first task up.
        thread::sleep(Duration::from_millis(30));
        running.cancel();
        queued.cancel();
        assert!(running.wait(Some(Duration::from_secs(5))));
        assert!(queued.wait(Some(Duration::from_secs(5))));
        assert!(!running.is_cancelled());
        assert_eq!(running.status(), Status::Completed);
        assert!(queued.is_cancelled());
        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent_and_cancels_queued_tasks() {
        let pool = pool(1);
        let blocker = pool
            .submit(|| thread::sleep(Duration::from_millis(50)))
            .unwrap();
        let starved: Vec<_> = (0..3).map(|i| pool.submit(move || i).unwrap()).collect();
        thread::sleep(Duration::from_millis(10));
        assert!(pool.shutdown());
        assert!(!pool.shutdown());
        assert!(pool.is_terminated());
        assert!(blocker.is_done());
        let cancelled = pool.cancelled_tasks();
        for future in &starved {
            if future.is_cancelled() {
                assert!(cancelled.contains(&future.task_id()));
            }
        }
        // Every future returned by submit reached a terminal state.
        assert!(starved.iter().all(TaskFuture::is_done));
    }

    #[test]
    fn join_drains_and_reopens_the_pool() {
        let pool = pool(2);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            pool.submit(move || {
                thread::sleep(Duration::from_millis(10));
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(pool.join(Some(Duration::from_secs(5))));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(!pool.is_closed());
        // Reusable after join.
        assert_eq!(pool.run(|| 5).unwrap(), 5);
        pool.shutdown();
    }

    #[test]
    fn idle_timeout_shrinks_the_fleet() {
        let pool = ThreadPool::new(PoolConfig {
            max_workers: Some(2),
            name: Some("shrink".to_string()),
            idle_timeout: Some(Duration::from_millis(30)),
            ..PoolConfig::default()
        })
        .unwrap();
        pool.run(|| ()).unwrap();
        assert!(pool.count_workers() >= 1);
        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.count_workers(), 0);
        pool.shutdown();
    }

    #[test]
    fn worker_budget_retires_and_respawns_workers() {
        let pool = ThreadPool::builder()
            .max_workers(1)
            .name("budget")
            .max_tasks_per_worker(NonZeroUsize::new(1).unwrap())
            .build()
            .unwrap();
        for expected in 0..3 {
            assert_eq!(pool.run(move || expected).unwrap(), expected);
        }
        pool.shutdown();
    }

    #[test]
    fn alive_workers_never_exceed_max() {
        let pool = pool(2);
        for _ in 0..10 {
            pool.submit(|| thread::sleep(Duration::from_millis(5))).unwrap();
        }
        assert!(pool.count_workers() <= 2);
        assert!(pool.spawn_max_workers().unwrap() <= 2);
        assert!(pool.count_workers() <= 2);
        pool.shutdown();
    }

    #[test]
    fn counts_are_zero_once_closed() {
        let pool = pool(2);
        pool.run(|| ()).unwrap();
        pool.shutdown();
        assert_eq!(pool.count_workers(), 0);
        assert_eq!(pool.count_busy_workers(), 0);
        assert_eq!(pool.count_free_workers(), 0);
        assert_eq!(pool.count_pending_tasks(), 0);
    }

    #[test]
    fn submit_after_shutdown_is_refused() {
        let pool = pool(1);
        pool.shutdown();
        assert!(matches!(pool.submit(|| 0), Err(PoolError::Closed)));
        assert!(matches!(pool.run(|| 0), Err(TaskError::Pool(PoolError::Closed))));
    }

    #[test]
    fn self_test_passes_on_a_healthy_pool() {
        let pool = pool(2);
        pool.test().unwrap();
        pool.shutdown();
    }

    #[test]
    fn set_idle_timeout_affects_new_workers() {
        let pool = pool(1);
        assert_eq!(pool.idle_timeout(), Some(crate::pool::DEFAULT_IDLE_TIMEOUT));
        pool.set_idle_timeout(None);
        assert_eq!(pool.idle_timeout(), None);
        pool.shutdown();
    }
}
