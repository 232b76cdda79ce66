//! Out-of-process pools: true parallelism on worker processes.
//!
//! A [`ProcessPool`] executes [`RemoteTask`] values in child processes.
//! Submission registers the future under its task id and enqueues the
//! encoded task on a local queue; a *dispatcher* thread moves records onto
//! the bounded cross-boundary channel (the single point where cancellation
//! is honored cheaply), per-worker feeder threads hand frames to idle
//! children, and a *consumer* thread resolves stored futures from the
//! replies. Worker lifecycle notifications (shutdown, crash) travel over
//! the same reply path.
//!
//! The pool re-executes its own program to create workers, so the host
//! binary must call [`init_worker`](crate::init_worker) first thing in
//! `main` with the same registry.

use std::fmt;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tracing::{debug, error, warn};

use crate::chunk::get_chunks;
use crate::error::{ErrorReport, PoolError, TaskError};
use crate::future::{TaskFuture, TaskId};
use crate::map::{Map, MapOptions, eager, flatten_chunks, lazy_ordered, lazy_unordered};
use crate::pool::{PoolConfig, PoolCore, WINDOWS_MAX_PROCESS_WORKERS};
use crate::remote::{ProbeTask, RemoteSlot, RemoteTask, TaskRegistry, chunk_kind};
use crate::supervisor::{self, HandlerId};
use crate::worker::process::{PoolEvent, ProcessWorker, ProcessWorkerContext, RemoteOrder};
use crate::worker::{WorkerId, WorkerKind};

/// How long the pool tries to hand a retirement sentinel to the bounded
/// cross-boundary channel before relying on the idle timeout instead.
const SENTINEL_SEND_TIMEOUT: Duration = Duration::from_millis(100);

/// A pool of out-of-process workers executing registered task types.
pub struct ProcessPool {
    inner: Arc<Inner>,
}

/// Builder for a [`ProcessPool`].
pub struct ProcessPoolBuilder {
    config: PoolConfig,
    registry: Arc<TaskRegistry>,
    program: Option<PathBuf>,
}

impl ProcessPoolBuilder {
    /// Start from the default configuration and the given registry.
    pub fn new(registry: Arc<TaskRegistry>) -> Self {
        Self {
            config: PoolConfig::default(),
            registry,
            program: None,
        }
    }

    /// Set the maximum number of worker processes.
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

    /// Retire each worker process after this many tasks.
    pub fn max_tasks_per_worker(mut self, max_tasks: NonZeroUsize) -> Self {
        self.config.max_tasks_per_worker = Some(max_tasks);
        self
    }

    /// Use `program` as the worker executable instead of the current one.
    ///
    /// The program must call [`init_worker`](crate::init_worker) with a
    /// registry equal to the pool's.
    pub fn worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = Some(program.into());
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<ProcessPool, PoolError> {
        ProcessPool::with_program(self.config, self.registry, self.program)
    }
}

struct Inner {
    core: PoolCore<ProcessWorker>,
    registry: Arc<TaskRegistry>,
    program: PathBuf,
    max_tasks_per_worker: Option<NonZeroUsize>,
    local_tx: Sender<LocalOrder>,
    local_rx: Receiver<LocalOrder>,
    remote_tx: Sender<RemoteOrder>,
    remote_rx: Receiver<RemoteOrder>,
    event_tx: Sender<PoolEvent>,
    event_rx: Receiver<PoolEvent>,
    futures: Mutex<HashMap<TaskId, Arc<dyn RemoteSlot>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
    supervisor_handle: Mutex<Option<HandlerId>>,
}

/// Record on the local submit queue, still carrying the future handle.
enum LocalOrder {
    Task {
        slot: Arc<dyn RemoteSlot>,
        kind: String,
        payload: Vec<u8>,
    },
    Stop,
}

impl ProcessPool {
    /// Create a pool from `config` and the shared task registry.
    ///
    /// `max_workers` defaults to the available parallelism and is capped
    /// at [`WINDOWS_MAX_PROCESS_WORKERS`] on Windows. The worker program
    /// defaults to the current executable.
    pub fn new(config: PoolConfig, registry: Arc<TaskRegistry>) -> Result<Self, PoolError> {
        Self::with_program(config, registry, None)
    }

    /// Start building a pool.
    pub fn builder(registry: Arc<TaskRegistry>) -> ProcessPoolBuilder {
        ProcessPoolBuilder::new(registry)
    }

    fn with_program(
        config: PoolConfig,
        registry: Arc<TaskRegistry>,
        program: Option<PathBuf>,
    ) -> Result<Self, PoolError> {
        let max_workers = match config.max_workers {
            Some(0) => {
                return Err(PoolError::Config("max_workers must be at least 1".to_string()));
            }
            Some(n) => n,
            None => thread::available_parallelism().map(NonZeroUsize::get).unwrap_or(1),
        };
        if cfg!(windows) && max_workers > WINDOWS_MAX_PROCESS_WORKERS {
            return Err(PoolError::Config(format!(
                "max process workers on Windows is {WINDOWS_MAX_PROCESS_WORKERS}"
            )));
        }
        let program = match program {
            Some(program) => program,
            None => std::env::current_exe().map_err(|err| {
                PoolError::Config(format!("cannot determine the worker program: {err}"))
            })?,
        };
        let name = config.name.unwrap_or_else(|| "processpool".to_string());
        let (local_tx, local_rx) = unbounded();
        // Bounded to the worker count so memory pressure tracks workers,
        // not submission rate.
        let (remote_tx, remote_rx) = bounded(max_workers + 1);
        let (event_tx, event_rx) = unbounded();
        let inner = Arc::new(Inner {
            core: PoolCore::new(
                Arc::from(name.as_str()),
                WorkerKind::Process,
                max_workers,
                config.idle_timeout,
            ),
            registry,
            program,
            max_tasks_per_worker: config.max_tasks_per_worker,
            local_tx,
            local_rx,
            remote_tx,
            remote_rx,
            event_tx,
            event_rx,
            futures: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
            consumer: Mutex::new(None),
            supervisor_handle: Mutex::new(None),
        });

        let dispatcher = thread::Builder::new()
            .name(format!("{name}-dispatcher"))
            .spawn({
                let inner = Arc::clone(&inner);
                move || inner.dispatcher_loop()
            })
            .expect("Failed to spawn dispatcher thread");
        *inner.dispatcher.lock() = Some(dispatcher);

        let consumer = thread::Builder::new()
            .name(format!("{name}-consumer"))
            .spawn({
                let inner = Arc::clone(&inner);
                move || inner.consumer_loop()
            })
            .expect("Failed to spawn consumer thread");
        *inner.consumer.lock() = Some(consumer);

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

    /// Always [`WorkerKind::Process`].
    pub fn worker_kind(&self) -> WorkerKind {
        self.inner.core.kind()
    }

    /// The maximum number of worker processes.
    pub fn max_workers(&self) -> usize {
        self.inner.core.max_workers()
    }

    /// The current idle shrink timeout.
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.inner.core.idle_timeout()
    }

    /// Change the idle shrink timeout for workers spawned from now on.
    pub fn set_idle_timeout(&self, idle_timeout: Option<Duration>) {
        self.inner.core.set_idle_timeout(idle_timeout);
    }

    /// Whether the pool has been closed.
    pub fn is_closed(&self) -> bool {
        self.inner.core.is_closed()
    }

    /// Whether the pool is broken.
    pub fn is_broken(&self) -> bool {
        self.inner.core.is_broken()
    }

    /// Whether a shutdown has completed.
    pub fn is_terminated(&self) -> bool {
        self.inner.core.is_terminated()
    }

    /// Ids of tasks that were enqueued but never executed.
    pub fn cancelled_tasks(&self) -> Vec<TaskId> {
        self.inner.core.cancelled_tasks()
    }

    /// Fail fast if the pool is closed or broken.
    pub fn check(&self) -> Result<(), PoolError> {
        self.inner.core.check_open()
    }

    /// Submit a task for execution in a worker process.
    ///
    /// Tasks that cannot be encoded, and kinds missing from the registry,
    /// come back as already-failed futures rather than pool errors.
    pub fn submit<T: RemoteTask>(&self, task: T) -> Result<TaskFuture<T::Output>, PoolError> {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        Ok(self
            .inner
            .submit_payload(T::NAME.to_string(), bincode::serialize(&task)))
    }

    /// Submit a task and block for its outcome.
    pub fn run<T>(&self, task: T) -> Result<T::Output, TaskError>
    where
        T: RemoteTask,
        T::Output: Clone,
    {
        let future = self.submit(task)?;
        future.collect(None)
    }

    /// Lazy map over task values, preserving input order.
    pub fn map<T, I>(&self, tasks: I, options: MapOptions) -> Result<Map<T::Output>, PoolError>
    where
        T: RemoteTask,
        T::Output: Clone,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.map_with_order(tasks, options, true)
    }

    /// Lazy map over task values, yielding results in completion order.
    pub fn map_unordered<T, I>(
        &self,
        tasks: I,
        options: MapOptions,
    ) -> Result<Map<T::Output>, PoolError>
    where
        T: RemoteTask,
        T::Output: Clone,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.map_with_order(tasks, options, false)
    }

    /// Eager map over task values, preserving input order.
    pub fn map_all<T, I>(&self, tasks: I, options: MapOptions) -> Result<Map<T::Output>, PoolError>
    where
        T: RemoteTask,
        T::Output: Clone,
        I: IntoIterator<Item = T>,
    {
        self.map_all_with_order(tasks, options, true)
    }

    /// Eager map over task values, yielding results in completion order.
    pub fn map_all_unordered<T, I>(
        &self,
        tasks: I,
        options: MapOptions,
    ) -> Result<Map<T::Output>, PoolError>
    where
        T: RemoteTask,
        T::Output: Clone,
        I: IntoIterator<Item = T>,
    {
        self.map_all_with_order(tasks, options, false)
    }

    /// Probe the pool by building a one-worker sibling with the same
    /// configuration and running the built-in probe task through it.
    pub fn test(&self) -> Result<(), TaskError> {
        self.check()?;
        let config = PoolConfig {
            max_workers: Some(1),
            name: Some(format!("{}-test", self.name())),
            idle_timeout: self.idle_timeout(),
            max_tasks_per_worker: self.inner.max_tasks_per_worker,
        };
        let pool = ProcessPool::with_program(
            config,
            Arc::clone(&self.inner.registry),
            Some(self.inner.program.clone()),
        )?;
        if pool.run(ProbeTask { a: 1, b: 2 })? != 3 {
            return Err(TaskError::Failed(ErrorReport::new(
                "probe submit returned a wrong result",
            )));
        }
        let sums: Vec<i64> = pool
            .map(
                (0..6).map(|x| ProbeTask { a: x, b: x }),
                MapOptions::default().chunk_size(2),
            )?
            .collect::<Result<_, _>>()?;
        if sums != (0..6).map(|x| x + x).collect::<Vec<_>>() {
            return Err(TaskError::Failed(ErrorReport::new(
                "probe map returned a wrong sequence",
            )));
        }
        pool.check().map_err(TaskError::from)?;
        pool.shutdown();
        Ok(())
    }

    /// Start `count` worker processes immediately (clamped to capacity).
    pub fn spawn_workers(&self, count: usize) -> Result<usize, PoolError> {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        let inner = Arc::clone(&self.inner);
        Ok(self
            .inner
            .core
            .spawn_workers(Some(count), 0, move |id| inner.make_worker(id)))
    }

    /// Start worker processes up to `max_workers`.
    pub fn spawn_max_workers(&self) -> Result<usize, PoolError> {
        self.spawn_workers(self.max_workers())
    }

    /// Number of live worker processes; zero once the pool is closed.
    pub fn count_workers(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.core.count_workers()
    }

    /// Number of workers with a task in flight.
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

    /// Number of tasks queued locally or on the cross-boundary channel.
    pub fn count_pending_tasks(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.local_rx.len() + self.inner.remote_rx.len()
    }

    /// Drain in-flight work, then reopen the pool.
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

    /// Close the pool: cancel queued tasks, retire the workers, stop the
    /// dispatcher and consumer threads, and cancel any future still
    /// registered. Idempotent.
    pub fn shutdown(&self) -> bool {
        Inner::shutdown(&self.inner)
    }

    fn map_with_order<T, I>(
        &self,
        tasks: I,
        options: MapOptions,
        keep_order: bool,
    ) -> Result<Map<T::Output>, PoolError>
    where
        T: RemoteTask,
        T::Output: Clone,
        I: IntoIterator<Item = T>,
        I::IntoIter: Send + 'static,
    {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        let inner = Arc::clone(&self.inner);
        Ok(if options.chunk_size <= 1 {
            let submit = move |task: T| {
                Ok(inner.submit_payload::<T::Output>(T::NAME.to_string(), bincode::serialize(&task)))
            };
            if keep_order {
                lazy_ordered(tasks.into_iter(), submit, options.buffer_size, options.timeout)
            } else {
                lazy_unordered(tasks.into_iter(), submit, options.buffer_size, options.timeout)
            }
        } else {
            let chunks = get_chunks(tasks, options.chunk_size);
            let submit = move |chunk: Vec<T>| {
                Ok(inner
                    .submit_payload::<Vec<T::Output>>(chunk_kind(T::NAME), bincode::serialize(&chunk)))
            };
            let stream = if keep_order {
                lazy_ordered(chunks, submit, options.buffer_size, options.timeout)
            } else {
                lazy_unordered(chunks, submit, options.buffer_size, options.timeout)
            };
            flatten_chunks(stream)
        })
    }

    fn map_all_with_order<T, I>(
        &self,
        tasks: I,
        options: MapOptions,
        keep_order: bool,
    ) -> Result<Map<T::Output>, PoolError>
    where
        T: RemoteTask,
        T::Output: Clone,
        I: IntoIterator<Item = T>,
    {
        self.inner.core.check_open()?;
        let _gate = self.inner.core.gate();
        if options.chunk_size <= 1 {
            let futures: Vec<_> = tasks
                .into_iter()
                .map(|task| {
                    self.inner
                        .submit_payload::<T::Output>(T::NAME.to_string(), bincode::serialize(&task))
                })
                .collect();
            Ok(eager(futures, keep_order, options.timeout))
        } else {
            let futures: Vec<_> = get_chunks(tasks, options.chunk_size)
                .map(|chunk| {
                    self.inner
                        .submit_payload::<Vec<T::Output>>(chunk_kind(T::NAME), bincode::serialize(&chunk))
                })
                .collect();
            Ok(flatten_chunks(eager(futures, keep_order, options.timeout)))
        }
    }
}

impl fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessPool")
            .field("name", &self.name())
            .field("max_workers", &self.max_workers())
            .field("workers", &self.inner.core.count_workers())
            .field("is_closed", &self.is_closed())
            .field("is_broken", &self.is_broken())
            .finish()
    }
}

impl Drop for ProcessPool {
    fn drop(&mut self) {
        Inner::shutdown(&self.inner);
    }
}

impl Inner {
    /// Register a future under its task id and enqueue the encoded task.
    /// Encoding failures and unknown kinds fail the future immediately.
    fn submit_payload<O>(
        self: &Arc<Self>,
        kind: String,
        encoded: bincode::Result<Vec<u8>>,
    ) -> TaskFuture<O>
    where
        O: DeserializeOwned + Send + 'static,
    {
        self.core.join_inactive_workers();
        let task_id = self.core.next_task_id();
        let future: TaskFuture<O> = TaskFuture::new(task_id, Arc::clone(self.core.name()));
        if !self.registry.contains(&kind) {
            let _ = future.set_failure(
                ErrorReport::new(format!("task kind not registered: {kind}")),
                Instant::now(),
            );
            return future;
        }
        match encoded {
            Ok(payload) => {
                let slot: Arc<dyn RemoteSlot> = Arc::new(future.clone());
                self.futures.lock().insert(task_id, Arc::clone(&slot));
                if self
                    .local_tx
                    .send(LocalOrder::Task { slot, kind, payload })
                    .is_err()
                {
                    if let Some(slot) = self.futures.lock().remove(&task_id) {
                        slot.mark_cancelled();
                    }
                    return future;
                }
                self.spawn_needed();
            }
            Err(err) => {
                let _ = future.set_failure(
                    ErrorReport::new(format!("failed to encode task: {err}")),
                    Instant::now(),
                );
            }
        }
        future
    }

    fn spawn_needed(self: &Arc<Self>) {
        let pending = self.local_rx.len() + self.remote_rx.len();
        let inner = Arc::clone(self);
        self.core
            .spawn_workers(None, pending, move |id| inner.make_worker(id));
    }

    fn make_worker(&self, id: WorkerId) -> ProcessWorker {
        let name = format!("{}-process-worker-{}", self.core.name(), id);
        ProcessWorker::new(
            id,
            name,
            ProcessWorkerContext {
                program: self.program.clone(),
                remote_rx: self.remote_rx.clone(),
                event_tx: self.event_tx.clone(),
                idle_timeout: self.core.idle_timeout(),
                max_tasks: self.max_tasks_per_worker,
            },
        )
    }

    /// Move tasks from the local queue to the cross-boundary channel,
    /// honoring cancel flags. This is the single choke point where a
    /// cancellation can be honored without racing worker processes.
    fn dispatcher_loop(&self) {
        while let Ok(order) = self.local_rx.recv() {
            match order {
                LocalOrder::Stop => break,
                LocalOrder::Task {
                    slot,
                    kind,
                    payload,
                } => {
                    let task_id = slot.task_id();
                    if slot.cancel_requested() {
                        slot.mark_cancelled();
                        self.futures.lock().remove(&task_id);
                        continue;
                    }
                    // The stored map keeps the future alive; drop the
                    // handle before the potentially blocking send.
                    drop(slot);
                    if self
                        .remote_tx
                        .send(RemoteOrder::Task {
                            task_id,
                            kind,
                            payload,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    }

    /// Resolve futures and track worker lifecycles from the reply stream.
    fn consumer_loop(self: &Arc<Self>) {
        while let Ok(event) = self.event_rx.recv() {
            if matches!(event, PoolEvent::Stop) {
                break;
            }
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handle_event(event)));
            if outcome.is_err() {
                self.core
                    .mark_broken(PoolError::Consumer("message consumer panicked".to_string()));
                break;
            }
        }
    }

    fn handle_event(self: &Arc<Self>, event: PoolEvent) {
        match event {
            PoolEvent::Stop => {}
            PoolEvent::Running { task_id } => {
                match self.futures.lock().get(&task_id).cloned() {
                    Some(slot) => slot.mark_running(Instant::now()),
                    None => warn!(task = task_id.get(), "running notice for an unknown task"),
                }
            }
            PoolEvent::Completed { task_id, payload } => {
                match self.futures.lock().remove(&task_id) {
                    Some(slot) => slot.complete(&payload),
                    None => warn!(task = task_id.get(), "result for an unknown task"),
                }
            }
            PoolEvent::TaskFailed { task_id, report } => {
                match self.futures.lock().remove(&task_id) {
                    Some(slot) => slot.fail(report),
                    None => warn!(task = task_id.get(), "failure for an unknown task"),
                }
            }
            PoolEvent::WorkerShutdown { worker_id } => {
                debug!(worker = worker_id.get(), "worker retired");
                self.core.retire_worker(worker_id);
                if !self.core.is_closed() {
                    self.spawn_needed();
                }
            }
            PoolEvent::WorkerFailed { worker_id, error } => {
                error!(worker = worker_id.get(), error = %error, "worker failed");
                self.core.retire_worker(worker_id);
                // Only the first failure cancels in-flight work; repeats
                // would storm the queues.
                if self.core.mark_broken(error) {
                    self.cancel_tasks();
                    self.notify_workers_to_shutdown();
                }
            }
        }
    }

    /// Drain both task queues, cancelling every task that never reached a
    /// worker and unregistering its future.
    fn cancel_tasks(&self) {
        let mut cancelled = Vec::new();
        while let Ok(order) = self.local_rx.try_recv() {
            if let LocalOrder::Task { slot, .. } = order {
                let task_id = slot.task_id();
                slot.mark_cancelled();
                self.futures.lock().remove(&task_id);
                cancelled.push(task_id);
            }
        }
        while let Ok(order) = self.remote_rx.try_recv() {
            if let RemoteOrder::Task { task_id, .. } = order {
                if let Some(slot) = self.futures.lock().remove(&task_id) {
                    slot.mark_cancelled();
                }
                cancelled.push(task_id);
            }
        }
        if !cancelled.is_empty() {
            debug!(count = cancelled.len(), "cancelled queued tasks");
        }
        self.core.record_cancelled(cancelled);
    }

    fn notify_workers_to_shutdown(&self) {
        for _ in 0..self.core.count_workers() {
            // The channel is bounded; if it stays full the worker falls
            // back to its idle timeout.
            let _ = self
                .remote_tx
                .send_timeout(RemoteOrder::Stop, SENTINEL_SEND_TIMEOUT);
        }
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
        // Leftovers (sentinels, frames raced in by the dispatcher).
        while self.local_rx.try_recv().is_ok() {}
        while self.remote_rx.try_recv().is_ok() {}
        let _ = self.local_tx.send(LocalOrder::Stop);
        if let Some(handle) = self.dispatcher.lock().take() {
            let _ = handle.join();
        }
        let _ = self.event_tx.send(PoolEvent::Stop);
        if let Some(handle) = self.consumer.lock().take() {
            let _ = handle.join();
        }
        let leftovers: Vec<_> = self.futures.lock().drain().map(|(_, slot)| slot).collect();
        for slot in leftovers {
            slot.mark_cancelled();
        }
        self.core.clear_workers();
        self.core.clear_stored_error();
        self.core.set_terminated();
        if let Some(handle) = self.supervisor_handle.lock().take() {
            supervisor::global().deregister(handle);
        }
        true
    }
}
