//! In-process workers: one OS thread per worker.

use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{ErrorReport, PoolError};
use crate::future::{Status, TaskFuture};
use crate::sync::Latch;
use crate::worker::{PoolWorker, WorkerExitHandler, WorkerHook, WorkerId, WorkerOrder};

/// Everything the worker thread needs; consumed on start.
pub(crate) struct ThreadWorkerContext {
    pub(crate) receiver: Receiver<WorkerOrder>,
    pub(crate) idle_timeout: Option<Duration>,
    pub(crate) max_tasks: Option<NonZeroUsize>,
    pub(crate) initializer: Option<WorkerHook>,
    pub(crate) finalizer: Option<WorkerHook>,
    pub(crate) on_exit: WorkerExitHandler,
}

/// An in-process worker running a task loop on its own thread.
pub(crate) struct ThreadWorker {
    id: WorkerId,
    name: String,
    context: Mutex<Option<ThreadWorkerContext>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    busy: Arc<AtomicBool>,
    done: Arc<Latch>,
}

impl ThreadWorker {
    pub(crate) fn new(id: WorkerId, name: String, context: ThreadWorkerContext) -> Self {
        Self {
            id,
            name,
            context: Mutex::new(Some(context)),
            handle: Mutex::new(None),
            started: AtomicBool::new(false),
            busy: Arc::new(AtomicBool::new(false)),
            done: Arc::new(Latch::new()),
        }
    }
}

impl PoolWorker for ThreadWorker {
    fn id(&self) -> WorkerId {
        self.id
    }

    fn start(&self) -> bool {
        let Some(context) = self.context.lock().take() else {
            return false;
        };
        let id = self.id;
        let busy = Arc::clone(&self.busy);
        let done = Arc::clone(&self.done);
        self.started.store(true, Ordering::Release);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                runner(id, context, &busy);
                done.open();
            })
            .expect("Failed to spawn worker thread");
        *self.handle.lock() = Some(handle);
        true
    }

    fn is_alive(&self) -> bool {
        self.started.load(Ordering::Acquire) && !self.done.is_open()
    }

    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    fn join(&self, timeout: Option<Duration>) -> bool {
        if !self.started.load(Ordering::Acquire) {
            return false;
        }
        if !self.done.wait_timeout(timeout) {
            return false;
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        true
    }
}

/// Run the worker to completion and deliver the exit notification.
fn runner(id: WorkerId, context: ThreadWorkerContext, busy: &AtomicBool) {
    let ThreadWorkerContext {
        receiver,
        idle_timeout,
        max_tasks,
        initializer,
        finalizer,
        on_exit,
    } = context;

    let outcome = run_worker(
        &receiver,
        idle_timeout,
        max_tasks,
        initializer.as_ref(),
        finalizer.as_ref(),
        busy,
    );
    busy.store(false, Ordering::Release);
    match outcome {
        Ok(()) => on_exit(id, None),
        Err(err) => {
            error!(worker = id.0, error = %err, "worker crashed");
            on_exit(id, Some(err));
        }
    }
}

fn run_worker(
    receiver: &Receiver<WorkerOrder>,
    idle_timeout: Option<Duration>,
    max_tasks: Option<NonZeroUsize>,
    initializer: Option<&WorkerHook>,
    finalizer: Option<&WorkerHook>,
    busy: &AtomicBool,
) -> Result<(), PoolError> {
    if let Some(initializer) = initializer {
        panic::catch_unwind(AssertUnwindSafe(|| (**initializer)()))
            .map_err(|payload| PoolError::Initializer(ErrorReport::from_panic(payload)))?;
    }
    panic::catch_unwind(AssertUnwindSafe(|| {
        task_loop(receiver, idle_timeout, max_tasks, busy);
    }))
    .map_err(|payload| PoolError::Worker(ErrorReport::from_panic(payload)))?;
    if let Some(finalizer) = finalizer {
        panic::catch_unwind(AssertUnwindSafe(|| (**finalizer)()))
            .map_err(|payload| PoolError::Finalizer(ErrorReport::from_panic(payload)))?;
    }
    Ok(())
}

fn task_loop(
    receiver: &Receiver<WorkerOrder>,
    idle_timeout: Option<Duration>,
    max_tasks: Option<NonZeroUsize>,
    busy: &AtomicBool,
) {
    let mut executed = 0usize;
    loop {
        if let Some(max_tasks) = max_tasks {
            if executed == max_tasks.get() {
                debug!("worker reached its task budget");
                break;
            }
        }
        let order = match idle_timeout {
            None => match receiver.recv() {
                Ok(order) => order,
                Err(_) => break,
            },
            Some(timeout) => match receiver.recv_timeout(timeout) {
                Ok(order) => order,
                Err(RecvTimeoutError::Timeout) => {
                    debug!("worker idle timeout reached");
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => break,
            },
        };
        match order {
            WorkerOrder::Task(task) => {
                busy.store(true, Ordering::Release);
                (task.run)();
                busy.store(false, Ordering::Release);
                executed += 1;
                // The task tuple is dropped here, before the next blocking
                // dequeue can hold its arguments alive.
            }
            WorkerOrder::Exit => break,
        }
    }
}

/// The task execution protocol for in-process tasks: transition to
/// RUNNING, honor the cancel flag, run the body under `catch_unwind`,
/// publish the result or the captured panic.
pub(crate) fn run_task<F, T>(future: TaskFuture<T>, task: F)
where
    F: FnOnce() -> T,
    T: Send + 'static,
{
    let _ = future.set_status(Status::Running, Instant::now());
    if future.cancel_requested() {
        let _ = future.set_status(Status::Cancelled, Instant::now());
        return;
    }
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(value) => {
            let _ = future.set_result(value, Instant::now());
        }
        Err(payload) => {
            let _ = future.set_failure(ErrorReport::from_panic(payload), Instant::now());
        }
    }
}
