//! Typed tasks for out-of-process execution.
//!
//! Callables cannot cross a process boundary, so a
//! [`ProcessPool`](crate::ProcessPool) runs *declared* task types instead: a
//! [`RemoteTask`] is a serde-serializable value with a stable kind name and
//! a `run` method. Both sides of the boundary share a [`TaskRegistry`] that
//! maps kind names to handlers; the host binary hands its registry to
//! [`init_worker`] at the very top of `main`, which turns re-executions of
//! the binary into worker processes.
//!
//! # Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use horizon_taskpool::{init_worker, PoolConfig, ProcessPool, RemoteTask, TaskRegistry};
//! use std::sync::Arc;
//!
//! #[derive(Serialize, Deserialize)]
//! struct Square(i64);
//!
//! impl RemoteTask for Square {
//!     const NAME: &'static str = "examples/square";
//!     type Output = i64;
//!
//!     fn run(self) -> Result<i64, Box<dyn std::error::Error + Send + Sync>> {
//!         Ok(self.0 * self.0)
//!     }
//! }
//!
//! fn main() {
//!     let mut registry = TaskRegistry::new();
//!     registry.register::<Square>();
//!     let registry = Arc::new(registry);
//!     init_worker(&registry); // never returns in a worker process
//!
//!     let pool = ProcessPool::new(PoolConfig::default(), Arc::clone(&registry)).unwrap();
//!     assert_eq!(pool.run(Square(7)).unwrap(), 49);
//! }
//! ```

pub(crate) mod child;
pub(crate) mod protocol;

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ErrorReport;
use crate::future::{TaskFuture, TaskId};
use crate::worker::WorkerHook;

/// Environment variable marking a process as a pool worker.
///
/// Set by the pool on the worker command it spawns; observed by
/// [`init_worker`].
pub const WORKER_ENV: &str = "HORIZON_TASKPOOL_WORKER";

const CHUNK_SUFFIX: &str = "/chunk";

/// The kind name under which chunked batches of `kind` run.
pub(crate) fn chunk_kind(kind: &str) -> String {
    format!("{kind}{CHUNK_SUFFIX}")
}

/// A task that can be executed in a worker process.
///
/// The task value is serialized in the submitting process, reconstructed
/// in the worker, and executed there; its output travels back the same
/// way. Failures are captured as [`ErrorReport`]s carrying the error's
/// `source()` chain and, for panics, a backtrace rendered in the worker.
pub trait RemoteTask: Serialize + DeserializeOwned + Send + 'static {
    /// Stable kind name; must be unique within a registry.
    const NAME: &'static str;

    /// The result type produced by the task.
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Execute the task in the worker process.
    fn run(self) -> Result<Self::Output, Box<dyn std::error::Error + Send + Sync>>;
}

type RemoteHandler = Box<dyn Fn(&[u8]) -> Result<Vec<u8>, ErrorReport> + Send + Sync>;

/// Maps task kind names to execution handlers.
///
/// The registry must be identical in the submitting process and in its
/// workers — build it once in `main`, pass it to [`init_worker`], then to
/// [`ProcessPool::new`](crate::ProcessPool::new). Worker initializer and
/// finalizer hooks live here because they run inside the worker process.
///
/// Registering a task kind also registers its chunk form, used by the
/// chunked map operations to run `Vec<T>` batches in one dispatch.
pub struct TaskRegistry {
    handlers: HashMap<String, RemoteHandler>,
    initializer: Option<WorkerHook>,
    finalizer: Option<WorkerHook>,
}

impl TaskRegistry {
    /// Create a registry with only the built-in probe task registered.
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: HashMap::new(),
            initializer: None,
            finalizer: None,
        };
        registry.register::<ProbeTask>();
        registry
    }

    /// Register a task kind (and its chunk form).
    pub fn register<T: RemoteTask>(&mut self) {
        self.handlers
            .insert(T::NAME.to_string(), Box::new(invoke::<T>));
        self.handlers
            .insert(chunk_kind(T::NAME), Box::new(invoke_chunk::<T>));
    }

    /// Whether `kind` is registered.
    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Run `hook` at the start of every worker process.
    pub fn set_initializer(&mut self, hook: WorkerHook) {
        self.initializer = Some(hook);
    }

    /// Run `hook` when a worker process is about to exit cleanly.
    pub fn set_finalizer(&mut self, hook: WorkerHook) {
        self.finalizer = Some(hook);
    }

    pub(crate) fn run_handler(&self, kind: &str, payload: &[u8]) -> Result<Vec<u8>, ErrorReport> {
        match self.handlers.get(kind) {
            Some(handler) => handler(payload),
            None => Err(ErrorReport::new(format!("unknown task kind: {kind}"))),
        }
    }

    pub(crate) fn initializer(&self) -> Option<&WorkerHook> {
        self.initializer.as_ref()
    }

    pub(crate) fn finalizer(&self) -> Option<&WorkerHook> {
        self.finalizer.as_ref()
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("kinds", &self.handlers.len())
            .field("initializer", &self.initializer.is_some())
            .field("finalizer", &self.finalizer.is_some())
            .finish()
    }
}

/// Turn the current process into a worker if it was spawned as one.
///
/// Call this at the very top of `main`, before any other work: in a
/// process spawned by a [`ProcessPool`](crate::ProcessPool) it runs the
/// worker loop and never returns; in every other process it returns
/// immediately.
pub fn init_worker(registry: &TaskRegistry) {
    if std::env::var_os(WORKER_ENV).is_some() {
        child::run_child(registry);
    }
}

fn invoke<T: RemoteTask>(payload: &[u8]) -> Result<Vec<u8>, ErrorReport> {
    let task: T = decode(payload, "task")?;
    let output = run_guarded(|| task.run())?;
    encode(&output)
}

fn invoke_chunk<T: RemoteTask>(payload: &[u8]) -> Result<Vec<u8>, ErrorReport> {
    let tasks: Vec<T> = decode(payload, "task chunk")?;
    let mut outputs = Vec::with_capacity(tasks.len());
    for task in tasks {
        outputs.push(run_guarded(|| task.run())?);
    }
    encode(&outputs)
}

fn run_guarded<T>(
    body: impl FnOnce() -> Result<T, Box<dyn std::error::Error + Send + Sync>>,
) -> Result<T, ErrorReport> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(err)) => Err(ErrorReport::from_error(err.as_ref())),
        Err(payload) => {
            let report = ErrorReport::from_panic(payload);
            Err(match child::take_panic_trace() {
                Some(trace) => report.with_trace(trace),
                None => report,
            })
        }
    }
}

fn decode<T: DeserializeOwned>(payload: &[u8], what: &str) -> Result<T, ErrorReport> {
    bincode::deserialize(payload)
        .map_err(|err| ErrorReport::new(format!("failed to decode {what}: {err}")))
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, ErrorReport> {
    bincode::serialize(value)
        .map_err(|err| ErrorReport::new(format!("failed to encode task output: {err}")))
}

/// Built-in sanity task used by `ProcessPool::test`.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct ProbeTask {
    pub(crate) a: i64,
    pub(crate) b: i64,
}

impl RemoteTask for ProbeTask {
    const NAME: &'static str = "horizon-taskpool/probe";
    type Output = i64;

    fn run(self) -> Result<i64, Box<dyn std::error::Error + Send + Sync>> {
        Ok(self.a + self.b)
    }
}

/// Type-erased view of a stored future, used by the dispatcher and the
/// consumer to resolve tasks by id without knowing the output type.
pub(crate) trait RemoteSlot: Send + Sync {
    fn task_id(&self) -> TaskId;
    fn cancel_requested(&self) -> bool;
    fn mark_cancelled(&self);
    fn mark_running(&self, instant: Instant);
    fn complete(&self, payload: &[u8]);
    fn fail(&self, report: ErrorReport);
}

impl<T> RemoteSlot for TaskFuture<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn task_id(&self) -> TaskId {
        TaskFuture::task_id(self)
    }

    fn cancel_requested(&self) -> bool {
        TaskFuture::cancel_requested(self)
    }

    fn mark_cancelled(&self) {
        let _ = self.set_status(crate::future::Status::Cancelled, Instant::now());
    }

    fn mark_running(&self, instant: Instant) {
        let _ = self.set_status(crate::future::Status::Running, instant);
    }

    fn complete(&self, payload: &[u8]) {
        match bincode::deserialize::<T>(payload) {
            Ok(value) => {
                let _ = self.set_result(value, Instant::now());
            }
            Err(err) => {
                let _ = self.set_failure(
                    ErrorReport::new(format!("failed to decode task result: {err}")),
                    Instant::now(),
                );
            }
        }
    }

    fn fail(&self, report: ErrorReport) {
        let _ = self.set_failure(report, Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Serialize, Deserialize)]
    struct Doubler(i32);

    impl RemoteTask for Doubler {
        const NAME: &'static str = "tests/doubler";
        type Output = i32;

        fn run(self) -> Result<i32, Box<dyn std::error::Error + Send + Sync>> {
            Ok(self.0 * 2)
        }
    }

    #[derive(Debug, Error)]
    #[error("storage offline")]
    struct StorageOffline;

    #[derive(Debug, Serialize, Deserialize)]
    struct FailingTask;

    impl RemoteTask for FailingTask {
        const NAME: &'static str = "tests/failing";
        type Output = ();

        fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err(Box::new(StorageOffline))
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct PanickingTask;

    impl RemoteTask for PanickingTask {
        const NAME: &'static str = "tests/panicking";
        type Output = ();

        fn run(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            panic!("worker-side panic")
        }
    }

    fn registry() -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register::<Doubler>();
        registry.register::<FailingTask>();
        registry.register::<PanickingTask>();
        registry
    }

    #[test]
    fn handler_round_trips_a_task() {
        let registry = registry();
        let payload = bincode::serialize(&Doubler(21)).unwrap();
        let output = registry.run_handler(Doubler::NAME, &payload).unwrap();
        assert_eq!(bincode::deserialize::<i32>(&output).unwrap(), 42);
    }

    #[test]
    fn chunk_handler_runs_the_batch_in_order() {
        let registry = registry();
        let payload = bincode::serialize(&vec![Doubler(1), Doubler(2), Doubler(3)]).unwrap();
        let output = registry
            .run_handler(&chunk_kind(Doubler::NAME), &payload)
            .unwrap();
        assert_eq!(bincode::deserialize::<Vec<i32>>(&output).unwrap(), vec![2, 4, 6]);
    }

    #[test]
    fn unknown_kind_is_reported() {
        let registry = TaskRegistry::new();
        let err = registry.run_handler("tests/missing", &[]).unwrap_err();
        assert!(err.message().contains("unknown task kind"));
    }

    #[test]
    fn error_return_keeps_the_message() {
        let registry = registry();
        let payload = bincode::serialize(&FailingTask).unwrap();
        let err = registry.run_handler(FailingTask::NAME, &payload).unwrap_err();
        assert_eq!(err.message(), "storage offline");
    }

    #[test]
    fn panic_is_captured_as_a_report() {
        let registry = registry();
        let payload = bincode::serialize(&PanickingTask).unwrap();
        let err = registry
            .run_handler(PanickingTask::NAME, &payload)
            .unwrap_err();
        assert_eq!(err.message(), "worker-side panic");
    }

    #[test]
    fn probe_task_is_preregistered() {
        let registry = TaskRegistry::new();
        assert!(registry.contains(ProbeTask::NAME));
        assert!(registry.contains(&chunk_kind(ProbeTask::NAME)));
    }

    #[test]
    fn garbled_payload_is_a_decode_report() {
        let registry = registry();
        let err = registry
            .run_handler(Doubler::NAME, &[0xFF, 0xFF, 0xFF])
            .unwrap_err();
        assert!(err.message().contains("failed to decode task"));
    }
}
