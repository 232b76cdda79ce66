//! Worker-pool runtime for Horizon Taskpool.
//!
//! This crate provides preemptive task execution over two kinds of worker
//! fleets:
//!
//! - **[`ThreadPool`]**: in-process workers, one OS thread each. Tasks are
//!   ordinary closures.
//! - **[`ProcessPool`]**: out-of-process workers, one child process each,
//!   for true parallelism and isolation. Tasks are declared
//!   [`RemoteTask`] types moved across the boundary with serde.
//!
//! Both pools hand back a [`TaskFuture`] per task — a handle carrying the
//! `Pending → Running → {Completed | Failed} | Cancelled` lifecycle,
//! result or failure report, timings, advisory cancellation, and
//! completion callbacks — and both compose `map`/`starmap` operations on
//! top of `submit` with lazy/eager, ordered/unordered, and chunked
//! variants.
//!
//! # Thread pool example
//!
//! ```no_run
//! use horizon_taskpool::{MapOptions, PoolConfig, ThreadPool};
//!
//! let pool = ThreadPool::new(PoolConfig::default()).unwrap();
//!
//! // Single task.
//! let future = pool.submit(|| 1 + 2).unwrap();
//! assert_eq!(future.collect(None).unwrap(), 3);
//!
//! // Lazy ordered map with bounded in-flight work.
//! let squares: Vec<_> = pool
//!     .map(|x: i64| x * x, 0..100, MapOptions::default().buffer_size(8))
//!     .unwrap()
//!     .collect::<Result<_, _>>()
//!     .unwrap();
//! assert_eq!(squares.len(), 100);
//!
//! pool.shutdown();
//! ```
//!
//! # Process pool example
//!
//! See the [`remote`](RemoteTask) module documentation: the host binary
//! declares its task types, registers them in a [`TaskRegistry`], and
//! calls [`init_worker`] at the very top of `main` so that re-executions
//! of the binary become workers.
//!
//! # Cancellation model
//!
//! [`TaskFuture::cancel`] is advisory: it flags the task, and the flag is
//! honored at scheduling points only (worker pickup for thread pools, the
//! dispatcher handoff for process pools). A task that already started
//! runs to completion. The only synchronous cancellation is pool
//! shutdown, which drains the queues.

#![warn(missing_docs)]

mod call;
mod chunk;
mod countdown;
mod error;
mod filter;
mod future;
mod map;
mod pool;
mod remote;
mod supervisor;
mod sync;
mod worker;

pub use call::StarCall;
pub use chunk::{Chunks, get_chunks, split_map_task, split_starmap_task};
pub use countdown::Countdown;
pub use error::{ErrorReport, InvalidStateError, PoolError, TaskError};
pub use filter::{Drain, FutureFilter};
pub use future::{AsDone, CallbackId, Status, TaskFuture, TaskId, as_done, collect, wait};
pub use map::{Map, MapOptions};
pub use pool::process::{ProcessPool, ProcessPoolBuilder};
pub use pool::thread::{ThreadPool, ThreadPoolBuilder};
pub use pool::{DEFAULT_IDLE_TIMEOUT, PoolConfig, WINDOWS_MAX_PROCESS_WORKERS};
pub use remote::{RemoteTask, TaskRegistry, WORKER_ENV, init_worker};
pub use worker::{WorkerHook, WorkerId, WorkerKind};

use static_assertions::assert_impl_all;

assert_impl_all!(ThreadPool: Send, Sync);
assert_impl_all!(ProcessPool: Send, Sync);
assert_impl_all!(TaskFuture<i32>: Send, Sync, Clone);
assert_impl_all!(FutureFilter<i32>: Send, Sync);
