//! Pool configuration and the bookkeeping core shared by both pools.

pub(crate) mod process;
pub(crate) mod thread;

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};

use crate::countdown::Countdown;
use crate::error::PoolError;
use crate::future::TaskId;
use crate::worker::{PoolWorker, WorkerId, WorkerKind};

/// How long an idle worker waits for a task before retiring, unless
/// configured otherwise.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Upper bound on process workers on Windows, imposed by the host
/// platform's wait primitives.
pub const WINDOWS_MAX_PROCESS_WORKERS: usize = 60;

/// Configuration shared by [`ThreadPool`](crate::ThreadPool) and
/// [`ProcessPool`](crate::ProcessPool).
///
/// All fields are optional; the pools fill in their own defaults (worker
/// count from the available parallelism, a kind-specific name, the
/// 60-second idle timeout). `idle_timeout: None` disables the idle shrink
/// entirely — workers then block until work or shutdown arrives.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of workers the pool may keep alive.
    pub max_workers: Option<usize>,
    /// Pool name, used in worker and helper thread names.
    pub name: Option<String>,
    /// How long an idle worker waits before retiring; `None` never.
    pub idle_timeout: Option<Duration>,
    /// Number of tasks after which a worker retires; `None` for no budget.
    pub max_tasks_per_worker: Option<NonZeroUsize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            name: None,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            max_tasks_per_worker: None,
        }
    }
}

struct WorkerSet<W> {
    active: HashMap<WorkerId, Arc<W>>,
    inactive: Vec<Arc<W>>,
    spawned: u64,
}

struct PoolVars {
    idle_timeout: Option<Duration>,
    broken: bool,
    stored_error: Option<PoolError>,
    terminated: bool,
    next_task: u64,
    cancelled: Vec<TaskId>,
}

/// Bookkeeping shared by the two pool variants: the worker fleet, the
/// monotonic counters, and the closed/broken flags.
///
/// Lock order is `gate` → `workers` → (`futures`, owned by the process
/// pool) → `vars`; no code path acquires them in any other order.
pub(crate) struct PoolCore<W> {
    name: Arc<str>,
    kind: WorkerKind,
    max_workers: usize,
    gate: Mutex<()>,
    workers: Mutex<WorkerSet<W>>,
    vars: Mutex<PoolVars>,
    closed: AtomicBool,
}

impl<W: PoolWorker> PoolCore<W> {
    pub(crate) fn new(
        name: Arc<str>,
        kind: WorkerKind,
        max_workers: usize,
        idle_timeout: Option<Duration>,
    ) -> Self {
        Self {
            name,
            kind,
            max_workers,
            gate: Mutex::new(()),
            workers: Mutex::new(WorkerSet {
                active: HashMap::new(),
                inactive: Vec::new(),
                spawned: 0,
            }),
            vars: Mutex::new(PoolVars {
                idle_timeout,
                broken: false,
                stored_error: None,
                terminated: false,
                next_task: 0,
                cancelled: Vec::new(),
            }),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub(crate) fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Serialize a public mutating entry point.
    pub(crate) fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn set_closed(&self, closed: bool) {
        self.closed.store(closed, Ordering::Release);
    }

    pub(crate) fn is_broken(&self) -> bool {
        self.vars.lock().broken
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.vars.lock().terminated
    }

    pub(crate) fn set_terminated(&self) {
        self.vars.lock().terminated = true;
    }

    pub(crate) fn idle_timeout(&self) -> Option<Duration> {
        self.vars.lock().idle_timeout
    }

    pub(crate) fn set_idle_timeout(&self, idle_timeout: Option<Duration>) {
        self.vars.lock().idle_timeout = idle_timeout;
    }

    /// Surface the stored broken-pool reason, if any.
    pub(crate) fn ensure_integrity(&self) -> Result<(), PoolError> {
        match &self.vars.lock().stored_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }

    /// The integrity gate every public entry point passes through.
    pub(crate) fn check_open(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        self.ensure_integrity()
    }

    /// Store a broken-pool reason. Returns whether this was the first one
    /// (the caller cancels in-flight work exactly once).
    pub(crate) fn mark_broken(&self, error: PoolError) -> bool {
        let mut vars = self.vars.lock();
        let first = vars.stored_error.is_none();
        vars.stored_error = Some(error);
        vars.broken = true;
        first
    }

    pub(crate) fn clear_stored_error(&self) {
        self.vars.lock().stored_error = None;
    }

    pub(crate) fn next_task_id(&self) -> TaskId {
        let mut vars = self.vars.lock();
        vars.next_task += 1;
        TaskId(vars.next_task)
    }

    pub(crate) fn record_cancelled(&self, task_ids: impl IntoIterator<Item = TaskId>) {
        self.vars.lock().cancelled.extend(task_ids);
    }

    pub(crate) fn cancelled_tasks(&self) -> Vec<TaskId> {
        self.vars.lock().cancelled.clone()
    }

    pub(crate) fn count_workers(&self) -> usize {
        self.workers
            .lock()
            .active
            .values()
            .filter(|worker| worker.is_alive())
            .count()
    }

    pub(crate) fn count_busy_workers(&self) -> usize {
        self.workers
            .lock()
            .active
            .values()
            .filter(|worker| worker.is_alive() && worker.is_busy())
            .count()
    }

    pub(crate) fn count_free_workers(&self) -> usize {
        self.workers
            .lock()
            .active
            .values()
            .filter(|worker| worker.is_alive() && !worker.is_busy())
            .count()
    }

    /// Start workers. With `requested = None` the lazy-spawn arithmetic
    /// applies: `min(max_workers − alive, pending − free)`, clamped at
    /// zero. Explicit requests are clamped to the remaining capacity so
    /// the alive count never exceeds `max_workers`.
    pub(crate) fn spawn_workers(
        &self,
        requested: Option<usize>,
        pending: usize,
        make: impl Fn(WorkerId) -> W,
    ) -> usize {
        let mut set = self.workers.lock();
        let alive = set.active.values().filter(|w| w.is_alive()).count();
        let free = set
            .active
            .values()
            .filter(|w| w.is_alive() && !w.is_busy())
            .count();
        let capacity = self.max_workers.saturating_sub(alive);
        let count = match requested {
            Some(n) => n.min(capacity),
            None => capacity.min(pending.saturating_sub(free)),
        };
        for _ in 0..count {
            set.spawned += 1;
            let id = WorkerId(set.spawned);
            let worker = Arc::new(make(id));
            worker.start();
            set.active.insert(id, worker);
        }
        count
    }

    /// Move a worker that announced its exit to the inactive list; it is
    /// joined lazily at the next submission.
    pub(crate) fn retire_worker(&self, id: WorkerId) -> bool {
        let mut set = self.workers.lock();
        match set.active.remove(&id) {
            Some(worker) => {
                set.inactive.push(worker);
                true
            }
            None => false,
        }
    }

    pub(crate) fn join_inactive_workers(&self) {
        let inactive = {
            let mut set = self.workers.lock();
            std::mem::take(&mut set.inactive)
        };
        for worker in &inactive {
            worker.join(None);
        }
    }

    /// Join every active worker under one countdown. The worker map is
    /// snapshotted first so no lock is held while blocking.
    pub(crate) fn join_workers(&self, timeout: Option<Duration>) -> bool {
        let workers: Vec<Arc<W>> = self.workers.lock().active.values().cloned().collect();
        let countdown = Countdown::new(timeout);
        for worker in workers {
            if !worker.join(countdown.remaining()) {
                return false;
            }
        }
        true
    }

    pub(crate) fn clear_workers(&self) {
        let mut set = self.workers.lock();
        set.active.clear();
        set.inactive.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::Latch;
    use std::sync::atomic::AtomicBool as StdAtomicBool;

    struct FakeWorker {
        id: WorkerId,
        alive: StdAtomicBool,
        busy: StdAtomicBool,
        started: StdAtomicBool,
        done: Latch,
    }

    impl FakeWorker {
        fn new(id: WorkerId) -> Self {
            Self {
                id,
                alive: StdAtomicBool::new(false),
                busy: StdAtomicBool::new(false),
                started: StdAtomicBool::new(false),
                done: Latch::new(),
            }
        }

        fn finish(&self) {
            self.alive.store(false, Ordering::SeqCst);
            self.done.open();
        }
    }

    impl PoolWorker for FakeWorker {
        fn id(&self) -> WorkerId {
            self.id
        }

        fn start(&self) -> bool {
            if self.started.swap(true, Ordering::SeqCst) {
                return false;
            }
            self.alive.store(true, Ordering::SeqCst);
            true
        }

        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }

        fn is_busy(&self) -> bool {
            self.busy.load(Ordering::SeqCst)
        }

        fn join(&self, timeout: Option<Duration>) -> bool {
            if !self.started.load(Ordering::SeqCst) {
                return false;
            }
            self.done.wait_timeout(timeout)
        }
    }

    fn core(max_workers: usize) -> PoolCore<FakeWorker> {
        PoolCore::new(
            Arc::from("test-pool"),
            WorkerKind::Thread,
            max_workers,
            Some(DEFAULT_IDLE_TIMEOUT),
        )
    }

    #[test]
    fn lazy_spawn_arithmetic() {
        let core = core(4);
        // 3 pending tasks, no workers: spawn 3.
        assert_eq!(core.spawn_workers(None, 3, FakeWorker::new), 3);
        assert_eq!(core.count_workers(), 3);
        // 1 pending, 3 free: nothing to do.
        assert_eq!(core.spawn_workers(None, 1, FakeWorker::new), 0);
        // 10 pending: capacity is the binding constraint.
        for worker in core.workers.lock().active.values() {
            worker.busy.store(true, Ordering::SeqCst);
        }
        assert_eq!(core.spawn_workers(None, 10, FakeWorker::new), 1);
        assert_eq!(core.count_workers(), 4);
    }

    #[test]
    fn explicit_spawn_is_clamped_to_capacity() {
        let core = core(2);
        assert_eq!(core.spawn_workers(Some(5), 0, FakeWorker::new), 2);
        assert_eq!(core.count_workers(), 2);
        assert_eq!(core.spawn_workers(Some(5), 0, FakeWorker::new), 0);
    }

    #[test]
    fn worker_ids_are_monotonic() {
        let core = core(8);
        core.spawn_workers(Some(2), 0, FakeWorker::new);
        core.spawn_workers(Some(1), 0, FakeWorker::new);
        let mut ids: Vec<_> = core
            .workers
            .lock()
            .active
            .keys()
            .map(|id| id.get())
            .collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn busy_and_free_counts() {
        let core = core(3);
        core.spawn_workers(Some(3), 0, FakeWorker::new);
        {
            let set = core.workers.lock();
            let worker = set.active.get(&WorkerId(1)).unwrap();
            worker.busy.store(true, Ordering::SeqCst);
        }
        assert_eq!(core.count_busy_workers(), 1);
        assert_eq!(core.count_free_workers(), 2);
    }

    #[test]
    fn retire_moves_worker_to_inactive() {
        let core = core(2);
        core.spawn_workers(Some(1), 0, FakeWorker::new);
        assert!(core.retire_worker(WorkerId(1)));
        assert!(!core.retire_worker(WorkerId(1)));
        assert_eq!(core.count_workers(), 0);
        // Joining the retired worker needs its latch open.
        core.workers.lock().inactive[0].finish();
        core.join_inactive_workers();
        assert!(core.workers.lock().inactive.is_empty());
    }

    #[test]
    fn integrity_gate_reports_closed_then_broken() {
        let core = core(1);
        assert!(core.check_open().is_ok());
        assert!(core.mark_broken(PoolError::Consumer("boom".to_string())));
        assert!(!core.mark_broken(PoolError::Consumer("again".to_string())));
        assert!(core.is_broken());
        assert!(matches!(core.check_open(), Err(PoolError::Consumer(_))));
        core.set_closed(true);
        assert!(matches!(core.check_open(), Err(PoolError::Closed)));
    }

    #[test]
    fn task_ids_increase_monotonically() {
        let core = core(1);
        let a = core.next_task_id();
        let b = core.next_task_id();
        assert!(b > a);
    }

    #[test]
    fn cancelled_ledger_accumulates() {
        let core = core(1);
        core.record_cancelled([TaskId(3), TaskId(4)]);
        core.record_cancelled([TaskId(9)]);
        assert_eq!(core.cancelled_tasks(), vec![TaskId(3), TaskId(4), TaskId(9)]);
    }
}
