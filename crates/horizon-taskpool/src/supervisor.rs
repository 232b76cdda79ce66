//! Global shutdown supervisor.
//!
//! Every pool registers a shutdown handler here at construction and
//! deregisters it when it shuts down cleanly. Pools normally shut down in
//! `Drop`; the supervisor covers the paths `Drop` cannot — notably
//! `std::process::exit` — by running every still-registered handler from a
//! `libc::atexit` hook installed the first time the supervisor is used.

use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

/// Identifier of a registered shutdown handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct HandlerId(u64);

type ShutdownHandler = Box<dyn Fn() + Send>;

/// Service object owning the handler registry. Process-wide there is one
/// instance behind `global()`; tests build their own.
pub(crate) struct ShutdownSupervisor {
    handlers: Mutex<Vec<(HandlerId, ShutdownHandler)>>,
    next_id: AtomicU64,
}

impl ShutdownSupervisor {
    pub(crate) fn new() -> Self {
        Self {
            handlers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn register(&self, handler: ShutdownHandler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.lock().push((id, handler));
        id
    }

    /// Remove a handler. Returns whether it was still registered.
    pub(crate) fn deregister(&self, id: HandlerId) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub(crate) fn count_handlers(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Drain the registry and run every handler once. Panicking handlers
    /// are logged and skipped.
    pub(crate) fn run_all(&self) {
        let handlers = mem::take(&mut *self.handlers.lock());
        for (id, handler) in handlers {
            if panic::catch_unwind(AssertUnwindSafe(|| handler())).is_err() {
                warn!(handler = id.0, "pool shutdown handler panicked at exit");
            }
        }
    }
}

static SUPERVISOR: OnceLock<ShutdownSupervisor> = OnceLock::new();

/// The process-wide supervisor, creating it (and installing the exit hook)
/// on first use.
pub(crate) fn global() -> &'static ShutdownSupervisor {
    SUPERVISOR.get_or_init(|| {
        // SAFETY: run_handlers_at_exit is a plain extern "C" fn that never
        // unwinds (run_all catches handler panics).
        unsafe {
            let _ = libc::atexit(run_handlers_at_exit);
        }
        ShutdownSupervisor::new()
    })
}

extern "C" fn run_handlers_at_exit() {
    if let Some(supervisor) = SUPERVISOR.get() {
        supervisor.run_all();
    }
}
