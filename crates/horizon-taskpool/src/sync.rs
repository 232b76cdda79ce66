//! Small synchronization primitives shared across the crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// A one-shot gate that threads can wait on with an optional timeout.
///
/// Workers set their latch when their run loop finishes so the pool can
/// implement timed joins; `JoinHandle` alone only offers an indefinite join.
#[derive(Debug, Default)]
pub(crate) struct Latch {
    ready: AtomicBool,
    condvar: Condvar,
    mutex: Mutex<()>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Open the latch and wake every waiter.
    pub(crate) fn open(&self) {
        // Hold the lock while setting ready to avoid lost wakeup race condition
        let _guard = self.mutex.lock();
        self.ready.store(true, Ordering::Release);
        self.condvar.notify_all();
    }

    pub(crate) fn is_open(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Block until the latch opens.
    pub(crate) fn wait(&self) {
        let mut guard = self.mutex.lock();
        while !self.ready.load(Ordering::Acquire) {
            self.condvar.wait(&mut guard);
        }
    }

    /// Block until the latch opens or `timeout` elapses. `None` waits
    /// indefinitely. Returns whether the latch is open.
    pub(crate) fn wait_timeout(&self, timeout: Option<Duration>) -> bool {
        let Some(timeout) = timeout else {
            self.wait();
            return true;
        };
        let mut guard = self.mutex.lock();
        if self.ready.load(Ordering::Acquire) {
            return true;
        }
        let result = self.condvar.wait_for(&mut guard, timeout);
        self.ready.load(Ordering::Acquire) || !result.timed_out()
    }
}
