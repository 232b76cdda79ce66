//! Completion-order multiplexing of futures.
//!
//! A [`FutureFilter`] is fed futures in any order and hands them back as
//! they reach a terminal state. It backs the unordered paths of the map
//! family and of [`as_done`](crate::future::as_done), and can be used
//! directly to consume a dynamic set of futures as results arrive.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::Mutex;

use crate::countdown::Countdown;
use crate::error::TaskError;
use crate::future::TaskFuture;

/// A completion-order multiplexer over futures.
///
/// Each future pushed into the filter registers a completion callback that
/// enqueues the future once it is done; [`get`](Self::get) pops futures in
/// completion order, with arrival order breaking ties. The filter can be
/// fed while it is being drained.
pub struct FutureFilter<T> {
    done_tx: Sender<TaskFuture<T>>,
    done_rx: Receiver<TaskFuture<T>>,
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    futures: Vec<TaskFuture<T>>,
    pending: usize,
}

impl<T: Send + 'static> FutureFilter<T> {
    /// Create an empty filter.
    pub fn new() -> Self {
        let (done_tx, done_rx) = unbounded();
        Self {
            done_tx,
            done_rx,
            inner: Mutex::new(Inner {
                futures: Vec::new(),
                pending: 0,
            }),
        }
    }

    /// Create a filter pre-populated with `futures`.
    pub fn with_futures(futures: impl IntoIterator<Item = TaskFuture<T>>) -> Self {
        let filter = Self::new();
        filter.populate(futures);
        filter
    }

    /// Add one future to the filter.
    pub fn put(&self, future: TaskFuture<T>) {
        {
            let mut inner = self.inner.lock();
            inner.futures.push(future.clone());
            inner.pending += 1;
        }
        let done_tx = self.done_tx.clone();
        future.add_callback(move |f| {
            let _ = done_tx.send(f.clone());
        });
    }

    /// Add a batch of futures to the filter.
    pub fn populate(&self, futures: impl IntoIterator<Item = TaskFuture<T>>) {
        for future in futures {
            self.put(future);
        }
    }

    /// The number of futures not yet handed back.
    pub fn len(&self) -> usize {
        self.inner.lock().pending
    }

    /// Whether every pushed future has been handed back.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A snapshot of every future ever pushed into the filter.
    pub fn futures(&self) -> Vec<TaskFuture<T>> {
        self.inner.lock().futures.clone()
    }

    /// Pop the next done future, blocking up to `timeout` (`None` blocks
    /// indefinitely).
    ///
    /// Returns `Ok(None)` once the filter is empty and
    /// `Err(TaskError::Timeout)` if the budget expires first.
    pub fn get(&self, timeout: Option<Duration>) -> Result<Option<TaskFuture<T>>, TaskError> {
        if self.inner.lock().pending == 0 {
            return Ok(None);
        }
        let received = match timeout {
            None => self.done_rx.recv().map_err(|_| TaskError::Timeout)?,
            Some(timeout) => match self.done_rx.recv_timeout(timeout) {
                Ok(future) => future,
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    return Err(TaskError::Timeout);
                }
            },
        };
        let mut inner = self.inner.lock();
        inner.pending = inner.pending.saturating_sub(1);
        Ok(Some(received))
    }

    /// Pop the next done future without blocking, if one is ready.
    pub fn try_get(&self) -> Option<TaskFuture<T>> {
        if self.inner.lock().pending == 0 {
            return None;
        }
        let future = self.done_rx.try_recv().ok()?;
        let mut inner = self.inner.lock();
        inner.pending = inner.pending.saturating_sub(1);
        Some(future)
    }

    /// Drain the filter lazily, yielding futures as they are done.
    ///
    /// One [`Countdown`] over `timeout` covers the whole drain; an expiry
    /// yields a single `Err(TaskError::Timeout)` and ends the sequence.
    pub fn get_all(&self, timeout: Option<Duration>) -> Drain<'_, T> {
        Drain {
            filter: self,
            countdown: Countdown::new(timeout),
            fused: false,
        }
    }
}

impl<T: Send + 'static> Default for FutureFilter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator returned by [`FutureFilter::get_all`].
pub struct Drain<'a, T> {
    filter: &'a FutureFilter<T>,
    countdown: Countdown,
    fused: bool,
}

impl<T: Send + 'static> Iterator for Drain<'_, T> {
    type Item = Result<TaskFuture<T>, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        match self.filter.get(self.countdown.remaining()) {
            Ok(Some(future)) => Some(Ok(future)),
            Ok(None) => None,
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}
