//! Map composition: lazy and eager result streams over submitted tasks.
//!
//! The pools build their `map`/`starmap` families out of four strategies:
//! lazy ordered (a FIFO buffer of at most `buffer_size` in-flight futures),
//! lazy unordered (a [`FutureFilter`] buffer yielding completion order),
//! the chunked forms of both (futures over `Vec` subresults, flattened),
//! and the eager forms (submit everything, then drain with
//! [`as_done`](crate::future::as_done)). One [`Countdown`] covers an entire
//! map call, so the timeout budgets the whole stream rather than each item.

use std::collections::VecDeque;
use std::time::Duration;

use crate::countdown::Countdown;
use crate::error::{PoolError, TaskError};
use crate::filter::FutureFilter;
use crate::future::{TaskFuture, as_done};

/// Options shared by the map and starmap families.
///
/// `chunk_size` groups inputs into composite subtasks, `buffer_size` bounds
/// how many tasks a lazy map keeps in flight (eager maps ignore it), and
/// `timeout` budgets the whole operation.
#[derive(Debug, Clone, Copy)]
pub struct MapOptions {
    /// Maximum number of inputs grouped into one subtask. Default 1.
    pub chunk_size: usize,
    /// Maximum number of in-flight tasks for lazy maps. Default 1.
    pub buffer_size: usize,
    /// Wall-clock budget for the whole map call. Default none.
    pub timeout: Option<Duration>,
}

impl Default for MapOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1,
            buffer_size: 1,
            timeout: None,
        }
    }
}

impl MapOptions {
    /// Group inputs into composite subtasks of at most `chunk_size` items.
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Keep up to `buffer_size` tasks in flight.
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Budget the whole map call with `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Iterator over the results of a map operation.
///
/// Items are `Result` values: a task failure, cancellation, timeout, or
/// pool error ends the stream after the offending item (the iterator fuses
/// on the first error).
pub struct Map<U> {
    inner: Box<dyn Iterator<Item = Result<U, TaskError>> + Send>,
}

impl<U> Map<U> {
    pub(crate) fn from_iter(inner: impl Iterator<Item = Result<U, TaskError>> + Send + 'static) -> Self {
        Self {
            inner: Box::new(inner),
        }
    }
}

impl<U> Iterator for Map<U> {
    type Item = Result<U, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }
}

impl<U> std::fmt::Debug for Map<U> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Map").finish_non_exhaustive()
    }
}

/// Lazy ordered strategy: a FIFO buffer re-imposes submission order.
pub(crate) fn lazy_ordered<I, S, U>(
    inputs: I,
    submit: S,
    buffer_size: usize,
    timeout: Option<Duration>,
) -> Map<U>
where
    I: Iterator + Send + 'static,
    S: FnMut(I::Item) -> Result<TaskFuture<U>, PoolError> + Send + 'static,
    U: Clone + Send + 'static,
{
    Map::from_iter(LazyOrdered {
        inputs,
        submit,
        buffer: VecDeque::new(),
        buffer_size: buffer_size.max(1),
        countdown: Countdown::new(timeout),
        fused: false,
    })
}

struct LazyOrdered<I, S, U>
where
    I: Iterator,
{
    inputs: I,
    submit: S,
    buffer: VecDeque<TaskFuture<U>>,
    buffer_size: usize,
    countdown: Countdown,
    fused: bool,
}

impl<I, S, U> Iterator for LazyOrdered<I, S, U>
where
    I: Iterator,
    S: FnMut(I::Item) -> Result<TaskFuture<U>, PoolError>,
    U: Clone + Send + 'static,
{
    type Item = Result<U, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        while self.buffer.len() < self.buffer_size {
            match self.inputs.next() {
                Some(item) => match (self.submit)(item) {
                    Ok(future) => self.buffer.push_back(future),
                    Err(err) => {
                        self.fused = true;
                        return Some(Err(err.into()));
                    }
                },
                None => break,
            }
        }
        let future = self.buffer.pop_front()?;
        match future.collect(self.countdown.remaining()) {
            Ok(value) => Some(Ok(value)),
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}

/// Lazy unordered strategy: a [`FutureFilter`] yields completion order.
pub(crate) fn lazy_unordered<I, S, U>(
    inputs: I,
    submit: S,
    buffer_size: usize,
    timeout: Option<Duration>,
) -> Map<U>
where
    I: Iterator + Send + 'static,
    S: FnMut(I::Item) -> Result<TaskFuture<U>, PoolError> + Send + 'static,
    U: Clone + Send + 'static,
{
    Map::from_iter(LazyUnordered {
        inputs,
        submit,
        filter: FutureFilter::new(),
        buffer_size: buffer_size.max(1),
        countdown: Countdown::new(timeout),
        fused: false,
    })
}

struct LazyUnordered<I, S, U>
where
    I: Iterator,
{
    inputs: I,
    submit: S,
    filter: FutureFilter<U>,
    buffer_size: usize,
    countdown: Countdown,
    fused: bool,
}

impl<I, S, U> Iterator for LazyUnordered<I, S, U>
where
    I: Iterator,
    S: FnMut(I::Item) -> Result<TaskFuture<U>, PoolError>,
    U: Clone + Send + 'static,
{
    type Item = Result<U, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.fused {
            return None;
        }
        while self.filter.len() < self.buffer_size {
            match self.inputs.next() {
                Some(item) => match (self.submit)(item) {
                    Ok(future) => self.filter.put(future),
                    Err(err) => {
                        self.fused = true;
                        return Some(Err(err.into()));
                    }
                },
                None => break,
            }
        }
        match self.filter.get(self.countdown.remaining()) {
            Ok(Some(future)) => match future.collect(None) {
                Ok(value) => Some(Ok(value)),
                Err(err) => {
                    self.fused = true;
                    Some(Err(err))
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.fused = true;
                Some(Err(err))
            }
        }
    }
}

/// Eager strategy over already-submitted futures.
pub(crate) fn eager<U>(futures: Vec<TaskFuture<U>>, keep_order: bool, timeout: Option<Duration>) -> Map<U>
where
    U: Clone + Send + 'static,
{
    Map::from_iter(
        as_done(futures, keep_order, timeout).map(|done| done.and_then(|future| future.collect(None))),
    )
}

/// Expand a stream of chunk results into a stream of single results.
///
/// Ordered inputs keep within-chunk order because each subresult `Vec` is
/// already ordered; unordered inputs interleave whole chunks in completion
/// order.
pub(crate) fn flatten_chunks<V>(chunks: Map<Vec<V>>) -> Map<V>
where
    V: Send + 'static,
{
    Map::from_iter(FlattenChunks {
        chunks,
        current: Vec::new().into_iter(),
        fused: false,
    })
}

struct FlattenChunks<V> {
    chunks: Map<Vec<V>>,
    current: std::vec::IntoIter<V>,
    fused: bool,
}

impl<V> Iterator for FlattenChunks<V>
where
    V: Send + 'static,
{
    type Item = Result<V, TaskError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(value) = self.current.next() {
                return Some(Ok(value));
            }
            if self.fused {
                return None;
            }
            match self.chunks.next() {
                Some(Ok(chunk)) => {
                    self.current = chunk.into_iter();
                }
                Some(Err(err)) => {
                    self.fused = true;
                    return Some(Err(err));
                }
                None => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::future::TaskId;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    /// Submission stub: completes each task on its own thread after an
    /// optional delay, recording how many tasks were in flight at once.
    fn stub_submit(
        delays: Vec<u64>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> impl FnMut(usize) -> Result<TaskFuture<usize>, PoolError> {
        let mut next_id = 0u64;
        move |value| {
            next_id += 1;
            let future = TaskFuture::new(TaskId(next_id), Arc::from("map-pool"));
            let clone = future.clone();
            let delay = delays.get(value).copied().unwrap_or(0);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let live = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(live, Ordering::SeqCst);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay));
                let _ = clone.set_result(value * value, Instant::now());
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
            Ok(future)
        }
    }

    fn counters() -> (Arc<AtomicUsize>, Arc<AtomicUsize>) {
        (Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0)))
    }

    #[test]
    fn lazy_ordered_preserves_input_order() {
        let (in_flight, peak) = counters();
        let results: Vec<_> = lazy_ordered(0..6usize, stub_submit(vec![30, 0, 20, 0, 10, 0], in_flight, peak), 3, None)
            .map(Result::unwrap)
            .collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25]);
    }

    #[test]
    fn lazy_ordered_respects_buffer_bound() {
        let (in_flight, peak) = counters();
        let results: Vec<_> = lazy_ordered(
            0..8usize,
            stub_submit(vec![5; 8], Arc::clone(&in_flight), Arc::clone(&peak)),
            2,
            None,
        )
        .map(Result::unwrap)
        .collect();
        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn lazy_unordered_yields_completion_order() {
        let (in_flight, peak) = counters();
        let results: Vec<_> = lazy_unordered(
            0..3usize,
            stub_submit(vec![50, 20, 0], in_flight, peak),
            3,
            None,
        )
        .map(Result::unwrap)
        .collect();
        assert_eq!(results, vec![4, 1, 0]);
    }

    #[test]
    fn timeout_fuses_the_stream() {
        let (in_flight, peak) = counters();
        let mut stream = lazy_ordered(
            0..5usize,
            stub_submit(vec![100; 5], in_flight, peak),
            1,
            Some(Duration::from_millis(10)),
        );
        assert!(matches!(stream.next(), Some(Err(TaskError::Timeout))));
        assert!(stream.next().is_none());
    }

    #[test]
    fn submit_error_is_surfaced_and_fuses() {
        let mut calls = 0;
        let mut stream = lazy_ordered(
            0..4usize,
            move |value: usize| {
                calls += 1;
                if calls > 2 {
                    return Err(PoolError::Closed);
                }
                let future = TaskFuture::new(TaskId(value as u64), Arc::from("map-pool"));
                future.set_result(value, Instant::now()).unwrap();
                Ok(future)
            },
            4,
            None,
        );
        assert!(matches!(
            stream.next(),
            Some(Err(TaskError::Pool(PoolError::Closed)))
        ));
        assert!(stream.next().is_none());
    }

    #[test]
    fn eager_ordered_and_unordered() {
        let make = |value: usize, delay: u64| {
            let future = TaskFuture::new(TaskId(value as u64), Arc::from("map-pool"));
            let clone = future.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay));
                let _ = clone.set_result(value, Instant::now());
            });
            future
        };
        let futures = vec![make(0, 40), make(1, 0), make(2, 20)];
        let ordered: Vec<_> = eager(futures.clone(), true, None).map(Result::unwrap).collect();
        assert_eq!(ordered, vec![0, 1, 2]);

        let futures = vec![make(0, 40), make(1, 0), make(2, 20)];
        let unordered: Vec<_> = eager(futures, false, None).map(Result::unwrap).collect();
        assert_eq!(unordered, vec![1, 2, 0]);
    }

    #[test]
    fn flatten_keeps_within_chunk_order() {
        let chunks = Map::from_iter(vec![Ok(vec![1, 2]), Ok(vec![3]), Ok(vec![4, 5])].into_iter());
        let flat: Vec<_> = flatten_chunks(chunks).map(Result::unwrap).collect();
        assert_eq!(flat, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn flatten_stops_after_error() {
        let chunks = Map::from_iter(
            vec![Ok(vec![1]), Err(TaskError::Timeout), Ok(vec![9])].into_iter(),
        );
        let mut flat = flatten_chunks(chunks);
        assert_eq!(flat.next(), Some(Ok(1)));
        assert!(matches!(flat.next(), Some(Err(TaskError::Timeout))));
        assert!(flat.next().is_none());
    }
}
