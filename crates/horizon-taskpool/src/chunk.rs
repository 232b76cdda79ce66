//! Chunking helpers for map composition.
//!
//! Chunking groups several input tuples into one composite subtask that
//! runs them sequentially on a single worker, amortizing dispatch cost for
//! cheap per-item work. The map family uses these helpers internally; they
//! are public because composite subtasks are occasionally useful on their
//! own with [`submit`](crate::ThreadPool::submit).

use std::sync::Arc;

use crate::call::StarCall;

/// Split an iterable into chunks of at most `chunk_size` items.
///
/// A `chunk_size` of zero is treated as one.
///
/// ```
/// use horizon_taskpool::get_chunks;
///
/// let chunks: Vec<_> = get_chunks(0..5, 2).collect();
/// assert_eq!(chunks, vec![vec![0, 1], vec![2, 3], vec![4]]);
/// ```
pub fn get_chunks<I: IntoIterator>(iterable: I, chunk_size: usize) -> Chunks<I::IntoIter> {
    Chunks {
        iter: iterable.into_iter(),
        chunk_size: chunk_size.max(1),
    }
}

/// Iterator returned by [`get_chunks`].
#[derive(Debug)]
pub struct Chunks<I> {
    iter: I,
    chunk_size: usize,
}

impl<I: Iterator> Iterator for Chunks<I> {
    type Item = Vec<I::Item>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut chunk = Vec::with_capacity(self.chunk_size);
        for item in self.iter.by_ref() {
            chunk.push(item);
            if chunk.len() == self.chunk_size {
                break;
            }
        }
        if chunk.is_empty() { None } else { Some(chunk) }
    }
}

/// Split a map operation into no-argument subtasks over chunked inputs.
///
/// Each yielded closure applies `target` to one chunk of items and returns
/// the results in input order.
pub fn split_map_task<F, T, U, I>(
    target: F,
    iterable: I,
    chunk_size: usize,
) -> impl Iterator<Item = impl FnOnce() -> Vec<U>>
where
    F: Fn(T) -> U,
    I: IntoIterator<Item = T>,
{
    let target = Arc::new(target);
    get_chunks(iterable, chunk_size).map(move |chunk| {
        let target = Arc::clone(&target);
        move || chunk.into_iter().map(|item| target(item)).collect()
    })
}

/// Split a starmap operation into no-argument subtasks over chunked
/// argument tuples.
pub fn split_starmap_task<F, A, U, I>(
    target: F,
    iterable: I,
    chunk_size: usize,
) -> impl Iterator<Item = impl FnOnce() -> Vec<U>>
where
    F: StarCall<A, U>,
    I: IntoIterator<Item = A>,
{
    let target = Arc::new(target);
    get_chunks(iterable, chunk_size).map(move |chunk| {
        let target = Arc::clone(&target);
        move || chunk.into_iter().map(|args| target.call_star(args)).collect()
    })
}
