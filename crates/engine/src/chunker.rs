//! Input chunking.
//!
//! Splits the input into numbered chunks of bounded size. Chunk ids ascend
//! from zero and the concatenation of all chunks equals the input sequence,
//! which is what lets the controller reorder results by chunk id alone.

/// A numbered batch of input elements, processed atomically by one worker.
pub(crate) struct Chunk<T> {
    pub(crate) id: u64,
    pub(crate) items: Vec<T>,
}

/// Resolve the chunk size from the per-call options.
///
/// An explicit `chunk_size` wins. Otherwise, when the input length is known
/// (sized input or `iterable_len` hint), the input is divided into
/// `n_splits` chunks (default `4 * n_jobs`), rounding up. Unsized inputs
/// without a hint fall back to single-element chunks.
pub(crate) fn resolve_chunk_size(
    total: Option<usize>,
    n_jobs: usize,
    chunk_size: Option<usize>,
    n_splits: Option<usize>,
) -> usize {
    if let Some(size) = chunk_size {
        return size.max(1);
    }
    match total {
        Some(total) if total > 0 => {
            let splits = n_splits.unwrap_or(4 * n_jobs).max(1);
            total.div_ceil(splits)
        }
        _ => 1,
    }
}

pub(crate) struct Chunks<T> {
    items: Box<dyn Iterator<Item = T> + Send>,
    chunk_size: usize,
    next_id: u64,
}

impl<T> Chunks<T> {
    pub(crate) fn new(items: Box<dyn Iterator<Item = T> + Send>, chunk_size: usize) -> Self {
        Self {
            items,
            chunk_size: chunk_size.max(1),
            next_id: 0,
        }
    }
}

impl<T> Iterator for Chunks<T> {
    type Item = Chunk<T>;

    fn next(&mut self) -> Option<Chunk<T>> {
        let mut items = Vec::with_capacity(self.chunk_size);
        while items.len() < self.chunk_size {
            match self.items.next() {
                Some(item) => items.push(item),
                None => break,
            }
        }
        if items.is_empty() {
            return None;
        }
        let id = self.next_id;
        self.next_id += 1;
        Some(Chunk { id, items })
    }
}

/// Exact input length, when the iterator knows it.
pub(crate) fn exact_len<I: Iterator>(iter: &I) -> Option<usize> {
    match iter.size_hint() {
        (lo, Some(hi)) if lo == hi => Some(lo),
        _ => None,
    }
}
