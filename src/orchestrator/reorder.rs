//! Look-ahead buffer restoring sequence order over out-of-order completions

use std::collections::BTreeMap;

/// Holds completions until every lower sequence number has completed
///
/// The buffer only accepts sequence numbers inside
/// `[next_expected, next_expected + window)`; the dispatcher checks
/// [`ReorderBuffer::accepts`] before starting a job so buffering stays bounded
/// by the window even when an early job is slow.
#[derive(Debug)]
pub(crate) struct ReorderBuffer<T> {
    next_expected: usize,
    window: usize,
    pending: BTreeMap<usize, T>,
}

impl<T> ReorderBuffer<T> {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            next_expected: 0,
            window: window.max(1),
            pending: BTreeMap::new(),
        }
    }

    /// Whether a job at `seq` may be started without overrunning the window
    pub(crate) fn accepts(&self, seq: usize) -> bool {
        seq < self.next_expected + self.window
    }

    /// Lowest sequence number not yet released
    pub(crate) fn next_expected(&self) -> usize {
        self.next_expected
    }

    /// Completions waiting on a lower sequence number
    pub(crate) fn buffered(&self) -> usize {
        self.pending.len()
    }

    /// Add a completion and release everything that is now in order
    pub(crate) fn push(&mut self, seq: usize, item: T) -> Vec<T> {
        if seq < self.next_expected || self.pending.contains_key(&seq) {
            tracing::warn!(seq, next_expected = self.next_expected, "duplicate completion ignored");
            return Vec::new();
        }
        self.pending.insert(seq, item);

        let mut released = Vec::new();
        while let Some(item) = self.pending.remove(&self.next_expected) {
            released.push(item);
            self.next_expected += 1;
        }
        released
    }
}
