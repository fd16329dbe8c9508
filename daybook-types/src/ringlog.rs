//! Fixed-capacity, newest-first ring log.
//!
//! One abstraction backs every bounded history in the runtime: access logs,
//! communication records, the global error log, and channel message buffers.
//! Push is O(1); the oldest entry is evicted on overflow.

use std::collections::VecDeque;

/// A bounded log that keeps the newest `capacity` entries.
///
/// Iteration order is newest-first.
#[derive(Debug, Clone)]
pub struct RingLog<T> {
    capacity: usize,
    entries: VecDeque<T>,
}

impl<T> RingLog<T> {
    /// Creates a log that retains at most `capacity` entries.
    /// A zero capacity is bumped to one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Appends an entry as the newest, evicting the oldest on overflow.
    pub fn push(&mut self, entry: T) {
        self.entries.push_front(entry);
        self.entries.truncate(self.capacity);
    }

    /// Number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The configured retention cap.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// The most recent entry, if any.
    #[must_use]
    pub fn newest(&self) -> Option<&T> {
        self.entries.front()
    }

    /// The oldest retained entry, if any.
    #[must_use]
    pub fn oldest(&self) -> Option<&T> {
        self.entries.back()
    }

    /// Iterates newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.entries.iter()
    }

    /// Iterates newest-first, mutably. Used to finalize in-place records
    /// (e.g. a pending communication record completing).
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.entries.iter_mut()
    }

    /// Drops all entries, keeping the capacity.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> RingLog<T> {
    /// Snapshot of up to `limit` entries, newest-first. `None` returns all.
    #[must_use]
    pub fn snapshot(&self, limit: Option<usize>) -> Vec<T> {
        let take = limit.unwrap_or(self.entries.len());
        self.entries.iter().take(take).cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_within_capacity_keeps_everything() {
        let mut log = RingLog::new(3);
        log.push(1);
        log.push(2);
        assert_eq!(log.len(), 2);
        assert_eq!(log.snapshot(None), vec![2, 1]);
    }

    #[test]
    fn overflow_evicts_oldest() {
        let mut log = RingLog::new(3);
        for n in 1..=5 {
            log.push(n);
        }
        assert_eq!(log.len(), 3);
        assert_eq!(log.snapshot(None), vec![5, 4, 3]);
        assert_eq!(*log.newest().unwrap(), 5);
        assert_eq!(*log.oldest().unwrap(), 3);
    }

    #[test]
    fn zero_capacity_is_bumped_to_one() {
        let mut log = RingLog::new(0);
        log.push("a");
        log.push("b");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.snapshot(None), vec!["b"]);
    }

    #[test]
    fn snapshot_respects_limit() {
        let mut log = RingLog::new(10);
        for n in 0..6 {
            log.push(n);
        }
        assert_eq!(log.snapshot(Some(2)), vec![5, 4]);
        assert_eq!(log.snapshot(Some(100)).len(), 6);
    }

    #[test]
    fn iter_mut_allows_in_place_updates() {
        let mut log = RingLog::new(4);
        log.push(1);
        log.push(2);
        for entry in log.iter_mut() {
            *entry *= 10;
        }
        assert_eq!(log.snapshot(None), vec![20, 10]);
    }

    #[test]
    fn clear_keeps_capacity() {
        let mut log = RingLog::new(2);
        log.push(1);
        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.capacity(), 2);
    }

    proptest! {
        #[test]
        fn never_exceeds_capacity(capacity in 1usize..64, pushes in 0usize..256) {
            let mut log = RingLog::new(capacity);
            for n in 0..pushes {
                log.push(n);
            }
            prop_assert!(log.len() <= capacity);
            prop_assert_eq!(log.len(), pushes.min(capacity));
        }

        #[test]
        fn keeps_exactly_the_newest_entries(capacity in 1usize..32, pushes in 1usize..128) {
            let mut log = RingLog::new(capacity);
            for n in 0..pushes {
                log.push(n);
            }
            let got = log.snapshot(None);
            let expected: Vec<usize> = (0..pushes).rev().take(capacity).collect();
            prop_assert_eq!(got, expected);
        }
    }
}
