//! Round-robin handle over a set of executors.
//!
//! A [`ContextGroup`] does not own or drive its executors; it only hands
//! them out in rotation. Typical use: collect the executor handles of a few
//! contexts and let connection setup pick the next one.

use crate::error::{Error, ErrorKind, Result};
use crate::executor::Executor;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// An immutable, deduplicated list of executors with an atomic rotation
/// counter.
///
/// The group is not cloneable; moving it carries the counter's current value
/// along.
pub struct ContextGroup {
    index: AtomicUsize,
    executors: Vec<Executor>,
}

impl ContextGroup {
    /// Builds a group from executor handles, dropping duplicates while
    /// preserving first-seen order.
    #[must_use]
    pub fn new<I>(executors: I) -> Self
    where
        I: IntoIterator<Item = Executor>,
    {
        let mut unique: Vec<Executor> = Vec::new();
        for executor in executors {
            if !unique.iter().any(|known| known.same(&executor)) {
                unique.push(executor);
            }
        }
        Self {
            index: AtomicUsize::new(0),
            executors: unique,
        }
    }

    /// Returns the next executor in rotation.
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::OutOfRange`] if the group is empty.
    pub fn next(&self) -> Result<Executor> {
        if self.executors.is_empty() {
            return Err(Error::new(ErrorKind::OutOfRange).with_context("empty context group"));
        }
        Ok(self.next_unchecked())
    }

    /// Returns the next executor in rotation without the emptiness check.
    ///
    /// # Panics
    ///
    /// Panics if the group is empty.
    #[must_use]
    pub fn next_unchecked(&self) -> Executor {
        let slot = self.index.fetch_add(1, Ordering::Relaxed) % self.executors.len();
        self.executors[slot].clone()
    }

    /// Returns the number of distinct executors in the group.
    #[must_use]
    pub fn size(&self) -> usize {
        self.executors.len()
    }

    /// Returns true if the group holds no executors.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl fmt::Debug for ContextGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextGroup")
            .field("size", &self.executors.len())
            .field("index", &self.index.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotates_in_insertion_order() {
        let a = Executor::new();
        let b = Executor::new();
        let c = Executor::new();
        let group = ContextGroup::new([a.clone(), b.clone(), c.clone()]);

        assert_eq!(group.size(), 3);
        for _ in 0..2 {
            assert!(group.next().expect("next").same(&a));
            assert!(group.next().expect("next").same(&b));
            assert!(group.next().expect("next").same(&c));
        }
    }

    #[test]
    fn fair_over_many_rounds() {
        let executors: Vec<Executor> = (0..4).map(|_| Executor::new()).collect();
        let group = ContextGroup::new(executors.iter().cloned());

        let rounds = 5;
        let mut counts = vec![0usize; executors.len()];
        for _ in 0..rounds * executors.len() {
            let executor = group.next().expect("next");
            let slot = executors
                .iter()
                .position(|known| known.same(&executor))
                .expect("known executor");
            counts[slot] += 1;
        }
        assert!(counts.iter().all(|&count| count == rounds));
    }

    #[test]
    fn duplicates_are_dropped() {
        let a = Executor::new();
        let b = Executor::new();
        let group = ContextGroup::new([a.clone(), b.clone(), a.clone()]);
        assert_eq!(group.size(), 2);
    }

    #[test]
    fn empty_group_reports_out_of_range() {
        let group = ContextGroup::new(std::iter::empty::<Executor>());
        assert!(group.is_empty());
        assert_eq!(group.next().unwrap_err().kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn move_keeps_counter_position() {
        let a = Executor::new();
        let b = Executor::new();
        let group = ContextGroup::new([a.clone(), b]);
        let _ = group.next();

        let moved = group;
        // One call consumed: the moved group continues from the second slot.
        assert!(!moved.next().expect("next").same(&a));
    }
}
