//! Parallel algorithm templates over the fork/join scheduler and the
//! checkout primitive. Parallel recursion splits ranges at the midpoint down
//! to `cutoff_count`; leaves access global memory through automatic
//! checkouts of at most `checkout_count` elements.

pub mod parallel_loop;
pub mod parallel_reduce;
pub mod parallel_search;
pub mod reducer;

pub use self::parallel_loop::{fill, for_each, for_each_index, for_each_mut, for_each_ptr, transform};
pub use self::parallel_reduce::{
    equal, inclusive_scan, inclusive_scan_with_init, reduce, transform_reduce,
    transform_reduce2, transform_reduce_index,
};
pub use self::parallel_search::{max_element, min_element, minmax_element, parallel_invoke};
pub use self::reducer::{Histogram, LogicalAnd, Multiplies, Plus, Reducer};

/// Serial execution policy: only the automatic checkout granularity.
#[derive(Clone, Copy, Debug)]
pub struct SequencedPolicy {
    pub checkout_count: usize,
}

impl SequencedPolicy {
    pub fn new(checkout_count: usize) -> SequencedPolicy {
        SequencedPolicy { checkout_count }
    }
}

impl Default for SequencedPolicy {
    fn default() -> Self {
        SequencedPolicy { checkout_count: 1 }
    }
}

/// A contiguous range of workers that a subtask's work maps onto. Forking a
/// subtask whose range starts at another worker deposits it there, biasing
/// stealing so tasks land near the workers holding their home data
/// (almost-deterministic work stealing).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkerRange {
    pub lo: usize,
    pub hi: usize,
}

/// Parallel execution policy.
#[derive(Clone, Copy, Debug)]
pub struct ParallelPolicy {
    /// Number of elements below which recursion runs the leaf serially.
    pub cutoff_count: usize,
    /// The maximum number of elements to check out at the same time.
    pub checkout_count: usize,
    /// Work hint for ADWS placement.
    pub workhint: Option<WorkerRange>,
}

impl Default for ParallelPolicy {
    fn default() -> Self {
        ParallelPolicy {
            cutoff_count: 1,
            checkout_count: 1,
            workhint: None,
        }
    }
}

impl ParallelPolicy {
    pub fn new(cutoff_count: usize, checkout_count: usize) -> ParallelPolicy {
        let p = ParallelPolicy {
            cutoff_count,
            checkout_count,
            workhint: None,
        };
        p.assert_valid();
        p
    }

    pub fn with_workhint(mut self, lo: usize, hi: usize) -> ParallelPolicy {
        assert!(lo < hi);
        self.workhint = Some(WorkerRange { lo, hi });
        self
    }

    pub fn to_sequenced(&self) -> SequencedPolicy {
        SequencedPolicy {
            checkout_count: self.checkout_count,
        }
    }

    pub(crate) fn assert_valid(&self) {
        assert!(self.checkout_count > 0);
        assert!(self.cutoff_count > 0);
        assert!(self.checkout_count <= self.cutoff_count);
    }
}

/// Split a work hint proportionally to the left share of a midpoint split.
/// Returns the child hints and the worker the left subtask is directed to.
pub(crate) fn split_hint(
    hint: Option<WorkerRange>,
    left: usize,
    total: usize,
) -> (Option<WorkerRange>, Option<WorkerRange>, Option<usize>) {
    match hint {
        None => (None, None, None),
        Some(r) => {
            debug_assert!(total > 0);
            let w = r.hi - r.lo;
            let mid = r.lo + (w * left) / total;
            let lh = WorkerRange { lo: r.lo, hi: mid.max(r.lo + 1).min(r.hi) };
            let rh = WorkerRange { lo: mid.min(r.hi - 1), hi: r.hi };
            (Some(lh), Some(rh), Some(r.lo))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hint_split_is_proportional() {
        let hint = Some(WorkerRange { lo: 0, hi: 8 });
        let (l, r, target) = split_hint(hint, 50, 100);
        assert_eq!(l, Some(WorkerRange { lo: 0, hi: 4 }));
        assert_eq!(r, Some(WorkerRange { lo: 4, hi: 8 }));
        assert_eq!(target, Some(0));
    }

    #[test]
    fn hint_split_never_empties() {
        let hint = Some(WorkerRange { lo: 3, hi: 4 });
        let (l, r, _) = split_hint(hint, 1, 2);
        assert_eq!(l, Some(WorkerRange { lo: 3, hi: 4 }));
        assert_eq!(r, Some(WorkerRange { lo: 3, hi: 4 }));
    }
}
