//! Reducers: an associative combine with an identity. Commutativity is not
//! required; the templates always combine a left accumulator with the
//! accumulator of the range to its right.

use std::marker::PhantomData;
use std::ops::{Add, Mul};

use num_traits::{One, Zero};

use crate::coherence::Mode;
use crate::container::{make_checkout, GlobalVector};

pub trait Reducer: Clone + Send + Sync + 'static {
    /// The element type folded in.
    type Item;
    /// The accumulator carried through the reduction tree.
    type Accum: Send + 'static;

    /// Value-typed reducers pass accumulators through joins directly;
    /// accumulator-view reducers (a histogram with a global output buffer)
    /// fold into a shared structure instead.
    const DIRECT: bool;

    fn identity(&self) -> Self::Accum;

    /// Fold one element into the accumulator.
    fn fold(&self, acc: &mut Self::Accum, x: Self::Item);

    /// Fold the right-hand accumulator into the left.
    fn combine(&self, acc: &mut Self::Accum, rhs: Self::Accum);

    /// Prepend `lhs` into `rhs` (needed by scans, where a left partial sum
    /// is folded in front of already-produced right results).
    fn fold_front(&self, lhs: &Self::Accum, rhs: &mut Self::Accum);

    fn clone_acc(&self, acc: &Self::Accum) -> Self::Accum;
}

pub struct Plus<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Plus<T> {
    pub fn new() -> Plus<T> {
        Plus {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Plus<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Plus<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}
impl<T> Copy for Plus<T> {}

impl<T> Reducer for Plus<T>
where
    T: Copy + Send + Sync + Add<Output = T> + Zero + 'static,
{
    type Item = T;
    type Accum = T;
    const DIRECT: bool = true;

    fn identity(&self) -> T {
        T::zero()
    }

    fn fold(&self, acc: &mut T, x: T) {
        *acc = *acc + x;
    }

    fn combine(&self, acc: &mut T, rhs: T) {
        *acc = *acc + rhs;
    }

    fn fold_front(&self, lhs: &T, rhs: &mut T) {
        *rhs = *lhs + *rhs;
    }

    fn clone_acc(&self, acc: &T) -> T {
        *acc
    }
}

pub struct Multiplies<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> Multiplies<T> {
    pub fn new() -> Multiplies<T> {
        Multiplies {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for Multiplies<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for Multiplies<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}
impl<T> Copy for Multiplies<T> {}

impl<T> Reducer for Multiplies<T>
where
    T: Copy + Send + Sync + Mul<Output = T> + One + 'static,
{
    type Item = T;
    type Accum = T;
    const DIRECT: bool = true;

    fn identity(&self) -> T {
        T::one()
    }

    fn fold(&self, acc: &mut T, x: T) {
        *acc = *acc * x;
    }

    fn combine(&self, acc: &mut T, rhs: T) {
        *acc = *acc * rhs;
    }

    fn fold_front(&self, lhs: &T, rhs: &mut T) {
        *rhs = *lhs * *rhs;
    }

    fn clone_acc(&self, acc: &T) -> T {
        *acc
    }
}

#[derive(Clone, Copy, Default)]
pub struct LogicalAnd;

impl Reducer for LogicalAnd {
    type Item = bool;
    type Accum = bool;
    const DIRECT: bool = true;

    fn identity(&self) -> bool {
        true
    }

    fn fold(&self, acc: &mut bool, x: bool) {
        *acc = *acc && x;
    }

    fn combine(&self, acc: &mut bool, rhs: bool) {
        *acc = *acc && rhs;
    }

    fn fold_front(&self, lhs: &bool, rhs: &mut bool) {
        *rhs = *lhs && *rhs;
    }

    fn clone_acc(&self, acc: &bool) -> bool {
        *acc
    }
}

/// Histogram of samples in `[lowest, highest]` over `n_bins` bins. The
/// accumulator is a global counter buffer allocated from the executing
/// rank's noncollective heap; combining adds bin-wise and frees the
/// right-hand buffer.
#[derive(Clone)]
pub struct Histogram {
    n_bins: usize,
    lowest: f64,
    highest: f64,
}

impl Histogram {
    pub fn new(n_bins: usize, lowest: f64, highest: f64) -> Histogram {
        assert!(n_bins > 0);
        assert!(lowest < highest);
        Histogram {
            n_bins,
            lowest,
            highest,
        }
    }

    fn add_into(&self, dst: &GlobalVector<u64>, src: &GlobalVector<u64>) {
        debug_assert_eq!(dst.len(), src.len());
        let mut d = make_checkout(dst.as_span(), Mode::ReadWrite);
        let s = make_checkout(src.as_span(), Mode::Read);
        for (x, y) in d.as_mut_slice().iter_mut().zip(s.as_slice()) {
            *x += *y;
        }
    }
}

impl Reducer for Histogram {
    type Item = f64;
    type Accum = GlobalVector<u64>;
    const DIRECT: bool = false;

    fn identity(&self) -> GlobalVector<u64> {
        GlobalVector::new_local(self.n_bins, 0)
    }

    fn fold(&self, acc: &mut GlobalVector<u64>, x: f64) {
        if self.lowest <= x && x <= self.highest {
            let delta = (self.highest - self.lowest) / self.n_bins as f64;
            let key = ((x - self.lowest) / delta) as usize;
            let key = key.min(self.n_bins - 1);
            acc.put(key, acc.get(key) + 1);
        }
    }

    fn combine(&self, acc: &mut GlobalVector<u64>, rhs: GlobalVector<u64>) {
        self.add_into(acc, &rhs);
        // rhs freed on drop
    }

    fn fold_front(&self, lhs: &GlobalVector<u64>, rhs: &mut GlobalVector<u64>) {
        self.add_into(rhs, lhs);
    }

    fn clone_acc(&self, acc: &GlobalVector<u64>) -> GlobalVector<u64> {
        let out = GlobalVector::new_local(self.n_bins, 0);
        self.add_into(&out, acc);
        out
    }
}
