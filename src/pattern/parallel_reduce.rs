use crate::api;
use crate::coherence::Mode;
use crate::container::{make_checkout, make_checkout_nb, GlobalSpan};
use crate::pattern::parallel_loop::for_each_mut;
use crate::pattern::reducer::Reducer;
use crate::pattern::{split_hint, ParallelPolicy, WorkerRange};
use crate::sched::{fork_on, task_group_begin, task_group_end};

/// The parallel reduction tree. Each leaf folds its range into a fresh
/// accumulator; internal nodes combine left ⊕ right after the join's
/// release/acquire pairing.
fn reduce_driver<R, L>(
    policy: &ParallelPolicy,
    lo: usize,
    hi: usize,
    hint: Option<WorkerRange>,
    reducer: R,
    leaf: L,
) -> R::Accum
where
    R: Reducer,
    L: Fn(usize, usize, &mut R::Accum) + Clone + Send + Sync + 'static,
{
    api::poll();
    let n = hi - lo;
    if n <= policy.cutoff_count {
        let mut acc = reducer.identity();
        leaf(lo, hi, &mut acc);
        return acc;
    }
    let mid = lo + n / 2;
    let (left_hint, right_hint, left_target) = split_hint(hint, n / 2, n);

    let tg = task_group_begin();
    let child_policy = *policy;
    let child_reducer = reducer.clone();
    let child_leaf = leaf.clone();
    let th = fork_on(left_target, move || {
        reduce_driver(&child_policy, lo, mid, left_hint, child_reducer, child_leaf)
    });
    let acc_r = reduce_driver(policy, mid, hi, right_hint, reducer.clone(), leaf);
    let mut acc = th.join();
    task_group_end(tg);
    reducer.combine(&mut acc, acc_r);
    acc
}

/// Reduce the elements of `span`.
pub fn reduce<T, R>(policy: &ParallelPolicy, span: GlobalSpan<T>, reducer: R) -> R::Accum
where
    T: Copy + 'static,
    R: Reducer<Item = T>,
{
    transform_reduce(policy, span, reducer, |x: &T| *x)
}

/// Reduce `op(&elem)` over the elements of `span`.
pub fn transform_reduce<T, R, F>(
    policy: &ParallelPolicy,
    span: GlobalSpan<T>,
    reducer: R,
    op: F,
) -> R::Accum
where
    T: Copy + 'static,
    R: Reducer,
    F: Fn(&T) -> R::Item + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    if span.is_empty() {
        return reducer.identity();
    }
    let checkout_count = policy.checkout_count;
    let leaf_reducer = reducer.clone();
    let leaf = move |lo: usize, hi: usize, acc: &mut R::Accum| {
        let mut d = lo;
        while d < hi {
            let n = (hi - d).min(checkout_count);
            let cs = make_checkout(span.subspan(d, n), Mode::Read);
            for x in cs.as_slice() {
                leaf_reducer.fold(acc, op(x));
            }
            d += n;
        }
    };
    reduce_driver(policy, 0, span.len(), policy.workhint, reducer, leaf)
}

/// Reduce `op(i)` over an index range (no global memory traversal).
pub fn transform_reduce_index<R, F>(
    policy: &ParallelPolicy,
    range: std::ops::Range<usize>,
    reducer: R,
    op: F,
) -> R::Accum
where
    R: Reducer,
    F: Fn(usize) -> R::Item + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    if range.is_empty() {
        return reducer.identity();
    }
    let leaf_reducer = reducer.clone();
    let leaf = move |lo: usize, hi: usize, acc: &mut R::Accum| {
        for i in lo..hi {
            leaf_reducer.fold(acc, op(i));
        }
    };
    reduce_driver(policy, range.start, range.end, policy.workhint, reducer, leaf)
}

/// Reduce `op(&a[i], &b[i])` over a pair of equal-length spans.
pub fn transform_reduce2<T, U, R, F>(
    policy: &ParallelPolicy,
    a: GlobalSpan<T>,
    b: GlobalSpan<U>,
    reducer: R,
    op: F,
) -> R::Accum
where
    T: Copy + 'static,
    U: Copy + 'static,
    R: Reducer,
    F: Fn(&T, &U) -> R::Item + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    assert_eq!(a.len(), b.len());
    if a.is_empty() {
        return reducer.identity();
    }
    let checkout_count = policy.checkout_count;
    let leaf_reducer = reducer.clone();
    let leaf = move |lo: usize, hi: usize, acc: &mut R::Accum| {
        let mut d = lo;
        while d < hi {
            let n = (hi - d).min(checkout_count);
            let ca = make_checkout_nb(a.subspan(d, n), Mode::Read);
            let cb = make_checkout_nb(b.subspan(d, n), Mode::Read);
            api::checkout_complete();
            for (x, y) in ca.as_slice().iter().zip(cb.as_slice()) {
                leaf_reducer.fold(acc, op(x, y));
            }
            d += n;
        }
    };
    reduce_driver(policy, 0, a.len(), policy.workhint, reducer, leaf)
}

/// Do two spans hold equal values?
pub fn equal<T>(policy: &ParallelPolicy, a: GlobalSpan<T>, b: GlobalSpan<T>) -> bool
where
    T: Copy + PartialEq + 'static,
{
    if a.len() != b.len() {
        return false;
    }
    transform_reduce2(
        policy,
        a,
        b,
        crate::pattern::reducer::LogicalAnd,
        |x: &T, y: &T| x == y,
    )
}

fn scan_driver<T, R>(
    policy: &ParallelPolicy,
    src: GlobalSpan<T>,
    dst: GlobalSpan<R::Accum>,
    lo: usize,
    hi: usize,
    hint: Option<WorkerRange>,
    reducer: R,
) -> R::Accum
where
    T: Copy + 'static,
    R: Reducer<Item = T>,
    R::Accum: Copy + Sync,
{
    api::poll();
    let n = hi - lo;
    if n <= policy.cutoff_count {
        let checkout_count = policy.checkout_count;
        let mut acc = reducer.identity();
        let mut d = lo;
        while d < hi {
            let c = (hi - d).min(checkout_count);
            let cs = make_checkout_nb(src.subspan(d, c), Mode::Read);
            let mut cd = make_checkout_nb(dst.subspan(d, c), Mode::Write);
            api::checkout_complete();
            for (x, y) in cs.as_slice().iter().zip(cd.as_mut_slice().iter_mut()) {
                reducer.fold(&mut acc, *x);
                *y = reducer.clone_acc(&acc);
            }
            d += c;
        }
        return acc;
    }

    let mid = lo + n / 2;
    let (left_hint, right_hint, left_target) = split_hint(hint, n / 2, n);

    let tg = task_group_begin();
    let child_policy = *policy;
    let child_reducer = reducer.clone();
    let th = fork_on(left_target, move || {
        scan_driver(&child_policy, src, dst, lo, mid, left_hint, child_reducer)
    });
    let acc_r = scan_driver(policy, src, dst, mid, hi, right_hint, reducer.clone());
    let mut acc = th.join();
    task_group_end(tg);

    // prepend the left total to the right half's already-written results
    let prefix = acc;
    let fold_reducer = reducer.clone();
    for_each_mut(
        policy,
        dst.subspan(mid, hi - mid),
        Mode::ReadWrite,
        move |_, y| fold_reducer.fold_front(&prefix, y),
    );

    reducer.combine(&mut acc, acc_r);
    acc
}

/// Inclusive prefix reduction: `dst[i] = src[0] ⊕ ... ⊕ src[i]`. Requires a
/// direct-accumulation reducer (the accumulator is the element written out).
pub fn inclusive_scan<T, R>(
    policy: &ParallelPolicy,
    src: GlobalSpan<T>,
    dst: GlobalSpan<R::Accum>,
    reducer: R,
) -> R::Accum
where
    T: Copy + 'static,
    R: Reducer<Item = T>,
    R::Accum: Copy + Sync,
{
    policy.assert_valid();
    assert!(R::DIRECT, "inclusive_scan needs a direct-accumulation reducer");
    assert_eq!(src.len(), dst.len());
    if src.is_empty() {
        return reducer.identity();
    }
    scan_driver(policy, src, dst, 0, src.len(), policy.workhint, reducer)
}

/// Inclusive scan with an initial value prepended to every output element.
pub fn inclusive_scan_with_init<T, R>(
    policy: &ParallelPolicy,
    src: GlobalSpan<T>,
    dst: GlobalSpan<R::Accum>,
    reducer: R,
    init: R::Accum,
) -> R::Accum
where
    T: Copy + 'static,
    R: Reducer<Item = T>,
    R::Accum: Copy + Sync,
{
    let total = inclusive_scan(policy, src, dst, reducer.clone());
    let fold_reducer = reducer.clone();
    for_each_mut(policy, dst, Mode::ReadWrite, move |_, y| {
        fold_reducer.fold_front(&init, y)
    });
    let mut out = init;
    reducer.combine(&mut out, total);
    out
}
