use crate::api;
use crate::coherence::Mode;
use crate::container::{make_checkout, make_checkout_nb, CheckoutSpan, GlobalSpan};
use crate::pattern::{split_hint, ParallelPolicy, SequencedPolicy, WorkerRange};
use crate::sched::{fork_on, task_group_begin, task_group_end};
use crate::util::GlobalPtr;

/// Parallel recursion over an index range: midpoint split down to the
/// cutoff, left half forked (stealable), right half run in the current task.
pub(crate) fn parallel_apply<F>(
    policy: &ParallelPolicy,
    lo: usize,
    hi: usize,
    hint: Option<WorkerRange>,
    leaf: F,
) where
    F: Fn(usize, usize) + Clone + Send + Sync + 'static,
{
    api::poll();
    let n = hi - lo;
    if n <= policy.cutoff_count {
        leaf(lo, hi);
        return;
    }
    let mid = lo + n / 2;
    let (left_hint, right_hint, left_target) = split_hint(hint, n / 2, n);

    let tg = task_group_begin();
    let child_policy = *policy;
    let child_leaf = leaf.clone();
    let th = fork_on(left_target, move || {
        parallel_apply(&child_policy, lo, mid, left_hint, child_leaf)
    });
    parallel_apply(policy, mid, hi, right_hint, leaf);
    th.join();
    task_group_end(tg);
}

fn for_each_seq_inner<T, F>(seq: &SequencedPolicy, span: GlobalSpan<T>, base: usize, op: &F)
where
    T: Copy,
    F: Fn(usize, &T),
{
    let c = seq.checkout_count.max(1);
    let mut d = 0;
    while d < span.len() {
        let n = (span.len() - d).min(c);
        let cs = make_checkout(span.subspan(d, n), Mode::Read);
        for (k, x) in cs.as_slice().iter().enumerate() {
            op(base + d + k, x);
        }
        d += n;
    }
}

fn for_each_mut_seq_inner<T, F>(
    seq: &SequencedPolicy,
    span: GlobalSpan<T>,
    base: usize,
    mode: Mode,
    op: &F,
) where
    T: Copy,
    F: Fn(usize, &mut T),
{
    debug_assert!(mode.is_write());
    let c = seq.checkout_count.max(1);
    let mut d = 0;
    while d < span.len() {
        let n = (span.len() - d).min(c);
        let mut cs = make_checkout(span.subspan(d, n), mode);
        for (k, x) in cs.as_mut_slice().iter_mut().enumerate() {
            op(base + d + k, x);
        }
        d += n;
    }
}

/// Apply `op(index, &elem)` to every element, checked out read-only.
pub fn for_each<T, F>(policy: &ParallelPolicy, span: GlobalSpan<T>, op: F)
where
    T: Copy + 'static,
    F: Fn(usize, &T) + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    if span.is_empty() {
        return;
    }
    let seq = policy.to_sequenced();
    let leaf = move |lo: usize, hi: usize| {
        for_each_seq_inner(&seq, span.subspan(lo, hi - lo), lo, &op);
    };
    parallel_apply(policy, 0, span.len(), policy.workhint, leaf);
}

/// Apply `op(index, &mut elem)`; `mode` must be `Write` (contents fully
/// overwritten) or `ReadWrite`.
pub fn for_each_mut<T, F>(policy: &ParallelPolicy, span: GlobalSpan<T>, mode: Mode, op: F)
where
    T: Copy + 'static,
    F: Fn(usize, &mut T) + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    assert!(mode.is_write());
    if span.is_empty() {
        return;
    }
    let seq = policy.to_sequenced();
    let leaf = move |lo: usize, hi: usize| {
        for_each_mut_seq_inner(&seq, span.subspan(lo, hi - lo), lo, mode, &op);
    };
    parallel_apply(policy, 0, span.len(), policy.workhint, leaf);
}

/// Apply `op(index, ptr)` without any checkout (`NoAccess` traversal);
/// access the elements with explicit `api::get`/`api::put`.
pub fn for_each_ptr<T, F>(policy: &ParallelPolicy, span: GlobalSpan<T>, op: F)
where
    T: 'static,
    F: Fn(usize, GlobalPtr<T>) + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    if span.is_empty() {
        return;
    }
    let leaf = move |lo: usize, hi: usize| {
        for i in lo..hi {
            op(i, span.ptr_at(i));
        }
    };
    parallel_apply(policy, 0, span.len(), policy.workhint, leaf);
}

/// Apply `op(index)` over a plain index range.
pub fn for_each_index<F>(policy: &ParallelPolicy, range: std::ops::Range<usize>, op: F)
where
    F: Fn(usize) + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    if range.is_empty() {
        return;
    }
    let leaf = move |lo: usize, hi: usize| {
        for i in lo..hi {
            op(i);
        }
    };
    parallel_apply(policy, range.start, range.end, policy.workhint, leaf);
}

/// Overwrite every element with `value`.
pub fn fill<T>(policy: &ParallelPolicy, span: GlobalSpan<T>, value: T)
where
    T: Copy + Send + Sync + 'static,
{
    for_each_mut(policy, span, Mode::Write, move |_, x| *x = value);
}

/// `dst[i] = op(&src[i])`. The source is checked out read-only and the
/// destination write-only, both in one batch per leaf chunk so the fetches
/// overlap.
pub fn transform<T, U, F>(policy: &ParallelPolicy, src: GlobalSpan<T>, dst: GlobalSpan<U>, op: F)
where
    T: Copy + 'static,
    U: Copy + 'static,
    F: Fn(&T) -> U + Clone + Send + Sync + 'static,
{
    policy.assert_valid();
    assert_eq!(src.len(), dst.len());
    if src.is_empty() {
        return;
    }
    let checkout_count = policy.checkout_count;
    let leaf = move |lo: usize, hi: usize| {
        let mut d = lo;
        while d < hi {
            let n = (hi - d).min(checkout_count);
            let cs: CheckoutSpan<T> = make_checkout_nb(src.subspan(d, n), Mode::Read);
            let mut cd: CheckoutSpan<U> = make_checkout_nb(dst.subspan(d, n), Mode::Write);
            api::checkout_complete();
            for (x, y) in cs.as_slice().iter().zip(cd.as_mut_slice().iter_mut()) {
                *y = op(x);
            }
            d += n;
        }
    };
    parallel_apply(policy, 0, src.len(), policy.workhint, leaf);
}
