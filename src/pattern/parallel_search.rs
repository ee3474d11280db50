use crate::api;
use crate::coherence::Mode;
use crate::container::{make_checkout, GlobalSpan};
use crate::pattern::ParallelPolicy;
use crate::sched::{fork, task_group_begin, task_group_end};

/// Run two closures as parallel siblings; the first is forked (stealable),
/// the second runs in the current task.
pub fn parallel_invoke<A, B, RA, RB>(fa: A, fb: B) -> (RA, RB)
where
    A: FnOnce() -> RA + Send + 'static,
    B: FnOnce() -> RB,
    RA: Send + 'static,
{
    let tg = task_group_begin();
    let th = fork(fa);
    let rb = fb();
    let ra = th.join();
    task_group_end(tg);
    (ra, rb)
}

/// Divide-and-conquer search: leaves summarize their range, `select` picks
/// between the left and right summaries. `select` must prefer the left
/// argument on ties so "first occurrence" results hold.
fn search_driver<V, L, S>(policy: &ParallelPolicy, lo: usize, hi: usize, leaf: L, select: S) -> V
where
    V: Send + 'static,
    L: Fn(usize, usize) -> V + Clone + Send + Sync + 'static,
    S: Fn(V, V) -> V + Clone + Send + Sync + 'static,
{
    api::poll();
    let n = hi - lo;
    if n <= policy.cutoff_count {
        return leaf(lo, hi);
    }
    let mid = lo + n / 2;
    let tg = task_group_begin();
    let child_policy = *policy;
    let child_leaf = leaf.clone();
    let child_select = select.clone();
    let select2 = select.clone();
    let th = fork(move || search_driver(&child_policy, lo, mid, child_leaf, child_select));
    let r = search_driver(policy, mid, hi, leaf, select);
    let l = th.join();
    task_group_end(tg);
    select2(l, r)
}

fn scan_leaf<T, C>(
    policy: &ParallelPolicy,
    span: GlobalSpan<T>,
    lo: usize,
    hi: usize,
    better: &C,
) -> (T, usize)
where
    T: Copy,
    C: Fn(&T, &T) -> bool,
{
    let checkout_count = policy.checkout_count;
    let mut best: Option<(T, usize)> = None;
    let mut d = lo;
    while d < hi {
        let n = (hi - d).min(checkout_count);
        let cs = make_checkout(span.subspan(d, n), Mode::Read);
        for (k, x) in cs.as_slice().iter().enumerate() {
            // strict comparison keeps the first occurrence on ties
            let improves = match &best {
                None => true,
                Some((b, _)) => better(x, b),
            };
            if improves {
                best = Some((*x, d + k));
            }
        }
        d += n;
    }
    best.expect("empty search leaf")
}

/// Index of the first minimum element.
pub fn min_element<T>(policy: &ParallelPolicy, span: GlobalSpan<T>) -> usize
where
    T: Copy + PartialOrd + Send + Sync + 'static,
{
    policy.assert_valid();
    if span.len() <= 1 {
        return 0;
    }
    let p = *policy;
    let leaf = move |lo: usize, hi: usize| scan_leaf(&p, span, lo, hi, &|x: &T, b: &T| x < b);
    let select = |l: (T, usize), r: (T, usize)| if r.0 < l.0 { r } else { l };
    search_driver(policy, 0, span.len(), leaf, select).1
}

/// Index of the first maximum element.
pub fn max_element<T>(policy: &ParallelPolicy, span: GlobalSpan<T>) -> usize
where
    T: Copy + PartialOrd + Send + Sync + 'static,
{
    policy.assert_valid();
    if span.len() <= 1 {
        return 0;
    }
    let p = *policy;
    let leaf = move |lo: usize, hi: usize| scan_leaf(&p, span, lo, hi, &|x: &T, b: &T| x > b);
    let select = |l: (T, usize), r: (T, usize)| if r.0 > l.0 { r } else { l };
    search_driver(policy, 0, span.len(), leaf, select).1
}

/// Indices of the first minimum and the first maximum element.
pub fn minmax_element<T>(policy: &ParallelPolicy, span: GlobalSpan<T>) -> (usize, usize)
where
    T: Copy + PartialOrd + Send + Sync + 'static,
{
    policy.assert_valid();
    if span.len() <= 1 {
        return (0, 0);
    }
    let p = *policy;
    let leaf = move |lo: usize, hi: usize| {
        let min = scan_leaf(&p, span, lo, hi, &|x: &T, b: &T| x < b);
        let max = scan_leaf(&p, span, lo, hi, &|x: &T, b: &T| x > b);
        (min, max)
    };
    let select = |l: ((T, usize), (T, usize)), r: ((T, usize), (T, usize))| {
        let min = if (r.0).0 < (l.0).0 { r.0 } else { l.0 };
        let max = if (r.1).0 > (l.1).0 { r.1 } else { l.1 };
        (min, max)
    };
    let (min, max) = search_driver(policy, 0, span.len(), leaf, select);
    (min.1, max.1)
}
