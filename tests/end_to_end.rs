//! End-to-end scenarios through the public API, in both the shared-memory
//! fast path and the distributed (replica cache) configuration.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use pgas::api;
use pgas::pattern::{
    self, Histogram, LogicalAnd, Multiplies, ParallelPolicy, Plus,
};
use pgas::util::test_util::{group_test, with_env};
use pgas::{GlobalPtr, GlobalSpan, Mode};

/// Tears the runtime down on every exit path; a panicking scenario must not
/// leave worker threads behind for the next test.
struct FiniGuard;

impl Drop for FiniGuard {
    fn drop(&mut self) {
        if api::is_initialized() {
            api::fini();
        }
    }
}

fn with_runtime(ranks: usize, shared_memory: bool, f: impl FnOnce()) {
    with_env(
        &[
            ("RANKS", ranks.to_string()),
            ("ENABLE_SHARED_MEMORY", shared_memory.to_string()),
        ],
        || {
            group_test(300_000, || {
                api::init();
                let _fini = FiniGuard;
                f();
            })
        },
    )
}

fn pol(cutoff: usize, checkout: usize) -> ParallelPolicy {
    ParallelPolicy::new(cutoff, checkout)
}

fn distributed_sum(n: usize) {
    let p: GlobalPtr<i64> = api::malloc_coll(n);
    let span = GlobalSpan::new(p, n);
    api::root_exec(|| {
        pattern::for_each_mut(&pol(100, 100), span, Mode::Write, |i, x| *x = i as i64);
        let sum = pattern::reduce(&pol(100, 100), span, Plus::<i64>::new());
        assert_eq!(sum, (n * (n - 1) / 2) as i64);
    });
    api::free_coll(p);
}

#[test]
fn distributed_sum_shared_memory() {
    with_runtime(4, true, || distributed_sum(100_000));
}

#[test]
fn distributed_sum_over_replica_cache() {
    with_runtime(4, false, || distributed_sum(100_000));
}

#[test]
fn reduce_of_nothing_is_identity() {
    with_runtime(2, true, || {
        api::root_exec(|| {
            let sum = pattern::transform_reduce_index(
                &pol(100, 100),
                0..0,
                Plus::<i64>::new(),
                |i| i as i64,
            );
            assert_eq!(sum, 0);
        });
    });
}

#[test]
fn index_space_reduction_uses_all_workers() {
    with_runtime(4, true, || {
        let n = 100_000usize;
        api::root_exec(|| {
            let sum = pattern::transform_reduce_index(
                &pol(100, 100),
                0..n,
                Plus::<i64>::new(),
                |i| i as i64,
            );
            assert_eq!(sum, (n * (n - 1) / 2) as i64);
        });
        // every index visited exactly once, regardless of stealing
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        api::root_exec(move || {
            pattern::for_each_index(&pol(10, 10), 0..1000, move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            });
        });
        assert_eq!(count.load(Ordering::Relaxed), 1000);
    });
}

fn inclusive_scan_scenario(n: usize) {
    let p1: GlobalPtr<i64> = api::malloc_coll(n);
    let p2: GlobalPtr<i64> = api::malloc_coll(n);
    let a = GlobalSpan::new(p1, n);
    let b = GlobalSpan::new(p2, n);
    api::root_exec(|| {
        pattern::fill(&pol(100, 100), a, 1i64);
        pattern::inclusive_scan(&pol(100, 100), a, b, Plus::<i64>::new());

        assert_eq!(api::get(p2), 1);
        assert_eq!(api::get(p2.add(n - 1)), n as i64);
        pattern::for_each(&pol(100, 100), b, |i, x| assert_eq!(*x, i as i64 + 1));

        let sum = pattern::reduce(&pol(100, 100), b, Plus::<i64>::new());
        assert_eq!(sum, (n * (n + 1) / 2) as i64);

        // all-ones multiplicative scan stays at the initial value
        pattern::inclusive_scan_with_init(
            &pol(100, 100),
            a,
            b,
            Multiplies::<i64>::new(),
            10,
        );
        assert_eq!(api::get(p2), 10);
        assert_eq!(api::get(p2.add(n - 1)), 10);
    });
    api::free_coll(p1);
    api::free_coll(p2);
}

#[test]
fn inclusive_scan_shared_memory() {
    with_runtime(4, true, || inclusive_scan_scenario(100_000));
}

#[test]
fn inclusive_scan_over_replica_cache() {
    with_runtime(4, false, || inclusive_scan_scenario(20_000));
}

fn minmax_scenario(n: usize) {
    const MAX: i64 = 14;
    const MIN: i64 = -1;
    let p: GlobalPtr<i64> = api::malloc_coll(n);
    let span = GlobalSpan::new(p, n);
    api::root_exec(|| {
        // computed values stay within (MIN, MAX)
        pattern::for_each_mut(&pol(64, 64), span, Mode::Write, |i, x| {
            *x = (i as i64 * i as i64) % 7
        });
        api::put(p.add(n / 3), MAX);
        api::put(p.add(n / 4), MIN);
        // duplicates later in the range must not win
        api::put(p.add(2 * n / 3), MAX);
        api::put(p.add(n / 2), MIN);

        let (min_idx, max_idx) = pattern::minmax_element(&pol(64, 64), span);
        assert_eq!(min_idx, n / 4);
        assert_eq!(max_idx, n / 3);
        assert_eq!(pattern::min_element(&pol(64, 64), span), n / 4);
        assert_eq!(pattern::max_element(&pol(64, 64), span), n / 3);
    });
    api::free_coll(p);
}

#[test]
fn minmax_search_shared_memory() {
    with_runtime(4, true, || minmax_scenario(30_000));
}

#[test]
fn minmax_search_over_replica_cache() {
    with_runtime(3, false, || minmax_scenario(12_000));
}

fn histogram_scenario(n_samples: usize, n_bins: usize) {
    let p: GlobalPtr<f64> = api::malloc_coll(n_samples);
    let span = GlobalSpan::new(p, n_samples);
    api::root_exec(|| {
        pattern::for_each_mut(&pol(128, 128), span, Mode::Write, move |i, x| {
            let v = (i as f64 + 0.5) / n_bins as f64;
            *x = v - v.floor();
        });

        let bins = pattern::reduce(
            &pol(128, 128),
            span,
            Histogram::new(n_bins, 0.0, 1.0),
        );
        assert_eq!(bins.len(), n_bins);

        let total = pattern::reduce(&pol(16, 16), bins.as_span(), Plus::<u64>::new());
        assert_eq!(total as usize, n_samples);

        let expected = (n_samples / n_bins) as u64;
        for i in 0..n_bins {
            assert_eq!(bins.get(i), expected, "bin {}", i);
        }
    });
    api::free_coll(p);
}

#[test]
fn histogram_reducer_shared_memory() {
    with_runtime(4, true, || histogram_scenario(20_000, 100));
}

#[test]
fn histogram_reducer_over_replica_cache() {
    with_runtime(2, false, || histogram_scenario(5_000, 50));
}

fn producer_consumer(nelem: usize) {
    let p: GlobalPtr<i64> = api::malloc_coll(nelem);
    api::root_exec(|| {
        {
            let mut cs = api::checkout(p, nelem, Mode::Write);
            for (i, x) in cs.as_mut_slice().iter_mut().enumerate() {
                *x = i as i64 * 3 + 1;
            }
        }
        // the forked reader must observe the writes whether or not it is
        // stolen
        let (ok, _) = pattern::parallel_invoke(
            move || {
                let cs = api::checkout(p, nelem, Mode::Read);
                cs.as_slice()
                    .iter()
                    .enumerate()
                    .all(|(i, &x)| x == i as i64 * 3 + 1)
            },
            || (),
        );
        assert!(ok);
    });
    api::free_coll(p);
}

#[test]
fn producer_consumer_shared_memory() {
    with_runtime(4, true, || producer_consumer(4096));
}

#[test]
fn producer_consumer_over_replica_cache() {
    with_runtime(4, false, || producer_consumer(4096));
}

#[test]
fn equal_and_transform() {
    with_runtime(2, true, || {
        let n = 10_000;
        let p1: GlobalPtr<i64> = api::malloc_coll(n);
        let p2: GlobalPtr<i64> = api::malloc_coll(n);
        let a = GlobalSpan::new(p1, n);
        let b = GlobalSpan::new(p2, n);
        api::root_exec(|| {
            pattern::for_each_mut(&pol(100, 100), a, Mode::Write, |i, x| *x = i as i64);
            pattern::transform(&pol(100, 100), a, b, |x: &i64| *x);
            assert!(pattern::equal(&pol(100, 100), a, b));
            api::put(p2.add(n / 2), -5);
            assert!(!pattern::equal(&pol(100, 100), a, b));

            // dot product through the binary reduction
            pattern::fill(&pol(100, 100), b, 2i64);
            let dot = pattern::transform_reduce2(
                &pol(100, 100),
                a,
                b,
                Plus::<i64>::new(),
                |x: &i64, y: &i64| x * y,
            );
            assert_eq!(dot, (n * (n - 1)) as i64);

            let sorted = pattern::transform_reduce2(
                &pol(100, 100),
                a.subspan(0, n - 1),
                a.subspan(1, n - 1),
                LogicalAnd,
                |x: &i64, y: &i64| x <= y,
            );
            assert!(sorted);
        });
        api::free_coll(p1);
        api::free_coll(p2);
    });
}

#[test]
fn no_access_traversal_with_explicit_gets() {
    with_runtime(2, true, || {
        let n = 5_000;
        let p: GlobalPtr<i64> = api::malloc_coll(n);
        let span = GlobalSpan::new(p, n);
        api::root_exec(move || {
            pattern::for_each_mut(&pol(100, 100), span, Mode::Write, |i, x| *x = i as i64);
            let sum = pattern::transform_reduce_index(
                &pol(250, 250),
                0..n,
                Plus::<i64>::new(),
                move |i| api::get(p.add(i)),
            );
            assert_eq!(sum, (n * (n - 1) / 2) as i64);
        });
        api::free_coll(p);
    });
}

#[test]
fn zero_length_checkout_is_inert() {
    with_runtime(2, true, || {
        let p: GlobalPtr<i64> = api::malloc_coll(16);
        api::root_exec(|| {
            let cs = api::checkout(GlobalPtr::<i64>::null(), 0, Mode::Read);
            assert!(cs.is_empty());
            assert!(cs.as_ptr().is_null());
            let cs = api::checkout(p, 0, Mode::ReadWrite);
            assert!(cs.is_empty());
        });
        api::free_coll(p);
    });
}

#[test]
fn workhint_directed_execution() {
    with_runtime(4, true, || {
        let n = 10_000usize;
        let ranks = api::n_ranks();
        api::root_exec(move || {
            let policy = pol(64, 64).with_workhint(0, ranks);
            let sum = pattern::transform_reduce_index(
                &policy,
                0..n,
                Plus::<i64>::new(),
                |i| i as i64,
            );
            assert_eq!(sum, (n * (n - 1) / 2) as i64);
        });
    });
}

#[test]
fn small_cache_full_sweep() {
    // a single-block cache still completes whole-array traversals
    with_env(
        &[
            ("RANKS", "2".to_string()),
            ("ENABLE_SHARED_MEMORY", "false".to_string()),
            ("CACHE_SIZE", (1usize << 16).to_string()),
            ("BLOCK_SIZE", (1usize << 16).to_string()),
        ],
        || {
            group_test(300_000, || {
                api::init();
                let _fini = FiniGuard;
                let n = 64 * 1024; // 8 blocks of i64
                let p: GlobalPtr<i64> = api::malloc_coll(n);
                let span = GlobalSpan::new(p, n);
                api::root_exec(|| {
                    pattern::for_each_mut(&pol(512, 512), span, Mode::Write, |i, x| {
                        *x = i as i64
                    });
                    let sum = pattern::reduce(&pol(512, 512), span, Plus::<i64>::new());
                    assert_eq!(sum, (n * (n - 1) / 2) as i64);
                });
                api::free_coll(p);
            })
        },
    )
}
