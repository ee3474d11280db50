//! The programmer-facing surface: lifecycle, allocation, checkout and the
//! release/acquire verbs. Everything here resolves the calling thread's
//! worker and drives its coherence engine.

use std::mem::size_of;
use std::sync::Arc;

use crate::coherence::{Mode, ReleaseHandle};
use crate::container::CheckoutSpan;
use crate::gvm::PolicyKind;
use crate::pgas::with_runtime;
use crate::sched::Worker;
use crate::util::{Address, GlobalPtr};

pub use crate::pgas::{fini, init, is_initialized};

/// Run `f` as the root task on rank 0 while the other workers execute their
/// scheduler loops; forks inside `f` spread across the whole group.
pub fn root_exec<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    let worker = Worker::current();
    assert_eq!(worker.index, 0, "root_exec must be called from rank 0");
    worker.engine().acquire();
    let r = f();
    worker.engine().release();
    r
}

fn alloc_coll_bytes(bytes: usize, kind: PolicyKind, seg_size: Option<usize>) -> Address {
    with_runtime(|pgas| {
        let worker_f = Arc::new(move |w: &Worker| {
            w.engine().create_region(bytes, kind, seg_size);
        });
        pgas.coll_exec(
            move |w| {
                let id = w.engine().create_region(bytes, kind, seg_size);
                w.engine().region_base(id)
            },
            worker_f,
        )
    })
}

/// Collectively allocate `n` elements with the default block distribution.
/// Must be called outside `root_exec`, on every process in a real SPMD
/// deployment; the in-process group relays the call to all ranks.
pub fn malloc_coll<T>(n: usize) -> GlobalPtr<T> {
    alloc_shared(n, PolicyKind::Block, None)
}

/// Like `malloc_coll` with an explicit home policy.
pub fn alloc_shared<T>(n: usize, kind: PolicyKind, seg_size: Option<usize>) -> GlobalPtr<T> {
    assert!(n > 0, "collective allocation of zero elements");
    let base = alloc_coll_bytes(n * size_of::<T>(), kind, seg_size);
    unsafe { GlobalPtr::from_raw(base) }
}

/// Collectively free a `malloc_coll`/`alloc_shared` allocation.
pub fn free_coll<T>(p: GlobalPtr<T>) {
    assert!(!p.is_null());
    let addr = p.raw();
    with_runtime(|pgas| {
        let worker_f = Arc::new(move |w: &Worker| {
            let id = w
                .engine()
                .resolve(addr)
                .expect("free_coll of an unknown region");
            w.engine().destroy_region(id);
        });
        pgas.coll_exec(
            move |w| {
                let id = w
                    .engine()
                    .resolve(addr)
                    .expect("free_coll of an unknown region");
                w.engine().destroy_region(id);
            },
            worker_f,
        )
    })
}

/// Noncollective allocation homed on the calling rank. Usable from inside
/// tasks; any rank may free the result.
pub fn malloc_local<T>(n: usize) -> GlobalPtr<T> {
    assert!(n > 0);
    let addr = Worker::current().engine().malloc_local(n * size_of::<T>());
    unsafe { GlobalPtr::from_raw(addr) }
}

pub fn free_local<T>(p: GlobalPtr<T>, n: usize) {
    assert!(!p.is_null());
    Worker::current()
        .engine()
        .free_local(p.raw(), n * size_of::<T>());
}

/// Check out `[p, p + n)` for direct CPU access; the returned span checks in
/// when dropped. A zero-length (or null) request yields an empty span and no
/// communication.
pub fn checkout<T>(p: GlobalPtr<T>, n: usize, mode: Mode) -> CheckoutSpan<T> {
    CheckoutSpan::new(p, n, mode)
}

/// Schedule a checkout without waiting for its fetches; pair with
/// `checkout_complete` before accessing any of the batched spans.
pub fn checkout_nb<T>(p: GlobalPtr<T>, n: usize, mode: Mode) -> CheckoutSpan<T> {
    CheckoutSpan::new_nb(p, n, mode)
}

/// Complete the fetches of all outstanding `checkout_nb` calls.
pub fn checkout_complete() {
    Worker::current().engine().checkout_complete();
}

/// Read one value without a scoped checkout (the `NoAccess` escape hatch).
pub fn get<T: Copy>(p: GlobalPtr<T>) -> T {
    Worker::current().engine().get_value(p)
}

/// Write one value without a scoped checkout.
pub fn put<T: Copy>(p: GlobalPtr<T>, v: T) {
    Worker::current().engine().put_value(p, v)
}

/// Token for the writes issued so far on this rank.
pub fn release_lazy() -> ReleaseHandle {
    Worker::current().engine().release_lazy()
}

/// Flush all unreleased writes to their homes.
pub fn release() {
    Worker::current().engine().release();
}

/// Invalidate stale replicas up to `handle`'s epoch.
pub fn acquire_handle(handle: ReleaseHandle) {
    Worker::current().engine().acquire_handle(handle);
}

/// Invalidate all stale replicas.
pub fn acquire() {
    Worker::current().engine().acquire();
}

/// Service deferred runtime work and yield to one directed task.
pub fn poll() {
    let worker = Worker::current();
    worker.engine().poll();
    worker.poll();
}

/// The process group size.
pub fn n_ranks() -> usize {
    with_runtime(|pgas| pgas.options.ranks)
}

/// The rank of the calling worker.
pub fn my_rank() -> usize {
    Worker::current().comm().my_rank()
}
