//! The process group. Ranks are hosted in-process (one worker thread per
//! rank); a cluster transport attaches behind the same surface by providing
//! the group, the collectives and window memory through its launcher.

use std::mem::{size_of, MaybeUninit};
use std::sync::{Arc, Condvar, Mutex};

use crate::net::window::WindowShared;

pub type Rank = usize;

struct BarrierInner {
    count: usize,
    generation: u64,
}

struct CollBarrier {
    inner: Mutex<BarrierInner>,
    cv: Condvar,
}

impl CollBarrier {
    fn new() -> Self {
        Self {
            inner: Mutex::new(BarrierInner {
                count: 0,
                generation: 0,
            }),
            cv: Condvar::new(),
        }
    }

    /// Arrive at the barrier without waiting; returns the generation to wait
    /// for.
    fn arrive(&self, n: usize) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let gen = inner.generation;
        inner.count += 1;
        if inner.count == n {
            inner.count = 0;
            inner.generation += 1;
            self.cv.notify_all();
        }
        gen
    }

    fn wait_generation(&self, gen: u64) {
        let mut inner = self.inner.lock().unwrap();
        while inner.generation <= gen {
            inner = self.cv.wait(inner).unwrap();
        }
    }

    fn is_complete(&self, gen: u64) -> bool {
        self.inner.lock().unwrap().generation > gen
    }
}

pub(crate) struct GroupState {
    pub n_ranks: usize,
    pub shared_memory: bool,
    barrier: CollBarrier,
    coll_buf: Mutex<Vec<u8>>,
    pub windows: spin::RwLock<Vec<Arc<WindowShared>>>,
}

/// A non-blocking barrier in flight; complete it with `test` or `wait`.
pub struct BarrierRequest {
    gen: u64,
    state: Arc<GroupState>,
}

impl BarrierRequest {
    pub fn test(&self) -> bool {
        self.state.barrier.is_complete(self.gen)
    }

    pub fn wait(self) {
        self.state.barrier.wait_generation(self.gen);
    }
}

/// One rank's handle onto the process group: identity, the intra/inter-node
/// topology and the collective operations the runtime bootstraps with.
#[derive(Clone)]
pub struct Comm {
    rank: Rank,
    state: Arc<GroupState>,
}

impl Comm {
    /// Create an `n`-rank group and hand out one handle per rank.
    ///
    /// With `shared_memory` every rank is intra-node with every other (one
    /// node hosting the whole group); without it every rank is a node of its
    /// own and all peers are reached through windows, exactly like the
    /// distributed configuration.
    pub fn spawn(n: usize, shared_memory: bool) -> Vec<Comm> {
        assert!(n > 0);
        let state = Arc::new(GroupState {
            n_ranks: n,
            shared_memory,
            barrier: CollBarrier::new(),
            coll_buf: Mutex::new(Vec::new()),
            windows: spin::RwLock::new(Vec::new()),
        });
        (0..n)
            .map(|rank| Comm {
                rank,
                state: state.clone(),
            })
            .collect()
    }

    pub fn my_rank(&self) -> Rank {
        self.rank
    }

    pub fn n_ranks(&self) -> usize {
        self.state.n_ranks
    }

    // Topology. A node is the set of ranks with direct shared-memory access
    // to each other; inter ranks index nodes and are what the home policies
    // distribute over.

    pub fn intra_rank(&self, r: Rank) -> Rank {
        debug_assert!(r < self.n_ranks());
        if self.state.shared_memory {
            r
        } else {
            0
        }
    }

    pub fn inter_rank(&self, r: Rank) -> Rank {
        debug_assert!(r < self.n_ranks());
        if self.state.shared_memory {
            0
        } else {
            r
        }
    }

    pub fn intra_my_rank(&self) -> Rank {
        self.intra_rank(self.rank)
    }

    pub fn inter_my_rank(&self) -> Rank {
        self.inter_rank(self.rank)
    }

    pub fn intra_n_ranks(&self) -> usize {
        if self.state.shared_memory {
            self.n_ranks()
        } else {
            1
        }
    }

    pub fn inter_n_ranks(&self) -> usize {
        if self.state.shared_memory {
            1
        } else {
            self.n_ranks()
        }
    }

    /// The global rank that owns node `inter`'s home memory (its intra
    /// rank 0).
    pub fn inter2global_rank(&self, inter: Rank) -> Rank {
        debug_assert!(inter < self.inter_n_ranks());
        if self.state.shared_memory {
            0
        } else {
            inter
        }
    }

    pub fn is_locally_accessible(&self, r: Rank) -> bool {
        self.inter_rank(r) == self.inter_my_rank()
    }

    /// Whether `r`'s mappings live in this rank's address space. True for
    /// every peer of an in-process group — even in distributed mode, where
    /// ranks behave as separate nodes but still share the process. Virtual
    /// address reservation adopts a peer's mapping instead of re-mapping
    /// exactly when this holds.
    pub fn same_address_space(&self, r: Rank) -> bool {
        debug_assert!(r < self.n_ranks());
        true
    }

    // Collectives.

    pub fn barrier(&self) {
        let gen = self.state.barrier.arrive(self.n_ranks());
        self.state.barrier.wait_generation(gen);
    }

    pub fn ibarrier(&self) -> BarrierRequest {
        let gen = self.state.barrier.arrive(self.n_ranks());
        BarrierRequest {
            gen,
            state: self.state.clone(),
        }
    }

    /// All ranks receive `root`'s value. Every rank must call this with the
    /// same `root`; collectives are matched by program order.
    pub fn broadcast<T: Copy>(&self, value: T, root: Rank) -> T {
        let n = size_of::<T>();
        if self.rank == root {
            let mut buf = self.state.coll_buf.lock().unwrap();
            buf.resize(n, 0);
            unsafe {
                std::ptr::copy_nonoverlapping(&value as *const T as *const u8, buf.as_mut_ptr(), n);
            }
        }
        self.barrier();
        let out = {
            let buf = self.state.coll_buf.lock().unwrap();
            debug_assert_eq!(buf.len(), n);
            let mut out = MaybeUninit::<T>::uninit();
            unsafe {
                std::ptr::copy_nonoverlapping(buf.as_ptr(), out.as_mut_ptr() as *mut u8, n);
                out.assume_init()
            }
        };
        // keep the buffer untouched until everyone has read it
        self.barrier();
        out
    }

    /// Gathers one value per rank, indexed by rank.
    pub fn all_gather<T: Copy>(&self, value: T) -> Vec<T> {
        let n = size_of::<T>();
        {
            let mut buf = self.state.coll_buf.lock().unwrap();
            buf.resize(n * self.n_ranks(), 0);
            unsafe {
                std::ptr::copy_nonoverlapping(
                    &value as *const T as *const u8,
                    buf.as_mut_ptr().add(n * self.rank),
                    n,
                );
            }
        }
        self.barrier();
        let out = {
            let buf = self.state.coll_buf.lock().unwrap();
            (0..self.n_ranks())
                .map(|r| {
                    let mut v = MaybeUninit::<T>::uninit();
                    unsafe {
                        std::ptr::copy_nonoverlapping(
                            buf.as_ptr().add(n * r),
                            v.as_mut_ptr() as *mut u8,
                            n,
                        );
                        v.assume_init()
                    }
                })
                .collect::<Vec<_>>()
        };
        self.barrier();
        out
    }

    pub fn all_reduce_max(&self, value: i64) -> i64 {
        self.all_gather(value).into_iter().max().unwrap()
    }

    pub fn all_reduce_sum(&self, value: i64) -> i64 {
        self.all_gather(value).into_iter().sum()
    }

    pub(crate) fn state(&self) -> &Arc<GroupState> {
        &self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::group_test;

    fn run_group<F>(n: usize, shared: bool, f: F)
    where
        F: Fn(Comm) + Send + Sync + 'static,
    {
        group_test(30_000, move || {
            let comms = Comm::spawn(n, shared);
            let f = Arc::new(f);
            let handles: Vec<_> = comms
                .into_iter()
                .map(|c| {
                    let f = f.clone();
                    std::thread::spawn(move || f(c))
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        })
    }

    #[test]
    fn broadcast_and_gather() {
        run_group(4, false, |c| {
            let v = c.broadcast(c.my_rank() * 10 + 7, 2);
            assert_eq!(v, 27);
            let all = c.all_gather(c.my_rank() as u64);
            assert_eq!(all, vec![0, 1, 2, 3]);
            assert_eq!(c.all_reduce_max(c.my_rank() as i64 - 2), 1);
        });
    }

    #[test]
    fn repeated_barriers_stay_in_step() {
        run_group(3, false, |c| {
            for i in 0..100 {
                let sum = c.all_reduce_sum(i + c.my_rank() as i64);
                assert_eq!(sum, 3 * i + 3);
            }
        });
    }

    #[test]
    fn ibarrier_completes() {
        run_group(2, false, |c| {
            let req = c.ibarrier();
            req.wait();
            c.barrier();
        });
    }

    #[test]
    fn shared_memory_topology() {
        let comms = Comm::spawn(4, true);
        let c = &comms[3];
        assert_eq!(c.inter_n_ranks(), 1);
        assert_eq!(c.intra_my_rank(), 3);
        assert!(c.is_locally_accessible(0));
        assert_eq!(c.inter2global_rank(0), 0);
    }

    #[test]
    fn distributed_topology() {
        let comms = Comm::spawn(4, false);
        let c = &comms[3];
        assert_eq!(c.inter_n_ranks(), 4);
        assert_eq!(c.inter_my_rank(), 3);
        assert!(!c.is_locally_accessible(0));
        assert!(c.is_locally_accessible(3));
    }
}
