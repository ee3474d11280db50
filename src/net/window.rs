//! RMA windows: per-rank buffers exposed for one-sided access. Windows are
//! created collectively and are passive-target for their whole lifetime, so
//! no operation here ever requires the target rank's participation.

use std::os::unix::io::RawFd;
use std::sync::atomic::{fence, AtomicU64, Ordering};
use std::sync::Arc;

use crate::net::comm::{Comm, Rank};
use crate::util::constants::BYTES_IN_ADDRESS;
use crate::util::{memory, Address};

#[derive(Copy, Clone)]
pub(crate) struct WindowEntry {
    base: Address,
    size: usize,
    fd: RawFd,
}

impl Default for WindowEntry {
    fn default() -> Self {
        Self {
            base: Address::ZERO,
            size: 0,
            fd: -1,
        }
    }
}

pub(crate) struct WindowShared {
    entries: spin::RwLock<Vec<WindowEntry>>,
}

/// One rank's handle on a collectively created window. Ranks may contribute
/// different local sizes, including zero.
pub struct Window {
    id: usize,
    comm: Comm,
    local: WindowEntry,
}

impl Window {
    /// Collective: every rank of the group must call this in the same order.
    /// The local buffer is shareable memory so intra-node peers can map it
    /// directly; its pages read as zero until first written.
    pub fn create(comm: &Comm, local_size: usize) -> Window {
        let id = if comm.my_rank() == 0 {
            let mut windows = comm.state().windows.write();
            windows.push(Arc::new(WindowShared {
                entries: spin::RwLock::new(vec![WindowEntry::default(); comm.n_ranks()]),
            }));
            windows.len() - 1
        } else {
            0
        };
        let id = comm.broadcast(id, 0);

        let local = if local_size > 0 {
            let fd = memory::memfd_create("pgas-window", local_size)
                .unwrap_or_else(|e| panic!("window: memfd_create({}) failed: {}", local_size, e));
            let base = memory::mmap_reserve(local_size)
                .and_then(|a| memory::mmap_shared_fixed(a, local_size, fd, 0))
                .unwrap_or_else(|e| panic!("window: mapping {} bytes failed: {}", local_size, e));
            WindowEntry {
                base,
                size: local_size,
                fd,
            }
        } else {
            WindowEntry::default()
        };

        {
            let windows = comm.state().windows.read();
            windows[id].entries.write()[comm.my_rank()] = local;
        }
        comm.barrier();
        trace!(
            "window {} created: rank {} contributes {} bytes",
            id,
            comm.my_rank(),
            local_size
        );
        Window {
            id,
            comm: comm.clone(),
            local,
        }
    }

    fn entry(&self, rank: Rank) -> WindowEntry {
        let windows = self.comm.state().windows.read();
        let e = windows[self.id].entries.read()[rank];
        debug_assert!(e.size > 0, "RMA against an empty window buffer");
        e
    }

    /// Non-blocking one-sided write of `src` into `target`'s buffer at
    /// `disp`. Completion is guaranteed only after `flush`/`flush_all`.
    pub fn put(&self, target: Rank, disp: usize, src: &[u8]) {
        let e = self.entry(target);
        debug_assert!(disp + src.len() <= e.size);
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), (e.base + disp).to_mut_ptr::<u8>(), src.len());
        }
    }

    /// Non-blocking one-sided read from `target`'s buffer at `disp`.
    pub fn get(&self, target: Rank, disp: usize, dst: &mut [u8]) {
        let e = self.entry(target);
        debug_assert!(disp + dst.len() <= e.size);
        unsafe {
            std::ptr::copy_nonoverlapping((e.base + disp).to_ptr::<u8>(), dst.as_mut_ptr(), dst.len());
        }
    }

    fn atomic_at(&self, target: Rank, disp: usize) -> &AtomicU64 {
        let e = self.entry(target);
        debug_assert!(disp + BYTES_IN_ADDRESS <= e.size);
        debug_assert!((e.base + disp).is_aligned_to(BYTES_IN_ADDRESS));
        unsafe { &*(e.base + disp).to_ptr::<AtomicU64>() }
    }

    pub fn atomic_fetch_add(&self, target: Rank, disp: usize, val: u64) -> u64 {
        self.atomic_at(target, disp).fetch_add(val, Ordering::SeqCst)
    }

    /// Returns the previous value whether or not the exchange happened.
    pub fn atomic_cas(&self, target: Rank, disp: usize, compare: u64, new: u64) -> u64 {
        match self
            .atomic_at(target, disp)
            .compare_exchange(compare, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(old) => old,
            Err(old) => old,
        }
    }

    pub fn atomic_get(&self, target: Rank, disp: usize) -> u64 {
        let e = self.entry(target);
        debug_assert!(disp + BYTES_IN_ADDRESS <= e.size);
        unsafe { (e.base + disp).atomic_load::<AtomicU64>(Ordering::SeqCst) }
    }

    pub fn atomic_put(&self, target: Rank, disp: usize, val: u64) -> u64 {
        self.atomic_at(target, disp).swap(val, Ordering::SeqCst)
    }

    /// Complete all in-flight transfers to `target`.
    pub fn flush(&self, _target: Rank) {
        fence(Ordering::SeqCst);
    }

    /// Complete all in-flight transfers to every target.
    pub fn flush_all(&self) {
        fence(Ordering::SeqCst);
    }

    pub fn local_base(&self) -> Address {
        self.local.base
    }

    pub fn local_size(&self) -> usize {
        self.local.size
    }

    /// The shareable backing of `rank`'s buffer, for direct mapping by
    /// intra-node peers.
    pub(crate) fn peer_fd(&self, rank: Rank) -> RawFd {
        self.entry(rank).fd
    }
}

impl Drop for Window {
    // Teardown is the caller's collective responsibility; locally we retract
    // the registry entry and release the buffer.
    fn drop(&mut self) {
        if self.local.size > 0 {
            let windows = self.comm.state().windows.read();
            windows[self.id].entries.write()[self.comm.my_rank()] = WindowEntry::default();
            drop(windows);
            let _ = memory::munmap(self.local.base, self.local.size);
            memory::close(self.local.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_util::group_test;

    fn run_group<F>(n: usize, f: F)
    where
        F: Fn(Comm) + Send + Sync + 'static,
    {
        group_test(30_000, move || {
            let comms = Comm::spawn(n, false);
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
    fn put_get_between_ranks() {
        run_group(4, |c| {
            let me = c.my_rank();
            let n = c.n_ranks();
            let win = Window::create(&c, 1024);

            // each rank stamps its id into its right neighbor's buffer
            let next = (me + 1) % n;
            let msg = [me as u8; 16];
            win.put(next, 16 * me, &msg);
            win.flush(next);
            c.barrier();

            let prev = (me + n - 1) % n;
            let mut got = [0u8; 16];
            win.get(me, 16 * prev, &mut got);
            win.flush_all();
            assert_eq!(got, [prev as u8; 16]);
            c.barrier();
        });
    }

    #[test]
    fn atomics_on_home_counter() {
        run_group(4, |c| {
            let win = Window::create(&c, 64);
            for _ in 0..100 {
                win.atomic_fetch_add(0, 0, 1);
            }
            c.barrier();
            if c.my_rank() == 0 {
                assert_eq!(win.atomic_get(0, 0), 400);
            }
            c.barrier();

            // cas: only one rank wins the transition 400 -> 1000
            let old = win.atomic_cas(0, 0, 400, 1000);
            let won = old == 400;
            let winners = c.all_reduce_sum(won as i64);
            assert_eq!(winners, 1);
            assert_eq!(win.atomic_get(0, 0), 1000);
            c.barrier();
        });
    }

    #[test]
    fn unequal_local_sizes() {
        run_group(2, |c| {
            let me = c.my_rank();
            let win = Window::create(&c, if me == 0 { 4096 } else { 0 });
            if me == 1 {
                win.put(0, 0, &[7u8; 8]);
                win.flush(0);
            }
            c.barrier();
            if me == 0 {
                let mut got = [0u8; 8];
                win.get(0, 0, &mut got);
                assert_eq!(got, [7u8; 8]);
            }
            c.barrier();
        });
    }
}
