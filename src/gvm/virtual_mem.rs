//! Virtual address reservation, including the collective protocol that gets
//! the same range reserved on every rank. Identical bases are what make a
//! global pointer a plain machine pointer.

use std::io;

use crate::net::Comm;
use crate::util::constants::MAX_RESERVATION_SIZE;
use crate::util::conversions::raw_align_up;
use crate::util::{memory, Address};

/// An owned (or adopted) reservation of virtual address space with no
/// physical backing.
#[derive(Debug)]
pub struct VirtualMem {
    addr: Address,
    size: usize,
    mapped_size: usize,
    owned: bool,
}

impl VirtualMem {
    pub fn empty() -> VirtualMem {
        VirtualMem {
            addr: Address::ZERO,
            size: 0,
            mapped_size: 0,
            owned: false,
        }
    }

    /// Reserve `size` bytes anywhere.
    pub fn reserve(size: usize) -> io::Result<VirtualMem> {
        let mapped = raw_align_up(size, memory::page_size());
        let addr = memory::mmap_reserve(mapped)?;
        Ok(VirtualMem {
            addr,
            size,
            mapped_size: mapped,
            owned: true,
        })
    }

    /// Reserve `size` bytes at exactly `addr`; a conflict error means some of
    /// the range is already in use.
    pub fn reserve_at(addr: Address, size: usize) -> io::Result<VirtualMem> {
        let mapped = raw_align_up(size, memory::page_size());
        let addr = memory::mmap_reserve_at(addr, mapped)?;
        Ok(VirtualMem {
            addr,
            size,
            mapped_size: mapped,
            owned: true,
        })
    }

    /// View a range reserved by another rank sharing this address space. The
    /// reserving rank keeps ownership of the mapping.
    pub fn adopt(addr: Address, size: usize) -> VirtualMem {
        VirtualMem {
            addr,
            size,
            mapped_size: raw_align_up(size, memory::page_size()),
            owned: false,
        }
    }

    pub fn addr(&self) -> Address {
        self.addr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.addr.is_zero()
    }

    /// Give back the tail of the reservation beyond `to_size`.
    pub fn shrink(&mut self, to_size: usize) {
        assert!(!self.is_empty());
        assert!(to_size <= self.size);
        let page = memory::page_size();
        let keep = raw_align_up(to_size, page);
        if self.owned && self.mapped_size > keep {
            memory::munmap(self.addr + keep, self.mapped_size - keep)
                .unwrap_or_else(|e| panic!("munmap during shrink failed: {}", e));
        }
        self.mapped_size = keep;
        self.size = to_size;
    }

    fn overlaps(&self, addr: Address, size: usize) -> bool {
        !self.is_empty() && self.addr < addr + size && addr < self.addr + self.mapped_size
    }
}

impl Drop for VirtualMem {
    fn drop(&mut self) {
        if self.owned && !self.addr.is_zero() && self.mapped_size > 0 {
            let _ = memory::munmap(self.addr, self.mapped_size);
        }
    }
}

/// Collectively reserve at least `size` bytes at the same virtual address on
/// every rank of the group.
///
/// A rotating leader proposes an address; ranks that cannot map it report
/// their rank, and the highest failed rank leads the next round. Successful
/// ranks defer unmapping their tentative ranges so a doomed address cannot be
/// proposed again immediately. Each failed round doubles the attempted size
/// (capped) to skirt local conflicts; the final reservation is shrunk back to
/// `size`.
pub fn reserve_same_vm(comm: &Comm, size: usize, max_trials: usize) -> VirtualMem {
    assert!(size > 0);

    let page = memory::page_size();
    let mut alloc_size = raw_align_up(size, page);
    let alloc_size_max = alloc_size.max(MAX_RESERVATION_SIZE);
    let mut leader: usize = 0;
    let mut prev_vms: Vec<VirtualMem> = Vec::new();

    for n_trial in 0..=max_trials {
        let mut vm = VirtualMem::empty();
        let mut addr = Address::ZERO;
        if comm.my_rank() == leader {
            vm = VirtualMem::reserve(alloc_size)
                .unwrap_or_else(|e| panic!("reserve_same_vm: mmap({}) failed: {}", alloc_size, e));
            addr = vm.addr();
        }

        let addr = comm.broadcast(addr, leader);

        let mut failed: i64 = -1;
        if comm.my_rank() != leader {
            if comm.same_address_space(leader) {
                // shared address space: the leader's reservation already
                // covers this rank
                vm = VirtualMem::adopt(addr, alloc_size);
            } else {
                // unmap previously deferred ranges that overlap the proposal
                prev_vms.retain(|p| !p.overlaps(addr, alloc_size));
                match VirtualMem::reserve_at(addr, alloc_size) {
                    Ok(v) => vm = v,
                    Err(e) if memory::is_conflict(&e) => failed = comm.my_rank() as i64,
                    Err(e) => panic!("reserve_same_vm: mmap({}, {}) failed: {}", addr, alloc_size, e),
                }
            }
        }

        // the highest failed rank becomes the next leader
        let failed_max = comm.all_reduce_max(failed);

        if failed_max == -1 {
            debug!(
                "reserve_same_vm: {} bytes at {} after {} trial(s)",
                size,
                vm.addr(),
                n_trial + 1
            );
            vm.shrink(size);
            return vm;
        }

        if failed == -1 && !vm.is_empty() {
            // defer the deallocation so the same address is not handed out
            // again next round
            prev_vms.push(vm);
        }

        leader = failed_max as usize;
        alloc_size = alloc_size_max.min(2 * alloc_size);
    }

    panic!(
        "reservation of a common virtual address range failed (size={}, max_trials={})",
        size, max_trials
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;
    use crate::util::test_util::group_test;
    use std::sync::Arc;

    #[test]
    fn reserve_and_reuse_address() {
        let page = BYTES_IN_PAGE;
        let addr;
        {
            let vm = VirtualMem::reserve(32 * page).unwrap();
            assert!(!vm.addr().is_zero());
            addr = vm.addr();
        }
        {
            // the same address can be mapped again after the previous
            // reservation is freed
            let vm = VirtualMem::reserve_at(addr, 16 * page).unwrap();
            assert_eq!(vm.addr(), addr);
            // but not replaced while it is live
            let err = VirtualMem::reserve_at(addr, page).unwrap_err();
            assert!(memory::is_conflict(&err));
        }
        let vm = VirtualMem::reserve_at(addr, page).unwrap();
        assert_eq!(vm.addr(), addr);
    }

    #[test]
    fn shrink_releases_tail() {
        let page = BYTES_IN_PAGE;
        let mut vm = VirtualMem::reserve(8 * page).unwrap();
        let addr = vm.addr();
        vm.shrink(2 * page);
        assert_eq!(vm.size(), 2 * page);
        // the released tail can be reserved independently
        let tail = VirtualMem::reserve_at(addr + 2 * page, page).unwrap();
        assert_eq!(tail.addr(), addr + 2 * page);
    }

    #[test]
    fn same_range_on_every_rank() {
        group_test(30_000, || {
            let comms = Comm::spawn(4, true);
            let handles: Vec<_> = comms
                .into_iter()
                .map(|c| {
                    std::thread::spawn(move || {
                        let vm = reserve_same_vm(&c, 32 * BYTES_IN_PAGE, 100);
                        let mine = (vm.addr().as_usize(), vm.size());
                        let root = c.broadcast(mine, 0);
                        assert_eq!(mine, root);
                        assert_eq!(vm.size(), 32 * BYTES_IN_PAGE);
                        c.barrier();
                        vm
                    })
                })
                .collect();
            let vms: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            drop(vms);
        });
    }

    #[test]
    fn repeated_collective_reservations_are_distinct() {
        group_test(30_000, || {
            let comms = Comm::spawn(2, true);
            let comms: Vec<Arc<Comm>> = comms.into_iter().map(Arc::new).collect();
            let handles: Vec<_> = comms
                .into_iter()
                .map(|c| {
                    std::thread::spawn(move || {
                        let a = reserve_same_vm(&c, BYTES_IN_PAGE, 100);
                        let b = reserve_same_vm(&c, BYTES_IN_PAGE, 100);
                        assert_ne!(a.addr(), b.addr());
                        c.barrier();
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap();
            }
        });
    }
}
