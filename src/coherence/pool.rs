//! The physical cache pool: a fixed-capacity slab of block-sized slots that
//! back replicas of remote blocks. Slots are installed into a region view
//! with a fixed shared mapping and returned to the reserved state on
//! eviction.

use std::os::unix::io::RawFd;

use crate::util::{memory, Address};

pub type SlotId = usize;

pub struct CachePool {
    fd: RawFd,
    block_size: usize,
    n_slots: usize,
    free: Vec<SlotId>,
}

impl CachePool {
    pub fn new(cache_size: usize, block_size: usize) -> CachePool {
        debug_assert!(cache_size % block_size == 0);
        let n_slots = cache_size / block_size;
        assert!(n_slots > 0);
        let fd = memory::memfd_create("pgas-cache", cache_size)
            .unwrap_or_else(|e| panic!("cache pool: memfd_create({}) failed: {}", cache_size, e));
        debug!("cache pool: {} slots of {} bytes", n_slots, block_size);
        CachePool {
            fd,
            block_size,
            n_slots,
            free: (0..n_slots).rev().collect(),
        }
    }

    pub fn n_slots(&self) -> usize {
        self.n_slots
    }

    pub fn n_free(&self) -> usize {
        self.free.len()
    }

    pub fn alloc(&mut self) -> Option<SlotId> {
        self.free.pop()
    }

    pub fn release(&mut self, slot: SlotId) {
        debug_assert!(slot < self.n_slots);
        debug_assert!(!self.free.contains(&slot));
        self.free.push(slot);
    }

    /// Install `slot` at `addr`, making the block CPU-accessible there.
    pub fn map_at(&self, slot: SlotId, addr: Address) {
        debug_assert!(slot < self.n_slots);
        memory::mmap_shared_fixed(addr, self.block_size, self.fd, slot * self.block_size)
            .unwrap_or_else(|e| panic!("cache pool: mapping slot {} at {} failed: {}", slot, addr, e));
    }

    /// Remove the slot mapping at `addr`, restoring the reservation.
    pub fn unmap(&self, addr: Address) {
        memory::mmap_discard(addr, self.block_size)
            .unwrap_or_else(|e| panic!("cache pool: discarding mapping at {} failed: {}", addr, e));
    }
}

impl Drop for CachePool {
    fn drop(&mut self) {
        memory::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::constants::BYTES_IN_PAGE;

    #[test]
    fn slots_recycle() {
        let mut pool = CachePool::new(4 * BYTES_IN_PAGE, BYTES_IN_PAGE);
        let mut got = Vec::new();
        while let Some(s) = pool.alloc() {
            got.push(s);
        }
        assert_eq!(got.len(), 4);
        pool.release(got[1]);
        assert_eq!(pool.alloc(), Some(got[1]));
    }

    #[test]
    fn slot_contents_survive_remap() {
        let mut pool = CachePool::new(2 * BYTES_IN_PAGE, BYTES_IN_PAGE);
        let slot = pool.alloc().unwrap();
        let a = memory::mmap_reserve(BYTES_IN_PAGE).unwrap();
        pool.map_at(slot, a);
        unsafe { a.store(42u64) };
        pool.unmap(a);
        // same slot mapped elsewhere exposes the same bytes
        let b = memory::mmap_reserve(BYTES_IN_PAGE).unwrap();
        pool.map_at(slot, b);
        assert_eq!(unsafe { b.load::<u64>() }, 42);
        pool.unmap(b);
        memory::munmap(a, BYTES_IN_PAGE).unwrap();
        memory::munmap(b, BYTES_IN_PAGE).unwrap();
    }
}
