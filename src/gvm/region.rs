//! Global memory regions: a collectively reserved virtual range, its home
//! windows, the per-block version counters and this rank's view of it all.

use crate::gvm::mem_mapper::{HomePolicy, PolicyKind, Segment};
use crate::gvm::virtual_mem::{reserve_same_vm, VirtualMem};
use crate::net::{Comm, Rank, Window};
use crate::util::constants::BYTES_IN_ADDRESS;
use crate::util::conversions::raw_align_up;
use crate::util::{memory, numa, Address};

pub struct RegionConfig {
    pub block_size: usize,
    pub numa_enabled: bool,
    pub max_reservation_trials: usize,
}

/// One rank's handle on a collectively allocated region.
///
/// `coll_base` is identical on every rank and is the address stored in
/// global pointers. `view_base` is where this rank installs its mappings
/// (direct home maps and replica slots); it equals `coll_base` whenever the
/// rank can claim the collective range for itself, which is the case in
/// shared-memory mode. Translating between the two is a subtract and an add
/// on the checkout path only.
pub struct Region {
    pub id: usize,
    coll_base: Address,
    view_base: Address,
    size: usize,
    policy: HomePolicy,
    home_win: Window,
    version_win: Window,
    _vm: VirtualMem,
    _view_vm: Option<VirtualMem>,
    comm: Comm,
}

impl Region {
    /// Collective: all ranks create the region together, in the same order
    /// relative to every other collective.
    pub fn create(
        comm: &Comm,
        id: usize,
        size: usize,
        kind: PolicyKind,
        seg_size: Option<usize>,
        cfg: &RegionConfig,
    ) -> Region {
        assert!(size > 0, "zero-sized region");
        let policy = HomePolicy::new(
            kind,
            size,
            comm.inter_n_ranks(),
            comm.intra_n_ranks(),
            cfg.block_size,
            seg_size,
        );
        let eff = policy.effective_size();

        let vm = reserve_same_vm(comm, eff, cfg.max_reservation_trials);
        let coll_base = vm.addr();

        // In-process ranks share one address space, so when peers are not
        // "locally accessible" (distributed mode) each rank needs a private
        // range to install replica slots at. With a real per-process address
        // space the collective range itself is the view.
        let all_local = (0..comm.n_ranks()).all(|r| comm.is_locally_accessible(r));
        let exclusive = all_local || comm.n_ranks() == 1;
        let (view_base, view_vm) = if exclusive {
            (coll_base, None)
        } else {
            let view = VirtualMem::reserve(eff)
                .unwrap_or_else(|e| panic!("region {}: view reservation failed: {}", id, e));
            (view.addr(), Some(view))
        };

        let node_leader = comm.intra_my_rank() == 0;
        let my_home_bytes = if node_leader {
            policy.local_size(comm.inter_my_rank())
        } else {
            0
        };
        let home_win = Window::create(comm, my_home_bytes);
        let my_version_bytes = (my_home_bytes / cfg.block_size) * BYTES_IN_ADDRESS;
        let version_win = Window::create(comm, my_version_bytes);

        if cfg.numa_enabled && numa::available() && my_home_bytes > 0 {
            let n_nodes = numa::n_nodes();
            let mut pm = 0;
            while pm < my_home_bytes {
                let ns = policy.numa_segment_of(comm.inter_my_rank(), pm);
                let node = if ns.owner < 0 {
                    ns.owner
                } else {
                    ns.owner % n_nodes as i32
                };
                numa::bind(
                    home_win.local_base() + ns.pm_offset_b,
                    ns.pm_offset_e - ns.pm_offset_b,
                    node,
                );
                pm = ns.pm_offset_e;
            }
        }

        let region = Region {
            id,
            coll_base,
            view_base,
            size,
            policy,
            home_win,
            version_win,
            _vm: vm,
            _view_vm: view_vm,
            comm: comm.clone(),
        };

        if region.policy.should_map_all_home() {
            let mut off = 0;
            while off < eff {
                let seg = region.policy.segment_of(off);
                if comm.is_locally_accessible(region.home_owner(&seg)) {
                    region.map_home_segment(&seg);
                }
                off = seg.offset_e;
            }
        }

        comm.barrier();
        info!(
            "region {}: {} bytes ({:?}) at {}, home {} bytes on rank {}",
            id,
            size,
            region.policy.kind(),
            coll_base,
            region.home_win.local_size(),
            comm.my_rank()
        );
        region
    }

    pub fn coll_base(&self) -> Address {
        self.coll_base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn policy(&self) -> &HomePolicy {
        &self.policy
    }

    pub fn block_size(&self) -> usize {
        self.policy.block_size()
    }

    pub fn contains(&self, addr: Address) -> bool {
        self.coll_base <= addr && addr < self.coll_base + self.size
    }

    pub fn offset_of(&self, addr: Address) -> usize {
        debug_assert!(self.coll_base <= addr);
        addr - self.coll_base
    }

    pub fn view_addr(&self, addr: Address) -> Address {
        self.view_base + (addr - self.coll_base)
    }

    pub fn view_of_offset(&self, offset: usize) -> Address {
        self.view_base + offset
    }

    /// The global rank holding a segment's home bytes.
    pub fn home_owner(&self, seg: &Segment) -> Rank {
        self.comm.inter2global_rank(seg.owner)
    }

    pub fn home_is_local(&self, seg: &Segment) -> bool {
        self.comm.is_locally_accessible(self.home_owner(seg))
    }

    /// Map a locally accessible home segment directly into the view:
    /// zero-copy access to the authoritative bytes. Idempotent.
    pub fn map_home_segment(&self, seg: &Segment) {
        let owner = self.home_owner(seg);
        debug_assert!(self.comm.is_locally_accessible(owner));
        let fd = self.home_win.peer_fd(owner);
        memory::mmap_shared_fixed(self.view_base + seg.offset_b, seg.len(), fd, seg.pm_offset)
            .unwrap_or_else(|e| {
                panic!(
                    "region {}: mapping home segment [{:#x}, {:#x}) failed: {}",
                    self.id, seg.offset_b, seg.offset_e, e
                )
            });
    }

    pub fn home_win(&self) -> &Window {
        &self.home_win
    }

    /// Window displacement of the version counter for the block starting at
    /// `block_off` (which must be homed in `seg`).
    pub fn version_disp(&self, seg: &Segment, block_off: usize) -> usize {
        (seg.pm_offset_of(block_off) / self.block_size()) * BYTES_IN_ADDRESS
    }

    pub fn version_win(&self) -> &Window {
        &self.version_win
    }

    /// Collective teardown. Must be called by all ranks in matching order.
    pub fn destroy(self) {
        self.comm.barrier();
        // mappings and windows unwind in the field drops
    }
}

/// First-fit free-list allocator over this rank's slice of the
/// noncollective-allocation region. Allocations are 8-byte aligned.
pub struct LocalHeap {
    free: Vec<(usize, usize)>,
    base_off: usize,
    end_off: usize,
}

impl LocalHeap {
    pub fn new(base_off: usize, end_off: usize) -> LocalHeap {
        assert!(base_off < end_off);
        LocalHeap {
            free: vec![(base_off, end_off - base_off)],
            base_off,
            end_off,
        }
    }

    pub fn contains(&self, off: usize) -> bool {
        self.base_off <= off && off < self.end_off
    }

    pub fn alloc(&mut self, bytes: usize) -> Option<usize> {
        let bytes = raw_align_up(bytes.max(1), BYTES_IN_ADDRESS);
        for i in 0..self.free.len() {
            let (off, len) = self.free[i];
            if len >= bytes {
                if len == bytes {
                    self.free.remove(i);
                } else {
                    self.free[i] = (off + bytes, len - bytes);
                }
                return Some(off);
            }
        }
        None
    }

    pub fn free(&mut self, off: usize, bytes: usize) {
        let bytes = raw_align_up(bytes.max(1), BYTES_IN_ADDRESS);
        debug_assert!(self.contains(off) && off + bytes <= self.end_off);
        let i = self.free.partition_point(|&(o, _)| o < off);
        debug_assert!(i == self.free.len() || off + bytes <= self.free[i].0, "double free");
        self.free.insert(i, (off, bytes));
        // coalesce with the right neighbor, then the left
        if i + 1 < self.free.len() && self.free[i].0 + self.free[i].1 == self.free[i + 1].0 {
            self.free[i].1 += self.free[i + 1].1;
            self.free.remove(i + 1);
        }
        if i > 0 && self.free[i - 1].0 + self.free[i - 1].1 == self.free[i].0 {
            self.free[i - 1].1 += self.free[i].1;
            self.free.remove(i);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_first_fit_and_coalesce() {
        let mut h = LocalHeap::new(0x1000, 0x2000);
        let a = h.alloc(0x100).unwrap();
        let b = h.alloc(0x100).unwrap();
        let c = h.alloc(0x100).unwrap();
        assert_eq!(a, 0x1000);
        assert_eq!(b, 0x1100);
        assert_eq!(c, 0x1200);

        h.free(b, 0x100);
        // first fit reuses the hole
        assert_eq!(h.alloc(0x80).unwrap(), b);
        h.free(a, 0x100);
        h.free(b, 0x80);
        h.free(c, 0x100);
        // everything coalesced back: a full-size allocation fits again
        let all = h.alloc(0x1000 - 0x280);
        assert!(all.is_some());
    }

    #[test]
    fn heap_exhaustion() {
        let mut h = LocalHeap::new(0, 0x100);
        assert!(h.alloc(0x100).is_some());
        assert!(h.alloc(1).is_none());
    }

    #[test]
    fn heap_alignment() {
        let mut h = LocalHeap::new(0, 0x100);
        let a = h.alloc(3).unwrap();
        let b = h.alloc(3).unwrap();
        assert_eq!(a % 8, 0);
        assert_eq!(b % 8, 0);
        assert_ne!(a, b);
    }
}
