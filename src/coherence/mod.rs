//! L2: the coherence engine. Checkout/checkin make global ranges
//! CPU-accessible; lazy release and acquire sequence writes across fork and
//! join points. One engine per rank, owned and driven only by that rank's
//! worker.

pub mod directory;
pub mod pool;

use std::collections::BTreeMap;
use std::mem::size_of;
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Mutex};

use enum_map::EnumMap;

use self::directory::{
    bitmap_len, complement_ranges, dirty_byte_ranges, mark_dirty_range, BlockState, Directory, NIL,
};
use self::pool::{CachePool, SlotId};
use crate::gvm::{LocalHeap, PolicyKind, Region, RegionConfig};
use crate::net::{Comm, Rank};
use crate::util::conversions::raw_align_up;
use crate::util::options::Options;
use crate::util::{Address, GlobalPtr};

/// Access intent of a checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, enum_map::Enum)]
pub enum Mode {
    Read,
    Write,
    ReadWrite,
    /// Disables automatic checkout in the algorithm templates; accesses go
    /// through explicit get/put instead.
    NoAccess,
}

impl Mode {
    pub fn is_write(self) -> bool {
        matches!(self, Mode::Write | Mode::ReadWrite)
    }

    pub fn needs_fetch(self) -> bool {
        matches!(self, Mode::Read | Mode::ReadWrite)
    }
}

/// A lazy-release token: "all writes issued on `rank` up to `epoch`". A task
/// resumed on another rank acquires against this before its first checkout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReleaseHandle {
    pub rank: Rank,
    pub epoch: u64,
}

/// A deferred noncollective free, queued to the owning rank.
pub struct FreeMsg {
    pub offset: usize,
    pub bytes: usize,
}

pub type FreeQueues = Arc<Vec<Mutex<Vec<FreeMsg>>>>;

pub struct Engine {
    comm: Comm,
    cfg: RegionConfig,
    pool: CachePool,
    dir: Directory,
    /// Entries with unreleased writes: Dirty replicas and written Home
    /// blocks (the latter only need their version bumped).
    dirty: Vec<usize>,
    epoch: u64,
    regions: Vec<Option<Region>>,
    by_base: BTreeMap<Address, usize>,
    heap: Option<LocalHeap>,
    heap_region: usize,
    heap_rank_size: usize,
    free_queues: FreeQueues,
    checkout_counts: EnumMap<Mode, u64>,
    pending_get: bool,
}

impl Engine {
    pub fn new(comm: Comm, options: &Options, free_queues: FreeQueues) -> Engine {
        let cfg = RegionConfig {
            block_size: options.block_size,
            numa_enabled: options.numa_enabled,
            max_reservation_trials: options.max_reservation_trials,
        };
        let pool = CachePool::new(options.effective_cache_size(), options.block_size);
        Engine {
            comm,
            cfg,
            pool,
            dir: Directory::new(),
            dirty: Vec::new(),
            epoch: 1,
            regions: Vec::new(),
            by_base: BTreeMap::new(),
            heap: None,
            heap_region: NIL,
            heap_rank_size: 0,
            free_queues,
            checkout_counts: EnumMap::default(),
            pending_get: false,
        }
    }

    pub fn my_rank(&self) -> Rank {
        self.comm.my_rank()
    }

    pub fn block_size(&self) -> usize {
        self.cfg.block_size
    }

    // ---- regions -------------------------------------------------------

    /// Collective: create a region; all ranks must call in matching order.
    pub fn create_region(
        &mut self,
        size: usize,
        kind: PolicyKind,
        seg_size: Option<usize>,
    ) -> usize {
        let id = self.regions.len();
        let region = Region::create(&self.comm, id, size, kind, seg_size, &self.cfg);
        self.by_base.insert(region.coll_base(), id);
        self.regions.push(Some(region));
        id
    }

    /// Collective: tear a region down, discarding any replicas of it.
    pub fn destroy_region(&mut self, id: usize) {
        for idx in self.dir.remove_region(id) {
            let e = self.dir.entry_mut(idx);
            if e.slot != NIL {
                let slot = e.slot;
                e.slot = NIL;
                self.pool.release(slot);
            }
            e.state = BlockState::Invalid;
        }
        self.dirty.retain(|&i| self.dir.entry(i).region != id);
        let region = self.regions[id].take().expect("destroying a dead region");
        self.by_base.remove(&region.coll_base());
        region.destroy();
    }

    pub fn region(&self, id: usize) -> &Region {
        self.regions[id].as_ref().expect("dead region")
    }

    pub fn region_base(&self, id: usize) -> Address {
        self.region(id).coll_base()
    }

    /// The region containing a global address, if any.
    pub fn resolve(&self, addr: Address) -> Option<usize> {
        let (_, &id) = self.by_base.range(..=addr).next_back()?;
        let region = self.regions[id].as_ref()?;
        region.contains(addr).then_some(id)
    }

    /// Collective: set up the per-rank arena serving noncollective
    /// allocations.
    pub fn init_local_heap(&mut self, heap_size: usize) {
        debug_assert!(self.heap.is_none());
        let per_rank = raw_align_up(heap_size, self.cfg.block_size);
        let total = per_rank * self.comm.n_ranks();
        let id = self.create_region(total, PolicyKind::Block, None);
        let me = self.comm.my_rank();
        self.heap = Some(LocalHeap::new(me * per_rank, (me + 1) * per_rank));
        self.heap_region = id;
        self.heap_rank_size = per_rank;
    }

    /// Noncollective allocation from this rank's slice of the heap region.
    pub fn malloc_local(&mut self, bytes: usize) -> Address {
        let heap = self.heap.as_mut().expect("local heap not initialized");
        let off = heap
            .alloc(bytes)
            .unwrap_or_else(|| panic!("local heap exhausted allocating {} bytes", bytes));
        self.region(self.heap_region).coll_base() + off
    }

    /// Free a noncollective allocation. Frees of memory homed on another
    /// rank are queued to the owner and drained at its next `poll`.
    pub fn free_local(&mut self, addr: Address, bytes: usize) {
        let heap_region = self.heap_region;
        let off = self.region(heap_region).offset_of(addr);
        let owner = off / self.heap_rank_size;
        if owner == self.comm.my_rank() {
            self.heap.as_mut().unwrap().free(off, bytes);
        } else {
            self.free_queues[owner].lock().unwrap().push(FreeMsg {
                offset: off,
                bytes,
            });
        }
    }

    /// Service deferred work: cross-rank frees queued to this rank.
    pub fn poll(&mut self) {
        let msgs: Vec<FreeMsg> = {
            let mut q = self.free_queues[self.comm.my_rank()].lock().unwrap();
            q.drain(..).collect()
        };
        if let Some(heap) = self.heap.as_mut() {
            for m in msgs {
                heap.free(m.offset, m.bytes);
            }
        }
    }

    // ---- checkout / checkin --------------------------------------------

    /// Prepare `[addr, addr + bytes)` for CPU access; pair with
    /// `checkout_complete` before touching the returned pointer.
    pub fn checkout_nb(&mut self, addr: Address, bytes: usize, mode: Mode) -> Address {
        assert!(mode != Mode::NoAccess);
        debug_assert!(!addr.is_zero() && bytes > 0);
        let rid = self
            .resolve(addr)
            .unwrap_or_else(|| panic!("checkout of unmapped global address {}", addr));

        let bs = self.cfg.block_size;
        let Engine {
            ref regions,
            ref mut dir,
            ref mut pool,
            ref mut dirty,
            ref mut pending_get,
            ..
        } = *self;
        let region = regions[rid].as_ref().unwrap();

        let off_b = region.offset_of(addr);
        let off_e = off_b + bytes;
        assert!(
            off_e <= region.size(),
            "checkout range [{:#x}, {:#x}) spans past the region end {:#x}",
            off_b,
            off_e,
            region.size()
        );

        let mut block_off = off_b & !(bs - 1);
        while block_off < off_e {
            ensure_block(regions, rid, dir, pool, dirty, block_off, mode, pending_get);
            block_off += bs;
        }

        self.checkout_counts[mode] += 1;
        region.view_addr(addr)
    }

    /// Complete the outstanding fetches of earlier `checkout_nb` calls.
    pub fn checkout_complete(&mut self) {
        if self.pending_get {
            // completes the window gets issued by the fetch path
            fence(Ordering::SeqCst);
            self.pending_get = false;
        }
    }

    pub fn checkout(&mut self, addr: Address, bytes: usize, mode: Mode) -> Address {
        let p = self.checkout_nb(addr, bytes, mode);
        self.checkout_complete();
        p
    }

    /// Drop one checkout of `[addr, addr + bytes)`. Write modes fold the
    /// covered byte range into the block dirty bitmaps; nothing is flushed
    /// eagerly.
    pub fn checkin(&mut self, addr: Address, bytes: usize, mode: Mode) {
        debug_assert!(!addr.is_zero() && bytes > 0);
        let rid = self.resolve(addr).expect("checkin of unmapped global address");
        let bs = self.cfg.block_size;
        let region = self.regions[rid].as_ref().unwrap();
        let off_b = region.offset_of(addr);
        let off_e = off_b + bytes;
        let view_base = region.view_of_offset(0);

        let mut block_off = off_b & !(bs - 1);
        while block_off < off_e {
            let idx = self
                .dir
                .lookup(view_base + block_off)
                .expect("checkin of a range that is not checked out");
            let e = self.dir.entry_mut(idx);
            debug_assert!(e.refcount > 0);
            e.refcount -= 1;

            if mode.is_write() {
                match e.state {
                    BlockState::Home => {
                        // direct write to the authoritative copy; only the
                        // version needs publishing at release
                    }
                    BlockState::Clean | BlockState::Dirty => {
                        let cov_b = off_b.max(block_off) - block_off;
                        let cov_e = off_e.min(block_off + bs) - block_off;
                        let bm = e
                            .dirty
                            .get_or_insert_with(|| vec![0u8; bitmap_len(bs)].into_boxed_slice());
                        mark_dirty_range(bm, cov_b, cov_e);
                        e.state = BlockState::Dirty;
                    }
                    BlockState::Invalid => unreachable!("checked-out block is invalid"),
                }
                if !e.queued {
                    e.queued = true;
                    self.dirty.push(idx);
                }
            }

            let e = self.dir.entry(idx);
            if e.refcount == 0 && e.state == BlockState::Clean && !self.dir.is_in_lru(idx) {
                self.dir.lru_push_back(idx);
            }
            block_off += bs;
        }
    }

    // ---- release / acquire ---------------------------------------------

    /// Token for "all writes issued so far on this rank".
    pub fn release_lazy(&mut self) -> ReleaseHandle {
        ReleaseHandle {
            rank: self.comm.my_rank(),
            epoch: self.epoch,
        }
    }

    /// Drain all unreleased writes: put the coalesced dirty byte ranges to
    /// their homes, complete the transfers and publish new block versions.
    /// This is the only point at which writes become visible to other ranks.
    pub fn release(&mut self) {
        let list = std::mem::take(&mut self.dirty);
        if list.is_empty() {
            fence(Ordering::SeqCst);
            self.epoch += 1;
            return;
        }
        let Engine {
            ref regions,
            ref mut dir,
            ..
        } = *self;
        let mut flushed = 0;
        for idx in list {
            flush_entry(regions, dir, idx);
            flushed += 1;
        }
        // complete all puts before anyone can observe the new versions via a
        // fresh fetch
        fence(Ordering::SeqCst);
        self.epoch += 1;
        trace!("release: {} block(s) flushed, epoch now {}", flushed, self.epoch);
    }

    /// Invalidate cached blocks that the producer of `handle` may have
    /// modified. A handle from this rank is a fence: our own writes are
    /// already visible locally.
    pub fn acquire_handle(&mut self, handle: ReleaseHandle) {
        if handle.rank == self.comm.my_rank() {
            fence(Ordering::SeqCst);
        } else {
            self.acquire();
        }
    }

    /// Invalidate every resident replica whose home version moved past the
    /// version observed when it was fetched or last released.
    pub fn acquire(&mut self) {
        fence(Ordering::SeqCst);
        let Engine {
            ref regions,
            ref mut dir,
            ref mut pool,
            ..
        } = *self;
        for idx in dir.indices() {
            let e = dir.entry(idx);
            if e.state != BlockState::Clean || e.refcount > 0 {
                continue;
            }
            let region = regions[e.region].as_ref().unwrap();
            let seg = region.policy().segment_of(e.offset);
            let owner = region.home_owner(&seg);
            let current = region
                .version_win()
                .atomic_get(owner, region.version_disp(&seg, e.offset));
            if current != e.last_seen_version {
                if dir.is_in_lru(idx) {
                    dir.lru_unlink(idx);
                }
                invalidate_entry(dir, pool, idx);
            }
        }
    }

    // ---- value access ---------------------------------------------------

    /// Read a single value (the `NoAccess` escape hatch).
    pub fn get_value<T: Copy>(&mut self, p: GlobalPtr<T>) -> T {
        let view = self.checkout(p.raw(), size_of::<T>(), Mode::Read);
        let v = unsafe { view.load::<T>() };
        self.checkin(p.raw(), size_of::<T>(), Mode::Read);
        v
    }

    /// Write a single value.
    pub fn put_value<T: Copy>(&mut self, p: GlobalPtr<T>, v: T) {
        let view = self.checkout(p.raw(), size_of::<T>(), Mode::Write);
        unsafe { view.store(v) };
        self.checkin(p.raw(), size_of::<T>(), Mode::Write);
    }

    pub fn checkout_count(&self, mode: Mode) -> u64 {
        self.checkout_counts[mode]
    }
}

fn ensure_block(
    regions: &[Option<Region>],
    rid: usize,
    dir: &mut Directory,
    pool: &mut CachePool,
    dirty: &mut Vec<usize>,
    block_off: usize,
    mode: Mode,
    pending_get: &mut bool,
) {
    let region = regions[rid].as_ref().unwrap();
    let baddr = region.view_of_offset(block_off);
    let idx = dir.lookup_or_insert(baddr, rid, block_off);

    match dir.entry(idx).state {
        BlockState::Home => {
            dir.entry_mut(idx).refcount += 1;
        }
        BlockState::Clean | BlockState::Dirty => {
            if dir.entry(idx).partial && mode.needs_fetch() {
                backfill_entry(region, dir, idx, block_off, pending_get);
            }
            if dir.is_in_lru(idx) {
                dir.lru_unlink(idx);
            }
            dir.entry_mut(idx).refcount += 1;
        }
        BlockState::Invalid => {
            let seg = region.policy().segment_of(block_off);
            if region.home_is_local(&seg) {
                // zero-copy: expose the authoritative bytes directly
                if !region.policy().should_map_all_home() {
                    region.map_home_segment(&seg);
                }
                let e = dir.entry_mut(idx);
                e.state = BlockState::Home;
                e.refcount = 1;
            } else {
                let slot = alloc_slot(regions, dir, pool, dirty);
                pool.map_at(slot, baddr);
                let owner = region.home_owner(&seg);
                // read the version before the data so a concurrent release
                // is caught by the next acquire
                let version = region
                    .version_win()
                    .atomic_get(owner, region.version_disp(&seg, block_off));
                if mode.needs_fetch() {
                    let bs = region.block_size();
                    let dst =
                        unsafe { std::slice::from_raw_parts_mut(baddr.to_mut_ptr::<u8>(), bs) };
                    region
                        .home_win()
                        .get(owner, seg.pm_offset_of(block_off), dst);
                    *pending_get = true;
                }
                let e = dir.entry_mut(idx);
                e.state = BlockState::Clean;
                e.slot = slot;
                e.refcount = 1;
                e.last_seen_version = version;
                // a write-only install leaves the unwritten bytes invalid
                e.partial = !mode.needs_fetch();
            }
        }
    }
}

/// Fetch the bytes of a write-only-installed replica that its own dirty
/// ranges do not cover, making the whole block valid for reading. Bytes the
/// rank has written (and not yet released) are preserved.
fn backfill_entry(
    region: &Region,
    dir: &mut Directory,
    idx: usize,
    block_off: usize,
    pending_get: &mut bool,
) {
    let seg = region.policy().segment_of(block_off);
    let owner = region.home_owner(&seg);
    // version first, data second
    let version = region
        .version_win()
        .atomic_get(owner, region.version_disp(&seg, block_off));

    let base = dir.entry(idx).view_addr;
    let missing = {
        let e = dir.entry(idx);
        complement_ranges(e.dirty.as_deref(), region.block_size())
    };
    for (b, end) in missing {
        let dst =
            unsafe { std::slice::from_raw_parts_mut((base + b).to_mut_ptr::<u8>(), end - b) };
        region
            .home_win()
            .get(owner, seg.pm_offset_of(block_off) + b, dst);
        *pending_get = true;
    }

    let e = dir.entry_mut(idx);
    e.partial = false;
    if e.state == BlockState::Clean {
        e.last_seen_version = version;
    }
}

/// Take a free slot, evicting the LRU clean replica or, failing that,
/// flushing an unpinned dirty replica first. Exhaustion with every block
/// pinned is a programming error and fatal.
fn alloc_slot(
    regions: &[Option<Region>],
    dir: &mut Directory,
    pool: &mut CachePool,
    dirty: &mut Vec<usize>,
) -> SlotId {
    loop {
        if let Some(slot) = pool.alloc() {
            return slot;
        }
        if let Some(victim) = dir.lru_pop_front() {
            trace!("evicting block at {}", dir.entry(victim).view_addr);
            invalidate_entry(dir, pool, victim);
            continue;
        }
        if let Some(pos) = dirty.iter().position(|&i| {
            let e = dir.entry(i);
            e.state == BlockState::Dirty && e.refcount == 0
        }) {
            let idx = dirty.remove(pos);
            flush_entry(regions, dir, idx);
            continue;
        }
        panic!(
            "cache pool exhausted: all {} block(s) are checked out",
            pool.n_slots()
        );
    }
}

/// Write a block's dirty byte ranges to its home and publish a new version.
fn flush_entry(regions: &[Option<Region>], dir: &mut Directory, idx: usize) {
    let (rid, offset, state) = {
        let e = dir.entry(idx);
        (e.region, e.offset, e.state)
    };
    let region = regions[rid].as_ref().unwrap();
    let seg = region.policy().segment_of(offset);
    let owner = region.home_owner(&seg);

    if state == BlockState::Dirty {
        let e = dir.entry(idx);
        let bm = e.dirty.as_ref().expect("dirty block without a bitmap");
        let base = e.view_addr;
        for (b, end) in dirty_byte_ranges(bm) {
            let src = unsafe { std::slice::from_raw_parts((base + b).to_ptr::<u8>(), end - b) };
            region
                .home_win()
                .put(owner, seg.pm_offset_of(offset) + b, src);
        }
        region.home_win().flush(owner);
    } else {
        debug_assert_eq!(state, BlockState::Home);
    }

    let old = region
        .version_win()
        .atomic_fetch_add(owner, region.version_disp(&seg, offset), 1);

    let e = dir.entry_mut(idx);
    e.queued = false;
    e.dirty = None;
    e.last_seen_version = old + 1;
    let was_dirty = e.state == BlockState::Dirty;
    if was_dirty {
        e.state = BlockState::Clean;
    }
    let unreferenced = e.refcount == 0;
    if was_dirty && unreferenced && !dir.is_in_lru(idx) {
        dir.lru_push_back(idx);
    }
}

fn invalidate_entry(dir: &mut Directory, pool: &mut CachePool, idx: usize) {
    let e = dir.entry_mut(idx);
    debug_assert_eq!(e.refcount, 0);
    debug_assert_ne!(e.state, BlockState::Home);
    let slot = e.slot;
    let addr = e.view_addr;
    e.state = BlockState::Invalid;
    e.slot = NIL;
    e.dirty = None;
    e.partial = false;
    pool.unmap(addr);
    pool.release(slot);
}
