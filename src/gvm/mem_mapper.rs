//! Home policies: the mapping from region offsets to the rank that
//! authoritatively stores them. Dispatch is decided once at region creation;
//! `segment_of` sits on the checkout hot path.

use crate::util::numa::{NumaNode, NUMA_INTERLEAVE};

/// The owning inter rank and extent of the contiguous home segment containing
/// an offset. `pm_offset` is where the segment starts in the owner's window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub owner: usize,
    pub offset_b: usize,
    pub offset_e: usize,
    pub pm_offset: usize,
}

impl Segment {
    pub fn len(&self) -> usize {
        self.offset_e - self.offset_b
    }

    /// Window displacement of `offset` (which must lie in this segment).
    pub fn pm_offset_of(&self, offset: usize) -> usize {
        debug_assert!(self.offset_b <= offset && offset < self.offset_e);
        self.pm_offset + (offset - self.offset_b)
    }
}

/// NUMA placement of a window sub-range; `owner` is an intra rank index or
/// `NUMA_INTERLEAVE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NumaSegment {
    pub owner: NumaNode,
    pub pm_offset_b: usize,
    pub pm_offset_e: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// Contiguous split: segment `i` homed on inter rank `i`.
    Block,
    /// `seg_size`-sized chunks round-robin across inter ranks.
    Cyclic,
    /// Block, but segment `i` homed on inter rank `n - 1 - i`, so the last
    /// worker of an ADWS work-hint range holds the last blocks.
    BlockReversed,
}

#[derive(Debug, Clone)]
pub struct HomePolicy {
    kind: PolicyKind,
    size: usize,
    n_inter: usize,
    n_intra: usize,
    block_size: usize,
    n_blocks: usize,
    seg_size: usize,
}

impl HomePolicy {
    pub fn new(
        kind: PolicyKind,
        size: usize,
        n_inter: usize,
        n_intra: usize,
        block_size: usize,
        seg_size: Option<usize>,
    ) -> HomePolicy {
        debug_assert!(block_size.is_power_of_two());
        let seg_size = seg_size.unwrap_or(block_size);
        assert!(seg_size >= block_size);
        assert!(seg_size % block_size == 0);
        HomePolicy {
            kind,
            size,
            n_inter,
            n_intra,
            block_size,
            n_blocks: (size + block_size - 1) / block_size,
            seg_size,
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The home bytes owned by `inter_rank` (never zero, so every rank can
    /// publish a window).
    pub fn local_size(&self, inter_rank: usize) -> usize {
        match self.kind {
            PolicyKind::Block => {
                let (b, e) = self.seg_range_ceil(inter_rank);
                (e - b).max(1) * self.block_size
            }
            PolicyKind::Cyclic => self.cyclic_local_size(),
            PolicyKind::BlockReversed => {
                let seg_id = self.n_inter - inter_rank - 1;
                let (b, e) = self.seg_range_floor(seg_id);
                (e - b).max(1) * self.block_size
            }
        }
    }

    /// The block-aligned size actually reserved and tiled by segments.
    pub fn effective_size(&self) -> usize {
        match self.kind {
            PolicyKind::Block | PolicyKind::BlockReversed => self.n_blocks * self.block_size,
            PolicyKind::Cyclic => self.cyclic_local_size() * self.n_inter,
        }
    }

    pub fn segment_of(&self, offset: usize) -> Segment {
        debug_assert!(offset < self.effective_size());
        match self.kind {
            PolicyKind::Block => {
                let blk_id = offset / self.block_size;
                let seg_id = blk_id * self.n_inter / self.n_blocks;
                let (b, e) = self.seg_range_ceil(seg_id);
                debug_assert!(b <= blk_id && blk_id < e);
                Segment {
                    owner: seg_id,
                    offset_b: b * self.block_size,
                    offset_e: e * self.block_size,
                    pm_offset: 0,
                }
            }
            PolicyKind::Cyclic => {
                let blk_id_g = offset / self.seg_size;
                let blk_id_l = blk_id_g / self.n_inter;
                Segment {
                    owner: blk_id_g % self.n_inter,
                    offset_b: blk_id_g * self.seg_size,
                    offset_e: (blk_id_g + 1) * self.seg_size,
                    pm_offset: blk_id_l * self.seg_size,
                }
            }
            PolicyKind::BlockReversed => {
                let blk_id = offset / self.block_size;
                let seg_id = ((blk_id + 1) * self.n_inter + self.n_blocks - 1) / self.n_blocks - 1;
                let (b, e) = self.seg_range_floor(seg_id);
                debug_assert!(b <= blk_id && blk_id < e);
                Segment {
                    owner: self.n_inter - seg_id - 1,
                    offset_b: b * self.block_size,
                    offset_e: e * self.block_size,
                    pm_offset: 0,
                }
            }
        }
    }

    /// NUMA placement for a window displacement on `inter_rank`'s home.
    pub fn numa_segment_of(&self, inter_rank: usize, pm_offset: usize) -> NumaSegment {
        debug_assert!(pm_offset < self.local_size(inter_rank));
        match self.kind {
            PolicyKind::Block => {
                let n_numa_blk = (self.local_size(inter_rank) + self.block_size - 1) / self.block_size;
                let blk_id = pm_offset / self.block_size;
                let seg_id = blk_id * self.n_intra / n_numa_blk;
                let b = (seg_id * n_numa_blk + self.n_intra - 1) / self.n_intra;
                let e = ((seg_id + 1) * n_numa_blk + self.n_intra - 1) / self.n_intra;
                debug_assert!(b <= blk_id && blk_id < e);
                NumaSegment {
                    owner: seg_id as NumaNode,
                    pm_offset_b: b * self.block_size,
                    pm_offset_e: e * self.block_size,
                }
            }
            PolicyKind::Cyclic => NumaSegment {
                owner: NUMA_INTERLEAVE,
                pm_offset_b: 0,
                pm_offset_e: self.local_size(inter_rank),
            },
            PolicyKind::BlockReversed => {
                let n_numa_blk = (self.local_size(inter_rank) + self.block_size - 1) / self.block_size;
                let blk_id = pm_offset / self.block_size;
                let seg_id = ((blk_id + 1) * self.n_intra + n_numa_blk - 1) / n_numa_blk - 1;
                let b = (seg_id * n_numa_blk) / self.n_intra;
                let e = ((seg_id + 1) * n_numa_blk) / self.n_intra;
                debug_assert!(b <= blk_id && blk_id < e);
                NumaSegment {
                    owner: (self.n_intra - seg_id - 1) as NumaNode,
                    pm_offset_b: b * self.block_size,
                    pm_offset_e: e * self.block_size,
                }
            }
        }
    }

    /// Whether every locally accessible home segment should be mapped into
    /// the region view eagerly at creation. Cyclic homes are mapped on
    /// demand to avoid fragmenting the view with fine-grained mappings.
    pub fn should_map_all_home(&self) -> bool {
        match self.kind {
            PolicyKind::Block | PolicyKind::BlockReversed => true,
            PolicyKind::Cyclic => false,
        }
    }

    fn seg_range_ceil(&self, seg_id: usize) -> (usize, usize) {
        let b = (seg_id * self.n_blocks + self.n_inter - 1) / self.n_inter;
        let e = ((seg_id + 1) * self.n_blocks + self.n_inter - 1) / self.n_inter;
        (b, e)
    }

    fn seg_range_floor(&self, seg_id: usize) -> (usize, usize) {
        let b = (seg_id * self.n_blocks) / self.n_inter;
        let e = ((seg_id + 1) * self.n_blocks) / self.n_inter;
        (b, e)
    }

    fn cyclic_local_size(&self) -> usize {
        let n_blk_g = (self.size + self.seg_size - 1) / self.seg_size;
        let n_blk_l = (n_blk_g + self.n_inter - 1) / self.n_inter;
        n_blk_l * self.seg_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: usize = 65536;

    fn block_local_size(size: usize, n_inter: usize, inter_rank: usize) -> usize {
        HomePolicy::new(PolicyKind::Block, size, n_inter, 1, BS, None).local_size(inter_rank)
    }

    fn block_segment(size: usize, n_inter: usize, offset: usize) -> Segment {
        HomePolicy::new(PolicyKind::Block, size, n_inter, 1, BS, None).segment_of(offset)
    }

    #[test]
    fn block_local_sizes() {
        assert_eq!(block_local_size(BS * 4, 4, 0), BS);
        assert_eq!(block_local_size(BS * 12, 4, 0), BS * 3);
        assert_eq!(block_local_size(BS * 14, 4, 0), BS * 4);
        assert_eq!(block_local_size(BS * 14, 4, 1), BS * 3);
        assert_eq!(block_local_size(BS * 14, 4, 2), BS * 4);
        assert_eq!(block_local_size(BS * 14, 4, 3), BS * 3);
        assert_eq!(block_local_size(1, 4, 0), BS);
        // cannot be zero
        assert_eq!(block_local_size(1, 4, 1), BS);
        assert_eq!(block_local_size(1, 1, 0), BS);
        assert_eq!(block_local_size(BS * 3, 1, 0), BS * 3);
    }

    #[test]
    fn block_segment_lookup() {
        let seg = |owner, b, e| Segment {
            owner,
            offset_b: b,
            offset_e: e,
            pm_offset: 0,
        };
        assert_eq!(block_segment(BS * 4, 4, 0), seg(0, 0, BS));
        assert_eq!(block_segment(BS * 4, 4, BS), seg(1, BS, BS * 2));
        assert_eq!(block_segment(BS * 4, 4, BS * 2), seg(2, BS * 2, BS * 3));
        assert_eq!(block_segment(BS * 4, 4, BS * 3), seg(3, BS * 3, BS * 4));
        assert_eq!(block_segment(BS * 4, 4, BS * 4 - 1), seg(3, BS * 3, BS * 4));
        assert_eq!(block_segment(BS * 14, 4, 0), seg(0, 0, BS * 4));
        assert_eq!(block_segment(BS * 14, 4, BS), seg(0, 0, BS * 4));
        assert_eq!(block_segment(BS * 14, 4, BS * 5), seg(1, BS * 4, BS * 7));
        assert_eq!(
            block_segment(BS * 14 - 1, 4, BS * 14 - 1),
            seg(3, BS * 11, BS * 14)
        );
    }

    #[test]
    fn cyclic_local_sizes() {
        let ss = BS * 2;
        let local = |size, n_inter, inter_rank| {
            HomePolicy::new(PolicyKind::Cyclic, size, n_inter, 1, BS, Some(ss)).local_size(inter_rank)
        };
        assert_eq!(local(ss * 4, 4, 0), ss);
        assert_eq!(local(ss * 12, 4, 0), ss * 3);
        assert_eq!(local(ss * 13, 4, 0), ss * 4);
        assert_eq!(local(ss * 12 + 1, 4, 0), ss * 4);
        assert_eq!(local(ss * 12 - 1, 4, 0), ss * 3);
        assert_eq!(local(1, 4, 0), ss);
        assert_eq!(local(1, 1, 0), ss);
        assert_eq!(local(ss * 3, 1, 0), ss * 3);
    }

    #[test]
    fn cyclic_segment_lookup() {
        let ss = BS * 2;
        let segment = |size, n_inter, offset| {
            HomePolicy::new(PolicyKind::Cyclic, size, n_inter, 1, BS, Some(ss)).segment_of(offset)
        };
        let seg = |owner, b, e, pm| Segment {
            owner,
            offset_b: b,
            offset_e: e,
            pm_offset: pm,
        };
        assert_eq!(segment(ss * 4, 4, 0), seg(0, 0, ss, 0));
        assert_eq!(segment(ss * 4, 4, ss), seg(1, ss, ss * 2, 0));
        assert_eq!(segment(ss * 4, 4, ss * 2), seg(2, ss * 2, ss * 3, 0));
        assert_eq!(segment(ss * 4, 4, ss * 4 - 1), seg(3, ss * 3, ss * 4, 0));
        assert_eq!(segment(ss * 12, 4, ss * 5 + 2), seg(1, ss * 5, ss * 6, ss));
        assert_eq!(
            segment(ss * 12 - 1, 4, ss * 11),
            seg(3, ss * 11, ss * 12, ss * 2)
        );
    }

    #[test]
    fn reversed_owners_mirror_block() {
        let n = 4;
        let p = HomePolicy::new(PolicyKind::BlockReversed, BS * 8, n, 1, BS, None);
        // the first offset is homed on the last rank, the last on the first
        assert_eq!(p.segment_of(0).owner, n - 1);
        assert_eq!(p.segment_of(BS * 8 - 1).owner, 0);
        // local sizes are a permutation of the block split
        let total: usize = (0..n).map(|r| p.local_size(r)).sum();
        assert_eq!(total, BS * 8);
    }

    #[test]
    fn segments_tile_the_region() {
        for kind in [PolicyKind::Block, PolicyKind::Cyclic, PolicyKind::BlockReversed] {
            let p = HomePolicy::new(kind, BS * 14 - 1, 4, 1, BS, None);
            let mut off = 0;
            while off < p.effective_size() {
                let seg = p.segment_of(off);
                assert_eq!(seg.offset_b, off);
                assert!(seg.offset_e > off);
                assert!(seg.owner < 4);
                // every offset in the segment resolves to the same segment
                assert_eq!(p.segment_of(seg.offset_e - 1), seg);
                off = seg.offset_e;
            }
            assert_eq!(off, p.effective_size());
        }
    }

    #[test]
    fn numa_segments_cover_local_memory() {
        let p = HomePolicy::new(PolicyKind::Block, BS * 16, 2, 4, BS, None);
        let local = p.local_size(0);
        let mut pm = 0;
        while pm < local {
            let ns = p.numa_segment_of(0, pm);
            assert_eq!(ns.pm_offset_b, pm);
            assert!(ns.owner >= 0 && (ns.owner as usize) < 4);
            pm = ns.pm_offset_e;
        }
        assert_eq!(pm, local);

        let c = HomePolicy::new(PolicyKind::Cyclic, BS * 16, 2, 4, BS, None);
        assert_eq!(c.numa_segment_of(0, 0).owner, NUMA_INTERLEAVE);
    }
}
