//! RDM block allocator.
//!
//! The RDM is carved into equal power-of-two blocks. A block is either in the
//! free pool or owned by exactly one `(pipe, node class)`; inside an owned
//! block a [`Buddy`] hands out runs. Normal frees are only *queued*: the
//! address stays reserved until the owning pipe's RDM-change epoch
//! completes (see [`crate::epoch`]).

use crate::buddy::{order_for, Buddy};
use crate::error::Result;
use crate::invariant::{check_invariant, BLOCK_SINGLE_OWNER, EPOCH_NO_OVERLAP, RDM_FREE_VALID};
use crate::types::{NodeClass, PipeId, RdmAddr};

/// Owner of an RDM block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Owner {
    pub pipe: PipeId,
    pub class: NodeClass,
}

/// Fixed-size bitset over block offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
struct OffsetSet {
    words: Vec<u64>,
}

impl OffsetSet {
    fn new(bits: u32) -> Self {
        Self {
            words: vec![0; bits.div_ceil(64) as usize],
        }
    }

    fn insert(&mut self, off: u32) {
        self.words[off as usize / 64] |= 1 << (off % 64);
    }

    fn contains(&self, off: u32) -> bool {
        self.words[off as usize / 64] & (1 << (off % 64)) != 0
    }

    fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    fn take(&mut self) -> Vec<u32> {
        let mut out = Vec::new();
        for (i, w) in self.words.iter_mut().enumerate() {
            let mut bits = *w;
            while bits != 0 {
                let b = bits.trailing_zeros();
                out.push(i as u32 * 64 + b);
                bits &= bits - 1;
            }
            *w = 0;
        }
        out
    }
}

#[derive(Debug, Clone)]
struct Block {
    owner: Option<Owner>,
    buddy: Buddy,
    queued: OffsetSet,
    waiting: OffsetSet,
}

/// Allocation statistics of one owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OwnerUsage {
    pub blocks: usize,
    pub runs: usize,
}

/// Block allocator for one device's RDM.
#[derive(Debug, Clone)]
pub struct BlockAllocator {
    block_entries: u32,
    blocks: Vec<Block>,
}

impl BlockAllocator {
    /// Entry 0 of block 0 is reserved forever.
    pub fn new(rdm_entries: u32, block_entries: u32) -> Self {
        let count = rdm_entries / block_entries;
        let mut blocks: Vec<Block> = (0..count)
            .map(|_| Block {
                owner: None,
                buddy: Buddy::new(block_entries),
                queued: OffsetSet::new(block_entries),
                waiting: OffsetSet::new(block_entries),
            })
            .collect();
        if let Some(first) = blocks.first_mut() {
            first.buddy.allocate_fixed(0, 0);
        }
        Self {
            block_entries,
            blocks,
        }
    }

    pub fn block_entries(&self) -> u32 {
        self.block_entries
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    fn split(&self, addr: RdmAddr) -> Option<(usize, u32)> {
        let idx = (addr.0 / self.block_entries) as usize;
        (idx < self.blocks.len()).then_some((idx, addr.0 % self.block_entries))
    }

    fn base(&self, idx: usize, off: u32) -> RdmAddr {
        RdmAddr(idx as u32 * self.block_entries + off)
    }

    /// Runs a block holds while it is considered empty.
    fn floor(idx: usize) -> usize {
        usize::from(idx == 0)
    }

    /// Entries actually reserved for `width * count`.
    pub fn run_entries(width: u32, count: u32) -> u32 {
        1 << order_for(width * count)
    }

    /// Allocate a run of `width * count` entries for `(pipe, class)`.
    ///
    /// Owned blocks are tried first; otherwise one free block is claimed.
    /// Returns `None` when neither fits; the caller decides about GC.
    pub fn allocate(&mut self, pipe: PipeId, class: NodeClass, width: u32, count: u32) -> Option<RdmAddr> {
        let owner = Owner { pipe, class };
        let order = order_for(width * count);
        for idx in 0..self.blocks.len() {
            if self.blocks[idx].owner == Some(owner) {
                if let Some(off) = self.blocks[idx].buddy.allocate(order) {
                    return Some(self.base(idx, off));
                }
            }
        }
        // Block 0 cannot hold a whole-block run, so keep looking past it.
        for idx in 0..self.blocks.len() {
            let block = &mut self.blocks[idx];
            if block.owner.is_some() {
                continue;
            }
            if let Some(off) = block.buddy.allocate(order) {
                block.owner = Some(owner);
                log::debug!("rdm block {} claimed by pipe {} {:?}", idx, pipe, class);
                return Some(self.base(idx, off));
            }
        }
        None
    }

    /// Reserve an exact region during state rebuild. Idempotent; fails when
    /// the block belongs to another owner or the region overlaps a
    /// different reservation.
    pub fn mark_used(&mut self, addr: RdmAddr, pipe: PipeId, class: NodeClass, size: u32) -> bool {
        let Some((idx, off)) = self.split(addr) else {
            return false;
        };
        let owner = Owner { pipe, class };
        let block = &mut self.blocks[idx];
        if (idx == 0 && off == 0) || block.owner.is_some_and(|o| o != owner) {
            return false;
        }
        if !block.buddy.allocate_fixed(off, order_for(size)) {
            return false;
        }
        if block.owner.is_none() {
            log::debug!("rdm block {} claimed by pipe {} {:?} on rebuild", idx, pipe, class);
            block.owner = Some(owner);
        }
        true
    }

    /// Release a run immediately. Only valid when no hardware reference to
    /// it can exist (never written, or rolled back before linking).
    pub fn mark_free(&mut self, addr: RdmAddr, pipe: PipeId) -> bool {
        let Some((idx, off)) = self.split(addr) else {
            return false;
        };
        let block = &mut self.blocks[idx];
        if idx == 0 && off == 0 {
            return false;
        }
        if block.owner.map(|o| o.pipe) != Some(pipe) || block.queued.contains(off) || block.waiting.contains(off) {
            return false;
        }
        if block.buddy.deallocate(off).is_none() {
            return false;
        }
        self.release_if_empty(idx);
        true
    }

    /// Queue a run for release at the end of the next epoch of its pipe.
    pub fn enqueue_free(&mut self, addr: RdmAddr) -> Result<()> {
        let ctx = addr.to_string();
        let Some((idx, off)) = self.split(addr) else {
            return check_invariant(RDM_FREE_VALID, false, "free outside rdm", Some(&ctx));
        };
        let block = &mut self.blocks[idx];
        check_invariant(
            RDM_FREE_VALID,
            block.owner.is_some() && block.buddy.order_at(off).is_some() && !(idx == 0 && off == 0),
            "freeing a region that was never reserved",
            Some(&ctx),
        )?;
        check_invariant(
            RDM_FREE_VALID,
            !block.queued.contains(off) && !block.waiting.contains(off),
            "region already queued for free",
            Some(&ctx),
        )?;
        block.queued.insert(off);
        Ok(())
    }

    /// Whether `pipe` has frees queued for a future epoch.
    pub fn has_queued(&self, pipe: PipeId) -> bool {
        self.blocks
            .iter()
            .any(|b| b.owner.map(|o| o.pipe) == Some(pipe) && !b.queued.is_empty())
    }

    /// Whether `pipe` has frees waiting on the outstanding epoch.
    pub fn has_waiting(&self, pipe: PipeId) -> bool {
        self.blocks
            .iter()
            .any(|b| b.owner.map(|o| o.pipe) == Some(pipe) && !b.waiting.is_empty())
    }

    /// Move every queued free of `pipe` into the waiting set.
    pub fn swap_epoch(&mut self, pipe: PipeId) -> Result<()> {
        for (idx, block) in self.blocks.iter_mut().enumerate() {
            if block.owner.map(|o| o.pipe) != Some(pipe) {
                continue;
            }
            check_invariant(
                EPOCH_NO_OVERLAP,
                block.waiting.is_empty(),
                "epoch started while the previous one is still waiting",
                Some(&format!("block {}", idx)),
            )?;
            std::mem::swap(&mut block.queued, &mut block.waiting);
        }
        Ok(())
    }

    /// Release every waiting run of `pipe`; empty blocks return to the pool.
    /// Returns the released runs as `(address, entries)`.
    pub fn drain_waiting(&mut self, pipe: PipeId) -> Result<Vec<(RdmAddr, u32)>> {
        let mut released = Vec::new();
        for idx in 0..self.blocks.len() {
            if self.blocks[idx].owner.map(|o| o.pipe) != Some(pipe) {
                continue;
            }
            let offsets = self.blocks[idx].waiting.take();
            for off in offsets {
                let order = self.blocks[idx].buddy.deallocate(off);
                check_invariant(
                    RDM_FREE_VALID,
                    order.is_some(),
                    "waiting free lost its reservation",
                    Some(&self.base(idx, off).to_string()),
                )?;
                if let Some(order) = order {
                    released.push((self.base(idx, off), 1u32 << order));
                }
            }
            self.release_if_empty(idx);
        }
        Ok(released)
    }

    fn release_if_empty(&mut self, idx: usize) {
        let block = &mut self.blocks[idx];
        if block.owner.is_some() && block.buddy.live() == Self::floor(idx) {
            log::debug!("rdm block {} returned to the free pool", idx);
            block.owner = None;
        }
    }

    /// Owner of the block containing `addr`.
    pub fn owner_of(&self, addr: RdmAddr) -> Option<Owner> {
        self.split(addr).and_then(|(idx, _)| self.blocks[idx].owner)
    }

    /// Entries reserved by the run starting at `addr`.
    pub fn size_of(&self, addr: RdmAddr) -> Option<u32> {
        let (idx, off) = self.split(addr)?;
        self.blocks[idx].buddy.order_at(off).map(|o| 1u32 << o)
    }

    /// Blocks not owned by anyone.
    pub fn free_blocks(&self) -> usize {
        self.blocks.iter().filter(|b| b.owner.is_none()).count()
    }

    /// Block and run counts held by one owner.
    pub fn usage(&self, pipe: PipeId, class: NodeClass) -> OwnerUsage {
        let owner = Some(Owner { pipe, class });
        self.blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.owner == owner)
            .fold(OwnerUsage::default(), |acc, (idx, b)| OwnerUsage {
                blocks: acc.blocks + 1,
                runs: acc.runs + b.buddy.live().saturating_sub(Self::floor(idx)),
            })
    }

    /// Every reserved run as `(address, entries, owner)`, excluding entry 0.
    pub fn live_runs(&self) -> Vec<(RdmAddr, u32, Option<Owner>)> {
        let mut out = Vec::new();
        for (idx, block) in self.blocks.iter().enumerate() {
            for (off, len) in block.buddy.runs() {
                if idx == 0 && off == 0 {
                    continue;
                }
                out.push((self.base(idx, off), len, block.owner));
            }
        }
        out
    }

    /// Verify block ownership bookkeeping.
    pub fn check_ownership(&self) -> Result<()> {
        if let Some(first) = self.blocks.first() {
            check_invariant(
                BLOCK_SINGLE_OWNER,
                first.buddy.order_at(0) == Some(0),
                "reserved entry 0 lost its reservation",
                None,
            )?;
        }
        for (idx, block) in self.blocks.iter().enumerate() {
            let extra = block.buddy.live().saturating_sub(Self::floor(idx));
            check_invariant(
                BLOCK_SINGLE_OWNER,
                (extra == 0) == block.owner.is_none(),
                "block ownership does not match its live runs",
                Some(&format!("block {}", idx)),
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> BlockAllocator {
        BlockAllocator::new(64, 16)
    }

    #[test]
    fn address_zero_never_handed_out() {
        let mut a = small();
        let addr = a.allocate(0, NodeClass::L1, 1, 1).unwrap();
        assert!(!addr.is_null());
        assert_eq!(a.owner_of(addr), Some(Owner { pipe: 0, class: NodeClass::L1 }));
    }

    #[test]
    fn classes_and_pipes_get_separate_blocks() {
        let mut a = small();
        let l1 = a.allocate(0, NodeClass::L1, 2, 1).unwrap();
        let l2 = a.allocate(0, NodeClass::L2, 2, 1).unwrap();
        let p1 = a.allocate(1, NodeClass::L1, 2, 1).unwrap();
        assert_ne!(l1.0 / 16, l2.0 / 16);
        assert_ne!(l1.0 / 16, p1.0 / 16);
        assert_eq!(a.free_blocks(), 1);
    }

    #[test]
    fn queued_free_is_not_reusable_until_drained() {
        let mut a = BlockAllocator::new(16, 16);
        let runs: Vec<RdmAddr> = std::iter::from_fn(|| a.allocate(0, NodeClass::L2, 1, 1)).collect();
        assert_eq!(runs.len(), 15);
        a.enqueue_free(runs[3]).unwrap();
        assert_eq!(a.allocate(0, NodeClass::L2, 1, 1), None);
        a.swap_epoch(0).unwrap();
        assert_eq!(a.allocate(0, NodeClass::L2, 1, 1), None);
        let released = a.drain_waiting(0).unwrap();
        assert_eq!(released, vec![(runs[3], 1)]);
        assert_eq!(a.allocate(0, NodeClass::L2, 1, 1), Some(runs[3]));
    }

    #[test]
    fn block_returns_to_pool_when_empty() {
        let mut a = small();
        let addr = a.allocate(2, NodeClass::L1, 2, 2).unwrap();
        let before = a.free_blocks();
        assert!(a.mark_free(addr, 2));
        assert_eq!(a.free_blocks(), before + 1);
        assert_eq!(a.owner_of(addr), None);
    }

    #[test]
    fn block_zero_released_with_reserved_entry_left() {
        let mut a = small();
        let addr = a.allocate(0, NodeClass::L1, 1, 1).unwrap();
        assert_eq!(addr.0 / 16, 0);
        a.enqueue_free(addr).unwrap();
        a.swap_epoch(0).unwrap();
        a.drain_waiting(0).unwrap();
        assert_eq!(a.owner_of(RdmAddr(0)), None);
        assert_eq!(a.size_of(RdmAddr(0)), Some(1));
    }

    #[test]
    fn mark_used_conflicts() {
        let mut a = small();
        assert!(a.mark_used(RdmAddr(20), 1, NodeClass::L2, 2));
        assert!(a.mark_used(RdmAddr(20), 1, NodeClass::L2, 2));
        assert!(!a.mark_used(RdmAddr(22), 0, NodeClass::L2, 2));
        assert!(!a.mark_used(RdmAddr(20), 1, NodeClass::L2, 4));
        assert_eq!(a.usage(1, NodeClass::L2), OwnerUsage { blocks: 1, runs: 1 });
    }

    #[test]
    fn mark_free_rejects_wrong_pipe() {
        let mut a = small();
        let addr = a.allocate(1, NodeClass::L2, 1, 1).unwrap();
        assert!(!a.mark_free(addr, 0));
        assert!(a.mark_free(addr, 1));
        assert!(!a.mark_free(addr, 1));
    }

    #[test]
    fn mark_free_never_releases_entry_zero() {
        let mut a = small();
        let addr = a.allocate(0, NodeClass::L1, 1, 1).unwrap();
        assert_eq!(addr, RdmAddr(1));
        assert!(!a.mark_free(RdmAddr(0), 0));
        assert!(!a.mark_used(RdmAddr(0), 0, NodeClass::L1, 1));
        assert_eq!(a.owner_of(addr), Some(Owner { pipe: 0, class: NodeClass::L1 }));
        assert_eq!(a.size_of(RdmAddr(0)), Some(1));
        let other = a.allocate(1, NodeClass::L2, 1, 1).unwrap();
        assert!(!other.is_null());
        assert_ne!(other.0 / 16, 0);
        assert_eq!(a.usage(0, NodeClass::L1), OwnerUsage { blocks: 1, runs: 1 });
        a.check_ownership().unwrap();
    }

    #[test]
    fn whole_block_request_skips_block_zero() {
        let mut a = small();
        let addr = a.allocate(3, NodeClass::L2, 16, 1).unwrap();
        assert_eq!(addr, RdmAddr(16));
        assert_eq!(a.owner_of(RdmAddr(0)), None);
        assert_eq!(a.free_blocks(), 3);
        a.allocate(3, NodeClass::L2, 16, 1).unwrap();
        a.allocate(3, NodeClass::L2, 16, 1).unwrap();
        assert_eq!(a.allocate(3, NodeClass::L2, 16, 1), None);
        assert_eq!(a.free_blocks(), 1);
    }

    #[cfg(not(feature = "fail-fast"))]
    #[test]
    fn double_enqueue_is_rejected() {
        let mut a = small();
        let addr = a.allocate(0, NodeClass::L2, 1, 1).unwrap();
        a.enqueue_free(addr).unwrap();
        assert!(a.enqueue_free(addr).is_err());
        assert!(a.enqueue_free(RdmAddr(0)).is_err());
    }

    #[cfg(not(feature = "fail-fast"))]
    #[test]
    fn overlapping_epochs_are_rejected() {
        let mut a = small();
        let x = a.allocate(0, NodeClass::L2, 1, 1).unwrap();
        let y = a.allocate(0, NodeClass::L2, 1, 1).unwrap();
        a.enqueue_free(x).unwrap();
        a.swap_epoch(0).unwrap();
        a.enqueue_free(y).unwrap();
        assert!(a.swap_epoch(0).is_err());
    }
}
