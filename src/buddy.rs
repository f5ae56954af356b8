//! Power-of-two sub-allocator used inside one RDM block.
//!
//! Runs are handed out in sizes of `2^order` entries, aligned to their size,
//! so full-width nodes (order >= 1) are always line aligned.

use std::collections::{BTreeMap, BTreeSet};

/// Order needed for a run of `entries` entries.
pub fn order_for(entries: u32) -> u8 {
    entries.max(1).next_power_of_two().trailing_zeros() as u8
}

/// Buddy allocator over `[0, size)`.
#[derive(Debug, Clone)]
pub struct Buddy {
    max_order: u8,
    free: Vec<BTreeSet<u32>>,
    allocated: BTreeMap<u32, u8>,
}

impl Buddy {
    /// `size` must be a power of two.
    pub fn new(size: u32) -> Self {
        let max_order = order_for(size);
        let mut free = vec![BTreeSet::new(); max_order as usize + 1];
        free[max_order as usize].insert(0);
        Self {
            max_order,
            free,
            allocated: BTreeMap::new(),
        }
    }

    /// Allocate `2^order` entries; returns the offset of the run.
    pub fn allocate(&mut self, order: u8) -> Option<u32> {
        if order > self.max_order {
            return None;
        }
        let found = (order..=self.max_order).find(|&k| !self.free[k as usize].is_empty())?;
        let base = *self.free[found as usize].iter().next()?;
        self.free[found as usize].remove(&base);
        for k in (order..found).rev() {
            self.free[k as usize].insert(base + (1 << k));
        }
        self.allocated.insert(base, order);
        Some(base)
    }

    /// Reserve the run at `offset`. Succeeds if the exact run is already
    /// reserved; fails if any part of it conflicts with another reservation.
    pub fn allocate_fixed(&mut self, offset: u32, order: u8) -> bool {
        if order > self.max_order || offset % (1 << order) != 0 {
            return false;
        }
        if self.allocated.get(&offset) == Some(&order) {
            return true;
        }
        for k in order..=self.max_order {
            let base = offset & !((1u32 << k) - 1);
            if self.free[k as usize].remove(&base) {
                let mut cur = base;
                for j in (order..k).rev() {
                    let half = 1u32 << j;
                    if offset >= cur + half {
                        self.free[j as usize].insert(cur);
                        cur += half;
                    } else {
                        self.free[j as usize].insert(cur + half);
                    }
                }
                self.allocated.insert(offset, order);
                return true;
            }
        }
        false
    }

    /// Release the run starting at `offset`, coalescing with free buddies.
    /// Returns the order released, or `None` if nothing was reserved there.
    pub fn deallocate(&mut self, offset: u32) -> Option<u8> {
        let order = self.allocated.remove(&offset)?;
        let mut base = offset;
        let mut k = order;
        while k < self.max_order {
            let buddy = base ^ (1 << k);
            if !self.free[k as usize].remove(&buddy) {
                break;
            }
            base = base.min(buddy);
            k += 1;
        }
        self.free[k as usize].insert(base);
        Some(order)
    }

    /// Order of the run reserved at `offset`.
    pub fn order_at(&self, offset: u32) -> Option<u8> {
        self.allocated.get(&offset).copied()
    }

    /// Number of reserved runs.
    pub fn live(&self) -> usize {
        self.allocated.len()
    }

    /// Reserved runs as `(offset, entries)`.
    pub fn runs(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.allocated.iter().map(|(&off, &order)| (off, 1u32 << order))
    }

    /// Largest free run, in entries.
    pub fn largest_free(&self) -> u32 {
        (0..=self.max_order)
            .rev()
            .find(|&k| !self.free[k as usize].is_empty())
            .map(|k| 1u32 << k)
            .unwrap_or(0)
    }
}
