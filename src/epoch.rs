//! Deferred-free epochs.
//!
//! Per pipe, at most one RDM-change cycle is outstanding. Starting an epoch
//! moves the allocator's queued frees (and queued tail rewrites) into the
//! waiting set; completing it releases exactly that set. Anything queued
//! while the epoch runs waits for the next one.

use std::collections::BTreeSet;

use crate::alloc::BlockAllocator;
use crate::error::Result;
use crate::types::{Mgid, PipeId, RdmAddr};

#[derive(Debug, Clone, Default)]
struct PipeEpoch {
    outstanding: bool,
    tails_queued: BTreeSet<Mgid>,
    tails_waiting: BTreeSet<Mgid>,
    started: u64,
    completed: u64,
}

/// Result of one completed epoch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct EpochDone {
    /// Runs now free, as `(address, entries)`.
    pub released: Vec<(RdmAddr, u32)>,
    /// Groups whose tail redirection must be recomputed on this pipe.
    pub tails: Vec<Mgid>,
}

#[derive(Debug, Clone)]
pub struct EpochManager {
    pipes: Vec<PipeEpoch>,
}

impl EpochManager {
    pub fn new(pipes: usize) -> Self {
        Self {
            pipes: vec![PipeEpoch::default(); pipes],
        }
    }

    /// Defer a tail recomputation of `mgid` on `pipe` to the next epoch.
    pub fn queue_tail(&mut self, pipe: PipeId, mgid: Mgid) {
        self.pipes[pipe].tails_queued.insert(mgid);
    }

    pub fn is_outstanding(&self, pipe: PipeId) -> bool {
        self.pipes[pipe].outstanding
    }

    /// Whether the next epoch on `pipe` would have anything to do.
    pub fn has_work(&self, pipe: PipeId, alloc: &BlockAllocator) -> bool {
        !self.pipes[pipe].tails_queued.is_empty() || alloc.has_queued(pipe)
    }

    /// Start an epoch. Returns `false` when one is already outstanding or
    /// there is nothing queued; the caller issues the RDM-change write
    /// only on `true`.
    pub fn start(&mut self, pipe: PipeId, alloc: &mut BlockAllocator) -> Result<bool> {
        if self.pipes[pipe].outstanding || !self.has_work(pipe, alloc) {
            return Ok(false);
        }
        alloc.swap_epoch(pipe)?;
        let p = &mut self.pipes[pipe];
        std::mem::swap(&mut p.tails_queued, &mut p.tails_waiting);
        p.outstanding = true;
        p.started += 1;
        log::debug!("rdm change epoch {} started on pipe {}", p.started, pipe);
        Ok(true)
    }

    /// Finish the outstanding epoch of `pipe`.
    ///
    /// A completion with no outstanding epoch is ignored.
    pub fn complete(&mut self, pipe: PipeId, alloc: &mut BlockAllocator) -> Result<EpochDone> {
        if !self.pipes[pipe].outstanding {
            log::debug!("spurious rdm change completion on pipe {}", pipe);
            return Ok(EpochDone::default());
        }
        let released = alloc.drain_waiting(pipe)?;
        let p = &mut self.pipes[pipe];
        p.outstanding = false;
        p.completed += 1;
        let tails = std::mem::take(&mut p.tails_waiting).into_iter().collect();
        log::debug!(
            "rdm change epoch {} complete on pipe {}: {} runs released",
            p.completed,
            pipe,
            released.len()
        );
        Ok(EpochDone { released, tails })
    }

    /// (started, completed) epoch counts of a pipe.
    pub fn counts(&self, pipe: PipeId) -> (u64, u64) {
        (self.pipes[pipe].started, self.pipes[pipe].completed)
    }
}
