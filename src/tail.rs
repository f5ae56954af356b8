//! Tail nodes bounding the hardware walk of a group tree.
//!
//! Every pipe owns one terminal `L1End` node per bucket, written once at
//! device creation. The last L1 node of a (group, pipe) tree points at the
//! tail of the smallest bucket that holds the tree.

use crate::device::Device;
use crate::error::Result;
use crate::invariant::{check_invariant, TAIL_DEFERRED};
use crate::types::{Mgid, PipeId, RdmAddr, MAX_PIPES, TAIL_RID};

#[derive(Debug, Clone)]
pub struct TailTable {
    buckets: Vec<u16>,
    nodes: Vec<[RdmAddr; MAX_PIPES]>,
}

impl TailTable {
    pub fn new(buckets: Vec<u16>) -> Self {
        let nodes = vec![[RdmAddr::NULL; MAX_PIPES]; buckets.len()];
        Self { buckets, nodes }
    }

    pub fn buckets(&self) -> &[u16] {
        &self.buckets
    }

    /// Smallest bucket holding `len` L1 nodes.
    pub fn bucket_for(&self, len: u32) -> Option<usize> {
        self.buckets.iter().position(|&b| u32::from(b) >= len)
    }

    pub fn node(&self, bucket: usize, pipe: PipeId) -> RdmAddr {
        self.nodes[bucket][pipe]
    }

    pub(crate) fn set_node(&mut self, bucket: usize, pipe: PipeId, addr: RdmAddr) {
        self.nodes[bucket][pipe] = addr;
    }

    /// Whether `addr` is one of the tail nodes of `pipe`.
    pub fn is_tail(&self, pipe: PipeId, addr: RdmAddr) -> bool {
        !addr.is_null() && self.nodes.iter().any(|n| n[pipe] == addr)
    }
}

impl Device {
    /// Allocate and write the tail nodes of every pipe.
    pub(crate) fn init_tails(&mut self) -> Result<()> {
        for pipe in 0..self.cfg.pipes {
            for bucket in 0..self.tails.buckets().len() {
                let addr = self.allocate(pipe, crate::types::NodeClass::L1, 1, 1)?;
                self.write_l1_end(addr, RdmAddr::NULL, TAIL_RID)?;
                self.tails.set_node(bucket, pipe, addr);
            }
        }
        Ok(())
    }

    /// Redirect the last node of a tree at the tail for its current length.
    /// Only called from epoch completion.
    pub(crate) fn apply_tail(&mut self, pipe: PipeId, mgid: Mgid) -> Result<()> {
        check_invariant(
            TAIL_DEFERRED,
            !self.epochs.is_outstanding(pipe),
            "tail rewritten while the pipe's epoch is outstanding",
            Some(&format!("pipe {} mgid {}", pipe, mgid.0)),
        )?;
        let Some(info) = self.groups.get_mut(&mgid) else {
            return Ok(());
        };
        let tree = &mut info.trees[pipe];
        let Some(last) = tree.last else {
            tree.tail_bucket = None;
            return Ok(());
        };
        let bucket = self.tails.bucket_for(tree.len);
        tree.tail_bucket = bucket;
        let target = bucket.map_or(RdmAddr::NULL, |b| self.tails.node(b, pipe));
        let addr = self.placement(last, pipe)?.rdm_addr;
        let current = self.rdm.get(addr);
        if current.next_l1() != Some(target) {
            self.write_node(addr, current.with_next_l1(target))?;
        }
        Ok(())
    }
}
