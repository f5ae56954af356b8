//! RDM node kinds and the software shadow of the replication data memory.
//!
//! RDM pointers are entry offsets into one flat table. The shadow keeps the
//! decoded node at every base address so that every "dereference" is an
//! array lookup guarded by a kind check.

#![forbid(unsafe_code)]

use crate::error::Result;
use crate::invariant::{check_invariant, RDM_KIND_PRESERVED};
use crate::types::RdmAddr;

/// Kind tag of an RDM node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RdmNodeKind {
    Invalid,
    L1Rid,
    L1Xid,
    L1End,
    L1EcmpPtr,
    L1EcmpPtrXid,
    L1EcmpVector,
    L2Port18,
    L2Port72,
    L2Lag,
}

/// A decoded RDM node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RdmNode {
    /// Unused entry.
    Invalid,
    /// L1 replication point without exclusion id.
    L1Rid {
        next_l1: RdmAddr,
        next_l2: RdmAddr,
        rid: u16,
    },
    /// L1 replication point with exclusion id.
    L1Xid {
        next_l1: RdmAddr,
        next_l2: RdmAddr,
        rid: u16,
        xid: u16,
    },
    /// Terminal L1 node, half width.
    L1End { next_l2: RdmAddr, rid: u16 },
    /// L1 node selecting one member of an ECMP group.
    L1EcmpPtr {
        next_l1: RdmAddr,
        vector0: RdmAddr,
        vector1: RdmAddr,
    },
    /// ECMP pointer with exclusion id.
    L1EcmpPtrXid {
        next_l1: RdmAddr,
        vector0: RdmAddr,
        vector1: RdmAddr,
        xid: u16,
    },
    /// ECMP member vector: valid bitmap over the member block at `base`.
    L1EcmpVector {
        base: RdmAddr,
        length: u8,
        vector: u32,
        id: u16,
    },
    /// Ports of one 18-port segment of `pipe`.
    L2Port18 {
        last: bool,
        pipe: u8,
        index: u8,
        ports: u32,
    },
    /// All 72 ports of `pipe`.
    L2Port72 { last: bool, pipe: u8, ports: u128 },
    /// LAG membership pointer.
    L2Lag { next_l2: RdmAddr, lag_id: u8 },
}

impl RdmNode {
    pub fn kind(&self) -> RdmNodeKind {
        match self {
            RdmNode::Invalid => RdmNodeKind::Invalid,
            RdmNode::L1Rid { .. } => RdmNodeKind::L1Rid,
            RdmNode::L1Xid { .. } => RdmNodeKind::L1Xid,
            RdmNode::L1End { .. } => RdmNodeKind::L1End,
            RdmNode::L1EcmpPtr { .. } => RdmNodeKind::L1EcmpPtr,
            RdmNode::L1EcmpPtrXid { .. } => RdmNodeKind::L1EcmpPtrXid,
            RdmNode::L1EcmpVector { .. } => RdmNodeKind::L1EcmpVector,
            RdmNode::L2Port18 { .. } => RdmNodeKind::L2Port18,
            RdmNode::L2Port72 { .. } => RdmNodeKind::L2Port72,
            RdmNode::L2Lag { .. } => RdmNodeKind::L2Lag,
        }
    }

    /// Width in half-line entries.
    pub fn width(&self) -> u32 {
        match self {
            RdmNode::Invalid | RdmNode::L1End { .. } | RdmNode::L2Port18 { .. } | RdmNode::L2Lag { .. } => 1,
            _ => 2,
        }
    }

    /// Next L1 pointer of an L1 chain node.
    pub fn next_l1(&self) -> Option<RdmAddr> {
        match *self {
            RdmNode::L1Rid { next_l1, .. }
            | RdmNode::L1Xid { next_l1, .. }
            | RdmNode::L1EcmpPtr { next_l1, .. }
            | RdmNode::L1EcmpPtrXid { next_l1, .. } => Some(next_l1),
            _ => None,
        }
    }

    /// First L2 pointer of an L1 node, or next pointer of a LAG node.
    pub fn next_l2(&self) -> Option<RdmAddr> {
        match *self {
            RdmNode::L1Rid { next_l2, .. }
            | RdmNode::L1Xid { next_l2, .. }
            | RdmNode::L1End { next_l2, .. }
            | RdmNode::L2Lag { next_l2, .. } => Some(next_l2),
            _ => None,
        }
    }

    /// Same node with its L1 successor replaced. Nodes without one are returned unchanged.
    pub fn with_next_l1(self, addr: RdmAddr) -> RdmNode {
        match self {
            RdmNode::L1Rid { next_l2, rid, .. } => RdmNode::L1Rid { next_l1: addr, next_l2, rid },
            RdmNode::L1Xid { next_l2, rid, xid, .. } => RdmNode::L1Xid {
                next_l1: addr,
                next_l2,
                rid,
                xid,
            },
            RdmNode::L1EcmpPtr { vector0, vector1, .. } => RdmNode::L1EcmpPtr {
                next_l1: addr,
                vector0,
                vector1,
            },
            RdmNode::L1EcmpPtrXid { vector0, vector1, xid, .. } => RdmNode::L1EcmpPtrXid {
                next_l1: addr,
                vector0,
                vector1,
                xid,
            },
            other => other,
        }
    }

    /// Same node with its L2 pointer replaced.
    pub fn with_next_l2(self, addr: RdmAddr) -> RdmNode {
        match self {
            RdmNode::L1Rid { next_l1, rid, .. } => RdmNode::L1Rid { next_l1, next_l2: addr, rid },
            RdmNode::L1Xid { next_l1, rid, xid, .. } => RdmNode::L1Xid {
                next_l1,
                next_l2: addr,
                rid,
                xid,
            },
            RdmNode::L1End { rid, .. } => RdmNode::L1End { next_l2: addr, rid },
            RdmNode::L2Lag { lag_id, .. } => RdmNode::L2Lag { next_l2: addr, lag_id },
            other => other,
        }
    }

    pub fn is_l1(&self) -> bool {
        matches!(
            self.kind(),
            RdmNodeKind::L1Rid
                | RdmNodeKind::L1Xid
                | RdmNodeKind::L1End
                | RdmNodeKind::L1EcmpPtr
                | RdmNodeKind::L1EcmpPtrXid
        )
    }

    pub fn is_port(&self) -> bool {
        matches!(self, RdmNode::L2Port18 { .. } | RdmNode::L2Port72 { .. })
    }

    /// Whether a port node terminates its run.
    pub fn is_last(&self) -> bool {
        match *self {
            RdmNode::L2Port18 { last, .. } | RdmNode::L2Port72 { last, .. } => last,
            _ => true,
        }
    }
}

/// Software shadow of the RDM, indexed by entry address.
#[derive(Debug, Clone)]
pub struct Rdm {
    nodes: Vec<RdmNode>,
}

impl Rdm {
    pub fn new(entries: u32) -> Self {
        Self {
            nodes: vec![RdmNode::Invalid; entries as usize],
        }
    }

    pub fn len(&self) -> u32 {
        self.nodes.len() as u32
    }

    /// Node stored at `addr`; out-of-range reads are `Invalid`.
    pub fn get(&self, addr: RdmAddr) -> RdmNode {
        self.nodes.get(addr.0 as usize).copied().unwrap_or(RdmNode::Invalid)
    }

    /// Store `node` at `addr`.
    ///
    /// A slot may only be rewritten while invalid or with a node of the same
    /// kind; full-width nodes must be line aligned.
    pub fn set(&mut self, addr: RdmAddr, node: RdmNode) -> Result<()> {
        let idx = addr.0 as usize;
        let in_range = !addr.is_null() && idx + node.width() as usize <= self.nodes.len();
        check_invariant(RDM_KIND_PRESERVED, in_range, "rdm write out of range", Some(&addr.to_string()))?;
        check_invariant(
            RDM_KIND_PRESERVED,
            node.width() == 1 || addr.0 % 2 == 0,
            "full-width node not line aligned",
            Some(&addr.to_string()),
        )?;
        let current = self.nodes[idx];
        check_invariant(
            RDM_KIND_PRESERVED,
            current.kind() == RdmNodeKind::Invalid || current.kind() == node.kind(),
            "rewriting live rdm slot with a different node kind",
            Some(&format!("{} {:?} -> {:?}", addr, current.kind(), node.kind())),
        )?;
        self.nodes[idx] = node;
        Ok(())
    }

    /// Invalidate every node based inside `[addr, addr + len)`.
    ///
    /// Returns the base address and width of each node that was live.
    pub fn clear_range(&mut self, addr: RdmAddr, len: u32) -> Vec<(RdmAddr, u32)> {
        let mut cleared = Vec::new();
        let end = (addr.0 + len).min(self.len());
        for idx in addr.0..end {
            let node = self.nodes[idx as usize];
            if node.kind() != RdmNodeKind::Invalid {
                cleared.push((RdmAddr(idx), node.width()));
                self.nodes[idx as usize] = RdmNode::Invalid;
            }
        }
        cleared
    }

    /// Live nodes in address order.
    pub fn iter_live(&self) -> impl Iterator<Item = (RdmAddr, RdmNode)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.kind() != RdmNodeKind::Invalid)
            .map(|(i, n)| (RdmAddr(i as u32), *n))
    }
}
