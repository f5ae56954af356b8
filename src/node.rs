//! L1 replication nodes and their per-pipe hardware placement.

#![forbid(unsafe_code)]

use crate::types::{EcmpHandle, L1Handle, LagId, LagSet, Mgid, PortMap, RdmAddr, MAX_PIPES};

/// What an L1 node is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Binding {
    /// Not associated; never placed.
    #[default]
    Free,
    /// Directly associated to a multicast group.
    Group(Mgid),
    /// Member of an ECMP group, living in member slot `slot`.
    EcmpMember { group: EcmpHandle, slot: usize },
    /// Pointer node standing for the association of an ECMP group to a
    /// multicast group.
    EcmpPointer { group: EcmpHandle, mgid: Mgid },
}

impl Binding {
    /// Multicast group whose tree links this node.
    pub fn tree(&self) -> Option<Mgid> {
        match *self {
            Binding::Group(mgid) | Binding::EcmpPointer { mgid, .. } => Some(mgid),
            _ => None,
        }
    }

    pub fn ecmp(&self) -> Option<EcmpHandle> {
        match *self {
            Binding::EcmpMember { group, .. } | Binding::EcmpPointer { group, .. } => Some(group),
            _ => None,
        }
    }

    pub fn is_free(&self) -> bool {
        matches!(self, Binding::Free)
    }
}

/// Contiguous run of L2 port nodes, walked until the `last` flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRun {
    pub addr: RdmAddr,
    pub nodes: Vec<crate::rdm::RdmNode>,
}

impl PortRun {
    pub fn width(&self) -> u32 {
        self.nodes.iter().map(|n| n.width()).sum()
    }
}

/// L2 chain of one node in one pipe: LAG nodes first, then the port run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct L2Chain {
    pub lags: Vec<(LagId, RdmAddr)>,
    pub ports: Option<PortRun>,
}

impl L2Chain {
    /// Address the L1 node's `next_l2` points at.
    pub fn head(&self) -> RdmAddr {
        self.lags
            .first()
            .map(|&(_, a)| a)
            .or_else(|| self.ports.as_ref().map(|r| r.addr))
            .unwrap_or(RdmAddr::NULL)
    }

    pub fn is_empty(&self) -> bool {
        self.lags.is_empty() && self.ports.is_none()
    }

    /// Every allocation held by the chain.
    pub fn addresses(&self) -> Vec<RdmAddr> {
        let mut out: Vec<RdmAddr> = self.lags.iter().map(|&(_, a)| a).collect();
        out.extend(self.ports.as_ref().map(|r| r.addr));
        out
    }
}

/// Placement of a node in one pipe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Placement {
    /// L1 slot; null when the node is not placed in this pipe.
    pub rdm_addr: RdmAddr,
    /// Group tree the slot is linked into.
    pub tree: Option<Mgid>,
    pub prev: Option<L1Handle>,
    pub next: Option<L1Handle>,
    /// Whether `rdm_addr` was allocated for this node (member slots are not).
    pub owned: bool,
    pub l2: L2Chain,
}

impl Placement {
    pub fn is_placed(&self) -> bool {
        !self.rdm_addr.is_null()
    }
}

/// One RID/XID replication point.
#[derive(Debug, Clone)]
pub struct L1Node {
    pub handle: L1Handle,
    pub rid: u16,
    pub xid: Option<u16>,
    pub binding: Binding,
    pub ports: PortMap,
    pub lags: LagSet,
    pub pipes: [Placement; MAX_PIPES],
}

impl L1Node {
    pub fn new(handle: L1Handle, rid: u16, ports: PortMap, lags: LagSet) -> Self {
        Self {
            handle,
            rid,
            xid: None,
            binding: Binding::Free,
            ports,
            lags,
            pipes: Default::default(),
        }
    }

    /// Whether any pipe still holds a placement.
    pub fn is_placed(&self) -> bool {
        self.pipes.iter().any(Placement::is_placed)
    }

    pub fn uses_lag(&self, lag: LagId) -> bool {
        self.lags.contains(lag)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdm::RdmNode;

    #[test]
    fn chain_head_prefers_lags() {
        let mut chain = L2Chain::default();
        assert_eq!(chain.head(), RdmAddr::NULL);
        chain.ports = Some(PortRun {
            addr: RdmAddr(8),
            nodes: vec![RdmNode::L2Port72 { last: true, pipe: 0, ports: 1 }],
        });
        assert_eq!(chain.head(), RdmAddr(8));
        chain.lags.push((LagId(3), RdmAddr(5)));
        assert_eq!(chain.head(), RdmAddr(5));
        assert_eq!(chain.addresses(), vec![RdmAddr(5), RdmAddr(8)]);
    }

    #[test]
    fn binding_views() {
        let b = Binding::EcmpPointer { group: EcmpHandle(1), mgid: Mgid(9) };
        assert_eq!(b.tree(), Some(Mgid(9)));
        assert_eq!(b.ecmp(), Some(EcmpHandle(1)));
        assert_eq!(Binding::EcmpMember { group: EcmpHandle(2), slot: 0 }.tree(), None);
        assert!(Binding::default().is_free());
    }
}
