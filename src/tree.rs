//! Multicast groups and the per-pipe L1 trees hanging off the MIT.
//!
//! Each (group, pipe) tree is an intrusive doubly linked list threaded
//! through the nodes' placements. New nodes are linked at the head: the
//! node is written pointing at the old head before the MIT moves to it.

use std::collections::BTreeSet;

use crate::device::Device;
use crate::error::{McError, Result};
use crate::hw::HwWrite;
use crate::invariant::{check_invariant, CHAIN_LINKED, PLACEMENT_CLEARED};
use crate::node::{Binding, L1Node, L2Chain, Placement};
use crate::rdm::RdmNode;
use crate::types::{DevPort, L1Handle, LagId, LagSet, Mgid, PipeId, PipeMask, PortMap, RdmAddr, MAX_PIPES};

/// Bookkeeping of one (group, pipe) tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipeTree {
    pub head: Option<L1Handle>,
    pub last: Option<L1Handle>,
    /// L1 nodes in the tree.
    pub len: u32,
    /// Tail bucket the last node currently points into.
    pub tail_bucket: Option<usize>,
}

/// Group-info record of one MGID.
#[derive(Debug, Clone, Default)]
pub struct MgidInfo {
    /// Direct members and ECMP pointer nodes.
    pub members: BTreeSet<L1Handle>,
    pub trees: [PipeTree; MAX_PIPES],
    /// Pipes with a non-empty tree, as programmed in the PVT.
    pub pvt: PipeMask,
}

impl Device {
    pub fn create_group(&mut self, mgid: Mgid) -> Result<()> {
        if u32::from(mgid.0) >= self.cfg.mgid_count {
            return Err(McError::invalid(format!("mgid {} out of range", mgid.0)));
        }
        if self.groups.contains_key(&mgid) {
            return Err(McError::AlreadyExists);
        }
        self.groups.insert(mgid, MgidInfo::default());
        Ok(())
    }

    /// Dissociate every remaining member, then drop the group.
    pub fn destroy_group(&mut self, mgid: Mgid) -> Result<()> {
        let members: Vec<L1Handle> = self.group(mgid)?.members.iter().copied().collect();
        for h in members {
            let binding = self.node(h)?.binding;
            match binding {
                Binding::Group(_) => self.dissociate(h, mgid)?,
                Binding::EcmpPointer { group, .. } => self.ecmp_dissociate(group, mgid)?,
                other => {
                    return Err(McError::unexpected(format!(
                        "group {} lists node {} bound as {:?}",
                        mgid.0, h.0, other
                    )))
                }
            }
        }
        let info = self.group(mgid)?;
        check_invariant(
            PLACEMENT_CLEARED,
            info.trees.iter().all(|t| t.head.is_none() && t.len == 0),
            "group destroyed with a live tree",
            Some(&format!("mgid {}", mgid.0)),
        )?;
        self.groups.remove(&mgid);
        Ok(())
    }

    pub fn group(&self, mgid: Mgid) -> Result<&MgidInfo> {
        self.groups.get(&mgid).ok_or(McError::NotFound)
    }

    pub fn group_member_count(&self, mgid: Mgid) -> Result<usize> {
        Ok(self.group(mgid)?.members.len())
    }

    pub fn create_l1_node(&mut self, rid: u16, ports: &[DevPort], lags: &[LagId]) -> Result<L1Handle> {
        self.check_ports(ports)?;
        let (ports, lags) = (PortMap::from_ports(ports), LagSet::from_ids(lags));
        let idx = self
            .nodes
            .insert_with(|i| L1Node::new(L1Handle(i as u32), rid, ports, lags))
            .ok_or(McError::ResourceExhausted)?;
        Ok(L1Handle(idx as u32))
    }

    /// Destroy an unassociated node.
    pub fn destroy_l1_node(&mut self, h: L1Handle) -> Result<()> {
        let node = self.node(h)?;
        if !node.binding.is_free() {
            return Err(McError::InUse);
        }
        check_invariant(
            PLACEMENT_CLEARED,
            !node.is_placed(),
            "unbound node still holds a placement",
            Some(&format!("node {}", h.0)),
        )?;
        self.nodes.remove(h.0 as usize);
        Ok(())
    }

    pub fn associate(&mut self, h: L1Handle, mgid: Mgid, xid: Option<u16>) -> Result<()> {
        if !self.node(h)?.binding.is_free() {
            return Err(McError::AlreadyExists);
        }
        if !self.groups.contains_key(&mgid) {
            return Err(McError::NotFound);
        }
        {
            let node = self.node_mut(h)?;
            node.binding = Binding::Group(mgid);
            node.xid = xid;
        }
        if let Err(e) = self.sync_nodes(&[h]) {
            let node = self.node_mut(h)?;
            node.binding = Binding::Free;
            node.xid = None;
            return Err(e);
        }
        if let Some(info) = self.groups.get_mut(&mgid) {
            info.members.insert(h);
        }
        Ok(())
    }

    pub fn dissociate(&mut self, h: L1Handle, mgid: Mgid) -> Result<()> {
        if self.node(h)?.binding != Binding::Group(mgid) {
            return Err(McError::NotFound);
        }
        self.node_mut(h)?.binding = Binding::Free;
        if let Err(e) = self.sync_nodes(&[h]) {
            self.node_mut(h)?.binding = Binding::Group(mgid);
            return Err(e);
        }
        self.node_mut(h)?.xid = None;
        if let Some(info) = self.groups.get_mut(&mgid) {
            info.members.remove(&h);
        }
        Ok(())
    }

    /// Replace a node's port and LAG membership, resplicing every pipe.
    pub fn node_update(&mut self, h: L1Handle, ports: &[DevPort], lags: &[LagId]) -> Result<()> {
        self.check_ports(ports)?;
        if matches!(self.node(h)?.binding, Binding::EcmpPointer { .. }) {
            return Err(McError::invalid("ecmp pointer nodes have no membership"));
        }
        let node = self.node_mut(h)?;
        let saved = (node.ports, node.lags);
        node.ports = PortMap::from_ports(ports);
        node.lags = LagSet::from_ids(lags);
        if let Err(e) = self.sync_nodes(&[h]) {
            let node = self.node_mut(h)?;
            (node.ports, node.lags) = saved;
            return Err(e);
        }
        Ok(())
    }

    /// Link a freshly written node at the head of its (group, pipe) tree.
    pub(crate) fn tree_link(&mut self, h: L1Handle, pipe: PipeId, mgid: Mgid, addr: RdmAddr, chain: L2Chain) -> Result<()> {
        let old_head = self.group(mgid)?.trees[pipe].head;
        let next_l1 = match old_head {
            Some(oh) => self.placement(oh, pipe)?.rdm_addr,
            None => RdmAddr::NULL,
        };
        let content = self.l1_content(h, pipe, next_l1, chain.head())?;
        self.write_node(addr, content)?;
        self.push_write(HwWrite::Mit { pipe, mgid, head: addr });

        self.node_mut(h)?.pipes[pipe] = Placement {
            rdm_addr: addr,
            tree: Some(mgid),
            prev: None,
            next: old_head,
            owned: true,
            l2: chain,
        };
        if let Some(oh) = old_head {
            self.node_mut(oh)?.pipes[pipe].prev = Some(h);
        }
        let info = self.groups.get_mut(&mgid).ok_or(McError::NotFound)?;
        let tree = &mut info.trees[pipe];
        tree.head = Some(h);
        tree.last.get_or_insert(h);
        tree.len += 1;
        if !info.pvt.contains(pipe) {
            info.pvt.insert(pipe);
            let pipes = info.pvt;
            self.push_write(HwWrite::Pvt { mgid, pipes });
        }
        self.epochs.queue_tail(pipe, mgid);
        Ok(())
    }

    /// Unlink a node from its (group, pipe) tree. Its slot is not freed here.
    pub(crate) fn tree_unlink(&mut self, h: L1Handle, pipe: PipeId, mgid: Mgid) -> Result<()> {
        let p = self.placement(h, pipe)?.clone();
        let tree = self.group(mgid)?.trees[pipe];
        let prev_ok = match p.prev {
            Some(pv) => self.placement(pv, pipe)?.next == Some(h),
            None => tree.head == Some(h),
        };
        let next_ok = match p.next {
            Some(nx) => self.placement(nx, pipe)?.prev == Some(h),
            None => tree.last == Some(h),
        };
        check_invariant(
            CHAIN_LINKED,
            prev_ok && next_ok,
            "tree links disagree",
            Some(&format!("node {} pipe {} mgid {}", h.0, pipe, mgid.0)),
        )?;

        let my_next = self.rdm.get(p.rdm_addr).next_l1().unwrap_or(RdmAddr::NULL);
        if tree.len == 1 {
            // PVT drops the pipe before the tree disappears.
            let info = self.groups.get_mut(&mgid).ok_or(McError::NotFound)?;
            info.pvt = info.pvt.minus(PipeMask(1 << pipe));
            let pipes = info.pvt;
            self.push_write(HwWrite::Pvt { mgid, pipes });
            self.push_write(HwWrite::Mit { pipe, mgid, head: RdmAddr::NULL });
        } else if let Some(pv) = p.prev {
            let prev_addr = self.placement(pv, pipe)?.rdm_addr;
            let prev_node = self.rdm.get(prev_addr);
            self.write_node(prev_addr, prev_node.with_next_l1(my_next))?;
        } else {
            let nx = p.next.ok_or_else(|| McError::unexpected("tree head without successor"))?;
            let head = self.placement(nx, pipe)?.rdm_addr;
            self.push_write(HwWrite::Mit { pipe, mgid, head });
        }

        if let Some(pv) = p.prev {
            self.node_mut(pv)?.pipes[pipe].next = p.next;
        }
        if let Some(nx) = p.next {
            self.node_mut(nx)?.pipes[pipe].prev = p.prev;
        }
        let info = self.groups.get_mut(&mgid).ok_or(McError::NotFound)?;
        let tree = &mut info.trees[pipe];
        if tree.head == Some(h) {
            tree.head = p.next;
        }
        if tree.last == Some(h) {
            tree.last = p.prev;
        }
        tree.len -= 1;
        self.epochs.queue_tail(pipe, mgid);
        Ok(())
    }

    /// Walk the hardware shadow from the MIT entry of (pipe, group), stopping
    /// at the tail. Returns every L1 node visited.
    pub fn walk_tree(&self, pipe: PipeId, mgid: Mgid) -> Result<Vec<(RdmAddr, RdmNode)>> {
        if pipe >= self.cfg.pipes {
            return Err(McError::invalid(format!("pipe {}", pipe)));
        }
        let info = self.group(mgid)?;
        let mut addr = match info.trees[pipe].head {
            Some(h) => self.placement(h, pipe)?.rdm_addr,
            None => RdmAddr::NULL,
        };
        let mut out = Vec::new();
        while !addr.is_null() && !self.tails.is_tail(pipe, addr) {
            let node = self.rdm.get(addr);
            check_invariant(
                CHAIN_LINKED,
                node.is_l1() && out.len() < self.rdm.len() as usize,
                "tree walk left the l1 chain",
                Some(&format!("pipe {} mgid {} at {}", pipe, mgid.0, addr)),
            )?;
            out.push((addr, node));
            addr = node.next_l1().unwrap_or(RdmAddr::NULL);
        }
        Ok(out)
    }

    /// L2 nodes hanging off the L1 node at `addr`, in walk order.
    pub fn walk_l2(&self, addr: RdmAddr) -> Vec<(RdmAddr, RdmNode)> {
        let mut out = Vec::new();
        let mut cur = self.rdm.get(addr).next_l2().unwrap_or(RdmAddr::NULL);
        while !cur.is_null() && out.len() < self.rdm.len() as usize {
            let node = self.rdm.get(cur);
            match node {
                RdmNode::L2Lag { next_l2, .. } => {
                    out.push((cur, node));
                    cur = next_l2;
                }
                n if n.is_port() => {
                    out.push((cur, n));
                    if n.is_last() {
                        break;
                    }
                    cur = cur.offset(n.width());
                }
                _ => break,
            }
        }
        out
    }

    /// Split off the pipes in `mask` into a second node with the same
    /// RID/XID and binding. Returns `None` when nothing would move.
    pub fn split(&mut self, h: L1Handle, mask: PipeMask) -> Result<Option<L1Handle>> {
        let node = self.node(h)?.clone();
        if node.binding.ecmp().is_some() {
            return Err(McError::invalid("ecmp nodes cannot be split"));
        }
        let all = PipeMask::all(self.cfg.pipes);
        let mask = mask.intersect(all);
        if mask.is_empty() || mask == all {
            return Ok(None);
        }
        let mut moved_lags = LagSet::new();
        for lag in node.lags.iter() {
            let reach = self.lags.chain_mask(lag);
            let inside = !reach.intersect(mask).is_empty();
            if inside && !reach.minus(mask).is_empty() {
                return Err(McError::invalid(format!("lag {} straddles the split", lag.0)));
            }
            if inside {
                moved_lags.insert(lag);
            }
        }
        let (mut moved_ports, mut kept_ports) = (PortMap::new(), PortMap::new());
        for port in node.ports.iter() {
            if mask.contains(port.pipe()) {
                moved_ports.insert(port);
            } else {
                kept_ports.insert(port);
            }
        }
        let mut kept_lags = node.lags;
        for lag in moved_lags.iter() {
            kept_lags.remove(lag);
        }

        let idx = self
            .nodes
            .insert_with(|i| {
                let mut n = L1Node::new(L1Handle(i as u32), node.rid, moved_ports, moved_lags);
                n.xid = node.xid;
                n.binding = node.binding;
                n
            })
            .ok_or(McError::ResourceExhausted)?;
        let h2 = L1Handle(idx as u32);
        {
            let n = self.node_mut(h)?;
            n.ports = kept_ports;
            n.lags = kept_lags;
        }
        self.move_placements(h, h2, mask)?;
        if let Binding::Group(mgid) = node.binding {
            if let Some(info) = self.groups.get_mut(&mgid) {
                info.members.insert(h2);
            }
        }
        if let Err(e) = self.sync_nodes(&[h, h2]) {
            self.move_placements(h2, h, mask)?;
            let n = self.node_mut(h)?;
            n.ports = node.ports;
            n.lags = node.lags;
            if let Binding::Group(mgid) = node.binding {
                if let Some(info) = self.groups.get_mut(&mgid) {
                    info.members.remove(&h2);
                }
            }
            self.nodes.remove(idx);
            return Err(e);
        }
        log::debug!("dev {} node {} split into {} for pipes {:#x}", self.id, h.0, h2.0, mask.0);
        Ok(Some(h2))
    }

    /// Hand the placements of `from` in `mask` over to `to`, fixing every
    /// tree link that named `from`.
    fn move_placements(&mut self, from: L1Handle, to: L1Handle, mask: PipeMask) -> Result<()> {
        let pipes = self.cfg.pipes;
        for pipe in mask.iter().filter(|&p| p < pipes) {
            let p = std::mem::take(&mut self.node_mut(from)?.pipes[pipe]);
            if let Some(mgid) = p.tree {
                if let Some(pv) = p.prev {
                    self.node_mut(pv)?.pipes[pipe].next = Some(to);
                }
                if let Some(nx) = p.next {
                    self.node_mut(nx)?.pipes[pipe].prev = Some(to);
                }
                let info = self.groups.get_mut(&mgid).ok_or(McError::NotFound)?;
                let tree = &mut info.trees[pipe];
                if tree.head == Some(from) {
                    tree.head = Some(to);
                }
                if tree.last == Some(from) {
                    tree.last = Some(to);
                }
            }
            self.node_mut(to)?.pipes[pipe] = p;
        }
        Ok(())
    }
}
