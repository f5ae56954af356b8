//! ECMP groups.
//!
//! A group owns, per pipe, a pair of vector nodes (one copy per table
//! version) and a member block holding up to 32 full-width member L1
//! nodes. The vector's bitmap selects valid slots; removals leave holes
//! that later additions fill first. A group reaches multicast groups
//! through pointer L1 nodes linked into each group's trees.

use crate::device::Device;
use crate::error::{McError, Result};
use crate::invariant::{check_invariant, ECMP_MEMBER_LOCATED};
use crate::node::{Binding, L1Node};
use crate::rdm::RdmNode;
use crate::types::{
    EcmpHandle, L1Handle, LagSet, Mgid, NodeClass, PipeId, PortMap, RdmAddr, ECMP_PTR_RID, MAX_PIPES,
};
use crate::version::Staged;

/// Member slots per group.
pub const ECMP_MAX_MEMBERS: usize = 32;

#[derive(Debug, Clone)]
pub struct EcmpGroup {
    pub handle: EcmpHandle,
    pub hw_id: u16,
    /// Member slots in use, holes included; the length is the allocated size.
    pub members: Vec<Option<L1Handle>>,
    /// Bit `i` set iff slot `i` holds a member.
    pub valid_map: u32,
    /// Base of the vector pair per pipe.
    pub vectors: [RdmAddr; MAX_PIPES],
    /// Member block base per pipe; null until the first member.
    pub blocks: [RdmAddr; MAX_PIPES],
    /// Slots the member blocks can hold.
    pub block_cap: u32,
    /// Pointer nodes, one per associated multicast group.
    pub pointers: Vec<L1Handle>,
}

impl EcmpGroup {
    pub fn allocated_size(&self) -> usize {
        self.members.len()
    }

    pub fn member_count(&self) -> usize {
        self.valid_map.count_ones() as usize
    }

    pub fn slot_of(&self, h: L1Handle) -> Option<usize> {
        self.members.iter().position(|&m| m == Some(h))
    }

    fn first_hole(&self) -> Option<usize> {
        self.members.iter().position(Option::is_none)
    }

    pub fn vector_node(&self, pipe: PipeId) -> RdmNode {
        RdmNode::L1EcmpVector {
            base: self.blocks[pipe],
            length: (self.members.len().max(1) - 1) as u8,
            vector: self.valid_map,
            id: self.hw_id,
        }
    }
}

impl Device {
    pub fn ecmp(&self, g: EcmpHandle) -> Result<&EcmpGroup> {
        self.ecmps
            .get(g.0 as usize)
            .ok_or_else(|| McError::invalid(format!("unknown ecmp group {}", g.0)))
    }

    fn ecmp_mut(&mut self, g: EcmpHandle) -> Result<&mut EcmpGroup> {
        self.ecmps
            .get_mut(g.0 as usize)
            .ok_or_else(|| McError::invalid(format!("unknown ecmp group {}", g.0)))
    }

    pub(crate) fn member_addr(&self, g: EcmpHandle, slot: usize, pipe: PipeId) -> Result<RdmAddr> {
        let base = self.ecmp(g)?.blocks[pipe];
        if base.is_null() {
            return Err(McError::unexpected(format!("ecmp group {} has no member block", g.0)));
        }
        Ok(base.offset(2 * slot as u32))
    }

    fn release_fresh(&mut self, fresh: Vec<(PipeId, RdmAddr)>) {
        for (pipe, addr) in fresh {
            if !self.alloc.mark_free(addr, pipe) {
                log::error!("dev {} could not release {} on pipe {}", self.id, addr, pipe);
            }
        }
    }

    /// Publish every pipe's vector through the versioned protocol.
    fn stage_vectors(&mut self, g: EcmpHandle) -> Result<()> {
        let grp = self.ecmp(g)?;
        let payload = (0..self.cfg.pipes)
            .map(|pipe| Staged::EcmpVector {
                pair: grp.vectors[pipe],
                node: grp.vector_node(pipe),
            })
            .collect();
        self.versioned_update(payload)
    }

    /// Reserve a hardware id and a vector pair in every pipe.
    pub fn create_ecmp_group(&mut self) -> Result<EcmpHandle> {
        if self.ecmps.len() >= self.cfg.max_ecmp_groups as usize {
            return Err(McError::ResourceExhausted);
        }
        let hw_id = self.ecmp_ids.alloc().ok_or(McError::ResourceExhausted)? as u16;
        let mut fresh = Vec::new();
        let mut vectors = [RdmAddr::NULL; MAX_PIPES];
        for pipe in 0..self.cfg.pipes {
            match self.allocate(pipe, NodeClass::L1, 2, 2) {
                Ok(addr) => {
                    vectors[pipe] = addr;
                    fresh.push((pipe, addr));
                }
                Err(e) => {
                    self.release_fresh(fresh);
                    self.ecmp_ids.release(u32::from(hw_id));
                    return Err(e);
                }
            }
        }
        let Some(idx) = self.ecmps.insert_with(|i| EcmpGroup {
            handle: EcmpHandle(i as u32),
            hw_id,
            members: Vec::new(),
            valid_map: 0,
            vectors,
            blocks: [RdmAddr::NULL; MAX_PIPES],
            block_cap: 0,
            pointers: Vec::new(),
        }) else {
            self.release_fresh(fresh);
            self.ecmp_ids.release(u32::from(hw_id));
            return Err(McError::ResourceExhausted);
        };
        let g = EcmpHandle(idx as u32);
        for pipe in 0..self.cfg.pipes {
            let node = self.ecmp(g)?.vector_node(pipe);
            self.write_node(vectors[pipe], node)?;
            self.write_node(vectors[pipe].offset(2), node)?;
        }
        Ok(g)
    }

    /// Remove every association and member, then release vectors, blocks
    /// and the hardware id.
    pub fn destroy_ecmp_group(&mut self, g: EcmpHandle) -> Result<()> {
        let grp = self.ecmp(g)?.clone();
        for ptr in grp.pointers {
            if let Binding::EcmpPointer { mgid, .. } = self.node(ptr)?.binding {
                self.ecmp_dissociate(g, mgid)?;
            }
        }
        for (slot, member) in grp.members.iter().enumerate() {
            let Some(h) = *member else { continue };
            let located = self
                .nodes
                .get(h.0 as usize)
                .is_some_and(|n| n.binding == Binding::EcmpMember { group: g, slot });
            check_invariant(
                ECMP_MEMBER_LOCATED,
                located,
                "ecmp member cannot be located",
                Some(&format!("group {} slot {} node {}", g.0, slot, h.0)),
            )?;
            self.ecmp_mbr_rem(g, h)?;
        }
        for pipe in 0..self.cfg.pipes {
            self.alloc.enqueue_free(grp.vectors[pipe])?;
            if !grp.blocks[pipe].is_null() {
                self.alloc.enqueue_free(grp.blocks[pipe])?;
            }
        }
        self.ecmp_ids.release(u32::from(grp.hw_id));
        self.ecmps.remove(g.0 as usize);
        Ok(())
    }

    /// Add `h` as a member: first member allocates the block, otherwise the
    /// first hole is filled, otherwise the block grows (in place while
    /// capacity allows, else by moving to a block twice the size).
    pub fn ecmp_mbr_add(&mut self, g: EcmpHandle, h: L1Handle) -> Result<()> {
        if !self.node(h)?.binding.is_free() {
            return Err(McError::invalid(format!("node {} is already bound", h.0)));
        }
        let grp = self.ecmp(g)?;
        let len = grp.members.len();
        let (slot, grow_to) = if grp.block_cap == 0 {
            (0, Some(1))
        } else if let Some(hole) = grp.first_hole() {
            (hole, None)
        } else if (len as u32) < grp.block_cap {
            (len, None)
        } else if len >= ECMP_MAX_MEMBERS {
            return Err(McError::ResourceExhausted);
        } else {
            (len, Some(grp.block_cap * 2))
        };
        if let Some(cap) = grow_to {
            self.relocate_members(g, cap)?;
        }

        self.node_mut(h)?.binding = Binding::EcmpMember { group: g, slot };
        if let Err(e) = self.sync_nodes(&[h]) {
            self.node_mut(h)?.binding = Binding::Free;
            return Err(e);
        }
        let grp = self.ecmp_mut(g)?;
        if slot == grp.members.len() {
            grp.members.push(Some(h));
        } else {
            grp.members[slot] = Some(h);
        }
        grp.valid_map |= 1 << slot;
        self.stage_vectors(g)
    }

    /// Move the member blocks to runs of `cap` slots, copying every slot.
    fn relocate_members(&mut self, g: EcmpHandle, cap: u32) -> Result<()> {
        let mut fresh = Vec::new();
        let mut blocks = [RdmAddr::NULL; MAX_PIPES];
        for pipe in 0..self.cfg.pipes {
            match self.allocate(pipe, NodeClass::L1, 2, cap) {
                Ok(addr) => {
                    blocks[pipe] = addr;
                    fresh.push((pipe, addr));
                }
                Err(e) => {
                    self.release_fresh(fresh);
                    return Err(e);
                }
            }
        }
        let grp = self.ecmp(g)?.clone();
        for pipe in 0..self.cfg.pipes {
            if grp.blocks[pipe].is_null() {
                continue;
            }
            for slot in 0..grp.members.len() as u32 {
                let content = self.rdm.get(grp.blocks[pipe].offset(2 * slot));
                if content != RdmNode::Invalid {
                    self.write_node(blocks[pipe].offset(2 * slot), content)?;
                }
            }
        }
        let pipes = self.cfg.pipes;
        for (slot, member) in grp.members.iter().enumerate() {
            if let Some(h) = *member {
                let node = self.node_mut(h)?;
                for (pipe, base) in blocks.iter().enumerate().take(pipes) {
                    node.pipes[pipe].rdm_addr = base.offset(2 * slot as u32);
                }
            }
        }
        {
            let grp = self.ecmp_mut(g)?;
            grp.blocks = blocks;
            grp.block_cap = cap;
        }
        self.stage_vectors(g)?;
        for pipe in 0..self.cfg.pipes {
            if !grp.blocks[pipe].is_null() {
                self.alloc.enqueue_free(grp.blocks[pipe])?;
            }
        }
        log::debug!("dev {} ecmp group {} member block grown to {} slots", self.id, g.0, cap);
        Ok(())
    }

    /// Empty a member slot and clear its vector bit. The node keeps its
    /// chains until it is resynced.
    fn detach_member(&mut self, g: EcmpHandle, slot: usize) -> Result<L1Handle> {
        let grp = self.ecmp_mut(g)?;
        let member = grp.members.get_mut(slot).and_then(Option::take);
        check_invariant(
            ECMP_MEMBER_LOCATED,
            member.is_some(),
            "detaching an empty ecmp slot",
            Some(&format!("group {} slot {}", g.0, slot)),
        )?;
        let h = member.ok_or_else(|| McError::unexpected("empty ecmp slot"))?;
        grp.valid_map &= !(1 << slot);
        self.stage_vectors(g)?;
        self.node_mut(h)?.binding = Binding::Free;
        Ok(h)
    }

    /// Remove `h` from the group. Its slot becomes a hole.
    pub fn ecmp_mbr_rem(&mut self, g: EcmpHandle, h: L1Handle) -> Result<()> {
        self.node(h)?;
        let slot = self.ecmp(g)?.slot_of(h).ok_or(McError::NotFound)?;
        check_invariant(
            ECMP_MEMBER_LOCATED,
            self.node(h)?.binding == Binding::EcmpMember { group: g, slot },
            "member binding disagrees with its slot",
            Some(&format!("group {} slot {} node {}", g.0, slot, h.0)),
        )?;
        self.detach_member(g, slot)?;
        self.sync_nodes(&[h])
    }

    /// Make the membership exactly `wanted`. On failure every change is
    /// undone: added members are removed and removed members return to
    /// their slots with their chains untouched.
    pub fn ecmp_mbr_mod(&mut self, g: EcmpHandle, wanted: &[L1Handle]) -> Result<()> {
        let mut wanted = wanted.to_vec();
        wanted.sort();
        wanted.dedup();
        if wanted.len() > ECMP_MAX_MEMBERS {
            return Err(McError::invalid(format!("{} members exceed the group size", wanted.len())));
        }
        let grp = self.ecmp(g)?;
        let old_len = grp.members.len();
        let old_valid = grp.valid_map;
        let removed: Vec<(usize, L1Handle)> = grp
            .members
            .iter()
            .enumerate()
            .filter_map(|(slot, m)| m.map(|h| (slot, h)))
            .filter(|(_, h)| wanted.binary_search(h).is_err())
            .collect();
        let added: Vec<L1Handle> = wanted.iter().copied().filter(|&h| grp.slot_of(h).is_none()).collect();
        for &h in &added {
            if !self.node(h)?.binding.is_free() {
                return Err(McError::invalid(format!("node {} is already bound", h.0)));
            }
        }

        for &(slot, _) in &removed {
            self.detach_member(g, slot)?;
        }
        let mut done = Vec::new();
        for &h in &added {
            if let Err(e) = self.ecmp_mbr_add(g, h) {
                log::warn!("dev {} ecmp group {} modify failed, rolling back: {}", self.id, g.0, e);
                self.restore_members(g, &removed, &done, old_len)?;
                check_invariant(
                    ECMP_MEMBER_LOCATED,
                    self.ecmp(g)?.valid_map == old_valid,
                    "rollback did not restore the member map",
                    Some(&format!("group {}", g.0)),
                )?;
                return Err(e);
            }
            done.push(h);
        }
        let released: Vec<L1Handle> = removed.iter().map(|&(_, h)| h).collect();
        self.sync_nodes(&released)
    }

    fn restore_members(
        &mut self,
        g: EcmpHandle,
        removed: &[(usize, L1Handle)],
        added: &[L1Handle],
        old_len: usize,
    ) -> Result<()> {
        for &h in added.iter().rev() {
            self.ecmp_mbr_rem(g, h)?;
        }
        self.ecmp_mut(g)?.members.truncate(old_len);
        for &(slot, h) in removed {
            for pipe in 0..self.cfg.pipes {
                let addr = self.member_addr(g, slot, pipe)?;
                let (rid, head) = {
                    let node = self.node_mut(h)?;
                    node.pipes[pipe].rdm_addr = addr;
                    (node.rid, node.pipes[pipe].l2.head())
                };
                self.write_l1(addr, RdmAddr::NULL, head, rid, None)?;
            }
            self.node_mut(h)?.binding = Binding::EcmpMember { group: g, slot };
            let grp = self.ecmp_mut(g)?;
            grp.members[slot] = Some(h);
            grp.valid_map |= 1 << slot;
        }
        self.stage_vectors(g)
    }

    /// Associate the group to `mgid` through a new pointer node.
    pub fn ecmp_associate(&mut self, g: EcmpHandle, mgid: Mgid, xid: Option<u16>) -> Result<()> {
        let pointers = self.ecmp(g)?.pointers.clone();
        if !self.groups.contains_key(&mgid) {
            return Err(McError::NotFound);
        }
        for &p in &pointers {
            if self.node(p)?.binding.tree() == Some(mgid) {
                return Err(McError::AlreadyExists);
            }
        }
        let idx = self
            .nodes
            .insert_with(|i| {
                let mut n = L1Node::new(L1Handle(i as u32), ECMP_PTR_RID, PortMap::new(), LagSet::new());
                n.xid = xid;
                n.binding = Binding::EcmpPointer { group: g, mgid };
                n
            })
            .ok_or(McError::ResourceExhausted)?;
        let h = L1Handle(idx as u32);
        if let Err(e) = self.sync_nodes(&[h]) {
            self.nodes.remove(idx);
            return Err(e);
        }
        self.ecmp_mut(g)?.pointers.push(h);
        if let Some(info) = self.groups.get_mut(&mgid) {
            info.members.insert(h);
        }
        Ok(())
    }

    pub fn ecmp_dissociate(&mut self, g: EcmpHandle, mgid: Mgid) -> Result<()> {
        let pointers = self.ecmp(g)?.pointers.clone();
        let mut found = None;
        for &p in &pointers {
            if self.node(p)?.binding.tree() == Some(mgid) {
                found = Some(p);
            }
        }
        let h = found.ok_or(McError::NotFound)?;
        let binding = self.node(h)?.binding;
        self.node_mut(h)?.binding = Binding::Free;
        if let Err(e) = self.sync_nodes(&[h]) {
            self.node_mut(h)?.binding = binding;
            return Err(e);
        }
        self.ecmp_mut(g)?.pointers.retain(|&p| p != h);
        if let Some(info) = self.groups.get_mut(&mgid) {
            info.members.remove(&h);
        }
        self.nodes.remove(h.0 as usize);
        Ok(())
    }

    /// Read-only view of an ECMP group.
    pub fn ecmp_group(&self, g: EcmpHandle) -> Result<&EcmpGroup> {
        self.ecmp(g)
    }
}
