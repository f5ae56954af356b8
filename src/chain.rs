//! L2 membership chains: what a node's chain in a pipe must contain, and
//! how to get there from what is live.
//!
//! Every chain change is split in two. Planning computes the target chain
//! of each affected (node, pipe) and allocates every new RDM node up
//! front; if any allocation fails the whole plan is returned with
//! `mark_free` and nothing live was touched. Applying then writes new nodes
//! back to front, relinks, and only afterwards queues the replaced nodes
//! for deferred free, so a concurrent hardware walk always sees a complete
//! chain.

use crate::device::Device;
use crate::error::{McError, Result};
use crate::invariant::{check_invariant, CHAIN_LINKED};
use crate::lag::{LagTable, PortTable};
use crate::node::{Binding, L1Node, L2Chain, Placement, PortRun};
use crate::rdm::RdmNode;
use crate::types::{L1Handle, LagId, NodeClass, PipeId, PortMap, RdmAddr, PORTS_PER_PIPE};

const SEGMENT_PORTS: u32 = 18;

/// Desired content of one (node, pipe) chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainSpec {
    pub lags: Vec<LagId>,
    pub ports: Vec<RdmNode>,
}

impl ChainSpec {
    pub fn is_empty(&self) -> bool {
        self.lags.is_empty() && self.ports.is_empty()
    }

    /// Whether `chain` already holds exactly this content.
    fn matches(&self, chain: &L2Chain) -> bool {
        let ports_match = match &chain.ports {
            Some(run) => run.nodes == self.ports,
            None => self.ports.is_empty(),
        };
        ports_match
            && chain.lags.len() == self.lags.len()
            && chain.lags.iter().all(|(l, _)| self.lags.contains(l))
    }
}

/// Port nodes replicating to `ports` from pipe `pipe`.
///
/// Pipe `pipe` serves its own ports plus every port of another pipe whose
/// backup lives in `pipe`.
pub fn port_nodes(ports: &PortMap, backups: &PortTable, pipe: PipeId, pipes: usize) -> Vec<RdmNode> {
    let mut per_source: Vec<(PipeId, u128)> = Vec::new();
    for src in 0..pipes {
        let bits = if src == pipe {
            ports.pipe_bits(src)
        } else {
            ports
                .iter()
                .filter(|p| p.pipe() == src)
                .filter(|&p| backups.backup_of(p).is_some_and(|b| b.pipe() == pipe))
                .fold(0u128, |acc, p| acc | 1u128 << p.local())
        };
        if bits != 0 {
            per_source.push((src, bits));
        }
    }
    if let &[(src, bits)] = per_source.as_slice() {
        let lo = bits.trailing_zeros() / SEGMENT_PORTS;
        let hi = (127 - bits.leading_zeros()) / SEGMENT_PORTS;
        if lo == hi {
            return vec![RdmNode::L2Port18 {
                last: true,
                pipe: src as u8,
                index: lo as u8,
                ports: (bits >> (lo * SEGMENT_PORTS)) as u32,
            }];
        }
    }
    let count = per_source.len();
    per_source
        .into_iter()
        .enumerate()
        .map(|(i, (src, bits))| RdmNode::L2Port72 {
            last: i + 1 == count,
            pipe: src as u8,
            ports: bits & ((1u128 << PORTS_PER_PIPE) - 1),
        })
        .collect()
}

/// Chain content of `node` in `pipe`.
pub fn chain_spec(node: &L1Node, pipe: PipeId, pipes: usize, lags: &LagTable, backups: &PortTable) -> ChainSpec {
    match node.binding {
        Binding::Free | Binding::EcmpPointer { .. } => ChainSpec::default(),
        Binding::Group(_) | Binding::EcmpMember { .. } => ChainSpec {
            lags: node.lags.iter().filter(|&l| lags.chain_mask(l).contains(pipe)).collect(),
            ports: port_nodes(&node.ports, backups, pipe, pipes),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum L1Edit {
    /// Node stays placed; only its chain changes.
    Keep,
    /// Place the node at the given L1 address.
    Place(RdmAddr),
    /// Remove the node's placement.
    Unplace,
}

#[derive(Debug, Clone)]
pub(crate) struct ChainStep {
    node: L1Handle,
    pipe: PipeId,
    edit: L1Edit,
    chain: L2Chain,
    stale: Vec<RdmAddr>,
}

/// Pre-allocated chain edits for a set of nodes.
#[derive(Debug, Default)]
pub(crate) struct SyncPlan {
    steps: Vec<ChainStep>,
    fresh: Vec<(PipeId, RdmAddr)>,
}

impl Device {
    pub(crate) fn spec_for(&self, h: L1Handle, pipe: PipeId) -> Result<ChainSpec> {
        let node = self.node(h)?;
        Ok(chain_spec(node, pipe, self.cfg.pipes, &self.lags, &self.ports))
    }

    /// Bring the chains and placements of `handles` in line with their
    /// current membership and binding. On failure nothing live changed.
    pub(crate) fn sync_nodes(&mut self, handles: &[L1Handle]) -> Result<()> {
        let mut plan = SyncPlan::default();
        for &h in handles {
            if let Err(e) = self.plan_node(h, &mut plan) {
                self.rollback(plan);
                return Err(e);
            }
        }
        self.apply_plan(plan)
    }

    pub(crate) fn plan_node(&mut self, h: L1Handle, plan: &mut SyncPlan) -> Result<()> {
        for pipe in 0..self.cfg.pipes {
            let spec = self.spec_for(h, pipe)?;
            let node = self.node(h)?;
            let binding = node.binding;
            let current = node.pipes[pipe].clone();
            let want = match binding {
                Binding::Free => false,
                Binding::Group(_) => !spec.is_empty(),
                Binding::EcmpMember { .. } | Binding::EcmpPointer { .. } => true,
            };
            match (current.is_placed(), want) {
                (false, false) => {}
                (true, false) => plan.steps.push(ChainStep {
                    node: h,
                    pipe,
                    edit: L1Edit::Unplace,
                    chain: L2Chain::default(),
                    stale: Vec::new(),
                }),
                (false, true) => {
                    let addr = match binding {
                        Binding::EcmpMember { group, slot } => self.member_addr(group, slot, pipe)?,
                        _ => {
                            let addr = self.allocate(pipe, NodeClass::L1, 2, 1)?;
                            plan.fresh.push((pipe, addr));
                            addr
                        }
                    };
                    let (chain, _) = self.build_chain(pipe, &L2Chain::default(), &spec, &mut plan.fresh)?;
                    plan.steps.push(ChainStep {
                        node: h,
                        pipe,
                        edit: L1Edit::Place(addr),
                        chain,
                        stale: Vec::new(),
                    });
                }
                (true, true) => {
                    if spec.matches(&current.l2) {
                        continue;
                    }
                    let (chain, stale) = self.build_chain(pipe, &current.l2, &spec, &mut plan.fresh)?;
                    plan.steps.push(ChainStep {
                        node: h,
                        pipe,
                        edit: L1Edit::Keep,
                        chain,
                        stale,
                    });
                }
            }
        }
        Ok(())
    }

    /// Target chain reusing every unchanged piece of `current`. New LAG
    /// nodes go first.
    fn build_chain(
        &mut self,
        pipe: PipeId,
        current: &L2Chain,
        spec: &ChainSpec,
        fresh: &mut Vec<(PipeId, RdmAddr)>,
    ) -> Result<(L2Chain, Vec<RdmAddr>)> {
        let mut chain = L2Chain::default();
        let mut stale = Vec::new();
        for &lag in &spec.lags {
            if current.lags.iter().all(|&(l, _)| l != lag) {
                let addr = self.allocate(pipe, NodeClass::L2, 1, 1)?;
                fresh.push((pipe, addr));
                chain.lags.push((lag, addr));
            }
        }
        for &(lag, addr) in &current.lags {
            if spec.lags.contains(&lag) {
                chain.lags.push((lag, addr));
            } else {
                stale.push(addr);
            }
        }
        let unchanged = current.ports.as_ref().is_some_and(|r| r.nodes == spec.ports);
        if unchanged {
            chain.ports = current.ports.clone();
        } else {
            stale.extend(current.ports.as_ref().map(|r| r.addr));
            if !spec.ports.is_empty() {
                let width = spec.ports.iter().map(|n| n.width()).sum();
                let addr = self.allocate(pipe, NodeClass::L2, width, 1)?;
                fresh.push((pipe, addr));
                chain.ports = Some(PortRun {
                    addr,
                    nodes: spec.ports.clone(),
                });
            }
        }
        Ok((chain, stale))
    }

    /// Return every pre-allocated address of an abandoned plan.
    pub(crate) fn rollback(&mut self, plan: SyncPlan) {
        for (pipe, addr) in plan.fresh {
            if !self.alloc.mark_free(addr, pipe) {
                log::error!("dev {} rollback could not release {} on pipe {}", self.id, addr, pipe);
            }
        }
    }

    pub(crate) fn apply_plan(&mut self, plan: SyncPlan) -> Result<()> {
        for step in plan.steps {
            self.apply_step(step)?;
        }
        Ok(())
    }

    fn apply_step(&mut self, step: ChainStep) -> Result<()> {
        let ChainStep { node: h, pipe, edit, chain, stale } = step;
        let old = self.placement(h, pipe)?.clone();
        match edit {
            L1Edit::Unplace => {
                if let Some(mgid) = old.tree {
                    self.tree_unlink(h, pipe, mgid)?;
                }
                if old.owned {
                    self.alloc.enqueue_free(old.rdm_addr)?;
                }
                for addr in old.l2.addresses() {
                    self.alloc.enqueue_free(addr)?;
                }
                self.node_mut(h)?.pipes[pipe] = Placement::default();
            }
            L1Edit::Place(addr) => {
                self.write_chain(&L2Chain::default(), &chain)?;
                let node = self.node(h)?;
                let (binding, rid) = (node.binding, node.rid);
                match binding {
                    Binding::Group(mgid) | Binding::EcmpPointer { mgid, .. } => {
                        self.tree_link(h, pipe, mgid, addr, chain)?;
                    }
                    Binding::EcmpMember { .. } => {
                        self.write_l1(addr, RdmAddr::NULL, chain.head(), rid, None)?;
                        self.node_mut(h)?.pipes[pipe] = Placement {
                            rdm_addr: addr,
                            l2: chain,
                            ..Placement::default()
                        };
                    }
                    Binding::Free => {
                        return Err(McError::unexpected(format!("placing unbound node {}", h.0)));
                    }
                }
            }
            L1Edit::Keep => {
                self.write_chain(&old.l2, &chain)?;
                let current = self.rdm.get(old.rdm_addr);
                check_invariant(
                    CHAIN_LINKED,
                    current.is_l1() && current.next_l2() == Some(old.l2.head()),
                    "l1 node does not point at its recorded chain",
                    Some(&format!("node {} pipe {} at {}", h.0, pipe, old.rdm_addr)),
                )?;
                if chain.head() != old.l2.head() {
                    self.write_node(old.rdm_addr, current.with_next_l2(chain.head()))?;
                }
                log::debug!(
                    "dev {} node {} pipe {} chain spliced ({} nodes retired)",
                    self.id,
                    h.0,
                    pipe,
                    stale.len()
                );
                self.node_mut(h)?.pipes[pipe].l2 = chain;
                for addr in stale {
                    self.alloc.enqueue_free(addr)?;
                }
            }
        }
        Ok(())
    }

    /// Write the nodes of `new` not already live in `old`, tail first.
    fn write_chain(&mut self, old: &L2Chain, new: &L2Chain) -> Result<()> {
        if let Some(run) = &new.ports {
            if old.ports.as_ref().map(|r| r.addr) != Some(run.addr) {
                let mut addr = run.addr;
                for &node in &run.nodes {
                    self.write_node(addr, node)?;
                    addr = addr.offset(node.width());
                }
            }
        }
        let mut next = new.ports.as_ref().map_or(RdmAddr::NULL, |r| r.addr);
        for &(lag, addr) in new.lags.iter().rev() {
            let node = RdmNode::L2Lag { next_l2: next, lag_id: lag.0 };
            if self.rdm.get(addr) != node {
                self.write_node(addr, node)?;
            }
            next = addr;
        }
        Ok(())
    }

    /// L1 node content of `h` in `pipe`.
    pub(crate) fn l1_content(&self, h: L1Handle, pipe: PipeId, next_l1: RdmAddr, next_l2: RdmAddr) -> Result<RdmNode> {
        let node = self.node(h)?;
        let content = match node.binding {
            Binding::Group(_) => match node.xid {
                Some(xid) => RdmNode::L1Xid { next_l1, next_l2, rid: node.rid, xid },
                None => RdmNode::L1Rid { next_l1, next_l2, rid: node.rid },
            },
            Binding::EcmpMember { .. } => RdmNode::L1Rid { next_l1, next_l2, rid: node.rid },
            Binding::EcmpPointer { group, .. } => {
                let pair = self.ecmp(group)?.vectors[pipe];
                let (vector0, vector1) = (pair, pair.offset(2));
                match node.xid {
                    Some(xid) => RdmNode::L1EcmpPtrXid { next_l1, vector0, vector1, xid },
                    None => RdmNode::L1EcmpPtr { next_l1, vector0, vector1 },
                }
            }
            Binding::Free => return Err(McError::unexpected(format!("node {} is not bound", h.0))),
        };
        Ok(content)
    }
}
