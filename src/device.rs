//! Per-device replication context.
//!
//! A [`Device`] owns everything one ASIC needs: the RDM shadow and its
//! allocator, deferred-free epochs, the node/group/ECMP model, versioned
//! tables, and the transport its write list drains into. The manager
//! serialises access; nothing here locks.

use std::collections::BTreeMap;

use rtrb::Consumer;

use crate::alloc::{BlockAllocator, OwnerUsage};
use crate::arena::{Arena, IdPool};
use crate::codec::{NodeCodec, PackedCodec};
use crate::completion::{self, DmaEvent};
use crate::config::DeviceConfig;
use crate::ecmp::EcmpGroup;
use crate::epoch::EpochManager;
use crate::error::{McError, Result};
use crate::hw::{HwWrite, Transport, WriteList};
use crate::lag::{LagTable, PortTable};
use crate::node::{L1Node, Placement};
use crate::rdm::{Rdm, RdmNode};
use crate::tail::TailTable;
use crate::tree::MgidInfo;
use crate::types::{DevId, L1Handle, LagId, Mgid, NodeClass, PipeId, RdmAddr, Version};
use crate::version::{Phase, VersionSwitch};

pub struct Device {
    pub(crate) id: DevId,
    pub(crate) cfg: DeviceConfig,
    codec: Box<dyn NodeCodec>,
    pub(crate) transport: Box<dyn Transport>,
    completions: Consumer<DmaEvent>,
    pub(crate) rdm: Rdm,
    pub(crate) alloc: BlockAllocator,
    pub(crate) epochs: EpochManager,
    wrl: WriteList,
    pub(crate) nodes: Arena<L1Node>,
    pub(crate) ecmps: Arena<EcmpGroup>,
    pub(crate) ecmp_ids: IdPool,
    pub(crate) groups: BTreeMap<Mgid, MgidInfo>,
    pub(crate) tails: TailTable,
    pub(crate) lags: LagTable,
    pub(crate) ports: PortTable,
    pub(crate) version: VersionSwitch,
    pub(crate) settle_queue: Vec<LagId>,
    pub(crate) locked: bool,
    pub(crate) in_batch: bool,
    global_rid: u16,
    max_nodes: (u32, u32),
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("family", &self.codec.family())
            .field("nodes", &self.nodes.len())
            .field("groups", &self.groups.len())
            .field("locked", &self.locked)
            .finish()
    }
}

impl Device {
    /// Build a device and program its initial state (tail nodes, table
    /// version).
    pub fn new(
        id: DevId,
        cfg: DeviceConfig,
        transport: Box<dyn Transport>,
        completions: Consumer<DmaEvent>,
    ) -> Result<Self> {
        cfg.validate()?;
        let mut dev = Self {
            id,
            codec: Box::new(PackedCodec::new(cfg.family)),
            transport,
            completions,
            rdm: Rdm::new(cfg.rdm_entries),
            alloc: BlockAllocator::new(cfg.rdm_entries, cfg.block_entries),
            epochs: EpochManager::new(cfg.pipes),
            wrl: WriteList::new(),
            nodes: Arena::new(cfg.max_l1_nodes as usize),
            ecmps: Arena::new(cfg.max_ecmp_groups as usize),
            ecmp_ids: IdPool::new(cfg.max_ecmp_groups),
            groups: BTreeMap::new(),
            tails: TailTable::new(cfg.tail_buckets.clone()),
            lags: LagTable::new(),
            ports: PortTable::default(),
            version: VersionSwitch::new(),
            settle_queue: Vec::new(),
            locked: false,
            in_batch: false,
            global_rid: 0,
            max_nodes: (cfg.max_l1_nodes, cfg.rdm_entries),
            cfg,
        };
        dev.init_tails()?;
        dev.push_write(HwWrite::TableVersion { ver: Version::V0 });
        dev.flush()?;
        log::info!(
            "dev {} added: {:?}, {} pipes, {} rdm entries",
            id,
            dev.cfg.family,
            dev.cfg.pipes,
            dev.cfg.rdm_entries
        );
        Ok(dev)
    }

    pub fn id(&self) -> DevId {
        self.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.cfg
    }

    pub(crate) fn push_write(&mut self, write: HwWrite) {
        self.wrl.push(write);
    }

    /// Submit the pending write list. While locked the list is dropped;
    /// unlock replays the full shadow instead. A rejected list stays
    /// queued and goes out again with the next flush.
    pub(crate) fn flush(&mut self) -> Result<()> {
        if self.locked {
            self.wrl.clear();
            return Ok(());
        }
        if self.wrl.is_empty() {
            return Ok(());
        }
        let writes = self.wrl.take();
        if let Err(e) = self.transport.submit(writes.clone()) {
            log::error!(
                "dev {} write list of {} entries rejected, kept for retry: {}",
                self.id,
                writes.len(),
                e
            );
            self.transport.abort();
            self.wrl.restore(writes);
            return Err(e);
        }
        Ok(())
    }

    /// Drop queued writes without submitting them.
    pub(crate) fn discard_writes(&mut self) {
        self.wrl.clear();
    }

    /// Store `node` at `addr` in the shadow and queue its hardware write.
    pub(crate) fn write_node(&mut self, addr: RdmAddr, node: RdmNode) -> Result<()> {
        self.rdm.set(addr, node)?;
        let bits = self.codec.encode(&node);
        self.push_write(HwWrite::Rdm { addr, width: node.width(), bits });
        Ok(())
    }

    pub fn write_l1(
        &mut self,
        addr: RdmAddr,
        next_l1: RdmAddr,
        next_l2: RdmAddr,
        rid: u16,
        xid: Option<u16>,
    ) -> Result<()> {
        let node = match xid {
            Some(xid) => RdmNode::L1Xid { next_l1, next_l2, rid, xid },
            None => RdmNode::L1Rid { next_l1, next_l2, rid },
        };
        self.write_node(addr, node)
    }

    pub fn write_l1_end(&mut self, addr: RdmAddr, next_l2: RdmAddr, rid: u16) -> Result<()> {
        self.write_node(addr, RdmNode::L1End { next_l2, rid })
    }

    pub fn write_ecmp_ptr(
        &mut self,
        addr: RdmAddr,
        next_l1: RdmAddr,
        vector0: RdmAddr,
        vector1: RdmAddr,
        xid: Option<u16>,
    ) -> Result<()> {
        let node = match xid {
            Some(xid) => RdmNode::L1EcmpPtrXid { next_l1, vector0, vector1, xid },
            None => RdmNode::L1EcmpPtr { next_l1, vector0, vector1 },
        };
        self.write_node(addr, node)
    }

    /// Invalidate a released run in the shadow and in hardware.
    fn invalidate(&mut self, addr: RdmAddr, len: u32) {
        for (a, width) in self.rdm.clear_range(addr, len) {
            self.push_write(HwWrite::Rdm { addr: a, width, bits: 0 });
        }
    }

    /// Allocate RDM, running garbage collection before giving up.
    pub(crate) fn allocate(&mut self, pipe: PipeId, class: NodeClass, width: u32, count: u32) -> Result<RdmAddr> {
        if let Some(addr) = self.alloc.allocate(pipe, class, width, count) {
            return Ok(addr);
        }
        for pass in 1..=self.cfg.gc_passes {
            log::warn!(
                "dev {} rdm exhausted for pipe {} {:?} ({} entries), gc pass {}",
                self.id,
                pipe,
                class,
                width * count,
                pass
            );
            self.collect_garbage()?;
            if let Some(addr) = self.alloc.allocate(pipe, class, width, count) {
                return Ok(addr);
            }
        }
        Err(McError::ResourceExhausted)
    }

    /// Reclaim deferred frees: push pending writes, finish any pending
    /// version switch, start epochs and service whatever completed.
    pub fn collect_garbage(&mut self) -> Result<()> {
        self.flush()?;
        if !self.locked {
            self.complete_switch()?;
        }
        self.kick_epochs()?;
        self.transport.await_completion()?;
        self.service_completions()?;
        Ok(())
    }

    fn can_start_epochs(&self) -> bool {
        !self.locked && self.version.phase() == Phase::Quiescent
    }

    /// Start an epoch on every pipe with queued work.
    pub(crate) fn kick_epochs(&mut self) -> Result<()> {
        if !self.can_start_epochs() {
            return Ok(());
        }
        for pipe in 0..self.cfg.pipes {
            if self.epochs.start(pipe, &mut self.alloc)? {
                self.push_write(HwWrite::RdmChange { pipe });
            }
        }
        self.flush()
    }

    /// Hardware finished the RDM-change cycle on `pipe`.
    pub fn epoch_complete(&mut self, pipe: PipeId, restartable: bool) -> Result<()> {
        if pipe >= self.cfg.pipes {
            return Err(McError::invalid(format!("pipe {}", pipe)));
        }
        let done = self.epochs.complete(pipe, &mut self.alloc)?;
        for (addr, len) in done.released {
            self.invalidate(addr, len);
        }
        for mgid in done.tails {
            self.apply_tail(pipe, mgid)?;
        }
        if restartable && self.can_start_epochs() && self.epochs.start(pipe, &mut self.alloc)? {
            self.push_write(HwWrite::RdmChange { pipe });
        }
        self.flush()
    }

    /// Drain the completion queue. Returns the number of events handled.
    pub fn service_completions(&mut self) -> Result<usize> {
        let mut handled = 0;
        loop {
            let events = completion::drain(&mut self.completions);
            if events.is_empty() {
                return Ok(handled);
            }
            for ev in events {
                match ev {
                    DmaEvent::RdmChangeDone { pipe, restartable } => self.epoch_complete(pipe, restartable)?,
                }
                handled += 1;
            }
        }
    }

    /// Tail of every public operation outside a batch. Also retries a
    /// version switch an earlier transport failure interrupted.
    pub(crate) fn finish_op(&mut self) -> Result<()> {
        if !self.in_batch && !self.locked {
            self.complete_switch()?;
        }
        self.settle()?;
        self.flush()?;
        if !self.in_batch {
            self.kick_epochs()?;
            self.service_completions()?;
        }
        Ok(())
    }

    pub(crate) fn begin_batch(&mut self) {
        self.in_batch = true;
    }

    /// One flush, one version switch, then epochs.
    pub(crate) fn commit_batch(&mut self) -> Result<()> {
        self.in_batch = false;
        self.flush()?;
        if !self.locked {
            self.complete_switch()?;
        }
        self.finish_op()?;
        log::info!("dev {} batch committed", self.id);
        Ok(())
    }

    /// Stop hardware writes (warm init / fast reconfiguration).
    pub fn lock(&mut self) -> Result<()> {
        self.flush()?;
        self.locked = true;
        log::info!("dev {} locked", self.id);
        Ok(())
    }

    /// Replay the full shadow, finish any deferred switch and restart
    /// epochs.
    pub fn unlock(&mut self) -> Result<()> {
        if !self.locked {
            return Ok(());
        }
        self.locked = false;
        self.replay();
        self.flush()?;
        if !self.in_batch {
            self.complete_switch()?;
        }
        log::info!("dev {} unlocked, shadow replayed", self.id);
        self.finish_op()
    }

    fn replay(&mut self) {
        let live: Vec<(RdmAddr, RdmNode)> = self.rdm.iter_live().collect();
        for (addr, node) in live {
            let bits = self.codec.encode(&node);
            self.push_write(HwWrite::Rdm { addr, width: node.width(), bits });
        }
        let mut heads = Vec::new();
        for (&mgid, info) in &self.groups {
            for pipe in 0..self.cfg.pipes {
                let head = info.trees[pipe]
                    .head
                    .and_then(|h| self.nodes.get(h.0 as usize))
                    .map_or(RdmAddr::NULL, |n| n.pipes[pipe].rdm_addr);
                heads.push(HwWrite::Mit { pipe, mgid, head });
            }
            heads.push(HwWrite::Pvt { mgid, pipes: info.pvt });
        }
        for write in heads {
            self.push_write(write);
        }
        self.replay_versioned();
        for i in 0..crate::types::LAG_COUNT {
            let lag = LagId(i as u8);
            let (left, right) = self.lags.get(lag).remote;
            if (left, right) != (0, 0) {
                self.push_write(HwWrite::LitNp { lag, left, right });
            }
        }
        self.push_write(HwWrite::GlobalRid { rid: self.global_rid });
        let (l1, l2) = self.max_nodes;
        self.push_write(HwWrite::MaxNodes { l1, l2 });
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_global_exclusion_rid(&mut self, rid: u16) -> Result<()> {
        self.global_rid = rid;
        self.push_write(HwWrite::GlobalRid { rid });
        Ok(())
    }

    pub fn global_exclusion_rid(&self) -> u16 {
        self.global_rid
    }

    /// Thresholds the replication engine applies to one tree walk.
    pub fn set_max_node_threshold(&mut self, l1: u32, l2: u32) -> Result<()> {
        if l1 == 0 || l2 == 0 {
            return Err(McError::invalid("node thresholds must be non-zero"));
        }
        self.max_nodes = (l1, l2);
        self.push_write(HwWrite::MaxNodes { l1, l2 });
        Ok(())
    }

    pub fn max_node_threshold(&self) -> (u32, u32) {
        self.max_nodes
    }

    pub(crate) fn node(&self, h: L1Handle) -> Result<&L1Node> {
        self.nodes
            .get(h.0 as usize)
            .ok_or_else(|| McError::invalid(format!("unknown l1 node {}", h.0)))
    }

    pub(crate) fn node_mut(&mut self, h: L1Handle) -> Result<&mut L1Node> {
        self.nodes
            .get_mut(h.0 as usize)
            .ok_or_else(|| McError::invalid(format!("unknown l1 node {}", h.0)))
    }

    pub(crate) fn placement(&self, h: L1Handle, pipe: PipeId) -> Result<&Placement> {
        Ok(&self.node(h)?.pipes[pipe])
    }

    /// Read-only view of an L1 node.
    pub fn l1_node(&self, h: L1Handle) -> Result<&L1Node> {
        self.node(h)
    }

    /// Decoded shadow content at `addr`.
    pub fn read_rdm(&self, addr: RdmAddr) -> RdmNode {
        self.rdm.get(addr)
    }

    pub fn rdm_usage(&self, pipe: PipeId, class: NodeClass) -> OwnerUsage {
        self.alloc.usage(pipe, class)
    }

    pub fn free_blocks(&self) -> usize {
        self.alloc.free_blocks()
    }

    pub fn active_version(&self) -> Version {
        self.version.active()
    }

    pub fn phase(&self) -> Phase {
        self.version.phase()
    }

    /// Versioned table shadow of one copy.
    pub fn versioned_tables(&self, ver: Version) -> &crate::version::VersionedTables {
        self.version.tables(ver)
    }

    /// (started, completed) epochs of `pipe`.
    pub fn epoch_counts(&self, pipe: PipeId) -> (u64, u64) {
        self.epochs.counts(pipe)
    }

    pub fn tails(&self) -> &TailTable {
        &self.tails
    }

    /// Full consistency check of allocator ownership.
    pub fn check_allocator(&self) -> Result<()> {
        self.alloc.check_ownership()
    }
}
