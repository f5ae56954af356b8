//! Hardware write descriptors and the session/DMA transport seam.

use crate::error::Result;
use crate::types::{DevPort, LagId, Mgid, PipeId, PipeMask, PortMap, RdmAddr, Version};

/// One hardware write. A device accumulates these in a [`WriteList`] and
/// hands the list to its [`Transport`] in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwWrite {
    /// Encoded RDM node; `bits == 0` invalidates the slot.
    Rdm { addr: RdmAddr, width: u32, bits: u128 },
    /// Begin an RDM-change cycle on a pipe. Completion is reported back as
    /// [`crate::completion::DmaEvent::RdmChangeDone`].
    RdmChange { pipe: PipeId },
    /// Head of the (pipe, group) tree.
    Mit { pipe: PipeId, mgid: Mgid, head: RdmAddr },
    /// Pipes a group's traffic is replicated in.
    Pvt { mgid: Mgid, pipes: PipeMask },
    /// LAG membership, one copy per table version.
    Lit { ver: Version, lag: LagId, ports: PortMap },
    /// Remote LAG member counts.
    LitNp { lag: LagId, left: u16, right: u16 },
    /// Port forwarding state, one copy per table version.
    PortFwd { ver: Version, port: DevPort, forward: bool },
    /// Backup port table, one copy per table version.
    Bpt { ver: Version, port: DevPort, backup: DevPort },
    /// Live table version pointer.
    TableVersion { ver: Version },
    GlobalRid { rid: u16 },
    MaxNodes { l1: u32, l2: u32 },
}

/// Session/DMA transport of one device.
pub trait Transport: Send {
    /// Push a write list to hardware, in order.
    fn submit(&mut self, writes: Vec<HwWrite>) -> Result<()>;

    /// Block until previously submitted DMA has been processed.
    fn await_completion(&mut self) -> Result<()>;

    /// Drop anything still queued in the session.
    fn abort(&mut self);

    /// Wait until packets classified under the previous table version have
    /// left the pipeline.
    fn wait_drain(&mut self) -> Result<()>;
}

/// Ordered list of pending hardware writes.
#[derive(Debug, Default)]
pub struct WriteList {
    writes: Vec<HwWrite>,
}

impl WriteList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: HwWrite) {
        self.writes.push(write);
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn take(&mut self) -> Vec<HwWrite> {
        std::mem::take(&mut self.writes)
    }

    /// Drop every pending write.
    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Put back writes the transport rejected, ahead of anything queued
    /// since.
    pub fn restore(&mut self, mut writes: Vec<HwWrite>) {
        writes.append(&mut self.writes);
        self.writes = writes;
    }
}
