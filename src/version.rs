//! Versioned hitless update protocol.
//!
//! LIT, port forwarding state, the backup-port table and ECMP vectors exist
//! in two hardware copies. A mutation is written into the inactive copy,
//! the live version pointer is flipped, the pipeline is drained of packets
//! classified under the old copy, and only then is the old copy brought up
//! to date:
//!
//! ```text
//! Quiescent -> PendingVersion(!v) -> Switching -> Draining(v) -> PendingVersion(v) -> Quiescent
//! ```
//!
//! While a batch is open or the device is locked the flip is deferred; the
//! staged payload accumulates in the inactive copy and is switched once.

use std::collections::BTreeMap;

use crate::device::Device;
use crate::error::Result;
use crate::hw::HwWrite;
use crate::invariant::{check_invariant, VERSION_SWITCH_ORDER};
use crate::rdm::RdmNode;
use crate::types::{DevPort, LagId, PortMap, RdmAddr, Version, LAG_COUNT};

/// Protocol phase of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Quiescent,
    /// The given copy holds staged content not yet live.
    PendingVersion(Version),
    Switching,
    /// Waiting for packets of the given (old) version to leave the pipeline.
    Draining(Version),
}

/// One entry of a versioned payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Staged {
    Lit { lag: LagId, ports: PortMap },
    PortFwd { port: DevPort, forward: bool },
    /// `backup == port` clears protection.
    Bpt { port: DevPort, backup: DevPort },
    /// ECMP vector pair at `pair`; copy `i` lives at `pair + 2 * i`.
    EcmpVector { pair: RdmAddr, node: RdmNode },
}

/// Software shadow of one version's copy of the versioned tables.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedTables {
    pub lit: Vec<PortMap>,
    pub fwd: BTreeMap<DevPort, bool>,
    pub bpt: BTreeMap<DevPort, DevPort>,
}

impl Default for VersionedTables {
    fn default() -> Self {
        Self {
            lit: vec![PortMap::new(); LAG_COUNT],
            fwd: BTreeMap::new(),
            bpt: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct VersionSwitch {
    active: Version,
    phase: Phase,
    staged: Vec<Staged>,
    tables: [VersionedTables; 2],
    /// LAGs whose chains settle once the pending switch completes.
    after: Vec<LagId>,
    switches: u64,
}

impl VersionSwitch {
    pub fn new() -> Self {
        Self {
            active: Version::V0,
            phase: Phase::Quiescent,
            staged: Vec::new(),
            tables: [VersionedTables::default(), VersionedTables::default()],
            after: Vec::new(),
            switches: 0,
        }
    }

    pub fn active(&self) -> Version {
        self.active
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::PendingVersion(_))
    }

    pub fn tables(&self, ver: Version) -> &VersionedTables {
        &self.tables[ver.index()]
    }

    /// Completed flips since device creation.
    pub fn switches(&self) -> u64 {
        self.switches
    }
}

impl Default for VersionSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl Device {
    /// Stage `payload` into the inactive copy and, unless deferred, run the
    /// full switch.
    pub(crate) fn versioned_update(&mut self, payload: Vec<Staged>) -> Result<()> {
        if matches!(self.version.phase, Phase::Draining(_)) && !self.locked {
            self.complete_switch()?;
        }
        let inactive = self.version.active.other();
        let order_ok = match self.version.phase {
            Phase::Quiescent => true,
            Phase::PendingVersion(v) => v == inactive,
            _ => false,
        };
        check_invariant(
            VERSION_SWITCH_ORDER,
            order_ok,
            "versioned update staged during a switch",
            Some(&format!("{:?}", self.version.phase)),
        )?;
        for entry in &payload {
            self.apply_staged(inactive, entry)?;
        }
        self.version.staged.extend(payload);
        self.version.phase = Phase::PendingVersion(inactive);
        if self.locked || self.in_batch {
            return Ok(());
        }
        self.complete_switch()
    }

    /// Flip to the staged copy, drain, then bring the old copy up to date.
    /// No-op when nothing is pending.
    ///
    /// A transport failure leaves the device in a phase this function
    /// resumes from: `PendingVersion(next)` before the flip reached
    /// hardware, `Draining(old)` after it.
    pub(crate) fn complete_switch(&mut self) -> Result<()> {
        let old = match self.version.phase {
            Phase::PendingVersion(next) => self.flip(next)?,
            Phase::Draining(old) => {
                log::info!("dev {} resuming drain of {:?}", self.id, old);
                old
            }
            Phase::Quiescent | Phase::Switching => return Ok(()),
        };
        self.transport.wait_drain()?;

        self.version.phase = Phase::PendingVersion(old);
        let staged = self.version.staged.clone();
        for entry in &staged {
            if let Err(e) = self.apply_staged(old, entry) {
                self.version.phase = Phase::Draining(old);
                return Err(e);
            }
        }
        self.version.staged.clear();
        self.version.phase = Phase::Quiescent;
        self.version.switches += 1;
        self.settle_queue.append(&mut self.version.after);
        log::debug!(
            "dev {} table version switched to {:?} ({} staged entries)",
            self.id,
            self.version.active,
            staged.len()
        );
        // Rejected writes to the old copy stay queued ahead of any later
        // RDM change.
        self.flush()
    }

    /// Make `next` the live copy. Returns the previous one.
    fn flip(&mut self, next: Version) -> Result<Version> {
        check_invariant(
            VERSION_SWITCH_ORDER,
            next == self.version.active.other(),
            "pending copy is the live copy",
            Some(&format!("{:?}", next)),
        )?;
        // The staged copy must be in hardware before the flip.
        self.flush()?;

        self.version.phase = Phase::Switching;
        self.push_write(HwWrite::TableVersion { ver: next });
        if let Err(e) = self.flush() {
            // Only the flip is queued; the retry reissues it.
            self.discard_writes();
            self.version.phase = Phase::PendingVersion(next);
            log::warn!("dev {} version flip to {:?} failed, switch pending", self.id, next);
            return Err(e);
        }
        let old = self.version.active;
        self.version.active = next;
        self.version.phase = Phase::Draining(old);
        Ok(old)
    }

    /// Run `lag`'s chain settle once the current switch (if any) is done.
    pub(crate) fn after_switch(&mut self, lag: LagId) {
        if self.version.phase == Phase::Quiescent {
            self.settle_queue.push(lag);
        } else {
            self.version.after.push(lag);
        }
    }

    fn apply_staged(&mut self, ver: Version, entry: &Staged) -> Result<()> {
        let tables = &mut self.version.tables[ver.index()];
        match *entry {
            Staged::Lit { lag, ports } => {
                tables.lit[lag.0 as usize] = ports;
                self.push_write(HwWrite::Lit { ver, lag, ports });
            }
            Staged::PortFwd { port, forward } => {
                tables.fwd.insert(port, forward);
                self.push_write(HwWrite::PortFwd { ver, port, forward });
            }
            Staged::Bpt { port, backup } => {
                if backup == port {
                    tables.bpt.remove(&port);
                } else {
                    tables.bpt.insert(port, backup);
                }
                self.push_write(HwWrite::Bpt { ver, port, backup });
            }
            Staged::EcmpVector { pair, node } => {
                self.write_node(pair.offset(2 * ver.index() as u32), node)?;
            }
        }
        Ok(())
    }

    /// Hardware writes reproducing both copies of every versioned table.
    pub(crate) fn replay_versioned(&mut self) {
        for ver in [Version::V0, Version::V1] {
            let tables = self.version.tables[ver.index()].clone();
            for (i, ports) in tables.lit.iter().enumerate() {
                if !ports.is_empty() {
                    self.push_write(HwWrite::Lit { ver, lag: LagId(i as u8), ports: *ports });
                }
            }
            for (&port, &forward) in &tables.fwd {
                self.push_write(HwWrite::PortFwd { ver, port, forward });
            }
            for (&port, &backup) in &tables.bpt {
                self.push_write(HwWrite::Bpt { ver, port, backup });
            }
        }
        self.push_write(HwWrite::TableVersion { ver: self.version.active });
    }
}
