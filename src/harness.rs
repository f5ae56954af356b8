//! Simulated hardware for tests and benches.
//!
//! [`SimHw`] applies every submitted write to a shared model of the
//! replication tables and answers RDM-change instructions through the
//! device's completion queue, either at once or when the test releases
//! them. Every drain wait records a snapshot of the versioned tables so a
//! test can inspect the midpoint of a hitless update.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use rtrb::{Consumer, Producer};

use crate::completion::{new_completion_queue, DmaEvent};
use crate::config::{ChipFamily, DeviceConfig};
use crate::error::{McError, Result};
use crate::hw::{HwWrite, Transport};
use crate::mgr::McMgr;
use crate::types::{DevPort, LagId, Mgid, PipeId, PipeMask, PortMap, RdmAddr, Version};

/// Versioned tables as hardware held them when a drain began.
#[derive(Debug, Clone, PartialEq)]
pub struct DrainSnapshot {
    pub active: Version,
    /// LIT copies, indexed by version.
    pub lit: [BTreeMap<LagId, PortMap>; 2],
    pub bpt: [BTreeMap<DevPort, DevPort>; 2],
}

#[derive(Debug, Default)]
pub struct SimState {
    pub rdm: BTreeMap<RdmAddr, (u32, u128)>,
    pub mit: BTreeMap<(PipeId, Mgid), RdmAddr>,
    pub pvt: BTreeMap<Mgid, PipeMask>,
    pub lit: [BTreeMap<LagId, PortMap>; 2],
    pub lit_np: BTreeMap<LagId, (u16, u16)>,
    pub port_fwd: [BTreeMap<DevPort, bool>; 2],
    pub bpt: [BTreeMap<DevPort, DevPort>; 2],
    pub active: Option<Version>,
    pub global_rid: u16,
    pub max_nodes: (u32, u32),
    /// RDM-change instructions issued per pipe.
    pub rdm_changes: BTreeMap<PipeId, u64>,
    /// Completions held back in manual mode.
    pub held: Vec<PipeId>,
    pub drains: Vec<DrainSnapshot>,
    pub submits: u64,
    pub writes: u64,
    /// Reject the next submit with a transport error.
    pub fail_next_submit: bool,
    /// Reject the next submit that carries a table version flip.
    pub fail_next_flip: bool,
    /// Fail the next drain wait.
    pub fail_next_drain: bool,
}

impl SimState {
    fn apply(&mut self, write: &HwWrite) {
        match *write {
            HwWrite::Rdm { addr, width, bits } => {
                if bits == 0 {
                    self.rdm.remove(&addr);
                } else {
                    self.rdm.insert(addr, (width, bits));
                }
            }
            HwWrite::RdmChange { pipe } => {
                *self.rdm_changes.entry(pipe).or_default() += 1;
            }
            HwWrite::Mit { pipe, mgid, head } => {
                self.mit.insert((pipe, mgid), head);
            }
            HwWrite::Pvt { mgid, pipes } => {
                self.pvt.insert(mgid, pipes);
            }
            HwWrite::Lit { ver, lag, ports } => {
                self.lit[ver.index()].insert(lag, ports);
            }
            HwWrite::LitNp { lag, left, right } => {
                self.lit_np.insert(lag, (left, right));
            }
            HwWrite::PortFwd { ver, port, forward } => {
                self.port_fwd[ver.index()].insert(port, forward);
            }
            HwWrite::Bpt { ver, port, backup } => {
                if backup == port {
                    self.bpt[ver.index()].remove(&port);
                } else {
                    self.bpt[ver.index()].insert(port, backup);
                }
            }
            HwWrite::TableVersion { ver } => self.active = Some(ver),
            HwWrite::GlobalRid { rid } => self.global_rid = rid,
            HwWrite::MaxNodes { l1, l2 } => self.max_nodes = (l1, l2),
        }
    }

    /// LIT entry of `lag` in the live version.
    pub fn active_lit(&self, lag: LagId) -> PortMap {
        let ver = self.active.unwrap_or(Version::V0);
        self.lit[ver.index()].get(&lag).copied().unwrap_or_default()
    }
}

/// Transport over a shared simulated device.
#[derive(Clone)]
pub struct SimHw {
    state: Arc<Mutex<SimState>>,
    completions: Arc<Mutex<Producer<DmaEvent>>>,
    auto_complete: Arc<Mutex<bool>>,
}

impl SimHw {
    /// A transport and the completion consumer to hand to the device.
    pub fn new() -> (SimHw, Consumer<DmaEvent>) {
        let (tx, rx) = new_completion_queue();
        let hw = SimHw {
            state: Arc::new(Mutex::new(SimState::default())),
            completions: Arc::new(Mutex::new(tx)),
            auto_complete: Arc::new(Mutex::new(true)),
        };
        (hw, rx)
    }

    pub fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// With auto-completion off, RDM-change instructions are held until
    /// [`SimHw::release_completions`].
    pub fn set_auto_complete(&self, on: bool) {
        *self.auto_complete.lock().unwrap_or_else(|e| e.into_inner()) = on;
    }

    /// Report every held RDM-change as complete. Returns how many.
    pub fn release_completions(&self) -> usize {
        self.release_completions_as(true)
    }

    /// Like [`SimHw::release_completions`], with an explicit restart flag
    /// on every reported event.
    pub fn release_completions_as(&self, restartable: bool) -> usize {
        let held = std::mem::take(&mut self.state().held);
        for &pipe in &held {
            self.complete(pipe, restartable);
        }
        held.len()
    }

    fn complete(&self, pipe: PipeId, restartable: bool) {
        let mut tx = self.completions.lock().unwrap_or_else(|e| e.into_inner());
        if tx.push(DmaEvent::RdmChangeDone { pipe, restartable }).is_err() {
            log::error!("simulated completion queue full, pipe {} dropped", pipe);
        }
    }
}

impl std::fmt::Debug for SimHw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimHw").field("writes", &self.state().writes).finish()
    }
}

impl Transport for SimHw {
    fn submit(&mut self, writes: Vec<HwWrite>) -> Result<()> {
        let auto = *self.auto_complete.lock().unwrap_or_else(|e| e.into_inner());
        let mut finished = Vec::new();
        {
            let mut state = self.state();
            if std::mem::take(&mut state.fail_next_submit) {
                return Err(McError::Transport("simulated submit failure".into()));
            }
            let flips = writes.iter().any(|w| matches!(w, HwWrite::TableVersion { .. }));
            if flips && std::mem::take(&mut state.fail_next_flip) {
                return Err(McError::Transport("simulated version flip failure".into()));
            }
            state.submits += 1;
            state.writes += writes.len() as u64;
            for write in &writes {
                state.apply(write);
                if let HwWrite::RdmChange { pipe } = *write {
                    if auto {
                        finished.push(pipe);
                    } else {
                        state.held.push(pipe);
                    }
                }
            }
        }
        for pipe in finished {
            self.complete(pipe, true);
        }
        Ok(())
    }

    fn await_completion(&mut self) -> Result<()> {
        Ok(())
    }

    fn abort(&mut self) {
        log::warn!("simulated session aborted");
    }

    fn wait_drain(&mut self) -> Result<()> {
        let mut state = self.state();
        if std::mem::take(&mut state.fail_next_drain) {
            return Err(McError::Transport("simulated drain timeout".into()));
        }
        let snapshot = DrainSnapshot {
            active: state.active.unwrap_or(Version::V0),
            lit: state.lit.clone(),
            bpt: state.bpt.clone(),
        };
        state.drains.push(snapshot);
        Ok(())
    }
}

/// Small Tofino configuration used across tests: 4 pipes, 4096 entries in
/// 64-entry blocks.
pub fn test_config() -> DeviceConfig {
    DeviceConfig::for_family(ChipFamily::Tofino)
        .with_rdm(4096, 64)
        .with_max_l1_nodes(1024)
        .with_max_ecmp_groups(64)
}

/// Manager with device 0 on simulated hardware.
pub fn sim_mgr(cfg: DeviceConfig) -> Result<(McMgr, SimHw)> {
    let mgr = McMgr::new();
    let (hw, rx) = SimHw::new();
    mgr.add_device(0, cfg, Box::new(hw.clone()), rx)?;
    Ok((mgr, hw))
}
