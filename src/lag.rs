//! LAG membership, backup ports and port forwarding state.
//!
//! A LAG reaches every pipe holding one of its members or one of those
//! members' backup ports. Chains of nodes using a LAG carry a LAG node in
//! exactly the pipes of the LAG's chain mask; the mask grows before the
//! hardware tables change and shrinks only after the switch has drained.

use std::collections::BTreeMap;

use crate::device::Device;
use crate::error::{McError, Result};
use crate::hw::HwWrite;
use crate::types::{DevPort, L1Handle, LagId, PipeMask, PortMap, LAG_COUNT};
use crate::version::Staged;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LagEntry {
    /// Current (software) membership.
    pub ports: PortMap,
    /// Pipes whose chains carry this LAG.
    pub chain_mask: PipeMask,
    /// Remote member counts (left, right).
    pub remote: (u16, u16),
}

#[derive(Debug, Clone)]
pub struct LagTable {
    entries: Vec<LagEntry>,
}

impl LagTable {
    pub fn new() -> Self {
        Self {
            entries: vec![LagEntry::default(); LAG_COUNT],
        }
    }

    pub fn get(&self, lag: LagId) -> &LagEntry {
        &self.entries[lag.0 as usize]
    }

    pub(crate) fn get_mut(&mut self, lag: LagId) -> &mut LagEntry {
        &mut self.entries[lag.0 as usize]
    }

    pub fn chain_mask(&self, lag: LagId) -> PipeMask {
        self.entries[lag.0 as usize].chain_mask
    }

    /// LAGs with `port` as a member.
    pub fn containing(&self, port: DevPort) -> Vec<LagId> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.ports.contains(port))
            .map(|(i, _)| LagId(i as u8))
            .collect()
    }
}

impl Default for LagTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Software view of the per-port tables.
#[derive(Debug, Clone, Default)]
pub struct PortTable {
    pub backup: BTreeMap<DevPort, DevPort>,
    pub fwd: BTreeMap<DevPort, bool>,
}

impl PortTable {
    pub fn backup_of(&self, port: DevPort) -> Option<DevPort> {
        self.backup.get(&port).copied()
    }

    /// Pipes a port set reaches, counting backup ports.
    pub fn reach(&self, ports: &PortMap) -> PipeMask {
        let mut mask = ports.pipes();
        for port in ports.iter() {
            if let Some(b) = self.backup_of(port) {
                mask.insert(b.pipe());
            }
        }
        mask
    }
}

impl Device {
    fn lag_users(&self, lags: &[LagId]) -> Vec<L1Handle> {
        self.nodes
            .iter()
            .filter(|(_, n)| lags.iter().any(|&l| n.uses_lag(l)))
            .map(|(_, n)| n.handle)
            .collect()
    }

    /// Replace LAG membership hitlessly.
    ///
    /// The LIT goes through two protocol runs: first the union of old and
    /// new membership, then the new membership alone. Chains gain the LAG
    /// in newly reached pipes before the first run and lose it in dropped
    /// pipes only after the second run's switch.
    pub fn lag_update(&mut self, lag: LagId, ports: &[DevPort]) -> Result<()> {
        self.check_ports(ports)?;
        let new = PortMap::from_ports(ports);
        let saved = *self.lags.get(lag);
        if saved.ports == new {
            return Ok(());
        }
        let union = saved.ports.union(&new);
        let grown = saved.chain_mask.union(self.ports.reach(&union));
        {
            let entry = self.lags.get_mut(lag);
            entry.ports = new;
            entry.chain_mask = grown;
        }
        let users = self.lag_users(&[lag]);
        if let Err(e) = self.sync_nodes(&users) {
            *self.lags.get_mut(lag) = saved;
            return Err(e);
        }
        self.versioned_update(vec![Staged::Lit { lag, ports: union }])?;
        self.versioned_update(vec![Staged::Lit { lag, ports: new }])?;
        self.after_switch(lag);
        log::debug!("dev {} lag {} membership updated ({} ports)", self.id, lag.0, new.len());
        Ok(())
    }

    /// Shrink a LAG's chain mask to its current reach and resync its users.
    pub(crate) fn settle_lag(&mut self, lag: LagId) -> Result<()> {
        let reach = self.ports.reach(&self.lags.get(lag).ports);
        if self.lags.chain_mask(lag) == reach {
            return Ok(());
        }
        self.lags.get_mut(lag).chain_mask = reach;
        let users = self.lag_users(&[lag]);
        self.sync_nodes(&users)
    }

    /// Run every settle made possible by completed switches.
    pub(crate) fn settle(&mut self) -> Result<()> {
        while !self.settle_queue.is_empty() {
            let lag = self.settle_queue.remove(0);
            self.settle_lag(lag)?;
        }
        Ok(())
    }

    pub fn lag_membership(&self, lag: LagId) -> PortMap {
        self.lags.get(lag).ports
    }

    /// Pipes whose chains currently carry `lag`.
    pub fn lag_chain_mask(&self, lag: LagId) -> PipeMask {
        self.lags.chain_mask(lag)
    }

    pub fn set_lag_remote_counts(&mut self, lag: LagId, left: u16, right: u16) -> Result<()> {
        self.lags.get_mut(lag).remote = (left, right);
        self.push_write(HwWrite::LitNp { lag, left, right });
        Ok(())
    }

    /// Protect `protected` with `backup`; `backup == protected` removes
    /// protection.
    ///
    /// Every chain touched by the change is planned and its nodes
    /// allocated before any live chain is modified, so exhaustion leaves
    /// the device unchanged. The backup-port table is programmed last.
    pub fn set_backup_port(&mut self, protected: DevPort, backup: DevPort) -> Result<()> {
        self.check_ports(&[protected, backup])?;
        let old = self.ports.backup_of(protected);
        let new = (backup != protected).then_some(backup);
        if old == new {
            return Ok(());
        }
        match new {
            Some(b) => self.ports.backup.insert(protected, b),
            None => self.ports.backup.remove(&protected),
        };

        let affected = self.lags.containing(protected);
        let saved: Vec<(LagId, PipeMask)> = affected.iter().map(|&l| (l, self.lags.chain_mask(l))).collect();
        for &lag in &affected {
            let reach = self.ports.reach(&self.lags.get(lag).ports);
            self.lags.get_mut(lag).chain_mask = reach;
        }
        let mut users = self.lag_users(&affected);
        users.extend(
            self.nodes
                .iter()
                .filter(|(_, n)| n.ports.contains(protected))
                .map(|(_, n)| n.handle),
        );
        users.sort();
        users.dedup();

        if let Err(e) = self.sync_nodes(&users) {
            match old {
                Some(b) => self.ports.backup.insert(protected, b),
                None => self.ports.backup.remove(&protected),
            };
            for (lag, mask) in saved {
                self.lags.get_mut(lag).chain_mask = mask;
            }
            return Err(e);
        }
        self.versioned_update(vec![Staged::Bpt { port: protected, backup }])?;
        log::debug!(
            "dev {} port {:#x} backup {:?} -> {:?} ({} nodes resynced)",
            self.id,
            protected.0,
            old.map(|p| p.0),
            new.map(|p| p.0),
            users.len()
        );
        Ok(())
    }

    /// Backup port of `port`, or `port` itself when unprotected.
    pub fn get_backup_port(&self, port: DevPort) -> Result<DevPort> {
        self.check_ports(&[port])?;
        Ok(self.ports.backup_of(port).unwrap_or(port))
    }

    pub fn set_port_fwd_state(&mut self, port: DevPort, forward: bool) -> Result<()> {
        self.check_ports(&[port])?;
        self.ports.fwd.insert(port, forward);
        self.versioned_update(vec![Staged::PortFwd { port, forward }])
    }

    /// Forwarding state of `port`; ports default to forwarding.
    pub fn get_port_fwd_state(&self, port: DevPort) -> Result<bool> {
        self.check_ports(&[port])?;
        Ok(self.ports.fwd.get(&port).copied().unwrap_or(true))
    }

    pub(crate) fn check_ports(&self, ports: &[DevPort]) -> Result<()> {
        for &p in ports {
            if p.pipe() >= self.cfg.pipes || p.local() >= crate::types::PORTS_PER_PIPE {
                return Err(McError::invalid(format!("port {:#x} out of range", p.0)));
            }
        }
        Ok(())
    }
}
