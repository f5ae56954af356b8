//! Public entry points.
//!
//! [`McMgr`] serialises every call behind one session lock. Each call runs
//! against a single [`Device`], then flushes its write list, starts any
//! RDM-change epochs and services completions. A [`Batch`] holds the lock
//! across many calls and defers version switches and epochs to its commit.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use rtrb::Consumer;

use crate::completion::DmaEvent;
use crate::config::DeviceConfig;
use crate::device::Device;
use crate::error::{McError, Result};
use crate::hw::Transport;
use crate::types::{DevId, DevPort, EcmpHandle, L1Handle, LagId, Mgid, PipeId, PipeMask};

#[derive(Debug, Default)]
struct Session {
    devices: BTreeMap<DevId, Device>,
}

impl Session {
    fn device(&mut self, dev: DevId) -> Result<&mut Device> {
        self.devices
            .get_mut(&dev)
            .ok_or_else(|| McError::invalid(format!("unknown device {}", dev)))
    }
}

/// Multicast replication manager.
#[derive(Debug, Default)]
pub struct McMgr {
    session: Mutex<Session>,
}

impl McMgr {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add_device(
        &self,
        dev: DevId,
        cfg: DeviceConfig,
        transport: Box<dyn Transport>,
        completions: Consumer<DmaEvent>,
    ) -> Result<()> {
        let mut session = self.lock();
        if session.devices.contains_key(&dev) {
            return Err(McError::AlreadyExists);
        }
        let device = Device::new(dev, cfg, transport, completions)?;
        session.devices.insert(dev, device);
        Ok(())
    }

    pub fn remove_device(&self, dev: DevId) -> Result<()> {
        let mut session = self.lock();
        session.devices.remove(&dev).ok_or(McError::NotFound)?;
        log::info!("dev {} removed", dev);
        Ok(())
    }

    /// Run `f` against one device, then finish the operation (flush, start
    /// epochs, service completions).
    pub fn with_device<T>(&self, dev: DevId, f: impl FnOnce(&mut Device) -> Result<T>) -> Result<T> {
        let mut session = self.lock();
        let device = session.device(dev)?;
        let out = f(device);
        let finished = device.finish_op();
        match (out, finished) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(fin)) => {
                log::error!("dev {} cleanup after failed call also failed: {}", dev, fin);
                Err(e)
            }
        }
    }

    /// Read-only access to one device.
    pub fn inspect<T>(&self, dev: DevId, f: impl FnOnce(&Device) -> T) -> Result<T> {
        let mut session = self.lock();
        Ok(f(session.device(dev)?))
    }

    pub fn create_group(&self, dev: DevId, mgid: Mgid) -> Result<()> {
        self.with_device(dev, |d| d.create_group(mgid))
    }

    pub fn destroy_group(&self, dev: DevId, mgid: Mgid) -> Result<()> {
        self.with_device(dev, |d| d.destroy_group(mgid))
    }

    pub fn create_l1_node(&self, dev: DevId, rid: u16, ports: &[DevPort], lags: &[LagId]) -> Result<L1Handle> {
        self.with_device(dev, |d| d.create_l1_node(rid, ports, lags))
    }

    pub fn destroy_l1_node(&self, dev: DevId, node: L1Handle) -> Result<()> {
        self.with_device(dev, |d| d.destroy_l1_node(node))
    }

    pub fn associate(&self, dev: DevId, node: L1Handle, mgid: Mgid, xid: Option<u16>) -> Result<()> {
        self.with_device(dev, |d| d.associate(node, mgid, xid))
    }

    pub fn dissociate(&self, dev: DevId, node: L1Handle, mgid: Mgid) -> Result<()> {
        self.with_device(dev, |d| d.dissociate(node, mgid))
    }

    pub fn node_update(&self, dev: DevId, node: L1Handle, ports: &[DevPort], lags: &[LagId]) -> Result<()> {
        self.with_device(dev, |d| d.node_update(node, ports, lags))
    }

    pub fn split(&self, dev: DevId, node: L1Handle, mask: PipeMask) -> Result<Option<L1Handle>> {
        self.with_device(dev, |d| d.split(node, mask))
    }

    pub fn create_ecmp_group(&self, dev: DevId) -> Result<EcmpHandle> {
        self.with_device(dev, |d| d.create_ecmp_group())
    }

    pub fn destroy_ecmp_group(&self, dev: DevId, group: EcmpHandle) -> Result<()> {
        self.with_device(dev, |d| d.destroy_ecmp_group(group))
    }

    pub fn ecmp_mbr_add(&self, dev: DevId, group: EcmpHandle, node: L1Handle) -> Result<()> {
        self.with_device(dev, |d| d.ecmp_mbr_add(group, node))
    }

    pub fn ecmp_mbr_rem(&self, dev: DevId, group: EcmpHandle, node: L1Handle) -> Result<()> {
        self.with_device(dev, |d| d.ecmp_mbr_rem(group, node))
    }

    pub fn ecmp_mbr_mod(&self, dev: DevId, group: EcmpHandle, members: &[L1Handle]) -> Result<()> {
        self.with_device(dev, |d| d.ecmp_mbr_mod(group, members))
    }

    pub fn ecmp_associate(&self, dev: DevId, group: EcmpHandle, mgid: Mgid, xid: Option<u16>) -> Result<()> {
        self.with_device(dev, |d| d.ecmp_associate(group, mgid, xid))
    }

    pub fn ecmp_dissociate(&self, dev: DevId, group: EcmpHandle, mgid: Mgid) -> Result<()> {
        self.with_device(dev, |d| d.ecmp_dissociate(group, mgid))
    }

    pub fn set_lag_membership(&self, dev: DevId, lag: LagId, ports: &[DevPort]) -> Result<()> {
        self.with_device(dev, |d| d.lag_update(lag, ports))
    }

    pub fn set_lag_remote_counts(&self, dev: DevId, lag: LagId, left: u16, right: u16) -> Result<()> {
        self.with_device(dev, |d| d.set_lag_remote_counts(lag, left, right))
    }

    pub fn set_backup_port(&self, dev: DevId, protected: DevPort, backup: DevPort) -> Result<()> {
        self.with_device(dev, |d| d.set_backup_port(protected, backup))
    }

    pub fn get_backup_port(&self, dev: DevId, port: DevPort) -> Result<DevPort> {
        self.inspect(dev, |d| d.get_backup_port(port))?
    }

    pub fn set_port_fwd_state(&self, dev: DevId, port: DevPort, forward: bool) -> Result<()> {
        self.with_device(dev, |d| d.set_port_fwd_state(port, forward))
    }

    pub fn get_port_fwd_state(&self, dev: DevId, port: DevPort) -> Result<bool> {
        self.inspect(dev, |d| d.get_port_fwd_state(port))?
    }

    pub fn set_global_exclusion_rid(&self, dev: DevId, rid: u16) -> Result<()> {
        self.with_device(dev, |d| d.set_global_exclusion_rid(rid))
    }

    pub fn set_max_node_threshold(&self, dev: DevId, l1: u32, l2: u32) -> Result<()> {
        self.with_device(dev, |d| d.set_max_node_threshold(l1, l2))
    }

    pub fn lock_device(&self, dev: DevId) -> Result<()> {
        self.with_device(dev, |d| d.lock())
    }

    pub fn unlock_device(&self, dev: DevId) -> Result<()> {
        self.with_device(dev, |d| d.unlock())
    }

    /// Completion callback of an RDM-change cycle, for DMA contexts that
    /// call in directly instead of using the completion queue.
    pub fn rdm_change_done(&self, dev: DevId, pipe: PipeId, restartable: bool) -> Result<()> {
        self.with_device(dev, |d| d.epoch_complete(pipe, restartable))
    }

    /// Drain queued DMA completions of every device.
    pub fn service_completions(&self) -> Result<usize> {
        let mut session = self.lock();
        let mut handled = 0;
        for device in session.devices.values_mut() {
            handled += device.service_completions()?;
            device.finish_op()?;
        }
        Ok(handled)
    }

    pub fn collect_garbage(&self, dev: DevId) -> Result<()> {
        self.with_device(dev, |d| d.collect_garbage())
    }

    /// Hold the session lock across several operations. Version switches
    /// and epochs are deferred to [`Batch::commit`].
    pub fn begin_batch(&self) -> Batch<'_> {
        let mut session = self.lock();
        for device in session.devices.values_mut() {
            device.begin_batch();
        }
        log::debug!("batch opened over {} devices", session.devices.len());
        Batch {
            session,
            committed: false,
        }
    }
}

/// Open batch. Dropping an uncommitted batch commits it.
pub struct Batch<'a> {
    session: MutexGuard<'a, Session>,
    committed: bool,
}

impl Batch<'_> {
    pub fn device(&mut self, dev: DevId) -> Result<&mut Device> {
        self.session.device(dev)
    }

    /// One flush and at most one version switch per device, then epochs.
    pub fn commit(mut self) -> Result<()> {
        self.committed = true;
        self.commit_all()
    }

    fn commit_all(&mut self) -> Result<()> {
        let mut first_err = None;
        for device in self.session.devices.values_mut() {
            if let Err(e) = device.commit_batch() {
                log::error!("dev {} batch commit failed: {}", device.id(), e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

impl Drop for Batch<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.committed = true;
            let _ = self.commit_all();
        }
    }
}
