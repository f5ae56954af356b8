//! Replication-resource manager of a multicast switch pipeline.
//!
//! Multicast groups, L1 replication nodes, LAGs and ECMP groups are kept
//! as a software model and encoded into the replication data memory
//! (RDM) the hardware walks. Memory released from live trees is reused
//! only after the owning pipe's RDM-change epoch completes, and tables the
//! hardware reads per packet (LAG membership, port state, backup ports,
//! ECMP vectors) change through a two-copy version switch.

pub mod alloc;
pub mod arena;
pub mod buddy;
pub mod chain;
pub mod codec;
pub mod completion;
pub mod config;
pub mod device;
pub mod ecmp;
pub mod epoch;
pub mod error;
#[doc(hidden)]
pub mod harness;
pub mod hw;
pub mod invariant;
pub mod lag;
pub mod mgr;
pub mod node;
pub mod rdm;
pub mod tail;
pub mod tree;
pub mod types;
pub mod version;

pub use config::{ChipFamily, DeviceConfig};
pub use device::Device;
pub use error::{McError, Result};
pub use hw::{HwWrite, Transport};
pub use mgr::{Batch, McMgr};
pub use rdm::RdmNode;
pub use types::{DevId, DevPort, EcmpHandle, L1Handle, LagId, Mgid, PipeId, PipeMask, PortMap, RdmAddr, Version};
pub use version::Phase;
