//! Per-device configuration and chip-family capabilities.

use crate::error::{McError, Result};
use crate::types::MAX_PIPES;

/// ASIC generation. Selected once per device; every family-specific
/// decision (codec layout, sizes) is read from here instead of being
/// re-dispatched at call sites.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChipFamily {
    Tofino,
    Tofino2,
    Tofino3,
}

impl ChipFamily {
    pub fn pipe_count(self) -> usize {
        match self {
            ChipFamily::Tofino | ChipFamily::Tofino2 => 4,
            ChipFamily::Tofino3 => 8,
        }
    }

    /// RDM size in half-line entries.
    pub fn rdm_entries(self) -> u32 {
        match self {
            ChipFamily::Tofino => 96 * 1024,
            ChipFamily::Tofino2 | ChipFamily::Tofino3 => 192 * 1024,
        }
    }

    pub fn block_entries(self) -> u32 {
        4096
    }

    /// Width of an RDM pointer field in encoded nodes.
    pub fn addr_bits(self) -> u32 {
        match self {
            ChipFamily::Tofino | ChipFamily::Tofino2 => 20,
            ChipFamily::Tofino3 => 21,
        }
    }

    /// Width of the pipe field in encoded L2 port nodes.
    pub fn pipe_bits(self) -> u32 {
        match self {
            ChipFamily::Tofino | ChipFamily::Tofino2 => 2,
            ChipFamily::Tofino3 => 3,
        }
    }
}

/// Default tail bucket sizes, in L1 nodes per (group, pipe) tree.
pub const DEFAULT_TAIL_BUCKETS: &[u16] = &[3, 4, 5, 6, 7, 8, 9, 10, 12, 16, 20, 32, 64, 128, 260];

/// Garbage-collection passes attempted before an allocation fails.
pub const DEFAULT_GC_PASSES: u32 = 8;

/// Configuration of one device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConfig {
    /// Chip family (capability object).
    pub family: ChipFamily,
    /// Number of pipes in use.
    pub pipes: usize,
    /// RDM size in half-line entries.
    pub rdm_entries: u32,
    /// Block size in entries; a power of two.
    pub block_entries: u32,
    /// Bound on L1 node handles (including ECMP pointer nodes).
    pub max_l1_nodes: u32,
    /// Bound on ECMP groups and their hardware ids.
    pub max_ecmp_groups: u32,
    /// Number of multicast group ids.
    pub mgid_count: u32,
    /// Tail bucket sizes, ascending.
    pub tail_buckets: Vec<u16>,
    /// GC passes before an allocation reports exhaustion.
    pub gc_passes: u32,
}

impl DeviceConfig {
    /// Defaults for a chip family.
    pub fn for_family(family: ChipFamily) -> Self {
        Self {
            family,
            pipes: family.pipe_count(),
            rdm_entries: family.rdm_entries(),
            block_entries: family.block_entries(),
            max_l1_nodes: 1 << 20,
            max_ecmp_groups: 1 << 14,
            mgid_count: 1 << 16,
            tail_buckets: DEFAULT_TAIL_BUCKETS.to_vec(),
            gc_passes: DEFAULT_GC_PASSES,
        }
    }

    pub fn with_pipes(mut self, pipes: usize) -> Self {
        self.pipes = pipes;
        self
    }

    pub fn with_rdm(mut self, rdm_entries: u32, block_entries: u32) -> Self {
        self.rdm_entries = rdm_entries;
        self.block_entries = block_entries;
        self
    }

    pub fn with_max_l1_nodes(mut self, max: u32) -> Self {
        self.max_l1_nodes = max;
        self
    }

    pub fn with_max_ecmp_groups(mut self, max: u32) -> Self {
        self.max_ecmp_groups = max;
        self
    }

    pub fn with_tail_buckets(mut self, buckets: Vec<u16>) -> Self {
        self.tail_buckets = buckets;
        self
    }

    pub fn with_gc_passes(mut self, passes: u32) -> Self {
        self.gc_passes = passes;
        self
    }

    /// Reject configurations the allocator or codec cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.pipes == 0 || self.pipes > MAX_PIPES || self.pipes > self.family.pipe_count() {
            return Err(McError::invalid(format!("pipe count {}", self.pipes)));
        }
        if !self.block_entries.is_power_of_two() || self.block_entries < 4 {
            return Err(McError::invalid(format!(
                "block size {} must be a power of two >= 4",
                self.block_entries
            )));
        }
        if self.rdm_entries == 0 || self.rdm_entries % self.block_entries != 0 {
            return Err(McError::invalid(format!(
                "rdm size {} is not a multiple of the block size",
                self.rdm_entries
            )));
        }
        if u64::from(self.rdm_entries) > 1u64 << self.family.addr_bits() {
            return Err(McError::invalid("rdm size exceeds pointer width"));
        }
        if self.tail_buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(McError::invalid("tail buckets must be strictly ascending"));
        }
        if self.max_ecmp_groups > 1 << 16 || self.mgid_count > 1 << 16 {
            return Err(McError::invalid("id space exceeds 16 bits"));
        }
        Ok(())
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::for_family(ChipFamily::Tofino)
    }
}
