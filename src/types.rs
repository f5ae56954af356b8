//! Identifier newtypes and membership sets shared by every module.

use std::fmt;

/// Largest pipe count of any supported chip family.
pub const MAX_PIPES: usize = 8;
/// Local ports per pipe visible to the replication engine.
pub const PORTS_PER_PIPE: u16 = 72;
/// Number of LAG ids.
pub const LAG_COUNT: usize = 256;
/// RID carried by ECMP pointer nodes in software.
pub const ECMP_PTR_RID: u16 = 0xFFFF;
/// RID written into tail nodes.
pub const TAIL_RID: u16 = 0xFFFE;

/// Device identifier.
pub type DevId = u8;

/// Pipe index.
pub type PipeId = usize;

/// RDM address in half-line entries. Zero is the null pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RdmAddr(pub u32);

impl RdmAddr {
    pub const NULL: RdmAddr = RdmAddr(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `entries` further along.
    pub fn offset(self, entries: u32) -> RdmAddr {
        RdmAddr(self.0 + entries)
    }
}

impl fmt::Display for RdmAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Multicast group id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Mgid(pub u16);

/// Handle of an L1 replication node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct L1Handle(pub u32);

/// Handle of an ECMP group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EcmpHandle(pub u32);

/// LAG id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LagId(pub u8);

/// Device port: pipe in bits 7 and up, local port in bits 0..7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevPort(pub u16);

impl DevPort {
    pub fn new(pipe: PipeId, local: u16) -> Self {
        DevPort(((pipe as u16) << 7) | (local & 0x7F))
    }

    pub fn pipe(self) -> PipeId {
        (self.0 >> 7) as PipeId
    }

    pub fn local(self) -> u16 {
        self.0 & 0x7F
    }
}

/// Node class owning an RDM block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeClass {
    L1,
    L2,
}

/// One of the two hardware-resident table copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Version {
    V0,
    V1,
}

impl Version {
    pub fn other(self) -> Version {
        match self {
            Version::V0 => Version::V1,
            Version::V1 => Version::V0,
        }
    }

    pub fn index(self) -> usize {
        match self {
            Version::V0 => 0,
            Version::V1 => 1,
        }
    }
}

/// Bit mask of pipes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PipeMask(pub u8);

impl PipeMask {
    pub const EMPTY: PipeMask = PipeMask(0);

    pub fn all(pipes: usize) -> PipeMask {
        PipeMask(((1u16 << pipes) - 1) as u8)
    }

    pub fn contains(self, pipe: PipeId) -> bool {
        self.0 & (1 << pipe) != 0
    }

    pub fn insert(&mut self, pipe: PipeId) {
        self.0 |= 1 << pipe;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn union(self, other: PipeMask) -> PipeMask {
        PipeMask(self.0 | other.0)
    }

    pub fn intersect(self, other: PipeMask) -> PipeMask {
        PipeMask(self.0 & other.0)
    }

    pub fn minus(self, other: PipeMask) -> PipeMask {
        PipeMask(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = PipeId> {
        (0..MAX_PIPES).filter(move |&p| self.contains(p))
    }
}

/// Set of device ports, 72 bits per pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct PortMap {
    bits: [u128; MAX_PIPES],
}

impl PortMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ports(ports: &[DevPort]) -> Self {
        let mut map = Self::new();
        for &p in ports {
            map.insert(p);
        }
        map
    }

    pub fn insert(&mut self, port: DevPort) {
        self.bits[port.pipe()] |= 1u128 << port.local();
    }

    pub fn remove(&mut self, port: DevPort) {
        self.bits[port.pipe()] &= !(1u128 << port.local());
    }

    pub fn contains(&self, port: DevPort) -> bool {
        port.pipe() < MAX_PIPES && self.bits[port.pipe()] & (1u128 << port.local()) != 0
    }

    /// Local-port bitmap of one pipe.
    pub fn pipe_bits(&self, pipe: PipeId) -> u128 {
        self.bits[pipe]
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn union(&self, other: &PortMap) -> PortMap {
        let mut out = *self;
        for (o, b) in out.bits.iter_mut().zip(other.bits.iter()) {
            *o |= b;
        }
        out
    }

    /// Pipes holding at least one port of the set.
    pub fn pipes(&self) -> PipeMask {
        let mut mask = PipeMask::EMPTY;
        for (pipe, &b) in self.bits.iter().enumerate() {
            if b != 0 {
                mask.insert(pipe);
            }
        }
        mask
    }

    pub fn iter(&self) -> impl Iterator<Item = DevPort> + '_ {
        self.bits.iter().enumerate().flat_map(|(pipe, &b)| {
            (0..PORTS_PER_PIPE)
                .filter(move |&l| b & (1u128 << l) != 0)
                .map(move |l| DevPort::new(pipe, l))
        })
    }

    pub fn len(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }
}

/// Set of LAG ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LagSet {
    bits: [u64; LAG_COUNT / 64],
}

impl LagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_ids(ids: &[LagId]) -> Self {
        let mut set = Self::new();
        for &id in ids {
            set.insert(id);
        }
        set
    }

    pub fn insert(&mut self, lag: LagId) {
        self.bits[lag.0 as usize / 64] |= 1 << (lag.0 % 64);
    }

    pub fn remove(&mut self, lag: LagId) {
        self.bits[lag.0 as usize / 64] &= !(1 << (lag.0 % 64));
    }

    pub fn contains(&self, lag: LagId) -> bool {
        self.bits[lag.0 as usize / 64] & (1 << (lag.0 % 64)) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.bits.iter().all(|&b| b == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = LagId> + '_ {
        (0..LAG_COUNT).filter(move |&i| self.bits[i / 64] & (1 << (i % 64)) != 0).map(|i| LagId(i as u8))
    }
}
