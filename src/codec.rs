//! Bit layout of RDM nodes per chip family.
//!
//! Half-width nodes fit in the low 64 bits, full-width nodes in 128. Field
//! widths and tag values come from the device's [`ChipFamily`].

use crate::config::ChipFamily;
use crate::error::{McError, Result};
use crate::rdm::{RdmNode, RdmNodeKind};
use crate::types::RdmAddr;

/// Encoder/decoder of RDM nodes, selected once per device.
pub trait NodeCodec: Send {
    fn family(&self) -> ChipFamily;
    fn encode(&self, node: &RdmNode) -> u128;
    fn decode(&self, bits: u128) -> Result<RdmNode>;
}

const TAG_BITS: u32 = 4;

/// Packed little-endian field layout: tag in the low four bits, fields after.
#[derive(Debug, Clone, Copy)]
pub struct PackedCodec {
    family: ChipFamily,
}

impl PackedCodec {
    pub fn new(family: ChipFamily) -> Self {
        Self { family }
    }

    fn tag(&self, kind: RdmNodeKind) -> u8 {
        match self.family {
            ChipFamily::Tofino => match kind {
                RdmNodeKind::Invalid => 0x0,
                RdmNodeKind::L1Rid => 0x1,
                RdmNodeKind::L1Xid => 0x2,
                RdmNodeKind::L1End => 0x3,
                RdmNodeKind::L1EcmpPtr => 0x4,
                RdmNodeKind::L1EcmpPtrXid => 0x5,
                RdmNodeKind::L1EcmpVector => 0x6,
                RdmNodeKind::L2Port18 => 0x7,
                RdmNodeKind::L2Port72 => 0x8,
                RdmNodeKind::L2Lag => 0x9,
            },
            _ => match kind {
                RdmNodeKind::Invalid => 0x0,
                RdmNodeKind::L1Rid => 0x1,
                RdmNodeKind::L1Xid => 0x2,
                RdmNodeKind::L1End => 0x3,
                RdmNodeKind::L1EcmpVector => 0x4,
                RdmNodeKind::L1EcmpPtr => 0x5,
                RdmNodeKind::L1EcmpPtrXid => 0x6,
                RdmNodeKind::L2Port18 => 0x8,
                RdmNodeKind::L2Port72 => 0x9,
                RdmNodeKind::L2Lag => 0xC,
            },
        }
    }

    fn kind_of(&self, tag: u8) -> Option<RdmNodeKind> {
        [
            RdmNodeKind::Invalid,
            RdmNodeKind::L1Rid,
            RdmNodeKind::L1Xid,
            RdmNodeKind::L1End,
            RdmNodeKind::L1EcmpPtr,
            RdmNodeKind::L1EcmpPtrXid,
            RdmNodeKind::L1EcmpVector,
            RdmNodeKind::L2Port18,
            RdmNodeKind::L2Port72,
            RdmNodeKind::L2Lag,
        ]
        .into_iter()
        .find(|&k| self.tag(k) == tag)
    }
}

struct BitWriter {
    value: u128,
    offset: u32,
}

impl BitWriter {
    fn new() -> Self {
        Self { value: 0, offset: 0 }
    }

    fn put(&mut self, field: u128, width: u32) -> &mut Self {
        let mask = if width == 128 { u128::MAX } else { (1u128 << width) - 1 };
        self.value |= (field & mask) << self.offset;
        self.offset += width;
        self
    }
}

struct BitReader {
    value: u128,
    offset: u32,
}

impl BitReader {
    fn take(&mut self, width: u32) -> u128 {
        let mask = (1u128 << width) - 1;
        let out = (self.value >> self.offset) & mask;
        self.offset += width;
        out
    }

    fn addr(&mut self, width: u32) -> RdmAddr {
        RdmAddr(self.take(width) as u32)
    }
}

impl NodeCodec for PackedCodec {
    fn family(&self) -> ChipFamily {
        self.family
    }

    fn encode(&self, node: &RdmNode) -> u128 {
        let a = self.family.addr_bits();
        let p = self.family.pipe_bits();
        let mut w = BitWriter::new();
        w.put(self.tag(node.kind()) as u128, TAG_BITS);
        match *node {
            RdmNode::Invalid => return 0,
            RdmNode::L1Rid { next_l1, next_l2, rid } => {
                w.put(next_l1.0 as u128, a).put(next_l2.0 as u128, a).put(rid as u128, 16);
            }
            RdmNode::L1Xid { next_l1, next_l2, rid, xid } => {
                w.put(next_l1.0 as u128, a)
                    .put(next_l2.0 as u128, a)
                    .put(rid as u128, 16)
                    .put(xid as u128, 16);
            }
            RdmNode::L1End { next_l2, rid } => {
                w.put(next_l2.0 as u128, a).put(rid as u128, 16);
            }
            RdmNode::L1EcmpPtr { next_l1, vector0, vector1 } => {
                w.put(next_l1.0 as u128, a)
                    .put(vector0.0 as u128, a)
                    .put(vector1.0 as u128, a);
            }
            RdmNode::L1EcmpPtrXid { next_l1, vector0, vector1, xid } => {
                w.put(next_l1.0 as u128, a)
                    .put(vector0.0 as u128, a)
                    .put(vector1.0 as u128, a)
                    .put(xid as u128, 16);
            }
            RdmNode::L1EcmpVector { base, length, vector, id } => {
                w.put(base.0 as u128, a)
                    .put(length as u128, 5)
                    .put(vector as u128, 32)
                    .put(id as u128, 16);
            }
            RdmNode::L2Port18 { last, pipe, index, ports } => {
                w.put(last as u128, 1)
                    .put(pipe as u128, p)
                    .put(index as u128, 2)
                    .put(ports as u128, 18);
            }
            RdmNode::L2Port72 { last, pipe, ports } => {
                w.put(last as u128, 1).put(pipe as u128, p).put(ports, 72);
            }
            RdmNode::L2Lag { next_l2, lag_id } => {
                w.put(next_l2.0 as u128, a).put(lag_id as u128, 8);
            }
        }
        w.value
    }

    fn decode(&self, bits: u128) -> Result<RdmNode> {
        let a = self.family.addr_bits();
        let p = self.family.pipe_bits();
        let mut r = BitReader { value: bits, offset: 0 };
        let tag = r.take(TAG_BITS) as u8;
        let kind = self
            .kind_of(tag)
            .ok_or_else(|| McError::invalid(format!("unknown rdm node tag {:#x}", tag)))?;
        let node = match kind {
            RdmNodeKind::Invalid => RdmNode::Invalid,
            RdmNodeKind::L1Rid => RdmNode::L1Rid {
                next_l1: r.addr(a),
                next_l2: r.addr(a),
                rid: r.take(16) as u16,
            },
            RdmNodeKind::L1Xid => RdmNode::L1Xid {
                next_l1: r.addr(a),
                next_l2: r.addr(a),
                rid: r.take(16) as u16,
                xid: r.take(16) as u16,
            },
            RdmNodeKind::L1End => RdmNode::L1End {
                next_l2: r.addr(a),
                rid: r.take(16) as u16,
            },
            RdmNodeKind::L1EcmpPtr => RdmNode::L1EcmpPtr {
                next_l1: r.addr(a),
                vector0: r.addr(a),
                vector1: r.addr(a),
            },
            RdmNodeKind::L1EcmpPtrXid => RdmNode::L1EcmpPtrXid {
                next_l1: r.addr(a),
                vector0: r.addr(a),
                vector1: r.addr(a),
                xid: r.take(16) as u16,
            },
            RdmNodeKind::L1EcmpVector => RdmNode::L1EcmpVector {
                base: r.addr(a),
                length: r.take(5) as u8,
                vector: r.take(32) as u32,
                id: r.take(16) as u16,
            },
            RdmNodeKind::L2Port18 => RdmNode::L2Port18 {
                last: r.take(1) == 1,
                pipe: r.take(p) as u8,
                index: r.take(2) as u8,
                ports: r.take(18) as u32,
            },
            RdmNodeKind::L2Port72 => RdmNode::L2Port72 {
                last: r.take(1) == 1,
                pipe: r.take(p) as u8,
                ports: r.take(72),
            },
            RdmNodeKind::L2Lag => RdmNode::L2Lag {
                next_l2: r.addr(a),
                lag_id: r.take(8) as u8,
            },
        };
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_width_nodes_fit_64_bits() {
        let codec = PackedCodec::new(ChipFamily::Tofino3);
        let end = RdmNode::L1End { next_l2: RdmAddr((1 << 21) - 1), rid: 0xFFFF };
        assert!(codec.encode(&end) < 1u128 << 64);
        let lag = RdmNode::L2Lag { next_l2: RdmAddr(0x1234), lag_id: 0xFF };
        assert!(codec.encode(&lag) < 1u128 << 64);
    }

    #[test]
    fn tags_differ_between_families() {
        let node = RdmNode::L2Lag { next_l2: RdmAddr(2), lag_id: 3 };
        let t1 = PackedCodec::new(ChipFamily::Tofino).encode(&node) & 0xF;
        let t2 = PackedCodec::new(ChipFamily::Tofino2).encode(&node) & 0xF;
        assert_eq!(t1, 0x9);
        assert_eq!(t2, 0xC);
    }

    #[test]
    fn port72_keeps_all_72_bits() {
        let codec = PackedCodec::new(ChipFamily::Tofino);
        let node = RdmNode::L2Port72 { last: true, pipe: 3, ports: (1u128 << 72) - 1 };
        assert_eq!(codec.decode(codec.encode(&node)).unwrap(), node);
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let codec = PackedCodec::new(ChipFamily::Tofino);
        assert!(codec.decode(0xF).is_err());
    }

    #[test]
    fn invalid_encodes_to_zero() {
        let codec = PackedCodec::new(ChipFamily::Tofino2);
        assert_eq!(codec.encode(&RdmNode::Invalid), 0);
        assert_eq!(codec.decode(0).unwrap(), RdmNode::Invalid);
    }
}
