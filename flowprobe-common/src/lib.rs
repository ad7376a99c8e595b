#![cfg_attr(not(test), no_std)]

#[cfg(feature = "serde")]
extern crate serde;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of packets pulled from one receive queue per poll
pub const MAX_PKT_BURST: usize = 32;

/// Upper bound on flow table buckets; larger requests are clamped to this
pub const MAX_ENTRIES: u32 = 2 * 1024 * 1024;

/// Default flow table size used by the probe
pub const DEFAULT_ENTRIES: u32 = MAX_ENTRIES;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;
pub const ETHER_TYPE_VLAN: u16 = 0x8100;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;

/// 802.1Q tag (TCI + encapsulated ether type)
pub const VLAN_HDR_LEN: usize = 4;

// ============================================================================
// Flow identity
// ============================================================================

/// Identity tuple of one flow direction, built from a single packet.
///
/// Addresses and ports keep the byte order they had on the wire: they are
/// loaded as native integers straight from the header bytes, so their
/// numeric value is the network-order representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlowKey {
    pub ip_src: u32,
    pub ip_dst: u32,
    pub port_src: u16, // 0 when the protocol carries no ports
    pub port_dst: u16,
    pub proto: u8,
    pub pad0: u8,
    pub pad1: u16,
    pub vlan_id: Option<u16>,
}

impl FlowKey {
    pub fn src_octets(&self) -> [u8; 4] {
        self.ip_src.to_ne_bytes()
    }

    pub fn dst_octets(&self) -> [u8; 4] {
        self.ip_dst.to_ne_bytes()
    }

    /// Source port in host byte order
    pub fn src_port(&self) -> u16 {
        u16::from_be(self.port_src)
    }

    /// Destination port in host byte order
    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.port_dst)
    }
}

// ============================================================================
// Flow record
// ============================================================================

/// One aggregated entry of the flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlowRecord {
    pub vlan_id: Option<u16>,
    pub proto: u8,
    pub ip_src: u32,
    pub ip_dst: u32,
    pub port_src: u16,
    pub port_dst: u16,

    pub bytes_sent: u64,       // sum of IPv4 total length
    pub packets_sent: u64,
    pub bytes_received: u64,   // reserved for bidirectional tracking, never written
    pub packets_received: u64, // reserved for bidirectional tracking, never written

    pub tos_bits: u8,  // OR of every observed ToS byte
    pub tcp_flags: u8, // OR of every observed TCP flag byte (TCP flows only)

    pub first_seen: u64, // microseconds since UNIX epoch
    pub last_seen: u64,
}

impl FlowRecord {
    /// Record for the first packet of a flow, counters still zero.
    pub fn from_key(key: &FlowKey, now: u64) -> Self {
        Self {
            vlan_id: key.vlan_id,
            proto: key.proto,
            ip_src: key.ip_src,
            ip_dst: key.ip_dst,
            port_src: key.port_src,
            port_dst: key.port_dst,
            first_seen: now,
            last_seen: now,
            ..Default::default()
        }
    }

    /// Match predicate used by the table: address pair only.
    pub fn matches(&self, key: &FlowKey) -> bool {
        self.ip_src == key.ip_src && self.ip_dst == key.ip_dst
    }
}

/// Sums returned by the aggregate traversal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FlowTotals {
    pub total_bytes_sent: u64,
    pub total_packets_sent: u64,
}
