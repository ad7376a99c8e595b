use super::classify::EtherKind;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Frames seen per ether type. Runts count as unknown.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EtherCounts {
    pub arp: u64,
    pub ipv4: u64,
    pub ipv6: u64,
    pub vlan: u64,
    pub unknown: u64,
}

impl EtherCounts {
    pub fn record(&mut self, kind: EtherKind) {
        match kind {
            EtherKind::Arp => self.arp += 1,
            EtherKind::Ipv4 => self.ipv4 += 1,
            EtherKind::Ipv6 => self.ipv6 += 1,
            EtherKind::Vlan => self.vlan += 1,
            EtherKind::Unknown(_) | EtherKind::Runt => self.unknown += 1,
        }
    }

    pub fn merge(&mut self, other: &EtherCounts) {
        self.arp += other.arp;
        self.ipv4 += other.ipv4;
        self.ipv6 += other.ipv6;
        self.vlan += other.vlan;
        self.unknown += other.unknown;
    }

    pub fn total(&self) -> u64 {
        self.arp + self.ipv4 + self.ipv6 + self.vlan + self.unknown
    }
}

/// Process-wide ether type counters, fed by every ingest worker once per
/// burst and read by the HTTP API.
#[derive(Debug, Default)]
pub struct SharedEtherCounts {
    arp: AtomicU64,
    ipv4: AtomicU64,
    ipv6: AtomicU64,
    vlan: AtomicU64,
    unknown: AtomicU64,
}

impl SharedEtherCounts {
    pub fn add(&self, counts: &EtherCounts) {
        self.arp.fetch_add(counts.arp, Ordering::Relaxed);
        self.ipv4.fetch_add(counts.ipv4, Ordering::Relaxed);
        self.ipv6.fetch_add(counts.ipv6, Ordering::Relaxed);
        self.vlan.fetch_add(counts.vlan, Ordering::Relaxed);
        self.unknown.fetch_add(counts.unknown, Ordering::Relaxed);
    }

    pub fn load(&self) -> EtherCounts {
        EtherCounts {
            arp: self.arp.load(Ordering::Relaxed),
            ipv4: self.ipv4.load(Ordering::Relaxed),
            ipv6: self.ipv6.load(Ordering::Relaxed),
            vlan: self.vlan.load(Ordering::Relaxed),
            unknown: self.unknown.load(Ordering::Relaxed),
        }
    }
}
