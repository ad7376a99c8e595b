use flowprobe_common::{FlowKey, VLAN_HDR_LEN};
use network_types::eth::EthHdr;
use network_types::ip::{IpProto, Ipv4Hdr};
use network_types::tcp::TcpHdr;
use network_types::udp::UdpHdr;
use thiserror::Error;

const TCP: u8 = IpProto::Tcp as u8;
const UDP: u8 = IpProto::Udp as u8;

// Byte offsets inside a no-options IPv4 header
const IP_TOS: usize = 1;
const IP_TOTAL_LENGTH: usize = 2;
const IP_PROTO: usize = 9;
const IP_SRC: usize = 12;
const IP_DST: usize = 16;

// Byte offset of the flags octet inside the TCP header
const TCP_FLAGS: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: {needed} bytes needed, {actual} available")]
    Truncated { needed: usize, actual: usize },
}

fn require(frame: &[u8], needed: usize) -> Result<(), FrameError> {
    if frame.len() < needed {
        return Err(FrameError::Truncated {
            needed,
            actual: frame.len(),
        });
    }
    Ok(())
}

/// Length-checked view of the IPv4 header (and whatever follows it) inside
/// an Ethernet frame.
///
/// The header is taken to be exactly 20 bytes: neither the version nor the
/// IHL field is consulted.
#[derive(Debug, Clone, Copy)]
pub struct Ipv4View<'a> {
    ip: &'a [u8],
    vlan_id: Option<u16>,
}

impl<'a> Ipv4View<'a> {
    /// Locate the IPv4 header, skipping one 802.1Q tag when `vlan` is set.
    pub fn from_frame(frame: &'a [u8], vlan: bool) -> Result<Self, FrameError> {
        let (offset, vlan_id) = if vlan {
            require(frame, EthHdr::LEN + VLAN_HDR_LEN)?;
            let tci = u16::from_be_bytes([frame[EthHdr::LEN], frame[EthHdr::LEN + 1]]);
            (EthHdr::LEN + VLAN_HDR_LEN, Some(tci & 0x0fff))
        } else {
            (EthHdr::LEN, None)
        };

        require(frame, offset + Ipv4Hdr::LEN)?;
        Ok(Self {
            ip: &frame[offset..],
            vlan_id,
        })
    }

    pub fn src_addr(&self) -> u32 {
        self.word(IP_SRC)
    }

    pub fn dst_addr(&self) -> u32 {
        self.word(IP_DST)
    }

    pub fn proto(&self) -> u8 {
        self.ip[IP_PROTO]
    }

    pub fn tos(&self) -> u8 {
        self.ip[IP_TOS]
    }

    /// Total length field, host order, exactly as carried in the header
    pub fn total_length(&self) -> u16 {
        u16::from_be_bytes([self.ip[IP_TOTAL_LENGTH], self.ip[IP_TOTAL_LENGTH + 1]])
    }

    /// Flag octet of the TCP header; `None` for other protocols or when the
    /// TCP header is cut short.
    pub fn tcp_flags(&self) -> Option<u8> {
        if self.proto() != TCP {
            return None;
        }
        self.ip.get(Ipv4Hdr::LEN + TCP_FLAGS).copied()
    }

    pub fn vlan_id(&self) -> Option<u16> {
        self.vlan_id
    }

    /// Build the flow key. TCP and UDP need their full transport header.
    pub fn flow_key(&self) -> Result<FlowKey, FrameError> {
        let proto = self.proto();
        let (port_src, port_dst) = match proto {
            TCP => self.ports(TcpHdr::LEN)?,
            UDP => self.ports(UdpHdr::LEN)?,
            _ => (0, 0),
        };

        Ok(FlowKey {
            ip_src: self.src_addr(),
            ip_dst: self.dst_addr(),
            port_src,
            port_dst,
            proto,
            pad0: 0,
            pad1: 0,
            vlan_id: self.vlan_id,
        })
    }

    fn ports(&self, l4_len: usize) -> Result<(u16, u16), FrameError> {
        require(self.ip, Ipv4Hdr::LEN + l4_len)?;
        let l4 = &self.ip[Ipv4Hdr::LEN..];
        Ok((
            u16::from_ne_bytes([l4[0], l4[1]]),
            u16::from_ne_bytes([l4[2], l4[3]]),
        ))
    }

    fn word(&self, at: usize) -> u32 {
        u32::from_ne_bytes([self.ip[at], self.ip[at + 1], self.ip[at + 2], self.ip[at + 3]])
    }
}

/// Build the flow key of an Ethernet frame carrying IPv4.
pub fn extract_flow_key(frame: &[u8], vlan: bool) -> Result<FlowKey, FrameError> {
    Ipv4View::from_frame(frame, vlan)?.flow_key()
}


#[cfg(test)]
mod tests {
    use super::testing::{ne_addr, Ipv4Spec};
    use super::*;

    #[test]
    fn test_extract_tcp_key() {
        let frame = Ipv4Spec::tcp([10, 0, 0, 1], [10, 0, 0, 2], 1234, 80).frame();
        let key = extract_flow_key(&frame, false).unwrap();

        assert_eq!(key.ip_src, ne_addr([10, 0, 0, 1]));
        assert_eq!(key.ip_dst, ne_addr([10, 0, 0, 2]));
        assert_eq!(key.src_port(), 1234);
        assert_eq!(key.dst_port(), 80);
        assert_eq!(key.proto, 6);
        assert_eq!(key.vlan_id, None);
        assert_eq!((key.pad0, key.pad1), (0, 0));
    }

    #[test]
    fn test_extract_icmp_has_zero_ports() {
        let mut spec = Ipv4Spec::tcp([10, 0, 0, 1], [10, 0, 0, 2], 1, 2);
        spec.proto = 1;
        let key = extract_flow_key(&spec.frame(), false).unwrap();
        assert_eq!((key.port_src, key.port_dst), (0, 0));
        assert_eq!(key.proto, 1);
    }

    #[test]
    fn test_extract_skips_vlan_tag() {
        let frame = Ipv4Spec::udp([172, 16, 0, 9], [8, 8, 8, 8], 5555, 53).tagged_frame(0x3064);
        let key = extract_flow_key(&frame, true).unwrap();

        assert_eq!(key.ip_src, ne_addr([172, 16, 0, 9]));
        assert_eq!(key.dst_port(), 53);
        assert_eq!(key.proto, 17);
        assert_eq!(key.vlan_id, Some(0x064));
    }

    #[test]
    fn test_metric_accessors() {
        let frame = Ipv4Spec::tcp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2)
            .length(1500)
            .tos(0xb8)
            .flags(0x12)
            .frame();
        let view = Ipv4View::from_frame(&frame, false).unwrap();
        assert_eq!(view.total_length(), 1500);
        assert_eq!(view.tos(), 0xb8);
        assert_eq!(view.tcp_flags(), Some(0x12));

        let udp = Ipv4Spec::udp([1, 1, 1, 1], [2, 2, 2, 2], 1, 2).frame();
        assert_eq!(Ipv4View::from_frame(&udp, false).unwrap().tcp_flags(), None);
    }

    #[test]
    fn test_short_frames_are_rejected() {
        let frame = Ipv4Spec::tcp([10, 0, 0, 1], [10, 0, 0, 2], 1234, 80).frame();

        assert_eq!(
            Ipv4View::from_frame(&frame[..30], false).unwrap_err(),
            FrameError::Truncated {
                needed: 34,
                actual: 30
            }
        );

        // IPv4 header present, TCP header cut short
        let err = extract_flow_key(&frame[..40], false).unwrap_err();
        assert_eq!(
            err,
            FrameError::Truncated {
                needed: 40,
                actual: 26
            }
        );

        assert!(extract_flow_key(&frame[..16], true).is_err());
    }
}
