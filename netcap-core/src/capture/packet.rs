//! Structured packet representation.
//!
//! [`Packet`] is the per-packet view the reassembly path consumes: capture
//! timestamp, optional link, network and transport layers, and payload.
//! Frames are decoded with etherparse header slices.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use bytes::Bytes;
use etherparse::{
    Ethernet2HeaderSlice, Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, TcpOptionElement,
    UdpHeaderSlice,
};

use crate::error::CaptureError;
use crate::flow::{FlowKey, NetFlow, TransportFlow};

/// Link types understood by [`Packet::decode`].
pub mod link_types {
    pub const NULL: u16 = 0;
    pub const ETHERNET: u16 = 1;
    pub const RAW: u16 = 101;
    pub const RAW_OPENBSD: u16 = 12;
    pub const LINUX_SLL: u16 = 113;
    pub const IPV4: u16 = 228;
    pub const IPV6: u16 = 229;
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86dd;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88a8;

const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;

/// TCP flags relevant to connection tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub const SYN: TcpFlags = TcpFlags {
        syn: true,
        ack: false,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const SYN_ACK: TcpFlags = TcpFlags {
        syn: true,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
    };
    pub const PSH_ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: true,
    };
    pub const FIN_ACK: TcpFlags = TcpFlags {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
        psh: false,
    };
    pub const RST: TcpFlags = TcpFlags {
        syn: false,
        ack: false,
        fin: false,
        rst: true,
        psh: false,
    };
}

/// TCP options used by the acceptance checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    /// A SACK block was present.
    pub sack: bool,
}

/// TCP layer of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub options: TcpOptions,
    /// Whether the checksum matched. `true` when it could not be verified.
    pub checksum_ok: bool,
}

impl TcpSegment {
    /// Segment with the given ports, sequence number and flags.
    pub fn new(src_port: u16, dst_port: u16, seq: u32, flags: TcpFlags) -> Self {
        Self {
            src_port,
            dst_port,
            seq,
            ack: 0,
            flags,
            window: 65535,
            options: TcpOptions::default(),
            checksum_ok: true,
        }
    }
}

/// UDP layer of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
}

/// Transport layer of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    Tcp(TcpSegment),
    Udp(UdpDatagram),
}

/// Link layer addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkLayer {
    pub src: [u8; 6],
    pub dst: [u8; 6],
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Capture timestamp in microseconds since the epoch.
    pub timestamp: i64,
    pub link: Option<LinkLayer>,
    pub network: Option<NetFlow>,
    pub transport: Option<Transport>,
    pub payload: Bytes,
}

impl Packet {
    /// TCP packet without link layer.
    pub fn tcp(timestamp: i64, net: NetFlow, segment: TcpSegment, payload: &[u8]) -> Self {
        Self {
            timestamp,
            link: None,
            network: Some(net),
            transport: Some(Transport::Tcp(segment)),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// UDP packet without link layer.
    pub fn udp(timestamp: i64, net: NetFlow, src_port: u16, dst_port: u16, payload: &[u8]) -> Self {
        Self {
            timestamp,
            link: None,
            network: Some(net),
            transport: Some(Transport::Udp(UdpDatagram { src_port, dst_port })),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    pub fn tcp_segment(&self) -> Option<&TcpSegment> {
        match &self.transport {
            Some(Transport::Tcp(seg)) => Some(seg),
            _ => None,
        }
    }

    /// Port pair of the transport layer.
    pub fn transport_flow(&self) -> Option<TransportFlow> {
        match &self.transport {
            Some(Transport::Tcp(t)) => Some(TransportFlow::new(t.src_port, t.dst_port)),
            Some(Transport::Udp(u)) => Some(TransportFlow::new(u.src_port, u.dst_port)),
            None => None,
        }
    }

    /// Flow key of the packet, if it has network and transport layers.
    pub fn flow_key(&self) -> Option<FlowKey> {
        let net = self.network.as_ref()?;
        let transport = self.transport_flow()?;
        Some(FlowKey::new(
            self.link.map(|l| (l.src, l.dst)),
            net,
            &transport,
        ))
    }

    pub fn link_proto(&self) -> &'static str {
        if self.link.is_some() {
            "Ethernet"
        } else {
            ""
        }
    }

    pub fn network_proto(&self) -> &'static str {
        match self.network.map(|n| n.src) {
            Some(IpAddr::V4(_)) => "IPv4",
            Some(IpAddr::V6(_)) => "IPv6",
            None => "",
        }
    }

    /// Decode a captured frame.
    ///
    /// Returns `Ok(None)` for frames without an IP layer or that are too short
    /// to decode. Unknown link types are an error.
    pub fn decode(link_type: u16, timestamp: i64, data: &[u8]) -> Result<Option<Packet>, CaptureError> {
        let mut packet = Packet {
            timestamp,
            link: None,
            network: None,
            transport: None,
            payload: Bytes::new(),
        };

        let (ether_type, l3) = match link_type {
            link_types::ETHERNET => {
                let eth = match Ethernet2HeaderSlice::from_slice(data) {
                    Ok(eth) => eth,
                    Err(_) => return Ok(None),
                };
                packet.link = Some(LinkLayer {
                    src: eth.source(),
                    dst: eth.destination(),
                });
                let mut ether_type = eth.ether_type().0;
                let mut offset = eth.slice().len();

                // 802.1Q / QinQ tags
                while ether_type == ETHERTYPE_VLAN || ether_type == ETHERTYPE_QINQ {
                    if data.len() < offset + 4 {
                        return Ok(None);
                    }
                    ether_type = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
                    offset += 4;
                }
                (ether_type, &data[offset..])
            }
            link_types::LINUX_SLL => {
                if data.len() < 16 {
                    return Ok(None);
                }
                (u16::from_be_bytes([data[14], data[15]]), &data[16..])
            }
            link_types::NULL => {
                if data.len() < 4 {
                    return Ok(None);
                }
                (ip_version_ethertype(&data[4..]), &data[4..])
            }
            link_types::RAW | link_types::RAW_OPENBSD | link_types::IPV4 | link_types::IPV6 => {
                (ip_version_ethertype(data), data)
            }
            other => return Err(CaptureError::UnsupportedLinkType { link_type: other }),
        };

        let (proto, l4, src, dst) = match ether_type {
            ETHERTYPE_IPV4 => match decode_ipv4(l3) {
                Some(v) => v,
                None => return Ok(None),
            },
            ETHERTYPE_IPV6 => match decode_ipv6(l3) {
                Some(v) => v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
        packet.network = Some(NetFlow::new(src, dst));

        match proto {
            IP_PROTO_TCP => {
                let tcp = match TcpHeaderSlice::from_slice(l4) {
                    Ok(tcp) => tcp,
                    Err(_) => return Ok(Some(packet)),
                };
                let payload = &l4[tcp.slice().len()..];
                let checksum_ok = verify_tcp_checksum(&tcp, &src, &dst, payload);

                packet.transport = Some(Transport::Tcp(TcpSegment {
                    src_port: tcp.source_port(),
                    dst_port: tcp.destination_port(),
                    seq: tcp.sequence_number(),
                    ack: tcp.acknowledgment_number(),
                    flags: TcpFlags {
                        syn: tcp.syn(),
                        ack: tcp.ack(),
                        fin: tcp.fin(),
                        rst: tcp.rst(),
                        psh: tcp.psh(),
                    },
                    window: tcp.window_size(),
                    options: parse_tcp_options(&tcp),
                    checksum_ok,
                }));
                packet.payload = Bytes::copy_from_slice(payload);
            }
            IP_PROTO_UDP => {
                let udp = match UdpHeaderSlice::from_slice(l4) {
                    Ok(udp) => udp,
                    Err(_) => return Ok(Some(packet)),
                };
                let mut end = (udp.length() as usize).min(l4.len());
                if end < 8 {
                    end = l4.len();
                }
                packet.transport = Some(Transport::Udp(UdpDatagram {
                    src_port: udp.source_port(),
                    dst_port: udp.destination_port(),
                }));
                packet.payload = Bytes::copy_from_slice(&l4[8..end]);
            }
            _ => {}
        }

        Ok(Some(packet))
    }
}

fn ip_version_ethertype(data: &[u8]) -> u16 {
    match data.first().map(|b| b >> 4) {
        Some(4) => ETHERTYPE_IPV4,
        Some(6) => ETHERTYPE_IPV6,
        _ => 0,
    }
}

/// Returns (protocol, transport bytes, src, dst). Non-first fragments yield `None`.
fn decode_ipv4(data: &[u8]) -> Option<(u8, &[u8], IpAddr, IpAddr)> {
    let ip = Ipv4HeaderSlice::from_slice(data).ok()?;
    let raw = ip.slice();
    let frag = u16::from_be_bytes([raw[6], raw[7]]);
    if frag & 0x1fff != 0 || frag & 0x2000 != 0 {
        return None;
    }
    let header_len = raw.len();
    let total = (ip.total_len() as usize).clamp(header_len, data.len());
    let src: Ipv4Addr = ip.source_addr();
    let dst: Ipv4Addr = ip.destination_addr();
    Some((
        ip.protocol().0,
        &data[header_len..total],
        IpAddr::V4(src),
        IpAddr::V4(dst),
    ))
}

fn decode_ipv6(data: &[u8]) -> Option<(u8, &[u8], IpAddr, IpAddr)> {
    let ip = Ipv6HeaderSlice::from_slice(data).ok()?;
    let src: Ipv6Addr = ip.source_addr();
    let dst: Ipv6Addr = ip.destination_addr();
    let end = (40 + ip.payload_length() as usize).min(data.len());
    let mut next = ip.next_header().0;
    let mut offset = 40;

    // hop-by-hop, routing and destination options headers
    while matches!(next, 0 | 43 | 60) {
        if end < offset + 2 {
            return None;
        }
        let len = (data[offset + 1] as usize + 1) * 8;
        next = data[offset];
        offset += len;
    }
    if next == 44 || offset > end {
        return None;
    }
    Some((next, &data[offset..end], IpAddr::V6(src), IpAddr::V6(dst)))
}

fn verify_tcp_checksum(tcp: &TcpHeaderSlice<'_>, src: &IpAddr, dst: &IpAddr, payload: &[u8]) -> bool {
    let header = tcp.to_header();
    let computed = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => header.calc_checksum_ipv4_raw(s.octets(), d.octets(), payload).ok(),
        (IpAddr::V6(s), IpAddr::V6(d)) => header.calc_checksum_ipv6_raw(s.octets(), d.octets(), payload).ok(),
        _ => None,
    };
    computed.map(|c| c == tcp.checksum()).unwrap_or(true)
}

fn parse_tcp_options(tcp: &TcpHeaderSlice<'_>) -> TcpOptions {
    let mut result = TcpOptions::default();

    for opt in tcp.options_iterator().flatten() {
        match opt {
            TcpOptionElement::MaximumSegmentSize(mss) => result.mss = Some(mss),
            TcpOptionElement::WindowScale(scale) => result.window_scale = Some(scale),
            TcpOptionElement::SelectiveAcknowledgementPermitted => result.sack_permitted = true,
            TcpOptionElement::SelectiveAcknowledgement(_, _) => result.sack = true,
            _ => {}
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ethernet_ipv4_tcp(flags: u8, payload: &[u8]) -> Vec<u8> {
        let mut packet = Vec::new();

        // Ethernet header
        packet.extend_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        packet.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        packet.extend_from_slice(&[0x08, 0x00]);

        // IPv4 header
        let total = (20 + 24 + payload.len()) as u16;
        packet.push(0x45);
        packet.push(0x00);
        packet.extend_from_slice(&total.to_be_bytes());
        packet.extend_from_slice(&[0x00, 0x01, 0x40, 0x00]);
        packet.push(64);
        packet.push(6);
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&[192, 168, 1, 100]);
        packet.extend_from_slice(&[192, 168, 1, 200]);

        // TCP header with one MSS option
        packet.extend_from_slice(&12345u16.to_be_bytes());
        packet.extend_from_slice(&80u16.to_be_bytes());
        packet.extend_from_slice(&1000u32.to_be_bytes());
        packet.extend_from_slice(&0u32.to_be_bytes());
        packet.push(0x60);
        packet.push(flags);
        packet.extend_from_slice(&[0xff, 0xff]);
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&[0x00, 0x00]);
        packet.extend_from_slice(&[0x02, 0x04, 0x05, 0xb4]);

        packet.extend_from_slice(payload);
        // Ethernet trailer padding must not leak into the payload
        packet.extend_from_slice(&[0, 0]);
        packet
    }

    // Test 1: Ethernet/IPv4/TCP decoding
    #[test]
    fn test_decode_tcp() {
        let frame = ethernet_ipv4_tcp(0x18, b"GET /");
        let packet = Packet::decode(link_types::ETHERNET, 42, &frame).unwrap().unwrap();

        assert_eq!(packet.timestamp, 42);
        assert_eq!(packet.network_proto(), "IPv4");
        assert_eq!(packet.link_proto(), "Ethernet");
        let seg = packet.tcp_segment().unwrap();
        assert_eq!(seg.src_port, 12345);
        assert_eq!(seg.dst_port, 80);
        assert_eq!(seg.seq, 1000);
        assert!(seg.flags.psh && seg.flags.ack && !seg.flags.syn);
        assert_eq!(seg.options.mss, Some(1460));
        assert_eq!(&packet.payload[..], b"GET /");
    }

    // Test 2: Zero checksum is detected as invalid
    #[test]
    fn test_checksum_mismatch() {
        let frame = ethernet_ipv4_tcp(0x02, b"");
        let packet = Packet::decode(link_types::ETHERNET, 0, &frame).unwrap().unwrap();
        assert!(!packet.tcp_segment().unwrap().checksum_ok);
    }

    // Test 3: Unsupported link type
    #[test]
    fn test_unsupported_link_type() {
        let err = Packet::decode(9999, 0, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedLinkType { link_type: 9999 }));
    }

    // Test 4: Non-IP frames are skipped
    #[test]
    fn test_arp_is_skipped() {
        let mut frame = vec![0xff; 12];
        frame.extend_from_slice(&[0x08, 0x06]);
        frame.extend_from_slice(&[0u8; 28]);
        assert!(Packet::decode(link_types::ETHERNET, 0, &frame).unwrap().is_none());
    }

    // Test 5: Raw IP link type with UDP
    #[test]
    fn test_decode_raw_udp() {
        let mut frame = vec![0x45, 0x00, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 64, 17, 0, 0];
        frame.extend_from_slice(&[10, 0, 0, 1]);
        frame.extend_from_slice(&[10, 0, 0, 2]);
        frame.extend_from_slice(&5353u16.to_be_bytes());
        frame.extend_from_slice(&53u16.to_be_bytes());
        frame.extend_from_slice(&12u16.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(b"ping");

        let packet = Packet::decode(link_types::RAW, 7, &frame).unwrap().unwrap();
        assert_eq!(packet.transport_flow(), Some(TransportFlow::new(5353, 53)));
        assert_eq!(&packet.payload[..], b"ping");
        assert!(packet.flow_key().is_some());
    }
}
