//! Flow identity.
//!
//! A [`FlowKey`] bundles one 64-bit hash per layer (link, network, transport).
//! Each hash covers both endpoints in a canonical order, so the two directions
//! of a conversation produce the same key. Direction is kept separately by the
//! [`NetFlow`] and [`TransportFlow`] endpoint pairs.

use std::fmt;
use std::net::IpAddr;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Order-independent hash of two endpoints.
fn symmetric_hash(a: &[u8], b: &[u8]) -> u64 {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    fnv1a(fnv1a(FNV_OFFSET, lo), hi)
}

fn ip_bytes(ip: &IpAddr) -> Vec<u8> {
    match ip {
        IpAddr::V4(v4) => v4.octets().to_vec(),
        IpAddr::V6(v6) => v6.octets().to_vec(),
    }
}

/// Source and destination address of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetFlow {
    pub src: IpAddr,
    pub dst: IpAddr,
}

impl NetFlow {
    pub fn new(src: IpAddr, dst: IpAddr) -> Self {
        Self { src, dst }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Hash that is identical for both directions.
    pub fn fast_hash(&self) -> u64 {
        symmetric_hash(&ip_bytes(&self.src), &ip_bytes(&self.dst))
    }
}

/// Source and destination port of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportFlow {
    pub src: u16,
    pub dst: u16,
}

impl TransportFlow {
    pub fn new(src: u16, dst: u16) -> Self {
        Self { src, dst }
    }

    pub fn reverse(&self) -> Self {
        Self {
            src: self.dst,
            dst: self.src,
        }
    }

    /// Hash that is identical for both directions.
    pub fn fast_hash(&self) -> u64 {
        symmetric_hash(&self.src.to_be_bytes(), &self.dst.to_be_bytes())
    }
}

/// Per-layer flow hashes of one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FlowKey {
    pub link: u64,
    pub network: u64,
    pub transport: u64,
}

impl FlowKey {
    /// Build a key from the link (MAC) pair, if any, and the network and transport flows.
    pub fn new(link: Option<([u8; 6], [u8; 6])>, net: &NetFlow, transport: &TransportFlow) -> Self {
        Self {
            link: link.map(|(s, d)| symmetric_hash(&s, &d)).unwrap_or(0),
            network: net.fast_hash(),
            transport: transport.fast_hash(),
        }
    }

    /// Single identifier for the connection, mixed from all three layers.
    pub fn id(&self) -> u64 {
        let mut h = FNV_OFFSET;
        h = fnv1a(h, &self.link.to_be_bytes());
        h = fnv1a(h, &self.network.to_be_bytes());
        fnv1a(h, &self.transport.to_be_bytes())
    }
}

/// Connection identifier in `srcIP:srcPort->dstIP:dstPort` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ident {
    pub net: NetFlow,
    pub transport: TransportFlow,
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.net.src, self.transport.src, self.net.dst, self.transport.dst
        )
    }
}

/// Format an ident string for a directed flow.
pub fn ident(net: &NetFlow, transport: &TransportFlow) -> String {
    Ident {
        net: *net,
        transport: *transport,
    }
    .to_string()
}

/// Reverse an ident string (`a->b` becomes `b->a`).
pub fn reverse_ident(ident: &str) -> String {
    match ident.split_once("->") {
        Some((a, b)) => format!("{}->{}", b, a),
        None => ident.to_string(),
    }
}

/// Make an ident safe for use in a file name.
pub fn clean_ident(ident: &str) -> String {
    ident
        .chars()
        .map(|c| match c {
            ':' | '/' | '\\' => '-',
            '>' => '_',
            c => c,
        })
        .collect::<String>()
        .replace("-_", "--")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    // Test 1: Both directions hash the same
    #[test]
    fn test_symmetric_hashes() {
        let net = NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2));
        let tp = TransportFlow::new(40000, 80);

        assert_eq!(net.fast_hash(), net.reverse().fast_hash());
        assert_eq!(tp.fast_hash(), tp.reverse().fast_hash());

        let a = FlowKey::new(None, &net, &tp);
        let b = FlowKey::new(None, &net.reverse(), &tp.reverse());
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());
    }

    // Test 2: Different endpoints hash differently
    #[test]
    fn test_distinct_flows() {
        let tp = TransportFlow::new(40000, 80);
        let a = FlowKey::new(None, &NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2)), &tp);
        let b = FlowKey::new(None, &NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 3)), &tp);
        assert_ne!(a.id(), b.id());
    }

    // Test 3: Ident formatting and reversal
    #[test]
    fn test_ident() {
        let net = NetFlow::new(ip(192, 168, 1, 2), ip(1, 2, 3, 4));
        let tp = TransportFlow::new(51000, 443);
        let s = ident(&net, &tp);
        assert_eq!(s, "192.168.1.2:51000->1.2.3.4:443");
        assert_eq!(reverse_ident(&s), "1.2.3.4:443->192.168.1.2:51000");
        assert_eq!(ident(&net.reverse(), &tp.reverse()), reverse_ident(&s));
    }

    // Test 4: Clean ident has no path separators
    #[test]
    fn test_clean_ident() {
        let cleaned = clean_ident("192.168.1.2:51000->1.2.3.4:443");
        assert!(!cleaned.contains(':'));
        assert!(!cleaned.contains('>'));
        assert!(!cleaned.contains('/'));
        assert_eq!(cleaned, "192.168.1.2-51000--1.2.3.4-443");
    }
}
