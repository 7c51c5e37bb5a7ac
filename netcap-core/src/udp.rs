//! UDP pseudo-streams.
//!
//! UDP has no handshake to order a conversation by, so datagrams are simply
//! collected per transport flow (the port pair, direction independent) and
//! processed once at shutdown:
//!
//! - datagrams are sorted by capture timestamp
//! - the sender of the first datagram is the client
//! - the server banner is the first `banner_size` bytes sent by the other side
//! - the merged conversation goes through the credential harvesters, the
//!   service store and, when enabled, conversation saving

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use compact_str::CompactString;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::capture::{Packet, Transport};
use crate::context::Context;
use crate::files;
use crate::flow::{ident, NetFlow, TransportFlow};
use crate::record::{ConnectionRecord, Record};
use crate::service::{port_service, ServiceObservation};
use crate::stream::ConversationInfo;
use crate::workers::run_parallel;

#[derive(Debug, Clone)]
struct Datagram {
    data: Bytes,
    timestamp: i64,
    net: NetFlow,
    transport: TransportFlow,
}

/// All datagrams of one port pair.
#[derive(Debug)]
pub struct UdpStream {
    id: u64,
    link_proto: &'static str,
    network_proto: &'static str,
    datagrams: Vec<Datagram>,
}

/// A UDP stream with roles assigned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpConversation {
    pub info: ConversationInfo,
    /// Start of the server side, at most `banner_size` bytes.
    pub banner: Bytes,
    /// Every payload in timestamp order.
    pub data: Bytes,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub packets: u64,
    pub last_packet: i64,
}

impl UdpStream {
    pub fn len(&self) -> usize {
        self.datagrams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.datagrams.is_empty()
    }

    /// Order the datagrams and split them into client and server side.
    pub fn conversation(&mut self, banner_size: usize) -> Option<UdpConversation> {
        self.datagrams.sort_by_key(|d| d.timestamp);
        let first = self.datagrams.first()?;
        let client_net = first.net;
        let client_transport = first.transport;

        let mut banner = BytesMut::new();
        let mut data = BytesMut::new();
        let mut client_bytes = 0;
        let mut server_bytes = 0;

        for datagram in &self.datagrams {
            data.extend_from_slice(&datagram.data);
            if datagram.transport == client_transport {
                client_bytes += datagram.data.len() as u64;
                continue;
            }
            server_bytes += datagram.data.len() as u64;
            let room = banner_size.saturating_sub(banner.len());
            let take = room.min(datagram.data.len());
            banner.extend_from_slice(&datagram.data[..take]);
        }

        Some(UdpConversation {
            info: ConversationInfo {
                ident: ident(&client_net, &client_transport),
                timestamp: first.timestamp,
                client_ip: client_net.src,
                client_port: client_transport.src,
                server_ip: client_net.dst,
                server_port: client_transport.dst,
                transport: "UDP",
            },
            banner: banner.freeze(),
            data: data.freeze(),
            client_bytes,
            server_bytes,
            packets: self.datagrams.len() as u64,
            last_packet: self.datagrams.last().map_or(first.timestamp, |d| d.timestamp),
        })
    }
}

/// UDP streams keyed by transport flow hash.
#[derive(Debug, Default)]
pub struct UdpPool {
    streams: Mutex<HashMap<u64, UdpStream>>,
}

impl UdpPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a datagram to its stream. Returns `true` when the stream is new.
    ///
    /// Packets without a network or UDP layer are ignored.
    pub fn handle(&self, packet: &Packet) -> bool {
        let (Some(net), Some(Transport::Udp(udp))) = (packet.network, &packet.transport) else {
            return false;
        };
        let transport = TransportFlow::new(udp.src_port, udp.dst_port);
        let datagram = Datagram {
            data: packet.payload.clone(),
            timestamp: packet.timestamp,
            net,
            transport,
        };

        let mut streams = self.streams.lock();
        match streams.get_mut(&transport.fast_hash()) {
            Some(stream) => {
                stream.datagrams.push(datagram);
                false
            }
            None => {
                let id = packet.flow_key().map(|k| k.id()).unwrap_or_default();
                streams.insert(
                    transport.fast_hash(),
                    UdpStream {
                        id,
                        link_proto: packet.link_proto(),
                        network_proto: packet.network_proto(),
                        datagrams: vec![datagram],
                    },
                );
                true
            }
        }
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }

    /// Process every stream on the worker pool and empty the pool.
    pub fn flush(&self, ctx: &Context) -> usize {
        let streams: Vec<UdpStream> = self.streams.lock().drain().map(|(_, s)| s).collect();
        let count = streams.len();
        if count == 0 {
            return 0;
        }
        info!(streams = count, "Flushing UDP streams");
        run_parallel("udp-flush", ctx.config.num_stream_workers, streams, |stream| {
            if !ctx.is_fatal() {
                save_stream(ctx, stream);
            }
        });
        count
    }
}

/// Harvest, fingerprint and record one stream.
fn save_stream(ctx: &Context, mut stream: UdpStream) {
    let Some(conversation) = stream.conversation(ctx.config.banner_size) else {
        return;
    };
    let info = &conversation.info;
    debug!(
        ident = %info.ident,
        packets = conversation.packets,
        client_bytes = conversation.client_bytes,
        server_bytes = conversation.server_bytes,
        "Saving UDP stream"
    );

    ctx.harvest(info, &conversation.data);
    if ctx.config.save_conns {
        files::save_conversation(ctx, info, &conversation.data);
    }

    ctx.services.observe(ServiceObservation {
        timestamp: info.timestamp,
        ip: info.server_ip,
        port: info.server_port,
        transport: "UDP",
        banner: &conversation.banner,
        ident: &info.ident,
        server_bytes: conversation.server_bytes,
        client_bytes: conversation.client_bytes,
    });

    ctx.write(Record::Connection(ConnectionRecord {
        id: stream.id,
        timestamp_first: info.timestamp,
        timestamp_last: conversation.last_packet,
        link_proto: CompactString::new(stream.link_proto),
        network_proto: CompactString::new(stream.network_proto),
        transport_proto: CompactString::new("UDP"),
        ident: info.ident.clone(),
        src_ip: info.client_ip.to_string(),
        src_port: info.client_port,
        dst_ip: info.server_ip.to_string(),
        dst_port: info.server_port,
        total_packets: conversation.packets,
        total_bytes: conversation.client_bytes + conversation.server_bytes,
        client_bytes: conversation.client_bytes,
        server_bytes: conversation.server_bytes,
        application: CompactString::new(port_service(info.server_port, "UDP").unwrap_or_default()),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::record::MemorySink;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn client_to_server(ts: i64, payload: &[u8]) -> Packet {
        Packet::udp(ts, NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 53)), 40000, 53, payload)
    }

    fn server_to_client(ts: i64, payload: &[u8]) -> Packet {
        Packet::udp(ts, NetFlow::new(ip(10, 0, 0, 53), ip(10, 0, 0, 1)), 53, 40000, payload)
    }

    // Test 1: Both directions share one stream
    #[test]
    fn test_handle_keys_by_port_pair() {
        let pool = UdpPool::new();
        assert!(pool.handle(&client_to_server(1, b"q")));
        assert!(!pool.handle(&server_to_client(2, b"a")));
        assert!(pool.handle(&Packet::udp(3, NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2)), 5000, 6000, b"x")));
        assert_eq!(pool.len(), 2);
    }

    // Test 2: Out-of-order datagrams are sorted before roles are assigned
    #[test]
    fn test_out_of_order() {
        let pool = UdpPool::new();
        pool.handle(&server_to_client(20, b"answer"));
        pool.handle(&client_to_server(10, b"query"));
        pool.handle(&client_to_server(30, b"again"));

        let mut streams = pool.streams.lock();
        let stream = streams.values_mut().next().unwrap();
        let conversation = stream.conversation(512).unwrap();

        assert_eq!(conversation.info.ident, "10.0.0.1:40000->10.0.0.53:53");
        assert_eq!(conversation.info.server_port, 53);
        assert_eq!(conversation.info.timestamp, 10);
        assert_eq!(conversation.data, Bytes::from_static(b"queryansweragain"));
        assert_eq!(conversation.banner, Bytes::from_static(b"answer"));
        assert_eq!((conversation.client_bytes, conversation.server_bytes), (10, 6));
        assert_eq!(conversation.last_packet, 30);
    }

    // Test 3: Banner cut at exactly the budget across datagrams
    #[test]
    fn test_banner_exact_size() {
        let pool = UdpPool::new();
        pool.handle(&client_to_server(1, b"hello"));
        pool.handle(&server_to_client(2, b"0123456"));
        pool.handle(&server_to_client(3, b"789abcdef"));

        let mut streams = pool.streams.lock();
        let stream = streams.values_mut().next().unwrap();
        let conversation = stream.conversation(10).unwrap();
        assert_eq!(conversation.banner, Bytes::from_static(b"0123456789"));
        assert_eq!(conversation.server_bytes, 16);
    }

    // Test 4: Flush writes connection and service records
    #[test]
    fn test_flush() {
        let sink = Arc::new(MemorySink::new());
        let config = Config {
            num_stream_workers: 2,
            ..Default::default()
        };
        let ctx = Context::new(config, sink.clone()).unwrap();
        let pool = UdpPool::new();
        pool.handle(&client_to_server(1, b"query"));
        pool.handle(&server_to_client(2, b"answer"));
        pool.handle(&Packet::udp(3, NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2)), 5000, 6000, b"x"));

        assert_eq!(pool.flush(&ctx), 2);
        assert!(pool.is_empty());
        assert_eq!(sink.count("connection"), 2);

        let dns = ctx.services.get(ip(10, 0, 0, 53), 53).unwrap();
        assert_eq!(dns.name, "DNS");
        assert_eq!(dns.protocol, "UDP");
        assert_eq!(dns.banner, b"answer".to_vec());
        // no server data on the second stream
        assert_eq!(ctx.services.len(), 1);

        let dns_conn = sink
            .records()
            .into_iter()
            .find_map(|r| match r {
                Record::Connection(c) if c.dst_port == 53 => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(dns_conn.transport_proto, "UDP");
        assert_eq!(dns_conn.application, "DNS");
        assert_eq!(dns_conn.total_packets, 2);
    }
}
