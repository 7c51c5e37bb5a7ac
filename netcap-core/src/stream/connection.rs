use std::collections::HashMap;
use std::sync::Arc;

use compact_str::CompactString;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::conversation::{concat, merge_fragments, ConversationInfo};
use super::fsm::{FsmState, OptionChecker, TcpFsm};
use super::reassembly::{Chunk, Segment, StreamBuffer};
use super::{Direction, ReaderKind, StreamFragment, StreamReader};
use crate::capture::{Packet, TcpSegment};
use crate::context::Context;
use crate::files;
use crate::flow::{ident, reverse_ident, FlowKey, NetFlow, TransportFlow};
use crate::record::{ConnectionRecord, Record};
use crate::service::ServiceObservation;
use crate::stats::Stats;

/// Mutable state of a connection, guarded by the connection's own lock.
#[derive(Debug)]
struct ConnectionData {
    ident: String,
    first_packet: i64,
    last_packet: i64,
    /// Client perspective.
    net: NetFlow,
    transport: TransportFlow,
    fsm: TcpFsm,
    options: OptionChecker,
    client: Arc<StreamReader>,
    server: Arc<StreamReader>,
    /// Reassembly buffers indexed by [`Direction::index`].
    buffers: [StreamBuffer; 2],
    fin: [bool; 2],
    total_packets: u64,
    total_bytes: u64,
    /// Oldest packet seen: timestamp and its flow.
    earliest: Option<(i64, NetFlow, TransportFlow)>,
    swapped: bool,
    /// Merged fragment list, built once on first request.
    merged: Option<Arc<Vec<StreamFragment>>>,
    fsm_rejected: bool,
    completed: bool,
    application: CompactString,
}

impl ConnectionData {
    fn direction(&self, net: &NetFlow, transport: &TransportFlow) -> Direction {
        if *net == self.net && *transport == self.transport {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    /// Reader receiving data travelling in `dir`.
    fn reader(&self, dir: Direction) -> &Arc<StreamReader> {
        match dir {
            Direction::ToServer => &self.client,
            Direction::ToClient => &self.server,
        }
    }

    /// Correct client and server roles from the oldest packet seen.
    ///
    /// When a packet older than the recorded first packet was observed and
    /// it travelled the other way, the roles are swapped. The first packet
    /// timestamp is updated at the same time, so a second call is a no-op.
    fn reorder(&mut self) -> bool {
        let Some((timestamp, net, transport)) = self.earliest else {
            return false;
        };
        if timestamp >= self.first_packet {
            return false;
        }
        self.first_packet = timestamp;

        if net == self.net && transport == self.transport {
            return false;
        }

        std::mem::swap(&mut self.client, &mut self.server);
        self.client.retag(Direction::ToServer);
        self.server.retag(Direction::ToClient);
        self.buffers.swap(0, 1);
        self.fin.swap(0, 1);
        self.options.swap();
        self.net = self.net.reverse();
        self.transport = self.transport.reverse();
        self.ident = reverse_ident(&self.ident);
        self.merged = None;
        self.swapped = true;
        true
    }

    fn merged_fragments(&mut self) -> Arc<Vec<StreamFragment>> {
        if let Some(merged) = &self.merged {
            return Arc::clone(merged);
        }
        let merged = Arc::new(merge_fragments(self.client.fragments(), self.server.fragments()));
        self.merged = Some(Arc::clone(&merged));
        merged
    }

    fn info(&self) -> ConversationInfo {
        ConversationInfo {
            ident: self.ident.clone(),
            timestamp: self.first_packet,
            client_ip: self.net.src,
            client_port: self.transport.src,
            server_ip: self.net.dst,
            server_port: self.transport.dst,
            transport: "TCP",
        }
    }
}

/// Point-in-time view of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub ident: String,
    pub first_packet: i64,
    pub last_packet: i64,
    pub total_packets: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub state: FsmState,
    pub swapped: bool,
    pub completed: bool,
}

/// One bidirectional TCP conversation.
#[derive(Debug)]
pub struct TcpConnection {
    id: u64,
    key: FlowKey,
    link_proto: &'static str,
    network_proto: &'static str,
    data: Mutex<ConnectionData>,
}

impl TcpConnection {
    /// Create a connection from its first packet. The sender is the provisional client.
    pub fn new(key: FlowKey, packet: &Packet, net: NetFlow, transport: TransportFlow, allow_missing_init: bool) -> Self {
        Self {
            id: key.id(),
            key,
            link_proto: packet.link_proto(),
            network_proto: packet.network_proto(),
            data: Mutex::new(ConnectionData {
                ident: ident(&net, &transport),
                first_packet: packet.timestamp,
                last_packet: packet.timestamp,
                net,
                transport,
                fsm: TcpFsm::new(allow_missing_init),
                options: OptionChecker::new(),
                client: Arc::new(StreamReader::new(Direction::ToServer)),
                server: Arc::new(StreamReader::new(Direction::ToClient)),
                buffers: [StreamBuffer::new(), StreamBuffer::new()],
                fin: [false; 2],
                total_packets: 0,
                total_bytes: 0,
                earliest: None,
                swapped: false,
                merged: None,
                fsm_rejected: false,
                completed: false,
                application: CompactString::default(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> FlowKey {
        self.key
    }

    pub fn summary(&self) -> ConnectionSummary {
        let data = self.data.lock();
        ConnectionSummary {
            ident: data.ident.clone(),
            first_packet: data.first_packet,
            last_packet: data.last_packet,
            total_packets: data.total_packets,
            client_bytes: data.client.bytes(),
            server_bytes: data.server.bytes(),
            state: data.fsm.state(),
            swapped: data.swapped,
            completed: data.completed,
        }
    }

    pub fn last_packet(&self) -> i64 {
        self.data.lock().last_packet
    }

    pub fn is_completed(&self) -> bool {
        self.data.lock().completed
    }

    /// Apply the direction correction. Exposed for tests and the drain path.
    pub fn reorder(&self) -> bool {
        self.data.lock().reorder()
    }

    /// Merged, timestamp-sorted fragments of both directions.
    pub fn merged_fragments(&self) -> Arc<Vec<StreamFragment>> {
        self.data.lock().merged_fragments()
    }

    /// Process one segment of this connection.
    ///
    /// Returns `true` when the segment completes the connection (RST, or FIN
    /// seen in both directions).
    pub fn handle_segment(&self, packet: &Packet, seg: &TcpSegment, net: &NetFlow, transport: &TransportFlow, ctx: &Context) -> bool {
        let config = &ctx.config;
        let mut data = self.data.lock();

        data.total_packets += 1;
        data.total_bytes += packet.payload.len() as u64;
        if packet.timestamp > data.last_packet {
            data.last_packet = packet.timestamp;
        }
        if data.completed {
            return false;
        }

        let dir = data.direction(net, transport);

        // FSM
        if !data.fsm.check(seg, dir) {
            trace!(ident = %data.ident, state = data.fsm.state().as_str(), "Packet rejected by FSM");
            Stats::incr(&ctx.stats.reject_fsm);
            if !data.fsm_rejected {
                data.fsm_rejected = true;
                Stats::incr(&ctx.stats.reject_conn_fsm);
            }
            if !config.ignore_fsm_err {
                return false;
            }
        }

        // Options
        let next_seq = data.buffers[dir.index()].next_seq();
        if let Err(violation) = data.options.check(seg, packet.payload.len(), dir, next_seq) {
            trace!(ident = %data.ident, ?violation, "Packet rejected by option checker");
            Stats::incr(&ctx.stats.reject_opt);
            if !config.no_opt_check {
                return false;
            }
        }

        // Checksum
        if config.checksum && !seg.checksum_ok {
            trace!(ident = %data.ident, "Invalid checksum");
            Stats::incr(&ctx.stats.reject_checksum);
            return false;
        }

        if data.earliest.map_or(true, |(ts, _, _)| packet.timestamp < ts) {
            data.earliest = Some((packet.timestamp, *net, *transport));
        }

        let mut chunks = Vec::new();
        let mut seq = seg.seq;
        if seg.flags.syn {
            chunks.extend(data.buffers[dir.index()].set_initial_seq(seg.seq));
            seq = seq.wrapping_add(1);
        }
        if !packet.payload.is_empty() {
            let segment = Segment {
                seq,
                data: packet.payload.clone(),
                timestamp: packet.timestamp,
            };
            chunks.extend(data.buffers[dir.index()].add_segment(segment, config.allow_missing_init));
        }
        deliver(&data, dir, chunks, ctx);

        if seg.flags.fin {
            data.fin[dir.index()] = true;
        }

        seg.flags.rst || (data.fin[0] && data.fin[1])
    }

    /// Flush out-of-order data older than `cutoff`.
    pub fn flush_older_than(&self, cutoff: i64, ctx: &Context) {
        let mut data = self.data.lock();
        if data.completed {
            return;
        }
        for dir in [Direction::ToServer, Direction::ToClient] {
            let buffer = &mut data.buffers[dir.index()];
            if buffer.oldest_pending().map_or(true, |ts| ts > cutoff) {
                continue;
            }
            let chunks = buffer.flush_pending(Some(cutoff));
            deliver(&data, dir, chunks, ctx);
        }
    }

    /// Finish the connection: decode the conversation and write its records.
    ///
    /// Safe to call from several paths at once; only the first call produces
    /// records. Returns whether the connection should be removed from the table.
    pub fn complete(&self, ctx: &Context) -> bool {
        let config = &ctx.config;
        let mut data = self.data.lock();

        for dir in [Direction::ToServer, Direction::ToClient] {
            let chunks = data.buffers[dir.index()].flush_pending(None);
            deliver(&data, dir, chunks, ctx);
        }

        data.reorder();
        data.client.close();
        data.server.close();

        let info = data.info();

        if data.client.mark_saved() {
            let merged = data.merged_fragments();
            let conversation = concat(&merged);

            ctx.harvest(&info, &conversation);
            if config.save_conns {
                files::save_conversation(ctx, &info, &conversation);
            }

            let client_start = data.client.banner(config.banner_size);
            let server_start = data.server.banner(config.banner_size);
            let kind = ReaderKind::select(info.server_port, &client_start, &server_start);
            debug!(ident = %info.ident, reader = kind.as_str(), "Decoding conversation");
            data.application = CompactString::new(kind.as_str());
            kind.decode(ctx, &info, &merged, &data.client, &data.server);
        } else {
            Stats::incr(&ctx.stats.duplicate_flushes);
        }

        if data.server.mark_saved() {
            let banner = data.server.banner(config.banner_size);
            ctx.services.observe(ServiceObservation {
                timestamp: info.timestamp,
                ip: info.server_ip,
                port: info.server_port,
                transport: "TCP",
                banner: &banner,
                ident: &info.ident,
                server_bytes: data.server.bytes(),
                client_bytes: data.client.bytes(),
            });
        }

        if !data.completed {
            data.completed = true;
            Stats::incr(&ctx.stats.connections_completed);
            let record = ConnectionRecord {
                id: self.id,
                timestamp_first: data.first_packet,
                timestamp_last: data.last_packet,
                link_proto: CompactString::new(self.link_proto),
                network_proto: CompactString::new(self.network_proto),
                transport_proto: CompactString::new("TCP"),
                ident: info.ident.clone(),
                src_ip: info.client_ip.to_string(),
                src_port: info.client_port,
                dst_ip: info.server_ip.to_string(),
                dst_port: info.server_port,
                total_packets: data.total_packets,
                total_bytes: data.total_bytes,
                client_bytes: data.client.bytes(),
                server_bytes: data.server.bytes(),
                application: data.application.clone(),
            };
            ctx.write(Record::Connection(record));
        }

        config.remove_closed_streams
    }
}

/// Hand reassembled chunks to the reader of their direction.
///
/// Chunks with a gap are dropped, except a start-of-stream gap when missing
/// handshakes are allowed.
fn deliver(data: &ConnectionData, dir: Direction, chunks: Vec<Chunk>, ctx: &Context) {
    let stats = &ctx.stats;
    for chunk in chunks {
        let length = chunk.data.len() as u64;
        Stats::incr(&stats.reassembled_chunks);
        if chunk.skip > 0 {
            Stats::add(&stats.missed_bytes, chunk.skip as u64);
        }
        Stats::add(&stats.out_of_order_packets, u64::from(chunk.stats.queued_packets));
        Stats::add(&stats.out_of_order_bytes, chunk.stats.queued_bytes);
        Stats::add(&stats.overlap_packets, u64::from(chunk.stats.overlap_packets));
        Stats::add(&stats.overlap_bytes, chunk.stats.overlap_bytes);
        Stats::max(&stats.biggest_chunk_bytes, length);
        Stats::max(&stats.biggest_chunk_packets, u64::from(chunk.stats.packets));

        if chunk.skip == -1 && ctx.config.allow_missing_init {
            // start of stream not captured
        } else if chunk.skip != 0 {
            Stats::incr(&stats.dropped_chunks);
            continue;
        }

        Stats::add(&stats.reassembled_bytes, length);
        data.reader(dir).push(chunk.data, chunk.timestamp);
    }
}

/// Live TCP connections keyed by flow.
///
/// The table lock is only held to look up, insert or remove entries; all
/// per-connection work happens under the connection's own lock.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    connections: Mutex<HashMap<FlowKey, Arc<TcpConnection>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the connection of a packet, creating it on first sight.
    ///
    /// Returns the connection and whether it was created.
    pub fn get_or_create(
        &self,
        key: FlowKey,
        packet: &Packet,
        net: NetFlow,
        transport: TransportFlow,
        allow_missing_init: bool,
    ) -> (Arc<TcpConnection>, bool) {
        let mut connections = self.connections.lock();
        if let Some(conn) = connections.get(&key) {
            return (Arc::clone(conn), false);
        }
        let conn = Arc::new(TcpConnection::new(key, packet, net, transport, allow_missing_init));
        connections.insert(key, Arc::clone(&conn));
        (conn, true)
    }

    pub fn get(&self, key: &FlowKey) -> Option<Arc<TcpConnection>> {
        self.connections.lock().get(key).cloned()
    }

    pub fn remove(&self, key: &FlowKey) -> Option<Arc<TcpConnection>> {
        self.connections.lock().remove(key)
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.lock().is_empty()
    }

    /// Number of connections not yet completed.
    pub fn active(&self) -> usize {
        self.snapshot().iter().filter(|c| !c.is_completed()).count()
    }

    /// All connections, without removing them.
    pub fn snapshot(&self) -> Vec<Arc<TcpConnection>> {
        self.connections.lock().values().cloned().collect()
    }

    /// Remove and return connections idle since before `cutoff`.
    pub fn evict_idle(&self, cutoff: i64) -> Vec<Arc<TcpConnection>> {
        let candidates = self.snapshot();
        let idle: Vec<_> = candidates
            .into_iter()
            .filter(|c| c.last_packet() < cutoff)
            .collect();

        let mut connections = self.connections.lock();
        for conn in &idle {
            connections.remove(&conn.key());
        }
        idle
    }

    /// Remove and return every connection.
    pub fn drain(&self) -> Vec<Arc<TcpConnection>> {
        self.connections.lock().drain().map(|(_, c)| c).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::TcpFlags;
    use crate::config::Config;
    use crate::record::MemorySink;
    use crate::stats::StatsSnapshot;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn context(config: Config) -> (Arc<MemorySink>, Context) {
        let sink = Arc::new(MemorySink::new());
        let ctx = Context::new(config, sink.clone()).unwrap();
        (sink, ctx)
    }

    fn client_packet(ts: i64, seq: u32, flags: TcpFlags, payload: &[u8]) -> Packet {
        let net = NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2));
        Packet::tcp(ts, net, TcpSegment::new(40000, 80, seq, flags), payload)
    }

    fn server_packet(ts: i64, seq: u32, flags: TcpFlags, payload: &[u8]) -> Packet {
        let net = NetFlow::new(ip(10, 0, 0, 2), ip(10, 0, 0, 1));
        Packet::tcp(ts, net, TcpSegment::new(80, 40000, seq, flags), payload)
    }

    /// Feed a packet through the table the way the engine does.
    fn feed(table: &ConnectionTable, packet: &Packet, ctx: &Context) -> (Arc<TcpConnection>, bool) {
        let net = packet.network.unwrap();
        let transport = packet.transport_flow().unwrap();
        let key = packet.flow_key().unwrap();
        let (conn, _) = table.get_or_create(key, packet, net, transport, ctx.config.allow_missing_init);
        let done = conn.handle_segment(packet, packet.tcp_segment().unwrap(), &net, &transport, ctx);
        (conn, done)
    }

    // Test 1: Both directions map to the same connection
    #[test]
    fn test_bidirectional_lookup() {
        let (_, ctx) = context(Config::default());
        let table = ConnectionTable::new();

        let (a, _) = feed(&table, &client_packet(1, 100, TcpFlags::SYN, b""), &ctx);
        let (b, _) = feed(&table, &server_packet(2, 500, TcpFlags::SYN_ACK, b""), &ctx);
        assert_eq!(a.id(), b.id());
        assert_eq!(table.len(), 1);
        assert_eq!(a.summary().state, FsmState::Established);
    }

    // Test 2: Full exchange completes on FIN from both sides
    #[test]
    fn test_exchange_and_completion() {
        let (sink, ctx) = context(Config::default());
        let table = ConnectionTable::new();

        feed(&table, &client_packet(1, 100, TcpFlags::SYN, b""), &ctx);
        feed(&table, &server_packet(2, 500, TcpFlags::SYN_ACK, b""), &ctx);
        feed(&table, &client_packet(3, 101, TcpFlags::PSH_ACK, b"GET / HTTP/1.1\r\nHost: a\r\n\r\n"), &ctx);
        feed(&table, &server_packet(4, 501, TcpFlags::PSH_ACK, b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"), &ctx);
        let (_, done) = feed(&table, &client_packet(5, 128, TcpFlags::FIN_ACK, b""), &ctx);
        assert!(!done);
        let (conn, done) = feed(&table, &server_packet(6, 539, TcpFlags::FIN_ACK, b""), &ctx);
        assert!(done);

        assert!(!conn.complete(&ctx));
        let summary = conn.summary();
        assert!(summary.completed);
        assert_eq!(summary.client_bytes, 27);
        assert_eq!(summary.server_bytes, 38);
        assert_eq!(sink.count("connection"), 1);
        assert_eq!(sink.count("http"), 1);

        let record = sink
            .records()
            .into_iter()
            .find_map(|r| match r {
                Record::Connection(c) => Some(c),
                _ => None,
            })
            .unwrap();
        assert_eq!(record.ident, "10.0.0.1:40000->10.0.0.2:80");
        assert_eq!(record.application, "HTTP");
    }

    // Test 3: Segments without handshake are rejected by default
    #[test]
    fn test_missing_init_rejected() {
        let (_, ctx) = context(Config::default());
        let table = ConnectionTable::new();

        let (conn, _) = feed(&table, &client_packet(1, 100, TcpFlags::PSH_ACK, b"data"), &ctx);
        feed(&table, &client_packet(2, 104, TcpFlags::PSH_ACK, b"more"), &ctx);

        assert_eq!(conn.summary().client_bytes, 0);
        let snap = ctx.stats.snapshot();
        assert_eq!(snap.reject_fsm, 2);
        assert_eq!(snap.reject_conn_fsm, 1);
    }

    // Test 4: Late older packet flips roles exactly once
    #[test]
    fn test_direction_swap_once() {
        let (_, ctx) = context(Config {
            allow_missing_init: true,
            ..Default::default()
        });
        let table = ConnectionTable::new();

        // Server reply captured first, client request has an older timestamp
        let (conn, _) = feed(&table, &server_packet(200, 500, TcpFlags::PSH_ACK, b"+OK ready\r\n"), &ctx);
        feed(&table, &client_packet(100, 100, TcpFlags::PSH_ACK, b"USER bob\r\n"), &ctx);
        assert_eq!(conn.summary().ident, "10.0.0.2:80->10.0.0.1:40000");

        assert!(conn.reorder());
        let once = conn.summary();
        assert_eq!(once.ident, "10.0.0.1:40000->10.0.0.2:80");
        assert_eq!(once.first_packet, 100);
        assert_eq!(once.client_bytes, 10);
        assert_eq!(once.server_bytes, 11);
        assert!(once.swapped);

        assert!(!conn.reorder());
        assert_eq!(conn.summary(), once);

        let merged = conn.merged_fragments();
        assert_eq!(merged[0].direction, Direction::ToServer);
        assert_eq!(&merged[0].data[..], b"USER bob\r\n");
        assert_eq!(merged[1].direction, Direction::ToClient);
    }

    // Test 5: Completion from two paths writes once
    #[test]
    fn test_concurrent_completion_writes_once() {
        let (sink, ctx) = context(Config {
            allow_missing_init: true,
            ..Default::default()
        });
        let ctx = Arc::new(ctx);
        let table = ConnectionTable::new();
        let (conn, _) = feed(&table, &client_packet(1, 100, TcpFlags::PSH_ACK, b"hello"), &ctx);
        feed(&table, &server_packet(2, 500, TcpFlags::PSH_ACK, b"SSH-2.0-OpenSSH_8.9\r\n"), &ctx);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let conn = Arc::clone(&conn);
                let ctx = Arc::clone(&ctx);
                std::thread::spawn(move || conn.complete(&ctx))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(sink.count("connection"), 1);
        assert_eq!(ctx.services.len(), 1);
        assert_eq!(ctx.stats.snapshot().duplicate_flushes, 3);
    }

    // Test 6: Gap chunks never reach the readers
    #[test]
    fn test_gap_dropped() {
        let (_, ctx) = context(Config::default());
        let table = ConnectionTable::new();

        feed(&table, &client_packet(1, 100, TcpFlags::SYN, b""), &ctx);
        feed(&table, &server_packet(2, 500, TcpFlags::SYN_ACK, b""), &ctx);
        let (conn, _) = feed(&table, &client_packet(3, 101, TcpFlags::PSH_ACK, b"abc"), &ctx);
        // bytes 104..110 never arrive
        feed(&table, &client_packet(4, 110, TcpFlags::PSH_ACK, b"xyz"), &ctx);

        conn.flush_older_than(10, &ctx);
        assert_eq!(conn.summary().client_bytes, 3);
        let snap = ctx.stats.snapshot();
        assert_eq!(snap.dropped_chunks, 1);
        assert_eq!(snap.missed_bytes, 6);
    }

    // Test 7: Idle eviction
    #[test]
    fn test_evict_idle() {
        let (_, ctx) = context(Config::default());
        let table = ConnectionTable::new();
        feed(&table, &client_packet(1_000, 100, TcpFlags::SYN, b""), &ctx);

        assert!(table.evict_idle(500).is_empty());
        assert_eq!(table.evict_idle(2_000).len(), 1);
        assert!(table.is_empty());
    }

    /// Run packets through a fresh table, returning client bytes and the stats.
    fn run(config: Config, packets: &[Packet]) -> (u64, StatsSnapshot) {
        let (_, ctx) = context(config);
        let table = ConnectionTable::new();
        let mut client_bytes = 0;
        for packet in packets {
            let (conn, _) = feed(&table, packet, &ctx);
            client_bytes = conn.summary().client_bytes;
        }
        (client_bytes, ctx.stats.snapshot())
    }

    // Test 8: A rejected older packet does not flip the roles
    #[test]
    fn test_rejected_packet_no_swap() {
        let (_, ctx) = context(Config::default());
        let table = ConnectionTable::new();

        let (conn, _) = feed(&table, &client_packet(200, 100, TcpFlags::SYN, b""), &ctx);
        feed(&table, &server_packet(100, 500, TcpFlags::PSH_ACK, b"stray"), &ctx);
        assert_eq!(ctx.stats.snapshot().reject_fsm, 1);

        assert!(!conn.reorder());
        let summary = conn.summary();
        assert_eq!(summary.ident, "10.0.0.1:40000->10.0.0.2:80");
        assert!(!summary.swapped);
    }

    // Test 9: FSM violations are soft with ignore_fsm_err
    #[test]
    fn test_ignore_fsm_err() {
        let packets = [
            client_packet(1, 100, TcpFlags::SYN, b""),
            server_packet(2, 500, TcpFlags::SYN_ACK, b""),
            client_packet(3, 101, TcpFlags::RST, b""),
            client_packet(4, 101, TcpFlags::PSH_ACK, b"abc"),
        ];

        let (bytes, stats) = run(Config::default(), &packets);
        assert_eq!(bytes, 0);
        assert_eq!(stats.reject_fsm, 1);
        assert_eq!(stats.reject_conn_fsm, 1);

        let (bytes, stats) = run(
            Config {
                ignore_fsm_err: true,
                ..Default::default()
            },
            &packets,
        );
        assert_eq!(bytes, 3);
        assert_eq!(stats.reject_fsm, 1);
    }

    // Test 10: Option violations are soft with no_opt_check
    #[test]
    fn test_no_opt_check() {
        let mut syn_ack = TcpSegment::new(80, 40000, 500, TcpFlags::SYN_ACK);
        syn_ack.options.mss = Some(4);
        let packets = [
            client_packet(1, 100, TcpFlags::SYN, b""),
            Packet::tcp(2, NetFlow::new(ip(10, 0, 0, 2), ip(10, 0, 0, 1)), syn_ack, b""),
            client_packet(3, 101, TcpFlags::PSH_ACK, b"hello world"),
        ];

        let (bytes, stats) = run(Config::default(), &packets);
        assert_eq!(bytes, 0);
        assert_eq!(stats.reject_opt, 1);

        let (bytes, stats) = run(
            Config {
                no_opt_check: true,
                ..Default::default()
            },
            &packets,
        );
        assert_eq!(bytes, 11);
        assert_eq!(stats.reject_opt, 1);
    }

    // Test 11: Bad checksums are rejected only when verification is on
    #[test]
    fn test_checksum_validation() {
        let mut data = TcpSegment::new(40000, 80, 101, TcpFlags::PSH_ACK);
        data.checksum_ok = false;
        let packets = [
            client_packet(1, 100, TcpFlags::SYN, b""),
            server_packet(2, 500, TcpFlags::SYN_ACK, b""),
            Packet::tcp(3, NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2)), data, b"abc"),
        ];

        let (bytes, stats) = run(Config::default(), &packets);
        assert_eq!(bytes, 3);
        assert_eq!(stats.reject_checksum, 0);

        let (bytes, stats) = run(
            Config {
                checksum: true,
                ..Default::default()
            },
            &packets,
        );
        assert_eq!(bytes, 0);
        assert_eq!(stats.reject_checksum, 1);
        assert_eq!(stats.reject_opt, 0);
    }
}
