//! Packet processing entry point.
//!
//! [`Engine`] owns the shared [`Context`], the TCP connection table and the
//! UDP pool. It is `Sync`: packet workers call [`Engine::process_packet`]
//! concurrently, each connection serialising its own segments under its lock.
//!
//! ## Lifecycle
//!
//! 1. Every packet goes to the connection table (TCP) or the UDP pool.
//! 2. A segment that ends its connection (RST, or FIN both ways) completes it
//!    on the spot.
//! 3. Every `flush_every` packets, connections idle for longer than
//!    `close_inactive_timeout` are evicted and completed on a background
//!    thread, and out-of-order data older than `close_pending_timeout` is
//!    forced out.
//! 4. [`Engine::shutdown`] waits for the background completions, drains the
//!    table together with every batch still being completed on a worker pool,
//!    joins the eviction threads, flushes the UDP pool and writes the services.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::capture::{CaptureReader, Packet, RawFrame, Transport};
use crate::config::Config;
use crate::context::Context;
use crate::error::Result;
use crate::record::RecordSink;
use crate::stats::{Stats, StatsSnapshot};
use crate::stream::{ConnectionTable, TcpConnection};
use crate::udp::UdpPool;
use crate::workers::run_parallel;

const WAIT_POLL: Duration = Duration::from_millis(5);

/// Connections evicted by one sweep and the thread completing them.
struct Eviction {
    handle: JoinHandle<()>,
    connections: Vec<Arc<TcpConnection>>,
}

impl Eviction {
    fn join(self) {
        if self.handle.join().is_err() {
            warn!("Eviction thread panicked");
        }
    }
}

pub struct Engine {
    ctx: Arc<Context>,
    connections: ConnectionTable,
    udp: UdpPool,
    /// Packets since start, drives the periodic sweep.
    processed: AtomicU64,
    /// Background completions of evicted connections.
    pending: Mutex<Vec<Eviction>>,
}

impl Engine {
    pub fn new(config: Config, sink: Arc<dyn RecordSink>) -> Result<Self> {
        Ok(Self {
            ctx: Arc::new(Context::new(config, sink)?),
            connections: ConnectionTable::new(),
            udp: UdpPool::new(),
            processed: AtomicU64::new(0),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn udp(&self) -> &UdpPool {
        &self.udp
    }

    /// Process every frame of a capture, then shut down.
    pub fn run(&self, reader: CaptureReader) -> Result<StatsSnapshot> {
        for frame in reader {
            self.process_frame(&frame?)?;
        }
        self.shutdown()
    }

    /// Decode one captured frame and process it.
    pub fn process_frame(&self, frame: &RawFrame) -> Result<()> {
        match self.decode(frame)? {
            Some(packet) => self.process_packet(&packet),
            None => Ok(()),
        }
    }

    /// Decode a frame. Frames without an IP layer are counted as ignored.
    ///
    /// An unsupported link type is an error.
    pub fn decode(&self, frame: &RawFrame) -> Result<Option<Packet>> {
        let packet = Packet::decode(frame.link_type, frame.timestamp, &frame.data)?;
        if packet.is_none() {
            Stats::incr(&self.ctx.stats.packets);
            Stats::incr(&self.ctx.stats.ignored_packets);
        }
        Ok(packet)
    }

    /// Process one decoded packet.
    ///
    /// Fails only when the record sink failed, at which point the run must stop.
    pub fn process_packet(&self, packet: &Packet) -> Result<()> {
        let stats = &self.ctx.stats;
        Stats::incr(&stats.packets);

        match (&packet.transport, packet.network) {
            (Some(Transport::Tcp(seg)), Some(net)) => {
                Stats::incr(&stats.tcp_packets);
                if let (Some(key), Some(transport)) = (packet.flow_key(), packet.transport_flow()) {
                    let (conn, created) = self.connections.get_or_create(
                        key,
                        packet,
                        net,
                        transport,
                        self.ctx.config.allow_missing_init,
                    );
                    if created {
                        Stats::incr(&stats.connections_created);
                    }
                    if conn.handle_segment(packet, seg, &net, &transport, &self.ctx) {
                        self.finish(&conn);
                    }
                }
            }
            (Some(Transport::Udp(_)), Some(_)) => {
                Stats::incr(&stats.udp_packets);
                if self.udp.handle(packet) {
                    Stats::incr(&stats.udp_streams);
                }
            }
            _ => Stats::incr(&stats.ignored_packets),
        }

        let flush_every = self.ctx.config.flush_every as u64;
        let count = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if flush_every > 0 && count % flush_every == 0 {
            self.sweep(packet.timestamp);
        }

        self.ctx.check_fatal()
    }

    fn finish(&self, conn: &Arc<TcpConnection>) {
        if conn.complete(&self.ctx) {
            self.connections.remove(&conn.key());
        }
    }

    /// Evict idle connections and force out stale out-of-order data.
    ///
    /// `now` is the capture timestamp of the current packet.
    pub fn sweep(&self, now: i64) {
        let idle = self.connections.evict_idle(now - self.ctx.config.inactive_us());
        if !idle.is_empty() {
            debug!(count = idle.len(), "Evicting idle connections");
            self.complete_in_background(idle);
        }

        let cutoff = now - self.ctx.config.pending_us();
        for conn in self.connections.snapshot() {
            conn.flush_older_than(cutoff, &self.ctx);
        }

        let finished: Vec<Eviction> = {
            let mut pending = self.pending.lock();
            let (finished, running) = std::mem::take(&mut *pending).into_iter().partition(|e| e.handle.is_finished());
            *pending = running;
            finished
        };
        finished.into_iter().for_each(Eviction::join);
    }

    fn complete_in_background(&self, connections: Vec<Arc<TcpConnection>>) {
        let ctx = Arc::clone(&self.ctx);
        let batch = connections.clone();
        let spawned = thread::Builder::new()
            .name("netcap-evict".into())
            .spawn(move || {
                for conn in batch {
                    conn.complete(&ctx);
                }
            });
        match spawned {
            Ok(handle) => self.pending.lock().push(Eviction { handle, connections }),
            Err(e) => {
                warn!(error = %e, "Failed to spawn eviction thread, completing inline");
                for conn in connections {
                    conn.complete(&self.ctx);
                }
            }
        }
    }

    /// Finish the run: wait for background completions, drain the table,
    /// flush the UDP pool and write the service records.
    pub fn shutdown(&self) -> Result<StatsSnapshot> {
        let config = &self.ctx.config;
        let unfinished = self.wait_for_pending();

        // Batches still in flight are drained as well, completing twice is a no-op
        let mut remaining = self.connections.drain();
        for eviction in &unfinished {
            remaining.extend(eviction.connections.iter().cloned());
        }
        if !remaining.is_empty() {
            info!(connections = remaining.len(), workers = config.num_stream_workers, "Draining connections");
        }
        run_parallel("netcap-drain", config.num_stream_workers, remaining, |conn| {
            if !self.ctx.is_fatal() {
                conn.complete(&self.ctx);
            }
        });
        unfinished.into_iter().for_each(Eviction::join);

        self.udp.flush(&self.ctx);
        self.ctx.services.write_all(&self.ctx);

        let stats = self.stats();
        log_summary(&stats);
        self.ctx.check_fatal()?;
        Ok(stats)
    }

    /// Wait for the eviction threads, bounded by `connection_wait_timeout`.
    ///
    /// Returns the evictions that have not finished yet.
    fn wait_for_pending(&self) -> Vec<Eviction> {
        let evictions: Vec<Eviction> = std::mem::take(&mut *self.pending.lock());
        if evictions.is_empty() {
            return evictions;
        }

        let config = &self.ctx.config;
        if config.wait_for_connections {
            let deadline = Instant::now() + config.connection_wait_timeout;
            while evictions.iter().any(|e| !e.handle.is_finished()) && Instant::now() < deadline {
                thread::sleep(WAIT_POLL);
            }
        }

        let (finished, unfinished): (Vec<_>, Vec<_>) = evictions.into_iter().partition(|e| e.handle.is_finished());
        finished.into_iter().for_each(Eviction::join);
        if !unfinished.is_empty() {
            let connections: usize = unfinished.iter().map(|e| e.connections.len()).sum();
            warn!(connections, "Connections still completing at shutdown, draining the rest");
        }
        unfinished
    }
}

fn log_summary(stats: &StatsSnapshot) {
    info!(
        packets = stats.packets,
        tcp = stats.tcp_packets,
        udp = stats.udp_packets,
        ignored = stats.ignored_packets,
        connections = stats.connections_created,
        completed = stats.connections_completed,
        udp_streams = stats.udp_streams,
        reject_fsm = stats.reject_fsm,
        reject_conn_fsm = stats.reject_conn_fsm,
        reject_opt = stats.reject_opt,
        reject_checksum = stats.reject_checksum,
        reassembled_chunks = stats.reassembled_chunks,
        missed_bytes = stats.missed_bytes,
        out_of_order_packets = stats.out_of_order_packets,
        overlap_packets = stats.overlap_packets,
        biggest_chunk_bytes = stats.biggest_chunk_bytes,
        http_requests = stats.http_requests,
        http_responses = stats.http_responses,
        unmatched_http_responses = stats.unmatched_http_responses,
        unanswered_http_requests = stats.unanswered_http_requests,
        mails = stats.mails,
        credentials = stats.credentials,
        services = stats.services,
        files = stats.extracted_files,
        saved_tcp = stats.saved_tcp_connections,
        saved_udp = stats.saved_udp_connections,
        parse_errors = stats.parse_errors,
        "Processing finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{TcpFlags, TcpSegment};
    use crate::flow::NetFlow;
    use crate::record::{MemorySink, Record};
    use std::io;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(a: u8, b: u8, c: u8, d: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(a, b, c, d))
    }

    fn engine(config: Config) -> (Arc<MemorySink>, Engine) {
        let sink = Arc::new(MemorySink::new());
        let engine = Engine::new(config, sink.clone()).unwrap();
        (sink, engine)
    }

    fn client(ts: i64, port: u16, seq: u32, flags: TcpFlags, payload: &[u8]) -> Packet {
        let net = NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 2));
        Packet::tcp(ts, net, TcpSegment::new(40000, port, seq, flags), payload)
    }

    fn server(ts: i64, port: u16, seq: u32, flags: TcpFlags, payload: &[u8]) -> Packet {
        let net = NetFlow::new(ip(10, 0, 0, 2), ip(10, 0, 0, 1));
        Packet::tcp(ts, net, TcpSegment::new(port, 40000, seq, flags), payload)
    }

    /// Handshake, one request and one response, no teardown.
    fn open_exchange(engine: &Engine, ts: i64, port: u16, request: &[u8], response: &[u8]) {
        engine.process_packet(&client(ts, port, 100, TcpFlags::SYN, b"")).unwrap();
        engine.process_packet(&server(ts + 1, port, 500, TcpFlags::SYN_ACK, b"")).unwrap();
        engine.process_packet(&client(ts + 2, port, 101, TcpFlags::PSH_ACK, request)).unwrap();
        engine.process_packet(&server(ts + 3, port, 501, TcpFlags::PSH_ACK, response)).unwrap();
    }

    struct FailingSink;

    impl RecordSink for FailingSink {
        fn write(&self, _: &Record) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Other, "disk full"))
        }
    }

    /// Sink that stalls on connection records.
    struct SlowSink {
        inner: MemorySink,
        delay: Duration,
    }

    impl RecordSink for SlowSink {
        fn write(&self, record: &Record) -> io::Result<()> {
            if matches!(record, Record::Connection(_)) {
                thread::sleep(self.delay);
            }
            self.inner.write(record)
        }
    }

    /// Evict one half-open connection onto a background thread of a slow sink.
    fn evict_slowly(config: Config) -> (Arc<SlowSink>, Engine) {
        let sink = Arc::new(SlowSink {
            inner: MemorySink::new(),
            delay: Duration::from_millis(300),
        });
        let engine = Engine::new(
            Config {
                flush_every: 1,
                close_inactive_timeout: Duration::from_secs(1),
                ..config
            },
            sink.clone(),
        )
        .unwrap();
        engine.process_packet(&client(1, 80, 100, TcpFlags::SYN, b"")).unwrap();
        engine
            .process_packet(&Packet::udp(5_000_000, NetFlow::new(ip(10, 0, 0, 9), ip(10, 0, 0, 8)), 1, 2, b"x"))
            .unwrap();
        assert!(engine.connections().is_empty());
        (sink, engine)
    }

    fn tcp_connections(sink: &MemorySink) -> usize {
        sink.records()
            .iter()
            .filter(|r| matches!(r, Record::Connection(c) if c.transport_proto == "TCP"))
            .count()
    }

    // Test 1: Packet kinds are counted
    #[test]
    fn test_packet_counters() {
        let (_, engine) = engine(Config::default());
        engine.process_packet(&client(1, 80, 100, TcpFlags::SYN, b"")).unwrap();
        engine
            .process_packet(&Packet::udp(2, NetFlow::new(ip(10, 0, 0, 1), ip(10, 0, 0, 53)), 4000, 53, b"q"))
            .unwrap();

        let stats = engine.stats();
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.tcp_packets, 1);
        assert_eq!(stats.udp_packets, 1);
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.udp_streams, 1);
    }

    // Test 2: FIN in both directions completes the connection immediately
    #[test]
    fn test_completion_on_fin() {
        let (sink, engine) = engine(Config {
            remove_closed_streams: true,
            ..Default::default()
        });
        open_exchange(
            &engine,
            1,
            80,
            b"GET / HTTP/1.1\r\nHost: a\r\n\r\n",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        );
        engine.process_packet(&client(5, 80, 128, TcpFlags::FIN_ACK, b"")).unwrap();
        engine.process_packet(&server(6, 80, 541, TcpFlags::FIN_ACK, b"")).unwrap();

        assert_eq!(sink.count("connection"), 1);
        assert_eq!(sink.count("http"), 1);
        assert!(engine.connections().is_empty());
    }

    // Test 3: Shutdown drains live connections and writes services once
    #[test]
    fn test_shutdown_drain() {
        let (sink, engine) = engine(Config {
            num_stream_workers: 2,
            ..Default::default()
        });
        open_exchange(&engine, 1, 21, b"USER ftpuser\r\n", b"220 (vsFTPd 3.0.3)\r\n");
        open_exchange(&engine, 10, 80, b"GET / HTTP/1.1\r\n\r\n", b"HTTP/1.1 204 No Content\r\n\r\n");

        let stats = engine.shutdown().unwrap();
        assert_eq!(stats.connections_completed, 2);
        assert_eq!(sink.count("connection"), 2);
        assert_eq!(sink.count("service"), 2);
        assert!(engine.connections().is_empty());

        let ftp = engine.context().services.get(ip(10, 0, 0, 2), 21).unwrap();
        assert_eq!(ftp.product, "vsftpd");
    }

    // Test 4: Idle connections are evicted by the periodic sweep
    #[test]
    fn test_idle_eviction() {
        let (sink, engine) = engine(Config {
            flush_every: 1,
            close_inactive_timeout: Duration::from_secs(1),
            ..Default::default()
        });
        open_exchange(&engine, 1, 80, b"GET / HTTP/1.1\r\n\r\n", b"HTTP/1.1 204 No Content\r\n\r\n");
        assert_eq!(engine.connections().len(), 1);

        // a packet of another flow two seconds later triggers the sweep
        engine
            .process_packet(&Packet::udp(2_000_010, NetFlow::new(ip(10, 0, 0, 9), ip(10, 0, 0, 8)), 1, 2, b"x"))
            .unwrap();
        assert!(engine.connections().is_empty());

        engine.shutdown().unwrap();
        assert_eq!(sink.count("connection"), 2);
        assert_eq!(engine.stats().connections_completed, 1);
    }

    // Test 5: Sink failure stops the run
    #[test]
    fn test_sink_failure_is_fatal() {
        let engine = Engine::new(
            Config {
                remove_closed_streams: true,
                ..Default::default()
            },
            Arc::new(FailingSink),
        )
        .unwrap();
        open_exchange(&engine, 1, 9999, b"hello", b"world");
        engine.process_packet(&client(5, 9999, 106, TcpFlags::FIN_ACK, b"")).unwrap();
        let result = engine.process_packet(&server(6, 9999, 506, TcpFlags::FIN_ACK, b""));
        assert!(matches!(result, Err(crate::error::Error::Sink(_))));
        assert!(engine.shutdown().is_err());
    }

    // Test 6: Shutdown without waiting still writes connections evicted in the background
    #[test]
    fn test_shutdown_without_wait_keeps_evicted() {
        let (sink, engine) = evict_slowly(Config {
            wait_for_connections: false,
            ..Default::default()
        });

        let stats = engine.shutdown().unwrap();
        assert_eq!(tcp_connections(&sink.inner), 1);
        assert_eq!(stats.connections_completed, 1);
        assert!(engine.pending.lock().is_empty());
    }

    // Test 7: A timed out wait hands the evicted batch to the drain
    #[test]
    fn test_shutdown_wait_timeout() {
        let (sink, engine) = evict_slowly(Config {
            wait_for_connections: true,
            connection_wait_timeout: Duration::from_millis(10),
            ..Default::default()
        });

        let stats = engine.shutdown().unwrap();
        assert_eq!(tcp_connections(&sink.inner), 1);
        assert_eq!(sink.inner.count("connection"), 2);
        assert_eq!(stats.connections_completed, 1);
        assert_eq!(stats.duplicate_flushes, 1);
    }

    // Test 8: A finished background completion is collected by the wait
    #[test]
    fn test_shutdown_waits_for_eviction() {
        let (sink, engine) = evict_slowly(Config::default());

        let stats = engine.shutdown().unwrap();
        assert_eq!(tcp_connections(&sink.inner), 1);
        assert_eq!(stats.connections_completed, 1);
        assert_eq!(stats.duplicate_flushes, 0);
    }
}
