//! Run-wide counters.
//!
//! Counters are plain atomics so that packet workers, flush tasks and the
//! drain pool can update them without taking any lock.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),* $(,)?) => {
        /// Atomic counter block shared by all workers.
        #[derive(Debug, Default)]
        pub struct Stats {
            $($(#[$doc])* pub $name: AtomicU64,)*
        }

        /// Point-in-time copy of [`Stats`].
        #[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
        pub struct StatsSnapshot {
            $(pub $name: u64,)*
        }

        impl Stats {
            pub fn snapshot(&self) -> StatsSnapshot {
                StatsSnapshot {
                    $($name: self.$name.load(Ordering::Relaxed),)*
                }
            }
        }
    };
}

counters! {
    /// Packets handed to the engine.
    packets,
    tcp_packets,
    udp_packets,
    /// Packets without a TCP or UDP layer.
    ignored_packets,
    connections_created,
    connections_completed,
    /// Segments failing the TCP state machine.
    reject_fsm,
    /// Connections with at least one FSM rejection.
    reject_conn_fsm,
    /// Segments failing the option or sequence checks.
    reject_opt,
    /// Segments with an invalid TCP checksum.
    reject_checksum,
    reassembled_chunks,
    reassembled_bytes,
    /// Chunks dropped because of a sequence gap.
    dropped_chunks,
    missed_bytes,
    out_of_order_packets,
    out_of_order_bytes,
    overlap_packets,
    overlap_bytes,
    biggest_chunk_bytes,
    biggest_chunk_packets,
    saved_tcp_connections,
    saved_udp_connections,
    udp_streams,
    http_requests,
    http_responses,
    unmatched_http_responses,
    unanswered_http_requests,
    mails,
    pop3_sessions,
    smtp_sessions,
    ssh_records,
    credentials,
    services,
    extracted_files,
    parse_errors,
    /// Completions skipped because the conversation was already saved.
    duplicate_flushes,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn max(counter: &AtomicU64, n: u64) {
        counter.fetch_max(n, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = Stats::new();
        Stats::incr(&stats.packets);
        Stats::incr(&stats.packets);
        Stats::add(&stats.missed_bytes, 40);
        Stats::max(&stats.biggest_chunk_bytes, 10);
        Stats::max(&stats.biggest_chunk_bytes, 5);

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.missed_bytes, 40);
        assert_eq!(snap.biggest_chunk_bytes, 10);
        assert_eq!(snap.credentials, 0);
    }
}
