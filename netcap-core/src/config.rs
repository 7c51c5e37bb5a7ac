//! Runtime configuration for the reassembly and decoding engine.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration consumed by [`Engine`](crate::Engine) and the stream decoders.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of processed packets between two idle-connection sweeps.
    pub flush_every: usize,
    /// Accept streams whose handshake was not captured.
    pub allow_missing_init: bool,
    /// Treat FSM violations as soft (count them, keep the segment).
    pub ignore_fsm_err: bool,
    /// Treat option/sequence violations as soft.
    pub no_opt_check: bool,
    /// Verify TCP checksums and reject segments that fail.
    pub checksum: bool,
    /// Idle time after which a connection is evicted and flushed.
    pub close_inactive_timeout: Duration,
    /// Age after which buffered out-of-order data is force-flushed.
    pub close_pending_timeout: Duration,
    /// Wait for live connections to complete on shutdown.
    pub wait_for_connections: bool,
    /// Upper bound for that wait.
    pub connection_wait_timeout: Duration,
    /// Bytes of server data kept as service banner.
    pub banner_size: usize,
    /// Bytes of the merged conversation handed to the credential harvesters.
    pub harvester_banner_size: usize,
    /// Stop trying harvesters after the first match.
    pub stop_after_harvester_match: bool,
    /// Stop trying service probes after the first match.
    pub stop_after_service_probe_match: bool,
    /// Value returned from the completion callback.
    pub remove_closed_streams: bool,
    /// Write whole conversations to disk.
    pub save_conns: bool,
    /// Keep extracted files whose data was truncated.
    pub write_incomplete: bool,
    /// Directory for extracted files, relative to `out`. Extraction is off when unset.
    pub file_storage: Option<PathBuf>,
    /// Output root for extracted files and saved conversations.
    pub out: PathBuf,
    /// Additional credential regex, matched against conversation banners.
    pub custom_regex: Option<String>,
    /// Width of the parallel drain and UDP flush pools.
    pub num_stream_workers: usize,
    /// Log protocol parse errors at warn level instead of debug.
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_every: 100,
            allow_missing_init: false,
            ignore_fsm_err: false,
            no_opt_check: false,
            checksum: false,
            close_inactive_timeout: Duration::from_secs(24 * 60 * 60),
            close_pending_timeout: Duration::from_secs(5),
            wait_for_connections: true,
            connection_wait_timeout: Duration::from_secs(5),
            banner_size: 512,
            harvester_banner_size: 512,
            stop_after_harvester_match: true,
            stop_after_service_probe_match: true,
            remove_closed_streams: false,
            save_conns: false,
            write_incomplete: false,
            file_storage: None,
            out: PathBuf::from("."),
            custom_regex: None,
            num_stream_workers: num_cpus::get(),
            debug: false,
        }
    }
}

impl Config {
    /// Root directory of extracted files, if extraction is enabled.
    pub fn file_root(&self) -> Option<PathBuf> {
        self.file_storage.as_ref().map(|dir| self.out.join(dir))
    }

    pub(crate) fn inactive_us(&self) -> i64 {
        self.close_inactive_timeout.as_micros() as i64
    }

    pub(crate) fn pending_us(&self) -> i64 {
        self.close_pending_timeout.as_micros() as i64
    }
}
