//! Command-line argument definitions.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use netcap_core::Config;

/// Reassemble conversations from a packet capture and write audit records.
#[derive(Parser, Debug)]
#[command(name = "netcap")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// PCAP or PCAPNG file to analyse (optionally gzip compressed)
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Write JSON lines records to this file instead of stdout
    #[arg(short = 'o', long = "output", value_name = "OUTPUT_FILE")]
    pub output: Option<PathBuf>,

    /// Packet dispatch workers (0 = number of logical CPUs)
    #[arg(short = 'w', long = "workers", default_value = "1")]
    pub workers: usize,

    /// Packets between idle connection sweeps
    #[arg(long = "flush-every", default_value = "100")]
    pub flush_every: usize,

    /// Accept streams whose handshake was not captured
    #[arg(long = "allow-missing-init")]
    pub allow_missing_init: bool,

    /// Treat TCP state machine violations as warnings
    #[arg(long = "ignore-fsm-err")]
    pub ignore_fsm_err: bool,

    /// Treat TCP option and sequence violations as warnings
    #[arg(long = "no-opt-check")]
    pub no_opt_check: bool,

    /// Verify TCP checksums
    #[arg(long = "checksum")]
    pub checksum: bool,

    /// Seconds of inactivity before a connection is closed
    #[arg(long = "close-inactive-timeout", value_name = "SECS", default_value = "86400")]
    pub close_inactive_timeout: u64,

    /// Seconds after which out-of-order data is flushed
    #[arg(long = "close-pending-timeout", value_name = "SECS", default_value = "5")]
    pub close_pending_timeout: u64,

    /// Do not wait for connections still completing at shutdown
    #[arg(long = "no-wait-for-connections")]
    pub no_wait_for_connections: bool,

    /// Seconds to wait for connections still completing at shutdown
    #[arg(long = "connection-wait-timeout", value_name = "SECS", default_value = "5")]
    pub connection_wait_timeout: u64,

    /// Bytes of server data kept as service banner
    #[arg(long = "banner-size", default_value = "512")]
    pub banner_size: usize,

    /// Bytes of each conversation given to the credential harvesters
    #[arg(long = "harvester-banner-size", default_value = "512")]
    pub harvester_banner_size: usize,

    /// Run every credential harvester instead of stopping at the first match
    #[arg(long = "all-harvesters")]
    pub all_harvesters: bool,

    /// Run every service probe instead of stopping at the first match
    #[arg(long = "all-service-probes")]
    pub all_service_probes: bool,

    /// Remove connections from the table as soon as they complete
    #[arg(long = "remove-closed-streams")]
    pub remove_closed_streams: bool,

    /// Save whole conversations under the output directory
    #[arg(long = "save-conns")]
    pub save_conns: bool,

    /// Keep extracted files even when they are truncated
    #[arg(long = "write-incomplete")]
    pub write_incomplete: bool,

    /// Extract transferred files into this directory (relative to --out)
    #[arg(long = "file-storage", value_name = "DIR")]
    pub file_storage: Option<PathBuf>,

    /// Root directory for extracted files and saved conversations
    #[arg(long = "out", value_name = "DIR", default_value = ".")]
    pub out: PathBuf,

    /// Extra credential regex (group 1 = user, group 2 = password)
    #[arg(long = "custom-regex", value_name = "REGEX")]
    pub custom_regex: Option<String>,

    /// Threads used to drain connections and UDP streams at shutdown
    #[arg(long = "stream-workers")]
    pub stream_workers: Option<usize>,

    /// Log protocol parse errors as warnings
    #[arg(long = "debug")]
    pub debug: bool,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    /// Engine configuration described by the flags.
    pub fn config(&self) -> Config {
        let defaults = Config::default();
        Config {
            flush_every: self.flush_every,
            allow_missing_init: self.allow_missing_init,
            ignore_fsm_err: self.ignore_fsm_err,
            no_opt_check: self.no_opt_check,
            checksum: self.checksum,
            close_inactive_timeout: Duration::from_secs(self.close_inactive_timeout),
            close_pending_timeout: Duration::from_secs(self.close_pending_timeout),
            wait_for_connections: !self.no_wait_for_connections,
            connection_wait_timeout: Duration::from_secs(self.connection_wait_timeout),
            banner_size: self.banner_size,
            harvester_banner_size: self.harvester_banner_size,
            stop_after_harvester_match: !self.all_harvesters,
            stop_after_service_probe_match: !self.all_service_probes,
            remove_closed_streams: self.remove_closed_streams,
            save_conns: self.save_conns,
            write_incomplete: self.write_incomplete,
            file_storage: self.file_storage.clone(),
            out: self.out.clone(),
            custom_regex: self.custom_regex.clone(),
            num_stream_workers: self
                .stream_workers
                .unwrap_or(defaults.num_stream_workers)
                .max(1),
            debug: self.debug,
        }
    }

    /// Packet dispatch workers, resolving 0 to the CPU count.
    pub fn workers(&self) -> usize {
        match self.workers {
            0 => num_cpus::get(),
            n => n,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_config() {
        let args = Args::parse_from(["netcap", "capture.pcap"]);
        let config = args.config();
        let defaults = Config::default();

        assert_eq!(config.flush_every, defaults.flush_every);
        assert_eq!(config.close_inactive_timeout, defaults.close_inactive_timeout);
        assert_eq!(config.close_pending_timeout, defaults.close_pending_timeout);
        assert_eq!(config.wait_for_connections, defaults.wait_for_connections);
        assert_eq!(config.banner_size, defaults.banner_size);
        assert_eq!(config.stop_after_harvester_match, defaults.stop_after_harvester_match);
        assert_eq!(config.num_stream_workers, defaults.num_stream_workers);
        assert_eq!(args.workers(), 1);
    }

    #[test]
    fn test_flags() {
        let args = Args::parse_from([
            "netcap",
            "capture.pcap",
            "-o",
            "records.jsonl",
            "-w",
            "4",
            "--allow-missing-init",
            "--close-pending-timeout",
            "1",
            "--file-storage",
            "files",
            "--custom-regex",
            r"user=(\w+)&pass=(\w+)",
            "--all-harvesters",
            "-vv",
        ]);
        let config = args.config();

        assert_eq!(args.output, Some(PathBuf::from("records.jsonl")));
        assert_eq!(args.workers(), 4);
        assert_eq!(args.verbose, 2);
        assert!(config.allow_missing_init);
        assert!(!config.stop_after_harvester_match);
        assert_eq!(config.close_pending_timeout, Duration::from_secs(1));
        assert_eq!(config.file_root(), Some(PathBuf::from("./files")));
        assert!(config.custom_regex.is_some());
    }
}
