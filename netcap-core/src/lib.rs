//! # netcap-core
//!
//! Conversation-level traffic analysis for packet captures.
//!
//! Packets are decoded, TCP segments are checked and reassembled per
//! connection, UDP datagrams are pooled per port pair, and every finished
//! conversation is decoded into structured audit records: connections,
//! services, credentials, HTTP exchanges, POP3/SMTP sessions and mails, SSH
//! fingerprints and extracted files.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use netcap_core::{CaptureReader, Config, Engine, MemorySink};
//!
//! let sink = Arc::new(MemorySink::new());
//! let engine = Engine::new(Config::default(), sink.clone()).unwrap();
//! let stats = engine.run(CaptureReader::open("capture.pcap").unwrap()).unwrap();
//!
//! println!("{} packets, {} records", stats.packets, sink.records().len());
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +---------------------------------------------------------------------+
//! |                          netcap-core                                |
//! +---------------------------------------------------------------------+
//! |  capture/      - PCAP/PCAPNG reading, packet decoding               |
//! |  flow          - network/transport flows, connection identifiers    |
//! |  stream/       - FSM, reassembly, StreamReader, protocol decoders   |
//! |  udp           - UDP pseudo-stream pool                             |
//! |  credentials/  - regex harvesters and credential dedup              |
//! |  service       - service store and banner probes                    |
//! |  files         - extracted file and conversation storage            |
//! |  engine        - packet dispatch, eviction, shutdown                |
//! |  record        - audit records and the sink trait                   |
//! +---------------------------------------------------------------------+
//! ```
//!
//! ## Supported Link Types
//!
//! | Link type | Value |
//! |-----------|-------|
//! | Ethernet | 1 |
//! | Raw IP | 101, 12, 228, 229 |
//! | Linux cooked (SLL) | 113 |
//! | BSD loopback | 0 |

pub mod capture;
pub mod config;
pub mod context;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod files;
pub mod flow;
pub mod prelude;
pub mod record;
pub mod service;
pub mod stats;
pub mod stream;
pub mod udp;
pub mod workers;

pub use capture::{CaptureReader, Packet, RawFrame};
pub use config::Config;
pub use context::Context;
pub use engine::Engine;
pub use error::{CaptureError, DecodeError, Error, Result};
pub use record::{MemorySink, Record, RecordSink};
pub use stats::{Stats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
