//! Convenient re-exports for common usage.
//!
//! # Example
//!
//! ```rust,no_run
//! use netcap_core::prelude::*;
//! use std::sync::Arc;
//!
//! let engine = Engine::new(Config::default(), Arc::new(MemorySink::new())).unwrap();
//! ```

// Input
pub use crate::capture::{CaptureReader, Packet, RawFrame, TcpFlags, TcpSegment};
pub use crate::flow::{FlowKey, NetFlow, TransportFlow};

// Processing
pub use crate::config::Config;
pub use crate::engine::Engine;
pub use crate::stats::StatsSnapshot;

// Output
pub use crate::record::{MemorySink, Record, RecordSink};

// Error types
pub use crate::error::{Error, Result};
