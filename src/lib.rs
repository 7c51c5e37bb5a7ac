//! netcap - Reassemble conversations from packet captures and emit audit records.
//!
//! This crate is the command line front end of [`netcap_core`]: argument
//! parsing, the JSON lines record sink and the sharded packet dispatch
//! pipeline.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use netcap::cli::JsonLinesSink;
//! use netcap_core::{CaptureReader, Config, Engine};
//!
//! fn main() -> anyhow::Result<()> {
//!     let sink = Arc::new(JsonLinesSink::stdout());
//!     let engine = Arc::new(Engine::new(Config::default(), sink.clone())?);
//!     let stats = netcap::pipeline::run(engine, CaptureReader::open("capture.pcap")?, 4)?;
//!     sink.flush()?;
//!     eprintln!("{} packets", stats.packets);
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod pipeline;

pub use netcap_core::{Error, Result};
