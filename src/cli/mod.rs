//! Command-line interface module.
//!
//! This module handles:
//! - Argument parsing via clap and mapping onto [`netcap_core::Config`]
//! - JSON lines record output

mod args;
mod output;

pub use args::Args;
pub use output::JsonLinesSink;
