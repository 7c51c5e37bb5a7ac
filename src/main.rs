//! netcap CLI entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netcap::cli::{Args, JsonLinesSink};
use netcap::pipeline;
use netcap_core::{CaptureReader, Engine};

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .with_writer(std::io::stderr)
        .init();

    let sink = Arc::new(match &args.output {
        Some(path) => JsonLinesSink::create(path)
            .with_context(|| format!("Failed to create output file: {}", path.display()))?,
        None => JsonLinesSink::stdout(),
    });

    let config = args.config();
    if let Some(root) = config.file_root() {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create file storage: {}", root.display()))?;
    }

    let engine = Arc::new(Engine::new(config, sink.clone()).context("Invalid configuration")?);
    let reader = CaptureReader::open(&args.file)
        .with_context(|| format!("Failed to open capture file: {}", args.file.display()))?;

    let workers = args.workers();
    info!(file = %args.file.display(), workers, "Processing capture");
    let result = pipeline::run(engine, reader, workers);
    sink.flush().context("Failed to flush records")?;
    let stats = result.with_context(|| format!("Failed to process {}", args.file.display()))?;

    eprintln!(
        "{} packets, {} connections, {} UDP streams, {} credentials, {} services",
        stats.packets,
        stats.connections_completed,
        stats.udp_streams,
        stats.credentials,
        stats.services
    );
    Ok(())
}
