//! Sharded packet dispatch.
//!
//! The capture reader runs on the calling thread and decodes every frame. Each
//! packet is routed by its direction independent flow key, so all segments of
//! a connection are processed in capture order by the same worker:
//!
//! ```text
//! capture file (calling thread)
//!   |
//!   |-- decode, shard = flow_key.id() % N
//!   |
//!   +--[crossbeam channel]--> worker 0 --+
//!   +--[crossbeam channel]--> worker 1 --+--> Engine (shared)
//!   ...                                  |
//!   +--[crossbeam channel]--> worker N-1-+
//! ```
//!
//! Once the capture is exhausted the senders are dropped, the workers are
//! joined and the engine is shut down.

use std::sync::Arc;
use std::thread;

use crossbeam_channel::{bounded, Sender};
use netcap_core::{CaptureReader, Engine, Error, Packet, Result, StatsSnapshot};
use tracing::{info, warn};

/// Capacity of each reader to worker channel.
const CHANNEL_CAPACITY: usize = 4096;

/// Process a whole capture on `workers` threads.
pub fn run(engine: Arc<Engine>, reader: CaptureReader, workers: usize) -> Result<StatsSnapshot> {
    if workers <= 1 {
        return engine.run(reader);
    }

    info!(workers, "Starting sharded pipeline");
    let mut senders: Vec<Sender<Packet>> = Vec::with_capacity(workers);
    let mut handles = Vec::with_capacity(workers);

    for shard in 0..workers {
        let (tx, rx) = bounded::<Packet>(CHANNEL_CAPACITY);
        let engine = Arc::clone(&engine);
        let handle = thread::Builder::new()
            .name(format!("netcap-worker-{}", shard))
            .spawn(move || -> Result<()> {
                for packet in rx {
                    engine.process_packet(&packet)?;
                }
                Ok(())
            })?;
        senders.push(tx);
        handles.push(handle);
    }

    let dispatched = dispatch(&engine, reader, &senders);
    senders.clear();

    let mut failure = dispatched.err();
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failure.get_or_insert(e);
            }
            Err(_) => warn!("Packet worker panicked"),
        }
    }

    match failure {
        // the sink error is reported by shutdown after the remaining work is drained
        Some(Error::Sink(_)) | None => engine.shutdown(),
        Some(e) => {
            let _ = engine.shutdown();
            Err(e)
        }
    }
}

fn dispatch(engine: &Engine, reader: CaptureReader, senders: &[Sender<Packet>]) -> Result<()> {
    for frame in reader {
        let frame = frame?;
        if engine.context().is_fatal() {
            break;
        }
        let Some(packet) = engine.decode(&frame)? else {
            continue;
        };
        let shard = packet
            .flow_key()
            .map_or(0, |key| (key.id() % senders.len() as u64) as usize);
        if senders[shard].send(packet).is_err() {
            // the worker stopped on a fatal error
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use netcap_core::{Config, MemorySink};

    #[test]
    fn test_empty_capture() {
        // pcap global header only, Ethernet link type
        let mut header = vec![0xd4, 0xc3, 0xb2, 0xa1, 2, 0, 4, 0];
        header.extend_from_slice(&[0; 8]);
        header.extend_from_slice(&65535u32.to_le_bytes());
        header.extend_from_slice(&1u32.to_le_bytes());

        let engine = Arc::new(Engine::new(Config::default(), Arc::new(MemorySink::new())).unwrap());
        let reader = CaptureReader::from_reader(std::io::Cursor::new(header)).unwrap();
        let stats = run(engine, reader, 4).unwrap();
        assert_eq!(stats.packets, 0);
    }
}
