use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};

/// A TCP segment waiting to be reassembled.
#[derive(Debug, Clone)]
pub struct Segment {
    pub seq: u32,
    pub data: Bytes,
    pub timestamp: i64,
}

/// Bookkeeping attached to each delivered chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkStats {
    /// Segments merged into this chunk.
    pub packets: u32,
    /// Segments that had been waiting in the out-of-order queue.
    pub queued_packets: u32,
    pub queued_bytes: u64,
    /// Retransmitted or overlapping segments trimmed since the last chunk.
    pub overlap_packets: u32,
    pub overlap_bytes: u64,
}

/// A contiguous run of bytes for one direction.
///
/// `skip` is 0 when the run continues the previous one, the number of missing
/// bytes when a gap was bridged, and -1 when the start of the stream was never
/// seen.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub seq: u32,
    pub data: Bytes,
    pub skip: i64,
    pub timestamp: i64,
    pub stats: ChunkStats,
}

/// Reassembly state for one direction of a TCP stream.
#[derive(Debug, Default)]
pub struct StreamBuffer {
    /// Next expected sequence number, unknown until a SYN or the first accepted segment.
    next_seq: Option<u32>,
    /// Whether the stream start was seen (SYN).
    seen_start: bool,
    /// Out-of-order segments waiting for the gap to close.
    pending: BTreeMap<u32, Segment>,
    pending_bytes: u64,
    overlap_packets: u32,
    overlap_bytes: u64,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next expected sequence number.
    pub fn next_seq(&self) -> Option<u32> {
        self.next_seq
    }

    /// Record the initial sequence number from a SYN.
    ///
    /// Data queued before the SYN was observed is released if it now lines up.
    pub fn set_initial_seq(&mut self, seq: u32) -> Vec<Chunk> {
        if self.seen_start {
            return Vec::new();
        }
        self.seen_start = true;
        if self.next_seq.is_none() {
            self.next_seq = Some(seq.wrapping_add(1)); // SYN consumes one seq
        }
        self.release(None)
    }

    /// Add a segment and return the chunks that became contiguous.
    pub fn add_segment(&mut self, segment: Segment, allow_missing_init: bool) -> Vec<Chunk> {
        if segment.data.is_empty() {
            return Vec::new();
        }

        let next = match self.next_seq {
            Some(next) => next,
            None if allow_missing_init => {
                // Mid-stream start: this segment defines the stream
                self.next_seq = Some(segment.seq);
                return self.release(Some((segment, -1)));
            }
            None => {
                self.queue(segment);
                return Vec::new();
            }
        };

        let Some(segment) = self.trim(segment, next) else {
            return Vec::new();
        };

        if segment.seq == next {
            self.release(Some((segment, 0)))
        } else {
            self.queue(segment);
            Vec::new()
        }
    }

    /// Force out queued data, bridging gaps.
    ///
    /// With `cutoff` set, only runs whose first segment was captured at or
    /// before `cutoff` are flushed. Each flushed run carries its gap in `skip`.
    pub fn flush_pending(&mut self, cutoff: Option<i64>) -> Vec<Chunk> {
        let mut chunks = Vec::new();

        while let Some(seq) = self.lowest_pending() {
            if let Some(cutoff) = cutoff {
                if self.pending[&seq].timestamp > cutoff {
                    break;
                }
            }
            let Some(segment) = self.remove_pending(seq) else {
                break;
            };
            let skip = match self.next_seq {
                Some(next) => i64::from(segment.seq.wrapping_sub(next)),
                None => -1,
            };
            self.next_seq = Some(segment.seq);
            chunks.extend(self.release(Some((segment, skip))));
        }

        chunks
    }

    /// Capture timestamp of the oldest queued segment.
    pub fn oldest_pending(&self) -> Option<i64> {
        self.pending.values().map(|s| s.timestamp).min()
    }

    fn queue(&mut self, segment: Segment) {
        let len = segment.data.len() as u64;
        match self.pending.get(&segment.seq) {
            // retransmission of queued data
            Some(existing) if existing.data.len() >= segment.data.len() => {}
            Some(existing) => {
                self.pending_bytes = self.pending_bytes - existing.data.len() as u64 + len;
                self.pending.insert(segment.seq, segment);
            }
            None => {
                self.pending_bytes += len;
                self.pending.insert(segment.seq, segment);
            }
        }
    }

    fn remove_pending(&mut self, seq: u32) -> Option<Segment> {
        let seg = self.pending.remove(&seq)?;
        self.pending_bytes -= seg.data.len() as u64;
        Some(seg)
    }

    /// Pending segment closest to the expected sequence number.
    fn lowest_pending(&self) -> Option<u32> {
        match self.next_seq {
            Some(next) => self
                .pending
                .keys()
                .copied()
                .min_by_key(|seq| seq.wrapping_sub(next)),
            None => self.pending.keys().next().copied(),
        }
    }

    /// Drop the part of a segment that was already delivered.
    fn trim(&mut self, mut segment: Segment, next: u32) -> Option<Segment> {
        if !seq_lt(segment.seq, next) {
            return Some(segment);
        }

        let seg_end = seq_add(segment.seq, segment.data.len());
        if seq_le(seg_end, next) {
            self.overlap_packets += 1;
            self.overlap_bytes += segment.data.len() as u64;
            return None;
        }

        // Partial overlap - trim the beginning
        let overlap = next.wrapping_sub(segment.seq) as usize;
        self.overlap_packets += 1;
        self.overlap_bytes += overlap as u64;
        segment.data = segment.data.slice(overlap..);
        segment.seq = next;
        Some(segment)
    }

    /// Deliver `first` (if any) plus every queued segment that continues it, as one chunk.
    fn release(&mut self, first: Option<(Segment, i64)>) -> Vec<Chunk> {
        let (seq, skip, timestamp, mut data, mut stats) = match first {
            Some((segment, skip)) => {
                let stats = ChunkStats {
                    packets: 1,
                    ..Default::default()
                };
                let mut data = BytesMut::with_capacity(segment.data.len());
                data.extend_from_slice(&segment.data);
                self.next_seq = Some(seq_add(segment.seq, segment.data.len()));
                (segment.seq, skip, segment.timestamp, data, stats)
            }
            None => {
                let Some(next) = self.next_seq else {
                    return Vec::new();
                };
                let Some(segment) = self.take_continuation(next) else {
                    return Vec::new();
                };
                let stats = ChunkStats {
                    packets: 1,
                    queued_packets: 1,
                    queued_bytes: segment.data.len() as u64,
                    ..Default::default()
                };
                let mut data = BytesMut::with_capacity(segment.data.len());
                data.extend_from_slice(&segment.data);
                self.next_seq = Some(seq_add(segment.seq, segment.data.len()));
                (segment.seq, 0, segment.timestamp, data, stats)
            }
        };

        // Check if pending segments can now be added
        while let Some(next) = self.next_seq {
            let Some(segment) = self.take_continuation(next) else {
                break;
            };
            stats.packets += 1;
            stats.queued_packets += 1;
            stats.queued_bytes += segment.data.len() as u64;
            data.extend_from_slice(&segment.data);
            self.next_seq = Some(seq_add(segment.seq, segment.data.len()));
        }

        stats.overlap_packets = std::mem::take(&mut self.overlap_packets);
        stats.overlap_bytes = std::mem::take(&mut self.overlap_bytes);

        vec![Chunk {
            seq,
            data: data.freeze(),
            skip,
            timestamp,
            stats,
        }]
    }

    /// Remove and return the queued segment starting at `next`, trimming late overlaps.
    fn take_continuation(&mut self, next: u32) -> Option<Segment> {
        loop {
            if let Some(segment) = self.remove_pending(next) {
                return Some(segment);
            }
            let stale = self
                .pending
                .keys()
                .copied()
                .find(|seq| seq_lt(*seq, next))?;
            let segment = self.remove_pending(stale)?;
            if let Some(trimmed) = self.trim(segment, next) {
                return Some(trimmed);
            }
        }
    }
}

// Sequence number comparison helpers
pub(crate) fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    a == b || seq_lt(a, b)
}

pub(crate) fn seq_add(a: u32, n: usize) -> u32 {
    a.wrapping_add(n as u32)
}
