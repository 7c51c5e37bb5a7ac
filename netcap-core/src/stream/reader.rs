use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Condvar, Mutex};

use super::Direction;

/// One reassembled, gap-free chunk of payload for one direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamFragment {
    pub data: Bytes,
    /// Capture timestamp in microseconds.
    pub timestamp: i64,
    pub direction: Direction,
}

#[derive(Debug)]
struct ReaderState {
    direction: Direction,
    fragments: Vec<StreamFragment>,
    bytes: u64,
    /// Read position: fragment index and offset inside it.
    read_fragment: usize,
    read_offset: usize,
    closed: bool,
}

/// Byte sink for one direction of a connection.
///
/// Fed by the reassembly engine with [`push`](Self::push). Every fragment is
/// kept for conversation reconstruction and banner extraction, and the bytes
/// can also be consumed in order through [`Read`], which blocks until more
/// data arrives or the reader is closed.
#[derive(Debug)]
pub struct StreamReader {
    state: Mutex<ReaderState>,
    ready: Condvar,
    saved: AtomicBool,
}

impl StreamReader {
    pub fn new(direction: Direction) -> Self {
        Self {
            state: Mutex::new(ReaderState {
                direction,
                fragments: Vec::new(),
                bytes: 0,
                read_fragment: 0,
                read_offset: 0,
                closed: false,
            }),
            ready: Condvar::new(),
            saved: AtomicBool::new(false),
        }
    }

    /// Append a chunk of payload.
    pub fn push(&self, data: Bytes, timestamp: i64) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.bytes += data.len() as u64;
        let direction = state.direction;
        state.fragments.push(StreamFragment {
            data,
            timestamp,
            direction,
        });
        drop(state);
        self.ready.notify_all();
    }

    /// Signal end of stream to readers.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn direction(&self) -> Direction {
        self.state.lock().direction
    }

    /// Total payload bytes received.
    pub fn bytes(&self) -> u64 {
        self.state.lock().bytes
    }

    /// Copy of the fragment list, in arrival order.
    pub fn fragments(&self) -> Vec<StreamFragment> {
        self.state.lock().fragments.clone()
    }

    /// The first `size` bytes of the stream, regardless of fragment boundaries.
    pub fn banner(&self, size: usize) -> Bytes {
        let state = self.state.lock();
        let mut banner = BytesMut::with_capacity(size.min(state.bytes as usize));
        for fragment in &state.fragments {
            let remaining = size - banner.len();
            if remaining == 0 {
                break;
            }
            let take = remaining.min(fragment.data.len());
            banner.extend_from_slice(&fragment.data[..take]);
        }
        banner.freeze()
    }

    /// Change the direction of the reader and every buffered fragment.
    pub(crate) fn retag(&self, direction: Direction) {
        let mut state = self.state.lock();
        state.direction = direction;
        for fragment in &mut state.fragments {
            fragment.direction = direction;
        }
    }

    /// Mark the reader as saved. Returns `true` only for the first caller.
    pub fn mark_saved(&self) -> bool {
        self.saved
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_saved(&self) -> bool {
        self.saved.load(Ordering::Acquire)
    }
}

impl Read for &StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut state = self.state.lock();
        loop {
            while state.read_fragment < state.fragments.len() {
                let idx = state.read_fragment;
                let offset = state.read_offset;
                let available = state.fragments[idx].data.len() - offset;
                if available == 0 {
                    state.read_fragment += 1;
                    state.read_offset = 0;
                    continue;
                }
                let n = available.min(buf.len());
                buf[..n].copy_from_slice(&state.fragments[idx].data[offset..offset + n]);
                state.read_offset += n;
                return Ok(n);
            }
            if state.closed {
                return Ok(0);
            }
            self.ready.wait(&mut state);
        }
    }
}
