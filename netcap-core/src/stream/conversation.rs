//! Conversation-level decoding.
//!
//! A completed connection is decoded from its merged fragment list: client
//! and server fragments sorted by capture timestamp. Consecutive fragments of
//! one direction form a run, and each run is handed to the decoder's request
//! or response framing function until the run is exhausted.

use std::net::IpAddr;

use bytes::{Bytes, BytesMut};

use super::{Direction, StreamFragment};
use crate::context::Context;
use crate::error::DecodeError;

/// Endpoints and identity of a conversation, client perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationInfo {
    pub ident: String,
    /// Timestamp of the first packet.
    pub timestamp: i64,
    pub client_ip: IpAddr,
    pub client_port: u16,
    pub server_ip: IpAddr,
    pub server_port: u16,
    /// `TCP` or `UDP`.
    pub transport: &'static str,
}

/// Merge both directions into one list ordered by capture timestamp.
///
/// The sort is stable: fragments with equal timestamps keep client-first order.
pub fn merge_fragments(client: Vec<StreamFragment>, server: Vec<StreamFragment>) -> Vec<StreamFragment> {
    let mut merged = client;
    merged.extend(server);
    merged.sort_by_key(|f| f.timestamp);
    merged
}

/// Concatenated payload of a fragment list.
pub fn concat(fragments: &[StreamFragment]) -> Bytes {
    let mut out = BytesMut::with_capacity(fragments.iter().map(|f| f.data.len()).sum());
    for fragment in fragments {
        out.extend_from_slice(&fragment.data);
    }
    out.freeze()
}

/// Consecutive same-direction bytes.
#[derive(Debug, Clone)]
pub struct Run {
    pub direction: Direction,
    /// Timestamp of the first fragment of the run.
    pub timestamp: i64,
    pub data: Bytes,
}

/// Group consecutive same-direction fragments.
pub fn runs(fragments: &[StreamFragment]) -> Vec<Run> {
    let mut out: Vec<(Direction, i64, BytesMut)> = Vec::new();
    for fragment in fragments {
        match out.last_mut() {
            Some((dir, _, data)) if *dir == fragment.direction => data.extend_from_slice(&fragment.data),
            _ => out.push((
                fragment.direction,
                fragment.timestamp,
                BytesMut::from(&fragment.data[..]),
            )),
        }
    }
    out.into_iter()
        .map(|(direction, timestamp, data)| Run {
            direction,
            timestamp,
            data: data.freeze(),
        })
        .collect()
}

/// Read position inside one run.
#[derive(Debug)]
pub struct RunCursor<'a> {
    data: &'a [u8],
    pos: usize,
    timestamp: i64,
}

impl<'a> RunCursor<'a> {
    pub fn new(data: &'a [u8], timestamp: i64) -> Self {
        Self {
            data,
            pos: 0,
            timestamp,
        }
    }

    /// Timestamp of the run.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Unread bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    pub fn advance(&mut self, n: usize) {
        self.pos = (self.pos + n).min(self.data.len());
    }

    /// Read one line without its `\r\n` or `\n` terminator.
    ///
    /// An unterminated last line is returned as is. Returns [`DecodeError::Eof`]
    /// when nothing is left.
    pub fn read_line(&mut self) -> Result<String, DecodeError> {
        let rest = self.remaining();
        if rest.is_empty() {
            return Err(DecodeError::Eof);
        }
        let (line, consumed) = match rest.iter().position(|b| *b == b'\n') {
            Some(idx) => (&rest[..idx], idx + 1),
            None => (rest, rest.len()),
        };
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        self.pos += consumed;
        Ok(String::from_utf8_lossy(line).into_owned())
    }

    /// Read exactly `n` bytes.
    pub fn read_exact(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let rest = self.remaining();
        if rest.len() < n {
            return Err(DecodeError::UnexpectedEof);
        }
        self.pos += n;
        Ok(&rest[..n])
    }

    /// Consume everything that is left.
    pub fn read_to_end(&mut self) -> &'a [u8] {
        let rest = self.remaining();
        self.pos = self.data.len();
        rest
    }
}

/// Framing callbacks of a protocol reader.
pub trait ConversationDecoder {
    /// Protocol name used in logs.
    fn name(&self) -> &'static str;

    /// Read one client message from the cursor.
    fn read_request(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError>;

    /// Read one server message from the cursor.
    fn read_response(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError>;
}

/// Feed every run of a conversation to `decoder`.
///
/// [`DecodeError::Eof`] and [`DecodeError::UnexpectedEof`] end the current
/// run only, decoding resumes with the next one. Any other error is logged
/// and ends the decode; returns `false` in that case. Messages read before
/// the error stay with the decoder.
pub fn decode_conversation<D: ConversationDecoder>(
    decoder: &mut D,
    fragments: &[StreamFragment],
    ctx: &Context,
    ident: &str,
) -> bool {
    for run in runs(fragments) {
        let mut cursor = RunCursor::new(&run.data, run.timestamp);
        loop {
            let before = cursor.position();
            let res = match run.direction {
                Direction::ToServer => decoder.read_request(&mut cursor),
                Direction::ToClient => decoder.read_response(&mut cursor),
            };
            match res {
                Ok(()) if cursor.is_empty() || cursor.position() == before => break,
                Ok(()) => {}
                Err(DecodeError::Eof) | Err(DecodeError::UnexpectedEof) => break,
                Err(e) => {
                    ctx.parse_error(ident, decoder.name(), &e);
                    return false;
                }
            }
        }
    }
    true
}
