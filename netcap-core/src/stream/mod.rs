//! TCP stream processing and application-layer decoding.
//!
//! ## Components
//!
//! - [`TcpFsm`] / [`OptionChecker`] - segment acceptance checks
//! - [`StreamBuffer`] - per-direction reassembly into contiguous chunks
//! - [`StreamReader`] - per-direction byte sink and fragment archive
//! - [`TcpConnection`] / [`ConnectionTable`] - connection state and lifecycle
//! - [`ReaderKind`] - late-bound protocol selection at completion
//! - [`parsers`] - HTTP, POP3, SMTP, SSH and mail decoders
//!
//! ## Data flow
//!
//! ```text
//! segment -> accept (FSM, options, checksum) -> StreamBuffer -> chunk (skip == 0)
//!         -> StreamReader (client or server) -> completion -> merged conversation
//!         -> ReaderKind::select -> decoder -> records
//! ```

mod connection;
pub(crate) mod conversation;
mod dispatch;
mod fsm;
pub mod parsers;
mod reader;
mod reassembly;

pub use connection::{ConnectionSummary, ConnectionTable, TcpConnection};
pub use conversation::{
    decode_conversation, merge_fragments, ConversationDecoder, ConversationInfo, RunCursor,
};
pub use dispatch::ReaderKind;
pub use fsm::{FsmState, OptionChecker, OptionViolation, TcpFsm};
pub use reader::{StreamFragment, StreamReader};
pub use reassembly::{Chunk, ChunkStats, Segment, StreamBuffer};

/// Direction of data flow in a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ToServer,
    ToClient,
}

impl Direction {
    /// Return a string representation of the direction.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ToServer => "to_server",
            Direction::ToClient => "to_client",
        }
    }

    pub fn reverse(&self) -> Direction {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }

    /// Slot of this direction in per-direction arrays.
    pub fn index(&self) -> usize {
        match self {
            Direction::ToServer => 0,
            Direction::ToClient => 1,
        }
    }
}
