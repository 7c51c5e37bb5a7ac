//! Error types for netcap-core.
//!
//! - [`enum@Error`] - Main error enum that wraps all error types
//! - [`CaptureError`] - Errors from capture file reading
//! - [`DecodeError`] - Errors from application stream decoding
//!
//! Decoding errors never leave a connection: they are logged and the decode of
//! that conversation stops. Only [`Error::Sink`] is fatal to a run.

use thiserror::Error;

/// Main error type for netcap-core operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Error reading or parsing a capture file
    #[error("Capture error: {0}")]
    Capture(#[from] CaptureError),

    /// Error while decoding an application stream
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// An audit record could not be handed to the record sink.
    ///
    /// Record loss is not recoverable, callers must stop processing.
    #[error("Record sink failure: {0}")]
    Sink(String),
}

/// Errors related to capture file reading.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// File not found
    #[error("File not found: {path}")]
    FileNotFound { path: String },

    /// Invalid PCAP format
    #[error("Invalid capture format: {reason}")]
    InvalidFormat { reason: String },

    /// Unsupported link type
    #[error("Unsupported link type: {link_type}")]
    UnsupportedLinkType { link_type: u16 },
}

/// Errors produced by the framing functions of the protocol readers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Clean end of the current byte run. Not an error condition.
    #[error("end of stream")]
    Eof,

    /// The run ended in the middle of a message.
    #[error("unexpected end of stream")]
    UnexpectedEof,

    /// The bytes do not form a valid protocol message.
    #[error("{protocol}: {reason}")]
    Malformed {
        protocol: &'static str,
        reason: String,
    },
}

impl DecodeError {
    /// Build a [`DecodeError::Malformed`].
    pub fn malformed(protocol: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Malformed {
            protocol,
            reason: reason.into(),
        }
    }

    /// True for the normal end-of-stream signal.
    pub fn is_eof(&self) -> bool {
        matches!(self, DecodeError::Eof)
    }
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
