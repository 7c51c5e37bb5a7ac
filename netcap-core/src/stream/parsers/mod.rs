//! Application protocol readers.
//!
//! Each reader consumes the merged conversation of one completed connection
//! and writes its records through the run [`Context`](crate::Context).

pub mod content;
pub mod http;
pub mod mail;
pub mod pop3;
pub mod smtp;
pub mod ssh;
