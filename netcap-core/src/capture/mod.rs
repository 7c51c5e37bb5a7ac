//! Packet input.
//!
//! - [`CaptureReader`] - PCAP/PCAPNG file reader with gzip support
//! - [`Packet`] - decoded per-packet view (link, network, transport, payload)

mod packet;
mod reader;

pub use packet::{
    link_types, LinkLayer, Packet, TcpFlags, TcpOptions, TcpSegment, Transport, UdpDatagram,
};
pub use reader::{CaptureFormat, CaptureReader, RawFrame};
