//! Capture file reader.
//!
//! Reads classic PCAP and PCAPNG files through `pcap_parser`, with transparent
//! gzip decompression detected from the file's magic bytes.

use std::fs::File;
use std::io::{BufReader, Cursor, Read};
use std::path::Path;

use bytes::Bytes;
use flate2::read::GzDecoder;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError as ParserError, PcapNGReader};

use crate::error::{CaptureError, Error, Result};

/// Buffer size for pcap_parser readers.
const BUFFER_SIZE: usize = 262144;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Container format of a capture.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureFormat {
    /// Classic PCAP, any byte order or timestamp resolution
    Legacy,
    /// PCAPNG
    PcapNg,
}

impl CaptureFormat {
    /// Detect the format from the first four bytes.
    pub fn detect(magic: &[u8]) -> Result<Self> {
        if magic.len() < 4 {
            return Err(CaptureError::InvalidFormat {
                reason: "Data too small for PCAP magic".into(),
            }
            .into());
        }
        let value = u32::from_ne_bytes([magic[0], magic[1], magic[2], magic[3]]);
        match value {
            0xa1b2c3d4 | 0xd4c3b2a1 | 0xa1b23c4d | 0x4d3cb2a1 => Ok(CaptureFormat::Legacy),
            0x0a0d0d0a => Ok(CaptureFormat::PcapNg),
            _ => Err(CaptureError::InvalidFormat {
                reason: format!("Unknown PCAP magic: 0x{:08x}", value),
            }
            .into()),
        }
    }
}

/// One captured frame, not yet decoded.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_number: u64,
    /// Capture timestamp in microseconds.
    pub timestamp: i64,
    pub link_type: u16,
    pub data: Bytes,
}

type Source = Box<dyn Read + Send>;

enum ReaderInner {
    Legacy(LegacyPcapReader<BufReader<Source>>),
    Ng(PcapNGReader<BufReader<Source>>),
}

/// Reader for PCAP and PCAPNG files, optionally gzip compressed.
pub struct CaptureReader {
    inner: ReaderInner,
    frame_number: u64,
    /// Link type of the legacy header, or of each PCAPNG interface.
    link_types: Vec<u16>,
    nanosecond: bool,
}

impl CaptureReader {
    /// Open a capture file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|_| CaptureError::FileNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_reader(file)
    }

    /// Build a reader over any byte source.
    pub fn from_reader<R: Read + Send + 'static>(source: R) -> Result<Self> {
        let mut source: Source = Box::new(source);

        let mut magic = [0u8; 4];
        let n = read_up_to(&mut source, &mut magic)?;
        let mut source: Source = Box::new(Cursor::new(magic[..n].to_vec()).chain(source));

        if n >= 2 && magic[..2] == GZIP_MAGIC {
            source = Box::new(GzDecoder::new(source));
            let n = read_up_to(&mut source, &mut magic)?;
            source = Box::new(Cursor::new(magic[..n].to_vec()).chain(source));
            return Self::with_format(source, CaptureFormat::detect(&magic[..n])?, &magic[..n]);
        }

        Self::with_format(source, CaptureFormat::detect(&magic[..n])?, &magic[..n])
    }

    fn with_format(source: Source, format: CaptureFormat, magic: &[u8]) -> Result<Self> {
        let buf_reader = BufReader::with_capacity(BUFFER_SIZE, source);
        let inner = match format {
            CaptureFormat::PcapNg => ReaderInner::Ng(PcapNGReader::new(BUFFER_SIZE, buf_reader).map_err(|e| {
                CaptureError::InvalidFormat {
                    reason: format!("Failed to parse PCAPNG: {}", e),
                }
            })?),
            CaptureFormat::Legacy => ReaderInner::Legacy(LegacyPcapReader::new(BUFFER_SIZE, buf_reader).map_err(|e| {
                CaptureError::InvalidFormat {
                    reason: format!("Failed to parse legacy PCAP: {}", e),
                }
            })?),
        };
        let nanosecond = matches!(magic, [0x4d, 0x3c, 0xb2, 0xa1] | [0xa1, 0xb2, 0x3c, 0x4d]);

        Ok(Self {
            inner,
            frame_number: 0,
            link_types: Vec::new(),
            nanosecond,
        })
    }

    /// Number of frames read so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_number
    }

    /// Read the next frame. Returns `Ok(None)` at end of file.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>> {
        match &mut self.inner {
            ReaderInner::Legacy(reader) => loop {
                match reader.next() {
                    Ok((offset, block)) => {
                        let frame = match block {
                            PcapBlockOwned::LegacyHeader(header) => {
                                self.link_types = vec![header.network.0 as u16];
                                None
                            }
                            PcapBlockOwned::Legacy(packet) => {
                                self.frame_number += 1;
                                let sub = if self.nanosecond {
                                    packet.ts_usec as i64 / 1000
                                } else {
                                    packet.ts_usec as i64
                                };
                                Some(RawFrame {
                                    frame_number: self.frame_number,
                                    timestamp: packet.ts_sec as i64 * 1_000_000 + sub,
                                    link_type: self.link_types.first().copied().unwrap_or(1),
                                    data: Bytes::copy_from_slice(packet.data),
                                })
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        if frame.is_some() {
                            return Ok(frame);
                        }
                    }
                    Err(ParserError::Eof) => return Ok(None),
                    Err(ParserError::Incomplete(_)) => {
                        reader.refill().map_err(|e| refill_error("Legacy PCAP", e))?;
                    }
                    Err(e) => return Err(parse_error("Legacy PCAP", e)),
                }
            },
            ReaderInner::Ng(reader) => loop {
                match reader.next() {
                    Ok((offset, block)) => {
                        use pcap_parser::pcapng::Block;

                        let frame = match block {
                            PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                                self.link_types.clear();
                                None
                            }
                            PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                                self.link_types.push(idb.linktype.0 as u16);
                                None
                            }
                            PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                                self.frame_number += 1;
                                let link_type = self
                                    .link_types
                                    .get(epb.if_id as usize)
                                    .copied()
                                    .unwrap_or(1);
                                Some(RawFrame {
                                    frame_number: self.frame_number,
                                    timestamp: ((epb.ts_high as i64) << 32) | (epb.ts_low as i64),
                                    link_type,
                                    data: Bytes::copy_from_slice(epb.data),
                                })
                            }
                            PcapBlockOwned::NG(Block::SimplePacket(spb)) => {
                                self.frame_number += 1;
                                Some(RawFrame {
                                    frame_number: self.frame_number,
                                    timestamp: 0,
                                    link_type: self.link_types.first().copied().unwrap_or(1),
                                    data: Bytes::copy_from_slice(spb.data),
                                })
                            }
                            _ => None,
                        };
                        reader.consume(offset);
                        if frame.is_some() {
                            return Ok(frame);
                        }
                    }
                    Err(ParserError::Eof) => return Ok(None),
                    Err(ParserError::Incomplete(_)) => {
                        reader.refill().map_err(|e| refill_error("PCAPNG", e))?;
                    }
                    Err(e) => return Err(parse_error("PCAPNG", e)),
                }
            },
        }
    }
}

impl Iterator for CaptureReader {
    type Item = Result<RawFrame>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

fn read_up_to(source: &mut Source, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match source.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

fn refill_error(format: &str, e: impl std::fmt::Display) -> Error {
    CaptureError::InvalidFormat {
        reason: format!("{} refill error: {}", format, e),
    }
    .into()
}

fn parse_error(format: &str, e: impl std::fmt::Debug) -> Error {
    CaptureError::InvalidFormat {
        reason: format!("{} parse error: {:?}", format, e),
    }
    .into()
}
