//! SSH identification and HASSH fingerprinting.
//!
//! Only the cleartext start of each direction is inspected: the
//! identification line (`SSH-2.0-OpenSSH_8.9p1 Ubuntu-3`) and the first
//! binary packet, which must be `SSH_MSG_KEXINIT`. The HASSH fingerprint is
//! the MD5 of `kex;encryption;mac;compression` over the lists an endpoint
//! offers for its own sending direction.

use std::io::Read;
use std::sync::OnceLock;

use md5::{Digest, Md5};
use regex::Regex;
use tracing::debug;

use crate::context::Context;
use crate::error::DecodeError;
use crate::flow::reverse_ident;
use crate::record::{Record, SshRecord};
use crate::stats::Stats;
use crate::stream::conversation::ConversationInfo;
use crate::stream::{Direction, StreamReader};

/// Bytes read per direction.
const MAX_INSPECT: u64 = 2255;

const MSG_KEXINIT: u8 = 20;
const COOKIE_LEN: usize = 16;

fn ident_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(SSH-[0-9]\.?[0-9]?)-(.*?)_([0-9][0-9A-Za-z.]*)(?:[ \t]+([[:alnum:]]+))?").ok())
        .as_ref()
}

/// Parsed identification string.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SshIdent {
    pub ssh_version: String,
    pub product: String,
    pub version: String,
    pub os: String,
}

impl SshIdent {
    pub fn parse(line: &str) -> Option<SshIdent> {
        let caps = ident_regex()?.captures(line)?;
        let group = |i: usize| caps.get(i).map(|m| m.as_str().to_string()).unwrap_or_default();
        Some(SshIdent {
            ssh_version: group(1),
            product: group(2),
            version: group(3),
            os: group(4),
        })
    }
}

/// Algorithm name-lists of a KEXINIT message.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KexInit {
    pub kex: String,
    pub host_key: String,
    pub encryption_c2s: String,
    pub encryption_s2c: String,
    pub mac_c2s: String,
    pub mac_s2c: String,
    pub compression_c2s: String,
    pub compression_s2c: String,
}

impl KexInit {
    /// Parse the payload of a KEXINIT packet, starting at the message code.
    pub fn parse(payload: &[u8]) -> Result<KexInit, DecodeError> {
        match payload.first() {
            Some(&MSG_KEXINIT) => {}
            Some(other) => return Err(DecodeError::malformed("SSH", format!("unexpected message {}", other))),
            None => return Err(DecodeError::UnexpectedEof),
        }
        let mut rest = payload.get(1 + COOKIE_LEN..).ok_or(DecodeError::UnexpectedEof)?;
        let mut next = || -> Result<String, DecodeError> {
            let len_bytes: [u8; 4] = rest
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or(DecodeError::UnexpectedEof)?;
            let len = u32::from_be_bytes(len_bytes) as usize;
            let list = rest.get(4..4 + len).ok_or(DecodeError::UnexpectedEof)?;
            rest = &rest[4 + len..];
            Ok(String::from_utf8_lossy(list).into_owned())
        };
        Ok(KexInit {
            kex: next()?,
            host_key: next()?,
            encryption_c2s: next()?,
            encryption_s2c: next()?,
            mac_c2s: next()?,
            mac_s2c: next()?,
            compression_c2s: next()?,
            compression_s2c: next()?,
        })
    }

    /// HASSH input string and fingerprint for the given sender.
    pub fn hassh(&self, sender: Direction) -> (String, String) {
        let raw = match sender {
            Direction::ToServer => format!(
                "{};{};{};{}",
                self.kex, self.encryption_c2s, self.mac_c2s, self.compression_c2s
            ),
            Direction::ToClient => format!(
                "{};{};{};{}",
                self.kex, self.encryption_s2c, self.mac_s2c, self.compression_s2c
            ),
        };
        (format!("{:x}", Md5::digest(raw.as_bytes())), raw)
    }
}

/// Identification line and KEXINIT of one direction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SshHandshake {
    pub ident: String,
    pub kex_init: Option<KexInit>,
}

impl SshHandshake {
    /// Parse the start of one direction.
    pub fn parse(data: &[u8]) -> Result<SshHandshake, DecodeError> {
        let line_end = data
            .windows(2)
            .position(|w| w == b"\r\n")
            .or_else(|| data.iter().position(|b| *b == b'\n'))
            .ok_or(DecodeError::UnexpectedEof)?;
        let ident = String::from_utf8_lossy(&data[..line_end]).trim().to_string();
        if !ident.starts_with("SSH-") {
            return Err(DecodeError::malformed("SSH", "missing identification string"));
        }
        let mut pos = line_end + 1;
        if data.get(pos) == Some(&b'\n') {
            pos += 1;
        }

        let packet = &data[pos..];
        let kex_init = match packet.get(..5) {
            Some(head) => {
                let length = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
                let padding = head[4] as usize;
                let payload_len = length.saturating_sub(padding + 1);
                let end = (5 + payload_len).min(packet.len());
                KexInit::parse(&packet[5..end]).ok()
            }
            None => None,
        };
        Ok(SshHandshake { ident, kex_init })
    }
}

/// Read the SSH handshake of both directions and write one record per side.
pub fn decode(ctx: &Context, info: &ConversationInfo, client: &StreamReader, server: &StreamReader) {
    for (reader, is_client) in [(client, true), (server, false)] {
        let mut start = Vec::new();
        if let Err(e) = reader.take(MAX_INSPECT).read_to_end(&mut start) {
            debug!(ident = %info.ident, error = %e, "Failed to read SSH stream");
            continue;
        }

        let handshake = match SshHandshake::parse(&start) {
            Ok(h) => h,
            Err(e) => {
                ctx.parse_error(&info.ident, "SSH", &e);
                continue;
            }
        };

        let sender = if is_client { Direction::ToServer } else { Direction::ToClient };
        let (hassh, algorithms) = handshake
            .kex_init
            .as_ref()
            .map(|k| k.hassh(sender))
            .unwrap_or_default();
        let parsed = SshIdent::parse(&handshake.ident).unwrap_or_default();

        Stats::incr(&ctx.stats.ssh_records);
        let written = ctx.write(Record::Ssh(SshRecord {
            timestamp: info.timestamp,
            hassh,
            flow: if is_client {
                info.ident.clone()
            } else {
                reverse_ident(&info.ident)
            },
            ident: handshake.ident,
            algorithms,
            is_client,
            product: parsed.product,
            version: parsed.version,
            os: parsed.os,
        }));
        if !written {
            return;
        }
    }
}
