use super::conversation::ConversationInfo;
use super::parsers::{http, pop3, smtp, ssh};
use super::{StreamFragment, StreamReader};
use crate::context::Context;

const HTTP_METHODS: [&[u8]; 9] = [
    b"GET ", b"POST ", b"HEAD ", b"PUT ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ", b"TRACE ",
];

/// Application decoder of a TCP conversation.
///
/// The kind is chosen when the connection completes, from the server port and
/// the first bytes of both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderKind {
    Http,
    Pop3,
    Smtp,
    Ssh,
    /// No application decoder; only the conversation and banner are kept.
    Raw,
}

impl ReaderKind {
    const DECODERS: [ReaderKind; 4] = [ReaderKind::Http, ReaderKind::Pop3, ReaderKind::Smtp, ReaderKind::Ssh];

    /// Return a string representation of the reader.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReaderKind::Http => "HTTP",
            ReaderKind::Pop3 => "POP3",
            ReaderKind::Smtp => "SMTP",
            ReaderKind::Ssh => "SSH",
            ReaderKind::Raw => "RAW",
        }
    }

    /// Reader registered for a well-known server port.
    pub fn for_port(port: u16) -> Option<ReaderKind> {
        match port {
            80 => Some(ReaderKind::Http),
            110 => Some(ReaderKind::Pop3),
            22 => Some(ReaderKind::Ssh),
            25 => Some(ReaderKind::Smtp),
            _ => None,
        }
    }

    /// Whether the conversation looks like this protocol.
    pub fn can_decode(&self, client: &[u8], server: &[u8]) -> bool {
        match self {
            ReaderKind::Http => {
                HTTP_METHODS.iter().any(|m| client.starts_with(m))
                    && (server.is_empty() || contains(server, b"HTTP"))
            }
            ReaderKind::Pop3 => server.starts_with(b"+OK"),
            ReaderKind::Smtp => {
                server.starts_with(b"220")
                    && (starts_with_ignore_case(client, b"EHLO") || starts_with_ignore_case(client, b"HELO"))
            }
            ReaderKind::Ssh => client.starts_with(b"SSH-") || server.starts_with(b"SSH-"),
            ReaderKind::Raw => true,
        }
    }

    /// Pick the reader for a completed conversation.
    ///
    /// Order: the port's reader if it accepts the data, then the first reader
    /// that accepts it, then banner sniffing on the server bytes, then `Raw`.
    pub fn select(server_port: u16, client: &[u8], server: &[u8]) -> ReaderKind {
        if let Some(kind) = Self::for_port(server_port) {
            if kind.can_decode(client, server) {
                return kind;
            }
        }
        if let Some(kind) = Self::DECODERS.iter().find(|k| k.can_decode(client, server)) {
            return *kind;
        }
        Self::sniff(server)
    }

    /// Guess the protocol from a server banner.
    pub fn sniff(banner: &[u8]) -> ReaderKind {
        if contains(banner, b"HTTP") {
            ReaderKind::Http
        } else if contains(banner, b"SSH") {
            ReaderKind::Ssh
        } else if contains(banner, b"POP server ready") {
            ReaderKind::Pop3
        } else {
            ReaderKind::Raw
        }
    }

    /// Run the decoder over the merged conversation.
    pub fn decode(
        &self,
        ctx: &Context,
        info: &ConversationInfo,
        fragments: &[StreamFragment],
        client: &StreamReader,
        server: &StreamReader,
    ) {
        match self {
            ReaderKind::Http => http::decode(ctx, info, fragments),
            ReaderKind::Pop3 => pop3::decode(ctx, info, fragments),
            ReaderKind::Smtp => smtp::decode(ctx, info, fragments),
            ReaderKind::Ssh => ssh::decode(ctx, info, client, server),
            ReaderKind::Raw => {}
        }
    }
}

pub(crate) fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

fn starts_with_ignore_case(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()].eq_ignore_ascii_case(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Port mapping wins when the data agrees
    #[test]
    fn test_select_by_port() {
        let kind = ReaderKind::select(80, b"GET / HTTP/1.1\r\n", b"HTTP/1.1 200 OK\r\n");
        assert_eq!(kind, ReaderKind::Http);

        let kind = ReaderKind::select(110, b"USER bob\r\n", b"+OK POP3 ready\r\n");
        assert_eq!(kind, ReaderKind::Pop3);
    }

    // Test 2: Non-standard port falls back to content checks
    #[test]
    fn test_select_by_content() {
        let kind = ReaderKind::select(2525, b"EHLO client\r\n", b"220 mx ESMTP\r\n");
        assert_eq!(kind, ReaderKind::Smtp);

        let kind = ReaderKind::select(8080, b"GET /x HTTP/1.1\r\n", b"HTTP/1.1 404 Not Found\r\n");
        assert_eq!(kind, ReaderKind::Http);
    }

    // Test 3: Late binding through banner sniffing
    #[test]
    fn test_select_by_banner() {
        // Port 80 but not HTTP traffic
        let kind = ReaderKind::select(80, b"hello", b"SSH-2.0-OpenSSH_8.9\r\n");
        assert_eq!(kind, ReaderKind::Ssh);

        let kind = ReaderKind::select(9000, b"xyz", b"welcome, POP server ready");
        assert_eq!(kind, ReaderKind::Pop3);

        assert_eq!(ReaderKind::select(9000, b"\x01\x02", b"\x03\x04"), ReaderKind::Raw);
    }

    // Test 4: HTTP request without a response still decodes as HTTP
    #[test]
    fn test_http_request_only() {
        assert_eq!(ReaderKind::select(80, b"POST /login HTTP/1.1\r\n", b""), ReaderKind::Http);
    }
}
