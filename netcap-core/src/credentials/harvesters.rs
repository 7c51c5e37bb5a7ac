//! Regex-driven credential harvesters.
//!
//! Each harvester inspects the start of a merged conversation (client and
//! server data interleaved in capture order) and returns at most one
//! credential. The harvesters know nothing about the protocol readers; they
//! match the cleartext login exchanges as they appear on the wire:
//!
//! - FTP `USER`/`PASS`
//! - HTTP Basic and Digest `Authorization` headers
//! - SMTP `AUTH PLAIN`, `AUTH LOGIN` and `AUTH CRAM-MD5`
//! - Telnet `login:`/`Password:` prompts
//! - IMAP `LOGIN`, `AUTHENTICATE LOGIN`, `AUTHENTICATE PLAIN` and `AUTHENTICATE CRAM-MD5`
//! - an optional user supplied pattern

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use regex::bytes::{Captures, Regex};
use tracing::debug;

use crate::record::Credentials;

pub const SERVICE_FTP: &str = "FTP";
pub const SERVICE_HTTP_BASIC: &str = "HTTP Basic Auth";
pub const SERVICE_HTTP_DIGEST: &str = "HTTP Digest Auth";
pub const SERVICE_SMTP_PLAIN: &str = "SMTP Auth Plain";
pub const SERVICE_SMTP_LOGIN: &str = "SMTP Auth Login";
pub const SERVICE_SMTP_CRAM_MD5: &str = "SMTP Auth CRAM-MD5";
pub const SERVICE_TELNET: &str = "Telnet";
pub const SERVICE_IMAP_SINGLE: &str = "IMAP Plain Single Line";
pub const SERVICE_IMAP_SEPARATE: &str = "IMAP Plain Separate Line";
pub const SERVICE_IMAP_LOGIN: &str = "IMAP Login";
pub const SERVICE_IMAP_CRAM_MD5: &str = "IMAP CRAM-MD5";
pub const SERVICE_CUSTOM: &str = "Custom Regex";

/// Protocol a harvester is written for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Harvester {
    Ftp,
    Http,
    Smtp,
    Telnet,
    Imap,
    Custom,
}

impl Harvester {
    /// Registration order used when no port mapping applies.
    pub const ALL: [Harvester; 6] = [
        Harvester::Ftp,
        Harvester::Http,
        Harvester::Smtp,
        Harvester::Telnet,
        Harvester::Imap,
        Harvester::Custom,
    ];

    /// Harvester for a well-known port.
    pub fn for_port(port: u16) -> Option<Harvester> {
        match port {
            21 => Some(Harvester::Ftp),
            80 => Some(Harvester::Http),
            25 | 465 | 587 => Some(Harvester::Smtp),
            23 => Some(Harvester::Telnet),
            143 => Some(Harvester::Imap),
            _ => None,
        }
    }

    /// Return a string representation of the harvester.
    pub fn as_str(&self) -> &'static str {
        match self {
            Harvester::Ftp => "ftp",
            Harvester::Http => "http",
            Harvester::Smtp => "smtp",
            Harvester::Telnet => "telnet",
            Harvester::Imap => "imap",
            Harvester::Custom => "custom",
        }
    }
}

/// Compiled pattern bank.
pub struct Patterns {
    ftp: Regex,
    http_basic: Regex,
    http_digest: Regex,
    smtp_plain_separate: Regex,
    smtp_plain_single: Regex,
    smtp_login: Regex,
    smtp_cram_md5: Regex,
    telnet: Regex,
    imap_plain_single: Regex,
    imap_plain_separate: Regex,
    imap_plain_auth: Regex,
    imap_cram_md5: Regex,
    custom: Option<Regex>,
}

impl Patterns {
    /// Compile the built-in patterns and the optional custom one.
    pub fn new(custom: Option<&str>) -> Result<Self, regex::Error> {
        Ok(Self {
            ftp: Regex::new(r"220.*?\r\n.*\r?\n?.*\r?\n?USER\s(.*?)\r\n331.*?\r\nPASS\s(.*?)\r\n")?,
            http_basic: Regex::new(r"HTTP[\s\S]*Authorization: Basic (.*?)\r\n")?,
            http_digest: Regex::new(r"Authorization: Digest (.*?)\r\n")?,
            smtp_plain_separate: Regex::new(r"AUTH PLAIN\r\n334\r\n(.*?)\r\n.*?Authentication successful")?,
            smtp_plain_single: Regex::new(r"AUTH PLAIN (.*?)\s\*\r\n235")?,
            smtp_login: Regex::new(r"AUTH LOGIN\r\n334 VXNlcm5hbWU6\r\n(.*?)\r\n334 UGFzc3dvcmQ6\r\n(.*?)\r\n235")?,
            smtp_cram_md5: Regex::new(r"AUTH CRAM-MD5\r\n334\s(.*?)\r\n(.*?)\r\n235")?,
            telnet: Regex::new(r"login:.*?(\w*?)\r\n.*?\r\nPassword:\s(.*?)\r\n")?,
            imap_plain_single: Regex::new(r"(?:LOGIN|login)\s(.*?)\s(.*?)\r\n")?,
            imap_plain_separate: Regex::new(r"(?:LOGIN|login)\r\n.*?\sVXNlcm5hbWU6\r\n(.*?)\r\n.*?\sUGFzc3dvcmQ6\r\n(.*?)\r\n")?,
            imap_plain_auth: Regex::new(r"(?:AUTHENTICATE PLAIN|authenticate plain)\r\n.*?\r\n(.*?)\r\n")?,
            imap_cram_md5: Regex::new(r"AUTHENTICATE CRAM-MD5\r\n.*?\s(.*?)\r\n(.*?)\r\n")?,
            custom: custom.map(Regex::new).transpose()?,
        })
    }

    pub fn has_custom(&self) -> bool {
        self.custom.is_some()
    }

    /// Run one harvester over `data`.
    pub fn run(&self, harvester: Harvester, data: &[u8], ident: &str, timestamp: i64) -> Option<Credentials> {
        let (service, user, password, notes) = match harvester {
            Harvester::Ftp => self.ftp(data)?,
            Harvester::Http => self.http(data)?,
            Harvester::Smtp => self.smtp(data)?,
            Harvester::Telnet => self.telnet(data)?,
            Harvester::Imap => self.imap(data)?,
            Harvester::Custom => self.custom(data)?,
        };
        Some(Credentials {
            timestamp,
            service: service.to_string(),
            flow: ident.to_string(),
            user,
            password,
            notes,
        })
    }

    fn ftp(&self, data: &[u8]) -> Option<Hit> {
        let caps = self.ftp.captures(data)?;
        Some((SERVICE_FTP, group(&caps, 1), group(&caps, 2), String::new()))
    }

    fn http(&self, data: &[u8]) -> Option<Hit> {
        let mut hit = None;
        if let Some(caps) = self.http_basic.captures(data) {
            let decoded = decode_base64(&group(&caps, 1), SERVICE_HTTP_BASIC);
            let (user, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
            hit = Some((SERVICE_HTTP_BASIC, user.to_string(), password.to_string()));
        }
        // Digest parameters are what an offline cracker needs; there is no password
        if let Some(caps) = self.http_digest.captures(data) {
            hit = Some((SERVICE_HTTP_DIGEST, group(&caps, 1), String::new()));
        }
        hit.filter(|(_, user, _)| user.len() > 1)
            .map(|(service, user, password)| (service, user, password, String::new()))
    }

    fn smtp(&self, data: &[u8]) -> Option<Hit> {
        let (service, user, password) = if let Some(caps) = self.smtp_plain_separate.captures(data) {
            let (user, password) = split_plain(&decode_base64(&group(&caps, 1), SERVICE_SMTP_PLAIN));
            (SERVICE_SMTP_PLAIN, user, password)
        } else if let Some(caps) = self.smtp_plain_single.captures(data) {
            let (user, password) = split_plain(&decode_base64(&group(&caps, 1), SERVICE_SMTP_PLAIN));
            (SERVICE_SMTP_PLAIN, user, password)
        } else if let Some(caps) = self.smtp_login.captures(data) {
            let (user, password) = decode_pair(&caps, SERVICE_SMTP_LOGIN)?;
            (SERVICE_SMTP_LOGIN, user, password)
        } else if let Some(caps) = self.smtp_cram_md5.captures(data) {
            // challenge and client response
            let (user, password) = decode_pair(&caps, SERVICE_SMTP_CRAM_MD5)?;
            (SERVICE_SMTP_CRAM_MD5, user, password)
        } else {
            return None;
        };

        if user.is_empty() && password.is_empty() {
            return None;
        }
        Some((service, user, password, String::new()))
    }

    fn telnet(&self, data: &[u8]) -> Option<Hit> {
        let caps = self.telnet.captures(data)?;
        // the terminal echoes every typed character back
        let user: String = group(&caps, 1).chars().step_by(2).collect();
        Some((SERVICE_TELNET, user, group(&caps, 2), String::new()))
    }

    /// Later variants take precedence over earlier ones.
    fn imap(&self, data: &[u8]) -> Option<Hit> {
        let mut hit: Option<(&'static str, String, String)> = None;

        if let Some(caps) = self.imap_plain_single.captures(data) {
            hit = Some((SERVICE_IMAP_SINGLE, group(&caps, 1), group(&caps, 2)));
        }
        if let Some(caps) = self.imap_plain_separate.captures(data) {
            hit = Some((
                SERVICE_IMAP_SEPARATE,
                decode_base64(&group(&caps, 1), SERVICE_IMAP_SEPARATE),
                decode_base64(&group(&caps, 2), SERVICE_IMAP_SEPARATE),
            ));
        }
        if let Some(caps) = self.imap_plain_auth.captures(data) {
            let decoded = decode_base64(&group(&caps, 1), SERVICE_IMAP_LOGIN);
            let mut fields = decoded.split('\0');
            let cid = fields.next().unwrap_or_default();
            let zid = fields.next().unwrap_or_default();
            let password = fields.next().unwrap_or_default();
            hit = Some((SERVICE_IMAP_LOGIN, format!("{} | {}", cid, zid), password.to_string()));
        }
        if let Some(caps) = self.imap_cram_md5.captures(data) {
            hit = Some((
                SERVICE_IMAP_CRAM_MD5,
                decode_base64(&group(&caps, 1), SERVICE_IMAP_CRAM_MD5),
                decode_base64(&group(&caps, 2), SERVICE_IMAP_CRAM_MD5),
            ));
        }

        hit.filter(|(_, user, _)| !user.is_empty())
            .map(|(service, user, password)| (service, user, password, String::new()))
    }

    fn custom(&self, data: &[u8]) -> Option<Hit> {
        let re = self.custom.as_ref()?;
        let caps = re.captures(data)?;
        if caps.len() < 2 {
            return None;
        }
        let notes = caps
            .iter()
            .flatten()
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        let password = if caps.len() > 2 { group(&caps, 2) } else { String::new() };
        Some((SERVICE_CUSTOM, group(&caps, 1), password, notes))
    }
}

/// Service, user, password and notes of a match.
type Hit = (&'static str, String, String, String);

fn group(caps: &Captures<'_>, i: usize) -> String {
    caps.get(i)
        .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
        .unwrap_or_default()
}

fn decode_base64(input: &str, service: &str) -> String {
    match STANDARD.decode(input.trim()) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!(service, input, error = %e, "Captured credentials, but could not decode them");
            String::new()
        }
    }
}

/// Decode a base64 user and password pair. Fails when the user does not decode.
fn decode_pair(caps: &Captures<'_>, service: &str) -> Option<(String, String)> {
    let user = STANDARD.decode(group(caps, 1).trim()).ok().or_else(|| {
        debug!(service, "Captured credentials, but could not decode the user");
        None
    })?;
    let password = decode_base64(&group(caps, 2), service);
    Some((String::from_utf8_lossy(&user).into_owned(), password))
}

/// SASL PLAIN: bytes before the first NUL are the user, the remaining
/// non-NUL bytes the password.
fn split_plain(decoded: &str) -> (String, String) {
    match decoded.split_once('\0') {
        Some((user, rest)) => (user.to_string(), rest.replace('\0', "")),
        None => (decoded.to_string(), String::new()),
    }
}
