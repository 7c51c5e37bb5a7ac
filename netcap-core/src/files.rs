//! File extraction and conversation saving.
//!
//! Extracted files land in `<out>/<file_storage>/<content type>/`, named
//! `<name>-<clean ident><ext>`. Truncated payloads get an `incomplete-`
//! prefix and name collisions a `-N` suffix. Saved conversations go to
//! `<out>/<tcp|udp>/<service>/<clean ident>.bin`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use base64::Engine as _;
use flate2::read::{GzDecoder, ZlibDecoder};
use md5::{Digest, Md5};
use tracing::{debug, error, info};

use crate::config::Config;
use crate::context::Context;
use crate::flow::clean_ident;
use crate::record::{FileRecord, Record};
use crate::service::port_service;
use crate::stats::Stats;
use crate::stream::conversation::ConversationInfo;
use crate::stream::parsers::content::{detect_content_type, extension_for, trim_encoding};

const MAX_BASE_LEN: usize = 250;

/// A payload to extract.
#[derive(Debug, Clone, Default)]
pub struct ExtractedFile<'a> {
    /// Human readable origin, e.g. `HTTP RESPONSE from host/path`.
    pub source: String,
    pub name: String,
    pub body: &'a [u8],
    /// Content-Encoding or Content-Transfer-Encoding of the body.
    pub encoding: String,
    /// Declared content type, if any.
    pub content_type: String,
    pub host: String,
    /// The body is known to be truncated.
    pub incomplete: bool,
}

/// Output locations for extracted files and saved conversations.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: Option<PathBuf>,
    out: PathBuf,
    write_incomplete: bool,
}

impl FileStore {
    pub fn new(config: &Config) -> Self {
        Self {
            root: config.file_root(),
            out: config.out.clone(),
            write_incomplete: config.write_incomplete,
        }
    }

    /// Whether file extraction is configured.
    pub fn enabled(&self) -> bool {
        self.root.is_some()
    }

    /// Write a payload to disk and describe it.
    ///
    /// Returns `Ok(None)` when extraction is off, the body is empty, or the
    /// body is truncated and incomplete files are not kept.
    pub fn save(&self, info: &ConversationInfo, file: &ExtractedFile<'_>) -> io::Result<Option<FileRecord>> {
        let Some(storage) = &self.root else {
            return Ok(None);
        };
        if file.body.is_empty() || (file.incomplete && !self.write_incomplete) {
            return Ok(None);
        }

        let name = match file.name.as_str() {
            "" | "/" => "unknown".to_string(),
            n => n.replace(['/', '\\'], "_"),
        };
        let ident = clean_ident(&info.ident);

        let content_type = trim_encoding(detect_content_type(file.body)).to_string();
        let ext = extension_for(&content_type);
        let file_name = if Path::new(&name).extension().is_none() {
            format!("{}{}", name, ext)
        } else {
            name.clone()
        };

        let prefix = if file.incomplete { "incomplete-" } else { "" };
        let dir = storage.join(&content_type);
        fs::create_dir_all(&dir)?;
        let (mut target, mut handle) = create_unique(&dir, &format!("{}{}-{}", prefix, name, ident), ext)?;

        let data = decode_body(file.body, &file.encoding, &info.ident);
        handle.write_all(&data)?;
        handle.flush()?;
        drop(handle);

        let hash = format!("{:x}", Md5::digest(&data));
        let detected = trim_encoding(detect_content_type(&data)).to_string();
        if detected != content_type {
            // Content changed after decoding: move to the right directory
            let new_dir = storage.join(&detected);
            fs::create_dir_all(&new_dir)?;
            let stem = target
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let renamed = new_dir.join(format!("{}{}", stem, extension_for(&detected)));
            if !renamed.exists() && fs::rename(&target, &renamed).is_ok() {
                target = renamed;
            }
        }

        debug!(ident = %info.ident, target = %target.display(), length = data.len(), "Saved file");

        Ok(Some(FileRecord {
            timestamp: info.timestamp,
            name: file_name,
            length: data.len() as u64,
            hash,
            location: target.display().to_string(),
            ident: info.ident.clone(),
            source: file.source.clone(),
            content_type: if file.content_type.is_empty() {
                content_type
            } else {
                file.content_type.clone()
            },
            content_type_detected: detected,
            src_ip: info.client_ip.to_string(),
            dst_ip: info.server_ip.to_string(),
            src_port: info.client_port,
            dst_port: info.server_port,
            host: file.host.clone(),
        }))
    }

    /// Append conversation bytes to `<out>/<transport>/<service>/<clean ident>.bin`.
    pub fn save_conversation(&self, info: &ConversationInfo, data: &[u8]) -> io::Result<Option<PathBuf>> {
        if data.is_empty() {
            return Ok(None);
        }
        let service = port_service(info.server_port, info.transport)
            .or_else(|| port_service(info.client_port, info.transport))
            .unwrap_or(if is_ascii(data) { "ascii" } else { "unknown" });

        let dir = self.out.join(info.transport.to_ascii_lowercase()).join(service);
        fs::create_dir_all(&dir)?;
        let target = dir.join(format!("{}.bin", truncate(&clean_ident(&info.ident))));

        let mut handle = OpenOptions::new().create(true).append(true).open(&target)?;
        handle.write_all(data)?;
        Ok(Some(target))
    }
}

/// Extract a file and write its record. I/O failures are logged and skipped.
pub fn extract(ctx: &Context, info: &ConversationInfo, file: ExtractedFile<'_>) -> Option<FileRecord> {
    match ctx.files.save(info, &file) {
        Ok(Some(record)) => {
            Stats::incr(&ctx.stats.extracted_files);
            ctx.write(Record::File(record.clone()));
            Some(record)
        }
        Ok(None) => None,
        Err(e) => {
            error!(ident = %info.ident, name = %file.name, error = %e, "Failed to save file");
            None
        }
    }
}

/// Save a whole conversation when configured. I/O failures are logged.
pub fn save_conversation(ctx: &Context, info: &ConversationInfo, data: &[u8]) {
    match ctx.files.save_conversation(info, data) {
        Ok(Some(path)) => {
            let counter = if info.transport == "UDP" {
                &ctx.stats.saved_udp_connections
            } else {
                &ctx.stats.saved_tcp_connections
            };
            Stats::incr(counter);
            info!(ident = %info.ident, path = %path.display(), bytes = data.len(), "Saved conversation");
        }
        Ok(None) => {}
        Err(e) => error!(ident = %info.ident, error = %e, "Failed to save conversation"),
    }
}

/// Create `<dir>/<base><ext>`, or `<dir>/<base>-N<ext>` if taken.
fn create_unique(dir: &Path, base: &str, ext: &str) -> io::Result<(PathBuf, File)> {
    let base = truncate(base);
    let mut target = dir.join(format!("{}{}", base, ext));
    let mut n = 0;
    loop {
        match OpenOptions::new().write(true).create_new(true).open(&target) {
            Ok(file) => return Ok((target, file)),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                target = dir.join(format!("{}-{}{}", base, n, ext));
                n += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Undo the transfer encoding. Falls back to the raw body on failure.
fn decode_body(body: &[u8], encoding: &str, ident: &str) -> Vec<u8> {
    let encoding = encoding.trim().to_ascii_lowercase();
    let decoded = match encoding.as_str() {
        "gzip" | "x-gzip" => {
            let mut out = Vec::new();
            GzDecoder::new(body).read_to_end(&mut out).map(|_| out)
        }
        "deflate" => {
            let mut out = Vec::new();
            ZlibDecoder::new(body).read_to_end(&mut out).map(|_| out)
        }
        "base64" => {
            let compact: Vec<u8> = body.iter().copied().filter(|b| !b.is_ascii_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(compact)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        }
        _ => return body.to_vec(),
    };
    match decoded {
        Ok(data) => data,
        Err(e) => {
            debug!(ident = %ident, encoding = %encoding, error = %e, "Failed to decode body");
            body.to_vec()
        }
    }
}

fn truncate(s: &str) -> &str {
    if s.len() <= MAX_BASE_LEN {
        return s;
    }
    let mut end = MAX_BASE_LEN;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn is_ascii(data: &[u8]) -> bool {
    data.iter()
        .all(|b| b.is_ascii_graphic() || b.is_ascii_whitespace())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;

    fn info() -> ConversationInfo {
        ConversationInfo {
            ident: "10.0.0.1:40000->10.0.0.2:80".into(),
            timestamp: 1,
            client_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            client_port: 40000,
            server_ip: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            server_port: 80,
            transport: "TCP",
        }
    }

    fn store(dir: &TempDir, write_incomplete: bool) -> FileStore {
        FileStore::new(&Config {
            out: dir.path().to_path_buf(),
            file_storage: Some(PathBuf::from("files")),
            write_incomplete,
            ..Default::default()
        })
    }

    // Test 1: Plain file with collision suffix
    #[test]
    fn test_save_and_collision() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        let file = ExtractedFile {
            name: "index".into(),
            body: b"<html><body>hi</body></html>",
            ..Default::default()
        };

        let first = store.save(&info(), &file).unwrap().unwrap();
        let second = store.save(&info(), &file).unwrap().unwrap();

        assert_eq!(first.name, "index.html");
        assert_eq!(first.content_type_detected, "text/html");
        assert!(first.location.ends_with("text/html/index-10.0.0.1-40000--10.0.0.2-80.html"));
        assert!(second.location.ends_with("index-10.0.0.1-40000--10.0.0.2-80-0.html"));
        assert_eq!(first.hash, format!("{:x}", Md5::digest(b"<html><body>hi</body></html>")));
    }

    // Test 2: Gzip bodies are stored decompressed and re-sniffed
    #[test]
    fn test_gzip_body() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"plain text content").unwrap();
        let compressed = encoder.finish().unwrap();

        let record = store
            .save(
                &info(),
                &ExtractedFile {
                    name: "data".into(),
                    body: &compressed,
                    encoding: "gzip".into(),
                    ..Default::default()
                },
            )
            .unwrap()
            .unwrap();

        assert_eq!(record.length, 18);
        assert_eq!(record.content_type, "application/x-gzip");
        assert_eq!(record.content_type_detected, "text/plain");
        assert!(record.location.contains("text/plain"));
        assert_eq!(fs::read(&record.location).unwrap(), b"plain text content");
    }

    // Test 3: Incomplete bodies need write_incomplete
    #[test]
    fn test_incomplete() {
        let dir = TempDir::new().unwrap();
        let file = ExtractedFile {
            name: "part".into(),
            body: b"truncated",
            incomplete: true,
            ..Default::default()
        };
        assert!(store(&dir, false).save(&info(), &file).unwrap().is_none());

        let record = store(&dir, true).save(&info(), &file).unwrap().unwrap();
        assert!(record.location.contains("incomplete-part-"));
    }

    // Test 4: Conversations are grouped by service
    #[test]
    fn test_save_conversation() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir, false);
        let path = store.save_conversation(&info(), b"GET / HTTP/1.1\r\n").unwrap().unwrap();
        assert_eq!(path, dir.path().join("tcp/HTTP/10.0.0.1-40000--10.0.0.2-80.bin"));

        let mut other = info();
        other.server_port = 31337;
        let path = store.save_conversation(&other, b"hello").unwrap().unwrap();
        assert!(path.starts_with(dir.path().join("tcp/ascii")));
    }
}
