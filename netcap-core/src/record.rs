//! Audit records and the sink they are written to.
//!
//! The engine never formats or persists records itself: every finished
//! connection, service, credential and protocol exchange is handed as one
//! [`Record`] to [`RecordSink::write`].

use std::collections::BTreeMap;
use std::io;

use compact_str::CompactString;
use parking_lot::Mutex;
use serde::Serialize;

/// One structured audit record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum Record {
    Connection(ConnectionRecord),
    Service(ServiceRecord),
    Credentials(Credentials),
    Http(HttpRecord),
    Mail(Mail),
    Pop3(Pop3Record),
    Smtp(SmtpRecord),
    Ssh(SshRecord),
    File(FileRecord),
}

impl Record {
    /// Return a string representation of the record kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Record::Connection(_) => "connection",
            Record::Service(_) => "service",
            Record::Credentials(_) => "credentials",
            Record::Http(_) => "http",
            Record::Mail(_) => "mail",
            Record::Pop3(_) => "pop3",
            Record::Smtp(_) => "smtp",
            Record::Ssh(_) => "ssh",
            Record::File(_) => "file",
        }
    }
}

/// Destination of audit records.
///
/// A write failure is fatal for the run.
pub trait RecordSink: Send + Sync {
    fn write(&self, record: &Record) -> io::Result<()>;
}

/// Sink that keeps every record in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<Record>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records written so far.
    pub fn records(&self) -> Vec<Record> {
        self.records.lock().clone()
    }

    /// Number of records of the given kind.
    pub fn count(&self, kind: &str) -> usize {
        self.records
            .lock()
            .iter()
            .filter(|r| r.as_str() == kind)
            .count()
    }
}

impl RecordSink for MemorySink {
    fn write(&self, record: &Record) -> io::Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}

/// A completed TCP connection or UDP pseudo-stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionRecord {
    pub id: u64,
    pub timestamp_first: i64,
    pub timestamp_last: i64,
    pub link_proto: CompactString,
    pub network_proto: CompactString,
    pub transport_proto: CompactString,
    pub ident: String,
    pub src_ip: String,
    pub src_port: u16,
    pub dst_ip: String,
    pub dst_port: u16,
    pub total_packets: u64,
    pub total_bytes: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub application: CompactString,
}

/// Fingerprint of a server endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ServiceRecord {
    pub timestamp: i64,
    pub ip: String,
    pub port: u16,
    pub name: String,
    pub protocol: CompactString,
    #[serde(with = "lossy_bytes")]
    pub banner: Vec<u8>,
    pub flows: Vec<String>,
    pub bytes_server: u64,
    pub bytes_client: u64,
    pub product: String,
    pub vendor: String,
    pub version: String,
    pub os: String,
    pub hostname: String,
    pub notes: String,
}

/// A harvested credential.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Credentials {
    pub timestamp: i64,
    pub service: String,
    pub flow: String,
    pub user: String,
    pub password: String,
    pub notes: String,
}

/// One HTTP exchange (request with optional response).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct HttpRecord {
    pub timestamp: i64,
    pub proto: String,
    pub method: String,
    pub host: String,
    pub url: String,
    pub user_agent: String,
    pub referer: String,
    pub req_content_length: u64,
    pub req_content_encoding: String,
    pub res_content_length: u64,
    pub res_content_encoding: String,
    pub content_type: String,
    pub content_type_detected: String,
    pub status_code: u16,
    pub server_name: String,
    pub req_cookies: Vec<String>,
    pub res_cookies: Vec<String>,
    pub request_header: BTreeMap<String, String>,
    pub response_header: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub src_ip: String,
    pub dst_ip: String,
}

/// One MIME part of a mail body.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MailPart {
    pub id: String,
    pub header: BTreeMap<String, String>,
    pub filename: String,
    pub content: String,
}

/// A mail transferred over SMTP or retrieved over POP3.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Mail {
    pub id: String,
    pub origin: CompactString,
    pub timestamp: i64,
    pub return_path: String,
    pub delivery_date: String,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: String,
    pub message_id: String,
    pub references: String,
    pub in_reply_to: String,
    pub content_language: String,
    pub x_originating_ip: String,
    pub content_type: String,
    pub envelope_to: String,
    pub body: Vec<MailPart>,
    pub has_attachments: bool,
}

/// Summary of a POP3 session.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Pop3Record {
    pub timestamp: i64,
    pub client_ip: String,
    pub server_ip: String,
    pub auth_token: String,
    pub user: String,
    pub pass: String,
    pub mail_ids: Vec<String>,
    pub commands: Vec<String>,
}

/// Summary of an SMTP session.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SmtpRecord {
    pub timestamp: i64,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub mail_ids: Vec<String>,
    pub commands: Vec<String>,
}

/// SSH identification and key exchange fingerprint of one side.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct SshRecord {
    pub timestamp: i64,
    pub hassh: String,
    pub flow: String,
    pub ident: String,
    pub algorithms: String,
    pub is_client: bool,
    pub product: String,
    pub version: String,
    pub os: String,
}

/// A file extracted from a stream.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct FileRecord {
    pub timestamp: i64,
    pub name: String,
    pub length: u64,
    pub hash: String,
    pub location: String,
    pub ident: String,
    pub source: String,
    pub content_type: String,
    pub content_type_detected: String,
    pub src_ip: String,
    pub dst_ip: String,
    pub src_port: u16,
    pub dst_port: u16,
    pub host: String,
}

mod lossy_bytes {
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_counts() {
        let sink = MemorySink::new();
        sink.write(&Record::Credentials(Credentials::default())).unwrap();
        sink.write(&Record::Mail(Mail::default())).unwrap();
        sink.write(&Record::Mail(Mail::default())).unwrap();

        assert_eq!(sink.records().len(), 3);
        assert_eq!(sink.count("mail"), 2);
        assert_eq!(sink.count("credentials"), 1);
        assert_eq!(sink.count("http"), 0);
    }

    #[test]
    fn test_serialized_tag() {
        let record = Record::Service(ServiceRecord {
            ip: "10.0.0.1".into(),
            port: 22,
            banner: b"SSH-2.0-OpenSSH_8.9\r\n".to_vec(),
            ..Default::default()
        });
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "Service");
        assert_eq!(json["port"], 22);
        assert_eq!(json["banner"], "SSH-2.0-OpenSSH_8.9\r\n");
    }
}
