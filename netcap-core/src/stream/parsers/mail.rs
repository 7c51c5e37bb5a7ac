//! Mail header and MIME part parsing shared by the SMTP and POP3 readers.

use std::collections::BTreeMap;

use compact_str::CompactString;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::debug;

use crate::context::Context;
use crate::files::{self, ExtractedFile};
use crate::record::{Mail, MailPart, Record};
use crate::stats::Stats;
use crate::stream::conversation::ConversationInfo;

/// Boundary prefix used by common Java mailers.
const PART_IDENT: &str = "------=_Part_";

const MAIL_ID_LEN: usize = 20;

/// Split raw mail bytes into headers and body.
///
/// Header lines are `Key: value`; a line whose first character is not
/// uppercase continues the previous header. An empty line or an
/// `Envelope-To` header starts the body.
pub fn split_header_and_body(data: &str) -> (BTreeMap<String, String>, String) {
    let mut header: BTreeMap<String, String> = BTreeMap::new();
    let mut body = String::new();
    let mut last = String::new();
    let mut in_body = false;

    for line in lines(data) {
        if in_body {
            body.push_str(line);
            body.push('\n');
            continue;
        }
        if line.is_empty() {
            in_body = true;
            continue;
        }

        let starts_upper = line.chars().next().map(char::is_uppercase).unwrap_or(false);
        match line.split_once(": ") {
            Some((key, value)) if starts_upper => {
                if key == "Envelope-To" {
                    in_body = true;
                }
                header.insert(key.to_string(), value.to_string());
                last = key.to_string();
            }
            _ => {
                if let Some(value) = header.get_mut(&last) {
                    value.push('\n');
                    value.push_str(line);
                }
            }
        }
    }
    (header, body)
}

/// Split a mail body into MIME parts.
///
/// A part starts at a `------=_Part_<id>` line or a long `--<token>` line and
/// ends at `<id>--` or the next boundary. Lines before the first boundary
/// form a part with id `none`. A part still open at the end of the body is
/// kept.
pub fn parse_parts(body: &str) -> Vec<MailPart> {
    let mut parts = Vec::new();
    let mut current: Option<MailPart> = None;
    let mut in_payload = false;

    for line in lines(body) {
        if let Some(part) = current.as_mut() {
            if in_payload {
                if line.ends_with(&format!("{}--", part.id)) {
                    parts.extend(current.take());
                    in_payload = false;
                } else if let Some(id) = boundary(line, 25) {
                    parts.extend(current.replace(new_part(id)));
                    in_payload = false;
                } else {
                    part.content.push_str(line);
                    part.content.push('\n');
                }
                continue;
            }
            part_header_line(part, line);
            if line.is_empty() {
                in_payload = true;
            }
            continue;
        }

        if let Some(id) = boundary(line, 31) {
            current = Some(new_part(id));
            continue;
        }

        let mut part = new_part("none");
        part_header_line(&mut part, line);
        in_payload = line.is_empty();
        current = Some(part);
    }

    parts.extend(current);
    parts
}

/// Parse a mail, extract its first attachment and write the record.
///
/// `from` and `to` are the envelope addresses; the headers are used when
/// either is missing. Returns the mail id.
pub fn process(ctx: &Context, info: &ConversationInfo, data: &str, from: &str, to: &str, origin: &str) -> String {
    let mail = parse(info, data, from, to, origin);
    let id = mail.id.clone();

    if mail.has_attachments && ctx.files.enabled() {
        if let Some(part) = mail.body.iter().find(|p| is_attachment(p)) {
            files::extract(
                ctx,
                info,
                ExtractedFile {
                    source: origin.to_string(),
                    name: part.filename.clone(),
                    body: part.content.as_bytes(),
                    encoding: part
                        .header
                        .get("Content-Transfer-Encoding")
                        .cloned()
                        .unwrap_or_default(),
                    content_type: part.header.get("Content-Type").cloned().unwrap_or_default(),
                    host: format!("{}:{}", info.server_ip, info.server_port),
                    incomplete: false,
                },
            );
        }
    }

    debug!(ident = %info.ident, id = %id, origin, parts = mail.body.len(), "Parsed mail");
    Stats::incr(&ctx.stats.mails);
    ctx.write(Record::Mail(mail));
    id
}

/// Build a [`Mail`] from raw mail text.
pub fn parse(info: &ConversationInfo, data: &str, from: &str, to: &str, origin: &str) -> Mail {
    let (header, body) = split_header_and_body(data);
    let get = |key: &str| header.get(key).cloned().unwrap_or_default();

    let delivery_date = get("Delivery-Date");
    let timestamp = chrono::DateTime::parse_from_rfc2822(delivery_date.trim())
        .map(|ts| ts.timestamp_micros())
        .unwrap_or(info.timestamp);

    let (from, to) = if from.is_empty() || to.is_empty() {
        (get("From"), get("To"))
    } else {
        (from.to_string(), to.to_string())
    };

    let body = parse_parts(&body);
    let has_attachments = body.iter().any(is_attachment);

    Mail {
        id: new_mail_id(),
        origin: CompactString::new(origin),
        timestamp,
        return_path: get("Return-Path"),
        delivery_date,
        from,
        to,
        cc: get("CC"),
        subject: get("Subject"),
        date: get("Date"),
        message_id: get("Message-ID"),
        references: get("References"),
        in_reply_to: get("In-Reply-To"),
        content_language: get("Content-Language"),
        x_originating_ip: get("x-originating-ip"),
        content_type: get("Content-Type"),
        envelope_to: get("Envelope-To"),
        body,
        has_attachments,
    }
}

fn is_attachment(part: &MailPart) -> bool {
    part.header
        .get("Content-Disposition")
        .map(|d| d.contains("attachment"))
        .unwrap_or(false)
}

/// Boundary id of a part start line.
fn boundary(line: &str, min_len: usize) -> Option<&str> {
    if let Some(id) = line.strip_prefix(PART_IDENT) {
        return Some(id);
    }
    if line.len() > min_len && !line.contains('>') {
        return line.strip_prefix("--");
    }
    None
}

fn part_header_line(part: &mut MailPart, line: &str) {
    let fields: Vec<&str> = line.split(": ").collect();
    if let [key, value] = fields.as_slice() {
        part.header.insert(key.to_string(), value.to_string());
    }
    if let Some((_, name)) = line.split_once("filename=") {
        part.filename = name.trim_matches('"').to_string();
    }
}

fn new_part(id: &str) -> MailPart {
    MailPart {
        id: id.to_string(),
        ..Default::default()
    }
}

fn new_mail_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(MAIL_ID_LEN)
        .map(char::from)
        .collect()
}

fn lines(data: &str) -> impl Iterator<Item = &str> {
    data.lines().map(|l| l.strip_suffix('\r').unwrap_or(l))
}
