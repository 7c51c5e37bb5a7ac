//! HTTP/1.x conversation reader using httparse.
//!
//! Requests and responses are framed one per call:
//! - Content-Length and chunked bodies
//! - close-delimited response bodies (rest of the run)
//! - keep-alive connections with several exchanges
//!
//! Responses are paired FIFO with the oldest request still waiting for one.
//! Requests left without a response are emitted on their own; responses
//! without a request are only counted.

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;

use base64::Engine as _;
use flate2::read::GzDecoder;
use httparse::{Request, Response, Status, EMPTY_HEADER};

use super::content::{detect_content_type, trim_encoding};
use crate::context::Context;
use crate::error::DecodeError;
use crate::files::{self, ExtractedFile};
use crate::record::{Credentials, HttpRecord, Record};
use crate::stats::Stats;
use crate::stream::conversation::{decode_conversation, ConversationDecoder, ConversationInfo, RunCursor};
use crate::stream::StreamFragment;

/// Maximum number of headers to parse per message.
const MAX_HEADERS: usize = 100;

/// Bytes of a compressed body inflated for content sniffing.
const SNIFF_INFLATE_LIMIT: u64 = 512;

/// Parsed message head and body shared by requests and responses.
#[derive(Debug, Default, Clone)]
struct Message {
    timestamp: i64,
    version: u8,
    headers: BTreeMap<String, String>,
    cookies: Vec<String>,
    body: Vec<u8>,
    /// The body ended before its declared length.
    incomplete: bool,
}

impl Message {
    fn header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or("")
    }

    fn content_length(&self) -> u64 {
        self.header("Content-Length")
            .trim()
            .parse()
            .unwrap_or(self.body.len() as u64)
    }

    fn proto(&self) -> String {
        format!("HTTP/1.{}", self.version)
    }
}

#[derive(Debug, Default, Clone)]
struct HttpRequest {
    method: String,
    path: String,
    message: Message,
}

#[derive(Debug, Default, Clone)]
struct HttpResponse {
    status: u16,
    message: Message,
}

#[derive(Debug)]
struct Exchange {
    request: HttpRequest,
    response: Option<HttpResponse>,
}

/// Framing state of one HTTP conversation.
#[derive(Debug, Default)]
pub struct HttpDecoder {
    exchanges: Vec<Exchange>,
    /// Indices of exchanges still waiting for a response, oldest first.
    pending: VecDeque<usize>,
    unmatched_responses: u64,
}

impl HttpDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect headers, joining repeated ones with `, `.
    fn collect_headers(headers: &[httparse::Header<'_>], message: &mut Message, cookie_header: &str) {
        for header in headers.iter().filter(|h| !h.name.is_empty()) {
            let value = String::from_utf8_lossy(header.value).trim().to_string();
            if header.name.eq_ignore_ascii_case(cookie_header) {
                if cookie_header == "Cookie" {
                    message
                        .cookies
                        .extend(value.split(';').map(str::trim).filter(|c| !c.is_empty()).map(String::from));
                } else {
                    message.cookies.push(value.clone());
                }
            }
            let name = canonical_header(header.name);
            message
                .headers
                .entry(name)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(&value);
                })
                .or_insert(value);
        }
    }

    /// Read the body following a message head.
    ///
    /// `close_delimited` allows a body without length to run until the end of
    /// the current run.
    fn read_body(cursor: &mut RunCursor<'_>, message: &mut Message, close_delimited: bool) -> Result<(), DecodeError> {
        let chunked = message
            .header("Transfer-Encoding")
            .to_ascii_lowercase()
            .contains("chunked");

        if chunked {
            let (body, consumed, complete) = decode_chunked(cursor.remaining());
            cursor.advance(consumed);
            message.body = body;
            message.incomplete = !complete;
            return Ok(());
        }

        let declared = message.header("Content-Length").trim();
        if !declared.is_empty() {
            let length: usize = declared
                .parse()
                .map_err(|_| DecodeError::malformed("HTTP", format!("invalid Content-Length {:?}", declared)))?;
            let available = cursor.remaining().len();
            let take = length.min(available);
            message.body = cursor.read_exact(take)?.to_vec();
            message.incomplete = take < length;
            return Ok(());
        }

        if close_delimited {
            message.body = cursor.read_to_end().to_vec();
        }
        Ok(())
    }
}

impl ConversationDecoder for HttpDecoder {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    fn read_request(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError> {
        if cursor.is_empty() {
            return Err(DecodeError::Eof);
        }
        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut req = Request::new(&mut headers);

        let head_len = match req.parse(cursor.remaining()) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Err(DecodeError::UnexpectedEof),
            Err(e) => return Err(DecodeError::malformed("HTTP", format!("request: {}", e))),
        };

        let mut request = HttpRequest {
            method: req.method.unwrap_or_default().to_string(),
            path: req.path.unwrap_or_default().to_string(),
            message: Message {
                timestamp: cursor.timestamp(),
                version: req.version.unwrap_or(1),
                ..Default::default()
            },
        };
        Self::collect_headers(req.headers, &mut request.message, "Cookie");
        cursor.advance(head_len);
        Self::read_body(cursor, &mut request.message, false)?;

        self.pending.push_back(self.exchanges.len());
        self.exchanges.push(Exchange {
            request,
            response: None,
        });
        Ok(())
    }

    fn read_response(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError> {
        if cursor.is_empty() {
            return Err(DecodeError::Eof);
        }
        let mut headers = [EMPTY_HEADER; MAX_HEADERS];
        let mut res = Response::new(&mut headers);

        let head_len = match res.parse(cursor.remaining()) {
            Ok(Status::Complete(n)) => n,
            Ok(Status::Partial) => return Err(DecodeError::UnexpectedEof),
            Err(e) => return Err(DecodeError::malformed("HTTP", format!("response: {}", e))),
        };

        let status = res.code.unwrap_or_default();
        let mut response = HttpResponse {
            status,
            message: Message {
                timestamp: cursor.timestamp(),
                version: res.version.unwrap_or(1),
                ..Default::default()
            },
        };
        Self::collect_headers(res.headers, &mut response.message, "Set-Cookie");
        cursor.advance(head_len);

        let head_request = self
            .pending
            .front()
            .map(|idx| self.exchanges[*idx].request.method == "HEAD")
            .unwrap_or(false);
        let bodyless = head_request || (100..200).contains(&status) || status == 204 || status == 304;
        if !bodyless {
            Self::read_body(cursor, &mut response.message, true)?;
        }

        // Interim responses do not answer the request
        if (100..200).contains(&status) {
            return Ok(());
        }

        match self.pending.pop_front() {
            Some(idx) => self.exchanges[idx].response = Some(response),
            None => self.unmatched_responses += 1,
        }
        Ok(())
    }
}

/// Decode the HTTP exchanges of a conversation and write their records.
pub fn decode(ctx: &Context, info: &ConversationInfo, fragments: &[StreamFragment]) {
    let mut decoder = HttpDecoder::new();
    decode_conversation(&mut decoder, fragments, ctx, &info.ident);

    let stats = &ctx.stats;
    Stats::add(&stats.unmatched_http_responses, decoder.unmatched_responses);
    Stats::add(&stats.unanswered_http_requests, decoder.pending.len() as u64);

    for exchange in &decoder.exchanges {
        Stats::incr(&stats.http_requests);
        if exchange.response.is_some() {
            Stats::incr(&stats.http_responses);
        }

        harvest_credentials(ctx, info, &exchange.request);
        extract_files(ctx, info, exchange);

        if !ctx.write(Record::Http(build_record(info, exchange))) {
            return;
        }
    }
}

fn build_record(info: &ConversationInfo, exchange: &Exchange) -> HttpRecord {
    let request = &exchange.request;
    let req = &request.message;

    let mut record = HttpRecord {
        timestamp: req.timestamp,
        proto: req.proto(),
        method: request.method.clone(),
        host: req.header("Host").to_string(),
        url: request.path.clone(),
        user_agent: req.header("User-Agent").to_string(),
        referer: req.header("Referer").to_string(),
        req_content_length: req.content_length(),
        req_content_encoding: req.header("Content-Encoding").to_string(),
        content_type: req.header("Content-Type").to_string(),
        req_cookies: req.cookies.clone(),
        request_header: req.headers.clone(),
        parameters: parameters(request),
        src_ip: info.client_ip.to_string(),
        dst_ip: info.server_ip.to_string(),
        ..Default::default()
    };
    if !req.body.is_empty() {
        record.content_type_detected = sniff(&req.body, req.header("Content-Encoding"));
    }

    if let Some(response) = &exchange.response {
        let res = &response.message;
        record.status_code = response.status;
        record.server_name = res.header("Server").to_string();
        record.res_content_length = res.content_length();
        record.res_content_encoding = res.header("Content-Encoding").to_string();
        record.res_cookies = res.cookies.clone();
        record.response_header = res.headers.clone();
        if !res.header("Content-Type").is_empty() {
            record.content_type = res.header("Content-Type").to_string();
        }
        if !res.body.is_empty() {
            record.content_type_detected = sniff(&res.body, res.header("Content-Encoding"));
        }
    }
    record
}

/// Query string and urlencoded form parameters of a request.
fn parameters(request: &HttpRequest) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    if let Some((_, query)) = request.path.split_once('?') {
        params.extend(url::form_urlencoded::parse(query.as_bytes()).into_owned());
    }
    let content_type = request.message.header("Content-Type");
    if trim_encoding(content_type).eq_ignore_ascii_case("application/x-www-form-urlencoded") {
        params.extend(url::form_urlencoded::parse(&request.message.body).into_owned());
    }
    params
}

/// Content type of a body, inflating gzip first.
fn sniff(body: &[u8], encoding: &str) -> String {
    let encoding = encoding.trim().to_ascii_lowercase();
    if encoding == "gzip" || encoding == "x-gzip" {
        let mut inflated = Vec::new();
        let read = GzDecoder::new(body)
            .take(SNIFF_INFLATE_LIMIT)
            .read_to_end(&mut inflated);
        if read.is_ok() || !inflated.is_empty() {
            return trim_encoding(detect_content_type(&inflated)).to_string();
        }
    }
    trim_encoding(detect_content_type(body)).to_string()
}

/// Basic auth headers and login form fields.
fn harvest_credentials(ctx: &Context, info: &ConversationInfo, request: &HttpRequest) {
    let req = &request.message;

    if let Some((user, password)) = basic_auth(req.header("Authorization")) {
        ctx.credential(Credentials {
            timestamp: req.timestamp,
            service: "HTTP Basic Auth".into(),
            flow: info.ident.clone(),
            user,
            password,
            notes: String::new(),
        });
    }

    let params = parameters(request);
    let user = params.get("user").or_else(|| params.get("username"));
    let password = params.get("pass").or_else(|| params.get("password"));
    if let (Some(user), Some(password)) = (user, password) {
        ctx.credential(Credentials {
            timestamp: req.timestamp,
            service: "HTTP".into(),
            flow: info.ident.clone(),
            user: user.clone(),
            password: password.clone(),
            notes: "Login Parameters".into(),
        });
    }
}

fn basic_auth(header: &str) -> Option<(String, String)> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .ok()?;
    let decoded = String::from_utf8_lossy(&decoded);
    let (user, password) = decoded.split_once(':')?;
    Some((user.to_string(), password.to_string()))
}

fn extract_files(ctx: &Context, info: &ConversationInfo, exchange: &Exchange) {
    if !ctx.files.enabled() {
        return;
    }
    let request = &exchange.request;
    let req = &request.message;
    let host = req.header("Host");
    let path = request.path.split('?').next().unwrap_or_default();
    let name = path.rsplit('/').next().unwrap_or_default();

    if request.method == "POST" && !req.body.is_empty() {
        files::extract(
            ctx,
            info,
            ExtractedFile {
                source: format!("HTTP POST REQUEST to {}", path),
                name: name.to_string(),
                body: &req.body,
                encoding: req.header("Content-Encoding").to_string(),
                content_type: req.header("Content-Type").to_string(),
                host: host.to_string(),
                incomplete: req.incomplete,
            },
        );
    }

    if let Some(response) = &exchange.response {
        let res = &response.message;
        if !res.body.is_empty() {
            files::extract(
                ctx,
                info,
                ExtractedFile {
                    source: format!("HTTP RESPONSE from {}{}", host, path),
                    name: name.to_string(),
                    body: &res.body,
                    encoding: res.header("Content-Encoding").to_string(),
                    content_type: res.header("Content-Type").to_string(),
                    host: host.to_string(),
                    incomplete: res.incomplete,
                },
            );
        }
    }
}

/// Decode a chunked body.
///
/// Returns the payload, the bytes consumed and whether the terminating chunk
/// was seen.
fn decode_chunked(data: &[u8]) -> (Vec<u8>, usize, bool) {
    let mut body = Vec::new();
    let mut pos = 0;

    loop {
        let Some(line_end) = data[pos..].windows(2).position(|w| w == b"\r\n").map(|p| pos + p) else {
            return (body, data.len(), false);
        };
        let size_line = String::from_utf8_lossy(&data[pos..line_end]);
        // Chunk extensions follow a semicolon
        let size_part = size_line.split(';').next().unwrap_or_default();
        let Ok(chunk_size) = usize::from_str_radix(size_part.trim(), 16) else {
            return (body, data.len(), false);
        };
        pos = line_end + 2;

        if chunk_size == 0 {
            if data[pos..].starts_with(b"\r\n") {
                return (body, pos + 2, true);
            }
            if let Some(end) = data[pos..].windows(4).position(|w| w == b"\r\n\r\n") {
                return (body, pos + end + 4, true);
            }
            return (body, data.len(), true);
        }

        let end = match pos.checked_add(chunk_size) {
            Some(end) if end <= data.len() => end,
            _ => {
                body.extend_from_slice(&data[pos..]);
                return (body, data.len(), false);
            }
        };
        body.extend_from_slice(&data[pos..end]);
        pos = end;
        if data[pos..].starts_with(b"\r\n") {
            pos += 2;
        }
    }
}

/// `content-type` becomes `Content-Type`.
fn canonical_header(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
