//! SMTP conversation reader.
//!
//! Client lines become commands; everything between `DATA` and the lone `.`
//! line is one mail body. Server replies are grouped per multi-line reply
//! (`250-...` continuation lines). The session is replayed with separate
//! command and reply cursors to recover envelope addresses and mails.

use tracing::trace;

use super::mail;
use crate::context::Context;
use crate::error::DecodeError;
use crate::record::{Record, SmtpRecord};
use crate::stats::Stats;
use crate::stream::conversation::{decode_conversation, ConversationDecoder, ConversationInfo, RunCursor};
use crate::stream::StreamFragment;

const VERBS: [&str; 15] = [
    "HELO", "EHLO", "MAIL", "RCPT", "DATA", "RSET", "VRFY", "EXPN", "NOOP", "QUIT", "AUTH", "STARTTLS", "HELP",
    "SITE", "BDAT",
];

const MAIL_ACTION_COMPLETED: u16 = 250;
const USER_NOT_LOCAL: u16 = 251;
const AUTH_SUCCEEDED: u16 = 235;
const AUTH_FAILED: u16 = 535;
const SERVICE_CLOSING: u16 = 221;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotAuthenticated,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Request {
    Command { verb: String, argument: String },
    /// Mail text sent after `DATA`, without the terminating dot.
    Body(String),
    /// Non-command client line, e.g. SASL data.
    Continuation,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    text: String,
}

/// Framing state of one SMTP conversation.
#[derive(Debug, Default)]
pub struct SmtpDecoder {
    requests: Vec<Request>,
    replies: Vec<Reply>,
    /// Mail text collected since `DATA`, `None` outside a data block.
    data: Option<String>,
}

/// Outcome of replaying a session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SmtpSession {
    pub authenticated: bool,
    /// (envelope from, envelope to, raw mail text)
    pub mails: Vec<(String, String, String)>,
}

impl SmtpDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay the collected commands and replies.
    pub fn process(&self) -> SmtpSession {
        let mut session = SmtpSession::default();
        let mut state = State::NotAuthenticated;
        let mut from = String::new();
        let mut to: Vec<String> = Vec::new();

        // A leading 220 greeting answers no command
        let mut res = usize::from(self.replies.first().map(|r| r.code == 220).unwrap_or(false));

        for request in &self.requests {
            let code = self.replies.get(res).map(|r| r.code).unwrap_or(0);
            res += 1;

            match request {
                Request::Command { verb, argument } => match verb.as_str() {
                    "MAIL" => {
                        if code == MAIL_ACTION_COMPLETED {
                            from = address(argument);
                            to.clear();
                        }
                    }
                    "RCPT" => {
                        if code == MAIL_ACTION_COMPLETED || code == USER_NOT_LOCAL {
                            to.push(address(argument));
                        }
                    }
                    "AUTH" => {
                        if code == AUTH_SUCCEEDED {
                            state = State::Authenticated;
                        } else if code == AUTH_FAILED {
                            break;
                        }
                    }
                    "QUIT" => break,
                    _ => trace!(verb = %verb, code, "SMTP command"),
                },
                Request::Body(text) => {
                    session.mails.push((from.clone(), to.join(", "), text.clone()));
                }
                Request::Continuation => {
                    if state == State::NotAuthenticated && code == AUTH_SUCCEEDED {
                        state = State::Authenticated;
                    } else if code == AUTH_FAILED {
                        break;
                    }
                }
            }
        }
        session.authenticated = state == State::Authenticated;
        session
    }

    fn commands(&self) -> Vec<String> {
        self.requests
            .iter()
            .filter_map(|r| match r {
                Request::Command { verb, .. } => Some(verb.clone()),
                _ => None,
            })
            .collect()
    }
}

impl ConversationDecoder for SmtpDecoder {
    fn name(&self) -> &'static str {
        "SMTP"
    }

    fn read_request(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError> {
        let line = cursor.read_line()?;

        if let Some(data) = self.data.as_mut() {
            if line == "." {
                let body = self.data.take().unwrap_or_default();
                self.requests.push(Request::Body(body));
            } else {
                data.push_str(line.strip_prefix('.').unwrap_or(&line));
                data.push('\n');
            }
            return Ok(());
        }

        let trimmed = line.trim();
        let (verb, argument) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let verb = verb.to_ascii_uppercase();
        if !VERBS.contains(&verb.as_str()) {
            self.requests.push(Request::Continuation);
            return Ok(());
        }

        let quit = verb == "QUIT";
        if verb == "DATA" {
            self.data = Some(String::new());
        }
        self.requests.push(Request::Command {
            verb,
            argument: argument.trim().to_string(),
        });
        if quit {
            return Err(DecodeError::Eof);
        }
        Ok(())
    }

    fn read_response(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError> {
        let mut text = Vec::new();
        let mut last_code = 0;
        loop {
            let line = match cursor.read_line() {
                Ok(line) => line,
                Err(DecodeError::Eof) if !text.is_empty() => break,
                Err(e) => return Err(e),
            };
            let code = line.get(..3).and_then(|c| c.parse::<u16>().ok());
            let more = line.as_bytes().get(3) == Some(&b'-');
            let Some(code) = code else {
                return Err(DecodeError::malformed("SMTP", format!("invalid reply {:?}", line)));
            };
            last_code = code;
            text.push(line.get(4..).unwrap_or_default().to_string());
            if !more {
                let done = code == SERVICE_CLOSING;
                self.replies.push(Reply {
                    code,
                    text: text.join("\n"),
                });
                if done {
                    return Err(DecodeError::Eof);
                }
                return Ok(());
            }
        }
        // Run ended inside a multi-line reply
        self.replies.push(Reply {
            code: last_code,
            text: text.join("\n"),
        });
        Ok(())
    }
}

/// `FROM:<alice@example.com> SIZE=10` becomes `alice@example.com`.
fn address(argument: &str) -> String {
    let value = argument.split_once(':').map(|(_, v)| v).unwrap_or(argument).trim();
    let value = value.split_whitespace().next().unwrap_or_default();
    value.trim_matches(|c| c == '<' || c == '>').to_string()
}

/// Decode an SMTP session and write its mails and record.
pub fn decode(ctx: &Context, info: &ConversationInfo, fragments: &[StreamFragment]) {
    let mut decoder = SmtpDecoder::new();
    decode_conversation(&mut decoder, fragments, ctx, &info.ident);

    let session = decoder.process();
    let mail_ids: Vec<String> = session
        .mails
        .iter()
        .map(|(from, to, raw)| mail::process(ctx, info, raw, from, to, "SMTP"))
        .collect();

    Stats::incr(&ctx.stats.smtp_sessions);
    ctx.write(Record::Smtp(SmtpRecord {
        timestamp: info.timestamp,
        src_ip: info.client_ip.to_string(),
        dst_ip: info.server_ip.to_string(),
        src_port: info.client_port,
        dst_port: info.server_port,
        mail_ids,
        commands: decoder.commands(),
    }));
}
