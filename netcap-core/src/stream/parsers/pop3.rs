//! POP3 conversation reader.
//!
//! Framing collects one command per client line and one line per server
//! line. The session is then replayed through a two-state machine
//! (`NotAuthenticated`, `Authenticated`) with separate request and response
//! cursors, since multi-line replies do not pair 1:1 with commands.

use tracing::trace;

use super::mail;
use crate::context::Context;
use crate::error::DecodeError;
use crate::record::{Credentials, Pop3Record, Record};
use crate::stats::Stats;
use crate::stream::conversation::{decode_conversation, ConversationDecoder, ConversationInfo, RunCursor};
use crate::stream::StreamFragment;

const OK: &str = "+OK";
const ERR: &str = "-ERR";
const DOT: &str = ".";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotAuthenticated,
    Authenticated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Command {
    verb: String,
    argument: String,
    /// The raw line, kept for SASL continuation data.
    line: String,
}

/// Framing state of one POP3 conversation.
#[derive(Debug, Default)]
pub struct Pop3Decoder {
    requests: Vec<Command>,
    responses: Vec<String>,
    /// Server lines sent before the first command.
    greeting: Option<String>,
}

/// Outcome of replaying a session.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Pop3Session {
    pub user: String,
    pub pass: String,
    pub token: String,
    /// Raw text of every retrieved mail.
    pub mails: Vec<String>,
}

impl Pop3Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replay the collected lines through the session state machine.
    pub fn process(&self) -> Pop3Session {
        let mut session = Pop3Session::default();
        let mut state = State::NotAuthenticated;
        let mut res = 0;
        let mut req = 0;

        while let Some(cmd) = self.requests.get(req) {
            req += 1;
            let status = self.responses.get(res).map(String::as_str).unwrap_or("");
            let ok = status.starts_with(OK);

            match (state, cmd.verb.as_str()) {
                (_, "QUIT") => break,
                (State::NotAuthenticated, "USER") => {
                    res += 1;
                    if ok {
                        session.user = cmd.argument.clone();
                    }
                }
                (State::NotAuthenticated, "PASS") => {
                    res += 1;
                    if ok {
                        session.pass = cmd.argument.clone();
                        state = State::Authenticated;
                    } else if status.starts_with(ERR) {
                        break;
                    }
                }
                (State::NotAuthenticated, "APOP") => {
                    res += 1;
                    if ok {
                        let (name, digest) = cmd.argument.split_once(' ').unwrap_or((cmd.argument.as_str(), ""));
                        session.user = name.to_string();
                        session.token = digest.to_string();
                        state = State::Authenticated;
                    }
                }
                (State::NotAuthenticated, "AUTH") => {
                    res += 1;
                    let mut status = status;
                    // SASL exchange: `+ challenge` answered by one client line
                    while status.starts_with('+') && !status.starts_with(OK) {
                        let Some(data) = self.requests.get(req) else {
                            break;
                        };
                        req += 1;
                        session.token = data.line.clone();
                        status = self.responses.get(res).map(String::as_str).unwrap_or("");
                        res += 1;
                    }
                    if status.starts_with(OK) {
                        state = State::Authenticated;
                    } else if status.starts_with(ERR) {
                        break;
                    }
                }
                (_, "CAPA") => {
                    res += 1;
                    if ok {
                        res = self.skip_multiline(res).0;
                    }
                }
                (State::Authenticated, "RETR") | (State::Authenticated, "TOP") => {
                    if ok {
                        res += 1;
                    }
                    let (next, body) = self.skip_multiline(res);
                    res = next;
                    session.mails.push(body);
                }
                (State::Authenticated, "LIST") | (State::Authenticated, "UIDL") => {
                    res += 1;
                    if ok && cmd.argument.is_empty() {
                        res = self.skip_multiline(res).0;
                    }
                }
                _ => {
                    trace!(verb = %cmd.verb, "Unhandled POP3 command");
                    res += 1;
                }
            }
        }
        session
    }

    /// Collect lines up to the lone `.` terminator, undoing dot-stuffing.
    ///
    /// Returns the index after the terminator and the collected text.
    fn skip_multiline(&self, start: usize) -> (usize, String) {
        let mut text = String::new();
        let mut idx = start;
        while let Some(line) = self.responses.get(idx) {
            idx += 1;
            if line == DOT {
                break;
            }
            text.push_str(line.strip_prefix('.').unwrap_or(line));
            text.push('\n');
        }
        (idx, text)
    }

    fn commands(&self) -> Vec<String> {
        self.requests.iter().map(|c| c.verb.clone()).collect()
    }
}

impl ConversationDecoder for Pop3Decoder {
    fn name(&self) -> &'static str {
        "POP3"
    }

    fn read_request(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError> {
        let line = cursor.read_line()?;
        let trimmed = line.trim();
        let (verb, argument) = trimmed.split_once(' ').unwrap_or((trimmed, ""));
        let verb = verb.to_ascii_uppercase();
        let quit = verb == "QUIT";
        self.requests.push(Command {
            verb,
            argument: argument.trim().to_string(),
            line,
        });
        if quit {
            return Err(DecodeError::Eof);
        }
        Ok(())
    }

    fn read_response(&mut self, cursor: &mut RunCursor<'_>) -> Result<(), DecodeError> {
        let line = cursor.read_line()?;
        if self.requests.is_empty() && self.greeting.is_none() && line.starts_with(OK) {
            self.greeting = Some(line);
            return Ok(());
        }
        let done = line.starts_with("-ERR authentication failed") || line.contains("signing off");
        self.responses.push(line);
        if done {
            return Err(DecodeError::Eof);
        }
        Ok(())
    }
}

/// Decode a POP3 session and write its mails, credentials and record.
pub fn decode(ctx: &Context, info: &ConversationInfo, fragments: &[StreamFragment]) {
    let mut decoder = Pop3Decoder::new();
    decode_conversation(&mut decoder, fragments, ctx, &info.ident);

    let session = decoder.process();
    let mail_ids: Vec<String> = session
        .mails
        .iter()
        .map(|raw| mail::process(ctx, info, raw, "", "", "POP3"))
        .collect();

    if !session.user.is_empty() || !session.pass.is_empty() {
        ctx.credential(Credentials {
            timestamp: info.timestamp,
            service: "POP3".into(),
            flow: info.ident.clone(),
            user: session.user.clone(),
            password: session.pass.clone(),
            notes: String::new(),
        });
    }

    Stats::incr(&ctx.stats.pop3_sessions);
    ctx.write(Record::Pop3(Pop3Record {
        timestamp: info.timestamp,
        client_ip: info.client_ip.to_string(),
        server_ip: info.server_ip.to_string(),
        auth_token: session.token,
        user: session.user,
        pass: session.pass,
        mail_ids,
        commands: decoder.commands(),
    }));
}
