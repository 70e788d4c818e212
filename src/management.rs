//! Length-prefixed management protocol.
//!
//! Grounded in `original_source/src/admin/{admin_protocol.h,admin_auth.c,
//! admin_commands.c}`: a credential auth frame, then a loop of
//! `[version, cmd, u16 length, payload]` commands. The auth frame has the
//! exact shape of the SOCKS RFC 1929 sub-negotiation frame, so it reuses
//! `socks::auth::AuthParser` rather than duplicating the state machine.

use mio::net::TcpStream;
use std::io::{self, Read, Write};

use crate::connlog::ConnectionLog;
use crate::metrics::Metrics;
use crate::runtime::ring::RingBuffer;
use crate::socks::auth::AuthParser;
use crate::users::{Role, UserStore};

pub const MGMT_VERSION: u8 = 0x01;
const RING_CAPACITY: usize = 8 * 1024;
const MAX_LISTED_ENTRIES: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    GetMetrics,
    ListUsers,
    AddUser,
    DelUser,
    ListConnections,
    ChangePassword,
    ChangeRole,
}

impl Command {
    fn from_u8(byte: u8) -> Option<Command> {
        match byte {
            0x01 => Some(Command::GetMetrics),
            0x02 => Some(Command::ListUsers),
            0x03 => Some(Command::AddUser),
            0x04 => Some(Command::DelUser),
            0x05 => Some(Command::ListConnections),
            0x06 => Some(Command::ChangePassword),
            0x07 => Some(Command::ChangeRole),
            _ => None,
        }
    }

    fn requires_admin(self) -> bool {
        matches!(
            self,
            Command::AddUser | Command::DelUser | Command::ChangePassword | Command::ChangeRole
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    InvalidCmd,
    UserExists,
    UserNotFound,
    PermissionDenied,
    InvalidArgs,
    AuthFailed,
}

impl Status {
    fn code(self) -> u8 {
        match self {
            Status::Ok => 0,
            Status::Error => 1,
            Status::InvalidCmd => 2,
            Status::UserExists => 3,
            Status::UserNotFound => 4,
            Status::PermissionDenied => 5,
            Status::InvalidArgs => 6,
            Status::AuthFailed => 7,
        }
    }
}

/// Incremental parser for a `[version, cmd, u16 len, payload]` command
/// frame, in the same byte-at-a-time style as the SOCKS parsers.
struct CommandFrameParser {
    state: CmdState,
    cmd: u8,
    len: u16,
    len_hi: u8,
    payload: Vec<u8>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Version,
    Cmd,
    LenHi,
    LenLo,
    Payload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseOutcome {
    NeedMore,
    Done,
    Error,
}

impl CommandFrameParser {
    fn new() -> Self {
        CommandFrameParser {
            state: CmdState::Version,
            cmd: 0,
            len: 0,
            len_hi: 0,
            payload: Vec::new(),
        }
    }

    fn consume(&mut self, input: &[u8]) -> (usize, ParseOutcome) {
        let mut consumed = 0;
        for &byte in input {
            consumed += 1;
            match self.step(byte) {
                ParseOutcome::NeedMore => continue,
                outcome => return (consumed, outcome),
            }
        }
        (consumed, ParseOutcome::NeedMore)
    }

    fn step(&mut self, byte: u8) -> ParseOutcome {
        match self.state {
            CmdState::Version => {
                if byte != MGMT_VERSION {
                    return ParseOutcome::Error;
                }
                self.state = CmdState::Cmd;
                ParseOutcome::NeedMore
            }
            CmdState::Cmd => {
                self.cmd = byte;
                self.state = CmdState::LenHi;
                ParseOutcome::NeedMore
            }
            CmdState::LenHi => {
                self.len_hi = byte;
                self.state = CmdState::LenLo;
                ParseOutcome::NeedMore
            }
            CmdState::LenLo => {
                self.len = u16::from_be_bytes([self.len_hi, byte]);
                self.payload = Vec::with_capacity(self.len as usize);
                if self.len == 0 {
                    return ParseOutcome::Done;
                }
                self.state = CmdState::Payload;
                ParseOutcome::NeedMore
            }
            CmdState::Payload => {
                self.payload.push(byte);
                if self.payload.len() >= self.len as usize {
                    ParseOutcome::Done
                } else {
                    ParseOutcome::NeedMore
                }
            }
        }
    }
}

fn encode_response(status: Status, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.push(MGMT_VERSION);
    out.push(status.code());
    out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Parse a request payload shaped `[ulen, username, plen, password]`.
fn split_user_pass(payload: &[u8]) -> Option<(&str, &str)> {
    let ulen = *payload.first()? as usize;
    let user_end = 1 + ulen;
    let username = std::str::from_utf8(payload.get(1..user_end)?).ok()?;
    let plen = *payload.get(user_end)? as usize;
    let pass_start = user_end + 1;
    let password = std::str::from_utf8(payload.get(pass_start..pass_start + plen)?).ok()?;
    Some((username, password))
}

fn split_user_role(payload: &[u8]) -> Option<(&str, Role)> {
    let ulen = *payload.first()? as usize;
    let user_end = 1 + ulen;
    let username = std::str::from_utf8(payload.get(1..user_end)?).ok()?;
    let role_byte = *payload.get(user_end)?;
    let role = if role_byte == 1 { Role::Admin } else { Role::User };
    Some((username, role))
}

fn split_username(payload: &[u8]) -> Option<&str> {
    let ulen = *payload.first()? as usize;
    std::str::from_utf8(payload.get(1..1 + ulen)?).ok()
}

/// Execute one command against the shared collaborators. Pure function of
/// its inputs, so it's testable without any socket plumbing.
pub fn handle_command(
    cmd: Command,
    payload: &[u8],
    is_admin: bool,
    metrics: &Metrics,
    users: &UserStore,
    connlog: &ConnectionLog,
) -> (Status, Vec<u8>) {
    if cmd.requires_admin() && !is_admin {
        return (Status::PermissionDenied, Vec::new());
    }

    match cmd {
        Command::GetMetrics => {
            let snap = metrics.snapshot();
            let mut out = Vec::with_capacity(32);
            out.extend_from_slice(&snap.total_connections.to_be_bytes());
            out.extend_from_slice(&snap.current_connections.to_be_bytes());
            out.extend_from_slice(&snap.bytes_transferred.to_be_bytes());
            out.extend_from_slice(&snap.server_start_time.to_be_bytes());
            (Status::Ok, out)
        }
        Command::ListUsers => {
            let all = users.list();
            let truncated = all.len().min(MAX_LISTED_ENTRIES);
            let mut out = Vec::with_capacity(1 + truncated * 32);
            out.push(truncated as u8);
            for user in all.into_iter().take(truncated) {
                out.push(user.username.len() as u8);
                out.extend_from_slice(user.username.as_bytes());
                out.extend_from_slice(&user.bytes_transferred.to_be_bytes());
                out.extend_from_slice(&user.total_connections.to_be_bytes());
            }
            (Status::Ok, out)
        }
        Command::AddUser => match split_user_role_with_pass(payload) {
            Some((username, password, role)) if !username.is_empty() && !password.is_empty() => {
                if users.add(username, password, role) {
                    (Status::Ok, Vec::new())
                } else {
                    (Status::UserExists, Vec::new())
                }
            }
            Some(_) => (Status::InvalidArgs, Vec::new()),
            None => (Status::InvalidArgs, Vec::new()),
        },
        Command::DelUser => match split_username(payload) {
            Some(username) if !username.is_empty() => {
                if users.delete(username) {
                    (Status::Ok, Vec::new())
                } else {
                    (Status::UserNotFound, Vec::new())
                }
            }
            _ => (Status::InvalidArgs, Vec::new()),
        },
        Command::ChangePassword => match split_user_pass(payload) {
            Some((username, password)) if !username.is_empty() && !password.is_empty() => {
                if users.change_password(username, password) {
                    (Status::Ok, Vec::new())
                } else {
                    (Status::UserNotFound, Vec::new())
                }
            }
            _ => (Status::InvalidArgs, Vec::new()),
        },
        Command::ChangeRole => match split_user_role(payload) {
            Some((username, role)) if !username.is_empty() => {
                if users.change_role(username, role) {
                    (Status::Ok, Vec::new())
                } else {
                    (Status::UserNotFound, Vec::new())
                }
            }
            _ => (Status::InvalidArgs, Vec::new()),
        },
        Command::ListConnections => {
            let all = connlog.snapshot();
            let truncated = all.len().min(MAX_LISTED_ENTRIES);
            let mut out = Vec::with_capacity(1 + truncated * 48);
            out.push(truncated as u8);
            for entry in all.into_iter().rev().take(truncated) {
                out.push(entry.username.len() as u8);
                out.extend_from_slice(entry.username.as_bytes());
                out.push(entry.destination.len() as u8);
                out.extend_from_slice(entry.destination.as_bytes());
                out.extend_from_slice(&entry.port.to_be_bytes());
                out.extend_from_slice(&(entry.timestamp.timestamp() as u64).to_be_bytes());
            }
            (Status::Ok, out)
        }
    }
}

/// `[ulen, username, plen, password, role_byte]`, used only by `AddUser`.
fn split_user_role_with_pass(payload: &[u8]) -> Option<(&str, &str, Role)> {
    let ulen = *payload.first()? as usize;
    let user_end = 1 + ulen;
    let username = std::str::from_utf8(payload.get(1..user_end)?).ok()?;
    let plen = *payload.get(user_end)? as usize;
    let pass_start = user_end + 1;
    let pass_end = pass_start + plen;
    let password = std::str::from_utf8(payload.get(pass_start..pass_end)?).ok()?;
    let role_byte = *payload.get(pass_end)?;
    let role = if role_byte == 1 { Role::Admin } else { Role::User };
    Some((username, password, role))
}

enum Phase {
    Auth(AuthParser),
    AuthWrite,
    Command(CommandFrameParser),
    CommandWrite,
}

/// A single management-protocol client connection. Structured like
/// `runtime::connection::Connection` (enum phase carrying its own parser,
/// two rings) but without a relay stage — every exchange is request/response.
pub struct ManagementConnection {
    pub stream: TcpStream,
    phase: Phase,
    inbox: RingBuffer,
    outbox: RingBuffer,
    is_admin: bool,
    /// Set once the auth frame finishes parsing; the event loop takes it,
    /// checks it against the user store, and calls `finish_auth`.
    pending_auth: Option<(String, String)>,
    /// Set once a command frame finishes parsing; the event loop takes it,
    /// dispatches against the shared collaborators, and calls
    /// `push_response` with the result.
    pending_command: Option<(Command, Vec<u8>)>,
    closed: bool,
}

impl ManagementConnection {
    pub fn new(stream: TcpStream) -> Self {
        ManagementConnection {
            stream,
            phase: Phase::Auth(AuthParser::new()),
            inbox: RingBuffer::new(RING_CAPACITY),
            outbox: RingBuffer::new(RING_CAPACITY),
            is_admin: false,
            pending_auth: None,
            pending_command: None,
            closed: false,
        }
    }

    pub fn wants_read(&self) -> bool {
        !self.closed && matches!(self.phase, Phase::Auth(_) | Phase::Command(_))
    }

    pub fn wants_write(&self) -> bool {
        !self.closed && !self.outbox.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn on_readable(&mut self) -> io::Result<()> {
        if !self.inbox.can_write() {
            return Ok(());
        }
        let n = self.stream.read(self.inbox.writable_span())?;
        if n == 0 {
            self.closed = true;
            return Ok(());
        }
        self.inbox.advance_write(n);
        self.pump()
    }

    fn pump(&mut self) -> io::Result<()> {
        loop {
            let progressed = match &mut self.phase {
                Phase::Auth(_) | Phase::Command(_) if self.inbox.readable_span().is_empty() => {
                    false
                }
                Phase::Auth(parser) => {
                    let (consumed, outcome) = parser.consume(self.inbox.readable_span());
                    self.inbox.advance_read(consumed);
                    match outcome {
                        crate::socks::auth::Outcome::NeedMore => consumed > 0,
                        crate::socks::auth::Outcome::Error => {
                            self.outbox
                                .push_slice(&encode_auth_reply(Status::AuthFailed));
                            self.phase = Phase::AuthWrite;
                            true
                        }
                        crate::socks::auth::Outcome::Done => {
                            self.pending_auth = Some((
                                parser.username().unwrap_or("").to_string(),
                                parser.password().unwrap_or("").to_string(),
                            ));
                            true
                        }
                    }
                }
                Phase::Command(parser) => {
                    let (consumed, outcome) = parser.consume(self.inbox.readable_span());
                    self.inbox.advance_read(consumed);
                    match outcome {
                        ParseOutcome::NeedMore => consumed > 0,
                        ParseOutcome::Error => {
                            self.outbox
                                .push_slice(&encode_response(Status::InvalidCmd, &[]));
                            self.phase = Phase::CommandWrite;
                            true
                        }
                        ParseOutcome::Done => {
                            match Command::from_u8(parser.cmd) {
                                Some(cmd) => {
                                    self.pending_command = Some((cmd, parser.payload.clone()));
                                }
                                None => {
                                    self.outbox
                                        .push_slice(&encode_response(Status::InvalidCmd, &[]));
                                    self.phase = Phase::CommandWrite;
                                }
                            }
                            true
                        }
                    }
                }
                _ => false,
            };
            if !progressed || self.pending_command.is_some() || self.pending_auth.is_some() {
                break;
            }
            if !matches!(self.phase, Phase::Auth(_) | Phase::Command(_)) {
                break;
            }
        }
        Ok(())
    }

    /// Take the pending auth result, if the auth frame just finished
    /// parsing: `(username, password)`.
    pub fn take_pending_auth(&mut self) -> Option<(String, String)> {
        self.pending_auth.take()
    }

    /// Complete authentication: called once by the event loop right after
    /// `take_pending_auth` returns `Some`.
    pub fn finish_auth(&mut self, authenticated: bool, is_admin: bool) {
        self.is_admin = authenticated && is_admin;
        let status = if authenticated { Status::Ok } else { Status::AuthFailed };
        self.outbox.push_slice(&encode_auth_reply(status));
        self.phase = Phase::AuthWrite;
    }

    /// If a command frame just finished parsing, take its `(cmd, payload,
    /// is_admin)` so the event loop can dispatch it and call
    /// `push_response`.
    pub fn take_pending_command(&mut self) -> Option<(Command, Vec<u8>, bool)> {
        self.pending_command
            .take()
            .map(|(cmd, payload)| (cmd, payload, self.is_admin))
    }

    pub fn push_response(&mut self, status: Status, payload: &[u8]) {
        self.outbox.push_slice(&encode_response(status, payload));
        self.phase = Phase::CommandWrite;
    }

    pub fn on_writable(&mut self) -> io::Result<()> {
        if self.outbox.is_empty() {
            return Ok(());
        }
        let n = self.stream.write(self.outbox.readable_span())?;
        if n == 0 {
            self.closed = true;
            return Ok(());
        }
        self.outbox.advance_read(n);
        if self.outbox.is_empty() {
            self.phase = match self.phase {
                Phase::AuthWrite => Phase::Command(CommandFrameParser::new()),
                Phase::CommandWrite => Phase::Command(CommandFrameParser::new()),
                _ => return Ok(()),
            };
        }
        Ok(())
    }
}

fn encode_auth_reply(status: Status) -> [u8; 2] {
    [MGMT_VERSION, status.code()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connlog::ConnectionLog;
    use crate::metrics::Metrics;
    use crate::users::{Role, UserStore};

    fn user_pass_payload(user: &str, pass: &str) -> Vec<u8> {
        let mut p = vec![user.len() as u8];
        p.extend_from_slice(user.as_bytes());
        p.push(pass.len() as u8);
        p.extend_from_slice(pass.as_bytes());
        p
    }

    #[test]
    fn test_get_metrics_payload_shape() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        let users = UserStore::new();
        let connlog = ConnectionLog::new(10);
        let (status, payload) =
            handle_command(Command::GetMetrics, &[], false, &metrics, &users, &connlog);
        assert_eq!(status, Status::Ok);
        assert_eq!(payload.len(), 32);
    }

    #[test]
    fn test_add_user_requires_admin() {
        let metrics = Metrics::new();
        let users = UserStore::new();
        let connlog = ConnectionLog::new(10);
        let mut payload = user_pass_payload("bob", "hunter2");
        payload.push(0);
        let (status, _) =
            handle_command(Command::AddUser, &payload, false, &metrics, &users, &connlog);
        assert_eq!(status, Status::PermissionDenied);
    }

    #[test]
    fn test_add_user_as_admin_succeeds_then_duplicate_fails() {
        let metrics = Metrics::new();
        let users = UserStore::new();
        let connlog = ConnectionLog::new(10);
        let mut payload = user_pass_payload("bob", "hunter2");
        payload.push(0);
        let (status, _) =
            handle_command(Command::AddUser, &payload, true, &metrics, &users, &connlog);
        assert_eq!(status, Status::Ok);

        let (status, _) =
            handle_command(Command::AddUser, &payload, true, &metrics, &users, &connlog);
        assert_eq!(status, Status::UserExists);
    }

    #[test]
    fn test_del_user_not_found() {
        let metrics = Metrics::new();
        let users = UserStore::new();
        let connlog = ConnectionLog::new(10);
        let mut payload = vec![5u8];
        payload.extend_from_slice(b"ghost");
        let (status, _) =
            handle_command(Command::DelUser, &payload, true, &metrics, &users, &connlog);
        assert_eq!(status, Status::UserNotFound);
    }

    #[test]
    fn test_list_users_encoding() {
        let metrics = Metrics::new();
        let users = UserStore::new();
        users.add("alice", "pw", Role::User);
        let connlog = ConnectionLog::new(10);
        let (status, payload) =
            handle_command(Command::ListUsers, &[], true, &metrics, &users, &connlog);
        assert_eq!(status, Status::Ok);
        assert_eq!(payload[0], 1);
        assert_eq!(payload[1], 5); // "alice".len()
    }

    #[test]
    fn test_command_frame_parser_roundtrip() {
        let mut parser = CommandFrameParser::new();
        let input = [MGMT_VERSION, 0x01, 0x00, 0x00];
        let (consumed, outcome) = parser.consume(&input);
        assert_eq!(consumed, 4);
        assert_eq!(outcome, ParseOutcome::Done);
        assert_eq!(parser.cmd, 0x01);
    }

    #[test]
    fn test_command_frame_parser_with_payload() {
        let mut parser = CommandFrameParser::new();
        let mut input = vec![MGMT_VERSION, 0x05];
        input.extend_from_slice(&3u16.to_be_bytes());
        input.extend_from_slice(b"abc");
        let (consumed, outcome) = parser.consume(&input);
        assert_eq!(consumed, input.len());
        assert_eq!(outcome, ParseOutcome::Done);
        assert_eq!(parser.payload, b"abc");
    }
}
