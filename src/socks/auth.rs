//! RFC 1929 username/password sub-negotiation parser.
//!
//! Same byte-state-machine shape as `original_source/src/admin/admin_auth.c`
//! (`admin_auth_parser`: VERSION -> USER_LEN -> USER -> PASS_LEN -> PASS ->
//! DONE), applied here to the SOCKS5 sub-negotiation frame instead of the
//! management protocol's auth frame. Per RFC 1929, ULEN and PLEN are each
//! 1-255; a zero-length username or password is a protocol error rather
//! than an empty field.

pub const AUTH_VERSION: u8 = 0x01;
pub const AUTH_SUCCESS: u8 = 0x00;
pub const AUTH_FAILURE: u8 = 0x01;
const MAX_FIELD_LEN: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Version,
    UserLen,
    User,
    PassLen,
    Pass,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NeedMore,
    Done,
    Error,
}

/// Incremental parser for the username/password sub-negotiation request.
pub struct AuthParser {
    state: State,
    ulen: u8,
    plen: u8,
    username: Vec<u8>,
    password: Vec<u8>,
}

impl AuthParser {
    pub fn new() -> Self {
        AuthParser {
            state: State::Version,
            ulen: 0,
            plen: 0,
            username: Vec::new(),
            password: Vec::new(),
        }
    }

    pub fn consume(&mut self, input: &[u8]) -> (usize, Outcome) {
        let mut consumed = 0;
        for &byte in input {
            consumed += 1;
            match self.step(byte) {
                Outcome::NeedMore => continue,
                outcome => return (consumed, outcome),
            }
        }
        (consumed, Outcome::NeedMore)
    }

    fn step(&mut self, byte: u8) -> Outcome {
        match self.state {
            State::Version => {
                if byte != AUTH_VERSION {
                    return Outcome::Error;
                }
                self.state = State::UserLen;
                Outcome::NeedMore
            }
            State::UserLen => {
                if byte == 0 {
                    return Outcome::Error;
                }
                self.ulen = byte;
                self.username.clear();
                self.username.reserve(byte as usize);
                self.state = State::User;
                Outcome::NeedMore
            }
            State::User => {
                self.username.push(byte);
                if self.username.len() >= self.ulen as usize {
                    self.state = State::PassLen;
                }
                Outcome::NeedMore
            }
            State::PassLen => {
                if byte == 0 {
                    return Outcome::Error;
                }
                self.plen = byte;
                self.password.clear();
                self.password.reserve(byte as usize);
                self.state = State::Pass;
                Outcome::NeedMore
            }
            State::Pass => {
                self.password.push(byte);
                if self.password.len() >= self.plen as usize {
                    Outcome::Done
                } else {
                    Outcome::NeedMore
                }
            }
        }
    }

    pub fn username(&self) -> Option<&str> {
        std::str::from_utf8(&self.username).ok()
    }

    pub fn password(&self) -> Option<&str> {
        std::str::from_utf8(&self.password).ok()
    }
}

impl Default for AuthParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialize the two-byte sub-negotiation reply.
pub fn reply(status: u8) -> [u8; 2] {
    [AUTH_VERSION, status]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(username: &str, password: &str) -> Vec<u8> {
        let mut buf = vec![AUTH_VERSION, username.len() as u8];
        buf.extend_from_slice(username.as_bytes());
        buf.push(password.len() as u8);
        buf.extend_from_slice(password.as_bytes());
        buf
    }

    #[test]
    fn test_parses_username_and_password() {
        let mut p = AuthParser::new();
        let input = frame("alice", "secret");
        let (consumed, outcome) = p.consume(&input);
        assert_eq!(consumed, input.len());
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(p.username(), Some("alice"));
        assert_eq!(p.password(), Some("secret"));
    }

    #[test]
    fn test_empty_password_errors() {
        let mut p = AuthParser::new();
        let input = frame("alice", "");
        let (_, outcome) = p.consume(&input);
        assert_eq!(outcome, Outcome::Error);
    }

    #[test]
    fn test_empty_username_errors() {
        let mut p = AuthParser::new();
        let input = frame("", "secret");
        let (_, outcome) = p.consume(&input);
        assert_eq!(outcome, Outcome::Error);
    }

    #[test]
    fn test_bad_version_errors() {
        let mut p = AuthParser::new();
        let (_, outcome) = p.consume(&[0x05]);
        assert_eq!(outcome, Outcome::Error);
    }

    #[test]
    fn test_incremental_across_calls() {
        let mut p = AuthParser::new();
        let input = frame("bob", "hunter2");
        let mut total = 0;
        for chunk in input.chunks(1) {
            let (consumed, outcome) = p.consume(chunk);
            total += consumed;
            if outcome == Outcome::Done {
                break;
            }
        }
        assert_eq!(total, input.len());
        assert_eq!(p.username(), Some("bob"));
        assert_eq!(p.password(), Some("hunter2"));
    }

    #[test]
    fn test_max_field_len_accepted() {
        let mut p = AuthParser::new();
        let long_user = "u".repeat(MAX_FIELD_LEN);
        let input = frame(&long_user, "p");
        let (_, outcome) = p.consume(&input);
        assert_eq!(outcome, Outcome::Done);
        assert_eq!(p.username().unwrap().len(), MAX_FIELD_LEN);
    }

    #[test]
    fn test_roundtrip_reply_bytes() {
        assert_eq!(reply(AUTH_SUCCESS), [0x01, 0x00]);
        assert_eq!(reply(AUTH_FAILURE), [0x01, 0x01]);
    }
}
