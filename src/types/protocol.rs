use std::fmt;

use itertools::Itertools;

use super::serialisable::WireSerialisable;

/// Protocol version announced in `AUTH`.
pub const PROTOCOL_VERSION: u32 = 3;

pub const AUTH: &str = "AUTH";
pub const LOGOUT: &str = "LOGOUT";
pub const PING: &str = "PING";
pub const UPTIME: &str = "UPTIME";

/// Parameters whose values must never reach a log line.
const SECRET_PARAMS: &[&str] = &["pass", "s"];

/// A request sent by the client to the remote service.
///
/// On the wire: `<ACTION> <key>=<value>&<key>=<value>`, values URL-encoded.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    action: String,
    params: Vec<(String, String)>,
}

impl Command {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: Vec::new(),
        }
    }

    /// Sets a parameter, replacing any earlier value for the same key.
    pub fn param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        let key = key.into();
        self.params.retain(|(k, _)| *k != key);
        self.params.push((key, value.to_string()));
        self
    }

    /// Booleans travel as `1`/`0`.
    pub fn flag(self, key: impl Into<String>, value: bool) -> Self {
        self.param(key, if value { 1 } else { 0 })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Answers with `300 PONG`; needs no session.
    pub fn ping() -> Self {
        Self::new(PING)
    }

    pub fn uptime() -> Self {
        Self::new(UPTIME)
    }

    pub fn logout() -> Self {
        Self::new(LOGOUT)
    }

    pub fn auth(
        username: &str,
        password: &str,
        client: &str,
        client_version: u32,
    ) -> Self {
        Self::new(AUTH)
            .param("user", username)
            .param("pass", password)
            .param("protover", PROTOCOL_VERSION)
            .param("client", client)
            .param("clientver", client_version)
            .param("enc", "UTF8")
    }

    /// Commands that never trigger an implicit login.
    pub fn is_sessionless(&self) -> bool {
        matches!(self.action.as_str(), AUTH | PING | UPTIME | LOGOUT)
    }

    pub fn is_ping(&self) -> bool {
        self.action == PING
    }

    /// The wire form with credentials and the session id replaced by `****`.
    pub fn masked(&self) -> String {
        self.render(true)
    }

    fn render(&self, mask: bool) -> String {
        if self.params.is_empty() {
            return self.action.clone();
        }

        let params = self
            .params
            .iter()
            .map(|(k, v)| {
                if mask && SECRET_PARAMS.contains(&k.as_str()) {
                    format!("{k}=****")
                } else {
                    format!("{k}={}", urlencoding::encode(v))
                }
            })
            .join("&");

        format!("{} {params}", self.action)
    }
}

impl WireSerialisable for Command {
    fn serialise_wire(&self) -> Vec<u8> {
        self.render(false).into_bytes()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

/// The numeric status code leading every response.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ReturnCode(pub u16);

impl ReturnCode {
    pub const LOGIN_ACCEPTED: ReturnCode = ReturnCode(200);
    pub const LOGIN_ACCEPTED_NEW_VERSION: ReturnCode = ReturnCode(201);
    pub const LOGGED_OUT: ReturnCode = ReturnCode(203);
    pub const UPTIME: ReturnCode = ReturnCode(208);
    pub const PONG: ReturnCode = ReturnCode(300);
    pub const NOT_LOGGED_IN: ReturnCode = ReturnCode(403);
    pub const LOGIN_FAILED: ReturnCode = ReturnCode(500);
    pub const LOGIN_FIRST: ReturnCode = ReturnCode(501);
    pub const ACCESS_DENIED: ReturnCode = ReturnCode(502);
    pub const CLIENT_VERSION_OUTDATED: ReturnCode = ReturnCode(503);
    pub const CLIENT_BANNED: ReturnCode = ReturnCode(504);
    pub const ILLEGAL_INPUT_OR_ACCESS_DENIED: ReturnCode = ReturnCode(505);
    pub const INVALID_SESSION: ReturnCode = ReturnCode(506);
    pub const BANNED: ReturnCode = ReturnCode(555);
    pub const UNKNOWN_COMMAND: ReturnCode = ReturnCode(598);
    pub const INTERNAL_SERVER_ERROR: ReturnCode = ReturnCode(600);
    pub const OUT_OF_SERVICE: ReturnCode = ReturnCode(601);
    pub const SERVER_BUSY: ReturnCode = ReturnCode(602);
    pub const NO_DATA: ReturnCode = ReturnCode(603);
    pub const TIMEOUT_DELAY_AND_RESUBMIT: ReturnCode = ReturnCode(604);
    pub const API_VIOLATION: ReturnCode = ReturnCode(666);

    pub fn class(self) -> CodeClass {
        match self {
            Self::NOT_LOGGED_IN
            | Self::LOGIN_FIRST
            | Self::ACCESS_DENIED
            | Self::ILLEGAL_INPUT_OR_ACCESS_DENIED
            | Self::INVALID_SESSION => CodeClass::InvalidSession,
            Self::CLIENT_BANNED | Self::BANNED => CodeClass::Banned,
            Self::INTERNAL_SERVER_ERROR
            | Self::OUT_OF_SERVICE
            | Self::SERVER_BUSY
            | Self::TIMEOUT_DELAY_AND_RESUBMIT => CodeClass::Backoff,
            Self::UNKNOWN_COMMAND => CodeClass::UnknownCommand,
            ReturnCode(200..=399) => CodeClass::Success,
            _ => CodeClass::Rejected,
        }
    }
}

impl fmt::Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the session client reacts to a status code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CodeClass {
    /// 2xx and 3xx: handed back to the caller.
    Success,
    /// The session id is stale: log in again and resubmit once.
    InvalidSession,
    /// Sticky ban on every network request.
    Banned,
    /// The server is overloaded; wait out the backoff window.
    Backoff,
    /// Permanent, never retried.
    UnknownCommand,
    /// Any other error code. Permanent for the request that caused it.
    Rejected,
}

/// A decoded reply: `<code> <status>` on the first line, then the body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Response {
    pub code: ReturnCode,
    pub status: String,
    pub body: Vec<String>,
}

impl Response {
    pub fn new(code: ReturnCode, status: impl Into<String>) -> Self {
        Self {
            code,
            status: status.into(),
            body: Vec::new(),
        }
    }

    pub fn with_body_line(mut self, line: impl Into<String>) -> Self {
        self.body.push(line.into());
        self
    }

    /// For `AUTH` replies the status reads `<session> LOGIN ACCEPTED`.
    pub fn session_id(&self) -> Option<&str> {
        self.status.split_whitespace().next()
    }

    /// The `|`-separated fields of the first body line.
    pub fn fields(&self) -> Vec<&str> {
        self.body
            .first()
            .map(|line| line.split('|').collect())
            .unwrap_or_default()
    }
}

impl WireSerialisable for Response {
    fn serialise_wire(&self) -> Vec<u8> {
        let mut out = format!("{} {}\n", self.code, self.status);
        for line in &self.body {
            out.push_str(line);
            out.push('\n');
        }
        out.into_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_command() {
        let cmd = Command::new("FILE")
            .param("fid", 12)
            .flag("mylist", true)
            .flag("watched", false)
            .param("name", "a b&c");

        assert_eq!(
            cmd.serialise_wire(),
            b"FILE fid=12&mylist=1&watched=0&name=a%20b%26c".to_vec()
        );
        assert_eq!(Command::ping().serialise_wire(), b"PING".to_vec());
    }

    #[test]
    fn test_param_replaces_existing_key() {
        let cmd = Command::new("ANIME").param("aid", 1).param("aid", 2);
        assert_eq!(cmd.params().len(), 1);
        assert_eq!(cmd.get("aid"), Some("2"));
    }

    #[test]
    fn test_masked_hides_secrets() {
        let cmd = Command::auth("user", "hunter2", "enrichd", 1);
        let masked = cmd.masked();
        assert!(masked.contains("pass=****"));
        assert!(!masked.contains("hunter2"));

        let cmd = Command::new("FILE").param("fid", 1).param("s", "abcde");
        assert_eq!(cmd.to_string(), "FILE fid=1&s=****");
    }

    #[test]
    fn test_sessionless_commands() {
        assert!(Command::ping().is_sessionless());
        assert!(Command::uptime().is_sessionless());
        assert!(Command::logout().is_sessionless());
        assert!(Command::auth("u", "p", "c", 1).is_sessionless());
        assert!(!Command::new("FILE").is_sessionless());
    }

    #[test]
    fn test_code_classes() {
        use CodeClass::*;

        #[track_caller]
        fn class(code: u16, expected: CodeClass) {
            assert_eq!(ReturnCode(code).class(), expected);
        }

        class(200, Success);
        class(220, Success);
        class(300, Success);
        class(320, Success);
        class(403, InvalidSession);
        class(501, InvalidSession);
        class(502, InvalidSession);
        class(505, InvalidSession);
        class(506, InvalidSession);
        class(504, Banned);
        class(555, Banned);
        class(600, Backoff);
        class(601, Backoff);
        class(602, Backoff);
        class(604, Backoff);
        class(598, UnknownCommand);
        class(500, Rejected);
        class(503, Rejected);
        class(603, Rejected);
        class(666, Rejected);
    }

    #[test]
    fn test_response_accessors() {
        let login = Response::new(ReturnCode::LOGIN_ACCEPTED, "xYz12 LOGIN ACCEPTED");
        assert_eq!(login.session_id(), Some("xYz12"));

        let file = Response::new(ReturnCode(220), "FILE").with_body_line("1|2|3");
        assert_eq!(file.fields(), vec!["1", "2", "3"]);
        assert_eq!(file.serialise_wire(), b"220 FILE\n1|2|3\n".to_vec());
    }
}
