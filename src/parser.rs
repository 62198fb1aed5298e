//! implements parsers for the remote service's text protocol: replies coming
//! back from the service, and command lines (for test doubles and tooling).
use std::str;

use thiserror::Error;

use crate::types::protocol::{Command, Response, ReturnCode};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ParsingError {
    /// A command line didn't follow `ACTION k=v&k=v`.
    #[error("bad format")]
    BadFormat,
    /// The status line held fewer than two tokens.
    #[error("missing status line")]
    MissingStatus,
    /// The first token of the status line wasn't a number.
    #[error("non-numeric status code")]
    BadStatusCode,
    /// The reply wasn't valid UTF-8.
    #[error("invalid encoding")]
    Encoding,
}

/// Provides a custom, minimal, zero-copy parser of byte slices.
struct ParseState<'a> {
    from: &'a [u8],
}

impl<'a> ParseState<'a> {
    fn is_done(&self) -> bool {
        self.from.is_empty()
    }

    /// Consumes from the input, expecting a token of non-zero length.
    fn expect_next_token(&mut self) -> Result<&'a [u8], ParsingError> {
        let token = self.next_token().ok_or(ParsingError::BadFormat)?;

        if token.is_empty() {
            Err(ParsingError::BadFormat)
        } else {
            Ok(token)
        }
    }

    /// Consumes a space.
    fn expect_space(&mut self) -> Result<(), ParsingError> {
        match self.from.first() {
            Some(b' ') => {
                self.from = &self.from[1..];
                Ok(())
            },
            _ => Err(ParsingError::BadFormat),
        }
    }

    /// Consumes everything left, expecting at least one byte.
    fn expect_rest(&mut self) -> Result<&'a [u8], ParsingError> {
        if self.from.is_empty() {
            return Err(ParsingError::BadFormat);
        }

        let rest = self.from;
        self.from = &[];
        Ok(rest)
    }

    /// Consumes from this ParseState until reaching a space byte or the end of
    /// the input. It returns None at the end of the input. On consecutive space
    /// bytes, it returns a zero-length slice.
    fn next_token(&mut self) -> Option<&'a [u8]> {
        if self.from.is_empty() {
            return None;
        }

        let idx = self
            .from
            .iter()
            .position(|c| *c == b' ')
            .unwrap_or(self.from.len());

        let token = &self.from[..idx];
        self.from = &self.from[idx..];

        Some(token)
    }
}

impl<'a> From<&'a [u8]> for ParseState<'a> {
    fn from(from: &'a [u8]) -> Self {
        ParseState { from }
    }
}

/// Parses an unsigned decimal with overflow protection.
fn parse_decimal(token: &[u8]) -> Option<u64> {
    if token.is_empty() {
        return None;
    }

    let mut r = 0u64;
    for v in token {
        match v {
            b'0'..=b'9' => {
                r = r.checked_mul(10)?.checked_add((*v - b'0') as u64)?;
            },
            _ => return None,
        };
    }

    Some(r)
}

fn is_action_byte(c: u8) -> bool {
    c.is_ascii_uppercase() || c.is_ascii_digit()
}

fn is_key_byte(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

// Parsing a command line: `ACTION` or `ACTION k=v&k=v`.
impl TryFrom<&[u8]> for Command {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let mut ps: ParseState = value.into();

        let action = ps.expect_next_token()?;
        if !action.iter().all(|c| is_action_byte(*c)) {
            return Err(ParsingError::BadFormat);
        }
        // Checked above: ASCII only.
        let action =
            str::from_utf8(action).map_err(|_| ParsingError::BadFormat)?;
        let mut cmd = Command::new(action);

        if ps.is_done() {
            return Ok(cmd);
        }

        ps.expect_space()?;
        for pair in ps.expect_rest()?.split(|c| *c == b'&') {
            let eq = pair
                .iter()
                .position(|c| *c == b'=')
                .ok_or(ParsingError::BadFormat)?;
            let (key, value) = (&pair[..eq], &pair[eq + 1..]);

            if key.is_empty() || !key.iter().all(|c| is_key_byte(*c)) {
                return Err(ParsingError::BadFormat);
            }

            let key = str::from_utf8(key).map_err(|_| ParsingError::BadFormat)?;
            let value =
                str::from_utf8(value).map_err(|_| ParsingError::BadFormat)?;
            let value = urlencoding::decode(value)
                .map_err(|_| ParsingError::BadFormat)?;

            cmd = cmd.param(key, value);
        }

        Ok(cmd)
    }
}

// Parsing a reply: `<code> <status>` then zero or more body lines.
impl TryFrom<&[u8]> for Response {
    type Error = ParsingError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let text = str::from_utf8(value).map_err(|_| ParsingError::Encoding)?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        // `lines` accepts both LF and CRLF endings.
        let mut lines = text.lines();
        let status_line = lines.next().ok_or(ParsingError::MissingStatus)?;

        let mut tokens = status_line.split_whitespace();
        let code = match (tokens.next(), tokens.next()) {
            (Some(code), Some(_)) => code,
            _ => return Err(ParsingError::MissingStatus),
        };

        let code = parse_decimal(code.as_bytes())
            .and_then(|c| u16::try_from(c).ok())
            .map(ReturnCode)
            .ok_or(ParsingError::BadStatusCode)?;

        // Everything after the code token, verbatim bar surrounding spaces.
        let status = status_line
            .trim_start()
            .split_once(char::is_whitespace)
            .map(|(_, rest)| rest.trim())
            .unwrap_or_default();

        Ok(Response {
            code,
            status: status.to_owned(),
            body: lines.map(str::to_owned).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        use ParsingError::*;

        // Asserts the line parses into the given command successfully.
        #[track_caller]
        fn ok(line: &[u8], res: Command) {
            assert_eq!(line.try_into(), Ok(res));
        }

        // Asserts the line fails to parse with a BadFormat error.
        #[track_caller]
        fn bf(line: &[u8]) {
            assert_eq!(TryInto::<Command>::try_into(line), Err(BadFormat));
        }

        // Check silly non-commands
        bf(b"");
        bf(b" ");
        bf(b"PING ");
        bf(b"ping");
        bf(b"FILE fid");
        bf(b"FILE =1");
        bf(b"FILE fid=1&");

        ok(b"PING", Command::ping());
        ok(b"LOGOUT s=abc", Command::logout().param("s", "abc"));
        ok(
            b"FILE fid=12&mylist=1&name=a%20b%26c",
            Command::new("FILE")
                .param("fid", 12)
                .flag("mylist", true)
                .param("name", "a b&c"),
        );
        ok(b"EPISODE eid=", Command::new("EPISODE").param("eid", ""));
    }

    #[test]
    fn test_parse_response() {
        use ParsingError::*;

        #[track_caller]
        fn ok(raw: &[u8], code: u16, status: &str, body: &[&str]) {
            let res = Response::try_from(raw).unwrap();
            assert_eq!(res.code, ReturnCode(code));
            assert_eq!(res.status, status);
            assert_eq!(res.body, body);
        }

        #[track_caller]
        fn err(raw: &[u8], e: ParsingError) {
            assert_eq!(Response::try_from(raw), Err(e));
        }

        ok(b"300 PONG\n", 300, "PONG", &[]);
        ok(b"300 PONG", 300, "PONG", &[]);
        ok(
            b"200 abcde LOGIN ACCEPTED\n",
            200,
            "abcde LOGIN ACCEPTED",
            &[],
        );
        ok(b"220 FILE\n1|2|3\n", 220, "FILE", &["1|2|3"]);
        ok(b"220 FILE\r\n1|2|3\r\n4|5\r\n", 220, "FILE", &["1|2|3", "4|5"]);
        ok(
            "\u{feff}602 SERVER BUSY\n".as_bytes(),
            602,
            "SERVER BUSY",
            &[],
        );

        err(b"", MissingStatus);
        err(b"\n", MissingStatus);
        err(b"300\n", MissingStatus);
        err(b"PONG 300\n", BadStatusCode);
        err(b"99999 BIG\n", BadStatusCode);
        err(b"-1 NEGATIVE\n", BadStatusCode);
        err(&[0xff, 0xfe, 0x00], Encoding);
    }

    #[test]
    fn test_parse_decimal_overflow() {
        assert_eq!(parse_decimal(b"18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_decimal(b"18446744073709551616"), None);
        assert_eq!(parse_decimal(b""), None);
        assert_eq!(parse_decimal(b"12a"), None);
    }
}
