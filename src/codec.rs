// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Wire codec: length-prefixed multi-token commands.
//!
//! Both the streaming data channel and the control handshake speak the same
//! textual protocol: a command is an array of bulk strings
//! (`*<n>\r\n` followed by `$<len>\r\n<bytes>\r\n` per token). Replies on the
//! control channel are a single token: a simple string (`+OK\r\n`), an error
//! string (`-ERR ...\r\n`), a bulk string, or a one-element array of bulk
//! strings.
//!
//! The data channel is fire-and-forget: commands for a whole batch are
//! serialized back to back into one buffer and written in a single
//! transmission. Only the handshake ever parses a reply.

use crate::error::{RelayError, Result};

/// Serialize one command (array of bulk strings) into `out`.
///
/// Appends to the buffer so a batch of commands can be accumulated
/// and flushed as one transmission.
pub fn encode_command(args: &[&[u8]], out: &mut Vec<u8>) {
    out.extend_from_slice(format!("*{}\r\n", args.len()).as_bytes());
    for arg in args {
        out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
        out.extend_from_slice(arg);
        out.extend_from_slice(b"\r\n");
    }
}

/// Convenience for string-token commands (handshake path).
pub fn encode_command_str(args: &[&str], out: &mut Vec<u8>) {
    let raw: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
    encode_command(&raw, out);
}

/// A parsed single-token reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Simple string (`+OK`).
    Simple(String),
    /// Error string (`-ERR ...`).
    Error(String),
    /// Bulk string (`$2\r\nok\r\n`); `None` for a nil bulk (`$-1`).
    Bulk(Option<String>),
}

impl Reply {
    /// The first token of the reply, for matching against expected answers.
    ///
    /// Error replies yield their message; a nil bulk yields an empty token.
    pub fn token(&self) -> &str {
        match self {
            Reply::Simple(s) => s,
            Reply::Error(s) => s,
            Reply::Bulk(Some(s)) => s,
            Reply::Bulk(None) => "",
        }
    }

    /// Whether this reply is the (case-insensitive) OK token.
    pub fn is_ok(&self) -> bool {
        !matches!(self, Reply::Error(_)) && self.token().eq_ignore_ascii_case("ok")
    }
}

/// Parse a single reply from `buf`.
///
/// Returns the reply and the number of bytes consumed, or `Ok(None)` if the
/// buffer does not yet hold a complete reply (caller reads more and retries).
/// Array replies are unwrapped to their first bulk element, matching the
/// handshake contract of exactly one reply token.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>> {
    let Some((line, consumed)) = read_line(buf) else {
        return Ok(None);
    };
    match line.first().copied() {
        Some(b'+') => Ok(Some((
            Reply::Simple(lossy(&line[1..])),
            consumed,
        ))),
        Some(b'-') => Ok(Some((Reply::Error(lossy(&line[1..])), consumed))),
        Some(b'$') => parse_bulk(buf, &line[1..], consumed),
        Some(b'*') => {
            let count: i64 = parse_int(&line[1..])?;
            if count < 1 {
                return Ok(Some((Reply::Bulk(None), consumed)));
            }
            // Exactly one token matters; parse the first element.
            match parse_reply(&buf[consumed..])? {
                Some((reply, inner)) => Ok(Some((reply, consumed + inner))),
                None => Ok(None),
            }
        }
        Some(other) => Err(RelayError::Protocol(format!(
            "unexpected reply type byte {:#04x}",
            other
        ))),
        None => Err(RelayError::Protocol("empty reply line".to_string())),
    }
}

fn parse_bulk(buf: &[u8], len_digits: &[u8], header: usize) -> Result<Option<(Reply, usize)>> {
    let len: i64 = parse_int(len_digits)?;
    if len < 0 {
        return Ok(Some((Reply::Bulk(None), header)));
    }
    let len = len as usize;
    let needed = header + len + 2;
    if buf.len() < needed {
        return Ok(None);
    }
    if &buf[header + len..needed] != b"\r\n" {
        return Err(RelayError::Protocol("bulk string missing terminator".to_string()));
    }
    Ok(Some((
        Reply::Bulk(Some(lossy(&buf[header..header + len]))),
        needed,
    )))
}

/// Find one `\r\n`-terminated line; returns (line without terminator, bytes consumed).
fn read_line(buf: &[u8]) -> Option<(&[u8], usize)> {
    let pos = buf.windows(2).position(|w| w == b"\r\n")?;
    Some((&buf[..pos], pos + 2))
}

fn parse_int(digits: &[u8]) -> Result<i64> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| RelayError::Protocol(format!("bad integer: {:?}", lossy(digits))))
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
