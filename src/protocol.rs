//! Framed-message tokenization helpers.
//!
//! Every message exchanged with editor clients and the kit is a line of
//! space-separated tokens, optionally followed by a newline and a binary
//! payload (`tile: <desc>\n<png bytes>`). Tokens carrying values use the
//! `name=value` form. This module owns the splitting and typed extraction
//! used by the tile, session, and broker modules.

use thiserror::Error;

/// Error for malformed wire messages.
///
/// Raised when a message is missing required fields or carries values that
/// fail to parse. The offending message is never fatal to the connection;
/// callers reply with an `error:` frame and drop the message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// A required field was missing or out of range.
    #[error("bad argument: {0}")]
    BadArgument(String),
}

impl ProtocolError {
    /// Convenience constructor used by the parsers.
    pub fn bad(msg: impl Into<String>) -> Self {
        Self::BadArgument(msg.into())
    }
}

/// Split a message line into whitespace-separated tokens, dropping empties.
pub fn tokenize(line: &str) -> Vec<&str> {
    line.split_whitespace().collect()
}

/// Extract the first line of a possibly-binary payload.
///
/// The header of a binary-carrying frame is always ASCII; invalid UTF-8
/// before the first newline yields an empty header, which parsers reject.
pub fn first_line(data: &[u8]) -> &str {
    let end = data.iter().position(|&b| b == b'\n').unwrap_or(data.len());
    std::str::from_utf8(&data[..end]).unwrap_or("")
}

/// Return the binary remainder after the first newline, if any.
pub fn payload_after_first_line(data: &[u8]) -> Option<&[u8]> {
    data.iter()
        .position(|&b| b == b'\n')
        .map(|pos| &data[pos + 1..])
}

/// Split a `name=value` token. Returns `None` when there is no `=`.
pub fn parse_name_value(token: &str) -> Option<(&str, &str)> {
    token.split_once('=')
}

/// Find `name=value` among `tokens` and return the raw value.
pub fn get_token_string<'a>(tokens: &[&'a str], name: &str) -> Option<&'a str> {
    tokens.iter().find_map(|t| {
        parse_name_value(t).and_then(|(n, v)| if n == name { Some(v) } else { None })
    })
}

/// Find `name=value` among `tokens` and parse the value as `i64`.
pub fn get_token_i64(tokens: &[&str], name: &str) -> Option<i64> {
    get_token_string(tokens, name).and_then(|v| v.parse().ok())
}

/// Find `name=value` among `tokens` and parse the value as `u32`.
pub fn get_token_u32(tokens: &[&str], name: &str) -> Option<u32> {
    get_token_string(tokens, name).and_then(|v| v.parse().ok())
}

/// True when `tokens[index]` exists and equals `expected`.
pub fn token_matches(tokens: &[&str], index: usize, expected: &str) -> bool {
    tokens.get(index).is_some_and(|t| *t == expected)
}

/// Abbreviate a message for logging: first line only, capped length.
pub fn abbreviate(message: &str, max: usize) -> String {
    let line = message.lines().next().unwrap_or("");
    if line.len() <= max {
        line.to_string()
    } else {
        // Cut on a char boundary.
        let mut end = max;
        while !line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &line[..end])
    }
}
