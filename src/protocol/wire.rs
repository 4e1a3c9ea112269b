//! Wire format for the TIC-80 remoting line protocol
//!
//! The protocol is newline-delimited UTF-8 text over a bidirectional byte
//! stream:
//!
//! - Request line: `<id> <command>[ <space-separated args>]\n`
//! - Response line: `<id> <OK|ERR> <data...>\n`
//! - Lines beginning with `@` are out-of-band notifications and are ignored.
//!
//! Responses are correlated to requests by the numeric id, not by arrival
//! order. Malformed lines are protocol noise and are dropped without error.
//! String-typed arguments and results are double-quote wrapped with `\\` and
//! `\"` escaping.

use std::fmt::Write as _;
use std::time::Duration;

/// Banner the remote process must answer to `hello`
pub const HELLO_BANNER: &str = "tic-80 remoting v1";

/// Per-request response timeout
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Status of a response line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    /// Command succeeded; data carries the payload (possibly empty)
    Ok,
    /// Command failed; data carries the error text (possibly empty)
    Err,
}

/// A parsed `<id> <OK|ERR> <data...>` response line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseLine {
    /// Request id this response answers
    pub id: u64,
    /// OK or ERR
    pub status: ResponseStatus,
    /// Remainder of the line after the status token
    pub data: String,
}

/// Parse one incoming line, tolerantly.
///
/// Returns `None` for out-of-band lines (leading `@`), empty lines, and
/// anything that does not match `<id> <OK|ERR> <data...>`. Callers drop
/// `None` lines silently; they are expected noise, not protocol errors.
pub fn parse_response_line(line: &str) -> Option<ResponseLine> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('@') {
        return None;
    }

    let mut parts = line.splitn(3, char::is_whitespace);
    let id = parts.next()?.parse::<u64>().ok()?;
    let status = match parts.next()? {
        "OK" => ResponseStatus::Ok,
        "ERR" => ResponseStatus::Err,
        _ => return None,
    };
    let data = parts.next().unwrap_or("").trim_start().to_string();

    Some(ResponseLine { id, status, data })
}

/// Build a single request line, without the trailing newline.
pub fn format_request(id: u64, command: &str, args: &[String]) -> String {
    let mut line = format!("{} {}", id, command);
    for arg in args {
        // Arguments are pre-encoded by the caller where quoting is required
        let _ = write!(line, " {}", arg);
    }
    line
}

/// Wrap a string value in double quotes, escaping backslash and quote.
pub fn encode_string(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Reverse of [`encode_string`].
///
/// Trims surrounding whitespace first; input that is not quote-wrapped is
/// returned unchanged (after the trim).
pub fn decode_string(value: &str) -> String {
    let trimmed = value.trim();
    let inner = match trimmed.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner,
        None => return trimmed.to_string(),
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(escaped) => out.push(escaped),
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Check an answer to `hello` against the protocol banner.
///
/// The match is case- and surrounding-whitespace-insensitive.
pub fn banner_matches(data: &str) -> bool {
    data.trim().eq_ignore_ascii_case(HELLO_BANNER)
}
