use std::collections::BTreeMap;
use std::fmt::Write as _;

use anyhow::{anyhow, Result};

use crate::rule::Rule;

/// Derives the canonical cache key for a request: ignored query parameters
/// are dropped and the remainder is re-encoded in sorted order, so
/// semantically-equivalent URLs map to one entry.
pub fn cache_key(scheme: &str, host: &str, path: &str, raw_query: Option<&str>, rule: Option<&Rule>) -> String {
    let ignored: &[String] = rule.map(|r| r.ignored_parameters()).unwrap_or(&[]);

    let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Some(raw_query) = raw_query {
        for (name, value) in parse_query(raw_query) {
            if ignored.iter().any(|p| p == &name) {
                continue;
            }
            params.entry(name).or_default().push(value);
        }
    }

    let mut key = format!("{scheme}://{host}{path}");
    let mut first = true;
    for (name, values) in &params {
        for value in values {
            key.push(if first { '?' } else { '&' });
            first = false;
            key.push_str(&encode(name));
            key.push('=');
            key.push_str(&encode(value));
        }
    }

    key
}

fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((name, value)) => (unescape(name), unescape(value)),
            None => (unescape(pair), String::new()),
        })
        .collect()
}

// Lenient unescaping of a query component: `+` means space, malformed
// percent escapes are kept verbatim.
fn unescape(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 3 <= bytes.len() => match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                (Some(high), Some(low)) => {
                    out.push(high << 4 | low);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            other => {
                out.push(other);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

/// Strict percent-encoding: everything outside `[0-9A-Za-z_-]` is escaped.
/// The output doubles as a filesystem-safe token, which is why this is
/// stricter than RFC 3986 requires.
pub fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.bytes() {
        match c {
            b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z' | b'-' | b'_' => out.push(c as char),
            _ => {
                let _ = write!(out, "%{c:02x}");
            }
        }
    }
    out
}

/// Inverse of [`encode`]. Rejects truncated escape sequences.
pub fn decode(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'%' {
            if i + 3 > bytes.len() {
                return Err(anyhow!("incomplete input"));
            }
            let (Some(high), Some(low)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) else {
                return Err(anyhow!("invalid escape sequence"));
            };
            out.push(high << 4 | low);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }

    Ok(String::from_utf8_lossy(&out).into_owned())
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}
