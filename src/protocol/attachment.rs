//! Attachment segment encoding.
//!
//! Headers travel as a query string: `key=value` pairs joined by `&`.
//! Bytes outside the unreserved set (`A-Z a-z 0-9 - _ . ~`) are written as
//! `%XX`, so keys and values may contain any UTF-8 text.

use super::Headers;
use crate::error::ProtocolError;

/// Encode headers into attachment bytes. No headers encode to nothing.
pub(crate) fn encode(headers: &Headers) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (key, value)) in headers.iter().enumerate() {
        if i > 0 {
            out.push(b'&');
        }
        escape_into(key.as_bytes(), &mut out);
        out.push(b'=');
        escape_into(value.as_bytes(), &mut out);
    }
    out
}

/// Decode attachment bytes into headers.
pub(crate) fn decode(input: &[u8]) -> Result<Headers, ProtocolError> {
    let mut headers = Headers::new();
    if input.is_empty() {
        return Ok(headers);
    }

    for pair in input.split(|&b| b == b'&') {
        let eq = pair
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| malformed("pair without '='"))?;
        let key = unescape(&pair[..eq])?;
        if key.is_empty() {
            return Err(malformed("empty key"));
        }
        let value = unescape(&pair[eq + 1..])?;
        headers.insert(key, value);
    }
    Ok(headers)
}

fn malformed(reason: impl Into<String>) -> ProtocolError {
    ProtocolError::MalformedAttachment {
        reason: reason.into(),
    }
}

fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~')
}

fn escape_into(input: &[u8], out: &mut Vec<u8>) {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    for &b in input {
        if is_unreserved(b) {
            out.push(b);
        } else {
            out.extend_from_slice(&[b'%', HEX[(b >> 4) as usize], HEX[(b & 0x0f) as usize]]);
        }
    }
}

fn unescape(input: &[u8]) -> Result<String, ProtocolError> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        match input[i] {
            b'%' => {
                let hi = input.get(i + 1).and_then(|&b| hex_value(b));
                let lo = input.get(i + 2).and_then(|&b| hex_value(b));
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push(hi << 4 | lo),
                    _ => return Err(malformed("bad percent escape")),
                }
                i += 3;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| malformed("invalid UTF-8"))
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
