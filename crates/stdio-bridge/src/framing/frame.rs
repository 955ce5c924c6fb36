//! `Content-Length` framed payloads.
//!
//! HTTP clients may post an LSP/MCP style frame instead of a bare JSON value:
//!
//! ```text
//! Content-Length: 40\r\n
//! \r\n
//! {"jsonrpc":"2.0","id":1,"method":"ping"}
//! ```
//!
//! The body is always complete when this runs, so decoding is a one-shot
//! classification: either a full frame is present or there is no match.

use serde_json::Value;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Decode a `Content-Length` frame from a complete body.
///
/// Returns `None` when the header block, the length field, or enough payload
/// bytes are missing, or when the payload is not JSON. Bytes past the declared
/// length are ignored.
pub fn decode_framed(body: &[u8]) -> Option<Value> {
    let header_end = body
        .windows(HEADER_TERMINATOR.len())
        .position(|w| w == HEADER_TERMINATOR)?;
    let header = std::str::from_utf8(&body[..header_end]).ok()?;
    let content_length = content_length(header)?;

    let start = header_end + HEADER_TERMINATOR.len();
    let end = start.checked_add(content_length)?;
    let payload = body.get(start..end)?;
    serde_json::from_slice(payload).ok()
}

/// Parse an inbound payload: framed first, then the whole body as bare JSON.
pub fn decode_payload(body: &[u8]) -> Option<Value> {
    decode_framed(body).or_else(|| serde_json::from_slice(body).ok())
}

fn content_length(header: &str) -> Option<usize> {
    header.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if !name.trim().eq_ignore_ascii_case("content-length") {
            return None;
        }
        let value = value.trim_start();
        let digits = value
            .find(|c: char| !c.is_ascii_digit())
            .map_or(value, |end| &value[..end]);
        digits.parse().ok()
    })
}
