//! Topic string escaping.
//!
//! A restricted quoted-printable scheme: `=` followed by two hex digits
//! stands for one byte. It is not RFC 1521; soft line breaks and
//! whitespace rules do not exist here. A string with no byte above 127
//! passes through untouched, `=` included. Anything else is unescaped
//! and then read as UTF-8.

use std::borrow::Cow;

use crate::wire::DecodeError;

const ESCAPE: u8 = b'=';
const HEX_UPPER: &[u8; 16] = b"0123456789ABCDEF";

/// True when `raw` must go through the unescape + UTF-8 path.
fn needs_unescape(raw: &[u8]) -> bool {
    !raw.is_ascii()
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Decode the on-wire bytes of a topic string.
pub fn decode_topic(raw: &[u8]) -> Result<String, DecodeError> {
    if !needs_unescape(raw) {
        // Every byte is ASCII, so this is a byte-for-byte passthrough.
        return Ok(raw.iter().map(|&b| b as char).collect());
    }

    let mut decoded = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        let b = raw[i];
        if b != ESCAPE {
            decoded.push(b);
            i += 1;
            continue;
        }
        let (hi, lo) = match (raw.get(i + 1), raw.get(i + 2)) {
            (Some(&hi), Some(&lo)) => (hi, lo),
            _ => return Err(DecodeError::BadEscape { offset: i }),
        };
        match (hex_value(hi), hex_value(lo)) {
            (Some(hi), Some(lo)) => decoded.push((hi << 4) | lo),
            _ => return Err(DecodeError::BadEscape { offset: i }),
        }
        i += 3;
    }

    String::from_utf8(decoded).map_err(|e| DecodeError::InvalidUtf8(e.utf8_error()))
}

/// Encode a topic for the wire. Borrowed when the topic is plain ASCII.
///
/// Non-ASCII topics keep their raw UTF-8 bytes. Those bytes are what send
/// the receiver down the unescape path, so only `=` is escaped there.
pub fn encode_topic(topic: &str) -> Cow<'_, [u8]> {
    let bytes = topic.as_bytes();
    if !needs_unescape(bytes) {
        return Cow::Borrowed(bytes);
    }

    let escapes = bytes.iter().filter(|&&b| b == ESCAPE).count();
    let mut out = Vec::with_capacity(bytes.len() + escapes * 2);
    for &b in bytes {
        if b == ESCAPE {
            out.push(ESCAPE);
            out.push(HEX_UPPER[(b >> 4) as usize]);
            out.push(HEX_UPPER[(b & 0x0f) as usize]);
        } else {
            out.push(b);
        }
    }
    Cow::Owned(out)
}
