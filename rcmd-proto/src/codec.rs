//! Length-prefixed frame codec.
//!
//! Each frame is: `encode("%10d" % len(PAYLOAD))` followed by
//! `PAYLOAD = encode(postcard(msg))`. The prefix is a ten character,
//! right-justified decimal number so its encoded size is fixed per
//! [`Encoding`] and known to the receiver before any framing.

use std::io;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

/// Width of the decimal length field before encoding.
pub const LEN_DIGITS: usize = 10;

/// Maximum allowed encoded payload (64 MiB).
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

/// Byte-level encoding applied to both the length prefix and the payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum Encoding {
    /// Bytes are sent as is.
    #[default]
    Raw,
    /// Bytes are base64 encoded, for transports that mangle 8-bit or
    /// control characters.
    Base64,
}

impl Encoding {
    /// Encodes `data` for the wire.
    pub fn encode(self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Raw => data.to_vec(),
            Self::Base64 => STANDARD.encode(data).into_bytes(),
        }
    }

    /// Decodes bytes read from the wire.
    pub fn decode(self, data: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Self::Raw => Ok(data.to_vec()),
            Self::Base64 => STANDARD
                .decode(data)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
        }
    }

    /// On-wire size of the encoded length prefix.
    pub const fn prefix_len(self) -> usize {
        match self {
            Self::Raw => LEN_DIGITS,
            Self::Base64 => LEN_DIGITS.div_ceil(3) * 4,
        }
    }

    /// Returns `true` if `b` can be part of an encoded length prefix.
    ///
    /// Bytes outside this alphabet are terminal noise and are skipped while
    /// the prefix is collected.
    pub const fn is_prefix_byte(self, b: u8) -> bool {
        match self {
            Self::Raw => b == b' ' || b.is_ascii_digit(),
            Self::Base64 => b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/' | b'='),
        }
    }
}

/// Serializes `msg` into one complete frame.
pub fn frame(msg: &impl Serialize, encoding: Encoding) -> io::Result<Vec<u8>> {
    let raw =
        postcard::to_allocvec(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let payload = encoding.encode(&raw);
    if payload.len() > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 64 MiB limit",
        ));
    }
    let len = format!("{:>width$}", payload.len(), width = LEN_DIGITS);
    let mut out = encoding.encode(len.as_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decodes a collected length prefix into the payload size.
pub fn parse_len(prefix: &[u8], encoding: Encoding) -> io::Result<usize> {
    let digits = encoding.decode(prefix)?;
    let text = std::str::from_utf8(&digits)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len: usize = text.trim_start().parse().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("malformed length prefix {text:?}"),
        )
    })?;
    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds 64 MiB limit",
        ));
    }
    Ok(len)
}

/// Decodes and deserializes a payload of exactly the announced length.
pub fn unframe<T: for<'de> Deserialize<'de>>(payload: &[u8], encoding: Encoding) -> io::Result<T> {
    let raw = encoding.decode(payload)?;
    postcard::from_bytes(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
