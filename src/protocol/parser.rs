//! RESP Command Parser
//!
//! Clients send every command as an array of bulk strings:
//!
//! ```text
//! *<N>\r\n
//! $<len>\r\n<len bytes>\r\n      (N times)
//! ```
//!
//! The parser works on a buffer that may hold a partial frame or several
//! frames back to back. It returns either:
//! - `Ok(Some((args, consumed)))` - a complete command, `consumed` bytes were used
//! - `Ok(None)` - the frame is incomplete, read more data and try again
//! - `Err(ParseError)` - the bytes can never become a valid frame
//!
//! A framing error leaves the stream position undefined, so callers must drop
//! the connection instead of trying to skip the bad bytes.

use crate::protocol::types::{prefix, CRLF};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while decoding a request frame.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The frame does not start with the array prefix `*`
    #[error("expected '*', got {0:#04x}")]
    ExpectedArray(u8),

    /// An array element does not start with the bulk prefix `$`
    #[error("expected '$', got {0:#04x}")]
    ExpectedBulkString(u8),

    /// A length line is not a base-10 integer
    #[error("invalid length: {0:?}")]
    InvalidLength(String),

    /// Array length is negative
    #[error("invalid multibulk length: {0}")]
    InvalidArrayLength(i64),

    /// Bulk string length is negative
    #[error("invalid bulk length: {0}")]
    InvalidBulkLength(i64),

    /// Bulk payload is not followed by CRLF
    #[error("bulk string missing trailing CRLF")]
    MissingCrlf,

    /// The bulk string exceeds the maximum allowed size
    #[error("bulk string too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Maximum size for a single bulk string (32 MB)
pub const MAX_BULK_SIZE: usize = 32 * 1024 * 1024;

/// Maximum number of arguments in one command
pub const MAX_ARGS: usize = 1024 * 1024;

/// Decodes request frames into argument vectors.
///
/// # Example
///
/// ```
/// use emberkv::protocol::RespParser;
/// use bytes::Bytes;
///
/// let parser = RespParser::new();
/// let (args, consumed) = parser
///     .parse_command(b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n")
///     .unwrap()
///     .unwrap();
/// assert_eq!(args, vec![Bytes::from("GET"), Bytes::from("name")]);
/// assert_eq!(consumed, 23);
/// ```
#[derive(Debug, Clone)]
pub struct RespParser {
    max_bulk_size: usize,
}

impl Default for RespParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RespParser {
    /// Creates a parser with the default bulk size limit.
    pub fn new() -> Self {
        Self::with_max_bulk_size(MAX_BULK_SIZE)
    }

    pub fn with_max_bulk_size(max_bulk_size: usize) -> Self {
        Self { max_bulk_size }
    }

    /// Attempts to decode one command from the front of `buf`.
    pub fn parse_command(&self, buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
        let Some((count, mut consumed)) = self.parse_length_line(buf, prefix::ARRAY)? else {
            return Ok(None);
        };

        if count < 0 {
            return Err(ParseError::InvalidArrayLength(count));
        }
        let count = count as usize;
        if count > MAX_ARGS {
            return Err(ParseError::InvalidArrayLength(count as i64));
        }

        let mut args = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            match self.parse_bulk_string(&buf[consumed..])? {
                Some((arg, used)) => {
                    args.push(arg);
                    consumed += used;
                }
                None => return Ok(None),
            }
        }

        Ok(Some((args, consumed)))
    }

    /// Parses `$<len>\r\n<data>\r\n`.
    fn parse_bulk_string(&self, buf: &[u8]) -> ParseResult<Option<(Bytes, usize)>> {
        let Some((length, data_start)) = self.parse_length_line(buf, prefix::BULK_STRING)? else {
            return Ok(None);
        };

        if length < 0 {
            return Err(ParseError::InvalidBulkLength(length));
        }
        let length = length as usize;
        if length > self.max_bulk_size {
            return Err(ParseError::MessageTooLarge {
                size: length,
                max: self.max_bulk_size,
            });
        }

        let total_needed = data_start + length + 2;
        if buf.len() < total_needed {
            return Ok(None);
        }

        if &buf[data_start + length..total_needed] != CRLF {
            return Err(ParseError::MissingCrlf);
        }

        let data = Bytes::copy_from_slice(&buf[data_start..data_start + length]);
        Ok(Some((data, total_needed)))
    }

    /// Parses a `<prefix><integer>\r\n` header line.
    ///
    /// Returns the integer and the number of bytes the line occupied.
    fn parse_length_line(&self, buf: &[u8], expected: u8) -> ParseResult<Option<(i64, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        if first != expected {
            return Err(if expected == prefix::ARRAY {
                ParseError::ExpectedArray(first)
            } else {
                ParseError::ExpectedBulkString(first)
            });
        }

        let Some(pos) = find_crlf(&buf[1..]) else {
            return Ok(None);
        };

        let line = &buf[1..1 + pos];
        let n = std::str::from_utf8(line)
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .ok_or_else(|| ParseError::InvalidLength(String::from_utf8_lossy(line).into_owned()))?;

        Ok(Some((n, 1 + pos + 2)))
    }
}

/// Finds the position of CRLF in the buffer.
///
/// Returns the position of `\r` if found, or None if CRLF is not present.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == CRLF)
}

/// Decodes a single command with a default parser.
pub fn parse_command(buf: &[u8]) -> ParseResult<Option<(Vec<Bytes>, usize)>> {
    RespParser::new().parse_command(buf)
}
