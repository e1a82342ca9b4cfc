//! RESP wire codec.
//!
//! The encoder serializes one command (name + arguments) as an array of
//! bulk strings. The decoder is incremental: it accepts arbitrary byte
//! chunks and yields complete replies only, leaving partial frames
//! buffered untouched so chunk boundaries never affect the decoded
//! sequence.

use super::{markers, Reply, CRLF};
use crate::error::ProtocolError;
use crate::{MAX_ARRAY_ELEMENTS, MAX_BULK_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use memchr::memchr;

/// Encode a command as a RESP array of bulk strings into `buf`.
///
/// The command name is the first element; arguments are binary-safe.
pub fn encode_command(name: &str, args: &[Bytes], buf: &mut BytesMut) {
    let payload: usize = args.iter().map(|a| a.len() + 16).sum();
    buf.reserve(name.len() + payload + 32);

    buf.put_u8(markers::ARRAY);
    buf.put_slice((1 + args.len()).to_string().as_bytes());
    buf.put_slice(CRLF);

    put_bulk(buf, name.as_bytes());
    for arg in args {
        put_bulk(buf, arg);
    }
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(markers::BULK);
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

/// Incremental RESP reply decoder.
///
/// # Usage
///
/// ```ignore
/// let mut decoder = ReplyDecoder::new();
/// decoder.extend(chunk);
/// while let Some(reply) = decoder.decode()? {
///     // Handle reply
/// }
/// ```
///
/// # Security
///
/// - Maximum bulk string size: 512 MiB
/// - Maximum array elements: 1M
///
/// Malformed input is fatal: the decoder returns a [`ProtocolError`] and
/// the caller must close the connection; there is no resynchronization.
#[derive(Debug, Default)]
pub struct ReplyDecoder {
    buffer: BytesMut,
}

impl ReplyDecoder {
    /// Create a new decoder.
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Append a chunk to the decode buffer.
    #[inline]
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns true if the buffer holds no undecoded bytes.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Number of buffered, not-yet-decoded bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Discard any buffered bytes.
    #[inline]
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Try to decode one complete reply.
    ///
    /// Returns:
    /// - `Ok(Some(reply))` if a complete reply was decoded
    /// - `Ok(None)` if more data is needed (buffer left intact)
    /// - `Err(e)` if the data is malformed
    pub fn decode(&mut self) -> Result<Option<Reply>, ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        let mut pos = 0;
        match parse_at(&self.buffer, &mut pos)? {
            Some(reply) => {
                // Only a complete frame consumes buffered bytes; a partial
                // parse leaves the cursor result unused and the buffer as-is.
                self.buffer.advance(pos);
                Ok(Some(reply))
            }
            None => Ok(None),
        }
    }
}

/// Parse one reply starting at `*pos`, advancing the cursor past it.
///
/// `Ok(None)` means the frame is incomplete; the cursor value is then
/// meaningless and the caller must not consume anything.
fn parse_at(buf: &[u8], pos: &mut usize) -> Result<Option<Reply>, ProtocolError> {
    let Some(&marker) = buf.get(*pos) else {
        return Ok(None);
    };
    *pos += 1;

    match marker {
        markers::STATUS => Ok(read_line(buf, pos)?.map(Reply::Status)),
        markers::ERROR => Ok(read_line(buf, pos)?.map(Reply::Error)),
        markers::INTEGER => match read_line(buf, pos)? {
            Some(line) => Ok(Some(Reply::Integer(parse_i64(&line)?))),
            None => Ok(None),
        },
        markers::BULK => parse_bulk(buf, pos),
        markers::ARRAY => parse_array(buf, pos),
        other => Err(ProtocolError::InvalidTypeMarker(other)),
    }
}

/// Parse a bulk string (`$len\r\n<bytes>\r\n`, or `$-1\r\n` for nil).
fn parse_bulk(buf: &[u8], pos: &mut usize) -> Result<Option<Reply>, ProtocolError> {
    let Some(line) = read_line(buf, pos)? else {
        return Ok(None);
    };
    let len = parse_i64(&line)?;
    if len < 0 {
        return Ok(Some(Reply::Null));
    }

    let len = len as usize;
    if len > MAX_BULK_SIZE {
        return Err(ProtocolError::BulkTooLarge {
            len,
            max: MAX_BULK_SIZE,
        });
    }

    if buf.len() < *pos + len + 2 {
        return Ok(None);
    }
    let data = Bytes::copy_from_slice(&buf[*pos..*pos + len]);
    if &buf[*pos + len..*pos + len + 2] != CRLF {
        return Err(ProtocolError::MissingCrlf);
    }
    *pos += len + 2;

    Ok(Some(Reply::Bulk(data)))
}

/// Parse an array (`*len\r\n` + nested frames, or `*-1\r\n` for nil).
fn parse_array(buf: &[u8], pos: &mut usize) -> Result<Option<Reply>, ProtocolError> {
    let Some(line) = read_line(buf, pos)? else {
        return Ok(None);
    };
    let len = parse_i64(&line)?;
    if len < 0 {
        return Ok(Some(Reply::Null));
    }

    let len = len as usize;
    if len > MAX_ARRAY_ELEMENTS {
        return Err(ProtocolError::TooManyElements {
            count: len,
            max: MAX_ARRAY_ELEMENTS,
        });
    }

    let mut items = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        match parse_at(buf, pos)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(Reply::Array(items)))
}

/// Read a CRLF-terminated line as a UTF-8 string, advancing the cursor.
fn read_line(buf: &[u8], pos: &mut usize) -> Result<Option<String>, ProtocolError> {
    let rest = &buf[*pos..];
    let Some(end) = find_crlf(rest) else {
        return Ok(None);
    };
    let line = std::str::from_utf8(&rest[..end])
        .map_err(|_| ProtocolError::InvalidUtf8)?
        .to_string();
    *pos += end + 2;
    Ok(Some(line))
}

fn parse_i64(line: &str) -> Result<i64, ProtocolError> {
    line.parse()
        .map_err(|_| ProtocolError::InvalidInteger(line.to_string()))
}

/// Find CRLF in a byte slice.
///
/// Uses SIMD-optimized memchr for fast `\r` search, then verifies `\n`
/// follows.
#[inline]
fn find_crlf(buf: &[u8]) -> Option<usize> {
    let mut offset = 0;
    while offset < buf.len().saturating_sub(1) {
        match memchr(b'\r', &buf[offset..]) {
            Some(rel) => {
                let abs = offset + rel;
                if abs + 1 < buf.len() && buf[abs + 1] == b'\n' {
                    return Some(abs);
                }
                offset = abs + 1;
            }
            None => return None,
        }
    }
    None
}
