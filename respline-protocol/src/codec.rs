//! Encoder and decoder for RESP2 frames.
//!
//! Requests are always arrays of bulk strings:
//!
//! ```text
//! *<N+1>\r\n
//! $<len(name)>\r\n<name>\r\n
//! $<len(arg1)>\r\n<arg1>\r\n
//! ...
//! ```
//!
//! Replies start with one of five type bytes (`+ - : $ *`) and every line
//! ends in CRLF. Lengths count raw bytes, never characters.

use crate::error::ProtocolError;
use crate::value::RespValue;
use crate::{CRLF, MAX_BULK_LEN, MAX_NESTING_DEPTH};
use bytes::{Buf, BufMut, BytesMut};

const SIMPLE_STRING: u8 = b'+';
const ERROR: u8 = b'-';
const INTEGER: u8 = b':';
const BULK_STRING: u8 = b'$';
const ARRAY: u8 = b'*';

/// Upper bound on the capacity reserved up front for an array; the declared
/// count comes off the wire and is not trusted for allocation.
const MAX_PREALLOCATED_ELEMENTS: usize = 1024;

/// Encodes commands (and, for servers and tests, replies) into RESP bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a command name and its arguments as a RESP array of bulk strings.
    pub fn encode_command<A: AsRef<[u8]>>(name: &str, args: &[A]) -> BytesMut {
        let payload: usize = name.len() + args.iter().map(|a| a.as_ref().len()).sum::<usize>();
        let mut buf = BytesMut::with_capacity(payload + 16 * (args.len() + 2));
        Self::encode_command_into(&mut buf, name, args);
        buf
    }

    /// Appends an encoded command to `buf`.
    pub fn encode_command_into<A: AsRef<[u8]>>(buf: &mut BytesMut, name: &str, args: &[A]) {
        put_header(buf, ARRAY, (args.len() + 1) as i64);
        put_bulk(buf, name.as_bytes());
        for arg in args {
            put_bulk(buf, arg.as_ref());
        }
    }

    /// Encodes a reply value.
    pub fn encode_value(value: &RespValue) -> BytesMut {
        let mut buf = BytesMut::new();
        Self::encode_value_into(&mut buf, value);
        buf
    }

    /// Appends an encoded reply value to `buf`.
    pub fn encode_value_into(buf: &mut BytesMut, value: &RespValue) {
        match value {
            RespValue::Null => put_header(buf, BULK_STRING, -1),
            RespValue::Integer(n) => put_header(buf, INTEGER, *n),
            RespValue::SimpleString(s) => put_line(buf, SIMPLE_STRING, s.as_bytes()),
            RespValue::Error(msg) => put_line(buf, ERROR, msg.as_bytes()),
            RespValue::BulkString(s) => put_bulk(buf, s.as_bytes()),
            RespValue::Array(items) => {
                put_header(buf, ARRAY, items.len() as i64);
                for item in items {
                    Self::encode_value_into(buf, item);
                }
            }
        }
    }
}

fn put_header(buf: &mut BytesMut, tag: u8, n: i64) {
    put_line(buf, tag, n.to_string().as_bytes());
}

fn put_line(buf: &mut BytesMut, tag: u8, body: &[u8]) {
    buf.put_u8(tag);
    buf.put_slice(body);
    buf.put_slice(CRLF);
}

fn put_bulk(buf: &mut BytesMut, data: &[u8]) {
    put_header(buf, BULK_STRING, data.len() as i64);
    buf.put_slice(data);
    buf.put_slice(CRLF);
}

/// Decodes one reply from the start of `buf`.
///
/// Returns the value and the number of bytes it occupied. An empty buffer
/// fails with `EmptyResponse`; a buffer that ends mid-frame fails with
/// `Incomplete`. Arrays nested deeper than [`MAX_NESTING_DEPTH`] fail with
/// `MalformedEncoding`.
pub fn decode(buf: &[u8]) -> Result<(RespValue, usize), ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::EmptyResponse);
    }
    parse(buf, 0, 0)?.ok_or(ProtocolError::Incomplete)
}

/// Parses the frame starting at `pos`, enclosed by `depth` arrays.
/// `Ok(None)` means more bytes are needed.
fn parse(
    buf: &[u8],
    pos: usize,
    depth: usize,
) -> Result<Option<(RespValue, usize)>, ProtocolError> {
    let Some(&tag) = buf.get(pos) else {
        return Ok(None);
    };
    check_tag(tag)?;
    let Some((line, next)) = read_line(buf, pos + 1)? else {
        return Ok(None);
    };

    match tag {
        SIMPLE_STRING => Ok(Some((RespValue::SimpleString(utf8(line)?), next))),
        ERROR => Ok(Some((RespValue::Error(utf8(line)?), next))),
        INTEGER => Ok(Some((RespValue::Integer(parse_int(line)?), next))),
        BULK_STRING => parse_bulk(buf, line, next),
        ARRAY => parse_array(buf, line, next, depth),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn parse_bulk(
    buf: &[u8],
    header: &[u8],
    start: usize,
) -> Result<Option<(RespValue, usize)>, ProtocolError> {
    let Some(len) = bulk_len(header)? else {
        return Ok(Some((RespValue::Null, start)));
    };
    let Some(next) = bulk_end(buf, start, len)? else {
        return Ok(None);
    };
    let text = utf8(&buf[start..start + len])?;
    Ok(Some((RespValue::BulkString(text), next)))
}

fn parse_array(
    buf: &[u8],
    header: &[u8],
    start: usize,
    depth: usize,
) -> Result<Option<(RespValue, usize)>, ProtocolError> {
    let declared = parse_int(header)?;
    if declared < 0 {
        return Ok(Some((RespValue::Null, start)));
    }
    let count = declared as usize;
    if count > 0 {
        check_depth(depth)?;
    }

    let mut items = Vec::with_capacity(count.min(MAX_PREALLOCATED_ELEMENTS));
    let mut pos = start;
    for _ in 0..count {
        match parse(buf, pos, depth + 1)? {
            Some((item, next)) => {
                items.push(item);
                pos = next;
            }
            None => return Ok(None),
        }
    }
    Ok(Some((RespValue::Array(items), pos)))
}

fn check_tag(tag: u8) -> Result<(), ProtocolError> {
    match tag {
        SIMPLE_STRING | ERROR | INTEGER | BULK_STRING | ARRAY => Ok(()),
        other => Err(ProtocolError::UnknownType(other)),
    }
}

fn check_depth(depth: usize) -> Result<(), ProtocolError> {
    if depth >= MAX_NESTING_DEPTH {
        return Err(ProtocolError::malformed(format!(
            "arrays nested deeper than {}",
            MAX_NESTING_DEPTH
        )));
    }
    Ok(())
}

/// Parses a bulk header. `None` is the null bulk string.
fn bulk_len(header: &[u8]) -> Result<Option<usize>, ProtocolError> {
    let declared = parse_int(header)?;
    if declared < 0 {
        return Ok(None);
    }
    let len = declared as usize;
    if len > MAX_BULK_LEN {
        return Err(ProtocolError::malformed(format!(
            "bulk string of {} bytes exceeds limit of {}",
            len, MAX_BULK_LEN
        )));
    }
    Ok(Some(len))
}

/// Returns the position after a `len`-byte body starting at `start` and its
/// CRLF, or `None` if the body is not fully buffered.
fn bulk_end(buf: &[u8], start: usize, len: usize) -> Result<Option<usize>, ProtocolError> {
    let end = start + len;
    if buf.len() < end + CRLF.len() {
        return Ok(None);
    }
    if &buf[end..end + CRLF.len()] != CRLF {
        return Err(ProtocolError::malformed("bulk string not terminated by CRLF"));
    }
    Ok(Some(end + CRLF.len()))
}

/// Returns the bytes between `pos` and the next CRLF, and the position after it.
fn read_line(buf: &[u8], pos: usize) -> Result<Option<(&[u8], usize)>, ProtocolError> {
    let rest = buf.get(pos..).unwrap_or_default();
    let Some(cr) = rest.iter().position(|&b| b == b'\r') else {
        return Ok(None);
    };
    match rest.get(cr + 1) {
        None => Ok(None),
        Some(b'\n') => Ok(Some((&rest[..cr], pos + cr + 2))),
        Some(_) => Err(ProtocolError::malformed("CR not followed by LF")),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, ProtocolError> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| ProtocolError::malformed(format!("invalid UTF-8: {}", e)))
}

fn parse_int(bytes: &[u8]) -> Result<i64, ProtocolError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            ProtocolError::malformed(format!(
                "not an integer: {:?}",
                String::from_utf8_lossy(bytes)
            ))
        })
}

/// Resumable walk over the frame at the head of a buffer.
///
/// Checks only headers and bulk lengths, without building values, so bytes
/// already walked are not revisited when more data arrives.
#[derive(Debug, Default)]
struct FrameScan {
    /// Start of the first element not yet walked.
    pos: usize,
    /// Elements still expected by each open array, outermost first.
    open: Vec<usize>,
}

impl FrameScan {
    /// Walks forward; returns true once the whole frame is buffered.
    fn advance(&mut self, buf: &[u8]) -> Result<bool, ProtocolError> {
        loop {
            let Some(&tag) = buf.get(self.pos) else {
                return Ok(false);
            };
            check_tag(tag)?;
            let Some((line, mut next)) = read_line(buf, self.pos + 1)? else {
                return Ok(false);
            };

            match tag {
                BULK_STRING => {
                    if let Some(len) = bulk_len(line)? {
                        match bulk_end(buf, next, len)? {
                            Some(end) => next = end,
                            None => return Ok(false),
                        }
                    }
                }
                ARRAY => {
                    let count = parse_int(line)?;
                    if count > 0 {
                        check_depth(self.open.len())?;
                        self.open.push(count as usize);
                        self.pos = next;
                        continue;
                    }
                }
                _ => {}
            }
            self.pos = next;

            // One element is done; close every array it completes.
            while let Some(remaining) = self.open.last_mut() {
                if *remaining > 1 {
                    *remaining -= 1;
                    break;
                }
                self.open.pop();
            }
            if self.open.is_empty() {
                return Ok(true);
            }
        }
    }

    fn reset(&mut self) {
        self.pos = 0;
        self.open.clear();
    }
}

/// Buffers socket reads and yields replies once they are complete.
pub struct Decoder {
    buffer: BytesMut,
    scan: FrameScan,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            scan: FrameScan::default(),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next reply from the buffer.
    ///
    /// Returns `Ok(None)` while the buffered bytes do not hold a complete
    /// frame; a frame arriving over many reads is walked only once. On a
    /// decode error the buffer is discarded, since the stream position can no
    /// longer be trusted.
    pub fn decode_reply(&mut self) -> Result<Option<RespValue>, ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        match self.scan.advance(&self.buffer) {
            Ok(true) => {}
            Ok(false) => return Ok(None),
            Err(e) => {
                self.clear();
                return Err(e);
            }
        }

        let end = self.scan.pos;
        self.scan.reset();
        match decode(&self.buffer[..end]) {
            Ok((value, consumed)) => {
                self.buffer.advance(consumed);
                Ok(Some(value))
            }
            Err(e) if e.is_incomplete() => Ok(None),
            Err(e) => {
                self.clear();
                Err(e)
            }
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.scan.reset();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
