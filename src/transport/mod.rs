//! Binary RPC framing.
//!
//! Frame layout (all integers big-endian):
//!
//! ```text
//! "Bin" | type u8 | body_len u32 | packet_id i32 | flags u8 | payload
//! ```
//!
//! Requests carry `method string, u32 argc, values`; responses and faults
//! carry exactly one value. Strings are `u32 length + UTF-8`, values are
//! `u32 type tag + payload`.

pub mod protocol;
pub mod unix;

pub use protocol::{Frame, FrameKind, RawFrame, Request, Response, Value};

use std::collections::BTreeMap;

use crate::error::ProtocolError;

/// Frame marker.
pub const MAGIC: &[u8; 3] = b"Bin";

/// Marker, type byte and body length.
pub const HEADER_LEN: usize = 8;

/// Maximum body size (64 MB). Safety valve against malformed length headers.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum container nesting accepted by the decoder.
pub const MAX_NESTING: usize = 64;

/// Packet id and flags.
const BODY_PREFIX_LEN: usize = 5;

const FLAG_WANTS_RESPONSE: u8 = 0x01;

const TYPE_VOID: u32 = 0x00;
const TYPE_INTEGER: u32 = 0x01;
const TYPE_BOOLEAN: u32 = 0x02;
const TYPE_STRING: u32 = 0x03;
const TYPE_FLOAT: u32 = 0x04;
const TYPE_BINARY: u32 = 0xD0;
const TYPE_INTEGER64: u32 = 0xD1;
const TYPE_ARRAY: u32 = 0x100;
const TYPE_STRUCT: u32 = 0x101;

/// Encode a method call.
pub fn encode_request(packet_id: i32, method: &str, args: &[Value], wants_response: bool) -> Vec<u8> {
    let mut out = begin_frame(FrameKind::Request, packet_id, wants_response);
    put_string(&mut out, method);
    put_len(&mut out, args.len());
    for arg in args {
        put_value(&mut out, arg);
    }
    finish_frame(out)
}

/// Encode a response. Fault values are sent as fault frames.
pub fn encode_response(packet_id: i32, value: &Value) -> Vec<u8> {
    let kind = if value.is_fault() {
        FrameKind::Fault
    } else {
        FrameKind::Response
    };
    let mut out = begin_frame(kind, packet_id, false);
    put_value(&mut out, value);
    finish_frame(out)
}

/// Decode one complete frame.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    let (kind, body_len) = parse_header(bytes)?.ok_or(ProtocolError::Truncated {
        needed: HEADER_LEN.saturating_sub(bytes.len()),
    })?;
    let total = HEADER_LEN + body_len;
    if bytes.len() < total {
        return Err(ProtocolError::Truncated {
            needed: total - bytes.len(),
        });
    }
    if bytes.len() > total {
        return Err(ProtocolError::TrailingBytes(bytes.len() - total));
    }

    let mut reader = Reader::new(&bytes[HEADER_LEN..]);
    let packet_id = reader.i32()?;
    let flags = reader.u8()?;

    let frame = match kind {
        FrameKind::Request => {
            let method = reader.string()?;
            let argc = reader.len()?;
            let mut args = Vec::with_capacity(argc.min(1024));
            for _ in 0..argc {
                args.push(reader.value(0)?);
            }
            Frame::Request(Request {
                packet_id,
                wants_response: flags & FLAG_WANTS_RESPONSE != 0,
                method,
                args,
            })
        }
        FrameKind::Response => Frame::Response(Response {
            packet_id,
            value: reader.value(0)?,
        }),
        FrameKind::Fault => {
            let value = reader.value(0)?;
            if !value.is_fault() {
                return Err(ProtocolError::MalformedFault);
            }
            Frame::Response(Response { packet_id, value })
        }
    };

    reader.finish()?;
    Ok(frame)
}

/// Incremental frame reassembly for one connection.
///
/// Feed it reads of any size; complete frames come out of [`next_frame`]
/// with their header parsed and the payload left encoded.
///
/// [`next_frame`]: FrameDecoder::next_frame
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the socket.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Whether the buffer starts with a complete frame.
    ///
    /// Fails as soon as the header is known to be invalid.
    pub fn is_frame_complete(&self) -> Result<bool, ProtocolError> {
        Ok(match parse_header(&self.buf)? {
            Some((_, body_len)) => self.buf.len() >= HEADER_LEN + body_len,
            None => false,
        })
    }

    /// Take the next complete frame, if any.
    ///
    /// On error the offending bytes are discarded: a bad header drops the
    /// whole buffer (the stream cannot be resynchronized), a bad body drops
    /// that frame only.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        let (kind, body_len) = match parse_header(&self.buf) {
            Ok(Some(header)) => header,
            Ok(None) => return Ok(None),
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };
        let total = HEADER_LEN + body_len;
        if self.buf.len() < total {
            return Ok(None);
        }

        let rest = self.buf.split_off(total);
        let bytes = std::mem::replace(&mut self.buf, rest);
        peek_frame(kind, bytes).map(Some)
    }

    /// Discard any partially received frame.
    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// Parse the fixed header. `Ok(None)` means more bytes are needed.
fn parse_header(buf: &[u8]) -> Result<Option<(FrameKind, usize)>, ProtocolError> {
    let magic_len = buf.len().min(MAGIC.len());
    if buf[..magic_len] != MAGIC[..magic_len] {
        let mut found = [0u8; 3];
        found[..magic_len].copy_from_slice(&buf[..magic_len]);
        return Err(ProtocolError::BadMagic(found));
    }
    if buf.len() < 4 {
        return Ok(None);
    }
    let kind = FrameKind::from_byte(buf[3]).ok_or(ProtocolError::UnknownFrameType(buf[3]))?;
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    if body_len > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: body_len,
            max: MAX_FRAME_SIZE,
        });
    }
    if body_len < BODY_PREFIX_LEN {
        return Err(ProtocolError::Truncated {
            needed: BODY_PREFIX_LEN - body_len,
        });
    }
    Ok(Some((kind, body_len)))
}

/// Read packet id, flags and (for requests) the method name.
fn peek_frame(kind: FrameKind, bytes: Vec<u8>) -> Result<RawFrame, ProtocolError> {
    let mut reader = Reader::new(&bytes[HEADER_LEN..]);
    let packet_id = reader.i32()?;
    let flags = reader.u8()?;
    let method = if kind.is_request() {
        Some(reader.string()?)
    } else {
        None
    };
    Ok(RawFrame {
        kind,
        packet_id,
        wants_response: kind.is_request() && flags & FLAG_WANTS_RESPONSE != 0,
        method,
        bytes,
    })
}

fn begin_frame(kind: FrameKind, packet_id: i32, wants_response: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(MAGIC);
    out.push(kind.to_byte());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&packet_id.to_be_bytes());
    out.push(if wants_response { FLAG_WANTS_RESPONSE } else { 0 });
    out
}

fn finish_frame(mut out: Vec<u8>) -> Vec<u8> {
    let body_len = u32::try_from(out.len() - HEADER_LEN).unwrap_or(u32::MAX);
    out[4..HEADER_LEN].copy_from_slice(&body_len.to_be_bytes());
    out
}

fn put_len(out: &mut Vec<u8>, len: usize) {
    let len = u32::try_from(len).unwrap_or(u32::MAX);
    out.extend_from_slice(&len.to_be_bytes());
}

fn put_string(out: &mut Vec<u8>, s: &str) {
    put_len(out, s.len());
    out.extend_from_slice(s.as_bytes());
}

fn put_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Void => out.extend_from_slice(&TYPE_VOID.to_be_bytes()),
        Value::Integer(v) => {
            out.extend_from_slice(&TYPE_INTEGER.to_be_bytes());
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Integer64(v) => {
            out.extend_from_slice(&TYPE_INTEGER64.to_be_bytes());
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::Boolean(v) => {
            out.extend_from_slice(&TYPE_BOOLEAN.to_be_bytes());
            out.push(u8::from(*v));
        }
        Value::Float(v) => {
            out.extend_from_slice(&TYPE_FLOAT.to_be_bytes());
            out.extend_from_slice(&v.to_be_bytes());
        }
        Value::String(v) => {
            out.extend_from_slice(&TYPE_STRING.to_be_bytes());
            put_string(out, v);
        }
        Value::Binary(v) => {
            out.extend_from_slice(&TYPE_BINARY.to_be_bytes());
            put_len(out, v.len());
            out.extend_from_slice(v);
        }
        Value::Array(items) => {
            out.extend_from_slice(&TYPE_ARRAY.to_be_bytes());
            put_len(out, items.len());
            for item in items {
                put_value(out, item);
            }
        }
        Value::Struct(members) => {
            out.extend_from_slice(&TYPE_STRUCT.to_be_bytes());
            put_len(out, members.len());
            for (key, item) in members {
                put_string(out, key);
                put_value(out, item);
            }
        }
    }
}

/// Bounds-checked cursor over a frame body.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.buf.len() - self.pos;
        if n > remaining {
            return Err(ProtocolError::Truncated {
                needed: n - remaining,
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.array().map(u32::from_be_bytes)
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.array().map(i32::from_be_bytes)
    }

    fn len(&mut self) -> Result<usize, ProtocolError> {
        self.u32().map(|n| n as usize)
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }

    fn value(&mut self, depth: usize) -> Result<Value, ProtocolError> {
        if depth > MAX_NESTING {
            return Err(ProtocolError::NestingTooDeep(MAX_NESTING));
        }
        let value = match self.u32()? {
            TYPE_VOID => Value::Void,
            TYPE_INTEGER => Value::Integer(self.i32()?),
            TYPE_INTEGER64 => Value::Integer64(self.array().map(i64::from_be_bytes)?),
            TYPE_BOOLEAN => Value::Boolean(self.u8()? != 0),
            TYPE_FLOAT => Value::Float(self.array().map(f64::from_be_bytes)?),
            TYPE_STRING => Value::String(self.string()?),
            TYPE_BINARY => {
                let len = self.len()?;
                Value::Binary(self.take(len)?.to_vec())
            }
            TYPE_ARRAY => {
                let count = self.len()?;
                // Each element needs at least its 4-byte tag.
                let mut items = Vec::with_capacity(count.min(self.remaining() / 4));
                for _ in 0..count {
                    items.push(self.value(depth + 1)?);
                }
                Value::Array(items)
            }
            TYPE_STRUCT => {
                let count = self.len()?;
                let mut members = BTreeMap::new();
                for _ in 0..count {
                    let key = self.string()?;
                    members.insert(key, self.value(depth + 1)?);
                }
                Value::Struct(members)
            }
            other => return Err(ProtocolError::UnknownValueType(other)),
        };
        Ok(value)
    }

    const fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    const fn finish(&self) -> Result<(), ProtocolError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}
