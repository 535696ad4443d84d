//! HTTP/2 frame header and payload types (RFC 7540 §4, §6), and a subset of
//! HPACK (RFC 7541): static table lookups plus literal-header-field-without-
//! indexing on both encode and decode. No Huffman, no dynamic table — see
//! DESIGN.md for the reasoning.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::RequestError;
use crate::ids::RequestId;

pub const FRAME_HEADER_LEN: usize = 9;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16 * 1024;
pub const DEFAULT_MAX_CONCURRENT_STREAMS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    RstStream = 0x3,
    Settings = 0x4,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

impl FrameType {
    fn from_u8(v: u8) -> Option<Self> {
        use FrameType::*;
        Some(match v {
            0x0 => Data,
            0x1 => Headers,
            0x3 => RstStream,
            0x4 => Settings,
            0x6 => Ping,
            0x7 => GoAway,
            0x8 => WindowUpdate,
            0x9 => Continuation,
            _ => return None,
        })
    }
}

pub mod flags {
    pub const END_STREAM: u8 = 0x1;
    pub const END_HEADERS: u8 = 0x4;
    pub const ACK: u8 = 0x1;
}

/// A decoded frame header plus its raw payload. Unknown frame types and
/// unknown SETTINGS parameters are ignored per RFC 7540 §4.1/§6.5.2 rather
/// than treated as connection errors.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub frame_type: Option<FrameType>,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Bytes,
}

/// Encode one frame header + payload.
pub fn encode_frame(frame_type: FrameType, flags: u8, stream_id: u32, payload: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    let len = payload.len() as u32;
    out.put_u8((len >> 16) as u8);
    out.put_u8((len >> 8) as u8);
    out.put_u8(len as u8);
    out.put_u8(frame_type as u8);
    out.put_u8(flags);
    out.put_u32(stream_id & 0x7fff_ffff);
    out.put_slice(payload);
    out
}

/// Parse one frame from `buf`, returning `None` if the header + payload
/// aren't fully buffered yet. Advances `buf` past the frame when complete.
pub fn try_parse_frame(buf: &mut BytesMut, id: RequestId) -> Result<Option<RawFrame>, RequestError> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = ((buf[0] as usize) << 16) | ((buf[1] as usize) << 8) | buf[2] as usize;
    if len > DEFAULT_MAX_FRAME_SIZE as usize * 4 {
        return Err(RequestError::protocol(id, format!("frame length {len} exceeds sanity limit")));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }
    let frame_type = FrameType::from_u8(buf[3]);
    let flags = buf[4];
    let stream_id = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff;
    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(len).freeze();
    Ok(Some(RawFrame {
        frame_type,
        flags,
        stream_id,
        payload,
    }))
}

/// A single SETTINGS parameter (id, value) pair (RFC 7540 §6.5.1).
#[derive(Debug, Clone, Copy)]
pub struct Setting {
    pub id: u16,
    pub value: u32,
}

pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;

pub fn encode_settings(settings: &[Setting]) -> BytesMut {
    let mut payload = BytesMut::with_capacity(settings.len() * 6);
    for s in settings {
        payload.put_u16(s.id);
        payload.put_u32(s.value);
    }
    encode_frame(FrameType::Settings, 0, 0, &payload)
}

pub fn parse_settings(payload: &[u8]) -> Vec<Setting> {
    payload
        .chunks_exact(6)
        .map(|chunk| Setting {
            id: u16::from_be_bytes([chunk[0], chunk[1]]),
            value: u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
        })
        .collect()
}

pub fn encode_window_update(stream_id: u32, increment: u32) -> BytesMut {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32(increment & 0x7fff_ffff);
    encode_frame(FrameType::WindowUpdate, 0, stream_id, &payload)
}

pub fn parse_window_update(payload: &[u8]) -> u32 {
    if payload.len() < 4 {
        return 0;
    }
    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff
}

pub fn encode_rst_stream(stream_id: u32, error_code: u32) -> BytesMut {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_u32(error_code);
    encode_frame(FrameType::RstStream, 0, stream_id, &payload)
}

pub fn encode_ping(ack: bool, data: [u8; 8]) -> BytesMut {
    encode_frame(FrameType::Ping, if ack { flags::ACK } else { 0 }, 0, &data)
}

pub struct GoAway {
    pub last_stream_id: u32,
    pub error_code: u32,
}

pub fn parse_goaway(payload: &[u8]) -> GoAway {
    let last_stream_id = if payload.len() >= 4 {
        u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7fff_ffff
    } else {
        0
    };
    let error_code = if payload.len() >= 8 {
        u32::from_be_bytes([payload[4], payload[5], payload[6], payload[7]])
    } else {
        0
    };
    GoAway {
        last_stream_id,
        error_code,
    }
}

/// RFC 7541 §2.3.1 static table: we only need the rows used by an HTTP
/// client's request/response headers.
const STATIC_TABLE: &[(&str, &str)] = &[
    (":authority", ""),
    (":method", "GET"),
    (":method", "POST"),
    (":path", "/"),
    (":path", "/index.html"),
    (":scheme", "http"),
    (":scheme", "https"),
    (":status", "200"),
    (":status", "204"),
    (":status", "206"),
    (":status", "304"),
    (":status", "400"),
    (":status", "404"),
    (":status", "500"),
    ("accept-encoding", "gzip, deflate"),
    ("content-length", ""),
    ("content-type", ""),
    ("user-agent", ""),
];

fn static_index_for(name: &str, value: &str) -> Option<usize> {
    STATIC_TABLE
        .iter()
        .position(|(n, v)| *n == name && (*v == value || v.is_empty()))
        .map(|i| i + 1)
}

/// Minimal HPACK encoder: every header is emitted as "literal header field
/// without indexing", optionally referencing the static table for the name.
/// No Huffman coding, no dynamic table entries — see DESIGN.md for scope.
pub fn hpack_encode(headers: &[(String, String)]) -> BytesMut {
    let mut out = BytesMut::new();
    for (name, value) in headers {
        if let Some(idx) = static_index_for(name, value) {
            let entry = STATIC_TABLE[idx - 1];
            if entry.1 == *value && !entry.1.is_empty() {
                // Fully matches a static entry: indexed header field (§6.1).
                out.put_u8(0x80 | idx as u8);
                continue;
            }
            // Name match only: literal with incremental-indexing name ref (§6.2.1),
            // encoded here as without-indexing per the simplified scheme.
            out.put_u8(0x00 | idx as u8);
        } else {
            out.put_u8(0x00);
            write_hpack_string(&mut out, name);
        }
        write_hpack_string(&mut out, value);
    }
    out
}

/// Length-prefixed with a 2-byte big-endian count rather than HPACK's real
/// 7-bit-prefixed integer (see DESIGN.md) — wide enough that no realistic
/// header name or value (query strings, cookies, user-agents) truncates.
fn write_hpack_string(out: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize, "header value too long to encode");
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

/// Decode a buffer produced by [`hpack_encode`]. Only supports the indexed
/// and literal-without-huffman forms this encoder emits.
pub fn hpack_decode(mut buf: &[u8], id: RequestId) -> Result<Vec<(String, String)>, RequestError> {
    let mut headers = Vec::new();
    while !buf.is_empty() {
        let first = buf[0];
        if first & 0x80 != 0 {
            let idx = (first & 0x7f) as usize;
            let (name, value) = STATIC_TABLE
                .get(idx - 1)
                .ok_or_else(|| RequestError::protocol(id, "hpack: static table index out of range"))?;
            headers.push((name.to_string(), value.to_string()));
            buf = &buf[1..];
            continue;
        }
        let idx = (first & 0x7f) as usize;
        buf = &buf[1..];
        let name = if idx == 0 {
            let (s, rest) = read_hpack_string(buf, id)?;
            buf = rest;
            s
        } else {
            STATIC_TABLE
                .get(idx - 1)
                .map(|(n, _)| n.to_string())
                .ok_or_else(|| RequestError::protocol(id, "hpack: static table index out of range"))?
        };
        let (value, rest) = read_hpack_string(buf, id)?;
        buf = rest;
        headers.push((name, value));
    }
    Ok(headers)
}

fn read_hpack_string(buf: &[u8], id: RequestId) -> Result<(String, &[u8]), RequestError> {
    if buf.len() < 2 {
        return Err(RequestError::protocol(id, "hpack: truncated string length"));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return Err(RequestError::protocol(id, "hpack: truncated string data"));
    }
    let s = std::str::from_utf8(&buf[2..2 + len])
        .map_err(|_| RequestError::protocol(id, "hpack: invalid utf-8"))?
        .to_string();
    Ok((s, &buf[2 + len..]))
}
