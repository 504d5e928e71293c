//! Length-prefixed frame codec for the mesh wire protocol.
//!
//! A frame is a `/` sentinel, one type byte, five ASCII digits of header
//! length, the header bytes, and (for every type except `Ping`) ten ASCII
//! digits of body length followed by the body bytes. The codec implements
//! Tokio's [`Decoder`] and [`Encoder`] traits for use with
//! [`tokio_util::codec::FramedRead`] and [`FramedWrite`] over split TCP
//! halves.
//!
//! The decoder tolerates any run of `/` sentinels before the type byte and
//! resynchronises on them. Anything else outside the recognised type set is
//! a framing error; the session is torn down rather than patched up.
//!
//! [`FramedWrite`]: tokio_util::codec::FramedWrite

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::message::MsgType;

/// Maximum encoded frame length in bytes, sentinel included.
pub const MAX_FRAME_LEN: usize = 66_629;
/// Maximum header length expressible in the five-digit length field.
pub const MAX_HEADER_LEN: usize = 65_535;
/// Width of the ASCII header-length field.
pub const HEADER_DIGITS: usize = 5;
/// Width of the ASCII body-length field.
pub const BODY_DIGITS: usize = 10;
/// Sentinel plus type byte.
const PREAMBLE_LEN: usize = 2;

/// A decoded wire frame: a type tag and raw header/body byte payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type tag.
    pub msg_type: MsgType,
    /// Header bytes (a JSON object).
    pub header: Vec<u8>,
    /// Body bytes; empty for the headers-only `Ping` type.
    pub body: Vec<u8>,
}

impl Frame {
    /// Assemble a frame from its parts.
    #[must_use]
    pub const fn new(msg_type: MsgType, header: Vec<u8>, body: Vec<u8>) -> Self {
        Self {
            msg_type,
            header,
            body,
        }
    }

    /// Encoded length of this frame on the wire.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let mut len = PREAMBLE_LEN + HEADER_DIGITS + self.header.len();
        if !self.msg_type.is_headers_only() {
            len += BODY_DIGITS + self.body.len();
        }
        len
    }
}

/// Streaming codec for mesh frames.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// Parse a fixed-width zero-padded ASCII decimal length field.
fn parse_len(digits: &[u8]) -> Result<usize, io::Error> {
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(invalid("non-numeric length field"));
    }
    // All-digit input of at most ten characters always parses.
    std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or_else(|| invalid("unparsable length field"))
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        // Consume any run of resynchronisation sentinels before the tag.
        let sentinels = src.iter().take_while(|b| **b == b'/').count();
        if sentinels > 0 {
            src.advance(sentinels);
        }
        let Some(&tag) = src.first() else {
            return Ok(None);
        };
        let Some(msg_type) = MsgType::from_byte(tag) else {
            return Err(invalid(format!("unknown message type byte 0x{tag:02x}")));
        };

        if src.len() < 1 + HEADER_DIGITS {
            return Ok(None);
        }
        let header_len = parse_len(&src[1..1 + HEADER_DIGITS])?;
        if header_len > MAX_HEADER_LEN {
            return Err(invalid("too large size: header exceeds cap"));
        }

        let header_end = 1 + HEADER_DIGITS + header_len;
        let mut body_len = 0usize;
        let mut frame_end = header_end;
        if !msg_type.is_headers_only() {
            if src.len() < header_end + BODY_DIGITS {
                return Ok(None);
            }
            body_len = parse_len(&src[header_end..header_end + BODY_DIGITS])?;
            if PREAMBLE_LEN + HEADER_DIGITS + header_len + BODY_DIGITS + body_len > MAX_FRAME_LEN {
                return Err(invalid("too large size: frame exceeds cap"));
            }
            frame_end = header_end + BODY_DIGITS + body_len;
        }

        if src.len() < frame_end {
            src.reserve(frame_end - src.len());
            return Ok(None);
        }

        src.advance(1 + HEADER_DIGITS);
        let header = src.split_to(header_len).to_vec();
        let body = if msg_type.is_headers_only() {
            Vec::new()
        } else {
            src.advance(BODY_DIGITS);
            src.split_to(body_len).to_vec()
        };
        Ok(Some(Frame::new(msg_type, header, body)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, io::Error> {
        if let Some(frame) = self.decode(src)? {
            return Ok(Some(frame));
        }
        if !src.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "incomplete frame at end of stream",
            ));
        }
        Ok(None)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), io::Error> {
        if frame.header.len() > MAX_HEADER_LEN {
            return Err(invalid("too large size: header exceeds cap"));
        }
        if frame.encoded_len() > MAX_FRAME_LEN {
            return Err(invalid("too large size: frame exceeds cap"));
        }
        dst.reserve(frame.encoded_len());
        dst.put_u8(b'/');
        dst.put_u8(frame.msg_type.as_byte());
        dst.extend_from_slice(format!("{:05}", frame.header.len()).as_bytes());
        dst.extend_from_slice(&frame.header);
        if !frame.msg_type.is_headers_only() {
            dst.extend_from_slice(format!("{:010}", frame.body.len()).as_bytes());
            dst.extend_from_slice(&frame.body);
        }
        Ok(())
    }
}
