//! WebSocket frame parsing and serialization
//!
//! This module implements RFC 6455 section 5 framing independent of any
//! connection state:
//! - Incremental parsing from a growing `BytesMut` (sans-IO)
//! - Blocking parsing from any `std::io::Read`, tolerant of short reads
//! - Encoding with per-frame masking for the client role
//!
//! No extensions are negotiated, so RSV1-3 are always written as 0 and any
//! set RSV bit on input is a protocol error.

use std::io::Read;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, Error, Result};
use crate::mask::{apply_mask, generate_mask};
use crate::protocol::Role;
use crate::{
    MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD,
};

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte.
    ///
    /// Reserved values 0x3-0x7 and 0xB-0xF are rejected.
    #[inline]
    pub fn from_u8(byte: u8) -> Result<Self> {
        match byte {
            0x0 => Ok(OpCode::Continuation),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            other => Err(Error::InvalidOpcode(other)),
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

impl TryFrom<u8> for OpCode {
    type Error = Error;

    fn try_from(byte: u8) -> Result<Self> {
        OpCode::from_u8(byte)
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (set on every client->server frame)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key, present iff `masked`
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        let mut size = 2;

        if self.payload_len > MEDIUM_MESSAGE_THRESHOLD as u64 {
            size += 8;
        } else if self.payload_len > SMALL_MESSAGE_THRESHOLD as u64 {
            size += 2;
        }

        if self.masked {
            size += 4;
        }

        size
    }

    /// Encode the frame header into a buffer
    #[inline]
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut b0 = self.opcode as u8;
        if self.fin {
            b0 |= 0x80;
        }
        buf.put_u8(b0);

        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };

        if self.payload_len <= SMALL_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | self.payload_len as u8);
        } else if self.payload_len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
            buf.put_u8(mask_bit | 126);
            buf.put_u16(self.payload_len as u16);
        } else {
            buf.put_u8(mask_bit | 127);
            buf.put_u64(self.payload_len);
        }

        if let Some(mask) = self.mask {
            buf.put_slice(&mask);
        }
    }
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a continuation frame
    #[inline]
    pub fn continuation(data: impl Into<Bytes>, fin: bool) -> Self {
        Self::new(OpCode::Continuation, data.into(), fin)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        Self::new(OpCode::Close, CloseReason::new(code, reason).encode(), true)
    }

    /// Opcode of this frame
    #[inline]
    pub fn opcode(&self) -> OpCode {
        self.header.opcode
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Get the payload as a string (for text frames)
    pub fn as_text(&self) -> Result<&str> {
        simdutf8::basic::from_utf8(&self.payload).map_err(|_| Error::InvalidUtf8)
    }

    /// Parse close frame payload
    pub fn parse_close(&self) -> Result<Option<CloseReason>> {
        CloseReason::parse(&self.payload)
    }

    /// Serialize this frame for the given sending role.
    ///
    /// Clients mask with a fresh key; servers never mask.
    pub fn encode(&self, role: Role) -> Result<Bytes> {
        let mask = match role {
            Role::Client => Some(generate_mask()),
            Role::Server => None,
        };
        let mut buf = BytesMut::with_capacity(MAX_FRAME_HEADER_SIZE + self.payload.len());
        encode_frame(
            &mut buf,
            self.header.opcode,
            &self.payload,
            self.header.fin,
            mask,
        )?;
        Ok(buf.freeze())
    }
}

/// Decode the fixed part of a header.
///
/// Returns `Ok(None)` until `buf` holds the whole header (base bytes,
/// extended length and mask key). Nothing is consumed.
pub fn parse_header(buf: &[u8], max_frame_size: usize) -> Result<Option<(FrameHeader, usize)>> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let b0 = buf[0];
    let b1 = buf[1];

    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(Error::Protocol("reserved bits set"));
    }
    let opcode = OpCode::from_u8(b0 & 0x0F)?;

    // Control frames must not be fragmented
    if opcode.is_control() && !fin {
        return Err(Error::Protocol("control frame must not be fragmented"));
    }

    let masked = b1 & 0x80 != 0;
    let len_byte = b1 & 0x7F;

    if opcode.is_control() && len_byte > MAX_CONTROL_PAYLOAD as u8 {
        return Err(Error::Protocol("control frame too large"));
    }

    let total = required_header_len(b1);
    if buf.len() < total {
        return Ok(None);
    }

    let (payload_len, len_end) = match len_byte {
        126 => {
            let len = u16::from_be_bytes([buf[2], buf[3]]) as u64;
            if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            (len, 4)
        }
        127 => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            let len = u64::from_be_bytes(raw);
            if len >> 63 != 0 {
                return Err(Error::Protocol("invalid length"));
            }
            if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                return Err(Error::Protocol("payload length not minimal"));
            }
            (len, 10)
        }
        n => (n as u64, 2),
    };

    // Checked before any payload byte is buffered
    if payload_len > max_frame_size as u64 {
        return Err(Error::MessageTooLarge {
            size: payload_len,
            max: max_frame_size,
        });
    }

    let mask = if masked {
        Some([
            buf[len_end],
            buf[len_end + 1],
            buf[len_end + 2],
            buf[len_end + 3],
        ])
    } else {
        None
    };

    Ok(Some((
        FrameHeader {
            fin,
            opcode,
            masked,
            payload_len,
            mask,
        },
        total,
    )))
}

/// Header length implied by the second header byte
#[inline]
fn required_header_len(b1: u8) -> usize {
    let ext = match b1 & 0x7F {
        126 => 2,
        127 => 8,
        _ => 0,
    };
    let mask = if b1 & 0x80 != 0 { 4 } else { 0 };
    2 + ext + mask
}

/// Incremental frame parser
///
/// Feed it the connection's read buffer; it consumes exactly one frame per
/// successful call and leaves any following bytes in place.
#[derive(Debug)]
pub struct FrameParser {
    /// Header of the frame whose payload is still arriving
    header: Option<FrameHeader>,
    /// Maximum frame size
    max_frame_size: usize,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            header: None,
            max_frame_size,
        }
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - Ok(Some(frame)) if a complete frame was parsed
    /// - Ok(None) if more data is needed
    /// - Err(e) if parsing failed
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>> {
        let header = match self.header.take() {
            Some(header) => header,
            None => match parse_header(buf, self.max_frame_size)? {
                Some((header, consumed)) => {
                    buf.advance(consumed);
                    header
                }
                None => return Ok(None),
            },
        };

        let payload_len = header.payload_len as usize;
        if buf.len() < payload_len {
            buf.reserve(payload_len - buf.len());
            self.header = Some(header);
            return Ok(None);
        }

        let mut payload = buf.split_to(payload_len);
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }

        Ok(Some(Frame {
            header,
            payload: payload.freeze(),
        }))
    }
}

/// Read exactly one frame from a blocking reader.
///
/// Short reads are retried until the frame is complete; EOF mid-frame is
/// reported as [`Error::ConnectionClosed`].
pub fn read_frame<R: Read>(reader: &mut R, max_frame_size: usize) -> Result<Frame> {
    let mut head = [0u8; MAX_FRAME_HEADER_SIZE];
    reader.read_exact(&mut head[..2])?;

    let total = required_header_len(head[1]);
    // Surface opcode/RSV/control errors before blocking on more bytes
    parse_header(&head[..2], max_frame_size)?;
    reader.read_exact(&mut head[2..total])?;

    let (header, _) = parse_header(&head[..total], max_frame_size)?
        .ok_or(Error::Protocol("incomplete frame header"))?;

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload)?;
    if let Some(mask) = header.mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Frame {
        header,
        payload: Bytes::from(payload),
    })
}

/// Encode a frame into a buffer
///
/// For masked frames (client role) the payload is copied and masked in the
/// output buffer; the caller's slice is untouched. Control frames larger than
/// 125 bytes are refused rather than truncated or split.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) -> Result<()> {
    let payload_len = payload.len() as u64;

    if opcode.is_control() && payload_len > MAX_CONTROL_PAYLOAD as u64 {
        return Err(Error::FrameTooLarge(payload_len));
    }
    if payload_len >> 63 != 0 {
        return Err(Error::FrameTooLarge(payload_len));
    }

    let header = FrameHeader {
        fin,
        opcode,
        masked: mask.is_some(),
        payload_len,
        mask,
    };
    buf.reserve(header.header_size() + payload.len());
    header.encode(buf);

    let start = buf.len();
    buf.put_slice(payload);
    if let Some(m) = mask {
        apply_mask(&mut buf[start..], m);
    }

    Ok(())
}
