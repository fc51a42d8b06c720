use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::content::ContentHeader;
use crate::error::{FrameError, Result};
use crate::method::Method;

/// Frame header: type (1) + channel (2) + length (4) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Sentinel octet terminating every frame.
pub const FRAME_END: u8 = 0xCE;

/// Bytes a frame adds around its payload (header + frame-end).
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + 1;

/// Smallest frame-max a peer may negotiate; also the limit before tuning.
pub const FRAME_MIN_SIZE: usize = 4096;

/// Frame-max the client asks for when the caller does not override it.
pub const DEFAULT_FRAME_MAX: u32 = 128 * 1024;

/// Protocol header sent by the client before the first frame: "AMQP" 0 0 9 1.
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// The four frame types of AMQP 0-9-1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Method = 1,
    Header = 2,
    Body = 3,
    Heartbeat = 8,
}

impl FrameType {
    /// Wire octet for this frame type.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Method),
            2 => Ok(Self::Header),
            3 => Ok(Self::Body),
            8 => Ok(Self::Heartbeat),
            other => Err(FrameError::UnknownFrameType(other)),
        }
    }
}

/// A frame with channel routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the payload carries.
    pub kind: FrameType,
    /// The channel this frame belongs to.
    pub channel: u16,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameType, channel: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            channel,
            payload: payload.into(),
        }
    }

    /// A method frame carrying `method` on `channel`.
    pub fn method(channel: u16, method: &Method) -> Self {
        Self::new(FrameType::Method, channel, method.to_bytes())
    }

    /// A content-header frame.
    pub fn header(channel: u16, header: &ContentHeader) -> Self {
        Self::new(FrameType::Header, channel, header.to_bytes())
    }

    /// A content-body frame.
    pub fn body(channel: u16, chunk: impl Into<Bytes>) -> Self {
        Self::new(FrameType::Body, channel, chunk)
    }

    /// A heartbeat frame. Heartbeats always travel on the control channel.
    pub fn heartbeat() -> Self {
        Self::new(FrameType::Heartbeat, crate::channel::CONTROL, Bytes::new())
    }

    /// The total wire size of this frame (header + payload + frame-end).
    pub fn wire_size(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌────────┬────────────┬────────────┬─────────────────┬──────────┐
/// │ Type   │ Channel    │ Length     │ Payload         │ Frame-end│
/// │ (1B)   │ (2B BE)    │ (4B BE)    │ (Length bytes)  │ 0xCE     │
/// └────────┴────────────┴────────────┴─────────────────┴──────────┘
/// ```
pub fn encode_frame(kind: FrameType, channel: u16, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(FRAME_OVERHEAD + payload.len());
    dst.put_u8(kind.as_u8());
    dst.put_u16(channel);
    dst.put_u32(payload.len() as u32);
    dst.put_slice(payload);
    dst.put_u8(FRAME_END);
    Ok(())
}

/// Decode a frame from a buffer.
///
/// Returns `Ok(None)` if the buffer doesn't contain a complete frame yet.
/// On success, consumes the frame bytes from the buffer.
pub fn decode_frame(src: &mut BytesMut, max_payload: usize) -> Result<Option<Frame>> {
    if src.len() < HEADER_SIZE {
        return Ok(None); // Need more data
    }

    let kind = FrameType::try_from(src[0])?;
    let channel = u16::from_be_bytes([src[1], src[2]]);
    let payload_len = u32::from_be_bytes([src[3], src[4], src[5], src[6]]) as usize;

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        });
    }

    let total = payload_len
        .checked_add(FRAME_OVERHEAD)
        .ok_or(FrameError::PayloadTooLarge {
            size: payload_len,
            max: max_payload,
        })?;
    if src.len() < total {
        return Ok(None); // Need more data
    }

    let found = src[total - 1];
    if found != FRAME_END {
        return Err(FrameError::MissingFrameEnd { found });
    }

    src.advance(HEADER_SIZE);
    let payload = src.split_to(payload_len).freeze();
    src.advance(1);

    Ok(Some(Frame {
        kind,
        channel,
        payload,
    }))
}

/// Split a content body into body frames of at most `max_payload` bytes.
///
/// An empty body produces no frames; the content header alone completes it.
pub fn body_frames(channel: u16, body: &Bytes, max_payload: usize) -> Vec<Frame> {
    let chunk = max_payload.max(1);
    let mut frames = Vec::with_capacity(body.len().div_ceil(chunk));
    let mut offset = 0;
    while offset < body.len() {
        let end = (offset + chunk).min(body.len());
        frames.push(Frame::body(channel, body.slice(offset..end)));
        offset = end;
    }
    frames
}

/// Configuration for the frame codec.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum payload size in bytes. Default: the pre-tune limit.
    pub max_payload_size: usize,
    /// Read timeout for blocking operations.
    pub read_timeout: Option<std::time::Duration>,
    /// Write timeout for blocking operations.
    pub write_timeout: Option<std::time::Duration>,
}

impl FrameConfig {
    /// Largest payload that fits in a frame of `frame_max` bytes.
    ///
    /// A `frame_max` of zero means the peers agreed on no limit.
    pub fn max_payload_for(frame_max: u32) -> usize {
        if frame_max == 0 {
            u32::MAX as usize
        } else {
            (frame_max as usize).saturating_sub(FRAME_OVERHEAD)
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: FRAME_MIN_SIZE - FRAME_OVERHEAD,
            read_timeout: None,
            write_timeout: None,
        }
    }
}
