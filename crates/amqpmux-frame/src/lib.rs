//! AMQP 0-9-1 frame codec with channel multiplexing.
//!
//! Every unit on the wire is a frame:
//! - A 1-byte frame type (method, header, body, heartbeat)
//! - A 2-byte big-endian channel ID for multiplexing
//! - A 4-byte big-endian payload length
//! - The payload, followed by the `0xCE` frame-end sentinel
//!
//! On top of the envelope this crate provides the method and content-header
//! payload layouts, the argument primitives the client needs to build and
//! inspect its own control methods, and a CRC-32 envelope for verifying
//! message bodies end to end.

pub mod channel;
pub mod checksum;
pub mod codec;
pub mod content;
pub mod error;
pub mod method;
pub mod reader;
pub mod wire;
pub mod writer;

pub use channel::{CONTROL, FIRST_CHANNEL, MAX_CHANNEL};
pub use checksum::{
    envelope_header, random_tagged, tag, verify, ChecksumError, CHECKSUM_HEADER_SIZE,
};
pub use codec::{
    body_frames, decode_frame, encode_frame, Frame, FrameConfig, FrameType, DEFAULT_FRAME_MAX,
    FRAME_END, FRAME_MIN_SIZE, FRAME_OVERHEAD, HEADER_SIZE, PROTOCOL_HEADER,
};
pub use content::{ContentHeader, Properties};
pub use error::{FrameError, Result};
pub use method::{Method, MethodId};
pub use reader::FrameReader;
pub use wire::{ArgReader, ArgWriter, FieldTable, FieldValue};
pub use writer::FrameWriter;
