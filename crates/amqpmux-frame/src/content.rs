use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// Encoded content properties: the presence flags plus the property list.
///
/// The property list is kept encoded. Flag continuation words, when a class
/// uses them, stay at the front of `encoded`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    pub flags: u16,
    pub encoded: Bytes,
}

impl Properties {
    pub fn new(flags: u16, encoded: impl Into<Bytes>) -> Self {
        Self {
            flags,
            encoded: encoded.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flags == 0 && self.encoded.is_empty()
    }
}

/// Payload of a content-header frame.
///
/// Layout: class-id (2) + weight (2) + body-size (8) + property-flags (2)
/// + property list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub weight: u16,
    pub body_size: u64,
    pub properties: Properties,
}

/// Fixed part of a content header payload.
pub const CONTENT_HEADER_MIN: usize = 14;

impl ContentHeader {
    pub fn new(class_id: u16, body_size: u64, properties: Properties) -> Self {
        Self {
            class_id,
            weight: 0,
            body_size,
            properties,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(CONTENT_HEADER_MIN + self.properties.encoded.len());
        dst.put_u16(self.class_id);
        dst.put_u16(self.weight);
        dst.put_u64(self.body_size);
        dst.put_u16(self.properties.flags);
        dst.put_slice(&self.properties.encoded);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < CONTENT_HEADER_MIN {
            return Err(FrameError::malformed(
                "content header",
                format!(
                    "payload is {} bytes, need at least {CONTENT_HEADER_MIN}",
                    payload.len()
                ),
            ));
        }
        let class_id = payload.get_u16();
        let weight = payload.get_u16();
        let body_size = payload.get_u64();
        let flags = payload.get_u16();
        Ok(Self {
            class_id,
            weight,
            body_size,
            properties: Properties {
                flags,
                encoded: payload,
            },
        })
    }
}
