use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};

/// `(class-id, method-id)` pair identifying a protocol method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId {
    pub class_id: u16,
    pub method_id: u16,
}

impl MethodId {
    pub const fn new(class_id: u16, method_id: u16) -> Self {
        Self {
            class_id,
            method_id,
        }
    }

    /// Dotted protocol name for the methods the client knows about.
    pub fn name(self) -> Option<&'static str> {
        let name = match self {
            CONNECTION_START => "connection.start",
            CONNECTION_START_OK => "connection.start-ok",
            CONNECTION_SECURE => "connection.secure",
            CONNECTION_SECURE_OK => "connection.secure-ok",
            CONNECTION_TUNE => "connection.tune",
            CONNECTION_TUNE_OK => "connection.tune-ok",
            CONNECTION_OPEN => "connection.open",
            CONNECTION_OPEN_OK => "connection.open-ok",
            CONNECTION_CLOSE => "connection.close",
            CONNECTION_CLOSE_OK => "connection.close-ok",
            CONNECTION_BLOCKED => "connection.blocked",
            CONNECTION_UNBLOCKED => "connection.unblocked",
            CHANNEL_OPEN => "channel.open",
            CHANNEL_OPEN_OK => "channel.open-ok",
            CHANNEL_FLOW => "channel.flow",
            CHANNEL_FLOW_OK => "channel.flow-ok",
            CHANNEL_CLOSE => "channel.close",
            CHANNEL_CLOSE_OK => "channel.close-ok",
            EXCHANGE_UNBIND => "exchange.unbind",
            EXCHANGE_UNBIND_OK => "exchange.unbind-ok",
            BASIC_PUBLISH => "basic.publish",
            BASIC_RETURN => "basic.return",
            BASIC_DELIVER => "basic.deliver",
            BASIC_GET => "basic.get",
            BASIC_GET_OK => "basic.get-ok",
            BASIC_GET_EMPTY => "basic.get-empty",
            BASIC_ACK => "basic.ack",
            BASIC_NACK => "basic.nack",
            BASIC_CANCEL => "basic.cancel",
            BASIC_CANCEL_OK => "basic.cancel-ok",
            _ => return None,
        };
        Some(name)
    }

    /// Whether `self` answers the synchronous request `request`.
    ///
    /// A reply shares its request's class and carries the next method id,
    /// except for `basic.get` (two possible replies) and `exchange.unbind`.
    pub fn is_reply_to(self, request: MethodId) -> bool {
        if self.class_id != request.class_id {
            return false;
        }
        match request {
            BASIC_GET => matches!(self, BASIC_GET_OK | BASIC_GET_EMPTY),
            EXCHANGE_UNBIND => self == EXCHANGE_UNBIND_OK,
            _ => request.method_id.checked_add(1) == Some(self.method_id),
        }
    }

    /// Methods that are followed by a content header and body frames.
    pub fn is_content_bearing(self) -> bool {
        matches!(self, BASIC_PUBLISH | BASIC_RETURN | BASIC_DELIVER | BASIC_GET_OK)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "{}.{}", self.class_id, self.method_id),
        }
    }
}

pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_BASIC: u16 = 60;

pub const CONNECTION_START: MethodId = MethodId::new(CLASS_CONNECTION, 10);
pub const CONNECTION_START_OK: MethodId = MethodId::new(CLASS_CONNECTION, 11);
pub const CONNECTION_SECURE: MethodId = MethodId::new(CLASS_CONNECTION, 20);
pub const CONNECTION_SECURE_OK: MethodId = MethodId::new(CLASS_CONNECTION, 21);
pub const CONNECTION_TUNE: MethodId = MethodId::new(CLASS_CONNECTION, 30);
pub const CONNECTION_TUNE_OK: MethodId = MethodId::new(CLASS_CONNECTION, 31);
pub const CONNECTION_OPEN: MethodId = MethodId::new(CLASS_CONNECTION, 40);
pub const CONNECTION_OPEN_OK: MethodId = MethodId::new(CLASS_CONNECTION, 41);
pub const CONNECTION_CLOSE: MethodId = MethodId::new(CLASS_CONNECTION, 50);
pub const CONNECTION_CLOSE_OK: MethodId = MethodId::new(CLASS_CONNECTION, 51);
pub const CONNECTION_BLOCKED: MethodId = MethodId::new(CLASS_CONNECTION, 60);
pub const CONNECTION_UNBLOCKED: MethodId = MethodId::new(CLASS_CONNECTION, 61);

pub const CHANNEL_OPEN: MethodId = MethodId::new(CLASS_CHANNEL, 10);
pub const CHANNEL_OPEN_OK: MethodId = MethodId::new(CLASS_CHANNEL, 11);
pub const CHANNEL_FLOW: MethodId = MethodId::new(CLASS_CHANNEL, 20);
pub const CHANNEL_FLOW_OK: MethodId = MethodId::new(CLASS_CHANNEL, 21);
pub const CHANNEL_CLOSE: MethodId = MethodId::new(CLASS_CHANNEL, 40);
pub const CHANNEL_CLOSE_OK: MethodId = MethodId::new(CLASS_CHANNEL, 41);

pub const EXCHANGE_UNBIND: MethodId = MethodId::new(CLASS_EXCHANGE, 40);
pub const EXCHANGE_UNBIND_OK: MethodId = MethodId::new(CLASS_EXCHANGE, 51);

pub const BASIC_CANCEL: MethodId = MethodId::new(CLASS_BASIC, 30);
pub const BASIC_CANCEL_OK: MethodId = MethodId::new(CLASS_BASIC, 31);
pub const BASIC_PUBLISH: MethodId = MethodId::new(CLASS_BASIC, 40);
pub const BASIC_RETURN: MethodId = MethodId::new(CLASS_BASIC, 50);
pub const BASIC_DELIVER: MethodId = MethodId::new(CLASS_BASIC, 60);
pub const BASIC_GET: MethodId = MethodId::new(CLASS_BASIC, 70);
pub const BASIC_GET_OK: MethodId = MethodId::new(CLASS_BASIC, 71);
pub const BASIC_GET_EMPTY: MethodId = MethodId::new(CLASS_BASIC, 72);
pub const BASIC_ACK: MethodId = MethodId::new(CLASS_BASIC, 80);
pub const BASIC_NACK: MethodId = MethodId::new(CLASS_BASIC, 120);

/// A protocol method: the payload of a method frame.
///
/// Arguments stay encoded; the catalog of argument schemas belongs to the
/// application layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Method {
    pub class_id: u16,
    pub method_id: u16,
    pub arguments: Bytes,
}

impl Method {
    pub fn new(id: MethodId, arguments: impl Into<Bytes>) -> Self {
        Self {
            class_id: id.class_id,
            method_id: id.method_id,
            arguments: arguments.into(),
        }
    }

    pub fn id(&self) -> MethodId {
        MethodId::new(self.class_id, self.method_id)
    }

    pub fn is(&self, id: MethodId) -> bool {
        self.id() == id
    }

    /// Encode as a method frame payload.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(4 + self.arguments.len());
        dst.put_u16(self.class_id);
        dst.put_u16(self.method_id);
        dst.put_slice(&self.arguments);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.arguments.len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decode a method frame payload.
    pub fn decode(mut payload: Bytes) -> Result<Self> {
        if payload.len() < 4 {
            return Err(FrameError::malformed(
                "method frame",
                format!("payload is {} bytes, need at least 4", payload.len()),
            ));
        }
        let class_id = payload.get_u16();
        let method_id = payload.get_u16();
        Ok(Self {
            class_id,
            method_id,
            arguments: payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_payload_roundtrip() {
        let method = Method::new(MethodId::new(50, 10), Bytes::from_static(b"\x00\x00\x05hello"));
        let decoded = Method::decode(method.to_bytes()).unwrap();
        assert_eq!(decoded, method);
        assert_eq!(decoded.id(), MethodId::new(50, 10));
    }

    #[test]
    fn short_method_payload_is_malformed() {
        let err = Method::decode(Bytes::from_static(&[0, 10, 0])).unwrap_err();
        assert!(matches!(err, FrameError::Malformed { .. }));
    }

    #[test]
    fn names_and_display() {
        assert_eq!(CHANNEL_CLOSE_OK.to_string(), "channel.close-ok");
        assert_eq!(MethodId::new(50, 10).to_string(), "50.10");
    }

    #[test]
    fn replies_pair_with_their_requests() {
        let declare = MethodId::new(50, 10);
        assert!(MethodId::new(50, 11).is_reply_to(declare));
        assert!(!MethodId::new(50, 21).is_reply_to(declare));
        assert!(!MethodId::new(60, 11).is_reply_to(declare));

        assert!(CHANNEL_OPEN_OK.is_reply_to(CHANNEL_OPEN));
        assert!(CHANNEL_FLOW_OK.is_reply_to(CHANNEL_FLOW));
        assert!(BASIC_GET_OK.is_reply_to(BASIC_GET));
        assert!(BASIC_GET_EMPTY.is_reply_to(BASIC_GET));
        assert!(EXCHANGE_UNBIND_OK.is_reply_to(EXCHANGE_UNBIND));
        assert!(!MethodId::new(40, 41).is_reply_to(EXCHANGE_UNBIND));
        assert!(!MethodId::new(50, 0).is_reply_to(MethodId::new(50, u16::MAX)));
    }

    #[test]
    fn content_bearing_methods() {
        assert!(BASIC_DELIVER.is_content_bearing());
        assert!(BASIC_GET_OK.is_content_bearing());
        assert!(BASIC_RETURN.is_content_bearing());
        assert!(BASIC_PUBLISH.is_content_bearing());
        assert!(!BASIC_GET_EMPTY.is_content_bearing());
        assert!(!CHANNEL_OPEN_OK.is_content_bearing());
    }
}
