//! Reassembly of content-bearing methods into deliveries.
//!
//! A `basic.deliver`, `basic.return` or `basic.get-ok` method frame is
//! followed on the same channel by one content header frame and as many
//! body frames as it takes to carry `body_size` bytes. The [`Dispatcher`]
//! tracks that sequence for one channel; it never touches the RPC slot, so
//! a consumer stream and a pending call on the same channel do not wait on
//! each other.

use amqpmux_frame::method::{BASIC_DELIVER, BASIC_GET_OK, BASIC_RETURN};
use amqpmux_frame::{ContentHeader, Method, MethodId};
use bytes::{Bytes, BytesMut};

use crate::control::{BasicDeliver, BasicGetOk, BasicReturn};
use crate::error::{ClientError, Result};

/// Upper bound on the buffer reserved up front for a body.
const MAX_PREALLOC: usize = 1024 * 1024;

/// A fully reassembled message.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Channel the message arrived on.
    pub channel: u16,
    /// The method that opened the content sequence.
    pub method: Method,
    /// Consumer tag (`basic.deliver` only).
    pub consumer_tag: Option<String>,
    /// Delivery tag used for ack/nack (`basic.deliver`, `basic.get-ok`).
    pub delivery_tag: Option<u64>,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    /// Content header with the raw property list.
    pub header: ContentHeader,
    pub body: Bytes,
}

impl Delivery {
    fn assemble(channel: u16, method: Method, header: ContentHeader, body: Bytes) -> Result<Self> {
        let mut delivery = Self {
            channel,
            method,
            consumer_tag: None,
            delivery_tag: None,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            header,
            body,
        };

        match delivery.method.id() {
            BASIC_DELIVER => {
                let args = BasicDeliver::decode(&delivery.method)?;
                delivery.consumer_tag = Some(args.consumer_tag);
                delivery.delivery_tag = Some(args.delivery_tag);
                delivery.redelivered = args.redelivered;
                delivery.exchange = args.exchange;
                delivery.routing_key = args.routing_key;
            }
            BASIC_GET_OK => {
                let args = BasicGetOk::decode(&delivery.method)?;
                delivery.delivery_tag = Some(args.delivery_tag);
                delivery.redelivered = args.redelivered;
                delivery.exchange = args.exchange;
                delivery.routing_key = args.routing_key;
            }
            BASIC_RETURN => {
                let args = BasicReturn::decode(&delivery.method)?;
                delivery.exchange = args.exchange;
                delivery.routing_key = args.routing_key;
            }
            _ => {}
        }

        Ok(delivery)
    }

    /// Id of the method that carried this content.
    pub fn kind(&self) -> MethodId {
        self.method.id()
    }

    /// True for a message the broker handed back as unroutable.
    pub fn is_returned(&self) -> bool {
        self.method.is(BASIC_RETURN)
    }

    /// Reply code and text of a returned message.
    pub fn return_reason(&self) -> Option<(u16, String)> {
        if !self.is_returned() {
            return None;
        }
        BasicReturn::decode(&self.method)
            .ok()
            .map(|args| (args.reply_code, args.reply_text))
    }
}

#[derive(Debug, Default)]
enum Assembly {
    #[default]
    Idle,
    AwaitingHeader(Method),
    AwaitingBody {
        method: Method,
        header: ContentHeader,
        expected: usize,
        buf: BytesMut,
    },
}

/// Per-channel content reassembly state machine.
#[derive(Debug)]
pub struct Dispatcher {
    channel: u16,
    state: Assembly,
}

impl Dispatcher {
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            state: Assembly::Idle,
        }
    }

    /// True when no content sequence is in progress.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, Assembly::Idle)
    }

    /// Fail if a content sequence is in progress.
    ///
    /// Any method frame arriving between a content-bearing method and the
    /// end of its body is a framing violation.
    pub fn check_idle(&self, arriving: MethodId) -> Result<()> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(self.violation(format!("method {arriving} interrupted content")))
        }
    }

    /// Start a content sequence with its opening method.
    pub fn begin(&mut self, method: Method) -> Result<()> {
        self.check_idle(method.id())?;
        self.state = Assembly::AwaitingHeader(method);
        Ok(())
    }

    /// Feed the content header. Completes the delivery when the body is empty.
    pub fn push_header(&mut self, header: ContentHeader) -> Result<Option<Delivery>> {
        let method = match std::mem::take(&mut self.state) {
            Assembly::AwaitingHeader(method) => method,
            other => {
                self.state = other;
                return Err(self.violation("content header without a content method".to_string()));
            }
        };

        if header.class_id != method.class_id {
            return Err(self.violation(format!(
                "content header class {} does not match method {}",
                header.class_id,
                method.id()
            )));
        }

        let expected = usize::try_from(header.body_size).map_err(|_| {
            self.violation(format!("body size {} exceeds address space", header.body_size))
        })?;

        if expected == 0 {
            return Delivery::assemble(self.channel, method, header, Bytes::new()).map(Some);
        }

        self.state = Assembly::AwaitingBody {
            method,
            header,
            expected,
            buf: BytesMut::with_capacity(expected.min(MAX_PREALLOC)),
        };
        Ok(None)
    }

    /// Feed one body frame. Completes the delivery once `body_size` bytes
    /// have arrived.
    pub fn push_body(&mut self, chunk: Bytes) -> Result<Option<Delivery>> {
        let Assembly::AwaitingBody {
            expected, buf, ..
        } = &mut self.state
        else {
            return Err(self.violation("body frame without a content header".to_string()));
        };

        let received = buf.len() + chunk.len();
        if received > *expected {
            let expected = *expected;
            self.state = Assembly::Idle;
            return Err(self.violation(format!(
                "body overflow: {received} bytes for declared size {expected}"
            )));
        }
        buf.extend_from_slice(&chunk);
        if received < *expected {
            return Ok(None);
        }

        match std::mem::take(&mut self.state) {
            Assembly::AwaitingBody {
                method,
                header,
                buf,
                ..
            } => Delivery::assemble(self.channel, method, header, buf.freeze()).map(Some),
            _ => Ok(None),
        }
    }

    /// Drop any partial content.
    pub fn reset(&mut self) {
        self.state = Assembly::Idle;
    }

    fn violation(&self, detail: String) -> ClientError {
        ClientError::UnexpectedFrame(format!("channel {}: {detail}", self.channel))
    }
}

#[cfg(test)]
mod tests {
    use amqpmux_frame::method::{BASIC_ACK, CLASS_BASIC};
    use amqpmux_frame::Properties;

    use super::*;

    fn deliver(tag: u64) -> Method {
        BasicDeliver {
            consumer_tag: "ctag".to_string(),
            delivery_tag: tag,
            redelivered: false,
            exchange: "events".to_string(),
            routing_key: "order.created".to_string(),
        }
        .to_method()
        .unwrap()
    }

    fn header(size: u64) -> ContentHeader {
        ContentHeader::new(CLASS_BASIC, size, Properties::default())
    }

    #[test]
    fn reassembles_split_body() {
        let mut d = Dispatcher::new(2);
        d.begin(deliver(7)).unwrap();
        assert!(d.push_header(header(10)).unwrap().is_none());
        assert!(d.push_body(Bytes::from_static(b"hello")).unwrap().is_none());
        let delivery = d.push_body(Bytes::from_static(b"world")).unwrap().unwrap();

        assert_eq!(delivery.body.as_ref(), b"helloworld");
        assert_eq!(delivery.channel, 2);
        assert_eq!(delivery.delivery_tag, Some(7));
        assert_eq!(delivery.consumer_tag.as_deref(), Some("ctag"));
        assert_eq!(delivery.routing_key, "order.created");
        assert!(d.is_idle());
    }

    #[test]
    fn empty_body_completes_on_header() {
        let mut d = Dispatcher::new(1);
        d.begin(deliver(1)).unwrap();
        let delivery = d.push_header(header(0)).unwrap().unwrap();
        assert!(delivery.body.is_empty());
        assert!(d.is_idle());
    }

    #[test]
    fn get_ok_carries_delivery_tag() {
        let get_ok = BasicGetOk {
            delivery_tag: 99,
            redelivered: true,
            exchange: String::new(),
            routing_key: "jobs".to_string(),
            message_count: 3,
        }
        .to_method()
        .unwrap();

        let mut d = Dispatcher::new(1);
        d.begin(get_ok).unwrap();
        d.push_header(header(1)).unwrap();
        let delivery = d.push_body(Bytes::from_static(b"x")).unwrap().unwrap();
        assert_eq!(delivery.delivery_tag, Some(99));
        assert!(delivery.redelivered);
        assert!(delivery.consumer_tag.is_none());
        assert_eq!(delivery.kind(), BASIC_GET_OK);
    }

    #[test]
    fn body_without_header_is_violation() {
        let mut d = Dispatcher::new(1);
        let err = d.push_body(Bytes::from_static(b"stray")).unwrap_err();
        assert!(matches!(err, ClientError::UnexpectedFrame(_)));

        d.begin(deliver(1)).unwrap();
        assert!(d.push_body(Bytes::from_static(b"early")).is_err());
    }

    #[test]
    fn header_without_method_is_violation() {
        let mut d = Dispatcher::new(1);
        assert!(matches!(
            d.push_header(header(4)).unwrap_err(),
            ClientError::UnexpectedFrame(_)
        ));
    }

    #[test]
    fn overflow_is_violation_and_resets() {
        let mut d = Dispatcher::new(1);
        d.begin(deliver(1)).unwrap();
        d.push_header(header(3)).unwrap();
        assert!(d.push_body(Bytes::from_static(b"four")).is_err());
        assert!(d.is_idle());
    }

    #[test]
    fn method_interrupting_content_is_violation() {
        let mut d = Dispatcher::new(1);
        d.begin(deliver(1)).unwrap();
        assert!(d.check_idle(BASIC_ACK).is_err());
        assert!(d.begin(deliver(2)).is_err());

        d.reset();
        d.check_idle(BASIC_ACK).unwrap();
    }

    #[test]
    fn returned_message_reason() {
        let mut w = amqpmux_frame::ArgWriter::new();
        w.u16(312);
        w.short_str("NO_ROUTE").unwrap();
        w.short_str("amq.direct").unwrap();
        w.short_str("nowhere").unwrap();
        let method = Method::new(BASIC_RETURN, w.finish());

        let mut d = Dispatcher::new(1);
        d.begin(method).unwrap();
        let delivery = d.push_header(header(0)).unwrap().unwrap();
        assert!(delivery.is_returned());
        assert_eq!(delivery.return_reason(), Some((312, "NO_ROUTE".to_string())));
        assert_eq!(delivery.routing_key, "nowhere");
    }
}
