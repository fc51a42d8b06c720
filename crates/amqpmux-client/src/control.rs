//! Arguments of the methods the client builds or inspects itself.
//!
//! Only the connection/channel lifecycle methods and the server-pushed
//! basic methods are modelled here. Declare/bind/consume and the rest of the
//! catalog travel as opaque [`Method`] arguments built by the application.

use amqpmux_frame::method::{
    BASIC_ACK, BASIC_CANCEL, BASIC_DELIVER, BASIC_GET_OK, BASIC_NACK, BASIC_RETURN, CHANNEL_FLOW,
    CHANNEL_OPEN, CHANNEL_OPEN_OK, CONNECTION_OPEN, CONNECTION_OPEN_OK, CONNECTION_START,
    CONNECTION_START_OK,
};
use amqpmux_frame::{ArgReader, ArgWriter, FieldTable, Method, MethodId};
use bytes::Bytes;

use crate::error::{ClientError, Result};

/// Reply code for a normal, error-free close.
pub const REPLY_SUCCESS: u16 = 200;

fn reader(method: &Method, context: &'static str) -> ArgReader {
    ArgReader::new(method.arguments.clone(), context)
}

/// `connection.start`: the server's opening offer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStart {
    pub version_major: u8,
    pub version_minor: u8,
    pub server_properties: FieldTable,
    pub mechanisms: String,
    pub locales: String,
}

impl ConnectionStart {
    pub fn decode(method: &Method) -> Result<Self> {
        let mut r = reader(method, "connection.start");
        Ok(Self {
            version_major: r.u8()?,
            version_minor: r.u8()?,
            server_properties: r.table()?,
            mechanisms: String::from_utf8_lossy(&r.long_str()?).into_owned(),
            locales: String::from_utf8_lossy(&r.long_str()?).into_owned(),
        })
    }

    pub fn to_method(&self) -> Result<Method> {
        let mut w = ArgWriter::new();
        w.u8(self.version_major).u8(self.version_minor);
        w.table(&self.server_properties)?;
        w.long_str(self.mechanisms.as_bytes())?;
        w.long_str(self.locales.as_bytes())?;
        Ok(Method::new(CONNECTION_START, w.finish()))
    }

    /// True if the space-separated mechanism list offers `mechanism`.
    pub fn offers_mechanism(&self, mechanism: &str) -> bool {
        self.mechanisms.split_whitespace().any(|m| m == mechanism)
    }
}

/// `connection.start-ok`: client properties and credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionStartOk {
    pub client_properties: FieldTable,
    pub mechanism: String,
    pub response: Bytes,
    pub locale: String,
}

impl ConnectionStartOk {
    pub fn decode(method: &Method) -> Result<Self> {
        let mut r = reader(method, "connection.start-ok");
        Ok(Self {
            client_properties: r.table()?,
            mechanism: r.short_str()?,
            response: r.long_str()?,
            locale: r.short_str()?,
        })
    }

    pub fn to_method(&self) -> Result<Method> {
        let mut w = ArgWriter::new();
        w.table(&self.client_properties)?;
        w.short_str(&self.mechanism)?;
        w.long_str(&self.response)?;
        w.short_str(&self.locale)?;
        Ok(Method::new(CONNECTION_START_OK, w.finish()))
    }
}

/// `connection.tune` / `connection.tune-ok` share one layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tune {
    pub channel_max: u16,
    pub frame_max: u32,
    /// Heartbeat interval in seconds; zero disables heartbeats.
    pub heartbeat: u16,
}

impl Tune {
    pub fn decode(method: &Method) -> Result<Self> {
        let mut r = reader(method, "connection.tune");
        Ok(Self {
            channel_max: r.u16()?,
            frame_max: r.u32()?,
            heartbeat: r.u16()?,
        })
    }

    pub fn to_method(&self, id: MethodId) -> Method {
        let mut w = ArgWriter::new();
        w.u16(self.channel_max).u32(self.frame_max).u16(self.heartbeat);
        Method::new(id, w.finish())
    }
}

/// `connection.open` for a virtual host.
pub fn connection_open(vhost: &str) -> Result<Method> {
    let mut w = ArgWriter::new();
    w.short_str(vhost)?.short_str("")?;
    w.bits(&[false]);
    Ok(Method::new(CONNECTION_OPEN, w.finish()))
}

/// Virtual host named by a `connection.open`.
pub fn connection_open_vhost(method: &Method) -> Result<String> {
    Ok(reader(method, "connection.open").short_str()?)
}

/// `connection.open-ok` (sent by brokers).
pub fn connection_open_ok() -> Method {
    Method::new(CONNECTION_OPEN_OK, Bytes::from_static(&[0]))
}

/// `channel.open`.
pub fn channel_open() -> Method {
    Method::new(CHANNEL_OPEN, Bytes::from_static(&[0]))
}

/// `channel.open-ok` (sent by brokers).
pub fn channel_open_ok() -> Method {
    Method::new(CHANNEL_OPEN_OK, Bytes::from_static(&[0, 0, 0, 0]))
}

/// Arguments of `connection.close` and `channel.close`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    pub reply_code: u16,
    pub reply_text: String,
    pub class_id: u16,
    pub method_id: u16,
}

impl CloseReason {
    /// A normal close initiated by the application.
    pub fn normal(text: &str) -> Self {
        Self {
            reply_code: REPLY_SUCCESS,
            reply_text: text.to_string(),
            class_id: 0,
            method_id: 0,
        }
    }

    pub fn decode(method: &Method) -> Result<Self> {
        let mut r = reader(method, "close");
        Ok(Self {
            reply_code: r.u16()?,
            reply_text: r.short_str()?,
            class_id: r.u16()?,
            method_id: r.u16()?,
        })
    }

    /// Encode as `id` (connection.close or channel.close).
    ///
    /// Reply text longer than a short string allows is truncated at a
    /// character boundary.
    pub fn to_method(&self, id: MethodId) -> Result<Method> {
        let mut text = self.reply_text.as_str();
        while text.len() > u8::MAX as usize {
            let mut cut = u8::MAX as usize;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text = &text[..cut];
        }
        let mut w = ArgWriter::new();
        w.u16(self.reply_code);
        w.short_str(text)?;
        w.u16(self.class_id).u16(self.method_id);
        Ok(Method::new(id, w.finish()))
    }

    pub fn is_success(&self) -> bool {
        self.reply_code == REPLY_SUCCESS
    }

    pub fn into_error(self) -> ClientError {
        ClientError::Protocol {
            code: self.reply_code,
            text: self.reply_text,
            class_id: self.class_id,
            method_id: self.method_id,
        }
    }
}

/// `channel.flow` / `channel.flow-ok`.
pub fn flow(id: MethodId, active: bool) -> Method {
    let mut w = ArgWriter::new();
    w.bits(&[active]);
    Method::new(id, w.finish())
}

pub fn decode_flow(method: &Method) -> Result<bool> {
    let bits = reader(method, "channel.flow").bits(1)?;
    Ok(bits[0])
}

/// `basic.deliver` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicDeliver {
    pub consumer_tag: String,
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl BasicDeliver {
    pub fn decode(method: &Method) -> Result<Self> {
        let mut r = reader(method, "basic.deliver");
        let consumer_tag = r.short_str()?;
        let delivery_tag = r.u64()?;
        let redelivered = r.bits(1)?[0];
        Ok(Self {
            consumer_tag,
            delivery_tag,
            redelivered,
            exchange: r.short_str()?,
            routing_key: r.short_str()?,
        })
    }

    pub fn to_method(&self) -> Result<Method> {
        let mut w = ArgWriter::new();
        w.short_str(&self.consumer_tag)?;
        w.u64(self.delivery_tag).bits(&[self.redelivered]);
        w.short_str(&self.exchange)?.short_str(&self.routing_key)?;
        Ok(Method::new(BASIC_DELIVER, w.finish()))
    }
}

/// `basic.get-ok` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicGetOk {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message_count: u32,
}

impl BasicGetOk {
    pub fn decode(method: &Method) -> Result<Self> {
        let mut r = reader(method, "basic.get-ok");
        let delivery_tag = r.u64()?;
        let redelivered = r.bits(1)?[0];
        Ok(Self {
            delivery_tag,
            redelivered,
            exchange: r.short_str()?,
            routing_key: r.short_str()?,
            message_count: r.u32()?,
        })
    }

    pub fn to_method(&self) -> Result<Method> {
        let mut w = ArgWriter::new();
        w.u64(self.delivery_tag).bits(&[self.redelivered]);
        w.short_str(&self.exchange)?.short_str(&self.routing_key)?;
        w.u32(self.message_count);
        Ok(Method::new(BASIC_GET_OK, w.finish()))
    }
}

/// `basic.return` arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicReturn {
    pub reply_code: u16,
    pub reply_text: String,
    pub exchange: String,
    pub routing_key: String,
}

impl BasicReturn {
    pub fn decode(method: &Method) -> Result<Self> {
        let mut r = reader(method, "basic.return");
        Ok(Self {
            reply_code: r.u16()?,
            reply_text: r.short_str()?,
            exchange: r.short_str()?,
            routing_key: r.short_str()?,
        })
    }
}

/// Server-pushed methods without content that are not replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// Publisher confirm.
    Ack { delivery_tag: u64, multiple: bool },
    /// Negative publisher confirm.
    Nack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    /// The broker cancelled a consumer.
    Cancel { consumer_tag: String },
    /// The broker asked to pause (`false`) or resume (`true`) publishing.
    Flow { active: bool },
}

impl Notification {
    /// Ids of the methods that become notifications.
    pub fn is_notification(id: MethodId) -> bool {
        matches!(id, BASIC_ACK | BASIC_NACK | BASIC_CANCEL | CHANNEL_FLOW)
    }

    pub fn decode(method: &Method) -> Result<Self> {
        match method.id() {
            BASIC_ACK => {
                let mut r = reader(method, "basic.ack");
                let delivery_tag = r.u64()?;
                let multiple = r.bits(1)?[0];
                Ok(Self::Ack {
                    delivery_tag,
                    multiple,
                })
            }
            BASIC_NACK => {
                let mut r = reader(method, "basic.nack");
                let delivery_tag = r.u64()?;
                let bits = r.bits(2)?;
                Ok(Self::Nack {
                    delivery_tag,
                    multiple: bits[0],
                    requeue: bits[1],
                })
            }
            BASIC_CANCEL => {
                let consumer_tag = reader(method, "basic.cancel").short_str()?;
                Ok(Self::Cancel { consumer_tag })
            }
            CHANNEL_FLOW => Ok(Self::Flow {
                active: decode_flow(method)?,
            }),
            other => Err(ClientError::UnexpectedFrame(format!(
                "{other} is not a server notification"
            ))),
        }
    }
}
