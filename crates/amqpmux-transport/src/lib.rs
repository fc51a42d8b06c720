//! TCP transport for the AMQP 0-9-1 client.
//!
//! This is the lowest layer of amqpmux. It knows how to reach a broker and
//! hand back a connected, bidirectional byte stream. It has no knowledge of
//! framing, TLS, or URIs; everything else builds on the [`AmqpStream`] type
//! provided here.

pub mod error;
pub mod stream;
pub mod tcp;

pub use error::{Result, TransportError};
pub use stream::AmqpStream;
pub use tcp::TcpTransport;
