//! Blocking AMQP 0-9-1 client core with channel multiplexing.
//!
//! amqpmux speaks the 0-9-1 wire protocol over a single TCP connection and
//! multiplexes any number of logical channels on it. Each channel carries
//! synchronous request/reply methods and asynchronous content deliveries.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP byte stream with connect and socket timeouts
//! - [`frame`]: frame codec, method and content-header envelopes, body checksums
//! - [`client`]: connection, channels, reply rendezvous, delivery reassembly, heartbeat

/// Re-export transport types.
pub mod transport {
    pub use amqpmux_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use amqpmux_frame::*;
}

/// Re-export client types.
pub mod client {
    pub use amqpmux_client::*;
}

pub use amqpmux_client::{
    dial, Channel, ClientError, Connection, ConnectionConfig, Delivery, Notification,
};
