//! Connection and channel multiplexing for the AMQP 0-9-1 client.
//!
//! A [`Connection`] owns one TCP socket. Any number of [`Channel`]s share
//! it: each channel issues synchronous methods with [`Channel::call`] and
//! receives asynchronous deliveries with [`Channel::receive`], while one
//! reader thread demultiplexes every inbound frame by channel id.
//!
//! ```no_run
//! use amqpmux_client::{dial, ConnectionConfig};
//!
//! let conn = dial(&ConnectionConfig::new("localhost", 5672))?;
//! let channel = conn.open_channel()?;
//! channel.close("done")?;
//! conn.close("done")?;
//! # Ok::<(), amqpmux_client::ClientError>(())
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod connector;
pub mod control;
pub mod delivery;
pub mod error;
pub mod handshake;
pub mod heartbeat;
pub mod rendezvous;

pub use channel::{Channel, ChannelState};
pub use config::ConnectionConfig;
pub use connection::{Connection, ShutdownCause};
pub use connector::{dial, dial_with_stream};
pub use control::{CloseReason, Notification};
pub use delivery::{Delivery, Dispatcher};
pub use error::{ClientError, Result};
pub use handshake::{handshake, negotiate, Negotiated, Tuning};
pub use heartbeat::{HeartbeatAction, HeartbeatMonitor, HeartbeatState};
pub use rendezvous::{Rendezvous, Reply, Resolution, RpcToken};
