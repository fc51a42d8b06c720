use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use tracing::debug;

use crate::error::{Result, TransportError};
use crate::stream::AmqpStream;

/// TCP transport to an AMQP broker.
///
/// Resolves `host:port`, then tries every resolved address in order until one
/// accepts a connection within the timeout.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl TcpTransport {
    /// Default AMQP port.
    pub const DEFAULT_PORT: u16 = 5672;

    /// Describe a transport to `host:port`.
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }

    /// Connect to the broker (blocking).
    pub fn connect(&self) -> Result<AmqpStream> {
        let addr = self.address();
        let candidates = self.resolve()?;

        let mut last_err = None;
        for candidate in candidates {
            match TcpStream::connect_timeout(&candidate, self.connect_timeout) {
                Ok(stream) => {
                    debug!(%candidate, "connected to broker");
                    let stream = AmqpStream::from_tcp(stream);
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(%candidate, error = %err, "connect attempt failed");
                    last_err = Some(err);
                }
            }
        }

        match last_err {
            Some(source) => Err(TransportError::Connect { addr, source }),
            None => Err(TransportError::NoAddress { addr }),
        }
    }

    /// `host:port` as used for resolution and diagnostics.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Transport name for diagnostics.
    pub fn transport_name(&self) -> &'static str {
        "tcp"
    }

    fn resolve(&self) -> Result<Vec<SocketAddr>> {
        let addr = self.address();
        let resolved = addr
            .to_socket_addrs()
            .map_err(|source| TransportError::Resolve {
                addr: addr.clone(),
                source,
            })?;
        Ok(resolved.collect())
    }
}
