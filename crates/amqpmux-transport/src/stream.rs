use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use crate::error::{Result, TransportError};

/// A connected broker stream implementing `Read` and `Write`.
///
/// This is the fundamental I/O type returned by transport operations.
/// A connection keeps one clone for its reader thread, one behind its
/// serialized write path, and one for out-of-band shutdown.
pub struct AmqpStream {
    inner: AmqpStreamInner,
}

enum AmqpStreamInner {
    Tcp(TcpStream),
}

impl Read for AmqpStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            AmqpStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for AmqpStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            AmqpStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            AmqpStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl AmqpStream {
    /// Wrap an already connected TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: AmqpStreamInner::Tcp(stream),
        }
    }

    /// Set read timeout on the underlying stream.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            AmqpStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Set write timeout on the underlying stream.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            AmqpStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    /// Disable Nagle's algorithm so small method frames leave immediately.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        match &self.inner {
            AmqpStreamInner::Tcp(stream) => stream.set_nodelay(nodelay).map_err(Into::into),
        }
    }

    /// Try to clone this stream (creates a new file descriptor).
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            AmqpStreamInner::Tcp(stream) => {
                let cloned = stream.try_clone()?;
                Ok(Self::from_tcp(cloned))
            }
        }
    }

    /// Shut down both halves of the stream.
    ///
    /// Any thread blocked reading from a clone of this stream wakes up with
    /// EOF or an error. Shutting down an already closed socket is not an error.
    pub fn shutdown(&self) -> Result<()> {
        let result = match &self.inner {
            AmqpStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotConnected => Ok(()),
            Err(err) => Err(TransportError::Io(err)),
        }
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            AmqpStreamInner::Tcp(stream) => stream.peer_addr().map_err(Into::into),
        }
    }

    /// Address of the local end.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.inner {
            AmqpStreamInner::Tcp(stream) => stream.local_addr().map_err(Into::into),
        }
    }
}

impl std::fmt::Debug for AmqpStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.inner {
            AmqpStreamInner::Tcp(stream) => f
                .debug_struct("AmqpStream")
                .field("type", &"tcp")
                .field("peer", &stream.peer_addr().ok())
                .finish(),
        }
    }
}
