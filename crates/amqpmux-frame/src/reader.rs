use std::io::{ErrorKind, Read};

use amqpmux_transport::AmqpStream;
use bytes::BytesMut;
use tracing::{debug, trace};

use crate::codec::{decode_frame, Frame, FrameConfig};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Reads complete frames from any `Read` stream.
///
/// Partial reads are buffered internally; callers only ever see complete frames.
/// A read timeout surfaces as `FrameError::Io` with `WouldBlock`/`TimedOut`;
/// buffered bytes of a partial frame are kept, so the next call resumes.
pub struct FrameReader<T> {
    inner: T,
    buf: BytesMut,
    config: FrameConfig,
}

impl<T: Read> FrameReader<T> {
    /// Create a new frame reader with default configuration.
    pub fn new(inner: T) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame reader with explicit configuration.
    pub fn with_config(inner: T, config: FrameConfig) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Read the next complete frame (blocking).
    ///
    /// Returns `Err(FrameError::ConnectionClosed)` when EOF is reached, with
    /// or without a partial frame buffered.
    pub fn read_frame(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = decode_frame(&mut self.buf, self.config.max_payload_size)? {
                trace!(
                    kind = ?frame.kind,
                    channel = frame.channel,
                    len = frame.payload.len(),
                    "frame in"
                );
                return Ok(frame);
            }

            // Read straight into the tail of the buffer.
            let filled = self.buf.len();
            self.buf.resize(filled + READ_CHUNK_SIZE, 0);
            let read = self.inner.read(&mut self.buf[filled..]);
            self.buf.truncate(filled + read.as_ref().map_or(0, |n| *n));

            match read {
                Ok(0) => {
                    if !self.buf.is_empty() {
                        debug!(buffered = self.buf.len(), "eof inside a frame");
                    }
                    return Err(FrameError::ConnectionClosed);
                }
                Ok(_) => {}
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    /// Bytes received but not yet consumed as a frame.
    pub fn buffered(&self) -> &[u8] {
        &self.buf
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    /// Consume the reader and return the inner stream.
    pub fn into_inner(self) -> T {
        self.inner
    }

    /// Update maximum payload size for subsequent frame decoding.
    pub fn set_max_payload_size(&mut self, max_payload_size: usize) {
        self.config.max_payload_size = max_payload_size;
    }

    /// Current frame reader configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

impl FrameReader<AmqpStream> {
    /// Create a frame reader for `AmqpStream` and apply read timeout from config.
    pub fn with_config_stream(inner: AmqpStream, config: FrameConfig) -> Result<Self> {
        inner
            .set_read_timeout(config.read_timeout)
            .map_err(transport_to_frame_error)?;
        Ok(Self::with_config(inner, config))
    }

    /// Change the socket read timeout after construction.
    pub fn set_read_timeout(&mut self, timeout: Option<std::time::Duration>) -> Result<()> {
        self.inner
            .set_read_timeout(timeout)
            .map_err(transport_to_frame_error)?;
        self.config.read_timeout = timeout;
        Ok(())
    }
}

pub(crate) fn transport_to_frame_error(err: amqpmux_transport::TransportError) -> FrameError {
    match err {
        amqpmux_transport::TransportError::Io(io) => FrameError::Io(io),
        amqpmux_transport::TransportError::Resolve { source, .. }
        | amqpmux_transport::TransportError::Connect { source, .. } => FrameError::Io(source),
        other => FrameError::Io(std::io::Error::other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{encode_frame, FrameType, FRAME_END};

    fn wire(frames: &[(FrameType, u16, &[u8])]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for (kind, channel, payload) in frames {
            encode_frame(*kind, *channel, payload, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn tcp_pair() -> (AmqpStream, AmqpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (AmqpStream::from_tcp(client), AmqpStream::from_tcp(server))
    }

    #[test]
    fn read_single_frame() {
        let bytes = wire(&[(FrameType::Method, 1, b"hello")]);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.kind, FrameType::Method);
        assert_eq!(frame.channel, 1);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn read_multiple_frames() {
        let bytes = wire(&[
            (FrameType::Method, 1, b"one"),
            (FrameType::Header, 1, b"two"),
            (FrameType::Body, 1, b"three"),
        ]);

        let mut reader = FrameReader::new(Cursor::new(bytes));

        let f1 = reader.read_frame().unwrap();
        let f2 = reader.read_frame().unwrap();
        let f3 = reader.read_frame().unwrap();

        assert_eq!((f1.kind, f1.payload.as_ref()), (FrameType::Method, b"one".as_ref()));
        assert_eq!((f2.kind, f2.payload.as_ref()), (FrameType::Header, b"two".as_ref()));
        assert_eq!((f3.kind, f3.payload.as_ref()), (FrameType::Body, b"three".as_ref()));
    }

    #[test]
    fn read_frame_with_large_payload() {
        let payload = vec![0xAB; 64 * 1024];
        let bytes = wire(&[(FrameType::Body, 9, &payload)]);

        let cfg = FrameConfig {
            max_payload_size: FrameConfig::max_payload_for(128 * 1024),
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes), cfg);
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel, 9);
        assert_eq!(frame.payload.as_ref(), payload.as_slice());
    }

    #[test]
    fn partial_read_handling() {
        let byte_reader = ByteByByteReader {
            bytes: wire(&[(FrameType::Body, 4, b"slow")]),
            pos: 0,
        };
        let mut reader = FrameReader::new(byte_reader);

        let frame = reader.read_frame().unwrap();
        assert_eq!(frame.channel, 4);
        assert_eq!(frame.payload.as_ref(), b"slow");
    }

    #[test]
    fn connection_closed_cleanly() {
        let mut reader = FrameReader::new(Cursor::new(Vec::<u8>::new()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn connection_closed_mid_frame() {
        let mut partial = BytesMut::new();
        partial.put_u8(FrameType::Body.as_u8());
        partial.put_u16(2);
        partial.put_u32(16);
        partial.put_slice(b"only-part");

        let mut reader = FrameReader::new(Cursor::new(partial.to_vec()));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn corrupt_frame_end_in_stream() {
        let mut bytes = wire(&[(FrameType::Method, 1, b"abc")]);
        let last = bytes.len() - 1;
        bytes[last] = FRAME_END.wrapping_add(1);

        let mut reader = FrameReader::new(Cursor::new(bytes));
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::MissingFrameEnd { .. }));
    }

    #[test]
    fn oversized_frame_in_stream() {
        let mut bytes = BytesMut::new();
        bytes.put_u8(FrameType::Body.as_u8());
        bytes.put_u16(1);
        bytes.put_u32(1024);

        let cfg = FrameConfig {
            max_payload_size: 16,
            ..FrameConfig::default()
        };
        let mut reader = FrameReader::with_config(Cursor::new(bytes.to_vec()), cfg);
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }

    #[derive(Debug)]
    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }

            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    #[test]
    fn roundtrip_over_tcp() {
        let (left, right) = tcp_pair();
        let mut writer = crate::writer::FrameWriter::new(left);
        let mut reader = FrameReader::new(right);

        writer.send(FrameType::Method, 1, b"ping").unwrap();
        let frame = reader.read_frame().unwrap();

        assert_eq!(frame.channel, 1);
        assert_eq!(frame.payload.as_ref(), b"ping");
    }

    #[test]
    fn concurrent_reader_writer_threads() {
        let (left, right) = tcp_pair();
        let mut writer = crate::writer::FrameWriter::new(left);
        let reader = Arc::new(Mutex::new(FrameReader::new(right)));

        let reader_thread = {
            let reader = Arc::clone(&reader);
            std::thread::spawn(move || {
                for expected in 0..64u16 {
                    let frame = reader.lock().unwrap().read_frame().unwrap();
                    assert_eq!(frame.channel, expected % 5);
                    assert_eq!(frame.payload.as_ref(), format!("msg-{expected}").as_bytes());
                }
            })
        };

        for i in 0..64u16 {
            let payload = format!("msg-{i}");
            writer.send(FrameType::Body, i % 5, payload.as_bytes()).unwrap();
        }

        reader_thread.join().unwrap();
    }

    #[test]
    fn read_timeout_keeps_partial_frame() {
        let bytes = wire(&[(FrameType::Method, 7, b"ok")]);
        let reader = TimeoutMidFrame {
            bytes,
            pos: 0,
            timed_out: false,
        };
        let mut framed = FrameReader::new(reader);

        let err = framed.read_frame().unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
        assert_eq!(framed.buffered().len(), 3);

        let frame = framed.read_frame().unwrap();
        assert_eq!(frame.channel, 7);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    /// Yields three bytes, then one timeout, then the rest.
    struct TimeoutMidFrame {
        bytes: Vec<u8>,
        pos: usize,
        timed_out: bool,
    }

    impl Read for TimeoutMidFrame {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos == 3 && !self.timed_out {
                self.timed_out = true;
                return Err(std::io::Error::from(ErrorKind::WouldBlock));
            }
            let limit = if self.timed_out { self.bytes.len() } else { 3 };
            let n = (limit - self.pos).min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn interrupted_read_retries() {
        let reader = InterruptedThenData {
            state: 0,
            bytes: wire(&[(FrameType::Method, 8, b"ok")]),
            pos: 0,
        };
        let mut framed = FrameReader::new(reader);
        let frame = framed.read_frame().unwrap();

        assert_eq!(frame.channel, 8);
        assert_eq!(frame.payload.as_ref(), b"ok");
    }

    struct InterruptedThenData {
        state: u8,
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.state == 0 {
                self.state = 1;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            if self.pos >= self.bytes.len() {
                return Ok(0);
            }
            let remaining = self.bytes.len() - self.pos;
            let n = remaining.min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn applies_read_timeout_for_stream() {
        let (_left, right) = tcp_pair();

        let cfg = FrameConfig {
            read_timeout: Some(std::time::Duration::from_millis(10)),
            ..FrameConfig::default()
        };

        let mut reader = FrameReader::with_config_stream(right, cfg).unwrap();
        let err = reader.read_frame().unwrap_err();
        assert!(matches!(
            err,
            FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
        ));
    }
}
