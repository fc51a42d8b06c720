//! In-process scripted broker for integration tests.
//!
//! The test drives both ends: the client under test dials a loopback
//! listener, and the test thread plays the broker through [`BrokerSide`].

#![allow(dead_code)]

use std::io::{ErrorKind, Read};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use amqpmux_client::control::{self, ConnectionStart, ConnectionStartOk, Tune};
use amqpmux_client::{dial, Connection, ConnectionConfig};
use amqpmux_frame::method::{
    CHANNEL_OPEN, CLASS_BASIC, CONNECTION_OPEN, CONNECTION_START_OK, CONNECTION_TUNE,
    CONNECTION_TUNE_OK,
};
use amqpmux_frame::{
    body_frames, ContentHeader, FieldTable, FieldValue, Frame, FrameConfig, FrameError, FrameReader,
    FrameType, FrameWriter, Method, MethodId, Properties, PROTOCOL_HEADER,
};
use bytes::Bytes;

const BROKER_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// What the scripted broker offers in `connection.tune`.
#[derive(Debug, Clone, Copy)]
pub struct BrokerTune {
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
}

impl Default for BrokerTune {
    fn default() -> Self {
        Self {
            channel_max: 2047,
            frame_max: 131_072,
            heartbeat: 0,
        }
    }
}

/// The broker end of a test connection.
pub struct BrokerSide {
    stream: TcpStream,
    reader: FrameReader<TcpStream>,
    writer: FrameWriter<TcpStream>,
}

impl BrokerSide {
    fn accept(listener: TcpListener, tune: BrokerTune) -> Self {
        let (mut stream, _) = listener.accept().expect("broker should accept");
        stream
            .set_read_timeout(Some(BROKER_READ_TIMEOUT))
            .expect("read timeout should apply");

        let mut header = [0u8; 8];
        stream
            .read_exact(&mut header)
            .expect("client should send protocol header");
        assert_eq!(header, PROTOCOL_HEADER);

        let unlimited = FrameConfig {
            max_payload_size: u32::MAX as usize,
            ..FrameConfig::default()
        };
        let reader = FrameReader::with_config(
            stream.try_clone().expect("stream should clone"),
            unlimited.clone(),
        );
        let writer = FrameWriter::with_config(
            stream.try_clone().expect("stream should clone"),
            unlimited,
        );
        let mut broker = Self {
            stream,
            reader,
            writer,
        };
        broker.handshake(tune);
        broker
    }

    fn handshake(&mut self, tune: BrokerTune) {
        let mut props = FieldTable::new();
        props.insert("product".to_string(), FieldValue::string("scripted-broker"));
        let start = ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: props,
            mechanisms: "AMQPLAIN PLAIN".to_string(),
            locales: "en_US".to_string(),
        };
        self.send_method(0, &start.to_method().expect("start should encode"));

        let (_, start_ok) = self.expect_method(CONNECTION_START_OK);
        let start_ok = ConnectionStartOk::decode(&start_ok).expect("start-ok should decode");
        assert_eq!(start_ok.mechanism, "PLAIN");

        let offer = Tune {
            channel_max: tune.channel_max,
            frame_max: tune.frame_max,
            heartbeat: tune.heartbeat,
        };
        self.send_method(0, &offer.to_method(CONNECTION_TUNE));
        self.expect_method(CONNECTION_TUNE_OK);
        self.expect_method(CONNECTION_OPEN);
        self.send_method(0, &control::connection_open_ok());
    }

    /// Next non-heartbeat frame.
    pub fn recv(&mut self) -> Frame {
        loop {
            let frame = self.reader.read_frame().expect("broker should read a frame");
            if frame.kind != FrameType::Heartbeat {
                return frame;
            }
        }
    }

    /// Next frame of any kind, or `None` if nothing arrives within `wait`.
    pub fn recv_any_within(&mut self, wait: Duration) -> Option<Frame> {
        self.stream
            .set_read_timeout(Some(wait))
            .expect("read timeout should apply");
        let frame = match self.reader.read_frame() {
            Ok(frame) => Some(frame),
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                None
            }
            Err(err) => panic!("broker read failed: {err}"),
        };
        self.stream
            .set_read_timeout(Some(BROKER_READ_TIMEOUT))
            .expect("read timeout should apply");
        frame
    }

    pub fn recv_method(&mut self) -> (u16, Method) {
        let frame = self.recv();
        assert_eq!(frame.kind, FrameType::Method, "expected a method frame");
        let method = Method::decode(frame.payload).expect("method should decode");
        (frame.channel, method)
    }

    pub fn expect_method(&mut self, id: MethodId) -> (u16, Method) {
        let (channel, method) = self.recv_method();
        assert_eq!(method.id(), id, "unexpected method on channel {channel}");
        (channel, method)
    }

    pub fn send_method(&mut self, channel: u16, method: &Method) {
        self.writer
            .write_frame(&Frame::method(channel, method))
            .expect("broker should write");
    }

    /// Send a content-bearing method with its header and body frames.
    pub fn send_content(&mut self, channel: u16, method: &Method, body: &[u8], chunk: usize) {
        let body = Bytes::copy_from_slice(body);
        let header = ContentHeader::new(CLASS_BASIC, body.len() as u64, Properties::default());
        let mut frames = vec![
            Frame::method(channel, method),
            Frame::header(channel, &header),
        ];
        frames.extend(body_frames(channel, &body, chunk));
        self.writer
            .write_frames(&frames)
            .expect("broker should write content");
    }

    /// Write pre-built frames in the given order.
    pub fn send_frames(&mut self, frames: &[Frame]) {
        self.writer
            .write_frames(frames)
            .expect("broker should write frames");
    }

    pub fn send_heartbeat(&mut self) {
        self.writer
            .write_frame(&Frame::heartbeat())
            .expect("broker should write heartbeat");
    }

    /// Answer the next `channel.open` and return its channel id.
    pub fn accept_channel_open(&mut self) -> u16 {
        let (channel, _) = self.expect_method(CHANNEL_OPEN);
        self.send_method(channel, &control::channel_open_ok());
        channel
    }

    /// Drop the TCP connection without any close handshake.
    pub fn kill(self) {
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
    }
}

/// Dial a scripted broker and return both ends once the handshake is done.
pub fn connect_with(
    tune: BrokerTune,
    configure: impl FnOnce(&mut ConnectionConfig),
) -> (Connection, BrokerSide) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("listener should bind");
    let port = listener.local_addr().expect("listener addr").port();

    let broker = thread::spawn(move || BrokerSide::accept(listener, tune));

    let mut config = ConnectionConfig::new("127.0.0.1", port);
    config.heartbeat = Duration::ZERO;
    config.connect_timeout = Duration::from_secs(5);
    config.close_timeout = Duration::from_secs(1);
    configure(&mut config);

    let connection = dial(&config).expect("client should connect");
    let broker = broker.join().expect("broker thread should complete");
    (connection, broker)
}

pub fn connect() -> (Connection, BrokerSide) {
    connect_with(BrokerTune::default(), |_| {})
}

/// A `basic.deliver` for `tag` on `consumer`.
pub fn deliver(consumer: &str, tag: u64) -> Method {
    control::BasicDeliver {
        consumer_tag: consumer.to_string(),
        delivery_tag: tag,
        redelivered: false,
        exchange: String::new(),
        routing_key: "jobs".to_string(),
    }
    .to_method()
    .expect("deliver should encode")
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}
