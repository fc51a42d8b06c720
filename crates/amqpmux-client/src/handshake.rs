use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};

use amqpmux_frame::method::{
    CONNECTION_CLOSE, CONNECTION_CLOSE_OK, CONNECTION_OPEN_OK, CONNECTION_SECURE,
    CONNECTION_START, CONNECTION_TUNE, CONNECTION_TUNE_OK,
};
use amqpmux_frame::{
    FieldTable, FieldValue, Frame, FrameError, FrameReader, FrameType, FrameWriter, Method,
    MethodId, CONTROL, FRAME_MIN_SIZE,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{duration_secs, ConnectionConfig};
use crate::control::{self, CloseReason, ConnectionStart, ConnectionStartOk, Tune};
use crate::error::{ClientError, Result};

const MECHANISM: &str = "PLAIN";

/// Parameters agreed during `connection.tune`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tuning {
    /// Highest usable channel id; zero means no limit.
    pub channel_max: u16,
    /// Largest frame either side may send; zero means no limit.
    pub frame_max: u32,
    /// Heartbeat interval; zero disables heartbeats.
    #[serde(with = "duration_secs")]
    pub heartbeat: Duration,
}

/// Outcome of a successful handshake.
#[derive(Debug, Clone, PartialEq)]
pub struct Negotiated {
    pub tuning: Tuning,
    pub server_properties: FieldTable,
}

/// Choose between our limit and the server's: zero on one side defers to
/// the other, otherwise the lower value wins.
pub fn negotiate<T: Ord + Default + Copy>(ours: T, theirs: T) -> T {
    if ours == T::default() || theirs == T::default() {
        ours.max(theirs)
    } else {
        ours.min(theirs)
    }
}

/// Run the client side of the connection handshake.
///
/// Sends the protocol header, authenticates with PLAIN, agrees on tuning,
/// and opens the configured virtual host. The whole exchange is bounded by
/// `config.connect_timeout`.
pub fn handshake<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    config: &ConnectionConfig,
) -> Result<Negotiated> {
    let timeout = config.connect_timeout;
    let deadline = Instant::now() + timeout;

    writer.write_protocol_header()?;

    let start = ConnectionStart::decode(&expect_method(
        reader,
        writer,
        CONNECTION_START,
        deadline,
        timeout,
    )?)?;
    if (start.version_major, start.version_minor) != (0, 9) {
        return Err(ClientError::HandshakeFailed(format!(
            "unsupported protocol version {}-{}",
            start.version_major, start.version_minor
        )));
    }
    if !start.offers_mechanism(MECHANISM) {
        return Err(ClientError::HandshakeFailed(format!(
            "server does not offer {MECHANISM} (offers '{}')",
            start.mechanisms
        )));
    }
    debug!(
        product = start
            .server_properties
            .get("product")
            .and_then(FieldValue::as_str)
            .unwrap_or("unknown"),
        "connection.start received"
    );

    let start_ok = ConnectionStartOk {
        client_properties: client_properties(config),
        mechanism: MECHANISM.to_string(),
        response: Bytes::from(config.plain_response()),
        locale: config.locale.clone(),
    };
    send(writer, &start_ok.to_method()?)?;

    let offered = Tune::decode(&expect_method(
        reader,
        writer,
        CONNECTION_TUNE,
        deadline,
        timeout,
    )?)?;

    let requested_heartbeat = u16::try_from(config.heartbeat.as_secs()).unwrap_or(u16::MAX);
    let agreed = Tune {
        channel_max: negotiate(config.channel_max, offered.channel_max),
        frame_max: negotiate(config.frame_max, offered.frame_max),
        heartbeat: negotiate(requested_heartbeat, offered.heartbeat),
    };
    if agreed.frame_max != 0 && (agreed.frame_max as usize) < FRAME_MIN_SIZE {
        return Err(ClientError::HandshakeFailed(format!(
            "negotiated frame_max {} is below the protocol minimum {FRAME_MIN_SIZE}",
            agreed.frame_max
        )));
    }
    send(writer, &agreed.to_method(CONNECTION_TUNE_OK))?;

    send(writer, &control::connection_open(&config.vhost)?)?;
    expect_method(reader, writer, CONNECTION_OPEN_OK, deadline, timeout)?;

    let tuning = Tuning {
        channel_max: agreed.channel_max,
        frame_max: agreed.frame_max,
        heartbeat: Duration::from_secs(u64::from(agreed.heartbeat)),
    };
    debug!(
        channel_max = tuning.channel_max,
        frame_max = tuning.frame_max,
        heartbeat_secs = agreed.heartbeat,
        vhost = %config.vhost,
        "handshake complete"
    );

    Ok(Negotiated {
        tuning,
        server_properties: start.server_properties,
    })
}

/// Properties announced in `connection.start-ok`.
pub fn client_properties(config: &ConnectionConfig) -> FieldTable {
    let mut capabilities = FieldTable::new();
    for name in [
        "publisher_confirms",
        "consumer_cancel_notify",
        "basic.nack",
        "connection.blocked",
        "authentication_failure_close",
    ] {
        capabilities.insert(name.to_string(), FieldValue::Bool(true));
    }

    let mut props = FieldTable::new();
    props.insert("product".to_string(), FieldValue::string("amqpmux"));
    props.insert(
        "version".to_string(),
        FieldValue::string(env!("CARGO_PKG_VERSION")),
    );
    props.insert("platform".to_string(), FieldValue::string("Rust"));
    props.insert("capabilities".to_string(), FieldValue::Table(capabilities));
    if let Some(name) = &config.connection_name {
        props.insert("connection_name".to_string(), FieldValue::string(name));
    }
    props
}

fn send<W: Write>(writer: &mut FrameWriter<W>, method: &Method) -> Result<()> {
    writer.write_frame(&Frame::method(CONTROL, method))?;
    Ok(())
}

fn expect_method<R: Read, W: Write>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    expected: MethodId,
    deadline: Instant,
    timeout: Duration,
) -> Result<Method> {
    let method = recv_method(reader, deadline, timeout)?;

    match method.id() {
        id if id == expected => Ok(method),
        CONNECTION_CLOSE => {
            let reason = CloseReason::decode(&method)?;
            let _ = send(writer, &Method::new(CONNECTION_CLOSE_OK, Bytes::new()));
            Err(ClientError::HandshakeFailed(format!(
                "server closed connection: {} {}",
                reason.reply_code, reason.reply_text
            )))
        }
        CONNECTION_SECURE => Err(ClientError::HandshakeFailed(
            "server requested a SASL challenge, which PLAIN does not answer".to_string(),
        )),
        other => Err(ClientError::HandshakeFailed(format!(
            "expected {expected}, got {other}"
        ))),
    }
}

fn recv_method<R: Read>(
    reader: &mut FrameReader<R>,
    deadline: Instant,
    timeout: Duration,
) -> Result<Method> {
    loop {
        if Instant::now() >= deadline {
            return Err(ClientError::Timeout(timeout));
        }

        match reader.read_frame() {
            Ok(frame) if frame.kind == FrameType::Heartbeat => continue,
            Ok(frame) if frame.kind == FrameType::Method && frame.channel == CONTROL => {
                return Ok(Method::decode(frame.payload)?);
            }
            Ok(frame) => {
                return Err(ClientError::HandshakeFailed(format!(
                    "unexpected {:?} frame on channel {} during handshake",
                    frame.kind, frame.channel
                )));
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                return Err(ClientError::HandshakeFailed(
                    "connection closed during handshake".to_string(),
                ));
            }
            // A server that does not speak 0-9-1 answers with its own
            // protocol header, which starts with 'A'.
            Err(FrameError::UnknownFrameType(b'A')) => {
                return Err(ClientError::HandshakeFailed(
                    "server rejected protocol version 0-9-1".to_string(),
                ));
            }
            Err(err) => return Err(err.into()),
        }
    }
}
