use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use amqpmux_frame::method::{
    CHANNEL_OPEN, CHANNEL_OPEN_OK, CONNECTION_BLOCKED, CONNECTION_CLOSE, CONNECTION_CLOSE_OK,
    CONNECTION_UNBLOCKED,
};
use amqpmux_frame::{
    ArgReader, FieldTable, Frame, FrameError, FrameReader, FrameType, FrameWriter, Method,
    CONTROL, FIRST_CHANNEL, MAX_CHANNEL,
};
use amqpmux_transport::{AmqpStream, TransportError};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelShared};
use crate::config::ConnectionConfig;
use crate::control::{self, CloseReason, Notification};
use crate::delivery::Delivery;
use crate::error::{ClientError, Result};
use crate::handshake::{Negotiated, Tuning};
use crate::heartbeat::{self, HeartbeatMonitor};
use crate::rendezvous::{Reply, Rendezvous, Resolution};

/// Why a connection or channel stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    /// Closed by the application.
    Local(String),
    /// Closed by the broker with `connection.close` or `channel.close`.
    Remote(CloseReason),
    /// The transport or the framing failed.
    Failure(String),
    /// Nothing was received within the heartbeat timeout.
    HeartbeatTimeout(Duration),
}

impl ShutdownCause {
    /// The error handed to callers blocked in (or arriving at) `scope`.
    pub fn to_error(&self, scope: &str) -> ClientError {
        match self {
            Self::Local(reason) => ClientError::Closed(format!("{scope} closed: {reason}")),
            Self::Failure(detail) => ClientError::Closed(format!("{scope} failed: {detail}")),
            Self::Remote(reason) if reason.is_success() => ClientError::Closed(format!(
                "{scope} closed by broker: {}",
                reason.reply_text
            )),
            Self::Remote(reason) => reason.clone().into_error(),
            Self::HeartbeatTimeout(timeout) => ClientError::HeartbeatTimeout(*timeout),
        }
    }
}

impl fmt::Display for ShutdownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(reason) => write!(f, "closed locally: {reason}"),
            Self::Remote(reason) => write!(
                f,
                "closed by broker: {} {}",
                reason.reply_code, reason.reply_text
            ),
            Self::Failure(detail) => write!(f, "failed: {detail}"),
            Self::HeartbeatTimeout(timeout) => write!(f, "heartbeat timeout after {timeout:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnectionState {
    Open,
    Closing,
    Closed(ShutdownCause),
}

/// State shared by the application-facing handles, the reader thread, and
/// the heartbeat thread.
pub(crate) struct ConnectionShared {
    writer: Mutex<FrameWriter<AmqpStream>>,
    control: AmqpStream,
    channels: Mutex<HashMap<u16, Arc<ChannelShared>>>,
    state: Mutex<ConnectionState>,
    close_rpc: Rendezvous,
    tuning: Tuning,
    max_payload: usize,
    server_properties: FieldTable,
    config: ConnectionConfig,
    epoch: Instant,
    last_sent_ms: AtomicU64,
    last_received_ms: AtomicU64,
    blocked: AtomicBool,
}

impl ConnectionShared {
    pub(crate) fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Largest payload a single outbound frame may carry.
    pub(crate) fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Highest channel id that may be allocated.
    fn channel_max(&self) -> u16 {
        if self.tuning.channel_max == 0 {
            MAX_CHANNEL
        } else {
            self.tuning.channel_max
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    pub(crate) fn since_sent(&self) -> Duration {
        let last = self.last_sent_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    pub(crate) fn since_received(&self) -> Duration {
        let last = self.last_received_ms.load(Ordering::Relaxed);
        Duration::from_millis(self.now_ms().saturating_sub(last))
    }

    fn mark_received(&self) {
        self.last_received_ms.store(self.now_ms(), Ordering::Relaxed);
    }

    pub(crate) fn is_closed(&self) -> bool {
        matches!(*self.state.lock(), ConnectionState::Closed(_))
    }

    fn closed_error(&self) -> Option<ClientError> {
        match &*self.state.lock() {
            ConnectionState::Closed(cause) => Some(cause.to_error("connection")),
            _ => None,
        }
    }

    /// Write whole frames through the single serialized write path.
    ///
    /// A failed write is fatal: the connection is shut down before the error
    /// is returned. An oversized frame is rejected before anything is
    /// written and leaves the connection usable.
    pub(crate) fn write_frames(&self, frames: &[Frame]) -> Result<()> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }

        let written = self.writer.lock().write_frames(frames);
        self.finish_write(written)
    }

    fn finish_write(&self, written: std::result::Result<(), FrameError>) -> Result<()> {
        match written {
            Ok(()) => {
                self.last_sent_ms.store(self.now_ms(), Ordering::Relaxed);
                Ok(())
            }
            Err(err @ FrameError::PayloadTooLarge { .. }) => Err(err.into()),
            Err(err) => {
                self.shutdown(ShutdownCause::Failure(format!("write failed: {err}")));
                Err(err.into())
            }
        }
    }

    pub(crate) fn send_method(&self, channel: u16, method: &Method) -> Result<()> {
        trace!(channel, method = %method.id(), "send");
        self.write_frames(&[Frame::method(channel, method)])
    }

    /// Send a heartbeat frame unless another write holds the socket.
    ///
    /// Returns `Ok(false)` when skipped, so the heartbeat thread never waits
    /// behind a write the peer has stopped draining.
    pub(crate) fn send_heartbeat(&self) -> Result<bool> {
        if let Some(err) = self.closed_error() {
            return Err(err);
        }
        let Some(mut writer) = self.writer.try_lock() else {
            return Ok(false);
        };
        let written = writer.write_frame(&Frame::heartbeat());
        drop(writer);
        self.finish_write(written).map(|()| true)
    }

    /// Allocate the lowest free channel id and register its routing entry.
    fn register_channel(
        &self,
    ) -> Result<(Arc<ChannelShared>, Receiver<Delivery>, Receiver<Notification>)> {
        let max = self.channel_max();
        let mut channels = self.channels.lock();

        match &*self.state.lock() {
            ConnectionState::Open => {}
            ConnectionState::Closing => {
                return Err(ClientError::Closed("connection is closing".to_string()))
            }
            ConnectionState::Closed(cause) => return Err(cause.to_error("connection")),
        }

        let id = (FIRST_CHANNEL..=max)
            .find(|id| !channels.contains_key(id))
            .ok_or(ClientError::ChannelsExhausted { max })?;
        let (shared, deliveries, notifications) = ChannelShared::new(id);
        channels.insert(id, Arc::clone(&shared));
        Ok((shared, deliveries, notifications))
    }

    /// Drop the routing entry for `id`.
    pub(crate) fn release_channel(&self, id: u16) {
        self.channels.lock().remove(&id);
    }

    /// Move to the terminal state and unblock everyone.
    ///
    /// Idempotent; only the first cause is kept.
    pub(crate) fn shutdown(&self, cause: ShutdownCause) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Closed(_)) {
                return;
            }
            *state = ConnectionState::Closed(cause.clone());
        }

        match &cause {
            ShutdownCause::Local(_) => info!(%cause, "connection closed"),
            ShutdownCause::Remote(reason) if reason.is_success() => {
                info!(%cause, "connection closed")
            }
            _ => warn!(%cause, "connection terminated"),
        }

        self.close_rpc.abort(cause.to_error("connection"));

        let channels: Vec<Arc<ChannelShared>> =
            self.channels.lock().drain().map(|(_, ch)| ch).collect();
        for channel in channels {
            channel.shutdown(cause.clone());
        }

        if let Err(err) = self.control.shutdown() {
            debug!(error = %err, "socket shutdown failed");
        }
    }

    fn route(&self, frame: Frame) -> Result<()> {
        if frame.kind == FrameType::Heartbeat {
            trace!("heartbeat received");
            return Ok(());
        }
        if frame.channel == CONTROL {
            return self.route_control(frame);
        }

        let channel = self.channels.lock().get(&frame.channel).cloned();
        match channel {
            Some(channel) => channel.handle_frame(self, frame),
            None => {
                warn!(
                    channel = frame.channel,
                    kind = ?frame.kind,
                    "frame for unknown channel dropped"
                );
                Ok(())
            }
        }
    }

    fn route_control(&self, frame: Frame) -> Result<()> {
        if frame.kind != FrameType::Method {
            return Err(ClientError::UnexpectedFrame(format!(
                "{:?} frame on the control channel",
                frame.kind
            )));
        }

        let method = Method::decode(frame.payload)?;
        match method.id() {
            CONNECTION_CLOSE => {
                let reason = CloseReason::decode(&method)?;
                let _ = self.send_method(CONTROL, &Method::new(CONNECTION_CLOSE_OK, Bytes::new()));
                self.shutdown(ShutdownCause::Remote(reason));
            }
            CONNECTION_CLOSE_OK => {
                if !matches!(self.close_rpc.resolve(Reply::new(method)), Resolution::Delivered) {
                    debug!("unsolicited connection.close-ok ignored");
                }
            }
            CONNECTION_BLOCKED => {
                let reason = ArgReader::new(method.arguments.clone(), "connection.blocked")
                    .short_str()
                    .unwrap_or_default();
                self.blocked.store(true, Ordering::Relaxed);
                warn!(%reason, "broker blocked publishing");
            }
            CONNECTION_UNBLOCKED => {
                self.blocked.store(false, Ordering::Relaxed);
                info!("broker unblocked publishing");
            }
            other => warn!(method = %other, "unexpected method on control channel dropped"),
        }
        Ok(())
    }
}

fn read_loop(shared: Arc<ConnectionShared>, mut reader: FrameReader<AmqpStream>) {
    debug!("reader started");
    loop {
        match reader.read_frame() {
            Ok(frame) => {
                shared.mark_received();
                if let Err(err) = shared.route(frame) {
                    shared.shutdown(ShutdownCause::Failure(err.to_string()));
                    break;
                }
                if shared.is_closed() {
                    break;
                }
            }
            Err(FrameError::Io(err))
                if err.kind() == ErrorKind::WouldBlock
                    || err.kind() == ErrorKind::TimedOut
                    || err.kind() == ErrorKind::Interrupted =>
            {
                continue;
            }
            Err(FrameError::ConnectionClosed) => {
                shared.shutdown(ShutdownCause::Failure(
                    "connection closed by broker".to_string(),
                ));
                break;
            }
            Err(err) => {
                shared.shutdown(ShutdownCause::Failure(format!("read failed: {err}")));
                break;
            }
        }
    }
    debug!("reader stopped");
}

#[derive(Default)]
struct Workers {
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    heartbeat_stop: Option<Sender<()>>,
}

/// An open AMQP connection.
///
/// Owns the socket: one background thread reads and routes every inbound
/// frame, one optional thread keeps the heartbeat, and all writes go through
/// a single lock. Dropping the connection tears it down without the close
/// handshake; call [`Connection::close`] for a graceful close.
pub struct Connection {
    shared: Arc<ConnectionShared>,
    workers: Mutex<Workers>,
}

impl Connection {
    /// Take over a stream on which the handshake has completed.
    pub(crate) fn start(
        reader: FrameReader<AmqpStream>,
        writer: FrameWriter<AmqpStream>,
        control: AmqpStream,
        negotiated: Negotiated,
        config: ConnectionConfig,
    ) -> Result<Self> {
        let max_payload = writer.config().max_payload_size;
        let shared = Arc::new(ConnectionShared {
            writer: Mutex::new(writer),
            control,
            channels: Mutex::new(HashMap::new()),
            state: Mutex::new(ConnectionState::Open),
            close_rpc: Rendezvous::new(CONTROL),
            tuning: negotiated.tuning,
            max_payload,
            server_properties: negotiated.server_properties,
            config,
            epoch: Instant::now(),
            last_sent_ms: AtomicU64::new(0),
            last_received_ms: AtomicU64::new(0),
            blocked: AtomicBool::new(false),
        });

        let connection = Self {
            shared: Arc::clone(&shared),
            workers: Mutex::new(Workers::default()),
        };

        let reader_shared = Arc::clone(&shared);
        let reader_thread = thread::Builder::new()
            .name("amqpmux-reader".to_string())
            .spawn(move || read_loop(reader_shared, reader))
            .map_err(TransportError::from)?;
        connection.workers.lock().reader = Some(reader_thread);

        let interval = shared.tuning.heartbeat;
        if !interval.is_zero() {
            let monitor =
                HeartbeatMonitor::new(interval, shared.config.heartbeat_timeout_multiplier);
            let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
            let hb_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name("amqpmux-heartbeat".to_string())
                .spawn(move || heartbeat::run(hb_shared, monitor, stop_rx));
            match spawned {
                Ok(handle) => {
                    let mut workers = connection.workers.lock();
                    workers.heartbeat = Some(handle);
                    workers.heartbeat_stop = Some(stop_tx);
                }
                Err(err) => {
                    shared.shutdown(ShutdownCause::Failure(format!(
                        "spawn heartbeat thread: {err}"
                    )));
                    connection.join_workers();
                    return Err(TransportError::from(err).into());
                }
            }
        }

        Ok(connection)
    }

    /// Open a new channel on the lowest free id.
    pub fn open_channel(&self) -> Result<Channel> {
        let (channel_shared, deliveries, notifications) = self.shared.register_channel()?;
        let id = channel_shared.id();
        let channel = Channel::new(
            Arc::clone(&channel_shared),
            Arc::clone(&self.shared),
            deliveries,
            notifications,
        );

        let outcome = channel.call(control::channel_open()).and_then(|reply| {
            if reply.method.is(CHANNEL_OPEN_OK) {
                Ok(())
            } else {
                Err(ClientError::UnexpectedReply {
                    sent: CHANNEL_OPEN,
                    got: reply.method.id(),
                })
            }
        });

        match outcome {
            Ok(()) => {
                debug!(channel = id, "channel opened");
                Ok(channel)
            }
            Err(err) => {
                self.shared.release_channel(id);
                channel_shared.shutdown(ShutdownCause::Failure(format!("open failed: {err}")));
                Err(err)
            }
        }
    }

    /// Close gracefully: send `connection.close`, wait up to the close
    /// timeout for `close-ok`, then close every channel and the socket.
    ///
    /// A missing `close-ok` is logged, not returned; the connection is
    /// closed either way.
    pub fn close(&self, reason: &str) -> Result<()> {
        let close = CloseReason::normal(reason).to_method(CONNECTION_CLOSE)?;
        {
            let mut state = self.shared.state.lock();
            match &*state {
                ConnectionState::Open => *state = ConnectionState::Closing,
                ConnectionState::Closing => {
                    return Err(ClientError::Closed(
                        "connection is already closing".to_string(),
                    ))
                }
                ConnectionState::Closed(cause) => return Err(cause.to_error("connection")),
            }
        }
        debug!(%reason, "closing connection");

        let token = self
            .shared
            .close_rpc
            .expect_replacing(ClientError::Closed("connection closing".to_string()));
        let timeout = self.shared.config.close_timeout;
        let outcome = self
            .shared
            .send_method(CONTROL, &close)
            .and_then(|()| self.shared.close_rpc.wait(token, timeout));

        self.shared
            .shutdown(ShutdownCause::Local(reason.to_string()));
        self.join_workers();

        match outcome {
            Ok(_) => Ok(()),
            Err(ClientError::Timeout(waited)) => {
                warn!(?waited, "no connection.close-ok from broker");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn join_workers(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        drop(workers.heartbeat_stop);
        for handle in [workers.heartbeat, workers.reader].into_iter().flatten() {
            if handle.thread().id() == thread::current().id() {
                continue;
            }
            if handle.join().is_err() {
                warn!("connection worker panicked");
            }
        }
    }

    /// Parameters agreed with the broker.
    pub fn tuning(&self) -> Tuning {
        self.shared.tuning
    }

    /// Properties the broker sent in `connection.start`.
    pub fn server_properties(&self) -> &FieldTable {
        &self.shared.server_properties
    }

    /// True while the broker has blocked publishing (resource alarm).
    pub fn is_blocked(&self) -> bool {
        self.shared.blocked.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<ShutdownCause> {
        match &*self.shared.state.lock() {
            ConnectionState::Closed(cause) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Number of channels currently registered.
    pub fn channel_count(&self) -> usize {
        self.shared.channels.lock().len()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.shared.config
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared
            .shutdown(ShutdownCause::Local("connection dropped".to_string()));
        self.join_workers();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.shared.config.host)
            .field("port", &self.shared.config.port)
            .field("tuning", &self.shared.tuning)
            .field("state", &*self.shared.state.lock())
            .field("channels", &self.channel_count())
            .finish()
    }
}
