use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use amqpmux_frame::method::{BASIC_GET_OK, CHANNEL_CLOSE, CHANNEL_CLOSE_OK, CHANNEL_FLOW_OK};
use amqpmux_frame::{body_frames, ContentHeader, Frame, FrameType, Method, Properties};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionShared, ShutdownCause};
use crate::control::{self, CloseReason, Notification};
use crate::delivery::{Delivery, Dispatcher};
use crate::error::{ClientError, Result};
use crate::rendezvous::{Reply, Rendezvous, Resolution};

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

struct Lifecycle {
    state: ChannelState,
    cause: Option<ShutdownCause>,
}

/// Routing-side state of one channel, shared between the application's
/// [`Channel`] handles and the connection's reader thread.
pub(crate) struct ChannelShared {
    id: u16,
    lifecycle: Mutex<Lifecycle>,
    rpc: Rendezvous,
    call_lock: Mutex<()>,
    dispatcher: Mutex<Dispatcher>,
    deliveries: Mutex<Option<Sender<Delivery>>>,
    notifications: Mutex<Option<Sender<Notification>>>,
    flow_active: AtomicBool,
}

impl ChannelShared {
    pub(crate) fn new(id: u16) -> (Arc<Self>, Receiver<Delivery>, Receiver<Notification>) {
        let (delivery_tx, delivery_rx) = crossbeam_channel::unbounded();
        let (notify_tx, notify_rx) = crossbeam_channel::unbounded();
        let shared = Arc::new(Self {
            id,
            lifecycle: Mutex::new(Lifecycle {
                state: ChannelState::Open,
                cause: None,
            }),
            rpc: Rendezvous::new(id),
            call_lock: Mutex::new(()),
            dispatcher: Mutex::new(Dispatcher::new(id)),
            deliveries: Mutex::new(Some(delivery_tx)),
            notifications: Mutex::new(Some(notify_tx)),
            flow_active: AtomicBool::new(true),
        });
        (shared, delivery_rx, notify_rx)
    }

    pub(crate) fn id(&self) -> u16 {
        self.id
    }

    fn state(&self) -> ChannelState {
        self.lifecycle.lock().state
    }

    fn scope(&self) -> String {
        format!("channel {}", self.id)
    }

    /// Error for an operation on a channel that has stopped.
    fn closed_error(&self) -> ClientError {
        match &self.lifecycle.lock().cause {
            Some(cause) => cause.to_error(&self.scope()),
            None => ClientError::Closed(format!("{} closed", self.scope())),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match self.state() {
            ChannelState::Open => Ok(()),
            ChannelState::Closing => Err(ClientError::Closed(format!("{} is closing", self.scope()))),
            ChannelState::Closed => Err(self.closed_error()),
        }
    }

    /// Move to `Closed`, fail the pending call, and end both queues.
    ///
    /// Deliveries already queued stay readable. Idempotent.
    pub(crate) fn shutdown(&self, cause: ShutdownCause) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ChannelState::Closed {
                return;
            }
            lifecycle.state = ChannelState::Closed;
            lifecycle.cause = Some(cause.clone());
        }

        self.rpc.abort(cause.to_error(&self.scope()));
        self.deliveries.lock().take();
        self.notifications.lock().take();
        self.dispatcher.lock().reset();
        debug!(channel = self.id, %cause, "channel closed");
    }

    /// Handle one inbound frame for this channel (reader thread).
    ///
    /// An error is a framing violation and fatal to the connection.
    pub(crate) fn handle_frame(&self, conn: &ConnectionShared, frame: Frame) -> Result<()> {
        let closing = self.state() != ChannelState::Open;

        match frame.kind {
            FrameType::Method => self.handle_method(conn, Method::decode(frame.payload)?, closing),
            // Content for a channel we are closing is discarded.
            FrameType::Header | FrameType::Body if closing => Ok(()),
            FrameType::Header => {
                let header = ContentHeader::decode(frame.payload)?;
                let done = self.dispatcher.lock().push_header(header)?;
                self.complete(done);
                Ok(())
            }
            FrameType::Body => {
                let done = self.dispatcher.lock().push_body(frame.payload)?;
                self.complete(done);
                Ok(())
            }
            FrameType::Heartbeat => Ok(()),
        }
    }

    fn handle_method(&self, conn: &ConnectionShared, method: Method, closing: bool) -> Result<()> {
        let id = method.id();
        trace!(channel = self.id, method = %id, "received");

        match id {
            CHANNEL_CLOSE => {
                let reason = CloseReason::decode(&method)?;
                let _ = conn.send_method(self.id, &Method::new(CHANNEL_CLOSE_OK, Bytes::new()));
                conn.release_channel(self.id);
                warn!(
                    channel = self.id,
                    code = reason.reply_code,
                    text = %reason.reply_text,
                    "channel closed by broker"
                );
                self.shutdown(ShutdownCause::Remote(reason));
            }
            CHANNEL_CLOSE_OK => {
                if !matches!(self.rpc.resolve(Reply::new(method)), Resolution::Delivered) {
                    debug!(channel = self.id, "unsolicited channel.close-ok ignored");
                }
            }
            _ if closing => {
                trace!(channel = self.id, method = %id, "dropped while closing");
            }
            _ if id.is_content_bearing() => self.dispatcher.lock().begin(method)?,
            _ if Notification::is_notification(id) => {
                self.dispatcher.lock().check_idle(id)?;
                let notification = Notification::decode(&method)?;
                if let Notification::Flow { active } = &notification {
                    self.flow_active.store(*active, Ordering::Relaxed);
                    conn.send_method(self.id, &control::flow(CHANNEL_FLOW_OK, *active))?;
                    debug!(channel = self.id, active = *active, "flow control");
                }
                if let Some(tx) = self.notifications.lock().as_ref() {
                    let _ = tx.send(notification);
                }
            }
            _ => {
                self.dispatcher.lock().check_idle(id)?;
                self.offer_reply(Reply::new(method));
            }
        }
        Ok(())
    }

    fn offer_reply(&self, reply: Reply) {
        match self.rpc.resolve(reply) {
            Resolution::Delivered => {}
            Resolution::Stale(reply) => debug!(
                channel = self.id,
                method = %reply.method.id(),
                "reply to a timed-out call dropped"
            ),
            Resolution::Unclaimed(reply) => warn!(
                channel = self.id,
                method = %reply.method.id(),
                "reply without a pending call dropped"
            ),
        }
    }

    fn complete(&self, delivery: Option<Delivery>) {
        let Some(delivery) = delivery else {
            return;
        };

        if delivery.kind() == BASIC_GET_OK {
            self.offer_reply(Reply {
                method: delivery.method.clone(),
                content: Some(delivery),
            });
            return;
        }

        trace!(
            channel = self.id,
            bytes = delivery.body.len(),
            "delivery queued"
        );
        if let Some(tx) = self.deliveries.lock().as_ref() {
            let _ = tx.send(delivery);
        }
    }
}

/// A logical channel multiplexed over a [`Connection`](crate::Connection).
///
/// Handles are cheap to clone; clones share the same channel, the same
/// delivery queue, and the same one-call-at-a-time slot.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
    conn: Arc<ConnectionShared>,
    deliveries: Receiver<Delivery>,
    notifications: Receiver<Notification>,
}

impl Channel {
    pub(crate) fn new(
        shared: Arc<ChannelShared>,
        conn: Arc<ConnectionShared>,
        deliveries: Receiver<Delivery>,
        notifications: Receiver<Notification>,
    ) -> Self {
        Self {
            shared,
            conn,
            deliveries,
            notifications,
        }
    }

    pub fn id(&self) -> u16 {
        self.shared.id
    }

    pub fn state(&self) -> ChannelState {
        self.shared.state()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    /// Why the channel closed, once it has.
    pub fn close_reason(&self) -> Option<ShutdownCause> {
        self.shared.lifecycle.lock().cause.clone()
    }

    /// Send a synchronous method and wait for its reply, bounded by the
    /// configured RPC timeout.
    pub fn call(&self, method: Method) -> Result<Reply> {
        self.call_timeout(method, self.conn.config().rpc_timeout)
    }

    /// Send a synchronous method and wait up to `timeout` for its reply.
    ///
    /// Calls on the same channel run one at a time; a concurrent caller
    /// waits here until the current call has resolved. After a timeout the
    /// reply still owed to this call is discarded when it arrives, so it
    /// cannot answer a later call. A reply that is not the response to
    /// `method` fails with `UnexpectedReply`.
    pub fn call_timeout(&self, method: Method, timeout: Duration) -> Result<Reply> {
        let _serial = self.shared.call_lock.lock();
        self.shared.ensure_open()?;

        let token = self.shared.rpc.expect()?;
        // Shutdown marks the state before aborting the slot.
        if let Err(err) = self.shared.ensure_open() {
            self.shared.rpc.cancel(&token);
            return Err(err);
        }
        if let Err(err) = self.conn.send_method(self.id(), &method) {
            self.shared.rpc.cancel(&token);
            return Err(err);
        }

        let reply = self.shared.rpc.wait(token, timeout)?;
        if !reply.method.id().is_reply_to(method.id()) {
            return Err(ClientError::UnexpectedReply {
                sent: method.id(),
                got: reply.method.id(),
            });
        }
        Ok(reply)
    }

    /// Send a method that has no reply (`basic.ack`, `basic.qos` with
    /// no-wait, and so on).
    pub fn send(&self, method: &Method) -> Result<()> {
        self.shared.ensure_open()?;
        self.conn.send_method(self.id(), method)
    }

    /// Publish content: the method frame, the content header, and the body
    /// split at the negotiated frame size, written as one unit.
    ///
    /// Flow control is advisory here. A channel paused by the broker's
    /// `channel.flow` still publishes; callers that honour the pause check
    /// [`is_flow_active`](Self::is_flow_active) or watch for
    /// [`Notification::Flow`] first.
    pub fn publish(&self, method: &Method, properties: Properties, body: Bytes) -> Result<()> {
        self.shared.ensure_open()?;
        if !self.is_flow_active() {
            debug!(channel = self.id(), "publishing while broker flow is paused");
        }

        let id = self.id();
        let header = ContentHeader::new(method.class_id, body.len() as u64, properties);
        let chunks = body_frames(id, &body, self.conn.max_payload());
        let mut frames = Vec::with_capacity(2 + chunks.len());
        frames.push(Frame::method(id, method));
        frames.push(Frame::header(id, &header));
        frames.extend(chunks);
        self.conn.write_frames(&frames)
    }

    /// Next delivery, blocking until one arrives.
    ///
    /// Returns the close error once the channel is closed and every queued
    /// delivery has been taken.
    pub fn receive(&self) -> Result<Delivery> {
        self.deliveries.recv().map_err(|_| self.shared.closed_error())
    }

    pub fn receive_timeout(&self, timeout: Duration) -> Result<Delivery> {
        match self.deliveries.recv_timeout(timeout) {
            Ok(delivery) => Ok(delivery),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(self.shared.closed_error()),
        }
    }

    /// Next delivery if one is queued.
    pub fn try_receive(&self) -> Result<Option<Delivery>> {
        match self.deliveries.try_recv() {
            Ok(delivery) => Ok(Some(delivery)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(self.shared.closed_error()),
        }
    }

    /// Queue of broker notifications (confirms, consumer cancels, flow).
    pub fn notifications(&self) -> &Receiver<Notification> {
        &self.notifications
    }

    pub fn next_notification(&self, timeout: Duration) -> Result<Notification> {
        match self.notifications.recv_timeout(timeout) {
            Ok(notification) => Ok(notification),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(self.shared.closed_error()),
        }
    }

    /// False while the broker has paused this channel with `channel.flow`.
    pub fn is_flow_active(&self) -> bool {
        self.shared.flow_active.load(Ordering::Relaxed)
    }

    /// Close gracefully.
    ///
    /// Any call in flight fails with `Closed`. Waits up to the close timeout
    /// for `close-ok`; the channel is closed afterwards either way.
    pub fn close(&self, reason: &str) -> Result<()> {
        let id = self.id();
        let close = CloseReason::normal(reason).to_method(CHANNEL_CLOSE)?;
        {
            let mut lifecycle = self.shared.lifecycle.lock();
            match lifecycle.state {
                ChannelState::Open => lifecycle.state = ChannelState::Closing,
                ChannelState::Closing => {
                    return Err(ClientError::Closed(format!("channel {id} is already closing")))
                }
                ChannelState::Closed => {
                    drop(lifecycle);
                    return Err(self.shared.closed_error());
                }
            }
        }
        debug!(channel = id, %reason, "closing channel");

        self.shared.dispatcher.lock().reset();
        let token = self
            .shared
            .rpc
            .expect_replacing(ClientError::Closed(format!("channel {id} closing")));
        let timeout = self.conn.config().close_timeout;
        let outcome = self
            .conn
            .send_method(id, &close)
            .and_then(|()| self.shared.rpc.wait(token, timeout));

        self.conn.release_channel(id);
        self.shared
            .shutdown(ShutdownCause::Local(reason.to_string()));

        match outcome {
            Ok(_) => Ok(()),
            Err(ClientError::Timeout(waited)) => {
                warn!(channel = id, ?waited, "no channel.close-ok from broker");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("queued", &self.deliveries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shutdown_keeps_queued_deliveries() {
        let (shared, deliveries, _notes) = ChannelShared::new(5);
        let delivery = {
            let mut d = Dispatcher::new(5);
            d.begin(
                control::BasicDeliver {
                    consumer_tag: "c".into(),
                    delivery_tag: 1,
                    redelivered: false,
                    exchange: String::new(),
                    routing_key: "q".into(),
                }
                .to_method()
                .unwrap(),
            )
            .unwrap();
            d.push_header(ContentHeader::new(60, 0, Properties::default()))
                .unwrap()
        };
        shared.complete(delivery);
        shared.shutdown(ShutdownCause::Local("done".into()));

        assert_eq!(deliveries.recv().unwrap().delivery_tag, Some(1));
        assert!(deliveries.recv().is_err());
        assert!(matches!(
            shared.closed_error(),
            ClientError::Closed(msg) if msg == "channel 5 closed: done"
        ));
    }

    #[test]
    fn shutdown_is_idempotent_and_keeps_first_cause() {
        let (shared, _d, _n) = ChannelShared::new(1);
        shared.shutdown(ShutdownCause::HeartbeatTimeout(Duration::from_secs(2)));
        shared.shutdown(ShutdownCause::Local("later".into()));
        assert!(matches!(
            shared.closed_error(),
            ClientError::HeartbeatTimeout(_)
        ));
        assert!(shared.ensure_open().is_err());
    }

    #[test]
    fn shutdown_aborts_pending_call() {
        let (shared, _d, _n) = ChannelShared::new(2);
        let token = shared.rpc.expect().unwrap();
        shared.shutdown(ShutdownCause::Failure("socket reset".into()));
        let err = shared.rpc.wait(token, Duration::from_secs(1)).unwrap_err();
        assert!(matches!(err, ClientError::Closed(msg) if msg.contains("socket reset")));
    }
}
