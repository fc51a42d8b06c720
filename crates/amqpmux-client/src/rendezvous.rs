use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use amqpmux_frame::Method;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendError, Sender, TryRecvError};
use parking_lot::Mutex;

use crate::delivery::Delivery;
use crate::error::{ClientError, Result};

/// The inbound half of a synchronous call.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    /// The reply method.
    pub method: Method,
    /// Content that followed the method (`basic.get-ok` only).
    pub content: Option<Delivery>,
}

impl Reply {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            content: None,
        }
    }
}

struct Pending {
    seq: u64,
    tx: Sender<Result<Reply>>,
}

#[derive(Default)]
struct Slot {
    pending: Option<Pending>,
    /// Calls that timed out before their reply arrived. The broker still
    /// answers them, in order, ahead of any later call.
    abandoned: u32,
}

/// Ticket returned by [`Rendezvous::expect`]; redeemed with [`Rendezvous::wait`].
#[derive(Debug)]
pub struct RpcToken {
    seq: u64,
    rx: Receiver<Result<Reply>>,
}

/// What became of a reply offered to [`Rendezvous::resolve`].
#[derive(Debug)]
pub enum Resolution {
    /// Handed to the waiting caller.
    Delivered,
    /// Answer to a call that already timed out; nobody receives it.
    Stale(Reply),
    /// Nobody was waiting.
    Unclaimed(Reply),
}

/// Single-slot meeting point between a caller awaiting a reply and the
/// reader thread that receives it.
///
/// At most one reply is expected at a time. The slot is cleared by whichever
/// of `resolve`, `abort`, or `cancel` gets to it first, so a reply can only
/// ever reach the caller that registered for it. Replies owed to timed-out
/// calls are counted and swallowed before the next caller is resolved.
pub struct Rendezvous {
    channel: u16,
    slot: Mutex<Slot>,
    next_seq: AtomicU64,
}

impl Rendezvous {
    pub fn new(channel: u16) -> Self {
        Self {
            channel,
            slot: Mutex::new(Slot::default()),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Register interest in the next reply.
    ///
    /// Fails with `RpcAlreadyPending` if a reply is already expected.
    pub fn expect(&self) -> Result<RpcToken> {
        let mut slot = self.slot.lock();
        if slot.pending.is_some() {
            return Err(ClientError::RpcAlreadyPending(self.channel));
        }
        Ok(self.install(&mut slot))
    }

    /// Register interest, failing any current waiter with `displaced`.
    ///
    /// Close handshakes use this: their reply takes precedence over whatever
    /// call was in flight, and replies still owed to earlier calls are
    /// discarded by the closing side rather than counted here.
    pub fn expect_replacing(&self, displaced: ClientError) -> RpcToken {
        let mut slot = self.slot.lock();
        if let Some(previous) = slot.pending.take() {
            let _ = previous.tx.send(Err(displaced));
        }
        slot.abandoned = 0;
        self.install(&mut slot)
    }

    fn install(&self, slot: &mut Slot) -> RpcToken {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = crossbeam_channel::bounded(1);
        slot.pending = Some(Pending { seq, tx });
        RpcToken { seq, rx }
    }

    /// Offer `reply` to the waiting caller.
    ///
    /// A reply owed to a timed-out call is consumed as [`Resolution::Stale`]
    /// even when a newer caller is waiting.
    pub fn resolve(&self, reply: Reply) -> Resolution {
        let pending = {
            let mut slot = self.slot.lock();
            if slot.abandoned > 0 {
                slot.abandoned -= 1;
                return Resolution::Stale(reply);
            }
            slot.pending.take()
        };
        let Some(pending) = pending else {
            return Resolution::Unclaimed(reply);
        };
        match pending.tx.send(Ok(reply)) {
            Ok(()) | Err(SendError(Err(_))) => Resolution::Delivered,
            Err(SendError(Ok(reply))) => Resolution::Unclaimed(reply),
        }
    }

    /// Wake the waiting caller with `err`. Returns false if nobody waited.
    pub fn abort(&self, err: ClientError) -> bool {
        match self.slot.lock().pending.take() {
            Some(pending) => pending.tx.send(Err(err)).is_ok(),
            None => false,
        }
    }

    /// Withdraw `token` if it still owns the slot.
    ///
    /// For calls whose request never reached the broker.
    pub fn cancel(&self, token: &RpcToken) {
        self.withdraw(token, false);
    }

    fn withdraw(&self, token: &RpcToken, owed: bool) -> bool {
        let mut slot = self.slot.lock();
        if slot
            .pending
            .as_ref()
            .is_some_and(|pending| pending.seq == token.seq)
        {
            slot.pending = None;
            if owed {
                slot.abandoned = slot.abandoned.saturating_add(1);
            }
            true
        } else {
            false
        }
    }

    /// Block until the reply, an abort, or `timeout`.
    ///
    /// On timeout the slot is released so the next call can proceed, and the
    /// reply the broker still owes is recorded so it cannot reach that call.
    pub fn wait(&self, token: RpcToken, timeout: Duration) -> Result<Reply> {
        match token.rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                if self.withdraw(&token, true) {
                    return Err(ClientError::Timeout(timeout));
                }
                // Resolved or aborted between the timeout firing and the withdraw.
                match token.rx.try_recv() {
                    Ok(outcome) => outcome,
                    Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                        Err(ClientError::Timeout(timeout))
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed(format!(
                "channel {} dropped its pending reply",
                self.channel
            ))),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.slot.lock().pending.is_some()
    }

    /// Replies still owed to calls that timed out.
    pub fn abandoned(&self) -> u32 {
        self.slot.lock().abandoned
    }
}

impl std::fmt::Debug for Rendezvous {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rendezvous")
            .field("channel", &self.channel)
            .field("pending", &self.is_pending())
            .field("abandoned", &self.abandoned())
            .finish()
    }
}
