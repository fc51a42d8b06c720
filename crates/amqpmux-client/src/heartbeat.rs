use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{debug, trace, warn};

use crate::connection::{ConnectionShared, ShutdownCause};

const MIN_TICK: Duration = Duration::from_millis(10);

/// Liveness as seen by the heartbeat monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// Traffic arrived within the last interval.
    Idle,
    /// Nothing arrived for at least one interval; waiting for the broker.
    AwaitingAck,
    /// Nothing arrived within the timeout. Terminal.
    Expired,
}

/// What the heartbeat thread should do after a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    None,
    Send,
    Expire,
}

/// Decides when to send heartbeats and when the peer is dead.
///
/// Pure state machine over "time since last frame sent" and "time since
/// last frame received"; the caller owns the clock.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    interval: Duration,
    timeout: Duration,
    state: HeartbeatState,
}

impl HeartbeatMonitor {
    /// `multiplier` missed intervals expire the connection.
    pub fn new(interval: Duration, multiplier: u32) -> Self {
        Self {
            interval,
            timeout: interval.saturating_mul(multiplier.max(1)),
            state: HeartbeatState::Idle,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn state(&self) -> HeartbeatState {
        self.state
    }

    /// How often the driving thread should poll.
    pub fn tick(&self) -> Duration {
        (self.interval / 2).max(MIN_TICK)
    }

    pub fn poll(&mut self, since_sent: Duration, since_received: Duration) -> HeartbeatAction {
        if self.state == HeartbeatState::Expired {
            return HeartbeatAction::None;
        }

        if since_received >= self.timeout {
            self.state = HeartbeatState::Expired;
            return HeartbeatAction::Expire;
        }

        self.state = if since_received >= self.interval {
            HeartbeatState::AwaitingAck
        } else {
            HeartbeatState::Idle
        };

        if since_sent >= self.interval {
            HeartbeatAction::Send
        } else {
            HeartbeatAction::None
        }
    }
}

/// Body of the heartbeat thread. Returns when `stop` fires or disconnects,
/// or after expiring the connection.
pub(crate) fn run(shared: Arc<ConnectionShared>, mut monitor: HeartbeatMonitor, stop: Receiver<()>) {
    debug!(
        interval_ms = monitor.interval().as_millis() as u64,
        timeout_ms = monitor.timeout().as_millis() as u64,
        "heartbeat started"
    );

    loop {
        match stop.recv_timeout(monitor.tick()) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        match monitor.poll(shared.since_sent(), shared.since_received()) {
            HeartbeatAction::None => {}
            HeartbeatAction::Send => match shared.send_heartbeat() {
                Ok(true) => trace!("heartbeat sent"),
                Ok(false) => trace!("write in flight, heartbeat skipped"),
                Err(_) => break,
            },
            HeartbeatAction::Expire => {
                warn!(
                    timeout_ms = monitor.timeout().as_millis() as u64,
                    "no traffic from broker, closing connection"
                );
                shared.shutdown(ShutdownCause::HeartbeatTimeout(monitor.timeout()));
                break;
            }
        }
    }

    debug!("heartbeat stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEC: Duration = Duration::from_secs(1);

    #[test]
    fn sends_after_quiet_interval() {
        let mut hb = HeartbeatMonitor::new(10 * SEC, 2);
        assert_eq!(hb.poll(5 * SEC, SEC), HeartbeatAction::None);
        assert_eq!(hb.poll(10 * SEC, SEC), HeartbeatAction::Send);
        assert_eq!(hb.state(), HeartbeatState::Idle);
    }

    #[test]
    fn awaiting_ack_then_expired() {
        let mut hb = HeartbeatMonitor::new(10 * SEC, 2);
        assert_eq!(hb.poll(Duration::ZERO, 12 * SEC), HeartbeatAction::None);
        assert_eq!(hb.state(), HeartbeatState::AwaitingAck);

        assert_eq!(hb.poll(Duration::ZERO, 20 * SEC), HeartbeatAction::Expire);
        assert_eq!(hb.state(), HeartbeatState::Expired);

        // Expiry is reported once.
        assert_eq!(hb.poll(30 * SEC, 30 * SEC), HeartbeatAction::None);
    }

    #[test]
    fn traffic_returns_to_idle() {
        let mut hb = HeartbeatMonitor::new(10 * SEC, 3);
        hb.poll(Duration::ZERO, 15 * SEC);
        assert_eq!(hb.state(), HeartbeatState::AwaitingAck);
        hb.poll(Duration::ZERO, 2 * SEC);
        assert_eq!(hb.state(), HeartbeatState::Idle);
        assert_eq!(hb.timeout(), 30 * SEC);
    }

    #[test]
    fn tick_is_half_interval_with_floor() {
        assert_eq!(HeartbeatMonitor::new(10 * SEC, 2).tick(), 5 * SEC);
        assert_eq!(
            HeartbeatMonitor::new(Duration::from_millis(4), 2).tick(),
            MIN_TICK
        );
    }
}
