//! Channel IDs.
//!
//! Channel 0 carries connection-level control traffic (handshake, close,
//! heartbeats). Application channels are numbered from 1 up to the
//! negotiated channel-max.

/// Connection management (handshake, heartbeat, connection close).
pub const CONTROL: u16 = 0;

/// First application channel ID.
pub const FIRST_CHANNEL: u16 = 1;

/// Highest channel ID the wire format can express.
pub const MAX_CHANNEL: u16 = u16::MAX;

/// Returns a human-readable name for a channel ID.
pub fn channel_name(id: u16) -> &'static str {
    match id {
        CONTROL => "CONTROL",
        _ => "APPLICATION",
    }
}

/// Returns true if the channel ID is the connection control channel.
pub fn is_control(id: u16) -> bool {
    id == CONTROL
}
