use std::time::Duration;

use amqpmux_frame::MethodId;

/// Errors that can occur in connection and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] amqpmux_transport::TransportError),

    /// Frame-level error: malformed or truncated wire data.
    #[error("frame error: {0}")]
    Frame(#[from] amqpmux_frame::FrameError),

    /// Protocol negotiation failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The server closed the channel or connection with an error.
    #[error("server error {code} {text} (caused by {class_id}.{method_id})")]
    Protocol {
        code: u16,
        text: String,
        class_id: u16,
        method_id: u16,
    },

    /// No reply arrived in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The channel or connection is closed.
    #[error("closed: {0}")]
    Closed(String),

    /// Nothing was received from the broker for too long.
    #[error("no traffic from broker for {0:?} (heartbeat timeout)")]
    HeartbeatTimeout(Duration),

    /// Every channel id up to the negotiated channel-max is in use.
    #[error("no free channel id (channel-max {max})")]
    ChannelsExhausted { max: u16 },

    /// A synchronous call is already awaiting its reply on this channel.
    #[error("channel {0} already has an outstanding synchronous call")]
    RpcAlreadyPending(u16),

    /// The reply belongs to a different class than the request.
    #[error("unexpected reply {got} to {sent}")]
    UnexpectedReply { sent: MethodId, got: MethodId },

    /// A frame arrived that the protocol does not allow at this point.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Invalid connection configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// JSON configuration could not be parsed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ClientError {
    /// True for errors that end the scope (channel or connection) they occurred on.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Closed(_)
                | Self::Protocol { .. }
                | Self::HeartbeatTimeout(_)
                | Self::Transport(_)
                | Self::Frame(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
