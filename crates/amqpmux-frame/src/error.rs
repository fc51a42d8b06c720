/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame header carries a type octet outside method/header/body/heartbeat.
    #[error("unknown frame type {0:#04x}")]
    UnknownFrameType(u8),

    /// The byte after the payload is not the frame-end sentinel.
    #[error("missing frame-end marker (found {found:#04x}, expected 0xce)")]
    MissingFrameEnd { found: u8 },

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A method or content-header payload could not be parsed.
    #[error("malformed {context}: {reason}")]
    Malformed {
        context: &'static str,
        reason: String,
    },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    pub(crate) fn malformed(context: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed {
            context,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
