use std::fmt;
use std::io;

use amqpmux_client::ClientError;
use amqpmux_frame::{ChecksumError, FrameError};
use amqpmux_transport::TransportError;

// Exit codes, sysexits-flavoured where one applies.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const PROTOCOL_ERROR: i32 = 40;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

/// Broker reply code for refused credentials or vhost access.
const ACCESS_REFUSED: u16 = 403;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Connect { source, .. } | TransportError::Io(source) => {
            io_error(context, source)
        }
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::PayloadTooLarge { .. } | FrameError::Malformed { .. } => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(PROTOCOL_ERROR, format!("{context}: {other}")),
    }
}

pub fn client_error(context: &str, err: ClientError) -> CliError {
    match err {
        ClientError::Transport(err) => transport_error(context, err),
        ClientError::Frame(err) => frame_error(context, err),
        ClientError::Timeout(_) | ClientError::HeartbeatTimeout(_) => {
            CliError::new(TIMEOUT, format!("{context}: {err}"))
        }
        ClientError::Protocol {
            code: ACCESS_REFUSED,
            ..
        } => CliError::new(PERMISSION_DENIED, format!("{context}: {err}")),
        ClientError::Protocol { .. }
        | ClientError::HandshakeFailed(_)
        | ClientError::UnexpectedReply { .. }
        | ClientError::UnexpectedFrame(_) => {
            CliError::new(PROTOCOL_ERROR, format!("{context}: {err}"))
        }
        ClientError::Config(_) | ClientError::Json(_) => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
        ClientError::Closed(_) => CliError::new(FAILURE, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

pub fn checksum_error(context: &str, err: ChecksumError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}
