use std::time::Duration;

use amqpmux_frame::{FrameConfig, FrameReader, FrameWriter};
use amqpmux_transport::{AmqpStream, TcpTransport};
use tracing::info;

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::handshake::handshake;

/// Socket read timeout while the handshake runs; the handshake checks its
/// own deadline between reads.
const HANDSHAKE_POLL: Duration = Duration::from_millis(250);

/// Connect to the broker named by `config` and open the connection.
pub fn dial(config: &ConnectionConfig) -> Result<Connection> {
    config.validate()?;
    let transport = TcpTransport::new(config.host.clone(), config.port, config.connect_timeout);
    let stream = transport.connect()?;
    dial_with_stream(stream, config)
}

/// Run the handshake over an already connected stream and open the
/// connection.
pub fn dial_with_stream(stream: AmqpStream, config: &ConnectionConfig) -> Result<Connection> {
    config.validate()?;

    let reader_stream = stream.try_clone()?;
    let control_stream = stream.try_clone()?;

    let frame_config = FrameConfig {
        read_timeout: Some(config.connect_timeout.min(HANDSHAKE_POLL)),
        write_timeout: Some(config.connect_timeout),
        ..FrameConfig::default()
    };
    let mut reader = FrameReader::with_config_stream(reader_stream, frame_config.clone())?;
    let mut writer = FrameWriter::with_config_stream(stream, frame_config)?;

    let negotiated = handshake(&mut reader, &mut writer, config)?;

    // The reader thread blocks indefinitely; liveness is the heartbeat's job.
    // A write stalled past the heartbeat timeout fails the connection; the
    // limit sits one interval beyond it so expiry is reported first.
    reader.set_read_timeout(None)?;
    writer.set_write_timeout(stalled_write_limit(
        negotiated.tuning.heartbeat,
        config.heartbeat_timeout_multiplier,
    ))?;
    let max_payload = FrameConfig::max_payload_for(negotiated.tuning.frame_max);
    reader.set_max_payload_size(max_payload);
    writer.set_max_payload_size(max_payload);

    info!(
        host = %config.host,
        port = config.port,
        vhost = %config.vhost,
        frame_max = negotiated.tuning.frame_max,
        heartbeat_secs = negotiated.tuning.heartbeat.as_secs(),
        "connection open"
    );

    Connection::start(reader, writer, control_stream, negotiated, config.clone())
}

fn stalled_write_limit(heartbeat: Duration, multiplier: u32) -> Option<Duration> {
    if heartbeat.is_zero() {
        None
    } else {
        Some(heartbeat.saturating_mul(multiplier.max(1).saturating_add(1)))
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use super::*;
    use crate::error::ClientError;

    #[test]
    fn stalled_writes_are_bounded_only_with_heartbeats() {
        assert_eq!(stalled_write_limit(Duration::ZERO, 2), None);
        assert_eq!(
            stalled_write_limit(Duration::from_secs(5), 2),
            Some(Duration::from_secs(15))
        );
        assert_eq!(
            stalled_write_limit(Duration::from_secs(5), 0),
            Some(Duration::from_secs(10))
        );
    }

    #[test]
    fn dial_rejects_invalid_config() {
        let config = ConnectionConfig {
            host: String::new(),
            ..ConnectionConfig::default()
        };
        assert!(matches!(dial(&config), Err(ClientError::Config(_))));
    }

    #[test]
    fn dial_refused_is_transport_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let config = ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            ..ConnectionConfig::new("127.0.0.1", port)
        };
        assert!(matches!(dial(&config), Err(ClientError::Transport(_))));
    }

    #[test]
    fn silent_server_times_out_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = ConnectionConfig {
            connect_timeout: Duration::from_millis(300),
            ..ConnectionConfig::new("127.0.0.1", port)
        };

        let err = dial(&config).unwrap_err();
        assert!(matches!(err, ClientError::Timeout(_)), "{err:?}");
        drop(listener);
    }
}
