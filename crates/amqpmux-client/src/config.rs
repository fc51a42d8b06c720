use std::fmt;
use std::time::Duration;

use amqpmux_frame::{DEFAULT_FRAME_MAX, FRAME_MIN_SIZE};
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};

/// Resolved connection parameters, consumed once at dial time.
///
/// URI parsing lives outside the client; callers hand over an already
/// resolved configuration (built in code or deserialized from JSON).
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Broker host name or address.
    pub host: String,
    /// Broker port.
    pub port: u16,
    /// Virtual host to open.
    pub vhost: String,
    /// PLAIN mechanism user name.
    pub username: String,
    /// PLAIN mechanism password. Redacted in debug output.
    pub password: String,
    /// Heartbeat interval to ask for; the lower non-zero of ours and the
    /// server's wins. Zero disables heartbeats unless the server insists.
    #[serde(with = "duration_secs")]
    pub heartbeat: Duration,
    /// Largest frame we accept; zero means no limit.
    pub frame_max: u32,
    /// Highest channel id we will allocate; zero means no limit.
    pub channel_max: u16,
    /// TCP connect and handshake budget.
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
    /// Default wait for a synchronous reply.
    #[serde(with = "duration_millis")]
    pub rpc_timeout: Duration,
    /// Wait for close-ok during channel and connection close.
    #[serde(with = "duration_millis")]
    pub close_timeout: Duration,
    /// Missed intervals before the connection is declared dead.
    pub heartbeat_timeout_multiplier: u32,
    /// Locale sent in start-ok.
    pub locale: String,
    /// Optional connection name shown in broker management tools.
    pub connection_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat: Duration::from_secs(60),
            frame_max: DEFAULT_FRAME_MAX,
            channel_max: 2047,
            connect_timeout: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            heartbeat_timeout_multiplier: 2,
            locale: "en_US".to_string(),
            connection_name: None,
        }
    }
}

impl ConnectionConfig {
    /// Configuration for `host:port` with every other field defaulted.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol or the client cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(ClientError::Config("host must not be empty".to_string()));
        }
        if self.frame_max != 0 && (self.frame_max as usize) < FRAME_MIN_SIZE {
            return Err(ClientError::Config(format!(
                "frame_max {} is below the protocol minimum {FRAME_MIN_SIZE}",
                self.frame_max
            )));
        }
        if self.heartbeat.as_secs() > u64::from(u16::MAX) {
            return Err(ClientError::Config(format!(
                "heartbeat {:?} does not fit the 16-bit seconds field",
                self.heartbeat
            )));
        }
        if self.heartbeat_timeout_multiplier == 0 {
            return Err(ClientError::Config(
                "heartbeat_timeout_multiplier must be at least 1".to_string(),
            ));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("rpc_timeout", self.rpc_timeout),
            ("close_timeout", self.close_timeout),
        ] {
            if value.is_zero() {
                return Err(ClientError::Config(format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    /// SASL PLAIN response: `\0user\0password`.
    pub(crate) fn plain_response(&self) -> Vec<u8> {
        let mut response = Vec::with_capacity(2 + self.username.len() + self.password.len());
        response.push(0);
        response.extend_from_slice(self.username.as_bytes());
        response.push(0);
        response.extend_from_slice(self.password.as_bytes());
        response
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("vhost", &self.vhost)
            .field("username", &self.username)
            .field(
                "password",
                &format_args!("<redacted:{} bytes>", self.password.len()),
            )
            .field("heartbeat", &self.heartbeat)
            .field("frame_max", &self.frame_max)
            .field("channel_max", &self.channel_max)
            .field("connect_timeout", &self.connect_timeout)
            .field("rpc_timeout", &self.rpc_timeout)
            .field("close_timeout", &self.close_timeout)
            .field(
                "heartbeat_timeout_multiplier",
                &self.heartbeat_timeout_multiplier,
            )
            .field("locale", &self.locale)
            .field("connection_name", &self.connection_name)
            .finish()
    }
}

pub(crate) mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
