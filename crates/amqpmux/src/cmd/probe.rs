use std::time::{Duration, Instant};

use amqpmux_client::{dial, ConnectionConfig, Tuning};
use serde::Serialize;
use tracing::debug;

use crate::cmd::{parse_duration, ProbeArgs};
use crate::exit::{client_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_json, print_pretty, print_table, property_text, OutputFormat};

const DEFAULT_PORT: u16 = 5672;

#[derive(Serialize)]
struct ProbeOutput {
    host: String,
    port: u16,
    vhost: String,
    #[serde(flatten)]
    tuning: Tuning,
    product: Option<String>,
    version: Option<String>,
    platform: Option<String>,
    handshake_ms: f64,
    connected: bool,
}

impl ProbeOutput {
    fn rows(&self) -> Vec<(&'static str, String)> {
        let text = |v: &Option<String>| v.clone().unwrap_or_else(|| "unknown".to_string());
        vec![
            ("Broker", format!("{}:{}", self.host, self.port)),
            ("Virtual host", self.vhost.clone()),
            ("Product", text(&self.product)),
            ("Version", text(&self.version)),
            ("Platform", text(&self.platform)),
            ("Channel max", self.tuning.channel_max.to_string()),
            ("Frame max", self.tuning.frame_max.to_string()),
            ("Heartbeat", format!("{}s", self.tuning.heartbeat.as_secs())),
            ("Handshake", format!("{:.2}ms", self.handshake_ms)),
        ]
    }
}

pub fn run(args: ProbeArgs, format: OutputFormat) -> CliResult<i32> {
    let (host, port) = parse_target(&args.target)?;
    let timeout = parse_duration(&args.timeout)?;

    let config = ConnectionConfig {
        vhost: args.vhost.clone(),
        username: args.user,
        password: args.password,
        heartbeat: Duration::from_secs(u64::from(args.heartbeat)),
        connect_timeout: timeout,
        close_timeout: timeout,
        connection_name: Some("amqpmux probe".to_string()),
        ..ConnectionConfig::new(host.clone(), port)
    };

    let started = Instant::now();
    let conn = dial(&config).map_err(|err| client_error("connect failed", err))?;
    let handshake_ms = (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0;

    let props = conn.server_properties();
    let out = ProbeOutput {
        host,
        port,
        vhost: args.vhost,
        tuning: conn.tuning(),
        product: property_text(props, "product"),
        version: property_text(props, "version"),
        platform: property_text(props, "platform"),
        handshake_ms,
        connected: true,
    };

    if let Err(err) = conn.close("probe complete") {
        debug!(error = %err, "close after probe failed");
    }

    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => print_table(&out.rows()),
        OutputFormat::Pretty => print_pretty("Broker", &out.rows()),
        OutputFormat::Raw => println!(
            "{}:{} {} {} {}",
            out.host,
            out.port,
            out.tuning.channel_max,
            out.tuning.frame_max,
            out.tuning.heartbeat.as_secs()
        ),
    }
    Ok(SUCCESS)
}

/// Split `host`, `host:port`, or `[v6]:port`.
fn parse_target(target: &str) -> CliResult<(String, u16)> {
    let target = target.trim();
    let invalid = || CliError::new(USAGE, format!("invalid broker address: {target}"));

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
        match tail {
            "" => (host, None),
            _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
        }
    } else {
        match target.split_once(':') {
            Some((host, port)) if !port.contains(':') => (host, Some(port)),
            Some(_) => (target, None),
            None => (target, None),
        }
    };

    if host.is_empty() {
        return Err(invalid());
    }
    let port = match port {
        Some(port) => port.parse().map_err(|_| invalid())?,
        None => DEFAULT_PORT,
    };
    Ok((host.to_string(), port))
}
