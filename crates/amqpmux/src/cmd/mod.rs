use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod probe;
pub mod tag;
pub mod verify;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to a broker and print the negotiated parameters.
    Probe(ProbeArgs),
    /// Wrap a message body in a size and CRC-32 envelope.
    Tag(TagArgs),
    /// Check a size and CRC-32 envelope.
    Verify(VerifyArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Probe(args) => probe::run(args, format),
        Command::Tag(args) => tag::run(args, format),
        Command::Verify(args) => verify::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ProbeArgs {
    /// Broker address as host or host:port.
    pub target: String,
    /// Virtual host to open.
    #[arg(long, default_value = "/")]
    pub vhost: String,
    /// PLAIN user name.
    #[arg(long, env = "AMQPMUX_USER", default_value = "guest")]
    pub user: String,
    /// PLAIN password.
    #[arg(long, env = "AMQPMUX_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,
    /// Connect and handshake budget (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
    /// Heartbeat interval to request, in seconds. 0 disables.
    #[arg(long, default_value = "0")]
    pub heartbeat: u16,
}

#[derive(Args, Debug)]
pub struct TagArgs {
    /// File holding the message body.
    #[arg(required_unless_present = "random", conflicts_with = "random")]
    pub file: Option<PathBuf>,
    /// Tag this many random bytes instead of a file.
    #[arg(long, value_name = "BYTES")]
    pub random: Option<usize>,
    /// Write the envelope here instead of stdout.
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VerifyArgs {
    /// File holding a tagged envelope.
    pub file: PathBuf,
    /// Write the verified body to this path.
    #[arg(long, value_name = "PATH")]
    pub extract: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `250ms`, or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}
