use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway: accept watch connections and broker commands.
    Serve(ServeArgs),
    /// Act as a watch: send one packet and optionally print the reply.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address watches connect to.
    #[arg(long, default_value = "0.0.0.0:8001", env = "KIDTRACKER_DEVICE_ADDR")]
    pub device_addr: String,
    /// Address of the debug listener, which only logs what it receives.
    #[arg(long, default_value = "0.0.0.0:8002", env = "KIDTRACKER_DEBUG_ADDR")]
    pub debug_addr: String,
    /// Do not start the debug listener.
    #[arg(long)]
    pub no_debug: bool,
    /// Read chunk size in bytes. A shorter read ends a frame.
    #[arg(long, default_value = "1024", env = "KIDTRACKER_CHUNK_SIZE")]
    pub chunk_size: usize,
    /// How long a read waits before the reader checks for shutdown (e.g. 200ms).
    #[arg(long, default_value = "200ms", env = "KIDTRACKER_POLL_INTERVAL")]
    pub poll_interval: String,
    /// Write timeout for commands sent to watches.
    #[arg(long, default_value = "10s", env = "KIDTRACKER_WRITE_TIMEOUT")]
    pub write_timeout: String,
    /// Digits in a confirmation token.
    #[arg(long, default_value = "6", env = "KIDTRACKER_TOKEN_LENGTH")]
    pub token_length: usize,
    /// How long a confirmation token stays valid.
    #[arg(long, default_value = "5m", env = "KIDTRACKER_TOKEN_TTL")]
    pub token_ttl: String,
    /// How long a command queued for an offline watch is kept.
    #[arg(long, default_value = "1h", env = "KIDTRACKER_DEVICE_JOB_TTL")]
    pub device_job_ttl: String,
    /// Interval between sweeps of closed connections and expired jobs.
    #[arg(long, default_value = "1m", env = "KIDTRACKER_CLEAN_INTERVAL")]
    pub clean_interval: String,
    /// JSON file listing the device ids to admit, e.g. `{"devices": ["8800000015"]}`.
    #[arg(long, value_name = "FILE", env = "KIDTRACKER_SEED")]
    pub seed: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Gateway address to connect to.
    pub addr: String,
    /// Device id to send as.
    #[arg(long, short = 'd', required_unless_present = "raw")]
    pub device: Option<String>,
    /// Manufacturer tag.
    #[arg(long, default_value = "3G", conflicts_with = "raw")]
    pub manufacturer: String,
    /// Message type.
    #[arg(long, short = 'k', default_value = "LK", conflicts_with = "raw")]
    pub kind: String,
    /// Message parameters (comma-separated).
    #[arg(long, value_delimiter = ',', conflicts_with = "raw")]
    pub params: Vec<String>,
    /// Send this text verbatim instead of building a packet.
    #[arg(long)]
    pub raw: Option<String>,
    /// Wait for one reply frame and print its packets.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for the reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `500ms`, `10s`, `5m`, `1h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, scale) = if let Some(num) = input.strip_suffix("ms") {
        (num, Duration::from_millis(1))
    } else if let Some(num) = input.strip_suffix('s') {
        (num, Duration::from_secs(1))
    } else if let Some(num) = input.strip_suffix('m') {
        (num, Duration::from_secs(60))
    } else if let Some(num) = input.strip_suffix('h') {
        (num, Duration::from_secs(3600))
    } else {
        (input, Duration::from_secs(1))
    };

    let value: u32 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    scale
        .checked_mul(value)
        .ok_or_else(|| CliError::new(USAGE, format!("duration out of range: {input}")))
}
