//! Pipes stdin through a loopback echo channel.
//!
//! Every request is echoed back after a random delay, so responses resolve
//! out of order; stdout still receives the input unchanged and in order.
//!
//! # Usage
//!
//! ```sh
//! pullstream-loopback --buffer-size 64 --max-delay-ms 20 < input > output
//! ```

use std::io::{self, Read, Write};
use std::time::Duration;

use pullstream::channel::loopback::{LoopbackChannel, Reply};
use pullstream::{ClientStream, ConfigError, StreamConfig};

/// Default upper bound for the random echo delay.
const DEFAULT_MAX_DELAY_MS: u64 = 10;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

struct Args {
    config: StreamConfig,
    max_delay: Duration,
}

fn main() {
    pullstream::init_tracing();

    if let Err(e) = run() {
        eprintln!("pullstream-loopback: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), CliError> {
    let args: Vec<String> = std::env::args().collect();
    let Args { config, max_delay } = parse_args(&args)?;

    let mut input = Vec::new();
    io::stdin().read_to_end(&mut input)?;

    let max_delay_ms = u64::try_from(max_delay.as_millis()).unwrap_or(u64::MAX);
    let stream = ClientStream::connect(config, |responder| {
        LoopbackChannel::spawn(responder, move |payload| {
            let delay = if max_delay_ms == 0 {
                0
            } else {
                rand::random_range(0..=max_delay_ms)
            };
            Reply::data(payload.clone()).after(Duration::from_millis(delay))
        })
    })?;
    let (mut reader, mut writer) = stream.into_split();

    writer.write_all(&input)?;
    writer.close()?;

    let mut output = vec![0u8; input.len()];
    reader.read_exact(&mut output)?;
    reader.close();

    io::stdout().write_all(&output)?;
    Ok(())
}

/// Parses command line arguments into the stream configuration.
fn parse_args(args: &[String]) -> Result<Args, CliError> {
    let mut config = StreamConfig::default();
    let mut max_delay_ms = DEFAULT_MAX_DELAY_MS;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--buffer-size" | "-b" => {
                i += 1;
                config.write_buffer_size = parse_value(args, i, "--buffer-size")?;
            }
            "--max-delay-ms" | "-d" => {
                i += 1;
                max_delay_ms = parse_value(args, i, "--max-delay-ms")?;
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                return Err(CliError::Usage(format!("unknown argument: {other}")));
            }
        }
        i += 1;
    }

    config.validate()?;
    Ok(Args {
        config,
        max_delay: Duration::from_millis(max_delay_ms),
    })
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> Result<T, CliError> {
    let raw = args
        .get(i)
        .ok_or_else(|| CliError::Usage(format!("{flag} requires a value")))?;
    raw.parse()
        .map_err(|_| CliError::Usage(format!("invalid value for {flag}: {raw}")))
}

fn print_usage() {
    eprintln!(
        r"pullstream-loopback - echo stdin through an out-of-order loopback channel

USAGE:
    pullstream-loopback [OPTIONS] < input

OPTIONS:
    -b, --buffer-size <BYTES>    Write buffer size per request [default: 8192]
    -d, --max-delay-ms <MS>      Upper bound of the random echo delay [default: 10]
    -h, --help                   Print help"
    );
}
