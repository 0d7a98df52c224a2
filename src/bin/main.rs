use clap::{Parser, Subcommand};
use log::{info, warn};
use miniperf::{Client, Config, Console, RunFlag, Server, DEFAULT_PORT};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "miniperf")]
#[command(about = "A small iperf-style UDP probe with a TCP control channel", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode (receives the UDP stream)
    Server {
        /// Address to bind
        #[arg(short = 'a', long)]
        address: Option<String>,

        /// Control port; data uses the next port up
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Interval for periodic reports in seconds
        #[arg(short, long, default_value = "1")]
        interval: f64,

        /// Append the final report to this file
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },

    /// Run in client mode (sends the UDP stream)
    Client {
        /// Server address to connect to
        server: String,

        /// Control port; data uses the next port up
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Datagram size in bytes, header included
        #[arg(short = 'l', long, default_value_t = miniperf::config::MAX_PACKET_SIZE)]
        length: usize,

        /// Target bandwidth in bits/sec, K/M/G suffixes allowed (0 = unlimited)
        #[arg(short, long, default_value = "0", value_parser = parse_rate)]
        bandwidth: u64,

        /// Number of parallel streams (only one is driven)
        #[arg(short = 'n', long, default_value = "1")]
        streams: usize,

        /// Test duration in seconds (absent or 0 = until interrupted)
        #[arg(short = 't', long)]
        time: Option<f64>,

        /// Measure one-way delay
        #[arg(short = 'd', long)]
        delay: bool,

        /// Seconds to wait before sending
        #[arg(short = 'w', long, default_value = "0")]
        wait: f64,

        /// Interval for periodic reports in seconds
        #[arg(short, long, default_value = "1")]
        interval: f64,

        /// Append the final report to this file
        #[arg(short = 'f', long)]
        file: Option<PathBuf>,

        /// Output in JSON format
        #[arg(short = 'J', long)]
        json: bool,
    },
}

/// Parses a bit rate such as `500000`, `100K`, `10M` or `1.5G`.
fn parse_rate(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let (number, scale) = match s.chars().last() {
        Some('k' | 'K') => (&s[..s.len() - 1], 1e3),
        Some('m' | 'M') => (&s[..s.len() - 1], 1e6),
        Some('g' | 'G') => (&s[..s.len() - 1], 1e9),
        _ => (s, 1.0),
    };
    let value: f64 = number.parse().map_err(|_| format!("invalid bit rate '{}'", s))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid bit rate '{}'", s));
    }
    Ok((value * scale) as u64)
}

fn seconds(value: f64) -> Duration {
    if value.is_finite() && value > 0.0 {
        Duration::from_secs_f64(value)
    } else {
        Duration::ZERO
    }
}

/// How long exit waits on a confirmation prompt still blocked on stdin.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

/// Reads one answer line; only "y" (any case) confirms.
fn read_confirmation(input: &mut impl BufRead) -> bool {
    let mut answer = String::new();
    input.read_line(&mut answer).is_ok() && answer.trim().eq_ignore_ascii_case("y")
}

/// Asks for confirmation on every Ctrl-C; clears the flag on "y".
async fn watch_interrupts(flag: RunFlag) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Cannot listen for Ctrl-C");
            return;
        }
        let confirmed = tokio::task::spawn_blocking(|| {
            print!("\nStop the experiment? [y/N] ");
            let _ = std::io::stdout().flush();
            read_confirmation(&mut std::io::stdin().lock())
        })
        .await
        .unwrap_or(false);

        if confirmed {
            info!("Stopping on user request");
            flag.stop();
            return;
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let result = runtime.block_on(run(cli));
    close_runtime(runtime);
    result
}

/// A prompt left open on stdin cannot be cancelled, so the runtime is not
/// allowed to wait for it.
fn close_runtime(runtime: tokio::runtime::Runtime) {
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Server {
            address,
            port,
            interval,
            file,
            json,
        } => {
            let mut config = Config::server(port)
                .with_interval(seconds(interval))
                .with_json(json);
            config.address = address;
            config.output = file;

            let console = Console::open(config.output.as_deref())?;
            let server = Server::new(config).with_console(console);
            let interrupts = tokio::spawn(watch_interrupts(server.run_flag()));

            let result = server.run().await;
            interrupts.abort();
            result?;
        }

        Commands::Client {
            server,
            port,
            length,
            bandwidth,
            streams,
            time,
            delay,
            wait,
            interval,
            file,
            json,
        } => {
            let mut config = Config::client(server, port)
                .with_packet_size(length)
                .with_bandwidth(bandwidth)
                .with_streams(streams)
                .with_measure_delay(delay)
                .with_wait(seconds(wait))
                .with_interval(seconds(interval))
                .with_json(json);
            config.duration = time.map(seconds).filter(|d| !d.is_zero());
            config.output = file;

            let console = Console::open(config.output.as_deref())?;
            let client = Client::new(config)?.with_console(console);
            let interrupts = tokio::spawn(watch_interrupts(client.run_flag()));

            let result = client.run().await;
            interrupts.abort();
            result?;
        }
    }

    Ok(())
}
