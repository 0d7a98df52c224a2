use crate::clock_sync::{ClockSync, SYNC_TIMEOUT};
use crate::config::{Config, Mode};
use crate::control::{ControlChannel, SessionEvent};
use crate::interval_reporter::{run_reporter_task, IntervalReporter};
use crate::measurements::Report;
use crate::protocol::ExperimentParams;
use crate::sender::{SenderSummary, UdpSender};
use crate::session::{Console, RunFlag};
use crate::{Error, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpStream, UdpSocket};

/// How long the client waits for the server's STATS after stopping.
pub const STATS_TIMEOUT: Duration = Duration::from_secs(3);

/// Outcome of a client run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSummary {
    pub sender: SenderSummary,
    /// The server's receiver report, if it arrived in time
    pub server_report: Option<Report>,
    pub clock_offset_ns: i64,
    pub clock_skew_ns: i64,
    pub clock_synced: bool,
}

/// Sending side of an experiment.
///
/// Connects the control channel, synchronises clocks, starts the
/// experiment and streams datagrams to `port + 1` on the server.
///
/// # Examples
///
/// ```no_run
/// use miniperf::{Client, Config};
/// use std::time::Duration;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = Config::client("127.0.0.1".to_string(), 5201)
///     .with_bandwidth(10_000_000)
///     .with_duration(Duration::from_secs(5));
///
/// let summary = Client::new(config)?.run().await?;
/// println!("sent {} datagrams", summary.sender.packets_sent);
/// # Ok(())
/// # }
/// ```
pub struct Client {
    config: Config,
    console: Console,
    flag: RunFlag,
}

impl Client {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is not a valid client
    /// configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use miniperf::{Client, Config};
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201);
    /// let client = Client::new(config).expect("valid configuration");
    /// ```
    pub fn new(config: Config) -> Result<Self> {
        if config.mode != Mode::Client {
            return Err(Error::Config("Client requires client mode".to_string()));
        }
        config.validate()?;
        Ok(Self {
            config,
            console: Console::stdout(),
            flag: RunFlag::new(),
        })
    }

    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Handle for stopping the run from another task.
    pub fn run_flag(&self) -> RunFlag {
        self.flag.clone()
    }

    /// Runs one experiment against the configured server.
    ///
    /// # Errors
    ///
    /// Connect and bind failures, a server that disconnects before the
    /// experiment starts, and a failed sender are returned as errors.
    pub async fn run(&self) -> Result<ClientSummary> {
        let address = self
            .config
            .address
            .as_deref()
            .ok_or_else(|| Error::Config("Server address is required for client mode".to_string()))?;
        let port = self.config.port;

        let stream = TcpStream::connect((address, port))
            .await
            .map_err(|e| Error::Connection(format!("Failed to connect to {}:{}: {}", address, port, e)))?;
        let server = stream.peer_addr()?;
        let local_ip = stream.local_addr()?.ip();
        info!("Connected to {}", server);

        let udp = UdpSocket::bind((local_ip, 0)).await?;
        udp.connect((server.ip(), self.config.udp_port()?)).await?;
        let udp = Arc::new(udp);

        let mut channel = ControlChannel::from_tcp(stream, Mode::Client, self.flag.clone())?;
        let result = self.drive(&mut channel, udp).await;
        if let Err(e) = channel.stop() {
            warn!("Could not send stop: {}", e);
        }
        self.flag.stop();
        channel.shutdown().await;
        result
    }

    async fn drive(&self, channel: &mut ControlChannel, udp: Arc<UdpSocket>) -> Result<ClientSummary> {
        let synced = channel
            .wait_for(SYNC_TIMEOUT, |event| match event {
                SessionEvent::Synced { .. } => Some(()),
                _ => None,
            })
            .await
            .is_some();
        let clock = channel.clock();
        if synced {
            info!(
                "Clock sync: offset {} ns, skew {} ns",
                clock.offset_ns(),
                clock.skew_ns()
            );
        } else {
            warn!("Clock sync did not complete within {:?}, using previous estimate", SYNC_TIMEOUT);
        }
        if !self.flag.is_running() {
            return Err(Error::Connection("Server closed the control connection before the experiment started".to_string()));
        }

        let params = ExperimentParams::from_config(&self.config);
        channel.start(&params)?;

        let (reporter, reporter_rx) = IntervalReporter::new();
        let reporter_task = tokio::spawn(run_reporter_task(
            reporter_rx,
            self.console.clone(),
            self.config.json,
        ));

        let sender = UdpSender::new(udp, &self.config).with_reporter(reporter);
        let flag = self.flag.clone();
        let worker = tokio::spawn(async move { sender.run(&flag).await });

        let sent = match worker.await {
            Ok(result) => result,
            Err(e) => Err(Error::Test(format!("sender task failed: {}", e))),
        };
        let _ = reporter_task.await;

        if let Err(e) = channel.stop() {
            warn!("Could not send stop: {}", e);
        }
        let sender = sent?;

        let server_report = channel
            .wait_for(STATS_TIMEOUT, |event| match event {
                SessionEvent::PeerStats(report) => Some(report),
                _ => None,
            })
            .await;
        if server_report.is_none() {
            warn!("No statistics from the server within {:?}", STATS_TIMEOUT);
        }

        let summary = summarize(sender, server_report, channel.clock());
        self.print(&summary)?;
        Ok(summary)
    }

    fn print(&self, summary: &ClientSummary) -> Result<()> {
        if self.config.json {
            return self.console.json(summary);
        }

        let mut lines = vec![summary.sender.text_line()];
        if let Some(report) = &summary.server_report {
            lines.push("Server report:".to_string());
            lines.extend(report.text_lines());
        }
        self.console.block(&lines);
        Ok(())
    }
}

fn summarize(sender: SenderSummary, server_report: Option<Report>, clock: ClockSync) -> ClientSummary {
    ClientSummary {
        sender,
        server_report,
        clock_offset_ns: clock.offset_ns(),
        clock_skew_ns: clock.skew_ns(),
        clock_synced: clock.is_synced(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_rejects_server_config() {
        assert!(matches!(Client::new(Config::server(5201)), Err(Error::Config(_))));
    }

    #[test]
    fn test_new_validates() {
        let config = Config::client("127.0.0.1".to_string(), 5201).with_packet_size(5);
        assert!(Client::new(config).is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        // Grab a free port, then close it so nothing listens there
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let client = Client::new(Config::client("127.0.0.1".to_string(), port)).unwrap();
        assert!(matches!(client.run().await, Err(Error::Connection(_))));
    }
}
