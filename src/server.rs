use crate::config::{Config, Mode};
use crate::control::{ControlChannel, SessionEvent};
use crate::interval_reporter::{run_reporter_task, IntervalReporter};
use crate::measurements::Report;
use crate::protocol::{ControlMessage, ExperimentParams};
use crate::receiver::UdpReceiver;
use crate::session::{Console, RunFlag};
use crate::{Error, Result};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, UdpSocket};

/// Receiving side of an experiment.
///
/// Binds the control port and the data port (`port + 1`) up front, serves
/// one client session, and returns the receiver's report.
///
/// # Examples
///
/// ```no_run
/// use miniperf::{Config, Server};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let server = Server::new(Config::server(5201));
///
/// if let Some(report) = server.run().await? {
///     println!("{} datagrams lost", report.lost_packets);
/// }
/// # Ok(())
/// # }
/// ```
pub struct Server {
    config: Config,
    console: Console,
    flag: RunFlag,
}

impl Server {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            console: Console::stdout(),
            flag: RunFlag::new(),
        }
    }

    /// Sends reports to `console` instead of plain stdout.
    pub fn with_console(mut self, console: Console) -> Self {
        self.console = console;
        self
    }

    /// Handle for stopping the session from another task.
    pub fn run_flag(&self) -> RunFlag {
        self.flag.clone()
    }

    /// Serves a single session.
    ///
    /// Returns `Ok(None)` when the session ends before an experiment ran
    /// (stopped while waiting, or the client left before START).
    ///
    /// # Errors
    ///
    /// Configuration and socket setup failures are returned before any
    /// client is accepted. Invalid experiment parameters from the client
    /// and a failed receiver are returned after the session is torn down.
    pub async fn run(&self) -> Result<Option<Report>> {
        if self.config.mode != Mode::Server {
            return Err(Error::Config("Server requires server mode".to_string()));
        }
        self.config.validate()?;

        let host = self.config.address.as_deref().unwrap_or("0.0.0.0");
        let listener = TcpListener::bind((host, self.config.port)).await?;
        let udp = Arc::new(UdpSocket::bind((host, self.config.udp_port()?)).await?);
        info!(
            "Server listening on {} (control) and {} (data)",
            listener.local_addr()?,
            udp.local_addr()?
        );

        let (stream, peer) = tokio::select! {
            accepted = listener.accept() => accepted?,
            _ = self.flag.stopped() => {
                info!("Stopped before a client connected");
                return Ok(None);
            }
        };
        drop(listener);
        info!("Client connected from {}", peer);

        let mut channel = ControlChannel::from_tcp(stream, Mode::Server, self.flag.clone())?;
        let result = self.serve(&mut channel, udp, peer).await;
        if let Err(e) = channel.stop() {
            warn!("Could not send stop to {}: {}", peer, e);
        }
        self.flag.stop();
        channel.shutdown().await;
        info!("Session with {} closed", peer);
        result
    }

    async fn serve(
        &self,
        channel: &mut ControlChannel,
        udp: Arc<UdpSocket>,
        peer: SocketAddr,
    ) -> Result<Option<Report>> {
        let Some((params, clock_offset)) = self.wait_for_start(channel).await else {
            info!("{} left before starting an experiment", peer);
            return Ok(None);
        };

        if let Err(e) = params.validate() {
            error!("Rejecting experiment from {}: {}", peer, e);
            return Err(e);
        }
        if params.streams > 1 {
            warn!("Client asked for {} streams; receiving a single stream", params.streams);
        }
        info!(
            "Experiment started: {} byte datagrams, {}, clock offset {} ns",
            params.packet_size,
            match params.duration() {
                Some(d) => format!("{:.1}s", d.as_secs_f64()),
                None => "until stopped".to_string(),
            },
            clock_offset
        );

        let (reporter, reporter_rx) = IntervalReporter::new();
        let reporter_task = tokio::spawn(run_reporter_task(
            reporter_rx,
            self.console.clone(),
            self.config.json,
        ));

        let receiver = UdpReceiver::new(udp, &params, clock_offset).with_reporter(self.config.interval, reporter);
        let flag = self.flag.clone();
        let worker = tokio::spawn(async move { receiver.run(&flag).await });

        let stats = match worker.await {
            Ok(result) => result,
            Err(e) => Err(Error::Test(format!("receiver task failed: {}", e))),
        };
        let _ = reporter_task.await;
        let stats = stats?;

        let report = stats.report();
        if self.config.json {
            self.console.json(&report)?;
        } else {
            self.console.block(&report.text_lines());
        }

        if let Err(e) = ControlMessage::stats(&report).and_then(|msg| channel.send(msg)) {
            warn!("Could not send statistics to {}: {}", peer, e);
        }

        Ok(Some(report))
    }

    /// Waits for START, a disconnect, or a local stop.
    async fn wait_for_start(&self, channel: &mut ControlChannel) -> Option<(ExperimentParams, i64)> {
        loop {
            tokio::select! {
                event = channel.next_event() => match event {
                    Some(SessionEvent::Start { params, clock_offset }) => return Some((params, clock_offset)),
                    Some(SessionEvent::Stopped) | Some(SessionEvent::Disconnected) | None => return None,
                    Some(other) => info!("Ignoring {:?} before start", other),
                },
                _ = self.flag.stopped() => return None,
            }
        }
    }
}
