use crate::udp_packet::DataHeader;
use crate::{Error, Result};
use log::warn;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default TCP control port. The data plane uses the next port up.
pub const DEFAULT_PORT: u16 = 5201;

/// Largest datagram the sender will emit, header included.
///
/// Chosen so a full packet plus IPv4/UDP headers stays under a 1500 byte MTU.
pub const MAX_PACKET_SIZE: usize = 1460;

/// Role of this process in the experiment.
///
/// Exactly one role is active per process; the enum makes "both" and
/// "neither" unrepresentable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Accepts the control connection and receives the UDP stream
    Server,
    /// Connects to the server and sends the UDP stream
    Client,
}

/// Configuration for a miniperf session.
///
/// Use [`Config::server`] or [`Config::client`] and the `with_*` builder
/// methods, then [`Config::validate`] before handing it to a coordinator.
///
/// # Examples
///
/// ## Client sending at 10 Mbit/s for 5 seconds
///
/// ```
/// use miniperf::Config;
/// use std::time::Duration;
///
/// let config = Config::client("192.168.1.100".to_string(), 5201)
///     .with_bandwidth(10_000_000)
///     .with_duration(Duration::from_secs(5))
///     .with_packet_size(1200);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.udp_port().unwrap(), 5202);
/// ```
///
/// ## Server
///
/// ```
/// use miniperf::Config;
///
/// let config = Config::server(5201);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server or client
    pub mode: Mode,

    /// Bind address (server) or peer address (client)
    pub address: Option<String>,

    /// TCP control port; UDP data uses `port + 1`
    pub port: u16,

    /// UDP datagram size in bytes, header included
    pub packet_size: usize,

    /// Target bandwidth in bits per second, 0 means unlimited
    pub bandwidth: u64,

    /// Requested parallel streams (only one is driven)
    pub streams: usize,

    /// Experiment duration, `None` runs until stopped
    pub duration: Option<Duration>,

    /// Measure one-way delay in addition to throughput
    pub measure_delay: bool,

    /// Delay before the first datagram is sent
    pub wait: Duration,

    /// Period of progress reports
    pub interval: Duration,

    /// Optional file the final report is appended to
    pub output: Option<PathBuf>,

    /// Emit the final report as JSON
    pub json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Client,
            address: None,
            port: DEFAULT_PORT,
            packet_size: MAX_PACKET_SIZE,
            bandwidth: 0,
            streams: 1,
            duration: None,
            measure_delay: false,
            wait: Duration::ZERO,
            interval: Duration::from_secs(1),
            output: None,
            json: false,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a server configuration listening on `port` (and `port + 1`
    /// for UDP).
    ///
    /// # Examples
    ///
    /// ```
    /// use miniperf::Config;
    ///
    /// let config = Config::server(6000);
    /// assert_eq!(config.port, 6000);
    /// ```
    pub fn server(port: u16) -> Self {
        Self {
            mode: Mode::Server,
            port,
            ..Default::default()
        }
    }

    /// Creates a client configuration targeting `address:port`.
    ///
    /// # Examples
    ///
    /// ```
    /// use miniperf::Config;
    ///
    /// let config = Config::client("10.0.0.2".to_string(), 5201);
    /// assert_eq!(config.address.as_deref(), Some("10.0.0.2"));
    /// ```
    pub fn client(address: String, port: u16) -> Self {
        Self {
            mode: Mode::Client,
            address: Some(address),
            port,
            ..Default::default()
        }
    }

    /// Sets the bind (server) or peer (client) address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Sets the UDP datagram size, header included.
    pub fn with_packet_size(mut self, size: usize) -> Self {
        self.packet_size = size;
        self
    }

    /// Sets the target bandwidth in bits per second (0 = unlimited).
    ///
    /// # Examples
    ///
    /// ```
    /// use miniperf::Config;
    ///
    /// let config = Config::client("127.0.0.1".to_string(), 5201)
    ///     .with_bandwidth(100_000_000); // 100 Mbps
    /// assert_eq!(config.bandwidth, 100_000_000);
    /// ```
    pub fn with_bandwidth(mut self, bandwidth: u64) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Sets the number of requested streams.
    pub fn with_streams(mut self, streams: usize) -> Self {
        self.streams = streams;
        self
    }

    /// Bounds the experiment to `duration`.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Runs until stopped.
    pub fn unlimited(mut self) -> Self {
        self.duration = None;
        self
    }

    /// Enables one-way delay measurement.
    pub fn with_measure_delay(mut self, measure_delay: bool) -> Self {
        self.measure_delay = measure_delay;
        self
    }

    /// Sets the pause before the first datagram.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait = wait;
        self
    }

    /// Sets the progress report interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Appends the final report to `path`.
    pub fn with_output(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = Some(path.into());
        self
    }

    /// Enables or disables JSON report output.
    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// UDP data-plane port, always one above the control port.
    pub fn udp_port(&self) -> Result<u16> {
        self.port.checked_add(1).ok_or_else(|| {
            Error::Config(format!(
                "port {} leaves no room for the UDP data port",
                self.port
            ))
        })
    }

    /// Checks the configuration before any socket is opened.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a client has no peer address, the port
    /// is 0 or 65535, the packet size falls outside
    /// `DataHeader::SIZE..=MAX_PACKET_SIZE`, or the stream count or report
    /// interval is zero.
    pub fn validate(&self) -> Result<()> {
        if self.mode == Mode::Client && self.address.is_none() {
            return Err(Error::Config(
                "Server address is required for client mode".to_string(),
            ));
        }

        if self.port == 0 {
            return Err(Error::Config("Port must be between 1 and 65534".to_string()));
        }
        self.udp_port()?;

        if self.packet_size < DataHeader::SIZE || self.packet_size > MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "Packet size must be between {} and {} bytes, got {}",
                DataHeader::SIZE,
                MAX_PACKET_SIZE,
                self.packet_size
            )));
        }

        if self.streams == 0 {
            return Err(Error::Config(
                "Number of streams must be positive".to_string(),
            ));
        }
        if self.streams > 1 {
            warn!(
                "{} streams requested; only a single stream is driven",
                self.streams
            );
        }

        if self.interval.is_zero() {
            return Err(Error::Config("Interval must be positive".to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.packet_size, MAX_PACKET_SIZE);
        assert_eq!(config.bandwidth, 0);
        assert_eq!(config.streams, 1);
        assert!(config.duration.is_none());
        assert_eq!(config.interval, Duration::from_secs(1));
    }

    #[test]
    fn test_client_requires_address() {
        let mut config = Config::client("127.0.0.1".to_string(), 5201);
        config.address = None;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_packet_size_bounds() {
        let base = Config::client("127.0.0.1".to_string(), 5201);
        assert!(base.clone().with_packet_size(DataHeader::SIZE).validate().is_ok());
        assert!(base.clone().with_packet_size(MAX_PACKET_SIZE).validate().is_ok());
        assert!(base.clone().with_packet_size(DataHeader::SIZE - 1).validate().is_err());
        assert!(base.with_packet_size(MAX_PACKET_SIZE + 1).validate().is_err());
    }

    #[test]
    fn test_port_needs_room_for_udp() {
        assert!(Config::server(65535).validate().is_err());
        assert!(Config::server(0).validate().is_err());
        assert_eq!(Config::server(65534).udp_port().unwrap(), 65535);
    }

    #[test]
    fn test_zero_streams_and_interval_rejected() {
        let config = Config::server(5201).with_streams(0);
        assert!(config.validate().is_err());

        let config = Config::server(5201).with_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_multiple_streams_accepted() {
        let config = Config::client("127.0.0.1".to_string(), 5201).with_streams(4);
        assert!(config.validate().is_ok());
    }
}
