//! miniperf - a small iperf-style UDP probe
//!
//! One side runs as server, the other as client. A TCP control channel
//! synchronises clocks and starts and stops the experiment; the client then
//! streams sequenced, paced UDP datagrams to the server, which measures
//! throughput, loss, reordering, corruption and jitter.
//!
//! # Features
//!
//! - Fixed big-endian wire formats for control messages and data packets
//! - Absolute-deadline rate pacing with batched sends
//! - Sampled payload integrity check
//! - Coarse clock offset estimate and optional one-way delay
//! - Text or JSON reports, optionally appended to a file
//! - Asynchronous I/O using tokio

pub mod batch_socket;
pub mod client;
pub mod clock_sync;
pub mod config;
pub mod control;
pub mod error;
pub mod interval_reporter;
pub mod measurements;
pub mod pacer;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod server;
pub mod session;
pub mod udp_packet;

pub use client::{Client, ClientSummary};
pub use config::{Config, Mode, DEFAULT_PORT};
pub use error::{Error, Result};
pub use measurements::{ExperimentStatistics, Report};
pub use sender::SenderSummary;
pub use server::Server;
pub use session::{Console, RunFlag};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
