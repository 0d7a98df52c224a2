//! UDP data-plane receiver.
//!
//! The receive loop never blocks longer than [`RECV_POLL_INTERVAL`], so it
//! notices duration expiry and a cleared run flag even on a silent socket.
//! It ends when:
//!
//! - a zero-length datagram arrives from the locked peer (or before any
//!   peer is locked),
//! - the experiment duration has passed since the first valid packet,
//! - a poll times out while the run flag is cleared (the socket has drained),
//! - or the run flag has been cleared for longer than [`DRAIN_LIMIT`] while
//!   datagrams keep arriving.

use crate::clock_sync::monotonic_ns;
use crate::interval_reporter::{IntervalClock, IntervalReporter};
use crate::measurements::{Arrival, ExperimentStatistics};
use crate::protocol::ExperimentParams;
use crate::session::RunFlag;
use crate::udp_packet::{parse_packet, verify_payload, DataHeader};
use crate::Result;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Longest single wait on the socket.
pub const RECV_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Upper bound on draining after a stop while the peer keeps sending.
pub const DRAIN_LIMIT: Duration = Duration::from_secs(1);

/// Outcome of feeding one datagram to the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    Valid(Arrival),
    Corrupt,
}

pub struct UdpReceiver {
    socket: Arc<UdpSocket>,
    packet_size: usize,
    duration: Option<Duration>,
    clock_offset: i64,
    stats: ExperimentStatistics,
    peer: Option<SocketAddr>,
    interval: Option<(IntervalClock, IntervalReporter)>,
}

impl UdpReceiver {
    /// `clock_offset` is the sender's estimate of how far this host's clock
    /// runs ahead of its own; it is only used for one-way delay.
    pub fn new(socket: Arc<UdpSocket>, params: &ExperimentParams, clock_offset: i64) -> Self {
        let stats = if params.measure_delay {
            ExperimentStatistics::new().with_delay()
        } else {
            ExperimentStatistics::new()
        };
        Self {
            socket,
            packet_size: params.packet_size.max(DataHeader::SIZE),
            duration: params.duration(),
            clock_offset,
            stats,
            peer: None,
            interval: None,
        }
    }

    pub fn with_reporter(mut self, period: Duration, reporter: IntervalReporter) -> Self {
        self.interval = Some((IntervalClock::new(period), reporter));
        self
    }

    pub fn statistics(&self) -> &ExperimentStatistics {
        &self.stats
    }

    /// Validates and accounts one datagram received at `arrival_ns`.
    pub fn ingest(&mut self, datagram: &[u8], arrival_ns: u64) -> Ingest {
        let Some((header, payload)) = parse_packet(datagram) else {
            self.stats.record_corrupt();
            return Ingest::Corrupt;
        };
        if !verify_payload(header.sequence, payload) {
            self.stats.record_corrupt();
            return Ingest::Corrupt;
        }

        let arrival = self.stats.record_packet(header.sequence, datagram.len(), arrival_ns);
        if self.stats.measures_delay() {
            let delay = arrival_ns as i128 - (header.timestamp_ns as i128 + self.clock_offset as i128);
            self.stats
                .record_delay(delay.clamp(i64::MIN as i128, i64::MAX as i128) as i64);
        }
        if let Arrival::Ahead(gap) = arrival {
            debug!("Sequence jumped to {}, {} counted lost", header.sequence, gap);
        }
        Ingest::Valid(arrival)
    }

    /// Receives until one of the exit conditions holds.
    ///
    /// # Errors
    ///
    /// A socket receive error ends the loop and is returned.
    pub async fn run(mut self, flag: &RunFlag) -> Result<ExperimentStatistics> {
        let result = self.receive_loop(flag).await;
        if let Some((_, reporter)) = &self.interval {
            reporter.complete();
        }
        result?;

        info!(
            "Receiver finished: {} datagrams, {} lost, {} out of order, {} corrupt",
            self.stats.packets_received,
            self.stats.lost_packets,
            self.stats.out_of_order,
            self.stats.corrupt_packets
        );
        Ok(self.stats)
    }

    async fn receive_loop(&mut self, flag: &RunFlag) -> Result<()> {
        let mut buf = vec![0u8; self.packet_size];
        let mut started: Option<Instant> = None;
        let mut stop_seen: Option<Instant> = None;

        if let Ok(addr) = self.socket.local_addr() {
            info!("Receiving datagrams on {}", addr);
        }

        loop {
            if let (Some(start), Some(limit)) = (started, self.duration) {
                if start.elapsed() >= limit {
                    debug!("Experiment duration reached");
                    break;
                }
            }
            if !flag.is_running() {
                let since = *stop_seen.get_or_insert_with(Instant::now);
                if since.elapsed() >= DRAIN_LIMIT {
                    warn!("Peer still sending {:?} after stop, giving up", DRAIN_LIMIT);
                    break;
                }
            }

            match timeout(RECV_POLL_INTERVAL, self.socket.recv_from(&mut buf)).await {
                Err(_) => {
                    if !flag.is_running() {
                        break;
                    }
                }
                Ok(Err(e)) => {
                    error!("UDP receive failed: {}", e);
                    return Err(e.into());
                }
                Ok(Ok((n, from))) => {
                    match self.peer {
                        Some(peer) if peer != from => {
                            debug!("Ignoring datagram from {}", from);
                            continue;
                        }
                        Some(_) => {}
                        None if n == 0 => {}
                        None => {
                            info!("Locked onto sender {}", from);
                            self.peer = Some(from);
                        }
                    }
                    if n == 0 {
                        debug!("Zero-length datagram from {}, closing receiver", from);
                        break;
                    }

                    let arrival_ns = monotonic_ns();
                    if let Ingest::Valid(_) = self.ingest(&buf[..n], arrival_ns) {
                        started.get_or_insert_with(Instant::now);
                    }
                }
            }

            if let (Some(start), Some((clock, reporter))) = (started, self.interval.as_mut()) {
                let jitter = self.stats.jitter().mean_ms;
                if let Some(report) = clock.tick_with_loss(
                    start.elapsed(),
                    self.stats.total_bytes,
                    self.stats.packets_received,
                    self.stats.lost_packets,
                    jitter,
                ) {
                    reporter.report(report);
                }
            }
        }

        Ok(())
    }
}
