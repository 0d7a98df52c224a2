//! UDP data-plane sender.

use crate::batch_socket::UdpSendBatch;
use crate::clock_sync::monotonic_ns;
use crate::config::Config;
use crate::interval_reporter::{IntervalClock, IntervalReporter};
use crate::measurements::{format_bitrate, format_transfer};
use crate::pacer::Pacer;
use crate::session::RunFlag;
use crate::Result;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;

/// What the sender put on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SenderSummary {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub elapsed_secs: f64,
}

impl SenderSummary {
    pub fn bits_per_second(&self) -> f64 {
        if self.elapsed_secs > 0.0 {
            self.bytes_sent as f64 * 8.0 / self.elapsed_secs
        } else {
            0.0
        }
    }

    pub fn text_line(&self) -> String {
        let (transfer_val, transfer_unit) = format_transfer(self.bytes_sent);
        let (bitrate_val, bitrate_unit) = format_bitrate(self.bits_per_second());
        format!(
            "{:4.2}-{:4.2}  sec  {:6.2} {:>7}  {:6.1} {:>10}  {} datagrams  sender",
            0.0, self.elapsed_secs, transfer_val, transfer_unit, bitrate_val, bitrate_unit, self.packets_sent
        )
    }
}

/// Paced, batched stream of sequenced datagrams on a connected socket.
pub struct UdpSender {
    socket: Arc<UdpSocket>,
    packet_size: usize,
    bandwidth: u64,
    duration: Option<Duration>,
    wait: Duration,
    interval: Duration,
    reporter: Option<IntervalReporter>,
}

impl UdpSender {
    /// `socket` must already be connected to the receiver.
    pub fn new(socket: Arc<UdpSocket>, config: &Config) -> Self {
        Self {
            socket,
            packet_size: config.packet_size,
            bandwidth: config.bandwidth,
            duration: config.duration,
            wait: config.wait,
            interval: config.interval,
            reporter: None,
        }
    }

    pub fn with_reporter(mut self, reporter: IntervalReporter) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// Sends until the duration elapses or `flag` is cleared.
    ///
    /// # Errors
    ///
    /// Any socket error other than a full send buffer ends the run.
    pub async fn run(self, flag: &RunFlag) -> Result<SenderSummary> {
        let result = self.send_loop(flag).await;
        if let Some(reporter) = &self.reporter {
            reporter.complete();
        }
        result
    }

    async fn send_loop(&self, flag: &RunFlag) -> Result<SenderSummary> {
        if !self.wait.is_zero() {
            debug!("Waiting {:?} before sending", self.wait);
            tokio::select! {
                _ = tokio::time::sleep(self.wait) => {}
                _ = flag.stopped() => return Ok(SenderSummary::default()),
            }
        }

        let mut pacer = Pacer::new(self.bandwidth, self.packet_size);
        let batch_size = pacer.batch_size();
        let mut batch = UdpSendBatch::new(batch_size, self.packet_size);
        let mut interval = IntervalClock::new(self.interval);

        info!(
            "Sending {} byte datagrams to {} ({}, batches of {})",
            self.packet_size,
            self.socket
                .peer_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "unconnected".to_string()),
            if pacer.is_unlimited() {
                "unlimited".to_string()
            } else {
                format!("{} bit/s", self.bandwidth)
            },
            batch_size
        );

        let start = Instant::now();
        pacer.restart();
        let mut seq: u32 = 0;
        let mut packets: u64 = 0;
        let mut bytes: u64 = 0;

        while flag.is_running() {
            let elapsed = start.elapsed();
            if self.duration.is_some_and(|d| elapsed >= d) {
                break;
            }

            batch.prepare(seq, batch_size, monotonic_ns());
            match batch.send(self.socket.as_ref(), flag).await {
                Ok((sent_bytes, sent_packets)) => {
                    bytes += sent_bytes as u64;
                    packets += sent_packets as u64;
                    seq = seq.wrapping_add(sent_packets as u32);
                }
                Err(e) => {
                    error!("UDP send failed after {} datagrams: {}", packets, e);
                    return Err(e.into());
                }
            }

            if let (Some(reporter), Some(report)) =
                (&self.reporter, interval.tick(start.elapsed(), bytes, packets))
            {
                reporter.report(report);
            }

            if pacer.is_unlimited() {
                tokio::task::yield_now().await;
            } else if !pacer.wait_for(packets, flag).await {
                break;
            }
        }

        let summary = SenderSummary {
            packets_sent: packets,
            bytes_sent: bytes,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            "Sender finished: {} datagrams, {} bytes in {:.2}s",
            summary.packets_sent, summary.bytes_sent, summary.elapsed_secs
        );
        Ok(summary)
    }
}
