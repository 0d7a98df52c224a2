//! Interval reporting off the data path.
//!
//! Data-plane loops push one [`IntervalReport`] per interval into an
//! unbounded channel; a separate task formats and prints them through the
//! shared [`Console`], so no worker ever waits on terminal I/O.

use crate::measurements::{format_bitrate, format_transfer};
use crate::session::Console;
use std::time::Duration;
use tokio::sync::mpsc;

/// Statistics for one reporting interval.
///
/// # Examples
///
/// ```
/// use miniperf::interval_reporter::IntervalReport;
/// use std::time::Duration;
///
/// let report = IntervalReport {
///     interval_start: Duration::from_secs(0),
///     interval_end: Duration::from_secs(1),
///     bytes: 1_000_000,
///     bits_per_second: 8_000_000.0,
///     packets: 1000,
///     lost_packets: None,
///     jitter_ms: None,
/// };
///
/// assert_eq!(report.bytes, 1_000_000);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalReport {
    pub interval_start: Duration,
    pub interval_end: Duration,
    pub bytes: u64,
    pub bits_per_second: f64,
    pub packets: u64,
    /// Receiver only
    pub lost_packets: Option<u64>,
    /// Receiver only
    pub jitter_ms: Option<f64>,
}

impl IntervalReport {
    /// Builds a report for `bytes`/`packets` moved between `start` and `end`.
    pub fn new(interval_start: Duration, interval_end: Duration, bytes: u64, packets: u64) -> Self {
        let secs = interval_end.saturating_sub(interval_start).as_secs_f64();
        let bits_per_second = if secs > 0.0 {
            bytes as f64 * 8.0 / secs
        } else {
            0.0
        };
        Self {
            interval_start,
            interval_end,
            bytes,
            bits_per_second,
            packets,
            lost_packets: None,
            jitter_ms: None,
        }
    }

    pub fn with_loss(mut self, lost_packets: u64, jitter_ms: f64) -> Self {
        self.lost_packets = Some(lost_packets);
        self.jitter_ms = Some(jitter_ms);
        self
    }

    /// One line of progress output.
    pub fn format_line(&self) -> String {
        let (transfer_val, transfer_unit) = format_transfer(self.bytes);
        let (bitrate_val, bitrate_unit) = format_bitrate(self.bits_per_second);

        let mut line = format!(
            "{:4.2}-{:4.2}  sec  {:6.2} {:>7}  {:6.1} {:>10}  {:6}",
            self.interval_start.as_secs_f64(),
            self.interval_end.as_secs_f64(),
            transfer_val,
            transfer_unit,
            bitrate_val,
            bitrate_unit,
            self.packets
        );
        if let (Some(lost), Some(jitter)) = (self.lost_packets, self.jitter_ms) {
            line.push_str(&format!("  {:6.3} ms  {} lost", jitter, lost));
        }
        line
    }
}

/// Message sent to the interval reporter task
#[derive(Debug, Clone)]
pub enum IntervalMessage {
    Report(IntervalReport),
    /// No more reports follow
    Complete,
}

/// Handle for sending interval updates
///
/// # Examples
///
/// ```
/// use miniperf::interval_reporter::{IntervalMessage, IntervalReport, IntervalReporter};
/// use std::time::Duration;
///
/// #[tokio::main]
/// async fn main() {
///     let (reporter, mut receiver) = IntervalReporter::new();
///
///     reporter.report(IntervalReport::new(Duration::ZERO, Duration::from_secs(1), 1000, 1));
///     reporter.complete();
///
///     assert!(matches!(receiver.recv().await, Some(IntervalMessage::Report(_))));
///     assert!(matches!(receiver.recv().await, Some(IntervalMessage::Complete)));
/// }
/// ```
#[derive(Clone)]
pub struct IntervalReporter {
    sender: mpsc::UnboundedSender<IntervalMessage>,
}

impl IntervalReporter {
    /// Returns the reporter and the receiver to hand to [`run_reporter_task`].
    pub fn new() -> (Self, mpsc::UnboundedReceiver<IntervalMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn report(&self, report: IntervalReport) {
        let _ = self.sender.send(IntervalMessage::Report(report));
    }

    pub fn complete(&self) {
        let _ = self.sender.send(IntervalMessage::Complete);
    }
}

/// Drains `receiver`, printing each report until `Complete` arrives or
/// every sender is dropped. Lines are suppressed in JSON mode.
pub async fn run_reporter_task(
    mut receiver: mpsc::UnboundedReceiver<IntervalMessage>,
    console: Console,
    json_mode: bool,
) -> usize {
    let mut printed = 0;
    while let Some(msg) = receiver.recv().await {
        match msg {
            IntervalMessage::Report(report) => {
                if !json_mode {
                    console.line(&report.format_line());
                }
                printed += 1;
            }
            IntervalMessage::Complete => break,
        }
    }
    printed
}

/// Tracks interval boundaries for a data-plane loop.
#[derive(Debug, Clone)]
pub struct IntervalClock {
    period: Duration,
    last_end: Duration,
    last_bytes: u64,
    last_packets: u64,
    last_lost: u64,
}

impl IntervalClock {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            last_end: Duration::ZERO,
            last_bytes: 0,
            last_packets: 0,
            last_lost: 0,
        }
    }

    /// Emits a report if a full period has passed since the last one.
    /// Counters are cumulative; the report carries the difference.
    pub fn tick(&mut self, elapsed: Duration, bytes: u64, packets: u64) -> Option<IntervalReport> {
        if elapsed.saturating_sub(self.last_end) < self.period {
            return None;
        }
        let report = IntervalReport::new(
            self.last_end,
            elapsed,
            bytes.saturating_sub(self.last_bytes),
            packets.saturating_sub(self.last_packets),
        );
        self.last_end = elapsed;
        self.last_bytes = bytes;
        self.last_packets = packets;
        Some(report)
    }

    /// Like [`IntervalClock::tick`] but also reports loss over the interval.
    pub fn tick_with_loss(
        &mut self,
        elapsed: Duration,
        bytes: u64,
        packets: u64,
        lost: u64,
        jitter_ms: f64,
    ) -> Option<IntervalReport> {
        let report = self.tick(elapsed, bytes, packets)?;
        let interval_lost = lost.saturating_sub(self.last_lost);
        self.last_lost = lost;
        Some(report.with_loss(interval_lost, jitter_ms))
    }
}
