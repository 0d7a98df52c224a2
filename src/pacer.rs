//! Absolute-deadline rate pacing for the UDP sender.
//!
//! Packet `n` is due at `start + n * packet_bits / bandwidth`. The sender
//! sleeps until the deadline of the next batch instead of sleeping a fixed
//! amount per packet, so scheduling error in one batch is absorbed by the
//! next one and never accumulates over a long run.

use crate::session::RunFlag;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};

/// Upper bound on packets handed to the socket per batch.
pub const MAX_BATCH_SIZE: usize = 32;

/// Time a batch should span at the target rate.
const BATCH_WINDOW_NS: u128 = 10_000_000;

/// Schedule for a fixed-rate stream.
///
/// # Examples
///
/// ```
/// use miniperf::pacer::Pacer;
/// use std::time::Duration;
///
/// // 8 Mbit/s of 1000 byte packets is one packet per millisecond
/// let pacer = Pacer::new(8_000_000, 1000);
/// assert_eq!(pacer.offset(1000), Some(Duration::from_secs(1)));
/// assert_eq!(pacer.batch_size(), 10);
/// ```
#[derive(Debug, Clone)]
pub struct Pacer {
    start: Instant,
    bandwidth: u64,
    packet_bits: u128,
}

impl Pacer {
    /// Schedule starting now. A `bandwidth` of 0 disables pacing.
    pub fn new(bandwidth: u64, packet_size: usize) -> Self {
        Self {
            start: Instant::now(),
            bandwidth,
            packet_bits: packet_size as u128 * 8,
        }
    }

    pub fn unlimited(packet_size: usize) -> Self {
        Self::new(0, packet_size)
    }

    pub fn is_unlimited(&self) -> bool {
        self.bandwidth == 0
    }

    /// Moves the start of the schedule to now.
    pub fn restart(&mut self) {
        self.start = Instant::now();
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Time after `start` by which `packets` packets should have been sent,
    /// `None` when unpaced.
    pub fn offset(&self, packets: u64) -> Option<Duration> {
        if self.is_unlimited() {
            return None;
        }
        let nanos = packets as u128 * self.packet_bits * 1_000_000_000 / self.bandwidth as u128;
        Some(Duration::from_nanos(nanos.min(u64::MAX as u128) as u64))
    }

    /// Absolute deadline for `packets` packets, `None` when unpaced.
    pub fn deadline(&self, packets: u64) -> Option<Instant> {
        self.offset(packets).map(|offset| self.start + offset)
    }

    /// Packets per batch: roughly one batch window's worth at the target
    /// rate, at least one and at most [`MAX_BATCH_SIZE`].
    pub fn batch_size(&self) -> usize {
        if self.is_unlimited() {
            return MAX_BATCH_SIZE;
        }
        let per_window = self.bandwidth as u128 * BATCH_WINDOW_NS / (self.packet_bits * 1_000_000_000);
        per_window.clamp(1, MAX_BATCH_SIZE as u128) as usize
    }

    /// Sleeps until `packets` packets are due.
    ///
    /// Returns `false` if the run flag was cleared while waiting.
    pub async fn wait_for(&self, packets: u64, flag: &RunFlag) -> bool {
        let Some(deadline) = self.deadline(packets) else {
            return flag.is_running();
        };
        if Instant::now() >= deadline {
            return flag.is_running();
        }

        tokio::select! {
            _ = sleep_until(deadline) => flag.is_running(),
            _ = flag.stopped() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_linear() {
        let pacer = Pacer::new(1_000_000, 125); // 1000 packets/s
        assert_eq!(pacer.offset(0), Some(Duration::ZERO));
        assert_eq!(pacer.offset(1), Some(Duration::from_millis(1)));
        assert_eq!(pacer.offset(2500), Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_large_counts_do_not_overflow() {
        let pacer = Pacer::new(1, 1460);
        assert!(pacer.offset(u64::MAX).is_some());
    }

    #[test]
    fn test_unlimited_has_no_deadline() {
        let pacer = Pacer::unlimited(1460);
        assert!(pacer.is_unlimited());
        assert!(pacer.deadline(100).is_none());
        assert_eq!(pacer.batch_size(), MAX_BATCH_SIZE);
    }

    #[test]
    fn test_batch_size_tracks_rate() {
        // 100 kbit/s of 1000 byte packets is 12.5 pkt/s, well under one per window
        assert_eq!(Pacer::new(100_000, 1000).batch_size(), 1);
        assert_eq!(Pacer::new(8_000_000, 1000).batch_size(), 10);
        assert_eq!(Pacer::new(10_000_000_000, 1000).batch_size(), MAX_BATCH_SIZE);
    }

    #[tokio::test]
    async fn test_paced_count_matches_rate() {
        let flag = RunFlag::new();
        let pacer = Pacer::new(8_000_000, 1000); // 1000 pkt/s
        let window = Duration::from_millis(500);
        let batch = pacer.batch_size() as u64;

        let mut sent = 0u64;
        while pacer.start().elapsed() < window {
            sent += batch;
            assert!(pacer.wait_for(sent, &flag).await);
        }

        let expected = 500.0;
        let tolerance = expected * 0.1 + batch as f64;
        assert!(
            (sent as f64 - expected).abs() <= tolerance,
            "sent {} packets, expected about {}",
            sent,
            expected
        );
    }

    #[tokio::test]
    async fn test_wait_returns_false_on_stop() {
        let flag = RunFlag::new();
        let pacer = Pacer::new(8_000, 1000); // one packet per second
        let stopper = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });

        let started = std::time::Instant::now();
        assert!(!pacer.wait_for(10, &flag).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
