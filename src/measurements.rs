use serde::{Deserialize, Serialize};
use std::fmt;

/// Inter-arrival samples kept for inspection. The running sums keep counting
/// after the buffer is full.
pub const JITTER_SAMPLE_CAPACITY: usize = 65_536;

/// How a valid packet's sequence number related to the expected cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    InOrder,
    /// Jumped ahead; the value is the number of packets counted as lost
    Ahead(u64),
    /// Older than the cursor: reordered or duplicated
    Late,
}

/// Mean and standard deviation of inter-arrival deltas, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct JitterSummary {
    pub mean_ms: f64,
    pub stddev_ms: f64,
}

/// Streaming mean/stddev from a sum, sum of squares and count.
///
/// Uses the population variance; rounding can push it slightly below zero
/// for near-constant samples, so it is clamped before the square root.
///
/// # Examples
///
/// ```
/// use miniperf::measurements::jitter_summary;
///
/// let j = jitter_summary(6.0, 14.0, 3); // deltas 1, 2, 3 ms
/// assert_eq!(j.mean_ms, 2.0);
/// assert!((j.stddev_ms - 0.8165).abs() < 1e-4);
/// ```
pub fn jitter_summary(sum: f64, sum_sq: f64, count: u64) -> JitterSummary {
    if count == 0 {
        return JitterSummary::default();
    }
    let n = count as f64;
    let mean = sum / n;
    let variance = (sum_sq / n - mean * mean).max(0.0);
    JitterSummary {
        mean_ms: mean,
        stddev_ms: variance.sqrt(),
    }
}

/// One-way delay summary, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DelaySummary {
    pub samples: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
}

#[derive(Debug, Clone, Default)]
struct DelayStats {
    samples: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl DelayStats {
    fn record(&mut self, delay_ns: i64) {
        let ms = delay_ns as f64 / 1_000_000.0;
        if self.samples == 0 {
            self.min_ms = ms;
            self.max_ms = ms;
        } else {
            self.min_ms = self.min_ms.min(ms);
            self.max_ms = self.max_ms.max(ms);
        }
        self.samples += 1;
        self.sum_ms += ms;
    }

    fn summary(&self) -> Option<DelaySummary> {
        if self.samples == 0 {
            return None;
        }
        Some(DelaySummary {
            samples: self.samples,
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            mean_ms: self.sum_ms / self.samples as f64,
        })
    }
}

/// Receiver-side accumulator for one experiment.
///
/// Owned by the receive loop while it runs and handed back, read-only, when
/// the loop ends.
#[derive(Debug, Clone)]
pub struct ExperimentStatistics {
    pub total_bytes: u64,
    pub payload_bytes: u64,
    pub packets_received: u64,
    pub corrupt_packets: u64,
    pub out_of_order: u64,
    pub lost_packets: u64,
    /// Next sequence number expected in order, not wrapped at `u32::MAX`
    pub expected_seq: u64,
    pub first_arrival_ns: Option<u64>,
    pub last_arrival_ns: Option<u64>,
    deltas_ms: Vec<f64>,
    delta_sum: f64,
    delta_sum_sq: f64,
    delta_count: u64,
    delay: Option<DelayStats>,
}

impl ExperimentStatistics {
    pub fn new() -> Self {
        Self {
            total_bytes: 0,
            payload_bytes: 0,
            packets_received: 0,
            corrupt_packets: 0,
            out_of_order: 0,
            lost_packets: 0,
            expected_seq: 0,
            first_arrival_ns: None,
            last_arrival_ns: None,
            deltas_ms: Vec::with_capacity(JITTER_SAMPLE_CAPACITY),
            delta_sum: 0.0,
            delta_sum_sq: 0.0,
            delta_count: 0,
            delay: None,
        }
    }

    /// Also collect one-way delay samples.
    pub fn with_delay(mut self) -> Self {
        self.delay = Some(DelayStats::default());
        self
    }

    /// Counts a datagram that failed the size or pattern check. The sequence
    /// cursor is left alone.
    pub fn record_corrupt(&mut self) {
        self.corrupt_packets += 1;
    }

    /// Accounts a valid datagram of `len` bytes (header included) that
    /// arrived at `arrival_ns` on the local monotonic clock.
    pub fn record_packet(&mut self, sequence: u32, len: usize, arrival_ns: u64) -> Arrival {
        // Serial-number distance, so the cursor keeps counting across the
        // sender's u32 wrap
        let distance = sequence.wrapping_sub(self.expected_seq as u32) as i32;
        let arrival = if distance == 0 {
            self.expected_seq += 1;
            Arrival::InOrder
        } else if distance > 0 {
            // Distance from the last in-order packet
            let gap = distance as u64 + 1;
            self.lost_packets += gap;
            self.expected_seq += gap;
            Arrival::Ahead(gap)
        } else {
            self.out_of_order += 1;
            self.lost_packets = self.lost_packets.saturating_sub(1);
            Arrival::Late
        };

        self.packets_received += 1;
        self.total_bytes += len as u64;
        self.payload_bytes += len.saturating_sub(crate::udp_packet::DataHeader::SIZE) as u64;

        if let Some(last) = self.last_arrival_ns {
            let delta_ms = arrival_ns.saturating_sub(last) as f64 / 1_000_000.0;
            if self.deltas_ms.len() < JITTER_SAMPLE_CAPACITY {
                self.deltas_ms.push(delta_ms);
            }
            self.delta_sum += delta_ms;
            self.delta_sum_sq += delta_ms * delta_ms;
            self.delta_count += 1;
        }
        if self.first_arrival_ns.is_none() {
            self.first_arrival_ns = Some(arrival_ns);
        }
        self.last_arrival_ns = Some(arrival_ns);

        arrival
    }

    /// Adds a one-way delay sample if delay measurement is enabled.
    pub fn record_delay(&mut self, delay_ns: i64) {
        if let Some(delay) = self.delay.as_mut() {
            delay.record(delay_ns);
        }
    }

    pub fn measures_delay(&self) -> bool {
        self.delay.is_some()
    }

    /// Stored inter-arrival deltas in arrival order.
    pub fn deltas_ms(&self) -> &[f64] {
        &self.deltas_ms
    }

    pub fn jitter(&self) -> JitterSummary {
        jitter_summary(self.delta_sum, self.delta_sum_sq, self.delta_count)
    }

    /// Seconds between the first and last valid packet.
    pub fn duration_secs(&self) -> f64 {
        match (self.first_arrival_ns, self.last_arrival_ns) {
            (Some(first), Some(last)) => last.saturating_sub(first) as f64 / 1e9,
            _ => 0.0,
        }
    }

    pub fn lost_percent(&self) -> f64 {
        if self.expected_seq == 0 {
            return 0.0;
        }
        (self.lost_packets as f64 * 100.0 / self.expected_seq as f64).min(100.0)
    }

    /// Final report, stamped with the current time and host name.
    pub fn report(&self) -> Report {
        let duration = self.duration_secs();
        let per_sec = |bytes: u64| {
            if duration > 0.0 {
                bytes as f64 * 8.0 / duration
            } else {
                0.0
            }
        };
        let jitter = self.jitter();

        Report {
            timestamp: chrono::Local::now().to_rfc2822(),
            host: host_name(),
            duration_secs: duration,
            total_bytes: self.total_bytes,
            payload_bytes: self.payload_bytes,
            packets_received: self.packets_received,
            expected_packets: self.expected_seq,
            lost_packets: self.lost_packets,
            lost_percent: self.lost_percent(),
            out_of_order: self.out_of_order,
            corrupt_packets: self.corrupt_packets,
            throughput_bps: per_sec(self.total_bytes),
            goodput_bps: per_sec(self.payload_bytes),
            jitter_mean_ms: jitter.mean_ms,
            jitter_stddev_ms: jitter.stddev_ms,
            delay: self.delay.as_ref().and_then(DelayStats::summary),
        }
    }
}

impl Default for ExperimentStatistics {
    fn default() -> Self {
        Self::new()
    }
}

fn host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Final receiver report. Printed locally and sent to the client in STATS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub timestamp: String,
    pub host: String,
    pub duration_secs: f64,
    pub total_bytes: u64,
    pub payload_bytes: u64,
    pub packets_received: u64,
    pub expected_packets: u64,
    pub lost_packets: u64,
    pub lost_percent: f64,
    pub out_of_order: u64,
    pub corrupt_packets: u64,
    pub throughput_bps: f64,
    pub goodput_bps: f64,
    pub jitter_mean_ms: f64,
    pub jitter_stddev_ms: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelaySummary>,
}

impl Report {
    /// Human-readable summary lines.
    pub fn text_lines(&self) -> Vec<String> {
        let (transfer_val, transfer_unit) = format_transfer(self.total_bytes);
        let (bitrate_val, bitrate_unit) = format_bitrate(self.throughput_bps);
        let (goodput_val, goodput_unit) = format_bitrate(self.goodput_bps);

        let mut lines = vec![
            "- - - - - - - - - - - - - - - - - - - - - - - - -".to_string(),
            format!("{}  {}", self.host, self.timestamp),
            "Interval           Transfer        Bitrate            Jitter              Lost/Total Datagrams".to_string(),
            format!(
                "{:4.2}-{:4.2}  sec  {:6.2} {:>7}  {:6.1} {:>10}  {:6.3} ms (+/- {:.3})  {}/{} ({:.2}%)",
                0.0,
                self.duration_secs,
                transfer_val,
                transfer_unit,
                bitrate_val,
                bitrate_unit,
                self.jitter_mean_ms,
                self.jitter_stddev_ms,
                self.lost_packets,
                self.expected_packets,
                self.lost_percent
            ),
            format!(
                "Goodput {:.1} {}, {} datagrams received, {} out of order, {} corrupt",
                goodput_val, goodput_unit, self.packets_received, self.out_of_order, self.corrupt_packets
            ),
        ];
        if let Some(delay) = &self.delay {
            lines.push(format!(
                "One-way delay {:.3}/{:.3}/{:.3} ms (min/mean/max) over {} samples",
                delay.min_ms, delay.mean_ms, delay.max_ms, delay.samples
            ));
        }
        lines
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.text_lines() {
            writeln!(f, "{}", line)?;
        }
        Ok(())
    }
}

/// Scales a byte count to KBytes, MBytes or GBytes.
pub fn format_transfer(bytes: u64) -> (f64, &'static str) {
    if bytes >= 1_000_000_000 {
        (bytes as f64 / 1_000_000_000.0, "GBytes")
    } else if bytes >= 1_000_000 {
        (bytes as f64 / 1_000_000.0, "MBytes")
    } else {
        (bytes as f64 / 1_000.0, "KBytes")
    }
}

/// Scales a bit rate to Kbits/sec, Mbits/sec or Gbits/sec.
pub fn format_bitrate(bps: f64) -> (f64, &'static str) {
    if bps >= 1_000_000_000.0 {
        (bps / 1_000_000_000.0, "Gbits/sec")
    } else if bps >= 1_000_000.0 {
        (bps / 1_000_000.0, "Mbits/sec")
    } else {
        (bps / 1_000.0, "Kbits/sec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(stats: &mut ExperimentStatistics, seqs: &[u32]) {
        for (i, &seq) in seqs.iter().enumerate() {
            stats.record_packet(seq, 100, i as u64 * 1_000_000);
        }
    }

    #[test]
    fn test_gap_counts_lost() {
        let mut stats = ExperimentStatistics::new();
        feed(&mut stats, &[0, 1, 2, 5, 6]);
        assert_eq!(stats.lost_packets, 3);
        assert_eq!(stats.expected_seq, 7);
        assert_eq!(stats.out_of_order, 0);
        assert_eq!(stats.packets_received, 5);
    }

    #[test]
    fn test_duplicate_counts_out_of_order() {
        let mut stats = ExperimentStatistics::new();
        feed(&mut stats, &[0, 1, 1, 2]);
        assert_eq!(stats.out_of_order, 1);
        assert_eq!(stats.lost_packets, 0);
        assert_eq!(stats.expected_seq, 3);
    }

    #[test]
    fn test_late_packet_refunds_loss() {
        let mut stats = ExperimentStatistics::new();
        assert_eq!(stats.record_packet(0, 100, 0), Arrival::InOrder);
        assert_eq!(stats.record_packet(3, 100, 1), Arrival::Ahead(3));
        assert_eq!(stats.record_packet(1, 100, 2), Arrival::Late);
        assert_eq!(stats.lost_packets, 2);
        assert_eq!(stats.out_of_order, 1);
    }

    #[test]
    fn test_sequence_wrap_stays_in_order() {
        let mut stats = ExperimentStatistics::new();
        stats.expected_seq = u32::MAX as u64 - 1;
        feed(&mut stats, &[u32::MAX - 1, u32::MAX, 0, 1]);
        assert_eq!(stats.out_of_order, 0);
        assert_eq!(stats.lost_packets, 0);
        assert_eq!(stats.expected_seq, u32::MAX as u64 + 3);

        assert_eq!(stats.record_packet(3, 100, 10), Arrival::Ahead(2));
        assert_eq!(stats.record_packet(u32::MAX, 100, 11), Arrival::Late);
        assert_eq!(stats.expected_seq, u32::MAX as u64 + 5);
    }

    #[test]
    fn test_corrupt_leaves_cursor() {
        let mut stats = ExperimentStatistics::new();
        feed(&mut stats, &[0, 1]);
        stats.record_corrupt();
        assert_eq!(stats.corrupt_packets, 1);
        assert_eq!(stats.expected_seq, 2);
        assert_eq!(stats.packets_received, 2);
    }

    #[test]
    fn test_jitter_from_deltas() {
        let mut stats = ExperimentStatistics::new();
        let arrivals = [0u64, 1_000_000, 3_000_000, 6_000_000];
        for (seq, &at) in arrivals.iter().enumerate() {
            stats.record_packet(seq as u32, 100, at);
        }
        assert_eq!(stats.deltas_ms(), &[1.0, 2.0, 3.0]);

        let jitter = stats.jitter();
        assert!((jitter.mean_ms - 2.0).abs() < 1e-9);
        assert!((jitter.stddev_ms - 0.816_496_58).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_variance_never_negative() {
        let j = jitter_summary(3.0 * 0.1, 3.0 * 0.1 * 0.1 - 1e-18, 3);
        assert!(j.stddev_ms >= 0.0);
        assert_eq!(jitter_summary(0.0, 0.0, 0), JitterSummary::default());
    }

    #[test]
    fn test_report_rates() {
        let mut stats = ExperimentStatistics::new();
        // 11 packets of 1012 bytes over one second
        for seq in 0..=10u32 {
            stats.record_packet(seq, 1012, seq as u64 * 100_000_000);
        }
        let report = stats.report();
        assert!((report.duration_secs - 1.0).abs() < 1e-9);
        assert_eq!(report.total_bytes, 11 * 1012);
        assert_eq!(report.payload_bytes, 11 * 1000);
        assert!((report.throughput_bps - 11.0 * 1012.0 * 8.0).abs() < 1e-6);
        assert!((report.goodput_bps - 88_000.0).abs() < 1e-6);
        assert_eq!(report.lost_percent, 0.0);
        assert!(report.delay.is_none());
    }

    #[test]
    fn test_empty_report() {
        let report = ExperimentStatistics::new().report();
        assert_eq!(report.duration_secs, 0.0);
        assert_eq!(report.throughput_bps, 0.0);
        assert_eq!(report.lost_percent, 0.0);
        assert!(!report.host.is_empty());
    }

    #[test]
    fn test_delay_only_when_enabled() {
        let mut stats = ExperimentStatistics::new();
        stats.record_delay(1_000_000);
        assert!(stats.report().delay.is_none());

        let mut stats = ExperimentStatistics::new().with_delay();
        stats.record_delay(1_000_000);
        stats.record_delay(3_000_000);
        let delay = stats.report().delay.unwrap();
        assert_eq!(delay.samples, 2);
        assert_eq!(delay.min_ms, 1.0);
        assert_eq!(delay.max_ms, 3.0);
        assert_eq!(delay.mean_ms, 2.0);
    }

    #[test]
    fn test_report_json_roundtrip() {
        let mut stats = ExperimentStatistics::new();
        feed(&mut stats, &[0, 1, 3]);
        let report = stats.report();
        let json = serde_json::to_string(&report).unwrap();
        assert!(!json.contains("delay"));
        let decoded: Report = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.lost_packets, report.lost_packets);
        assert_eq!(decoded.expected_packets, 4);
        assert_eq!(decoded.host, report.host);
        assert!((decoded.throughput_bps - report.throughput_bps).abs() < 1e-6);
    }

    #[test]
    fn test_text_report_mentions_loss() {
        let mut stats = ExperimentStatistics::new();
        feed(&mut stats, &[0, 1, 2, 5, 6]);
        let text = stats.report().to_string();
        assert!(text.contains("3/7"));
    }

    #[test]
    fn test_unit_scaling() {
        assert_eq!(format_transfer(1_500).1, "KBytes");
        assert_eq!(format_transfer(2_000_000), (2.0, "MBytes"));
        assert_eq!(format_bitrate(3_000_000_000.0), (3.0, "Gbits/sec"));
        assert_eq!(format_bitrate(500.0).1, "Kbits/sec");
    }
}
