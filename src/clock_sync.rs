//! Coarse clock offset estimation over the control channel.
//!
//! The client stamps a SYNC with its monotonic clock (`t1`), the server
//! answers with its own clock (`t2`) and the client notes the arrival
//! time (`t3`). One exchange is enough for the experiment's purposes;
//! this is not an NTP replacement and makes no attempt to filter
//! asymmetric paths.

use crate::protocol::{ControlMessage, MessageType};
use crate::{Error, Result};
use std::time::Duration;

/// How long the client waits for SYNC_RESP before giving up on the exchange.
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(2);

/// Reads the monotonic clock in nanoseconds.
#[cfg(unix)]
pub fn monotonic_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec and CLOCK_MONOTONIC is
    // always available on supported unix targets.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return fallback_ns();
    }
    (ts.tv_sec as u64)
        .saturating_mul(1_000_000_000)
        .saturating_add(ts.tv_nsec as u64)
}

/// Reads the monotonic clock in nanoseconds.
#[cfg(not(unix))]
pub fn monotonic_ns() -> u64 {
    fallback_ns()
}

fn fallback_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;

    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// `((t2 - t1) + (t3 - t2)) / 2`, computed without overflow.
///
/// # Examples
///
/// ```
/// use miniperf::clock_sync::estimate_offset;
///
/// assert_eq!(estimate_offset(100, 150, 160), 30);
/// ```
pub fn estimate_offset(t1: u64, t2: u64, t3: u64) -> i64 {
    let (t1, t2, t3) = (t1 as i128, t2 as i128, t3 as i128);
    clamp_i64(((t2 - t1) + (t3 - t2)) / 2)
}

/// How far the remote clock runs ahead of the local one, assuming a
/// symmetric path: `t2 - (t1 + t3) / 2`.
pub fn estimate_skew(t1: u64, t2: u64, t3: u64) -> i64 {
    let (t1, t2, t3) = (t1 as i128, t2 as i128, t3 as i128);
    clamp_i64(t2 - (t1 + t3) / 2)
}

fn clamp_i64(v: i128) -> i64 {
    v.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Result of the most recent sync exchange.
///
/// Before any exchange completes both estimates are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClockSync {
    offset_ns: i64,
    skew_ns: i64,
    synced: bool,
}

impl ClockSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a finished exchange.
    pub fn complete(&mut self, t1: u64, t2: u64, t3: u64) {
        self.offset_ns = estimate_offset(t1, t2, t3);
        self.skew_ns = estimate_skew(t1, t2, t3);
        self.synced = true;
    }

    /// Records an exchange from a SYNC_RESP that arrived at `t3`.
    pub fn complete_from(&mut self, resp: &ControlMessage, t3: u64) -> Result<()> {
        let (t1, t2) = parse_sync_response(resp)?;
        self.complete(t1, t2, t3);
        Ok(())
    }

    pub fn offset_ns(&self) -> i64 {
        self.offset_ns
    }

    pub fn skew_ns(&self) -> i64 {
        self.skew_ns
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }
}

/// Builds a SYNC stamped with `t1`.
pub fn sync_request(t1: u64) -> ControlMessage {
    ControlMessage::sync(t1)
}

/// Builds the SYNC_RESP for `request`, stamped with the local `t2`.
pub fn sync_response(request: &ControlMessage, t2: u64) -> Result<ControlMessage> {
    let t1 = request.payload_timestamp()?;
    Ok(ControlMessage::sync_resp(t1, t2))
}

/// Extracts `(t1, t2)` from a SYNC_RESP.
pub fn parse_sync_response(resp: &ControlMessage) -> Result<(u64, u64)> {
    if resp.msg_type() != MessageType::SyncResp {
        return Err(Error::Protocol(format!(
            "expected SYNC_RESP, got {:?}",
            resp.msg_type()
        )));
    }
    Ok((resp.payload_timestamp()?, resp.header.timestamp_ns))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_formula() {
        assert_eq!(estimate_offset(100, 150, 160), 30);
        assert_eq!(estimate_offset(0, 0, 0), 0);
    }

    #[test]
    fn test_offset_handles_remote_clock_behind() {
        // t2 < t1 would underflow with unsigned arithmetic
        assert_eq!(estimate_skew(1_000, 100, 1_200), -1_000);
        assert_eq!(estimate_offset(1_000, 100, 1_200), 100);
    }

    #[test]
    fn test_skew_for_symmetric_path() {
        // 10ns each way, remote clock 500ns ahead
        assert_eq!(estimate_skew(0, 510, 20), 500);
    }

    #[test]
    fn test_extreme_values_do_not_overflow() {
        let _ = estimate_offset(0, u64::MAX, u64::MAX);
        let _ = estimate_skew(u64::MAX, 0, u64::MAX);
    }

    #[test]
    fn test_monotonic_is_non_decreasing() {
        let a = monotonic_ns();
        let b = monotonic_ns();
        assert!(b >= a);
    }

    #[test]
    fn test_exchange_roundtrip() {
        let req = sync_request(100);
        let resp = sync_response(&req, 150).unwrap();
        assert_eq!(parse_sync_response(&resp).unwrap(), (100, 150));

        let mut clock = ClockSync::new();
        assert!(!clock.is_synced());
        clock.complete_from(&resp, 160).unwrap();
        assert!(clock.is_synced());
        assert_eq!(clock.offset_ns(), 30);
        assert_eq!(clock.skew_ns(), 20);
    }

    #[test]
    fn test_parse_rejects_wrong_type() {
        let msg = sync_request(1);
        assert!(matches!(parse_sync_response(&msg), Err(Error::Protocol(_))));
    }
}
