//! UDP data packet format with sequence numbers, timestamps and a filler
//! pattern used for loss, jitter and corruption measurement.
//!
//! # Packet Format
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────────────────┐
//! │  Sequence    │  Timestamp   │   Payload                    │
//! │  (4 bytes)   │  (8 bytes)   │   (packet_size - 12 bytes)   │
//! └──────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! - **Sequence**: 32-bit packet number, big-endian
//! - **Timestamp**: sender's monotonic clock in nanoseconds, big-endian
//! - **Payload**: one repeated byte, `b'A' + (sequence % 26)`
//!
//! # Integrity
//!
//! The receiver does not scan the whole payload. It checks the first and
//! last [`SAMPLE_LEN`] bytes against the expected filler byte, which bounds
//! CPU cost per packet while still catching truncation and most overwrites.
//!
//! # Examples
//!
//! ```
//! use miniperf::udp_packet::{create_packet, parse_packet};
//!
//! let packet = create_packet(42, 7_000, 100);
//! assert_eq!(packet.len(), 100);
//!
//! let (header, payload) = parse_packet(&packet).expect("valid packet");
//! assert_eq!(header.sequence, 42);
//! assert_eq!(payload.len(), 100 - 12);
//! ```

/// Number of bytes checked at each end of the payload.
pub const SAMPLE_LEN: usize = 8;

/// Fixed header at the front of every data packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    /// Packet sequence number
    pub sequence: u32,
    /// Send timestamp, sender's monotonic clock in nanoseconds
    pub timestamp_ns: u64,
}

impl DataHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 12; // 4 (sequence) + 8 (timestamp)

    pub fn new(sequence: u32, timestamp_ns: u64) -> Self {
        Self {
            sequence,
            timestamp_ns,
        }
    }

    /// Serializes the header to bytes (big-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        self.write_to(&mut bytes);
        bytes
    }

    /// Writes the header into the front of `buf`.
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`DataHeader::SIZE`].
    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..12].copy_from_slice(&self.timestamp_ns.to_be_bytes());
    }

    /// Deserializes a header, `None` if fewer than 12 bytes are available
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }

        let sequence = u32::from_be_bytes(bytes[0..4].try_into().ok()?);
        let timestamp_ns = u64::from_be_bytes(bytes[4..12].try_into().ok()?);

        Some(Self {
            sequence,
            timestamp_ns,
        })
    }
}

/// Encodes a data header into its fixed 12-byte layout.
pub fn encode_data_header(sequence: u32, timestamp_ns: u64) -> [u8; DataHeader::SIZE] {
    DataHeader::new(sequence, timestamp_ns).to_bytes()
}

/// Decodes a data header, `None` when the slice is too short.
pub fn decode_data_header(bytes: &[u8]) -> Option<DataHeader> {
    DataHeader::from_bytes(bytes)
}

/// Filler byte for a given sequence number.
#[inline]
pub fn pattern_byte(sequence: u32) -> u8 {
    b'A' + (sequence % 26) as u8
}

/// Fills `payload` with the filler byte for `sequence`.
#[inline]
pub fn fill_payload(payload: &mut [u8], sequence: u32) {
    payload.fill(pattern_byte(sequence));
}

/// Sampled integrity check of a payload against its sequence number.
///
/// Only the first and last [`SAMPLE_LEN`] bytes are inspected. An empty
/// payload is trivially valid.
pub fn verify_payload(sequence: u32, payload: &[u8]) -> bool {
    let expected = pattern_byte(sequence);
    let head = payload.len().min(SAMPLE_LEN);
    let tail_start = payload.len().saturating_sub(SAMPLE_LEN);

    payload[..head].iter().all(|&b| b == expected)
        && payload[tail_start..].iter().all(|&b| b == expected)
}

/// Writes a complete packet (header and filler) into `buf`.
///
/// `buf.len()` is the packet size and must be at least [`DataHeader::SIZE`].
pub fn write_packet(buf: &mut [u8], sequence: u32, timestamp_ns: u64) {
    DataHeader::new(sequence, timestamp_ns).write_to(buf);
    fill_payload(&mut buf[DataHeader::SIZE..], sequence);
}

/// Creates a packet of `packet_size` bytes.
///
/// # Panics
///
/// Panics if `packet_size` is smaller than [`DataHeader::SIZE`].
pub fn create_packet(sequence: u32, timestamp_ns: u64, packet_size: usize) -> Vec<u8> {
    let mut packet = vec![0u8; packet_size];
    write_packet(&mut packet, sequence, timestamp_ns);
    packet
}

/// Splits a packet into header and payload, `None` if it is too short
pub fn parse_packet(packet: &[u8]) -> Option<(DataHeader, &[u8])> {
    let header = DataHeader::from_bytes(packet)?;
    Some((header, &packet[DataHeader::SIZE..]))
}
