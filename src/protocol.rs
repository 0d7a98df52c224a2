//! Control-channel wire format.
//!
//! Every message on the TCP control connection is a fixed 23-byte header
//! followed by `payload_len` payload bytes:
//!
//! ```text
//! ┌──────┬─────────────┬───────┬──────────────┬──────────────┬─────────────┐
//! │ type │ payload_len │  crc  │ timestamp_ns │ clock_offset │ payload ... │
//! │ (1)  │     (4)     │  (2)  │     (8)      │   (8, i64)   │             │
//! └──────┴─────────────┴───────┴──────────────┴──────────────┴─────────────┘
//! ```
//!
//! All multi-byte fields are big-endian. The `crc` field is reserved: it is
//! written as zero and ignored on read. A header and its payload are always
//! consumed together before the next header is read.

use crate::clock_sync::monotonic_ns;
use crate::config::{Config, MAX_PACKET_SIZE};
use crate::measurements::Report;
use crate::udp_packet::DataHeader;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Version carried in [`ExperimentParams`]. Bumped on incompatible changes.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a declared payload length.
///
/// Anything larger is treated as a framing error rather than allocated.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024;

/// Control message types.
///
/// Bytes that do not name a known type decode to [`MessageType::Unknown`]
/// so newer peers can add messages without breaking older ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Clock sync request, payload is the client's `t1`
    Sync,
    /// Clock sync reply, header timestamp is `t2`, payload echoes `t1`
    SyncResp,
    /// Start of the experiment, payload is [`ExperimentParams`] as JSON
    StartExp,
    /// Stop the experiment
    StopExp,
    /// Final statistics, payload is a [`Report`] as JSON
    Stats,
    /// Acknowledgement
    Ack,
    /// Reserved for free-form control traffic
    Control,
    /// Unrecognized type byte. `Unknown(1..=7)` aliases a known type;
    /// [`ControlHeader::new`] folds it back with [`MessageType::canonical`].
    Unknown(u8),
}

impl MessageType {
    /// The value this type decodes to once it has been on the wire.
    pub fn canonical(self) -> Self {
        MessageType::from(u8::from(self))
    }
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageType::Sync,
            2 => MessageType::SyncResp,
            3 => MessageType::StartExp,
            4 => MessageType::StopExp,
            5 => MessageType::Stats,
            6 => MessageType::Ack,
            7 => MessageType::Control,
            other => MessageType::Unknown(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Sync => 1,
            MessageType::SyncResp => 2,
            MessageType::StartExp => 3,
            MessageType::StopExp => 4,
            MessageType::Stats => 5,
            MessageType::Ack => 6,
            MessageType::Control => 7,
            MessageType::Unknown(other) => other,
        }
    }
}

/// Fixed-size control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    pub msg_type: MessageType,
    pub payload_len: u32,
    /// Reserved, always zero on send
    pub crc: u16,
    /// Sender's monotonic clock at send time
    pub timestamp_ns: u64,
    pub clock_offset: i64,
}

impl ControlHeader {
    /// Size of the header in bytes
    pub const SIZE: usize = 23; // 1 + 4 + 2 + 8 + 8

    pub fn new(msg_type: MessageType, payload_len: u32, timestamp_ns: u64, clock_offset: i64) -> Self {
        Self {
            msg_type: msg_type.canonical(),
            payload_len,
            crc: 0,
            timestamp_ns,
            clock_offset,
        }
    }

    /// Serializes the header to bytes (big-endian)
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.msg_type.into();
        bytes[1..5].copy_from_slice(&self.payload_len.to_be_bytes());
        bytes[5..7].copy_from_slice(&self.crc.to_be_bytes());
        bytes[7..15].copy_from_slice(&self.timestamp_ns.to_be_bytes());
        bytes[15..23].copy_from_slice(&self.clock_offset.to_be_bytes());
        bytes
    }

    /// Deserializes a header from the front of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if fewer than [`ControlHeader::SIZE`] bytes
    /// are available.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(Error::Format(format!(
                "control header needs {} bytes, got {}",
                Self::SIZE,
                bytes.len()
            )));
        }

        let field = |range: std::ops::Range<usize>| -> Result<&[u8]> {
            bytes
                .get(range)
                .ok_or_else(|| Error::Format("control header truncated".to_string()))
        };

        Ok(Self {
            msg_type: MessageType::from(bytes[0]),
            payload_len: u32::from_be_bytes(field(1..5)?.try_into().map_err(format_err)?),
            crc: u16::from_be_bytes(field(5..7)?.try_into().map_err(format_err)?),
            timestamp_ns: u64::from_be_bytes(field(7..15)?.try_into().map_err(format_err)?),
            clock_offset: i64::from_be_bytes(field(15..23)?.try_into().map_err(format_err)?),
        })
    }
}

fn format_err(e: std::array::TryFromSliceError) -> Error {
    Error::Format(e.to_string())
}

/// Encodes a control header; the reserved CRC field is zero.
pub fn encode_control_header(
    msg_type: MessageType,
    payload_len: u32,
    timestamp_ns: u64,
    clock_offset: i64,
) -> [u8; ControlHeader::SIZE] {
    ControlHeader::new(msg_type, payload_len, timestamp_ns, clock_offset).to_bytes()
}

/// Decodes a control header, failing on short input.
pub fn decode_control_header(bytes: &[u8]) -> Result<ControlHeader> {
    ControlHeader::from_bytes(bytes)
}

/// Parameters of an experiment, sent by the client in `START_EXP`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentParams {
    pub version: u32,
    pub packet_size: usize,
    pub bandwidth: u64,
    pub duration_ms: Option<u64>,
    pub measure_delay: bool,
    pub streams: usize,
}

impl ExperimentParams {
    pub fn from_config(config: &Config) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            packet_size: config.packet_size,
            bandwidth: config.bandwidth,
            duration_ms: config.duration.map(|d| d.as_millis() as u64),
            measure_delay: config.measure_delay,
            streams: config.streams,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_ms.map(Duration::from_millis)
    }

    /// Checks parameters received from a peer before a worker uses them.
    pub fn validate(&self) -> Result<()> {
        if self.version != PROTOCOL_VERSION {
            return Err(Error::Protocol(format!(
                "peer speaks protocol version {}, expected {}",
                self.version, PROTOCOL_VERSION
            )));
        }
        if self.packet_size < DataHeader::SIZE || self.packet_size > MAX_PACKET_SIZE {
            return Err(Error::Config(format!(
                "Packet size must be between {} and {} bytes, got {}",
                DataHeader::SIZE,
                MAX_PACKET_SIZE,
                self.packet_size
            )));
        }
        Ok(())
    }
}

/// A header together with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub header: ControlHeader,
    pub payload: Vec<u8>,
}

impl ControlMessage {
    /// Builds a message, deriving `payload_len` from `payload`.
    pub fn new(msg_type: MessageType, payload: Vec<u8>, timestamp_ns: u64, clock_offset: i64) -> Self {
        let header = ControlHeader::new(msg_type, payload.len() as u32, timestamp_ns, clock_offset);
        Self { header, payload }
    }

    /// Clock sync request stamped and loaded with `t1`.
    pub fn sync(t1: u64) -> Self {
        Self::new(MessageType::Sync, t1.to_be_bytes().to_vec(), t1, 0)
    }

    /// Clock sync reply: header timestamp `t2`, payload echoes `t1`.
    pub fn sync_resp(t1: u64, t2: u64) -> Self {
        Self::new(MessageType::SyncResp, t1.to_be_bytes().to_vec(), t2, 0)
    }

    /// Experiment start carrying `params` and the sender's clock skew estimate.
    pub fn start(params: &ExperimentParams, clock_offset: i64) -> Result<Self> {
        let payload = serde_json::to_vec(params)?;
        Ok(Self::new(MessageType::StartExp, payload, monotonic_ns(), clock_offset))
    }

    pub fn stop() -> Self {
        Self::new(MessageType::StopExp, Vec::new(), monotonic_ns(), 0)
    }

    /// Final statistics.
    pub fn stats(report: &Report) -> Result<Self> {
        let payload = serde_json::to_vec(report)?;
        Ok(Self::new(MessageType::Stats, payload, monotonic_ns(), 0))
    }

    pub fn ack() -> Self {
        Self::new(MessageType::Ack, Vec::new(), monotonic_ns(), 0)
    }

    pub fn msg_type(&self) -> MessageType {
        self.header.msg_type
    }

    /// Reads the 8-byte big-endian timestamp carried by SYNC and SYNC_RESP.
    pub fn payload_timestamp(&self) -> Result<u64> {
        let bytes: [u8; 8] = self
            .payload
            .get(..8)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| {
                Error::Format(format!(
                    "{:?} payload needs 8 bytes, got {}",
                    self.msg_type(),
                    self.payload.len()
                ))
            })?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Decodes the [`ExperimentParams`] of a START_EXP message.
    pub fn params(&self) -> Result<ExperimentParams> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Decodes the [`Report`] of a STATS message.
    pub fn report(&self) -> Result<Report> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Header followed by payload, ready for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(ControlHeader::SIZE + self.payload.len());
        bytes.extend_from_slice(&self.header.to_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Writes one framed message and flushes.
pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &ControlMessage) -> Result<()> {
    writer.write_all(&msg.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly one header and its full payload.
///
/// # Errors
///
/// A stream that ends before a complete message yields an
/// `UnexpectedEof` I/O error; a declared payload over
/// [`MAX_PAYLOAD_LEN`] yields [`Error::Format`]. Callers treat both as a
/// peer disconnect.
///
/// # Examples
///
/// ```
/// use miniperf::protocol::{read_message, write_message, ControlMessage, MessageType};
///
/// # #[tokio::main]
/// # async fn main() -> miniperf::Result<()> {
/// let (mut a, mut b) = tokio::io::duplex(256);
/// write_message(&mut a, &ControlMessage::sync(100)).await?;
///
/// let msg = read_message(&mut b).await?;
/// assert_eq!(msg.msg_type(), MessageType::Sync);
/// assert_eq!(msg.payload_timestamp()?, 100);
/// # Ok(())
/// # }
/// ```
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<ControlMessage> {
    let mut header_bytes = [0u8; ControlHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = ControlHeader::from_bytes(&header_bytes)?;

    if header.payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::Format(format!(
            "declared payload of {} bytes exceeds limit of {}",
            header.payload_len, MAX_PAYLOAD_LEN
        )));
    }

    let mut payload = vec![0u8; header.payload_len as usize];
    reader.read_exact(&mut payload).await?;

    Ok(ControlMessage { header, payload })
}
