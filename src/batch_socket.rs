//! Batched UDP sends over a connected socket.
//!
//! A batch owns a fixed set of heap buffers sized from the validated packet
//! size. Each round the sender stamps a run of consecutive sequence numbers
//! into them with a single clock read, then hands them to the socket one
//! datagram at a time. A full send buffer is not an error: the batch waits
//! a bounded time for writability and retries the same datagram.

use crate::session::RunFlag;
use crate::udp_packet::write_packet;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Longest single wait for the socket to become writable again.
pub const WRITABLE_WAIT: Duration = Duration::from_millis(50);

/// Connected datagram socket with a non-blocking send.
pub trait DatagramSocket: Sync {
    /// Sends one datagram or fails with `WouldBlock` when the buffer is full.
    fn try_send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Resolves once a send may succeed.
    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send;
}

impl DatagramSocket for UdpSocket {
    fn try_send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::try_send(self, buf)
    }

    fn writable(&self) -> impl Future<Output = io::Result<()>> + Send {
        UdpSocket::writable(self)
    }
}

/// Reusable buffers for one batch of datagrams.
#[derive(Debug)]
pub struct UdpSendBatch {
    buffers: Vec<Vec<u8>>,
    prepared: usize,
    sent: usize,
}

impl UdpSendBatch {
    /// Allocates `capacity` buffers of `packet_size` bytes each.
    pub fn new(capacity: usize, packet_size: usize) -> Self {
        Self {
            buffers: vec![vec![0u8; packet_size]; capacity.max(1)],
            prepared: 0,
            sent: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffers.len()
    }

    /// Datagrams prepared but not yet sent.
    pub fn len(&self) -> usize {
        self.prepared - self.sent
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fills up to `count` buffers with packets `first_seq..`, all stamped
    /// with `timestamp_ns`. Anything left over from the previous batch is
    /// discarded. Returns the number of packets prepared.
    pub fn prepare(&mut self, first_seq: u32, count: usize, timestamp_ns: u64) -> usize {
        let count = count.min(self.buffers.len());
        for (i, buf) in self.buffers.iter_mut().take(count).enumerate() {
            write_packet(buf, first_seq.wrapping_add(i as u32), timestamp_ns);
        }
        self.prepared = count;
        self.sent = 0;
        count
    }

    /// The prepared datagram at `index`.
    pub fn packet(&self, index: usize) -> Option<&[u8]> {
        if index < self.prepared {
            self.buffers.get(index).map(Vec::as_slice)
        } else {
            None
        }
    }

    /// Sends every prepared datagram on the connected `socket`.
    ///
    /// Returns `(bytes, packets)` actually handed to the kernel. Stops early
    /// only if the run flag is cleared while waiting on a full send buffer.
    ///
    /// # Errors
    ///
    /// Any send error other than `WouldBlock` is returned as is.
    pub async fn send<S: DatagramSocket>(&mut self, socket: &S, flag: &RunFlag) -> io::Result<(usize, usize)> {
        let mut bytes = 0;
        let mut packets = 0;

        while self.sent < self.prepared {
            match socket.try_send(&self.buffers[self.sent]) {
                Ok(n) => {
                    bytes += n;
                    packets += 1;
                    self.sent += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if !flag.is_running() {
                        break;
                    }
                    if let Ok(Err(e)) = timeout(WRITABLE_WAIT, socket.writable()).await {
                        return Err(e);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Ok((bytes, packets))
    }
}
