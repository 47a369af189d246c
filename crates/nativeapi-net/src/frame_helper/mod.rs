//! Message framing over a non-blocking socket.
//!
//! A frame helper turns a byte stream into discrete `(type, payload)`
//! packets and back. Two framings exist:
//!
//! ```text
//! plaintext  0x00 | varint len | varint type | payload
//! noise      0x01 | len (u16 BE) | encrypt(type u16 BE | len u16 BE | payload) + MAC
//! ```
//!
//! Writers serialize the payload into a buffer that starts with
//! [`FrameHelper::frame_header_padding`] reserved bytes. The helper
//! back-fills its header into that space, so a packet reaches the socket
//! without another copy. Whatever the socket does not accept is kept in a
//! transmit backlog and flushed by [`FrameHelper::poll`].

mod noise;
mod plaintext;

use std::io::{self, IoSlice};
use std::net::Shutdown;

use crate::error::{ApiError, ApiResult};
use crate::socket::Socket;

pub use noise::{NoiseContext, NoiseFrameHelper, NOISE_PSK_LEN};
pub use plaintext::PlaintextFrameHelper;

/// One fully received packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadPacket {
    /// Message type tag from the frame header.
    pub message_type: u16,
    /// Decoded frame body. The payload is a sub-slice of it.
    pub container: Vec<u8>,
    /// Offset of the payload inside `container`.
    pub data_offset: usize,
    /// Payload length.
    pub data_len: usize,
}

impl ReadPacket {
    /// The message body.
    pub fn payload(&self) -> &[u8] {
        &self.container[self.data_offset..self.data_offset + self.data_len]
    }
}

/// Framing layer between a socket and the connection state machine.
///
/// No method blocks. [`ApiError::WouldBlock`] means "retry on the next loop
/// iteration"; any other error leaves the helper failed.
pub trait FrameHelper: Send {
    /// Configure the socket and start the protocol preamble.
    fn init(&mut self) -> ApiResult<()>;

    /// Advance the handshake and flush the transmit backlog. Must run every
    /// loop iteration even when there is nothing to send or receive.
    fn poll(&mut self) -> ApiResult<()>;

    /// Return the next complete packet, or `WouldBlock` if none is ready.
    fn read_packet(&mut self) -> ApiResult<ReadPacket>;

    /// Whether a write right now would go straight to the socket.
    fn can_write_without_blocking(&self) -> bool;

    /// Frame and send `buffer`, whose first [`frame_header_padding`] bytes
    /// are reserved for the header. Bytes the socket does not take are
    /// buffered and still count as success.
    ///
    /// [`frame_header_padding`]: FrameHelper::frame_header_padding
    fn write_protobuf_packet(&mut self, message_type: u16, buffer: &mut Vec<u8>) -> ApiResult<()>;

    /// Close the socket.
    fn close(&mut self) -> ApiResult<()>;

    /// Shut down one or both directions of the socket.
    fn shutdown(&mut self, how: Shutdown) -> ApiResult<()>;

    /// Label used as a prefix for this helper's log lines.
    fn set_log_info(&mut self, info: String);

    /// Printable address of the remote end.
    fn peer_name(&self) -> String;

    /// Bytes a writer must reserve in front of each payload.
    fn frame_header_padding(&self) -> usize;

    /// Bytes appended after each payload (the MAC, for Noise).
    fn frame_footer_size(&self) -> usize;
}

// ---------------------------------------------------------------------------
// Shared transport
// ---------------------------------------------------------------------------

/// Socket plus transmit backlog, shared by both framings.
pub(crate) struct FrameTransport {
    pub(crate) socket: Box<dyn Socket>,
    pub(crate) tx_buf: Vec<u8>,
    pub(crate) info: String,
}

impl FrameTransport {
    pub(crate) fn new(socket: Box<dyn Socket>) -> Self {
        let info = socket.peer_name();
        Self {
            socket,
            tx_buf: Vec::new(),
            info,
        }
    }

    /// Non-blocking mode plus `TCP_NODELAY`, as both framings require.
    pub(crate) fn configure<S: Copy>(&mut self, state: &mut S, failed: S) -> ApiResult<()> {
        if let Err(e) = self.socket.set_nonblocking(true) {
            *state = failed;
            tracing::debug!("{}: Setting nonblocking failed: {e}", self.info);
            return Err(ApiError::TcpNonblockingFailed);
        }
        if let Err(e) = self.socket.set_nodelay(true) {
            *state = failed;
            tracing::debug!("{}: Setting nodelay failed: {e}", self.info);
            return Err(ApiError::TcpNodelayFailed);
        }
        Ok(())
    }

    /// Read into `buf`, mapping EOF and socket errors to [`ApiError`].
    pub(crate) fn recv(&mut self, buf: &mut [u8]) -> ApiResult<usize> {
        match self.socket.read(buf) {
            Ok(0) => {
                tracing::trace!("{}: Connection closed", self.info);
                Err(ApiError::ConnectionClosed)
            }
            Ok(n) => Ok(n),
            Err(e) if is_would_block(&e) => Err(ApiError::WouldBlock),
            Err(e) => {
                tracing::trace!("{}: Socket read failed: {e}", self.info);
                Err(ApiError::SocketReadFailed(e.kind()))
            }
        }
    }

    /// Write `spans` in order, or append whatever cannot be written to the
    /// backlog. The backlog is drained first; if it cannot be emptied the
    /// new data goes behind it so the stream stays in order.
    pub(crate) fn write_raw<S: Copy>(&mut self, spans: &[&[u8]], state: &mut S, failed: S) -> ApiResult<()> {
        let total: usize = spans.iter().map(|s| s.len()).sum();
        if total == 0 {
            return Ok(());
        }

        while !self.tx_buf.is_empty() {
            match self.socket.write(&self.tx_buf) {
                Ok(0) => break,
                Ok(sent) => {
                    self.tx_buf.drain(..sent);
                }
                Err(e) if is_would_block(&e) => break,
                Err(e) => {
                    tracing::trace!("{}: Socket write failed: {e}", self.info);
                    *state = failed;
                    return Err(ApiError::SocketWriteFailed(e.kind()));
                }
            }
        }

        if !self.tx_buf.is_empty() {
            self.buffer_tail(spans, 0, total);
            return Ok(());
        }

        let slices: Vec<IoSlice<'_>> = spans.iter().map(|s| IoSlice::new(s)).collect();
        match self.socket.writev(&slices) {
            Ok(sent) if sent < total => self.buffer_tail(spans, sent, total - sent),
            Ok(_) => {}
            Err(e) if is_would_block(&e) => self.buffer_tail(spans, 0, total),
            Err(e) => {
                tracing::trace!("{}: Socket write failed: {e}", self.info);
                *state = failed;
                return Err(ApiError::SocketWriteFailed(e.kind()));
            }
        }
        Ok(())
    }

    /// Append everything after the first `skip` bytes of `spans` to the backlog.
    fn buffer_tail(&mut self, spans: &[&[u8]], skip: usize, remaining: usize) {
        self.tx_buf.reserve(remaining);
        let mut to_consume = skip;
        for span in spans {
            if to_consume >= span.len() {
                to_consume -= span.len();
            } else {
                self.tx_buf.extend_from_slice(&span[to_consume..]);
                to_consume = 0;
            }
        }
    }

    /// Flush as much of the backlog as the socket takes, unless `state` is `closed`.
    pub(crate) fn try_send_tx_buf<S: Copy + PartialEq>(
        &mut self,
        state: &mut S,
        closed: S,
        failed: S,
    ) -> ApiResult<()> {
        while *state != closed && !self.tx_buf.is_empty() {
            match self.socket.write(&self.tx_buf) {
                Ok(0) => break,
                Ok(sent) => {
                    self.tx_buf.drain(..sent);
                }
                Err(e) if is_would_block(&e) => break,
                Err(e) => {
                    tracing::trace!("{}: Socket write failed: {e}", self.info);
                    *state = failed;
                    return Err(ApiError::SocketWriteFailed(e.kind()));
                }
            }
        }
        Ok(())
    }

    pub(crate) fn close(&mut self) -> ApiResult<()> {
        self.socket.close().map_err(|_| ApiError::CloseFailed)
    }

    pub(crate) fn shutdown(&mut self, how: Shutdown) -> ApiResult<()> {
        self.socket.shutdown(how).map_err(|_| ApiError::ShutdownFailed)
    }
}

fn is_would_block(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
