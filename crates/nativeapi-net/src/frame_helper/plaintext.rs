use std::net::Shutdown;

use nativeapi_proto::codec::{encode_varint, parse_varint, varint_len};

use super::{FrameHelper, FrameTransport, ReadPacket};
use crate::error::{ApiError, ApiResult};
use crate::socket::Socket;

const INDICATOR: u8 = 0x00;
const HEADER_PADDING: usize = 6;
/// Longest size varint accepted; three bytes cover every Noise frame size too.
const MAX_SIZE_VARINT_LEN: usize = 3;
const BAD_INDICATOR_REPLY: &[u8; 19] = b"\x00Bad indicator byte";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialize,
    Data,
    Closed,
    Failed,
}

/// Unencrypted framing: `0x00`, varint length, varint type, payload.
pub struct PlaintextFrameHelper {
    transport: FrameTransport,
    state: State,
    indicator_seen: bool,
    rx_header: [u8; 5],
    rx_header_len: usize,
    parsed: Option<(usize, u16)>,
    rx_buf: Vec<u8>,
    rx_buf_len: usize,
}

impl PlaintextFrameHelper {
    /// Wrap a connected socket. Call [`FrameHelper::init`] before use.
    pub fn new(socket: Box<dyn Socket>) -> Self {
        Self {
            transport: FrameTransport::new(socket),
            state: State::Initialize,
            indicator_seen: false,
            rx_header: [0; 5],
            rx_header_len: 0,
            parsed: None,
            rx_buf: Vec::new(),
            rx_buf_len: 0,
        }
    }

    fn fail(&mut self, err: ApiError) -> ApiError {
        if !err.is_would_block() {
            self.state = State::Failed;
        }
        err
    }

    /// Header bytes arrive one at a time: with nothing on the wire the
    /// first read fails fast, and no body bytes are ever pulled into the
    /// header buffer.
    fn read_header(&mut self) -> ApiResult<(usize, u16)> {
        loop {
            if let Some(parsed) = self.parsed {
                return Ok(parsed);
            }

            let mut byte = [0u8; 1];
            self.transport.recv(&mut byte).map_err(|e| self.fail(e))?;
            let byte = byte[0];

            if !self.indicator_seen {
                if byte != INDICATOR {
                    tracing::trace!("{}: Bad indicator byte {byte}", self.transport.info);
                    return Err(self.fail(ApiError::BadIndicator));
                }
                self.indicator_seen = true;
                continue;
            }

            if self.rx_header_len == self.rx_header.len() {
                tracing::trace!("{}: Header buffer overflow", self.transport.info);
                return Err(self.fail(ApiError::BadDataPacket));
            }
            self.rx_header[self.rx_header_len] = byte;
            self.rx_header_len += 1;
            if self.rx_header_len < 2 {
                continue;
            }

            let header = &self.rx_header[..self.rx_header_len];
            let Some((size, used)) = parse_varint(header) else {
                if self.rx_header_len >= MAX_SIZE_VARINT_LEN {
                    return Err(self.fail(ApiError::BadDataPacket));
                }
                continue;
            };
            let Some((message_type, _)) = parse_varint(&header[used..]) else {
                continue;
            };
            self.parsed = Some((size as usize, message_type as u16));
        }
    }

    fn try_read_frame(&mut self) -> ApiResult<(u16, Vec<u8>)> {
        let (size, message_type) = self.read_header()?;

        if self.rx_buf.len() != size {
            self.rx_buf.resize(size, 0);
        }
        if self.rx_buf_len < size {
            let received = self
                .transport
                .recv(&mut self.rx_buf[self.rx_buf_len..])
                .map_err(|e| self.fail(e))?;
            self.rx_buf_len += received;
            if self.rx_buf_len < size {
                return Err(ApiError::WouldBlock);
            }
        }

        let body = std::mem::take(&mut self.rx_buf);
        self.rx_buf_len = 0;
        self.rx_header_len = 0;
        self.indicator_seen = false;
        self.parsed = None;
        Ok((message_type, body))
    }
}

impl FrameHelper for PlaintextFrameHelper {
    fn init(&mut self) -> ApiResult<()> {
        if self.state != State::Initialize {
            tracing::trace!("{}: Bad state for init {:?}", self.transport.info, self.state);
            return Err(ApiError::BadState);
        }
        self.transport.configure(&mut self.state, State::Failed)?;
        self.state = State::Data;
        Ok(())
    }

    fn poll(&mut self) -> ApiResult<()> {
        if self.state != State::Data {
            return Err(ApiError::BadState);
        }
        if !self.transport.tx_buf.is_empty() {
            self.transport
                .try_send_tx_buf(&mut self.state, State::Closed, State::Failed)?;
        }
        Ok(())
    }

    fn read_packet(&mut self) -> ApiResult<ReadPacket> {
        if self.state != State::Data {
            return Err(ApiError::WouldBlock);
        }

        match self.try_read_frame() {
            Ok((message_type, container)) => Ok(ReadPacket {
                message_type,
                data_len: container.len(),
                container,
                data_offset: 0,
            }),
            Err(ApiError::BadIndicator) => {
                // Tell the peer it is speaking the wrong framing; the reply
                // is long enough for a reader that expects a 3-byte header.
                let _ = self.transport.write_raw(
                    &[BAD_INDICATOR_REPLY.as_slice()],
                    &mut self.state,
                    State::Failed,
                );
                Err(ApiError::BadIndicator)
            }
            Err(e) => Err(e),
        }
    }

    fn can_write_without_blocking(&self) -> bool {
        self.state == State::Data && self.transport.tx_buf.is_empty()
    }

    fn write_protobuf_packet(&mut self, message_type: u16, buffer: &mut Vec<u8>) -> ApiResult<()> {
        if self.state != State::Data {
            return Err(ApiError::BadState);
        }
        if buffer.len() < HEADER_PADDING {
            return Err(ApiError::BadArg);
        }

        let payload_len = buffer.len() - HEADER_PADDING;
        let header_len =
            1 + varint_len(payload_len as u64) + varint_len(u64::from(message_type));
        if header_len > HEADER_PADDING {
            return Err(ApiError::BadArg);
        }

        // Right-justify the header against the payload.
        let offset = HEADER_PADDING - header_len;
        let mut header = Vec::with_capacity(HEADER_PADDING);
        header.push(INDICATOR);
        encode_varint(payload_len as u64, &mut header);
        encode_varint(u64::from(message_type), &mut header);
        buffer[offset..HEADER_PADDING].copy_from_slice(&header);

        self.transport
            .write_raw(&[&buffer[offset..]], &mut self.state, State::Failed)
    }

    fn close(&mut self) -> ApiResult<()> {
        self.state = State::Closed;
        self.transport.close()
    }

    fn shutdown(&mut self, how: Shutdown) -> ApiResult<()> {
        self.transport.shutdown(how)?;
        if how == Shutdown::Both {
            self.state = State::Closed;
        }
        Ok(())
    }

    fn set_log_info(&mut self, info: String) {
        self.transport.info = info;
    }

    fn peer_name(&self) -> String {
        self.transport.socket.peer_name()
    }

    fn frame_header_padding(&self) -> usize {
        HEADER_PADDING
    }

    fn frame_footer_size(&self) -> usize {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{MemoryPeer, MemorySocket};
    use proptest::prelude::*;

    fn helper() -> (PlaintextFrameHelper, MemoryPeer) {
        let (socket, peer) = MemorySocket::new("192.168.1.20:40000");
        let mut helper = PlaintextFrameHelper::new(Box::new(socket));
        helper.init().unwrap();
        (helper, peer)
    }

    fn frame(message_type: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![INDICATOR];
        encode_varint(payload.len() as u64, &mut out);
        encode_varint(u64::from(message_type), &mut out);
        out.extend_from_slice(payload);
        out
    }

    fn padded(payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_PADDING];
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn test_init_configures_socket() {
        let (_helper, peer) = helper();
        assert!(peer.is_configured());
    }

    #[test]
    fn test_init_twice_is_bad_state() {
        let (mut helper, _peer) = helper();
        assert_eq!(helper.init(), Err(ApiError::BadState));
    }

    #[test]
    fn test_read_single_packet() {
        let (mut helper, peer) = helper();
        peer.send(&frame(7, b""));
        peer.send(&frame(1, b"\x0a\x03abc"));

        let ping = helper.read_packet().unwrap();
        assert_eq!(ping.message_type, 7);
        assert!(ping.payload().is_empty());

        let hello = helper.read_packet().unwrap();
        assert_eq!(hello.message_type, 1);
        assert_eq!(hello.payload(), b"\x0a\x03abc");

        assert_eq!(helper.read_packet(), Err(ApiError::WouldBlock));
    }

    #[test]
    fn test_multibyte_varints() {
        let (mut helper, peer) = helper();
        let payload = vec![0x5a; 300];
        peer.send(&frame(200, &payload));
        let packet = helper.read_packet().unwrap();
        assert_eq!(packet.message_type, 200);
        assert_eq!(packet.payload(), payload.as_slice());
    }

    #[test]
    fn test_bad_indicator_sends_reply_and_fails() {
        let (mut helper, peer) = helper();
        peer.send(&[0x01, 0x00, 0x00]);
        assert_eq!(helper.read_packet(), Err(ApiError::BadIndicator));
        assert_eq!(peer.take_written(), BAD_INDICATOR_REPLY);
        assert_eq!(helper.read_packet(), Err(ApiError::WouldBlock));
        assert!(!helper.can_write_without_blocking());
    }

    #[test]
    fn test_overlong_size_varint_is_rejected() {
        let (mut helper, peer) = helper();
        peer.send(&[0x00, 0x80, 0x80, 0x80, 0x01, 0x01]);
        assert_eq!(helper.read_packet(), Err(ApiError::BadDataPacket));
    }

    #[test]
    fn test_eof_is_connection_closed() {
        let (mut helper, peer) = helper();
        peer.send(&[0x00, 0x05]);
        peer.close_remote();
        assert_eq!(helper.read_packet(), Err(ApiError::ConnectionClosed));
    }

    #[test]
    fn test_write_right_justifies_header() {
        let (mut helper, peer) = helper();
        let mut buf = padded(b"\x08\x01");
        helper.write_protobuf_packet(4, &mut buf).unwrap();
        assert_eq!(peer.take_written(), [0x00, 0x02, 0x04, 0x08, 0x01]);
    }

    #[test]
    fn test_write_large_header_uses_all_padding() {
        let (mut helper, peer) = helper();
        let payload = vec![7u8; 20_000];
        let mut buf = padded(&payload);
        helper.write_protobuf_packet(300, &mut buf).unwrap();
        let written = peer.take_written();
        assert_eq!(written.len(), HEADER_PADDING + payload.len());
        assert_eq!(&written[..HEADER_PADDING], [0x00, 0xa0, 0x9c, 0x01, 0xac, 0x02]);
    }

    #[test]
    fn test_write_before_init_is_bad_state() {
        let (socket, _peer) = MemorySocket::new("x");
        let mut helper = PlaintextFrameHelper::new(Box::new(socket));
        let mut buf = padded(b"");
        assert_eq!(helper.write_protobuf_packet(7, &mut buf), Err(ApiError::BadState));
        assert_eq!(helper.read_packet(), Err(ApiError::WouldBlock));
    }

    #[test]
    fn test_blocked_write_is_buffered_then_flushed() {
        let (mut helper, peer) = helper();
        peer.set_write_budget(Some(0));
        let mut buf = padded(b"\x10\x01");
        helper.write_protobuf_packet(26, &mut buf).unwrap();
        assert!(!helper.can_write_without_blocking());
        assert!(peer.take_written().is_empty());

        peer.set_write_budget(None);
        helper.poll().unwrap();
        assert!(helper.can_write_without_blocking());
        assert_eq!(peer.take_written(), [0x00, 0x02, 0x1a, 0x10, 0x01]);
    }

    #[test]
    fn test_shutdown_both_closes() {
        let (mut helper, peer) = helper();
        helper.shutdown(Shutdown::Both).unwrap();
        assert_eq!(peer.shutdown_mode(), Some(Shutdown::Both));
        assert_eq!(helper.poll(), Err(ApiError::BadState));
    }

    proptest! {
        #[test]
        fn test_chunked_reads_yield_same_packets(
            payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..400), 1..6),
            chunk in 1usize..17,
        ) {
            let (mut helper, peer) = helper();
            peer.set_read_chunk(Some(chunk));
            for (i, payload) in payloads.iter().enumerate() {
                peer.send(&frame(i as u16 + 1, payload));
            }

            let mut received = Vec::new();
            let mut spins = 0;
            while received.len() < payloads.len() {
                match helper.read_packet() {
                    Ok(packet) => received.push((packet.message_type, packet.payload().to_vec())),
                    Err(ApiError::WouldBlock) => {}
                    Err(e) => panic!("unexpected error {e:?}"),
                }
                spins += 1;
                prop_assert!(spins < 100_000);
            }
            for (i, payload) in payloads.iter().enumerate() {
                prop_assert_eq!(received[i].0, i as u16 + 1);
                prop_assert_eq!(&received[i].1, payload);
            }
        }
    }
}
