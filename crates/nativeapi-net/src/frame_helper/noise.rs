use std::net::Shutdown;

use snow::params::NoiseParams;
use snow::{HandshakeState, TransportState};

use super::{FrameHelper, FrameTransport, ReadPacket};
use crate::error::{ApiError, ApiResult};
use crate::socket::Socket;

const INDICATOR: u8 = 0x01;
const HEADER_PADDING: usize = 7;
const MAX_HANDSHAKE_FRAME: usize = 128;
const PROLOGUE_INIT: &[u8] = b"NoiseAPIInit";
const NOISE_PROTOCOL: &str = "Noise_NNpsk0_25519_ChaChaPoly_SHA256";
/// Poly1305 tag length.
const MAC_LEN: usize = 16;
const MAX_NOISE_MESSAGE: usize = 65535;

/// Length of the Noise pre-shared key in bytes.
pub const NOISE_PSK_LEN: usize = 32;

/// Per-connection inputs to the Noise handshake.
#[derive(Clone)]
pub struct NoiseContext {
    psk: [u8; NOISE_PSK_LEN],
    name: String,
    mac_address: String,
}

impl NoiseContext {
    /// `name` and `mac_address` are announced to the client in the server hello.
    pub fn new(psk: [u8; NOISE_PSK_LEN], name: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            psk,
            name: name.into(),
            mac_address: mac_address.into(),
        }
    }

    /// The pre-shared key.
    pub fn psk(&self) -> &[u8; NOISE_PSK_LEN] {
        &self.psk
    }
}

impl std::fmt::Debug for NoiseContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoiseContext")
            .field("name", &self.name)
            .field("mac_address", &self.mac_address)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initialize,
    ClientHello,
    ServerHello,
    Handshake,
    Data,
    Closed,
    Failed,
    ExplicitReject,
}

/// Encrypted framing (Noise NNpsk0, responder role).
///
/// The session opens with a client hello frame whose body is folded into
/// the handshake prologue, answered by a server hello carrying the chosen
/// protocol, device name and MAC address. Handshake frames then alternate
/// until the transport ciphers are split off. Handshake frames are limited
/// to 128 bytes; framing errors during the handshake are answered with an
/// explicit rejection frame before the helper fails.
pub struct NoiseFrameHelper {
    transport: FrameTransport,
    state: State,
    ctx: NoiseContext,
    prologue: Vec<u8>,
    handshake: Option<HandshakeState>,
    cipher: Option<TransportState>,
    rx_header: [u8; 3],
    rx_header_len: usize,
    rx_buf: Vec<u8>,
    rx_buf_len: usize,
    scratch: Vec<u8>,
    footer_size: usize,
}

impl NoiseFrameHelper {
    /// Wrap a connected socket. Call [`FrameHelper::init`] before use.
    pub fn new(socket: Box<dyn Socket>, ctx: NoiseContext) -> Self {
        Self {
            transport: FrameTransport::new(socket),
            state: State::Initialize,
            ctx,
            prologue: Vec::new(),
            handshake: None,
            cipher: None,
            rx_header: [0; 3],
            rx_header_len: 0,
            rx_buf: Vec::new(),
            rx_buf_len: 0,
            scratch: Vec::new(),
            footer_size: 0,
        }
    }

    fn fail(&mut self, err: ApiError) -> ApiError {
        if !err.is_would_block() {
            self.state = State::Failed;
        }
        err
    }

    fn try_read_frame(&mut self) -> ApiResult<Vec<u8>> {
        if self.rx_header_len < self.rx_header.len() {
            let received = self
                .transport
                .recv(&mut self.rx_header[self.rx_header_len..])
                .map_err(|e| self.fail(e))?;
            self.rx_header_len += received;
            if self.rx_header_len < self.rx_header.len() {
                return Err(ApiError::WouldBlock);
            }
        }

        let indicator = self.rx_header[0];
        if indicator != INDICATOR {
            tracing::trace!("{}: Bad indicator byte {indicator}", self.transport.info);
            return Err(self.fail(ApiError::BadIndicator));
        }

        let size = usize::from(u16::from_be_bytes([self.rx_header[1], self.rx_header[2]]));
        if self.state != State::Data && size > MAX_HANDSHAKE_FRAME {
            tracing::trace!("{}: Bad packet len for handshake: {size}", self.transport.info);
            return Err(self.fail(ApiError::BadHandshakePacketLen));
        }

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

        let frame = std::mem::take(&mut self.rx_buf);
        self.rx_buf_len = 0;
        self.rx_header_len = 0;
        Ok(frame)
    }

    /// Read a handshake-phase frame, rejecting framing errors explicitly.
    fn read_handshake_frame(&mut self) -> ApiResult<Vec<u8>> {
        match self.try_read_frame() {
            Err(ApiError::BadIndicator) => {
                self.send_explicit_handshake_reject("Bad indicator byte");
                Err(ApiError::BadIndicator)
            }
            Err(ApiError::BadHandshakePacketLen) => {
                self.send_explicit_handshake_reject("Bad handshake packet len");
                Err(ApiError::BadHandshakePacketLen)
            }
            other => other,
        }
    }

    fn write_frame(&mut self, data: &[u8]) -> ApiResult<()> {
        let len = data.len() as u16;
        let [hi, lo] = len.to_be_bytes();
        let header = [INDICATOR, hi, lo];
        if data.is_empty() {
            self.transport
                .write_raw(&[header.as_slice()], &mut self.state, State::Failed)
        } else {
            self.transport
                .write_raw(&[header.as_slice(), data], &mut self.state, State::Failed)
        }
    }

    /// Send `0x01 | reason` in a regular frame, even from the failed state.
    fn send_explicit_handshake_reject(&mut self, reason: &str) {
        let mut data = Vec::with_capacity(reason.len() + 1);
        data.push(0x01);
        data.extend_from_slice(reason.as_bytes());

        let orig_state = self.state;
        self.state = State::ExplicitReject;
        let _ = self.write_frame(&data);
        self.state = orig_state;
    }

    fn server_hello(&self) -> Vec<u8> {
        let mut msg = Vec::with_capacity(self.ctx.name.len() + self.ctx.mac_address.len() + 3);
        // chosen protocol
        msg.push(0x01);
        msg.extend_from_slice(self.ctx.name.as_bytes());
        msg.push(0x00);
        msg.extend_from_slice(self.ctx.mac_address.as_bytes());
        msg.push(0x00);
        msg
    }

    fn init_handshake(&mut self) -> ApiResult<()> {
        let built = NOISE_PROTOCOL
            .parse::<NoiseParams>()
            .and_then(|params| {
                snow::Builder::new(params)
                    .psk(0, &self.ctx.psk)?
                    .prologue(&self.prologue)?
                    .build_responder()
            });
        match built {
            Ok(handshake) => {
                self.handshake = Some(handshake);
                self.prologue = Vec::new();
                Ok(())
            }
            Err(e) => {
                tracing::trace!("{}: Handshake setup failed: {e}", self.transport.info);
                Err(self.fail(ApiError::HandshakeStateSetupFailed))
            }
        }
    }

    fn check_handshake_finished(&mut self) -> ApiResult<()> {
        let finished = match &self.handshake {
            Some(handshake) => handshake.is_handshake_finished(),
            None => return Err(self.fail(ApiError::HandshakeStateBadState)),
        };
        if !finished {
            return Ok(());
        }
        let Some(handshake) = self.handshake.take() else {
            return Err(self.fail(ApiError::HandshakeStateBadState));
        };
        match handshake.into_transport_mode() {
            Ok(cipher) => {
                self.cipher = Some(cipher);
                self.footer_size = MAC_LEN;
                tracing::trace!("{}: Handshake complete!", self.transport.info);
                self.state = State::Data;
                Ok(())
            }
            Err(e) => {
                tracing::trace!("{}: Handshake split failed: {e}", self.transport.info);
                Err(self.fail(ApiError::HandshakeStateSplitFailed))
            }
        }
    }

    fn handshake_step(&mut self) -> ApiResult<()> {
        let my_turn = match &self.handshake {
            Some(handshake) => handshake.is_my_turn(),
            None => {
                tracing::trace!("{}: Handshake not started", self.transport.info);
                return Err(self.fail(ApiError::HandshakeStateBadState));
            }
        };

        if !my_turn {
            let frame = self.read_handshake_frame()?;
            match frame.first() {
                None => {
                    self.send_explicit_handshake_reject("Empty handshake message");
                    return Err(ApiError::BadHandshakeErrorByte);
                }
                Some(&byte) if byte != 0x00 => {
                    tracing::trace!("{}: Bad handshake error byte: {byte}", self.transport.info);
                    self.send_explicit_handshake_reject("Bad handshake error byte");
                    return Err(ApiError::BadHandshakeErrorByte);
                }
                Some(_) => {}
            }

            let mut payload = vec![0u8; frame.len()];
            let result = match self.handshake.as_mut() {
                Some(handshake) => handshake.read_message(&frame[1..], &mut payload),
                None => return Err(self.fail(ApiError::HandshakeStateBadState)),
            };
            if let Err(e) = result {
                self.state = State::Failed;
                tracing::trace!("{}: Handshake read failed: {e}", self.transport.info);
                let reason = match e {
                    snow::Error::Decrypt => "Handshake MAC failure",
                    _ => "Handshake error",
                };
                self.send_explicit_handshake_reject(reason);
                return Err(ApiError::HandshakeStateReadFailed);
            }
        } else {
            let mut buffer = [0u8; 65];
            let result = match self.handshake.as_mut() {
                Some(handshake) => handshake.write_message(&[], &mut buffer[1..]),
                None => return Err(self.fail(ApiError::HandshakeStateBadState)),
            };
            let len = match result {
                Ok(len) => len,
                Err(e) => {
                    tracing::trace!("{}: Handshake write failed: {e}", self.transport.info);
                    return Err(self.fail(ApiError::HandshakeStateWriteFailed));
                }
            };
            // success
            buffer[0] = 0x00;
            self.write_frame(&buffer[..len + 1])?;
        }

        self.check_handshake_finished()
    }

    /// Advance the handshake as far as the available bytes allow.
    ///
    /// Returns `Ok` only once the transport is ready for data, `WouldBlock`
    /// while the handshake is waiting on the peer.
    fn state_action(&mut self) -> ApiResult<()> {
        if self.state == State::Initialize {
            tracing::trace!("{}: Bad state for method: {:?}", self.transport.info, self.state);
            return Err(ApiError::BadState);
        }

        if self.state == State::ClientHello {
            // Contents are reserved for future flags; only the transcript matters.
            let frame = self.read_handshake_frame()?;
            self.prologue
                .extend_from_slice(&(frame.len() as u16).to_be_bytes());
            self.prologue.extend_from_slice(&frame);
            self.state = State::ServerHello;
        }

        if self.state == State::ServerHello {
            let hello = self.server_hello();
            self.write_frame(&hello)?;
            self.init_handshake()?;
            self.state = State::Handshake;
        }

        while self.state == State::Handshake {
            self.handshake_step()?;
        }

        match self.state {
            State::Closed | State::Failed => Err(ApiError::BadState),
            State::Data => Ok(()),
            _ => Err(ApiError::WouldBlock),
        }
    }

    fn decrypt(&mut self, frame: &[u8]) -> ApiResult<Vec<u8>> {
        let mut plain = vec![0u8; frame.len()];
        let result = match self.cipher.as_mut() {
            Some(cipher) => cipher.read_message(frame, &mut plain),
            None => return Err(self.fail(ApiError::BadState)),
        };
        match result {
            Ok(len) => {
                plain.truncate(len);
                Ok(plain)
            }
            Err(e) => {
                tracing::trace!("{}: Decrypt failed: {e}", self.transport.info);
                Err(self.fail(ApiError::CipherStateDecryptFailed))
            }
        }
    }
}

impl FrameHelper for NoiseFrameHelper {
    fn init(&mut self) -> ApiResult<()> {
        if self.state != State::Initialize {
            tracing::trace!("{}: Bad state for init {:?}", self.transport.info, self.state);
            return Err(ApiError::BadState);
        }
        self.transport.configure(&mut self.state, State::Failed)?;

        self.prologue.extend_from_slice(PROLOGUE_INIT);
        self.state = State::ClientHello;
        Ok(())
    }

    fn poll(&mut self) -> ApiResult<()> {
        match self.state_action() {
            Ok(()) | Err(ApiError::WouldBlock) => {}
            Err(e) => return Err(e),
        }
        if !self.transport.tx_buf.is_empty() {
            self.transport
                .try_send_tx_buf(&mut self.state, State::Closed, State::Failed)?;
        }
        Ok(())
    }

    fn read_packet(&mut self) -> ApiResult<ReadPacket> {
        self.state_action()?;

        let frame = self.try_read_frame()?;
        let plain = self.decrypt(&frame)?;

        if plain.len() < 4 {
            tracing::trace!("{}: Bad data packet: size {} too short", self.transport.info, plain.len());
            return Err(self.fail(ApiError::BadDataPacket));
        }
        let message_type = u16::from_be_bytes([plain[0], plain[1]]);
        let data_len = usize::from(u16::from_be_bytes([plain[2], plain[3]]));
        if data_len > plain.len() - 4 {
            tracing::trace!(
                "{}: Bad data packet: data_len {data_len} greater than msg_size {}",
                self.transport.info,
                plain.len()
            );
            return Err(self.fail(ApiError::BadDataPacket));
        }

        Ok(ReadPacket {
            message_type,
            container: plain,
            data_offset: 4,
            data_len,
        })
    }

    fn can_write_without_blocking(&self) -> bool {
        self.state == State::Data && self.transport.tx_buf.is_empty()
    }

    fn write_protobuf_packet(&mut self, message_type: u16, buffer: &mut Vec<u8>) -> ApiResult<()> {
        self.state_action()?;
        if buffer.len() < HEADER_PADDING {
            return Err(ApiError::BadArg);
        }

        // [0] indicator, [1..3] ciphertext length, then the encrypted part:
        // [3..5] type, [5..7] payload length, [7..] payload.
        let payload_len = buffer.len() - HEADER_PADDING;
        let msg_len = 4 + payload_len;
        if msg_len + MAC_LEN > MAX_NOISE_MESSAGE {
            return Err(ApiError::BadArg);
        }
        buffer[0] = INDICATOR;
        buffer[3..5].copy_from_slice(&message_type.to_be_bytes());
        buffer[5..7].copy_from_slice(&(payload_len as u16).to_be_bytes());

        self.scratch.resize(msg_len + MAC_LEN, 0);
        let result = match self.cipher.as_mut() {
            Some(cipher) => cipher.write_message(&buffer[3..], &mut self.scratch),
            None => return Err(self.fail(ApiError::BadState)),
        };
        let encrypted_len = match result {
            Ok(len) => len,
            Err(e) => {
                tracing::trace!("{}: Encrypt failed: {e}", self.transport.info);
                return Err(self.fail(ApiError::CipherStateEncryptFailed));
            }
        };

        buffer.truncate(3);
        buffer[1..3].copy_from_slice(&(encrypted_len as u16).to_be_bytes());
        buffer.extend_from_slice(&self.scratch[..encrypted_len]);

        self.transport
            .write_raw(&[buffer.as_slice()], &mut self.state, State::Failed)
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
        self.footer_size
    }
}
