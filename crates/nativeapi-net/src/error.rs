//! Error taxonomy shared by the frame helpers and the connection layer.

use std::io;

/// Errors returned by frame helper operations.
///
/// [`ApiError::WouldBlock`] is not a failure: it means "nothing to do yet,
/// call again on the next loop iteration". Every other variant leaves the
/// helper in its failed state and the connection should be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// No complete frame is available, or the transport is not ready for data yet.
    #[error("operation would block")]
    WouldBlock,

    /// A handshake frame exceeded the 128-byte limit.
    #[error("handshake packet too large")]
    BadHandshakePacketLen,

    /// The first byte of a frame did not match the negotiated framing.
    #[error("bad indicator byte")]
    BadIndicator,

    /// A frame header or decrypted body was malformed.
    #[error("bad data packet")]
    BadDataPacket,

    /// Setting `TCP_NODELAY` failed during init.
    #[error("failed to set TCP_NODELAY")]
    TcpNodelayFailed,

    /// Switching the socket to non-blocking mode failed during init.
    #[error("failed to set non-blocking mode")]
    TcpNonblockingFailed,

    /// Closing the socket failed.
    #[error("close failed")]
    CloseFailed,

    /// Shutting down the socket failed.
    #[error("shutdown failed")]
    ShutdownFailed,

    /// The operation is not valid in the helper's current state.
    #[error("bad state")]
    BadState,

    /// The caller passed a buffer that does not fit the framing.
    #[error("bad argument")]
    BadArg,

    /// Reading from the socket failed.
    #[error("socket read failed: {0}")]
    SocketReadFailed(io::ErrorKind),

    /// Writing to the socket failed.
    #[error("socket write failed: {0}")]
    SocketWriteFailed(io::ErrorKind),

    /// The Noise library rejected an incoming handshake message.
    #[error("handshake read failed")]
    HandshakeStateReadFailed,

    /// The Noise library could not produce an outgoing handshake message.
    #[error("handshake write failed")]
    HandshakeStateWriteFailed,

    /// The handshake is in a state the helper does not expect.
    #[error("handshake in bad state")]
    HandshakeStateBadState,

    /// A transport message failed authentication.
    #[error("decrypt failed")]
    CipherStateDecryptFailed,

    /// A transport message could not be encrypted.
    #[error("encrypt failed")]
    CipherStateEncryptFailed,

    /// An allocation failed.
    #[error("out of memory")]
    OutOfMemory,

    /// The handshake state could not be built from the pre-shared key and prologue.
    #[error("handshake setup failed")]
    HandshakeStateSetupFailed,

    /// Deriving the transport ciphers after the handshake failed.
    #[error("handshake split failed")]
    HandshakeStateSplitFailed,

    /// A handshake frame was empty or did not start with the success byte.
    #[error("bad handshake error byte")]
    BadHandshakeErrorByte,

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

impl ApiError {
    /// Whether this is the retry-later sentinel rather than a failure.
    pub fn is_would_block(&self) -> bool {
        matches!(self, ApiError::WouldBlock)
    }
}

/// Result alias used throughout the frame helpers.
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_would_block_is_retryable() {
        assert!(ApiError::WouldBlock.is_would_block());
        assert!(!ApiError::ConnectionClosed.is_would_block());
        assert!(!ApiError::SocketReadFailed(io::ErrorKind::WouldBlock).is_would_block());
    }

    #[test]
    fn test_io_kind_in_message() {
        let err = ApiError::SocketWriteFailed(io::ErrorKind::BrokenPipe);
        assert_eq!(err.to_string(), "socket write failed: broken pipe");
    }
}
