//! Transport layer for the native API: sockets, framing, and the Noise handshake.

pub mod error;
pub mod frame_helper;
pub mod platform;
pub mod socket;

pub use error::{ApiError, ApiResult};
pub use frame_helper::{
    FrameHelper, NOISE_PSK_LEN, NoiseContext, NoiseFrameHelper, PlaintextFrameHelper, ReadPacket,
};
pub use platform::{SocketConfig, configure_stream, create_listener};
pub use socket::{MemoryPeer, MemorySocket, Socket, TcpSocket};
