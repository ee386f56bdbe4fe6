//! Session layer: framing, multiplexing, flow control and reconnect.
//!
//! One logical session carries many TCP streams over one transport
//! connection. The session survives the transport: when the connection
//! drops, the pipe reconnects, the handshake re-attaches the session by
//! token, and the writer replays every packet the peer has not acknowledged.

pub mod ctrl;
pub mod frame;
pub mod handshake;
pub mod manager;
pub mod pipe;
pub mod relay;
pub mod session;
pub mod stream;

pub use frame::{Packet, PacketKind, FRAME_HEADER_SIZE};
pub use manager::SessionManager;
pub use pipe::Pipe;
pub use session::{ConnInfo, Session};
pub use stream::TunnelStream;

use thiserror::Error;

/// Packets per flow-control block. One credit token buys one block, and the
/// cipher re-keys at the same interval.
pub const WINDOW_BLOCK_PACKETS: i64 = 30;

/// Credit tokens preloaded per stream; the send window in blocks.
pub const WINDOW_BLOCKS: usize = 2;

/// Bound of the per-session resend buffer, equal to the whole send window
/// so every unacknowledged packet is still replayable.
pub const RESEND_BUF_PACKETS: usize = WINDOW_BLOCKS * WINDOW_BLOCK_PACKETS as usize;

/// Largest coalesced transport write produced by the packet writer.
pub const MAX_BATCH_SIZE: usize = 10 * 1024;

/// Pre-encryption pipeline switch. Cipher state is derived per transport
/// connection, so packets encrypted ahead of the connection they end up on
/// would not survive a reconnect. Kept off until the cipher can resume
/// across connections.
pub const PRE_ENCRYPT: bool = false;

/// Stream id of the control stream (handshake follow-ups and connect
/// requests).
pub const CTRL_STREAM_ID: u32 = 0;

/// First stream id handed to user streams.
pub const USER_STREAM_START: u32 = 1;

/// Session layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown packet kind: {0}")]
    UnknownKind(u8),

    #[error("Stream not found: {0}")]
    StreamNotFound(u32),

    #[error("Stream closed")]
    StreamClosed,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Session ended")]
    SessionEnded,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}
