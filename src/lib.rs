//! # Burrow
//!
//! A reconnectable, multiplexed TCP tunnel. Many independent TCP streams are
//! carried over a single authenticated, optionally encrypted transport
//! connection, and transparently resume when that connection drops and is
//! re-established.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                    │
//! │        (forward listeners, reverse connector)        │
//! ├─────────────────────────────────────────────────────┤
//! │                  Session Layer                       │
//! │   (multiplexing, flow control, resend on reconnect)  │
//! ├─────────────────────────────────────────────────────┤
//! │                  Packet Layer                        │
//! │         (framing, counted cipher envelope)           │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                      │
//! │          (TCP, WebSocket over HTTP proxy)            │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod service;
pub mod transport;
pub mod tunnel;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum packet payload carried in a single frame (64 KB - 1).
/// The frame length field is 16 bits; raising this requires a new framing.
pub const MAX_PAYLOAD_SIZE: usize = 65535;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    AuthenticationFailed,
}
