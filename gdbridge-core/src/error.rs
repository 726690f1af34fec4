//! Error types for the protocol and transport layers.

use thiserror::Error;

/// Errors raised while moving RSP packets between the client and the server.
#[derive(Debug, Error)]
pub enum RspError {
    #[error("Client closed the connection")]
    ConnectionClosed,

    #[error("Transport I/O failed")]
    Io(#[from] std::io::Error),

    #[error("WebSocket transport failed")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Packet checksum mismatch (received {received:02x}, computed {computed:02x})")]
    ChecksumMismatch { received: u8, computed: u8 },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Invalid hex field {0:?}")]
    InvalidHex(String),

    #[error("Target operation failed")]
    Target(#[source] anyhow::Error),
}

/// Convenience alias used throughout the protocol layer.
pub type RspResult<T> = Result<T, RspError>;
