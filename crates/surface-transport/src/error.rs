use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for signaling surface transport operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the command channel and surface adapter
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to bind to the specified address
    #[error("Failed to bind to {0}: {1}")]
    BindFailed(SocketAddr, io::Error),

    /// Failed to accept an incoming surface connection
    #[error("Failed to accept connection: {0}")]
    AcceptFailed(io::Error),

    /// Failed to get local address
    #[error("Failed to get local address: {0}")]
    LocalAddrFailed(io::Error),

    /// The connection to the signaling surface is not open
    #[error("Transport closed")]
    TransportClosed,

    /// Connection closed by the surface
    #[error("Connection closed by peer: {0}")]
    ConnectionClosedByPeer(String),

    /// Connection reset while writing
    #[error("Connection reset")]
    ConnectionReset,

    /// WebSocket protocol error
    #[error("WebSocket protocol error: {0}")]
    WebSocketProtocolError(String),

    /// WebSocket handshake failed
    #[error("WebSocket handshake failed: {0}")]
    WebSocketHandshakeFailed(String),

    /// A frame could not be decoded into a wire record
    #[error("Failed to parse message: {0}")]
    ParseError(String),

    /// A command could not be encoded
    #[error("Failed to encode message: {0}")]
    EncodeError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl Error {
    /// Returns true if the error means the surface connection is gone
    pub fn is_connection_closed(&self) -> bool {
        matches!(
            self,
            Error::TransportClosed
                | Error::ConnectionClosedByPeer(_)
                | Error::ConnectionReset
        )
    }

    /// Returns true if retrying on a fresh connection might succeed
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::ParseError(_) | Error::EncodeError(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::ParseError(e.to_string())
    }
}
