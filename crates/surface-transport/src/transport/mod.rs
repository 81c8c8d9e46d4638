use std::fmt;

use crate::error::Result;
use crate::message::{InboundRecord, OutboundRecord};

pub mod memory;
#[cfg(feature = "ws")]
pub mod ws;

pub use memory::{InProcessTransport, SurfaceEndpoint};
#[cfg(feature = "ws")]
pub use ws::{WebSocketSurfaceListener, WebSocketSurfaceTransport};

/// How the signaling surface is reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// In-process capability call (mobile native media view)
    InProcess,
    /// JSON records over a WebSocket (desktop WebView)
    WebSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::InProcess => write!(f, "in-process"),
            TransportKind::WebSocket => write!(f, "WS"),
        }
    }
}

/// Events emitted by a transport connection
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A record arrived from the surface
    MessageReceived(InboundRecord),

    /// A frame could not be read or decoded; the connection stays open
    Error {
        /// Error description
        error: String,
    },

    /// The connection is closed. Emitted at most once per connection.
    Closed {
        /// Why the connection closed, if known
        reason: Option<String>,
    },
}

/// One open connection to a signaling surface.
///
/// Implementations deliver records in the order `deliver` is awaited and
/// report closure through a single [`TransportEvent::Closed`] on their event
/// receiver.
#[async_trait::async_trait]
pub trait SurfaceTransport: Send + Sync + fmt::Debug {
    /// Which variant this is
    fn kind(&self) -> TransportKind;

    /// Deliver one outbound record to the surface
    async fn deliver(&self, record: OutboundRecord) -> Result<()>;

    /// Close the connection from the native side
    async fn close(&self) -> Result<()>;

    /// Checks if the connection is closed
    fn is_closed(&self) -> bool;
}
