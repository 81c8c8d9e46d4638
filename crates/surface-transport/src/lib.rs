//! # Signaling surface transport
//!
//! Ordered command/event channel between the native call coordinator and the
//! embedded signaling surface that runs the WebRTC media stack.
//!
//! Two transports honor the same contract:
//!
//! - **WebSocket** (`ws` feature, on by default): the desktop WebView connects
//!   to a local listener and exchanges one JSON record per text frame.
//! - **In-process**: mobile builds hand typed records across a channel pair.
//!
//! The [`SignalingSurfaceAdapter`] sits on top of either one. It keeps
//! commands in FIFO order, decodes inbound records into [`CallEvent`]s and
//! reports the end of each connection with a single
//! [`CallEvent::Disconnected`].
//!
//! ```rust,no_run
//! use callbridge_surface_transport::prelude::*;
//!
//! # async fn example() -> Result<()> {
//! let adapter = SignalingSurfaceAdapter::new();
//! let (transport, events_rx, _surface) = InProcessTransport::pair();
//! adapter.attach(transport, events_rx);
//!
//! let mut events = adapter.events();
//! adapter.send(CallCommand::Layout { value: LayoutType::RemoteVideo }).await?;
//! while let Some(event) = events.recv().await {
//!     println!("surface event: {:?}", event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod error;
pub mod message;
pub mod transport;

pub use adapter::{EventStream, SignalingSurfaceAdapter};
pub use error::{Error, Result};
pub use message::{
    decode_inbound, encode_outbound, CallCapabilities, CallCommand, CallEvent, CallMediaSource,
    CallMediaType, ConnectionInfo, ConnectionState, InboundRecord, LayoutType, OutboundRecord,
    SurfaceReport, SurfaceResponse, VideoCamera,
};
pub use transport::{
    InProcessTransport, SurfaceEndpoint, SurfaceTransport, TransportEvent, TransportKind,
};
#[cfg(feature = "ws")]
pub use transport::{WebSocketSurfaceListener, WebSocketSurfaceTransport};

/// Re-export of common types
pub mod prelude {
    pub use super::{
        CallCommand, CallEvent, CallMediaSource, CallMediaType, ConnectionState, Error,
        EventStream, InProcessTransport, LayoutType, Result, SignalingSurfaceAdapter,
        SurfaceEndpoint, SurfaceReport, SurfaceResponse, SurfaceTransport, TransportEvent,
        VideoCamera,
    };
    #[cfg(feature = "ws")]
    pub use super::{WebSocketSurfaceListener, WebSocketSurfaceTransport};
}
