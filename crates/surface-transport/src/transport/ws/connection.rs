use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::message::{decode_inbound, encode_outbound, InboundRecord, OutboundRecord};

/// Largest text frame accepted from a surface
pub(crate) const MAX_FRAME_SIZE: usize = 1024 * 1024;

pub(crate) type WsWriter = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Writer half of a WebSocket connection to a surface
pub struct WebSocketConnection {
    /// The WebSocket stream (writer half)
    ws_writer: Mutex<WsWriter>,
    /// The surface's address
    peer_addr: SocketAddr,
    /// Whether the connection is closed
    closed: AtomicBool,
}

impl WebSocketConnection {
    pub(crate) fn from_writer(ws_writer: WsWriter, peer_addr: SocketAddr) -> Self {
        Self {
            ws_writer: Mutex::new(ws_writer),
            peer_addr,
            closed: AtomicBool::new(false),
        }
    }

    /// Returns the peer address of the connection
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Sends one record as a JSON text frame
    pub async fn send_record(&self, record: &OutboundRecord) -> Result<()> {
        if self.is_closed() {
            return Err(Error::TransportClosed);
        }

        let text = encode_outbound(record)?;

        // Holding the writer lock across the send keeps frames in call order
        let mut writer = self.ws_writer.lock().await;
        writer.send(WsMessage::Text(text)).await.map_err(|e| {
            self.closed.store(true, Ordering::Relaxed);
            match e {
                tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                    Error::ConnectionClosedByPeer(self.peer_addr.to_string())
                }
                tungstenite::Error::Protocol(msg) => Error::WebSocketProtocolError(msg.to_string()),
                tungstenite::Error::Io(io_err) => {
                    if io_err.kind() == io::ErrorKind::BrokenPipe
                        || io_err.kind() == io::ErrorKind::ConnectionReset
                    {
                        Error::ConnectionReset
                    } else {
                        Error::IoError(io_err)
                    }
                }
                other => Error::WebSocketProtocolError(other.to_string()),
            }
        })?;

        trace!(
            "Sent {} command over WebSocket to {}",
            record.command.type_name(),
            self.peer_addr
        );
        Ok(())
    }

    /// Processes a WebSocket frame and attempts to decode it as an inbound record
    pub fn process_ws_message(&self, ws_message: WsMessage) -> Result<Option<InboundRecord>> {
        match ws_message {
            WsMessage::Text(text) => {
                trace!("Received text frame over WebSocket from {}", self.peer_addr);
                if text.len() > MAX_FRAME_SIZE {
                    return Err(Error::ParseError(format!(
                        "frame of {} bytes exceeds limit",
                        text.len()
                    )));
                }
                decode_inbound(&text).map(Some).map_err(|e| {
                    warn!("Failed to decode surface record from {}: {}", self.peer_addr, e);
                    e
                })
            }
            WsMessage::Binary(data) => {
                trace!("Received binary frame over WebSocket from {}", self.peer_addr);
                let text = std::str::from_utf8(&data)
                    .map_err(|e| Error::ParseError(format!("binary frame is not UTF-8: {}", e)))?;
                decode_inbound(text).map(Some)
            }
            WsMessage::Ping(_) => {
                trace!("Received ping from {}", self.peer_addr);
                Ok(None)
            }
            WsMessage::Pong(_) => {
                trace!("Received pong from {}", self.peer_addr);
                Ok(None)
            }
            WsMessage::Close(_) => {
                debug!("Received close frame from {}", self.peer_addr);
                self.closed.store(true, Ordering::Relaxed);
                Ok(None)
            }
            WsMessage::Frame(_) => {
                warn!("Received unexpected raw frame from {}", self.peer_addr);
                Ok(None)
            }
        }
    }

    /// Closes the WebSocket connection
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }

        let mut writer = self.ws_writer.lock().await;
        if let Err(e) = writer.send(WsMessage::Close(None)).await {
            warn!("Failed to send close frame to {}: {}", self.peer_addr, e);
        }
        if let Err(e) = writer.close().await {
            return Err(Error::IoError(io::Error::new(io::ErrorKind::Other, e.to_string())));
        }
        Ok(())
    }

    /// Returns whether the connection is closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketConnection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if !self.is_closed() {
            debug!("WebSocket connection to {} dropped without being closed", self.peer_addr);
        }
    }
}
