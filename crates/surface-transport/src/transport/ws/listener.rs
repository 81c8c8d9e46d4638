use std::net::SocketAddr;

use futures_util::StreamExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::connection::WebSocketConnection;
use super::WebSocketSurfaceTransport;
use crate::error::{Error, Result};
use crate::transport::TransportEvent;

/// Accepts WebSocket connections from signaling surfaces (desktop WebViews)
#[derive(Debug)]
pub struct WebSocketSurfaceListener {
    listener: TcpListener,
}

impl WebSocketSurfaceListener {
    /// Binds a WebSocket listener to the specified address
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::BindFailed(addr, e))?;

        let local_addr = listener.local_addr().map_err(Error::LocalAddrFailed)?;
        info!("Signaling surface listener bound to ws://{}", local_addr);

        Ok(Self { listener })
    }

    /// Returns the local address this listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Error::LocalAddrFailed)
    }

    /// Accepts the next surface connection and starts reading from it
    pub async fn accept(
        &self,
    ) -> Result<(WebSocketSurfaceTransport, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (stream, peer_addr) = self.listener.accept().await.map_err(Error::AcceptFailed)?;
        debug!("Accepted TCP connection for WebSocket from {}", peer_addr);

        let ws_stream = tokio_tungstenite::accept_async(stream).await.map_err(|e| {
            error!("WebSocket handshake failed with {}: {}", peer_addr, e);
            Error::WebSocketHandshakeFailed(e.to_string())
        })?;

        let (ws_writer, ws_reader) = ws_stream.split();
        let connection = WebSocketConnection::from_writer(ws_writer, peer_addr);

        info!("Signaling surface connected from {}", peer_addr);
        Ok(WebSocketSurfaceTransport::start(connection, ws_reader))
    }
}
