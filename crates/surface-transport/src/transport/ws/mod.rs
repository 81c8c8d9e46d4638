//! WebSocket variant of the command channel
//!
//! Desktop surfaces run in a WebView that connects back over a local
//! WebSocket. Each text frame carries exactly one JSON record.

mod connection;
mod listener;

pub use connection::WebSocketConnection;
pub use listener::WebSocketSurfaceListener;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::message::OutboundRecord;
use crate::transport::{SurfaceTransport, TransportEvent, TransportKind};

type WsReader = SplitStream<WebSocketStream<TcpStream>>;

/// One accepted WebSocket surface connection
#[derive(Debug, Clone)]
pub struct WebSocketSurfaceTransport {
    inner: Arc<WebSocketTransportInner>,
}

#[derive(Debug)]
struct WebSocketTransportInner {
    connection: WebSocketConnection,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    close_reported: AtomicBool,
}

impl WebSocketTransportInner {
    fn report_closed(&self, reason: Option<String>) {
        if self.close_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connection.mark_closed();
        debug!(
            "Surface connection {} closed: {}",
            self.connection.peer_addr(),
            reason.as_deref().unwrap_or("no reason")
        );
        let _ = self.events_tx.send(TransportEvent::Closed { reason });
    }
}

impl WebSocketSurfaceTransport {
    pub(crate) fn start(
        connection: WebSocketConnection,
        reader: WsReader,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let transport = Self {
            inner: Arc::new(WebSocketTransportInner {
                connection,
                events_tx,
                close_reported: AtomicBool::new(false),
            }),
        };
        transport.spawn_reader(reader);
        (transport, events_rx)
    }

    /// Address of the connected surface
    pub fn peer_addr(&self) -> std::net::SocketAddr {
        self.inner.connection.peer_addr()
    }

    fn spawn_reader(&self, mut reader: WsReader) {
        let inner = self.inner.clone();

        tokio::spawn(async move {
            let peer_addr = inner.connection.peer_addr();
            let reason = loop {
                if inner.close_reported.load(Ordering::SeqCst) {
                    break None;
                }

                let ws_message = match reader.next().await {
                    Some(Ok(msg)) => msg,
                    Some(Err(e)) => {
                        error!("Error reading from surface connection {}: {}", peer_addr, e);
                        break Some(format!("read error: {}", e));
                    }
                    None => {
                        debug!("Surface connection {} closed by peer", peer_addr);
                        break Some("closed by peer".to_string());
                    }
                };

                match inner.connection.process_ws_message(ws_message) {
                    Ok(Some(record)) => {
                        if inner.events_tx.send(TransportEvent::MessageReceived(record)).is_err() {
                            break Some("event receiver dropped".to_string());
                        }
                    }
                    Ok(None) => {
                        if inner.connection.is_closed() {
                            break Some("close frame".to_string());
                        }
                    }
                    Err(e) => {
                        warn!("Error processing frame from {}: {}", peer_addr, e);
                        let _ = inner.events_tx.send(TransportEvent::Error {
                            error: e.to_string(),
                        });
                    }
                }
            };

            inner.report_closed(reason);
        });
    }
}

#[async_trait::async_trait]
impl SurfaceTransport for WebSocketSurfaceTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn deliver(&self, record: OutboundRecord) -> Result<()> {
        let result = self.inner.connection.send_record(&record).await;
        if let Err(e) = &result {
            if e.is_connection_closed() {
                self.inner.report_closed(Some(e.to_string()));
            }
        }
        result
    }

    async fn close(&self) -> Result<()> {
        let result = self.inner.connection.close().await;
        self.inner.report_closed(Some("closed by native side".to_string()));
        result
    }

    fn is_closed(&self) -> bool {
        self.inner.close_reported.load(Ordering::SeqCst) || self.inner.connection.is_closed()
    }
}
