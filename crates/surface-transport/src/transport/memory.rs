//! In-process transport for surfaces living in the same process
//!
//! Mobile builds host the media view natively, so commands are handed over as
//! typed records instead of JSON text. The ordering and single-close contract
//! is the same as for the WebSocket variant.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use super::{SurfaceTransport, TransportEvent, TransportKind};
use crate::error::{Error, Result};
use crate::message::{InboundRecord, OutboundRecord, SurfaceReport, SurfaceResponse};

/// Shared close flag; whoever flips it first reports the closure
#[derive(Debug, Clone)]
struct CloseLatch {
    closed: Arc<AtomicBool>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl CloseLatch {
    fn close(&self, reason: &str) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        debug!("In-process surface connection closed: {}", reason);
        let _ = self.events_tx.send(TransportEvent::Closed {
            reason: Some(reason.to_string()),
        });
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Native side of an in-process connection
#[derive(Debug)]
pub struct InProcessTransport {
    commands_tx: mpsc::UnboundedSender<OutboundRecord>,
    latch: CloseLatch,
}

/// Surface side of an in-process connection.
///
/// Receives commands in delivery order and pushes reports and responses back.
/// Dropping the endpoint closes the connection.
#[derive(Debug)]
pub struct SurfaceEndpoint {
    commands_rx: Mutex<mpsc::UnboundedReceiver<OutboundRecord>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    latch: CloseLatch,
}

impl InProcessTransport {
    /// Create a connected pair plus the native-side event receiver
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<TransportEvent>, SurfaceEndpoint) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let latch = CloseLatch {
            closed: Arc::new(AtomicBool::new(false)),
            events_tx: events_tx.clone(),
        };

        let transport = Self {
            commands_tx,
            latch: latch.clone(),
        };
        let endpoint = SurfaceEndpoint {
            commands_rx: Mutex::new(commands_rx),
            events_tx,
            latch,
        };
        (transport, events_rx, endpoint)
    }
}

#[async_trait::async_trait]
impl SurfaceTransport for InProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::InProcess
    }

    async fn deliver(&self, record: OutboundRecord) -> Result<()> {
        if self.latch.is_closed() {
            return Err(Error::TransportClosed);
        }
        trace!("Delivering {} in-process", record.command.type_name());
        if self.commands_tx.send(record).is_err() {
            self.latch.close("surface endpoint dropped");
            return Err(Error::TransportClosed);
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.latch.close("closed by native side");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }
}

impl SurfaceEndpoint {
    /// Wait for the next command delivered to the surface.
    ///
    /// Returns `None` once the native side has gone away and the queue is
    /// drained.
    pub async fn next_command(&self) -> Option<OutboundRecord> {
        self.commands_rx.lock().await.recv().await
    }

    /// Take an already delivered command without waiting
    pub async fn try_next_command(&self) -> Option<OutboundRecord> {
        self.commands_rx.lock().await.try_recv().ok()
    }

    /// Push a surface report (`{"command": ...}`)
    pub fn report(&self, report: SurfaceReport) -> Result<()> {
        self.send_record(InboundRecord::report(report))
    }

    /// Push a response (`{"corrId": ..., "resp": ...}`)
    pub fn respond(&self, corr_id: Option<u64>, resp: SurfaceResponse) -> Result<()> {
        self.send_record(InboundRecord::response(corr_id, resp))
    }

    /// Push an arbitrary inbound record
    pub fn send_record(&self, record: InboundRecord) -> Result<()> {
        if self.latch.is_closed() {
            return Err(Error::TransportClosed);
        }
        self.events_tx
            .send(TransportEvent::MessageReceived(record))
            .map_err(|_| Error::TransportClosed)
    }

    /// Close the connection from the surface side
    pub fn close(&self) {
        self.latch.close("closed by surface");
    }

    pub fn is_closed(&self) -> bool {
        self.latch.is_closed()
    }
}

impl Drop for SurfaceEndpoint {
    fn drop(&mut self) {
        self.latch.close("surface endpoint dropped");
    }
}
