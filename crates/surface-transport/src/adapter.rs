//! Signaling surface adapter
//!
//! The adapter owns the connection to the surface. Commands go through a
//! per-connection FIFO queue drained by a single writer task, so they reach
//! the surface in the order [`SignalingSurfaceAdapter::send`] was called.
//! Inbound records are decoded into [`CallEvent`]s and fanned out to every
//! subscriber of the current connection.
//!
//! When a connection closes, each subscriber receives exactly one
//! [`CallEvent::Disconnected`] and its stream ends. When a connection is
//! replaced by a newer one, subscribers get the `Disconnected` for the old
//! connection and then keep receiving events from the new one on the same
//! stream. Subscribers registered while no connection is attached start
//! receiving events from the next one.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::Stream;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::message::{CallCommand, CallEvent, OutboundRecord};
use crate::transport::{SurfaceTransport, TransportEvent, TransportKind};

/// Commands awaiting a response before the oldest is forgotten
const MAX_IN_FLIGHT: usize = 256;

struct QueuedCommand {
    record: OutboundRecord,
    done: oneshot::Sender<Result<()>>,
}

struct LiveConnection {
    queue_tx: mpsc::UnboundedSender<QueuedCommand>,
    transport: Arc<dyn SurfaceTransport>,
}

#[derive(Default)]
struct ConnectionSlot {
    generation: u64,
    connection: Option<LiveConnection>,
    subscribers: Vec<mpsc::UnboundedSender<CallEvent>>,
    /// Command types awaiting an `ok`/`error` response, by correlation id
    in_flight: BTreeMap<u64, &'static str>,
}

struct AdapterInner {
    slot: Mutex<ConnectionSlot>,
    next_corr_id: AtomicU64,
}

/// Typed front end to the embedded signaling surface
#[derive(Clone)]
pub struct SignalingSurfaceAdapter {
    inner: Arc<AdapterInner>,
}

impl std::fmt::Debug for SignalingSurfaceAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = self.inner.slot.lock();
        f.debug_struct("SignalingSurfaceAdapter")
            .field("generation", &slot.generation)
            .field("connected", &slot.connection.is_some())
            .field("subscribers", &slot.subscribers.len())
            .finish()
    }
}

impl Default for SignalingSurfaceAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalingSurfaceAdapter {
    /// Create an adapter with no connection attached
    pub fn new() -> Self {
        Self {
            inner: Arc::new(AdapterInner {
                slot: Mutex::new(ConnectionSlot::default()),
                next_corr_id: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a freshly opened connection and start its reader and writer tasks.
    ///
    /// A connection that is still attached is closed first. Its subscribers
    /// see their `Disconnected` and then continue with the new connection's
    /// events. Returns the connection generation.
    pub fn attach<T>(&self, transport: T, events_rx: mpsc::UnboundedReceiver<TransportEvent>) -> u64
    where
        T: SurfaceTransport + 'static,
    {
        let transport: Arc<dyn SurfaceTransport> = Arc::new(transport);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let (generation, replaced) = {
            let mut slot = self.inner.slot.lock();
            let replaced = slot.connection.take().map(|old| {
                hand_over_subscribers(&mut slot);
                old.transport
            });
            slot.generation += 1;
            slot.connection = Some(LiveConnection {
                queue_tx,
                transport: transport.clone(),
            });
            (slot.generation, replaced)
        };

        info!(
            "Signaling surface attached over {} transport (generation {})",
            transport.kind(),
            generation
        );

        if let Some(old) = replaced {
            debug!("Closing replaced surface connection");
            tokio::spawn(async move {
                if let Err(e) = old.close().await {
                    debug!("Error closing replaced surface connection: {}", e);
                }
            });
        }

        tokio::spawn(run_writer(self.inner.clone(), generation, transport, queue_rx));
        tokio::spawn(run_reader(self.inner.clone(), generation, events_rx));
        generation
    }

    /// Send a command to the surface.
    ///
    /// Resolves once the command has been handed to the transport and returns
    /// the correlation id it was sent with.
    pub async fn send(&self, command: CallCommand) -> Result<u64> {
        let (done_tx, done_rx) = oneshot::channel();

        let corr_id = {
            let mut slot = self.inner.slot.lock();
            let Some(connection) = slot.connection.as_ref() else {
                debug!("Dropping {} command: no surface connection", command.type_name());
                return Err(Error::TransportClosed);
            };

            let corr_id = self.inner.next_corr_id.fetch_add(1, Ordering::SeqCst);
            let command_type = command.type_name();
            connection
                .queue_tx
                .send(QueuedCommand {
                    record: OutboundRecord {
                        corr_id: Some(corr_id),
                        command,
                    },
                    done: done_tx,
                })
                .map_err(|_| Error::TransportClosed)?;
            slot.in_flight.insert(corr_id, command_type);
            while slot.in_flight.len() > MAX_IN_FLIGHT {
                if let Some((stale, stale_type)) = slot.in_flight.pop_first() {
                    debug!("No response to {} command {}; no longer tracked", stale_type, stale);
                }
            }
            corr_id
        };

        match done_rx.await {
            Ok(Ok(())) => Ok(corr_id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::TransportClosed),
        }
    }

    /// Subscribe to events from the current (or next) connection.
    ///
    /// Only events received after subscribing are delivered.
    pub fn events(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.slot.lock().subscribers.push(tx);
        EventStream { rx }
    }

    /// Close the current connection from the native side
    pub async fn close(&self) -> Result<()> {
        let generation = self.inner.slot.lock().generation;
        match self.inner.finish_connection(generation, "closed locally") {
            Some(transport) => transport.close().await,
            None => Ok(()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.slot.lock().connection.is_some()
    }

    /// Kind of the attached transport, if any
    pub fn transport_kind(&self) -> Option<TransportKind> {
        self.inner
            .slot
            .lock()
            .connection
            .as_ref()
            .map(|c| c.transport.kind())
    }

    /// Generation of the most recently attached connection
    pub fn generation(&self) -> u64 {
        self.inner.slot.lock().generation
    }
}

impl AdapterInner {
    fn dispatch(&self, generation: u64, event: CallEvent) {
        let mut slot = self.slot.lock();
        if slot.generation != generation || slot.connection.is_none() {
            trace!("Ignoring event from stale connection {}", generation);
            return;
        }

        match &event {
            CallEvent::Ok { corr_id: Some(id) } => {
                if let Some(command_type) = slot.in_flight.remove(id) {
                    trace!("Surface acknowledged {} command {}", command_type, id);
                }
            }
            CallEvent::Error { corr_id, message } => {
                let command_type = corr_id.and_then(|id| slot.in_flight.remove(&id));
                warn!(
                    "Surface reported error for {} command: {}",
                    command_type.unwrap_or("unknown"),
                    message
                );
            }
            _ => {}
        }

        slot.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Detach the connection of `generation`, if it is still the live one.
    ///
    /// Returns the transport so the caller can close it outside the lock.
    fn finish_connection(&self, generation: u64, reason: &str) -> Option<Arc<dyn SurfaceTransport>> {
        let mut slot = self.slot.lock();
        if slot.generation != generation {
            return None;
        }
        let connection = slot.connection.take()?;
        disconnect_subscribers(&mut slot);
        info!("Signaling surface disconnected (generation {}): {}", generation, reason);
        Some(connection.transport)
    }
}

fn disconnect_subscribers(slot: &mut ConnectionSlot) {
    for tx in slot.subscribers.drain(..) {
        let _ = tx.send(CallEvent::Disconnected);
    }
    slot.in_flight.clear();
}

/// Like [`disconnect_subscribers`], but subscribers stay registered for the next connection
fn hand_over_subscribers(slot: &mut ConnectionSlot) {
    slot.subscribers
        .retain(|tx| tx.send(CallEvent::Disconnected).is_ok());
    slot.in_flight.clear();
}

async fn run_writer(
    inner: Arc<AdapterInner>,
    generation: u64,
    transport: Arc<dyn SurfaceTransport>,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedCommand>,
) {
    while let Some(QueuedCommand { record, done }) = queue_rx.recv().await {
        let command_type = record.command.type_name();
        let result = transport.deliver(record).await;

        if let Err(e) = &result {
            warn!("Failed to deliver {} command: {}", command_type, e);
            if e.is_connection_closed() {
                let _ = done.send(Err(Error::TransportClosed));
                if let Some(transport) = inner.finish_connection(generation, "write failed") {
                    let _ = transport.close().await;
                }
                continue;
            }
        }
        let _ = done.send(result);
    }
    trace!("Surface writer for generation {} stopped", generation);
}

async fn run_reader(
    inner: Arc<AdapterInner>,
    generation: u64,
    mut events_rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let reason = loop {
        match events_rx.recv().await {
            Some(TransportEvent::MessageReceived(record)) => {
                let event = record.into_event();
                trace!("Surface event: {:?}", event);
                inner.dispatch(generation, event);
            }
            Some(TransportEvent::Error { error }) => {
                debug!("Surface transport error: {}", error);
            }
            Some(TransportEvent::Closed { reason }) => {
                break reason.unwrap_or_else(|| "closed".to_string());
            }
            None => break "transport dropped".to_string(),
        }
    };

    if let Some(transport) = inner.finish_connection(generation, &reason) {
        if !transport.is_closed() {
            let _ = transport.close().await;
        }
    }
}

/// Stream of [`CallEvent`]s from the attached connection.
///
/// Follows the adapter across connection replacement. Ends after yielding
/// [`CallEvent::Disconnected`] for a connection that closed without a
/// successor.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<CallEvent>,
}

impl EventStream {
    /// Receive the next event, or `None` once the stream has ended
    pub async fn recv(&mut self) -> Option<CallEvent> {
        self.rx.recv().await
    }
}

impl Stream for EventStream {
    type Item = CallEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{CallMediaType, LayoutType, SurfaceReport, SurfaceResponse};
    use crate::transport::InProcessTransport;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let adapter = SignalingSurfaceAdapter::new();
        let result = adapter.send(CallCommand::End).await;
        assert!(matches!(result, Err(Error::TransportClosed)));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn test_commands_delivered_in_send_order() {
        let adapter = SignalingSurfaceAdapter::new();
        let (transport, events_rx, endpoint) = InProcessTransport::pair();
        adapter.attach(transport, events_rx);

        adapter
            .send(CallCommand::Layout {
                value: LayoutType::RemoteVideo,
            })
            .await
            .unwrap();
        adapter
            .send(CallCommand::ToggleMedia {
                kind: CallMediaType::Video,
            })
            .await
            .unwrap();
        adapter.send(CallCommand::End).await.unwrap();

        let types: Vec<_> = [
            endpoint.next_command().await.unwrap(),
            endpoint.next_command().await.unwrap(),
            endpoint.next_command().await.unwrap(),
        ]
        .iter()
        .map(|r| r.command.type_name())
        .collect();
        assert_eq!(types, vec!["layout", "toggleMedia", "end"]);
    }

    #[tokio::test]
    async fn test_disconnect_emitted_once_then_send_fails() {
        let adapter = SignalingSurfaceAdapter::new();
        let (transport, events_rx, endpoint) = InProcessTransport::pair();
        adapter.attach(transport, events_rx);
        let mut events = adapter.events();

        endpoint
            .report(SurfaceReport::Capabilities {
                media: CallMediaType::Audio,
            })
            .unwrap();
        endpoint.close();

        let collected: Vec<_> = (&mut events).collect().await;
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[1], CallEvent::Disconnected);

        assert!(matches!(
            adapter.send(CallCommand::End).await,
            Err(Error::TransportClosed)
        ));
        adapter.close().await.unwrap();
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_replacement_hands_subscribers_to_new_connection() {
        let adapter = SignalingSurfaceAdapter::new();

        let (first, first_rx, first_endpoint) = InProcessTransport::pair();
        adapter.attach(first, first_rx);
        let mut events = adapter.events();
        first_endpoint
            .respond(None, SurfaceResponse::Connected { connection_info: None })
            .unwrap();
        assert_eq!(events.recv().await, Some(CallEvent::Connected));

        let (second, second_rx, second_endpoint) = InProcessTransport::pair();
        let generation = adapter.attach(second, second_rx);
        assert_eq!(generation, 2);
        assert_eq!(events.recv().await, Some(CallEvent::Disconnected));

        // The old connection can no longer reach subscribers
        let _ = first_endpoint.respond(None, SurfaceResponse::Ok);
        second_endpoint.respond(None, SurfaceResponse::Ended).unwrap();
        assert_eq!(events.recv().await, Some(CallEvent::Ended));

        for _ in 0..10 {
            if first_endpoint.is_closed() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(first_endpoint.is_closed());

        // Closing without a successor ends the stream
        adapter.close().await.unwrap();
        assert_eq!(events.recv().await, Some(CallEvent::Disconnected));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_unanswered_commands_are_tracked_up_to_a_limit() {
        let adapter = SignalingSurfaceAdapter::new();
        let (transport, events_rx, _endpoint) = InProcessTransport::pair();
        adapter.attach(transport, events_rx);

        let mut first = None;
        let mut last = 0;
        for _ in 0..MAX_IN_FLIGHT + 10 {
            last = adapter.send(CallCommand::End).await.unwrap();
            first.get_or_insert(last);
        }

        let slot = adapter.inner.slot.lock();
        assert_eq!(slot.in_flight.len(), MAX_IN_FLIGHT);
        assert!(!slot.in_flight.contains_key(&first.unwrap()));
        assert_eq!(slot.in_flight.get(&last), Some(&"end"));
    }

    #[tokio::test]
    async fn test_error_response_reaches_subscribers() {
        let adapter = SignalingSurfaceAdapter::new();
        let (transport, events_rx, endpoint) = InProcessTransport::pair();
        adapter.attach(transport, events_rx);
        let mut events = adapter.events();

        let corr_id = adapter
            .send(CallCommand::ToggleMedia {
                kind: CallMediaType::Audio,
            })
            .await
            .unwrap();
        endpoint
            .respond(
                Some(corr_id),
                SurfaceResponse::Error {
                    message: "no audio track".to_string(),
                },
            )
            .unwrap();

        assert_eq!(
            events.recv().await,
            Some(CallEvent::Error {
                corr_id: Some(corr_id),
                message: "no audio track".to_string()
            })
        );
    }
}
