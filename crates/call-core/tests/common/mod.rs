//! Recording doubles shared by the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use callbridge_call_core::prelude::*;
use callbridge_call_core::{
    ConnectionState, NotificationKey, NotificationTracker, SessionActor, SurfaceAction,
};
use callbridge_surface_transport::{
    CallCommand, InProcessTransport, SignalingSurfaceAdapter, SurfaceEndpoint,
};

/// Engine double that records every call it receives
pub struct FakeEngine {
    events_tx: mpsc::UnboundedSender<EngineEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    log: Mutex<Vec<String>>,
    fail_accept: Mutex<Option<EngineError>>,
    accepted_state: Mutex<ConnectionState>,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            log: Mutex::new(Vec::new()),
            fail_accept: Mutex::new(None),
            accepted_state: Mutex::new(ConnectionState::Connecting),
        })
    }

    /// Push an event into the engine's event stream
    pub fn emit(&self, event: EngineEvent) {
        self.events_tx.send(event).unwrap();
    }

    pub fn fail_next_accept(&self, error: EngineError) {
        *self.fail_accept.lock() = Some(error);
    }

    /// Connection state reported for accepted calls
    pub fn accept_as(&self, state: ConnectionState) {
        *self.accepted_state.lock() = state;
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|entry| entry.split(':').next() == Some(operation))
            .count()
    }

    fn record(&self, operation: &str, remote: &RemoteParty) {
        self.log
            .lock()
            .push(format!("{}:{}", operation, remote.contact_id));
    }
}

#[async_trait::async_trait]
impl CallEngine for FakeEngine {
    async fn start_call(&self, remote: &RemoteParty, media: CallMediaType) -> std::result::Result<ActiveCall, EngineError> {
        self.record("start", remote);
        Ok(ActiveCall::new(remote.clone(), media, None))
    }

    async fn accept_call(&self, invitation: &CallInvitation) -> std::result::Result<ActiveCall, EngineError> {
        if let Some(error) = self.fail_accept.lock().take() {
            return Err(error);
        }
        self.record("accept", &invitation.remote);
        let mut call = ActiveCall::from_invitation(invitation);
        call.connection_state = *self.accepted_state.lock();
        Ok(call)
    }

    async fn reject_call(&self, invitation: &CallInvitation) -> std::result::Result<(), EngineError> {
        self.record("reject", &invitation.remote);
        Ok(())
    }

    async fn end_call(&self, call: &ActiveCall) -> std::result::Result<(), EngineError> {
        self.record("end", &call.remote);
        Ok(())
    }

    fn events(&self) -> BoxStream<'static, EngineEvent> {
        match self.events_rx.lock().take() {
            Some(rx) => UnboundedReceiverStream::new(rx).boxed(),
            None => futures::stream::empty().boxed(),
        }
    }
}

/// Notification manager double
#[derive(Default)]
pub struct RecordingNotifier {
    posted: Mutex<Vec<NotificationKey>>,
    cancelled: Mutex<Vec<NotificationKey>>,
}

impl RecordingNotifier {
    pub fn posted(&self) -> Vec<NotificationKey> {
        self.posted.lock().clone()
    }

    pub fn cancel_count(&self, key: NotificationKey) -> usize {
        self.cancelled.lock().iter().filter(|k| **k == key).count()
    }

    pub fn cancelled(&self) -> Vec<NotificationKey> {
        self.cancelled.lock().clone()
    }
}

impl NotificationManager for RecordingNotifier {
    fn notify_invitation(&self, invitation: &CallInvitation) {
        self.posted.lock().push(NotificationKey::Invitation(invitation.id));
    }

    fn notify_active_call(&self, call: &ActiveCall) {
        self.posted.lock().push(NotificationKey::Call(call.id));
    }

    fn cancel(&self, key: NotificationKey) {
        self.cancelled.lock().push(key);
    }
}

/// Surface controller double recording every action in order
#[derive(Default)]
pub struct RecordingController {
    actions: Mutex<Vec<SurfaceAction>>,
    rendered: Mutex<Option<InvitationId>>,
}

impl RecordingController {
    pub fn actions(&self) -> Vec<SurfaceAction> {
        self.actions.lock().clone()
    }

    pub fn count(&self, action: SurfaceAction) -> usize {
        self.actions.lock().iter().filter(|a| **a == action).count()
    }

    /// Invitation carried by the last view shown
    pub fn rendered_invitation(&self) -> Option<InvitationId> {
        *self.rendered.lock()
    }
}

#[async_trait::async_trait]
impl SurfaceController for RecordingController {
    async fn show(&self, kind: SurfaceKind, view: &SurfaceView) -> Result<()> {
        *self.rendered.lock() = view.invitation.as_ref().map(|i| i.id);
        self.actions.lock().push(SurfaceAction::Show(kind));
        Ok(())
    }

    async fn dismiss(&self, kind: SurfaceKind) -> Result<()> {
        self.actions.lock().push(SurfaceAction::Dismiss(kind));
        Ok(())
    }

    async fn enter_picture_in_picture(&self) -> Result<()> {
        self.actions.lock().push(SurfaceAction::EnterPictureInPicture);
        Ok(())
    }

    async fn restore(&self) -> Result<()> {
        self.actions.lock().push(SurfaceAction::Restore);
        Ok(())
    }

    async fn move_to_background(&self) -> Result<()> {
        self.actions.lock().push(SurfaceAction::MoveToBackground);
        Ok(())
    }
}

/// A session actor wired to doubles and an in-process surface
pub struct Harness {
    pub engine: Arc<FakeEngine>,
    pub notifier: Arc<RecordingNotifier>,
    pub tracker: NotificationTracker,
    pub adapter: SignalingSurfaceAdapter,
    pub session: SessionHandle,
    pub surface: SurfaceEndpoint,
}

impl Harness {
    pub fn start(config: BridgeConfig) -> Self {
        let engine = FakeEngine::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let tracker = NotificationTracker::new(notifier.clone());

        let adapter = SignalingSurfaceAdapter::new();
        let (transport, events_rx, surface) = InProcessTransport::pair();
        adapter.attach(transport, events_rx);

        let (session, _task) = SessionActor::spawn(config, engine.clone(), adapter.clone(), tracker.clone());
        Self {
            engine,
            notifier,
            tracker,
            adapter,
            session,
            surface,
        }
    }

    /// Next command delivered to the surface
    pub async fn next_command(&self) -> CallCommand {
        tokio::time::timeout(Duration::from_secs(5), self.surface.next_command())
            .await
            .expect("no command delivered to the surface")
            .expect("surface connection closed")
            .command
    }
}

pub fn contact(id: &str) -> RemoteParty {
    RemoteParty::new(None, id)
}

pub fn invitation(id: &str, media: CallMediaType) -> CallInvitation {
    CallInvitation::new(contact(id), media, Some(format!("key-{}", id)))
}

/// Wait until the session state satisfies `predicate`
pub async fn wait_for_state<F>(session: &SessionHandle, predicate: F) -> CallSessionState
where
    F: Fn(&CallSessionState) -> bool,
{
    let mut rx = session.watch();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if predicate(&state) {
                    return state.clone();
                }
            }
            rx.changed().await.expect("session actor stopped");
        }
    })
    .await
    .expect("session never reached the expected state")
}

/// Wait until the coordinator presents `expected`
pub async fn wait_for_presentation(coordinator: &CoordinatorHandle, expected: PresentationState) {
    let mut rx = coordinator.watch_presentation();
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if *rx.borrow_and_update() == expected {
                return;
            }
            rx.changed().await.expect("coordinator stopped");
        }
    })
    .await
    .expect("presentation never reached the expected state")
}

/// Poll `condition` until it holds
pub async fn eventually<F>(what: &str, condition: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("timed out waiting for {}", what);
}
