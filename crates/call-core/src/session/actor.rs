//! Single-writer session actor
//!
//! Every mutation of [`CallSessionState`] happens inside one tokio task. OS
//! callbacks, notification taps, engine events and signaling surface events
//! all arrive as messages and are handled one at a time, so two racing
//! requests resolve as first-committed-wins.
//!
//! Teardown never blocks the actor. `end_active_call` and call switching send
//! `end` to the surface, record a [`PendingTeardown`] and arm a timer. The
//! teardown completes on the acknowledging surface event or when the timer
//! fires, whichever comes first. Timers carry the generation they were armed
//! for and are ignored once that generation is gone, so a late timer can never
//! touch a newer call. Requests that need the call slot (new invitations,
//! accept, reject, start) are deferred while a teardown is pending and
//! replayed in arrival order once it completes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use callbridge_surface_transport::{CallCommand, CallEvent, SignalingSurfaceAdapter, VideoCamera};

use crate::config::BridgeConfig;
use crate::engine::{CallEngine, EngineEvent};
use crate::error::{CallError, Result};
use crate::notifications::{CancelReason, NotificationKey, NotificationTracker};
use crate::types::{
    ActiveCall, CallInvitation, CallMediaType, ConnectionState, ContactId, InvitationId, LayoutType,
    RemoteHostId, RemoteParty,
};

use super::state::{
    CallSessionState, EndReason, InvitationOutcome, SessionEvent, TeardownOutcome,
};

/// How many resolved invitation ids are remembered for stale detection
const RESOLVED_HISTORY: usize = 64;

/// How many unresolved invitations stay answerable from their notification
const RECEIVED_HISTORY: usize = 16;

type Reply<T> = oneshot::Sender<Result<T>>;

/// Requests handled by the session actor
enum SessionRequest {
    SetInvitation {
        invitation: CallInvitation,
        reply: Reply<()>,
    },
    AcceptInvitation {
        target: Option<InvitationId>,
        reply: Reply<ActiveCall>,
    },
    RejectInvitation {
        target: Option<InvitationId>,
        reply: Reply<()>,
    },
    IgnoreInvitation {
        target: Option<InvitationId>,
        reply: Reply<()>,
    },
    AcceptFromNotification {
        remote_host_id: Option<RemoteHostId>,
        contact_id: ContactId,
        reply: Reply<ActiveCall>,
    },
    RejectFromNotification {
        remote_host_id: Option<RemoteHostId>,
        contact_id: ContactId,
        reply: Reply<()>,
    },
    StartCall {
        remote: RemoteParty,
        media: CallMediaType,
        reply: Reply<ActiveCall>,
    },
    EndActiveCall {
        reply: Reply<TeardownOutcome>,
    },
    ToggleMedia {
        kind: CallMediaType,
        reply: Reply<()>,
    },
    SetLayout {
        layout: LayoutType,
        reply: Reply<()>,
    },
    SwitchCamera {
        camera: VideoCamera,
        reply: Reply<()>,
    },
    Collapse {
        reply: Reply<bool>,
    },
    Expand {
        reply: Reply<bool>,
    },
    Engine(EngineEvent),
    Surface(CallEvent),
}

impl SessionRequest {
    /// Requests that need the call slot and wait out a pending teardown
    fn waits_for_teardown(&self) -> bool {
        matches!(
            self,
            SessionRequest::SetInvitation { .. }
                | SessionRequest::AcceptInvitation { .. }
                | SessionRequest::RejectInvitation { .. }
                | SessionRequest::IgnoreInvitation { .. }
                | SessionRequest::AcceptFromNotification { .. }
                | SessionRequest::RejectFromNotification { .. }
                | SessionRequest::StartCall { .. }
                | SessionRequest::Engine(EngineEvent::Invitation(_))
                | SessionRequest::Engine(EngineEvent::InvitationWithdrawn { .. })
        )
    }
}

/// Timers armed by the actor, tagged with the generation they belong to
#[derive(Debug)]
enum TimerFired {
    Teardown { generation: u64 },
    Readiness { generation: u64 },
    InvitationExpired { generation: u64, invitation_id: InvitationId },
}

/// An `end` sent to the surface and not yet acknowledged
struct PendingTeardown {
    generation: u64,
    reason: EndReason,
    waiters: Vec<Reply<TeardownOutcome>>,
}

/// Handle to the session actor
#[derive(Clone)]
pub struct SessionHandle {
    requests: mpsc::Sender<SessionRequest>,
    state_rx: watch::Receiver<CallSessionState>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("state", &*self.state_rx.borrow())
            .finish()
    }
}

impl SessionHandle {
    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> SessionRequest) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.requests.send(make(reply)).await?;
        rx.await?
    }

    /// Install a new invitation, switching away from a call with another party first
    pub async fn set_invitation(&self, invitation: CallInvitation) -> Result<()> {
        self.request(|reply| SessionRequest::SetInvitation { invitation, reply })
            .await
    }

    /// Accept the pending invitation
    pub async fn accept_invitation(&self) -> Result<ActiveCall> {
        self.request(|reply| SessionRequest::AcceptInvitation {
            target: None,
            reply,
        })
        .await
    }

    /// Accept a specific invitation; fails with `StaleRequest` if it was already resolved
    pub async fn accept_invitation_id(&self, id: InvitationId) -> Result<ActiveCall> {
        self.request(|reply| SessionRequest::AcceptInvitation {
            target: Some(id),
            reply,
        })
        .await
    }

    /// Reject the pending invitation
    pub async fn reject_invitation(&self) -> Result<()> {
        self.request(|reply| SessionRequest::RejectInvitation {
            target: None,
            reply,
        })
        .await
    }

    /// Reject a specific invitation; fails with `StaleRequest` if it was already resolved
    pub async fn reject_invitation_id(&self, id: InvitationId) -> Result<()> {
        self.request(|reply| SessionRequest::RejectInvitation {
            target: Some(id),
            reply,
        })
        .await
    }

    /// Dismiss the pending invitation locally, leaving the remote call outstanding
    pub async fn ignore_invitation(&self) -> Result<()> {
        self.request(|reply| SessionRequest::IgnoreInvitation {
            target: None,
            reply,
        })
        .await
    }

    /// Dismiss a specific invitation locally; fails with `StaleRequest` if it was already resolved
    pub async fn ignore_invitation_id(&self, id: InvitationId) -> Result<()> {
        self.request(|reply| SessionRequest::IgnoreInvitation {
            target: Some(id),
            reply,
        })
        .await
    }

    /// Accept the most recent known invitation from `(remote_host_id, contact_id)`
    pub async fn accept_from_notification(
        &self,
        remote_host_id: Option<RemoteHostId>,
        contact_id: ContactId,
    ) -> Result<ActiveCall> {
        self.request(|reply| SessionRequest::AcceptFromNotification {
            remote_host_id,
            contact_id,
            reply,
        })
        .await
    }

    /// Reject the most recent known invitation from `(remote_host_id, contact_id)`
    pub async fn reject_from_notification(
        &self,
        remote_host_id: Option<RemoteHostId>,
        contact_id: ContactId,
    ) -> Result<()> {
        self.request(|reply| SessionRequest::RejectFromNotification {
            remote_host_id,
            contact_id,
            reply,
        })
        .await
    }

    /// Place an outgoing call
    pub async fn start_call(&self, remote: RemoteParty, media: CallMediaType) -> Result<ActiveCall> {
        self.request(|reply| SessionRequest::StartCall {
            remote,
            media,
            reply,
        })
        .await
    }

    /// Hang up the active call.
    ///
    /// Resolves once the surface acknowledged the end or the teardown timeout
    /// forced it.
    pub async fn end_active_call(&self) -> Result<TeardownOutcome> {
        self.request(|reply| SessionRequest::EndActiveCall { reply })
            .await
    }

    pub async fn toggle_media(&self, kind: CallMediaType) -> Result<()> {
        self.request(|reply| SessionRequest::ToggleMedia { kind, reply })
            .await
    }

    pub async fn set_layout(&self, layout: LayoutType) -> Result<()> {
        self.request(|reply| SessionRequest::SetLayout { layout, reply })
            .await
    }

    /// Switch between the front and back camera of the active call
    pub async fn switch_camera(&self, camera: VideoCamera) -> Result<()> {
        self.request(|reply| SessionRequest::SwitchCamera { camera, reply })
            .await
    }

    /// Mark the call surface collapsed. Returns whether anything changed.
    pub async fn collapse(&self) -> Result<bool> {
        self.request(|reply| SessionRequest::Collapse { reply }).await
    }

    /// Mark the call surface expanded. Returns whether anything changed.
    pub async fn expand(&self) -> Result<bool> {
        self.request(|reply| SessionRequest::Expand { reply }).await
    }

    /// Feed an engine event into the session
    pub async fn engine_event(&self, event: EngineEvent) -> Result<()> {
        self.requests.send(SessionRequest::Engine(event)).await?;
        Ok(())
    }

    /// Feed a signaling surface event into the session
    pub async fn surface_event(&self, event: CallEvent) -> Result<()> {
        self.requests.send(SessionRequest::Surface(event)).await?;
        Ok(())
    }

    /// Current state
    pub fn snapshot(&self) -> CallSessionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn watch(&self) -> watch::Receiver<CallSessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events_tx.subscribe()
    }

    /// Session events as a stream; lagged receivers skip what they missed
    pub fn event_stream(&self) -> impl futures::Stream<Item = SessionEvent> + Send + 'static {
        BroadcastStream::new(self.events_tx.subscribe()).filter_map(|event| async move { event.ok() })
    }

    /// Whether the actor is still running
    pub fn is_running(&self) -> bool {
        !self.requests.is_closed()
    }
}

/// The session actor
pub struct SessionActor {
    config: BridgeConfig,
    engine: Arc<dyn CallEngine>,
    adapter: SignalingSurfaceAdapter,
    notifications: NotificationTracker,

    state: CallSessionState,
    state_tx: watch::Sender<CallSessionState>,
    events_tx: broadcast::Sender<SessionEvent>,

    /// Unresolved invitations known to the session, oldest first
    received: Vec<CallInvitation>,
    /// Recently accepted, rejected or expired invitations
    resolved: VecDeque<InvitationId>,

    teardown: Option<PendingTeardown>,
    deferred: VecDeque<SessionRequest>,

    timer_tx: mpsc::UnboundedSender<TimerFired>,
    next_generation: u64,
    readiness_generation: Option<u64>,
    /// Expiry timer generation per unresolved invitation
    invitation_expiry: HashMap<InvitationId, u64>,
}

impl SessionActor {
    /// Spawn the actor and return its handle
    pub fn spawn(
        config: BridgeConfig,
        engine: Arc<dyn CallEngine>,
        adapter: SignalingSurfaceAdapter,
        notifications: NotificationTracker,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (requests_tx, requests_rx) = mpsc::channel(config.request_queue_capacity.max(1));
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallSessionState::default());
        let (events_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));

        let handle = SessionHandle {
            requests: requests_tx,
            state_rx,
            events_tx: events_tx.clone(),
        };

        let actor = SessionActor {
            config,
            engine,
            adapter,
            notifications,
            state: CallSessionState::default(),
            state_tx,
            events_tx,
            received: Vec::new(),
            resolved: VecDeque::new(),
            teardown: None,
            deferred: VecDeque::new(),
            timer_tx,
            next_generation: 0,
            readiness_generation: None,
            invitation_expiry: HashMap::new(),
        };

        let task = tokio::spawn(
            actor
                .run(requests_rx, timer_rx)
                .instrument(info_span!("call_session")),
        );
        (handle, task)
    }

    async fn run(
        mut self,
        mut requests: mpsc::Receiver<SessionRequest>,
        mut timers: mpsc::UnboundedReceiver<TimerFired>,
    ) {
        info!("Call session actor started");
        let mut surface_events = self.adapter.events();
        let mut engine_events = self.engine.events();
        let mut engine_open = true;

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                Some(timer) = timers.recv() => self.handle_timer(timer).await,
                event = surface_events.recv() => match event {
                    Some(event) => self.handle_surface_event(event).await,
                    // Per-connection stream ended; wait for the next connection
                    None => surface_events = self.adapter.events(),
                },
                event = engine_events.next(), if engine_open => match event {
                    Some(event) => self.handle_request(SessionRequest::Engine(event)).await,
                    None => {
                        debug!("Call engine event stream ended");
                        engine_open = false;
                    }
                },
            }

            self.drain_deferred().await;
            self.publish();
        }

        info!("Call session actor stopped");
    }

    fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    fn publish(&self) {
        debug_assert!(self.state.check_invariants().is_ok(), "{:?}", self.state.check_invariants());
        let state = &self.state;
        self.state_tx.send_if_modified(|current| {
            if current != state {
                *current = state.clone();
                true
            } else {
                false
            }
        });
    }

    /// Publish the state before answering so callers observe their own change
    fn reply<T>(&self, reply: Reply<T>, result: Result<T>) {
        self.publish();
        let _ = reply.send(result);
    }

    fn emit(&self, event: SessionEvent) {
        trace!("Session event: {:?}", event);
        let _ = self.events_tx.send(event);
    }

    fn arm_timer(&self, after: Duration, timer: TimerFired) {
        let timer_tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = timer_tx.send(timer);
        });
    }

    async fn drain_deferred(&mut self) {
        while self.teardown.is_none() {
            let Some(request) = self.deferred.pop_front() else {
                break;
            };
            self.handle_request(request).await;
        }
    }

    async fn handle_request(&mut self, request: SessionRequest) {
        if self.teardown.is_some() && request.waits_for_teardown() {
            trace!("Deferring request until teardown completes");
            self.deferred.push_back(request);
            return;
        }

        match request {
            SessionRequest::SetInvitation { invitation, reply } => {
                self.set_invitation(invitation, reply).await;
            }
            SessionRequest::AcceptInvitation { target, reply } => {
                self.accept_invitation(target, reply).await;
            }
            SessionRequest::RejectInvitation { target, reply } => {
                let result = self.reject_invitation(target).await;
                self.reply(reply, result);
            }
            SessionRequest::IgnoreInvitation { target, reply } => {
                let result = self.ignore_invitation(target);
                self.reply(reply, result);
            }
            SessionRequest::AcceptFromNotification {
                remote_host_id,
                contact_id,
                reply,
            } => match self.find_received(remote_host_id, &contact_id) {
                Some(id) => self.accept_invitation(Some(id), reply).await,
                None => {
                    debug!("No invitation from {} to accept", contact_id);
                    self.reply(reply, Err(CallError::NoInvitation));
                }
            },
            SessionRequest::RejectFromNotification {
                remote_host_id,
                contact_id,
                reply,
            } => {
                let result = match self.find_received(remote_host_id, &contact_id) {
                    Some(id) => self.reject_invitation(Some(id)).await,
                    None => Err(CallError::NoInvitation),
                };
                self.reply(reply, result);
            }
            SessionRequest::StartCall {
                remote,
                media,
                reply,
            } => {
                let result = self.start_call(remote, media).await;
                self.reply(reply, result);
            }
            SessionRequest::EndActiveCall { reply } => self.end_active_call(reply).await,
            SessionRequest::ToggleMedia { kind, reply } => {
                let result = self.send_call_command(CallCommand::ToggleMedia { kind }).await;
                self.reply(reply, result);
            }
            SessionRequest::SetLayout { layout, reply } => {
                let result = self
                    .send_call_command(CallCommand::Layout { value: layout })
                    .await;
                self.reply(reply, result);
            }
            SessionRequest::SwitchCamera { camera, reply } => {
                let result = self.send_call_command(CallCommand::Camera { camera }).await;
                self.reply(reply, result);
            }
            SessionRequest::Collapse { reply } => {
                let changed = self.set_collapsed(true);
                self.reply(reply, Ok(changed));
            }
            SessionRequest::Expand { reply } => {
                let changed = self.set_collapsed(false);
                self.reply(reply, Ok(changed));
            }
            SessionRequest::Engine(event) => self.handle_engine_event(event).await,
            SessionRequest::Surface(event) => self.handle_surface_event(event).await,
        }
    }

    // Invitations

    async fn set_invitation(&mut self, invitation: CallInvitation, reply: Reply<()>) {
        let switching = self
            .state
            .active_call
            .as_ref()
            .is_some_and(|call| call.remote != invitation.remote);

        if switching {
            info!(
                "Invitation from {} supersedes the active call; switching",
                invitation.remote
            );
            self.deferred
                .push_back(SessionRequest::SetInvitation { invitation, reply });
            self.begin_teardown(EndReason::Switched, None).await;
            return;
        }

        self.install_invitation(invitation);
        self.reply(reply, Ok(()));
    }

    fn install_invitation(&mut self, invitation: CallInvitation) {
        if let Some(previous) = self.state.invitation.take() {
            if previous.id != invitation.id {
                debug!("Invitation {} superseded by {}", previous.id, invitation.id);
                self.notifications
                    .cancel(NotificationKey::Invitation(previous.id), CancelReason::Superseded);
                self.emit(SessionEvent::InvitationCleared {
                    invitation_id: previous.id,
                    outcome: InvitationOutcome::Superseded,
                });
                self.forget_invitation(previous.id);
            }
        }

        info!(
            "Incoming {} call invitation from {}",
            invitation.media, invitation.remote
        );
        self.received.retain(|known| known.id != invitation.id);
        self.received.push(invitation.clone());
        while self.received.len() > RECEIVED_HISTORY {
            let evicted = self.received[0].id;
            debug!("Dropping ignored invitation {}", evicted);
            self.forget_invitation(evicted);
        }
        self.notifications.post_invitation(&invitation);

        if let Some(timeout) = self.config.invitation_timeout() {
            let generation = self.next_generation();
            self.invitation_expiry.insert(invitation.id, generation);
            self.arm_timer(
                timeout,
                TimerFired::InvitationExpired {
                    generation,
                    invitation_id: invitation.id,
                },
            );
        }

        self.state.invitation = Some(invitation.clone());
        self.emit(SessionEvent::InvitationReceived(invitation));
    }

    /// Resolve which invitation a request refers to
    fn resolve_target(&self, target: Option<InvitationId>) -> Result<CallInvitation> {
        match (target, &self.state.invitation) {
            (None, Some(pending)) => Ok(pending.clone()),
            (None, None) => Err(CallError::NoInvitation),
            (Some(id), _) => {
                if let Some(known) = self.received.iter().find(|known| known.id == id) {
                    Ok(known.clone())
                } else if self.resolved.contains(&id) {
                    Err(CallError::stale(format!("invitation {} was already resolved", id)))
                } else {
                    Err(CallError::NoInvitation)
                }
            }
        }
    }

    /// Most recently received unresolved invitation from exactly this party
    fn find_received(
        &self,
        remote_host_id: Option<RemoteHostId>,
        contact_id: &ContactId,
    ) -> Option<InvitationId> {
        self.received
            .iter()
            .enumerate()
            .filter(|(_, known)| known.remote.matches(remote_host_id, contact_id))
            .max_by_key(|(index, known)| (known.received_at, *index))
            .map(|(_, known)| known.id)
    }

    /// Remove an invitation from the pending slot, cancelling its notification
    fn clear_invitation(&mut self, id: InvitationId, outcome: InvitationOutcome, forget: bool) {
        let was_pending = self.state.invitation.as_ref().is_some_and(|pending| pending.id == id);
        if was_pending {
            self.state.invitation = None;
        }

        if forget {
            self.forget_invitation(id);
        }

        let reason = match outcome {
            InvitationOutcome::Accepted => CancelReason::Accepted,
            InvitationOutcome::Rejected => CancelReason::Rejected,
            InvitationOutcome::Ignored => CancelReason::Ignored,
            InvitationOutcome::TimedOut => CancelReason::TimedOut,
            InvitationOutcome::Superseded => CancelReason::Superseded,
            InvitationOutcome::Withdrawn => CancelReason::Withdrawn,
        };
        self.notifications
            .cancel(NotificationKey::Invitation(id), reason);

        if was_pending {
            self.emit(SessionEvent::InvitationCleared {
                invitation_id: id,
                outcome,
            });
        }
    }

    /// Make an invitation unanswerable; later requests naming it are stale
    fn forget_invitation(&mut self, id: InvitationId) {
        self.received.retain(|known| known.id != id);
        self.invitation_expiry.remove(&id);
        if !self.resolved.contains(&id) {
            self.resolved.push_back(id);
        }
        while self.resolved.len() > RESOLVED_HISTORY {
            self.resolved.pop_front();
        }
    }

    async fn accept_invitation(&mut self, target: Option<InvitationId>, reply: Reply<ActiveCall>) {
        let invitation = match self.resolve_target(target) {
            Ok(invitation) => invitation,
            Err(e) => {
                self.reply(reply, Err(e));
                return;
            }
        };

        if self.state.active_call.is_some() {
            info!("Ending the active call before accepting {}", invitation.id);
            self.deferred.push_back(SessionRequest::AcceptInvitation {
                target: Some(invitation.id),
                reply,
            });
            self.begin_teardown(EndReason::Switched, None).await;
            return;
        }

        let call = match self.engine.accept_call(&invitation).await {
            Ok(call) => call,
            Err(e) => {
                warn!("Failed to accept call from {}: {}", invitation.remote, e);
                self.emit(SessionEvent::SetupFailed {
                    message: format!("Could not accept call: {}", e),
                });
                self.reply(reply, Err(e.into()));
                return;
            }
        };

        self.clear_invitation(invitation.id, InvitationOutcome::Accepted, true);
        self.activate_call(call.clone());

        let start = CallCommand::Start {
            media: invitation.media,
            aes_key: invitation.shared_key.clone(),
        };
        match self.setup_surface(start).await {
            Ok(()) => {
                self.reply(reply, Ok(call));
            }
            Err(e) => {
                self.reply(reply, Err(e));
            }
        }
    }

    async fn reject_invitation(&mut self, target: Option<InvitationId>) -> Result<()> {
        let invitation = self.resolve_target(target)?;

        if let Err(e) = self.engine.reject_call(&invitation).await {
            warn!("Engine failed to reject call from {}: {}", invitation.remote, e);
        }
        info!("Rejected call from {}", invitation.remote);
        self.clear_invitation(invitation.id, InvitationOutcome::Rejected, true);
        Ok(())
    }

    fn ignore_invitation(&mut self, target: Option<InvitationId>) -> Result<()> {
        let invitation = self.resolve_target(target)?;
        debug!("Ignoring call from {}", invitation.remote);
        self.clear_invitation(invitation.id, InvitationOutcome::Ignored, false);
        Ok(())
    }

    // Calls

    async fn start_call(&mut self, remote: RemoteParty, media: CallMediaType) -> Result<ActiveCall> {
        if let Some(call) = &self.state.active_call {
            return Err(CallError::stale(format!(
                "call with {} is already active",
                call.remote
            )));
        }

        let call = match self.engine.start_call(&remote, media).await {
            Ok(call) => call,
            Err(e) => {
                warn!("Failed to start call to {}: {}", remote, e);
                self.emit(SessionEvent::SetupFailed {
                    message: format!("Could not start call: {}", e),
                });
                return Err(e.into());
            }
        };

        info!("Starting {} call to {}", media, remote);
        self.activate_call(call.clone());
        self.setup_surface(CallCommand::Capabilities { media: Some(media) })
            .await?;
        Ok(call)
    }

    fn activate_call(&mut self, call: ActiveCall) {
        self.state.show_call_view = false;
        self.state.surface_collapsed = false;
        self.state.active_call = Some(call.clone());
        self.notifications.post_active_call(&call);

        let generation = self.next_generation();
        self.readiness_generation = Some(generation);
        self.arm_timer(
            self.config.readiness_timeout(),
            TimerFired::Readiness { generation },
        );

        self.emit(SessionEvent::CallStarted(call));
    }

    /// Send the first command of a new call; the call is abandoned if the surface is gone
    async fn setup_surface(&mut self, command: CallCommand) -> Result<()> {
        match self.adapter.send(command).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let error = CallError::from(e);
                warn!("Signaling surface unavailable during call setup: {}", error);
                self.emit(SessionEvent::SetupFailed {
                    message: format!("Call view unavailable: {}", error),
                });
                if let Some(call) = self.state.active_call.clone() {
                    if let Err(e) = self.engine.end_call(&call).await {
                        debug!("Engine failed to end abandoned call: {}", e);
                    }
                }
                self.finish_call(EndReason::SetupFailed);
                Err(error)
            }
        }
    }

    async fn send_call_command(&mut self, command: CallCommand) -> Result<()> {
        if self.state.active_call.is_none() {
            return Err(CallError::NoActiveCall);
        }
        self.adapter.send(command).await?;
        Ok(())
    }

    fn set_collapsed(&mut self, collapsed: bool) -> bool {
        if self.state.active_call.is_none() {
            debug!("Ignoring collapse change without an active call");
            return false;
        }
        let changed = self.state.surface_collapsed != collapsed;
        self.state.surface_collapsed = collapsed;
        changed
    }

    async fn end_active_call(&mut self, reply: Reply<TeardownOutcome>) {
        if let Some(teardown) = self.teardown.as_mut() {
            teardown.waiters.push(reply);
            return;
        }
        if self.state.active_call.is_none() {
            self.reply(reply, Err(CallError::NoActiveCall));
            return;
        }
        self.begin_teardown(EndReason::Local, Some(reply)).await;
    }

    /// Send `end` for the active call and wait for its acknowledgement
    async fn begin_teardown(&mut self, reason: EndReason, waiter: Option<Reply<TeardownOutcome>>) {
        let Some(call) = self.state.active_call.clone() else {
            if let Some(waiter) = waiter {
                self.reply(waiter, Err(CallError::NoActiveCall));
            }
            return;
        };

        let generation = self.next_generation();
        self.readiness_generation = None;
        self.teardown = Some(PendingTeardown {
            generation,
            reason,
            waiters: waiter.into_iter().collect(),
        });

        if reason == EndReason::Switched {
            self.state.switching_call = true;
            self.emit(SessionEvent::SwitchingStarted { call_id: call.id });
        }
        info!("Ending call {} with {} ({:?})", call.id, call.remote, reason);

        if let Err(e) = self.engine.end_call(&call).await {
            warn!("Engine failed to end call {}: {}", call.id, e);
        }

        match self.adapter.send(CallCommand::End).await {
            Ok(_) => {
                self.arm_timer(
                    self.config.teardown_timeout(),
                    TimerFired::Teardown { generation },
                );
            }
            Err(e) if e.is_connection_closed() => {
                debug!("Signaling surface already gone; call {} ended", call.id);
                self.complete_teardown(TeardownOutcome::Acknowledged);
            }
            Err(e) => {
                warn!("Failed to send end for call {}: {}", call.id, e);
                self.arm_timer(
                    self.config.teardown_timeout(),
                    TimerFired::Teardown { generation },
                );
            }
        }
    }

    fn complete_teardown(&mut self, outcome: TeardownOutcome) {
        let Some(teardown) = self.teardown.take() else {
            return;
        };

        if outcome == TeardownOutcome::Forced {
            if let Some(call) = &self.state.active_call {
                let error = CallError::TeardownTimeout {
                    timeout: self.config.teardown_timeout(),
                };
                warn!("{} for call {}; ending it locally", error, call.id);
                self.emit(SessionEvent::TeardownForced { call_id: call.id });
            }
        }

        self.finish_call(teardown.reason);

        for waiter in teardown.waiters {
            self.reply(waiter, Ok(outcome));
        }
    }

    /// Move the active call to `last_ended` and release everything tied to it
    fn finish_call(&mut self, reason: EndReason) {
        let Some(mut call) = self.state.active_call.take() else {
            return;
        };

        call.connection_state = ConnectionState::Ended;
        self.state.switching_call = false;
        self.state.show_call_view = false;
        self.state.surface_collapsed = false;
        self.readiness_generation = None;
        self.notifications
            .cancel(NotificationKey::Call(call.id), CancelReason::CallEnded);

        info!("Call {} with {} ended ({:?})", call.id, call.remote, reason);
        self.emit(SessionEvent::CallEnded {
            call: call.clone(),
            reason,
        });
        self.state.last_ended = Some(call);
    }

    /// End the call right away after the other side already considers it over
    async fn end_immediately(&mut self, reason: EndReason, notify_engine: bool) {
        let Some(call) = self.state.active_call.clone() else {
            return;
        };
        if notify_engine {
            if let Err(e) = self.engine.end_call(&call).await {
                debug!("Engine failed to end call {}: {}", call.id, e);
            }
        }
        if reason != EndReason::TransportClosed {
            if let Err(e) = self.adapter.send(CallCommand::End).await {
                trace!("Could not forward end to the surface: {}", e);
            }
        }
        self.finish_call(reason);
    }

    fn update_connection_state(&mut self, state: ConnectionState) -> bool {
        let Some(call) = self.state.active_call.as_mut() else {
            return false;
        };
        if call.connection_state == state {
            return false;
        }
        debug!("Call {} connection state {:?} -> {:?}", call.id, call.connection_state, state);
        call.connection_state = state;
        let call_id = call.id;
        self.emit(SessionEvent::ConnectionChanged { call_id, state });
        true
    }

    fn mark_ready(&mut self) {
        let Some(call) = &self.state.active_call else {
            return;
        };
        if self.state.show_call_view {
            return;
        }
        let call_id = call.id;
        debug!("Signaling surface ready for call {}", call_id);
        self.state.show_call_view = true;
        self.readiness_generation = None;
        self.emit(SessionEvent::CallViewReady { call_id });
    }

    // Inbound events

    async fn handle_surface_event(&mut self, event: CallEvent) {
        if self.teardown.is_some() && event.is_teardown_ack() {
            debug!("Teardown acknowledged by {:?}", event);
            self.complete_teardown(TeardownOutcome::Acknowledged);
            return;
        }

        let Some(call) = self.state.active_call.clone() else {
            trace!("Surface event without an active call: {:?}", event);
            return;
        };
        let tearing_down = self.teardown.is_some();

        match &event {
            CallEvent::Disconnected => {
                info!("Signaling surface closed during call {}", call.id);
                self.end_immediately(EndReason::TransportClosed, true).await;
            }
            CallEvent::EndRequested if !tearing_down => {
                self.begin_teardown(EndReason::Surface, None).await;
            }
            CallEvent::Ended if !tearing_down => {
                self.end_immediately(EndReason::Surface, true).await;
            }
            CallEvent::MediaToggled { kind, enabled } => {
                if *kind == CallMediaType::Video {
                    if let Some(active) = self.state.active_call.as_mut() {
                        active.video_enabled = *enabled;
                    }
                }
                self.emit(SessionEvent::MediaChanged {
                    call_id: call.id,
                    kind: *kind,
                    enabled: *enabled,
                });
            }
            CallEvent::Error { .. } | CallEvent::Invalid { .. } | CallEvent::Ok { .. } => {}
            _ if tearing_down => {}
            _ => {
                if let Some(state) = event.connection_state() {
                    if state.is_terminal() {
                        self.end_immediately(EndReason::Surface, true).await;
                        return;
                    }
                    self.update_connection_state(state);
                }
                if event.is_readiness() {
                    self.mark_ready();
                }
                if let Err(e) = self.engine.surface_event(&call, &event).await {
                    warn!("Engine failed to relay surface event: {}", e);
                }
            }
        }
    }

    async fn handle_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::Invitation(invitation) => {
                let (reply, _) = oneshot::channel();
                self.set_invitation(invitation, reply).await;
            }
            EngineEvent::InvitationWithdrawn { remote } => {
                let withdrawn: Vec<InvitationId> = self
                    .received
                    .iter()
                    .filter(|known| known.remote == remote)
                    .map(|known| known.id)
                    .collect();
                for id in withdrawn {
                    debug!("Invitation {} withdrawn by {}", id, remote);
                    self.clear_invitation(id, InvitationOutcome::Withdrawn, true);
                }
            }
            EngineEvent::CallEnded { call_id } => {
                if self.state.active_call.as_ref().map(|c| c.id) != Some(call_id) {
                    return;
                }
                if self.teardown.is_some() {
                    self.complete_teardown(TeardownOutcome::Acknowledged);
                } else {
                    self.end_immediately(EndReason::Remote, false).await;
                }
            }
            EngineEvent::CallStateChanged { call_id, state } => {
                if self.state.active_call.as_ref().map(|c| c.id) != Some(call_id) {
                    return;
                }
                if state.is_terminal() {
                    if self.teardown.is_some() {
                        self.complete_teardown(TeardownOutcome::Acknowledged);
                    } else {
                        self.end_immediately(EndReason::Remote, false).await;
                    }
                } else {
                    self.update_connection_state(state);
                }
            }
            EngineEvent::Signaling { call_id, command } => {
                if self.state.active_call.as_ref().map(|c| c.id) != Some(call_id) {
                    debug!("Dropping {} for inactive call {}", command.type_name(), call_id);
                    return;
                }
                if let Err(e) = self.adapter.send(command).await {
                    warn!("Failed to forward negotiation to the surface: {}", e);
                }
            }
        }
    }

    async fn handle_timer(&mut self, timer: TimerFired) {
        match timer {
            TimerFired::Teardown { generation } => {
                if self.teardown.as_ref().map(|t| t.generation) == Some(generation) {
                    self.complete_teardown(TeardownOutcome::Forced);
                } else {
                    trace!("Ignoring stale teardown timer {}", generation);
                }
            }
            TimerFired::Readiness { generation } => {
                if self.readiness_generation == Some(generation) {
                    self.readiness_generation = None;
                    warn!(
                        "Signaling surface did not report readiness within {:?}",
                        self.config.readiness_timeout()
                    );
                }
            }
            TimerFired::InvitationExpired {
                generation,
                invitation_id,
            } => {
                if self.invitation_expiry.get(&invitation_id) != Some(&generation) {
                    trace!("Ignoring stale expiry timer {}", generation);
                    return;
                }
                let pending = self.state.invitation.as_ref().map(|i| i.id) == Some(invitation_id);
                info!("Invitation {} timed out", invitation_id);
                if pending {
                    self.clear_invitation(invitation_id, InvitationOutcome::TimedOut, true);
                } else {
                    // Notification already cancelled when it was ignored
                    self.forget_invitation(invitation_id);
                }
            }
        }
    }
}
