//! Lifecycle coordinator
//!
//! Binds OS lifecycle signals and notification actions to session operations,
//! and turns presentation changes into [`SurfaceController`] calls and layout
//! commands. The coordinator never mutates session state itself; everything
//! goes through the [`SessionHandle`].

mod subscription;

pub use subscription::Subscription;

use std::sync::Arc;

use futures::Stream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callbridge_surface_transport::{CallCommand, SignalingSurfaceAdapter};

use crate::config::{BridgeConfig, CallOnLockScreen};
use crate::error::{CallError, Result};
use crate::presentation::{
    can_enter_pip, OsContext, PresentationMachine, PresentationState, SurfaceAction, SurfaceKind,
    SurfacePlan, SurfaceController, SurfaceView,
};
use crate::session::{CallSessionState, SessionEvent, SessionHandle, TeardownOutcome};
use crate::types::{
    ActiveCall, CallMediaType, ContactId, InvitationId, LayoutType, RemoteHostId, RemoteParty,
};

/// Action picked on an incoming-call notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationAction {
    Accept {
        remote_host_id: Option<RemoteHostId>,
        chat_id: ContactId,
    },
    Reject {
        remote_host_id: Option<RemoteHostId>,
        chat_id: ContactId,
    },
}

/// OS lifecycle signals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleSignal {
    /// The call surface (activity/window) was created
    SurfaceCreated,
    /// The call surface was torn down by the OS or the user
    SurfaceDestroyed,
    Backgrounded,
    Foregrounded,
    /// The user is leaving the app (home button, app switch)
    UserLeaveHint,
    /// The user pressed minimize on the call surface
    MinimizeRequested,
    /// The user asked to bring the collapsed call back
    ExpandRequested,
    /// The OS entered (`true`) or left picture-in-picture
    PipModeChanged(bool),
    /// The keyguard was locked (`true`) or unlocked
    KeyguardChanged(bool),
    Notification(NotificationAction),
}

/// Events published by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum CoordinatorEvent {
    PresentationChanged {
        from: PresentationState,
        to: PresentationState,
    },
    /// A single dismissible alert for a failed call setup
    Alert { message: String },
}

/// Log a user-triggered session operation, turning no-op errors into `None`
fn user_action<T>(action: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_user_noop() => {
            debug!("Ignoring {}: {}", action, e);
            Ok(None)
        }
        Err(e) if e.is_recovered() => {
            warn!("{} recovered: {}", action, e);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Handle to a running coordinator
pub struct CoordinatorHandle {
    session: SessionHandle,
    signals_tx: mpsc::UnboundedSender<LifecycleSignal>,
    events_tx: broadcast::Sender<CoordinatorEvent>,
    presentation_rx: watch::Receiver<PresentationState>,
    task: Subscription,
}

impl std::fmt::Debug for CoordinatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorHandle")
            .field("presentation", &*self.presentation_rx.borrow())
            .field("running", &self.task.is_active())
            .finish()
    }
}

impl CoordinatorHandle {
    /// Deliver an OS lifecycle signal
    pub fn signal(&self, signal: LifecycleSignal) -> Result<()> {
        self.signals_tx
            .send(signal)
            .map_err(|_| CallError::ChannelClosed)
    }

    /// Register a source of lifecycle signals; dropping the guard unregisters it
    pub fn bind_signals<S>(&self, name: impl Into<String>, source: S) -> Subscription
    where
        S: Stream<Item = LifecycleSignal> + Send + 'static,
    {
        Subscription::forward(name, source, self.signals_tx.clone())
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn presentation(&self) -> PresentationState {
        *self.presentation_rx.borrow()
    }

    pub fn watch_presentation(&self) -> watch::Receiver<PresentationState> {
        self.presentation_rx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events_tx.subscribe()
    }

    /// Accept the invitation a surface rendered
    ///
    /// A no-op if that invitation was already resolved or replaced by a newer
    /// one, so a tap on a stale incoming-call view never answers a different call.
    pub async fn accept_call(&self, invitation: InvitationId) -> Result<Option<ActiveCall>> {
        user_action("accept", self.session.accept_invitation_id(invitation).await)
    }

    pub async fn reject_call(&self, invitation: InvitationId) -> Result<Option<()>> {
        user_action("reject", self.session.reject_invitation_id(invitation).await)
    }

    pub async fn ignore_call(&self, invitation: InvitationId) -> Result<Option<()>> {
        user_action("ignore", self.session.ignore_invitation_id(invitation).await)
    }

    /// Hang up (no-op if there is no call)
    pub async fn end_call(&self) -> Result<Option<TeardownOutcome>> {
        user_action("end", self.session.end_active_call().await)
    }

    pub async fn start_call(&self, remote: RemoteParty, media: CallMediaType) -> Result<Option<ActiveCall>> {
        user_action("start", self.session.start_call(remote, media).await)
    }

    pub async fn toggle_media(&self, kind: CallMediaType) -> Result<Option<()>> {
        user_action("toggle media", self.session.toggle_media(kind).await)
    }

    /// Stop the coordinator task and wait for it to exit
    pub async fn shutdown(&self) {
        self.task.unsubscribe();
        self.task.join().await;
    }
}

/// The lifecycle coordinator task
pub struct LifecycleCoordinator {
    policy: CallOnLockScreen,
    pip_auto_enter: bool,
    session: SessionHandle,
    adapter: SignalingSurfaceAdapter,
    controller: Arc<dyn SurfaceController>,

    machine: PresentationMachine,
    os: OsContext,
    /// The app was sent to background as the collapse fallback
    moved_to_background: bool,

    events_tx: broadcast::Sender<CoordinatorEvent>,
    presentation_tx: watch::Sender<PresentationState>,
}

impl LifecycleCoordinator {
    /// Spawn the coordinator for an already running session
    pub fn spawn(
        config: &BridgeConfig,
        session: SessionHandle,
        adapter: SignalingSurfaceAdapter,
        controller: Arc<dyn SurfaceController>,
        os: OsContext,
    ) -> CoordinatorHandle {
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.event_channel_capacity.max(1));
        let (presentation_tx, presentation_rx) = watch::channel(PresentationState::None);

        let coordinator = LifecycleCoordinator {
            policy: config.call_on_lock_screen,
            pip_auto_enter: config.pip_auto_enter,
            session: session.clone(),
            adapter,
            controller,
            machine: PresentationMachine::new(),
            os,
            moved_to_background: false,
            events_tx: events_tx.clone(),
            presentation_tx,
        };

        let task = Subscription::spawn("lifecycle-coordinator", move |token| {
            coordinator.run(signals_rx, token)
        });

        CoordinatorHandle {
            session,
            signals_tx,
            events_tx,
            presentation_rx,
            task,
        }
    }

    async fn run(mut self, mut signals: mpsc::UnboundedReceiver<LifecycleSignal>, token: CancellationToken) {
        info!("Lifecycle coordinator started");
        let mut state_rx = self.session.watch();
        let mut session_events = self.session.subscribe();

        let initial = state_rx.borrow_and_update().clone();
        self.refresh(&initial).await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                signal = signals.recv() => match signal {
                    Some(signal) => self.handle_signal(signal).await,
                    None => break,
                },
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        debug!("Session actor stopped");
                        break;
                    }
                    let state = state_rx.borrow_and_update().clone();
                    self.refresh(&state).await;
                }
                event = session_events.recv() => match event {
                    Ok(event) => self.handle_session_event(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Coordinator lagged behind {} session events", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        info!("Lifecycle coordinator stopped");
    }

    fn publish(&self, event: CoordinatorEvent) {
        let _ = self.events_tx.send(event);
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::SetupFailed { message } => {
                self.publish(CoordinatorEvent::Alert { message });
            }
            SessionEvent::CallEnded { .. } => {
                self.moved_to_background = false;
            }
            _ => {}
        }
    }

    /// Recompute the presentation and apply the resulting plan
    async fn refresh(&mut self, state: &CallSessionState) {
        if state.active_call.is_none() {
            self.moved_to_background = false;
        }
        let Some(plan) = self.machine.update(state, &self.os, self.policy) else {
            return;
        };

        info!("Presentation {} -> {}", plan.from, plan.to);
        self.apply(&plan, state).await;
        self.presentation_tx.send_replace(plan.to);
        self.publish(CoordinatorEvent::PresentationChanged {
            from: plan.from,
            to: plan.to,
        });
    }

    async fn apply(&self, plan: &SurfacePlan, state: &CallSessionState) {
        for action in &plan.actions {
            self.perform(action, state).await;
        }
    }

    /// Run one surface action, returning whether it succeeded
    async fn perform(&self, action: &SurfaceAction, state: &CallSessionState) -> bool {
        let result = match action {
            SurfaceAction::Show(kind) => {
                let view = SurfaceView::from_session(state, self.policy);
                self.controller.show(*kind, &view).await
            }
            SurfaceAction::Dismiss(kind) => self.controller.dismiss(*kind).await,
            SurfaceAction::EnterPictureInPicture => self.controller.enter_picture_in_picture().await,
            SurfaceAction::Restore => self.controller.restore().await,
            SurfaceAction::MoveToBackground => self.controller.move_to_background().await,
            SurfaceAction::SetLayout(layout) => {
                self.send_layout(*layout).await;
                Ok(())
            }
        };
        match result {
            Ok(()) => true,
            Err(e) => {
                warn!("Surface action {:?} failed: {}", action, e);
                false
            }
        }
    }

    async fn send_layout(&self, layout: LayoutType) {
        if let Err(e) = self.adapter.send(CallCommand::Layout { value: layout }).await {
            debug!("Could not switch layout to {:?}: {}", layout, e);
        }
    }

    async fn handle_signal(&mut self, signal: LifecycleSignal) {
        debug!("Lifecycle signal: {:?}", signal);
        let state = self.session.snapshot();

        match signal {
            LifecycleSignal::SurfaceCreated => {
                self.os.app_foregrounded = true;
                if !state.has_call_activity() && !state.switching_call {
                    // Nothing to show; close the surface the OS just created
                    if let Err(e) = self.controller.dismiss(SurfaceKind::Foreground).await {
                        warn!("Failed to dismiss empty call surface: {}", e);
                    }
                    return;
                }
                self.refresh(&state).await;
            }
            LifecycleSignal::SurfaceDestroyed => {
                // A call sent to background keeps its surface
                if state.active_call.is_some() && !self.moved_to_background {
                    info!("Call surface destroyed during an active call; hanging up");
                    self.spawn_end_call();
                }
            }
            LifecycleSignal::Backgrounded => {
                self.os.app_foregrounded = false;
                self.refresh(&state).await;
            }
            LifecycleSignal::Foregrounded => {
                self.os.app_foregrounded = true;
                if state.surface_collapsed && (self.os.in_picture_in_picture || self.moved_to_background) {
                    self.moved_to_background = false;
                    self.expand().await;
                } else {
                    self.refresh(&state).await;
                }
            }
            LifecycleSignal::UserLeaveHint => {
                let Some(call) = &state.active_call else {
                    return;
                };
                if can_enter_pip(call, &self.os) && !self.pip_auto_enter && !state.surface_collapsed {
                    self.collapse().await;
                }
            }
            LifecycleSignal::MinimizeRequested => {
                let Some(call) = &state.active_call else {
                    return;
                };
                // PiP wins over the background fallback when both are possible
                let pip = can_enter_pip(call, &self.os);
                self.collapse().await;
                if !pip {
                    info!("Picture-in-picture unavailable; moving the call to background");
                    if self.perform(&SurfaceAction::MoveToBackground, &state).await {
                        self.moved_to_background = true;
                    }
                }
            }
            LifecycleSignal::ExpandRequested => self.expand().await,
            LifecycleSignal::PipModeChanged(in_pip) => {
                self.os.in_picture_in_picture = in_pip;
                if in_pip && !state.surface_collapsed {
                    self.collapse().await;
                } else if !in_pip && state.surface_collapsed {
                    self.expand().await;
                } else {
                    self.refresh(&state).await;
                }
            }
            LifecycleSignal::KeyguardChanged(locked) => {
                self.os.keyguard_locked = locked;
                self.refresh(&state).await;
            }
            LifecycleSignal::Notification(action) => self.spawn_notification_action(action),
        }
    }

    async fn collapse(&self) {
        if let Err(e) = user_action("collapse", self.session.collapse().await) {
            warn!("Collapse failed: {}", e);
        }
    }

    async fn expand(&self) {
        if let Err(e) = user_action("expand", self.session.expand().await) {
            warn!("Expand failed: {}", e);
        }
    }

    fn spawn_end_call(&self) {
        let session = self.session.clone();
        tokio::spawn(async move {
            match user_action("implicit hang-up", session.end_active_call().await) {
                Ok(Some(outcome)) => debug!("Implicit hang-up finished: {:?}", outcome),
                Ok(None) => {}
                Err(e) => warn!("Implicit hang-up failed: {}", e),
            }
        });
    }

    /// Notification actions may wait out a teardown; run them off the coordinator loop
    fn spawn_notification_action(&self, action: NotificationAction) {
        let session = self.session.clone();
        tokio::spawn(async move {
            let result = match action {
                NotificationAction::Accept {
                    remote_host_id,
                    chat_id,
                } => user_action(
                    "notification accept",
                    session
                        .accept_from_notification(remote_host_id, chat_id)
                        .await
                        .map(|_| ()),
                ),
                NotificationAction::Reject {
                    remote_host_id,
                    chat_id,
                } => user_action(
                    "notification reject",
                    session.reject_from_notification(remote_host_id, chat_id).await,
                ),
            };
            if let Err(e) = result {
                warn!("Notification action failed: {}", e);
            }
        });
    }
}
