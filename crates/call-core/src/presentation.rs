//! Presentation state machine
//!
//! Decides which presentation surface owns the screen. [`derive`] is a pure
//! function of the session snapshot, the OS context and the lock-screen
//! policy; [`PresentationMachine`] remembers the last derived state and turns
//! each change into a [`SurfacePlan`] for the platform [`SurfaceController`].
//!
//! ```text
//! None ──► LockScreenAlert ──► Foreground ◄──► PictureInPicture
//!   ▲            │                 │                  │
//!   └────────────┴─────────────────┴──────────────────┘
//! ```
//!
//! An active call always takes priority over a pending invitation, so while a
//! call is being switched out the old call keeps the screen until teardown
//! completes.

use std::fmt;

use serde::Serialize;

use crate::config::CallOnLockScreen;
use crate::error::Result;
use crate::session::CallSessionState;
use crate::types::{ActiveCall, CallInvitation, LayoutType};

/// Which surface should be visible
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum PresentationState {
    #[default]
    None,
    LockScreenAlert,
    Foreground,
    PictureInPicture,
}

impl fmt::Display for PresentationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PresentationState::None => write!(f, "none"),
            PresentationState::LockScreenAlert => write!(f, "lock-screen alert"),
            PresentationState::Foreground => write!(f, "foreground"),
            PresentationState::PictureInPicture => write!(f, "picture-in-picture"),
        }
    }
}

/// OS facts the presentation depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OsContext {
    pub keyguard_locked: bool,
    pub app_foregrounded: bool,
    pub pip_supported: bool,
    /// The OS currently shows the call in picture-in-picture
    pub in_picture_in_picture: bool,
}

impl OsContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keyguard_locked(mut self, locked: bool) -> Self {
        self.keyguard_locked = locked;
        self
    }

    pub fn with_app_foregrounded(mut self, foregrounded: bool) -> Self {
        self.app_foregrounded = foregrounded;
        self
    }

    pub fn with_pip_supported(mut self, supported: bool) -> Self {
        self.pip_supported = supported;
        self
    }
}

/// Whether a collapsed call can be shown in picture-in-picture
pub fn can_enter_pip(call: &ActiveCall, os: &OsContext) -> bool {
    os.pip_supported && call.supports_video
}

/// Derive the presentation state for a session snapshot
pub fn derive(session: &CallSessionState, os: &OsContext, policy: CallOnLockScreen) -> PresentationState {
    if let Some(call) = &session.active_call {
        if session.surface_collapsed && can_enter_pip(call, os) {
            return PresentationState::PictureInPicture;
        }
        // Collapsing without PiP keeps the call view; the app goes to background instead
        return PresentationState::Foreground;
    }

    if session.invitation.is_some() {
        if os.keyguard_locked && policy != CallOnLockScreen::Disable {
            return PresentationState::LockScreenAlert;
        }
        if os.app_foregrounded {
            return PresentationState::Foreground;
        }
    }

    PresentationState::None
}

/// Platform surface variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SurfaceKind {
    LockScreen,
    Foreground,
    PictureInPicture,
}

impl SurfaceKind {
    fn of(state: PresentationState) -> Option<SurfaceKind> {
        match state {
            PresentationState::None => None,
            PresentationState::LockScreenAlert => Some(SurfaceKind::LockScreen),
            PresentationState::Foreground => Some(SurfaceKind::Foreground),
            PresentationState::PictureInPicture => Some(SurfaceKind::PictureInPicture),
        }
    }
}

/// One step of a presentation transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SurfaceAction {
    Show(SurfaceKind),
    Dismiss(SurfaceKind),
    EnterPictureInPicture,
    /// Bring an existing picture-in-picture window back to full size
    Restore,
    MoveToBackground,
    /// Switch the video layout rendered by the signaling surface
    SetLayout(LayoutType),
}

/// Actions produced by one transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfacePlan {
    pub from: PresentationState,
    pub to: PresentationState,
    pub actions: Vec<SurfaceAction>,
}

impl SurfacePlan {
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

fn plan_actions(from: PresentationState, to: PresentationState, os: &OsContext) -> Vec<SurfaceAction> {
    use PresentationState as P;

    let mut actions = Vec::new();
    match (from, to) {
        (P::Foreground, P::PictureInPicture) => {
            if !os.in_picture_in_picture {
                actions.push(SurfaceAction::EnterPictureInPicture);
            }
            actions.push(SurfaceAction::SetLayout(LayoutType::RemoteVideo));
        }
        (P::PictureInPicture, P::Foreground) => {
            if os.in_picture_in_picture {
                actions.push(SurfaceAction::Restore);
            }
            actions.push(SurfaceAction::SetLayout(LayoutType::Default));
        }
        (from, to) => {
            if let Some(kind) = SurfaceKind::of(from) {
                actions.push(SurfaceAction::Dismiss(kind));
            }
            match to {
                P::None => {}
                P::PictureInPicture => {
                    actions.push(SurfaceAction::Show(SurfaceKind::Foreground));
                    if !os.in_picture_in_picture {
                        actions.push(SurfaceAction::EnterPictureInPicture);
                    }
                    actions.push(SurfaceAction::SetLayout(LayoutType::RemoteVideo));
                }
                other => {
                    if let Some(kind) = SurfaceKind::of(other) {
                        actions.push(SurfaceAction::Show(kind));
                    }
                }
            }
        }
    }
    actions
}

/// Tracks the current presentation state and plans transitions
#[derive(Debug, Default)]
pub struct PresentationMachine {
    current: PresentationState,
}

impl PresentationMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> PresentationState {
        self.current
    }

    /// Recompute the state; returns a plan when it changed
    pub fn update(
        &mut self,
        session: &CallSessionState,
        os: &OsContext,
        policy: CallOnLockScreen,
    ) -> Option<SurfacePlan> {
        let next = derive(session, os, policy);
        if next == self.current {
            return None;
        }
        let plan = SurfacePlan {
            from: self.current,
            to: next,
            actions: plan_actions(self.current, next, os),
        };
        self.current = next;
        Some(plan)
    }
}

/// What a shown surface should render
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SurfaceView {
    pub invitation: Option<CallInvitation>,
    pub call: Option<ActiveCall>,
    pub show_call_view: bool,
    /// Offer accept/reject/ignore on the lock-screen alert
    pub lock_screen_controls: bool,
}

impl SurfaceView {
    pub fn from_session(session: &CallSessionState, policy: CallOnLockScreen) -> Self {
        Self {
            invitation: session.invitation.clone(),
            call: session.active_call.clone(),
            show_call_view: session.show_call_view,
            lock_screen_controls: policy == CallOnLockScreen::Accept,
        }
    }
}

/// Per-platform presentation surfaces
#[async_trait::async_trait]
pub trait SurfaceController: Send + Sync {
    async fn show(&self, kind: SurfaceKind, view: &SurfaceView) -> Result<()>;

    async fn dismiss(&self, kind: SurfaceKind) -> Result<()>;

    async fn enter_picture_in_picture(&self) -> Result<()>;

    /// Restore the call surface from picture-in-picture without creating a second one
    async fn restore(&self) -> Result<()>;

    /// Send the app to the background, keeping the call alive
    async fn move_to_background(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallMediaType, RemoteParty};

    fn invitation(contact: &str) -> CallInvitation {
        CallInvitation::new(RemoteParty::new(None, contact), CallMediaType::Video, None)
    }

    fn video_call(contact: &str) -> ActiveCall {
        ActiveCall::new(RemoteParty::new(None, contact), CallMediaType::Video, None)
    }

    fn pip_os() -> OsContext {
        OsContext::new()
            .with_app_foregrounded(true)
            .with_pip_supported(true)
    }

    #[test]
    fn test_empty_session_presents_nothing() {
        let session = CallSessionState::default();
        let os = pip_os().with_keyguard_locked(true);
        assert_eq!(derive(&session, &os, CallOnLockScreen::Accept), PresentationState::None);
    }

    #[test]
    fn test_invitation_on_lock_screen_follows_policy() {
        let session = CallSessionState {
            invitation: Some(invitation("alice")),
            ..Default::default()
        };
        let locked = OsContext::new().with_keyguard_locked(true);

        assert_eq!(
            derive(&session, &locked, CallOnLockScreen::Show),
            PresentationState::LockScreenAlert
        );
        assert_eq!(
            derive(&session, &locked, CallOnLockScreen::Disable),
            PresentationState::None
        );
        assert_eq!(
            derive(&session, &locked.with_app_foregrounded(true), CallOnLockScreen::Disable),
            PresentationState::Foreground
        );
    }

    #[test]
    fn test_collapse_without_pip_stays_foreground() {
        let session = CallSessionState {
            active_call: Some(video_call("alice")),
            surface_collapsed: true,
            ..Default::default()
        };
        let os = OsContext::new().with_app_foregrounded(true);
        assert_eq!(derive(&session, &os, CallOnLockScreen::Show), PresentationState::Foreground);
        assert_eq!(derive(&session, &pip_os(), CallOnLockScreen::Show), PresentationState::PictureInPicture);
    }

    #[test]
    fn test_audio_call_never_enters_pip() {
        let mut call = video_call("alice");
        call.supports_video = false;
        let session = CallSessionState {
            active_call: Some(call),
            surface_collapsed: true,
            ..Default::default()
        };
        assert_eq!(derive(&session, &pip_os(), CallOnLockScreen::Show), PresentationState::Foreground);
    }

    #[test]
    fn test_active_call_wins_over_new_invitation() {
        let session = CallSessionState {
            invitation: Some(invitation("bob")),
            active_call: Some(video_call("alice")),
            switching_call: true,
            ..Default::default()
        };
        let locked = pip_os().with_keyguard_locked(true);
        assert_eq!(derive(&session, &locked, CallOnLockScreen::Accept), PresentationState::Foreground);
    }

    #[test]
    fn test_machine_plans_pip_round_trip_once() {
        let mut machine = PresentationMachine::new();
        let mut session = CallSessionState {
            active_call: Some(video_call("alice")),
            ..Default::default()
        };
        let mut os = pip_os();

        let plan = machine.update(&session, &os, CallOnLockScreen::Show).unwrap();
        assert_eq!(plan.actions, vec![SurfaceAction::Show(SurfaceKind::Foreground)]);
        assert!(machine.update(&session, &os, CallOnLockScreen::Show).is_none());

        session.surface_collapsed = true;
        let plan = machine.update(&session, &os, CallOnLockScreen::Show).unwrap();
        assert_eq!(
            plan.actions,
            vec![
                SurfaceAction::EnterPictureInPicture,
                SurfaceAction::SetLayout(LayoutType::RemoteVideo),
            ]
        );

        os.in_picture_in_picture = true;
        session.surface_collapsed = false;
        let plan = machine.update(&session, &os, CallOnLockScreen::Show).unwrap();
        assert_eq!(
            plan.actions,
            vec![SurfaceAction::Restore, SurfaceAction::SetLayout(LayoutType::Default)]
        );
    }

    #[test]
    fn test_os_initiated_pip_is_not_entered_twice() {
        let mut machine = PresentationMachine::new();
        let mut session = CallSessionState {
            active_call: Some(video_call("alice")),
            ..Default::default()
        };
        let mut os = pip_os();
        machine.update(&session, &os, CallOnLockScreen::Show);

        os.in_picture_in_picture = true;
        session.surface_collapsed = true;
        let plan = machine.update(&session, &os, CallOnLockScreen::Show).unwrap();
        assert_eq!(plan.actions, vec![SurfaceAction::SetLayout(LayoutType::RemoteVideo)]);
    }

    #[test]
    fn test_lock_screen_to_foreground_dismisses_alert() {
        let mut machine = PresentationMachine::new();
        let mut session = CallSessionState {
            invitation: Some(invitation("alice")),
            ..Default::default()
        };
        let os = OsContext::new().with_keyguard_locked(true);
        machine.update(&session, &os, CallOnLockScreen::Accept);
        assert_eq!(machine.current(), PresentationState::LockScreenAlert);

        session.invitation = None;
        session.active_call = Some(video_call("alice"));
        let plan = machine.update(&session, &os, CallOnLockScreen::Accept).unwrap();
        assert_eq!(
            plan.actions,
            vec![
                SurfaceAction::Dismiss(SurfaceKind::LockScreen),
                SurfaceAction::Show(SurfaceKind::Foreground),
            ]
        );
    }

    #[test]
    fn test_end_while_collapsed_dismisses_pip() {
        let mut machine = PresentationMachine::new();
        let mut session = CallSessionState {
            active_call: Some(video_call("alice")),
            surface_collapsed: true,
            ..Default::default()
        };
        let os = pip_os();
        machine.update(&session, &os, CallOnLockScreen::Show);
        assert_eq!(machine.current(), PresentationState::PictureInPicture);

        session.active_call = None;
        session.surface_collapsed = false;
        let plan = machine.update(&session, &os, CallOnLockScreen::Show).unwrap();
        assert_eq!(plan.to, PresentationState::None);
        assert_eq!(plan.actions, vec![SurfaceAction::Dismiss(SurfaceKind::PictureInPicture)]);
    }

    #[test]
    fn test_surface_view_offers_controls_only_with_accept_policy() {
        let session = CallSessionState {
            invitation: Some(invitation("alice")),
            ..Default::default()
        };
        assert!(SurfaceView::from_session(&session, CallOnLockScreen::Accept).lock_screen_controls);
        assert!(!SurfaceView::from_session(&session, CallOnLockScreen::Show).lock_screen_controls);
    }
}
