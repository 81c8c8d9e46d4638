//! Call session state and the events describing its changes

use serde::Serialize;

use crate::types::{ActiveCall, CallId, CallInvitation, CallMediaType, ConnectionState, InvitationId};

/// Snapshot of the call session.
///
/// Owned by the session actor; everyone else sees clones published through a
/// `watch` channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CallSessionState {
    /// The invitation currently offered to the user
    pub invitation: Option<CallInvitation>,
    /// The live call, never in the `Ended` state
    pub active_call: Option<ActiveCall>,
    /// True while the active call is torn down to admit another one
    pub switching_call: bool,
    /// The user asked to minimize the call surface
    pub surface_collapsed: bool,
    /// The signaling surface reported it is ready to render the call
    pub show_call_view: bool,
    /// The most recently ended call, kept for observers
    pub last_ended: Option<ActiveCall>,
}

impl CallSessionState {
    /// Whether there is anything call-related to present
    pub fn has_call_activity(&self) -> bool {
        self.invitation.is_some() || self.active_call.is_some()
    }

    /// Connection state of the active call
    pub fn connection_state(&self) -> Option<ConnectionState> {
        self.active_call.as_ref().map(|c| c.connection_state)
    }

    /// Check the structural invariants of the session.
    ///
    /// Returns a description of the first violation found.
    pub fn check_invariants(&self) -> Result<(), String> {
        if let Some(call) = &self.active_call {
            if call.is_ended() {
                return Err(format!("active call {} is in the ended state", call.id));
            }
        }
        if self.switching_call && self.active_call.is_none() {
            return Err("switching without an active call to tear down".to_string());
        }
        if self.show_call_view && self.active_call.is_none() {
            return Err("call view shown without an active call".to_string());
        }
        if self.surface_collapsed && self.active_call.is_none() {
            return Err("surface collapsed without an active call".to_string());
        }
        if let Some(ended) = &self.last_ended {
            if !ended.is_ended() {
                return Err(format!("last ended call {} is not ended", ended.id));
            }
        }
        Ok(())
    }
}

/// How an invitation left the pending slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvitationOutcome {
    Accepted,
    Rejected,
    Ignored,
    TimedOut,
    Superseded,
    Withdrawn,
}

/// Why an active call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EndReason {
    /// Local hang-up through `end_active_call`
    Local,
    /// Hang-up pressed inside the signaling surface, or the surface ended the call
    Surface,
    /// The engine reported the call over
    Remote,
    /// The signaling surface connection closed during the call
    TransportClosed,
    /// Torn down to admit another call
    Switched,
    /// The surface never came up after the call was set up
    SetupFailed,
}

/// Result of a teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TeardownOutcome {
    /// The surface (or engine) confirmed the call ended
    Acknowledged,
    /// No confirmation arrived in time; the call was ended locally
    Forced,
}

/// Session changes broadcast to observers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SessionEvent {
    InvitationReceived(CallInvitation),
    InvitationCleared {
        invitation_id: InvitationId,
        outcome: InvitationOutcome,
    },
    CallStarted(ActiveCall),
    SwitchingStarted {
        call_id: CallId,
    },
    ConnectionChanged {
        call_id: CallId,
        state: ConnectionState,
    },
    CallViewReady {
        call_id: CallId,
    },
    MediaChanged {
        call_id: CallId,
        kind: CallMediaType,
        enabled: bool,
    },
    TeardownForced {
        call_id: CallId,
    },
    CallEnded {
        call: ActiveCall,
        reason: EndReason,
    },
    /// Call setup failed; shown to the user once
    SetupFailed {
        message: String,
    },
}
