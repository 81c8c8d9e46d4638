//! Call engine seam
//!
//! The engine is the chat/messaging backend that actually places, accepts
//! and ends calls with the remote party. The coordinator treats it as opaque:
//! it asks it to perform call operations, forwards negotiation results coming
//! back from the signaling surface, and consumes its event stream.

use futures::stream::BoxStream;
use thiserror::Error;

use callbridge_surface_transport::{CallCommand, CallEvent};

use crate::types::{ActiveCall, CallId, CallInvitation, CallMediaType, ConnectionState, RemoteParty};

/// Errors reported by the call engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The remote party or backend refused the operation
    #[error("Rejected: {reason}")]
    Rejected { reason: String },

    /// The backend is not reachable
    #[error("Unavailable: {reason}")]
    Unavailable { reason: String },

    /// Anything else
    #[error("{message}")]
    Failed { message: String },
}

impl EngineError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Events produced by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A remote party is calling
    Invitation(CallInvitation),

    /// The remote party withdrew an invitation before it was answered
    InvitationWithdrawn { remote: RemoteParty },

    /// The call ended on the engine side (remote hang-up, network loss)
    CallEnded { call_id: CallId },

    /// The engine learned a new connection state for a call
    CallStateChanged {
        call_id: CallId,
        state: ConnectionState,
    },

    /// Negotiation data from the remote party for the signaling surface
    /// (`offer`, `answer`, `ice`)
    Signaling { call_id: CallId, command: CallCommand },
}

/// Call engine operations used by the session actor
#[async_trait::async_trait]
pub trait CallEngine: Send + Sync {
    /// Place an outgoing call
    async fn start_call(&self, remote: &RemoteParty, media: CallMediaType) -> Result<ActiveCall, EngineError>;

    /// Accept an invitation and promote it into a call
    async fn accept_call(&self, invitation: &CallInvitation) -> Result<ActiveCall, EngineError>;

    /// Refuse an invitation, telling the remote party
    async fn reject_call(&self, invitation: &CallInvitation) -> Result<(), EngineError>;

    /// Hang up an active call
    async fn end_call(&self, call: &ActiveCall) -> Result<(), EngineError>;

    /// Negotiation output of the signaling surface (local offer, answer,
    /// ICE candidates, capabilities) to be relayed to the remote party
    async fn surface_event(&self, _call: &ActiveCall, _event: &CallEvent) -> Result<(), EngineError> {
        Ok(())
    }

    /// Stream of engine events
    fn events(&self) -> BoxStream<'static, EngineEvent>;
}
