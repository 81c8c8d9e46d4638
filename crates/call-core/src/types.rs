//! Core call types

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use callbridge_surface_transport::{CallMediaType, ConnectionState, LayoutType, VideoCamera};

/// Identifier of the remote host a contact is reached through (`None` = local)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteHostId(pub i64);

/// Contact (chat) identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContactId(pub String);

impl ContactId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Remote party of a call: contact plus the host it is reached through
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteParty {
    pub remote_host_id: Option<RemoteHostId>,
    pub contact_id: ContactId,
}

impl RemoteParty {
    pub fn new(remote_host_id: Option<RemoteHostId>, contact_id: impl Into<String>) -> Self {
        Self {
            remote_host_id,
            contact_id: ContactId::new(contact_id),
        }
    }

    /// Exact match on host and contact
    pub fn matches(&self, remote_host_id: Option<RemoteHostId>, contact_id: &ContactId) -> bool {
        self.remote_host_id == remote_host_id && &self.contact_id == contact_id
    }
}

impl fmt::Display for RemoteParty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.remote_host_id {
            Some(host) => write!(f, "{}@host{}", self.contact_id, host.0),
            None => write!(f, "{}", self.contact_id),
        }
    }
}

/// Unique identifier for an invitation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvitationId(pub Uuid);

impl InvitationId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for InvitationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An inbound call offer that has not been accepted yet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallInvitation {
    pub id: InvitationId,
    pub remote: RemoteParty,
    pub media: CallMediaType,
    /// Shared key token for end-to-end encryption, if negotiated
    pub shared_key: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl CallInvitation {
    pub fn new(remote: RemoteParty, media: CallMediaType, shared_key: Option<String>) -> Self {
        Self {
            id: InvitationId::new_v4(),
            remote,
            media,
            shared_key,
            received_at: Utc::now(),
        }
    }
}

/// A call that has been accepted or started
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveCall {
    pub id: CallId,
    pub remote: RemoteParty,
    pub media: CallMediaType,
    pub supports_video: bool,
    pub video_enabled: bool,
    pub connection_state: ConnectionState,
    pub shared_key: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ActiveCall {
    /// A new call in the `Connecting` state
    pub fn new(remote: RemoteParty, media: CallMediaType, shared_key: Option<String>) -> Self {
        let video = media == CallMediaType::Video;
        Self {
            id: CallId::new_v4(),
            remote,
            media,
            supports_video: video,
            video_enabled: video,
            connection_state: ConnectionState::Connecting,
            shared_key,
            started_at: Utc::now(),
        }
    }

    /// Promote an invitation into a call
    pub fn from_invitation(invitation: &CallInvitation) -> Self {
        Self::new(
            invitation.remote.clone(),
            invitation.media,
            invitation.shared_key.clone(),
        )
    }

    pub fn is_ended(&self) -> bool {
        self.connection_state.is_terminal()
    }
}
