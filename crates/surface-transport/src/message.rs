//! Typed commands and events exchanged with the signaling surface
//!
//! Outbound records wrap a [`CallCommand`] with an optional correlation id:
//!
//! ```text
//! {"corrId": 3, "command": {"type": "layout", "value": "remoteVideo"}}
//! ```
//!
//! Inbound records carry either a surface report under `command` or a
//! response under `resp`. Both use a `type` discriminator. Records the adapter
//! does not understand decode to [`CallEvent::Invalid`] instead of failing,
//! so a newer surface never breaks an older coordinator.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::Result;

/// Media requested for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallMediaType {
    Audio,
    Video,
}

impl std::fmt::Display for CallMediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CallMediaType::Audio => write!(f, "audio"),
            CallMediaType::Video => write!(f, "video"),
        }
    }
}

/// Local or peer media source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CallMediaSource {
    Mic,
    Camera,
    ScreenAudio,
    ScreenVideo,
    Unknown,
}

/// Camera facing used for local video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCamera {
    User,
    Environment,
}

/// Video layout rendered by the surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LayoutType {
    Default,
    LocalVideo,
    RemoteVideo,
}

/// Capabilities reported by the surface in answer to `capabilities`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallCapabilities {
    pub encryption: bool,
}

/// Raw peer connection state as reported by the WebRTC runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub connection_state: String,
    #[serde(default)]
    pub ice_connection_state: String,
    #[serde(default)]
    pub ice_gathering_state: String,
    #[serde(default)]
    pub signaling_state: String,
}

/// Connection state of an active call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Ended,
}

impl ConnectionState {
    /// Map a state string reported by the surface.
    ///
    /// `new`/`checking` count as connecting and `failed`/`closed` as
    /// disconnected; anything else is not a connection state.
    pub fn from_surface(state: &str) -> Option<Self> {
        match state.trim().to_ascii_lowercase().as_str() {
            "new" | "checking" | "connecting" => Some(ConnectionState::Connecting),
            "connected" | "completed" => Some(ConnectionState::Connected),
            "disconnected" | "failed" | "closed" => Some(ConnectionState::Disconnected),
            "ended" => Some(ConnectionState::Ended),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Ended)
    }
}

/// Commands sent from the coordinator to the signaling surface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum CallCommand {
    /// Ask the surface for its capabilities, preparing local media
    Capabilities {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media: Option<CallMediaType>,
    },
    /// Start an outgoing call
    Start {
        media: CallMediaType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aes_key: Option<String>,
    },
    /// Accept a remote offer
    Offer {
        offer: String,
        ice_candidates: String,
        media: CallMediaType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aes_key: Option<String>,
    },
    /// Deliver the remote answer
    Answer {
        answer: String,
        ice_candidates: String,
    },
    /// Deliver additional remote ICE candidates
    Ice { ice_candidates: String },
    /// Enable or disable a local media source
    Media { source: CallMediaSource, enable: bool },
    /// Localized status text shown by the surface
    Description { state: String, description: String },
    /// Switch the local camera
    Camera { camera: VideoCamera },
    /// Switch the video layout
    Layout { value: LayoutType },
    /// Toggle local audio or video
    ToggleMedia { kind: CallMediaType },
    /// Hang up and release media
    End,
}

impl CallCommand {
    /// Wire discriminator of this command
    pub fn type_name(&self) -> &'static str {
        match self {
            CallCommand::Capabilities { .. } => "capabilities",
            CallCommand::Start { .. } => "start",
            CallCommand::Offer { .. } => "offer",
            CallCommand::Answer { .. } => "answer",
            CallCommand::Ice { .. } => "ice",
            CallCommand::Media { .. } => "media",
            CallCommand::Description { .. } => "description",
            CallCommand::Camera { .. } => "camera",
            CallCommand::Layout { .. } => "layout",
            CallCommand::ToggleMedia { .. } => "toggleMedia",
            CallCommand::End => "end",
        }
    }
}

/// Outbound wire record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<u64>,
    pub command: CallCommand,
}

/// Inbound wire record before its payload is interpreted
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corr_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resp: Option<Value>,
}

/// Reports the surface makes on its own initiative
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SurfaceReport {
    Capabilities { media: CallMediaType },
    Offer { media: CallMediaType },
    Start { media: CallMediaType },
    Description { state: String, description: String },
    ToggleMedia { kind: CallMediaType, enabled: bool },
}

/// Responses produced by the surface's WebRTC runtime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum SurfaceResponse {
    Capabilities { capabilities: CallCapabilities },
    Offer {
        offer: String,
        ice_candidates: String,
        #[serde(default)]
        capabilities: Option<CallCapabilities>,
    },
    Answer { answer: String, ice_candidates: String },
    Ice { ice_candidates: String },
    Connection { state: ConnectionInfo },
    Connected {
        #[serde(default)]
        connection_info: Option<Value>,
    },
    PeerMedia {
        media: CallMediaType,
        source: CallMediaSource,
        enabled: bool,
    },
    Ended,
    End,
    Ok,
    Error { message: String },
}

/// Events delivered by the adapter to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum CallEvent {
    Capabilities {
        media: Option<CallMediaType>,
        encryption: Option<bool>,
    },
    Offer {
        media: Option<CallMediaType>,
        offer: Option<String>,
        ice_candidates: Option<String>,
    },
    Start { media: CallMediaType },
    Answer { answer: String, ice_candidates: String },
    Ice { ice_candidates: String },
    Description { state: String, text: String },
    MediaToggled { kind: CallMediaType, enabled: bool },
    PeerMedia {
        media: CallMediaType,
        source: CallMediaSource,
        enabled: bool,
    },
    Connection(ConnectionInfo),
    Connected,
    /// The WebRTC runtime finished tearing the call down
    Ended,
    /// The user pressed hang-up inside the surface
    EndRequested,
    Ok { corr_id: Option<u64> },
    Error { corr_id: Option<u64>, message: String },
    Invalid { message_type: String },
    /// Terminal event: the connection to the surface is gone
    Disconnected,
}

impl CallEvent {
    /// Connection state implied by this event, if any
    pub fn connection_state(&self) -> Option<ConnectionState> {
        match self {
            CallEvent::Description { state, .. } => ConnectionState::from_surface(state),
            CallEvent::Connection(info) => ConnectionState::from_surface(&info.connection_state),
            CallEvent::Connected => Some(ConnectionState::Connected),
            CallEvent::Ended => Some(ConnectionState::Ended),
            _ => None,
        }
    }

    /// Whether this event acknowledges an `end` command
    pub fn is_teardown_ack(&self) -> bool {
        matches!(self, CallEvent::Ended | CallEvent::Disconnected)
            || self.connection_state() == Some(ConnectionState::Ended)
    }

    /// Whether the surface reported it is ready to render a call
    pub fn is_readiness(&self) -> bool {
        matches!(
            self,
            CallEvent::Capabilities { .. } | CallEvent::Start { .. } | CallEvent::Offer { .. }
        )
    }
}

impl From<SurfaceReport> for CallEvent {
    fn from(report: SurfaceReport) -> Self {
        match report {
            SurfaceReport::Capabilities { media } => CallEvent::Capabilities {
                media: Some(media),
                encryption: None,
            },
            SurfaceReport::Offer { media } => CallEvent::Offer {
                media: Some(media),
                offer: None,
                ice_candidates: None,
            },
            SurfaceReport::Start { media } => CallEvent::Start { media },
            SurfaceReport::Description { state, description } => CallEvent::Description {
                state,
                text: description,
            },
            SurfaceReport::ToggleMedia { kind, enabled } => CallEvent::MediaToggled { kind, enabled },
        }
    }
}

impl SurfaceResponse {
    fn into_event(self, corr_id: Option<u64>) -> CallEvent {
        match self {
            SurfaceResponse::Capabilities { capabilities } => CallEvent::Capabilities {
                media: None,
                encryption: Some(capabilities.encryption),
            },
            SurfaceResponse::Offer {
                offer,
                ice_candidates,
                ..
            } => CallEvent::Offer {
                media: None,
                offer: Some(offer),
                ice_candidates: Some(ice_candidates),
            },
            SurfaceResponse::Answer {
                answer,
                ice_candidates,
            } => CallEvent::Answer {
                answer,
                ice_candidates,
            },
            SurfaceResponse::Ice { ice_candidates } => CallEvent::Ice { ice_candidates },
            SurfaceResponse::Connection { state } => CallEvent::Connection(state),
            SurfaceResponse::Connected { .. } => CallEvent::Connected,
            SurfaceResponse::PeerMedia {
                media,
                source,
                enabled,
            } => CallEvent::PeerMedia {
                media,
                source,
                enabled,
            },
            SurfaceResponse::Ended => CallEvent::Ended,
            SurfaceResponse::End => CallEvent::EndRequested,
            SurfaceResponse::Ok => CallEvent::Ok { corr_id },
            SurfaceResponse::Error { message } => CallEvent::Error { corr_id, message },
        }
    }
}

impl InboundRecord {
    /// Build a record carrying a surface report
    pub fn report(report: SurfaceReport) -> Self {
        Self {
            corr_id: None,
            command: serde_json::to_value(report).ok(),
            resp: None,
        }
    }

    /// Build a record carrying a response
    pub fn response(corr_id: Option<u64>, resp: SurfaceResponse) -> Self {
        Self {
            corr_id,
            command: None,
            resp: serde_json::to_value(resp).ok(),
        }
    }

    /// Interpret the record.
    ///
    /// A response wins over an echoed command when both are present.
    pub fn into_event(self) -> CallEvent {
        if let Some(resp) = self.resp {
            let message_type = type_of(&resp);
            return match serde_json::from_value::<SurfaceResponse>(resp) {
                Ok(resp) => resp.into_event(self.corr_id),
                Err(e) => {
                    warn!("Undecodable surface response {:?}: {}", message_type, e);
                    CallEvent::Invalid { message_type }
                }
            };
        }

        if let Some(command) = self.command {
            let message_type = type_of(&command);
            return match serde_json::from_value::<SurfaceReport>(command) {
                Ok(report) => report.into(),
                Err(e) => {
                    warn!("Undecodable surface report {:?}: {}", message_type, e);
                    CallEvent::Invalid { message_type }
                }
            };
        }

        CallEvent::Invalid {
            message_type: "empty".to_string(),
        }
    }
}

fn type_of(value: &Value) -> String {
    value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}

/// Encode an outbound record as a JSON text frame
pub fn encode_outbound(record: &OutboundRecord) -> Result<String> {
    serde_json::to_string(record).map_err(|e| crate::Error::EncodeError(e.to_string()))
}

/// Decode a JSON text frame into an inbound record
pub fn decode_inbound(text: &str) -> Result<InboundRecord> {
    Ok(serde_json::from_str(text)?)
}
