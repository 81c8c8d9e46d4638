//! Error types for the call coordinator

use std::time::Duration;

use thiserror::Error;

use crate::engine::EngineError;

/// Result type for call coordinator operations
pub type Result<T> = std::result::Result<T, CallError>;

/// Errors that can occur while coordinating a call
#[derive(Debug, Error)]
pub enum CallError {
    /// No invitation is pending
    #[error("No pending call invitation")]
    NoInvitation,

    /// No call is active
    #[error("No active call")]
    NoActiveCall,

    /// The request targeted an invitation or call that was already superseded
    #[error("Stale request: {reason}")]
    StaleRequest { reason: String },

    /// The signaling surface connection is not open
    #[error("Signaling surface transport closed")]
    TransportClosed,

    /// The surface did not acknowledge `end` in time; teardown was forced locally
    #[error("Teardown not acknowledged within {timeout:?}")]
    TeardownTimeout { timeout: Duration },

    /// Call engine error
    #[error("Call engine error: {0}")]
    Engine(#[from] EngineError),

    /// Signaling surface or surface controller error
    #[error("Surface error: {message}")]
    Surface { message: String },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The session actor or coordinator task is gone
    #[error("Channel closed")]
    ChannelClosed,
}

impl CallError {
    /// Create a stale request error
    pub fn stale(reason: impl Into<String>) -> Self {
        Self::StaleRequest {
            reason: reason.into(),
        }
    }

    /// Create a surface error
    pub fn surface(message: impl Into<String>) -> Self {
        Self::Surface {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Errors that resolve to a consistent state on their own and are only logged
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::StaleRequest { .. } | Self::TeardownTimeout { .. })
    }

    /// Errors from user actions that should be treated as no-ops
    pub fn is_user_noop(&self) -> bool {
        matches!(self, Self::NoInvitation | Self::NoActiveCall)
    }

    /// Failures that abort call setup and are shown to the user once
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            Self::Engine(_) | Self::TransportClosed | Self::Surface { .. }
        )
    }
}

impl From<callbridge_surface_transport::Error> for CallError {
    fn from(e: callbridge_surface_transport::Error) -> Self {
        if e.is_connection_closed() {
            Self::TransportClosed
        } else {
            Self::Surface {
                message: e.to_string(),
            }
        }
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for CallError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for CallError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        Self::ChannelClosed
    }
}
