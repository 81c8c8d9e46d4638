//! # Call session lifecycle coordinator
//!
//! Tracks the incoming or active call, decides which presentation surface
//! owns the screen and drives the embedded signaling surface through
//! [`callbridge_surface_transport`].
//!
//! The crate is organised leaves first:
//!
//! - [`session`]: the single-writer [`SessionActor`] that owns
//!   [`CallSessionState`]. Every producer talks to it through a
//!   [`SessionHandle`].
//! - [`presentation`]: the pure presentation state machine and the
//!   [`SurfaceController`] implemented per platform.
//! - [`coordinator`]: binds OS lifecycle signals and notification actions to
//!   session operations and applies presentation changes.
//! - [`bridge`]: builder wiring all of the above to a signaling surface.
//!
//! The call engine and platform notifications are consumed through the
//! [`CallEngine`] and [`NotificationManager`] traits.

pub mod bridge;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod logging;
pub mod notifications;
pub mod presentation;
pub mod session;
pub mod types;

pub use bridge::{CallBridge, CallBridgeBuilder};
pub use config::{BridgeConfig, CallOnLockScreen};
pub use coordinator::{
    CoordinatorEvent, CoordinatorHandle, LifecycleCoordinator, LifecycleSignal, NotificationAction,
    Subscription,
};
pub use engine::{CallEngine, EngineError, EngineEvent};
pub use error::{CallError, Result};
pub use logging::{setup_logging, LoggingConfig};
pub use notifications::{
    CancelReason, NoopNotificationManager, NotificationKey, NotificationManager, NotificationTracker,
};
pub use presentation::{
    OsContext, PresentationMachine, PresentationState, SurfaceAction, SurfaceController, SurfaceKind,
    SurfacePlan, SurfaceView,
};
pub use session::{
    CallSessionState, EndReason, InvitationOutcome, SessionActor, SessionEvent, SessionHandle,
    TeardownOutcome,
};
pub use types::{
    ActiveCall, CallId, CallInvitation, CallMediaType, ConnectionState, ContactId, InvitationId,
    LayoutType, RemoteHostId, RemoteParty, VideoCamera,
};

/// Re-export of common types
pub mod prelude {
    pub use super::{
        ActiveCall, BridgeConfig, CallBridge, CallBridgeBuilder, CallEngine, CallError, CallInvitation,
        CallMediaType, CallOnLockScreen, CallSessionState, ContactId, CoordinatorEvent,
        CoordinatorHandle, EngineError, EngineEvent, InvitationId, LifecycleSignal, NotificationAction,
        NotificationManager, OsContext, PresentationState, RemoteHostId, RemoteParty, Result,
        SessionEvent, SessionHandle, SurfaceController, SurfaceKind, SurfaceView, TeardownOutcome,
    };
}
