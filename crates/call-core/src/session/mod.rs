//! Call session state and the actor that owns it

mod actor;
mod state;

pub use actor::{SessionActor, SessionHandle};
pub use state::{CallSessionState, EndReason, InvitationOutcome, SessionEvent, TeardownOutcome};
