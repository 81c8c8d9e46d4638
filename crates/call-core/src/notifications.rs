//! Platform call notifications
//!
//! The platform notification manager owns the notification objects; the
//! coordinator only posts and cancels them. [`NotificationTracker`] remembers
//! what is currently posted so every exit path cancels a notification exactly
//! once, no matter how many paths race to clean it up.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::types::{ActiveCall, CallId, CallInvitation, InvitationId};

/// Identifies a posted notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKey {
    /// Incoming call alert for an invitation
    Invitation(InvitationId),
    /// Ongoing call notification
    Call(CallId),
}

impl fmt::Display for NotificationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationKey::Invitation(id) => write!(f, "invitation {}", id),
            NotificationKey::Call(id) => write!(f, "call {}", id),
        }
    }
}

/// Why a notification was cancelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Accepted,
    Rejected,
    Ignored,
    TimedOut,
    Superseded,
    Withdrawn,
    CallEnded,
}

/// Platform notification manager
pub trait NotificationManager: Send + Sync {
    /// Post an incoming call notification
    fn notify_invitation(&self, invitation: &CallInvitation);

    /// Post (or replace) the ongoing call notification
    fn notify_active_call(&self, call: &ActiveCall);

    /// Remove a posted notification
    fn cancel(&self, key: NotificationKey);
}

/// Notification manager that posts nothing
#[derive(Debug, Default)]
pub struct NoopNotificationManager;

impl NotificationManager for NoopNotificationManager {
    fn notify_invitation(&self, _invitation: &CallInvitation) {}
    fn notify_active_call(&self, _call: &ActiveCall) {}
    fn cancel(&self, _key: NotificationKey) {}
}

/// Tracks posted notifications and cancels each one exactly once
#[derive(Clone)]
pub struct NotificationTracker {
    manager: Arc<dyn NotificationManager>,
    posted: Arc<Mutex<HashSet<NotificationKey>>>,
}

impl fmt::Debug for NotificationTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationTracker")
            .field("posted", &self.posted.lock().len())
            .finish()
    }
}

impl NotificationTracker {
    pub fn new(manager: Arc<dyn NotificationManager>) -> Self {
        Self {
            manager,
            posted: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn post_invitation(&self, invitation: &CallInvitation) {
        let key = NotificationKey::Invitation(invitation.id);
        if self.posted.lock().insert(key) {
            trace!("Posting notification for {}", key);
            self.manager.notify_invitation(invitation);
        }
    }

    pub fn post_active_call(&self, call: &ActiveCall) {
        self.posted.lock().insert(NotificationKey::Call(call.id));
        self.manager.notify_active_call(call);
    }

    /// Cancel `key` if it is still posted. Returns whether this call cancelled it.
    pub fn cancel(&self, key: NotificationKey, reason: CancelReason) -> bool {
        let removed = self.posted.lock().remove(&key);
        if removed {
            debug!("Cancelling notification for {} ({:?})", key, reason);
            self.manager.cancel(key);
        }
        removed
    }

    pub fn is_posted(&self, key: NotificationKey) -> bool {
        self.posted.lock().contains(&key)
    }

    pub fn posted_count(&self) -> usize {
        self.posted.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CallMediaType, RemoteParty};

    #[derive(Default)]
    struct CountingManager {
        cancelled: Mutex<Vec<NotificationKey>>,
    }

    impl NotificationManager for CountingManager {
        fn notify_invitation(&self, _invitation: &CallInvitation) {}
        fn notify_active_call(&self, _call: &ActiveCall) {}
        fn cancel(&self, key: NotificationKey) {
            self.cancelled.lock().push(key);
        }
    }

    #[test]
    fn test_cancel_is_exactly_once() {
        let manager = Arc::new(CountingManager::default());
        let tracker = NotificationTracker::new(manager.clone());
        let invitation = CallInvitation::new(RemoteParty::new(None, "alice"), CallMediaType::Audio, None);
        let key = NotificationKey::Invitation(invitation.id);

        tracker.post_invitation(&invitation);
        assert!(tracker.is_posted(key));

        assert!(tracker.cancel(key, CancelReason::Accepted));
        assert!(!tracker.cancel(key, CancelReason::CallEnded));
        assert_eq!(manager.cancelled.lock().as_slice(), &[key]);
    }

    #[test]
    fn test_cancel_of_unposted_key_is_ignored() {
        let manager = Arc::new(CountingManager::default());
        let tracker = NotificationTracker::new(manager.clone());

        assert!(!tracker.cancel(NotificationKey::Call(CallId::new_v4()), CancelReason::CallEnded));
        assert!(manager.cancelled.lock().is_empty());
    }
}
