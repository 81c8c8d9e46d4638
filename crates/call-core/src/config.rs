//! Coordinator configuration
//!
//! ```rust
//! use callbridge_call_core::config::{BridgeConfig, CallOnLockScreen};
//!
//! let config = BridgeConfig::new()
//!     .with_teardown_timeout_ms(1_500)
//!     .with_call_on_lock_screen(CallOnLockScreen::Accept)
//!     .with_pip_auto_enter(true);
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.teardown_timeout().as_millis(), 1_500);
//! ```
//!
//! Configuration can also be loaded from TOML; missing keys keep their defaults:
//!
//! ```rust
//! use callbridge_call_core::config::{BridgeConfig, CallOnLockScreen};
//!
//! let config = BridgeConfig::from_toml_str(r#"
//!     call_on_lock_screen = "show"
//!     readiness_timeout_ms = 5000
//! "#).unwrap();
//!
//! assert_eq!(config.call_on_lock_screen, CallOnLockScreen::Show);
//! assert_eq!(config.teardown_timeout_ms, 3_000);
//! ```

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CallError, Result};

/// What an incoming call may do while the device is locked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallOnLockScreen {
    /// Never show a lock-screen alert; rely on the notification only
    Disable,
    /// Show an alert that opens the app
    Show,
    /// Show an alert with accept/reject/ignore controls
    Accept,
}

impl Default for CallOnLockScreen {
    fn default() -> Self {
        CallOnLockScreen::Show
    }
}

/// Configuration for the session actor and lifecycle coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How long to wait for the surface to acknowledge `end` before forcing teardown
    pub teardown_timeout_ms: u64,

    /// How long to wait for the surface to report readiness after accept/start
    pub readiness_timeout_ms: u64,

    /// How long an unanswered invitation stays pending (0 = until resolved)
    pub invitation_timeout_secs: u64,

    /// Lock-screen alert policy
    pub call_on_lock_screen: CallOnLockScreen,

    /// Whether the OS enters picture-in-picture by itself when the user leaves the app
    pub pip_auto_enter: bool,

    /// Capacity of the session request queue
    pub request_queue_capacity: usize,

    /// Capacity of the session and coordinator event broadcast channels
    pub event_channel_capacity: usize,

    /// Where the desktop signaling surface connects
    pub surface_bind_addr: SocketAddr,
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self {
            teardown_timeout_ms: 3_000,
            readiness_timeout_ms: 10_000,
            invitation_timeout_secs: 0,
            call_on_lock_screen: CallOnLockScreen::default(),
            pip_auto_enter: false,
            request_queue_capacity: 64,
            event_channel_capacity: 100,
            surface_bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }

    /// Parse a TOML document
    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self = toml::from_str(source)
            .map_err(|e| CallError::config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the coordinator cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.teardown_timeout_ms == 0 {
            return Err(CallError::config("teardown_timeout_ms must be greater than 0"));
        }
        if self.readiness_timeout_ms == 0 {
            return Err(CallError::config("readiness_timeout_ms must be greater than 0"));
        }
        if self.request_queue_capacity == 0 {
            return Err(CallError::config("request_queue_capacity must be greater than 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(CallError::config("event_channel_capacity must be greater than 0"));
        }
        Ok(())
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn invitation_timeout(&self) -> Option<Duration> {
        (self.invitation_timeout_secs > 0).then(|| Duration::from_secs(self.invitation_timeout_secs))
    }

    pub fn with_teardown_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.teardown_timeout_ms = timeout_ms;
        self
    }

    pub fn with_readiness_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.readiness_timeout_ms = timeout_ms;
        self
    }

    pub fn with_invitation_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.invitation_timeout_secs = timeout_secs;
        self
    }

    pub fn with_call_on_lock_screen(mut self, policy: CallOnLockScreen) -> Self {
        self.call_on_lock_screen = policy;
        self
    }

    pub fn with_pip_auto_enter(mut self, auto_enter: bool) -> Self {
        self.pip_auto_enter = auto_enter;
        self
    }

    pub fn with_request_queue_capacity(mut self, capacity: usize) -> Self {
        self.request_queue_capacity = capacity;
        self
    }

    pub fn with_surface_bind_addr(mut self, addr: SocketAddr) -> Self {
        self.surface_bind_addr = addr;
        self
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::new()
    }
}
