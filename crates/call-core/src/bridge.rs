//! Wiring for a complete call bridge
//!
//! [`CallBridgeBuilder`] connects the signaling surface adapter, the session
//! actor and the lifecycle coordinator.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use callbridge_call_core::prelude::*;
//!
//! # async fn example(engine: Arc<dyn CallEngine>, controller: Arc<dyn SurfaceController>) -> Result<()> {
//! let bridge = CallBridgeBuilder::new()
//!     .config(BridgeConfig::new().with_call_on_lock_screen(CallOnLockScreen::Accept))
//!     .engine(engine)
//!     .surface_controller(controller)
//!     .os_context(OsContext::new().with_pip_supported(true))
//!     .build()?;
//!
//! // Desktop: the WebView connects to this address
//! let (addr, _listener) = bridge.serve_websocket().await?;
//! println!("signaling surface at ws://{}", addr);
//!
//! bridge.coordinator().signal(LifecycleSignal::Foregrounded)?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use callbridge_surface_transport::{
    InProcessTransport, SignalingSurfaceAdapter, SurfaceEndpoint, WebSocketSurfaceListener,
};

use crate::config::BridgeConfig;
use crate::coordinator::{CoordinatorHandle, LifecycleCoordinator, Subscription};
use crate::engine::CallEngine;
use crate::error::{CallError, Result};
use crate::notifications::{NoopNotificationManager, NotificationManager, NotificationTracker};
use crate::presentation::{OsContext, SurfaceController};
use crate::session::{SessionActor, SessionHandle};

/// Fluent builder for a [`CallBridge`]
#[derive(Default)]
pub struct CallBridgeBuilder {
    config: BridgeConfig,
    engine: Option<Arc<dyn CallEngine>>,
    notifications: Option<Arc<dyn NotificationManager>>,
    controller: Option<Arc<dyn SurfaceController>>,
    os: OsContext,
}

impl CallBridgeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: BridgeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn engine(mut self, engine: Arc<dyn CallEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Platform notification manager; notifications are not posted without one
    pub fn notification_manager(mut self, manager: Arc<dyn NotificationManager>) -> Self {
        self.notifications = Some(manager);
        self
    }

    pub fn surface_controller(mut self, controller: Arc<dyn SurfaceController>) -> Self {
        self.controller = Some(controller);
        self
    }

    /// OS context at startup
    pub fn os_context(mut self, os: OsContext) -> Self {
        self.os = os;
        self
    }

    /// Spawn the session actor and coordinator. Must run inside a tokio runtime.
    pub fn build(self) -> Result<CallBridge> {
        self.config.validate()?;
        let engine = self
            .engine
            .ok_or_else(|| CallError::config("a call engine is required"))?;
        let controller = self
            .controller
            .ok_or_else(|| CallError::config("a surface controller is required"))?;
        let notifications = NotificationTracker::new(
            self.notifications
                .unwrap_or_else(|| Arc::new(NoopNotificationManager)),
        );

        let adapter = SignalingSurfaceAdapter::new();
        let (session, session_task) =
            SessionActor::spawn(self.config.clone(), engine, adapter.clone(), notifications.clone());
        let coordinator = LifecycleCoordinator::spawn(
            &self.config,
            session.clone(),
            adapter.clone(),
            controller,
            self.os,
        );

        info!("Call bridge started");
        Ok(CallBridge {
            config: self.config,
            adapter,
            session,
            notifications,
            coordinator,
            session_task,
        })
    }
}

/// A running call bridge
pub struct CallBridge {
    config: BridgeConfig,
    adapter: SignalingSurfaceAdapter,
    session: SessionHandle,
    notifications: NotificationTracker,
    coordinator: CoordinatorHandle,
    session_task: JoinHandle<()>,
}

impl std::fmt::Debug for CallBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallBridge")
            .field("adapter", &self.adapter)
            .field("coordinator", &self.coordinator)
            .finish()
    }
}

impl CallBridge {
    pub fn builder() -> CallBridgeBuilder {
        CallBridgeBuilder::new()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub fn adapter(&self) -> &SignalingSurfaceAdapter {
        &self.adapter
    }

    pub fn notifications(&self) -> &NotificationTracker {
        &self.notifications
    }

    /// Attach an in-process surface (mobile) and return its endpoint
    pub fn attach_in_process(&self) -> SurfaceEndpoint {
        let (transport, events_rx, endpoint) = InProcessTransport::pair();
        self.adapter.attach(transport, events_rx);
        endpoint
    }

    /// Listen for the desktop WebView on the configured address.
    ///
    /// Every accepted connection replaces the previous one. The accept loop
    /// runs until the returned subscription is released.
    pub async fn serve_websocket(&self) -> Result<(SocketAddr, Subscription)> {
        let listener = WebSocketSurfaceListener::bind(self.config.surface_bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let adapter = self.adapter.clone();

        let subscription = Subscription::spawn("websocket-surface-listener", move |token| async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((transport, events_rx)) => {
                            adapter.attach(transport, events_rx);
                        }
                        Err(e) if e.is_recoverable() => {
                            debug!("Surface connection rejected: {}", e);
                        }
                        Err(e) => {
                            warn!("Surface listener stopped: {}", e);
                            break;
                        }
                    },
                }
            }
        });

        Ok((local_addr, subscription))
    }

    /// Stop the coordinator, close the surface connection and stop the session actor
    pub async fn shutdown(self) {
        let CallBridge {
            config,
            adapter,
            session,
            coordinator,
            mut session_task,
            ..
        } = self;

        coordinator.shutdown().await;
        if let Err(e) = adapter.close().await {
            debug!("Error closing surface connection: {}", e);
        }
        drop(coordinator);
        drop(session);

        // Outstanding session handles keep the actor alive; give them a moment
        if tokio::time::timeout(config.teardown_timeout(), &mut session_task)
            .await
            .is_err()
        {
            warn!("Session actor still referenced at shutdown; aborting it");
            session_task.abort();
        }
        info!("Call bridge stopped");
    }
}
