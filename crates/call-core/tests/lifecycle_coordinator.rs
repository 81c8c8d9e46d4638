//! Lifecycle coordinator and bridge wiring

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use callbridge_call_core::prelude::*;
use callbridge_call_core::{LayoutType, LifecycleCoordinator, SurfaceAction};
use callbridge_surface_transport::{CallCommand, SurfaceResponse};

use common::*;

fn spawn_coordinator(
    h: &Harness,
    config: &BridgeConfig,
    os: OsContext,
) -> (CoordinatorHandle, Arc<RecordingController>) {
    let controller = Arc::new(RecordingController::default());
    let coordinator = LifecycleCoordinator::spawn(
        config,
        h.session.clone(),
        h.adapter.clone(),
        controller.clone(),
        os,
    );
    (coordinator, controller)
}

fn pip_capable() -> OsContext {
    OsContext::new()
        .with_app_foregrounded(true)
        .with_pip_supported(true)
}

#[tokio::test]
async fn test_minimize_enters_pip_and_expand_restores() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, controller) = spawn_coordinator(&h, &BridgeConfig::new(), pip_capable());

    let invite = invitation("c1", CallMediaType::Video);
    h.session.set_invitation(invite.clone()).await.unwrap();
    coordinator.accept_call(invite.id).await.unwrap().unwrap();
    assert!(matches!(h.next_command().await, CallCommand::Start { .. }));

    coordinator.signal(LifecycleSignal::MinimizeRequested).unwrap();
    wait_for_presentation(&coordinator, PresentationState::PictureInPicture).await;
    assert_eq!(
        h.next_command().await,
        CallCommand::Layout {
            value: LayoutType::RemoteVideo
        }
    );
    assert_eq!(controller.count(SurfaceAction::EnterPictureInPicture), 1);
    assert_eq!(controller.count(SurfaceAction::MoveToBackground), 0);

    // The OS confirms; nothing new to do
    coordinator.signal(LifecycleSignal::PipModeChanged(true)).unwrap();

    coordinator.signal(LifecycleSignal::ExpandRequested).unwrap();
    wait_for_presentation(&coordinator, PresentationState::Foreground).await;
    assert_eq!(
        h.next_command().await,
        CallCommand::Layout {
            value: LayoutType::Default
        }
    );
    assert_eq!(controller.count(SurfaceAction::Restore), 1);
    assert!(!h.session.snapshot().surface_collapsed);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_audio_call_cannot_enter_pip() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, controller) = spawn_coordinator(&h, &BridgeConfig::new(), pip_capable());

    h.session.start_call(contact("c1"), CallMediaType::Audio).await.unwrap();
    h.next_command().await;
    wait_for_presentation(&coordinator, PresentationState::Foreground).await;

    coordinator.signal(LifecycleSignal::MinimizeRequested).unwrap();
    eventually("move to background", || {
        controller.count(SurfaceAction::MoveToBackground) == 1
    })
    .await;
    assert_eq!(controller.count(SurfaceAction::EnterPictureInPicture), 0);
    assert!(h.session.snapshot().surface_collapsed);

    // Coming back expands the call again
    coordinator.signal(LifecycleSignal::Foregrounded).unwrap();
    wait_for_state(&h.session, |s| !s.surface_collapsed).await;

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_user_leaving_collapses_video_call() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, _controller) = spawn_coordinator(&h, &BridgeConfig::new(), pip_capable());

    h.session.start_call(contact("c1"), CallMediaType::Video).await.unwrap();
    h.next_command().await;

    coordinator.signal(LifecycleSignal::UserLeaveHint).unwrap();
    wait_for_presentation(&coordinator, PresentationState::PictureInPicture).await;
    assert!(h.session.snapshot().surface_collapsed);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_destroyed_surface_hangs_up_visible_call() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, controller) = spawn_coordinator(&h, &BridgeConfig::new(), pip_capable());

    let call = h.session.start_call(contact("c1"), CallMediaType::Video).await.unwrap();
    h.next_command().await;
    wait_for_presentation(&coordinator, PresentationState::Foreground).await;

    coordinator.signal(LifecycleSignal::SurfaceDestroyed).unwrap();
    assert_eq!(h.next_command().await, CallCommand::End);
    h.surface.respond(None, SurfaceResponse::Ended).unwrap();

    let state = wait_for_state(&h.session, |s| s.active_call.is_none()).await;
    assert_eq!(state.last_ended.map(|c| c.id), Some(call.id));
    assert_eq!(h.engine.count("end"), 1);

    wait_for_presentation(&coordinator, PresentationState::None).await;
    assert_eq!(
        controller.actions().last(),
        Some(&SurfaceAction::Dismiss(SurfaceKind::Foreground))
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_closing_pip_window_ends_the_call() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, _controller) = spawn_coordinator(&h, &BridgeConfig::new(), pip_capable());

    h.session.start_call(contact("c1"), CallMediaType::Video).await.unwrap();
    h.next_command().await;
    coordinator.signal(LifecycleSignal::MinimizeRequested).unwrap();
    wait_for_presentation(&coordinator, PresentationState::PictureInPicture).await;
    h.next_command().await;
    coordinator.signal(LifecycleSignal::PipModeChanged(true)).unwrap();

    coordinator.signal(LifecycleSignal::SurfaceDestroyed).unwrap();
    assert_eq!(h.next_command().await, CallCommand::End);
    h.surface.respond(None, SurfaceResponse::Ended).unwrap();

    wait_for_state(&h.session, |s| s.active_call.is_none()).await;
    wait_for_presentation(&coordinator, PresentationState::None).await;

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_locked_device_shows_lock_screen_alert() {
    let config = BridgeConfig::new().with_call_on_lock_screen(CallOnLockScreen::Show);
    let h = Harness::start(config.clone());
    let os = OsContext::new().with_keyguard_locked(true);
    let (coordinator, controller) = spawn_coordinator(&h, &config, os);

    h.session.set_invitation(invitation("c1", CallMediaType::Audio)).await.unwrap();
    wait_for_presentation(&coordinator, PresentationState::LockScreenAlert).await;
    assert_eq!(controller.actions(), vec![SurfaceAction::Show(SurfaceKind::LockScreen)]);

    coordinator.signal(LifecycleSignal::KeyguardChanged(false)).unwrap();
    wait_for_presentation(&coordinator, PresentationState::None).await;
    assert_eq!(
        controller.actions().last(),
        Some(&SurfaceAction::Dismiss(SurfaceKind::LockScreen))
    );

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_lock_screen_policy_disable_shows_nothing() {
    let config = BridgeConfig::new().with_call_on_lock_screen(CallOnLockScreen::Disable);
    let h = Harness::start(config.clone());
    let os = OsContext::new().with_keyguard_locked(true);
    let (coordinator, controller) = spawn_coordinator(&h, &config, os);

    h.session.set_invitation(invitation("c1", CallMediaType::Audio)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(coordinator.presentation(), PresentationState::None);
    assert!(controller.actions().is_empty());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_empty_surface_is_dismissed_on_creation() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, controller) = spawn_coordinator(&h, &BridgeConfig::new(), OsContext::new());

    coordinator.signal(LifecycleSignal::SurfaceCreated).unwrap();
    eventually("dismiss", || {
        controller.count(SurfaceAction::Dismiss(SurfaceKind::Foreground)) == 1
    })
    .await;
    assert_eq!(coordinator.presentation(), PresentationState::None);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_notification_actions_drive_the_session() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, _controller) = spawn_coordinator(&h, &BridgeConfig::new(), OsContext::new());

    let invite = invitation("c1", CallMediaType::Audio);
    h.session.set_invitation(invite.clone()).await.unwrap();

    // Unknown party: ignored
    coordinator
        .signal(LifecycleSignal::Notification(NotificationAction::Accept {
            remote_host_id: None,
            chat_id: ContactId::new("nobody"),
        }))
        .unwrap();

    coordinator
        .signal(LifecycleSignal::Notification(NotificationAction::Accept {
            remote_host_id: None,
            chat_id: ContactId::new("c1"),
        }))
        .unwrap();

    assert!(matches!(h.next_command().await, CallCommand::Start { .. }));
    let state = wait_for_state(&h.session, |s| s.active_call.is_some()).await;
    assert_eq!(state.active_call.unwrap().remote, invite.remote);
    assert_eq!(h.engine.count("accept"), 1);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_bound_signal_source_until_released() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, _controller) = spawn_coordinator(&h, &BridgeConfig::new(), OsContext::new());
    h.session.set_invitation(invitation("c1", CallMediaType::Audio)).await.unwrap();

    let (tx, rx) = mpsc::unbounded_channel();
    let binding = coordinator.bind_signals("keyguard", UnboundedReceiverStream::new(rx));
    assert_eq!(binding.name(), "keyguard");

    tx.send(LifecycleSignal::KeyguardChanged(true)).unwrap();
    wait_for_presentation(&coordinator, PresentationState::LockScreenAlert).await;

    assert!(binding.unsubscribe());
    assert!(!binding.unsubscribe());
    binding.join().await;
    assert!(!binding.is_active());

    // Signals from the released source no longer arrive
    let _ = tx.send(LifecycleSignal::KeyguardChanged(false));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(coordinator.presentation(), PresentationState::LockScreenAlert);

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_coordinator_user_actions_are_noops_without_call() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, _controller) = spawn_coordinator(&h, &BridgeConfig::new(), OsContext::new());

    let unknown = InvitationId::new_v4();
    assert_eq!(coordinator.accept_call(unknown).await.unwrap(), None);
    assert_eq!(coordinator.reject_call(unknown).await.unwrap(), None);
    assert_eq!(coordinator.ignore_call(unknown).await.unwrap(), None);
    assert_eq!(coordinator.end_call().await.unwrap(), None);
    assert!(h.engine.log().is_empty());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_accept_from_outdated_view_does_not_answer_newer_call() {
    let h = Harness::start(BridgeConfig::new());
    let (coordinator, controller) = spawn_coordinator(&h, &BridgeConfig::new(), pip_capable());

    let first = invitation("c1", CallMediaType::Video);
    h.session.set_invitation(first.clone()).await.unwrap();
    wait_for_presentation(&coordinator, PresentationState::Foreground).await;
    let rendered = controller.rendered_invitation().unwrap();
    assert_eq!(rendered, first.id);

    let second = invitation("c2", CallMediaType::Audio);
    h.session.set_invitation(second.clone()).await.unwrap();

    // The user taps accept on the view that still shows c1
    assert_eq!(coordinator.accept_call(rendered).await.unwrap(), None);
    assert_eq!(coordinator.reject_call(rendered).await.unwrap(), None);
    assert_eq!(h.engine.count("accept"), 0);
    assert_eq!(h.engine.count("reject"), 0);

    let state = h.session.snapshot();
    assert_eq!(state.invitation.map(|i| i.id), Some(second.id));
    assert!(state.active_call.is_none());

    coordinator.shutdown().await;
}

#[tokio::test]
async fn test_bridge_requires_engine_and_controller() {
    let err = CallBridgeBuilder::new()
        .surface_controller(Arc::new(RecordingController::default()))
        .build()
        .unwrap_err();
    assert!(matches!(err, CallError::Configuration { .. }));

    let err = CallBridgeBuilder::new()
        .engine(FakeEngine::new())
        .build()
        .unwrap_err();
    assert!(matches!(err, CallError::Configuration { .. }));

    let err = CallBridgeBuilder::new()
        .config(BridgeConfig::new().with_teardown_timeout_ms(0))
        .engine(FakeEngine::new())
        .surface_controller(Arc::new(RecordingController::default()))
        .build()
        .unwrap_err();
    assert!(matches!(err, CallError::Configuration { .. }));
}

#[tokio::test]
async fn test_bridge_runs_a_call_over_an_in_process_surface() {
    let engine = FakeEngine::new();
    let controller = Arc::new(RecordingController::default());
    let bridge = CallBridge::builder()
        .engine(engine.clone())
        .surface_controller(controller.clone())
        .os_context(OsContext::new().with_app_foregrounded(true))
        .build()
        .unwrap();
    let surface = bridge.attach_in_process();

    let invite = invitation("c1", CallMediaType::Audio);
    bridge.session().set_invitation(invite.clone()).await.unwrap();
    let call = bridge.coordinator().accept_call(invite.id).await.unwrap().unwrap();

    let command = tokio::time::timeout(Duration::from_secs(5), surface.next_command())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(command.command, CallCommand::Start { .. }));
    wait_for_presentation(bridge.coordinator(), PresentationState::Foreground).await;
    assert!(bridge.notifications().is_posted(callbridge_call_core::NotificationKey::Call(call.id)));

    bridge.shutdown().await;
    assert!(surface.is_closed());
    assert_eq!(engine.count("accept"), 1);
}
