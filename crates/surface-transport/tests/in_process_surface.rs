//! Mobile surface over the in-process transport

use callbridge_surface_transport::prelude::*;

#[tokio::test]
async fn test_interleaved_senders_keep_call_order() {
    let adapter = SignalingSurfaceAdapter::new();
    let (transport, events_rx, endpoint) = InProcessTransport::pair();
    adapter.attach(transport, events_rx);

    // Enqueue without awaiting delivery in between
    let a = adapter.send(CallCommand::ToggleMedia {
        kind: CallMediaType::Audio,
    });
    let b = adapter.send(CallCommand::ToggleMedia {
        kind: CallMediaType::Video,
    });
    let (a, b) = tokio::join!(a, b);
    assert!(a.unwrap() < b.unwrap());

    let first = endpoint.next_command().await.unwrap();
    let second = endpoint.next_command().await.unwrap();
    assert_eq!(
        first.command,
        CallCommand::ToggleMedia {
            kind: CallMediaType::Audio
        }
    );
    assert_eq!(
        second.command,
        CallCommand::ToggleMedia {
            kind: CallMediaType::Video
        }
    );
}

#[tokio::test]
async fn test_local_close_notifies_every_subscriber_once() {
    let adapter = SignalingSurfaceAdapter::new();
    let (transport, events_rx, endpoint) = InProcessTransport::pair();
    adapter.attach(transport, events_rx);

    let mut first = adapter.events();
    let mut second = adapter.events();

    adapter.close().await.unwrap();
    adapter.close().await.unwrap();

    for events in [&mut first, &mut second] {
        assert_eq!(events.recv().await, Some(CallEvent::Disconnected));
        assert_eq!(events.recv().await, None);
    }
    assert!(endpoint.is_closed());
    assert!(endpoint
        .report(SurfaceReport::Start {
            media: CallMediaType::Audio
        })
        .is_err());
}

#[tokio::test]
async fn test_subscriber_waiting_for_connection() {
    let adapter = SignalingSurfaceAdapter::new();
    let mut events = adapter.events();

    let (transport, events_rx, endpoint) = InProcessTransport::pair();
    adapter.attach(transport, events_rx);

    endpoint
        .report(SurfaceReport::ToggleMedia {
            kind: CallMediaType::Video,
            enabled: false,
        })
        .unwrap();

    assert_eq!(
        events.recv().await,
        Some(CallEvent::MediaToggled {
            kind: CallMediaType::Video,
            enabled: false
        })
    );
}
