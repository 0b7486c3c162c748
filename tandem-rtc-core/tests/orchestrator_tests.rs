//! UI command tests against running orchestrators

mod common;

use common::{connected_call, Room};
use std::time::Duration;
use tandem_rtc_core::{
    CallError, CallState, ConfigError, DeviceDescriptor, DeviceKind, EndReason, MediaKind,
    NegotiationRole, Notice, Orchestrator, OrchestratorConfig, OrchestratorError,
    OrchestratorEvent, ParticipantId, SelectOutcome, SessionState, SignalingError,
    SignalingMessage,
};

#[tokio::test(start_paused = true)]
async fn invite_requires_presence() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    let err = alice
        .handle
        .invite(&bob.id, MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Call(CallError::PeerUnreachable(ref id)) if id == &bob.id
    ));
    assert!(room.relay.wire().is_empty());

    let err = alice
        .handle
        .invite(&alice.id, MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Call(CallError::SelfCall)));
}

#[tokio::test(start_paused = true)]
async fn decline_ends_both_sides() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    room.relay.publish_presence(&bob.id, true);
    alice.wait_online(&bob).await;
    alice.handle.invite(&bob.id, MediaKind::Video).await.unwrap();
    bob.wait_for("ringing", |s| s.call_state() == CallState::IncomingRinging)
        .await;
    bob.handle.decline().await.unwrap();

    let snapshot = alice.wait_for("declined", |s| s.call.is_none()).await;
    assert_eq!(
        snapshot.last_call.unwrap().end_reason,
        Some(EndReason::RemoteDeclined)
    );
    let snapshot = bob.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.last_call.unwrap().end_reason, Some(EndReason::Declined));
    assert!(bob.handle.decline().await.is_err());
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_callee_ringing() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    room.relay.publish_presence(&bob.id, true);
    alice.wait_online(&bob).await;
    alice.handle.invite(&bob.id, MediaKind::Audio).await.unwrap();
    bob.wait_for("ringing", |s| s.call_state() == CallState::IncomingRinging)
        .await;
    alice.handle.cancel().await.unwrap();

    let snapshot = bob.wait_for("cancelled", |s| s.call.is_none()).await;
    assert_eq!(
        snapshot.last_call.unwrap().end_reason,
        Some(EndReason::RemoteCancelled)
    );
}

#[tokio::test(start_paused = true)]
async fn hang_up_closes_call_session() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    connected_call(&room, &alice, &bob, MediaKind::Audio).await;

    bob.handle.hang_up().await.unwrap();

    let snapshot = alice
        .wait_for("hung up", |s| s.call.is_none() && s.sessions.is_empty())
        .await;
    let call = snapshot.last_call.unwrap();
    assert_eq!(call.end_reason, Some(EndReason::RemoteHungUp));
    assert!(call.connected_at.is_some());

    let snapshot = bob
        .wait_for("session closed", |s| s.sessions.is_empty())
        .await;
    assert_eq!(snapshot.last_call.unwrap().end_reason, Some(EndReason::HungUp));
    assert!(matches!(
        bob.handle.hang_up().await,
        Err(OrchestratorError::Call(CallError::NoActiveCall))
    ));
}

#[tokio::test(start_paused = true)]
async fn call_over_room_session_keeps_session() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    room.join(&alice);
    room.join(&bob);
    alice.wait_connected_to(&bob).await;
    bob.wait_connected_to(&alice).await;
    let offers = room.offers();

    connected_call(&room, &bob, &alice, MediaKind::Audio).await;
    assert_eq!(room.offers(), offers);

    alice.handle.hang_up().await.unwrap();
    bob.wait_for("call ended", |s| s.call.is_none()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(alice.handle.snapshot().await.unwrap().session(&bob.id).is_some());
    assert!(bob.handle.snapshot().await.unwrap().session(&alice.id).is_some());
}

#[tokio::test(start_paused = true)]
async fn hang_up_on_closed_channel_still_closes_call_session() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    connected_call(&room, &alice, &bob, MediaKind::Audio).await;
    room.relay.set_open(&alice.id, false);

    assert!(matches!(
        alice.handle.hang_up().await,
        Err(OrchestratorError::Signaling(SignalingError::ChannelUnavailable))
    ));

    let snapshot = alice.handle.snapshot().await.unwrap();
    assert!(snapshot.call.is_none());
    assert_eq!(snapshot.last_call.unwrap().end_reason, Some(EndReason::HungUp));
    assert!(snapshot.sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn decline_on_closed_channel_keeps_decline_reason() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    room.relay.publish_presence(&bob.id, true);
    alice.wait_online(&bob).await;
    alice.handle.invite(&bob.id, MediaKind::Audio).await.unwrap();
    bob.wait_for("ringing", |s| s.call_state() == CallState::IncomingRinging)
        .await;
    room.relay.set_open(&bob.id, false);

    assert!(matches!(
        bob.handle.decline().await,
        Err(OrchestratorError::Signaling(SignalingError::ChannelUnavailable))
    ));
    let snapshot = bob.handle.snapshot().await.unwrap();
    assert!(snapshot.call.is_none());
    assert_eq!(snapshot.last_call.unwrap().end_reason, Some(EndReason::Declined));
    assert!(snapshot.sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn call_session_adopted_by_room_stays_open() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    connected_call(&room, &alice, &bob, MediaKind::Audio).await;
    let offers = room.offers();

    room.join(&alice);
    room.join(&bob);
    for (peer, other) in [(&alice, &bob), (&bob, &alice)] {
        peer.wait_for("member listed", |s| s.participants.iter().any(|p| p.id == other.id))
            .await;
    }

    bob.handle.hang_up().await.unwrap();
    alice.wait_for("call ended", |s| s.call.is_none()).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    for (peer, other) in [(&alice, &bob), (&bob, &alice)] {
        let snapshot = peer.handle.snapshot().await.unwrap();
        assert_eq!(
            snapshot.session(&other.id).map(|s| s.state),
            Some(SessionState::Connected)
        );
    }
    assert_eq!(room.offers(), offers);
}

#[tokio::test(start_paused = true)]
async fn busy_callee_declines_second_invite() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    let carol = room.peer("carol").await;
    connected_call(&room, &alice, &bob, MediaKind::Audio).await;

    room.relay.publish_presence(&bob.id, true);
    carol.wait_online(&bob).await;
    carol.handle.invite(&bob.id, MediaKind::Audio).await.unwrap();

    let snapshot = carol.wait_for("busy", |s| s.call.is_none()).await;
    assert_eq!(snapshot.last_call.unwrap().end_reason, Some(EndReason::Busy));
    assert_eq!(
        bob.handle.snapshot().await.unwrap().call_state(),
        CallState::Connected
    );
}

#[tokio::test(start_paused = true)]
async fn media_toggles_reach_remote_roster() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    room.join(&alice);
    room.join(&bob);
    bob.wait_for("alice joined", |s| s.participants.iter().any(|p| p.id == alice.id))
        .await;

    assert!(!alice.handle.toggle_audio().await.unwrap());
    assert!(!alice.handle.set_video_enabled(false).await.unwrap());
    alice.handle.raise_hand(true).await.unwrap();

    bob.wait_for("alice muted", |s| {
        s.participants.iter().any(|p| {
            p.id == alice.id && !p.audio_enabled && !p.video_enabled && p.is_hand_raised
        })
    })
    .await;

    let local = alice.handle.snapshot().await.unwrap();
    assert!(!local.audio_enabled);
    assert!(!local.video_enabled);
    assert!(alice.handle.toggle_audio().await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn toggle_stands_when_broadcast_fails() {
    let room = Room::new();
    let mut alice = room.peer("alice").await;
    room.relay.set_open(&alice.id, false);

    assert!(!alice.handle.toggle_video().await.unwrap());
    let dropped = alice
        .next_event("dropped notice", |event| match event {
            OrchestratorEvent::Notice(Notice::ControlMessageDropped { message_type, .. }) => {
                Some(message_type.clone())
            }
            _ => None,
        })
        .await;
    assert_eq!(dropped, "MediaState");
    assert!(!alice.handle.snapshot().await.unwrap().video_enabled);

    assert!(matches!(
        alice.handle.raise_hand(true).await,
        Err(OrchestratorError::Signaling(SignalingError::ChannelUnavailable))
    ));
}

#[tokio::test(start_paused = true)]
async fn invite_on_closed_channel_ends_call() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    room.relay.publish_presence(&bob.id, true);
    alice.wait_online(&bob).await;
    room.relay.set_open(&alice.id, false);

    let err = alice
        .handle
        .invite(&bob.id, MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::Signaling(SignalingError::ChannelUnavailable)
    ));
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert!(snapshot.call.is_none());
    assert_eq!(
        snapshot.last_call.unwrap().end_reason,
        Some(EndReason::ChannelUnavailable)
    );
}

#[tokio::test(start_paused = true)]
async fn capture_skips_unavailable_camera() {
    let room = Room::new();
    let mut alice = room.peer("alice").await;
    alice.devices.fail_open("default-camera");

    let capture = alice.handle.start_capture(true, true).await.unwrap();
    assert_eq!(capture.audio_device.as_deref(), Some("default-mic"));
    assert!(capture.video_track.is_none());

    let kind = alice
        .next_event("device notice", |event| match event {
            OrchestratorEvent::Notice(Notice::DeviceUnavailable { kind, .. }) => Some(*kind),
            _ => None,
        })
        .await;
    assert_eq!(kind, DeviceKind::VideoInput);
}

#[tokio::test(start_paused = true)]
async fn unplugged_camera_falls_back_to_default() {
    let room = Room::new();
    let mut alice = room.peer("alice").await;
    alice.devices.plug(tandem_rtc_core::DeviceDescriptor::new(
        DeviceKind::VideoInput,
        "usb-camera",
        "USB Camera",
    ));
    alice.handle.devices_changed().await.unwrap();
    alice
        .handle
        .select_device(DeviceKind::VideoInput, "usb-camera")
        .await
        .unwrap();
    let capture = alice.handle.start_capture(true, true).await.unwrap();
    assert_eq!(capture.video_device.as_deref(), Some("usb-camera"));

    alice.devices.unplug("usb-camera");
    alice.handle.devices_changed().await.unwrap();

    let fallback = alice
        .next_event("fallback notice", |event| match event {
            OrchestratorEvent::Notice(Notice::DeviceFallback { fallback, .. }) => {
                Some(fallback.clone())
            }
            _ => None,
        })
        .await;
    assert_eq!(fallback.as_deref(), Some("default-camera"));

    let snapshot = alice
        .wait_for("camera replaced", |s| {
            s.capture
                .as_ref()
                .is_some_and(|c| c.video_device.as_deref() == Some("default-camera"))
        })
        .await;
    assert_eq!(
        snapshot.selection.video_input.as_deref(),
        Some("default-camera")
    );
}

#[tokio::test(start_paused = true)]
async fn overlapping_captures_share_one_handle() {
    let room = Room::new();
    let alice = room.peer("alice").await;

    let (first, second) = tokio::join!(
        alice.handle.start_capture(true, false),
        alice.handle.start_capture(true, true),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(first, second);
    assert!(second.video_track.is_some());

    let active = alice.handle.snapshot().await.unwrap().capture.unwrap();
    assert_eq!(active, second);
}

#[tokio::test(start_paused = true)]
async fn camera_selection_without_video_capture_is_stored() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    alice.devices.plug(DeviceDescriptor::new(
        DeviceKind::VideoInput,
        "usb-camera",
        "USB Camera",
    ));
    alice.handle.devices_changed().await.unwrap();
    alice.handle.start_capture(true, false).await.unwrap();
    connected_call(&room, &alice, &bob, MediaKind::Audio).await;

    let outcome = alice
        .handle
        .select_device(DeviceKind::VideoInput, "usb-camera")
        .await
        .unwrap();
    assert_eq!(outcome, SelectOutcome::Stored);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let snapshot = alice.handle.snapshot().await.unwrap();
    assert_eq!(snapshot.selection.video_input.as_deref(), Some("usb-camera"));
    assert!(snapshot.capture.unwrap().video_track.is_none());
    assert!(room
        .network
        .received_track(&bob.id, &alice.id, MediaKind::Video)
        .is_none());
}

#[tokio::test(start_paused = true)]
async fn camera_switch_recreates_sessions_without_replacement() {
    let room = Room::new();
    let mut alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    alice.handle.start_capture(true, true).await.unwrap();
    bob.handle.start_capture(true, true).await.unwrap();
    room.join(&alice);
    room.join(&bob);
    let before = alice.wait_connected_to(&bob).await;
    let epoch = before.session(&bob.id).unwrap().epoch;
    bob.wait_connected_to(&alice).await;
    let offers = room.offers();

    room.network.set_replacement_supported(&alice.id, false);
    alice.devices.plug(DeviceDescriptor::new(
        DeviceKind::VideoInput,
        "usb-camera",
        "USB Camera",
    ));
    alice.handle.devices_changed().await.unwrap();
    alice.drain_events();
    alice
        .handle
        .select_device(DeviceKind::VideoInput, "usb-camera")
        .await
        .unwrap();

    let (track_id, in_place, recreated) = alice
        .next_event("track replaced", |event| match event {
            OrchestratorEvent::TrackReplaced {
                kind: MediaKind::Video,
                track_id,
                in_place,
                recreated,
            } => Some((track_id.clone(), *in_place, *recreated)),
            _ => None,
        })
        .await;
    assert_eq!((in_place, recreated), (0, 1));

    let after = alice
        .wait_for("renegotiated", |s| {
            s.session(&bob.id)
                .is_some_and(|i| i.epoch > epoch && i.state == SessionState::Connected)
        })
        .await;
    assert_eq!(after.session(&bob.id).unwrap().role, NegotiationRole::Initiator);
    assert!(room.offers() > offers);
    assert_eq!(
        room.network
            .received_track(&bob.id, &alice.id, MediaKind::Video),
        Some(track_id)
    );
}

#[tokio::test(start_paused = true)]
async fn ensure_and_close_are_idempotent() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let carol = ParticipantId::new("carol");

    let (first, second) = tokio::join!(
        alice.handle.ensure_session(&carol, NegotiationRole::Initiator),
        alice.handle.ensure_session(&carol, NegotiationRole::Initiator),
    );
    assert_eq!(
        [first.unwrap(), second.unwrap()].iter().filter(|c| **c).count(),
        1
    );
    assert_eq!(room.network.links_created(), 1);
    assert_eq!(room.offers(), 1);

    assert!(alice.handle.close_session(&carol).await.unwrap());
    let once = alice.handle.snapshot().await.unwrap();
    assert!(!alice.handle.close_session(&carol).await.unwrap());
    let twice = alice.handle.snapshot().await.unwrap();
    assert_eq!(once.sessions, twice.sessions);
    assert!(twice.sessions.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_everything() {
    let room = Room::new();
    let mut alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    room.join(&alice);
    room.join(&bob);
    alice.handle.start_capture(true, false).await.unwrap();
    alice.wait_connected_to(&bob).await;

    alice.handle.shutdown().await.unwrap();

    alice
        .next_event("capture released", |event| match event {
            OrchestratorEvent::CaptureChanged { handle_id: None } => Some(()),
            _ => None,
        })
        .await;
    assert!(matches!(
        alice.handle.snapshot().await,
        Err(OrchestratorError::Stopped)
    ));
    assert!(room
        .network
        .received_track(&bob.id, &alice.id, MediaKind::Audio)
        .is_none());
    assert_eq!(
        room.relay
            .count(|m| matches!(m, SignalingMessage::CallHangup { .. })),
        0
    );
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let room = Room::new();
    let id = ParticipantId::new("alice");
    let config = OrchestratorConfig {
        ring_timeout_secs: 0,
        ..OrchestratorConfig::default()
    };
    let result = Orchestrator::builder(
        id.clone(),
        std::sync::Arc::new(room.relay.connect(&id)),
        std::sync::Arc::new(room.network.factory(id.clone())),
    )
    .with_config(config)
    .build()
    .await;
    assert!(matches!(
        result,
        Err(OrchestratorError::Config(ConfigError::Invalid(_)))
    ));
}
