//! End-to-end room and call scenarios over the in-memory relay and loopback
//! links, on a paused clock

mod common;

use common::{connected_call, Room};
use pretty_assertions::assert_eq;
use std::time::Duration;
use tandem_rtc_core::{
    CallState, DeclineReason, DeviceDescriptor, DeviceKind, EndReason, MediaKind,
    NegotiationRole, OrchestratorEvent, SelectOutcome, SessionState, SignalingMessage,
};

#[tokio::test(start_paused = true)]
async fn unanswered_invite_times_out() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    room.relay.publish_presence(&bob.id, true);
    alice.wait_online(&bob).await;

    let call_id = alice.handle.invite(&bob.id, MediaKind::Audio).await.unwrap();
    bob.wait_for("incoming ring", |s| s.call_state() == CallState::IncomingRinging)
        .await;

    tokio::time::sleep(Duration::from_secs(30)).await;

    let snapshot = alice
        .wait_for("call ended", |s| s.call.is_none() && s.last_call.is_some())
        .await;
    let call = snapshot.last_call.unwrap();
    assert_eq!(call.call_id, call_id);
    assert_eq!(call.state, CallState::Ended);
    assert_eq!(call.end_reason, Some(EndReason::Timeout));

    let declines = room.relay.count(|m| {
        matches!(
            m,
            SignalingMessage::CallDecline {
                reason: DeclineReason::Timeout,
                ..
            }
        )
    });
    assert_eq!(declines, 1);
    assert_eq!(
        room.relay
            .count(|m| matches!(m, SignalingMessage::CallCancel { .. })),
        0
    );

    let bob_call = bob
        .wait_for("callee ended", |s| s.call.is_none())
        .await
        .last_call
        .unwrap();
    assert_eq!(bob_call.end_reason, Some(EndReason::Timeout));
    assert_eq!(room.network.links_created(), 0);
}

#[tokio::test(start_paused = true)]
async fn crossing_invites_settle_on_one_session() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    room.relay.publish_presence(&alice.id, true);
    room.relay.publish_presence(&bob.id, true);
    alice.wait_online(&bob).await;
    bob.wait_online(&alice).await;

    room.relay.pause();
    let (a, b) = tokio::join!(
        alice.handle.invite(&bob.id, MediaKind::Video),
        bob.handle.invite(&alice.id, MediaKind::Video),
    );
    a.unwrap();
    b.unwrap();
    room.relay.resume();

    let alice_view = alice
        .wait_for("connected call", |s| s.call_state() == CallState::Connected)
        .await;
    let bob_view = bob
        .wait_for("connected call", |s| s.call_state() == CallState::Connected)
        .await;

    assert_eq!(alice_view.sessions.len(), 1);
    assert_eq!(bob_view.sessions.len(), 1);
    assert_eq!(alice_view.sessions[0].role, NegotiationRole::Initiator);
    assert_eq!(bob_view.sessions[0].role, NegotiationRole::Responder);
    assert_eq!(room.offers(), 1);
    assert_eq!(room.network.links_created(), 2);

    let accepts: Vec<_> = room
        .relay
        .wire()
        .into_iter()
        .filter(|e| matches!(e.message, SignalingMessage::CallAccept { .. }))
        .map(|e| e.from)
        .collect();
    assert_eq!(accepts, vec![bob.id.clone()]);
}

#[tokio::test(start_paused = true)]
async fn camera_switch_mid_call_replaces_track_without_offer() {
    let room = Room::new();
    let mut alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    alice.devices.plug(DeviceDescriptor::new(
        DeviceKind::VideoInput,
        "usb-camera",
        "USB Camera",
    ));
    alice.handle.devices_changed().await.unwrap();
    alice.handle.start_capture(true, true).await.unwrap();
    bob.handle.start_capture(true, true).await.unwrap();

    connected_call(&room, &alice, &bob, MediaKind::Video).await;

    let before = alice.handle.snapshot().await.unwrap().capture.unwrap();
    assert_eq!(before.video_device.as_deref(), Some("default-camera"));
    assert_eq!(
        room.network
            .received_track(&bob.id, &alice.id, MediaKind::Video),
        before.video_track
    );
    let offers = room.offers();
    alice.drain_events();

    let outcome = alice
        .handle
        .select_device(DeviceKind::VideoInput, "usb-camera")
        .await
        .unwrap();
    assert_eq!(
        outcome,
        SelectOutcome::ReplaceTrack {
            kind: DeviceKind::VideoInput,
            device_id: "usb-camera".to_string(),
        }
    );

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

    assert_eq!((in_place, recreated), (1, 0));
    assert_eq!(room.offers(), offers);
    assert_ne!(Some(track_id.clone()), before.video_track);
    assert_eq!(
        room.network
            .received_track(&bob.id, &alice.id, MediaKind::Video),
        Some(track_id)
    );

    let after = alice.handle.snapshot().await.unwrap();
    assert_eq!(after.call_state(), CallState::Connected);
    assert_eq!(
        after.capture.as_ref().unwrap().video_device.as_deref(),
        Some("usb-camera")
    );
}

#[tokio::test(start_paused = true)]
async fn lost_session_fails_then_rejoin_creates_new_one() {
    let room = Room::new();
    let mut alice = room.peer("alice").await;
    let bob = room.peer("bob").await;

    room.join(&alice);
    room.join(&bob);
    let first = alice.wait_connected_to(&bob).await;
    let first_epoch = first.session(&bob.id).unwrap().epoch;
    bob.wait_connected_to(&alice).await;
    alice.drain_events();

    room.network.sever(&alice.id, &bob.id);
    tokio::time::sleep(Duration::from_secs(11)).await;
    alice
        .wait_for("session gone", |s| s.session(&bob.id).is_none())
        .await;

    let states: Vec<SessionState> = alice
        .drain_events()
        .into_iter()
        .filter_map(|event| match event {
            OrchestratorEvent::SessionStateChanged { remote, state } if remote == bob.id => {
                Some(state)
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Reconnecting,
            SessionState::Failed,
            SessionState::Closed
        ]
    );

    room.network.restore(&alice.id, &bob.id);
    room.relay.announce_to(&bob.id, &alice.id);

    let second = alice.wait_connected_to(&bob).await;
    assert!(second.session(&bob.id).unwrap().epoch > first_epoch);
    assert!(second.participants.iter().any(|p| p.id == bob.id));
    bob.wait_connected_to(&alice).await;
}

#[tokio::test(start_paused = true)]
async fn three_participants_form_full_mesh() {
    let room = Room::new();
    let alice = room.peer("alice").await;
    let bob = room.peer("bob").await;
    let carol = room.peer("carol").await;

    room.join(&alice);
    room.join(&bob);
    alice.wait_connected_to(&bob).await;
    room.join(&carol);

    for (peer, others) in [
        (&alice, [&bob, &carol]),
        (&bob, [&alice, &carol]),
        (&carol, [&alice, &bob]),
    ] {
        let snapshot = peer
            .wait_for("full mesh", |s| {
                s.sessions.len() == 2
                    && s.sessions.iter().all(|i| i.state == SessionState::Connected)
            })
            .await;
        for other in others {
            assert!(snapshot.session(&other.id).is_some());
        }
        assert_eq!(snapshot.participants.len(), 2);
    }

    assert_eq!(room.offers(), 3);
    assert_eq!(room.network.links_created(), 6);
}
