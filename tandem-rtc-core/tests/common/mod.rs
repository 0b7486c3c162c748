//! Shared harness: orchestrators wired to one in-memory relay and one
//! loopback network

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tandem_rtc_core::{
    MediaKind, MemoryRelay, LoopbackNetwork, Orchestrator, OrchestratorConfig, OrchestratorEvent,
    OrchestratorHandle, ParticipantId, Participant, SessionState, Snapshot, StaticDeviceBackend,
};
use tokio::sync::broadcast;

/// Polls between snapshot checks
const POLL: Duration = Duration::from_millis(10);

/// Polls before a wait gives up
const MAX_POLLS: usize = 500;

pub struct Room {
    pub relay: MemoryRelay,
    pub network: LoopbackNetwork,
}

pub struct Peer {
    pub id: ParticipantId,
    pub handle: OrchestratorHandle,
    pub events: broadcast::Receiver<OrchestratorEvent>,
    pub devices: Arc<StaticDeviceBackend>,
}

impl Room {
    pub fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    pub async fn peer(&self, id: &str) -> Peer {
        self.peer_with(id, OrchestratorConfig::default()).await
    }

    pub async fn peer_with(&self, id: &str, config: OrchestratorConfig) -> Peer {
        let id = ParticipantId::new(id);
        let devices = Arc::new(StaticDeviceBackend::with_defaults());
        let handle = Orchestrator::builder(
            id.clone(),
            Arc::new(self.relay.connect(&id)),
            Arc::new(self.network.factory(id.clone())),
        )
        .with_config(config)
        .with_devices(devices.clone())
        .build()
        .await
        .unwrap();
        let events = handle.subscribe_events();
        Peer {
            id,
            handle,
            events,
            devices,
        }
    }

    /// Join the room and announce presence
    pub fn join(&self, peer: &Peer) {
        self.relay
            .join(Participant::attendee(peer.id.clone(), peer.id.as_str()));
        self.relay.publish_presence(&peer.id, true);
    }

    pub fn offers(&self) -> usize {
        self.relay.count(|m| {
            matches!(m, tandem_rtc_core::SignalingMessage::SessionOffer { .. })
        })
    }
}

impl Peer {
    /// Poll snapshots until `check` holds
    pub async fn wait_for<F>(&self, what: &str, check: F) -> Snapshot
    where
        F: Fn(&Snapshot) -> bool,
    {
        let mut last = None;
        for _ in 0..MAX_POLLS {
            let snapshot = self.handle.snapshot().await.unwrap();
            if check(&snapshot) {
                return snapshot;
            }
            last = Some(snapshot);
            tokio::time::sleep(POLL).await;
        }
        panic!("{}: timed out waiting for {what}; last snapshot: {last:#?}", self.id);
    }

    pub async fn wait_online(&self, other: &Peer) {
        self.wait_for("presence", |s| s.online.contains(&other.id))
            .await;
    }

    pub async fn wait_connected_to(&self, other: &Peer) -> Snapshot {
        self.wait_for("connected session", |s| {
            s.session(&other.id)
                .is_some_and(|info| info.state == SessionState::Connected)
        })
        .await
    }

    /// Next event matching `pick`, skipping the rest
    pub async fn next_event<T, F>(&mut self, what: &str, pick: F) -> T
    where
        F: Fn(&OrchestratorEvent) -> Option<T>,
    {
        let deadline = tokio::time::Instant::now() + POLL * MAX_POLLS as u32;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("{}: no {what} event", self.id))
                .unwrap();
            if let Some(found) = pick(&event) {
                return found;
            }
        }
    }

    /// Events received so far
    pub fn drain_events(&mut self) -> Vec<OrchestratorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

/// Set up a connected 1:1 call from `caller` to `callee`
pub async fn connected_call(room: &Room, caller: &Peer, callee: &Peer, kind: MediaKind) {
    room.relay.publish_presence(&callee.id, true);
    caller.wait_online(callee).await;
    caller.handle.invite(&callee.id, kind).await.unwrap();
    callee
        .wait_for("incoming ring", |s| {
            s.call_state() == tandem_rtc_core::CallState::IncomingRinging
        })
        .await;
    callee.handle.accept().await.unwrap();
    for peer in [caller, callee] {
        peer.wait_for("connected call", |s| {
            s.call_state() == tandem_rtc_core::CallState::Connected
        })
        .await;
    }
}
