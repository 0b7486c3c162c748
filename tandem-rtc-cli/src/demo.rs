//! In-process rooms for trying the orchestrator without a network
//!
//! Every participant runs its own orchestrator over a shared
//! [`MemoryRelay`] and [`LoopbackNetwork`].

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tandem_rtc_core::prelude::*;
use tokio::time::{sleep, Instant};

/// Snapshot poll interval while waiting for a condition
const POLL: Duration = Duration::from_millis(50);

/// A room whose participants all live in this process
pub struct DemoRoom {
    relay: MemoryRelay,
    network: LoopbackNetwork,
    config: OrchestratorConfig,
    members: Vec<OrchestratorHandle>,
}

impl DemoRoom {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
            config,
            members: Vec::new(),
        }
    }

    /// Start an orchestrator for `id` and join it to the room
    pub async fn join(&mut self, id: &str) -> Result<OrchestratorHandle> {
        let participant = ParticipantId::new(id);
        let handle = Orchestrator::builder(
            participant.clone(),
            Arc::new(self.relay.connect(&participant)),
            Arc::new(self.network.factory(participant.clone())),
        )
        .with_config(self.config.clone())
        .build()
        .await
        .with_context(|| format!("failed to start orchestrator for {id}"))?;

        self.relay.join(Participant::attendee(id, display_name(id)));
        self.relay.publish_presence(&participant, true);
        self.members.push(handle.clone());
        Ok(handle)
    }

    /// Offers sent so far across the room
    pub fn offers(&self) -> usize {
        self.relay
            .count(|m| matches!(m, SignalingMessage::SessionOffer { .. }))
    }

    /// Shut every member down
    pub async fn close(self) {
        for member in &self.members {
            if let Err(e) = member.shutdown().await {
                tracing::debug!(participant = %member.local_id(), error = %e, "Shutdown failed");
            }
        }
    }
}

/// Poll `handle` until `pred` holds or `within` elapses
pub async fn wait_for<F>(handle: &OrchestratorHandle, within: Duration, pred: F) -> Result<Snapshot>
where
    F: Fn(&Snapshot) -> bool,
{
    let deadline = Instant::now() + within;
    loop {
        let snapshot = handle.snapshot().await?;
        if pred(&snapshot) {
            return Ok(snapshot);
        }
        if Instant::now() >= deadline {
            bail!("timed out after {}s", within.as_secs());
        }
        sleep(POLL).await;
    }
}

/// Spawn a task printing every event seen by `handle`
pub fn print_events(label: String, handle: &OrchestratorHandle) -> tokio::task::JoinHandle<()> {
    let mut events = handle.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => println!("   [{label}] {}", describe(&event)),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Auto-answer (or ignore) incoming invites on `handle`
pub fn answer_calls(handle: OrchestratorHandle, answer: bool) -> tokio::task::JoinHandle<()> {
    let mut events = handle.subscribe_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let OrchestratorEvent::CallStateChanged {
                state: CallState::IncomingRinging,
                ..
            } = event
            else {
                continue;
            };
            if !answer {
                continue;
            }
            if let Err(e) = handle.accept().await {
                tracing::warn!(error = %e, "Auto-accept failed");
            }
        }
    })
}

/// One-line description of an event
pub fn describe(event: &OrchestratorEvent) -> String {
    match event {
        OrchestratorEvent::CallStateChanged {
            peer_id,
            state,
            reason,
            ..
        } => match reason {
            Some(reason) => format!("📞 call with {peer_id}: {state:?} ({reason:?})"),
            None => format!("📞 call with {peer_id}: {state:?}"),
        },
        OrchestratorEvent::SessionStateChanged { remote, state } => {
            format!("🔗 session with {remote}: {state:?}")
        }
        OrchestratorEvent::ParticipantJoined { participant } => {
            format!("👋 {} joined", participant.display_name)
        }
        OrchestratorEvent::ParticipantUpdated { participant } => format!(
            "👤 {} {:?} audio={} video={} hand={}",
            participant.display_name,
            participant.connection_status,
            participant.audio_enabled,
            participant.video_enabled,
            participant.is_hand_raised
        ),
        OrchestratorEvent::ParticipantLeft { id } => format!("🚪 {id} left"),
        OrchestratorEvent::PresenceChanged { id, online } => {
            format!("📡 {id} is {}", if *online { "online" } else { "offline" })
        }
        OrchestratorEvent::DevicesChanged => "🎛️  devices changed".to_string(),
        OrchestratorEvent::CaptureChanged { handle_id } => match handle_id {
            Some(id) => format!("🎥 capture {id}"),
            None => "🎥 capture released".to_string(),
        },
        OrchestratorEvent::TrackReplaced {
            kind,
            in_place,
            recreated,
            ..
        } => format!("🔁 {kind:?} track replaced ({in_place} in place, {recreated} recreated)"),
        OrchestratorEvent::Notice(notice) => format!("⚠️  {notice:?}"),
    }
}

/// Capitalized display name for a word identity
pub fn display_name(id: &str) -> String {
    let mut chars = id.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}
