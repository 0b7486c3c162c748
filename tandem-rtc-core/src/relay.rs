//! In-process signaling relay
//!
//! [`MemoryRelay`] stands in for the platform's room relay: it routes
//! envelopes between participants of one room, drives membership, and keeps a
//! wire log for assertions. Each participant talks to it through a
//! [`RelayChannel`].
//!
//! Delivery is FIFO per destination. A participant whose channel is closed
//! can neither send nor receive; envelopes routed to it meanwhile are lost,
//! as they would be on a dropped connection.

use crate::identity::ParticipantId;
use crate::signaling::{Destination, Envelope, SignalingChannel, SignalingError, SignalingMessage};
use crate::types::Participant;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

struct Member {
    tx: mpsc::UnboundedSender<Envelope>,
    open: Arc<AtomicBool>,
}

#[derive(Default)]
struct RelayState {
    members: BTreeMap<ParticipantId, Member>,
    joined: Vec<Participant>,
    wire: Vec<Envelope>,
    held: Option<Vec<Envelope>>,
}

impl RelayState {
    fn route(&mut self, envelope: Envelope) {
        self.wire.push(envelope.clone());
        if let Some(held) = self.held.as_mut() {
            held.push(envelope);
            return;
        }
        self.deliver(&envelope);
    }

    /// Membership changes reach joined members only; other traffic reaches
    /// every open channel it is addressed to.
    fn deliver(&self, envelope: &Envelope) {
        let membership = matches!(
            envelope.message,
            SignalingMessage::MemberJoined { .. } | SignalingMessage::MemberLeft { .. }
        );
        for (id, member) in &self.members {
            if !envelope.is_for(id) || !member.open.load(Ordering::SeqCst) {
                continue;
            }
            if membership && !self.joined.iter().any(|p| &p.id == id) {
                continue;
            }
            let _ = member.tx.send(envelope.clone());
        }
    }
}

/// In-memory room relay
#[derive(Clone, Default)]
pub struct MemoryRelay {
    state: Arc<Mutex<RelayState>>,
}

impl MemoryRelay {
    /// Create an empty relay
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a channel for a participant
    ///
    /// Reconnecting replaces the previous channel.
    #[must_use]
    pub fn connect(&self, id: &ParticipantId) -> RelayChannel {
        let (tx, rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        self.state.lock().members.insert(
            id.clone(),
            Member {
                tx,
                open: open.clone(),
            },
        );
        RelayChannel {
            id: id.clone(),
            relay: self.clone(),
            open,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Add a participant to the room
    ///
    /// Everyone else receives `MemberJoined`; the newcomer receives one
    /// `MemberJoined` per existing member.
    pub fn join(&self, participant: Participant) {
        let mut state = self.state.lock();
        if state.joined.iter().any(|p| p.id == participant.id) {
            return;
        }
        let existing = state.joined.clone();
        let newcomer = participant.id.clone();
        state.joined.push(participant.clone());
        tracing::info!(participant = %newcomer, members = state.joined.len(), "Relay: member joined");

        state.route(Envelope {
            from: newcomer.clone(),
            to: Destination::Room,
            message: SignalingMessage::MemberJoined { participant },
        });
        for member in existing {
            state.route(Envelope {
                from: member.id.clone(),
                to: Destination::Participant(newcomer.clone()),
                message: SignalingMessage::MemberJoined {
                    participant: member,
                },
            });
        }
    }

    /// Remove a participant from the room
    pub fn leave(&self, id: &ParticipantId) {
        let mut state = self.state.lock();
        let before = state.joined.len();
        state.joined.retain(|p| &p.id != id);
        if state.joined.len() == before {
            return;
        }
        tracing::info!(participant = %id, "Relay: member left");
        state.route(Envelope {
            from: id.clone(),
            to: Destination::Room,
            message: SignalingMessage::MemberLeft {
                connection_id: id.clone(),
            },
        });
    }

    /// Redeliver `MemberJoined` for a member to one participant
    pub fn announce_to(&self, member: &ParticipantId, to: &ParticipantId) {
        let mut state = self.state.lock();
        let Some(participant) = state.joined.iter().find(|p| &p.id == member).cloned() else {
            return;
        };
        state.route(Envelope {
            from: member.clone(),
            to: Destination::Participant(to.clone()),
            message: SignalingMessage::MemberJoined { participant },
        });
    }

    /// Publish a presence heartbeat for `id`
    pub fn publish_presence(&self, id: &ParticipantId, is_online: bool) {
        self.state.lock().route(Envelope {
            from: id.clone(),
            to: Destination::Room,
            message: SignalingMessage::Presence {
                participant_id: id.clone(),
                is_online,
            },
        });
    }

    /// Open or close a participant's channel
    pub fn set_open(&self, id: &ParticipantId, open: bool) {
        if let Some(member) = self.state.lock().members.get(id) {
            member.open.store(open, Ordering::SeqCst);
            tracing::debug!(participant = %id, open, "Relay: channel state changed");
        }
    }

    /// Hold every routed envelope until [`MemoryRelay::resume`]
    ///
    /// Held envelopes still appear in the wire log.
    pub fn pause(&self) {
        self.state.lock().held.get_or_insert_with(Vec::new);
    }

    /// Deliver held envelopes in order and stop holding
    pub fn resume(&self) {
        let mut state = self.state.lock();
        for envelope in state.held.take().unwrap_or_default() {
            state.deliver(&envelope);
        }
    }

    /// Joined participants in join order
    #[must_use]
    pub fn members(&self) -> Vec<Participant> {
        self.state.lock().joined.clone()
    }

    /// Every envelope routed so far
    #[must_use]
    pub fn wire(&self) -> Vec<Envelope> {
        self.state.lock().wire.clone()
    }

    /// Count routed messages matching `predicate`
    pub fn count<F>(&self, predicate: F) -> usize
    where
        F: Fn(&SignalingMessage) -> bool,
    {
        self.state
            .lock()
            .wire
            .iter()
            .filter(|e| predicate(&e.message))
            .count()
    }

    fn deliver(&self, envelope: Envelope) {
        self.state.lock().route(envelope);
    }
}

/// One participant's connection to a [`MemoryRelay`]
pub struct RelayChannel {
    id: ParticipantId,
    relay: MemoryRelay,
    open: Arc<AtomicBool>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>,
}

#[async_trait]
impl SignalingChannel for RelayChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError> {
        if !self.is_open() {
            return Err(SignalingError::ChannelUnavailable);
        }
        if envelope.from != self.id {
            return Err(SignalingError::InvalidMessage(format!(
                "sender {} does not own this channel",
                envelope.from
            )));
        }
        self.relay.deliver(envelope);
        Ok(())
    }

    async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }
}
