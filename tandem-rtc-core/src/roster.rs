//! Room roster
//!
//! Participant identity, display name and role come from the membership feed.
//! The roster owns the fields derived from control messages and session
//! connectivity.

use crate::identity::ParticipantId;
use crate::types::{ConnectionStatus, Participant, SessionState};
use std::collections::BTreeMap;

/// Joined remote participants
#[derive(Debug, Default, Clone)]
pub struct Roster {
    members: BTreeMap<ParticipantId, Participant>,
}

impl Roster {
    /// Create an empty roster
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of joined participants
    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether nobody has joined
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `id` is joined
    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    /// Participant record
    #[must_use]
    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.members.get(id)
    }

    /// Participants sorted by id
    #[must_use]
    pub fn participants(&self) -> Vec<Participant> {
        self.members.values().cloned().collect()
    }

    /// Add a participant from a `MemberJoined` event
    ///
    /// Returns `false` for a duplicate delivery, which leaves the existing
    /// record untouched.
    pub fn apply_joined(&mut self, participant: Participant) -> bool {
        if self.members.contains_key(&participant.id) {
            return false;
        }
        let participant = Participant {
            connection_status: ConnectionStatus::Connecting,
            ..participant
        };
        tracing::info!(participant = %participant.id, role = ?participant.role, "Participant joined");
        self.members.insert(participant.id.clone(), participant);
        true
    }

    /// Remove a participant
    pub fn apply_left(&mut self, id: &ParticipantId) -> Option<Participant> {
        let removed = self.members.remove(id);
        if removed.is_some() {
            tracing::info!(participant = %id, "Participant left");
        }
        removed
    }

    /// Apply a `MediaState` control message
    pub fn set_media_state(
        &mut self,
        id: &ParticipantId,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Option<&Participant> {
        self.update(id, |p| {
            p.audio_enabled = audio_enabled;
            p.video_enabled = video_enabled;
        })
    }

    /// Apply a `HandRaise` control message
    pub fn set_hand(&mut self, id: &ParticipantId, raised: bool) -> Option<&Participant> {
        self.update(id, |p| p.is_hand_raised = raised)
    }

    /// Derive the connection status from a session state change
    pub fn set_connection(&mut self, id: &ParticipantId, state: SessionState) -> Option<&Participant> {
        let status = match state {
            SessionState::New | SessionState::Negotiating | SessionState::Reconnecting => {
                ConnectionStatus::Connecting
            }
            SessionState::Connected => ConnectionStatus::Connected,
            SessionState::Failed | SessionState::Closed => ConnectionStatus::Disconnected,
        };
        self.update(id, |p| p.connection_status = status)
    }

    /// Apply `f`; returns the record only if it changed
    fn update<F>(&mut self, id: &ParticipantId, f: F) -> Option<&Participant>
    where
        F: FnOnce(&mut Participant),
    {
        let participant = self.members.get_mut(id)?;
        let before = participant.clone();
        f(participant);
        if *participant == before {
            return None;
        }
        Some(participant)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn bob() -> ParticipantId {
        ParticipantId::new("bob")
    }

    #[test]
    fn test_duplicate_join_is_noop() {
        let mut roster = Roster::new();
        assert!(roster.apply_joined(Participant::attendee("bob", "Bob")));
        roster.set_hand(&bob(), true);
        assert!(!roster.apply_joined(Participant::attendee("bob", "Bobby")));

        let record = roster.get(&bob()).unwrap();
        assert_eq!(record.display_name, "Bob");
        assert!(record.is_hand_raised);
        assert_eq!(roster.len(), 1);
    }

    #[test]
    fn test_control_messages_update_flags() {
        let mut roster = Roster::new();
        roster.apply_joined(Participant::host("bob", "Bob"));

        let updated = roster.set_media_state(&bob(), false, true).unwrap().clone();
        assert!(!updated.audio_enabled);
        assert!(updated.video_enabled);
        assert!(roster.set_media_state(&bob(), false, true).is_none());
        assert!(roster.set_hand(&ParticipantId::new("nobody"), true).is_none());
    }

    #[test]
    fn test_connection_status_follows_session() {
        let mut roster = Roster::new();
        roster.apply_joined(Participant::attendee("bob", "Bob"));

        assert!(roster.set_connection(&bob(), SessionState::New).is_none());
        assert_eq!(
            roster
                .set_connection(&bob(), SessionState::Connected)
                .unwrap()
                .connection_status,
            ConnectionStatus::Connected
        );
        assert_eq!(
            roster
                .set_connection(&bob(), SessionState::Reconnecting)
                .unwrap()
                .connection_status,
            ConnectionStatus::Connecting
        );
        assert_eq!(
            roster
                .set_connection(&bob(), SessionState::Failed)
                .unwrap()
                .connection_status,
            ConnectionStatus::Disconnected
        );
    }

    #[test]
    fn test_leave_removes_record() {
        let mut roster = Roster::new();
        roster.apply_joined(Participant::attendee("bob", "Bob"));
        assert!(roster.apply_left(&bob()).is_some());
        assert!(roster.apply_left(&bob()).is_none());
        assert!(roster.is_empty());
    }
}
