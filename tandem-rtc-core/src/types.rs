//! Core orchestrator types and data structures

use crate::devices::DeviceKind;
use crate::identity::ParticipantId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallId(pub Uuid);

impl CallId {
    /// Create a new random call ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CallId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of media carried by a call or a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio only
    Audio,
    /// Video with audio
    Video,
}

impl MediaKind {
    /// Whether this kind carries video
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Participant role in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Room host
    Host,
    /// Regular attendee
    Attendee,
}

/// Connectivity-derived participant status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Session being negotiated
    Connecting,
    /// Media flowing
    Connected,
    /// Session lost or not yet present
    Disconnected,
}

/// A remote room participant
///
/// Identity, display name and role come from the membership feed; the
/// remaining fields are maintained by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    /// Participant identifier
    pub id: ParticipantId,
    /// Display name
    pub display_name: String,
    /// Role in the room
    pub role: Role,
    /// Connectivity status
    pub connection_status: ConnectionStatus,
    /// Remote microphone enabled
    pub audio_enabled: bool,
    /// Remote camera enabled
    pub video_enabled: bool,
    /// Hand raised
    pub is_hand_raised: bool,
}

impl Participant {
    /// Create an attendee with default media flags
    pub fn attendee(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role: Role::Attendee,
            connection_status: ConnectionStatus::Connecting,
            audio_enabled: true,
            video_enabled: true,
            is_hand_raised: false,
        }
    }

    /// Create a host with default media flags
    pub fn host(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            role: Role::Host,
            ..Self::attendee(id, display_name)
        }
    }
}

/// Negotiation role of a peer session, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationRole {
    /// Creates the offer
    Initiator,
    /// Answers the offer
    Responder,
}

/// Peer session state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Created, nothing exchanged yet
    New,
    /// Offer/answer in progress
    Negotiating,
    /// Connectivity established
    Connected,
    /// Connectivity lost, inside the grace window
    Reconnecting,
    /// Terminal failure
    Failed,
    /// Released
    Closed,
}

impl SessionState {
    /// Whether the session can still carry media
    pub fn is_live(self) -> bool {
        !matches!(self, Self::Failed | Self::Closed)
    }
}

/// Why a peer session was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The remote participant left the room
    MemberLeft,
    /// No connectivity before the negotiation deadline
    NegotiationFailed,
    /// Connectivity did not recover within the grace window
    ConnectivityLost,
    /// The underlying link reported terminal failure
    LinkFailed,
    /// The call owning the session ended
    CallEnded,
    /// Replaced by a fresh session (track replacement fallback)
    Recreated,
    /// Explicit request from the UI layer
    Requested,
    /// Orchestrator shutting down
    Shutdown,
}

/// Call lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    /// No call
    Idle,
    /// Local invite sent, waiting for the callee
    OutgoingRinging,
    /// Remote invite received, waiting for the user
    IncomingRinging,
    /// Accepted, session being established
    Connecting,
    /// Session connected
    Connected,
    /// Terminal
    Ended,
}

/// Direction of a call relative to this participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    /// We invited
    Outgoing,
    /// We were invited
    Incoming,
}

/// Reason carried by a `CallDecline`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeclineReason {
    /// User declined
    Declined,
    /// Ring timer expired
    Timeout,
    /// Already in another call
    Busy,
}

/// Why a call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// We declined
    Declined,
    /// The remote side declined
    RemoteDeclined,
    /// A ring timer expired on either side
    Timeout,
    /// We cancelled the outgoing invite
    Cancelled,
    /// The caller cancelled before we answered
    RemoteCancelled,
    /// We hung up
    HungUp,
    /// The remote side hung up
    RemoteHungUp,
    /// The underlying session failed or closed
    SessionFailed,
    /// The remote side is in another call
    Busy,
    /// A call-control message could not be sent
    ChannelUnavailable,
}

impl From<DeclineReason> for EndReason {
    fn from(reason: DeclineReason) -> Self {
        match reason {
            DeclineReason::Declined => Self::RemoteDeclined,
            DeclineReason::Timeout => Self::Timeout,
            DeclineReason::Busy => Self::Busy,
        }
    }
}

/// A 1:1 call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallSession {
    /// Call identifier
    pub call_id: CallId,
    /// Current state
    pub state: CallState,
    /// The other party
    pub peer_id: ParticipantId,
    /// Video requested
    pub is_video: bool,
    /// Who invited whom
    pub direction: CallDirection,
    /// When ringing started
    pub ring_started_at: DateTime<Utc>,
    /// Ring timeout in seconds
    pub ring_timeout_seconds: u64,
    /// When the call reached `Connected`
    pub connected_at: Option<DateTime<Utc>>,
    /// Set once the call is `Ended`
    pub end_reason: Option<EndReason>,
}

impl CallSession {
    /// Create a new ringing call
    pub fn ringing(
        peer_id: ParticipantId,
        direction: CallDirection,
        kind: MediaKind,
        ring_timeout: Duration,
    ) -> Self {
        let state = match direction {
            CallDirection::Outgoing => CallState::OutgoingRinging,
            CallDirection::Incoming => CallState::IncomingRinging,
        };
        Self {
            call_id: CallId::new(),
            state,
            peer_id,
            is_video: kind.is_video(),
            direction,
            ring_started_at: Utc::now(),
            ring_timeout_seconds: ring_timeout.as_secs(),
            connected_at: None,
            end_reason: None,
        }
    }

    /// Media kind of this call
    pub fn media_kind(&self) -> MediaKind {
        if self.is_video {
            MediaKind::Video
        } else {
            MediaKind::Audio
        }
    }

    /// Whether the call is still ringing
    pub fn is_ringing(&self) -> bool {
        matches!(
            self.state,
            CallState::OutgoingRinging | CallState::IncomingRinging
        )
    }

    /// Get connected duration
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.connected_at.map(|start| Utc::now() - start)
    }
}

/// Non-fatal condition surfaced to the UI layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    /// The selected device disappeared; the platform default took over
    DeviceFallback {
        /// Device kind
        kind: DeviceKind,
        /// Device that disappeared
        lost: String,
        /// Device now selected, if any remains
        fallback: Option<String>,
    },
    /// A capture device could not be opened
    DeviceUnavailable {
        /// Device kind
        kind: DeviceKind,
        /// Error description
        reason: String,
    },
    /// A control message could not be delivered
    ControlMessageDropped {
        /// Message type
        message_type: String,
        /// Error description
        reason: String,
    },
}

/// Observable orchestrator events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// Call state changed
    CallStateChanged {
        /// Call identifier
        call_id: CallId,
        /// Remote party
        peer_id: ParticipantId,
        /// New state
        state: CallState,
        /// End reason, for `Ended`
        reason: Option<EndReason>,
    },
    /// Peer session state changed
    SessionStateChanged {
        /// Remote participant
        remote: ParticipantId,
        /// New state
        state: SessionState,
    },
    /// Participant joined the room
    ParticipantJoined {
        /// Participant record
        participant: Participant,
    },
    /// Participant record changed
    ParticipantUpdated {
        /// Participant record
        participant: Participant,
    },
    /// Participant left the room
    ParticipantLeft {
        /// Participant identifier
        id: ParticipantId,
    },
    /// Presence changed
    PresenceChanged {
        /// Participant identifier
        id: ParticipantId,
        /// Reachable now
        online: bool,
    },
    /// Device list re-enumerated
    DevicesChanged,
    /// Local capture handle replaced or released
    CaptureChanged {
        /// New handle id, `None` when released
        handle_id: Option<String>,
    },
    /// Outbound track replaced on live sessions
    TrackReplaced {
        /// Track kind
        kind: MediaKind,
        /// New track id
        track_id: String,
        /// Sessions swapped in place
        in_place: usize,
        /// Sessions recreated
        recreated: usize,
    },
    /// Non-fatal notice
    Notice(Notice),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_call_id() {
        let id1 = CallId::new();
        let id2 = CallId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_ringing_call_session() {
        let session = CallSession::ringing(
            ParticipantId::new("bob"),
            CallDirection::Outgoing,
            MediaKind::Video,
            Duration::from_secs(30),
        );
        assert_eq!(session.state, CallState::OutgoingRinging);
        assert!(session.is_video);
        assert!(session.is_ringing());
        assert_eq!(session.ring_timeout_seconds, 30);
        assert_eq!(session.media_kind(), MediaKind::Video);
        assert!(session.duration().is_none());

        let incoming = CallSession::ringing(
            ParticipantId::new("alice"),
            CallDirection::Incoming,
            MediaKind::Audio,
            Duration::from_secs(5),
        );
        assert_eq!(incoming.state, CallState::IncomingRinging);
        assert!(!incoming.is_video);
    }

    #[test]
    fn test_decline_reason_maps_to_end_reason() {
        assert_eq!(EndReason::from(DeclineReason::Timeout), EndReason::Timeout);
        assert_eq!(
            EndReason::from(DeclineReason::Declined),
            EndReason::RemoteDeclined
        );
        assert_eq!(EndReason::from(DeclineReason::Busy), EndReason::Busy);
    }

    #[test]
    fn test_session_state_liveness() {
        assert!(SessionState::Negotiating.is_live());
        assert!(SessionState::Reconnecting.is_live());
        assert!(!SessionState::Failed.is_live());
        assert!(!SessionState::Closed.is_live());
    }

    #[test]
    fn test_event_serialization() {
        let event = OrchestratorEvent::SessionStateChanged {
            remote: ParticipantId::new("bob"),
            state: SessionState::Reconnecting,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"session_state_changed\""));
        assert!(json.contains("\"state\":\"reconnecting\""));
    }
}
