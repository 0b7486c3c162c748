//! Signaling protocol and client
//!
//! A typed envelope over an externally owned, reliable channel. Retries and
//! reconnects belong to the channel; this layer only addresses, validates and
//! dispatches messages.

use crate::identity::ParticipantId;
use crate::types::{DeclineReason, MediaKind, Participant};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Maximum SDP string length
pub const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum connectivity candidate length
pub const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Maximum participant id length
pub const MAX_PARTICIPANT_ID_LENGTH: usize = 256;

/// Signaling errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// The channel is not currently open
    #[error("Signaling channel unavailable")]
    ChannelUnavailable,

    /// A dispatcher is already registered
    #[error("Signaling dispatcher already registered")]
    HandlerAlreadyRegistered,

    /// Message failed validation
    #[error("Invalid signaling message: {0}")]
    InvalidMessage(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Signaling message types
///
/// Closed set; anything not listed here is rejected at deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalingMessage {
    /// Session offer
    SessionOffer {
        /// Addressee
        to_id: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// Session answer
    SessionAnswer {
        /// Addressee
        to_id: ParticipantId,
        /// SDP content
        sdp: String,
    },

    /// Connectivity candidate
    ConnectivityCandidate {
        /// Addressee
        to_id: ParticipantId,
        /// Candidate string
        candidate: String,
    },

    /// A participant joined the room
    MemberJoined {
        /// Participant record from the membership feed
        participant: Participant,
    },

    /// A participant left the room
    MemberLeft {
        /// Departed connection
        connection_id: ParticipantId,
    },

    /// 1:1 call invite
    CallInvite {
        /// Caller
        from_id: ParticipantId,
        /// Requested media
        media_kind: MediaKind,
    },

    /// Callee accepted
    CallAccept {
        /// Callee
        from_id: ParticipantId,
    },

    /// Callee declined
    CallDecline {
        /// Callee
        from_id: ParticipantId,
        /// Why
        reason: DeclineReason,
    },

    /// Caller withdrew an unanswered invite
    CallCancel {
        /// Caller
        from_id: ParticipantId,
    },

    /// Either side ended an accepted call
    CallHangup {
        /// Who hung up
        from_id: ParticipantId,
    },

    /// Presence heartbeat
    Presence {
        /// Subject
        participant_id: ParticipantId,
        /// Reachable
        is_online: bool,
    },

    /// Mute/camera state of the sender
    MediaState {
        /// Sender
        from_id: ParticipantId,
        /// Microphone enabled
        audio_enabled: bool,
        /// Camera enabled
        video_enabled: bool,
    },

    /// Hand raise of the sender
    HandRaise {
        /// Sender
        from_id: ParticipantId,
        /// Raised or lowered
        raised: bool,
    },
}

impl SignalingMessage {
    /// Message type name for logging
    #[must_use]
    pub fn message_type(&self) -> &'static str {
        match self {
            Self::SessionOffer { .. } => "SessionOffer",
            Self::SessionAnswer { .. } => "SessionAnswer",
            Self::ConnectivityCandidate { .. } => "ConnectivityCandidate",
            Self::MemberJoined { .. } => "MemberJoined",
            Self::MemberLeft { .. } => "MemberLeft",
            Self::CallInvite { .. } => "CallInvite",
            Self::CallAccept { .. } => "CallAccept",
            Self::CallDecline { .. } => "CallDecline",
            Self::CallCancel { .. } => "CallCancel",
            Self::CallHangup { .. } => "CallHangup",
            Self::Presence { .. } => "Presence",
            Self::MediaState { .. } => "MediaState",
            Self::HandRaise { .. } => "HandRaise",
        }
    }

    /// Check if this is a negotiation message
    #[must_use]
    pub fn is_negotiation(&self) -> bool {
        matches!(
            self,
            Self::SessionOffer { .. } | Self::SessionAnswer { .. } | Self::ConnectivityCandidate { .. }
        )
    }

    /// Check if this is a call-control message
    #[must_use]
    pub fn is_call_control(&self) -> bool {
        matches!(
            self,
            Self::CallInvite { .. }
                | Self::CallAccept { .. }
                | Self::CallDecline { .. }
                | Self::CallCancel { .. }
                | Self::CallHangup { .. }
        )
    }

    /// Validate field sizes
    ///
    /// # Errors
    ///
    /// Returns error if an SDP, candidate or id exceeds its limit
    pub fn validate(&self) -> Result<(), SignalingError> {
        fn check(what: &str, len: usize, max: usize) -> Result<(), SignalingError> {
            if len > max {
                return Err(SignalingError::InvalidMessage(format!(
                    "{what} length {len} exceeds maximum of {max}"
                )));
            }
            Ok(())
        }

        match self {
            Self::SessionOffer { to_id, sdp } | Self::SessionAnswer { to_id, sdp } => {
                check("participant id", to_id.as_str().len(), MAX_PARTICIPANT_ID_LENGTH)?;
                if sdp.trim().is_empty() {
                    return Err(SignalingError::InvalidMessage(
                        "SDP cannot be empty".to_string(),
                    ));
                }
                check("SDP", sdp.len(), MAX_SDP_LENGTH)
            }
            Self::ConnectivityCandidate { to_id, candidate } => {
                check("participant id", to_id.as_str().len(), MAX_PARTICIPANT_ID_LENGTH)?;
                check("candidate", candidate.len(), MAX_CANDIDATE_LENGTH)
            }
            Self::MemberJoined { participant } => check(
                "participant id",
                participant.id.as_str().len(),
                MAX_PARTICIPANT_ID_LENGTH,
            ),
            Self::MemberLeft { connection_id: id }
            | Self::CallInvite { from_id: id, .. }
            | Self::CallAccept { from_id: id }
            | Self::CallDecline { from_id: id, .. }
            | Self::CallCancel { from_id: id }
            | Self::CallHangup { from_id: id }
            | Self::Presence {
                participant_id: id, ..
            }
            | Self::MediaState { from_id: id, .. }
            | Self::HandRaise { from_id: id, .. } => {
                check("participant id", id.as_str().len(), MAX_PARTICIPANT_ID_LENGTH)
            }
        }
    }
}

/// Message destination
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Destination {
    /// A single participant connection
    Participant(ParticipantId),
    /// Everyone else in the room
    Room,
}

/// Addressed signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Sender
    pub from: ParticipantId,
    /// Destination
    pub to: Destination,
    /// Payload
    pub message: SignalingMessage,
}

impl Envelope {
    /// Whether `local` should receive this envelope
    #[must_use]
    pub fn is_for(&self, local: &ParticipantId) -> bool {
        match &self.to {
            Destination::Participant(id) => id == local,
            Destination::Room => &self.from != local,
        }
    }
}

/// Reliable bidirectional channel supplied by the platform
///
/// Implementations own reconnect and backoff. `recv` returns `None` once the
/// channel is permanently gone.
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Whether the channel is currently open
    fn is_open(&self) -> bool;

    /// Deliver an envelope
    async fn send(&self, envelope: Envelope) -> Result<(), SignalingError>;

    /// Next inbound envelope
    async fn recv(&self) -> Option<Envelope>;
}

/// Inbound message dispatcher
pub type Dispatcher = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Typed signaling client over a `SignalingChannel`
pub struct SignalingClient {
    local_id: ParticipantId,
    channel: Arc<dyn SignalingChannel>,
    dispatcher: Mutex<Option<Dispatcher>>,
}

impl SignalingClient {
    /// Create new signaling client
    #[must_use]
    pub fn new(local_id: ParticipantId, channel: Arc<dyn SignalingChannel>) -> Self {
        Self {
            local_id,
            channel,
            dispatcher: Mutex::new(None),
        }
    }

    /// Local participant id
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Whether the underlying channel is open
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    /// Send a message
    ///
    /// # Errors
    ///
    /// Returns `ChannelUnavailable` if the channel is closed, or the
    /// channel's own error
    #[tracing::instrument(skip(self, message), fields(local = %self.local_id, message_type = message.message_type()))]
    pub async fn send(
        &self,
        to: Destination,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        if !self.channel.is_open() {
            if message.is_call_control() {
                tracing::warn!(?to, "Signaling channel unavailable, call-control message dropped");
            } else if message.is_negotiation() {
                tracing::debug!(?to, "Signaling channel unavailable, session will renegotiate");
            } else {
                tracing::warn!(?to, "Signaling channel unavailable, message not sent");
            }
            return Err(SignalingError::ChannelUnavailable);
        }
        message.validate()?;
        tracing::debug!(?to, "Sending signaling message");
        self.channel
            .send(Envelope {
                from: self.local_id.clone(),
                to,
                message,
            })
            .await
    }

    /// Send a message to one participant
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::send`]
    pub async fn send_to(
        &self,
        to: &ParticipantId,
        message: SignalingMessage,
    ) -> Result<(), SignalingError> {
        self.send(Destination::Participant(to.clone()), message).await
    }

    /// Broadcast a message to the room
    ///
    /// # Errors
    ///
    /// See [`SignalingClient::send`]
    pub async fn broadcast(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.send(Destination::Room, message).await
    }

    /// Register the inbound dispatcher
    ///
    /// # Errors
    ///
    /// Returns `HandlerAlreadyRegistered` if one is already installed
    pub fn on_message<F>(&self, handler: F) -> Result<(), SignalingError>
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        let mut slot = self.dispatcher.lock();
        if slot.is_some() {
            return Err(SignalingError::HandlerAlreadyRegistered);
        }
        *slot = Some(Arc::new(handler));
        Ok(())
    }

    /// Pump inbound envelopes into the dispatcher until the channel ends
    ///
    /// Envelopes addressed elsewhere or failing validation are dropped.
    pub async fn run(&self) {
        while let Some(envelope) = self.channel.recv().await {
            if !envelope.is_for(&self.local_id) {
                tracing::trace!(from = %envelope.from, "Dropping envelope addressed elsewhere");
                continue;
            }
            if let Err(e) = envelope.message.validate() {
                tracing::warn!(from = %envelope.from, error = %e, "Dropping invalid signaling message");
                continue;
            }
            tracing::debug!(
                from = %envelope.from,
                message_type = envelope.message.message_type(),
                "Received signaling message"
            );
            let dispatcher = self.dispatcher.lock().clone();
            match dispatcher {
                Some(dispatch) => dispatch(envelope),
                None => tracing::warn!("No signaling dispatcher registered, message dropped"),
            }
        }
        tracing::info!(local = %self.local_id, "Signaling channel closed");
    }
}
