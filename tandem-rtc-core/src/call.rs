//! 1:1 call lifecycle
//!
//! The state machine decides; it does not act. Every operation returns the
//! [`CallAction`]s the orchestrator must perform (signaling sends, session
//! creation, negotiation, teardown), which keeps the registry and the
//! signaling client out of this module.
//!
//! The ring tone and the ring countdown are owned here through a scoped
//! [`RingGuard`]. Dropping the guard stops the tone and aborts the timer, and
//! the guard is dropped on every transition out of a ringing state.

use crate::identity::ParticipantId;
use crate::presence::PresenceTracker;
use crate::signaling::SignalingMessage;
use crate::types::{
    CallDirection, CallId, CallSession, CallState, CloseReason, DeclineReason, EndReason,
    MediaKind, NegotiationRole, SessionState,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Extra time the caller waits beyond the ring timeout, so the callee's own
/// timeout decline normally arrives first.
pub const OUTGOING_RING_MARGIN: Duration = Duration::from_secs(2);

/// Call-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    /// Presence gate failed
    #[error("Peer unreachable: {0}")]
    PeerUnreachable(ParticipantId),

    /// Operation not valid in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallState),

    /// No call in progress
    #[error("No active call")]
    NoActiveCall,

    /// Calling ourselves
    #[error("Cannot call self")]
    SelfCall,
}

/// Work the orchestrator performs on behalf of the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallAction {
    /// Send a call-control message
    Send {
        /// Addressee
        to: ParticipantId,
        /// Message
        message: SignalingMessage,
    },
    /// Create the peer session if absent
    EnsureSession {
        /// Remote participant
        peer: ParticipantId,
        /// Role for a new session
        role: NegotiationRole,
    },
    /// Send the offer on an initiator session
    StartNegotiation {
        /// Remote participant
        peer: ParticipantId,
    },
    /// Release a session created for the call
    CloseSession {
        /// Remote participant
        peer: ParticipantId,
        /// Why
        reason: CloseReason,
    },
}

/// Which tone is playing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    /// Caller side, waiting for an answer
    Ringback,
    /// Callee side, incoming call
    Ringtone,
}

/// Ring tone resource
pub trait RingTone: Send + Sync {
    /// Start playing
    fn start(&self, kind: RingKind);

    /// Stop playing
    fn stop(&self);
}

/// Ring tone that only logs
#[derive(Debug, Default)]
pub struct TracingRingTone;

impl RingTone for TracingRingTone {
    fn start(&self, kind: RingKind) {
        tracing::info!(?kind, "Ring tone started");
    }

    fn stop(&self) {
        tracing::debug!("Ring tone stopped");
    }
}

/// Ring timer expiry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingTimeout {
    /// Call the timer belongs to
    pub call_id: CallId,
}

/// Scoped ring tone and countdown
///
/// Dropping the guard stops the tone and cancels the countdown.
pub struct RingGuard {
    tone: Arc<dyn RingTone>,
    timer: AbortHandle,
}

impl RingGuard {
    fn start(
        tone: Arc<dyn RingTone>,
        kind: RingKind,
        call_id: CallId,
        after: Duration,
        timeouts: mpsc::UnboundedSender<RingTimeout>,
    ) -> Self {
        tone.start(kind);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = timeouts.send(RingTimeout { call_id });
        })
        .abort_handle();
        Self { tone, timer }
    }
}

impl Drop for RingGuard {
    fn drop(&mut self) {
        self.timer.abort();
        self.tone.stop();
    }
}

/// A recorded call state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTransition {
    /// Call identifier
    pub call_id: CallId,
    /// Remote party
    pub peer_id: ParticipantId,
    /// New state
    pub state: CallState,
    /// Set on `Ended`
    pub reason: Option<EndReason>,
}

struct ActiveCall {
    session: CallSession,
    ring: Option<RingGuard>,
    owns_session: bool,
}

/// Call lifecycle state machine
pub struct CallStateMachine {
    local_id: ParticipantId,
    ring_timeout: Duration,
    tone: Arc<dyn RingTone>,
    timeouts: mpsc::UnboundedSender<RingTimeout>,
    current: Option<ActiveCall>,
    last_ended: Option<CallSession>,
    transitions: Vec<CallTransition>,
}

impl CallStateMachine {
    /// Create an idle state machine reporting ring expiries into `timeouts`
    pub fn new(
        local_id: ParticipantId,
        ring_timeout: Duration,
        tone: Arc<dyn RingTone>,
        timeouts: mpsc::UnboundedSender<RingTimeout>,
    ) -> Self {
        Self {
            local_id,
            ring_timeout,
            tone,
            timeouts,
            current: None,
            last_ended: None,
            transitions: Vec::new(),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CallState {
        self.current
            .as_ref()
            .map_or(CallState::Idle, |c| c.session.state)
    }

    /// Current call
    #[must_use]
    pub fn current(&self) -> Option<&CallSession> {
        self.current.as_ref().map(|c| &c.session)
    }

    /// Most recently ended call
    #[must_use]
    pub fn last_ended(&self) -> Option<&CallSession> {
        self.last_ended.as_ref()
    }

    /// Whether the ring tone and countdown are active
    #[must_use]
    pub fn is_ringing(&self) -> bool {
        self.current.as_ref().is_some_and(|c| c.ring.is_some())
    }

    /// Drain state changes recorded since the last call
    pub fn take_transitions(&mut self) -> Vec<CallTransition> {
        std::mem::take(&mut self.transitions)
    }

    /// Check whether a transition is part of the lifecycle
    #[must_use]
    pub fn is_valid_transition(from: CallState, to: CallState) -> bool {
        matches!(
            (from, to),
            (CallState::Idle, CallState::OutgoingRinging | CallState::IncomingRinging)
                | (
                    CallState::OutgoingRinging | CallState::IncomingRinging,
                    CallState::Connecting | CallState::Ended
                )
                | (CallState::Connecting, CallState::Connected | CallState::Ended)
                | (CallState::Connected, CallState::Ended)
                | (CallState::Ended, CallState::Idle)
        )
    }

    fn set_state(&mut self, state: CallState) {
        let Some(call) = self.current.as_mut() else {
            return;
        };
        let old_state = call.session.state;
        debug_assert!(Self::is_valid_transition(old_state, state));
        call.session.state = state;
        if !matches!(state, CallState::OutgoingRinging | CallState::IncomingRinging) {
            call.ring = None;
        }
        if state == CallState::Connected {
            call.session.connected_at = Some(Utc::now());
        }
        tracing::info!(
            call_id = %call.session.call_id,
            peer = %call.session.peer_id,
            ?old_state,
            new_state = ?state,
            "Call state changed"
        );
        let transition = CallTransition {
            call_id: call.session.call_id,
            peer_id: call.session.peer_id.clone(),
            state,
            reason: None,
        };
        self.transitions.push(transition);
    }

    fn begin(&mut self, peer: ParticipantId, direction: CallDirection, kind: MediaKind) {
        let session = CallSession::ringing(peer, direction, kind, self.ring_timeout);
        let (ring_kind, after) = match direction {
            CallDirection::Outgoing => (RingKind::Ringback, self.ring_timeout + OUTGOING_RING_MARGIN),
            CallDirection::Incoming => (RingKind::Ringtone, self.ring_timeout),
        };
        let ring = RingGuard::start(
            self.tone.clone(),
            ring_kind,
            session.call_id,
            after,
            self.timeouts.clone(),
        );
        tracing::info!(
            call_id = %session.call_id,
            peer = %session.peer_id,
            ?direction,
            ?kind,
            "Call ringing"
        );
        self.transitions.push(CallTransition {
            call_id: session.call_id,
            peer_id: session.peer_id.clone(),
            state: session.state,
            reason: None,
        });
        self.current = Some(ActiveCall {
            session,
            ring: Some(ring),
            owns_session: false,
        });
    }

    /// End the current call and return to idle
    ///
    /// Releases the ring resources and closes the session if it was created
    /// for this call.
    fn end(&mut self, reason: EndReason) -> Vec<CallAction> {
        let Some(mut call) = self.current.take() else {
            return Vec::new();
        };
        drop(call.ring.take());
        call.session.state = CallState::Ended;
        call.session.end_reason = Some(reason);

        tracing::info!(
            call_id = %call.session.call_id,
            peer = %call.session.peer_id,
            ?reason,
            duration_secs = call.session.duration().map(|d| d.num_seconds()),
            "Call ended"
        );

        let call_id = call.session.call_id;
        let peer_id = call.session.peer_id.clone();
        self.transitions.push(CallTransition {
            call_id,
            peer_id: peer_id.clone(),
            state: CallState::Ended,
            reason: Some(reason),
        });
        self.transitions.push(CallTransition {
            call_id,
            peer_id: peer_id.clone(),
            state: CallState::Idle,
            reason: None,
        });

        let mut actions = Vec::new();
        if call.owns_session {
            actions.push(CallAction::CloseSession {
                peer: peer_id,
                reason: CloseReason::CallEnded,
            });
        }
        self.last_ended = Some(call.session);
        actions
    }

    fn peer_matches(&self, peer: &ParticipantId, states: &[CallState]) -> bool {
        self.current
            .as_ref()
            .is_some_and(|c| &c.session.peer_id == peer && states.contains(&c.session.state))
    }

    fn send(&self, to: &ParticipantId, message: SignalingMessage) -> CallAction {
        CallAction::Send {
            to: to.clone(),
            message,
        }
    }

    // ------------------------------------------------------------------------
    // Local commands
    // ------------------------------------------------------------------------

    /// Invite `peer`
    ///
    /// # Errors
    ///
    /// Returns `PeerUnreachable` if presence does not report the peer online,
    /// or `InvalidState` if a call is already in progress
    #[tracing::instrument(skip(self, presence), fields(local = %self.local_id))]
    pub fn invite(
        &mut self,
        peer: &ParticipantId,
        kind: MediaKind,
        presence: &PresenceTracker,
    ) -> Result<Vec<CallAction>, CallError> {
        if peer == &self.local_id {
            return Err(CallError::SelfCall);
        }
        if self.current.is_some() {
            return Err(CallError::InvalidState(self.state()));
        }
        if !presence.is_reachable(peer) {
            tracing::warn!(peer = %peer, "Invite refused, peer unreachable");
            return Err(CallError::PeerUnreachable(peer.clone()));
        }

        self.begin(peer.clone(), CallDirection::Outgoing, kind);
        Ok(vec![self.send(
            peer,
            SignalingMessage::CallInvite {
                from_id: self.local_id.clone(),
                media_kind: kind,
            },
        )])
    }

    /// Accept the incoming call
    ///
    /// `session_exists` tells whether a session with the caller already
    /// exists, in which case the call does not own it.
    ///
    /// # Errors
    ///
    /// Returns error unless an incoming call is ringing
    pub fn accept(&mut self, session_exists: bool) -> Result<Vec<CallAction>, CallError> {
        let call = self.current.as_mut().ok_or(CallError::NoActiveCall)?;
        if call.session.state != CallState::IncomingRinging {
            return Err(CallError::InvalidState(call.session.state));
        }
        call.owns_session = !session_exists;
        let peer = call.session.peer_id.clone();
        self.set_state(CallState::Connecting);

        Ok(vec![
            self.send(
                &peer,
                SignalingMessage::CallAccept {
                    from_id: self.local_id.clone(),
                },
            ),
            CallAction::EnsureSession {
                peer,
                role: NegotiationRole::Responder,
            },
        ])
    }

    /// Decline the incoming call
    ///
    /// # Errors
    ///
    /// Returns error unless an incoming call is ringing
    pub fn decline(&mut self) -> Result<Vec<CallAction>, CallError> {
        let call = self.current.as_ref().ok_or(CallError::NoActiveCall)?;
        if call.session.state != CallState::IncomingRinging {
            return Err(CallError::InvalidState(call.session.state));
        }
        let peer = call.session.peer_id.clone();
        let mut actions = vec![self.send(
            &peer,
            SignalingMessage::CallDecline {
                from_id: self.local_id.clone(),
                reason: DeclineReason::Declined,
            },
        )];
        actions.extend(self.end(EndReason::Declined));
        Ok(actions)
    }

    /// Withdraw the outgoing invite
    ///
    /// # Errors
    ///
    /// Returns error unless an outgoing call is ringing
    pub fn cancel(&mut self) -> Result<Vec<CallAction>, CallError> {
        let call = self.current.as_ref().ok_or(CallError::NoActiveCall)?;
        if call.session.state != CallState::OutgoingRinging {
            return Err(CallError::InvalidState(call.session.state));
        }
        let peer = call.session.peer_id.clone();
        let mut actions = vec![self.send(
            &peer,
            SignalingMessage::CallCancel {
                from_id: self.local_id.clone(),
            },
        )];
        actions.extend(self.end(EndReason::Cancelled));
        Ok(actions)
    }

    /// End the call from whatever state it is in
    ///
    /// Ringing calls are declined or cancelled.
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` if idle
    pub fn hang_up(&mut self) -> Result<Vec<CallAction>, CallError> {
        match self.state() {
            CallState::Idle | CallState::Ended => Err(CallError::NoActiveCall),
            CallState::IncomingRinging => self.decline(),
            CallState::OutgoingRinging => self.cancel(),
            CallState::Connecting | CallState::Connected => {
                let Some(call) = self.current.as_ref() else {
                    return Err(CallError::NoActiveCall);
                };
                let peer = call.session.peer_id.clone();
                let mut actions = vec![self.send(
                    &peer,
                    SignalingMessage::CallHangup {
                        from_id: self.local_id.clone(),
                    },
                )];
                actions.extend(self.end(EndReason::HungUp));
                Ok(actions)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Remote events
    // ------------------------------------------------------------------------

    /// Handle an inbound `CallInvite`
    ///
    /// Crossing invites resolve by id: the smaller id keeps its invite and
    /// waits for the accept, the larger one treats its own invite as
    /// declined and accepts as responder.
    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    pub fn on_invite(
        &mut self,
        from: &ParticipantId,
        kind: MediaKind,
        session_exists: bool,
    ) -> Vec<CallAction> {
        let Some(call) = self.current.as_mut() else {
            self.begin(from.clone(), CallDirection::Incoming, kind);
            return Vec::new();
        };

        if &call.session.peer_id != from {
            tracing::info!(busy_with = %call.session.peer_id, "Auto-declining invite, busy");
            return vec![self.send(
                from,
                SignalingMessage::CallDecline {
                    from_id: self.local_id.clone(),
                    reason: DeclineReason::Busy,
                },
            )];
        }

        if call.session.state != CallState::OutgoingRinging {
            tracing::debug!(state = ?call.session.state, "Duplicate invite ignored");
            return Vec::new();
        }

        if self.local_id.initiates_against(from) {
            tracing::info!("Invite glare, keeping initiator role");
            return Vec::new();
        }

        tracing::info!("Invite glare, yielding initiator role");
        call.owns_session = !session_exists;
        self.set_state(CallState::Connecting);
        vec![
            self.send(
                from,
                SignalingMessage::CallAccept {
                    from_id: self.local_id.clone(),
                },
            ),
            CallAction::EnsureSession {
                peer: from.clone(),
                role: NegotiationRole::Responder,
            },
        ]
    }

    /// Handle an inbound `CallAccept`
    pub fn on_accept(&mut self, from: &ParticipantId, session_exists: bool) -> Vec<CallAction> {
        if !self.peer_matches(from, &[CallState::OutgoingRinging]) {
            tracing::debug!(from = %from, state = ?self.state(), "Unexpected accept ignored");
            return Vec::new();
        }
        if let Some(call) = self.current.as_mut() {
            call.owns_session = !session_exists;
        }
        self.set_state(CallState::Connecting);
        vec![
            CallAction::EnsureSession {
                peer: from.clone(),
                role: NegotiationRole::Initiator,
            },
            CallAction::StartNegotiation { peer: from.clone() },
        ]
    }

    /// Handle an inbound `CallDecline`
    pub fn on_decline(&mut self, from: &ParticipantId, reason: DeclineReason) -> Vec<CallAction> {
        if !self.peer_matches(from, &[CallState::OutgoingRinging]) {
            tracing::debug!(from = %from, ?reason, "Unexpected decline ignored");
            return Vec::new();
        }
        self.end(reason.into())
    }

    /// Handle an inbound `CallCancel`
    pub fn on_cancel(&mut self, from: &ParticipantId) -> Vec<CallAction> {
        if !self.peer_matches(from, &[CallState::IncomingRinging]) {
            return Vec::new();
        }
        self.end(EndReason::RemoteCancelled)
    }

    /// Handle an inbound `CallHangup`
    pub fn on_hangup(&mut self, from: &ParticipantId) -> Vec<CallAction> {
        if self.peer_matches(from, &[CallState::IncomingRinging]) {
            return self.end(EndReason::RemoteCancelled);
        }
        if !self.peer_matches(from, &[CallState::Connecting, CallState::Connected]) {
            return Vec::new();
        }
        self.end(EndReason::RemoteHungUp)
    }

    /// Handle a ring timer expiry
    ///
    /// The callee declines with `timeout`; the caller cancels. Expiries for
    /// a call no longer ringing are ignored.
    pub fn on_ring_timeout(&mut self, timeout: RingTimeout) -> Vec<CallAction> {
        let Some(call) = self.current.as_ref() else {
            return Vec::new();
        };
        if call.session.call_id != timeout.call_id || !call.session.is_ringing() {
            return Vec::new();
        }
        let peer = call.session.peer_id.clone();
        tracing::info!(call_id = %timeout.call_id, peer = %peer, "Ring timeout");

        let message = match call.session.direction {
            CallDirection::Incoming => SignalingMessage::CallDecline {
                from_id: self.local_id.clone(),
                reason: DeclineReason::Timeout,
            },
            CallDirection::Outgoing => SignalingMessage::CallCancel {
                from_id: self.local_id.clone(),
            },
        };
        let mut actions = vec![self.send(&peer, message)];
        actions.extend(self.end(EndReason::Timeout));
        actions
    }

    /// Follow the state of the session underlying the call
    pub fn on_session_state(
        &mut self,
        remote: &ParticipantId,
        state: SessionState,
        reason: Option<CloseReason>,
    ) -> Vec<CallAction> {
        if !self.peer_matches(remote, &[CallState::Connecting, CallState::Connected]) {
            return Vec::new();
        }
        match state {
            SessionState::Connected if self.state() == CallState::Connecting => {
                self.set_state(CallState::Connected);
                Vec::new()
            }
            SessionState::Failed => self.end(EndReason::SessionFailed),
            SessionState::Closed if reason != Some(CloseReason::Recreated) => {
                self.end(EndReason::SessionFailed)
            }
            _ => Vec::new(),
        }
    }

    /// A call-control message could not be sent
    ///
    /// The call cannot progress without it and ends.
    pub fn on_send_failed(&mut self) -> Vec<CallAction> {
        self.end(EndReason::ChannelUnavailable)
    }
}
