//! Peer session registry
//!
//! One [`PeerSession`] per remote participant, keyed by participant id. The
//! registry is owned by the orchestrator task and mutated through `&mut self`
//! only, so creation, candidate queue flushes and teardown are serialized.
//!
//! Each session is assigned an epoch. Link events and timers carry a
//! [`SessionKey`] with that epoch, so anything still in flight for a closed
//! session is dropped instead of touching its successor.

use crate::identity::ParticipantId;
use crate::media::{LocalTrack, MediaTrackController};
use crate::signaling::{SignalingClient, SignalingError, SignalingMessage};
use crate::types::{CloseReason, MediaKind, NegotiationRole, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Description exchange could not establish connectivity
    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),

    /// Operation requires a remote description
    #[error("No remote description set")]
    NoRemoteDescription,

    /// Answer received for a session that did not offer
    #[error("Unexpected answer from {0}")]
    UnexpectedAnswer(ParticipantId),

    /// Offer requested on a responder session
    #[error("Session with {0} is not the initiator")]
    NotInitiator(ParticipantId),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(ParticipantId),

    /// Underlying link error
    #[error("Link error: {0}")]
    Link(String),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Link already closed
    #[error("Link closed")]
    Closed,
}

// ============================================================================
// Link abstraction
// ============================================================================

/// Identifies one incarnation of a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    /// Remote participant
    pub remote: ParticipantId,
    /// Registry-assigned epoch
    pub epoch: u64,
}

/// Connectivity as reported by a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Connectivity {
    /// Checks running
    Checking,
    /// Media path established
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Terminal
    Failed,
}

/// Asynchronous report from a link into the owner task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A local candidate to trickle to the remote side
    LocalCandidate {
        /// Session incarnation
        key: SessionKey,
        /// Candidate string
        candidate: String,
    },
    /// Connectivity change
    Connectivity {
        /// Session incarnation
        key: SessionKey,
        /// New connectivity
        state: Connectivity,
    },
}

impl LinkEvent {
    /// Session incarnation the event belongs to
    pub fn key(&self) -> &SessionKey {
        match self {
            Self::LocalCandidate { key, .. } | Self::Connectivity { key, .. } => key,
        }
    }
}

/// Remote description type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptionKind {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Result of pointing a sender at a new track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSwap {
    /// Swapped without renegotiation
    InPlace,
    /// The link cannot swap; the session must be recreated
    NeedsRenegotiation,
}

/// The negotiated connection underlying a peer session
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create an offer and set it as local description
    async fn create_offer(&self) -> Result<String, SessionError>;

    /// Create an answer and set it as local description
    async fn create_answer(&self) -> Result<String, SessionError>;

    /// Apply the remote description
    async fn set_remote_description(
        &self,
        kind: DescriptionKind,
        sdp: &str,
    ) -> Result<(), SessionError>;

    /// Apply a remote connectivity candidate
    async fn add_remote_candidate(&self, candidate: &str) -> Result<(), SessionError>;

    /// Point the outbound sender of `kind` at a track
    async fn set_track(
        &self,
        kind: MediaKind,
        track: Option<LocalTrack>,
    ) -> Result<TrackSwap, SessionError>;

    /// Whether senders can swap tracks without renegotiation
    fn supports_track_replacement(&self) -> bool;

    /// Release the connection
    async fn close(&self);
}

/// Creates peer links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a link reporting into `events`
    async fn create(
        &self,
        key: SessionKey,
        role: NegotiationRole,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Arc<dyn PeerLink>, SessionError>;
}

// ============================================================================
// Sessions
// ============================================================================

/// Timer expiry reported back to the owner task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTimer {
    /// Not connected by the negotiation deadline
    NegotiationDeadline(SessionKey),
    /// Did not recover within the grace window
    GraceExpired(SessionKey),
}

/// Session timing knobs
#[derive(Debug, Clone, Copy)]
pub struct SessionTimeouts {
    /// Deadline from creation to first connectivity
    pub negotiation: Duration,
    /// Grace window after connectivity loss
    pub failure_grace: Duration,
}

/// A state change recorded by the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTransition {
    /// Remote participant
    pub remote: ParticipantId,
    /// New state
    pub state: SessionState,
    /// Set on `Closed`
    pub reason: Option<CloseReason>,
}

/// One negotiated media session with a remote participant
pub struct PeerSession {
    remote: ParticipantId,
    link: Arc<dyn PeerLink>,
    role: NegotiationRole,
    state: SessionState,
    epoch: u64,
    created_at: DateTime<Utc>,
    has_local_description: bool,
    has_remote_description: bool,
    last_remote_offer: Option<String>,
    pending_candidates: VecDeque<String>,
    seen_candidates: HashSet<String>,
    outbound_candidates: VecDeque<String>,
    negotiation_timer: Option<AbortHandle>,
    grace_timer: Option<AbortHandle>,
}

impl PeerSession {
    /// Remote participant
    pub fn remote(&self) -> &ParticipantId {
        &self.remote
    }

    /// Negotiation role
    pub fn role(&self) -> NegotiationRole {
        self.role
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Incarnation key
    pub fn key(&self) -> SessionKey {
        SessionKey {
            remote: self.remote.clone(),
            epoch: self.epoch,
        }
    }

    /// Candidates waiting for the remote description
    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            remote: self.remote.clone(),
            role: self.role,
            state: self.state,
            pending_candidates: self.pending_candidates.len(),
            epoch: self.epoch,
            created_at: self.created_at,
        }
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        for timer in [self.negotiation_timer.take(), self.grace_timer.take()]
            .into_iter()
            .flatten()
        {
            timer.abort();
        }
    }
}

/// Read-only session view
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Remote participant
    pub remote: ParticipantId,
    /// Negotiation role
    pub role: NegotiationRole,
    /// Current state
    pub state: SessionState,
    /// Queued remote candidates
    pub pending_candidates: usize,
    /// Incarnation
    pub epoch: u64,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Owns every peer session of the local participant
pub struct PeerSessionRegistry {
    signaling: Arc<SignalingClient>,
    factory: Arc<dyn PeerLinkFactory>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    timers: mpsc::UnboundedSender<SessionTimer>,
    timeouts: SessionTimeouts,
    sessions: HashMap<ParticipantId, PeerSession>,
    next_epoch: u64,
    transitions: Vec<SessionTransition>,
}

impl PeerSessionRegistry {
    /// Create an empty registry
    ///
    /// Links report into `link_events`; session timers into `timers`. Both
    /// receivers belong to the owner task.
    pub fn new(
        signaling: Arc<SignalingClient>,
        factory: Arc<dyn PeerLinkFactory>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
        timers: mpsc::UnboundedSender<SessionTimer>,
        timeouts: SessionTimeouts,
    ) -> Self {
        Self {
            signaling,
            factory,
            link_events,
            timers,
            timeouts,
            sessions: HashMap::new(),
            next_epoch: 0,
            transitions: Vec::new(),
        }
    }

    /// Number of open sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether no session is open
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Whether a session exists for `remote`
    pub fn contains(&self, remote: &ParticipantId) -> bool {
        self.sessions.contains_key(remote)
    }

    /// Session for `remote`
    pub fn get(&self, remote: &ParticipantId) -> Option<&PeerSession> {
        self.sessions.get(remote)
    }

    /// State of the session for `remote`
    pub fn state(&self, remote: &ParticipantId) -> Option<SessionState> {
        self.sessions.get(remote).map(PeerSession::state)
    }

    /// Links of every open session
    pub fn links(&self) -> Vec<(SessionKey, Arc<dyn PeerLink>)> {
        self.sessions
            .values()
            .map(|s| (s.key(), s.link.clone()))
            .collect()
    }

    /// Sorted session views
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let mut infos: Vec<_> = self.sessions.values().map(PeerSession::info).collect();
        infos.sort_by(|a, b| a.remote.cmp(&b.remote));
        infos
    }

    /// Drain state changes recorded since the last call
    pub fn take_transitions(&mut self) -> Vec<SessionTransition> {
        std::mem::take(&mut self.transitions)
    }

    fn record(&mut self, remote: &ParticipantId, state: SessionState, reason: Option<CloseReason>) {
        self.transitions.push(SessionTransition {
            remote: remote.clone(),
            state,
            reason,
        });
    }

    fn transition(&mut self, remote: &ParticipantId, state: SessionState) {
        let Some(session) = self.sessions.get_mut(remote) else {
            return;
        };
        let old_state = session.state;
        if old_state == state {
            return;
        }
        session.state = state;
        tracing::info!(remote = %remote, ?old_state, new_state = ?state, "Session state changed");
        self.record(remote, state, None);
    }

    /// Return the session for `remote`, creating it in `role` if absent
    ///
    /// Returns `true` if a session was created. The current local tracks are
    /// attached at creation.
    ///
    /// # Errors
    ///
    /// Returns error if the link cannot be created
    #[tracing::instrument(skip(self, media), fields(remote = %remote))]
    pub async fn ensure_session(
        &mut self,
        remote: &ParticipantId,
        role: NegotiationRole,
        media: &MediaTrackController,
    ) -> Result<bool, SessionError> {
        if self.sessions.contains_key(remote) {
            return Ok(false);
        }

        let key = SessionKey {
            remote: remote.clone(),
            epoch: self.next_epoch,
        };
        self.next_epoch += 1;

        let link = self
            .factory
            .create(key.clone(), role, self.link_events.clone())
            .await?;
        if let Err(e) = media.bind_session(&link).await {
            tracing::warn!(error = %e, "Failed to attach local tracks at creation");
        }

        let negotiation_timer = spawn_timer(
            self.timers.clone(),
            self.timeouts.negotiation,
            SessionTimer::NegotiationDeadline(key.clone()),
        );

        self.sessions.insert(
            remote.clone(),
            PeerSession {
                remote: remote.clone(),
                link,
                role,
                state: SessionState::New,
                epoch: key.epoch,
                created_at: Utc::now(),
                has_local_description: false,
                has_remote_description: false,
                last_remote_offer: None,
                pending_candidates: VecDeque::new(),
                seen_candidates: HashSet::new(),
                outbound_candidates: VecDeque::new(),
                negotiation_timer: Some(negotiation_timer),
                grace_timer: None,
            },
        );
        tracing::info!(?role, epoch = key.epoch, "Peer session created");
        self.record(remote, SessionState::New, None);
        Ok(true)
    }

    /// Create an offer on a new initiator session and send it
    ///
    /// No-op for a session already past `New`.
    ///
    /// # Errors
    ///
    /// Returns error if the session is missing, not the initiator, or the
    /// offer cannot be created or sent
    #[tracing::instrument(skip(self), fields(remote = %remote))]
    pub async fn start_negotiation(&mut self, remote: &ParticipantId) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(remote)
            .ok_or_else(|| SessionError::SessionNotFound(remote.clone()))?;
        if session.role != NegotiationRole::Initiator {
            return Err(SessionError::NotInitiator(remote.clone()));
        }
        if session.state != SessionState::New {
            tracing::debug!(state = ?session.state, "Negotiation already started");
            return Ok(());
        }

        let link = session.link.clone();
        let sdp = match link.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                self.fail_session(remote, CloseReason::NegotiationFailed).await;
                return Err(e);
            }
        };
        if let Some(session) = self.sessions.get_mut(remote) {
            session.has_local_description = true;
        }
        self.transition(remote, SessionState::Negotiating);

        tracing::debug!(sdp_len = sdp.len(), "Sending session offer");
        self.signaling
            .send_to(
                remote,
                SignalingMessage::SessionOffer {
                    to_id: remote.clone(),
                    sdp,
                },
            )
            .await?;
        Ok(())
    }

    /// Apply an offer from `from` and answer it
    ///
    /// An identical re-delivered offer is ignored. A different offer on a
    /// session that already has a remote description means the remote side
    /// recreated its session, so ours is replaced. When both sides offered
    /// concurrently the smaller participant id keeps its offer.
    ///
    /// # Errors
    ///
    /// Returns error if the description cannot be applied or the answer
    /// cannot be created or sent
    #[tracing::instrument(skip(self, sdp, media), fields(remote = %from))]
    pub async fn apply_remote_offer(
        &mut self,
        from: &ParticipantId,
        sdp: &str,
        media: &MediaTrackController,
    ) -> Result<(), SessionError> {
        if let Some(session) = self.sessions.get(from) {
            if session.last_remote_offer.as_deref() == Some(sdp) {
                tracing::debug!("Duplicate offer ignored");
                return Ok(());
            }
            let offer_glare = session.role == NegotiationRole::Initiator
                && !session.has_remote_description;
            if offer_glare && self.signaling.local_id().initiates_against(from) {
                tracing::debug!("Offer glare, keeping local offer");
                return Ok(());
            }
            if offer_glare || session.has_remote_description {
                tracing::info!("Remote offer replaces existing session");
                self.close_session(from, CloseReason::Recreated).await;
            }
        }
        self.ensure_session(from, NegotiationRole::Responder, media)
            .await?;

        let link = match self.sessions.get(from) {
            Some(session) => session.link.clone(),
            None => return Err(SessionError::SessionNotFound(from.clone())),
        };
        if let Err(e) = link.set_remote_description(DescriptionKind::Offer, sdp).await {
            self.fail_session(from, CloseReason::NegotiationFailed).await;
            return Err(e);
        }
        if let Some(session) = self.sessions.get_mut(from) {
            session.has_remote_description = true;
            session.last_remote_offer = Some(sdp.to_string());
        }
        self.transition(from, SessionState::Negotiating);
        self.flush_pending(from).await;

        let answer = match link.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.fail_session(from, CloseReason::NegotiationFailed).await;
                return Err(e);
            }
        };
        if let Some(session) = self.sessions.get_mut(from) {
            session.has_local_description = true;
        }

        tracing::debug!(sdp_len = answer.len(), "Sending session answer");
        self.signaling
            .send_to(
                from,
                SignalingMessage::SessionAnswer {
                    to_id: from.clone(),
                    sdp: answer,
                },
            )
            .await?;
        self.flush_outbound(from).await;
        Ok(())
    }

    /// Apply the answer to our offer
    ///
    /// Connectivity is observed later through link events.
    ///
    /// # Errors
    ///
    /// Returns error if there is no session, it did not offer, or the
    /// description cannot be applied
    #[tracing::instrument(skip(self, sdp), fields(remote = %from))]
    pub async fn apply_remote_answer(
        &mut self,
        from: &ParticipantId,
        sdp: &str,
    ) -> Result<(), SessionError> {
        let session = self
            .sessions
            .get(from)
            .ok_or_else(|| SessionError::SessionNotFound(from.clone()))?;
        if session.role != NegotiationRole::Initiator || !session.has_local_description {
            return Err(SessionError::UnexpectedAnswer(from.clone()));
        }
        if session.has_remote_description {
            tracing::debug!("Duplicate answer ignored");
            return Ok(());
        }

        let link = session.link.clone();
        if let Err(e) = link.set_remote_description(DescriptionKind::Answer, sdp).await {
            self.fail_session(from, CloseReason::NegotiationFailed).await;
            return Err(e);
        }
        if let Some(session) = self.sessions.get_mut(from) {
            session.has_remote_description = true;
        }
        self.flush_pending(from).await;
        Ok(())
    }

    /// Apply or queue a remote candidate
    ///
    /// Creates a responder session on first contact. Candidates arriving
    /// before the remote description are queued and flushed in arrival order
    /// once it is set. Repeated candidates are ignored.
    ///
    /// # Errors
    ///
    /// Returns error if a session has to be created and cannot be
    #[tracing::instrument(level = "trace", skip(self, candidate, media), fields(remote = %from))]
    pub async fn apply_remote_candidate(
        &mut self,
        from: &ParticipantId,
        candidate: &str,
        media: &MediaTrackController,
    ) -> Result<(), SessionError> {
        self.ensure_session(from, NegotiationRole::Responder, media)
            .await?;
        let Some(session) = self.sessions.get_mut(from) else {
            return Err(SessionError::SessionNotFound(from.clone()));
        };

        if !session.seen_candidates.insert(candidate.to_string()) {
            tracing::trace!("Duplicate candidate ignored");
            return Ok(());
        }
        if !session.has_remote_description {
            session.pending_candidates.push_back(candidate.to_string());
            tracing::trace!(queued = session.pending_candidates.len(), "Candidate queued");
            return Ok(());
        }

        let link = session.link.clone();
        if let Err(e) = link.add_remote_candidate(candidate).await {
            tracing::warn!(error = %e, "Failed to apply remote candidate");
        }
        Ok(())
    }

    async fn flush_pending(&mut self, remote: &ParticipantId) {
        let Some(session) = self.sessions.get_mut(remote) else {
            return;
        };
        let queued: Vec<String> = session.pending_candidates.drain(..).collect();
        let link = session.link.clone();
        if !queued.is_empty() {
            tracing::debug!(count = queued.len(), "Flushing queued candidates");
        }
        for candidate in queued {
            if let Err(e) = link.add_remote_candidate(&candidate).await {
                tracing::warn!(error = %e, "Failed to apply queued candidate");
            }
        }
    }

    async fn flush_outbound(&mut self, remote: &ParticipantId) {
        loop {
            let Some(candidate) = self
                .sessions
                .get(remote)
                .and_then(|s| s.outbound_candidates.front().cloned())
            else {
                return;
            };
            let message = SignalingMessage::ConnectivityCandidate {
                to_id: remote.clone(),
                candidate,
            };
            if let Err(e) = self.signaling.send_to(remote, message).await {
                tracing::debug!(error = %e, "Candidate held for later delivery");
                return;
            }
            if let Some(session) = self.sessions.get_mut(remote) {
                session.outbound_candidates.pop_front();
            }
        }
    }

    /// Close the session for `remote`
    ///
    /// Returns `false` if there was none; closing twice is the same as once.
    #[tracing::instrument(skip(self), fields(remote = %remote))]
    pub async fn close_session(&mut self, remote: &ParticipantId, reason: CloseReason) -> bool {
        let Some(mut session) = self.sessions.remove(remote) else {
            return false;
        };
        session.pending_candidates.clear();
        session.outbound_candidates.clear();
        session.link.close().await;
        tracing::info!(?reason, epoch = session.epoch, old_state = ?session.state, "Peer session closed");
        self.record(remote, SessionState::Closed, Some(reason));
        true
    }

    /// Close every session
    pub async fn close_all(&mut self, reason: CloseReason) {
        let remotes: Vec<ParticipantId> = self.sessions.keys().cloned().collect();
        for remote in remotes {
            self.close_session(&remote, reason).await;
        }
    }

    async fn fail_session(&mut self, remote: &ParticipantId, reason: CloseReason) {
        self.transition(remote, SessionState::Failed);
        self.close_session(remote, reason).await;
    }

    /// Close and recreate a session as initiator with a fresh offer
    ///
    /// Used when a session cannot swap tracks in place.
    ///
    /// # Errors
    ///
    /// Returns error if the new session cannot be created or negotiated
    #[tracing::instrument(skip(self, media), fields(remote = %remote))]
    pub async fn recreate_session(
        &mut self,
        remote: &ParticipantId,
        media: &MediaTrackController,
    ) -> Result<(), SessionError> {
        self.close_session(remote, CloseReason::Recreated).await;
        self.ensure_session(remote, NegotiationRole::Initiator, media)
            .await?;
        self.start_negotiation(remote).await
    }

    fn current(&self, key: &SessionKey) -> bool {
        self.sessions
            .get(&key.remote)
            .is_some_and(|s| s.epoch == key.epoch)
    }

    /// Handle a report from a link
    pub async fn on_link_event(&mut self, event: LinkEvent) {
        if !self.current(event.key()) {
            tracing::trace!(key = ?event.key(), "Dropping event from stale session");
            return;
        }
        match event {
            LinkEvent::LocalCandidate { key, candidate } => {
                tracing::trace!(remote = %key.remote, "Trickling local candidate");
                if let Some(session) = self.sessions.get_mut(&key.remote) {
                    session.outbound_candidates.push_back(candidate);
                }
                self.flush_outbound(&key.remote).await;
            }
            LinkEvent::Connectivity { key, state } => {
                self.on_connectivity(&key.remote, state).await;
            }
        }
    }

    async fn on_connectivity(&mut self, remote: &ParticipantId, connectivity: Connectivity) {
        let Some(session) = self.sessions.get_mut(remote) else {
            return;
        };
        tracing::debug!(remote = %remote, ?connectivity, state = ?session.state, "Link connectivity changed");
        match connectivity {
            Connectivity::Checking => {}
            Connectivity::Connected => {
                for timer in [session.negotiation_timer.take(), session.grace_timer.take()]
                    .into_iter()
                    .flatten()
                {
                    timer.abort();
                }
                self.transition(remote, SessionState::Connected);
            }
            Connectivity::Disconnected => {
                if session.state != SessionState::Connected {
                    return;
                }
                session.grace_timer = Some(spawn_timer(
                    self.timers.clone(),
                    self.timeouts.failure_grace,
                    SessionTimer::GraceExpired(session.key()),
                ));
                self.transition(remote, SessionState::Reconnecting);
            }
            Connectivity::Failed => {
                self.fail_session(remote, CloseReason::LinkFailed).await;
            }
        }
    }

    /// Handle a session timer expiry
    pub async fn on_timer(&mut self, timer: SessionTimer) {
        match timer {
            SessionTimer::NegotiationDeadline(key) => {
                if !self.current(&key) {
                    return;
                }
                if matches!(
                    self.state(&key.remote),
                    Some(SessionState::New | SessionState::Negotiating)
                ) {
                    tracing::warn!(remote = %key.remote, "Negotiation deadline passed");
                    self.fail_session(&key.remote, CloseReason::NegotiationFailed)
                        .await;
                }
            }
            SessionTimer::GraceExpired(key) => {
                if !self.current(&key) {
                    return;
                }
                if self.state(&key.remote) == Some(SessionState::Reconnecting) {
                    tracing::warn!(remote = %key.remote, "Connectivity not recovered within grace window");
                    self.fail_session(&key.remote, CloseReason::ConnectivityLost)
                        .await;
                }
            }
        }
    }
}

fn spawn_timer(
    timers: mpsc::UnboundedSender<SessionTimer>,
    after: Duration,
    timer: SessionTimer,
) -> AbortHandle {
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = timers.send(timer);
    })
    .abort_handle()
}
