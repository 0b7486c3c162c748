//! Peer-session orchestrator
//!
//! A single task owns the registry, the call state machine, the media
//! controller, the device manager, presence and the roster. Everything that
//! mutates them arrives as a message: UI commands from [`OrchestratorHandle`],
//! inbound signaling envelopes, link events, timer expiries, and the results
//! of device work spawned off the task. Nothing here is shared behind a lock.
//!
//! After each message the task settles: state changes recorded by the
//! registry and the call machine are published as [`OrchestratorEvent`]s and
//! fed back into the roster and the call machine until nothing changes.

use crate::call::{CallAction, CallError, CallStateMachine, RingTimeout, RingTone, TracingRingTone};
use crate::config::{ConfigError, OrchestratorConfig};
use crate::devices::{
    DeviceBackend, DeviceError, DeviceKind, DeviceList, DeviceManager, DeviceSelection,
    SelectOutcome, StaticDeviceBackend,
};
use crate::identity::ParticipantId;
use crate::media::{CaptureHandle, CaptureInfo, LocalTrack, MediaError, MediaTrackController};
use crate::presence::PresenceTracker;
use crate::roster::Roster;
use crate::session::{
    LinkEvent, PeerLinkFactory, PeerSessionRegistry, SessionError, SessionInfo, SessionKey,
    SessionTimeouts, SessionTimer,
};
use crate::signaling::{Envelope, SignalingChannel, SignalingClient, SignalingError, SignalingMessage};
use crate::types::{
    CallId, CallSession, CallState, CloseReason, MediaKind, NegotiationRole, Notice,
    OrchestratorEvent, Participant, SessionState,
};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::AbortHandle;

/// Orchestrator errors
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Call error
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// Media error
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// The orchestrator task has stopped
    #[error("Orchestrator stopped")]
    Stopped,
}

/// Read-only view of the orchestrator state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Local participant
    pub local_id: ParticipantId,
    /// Call in progress
    pub call: Option<CallSession>,
    /// Most recently ended call
    pub last_call: Option<CallSession>,
    /// Joined remote participants
    pub participants: Vec<Participant>,
    /// Open peer sessions
    pub sessions: Vec<SessionInfo>,
    /// Enumerated devices
    pub devices: DeviceList,
    /// Selected devices
    pub selection: DeviceSelection,
    /// Active capture
    pub capture: Option<CaptureInfo>,
    /// Microphone enabled
    pub audio_enabled: bool,
    /// Camera enabled
    pub video_enabled: bool,
    /// Reachable participants
    pub online: Vec<ParticipantId>,
}

impl Snapshot {
    /// Session with `remote`
    #[must_use]
    pub fn session(&self, remote: &ParticipantId) -> Option<&SessionInfo> {
        self.sessions.iter().find(|s| &s.remote == remote)
    }

    /// Call state, `Idle` when no call is in progress
    #[must_use]
    pub fn call_state(&self) -> CallState {
        self.call.as_ref().map_or(CallState::Idle, |c| c.state)
    }
}

type Reply<T> = oneshot::Sender<Result<T, OrchestratorError>>;

enum Command {
    Invite {
        peer: ParticipantId,
        kind: MediaKind,
        reply: Reply<CallId>,
    },
    Accept {
        reply: Reply<()>,
    },
    Decline {
        reply: Reply<()>,
    },
    Cancel {
        reply: Reply<()>,
    },
    HangUp {
        reply: Reply<()>,
    },
    SetEnabled {
        kind: MediaKind,
        enabled: Option<bool>,
        reply: Reply<bool>,
    },
    RaiseHand {
        raised: bool,
        reply: Reply<()>,
    },
    SelectDevice {
        kind: DeviceKind,
        device_id: String,
        reply: Reply<SelectOutcome>,
    },
    DevicesChanged {
        reply: Reply<()>,
    },
    StartCapture {
        audio: bool,
        video: bool,
        reply: Reply<CaptureInfo>,
    },
    EnsureSession {
        peer: ParticipantId,
        role: NegotiationRole,
        reply: Reply<bool>,
    },
    CloseSession {
        peer: ParticipantId,
        reply: Reply<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Snapshot>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Results reported back into the owner task
enum Internal {
    Inbound(Envelope),
    CaptureAcquired {
        handle: CaptureHandle,
        notices: Vec<Notice>,
    },
    TrackOpened {
        kind: DeviceKind,
        result: Result<LocalTrack, DeviceError>,
    },
}

/// Handle used by the UI layer
///
/// Cheap to clone. Every method is a message to the orchestrator task;
/// `Stopped` is returned once the task has exited.
#[derive(Clone)]
pub struct OrchestratorHandle {
    local_id: ParticipantId,
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    /// Local participant
    #[must_use]
    pub fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    /// Subscribe to orchestrator events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)?
    }

    /// Invite `peer` to a 1:1 call
    ///
    /// # Errors
    ///
    /// Returns `PeerUnreachable` if presence does not report the peer online,
    /// or `ChannelUnavailable` if the invite could not be sent
    pub async fn invite(
        &self,
        peer: &ParticipantId,
        kind: MediaKind,
    ) -> Result<CallId, OrchestratorError> {
        let peer = peer.clone();
        self.request(|reply| Command::Invite { peer, kind, reply })
            .await
    }

    /// Accept the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if no incoming call is ringing or the accept could not
    /// be sent
    pub async fn accept(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Accept { reply }).await
    }

    /// Decline the ringing incoming call
    ///
    /// # Errors
    ///
    /// Returns error if no incoming call is ringing or the decline could not
    /// be sent
    pub async fn decline(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Decline { reply }).await
    }

    /// Withdraw the outgoing invite
    ///
    /// # Errors
    ///
    /// Returns error if no outgoing call is ringing
    pub async fn cancel(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    /// End the current call
    ///
    /// # Errors
    ///
    /// Returns `NoActiveCall` if idle
    pub async fn hang_up(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::HangUp { reply }).await
    }

    /// Toggle the microphone; returns the new state
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator has exited
    pub async fn toggle_audio(&self) -> Result<bool, OrchestratorError> {
        self.set_enabled(MediaKind::Audio, None).await
    }

    /// Toggle the camera; returns the new state
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator has exited
    pub async fn toggle_video(&self) -> Result<bool, OrchestratorError> {
        self.set_enabled(MediaKind::Video, None).await
    }

    /// Enable or disable the microphone
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator has exited
    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<bool, OrchestratorError> {
        self.set_enabled(MediaKind::Audio, Some(enabled)).await
    }

    /// Enable or disable the camera
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator has exited
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<bool, OrchestratorError> {
        self.set_enabled(MediaKind::Video, Some(enabled)).await
    }

    async fn set_enabled(
        &self,
        kind: MediaKind,
        enabled: Option<bool>,
    ) -> Result<bool, OrchestratorError> {
        self.request(|reply| Command::SetEnabled {
            kind,
            enabled,
            reply,
        })
        .await
    }

    /// Raise or lower the local hand
    ///
    /// # Errors
    ///
    /// Returns `ChannelUnavailable` if the control message could not be sent
    pub async fn raise_hand(&self, raised: bool) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::RaiseHand { raised, reply })
            .await
    }

    /// Select a device
    ///
    /// With an active capture, an input change swaps the outbound track on
    /// every session in the background; watch for `TrackReplaced`.
    ///
    /// # Errors
    ///
    /// Returns `DeviceNotFound` if the device is not enumerated
    pub async fn select_device(
        &self,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<SelectOutcome, OrchestratorError> {
        let device_id = device_id.to_string();
        self.request(|reply| Command::SelectDevice {
            kind,
            device_id,
            reply,
        })
        .await
    }

    /// Re-enumerate devices after a hot-plug change
    ///
    /// # Errors
    ///
    /// Returns error if enumeration fails
    pub async fn devices_changed(&self) -> Result<(), OrchestratorError> {
        self.request(|reply| Command::DevicesChanged { reply })
            .await
    }

    /// Acquire the selected devices and attach them to every session
    ///
    /// A kind that cannot be opened is skipped with a notice.
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator has exited
    pub async fn start_capture(
        &self,
        audio: bool,
        video: bool,
    ) -> Result<CaptureInfo, OrchestratorError> {
        self.request(|reply| Command::StartCapture {
            audio,
            video,
            reply,
        })
        .await
    }

    /// Create a session with `peer` if absent; initiators send the offer
    ///
    /// # Errors
    ///
    /// Returns error if the session cannot be created or negotiated
    pub async fn ensure_session(
        &self,
        peer: &ParticipantId,
        role: NegotiationRole,
    ) -> Result<bool, OrchestratorError> {
        let peer = peer.clone();
        self.request(|reply| Command::EnsureSession { peer, role, reply })
            .await
    }

    /// Close the session with `peer`
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator has exited
    pub async fn close_session(&self, peer: &ParticipantId) -> Result<bool, OrchestratorError> {
        let peer = peer.clone();
        self.request(|reply| Command::CloseSession { peer, reply })
            .await
    }

    /// Current state
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator has exited
    pub async fn snapshot(&self) -> Result<Snapshot, OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply: tx })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }

    /// Close every session, release the capture and stop the task
    ///
    /// # Errors
    ///
    /// Returns `Stopped` if the orchestrator already exited
    pub async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { reply: tx })
            .await
            .map_err(|_| OrchestratorError::Stopped)?;
        rx.await.map_err(|_| OrchestratorError::Stopped)
    }
}

/// Orchestrator builder
pub struct OrchestratorBuilder {
    local_id: ParticipantId,
    channel: Arc<dyn SignalingChannel>,
    links: Arc<dyn PeerLinkFactory>,
    config: OrchestratorConfig,
    devices: Arc<dyn DeviceBackend>,
    ring_tone: Arc<dyn RingTone>,
}

impl OrchestratorBuilder {
    /// Create a builder with default config, devices and ring tone
    #[must_use]
    pub fn new(
        local_id: ParticipantId,
        channel: Arc<dyn SignalingChannel>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> Self {
        Self {
            local_id,
            channel,
            links,
            config: OrchestratorConfig::default(),
            devices: Arc::new(StaticDeviceBackend::with_defaults()),
            ring_tone: Arc::new(TracingRingTone),
        }
    }

    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the host device backend
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn DeviceBackend>) -> Self {
        self.devices = devices;
        self
    }

    /// Set the ring tone resource
    #[must_use]
    pub fn with_ring_tone(mut self, ring_tone: Arc<dyn RingTone>) -> Self {
        self.ring_tone = ring_tone;
        self
    }

    /// Validate, enumerate devices and spawn the orchestrator task
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or device enumeration fails
    pub async fn build(self) -> Result<OrchestratorHandle, OrchestratorError> {
        self.config.validate()?;

        let (command_tx, command_rx) = mpsc::channel(self.config.command_capacity);
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (ring_tx, ring_rx) = mpsc::unbounded_channel();

        let signaling = Arc::new(SignalingClient::new(self.local_id.clone(), self.channel));
        let inbound = internal_tx.clone();
        signaling.on_message(move |envelope| {
            let _ = inbound.send(Internal::Inbound(envelope));
        })?;
        let pump = {
            let signaling = signaling.clone();
            tokio::spawn(async move { signaling.run().await }).abort_handle()
        };

        let mut devices = DeviceManager::new(self.devices);
        for notice in devices.refresh().await? {
            tracing::warn!(?notice, "Device notice at start-up");
        }

        let registry = PeerSessionRegistry::new(
            signaling.clone(),
            self.links,
            link_tx,
            timer_tx,
            SessionTimeouts {
                negotiation: self.config.negotiation_timeout(),
                failure_grace: self.config.failure_grace(),
            },
        );
        let call = CallStateMachine::new(
            self.local_id.clone(),
            self.config.ring_timeout(),
            self.ring_tone,
            ring_tx,
        );

        let orchestrator = Orchestrator {
            local_id: self.local_id.clone(),
            signaling,
            registry,
            call,
            media: MediaTrackController::new(),
            devices,
            presence: PresenceTracker::new(),
            roster: Roster::new(),
            events: events.clone(),
            internal_tx,
            pending_capture: Vec::new(),
            capture_in_flight: false,
            queued_capture: None,
            pump,
        };

        tracing::info!(local = %self.local_id, "Orchestrator started");
        tokio::spawn(orchestrator.run(Channels {
            commands: command_rx,
            internal: internal_rx,
            links: link_rx,
            timers: timer_rx,
            rings: ring_rx,
        }));

        Ok(OrchestratorHandle {
            local_id: self.local_id,
            commands: command_tx,
            events,
        })
    }
}

struct Channels {
    commands: mpsc::Receiver<Command>,
    internal: mpsc::UnboundedReceiver<Internal>,
    links: mpsc::UnboundedReceiver<LinkEvent>,
    timers: mpsc::UnboundedReceiver<SessionTimer>,
    rings: mpsc::UnboundedReceiver<RingTimeout>,
}

/// The single owner of all session and call state
pub struct Orchestrator {
    local_id: ParticipantId,
    signaling: Arc<SignalingClient>,
    registry: PeerSessionRegistry,
    call: CallStateMachine,
    media: MediaTrackController,
    devices: DeviceManager,
    presence: PresenceTracker,
    roster: Roster,
    events: broadcast::Sender<OrchestratorEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    pending_capture: Vec<Reply<CaptureInfo>>,
    capture_in_flight: bool,
    queued_capture: Option<(bool, bool)>,
    pump: AbortHandle,
}

impl Orchestrator {
    /// Start building an orchestrator
    #[must_use]
    pub fn builder(
        local_id: ParticipantId,
        channel: Arc<dyn SignalingChannel>,
        links: Arc<dyn PeerLinkFactory>,
    ) -> OrchestratorBuilder {
        OrchestratorBuilder::new(local_id, channel, links)
    }

    async fn run(mut self, mut channels: Channels) {
        loop {
            tokio::select! {
                command = channels.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(internal) = channels.internal.recv() => self.handle_internal(internal).await,
                Some(event) = channels.links.recv() => self.registry.on_link_event(event).await,
                Some(timer) = channels.timers.recv() => self.registry.on_timer(timer).await,
                Some(timeout) = channels.rings.recv() => {
                    let actions = self.call.on_ring_timeout(timeout);
                    let _ = self.execute(actions).await;
                }
            }
            self.settle().await;
        }
        tracing::info!(local = %self.local_id, "Orchestrator stopped");
    }

    fn emit(&self, event: OrchestratorEvent) {
        tracing::trace!(?event, "Orchestrator event");
        let _ = self.events.send(event);
    }

    fn notice(&self, notice: Notice) {
        tracing::warn!(?notice, "Notice");
        self.emit(OrchestratorEvent::Notice(notice));
    }

    // ========================================================================
    // Settling
    // ========================================================================

    async fn settle(&mut self) {
        loop {
            self.sync_call_with_session();
            let sessions = self.registry.take_transitions();
            let calls = self.call.take_transitions();
            if sessions.is_empty() && calls.is_empty() {
                return;
            }

            for transition in sessions {
                self.emit(OrchestratorEvent::SessionStateChanged {
                    remote: transition.remote.clone(),
                    state: transition.state,
                });
                if let Some(participant) = self
                    .roster
                    .set_connection(&transition.remote, transition.state)
                    .cloned()
                {
                    self.emit(OrchestratorEvent::ParticipantUpdated { participant });
                }
                if transition.state == SessionState::Failed
                    && self.roster.apply_left(&transition.remote).is_some()
                {
                    self.emit(OrchestratorEvent::ParticipantLeft {
                        id: transition.remote.clone(),
                    });
                }
                let actions =
                    self.call
                        .on_session_state(&transition.remote, transition.state, transition.reason);
                let _ = self.execute(actions).await;
            }

            for transition in calls {
                self.emit(OrchestratorEvent::CallStateChanged {
                    call_id: transition.call_id,
                    peer_id: transition.peer_id,
                    state: transition.state,
                    reason: transition.reason,
                });
            }
        }
    }

    /// A call that reaches `connecting` over an already connected session
    /// connects immediately.
    fn sync_call_with_session(&mut self) {
        let Some(call) = self.call.current() else {
            return;
        };
        if call.state != CallState::Connecting {
            return;
        }
        let peer = call.peer_id.clone();
        if self.registry.state(&peer) == Some(SessionState::Connected) {
            let _ = self
                .call
                .on_session_state(&peer, SessionState::Connected, None);
        }
    }

    /// Perform call actions in order
    ///
    /// A failed send ends a call still in progress, and the rest of its batch
    /// is replaced by the teardown actions. A batch whose call has already
    /// ended keeps its teardown. The first error is returned.
    async fn execute(&mut self, actions: Vec<CallAction>) -> Result<(), OrchestratorError> {
        let mut queue: VecDeque<CallAction> = actions.into();
        let mut first_error = None;

        while let Some(action) = queue.pop_front() {
            match action {
                CallAction::Send { to, message } => {
                    let message_type = message.message_type();
                    if let Err(e) = self.signaling.send_to(&to, message).await {
                        self.notice(Notice::ControlMessageDropped {
                            message_type: message_type.to_string(),
                            reason: e.to_string(),
                        });
                        if self.call.current().is_some() {
                            queue = self.call.on_send_failed().into();
                        }
                        first_error.get_or_insert(OrchestratorError::from(e));
                    }
                }
                CallAction::EnsureSession { peer, role } => {
                    if let Err(e) = self
                        .registry
                        .ensure_session(&peer, role, &self.media)
                        .await
                    {
                        tracing::warn!(peer = %peer, error = %e, "Failed to create call session");
                        first_error.get_or_insert(e.into());
                    }
                }
                CallAction::StartNegotiation { peer } => {
                    if let Err(e) = self.registry.start_negotiation(&peer).await {
                        tracing::warn!(peer = %peer, error = %e, "Failed to start call negotiation");
                        first_error.get_or_insert(e.into());
                    }
                }
                CallAction::CloseSession { peer, reason } => {
                    if reason == CloseReason::CallEnded && self.roster.contains(&peer) {
                        tracing::debug!(peer = %peer, "Call session now serves the room, kept open");
                        continue;
                    }
                    self.registry.close_session(&peer, reason).await;
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Invite { peer, kind, reply } => {
                let result = self.invite(&peer, kind).await;
                let _ = reply.send(result);
            }
            Command::Accept { reply } => {
                let exists = self.call_session_exists();
                let result = match self.call.accept(exists) {
                    Ok(actions) => self.execute(actions).await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Command::Decline { reply } => {
                let result = match self.call.decline() {
                    Ok(actions) => self.execute(actions).await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Command::Cancel { reply } => {
                let result = match self.call.cancel() {
                    Ok(actions) => self.execute(actions).await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Command::HangUp { reply } => {
                let result = match self.call.hang_up() {
                    Ok(actions) => self.execute(actions).await,
                    Err(e) => Err(e.into()),
                };
                let _ = reply.send(result);
            }
            Command::SetEnabled {
                kind,
                enabled,
                reply,
            } => {
                let enabled = self.set_enabled(kind, enabled).await;
                let _ = reply.send(Ok(enabled));
            }
            Command::RaiseHand { raised, reply } => {
                let result = self
                    .signaling
                    .broadcast(SignalingMessage::HandRaise {
                        from_id: self.local_id.clone(),
                        raised,
                    })
                    .await
                    .map_err(OrchestratorError::from);
                let _ = reply.send(result);
            }
            Command::SelectDevice {
                kind,
                device_id,
                reply,
            } => {
                let result = self.select_device(kind, &device_id);
                let _ = reply.send(result);
            }
            Command::DevicesChanged { reply } => {
                let result = self.devices_changed().await;
                let _ = reply.send(result);
            }
            Command::StartCapture {
                audio,
                video,
                reply,
            } => {
                self.pending_capture.push(reply);
                if self.capture_in_flight {
                    tracing::debug!(audio, video, "Capture in flight, request queued");
                    self.queued_capture = Some((audio, video));
                } else {
                    self.acquire_capture(audio, video);
                }
            }
            Command::EnsureSession { peer, role, reply } => {
                let result = self.ensure_session(&peer, role).await;
                let _ = reply.send(result);
            }
            Command::CloseSession { peer, reply } => {
                let closed = self
                    .registry
                    .close_session(&peer, CloseReason::Requested)
                    .await;
                let _ = reply.send(Ok(closed));
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    /// Overlapping requests coalesce: the latest one is acquired once the
    /// one in flight returns, and every waiter gets the capture that ends up
    /// active.
    fn acquire_capture(&mut self, audio: bool, video: bool) {
        self.capture_in_flight = true;
        let backend = self.devices.backend();
        let selection = self.devices.selection().clone();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let (handle, notices) = DeviceManager::acquire(backend, selection, audio, video).await;
            let _ = internal.send(Internal::CaptureAcquired { handle, notices });
        });
    }

    fn call_session_exists(&self) -> bool {
        self.call
            .current()
            .is_some_and(|c| self.registry.contains(&c.peer_id))
    }

    #[tracing::instrument(skip(self), fields(local = %self.local_id))]
    async fn invite(
        &mut self,
        peer: &ParticipantId,
        kind: MediaKind,
    ) -> Result<CallId, OrchestratorError> {
        let actions = self.call.invite(peer, kind, &self.presence)?;
        let call_id = self
            .call
            .current()
            .map(|c| c.call_id)
            .ok_or(CallError::NoActiveCall)?;
        self.execute(actions).await?;
        Ok(call_id)
    }

    async fn set_enabled(&mut self, kind: MediaKind, enabled: Option<bool>) -> bool {
        let current = match kind {
            MediaKind::Audio => self.media.audio_enabled(),
            MediaKind::Video => self.media.video_enabled(),
        };
        let target = enabled.unwrap_or(!current);
        let changed = match kind {
            MediaKind::Audio => self.media.set_audio_enabled(target),
            MediaKind::Video => self.media.set_video_enabled(target),
        };
        if changed {
            let message = SignalingMessage::MediaState {
                from_id: self.local_id.clone(),
                audio_enabled: self.media.audio_enabled(),
                video_enabled: self.media.video_enabled(),
            };
            if let Err(e) = self.signaling.broadcast(message).await {
                self.notice(Notice::ControlMessageDropped {
                    message_type: "MediaState".to_string(),
                    reason: e.to_string(),
                });
            }
        }
        target
    }

    fn select_device(
        &mut self,
        kind: DeviceKind,
        device_id: &str,
    ) -> Result<SelectOutcome, OrchestratorError> {
        let capturing_kind = kind
            .capture_kind()
            .and_then(|k| self.media.capture().and_then(|c| c.track(k)))
            .is_some();
        let outcome = self.devices.select(kind, device_id, capturing_kind)?;
        if let SelectOutcome::ReplaceTrack { kind, device_id } = &outcome {
            self.open_track(*kind, device_id.clone());
        }
        Ok(outcome)
    }

    fn open_track(&self, kind: DeviceKind, device_id: String) {
        let backend = self.devices.backend();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = backend.open(kind, &device_id).await;
            let _ = internal.send(Internal::TrackOpened { kind, result });
        });
    }

    async fn devices_changed(&mut self) -> Result<(), OrchestratorError> {
        let notices = self.devices.refresh().await?;
        self.emit(OrchestratorEvent::DevicesChanged);

        for notice in notices {
            if let Notice::DeviceFallback {
                kind,
                fallback: Some(fallback),
                ..
            } = &notice
            {
                let in_use = kind
                    .capture_kind()
                    .and_then(|k| self.media.capture().and_then(|c| c.track(k)))
                    .is_some();
                if in_use {
                    self.open_track(*kind, fallback.clone());
                }
            }
            self.notice(notice);
        }
        Ok(())
    }

    async fn ensure_session(
        &mut self,
        peer: &ParticipantId,
        role: NegotiationRole,
    ) -> Result<bool, OrchestratorError> {
        let created = self
            .registry
            .ensure_session(peer, role, &self.media)
            .await?;
        if created && role == NegotiationRole::Initiator {
            self.registry.start_negotiation(peer).await?;
        }
        Ok(created)
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            local_id: self.local_id.clone(),
            call: self.call.current().cloned(),
            last_call: self.call.last_ended().cloned(),
            participants: self.roster.participants(),
            sessions: self.registry.snapshot(),
            devices: self.devices.list_devices(),
            selection: self.devices.selection().clone(),
            capture: self.media.capture().map(CaptureHandle::info),
            audio_enabled: self.media.audio_enabled(),
            video_enabled: self.media.video_enabled(),
            online: self.presence.online(),
        }
    }

    async fn shutdown(&mut self) {
        if self.call.current().is_some() {
            if let Ok(actions) = self.call.hang_up() {
                let _ = self.execute(actions).await;
            }
        }
        self.registry.close_all(CloseReason::Shutdown).await;
        if self.media.release().is_some() {
            self.emit(OrchestratorEvent::CaptureChanged { handle_id: None });
        }
        for reply in self.pending_capture.drain(..) {
            let _ = reply.send(Err(OrchestratorError::Stopped));
        }
        self.pump.abort();
        self.settle().await;
    }

    // ========================================================================
    // Internal messages
    // ========================================================================

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Inbound(envelope) => self.handle_inbound(envelope).await,
            Internal::CaptureAcquired { handle, notices } => {
                self.capture_in_flight = false;
                if let Some((audio, video)) = self.queued_capture.take() {
                    tracing::debug!(handle_id = %handle.id(), "Capture superseded, reacquiring");
                    handle.stop();
                    self.acquire_capture(audio, video);
                    return;
                }
                for notice in notices {
                    self.notice(notice);
                }
                let info = handle.info();
                let report = self
                    .media
                    .set_local_capture(handle, &self.registry.links())
                    .await;
                self.recreate(report.needs_recreate).await;
                self.emit(OrchestratorEvent::CaptureChanged {
                    handle_id: Some(info.id.clone()),
                });
                for reply in self.pending_capture.drain(..) {
                    let _ = reply.send(Ok(info.clone()));
                }
            }
            Internal::TrackOpened { kind, result } => match result {
                Ok(track) => self.replace_track(track).await,
                Err(e) => self.notice(Notice::DeviceUnavailable {
                    kind,
                    reason: e.to_string(),
                }),
            },
        }
    }

    async fn replace_track(&mut self, track: LocalTrack) {
        let kind = track.kind();
        let links = self.registry.links();
        let result = match kind {
            MediaKind::Audio => self.media.replace_audio_track(track, &links).await,
            MediaKind::Video => self.media.replace_video_track(track, &links).await,
        };
        let report = match result {
            Ok(report) => report,
            Err(e) => {
                tracing::warn!(?kind, error = %e, "Opened track discarded");
                return;
            }
        };
        let recreated = report.needs_recreate.len();
        self.recreate(report.needs_recreate).await;
        self.emit(OrchestratorEvent::TrackReplaced {
            kind,
            track_id: report.track_id.unwrap_or_default(),
            in_place: report.in_place,
            recreated,
        });
    }

    async fn recreate(&mut self, keys: Vec<SessionKey>) {
        for key in keys {
            if let Err(e) = self
                .registry
                .recreate_session(&key.remote, &self.media)
                .await
            {
                tracing::warn!(remote = %key.remote, error = %e, "Session recreation failed");
            }
        }
    }

    fn knows(&self, id: &ParticipantId) -> bool {
        self.roster.contains(id)
            || self.registry.contains(id)
            || self.call.current().is_some_and(|c| &c.peer_id == id)
    }

    #[tracing::instrument(skip(self, envelope), fields(local = %self.local_id, from = %envelope.from, message_type = envelope.message.message_type()))]
    async fn handle_inbound(&mut self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.message {
            SignalingMessage::SessionOffer { sdp, .. } => {
                if let Err(e) = self
                    .registry
                    .apply_remote_offer(&from, &sdp, &self.media)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to apply remote offer");
                }
            }
            SignalingMessage::SessionAnswer { sdp, .. } => {
                if let Err(e) = self.registry.apply_remote_answer(&from, &sdp).await {
                    tracing::warn!(error = %e, "Failed to apply remote answer");
                }
            }
            SignalingMessage::ConnectivityCandidate { candidate, .. } => {
                if !self.knows(&from) {
                    tracing::debug!("Candidate from unknown participant dropped");
                    return;
                }
                if let Err(e) = self
                    .registry
                    .apply_remote_candidate(&from, &candidate, &self.media)
                    .await
                {
                    tracing::warn!(error = %e, "Failed to apply remote candidate");
                }
            }
            SignalingMessage::MemberJoined { participant } => {
                self.on_member_joined(participant).await;
            }
            SignalingMessage::MemberLeft { connection_id } => {
                if self.roster.apply_left(&connection_id).is_some() {
                    self.emit(OrchestratorEvent::ParticipantLeft {
                        id: connection_id.clone(),
                    });
                }
                self.registry
                    .close_session(&connection_id, CloseReason::MemberLeft)
                    .await;
            }
            SignalingMessage::CallInvite { media_kind, .. } => {
                let exists = self.registry.contains(&from);
                let actions = self.call.on_invite(&from, media_kind, exists);
                let _ = self.execute(actions).await;
            }
            SignalingMessage::CallAccept { .. } => {
                let exists = self.registry.contains(&from);
                let actions = self.call.on_accept(&from, exists);
                let _ = self.execute(actions).await;
            }
            SignalingMessage::CallDecline { reason, .. } => {
                let actions = self.call.on_decline(&from, reason);
                let _ = self.execute(actions).await;
            }
            SignalingMessage::CallCancel { .. } => {
                let actions = self.call.on_cancel(&from);
                let _ = self.execute(actions).await;
            }
            SignalingMessage::CallHangup { .. } => {
                let actions = self.call.on_hangup(&from);
                let _ = self.execute(actions).await;
            }
            SignalingMessage::Presence {
                participant_id,
                is_online,
            } => {
                if self.presence.apply(&participant_id, is_online) {
                    self.emit(OrchestratorEvent::PresenceChanged {
                        id: participant_id,
                        online: is_online,
                    });
                }
            }
            SignalingMessage::MediaState {
                audio_enabled,
                video_enabled,
                ..
            } => {
                if let Some(participant) = self
                    .roster
                    .set_media_state(&from, audio_enabled, video_enabled)
                    .cloned()
                {
                    self.emit(OrchestratorEvent::ParticipantUpdated { participant });
                }
            }
            SignalingMessage::HandRaise { raised, .. } => {
                if let Some(participant) = self.roster.set_hand(&from, raised).cloned() {
                    self.emit(OrchestratorEvent::ParticipantUpdated { participant });
                }
            }
        }
    }

    /// The smaller id creates the session as initiator and offers; the other
    /// side creates it as responder and waits.
    async fn on_member_joined(&mut self, participant: Participant) {
        let id = participant.id.clone();
        if id == self.local_id {
            return;
        }
        if self.roster.apply_joined(participant) {
            if let Some(participant) = self.roster.get(&id).cloned() {
                self.emit(OrchestratorEvent::ParticipantJoined { participant });
            }
        }

        let role = if self.local_id.initiates_against(&id) {
            NegotiationRole::Initiator
        } else {
            NegotiationRole::Responder
        };
        if let Err(e) = self.ensure_session(&id, role).await {
            tracing::warn!(participant = %id, error = %e, "Failed to establish room session");
        }
    }
}
